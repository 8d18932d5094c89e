//! Idempotent replication configuration of one node.
//!
//! Every operation reads the current object, merges the requested peers
//! into it and writes only when the merged result differs. Running the same
//! configuration twice therefore converges without extra commits.

use tracing::{debug, info};

use crate::admin_client::{DomainConfig, ReplicationAdminClient, ReplicationServerConfig};
use crate::directory::DirectoryError;
use crate::dn::Dn;
use crate::error::{ReplError, Result};
use crate::ids::IdAllocator;
use crate::peers::PeerSet;

/// What a configuration call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChange {
    /// The object was created.
    Created,
    /// The peer list was extended.
    Updated,
    /// Nothing was written.
    Unchanged,
}

/// Id of the configured object and what happened to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigOutcome {
    /// Replication server id or domain id.
    pub id: u32,
    /// Write performed.
    pub change: ConfigChange,
}

/// Result of removing a replication server address from one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceCleanup {
    /// Domains whose peer list shrank.
    pub updated_domains: Vec<Dn>,
    /// Domains deleted because no peer was left.
    pub deleted_domains: Vec<Dn>,
    /// The node's own replication server peer list shrank.
    pub updated_replication_server: bool,
}

impl ReferenceCleanup {
    /// True if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.updated_domains.is_empty()
            && self.deleted_domains.is_empty()
            && !self.updated_replication_server
    }
}

/// Applies replication configuration through a `ReplicationAdminClient`.
pub struct ReplicationConfigurator<'a> {
    client: &'a ReplicationAdminClient,
}

impl<'a> ReplicationConfigurator<'a> {
    /// Configure the node behind `client`.
    pub fn new(client: &'a ReplicationAdminClient) -> Self {
        Self { client }
    }

    fn server_error(&self, source: DirectoryError) -> ReplError {
        ReplError::ConfiguringReplicationServer {
            address: self.client.address().to_string(),
            source,
        }
    }

    fn domain_error(&self, base_dn: &Dn, source: DirectoryError) -> ReplError {
        ReplError::EnablingReplicationOnBaseDn {
            address: self.client.address().to_string(),
            base_dn: base_dn.to_string(),
            source,
        }
    }

    /// Make the node a replication server listening on `port` and talking
    /// to `peers`. An existing replication server keeps its id and port and
    /// only gains peers.
    pub async fn configure_as_replication_server(
        &self,
        port: u16,
        secure: bool,
        peers: &PeerSet,
        ids: &mut IdAllocator,
    ) -> Result<ConfigOutcome> {
        let existing = self
            .client
            .read_replication_server()
            .await
            .map_err(|e| self.server_error(e))?;

        let outcome = match existing {
            None => {
                let server_id = ids.allocate_server_id()?;
                self.client
                    .enable_sync_provider()
                    .await
                    .map_err(|e| self.server_error(e))?;
                let config = ReplicationServerConfig {
                    port,
                    server_id,
                    peers: peers.clone(),
                };
                self.client
                    .create_replication_server(&config)
                    .await
                    .map_err(|e| self.server_error(e))?;
                info!(
                    address = %self.client.address(),
                    port,
                    server_id,
                    peers = peers.len(),
                    "replication server created"
                );
                ConfigOutcome {
                    id: server_id,
                    change: ConfigChange::Created,
                }
            }
            Some(current) => {
                ids.reserve_server_id(current.server_id);
                let merged = current.peers.merge(peers);
                if merged == current.peers {
                    debug!(address = %self.client.address(), "replication server already up to date");
                    ConfigOutcome {
                        id: current.server_id,
                        change: ConfigChange::Unchanged,
                    }
                } else {
                    self.client
                        .set_replication_server_peers(&merged)
                        .await
                        .map_err(|e| self.server_error(e))?;
                    info!(
                        address = %self.client.address(),
                        server_id = current.server_id,
                        peers = merged.len(),
                        "replication server peers merged"
                    );
                    ConfigOutcome {
                        id: current.server_id,
                        change: ConfigChange::Updated,
                    }
                }
            }
        };

        if secure {
            let enabled = self
                .client
                .ssl_encryption()
                .await
                .map_err(|e| self.server_error(e))?;
            if !enabled {
                self.client
                    .set_ssl_encryption(true)
                    .await
                    .map_err(|e| self.server_error(e))?;
                info!(address = %self.client.address(), "replication encryption enabled");
            }
        }
        Ok(outcome)
    }

    /// Bind the replica of `base_dn` to `peers`. An existing domain keeps
    /// its id and only gains peers.
    pub async fn configure_domain(
        &self,
        base_dn: &Dn,
        peers: &PeerSet,
        ids: &mut IdAllocator,
    ) -> Result<ConfigOutcome> {
        let existing = self
            .client
            .find_domain(base_dn)
            .await
            .map_err(|e| self.domain_error(base_dn, e))?;

        match existing {
            None => {
                let domain_id = ids.allocate_domain_id(base_dn)?;
                self.client
                    .create_domain(base_dn, domain_id, peers)
                    .await
                    .map_err(|e| self.domain_error(base_dn, e))?;
                info!(
                    address = %self.client.address(),
                    base_dn = %base_dn,
                    domain_id,
                    peers = peers.len(),
                    "replication domain created"
                );
                Ok(ConfigOutcome {
                    id: domain_id,
                    change: ConfigChange::Created,
                })
            }
            Some(domain) => {
                ids.reserve_domain_id(base_dn, domain.server_id);
                let merged = domain.peers.merge(peers);
                if merged == domain.peers {
                    debug!(address = %self.client.address(), base_dn = %base_dn, "replication domain already up to date");
                    return Ok(ConfigOutcome {
                        id: domain.server_id,
                        change: ConfigChange::Unchanged,
                    });
                }
                self.client
                    .set_domain_peers(&domain, &merged)
                    .await
                    .map_err(|e| self.domain_error(base_dn, e))?;
                info!(
                    address = %self.client.address(),
                    base_dn = %base_dn,
                    domain_id = domain.server_id,
                    peers = merged.len(),
                    "replication domain peers merged"
                );
                Ok(ConfigOutcome {
                    id: domain.server_id,
                    change: ConfigChange::Updated,
                })
            }
        }
    }

    /// Delete the domain of `base_dn`. Returns the removed configuration.
    pub async fn remove_domain(&self, base_dn: &Dn) -> Result<Option<DomainConfig>> {
        let disabling = |source: DirectoryError| ReplError::DisablingReplicationOnBaseDn {
            address: self.client.address().to_string(),
            base_dn: base_dn.to_string(),
            source,
        };
        let Some(domain) = self.client.find_domain(base_dn).await.map_err(disabling)? else {
            debug!(address = %self.client.address(), base_dn = %base_dn, "no replication domain to remove");
            return Ok(None);
        };
        self.client.delete_domain(&domain).await.map_err(disabling)?;
        info!(address = %self.client.address(), base_dn = %base_dn, "replication domain removed");
        Ok(Some(domain))
    }

    /// Delete the replication server object. Returns false if there was none.
    pub async fn remove_replication_server(&self) -> Result<bool> {
        let existing = self
            .client
            .read_replication_server()
            .await
            .map_err(|e| self.server_error(e))?;
        if existing.is_none() {
            return Ok(false);
        }
        self.client
            .delete_replication_server()
            .await
            .map_err(|e| self.server_error(e))?;
        info!(address = %self.client.address(), "replication server removed");
        Ok(true)
    }

    /// Drop `removed` from the peer lists of this node. Only domains in
    /// `base_dns` are touched, or every domain when `None`. Domains left
    /// without peers are deleted. With `include_replication_server` the
    /// node's replication server forgets `removed` too.
    pub async fn remove_peer_references(
        &self,
        removed: &str,
        base_dns: Option<&[Dn]>,
        include_replication_server: bool,
    ) -> Result<ReferenceCleanup> {
        let removing = |source: DirectoryError| ReplError::RemovingReferences {
            address: self.client.address().to_string(),
            removed: removed.to_string(),
            source,
        };
        let mut cleanup = ReferenceCleanup::default();

        let domains = self.client.read_domains().await.map_err(removing)?;
        for domain in domains {
            if let Some(filter) = base_dns {
                if !filter.contains(&domain.base_dn) {
                    continue;
                }
            }
            if !domain.peers.contains(removed) {
                continue;
            }
            let remaining = domain.peers.without(removed);
            if remaining.is_empty() {
                self.client.delete_domain(&domain).await.map_err(removing)?;
                info!(address = %self.client.address(), base_dn = %domain.base_dn, "replication domain deleted, no peer left");
                cleanup.deleted_domains.push(domain.base_dn);
            } else {
                self.client
                    .set_domain_peers(&domain, &remaining)
                    .await
                    .map_err(removing)?;
                debug!(address = %self.client.address(), base_dn = %domain.base_dn, removed, "peer removed from domain");
                cleanup.updated_domains.push(domain.base_dn);
            }
        }

        if include_replication_server {
            if let Some(rs) = self.client.read_replication_server().await.map_err(removing)? {
                if rs.peers.contains(removed) {
                    self.client
                        .set_replication_server_peers(&rs.peers.without(removed))
                        .await
                        .map_err(removing)?;
                    debug!(address = %self.client.address(), removed, "peer removed from replication server");
                    cleanup.updated_replication_server = true;
                }
            }
        }
        Ok(cleanup)
    }
}
