//! Typed access to a server's replication configuration.
//!
//! `ReplicationAdminClient` is the only place that knows where the
//! synchronization provider, replication server, domains, crypto manager,
//! backends and monitor entries live. Orchestration code works with the
//! typed structs below and never builds configuration DNs itself.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::directory::{DirectoryConnection, DirectoryError, Entry, Filter, Modification, SearchScope};
use crate::dn::{escape_value, Dn};
use crate::peers::PeerSet;

/// DNs and attribute names of the server configuration.
pub mod layout {
    /// Configuration root.
    pub const CONFIG: &str = "cn=config";
    /// Backend configuration container.
    pub const BACKENDS: &str = "cn=Backends,cn=config";
    /// Synchronization provider container.
    pub const SYNC_PROVIDERS: &str = "cn=Synchronization Providers,cn=config";
    /// The multimaster synchronization provider.
    pub const SYNC_PROVIDER: &str =
        "cn=Multimaster Synchronization,cn=Synchronization Providers,cn=config";
    /// Replication server object.
    pub const REPLICATION_SERVER: &str =
        "cn=Replication Server,cn=Multimaster Synchronization,cn=Synchronization Providers,cn=config";
    /// Replication domain container.
    pub const DOMAINS: &str =
        "cn=domains,cn=Multimaster Synchronization,cn=Synchronization Providers,cn=config";
    /// Server-wide crypto settings.
    pub const CRYPTO_MANAGER: &str = "cn=Crypto Manager,cn=config";
    /// Monitor root; carries the server clock.
    pub const MONITOR: &str = "cn=monitor";
    /// Schema entry.
    pub const SCHEMA: &str = "cn=schema";
    /// This server's instance key.
    pub const ADS_CERTIFICATE: &str = "cn=ads-certificate,cn=config";
    /// Trust store seeded from the administration data.
    pub const TRUSTSTORE: &str = "cn=ads-truststore";

    /// `ds-cfg-enabled`
    pub const ATTR_ENABLED: &str = "ds-cfg-enabled";
    /// `ds-cfg-replication-port`
    pub const ATTR_REPLICATION_PORT: &str = "ds-cfg-replication-port";
    /// `ds-cfg-replication-server-id`
    pub const ATTR_REPLICATION_SERVER_ID: &str = "ds-cfg-replication-server-id";
    /// `ds-cfg-replication-server` (peer list)
    pub const ATTR_REPLICATION_SERVER: &str = "ds-cfg-replication-server";
    /// `ds-cfg-base-dn`
    pub const ATTR_BASE_DN: &str = "ds-cfg-base-dn";
    /// `ds-cfg-server-id` (domain id)
    pub const ATTR_SERVER_ID: &str = "ds-cfg-server-id";
    /// `ds-cfg-ssl-encryption`
    pub const ATTR_SSL_ENCRYPTION: &str = "ds-cfg-ssl-encryption";
    /// `ds-cfg-backend-id`
    pub const ATTR_BACKEND_ID: &str = "ds-cfg-backend-id";
    /// `ds-backend-entry-count`
    pub const ATTR_BACKEND_ENTRY_COUNT: &str = "ds-backend-entry-count";
    /// `ds-sync-generation-id`
    pub const ATTR_SYNC_GENERATION_ID: &str = "ds-sync-generation-id";
    /// `currentTime`
    pub const ATTR_CURRENT_TIME: &str = "currenttime";
    /// `ds-cfg-key-id`
    pub const ATTR_KEY_ID: &str = "ds-cfg-key-id";
    /// `ds-cfg-public-key-certificate`
    pub const ATTR_PUBLIC_KEY_CERTIFICATE: &str = "ds-cfg-public-key-certificate";
    /// `domain-name` on replica monitor entries
    pub const ATTR_MONITOR_DOMAIN: &str = "domain-name";
    /// `server-id` on replica monitor entries
    pub const ATTR_MONITOR_SERVER_ID: &str = "server-id";
    /// `missing-changes` on replica monitor entries
    pub const ATTR_MISSING_CHANGES: &str = "missing-changes";
    /// `approx-older-change-not-synchronized-millis`
    pub const ATTR_OLDEST_MISSING_AGE: &str = "approx-older-change-not-synchronized-millis";

    /// `ds-task-state`
    pub const ATTR_TASK_STATE: &str = "ds-task-state";
    /// `ds-task-processed-entry-count`
    pub const ATTR_TASK_PROCESSED: &str = "ds-task-processed-entry-count";
    /// `ds-task-unprocessed-entry-count`
    pub const ATTR_TASK_UNPROCESSED: &str = "ds-task-unprocessed-entry-count";
    /// `ds-task-log-message`
    pub const ATTR_TASK_LOG: &str = "ds-task-log-message";

    /// LDAP generalized time as written by the server.
    pub const GENERALIZED_TIME_FORMAT: &str = "%Y%m%d%H%M%SZ";
}

/// A replication server object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationServerConfig {
    /// Replication listener port.
    pub port: u16,
    /// Replication server id.
    pub server_id: u32,
    /// Other replication servers this one connects to.
    pub peers: PeerSet,
}

/// A replication domain object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainConfig {
    /// DN of the configuration entry.
    pub entry_dn: Dn,
    /// Replicated suffix.
    pub base_dn: Dn,
    /// Domain (replica) id.
    pub server_id: u32,
    /// Replication servers the replica talks to.
    pub peers: PeerSet,
}

/// A backend and the suffixes it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInfo {
    /// Backend id.
    pub backend_id: String,
    /// Base DNs served.
    pub base_dns: Vec<Dn>,
    /// Entry count from the backend monitor.
    pub entry_count: Option<u64>,
}

/// Replication state of one replica as monitored by its server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaMonitor {
    /// Replicated suffix.
    pub base_dn: Dn,
    /// Domain id of the replica.
    pub server_id: Option<u32>,
    /// Changes not yet applied.
    pub missing_changes: Option<u64>,
    /// Age of the oldest missing change.
    pub oldest_missing_change_ms: Option<u64>,
}

/// A certificate with its key id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrustedCertificate {
    /// Key id.
    pub key_id: String,
    /// Encoded certificate.
    pub certificate: String,
}

/// Replication administration over one connection.
#[derive(Clone)]
pub struct ReplicationAdminClient {
    conn: Arc<dyn DirectoryConnection>,
    address: String,
}

impl ReplicationAdminClient {
    /// Wrap an open connection. `address` is used in diagnostics.
    pub fn new(conn: Arc<dyn DirectoryConnection>, address: impl Into<String>) -> Self {
        Self {
            conn,
            address: address.into(),
        }
    }

    /// host:port of the server.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Arc<dyn DirectoryConnection> {
        &self.conn
    }

    /// Read the replication server object, if any.
    pub async fn read_replication_server(
        &self,
    ) -> Result<Option<ReplicationServerConfig>, DirectoryError> {
        let Some(e) = self.conn.read(&Dn::new(layout::REPLICATION_SERVER), &[]).await? else {
            return Ok(None);
        };
        Ok(Some(ReplicationServerConfig {
            port: required_number(&e, layout::ATTR_REPLICATION_PORT)?,
            server_id: required_number(&e, layout::ATTR_REPLICATION_SERVER_ID)?,
            peers: e.values(layout::ATTR_REPLICATION_SERVER).iter().cloned().collect(),
        }))
    }

    /// Enable the multimaster synchronization provider. Returns true if a
    /// write was needed.
    pub async fn enable_sync_provider(&self) -> Result<bool, DirectoryError> {
        let dn = Dn::new(layout::SYNC_PROVIDER);
        match self.conn.read(&dn, &[layout::ATTR_ENABLED]).await? {
            Some(entry) if entry.first_bool(layout::ATTR_ENABLED) == Some(true) => Ok(false),
            Some(_) => {
                self.conn
                    .modify(&dn, &[Modification::replace(layout::ATTR_ENABLED, ["true"])])
                    .await?;
                Ok(true)
            }
            None => {
                let entry = Entry::new(dn)
                    .with("objectclass", ["top", "ds-cfg-replication-synchronization-provider"])
                    .with(layout::ATTR_ENABLED, ["true"]);
                self.conn.add(entry).await?;
                Ok(true)
            }
        }
    }

    /// Create the replication server object.
    pub async fn create_replication_server(
        &self,
        config: &ReplicationServerConfig,
    ) -> Result<(), DirectoryError> {
        let mut entry = Entry::new(Dn::new(layout::REPLICATION_SERVER))
            .with("objectclass", ["top", "ds-cfg-replication-server"])
            .with(layout::ATTR_REPLICATION_PORT, [config.port.to_string()])
            .with(layout::ATTR_REPLICATION_SERVER_ID, [config.server_id.to_string()]);
        entry.set(layout::ATTR_REPLICATION_SERVER, config.peers.to_values());
        self.conn.add(entry).await
    }

    /// Replace the replication server's peer list.
    pub async fn set_replication_server_peers(&self, peers: &PeerSet) -> Result<(), DirectoryError> {
        self.conn
            .modify(
                &Dn::new(layout::REPLICATION_SERVER),
                &[Modification::replace(layout::ATTR_REPLICATION_SERVER, peers.to_values())],
            )
            .await
    }

    /// Remove the replication server object.
    pub async fn delete_replication_server(&self) -> Result<(), DirectoryError> {
        self.conn.delete(&Dn::new(layout::REPLICATION_SERVER)).await
    }

    /// All replication domains configured on the server.
    pub async fn read_domains(&self) -> Result<Vec<DomainConfig>, DirectoryError> {
        let entries = match self
            .conn
            .search(
                &Dn::new(layout::DOMAINS),
                SearchScope::OneLevel,
                &Filter::any(),
                &[],
            )
            .await
        {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut domains = Vec::with_capacity(entries.len());
        for e in entries {
            let Some(base_dn) = e.first(layout::ATTR_BASE_DN) else {
                continue;
            };
            domains.push(DomainConfig {
                base_dn: Dn::new(base_dn),
                server_id: required_number(&e, layout::ATTR_SERVER_ID)?,
                peers: e.values(layout::ATTR_REPLICATION_SERVER).iter().cloned().collect(),
                entry_dn: e.dn().clone(),
            });
        }
        Ok(domains)
    }

    /// Domain for `base_dn`, matched by DN equality.
    pub async fn find_domain(&self, base_dn: &Dn) -> Result<Option<DomainConfig>, DirectoryError> {
        Ok(self
            .read_domains()
            .await?
            .into_iter()
            .find(|d| d.base_dn == *base_dn))
    }

    /// Create a domain; returns the stored configuration.
    pub async fn create_domain(
        &self,
        base_dn: &Dn,
        server_id: u32,
        peers: &PeerSet,
    ) -> Result<DomainConfig, DirectoryError> {
        let container = Dn::new(layout::DOMAINS);
        if self.conn.read(&container, &[]).await?.is_none() {
            let entry = Entry::new(container.clone()).with("objectclass", ["top", "ds-cfg-branch"]);
            match self.conn.add(entry).await {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
        }
        let entry_dn = container.child(&format!("cn={}", escape_value(base_dn.as_str())));
        let mut entry = Entry::new(entry_dn.clone())
            .with("objectclass", ["top", "ds-cfg-replication-domain"])
            .with("cn", [base_dn.as_str()])
            .with(layout::ATTR_BASE_DN, [base_dn.as_str()])
            .with(layout::ATTR_SERVER_ID, [server_id.to_string()]);
        entry.set(layout::ATTR_REPLICATION_SERVER, peers.to_values());
        self.conn.add(entry).await?;
        debug!(address = %self.address, base_dn = %base_dn, server_id, "replication domain created");
        Ok(DomainConfig {
            entry_dn,
            base_dn: base_dn.clone(),
            server_id,
            peers: peers.clone(),
        })
    }

    /// Replace a domain's peer list.
    pub async fn set_domain_peers(
        &self,
        domain: &DomainConfig,
        peers: &PeerSet,
    ) -> Result<(), DirectoryError> {
        self.conn
            .modify(
                &domain.entry_dn,
                &[Modification::replace(layout::ATTR_REPLICATION_SERVER, peers.to_values())],
            )
            .await
    }

    /// Remove a domain.
    pub async fn delete_domain(&self, domain: &DomainConfig) -> Result<(), DirectoryError> {
        self.conn.delete(&domain.entry_dn).await
    }

    /// Whether replication traffic is encrypted server-wide.
    pub async fn ssl_encryption(&self) -> Result<bool, DirectoryError> {
        let entry = self
            .conn
            .read(&Dn::new(layout::CRYPTO_MANAGER), &[layout::ATTR_SSL_ENCRYPTION])
            .await?;
        Ok(entry
            .and_then(|e| e.first_bool(layout::ATTR_SSL_ENCRYPTION))
            .unwrap_or(false))
    }

    /// Turn replication encryption on or off for the whole server.
    pub async fn set_ssl_encryption(&self, enabled: bool) -> Result<(), DirectoryError> {
        let value = if enabled { "true" } else { "false" };
        self.conn
            .modify(
                &Dn::new(layout::CRYPTO_MANAGER),
                &[Modification::replace(layout::ATTR_SSL_ENCRYPTION, [value])],
            )
            .await
    }

    /// Backends with their base DNs and entry counts.
    pub async fn read_backends(&self) -> Result<Vec<BackendInfo>, DirectoryError> {
        let entries = self
            .conn
            .search(
                &Dn::new(layout::BACKENDS),
                SearchScope::OneLevel,
                &Filter::object_class("ds-cfg-backend"),
                &[layout::ATTR_BACKEND_ID, layout::ATTR_BASE_DN],
            )
            .await?;
        let mut backends = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(backend_id) = entry.first(layout::ATTR_BACKEND_ID) else {
                continue;
            };
            let monitor_dn = Dn::new(layout::MONITOR).child(&format!("cn={} Backend", backend_id));
            let entry_count = self
                .conn
                .read(&monitor_dn, &[layout::ATTR_BACKEND_ENTRY_COUNT])
                .await?
                .and_then(|m| m.first_parsed(layout::ATTR_BACKEND_ENTRY_COUNT));
            backends.push(BackendInfo {
                backend_id: backend_id.to_string(),
                base_dns: entry.values(layout::ATTR_BASE_DN).iter().map(Dn::new).collect(),
                entry_count,
            });
        }
        Ok(backends)
    }

    /// Register a backend for `base_dn` if no backend serves it yet.
    pub async fn ensure_backend(&self, backend_id: &str, base_dn: &Dn) -> Result<bool, DirectoryError> {
        let served = self
            .read_backends()
            .await?
            .iter()
            .any(|b| b.base_dns.contains(base_dn));
        if served {
            return Ok(false);
        }
        let entry = Entry::new(
            Dn::new(layout::BACKENDS).child(&format!("{}={}", layout::ATTR_BACKEND_ID, backend_id)),
        )
        .with("objectclass", ["top", "ds-cfg-backend"])
        .with(layout::ATTR_BACKEND_ID, [backend_id])
        .with(layout::ATTR_BASE_DN, [base_dn.as_str()]);
        match self.conn.add(entry).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_already_exists() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Replica monitoring entries.
    pub async fn read_replica_monitors(&self) -> Result<Vec<ReplicaMonitor>, DirectoryError> {
        let entries = self
            .conn
            .search(
                &Dn::new(layout::MONITOR),
                SearchScope::Subtree,
                &Filter::Present(layout::ATTR_MONITOR_DOMAIN.to_string()),
                &[],
            )
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| {
                Some(ReplicaMonitor {
                    base_dn: Dn::new(e.first(layout::ATTR_MONITOR_DOMAIN)?),
                    server_id: e.first_parsed(layout::ATTR_MONITOR_SERVER_ID),
                    missing_changes: e.first_parsed(layout::ATTR_MISSING_CHANGES),
                    oldest_missing_change_ms: e.first_parsed(layout::ATTR_OLDEST_MISSING_AGE),
                })
            })
            .collect())
    }

    /// Schema replication identifier.
    pub async fn schema_generation_id(&self) -> Result<Option<String>, DirectoryError> {
        let entry = self
            .conn
            .read(&Dn::new(layout::SCHEMA), &[layout::ATTR_SYNC_GENERATION_ID])
            .await?;
        Ok(entry.and_then(|e| e.first(layout::ATTR_SYNC_GENERATION_ID).map(str::to_string)))
    }

    /// The server's wall clock as reported by the monitor.
    pub async fn server_clock(&self) -> Result<Option<DateTime<Utc>>, DirectoryError> {
        let entry = self
            .conn
            .read(&Dn::new(layout::MONITOR), &[layout::ATTR_CURRENT_TIME])
            .await?;
        Ok(entry
            .and_then(|e| e.first(layout::ATTR_CURRENT_TIME).map(str::to_string))
            .and_then(|value| parse_generalized_time(&value)))
    }

    /// This server's instance key certificate.
    pub async fn instance_certificate(&self) -> Result<Option<TrustedCertificate>, DirectoryError> {
        let entry = self.conn.read(&Dn::new(layout::ADS_CERTIFICATE), &[]).await?;
        Ok(entry.and_then(|e| {
            Some(TrustedCertificate {
                key_id: e.first(layout::ATTR_KEY_ID)?.to_string(),
                certificate: e.first(layout::ATTR_PUBLIC_KEY_CERTIFICATE)?.to_string(),
            })
        }))
    }

    /// Add a certificate to the trust store. Returns false if already there.
    pub async fn add_trusted_certificate(
        &self,
        certificate: &TrustedCertificate,
    ) -> Result<bool, DirectoryError> {
        let dn = Dn::new(layout::TRUSTSTORE).child(&format!(
            "{}={}",
            layout::ATTR_KEY_ID,
            escape_value(&certificate.key_id)
        ));
        let entry = Entry::new(dn)
            .with("objectclass", ["top", "ds-cfg-instance-key"])
            .with(layout::ATTR_KEY_ID, [certificate.key_id.as_str()])
            .with(layout::ATTR_PUBLIC_KEY_CERTIFICATE, [certificate.certificate.as_str()]);
        match self.conn.add(entry).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_already_exists() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Key ids present in the trust store.
    pub async fn trusted_key_ids(&self) -> Result<Vec<String>, DirectoryError> {
        let entries = self
            .conn
            .search(&Dn::new(layout::TRUSTSTORE), SearchScope::OneLevel, &Filter::any(), &[layout::ATTR_KEY_ID])
            .await?;
        Ok(entries
            .iter()
            .filter_map(|e| e.first(layout::ATTR_KEY_ID).map(str::to_string))
            .collect())
    }
}

/// Parse `YYYYMMDDhhmmssZ`, tolerating fractional seconds.
pub fn parse_generalized_time(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim().trim_end_matches('Z');
    let whole = trimmed.split(['.', ',']).next()?;
    let naive = NaiveDateTime::parse_from_str(whole, "%Y%m%d%H%M%S").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// A non-zero number stored in `attr`.
fn required_number<T>(entry: &Entry, attr: &str) -> Result<T, DirectoryError>
where
    T: std::str::FromStr + Default + PartialEq,
{
    entry
        .first_parsed::<T>(attr)
        .filter(|n| *n != T::default())
        .ok_or_else(|| DirectoryError::InvalidAttribute {
            dn: entry.dn().to_string(),
            attr: attr.to_string(),
            value: entry.first(attr).map(str::to_string),
        })
}
