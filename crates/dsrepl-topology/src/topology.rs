//! Topology discovery.
//!
//! A `TopologyCache` is a snapshot built from one server's administration
//! data: every registered server is contacted, its replication state read,
//! and suffixes are aggregated across servers by DN equality. Servers that
//! cannot be read are kept in the snapshot with the reason attached; they
//! never abort the reload.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::admin_client::ReplicationAdminClient;
use crate::ads::{AdminRegistry, AdsServerProperties};
use crate::directory::{self, ConnectionFactory, ConnectionParams, DirectoryError, TrustPolicy};
use crate::dn::Dn;
use crate::error::{ReplError, Result};
use crate::peers::PeerSet;
use crate::server::{ContactPoint, ReplicaDescriptor, ServerDescriptor};

/// Why a server could not be read during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyCacheExceptionKind {
    /// The credentials are not those of a global administrator.
    NotGlobalAdministrator,
    /// The server certificate is not trusted.
    CertificateProblem,
    /// The server could not be reached.
    GenericConnection,
    /// Connected, but reading the configuration failed.
    GenericReadingServer,
}

impl fmt::Display for TopologyCacheExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TopologyCacheExceptionKind::NotGlobalAdministrator => "not a global administrator",
            TopologyCacheExceptionKind::CertificateProblem => "certificate problem",
            TopologyCacheExceptionKind::GenericConnection => "connection error",
            TopologyCacheExceptionKind::GenericReadingServer => "error reading server",
        };
        f.write_str(s)
    }
}

/// A per-server discovery failure.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} on {ldap_url}: {cause}")]
pub struct TopologyCacheException {
    /// Classification.
    pub kind: TopologyCacheExceptionKind,
    /// host:port of the server.
    pub address: String,
    /// URL that was tried.
    pub ldap_url: String,
    /// Underlying error.
    pub cause: DirectoryError,
}

impl TopologyCacheException {
    /// Classify a connection failure.
    pub fn connecting(params: &ConnectionParams, cause: DirectoryError) -> Self {
        let kind = match &cause {
            DirectoryError::AuthenticationFailed { .. } | DirectoryError::InsufficientAccess { .. } => {
                TopologyCacheExceptionKind::NotGlobalAdministrator
            }
            DirectoryError::Certificate { .. } => TopologyCacheExceptionKind::CertificateProblem,
            _ => TopologyCacheExceptionKind::GenericConnection,
        };
        Self {
            kind,
            address: params.address(),
            ldap_url: params.ldap_url(),
            cause,
        }
    }

    /// Classify a failure while reading a connected server.
    pub fn reading(params: &ConnectionParams, cause: DirectoryError) -> Self {
        let kind = match &cause {
            DirectoryError::InsufficientAccess { .. } => {
                TopologyCacheExceptionKind::NotGlobalAdministrator
            }
            _ => TopologyCacheExceptionKind::GenericReadingServer,
        };
        Self {
            kind,
            address: params.address(),
            ldap_url: params.ldap_url(),
            cause,
        }
    }

    /// Proceeding past this failure risks acting with the wrong identity.
    pub fn is_fatal(&self) -> bool {
        self.kind == TopologyCacheExceptionKind::NotGlobalAdministrator
    }
}

/// Connection settings used to reach registered servers.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    /// Bind DN of the global administrator.
    pub bind_dn: String,
    /// Its password.
    pub password: String,
    /// Certificate trust.
    pub trust: TrustPolicy,
    /// URLs the caller already trusts, most preferred first.
    pub preferred_urls: Vec<String>,
    /// Deadline for opening each connection.
    pub connect_timeout: Duration,
    /// Servers read earlier in the same operation; reused as-is.
    pub known_servers: Vec<ServerDescriptor>,
}

impl DiscoveryOptions {
    /// Pick the connection to use for a registered server.
    ///
    /// An exact URL match with a preferred URL wins, then a candidate with
    /// the same scheme as the first preferred URL, then the first candidate.
    pub fn select(&self, server: &AdsServerProperties) -> Option<ConnectionParams> {
        let candidates = server.connection_candidates();
        let exact = self.preferred_urls.iter().find_map(|url| {
            candidates
                .iter()
                .find(|c| c.ldap_url().eq_ignore_ascii_case(url))
        });
        let by_scheme = || {
            let scheme = self.preferred_urls.first()?.split("://").next()?.to_lowercase();
            candidates.iter().find(|c| c.protocol.scheme() == scheme)
        };
        exact
            .or_else(by_scheme)
            .or_else(|| candidates.first())
            .map(|c| {
                c.clone()
                    .with_credentials(self.bind_dn.as_str(), self.password.as_str())
                    .with_trust(self.trust.clone())
            })
    }
}

/// One server's replica of a suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    /// `ServerDescriptor::key` of the holder.
    pub server_key: String,
    /// host:port of the holder, as spelled.
    pub server_address: String,
    /// Replication state.
    pub descriptor: ReplicaDescriptor,
}

/// A base DN with its replicas across the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suffix {
    /// The base DN.
    pub base_dn: Dn,
    /// Replicas, one per server holding the suffix.
    pub replicas: Vec<Replica>,
}

impl Suffix {
    /// Union of the replication servers declared by every replica.
    pub fn peer_servers(&self) -> PeerSet {
        let mut peers = PeerSet::new();
        for replica in &self.replicas {
            peers.extend_from(&replica.descriptor.peers);
        }
        peers
    }

    /// Replica held by the server with `key`.
    pub fn replica_on(&self, key: &str) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.server_key == key)
    }
}

/// A discovery snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyCache {
    servers: Vec<ServerDescriptor>,
    suffixes: Vec<Suffix>,
    errors: Vec<TopologyCacheException>,
}

impl TopologyCache {
    /// Build a snapshot from already-read servers. Servers with the same
    /// key are collapsed, keeping the first successfully read one.
    pub fn from_servers(servers: impl IntoIterator<Item = ServerDescriptor>) -> Self {
        let mut by_key: BTreeMap<String, ServerDescriptor> = BTreeMap::new();
        let mut order = Vec::new();
        for server in servers {
            let key = server.key();
            let replace = match by_key.get(&key) {
                Some(existing) => existing.last_error.is_some() && server.last_error.is_none(),
                None => {
                    order.push(key.clone());
                    true
                }
            };
            if replace {
                by_key.insert(key, server);
            }
        }
        let servers: Vec<ServerDescriptor> =
            order.into_iter().filter_map(|k| by_key.remove(&k)).collect();
        let errors = servers.iter().filter_map(|s| s.last_error.clone()).collect();
        let suffixes = aggregate_suffixes(&servers);
        Self {
            servers,
            suffixes,
            errors,
        }
    }

    /// Rediscover the topology registered in `ads`.
    pub async fn reload(
        ads: &AdminRegistry,
        factory: &dyn ConnectionFactory,
        options: &DiscoveryOptions,
    ) -> Result<Self> {
        let registry = ads
            .read_server_registry()
            .await
            .map_err(|source| ReplError::ReadingAds {
                address: ads.address().to_string(),
                source,
            })?;

        let mut servers = Vec::with_capacity(registry.len());
        for props in &registry {
            if let Some(known) = options
                .known_servers
                .iter()
                .find(|k| k.key() == props.key() && k.last_error.is_none())
            {
                debug!(server = %props.id(), "reusing server read earlier");
                servers.push(known.clone());
                continue;
            }
            servers.push(discover(props, factory, options).await);
        }

        let cache = Self::from_servers(servers);
        info!(
            ads = %ads.address(),
            servers = cache.servers.len(),
            suffixes = cache.suffixes.len(),
            errors = cache.errors.len(),
            "topology reloaded"
        );
        Ok(cache)
    }

    /// Union of several snapshots.
    pub fn union(caches: impl IntoIterator<Item = TopologyCache>) -> Self {
        Self::from_servers(caches.into_iter().flat_map(|c| c.servers))
    }

    /// Servers in the snapshot, including unreadable ones.
    pub fn servers(&self) -> &[ServerDescriptor] {
        &self.servers
    }

    /// Suffixes aggregated across readable servers.
    pub fn suffixes(&self) -> &[Suffix] {
        &self.suffixes
    }

    /// Discovery failures.
    pub fn errors(&self) -> &[TopologyCacheException] {
        &self.errors
    }

    /// Server with the given key.
    pub fn server(&self, key: &str) -> Option<&ServerDescriptor> {
        self.servers.iter().find(|s| s.key() == key)
    }

    /// Suffix with the given base DN.
    pub fn suffix(&self, base_dn: &Dn) -> Option<&Suffix> {
        self.suffixes.iter().find(|s| s.base_dn == *base_dn)
    }

    /// Replication server ids in use anywhere in the snapshot.
    pub fn used_replication_server_ids(&self) -> BTreeSet<u32> {
        self.servers
            .iter()
            .filter_map(|s| s.properties.replication_server_id)
            .collect()
    }

    /// Domain ids in use for `base_dn` anywhere in the snapshot.
    pub fn used_domain_ids(&self, base_dn: &Dn) -> BTreeSet<u32> {
        self.suffix(base_dn)
            .map(|s| s.replicas.iter().filter_map(|r| r.descriptor.domain_id).collect())
            .unwrap_or_default()
    }

    /// One line per failing server.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

async fn discover(
    props: &AdsServerProperties,
    factory: &dyn ConnectionFactory,
    options: &DiscoveryOptions,
) -> ServerDescriptor {
    let mut descriptor = ServerDescriptor::unreachable(&props.host, props.ldap_port, props.ldaps_port);
    let Some(params) = options.select(props) else {
        descriptor.last_error = Some(TopologyCacheException {
            kind: TopologyCacheExceptionKind::GenericConnection,
            address: props.id(),
            ldap_url: String::new(),
            cause: DirectoryError::Connect {
                address: props.id(),
                reason: "no enabled listener registered".to_string(),
            },
        });
        return descriptor;
    };

    let conn = match directory::open(factory, &params, options.connect_timeout).await {
        Ok(conn) => conn,
        Err(cause) => {
            let exception = TopologyCacheException::connecting(&params, cause);
            warn!(server = %props.id(), kind = %exception.kind, error = %exception.cause, "cannot connect during discovery");
            descriptor.last_error = Some(exception);
            return descriptor;
        }
    };

    let client = ReplicationAdminClient::new(conn.clone(), props.id());
    let read = ServerDescriptor::read(&client, &props.host, props.ldap_port, props.ldaps_port).await;
    conn.close().await;
    match read {
        Ok(mut server) => {
            server.contact = Some(ContactPoint::from(&params));
            server
        }
        Err(cause) => {
            let exception = TopologyCacheException::reading(&params, cause);
            warn!(server = %props.id(), kind = %exception.kind, error = %exception.cause, "cannot read server during discovery");
            descriptor.last_error = Some(exception);
            descriptor
        }
    }
}

fn aggregate_suffixes(servers: &[ServerDescriptor]) -> Vec<Suffix> {
    let mut suffixes: Vec<Suffix> = Vec::new();
    for server in servers.iter().filter(|s| s.last_error.is_none()) {
        for replica in &server.replicas {
            let entry = Replica {
                server_key: server.key(),
                server_address: server.address(),
                descriptor: replica.clone(),
            };
            match suffixes.iter_mut().find(|s| s.base_dn == replica.base_dn) {
                Some(suffix) => suffix.replicas.push(entry),
                None => suffixes.push(Suffix {
                    base_dn: replica.base_dn.clone(),
                    replicas: vec![entry],
                }),
            }
        }
    }
    suffixes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Protocol;
    use crate::memory::{InMemoryDirectory, InMemoryNetwork};
    use crate::server::ServerProperties;
    use std::sync::Arc;

    fn replica(base_dn: &str, domain_id: u32, peers: &[&str]) -> ReplicaDescriptor {
        ReplicaDescriptor {
            base_dn: Dn::new(base_dn),
            backend_id: Some("userRoot".to_string()),
            domain_id: Some(domain_id),
            peers: peers.iter().copied().collect(),
            entry_count: None,
            missing_changes: None,
            oldest_missing_change_ms: None,
        }
    }

    fn server(host: &str, rs_id: Option<u32>, replicas: Vec<ReplicaDescriptor>) -> ServerDescriptor {
        let mut s = ServerDescriptor::unreachable(host, 389, None);
        s.properties = ServerProperties {
            is_replication_server: rs_id.is_some(),
            replication_port: rs_id.map(|_| 8989),
            replication_server_id: rs_id,
            ..ServerProperties::default()
        };
        s.replicas = replicas;
        s
    }

    #[test]
    fn test_suffixes_aggregate_by_dn_equality() {
        let cache = TopologyCache::from_servers([
            server("a", Some(1), vec![replica("dc=Example,dc=Com", 3, &["a:8989", "B:8989"])]),
            server("b", Some(2), vec![replica("dc=example, dc=com", 4, &["A:8989", "c:8989"])]),
        ]);
        assert_eq!(cache.suffixes().len(), 1);
        let suffix = cache.suffix(&Dn::new("DC=EXAMPLE,DC=COM")).unwrap();
        assert_eq!(suffix.replicas.len(), 2);
        assert_eq!(suffix.peer_servers().len(), 3);
        assert_eq!(cache.used_replication_server_ids(), BTreeSet::from([1, 2]));
        assert_eq!(
            cache.used_domain_ids(&Dn::new("dc=example,dc=com")),
            BTreeSet::from([3, 4])
        );
        assert!(suffix.replica_on("b:389").is_some());
    }

    #[test]
    fn test_union_prefers_readable_descriptor() {
        let mut broken = server("a", None, vec![]);
        broken.last_error = Some(TopologyCacheException::connecting(
            &ConnectionParams::new("a", 389),
            DirectoryError::Connect {
                address: "a:389".to_string(),
                reason: "refused".to_string(),
            },
        ));
        let first = TopologyCache::from_servers([broken]);
        assert_eq!(first.errors().len(), 1);
        let second = TopologyCache::from_servers([server("A", Some(7), vec![])]);
        let merged = TopologyCache::union([first, second]);
        assert_eq!(merged.servers().len(), 1);
        assert!(merged.errors().is_empty());
        assert_eq!(merged.used_replication_server_ids(), BTreeSet::from([7]));
    }

    #[test]
    fn test_exception_classification() {
        let params = ConnectionParams::new("a", 389);
        let auth = TopologyCacheException::connecting(
            &params,
            DirectoryError::AuthenticationFailed {
                bind_dn: "cn=admin".to_string(),
            },
        );
        assert_eq!(auth.kind, TopologyCacheExceptionKind::NotGlobalAdministrator);
        assert!(auth.is_fatal());
        let cert = TopologyCacheException::connecting(
            &params,
            DirectoryError::Certificate {
                reason: "self signed".to_string(),
            },
        );
        assert_eq!(cert.kind, TopologyCacheExceptionKind::CertificateProblem);
        assert!(!cert.is_fatal());
        let read = TopologyCacheException::reading(
            &params,
            DirectoryError::Other {
                code: 1,
                message: "operations error".to_string(),
            },
        );
        assert_eq!(read.kind, TopologyCacheExceptionKind::GenericReadingServer);
    }

    #[test]
    fn test_select_prefers_trusted_url() {
        let mut props = AdsServerProperties::new("ldap1", 389);
        props.ldaps_enabled = true;
        props.ldaps_port = Some(636);
        let mut options = DiscoveryOptions::default();
        assert_eq!(options.select(&props).unwrap().protocol, Protocol::Ldap);
        options.preferred_urls = vec!["ldaps://other:636".to_string()];
        assert_eq!(options.select(&props).unwrap().port, 636);
        options.preferred_urls = vec!["LDAP://ldap1:389".to_string()];
        assert_eq!(options.select(&props).unwrap().port, 389);
        props.ldap_enabled = false;
        props.ldaps_enabled = false;
        assert!(options.select(&props).is_none());
    }

    #[tokio::test]
    async fn test_reload_collects_errors_without_aborting() {
        let admin = ("cn=admin,cn=Administrators,cn=admin data", "pw");
        let a = Arc::new(
            InMemoryDirectory::new("a", 389)
                .with_root_user(admin.0, admin.1)
                .with_backend("userRoot", "dc=example,dc=com", 10),
        );
        let b = Arc::new(InMemoryDirectory::new("b", 389).with_root_user(admin.0, admin.1));
        b.set_connect_error(Some(DirectoryError::Certificate {
            reason: "untrusted".to_string(),
        }))
        .await;
        let mut net = InMemoryNetwork::new();
        net.attach(a.clone()).attach(b.clone());

        let conn = net
            .connect(&ConnectionParams::new("a", 389).with_credentials(admin.0, admin.1))
            .await
            .unwrap();
        let ads = AdminRegistry::new(conn, "a:389");
        ads.create_admin_data().await.unwrap();
        ads.register_server(&AdsServerProperties::new("a", 389), None).await.unwrap();
        ads.register_server(&AdsServerProperties::new("b", 389), None).await.unwrap();
        ads.register_server(&AdsServerProperties::new("c", 389), None).await.unwrap();

        let options = DiscoveryOptions {
            bind_dn: admin.0.to_string(),
            password: admin.1.to_string(),
            connect_timeout: Duration::from_secs(5),
            ..DiscoveryOptions::default()
        };
        let cache = TopologyCache::reload(&ads, &net, &options).await.unwrap();
        assert_eq!(cache.servers().len(), 3);
        assert_eq!(cache.errors().len(), 2);
        assert!(cache
            .errors()
            .iter()
            .any(|e| e.kind == TopologyCacheExceptionKind::CertificateProblem));
        assert!(cache.suffix(&Dn::new("dc=example,dc=com")).is_some());
        assert!(cache.error_summary().contains("b:389"));
        // discovery connections are released
        assert_eq!(a.open_connections(), 1);
        assert_eq!(b.open_connections(), 0);
    }
}
