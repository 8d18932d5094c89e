//! Snapshot of one server's replication-relevant state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::admin_client::{BackendInfo, ReplicationAdminClient};
use crate::directory::{ConnectionParams, DirectoryError, Protocol, TrustPolicy};
use crate::dn::{Dn, ADMIN_DATA_DN, SCHEMA_DN};
use crate::peers::{peer_address, PeerSet};
use crate::topology::TopologyCacheException;

/// Replication properties of a server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerProperties {
    /// A replication server object exists.
    pub is_replication_server: bool,
    /// Replication port, when a replication server.
    pub replication_port: Option<u16>,
    /// Replication server id, when a replication server.
    pub replication_server_id: Option<u32>,
    /// Replication traffic is encrypted (server-wide crypto setting).
    pub secure_replication: bool,
    /// Schema replication marker.
    pub schema_generation_id: Option<String>,
}

/// One server's copy of a suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    /// Suffix.
    pub base_dn: Dn,
    /// Backend holding it, if any.
    pub backend_id: Option<String>,
    /// Domain id; `None` while not replicated.
    pub domain_id: Option<u32>,
    /// Replication servers the replica talks to.
    pub peers: PeerSet,
    /// Entries in the backend.
    pub entry_count: Option<u64>,
    /// Changes not yet received.
    pub missing_changes: Option<u64>,
    /// Age of the oldest missing change in milliseconds.
    pub oldest_missing_change_ms: Option<u64>,
}

impl ReplicaDescriptor {
    /// Replicated iff it has a domain id and at least one peer.
    pub fn is_replicated(&self) -> bool {
        self.domain_id.is_some() && !self.peers.is_empty()
    }
}

/// Offset between a server clock and the local clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSample {
    /// Server time minus local time, in milliseconds; zero when the
    /// server time fell inside the local sampling window.
    pub offset_ms: i64,
}

impl ClockSample {
    /// Compare a server time with the local window around its read.
    pub fn from_window(before: DateTime<Utc>, server: DateTime<Utc>, after: DateTime<Utc>) -> Self {
        let offset_ms = if server < before {
            (server - before).num_milliseconds()
        } else if server > after {
            (server - after).num_milliseconds()
        } else {
            0
        };
        Self { offset_ms }
    }

    /// Skew between two servers.
    pub fn skew(&self, other: &ClockSample) -> Duration {
        Duration::from_millis(self.offset_ms.abs_diff(other.offset_ms))
    }
}

/// The listener a server was read through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactPoint {
    /// Port dialed.
    pub port: u16,
    /// Transport security used.
    pub protocol: Protocol,
}

impl From<&ConnectionParams> for ContactPoint {
    fn from(params: &ConnectionParams) -> Self {
        Self {
            port: params.port,
            protocol: params.protocol,
        }
    }
}

/// A server as seen by one discovery pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Host name.
    pub host: String,
    /// LDAP port.
    pub ldap_port: u16,
    /// LDAPS port, if any.
    pub secure_port: Option<u16>,
    /// Replication properties.
    pub properties: ServerProperties,
    /// Replicas held by the server.
    pub replicas: Vec<ReplicaDescriptor>,
    /// Clock offset measured while reading.
    pub clock: Option<ClockSample>,
    /// Why the last read failed, if it did.
    pub last_error: Option<TopologyCacheException>,
    /// Listener the descriptor was read through.
    pub contact: Option<ContactPoint>,
}

impl ServerDescriptor {
    /// A descriptor with nothing read yet.
    pub fn unreachable(host: &str, ldap_port: u16, secure_port: Option<u16>) -> Self {
        Self {
            host: host.to_string(),
            ldap_port,
            secure_port,
            properties: ServerProperties::default(),
            replicas: Vec::new(),
            clock: None,
            last_error: None,
            contact: None,
        }
    }

    /// Read everything from a connected server.
    pub async fn read(
        client: &ReplicationAdminClient,
        host: &str,
        ldap_port: u16,
        secure_port: Option<u16>,
    ) -> Result<Self, DirectoryError> {
        let before = Utc::now();
        let server_time = client.server_clock().await?;
        let after = Utc::now();
        let clock = server_time.map(|t| ClockSample::from_window(before, t, after));

        let replication_server = client.read_replication_server().await?;
        let secure_replication = client.ssl_encryption().await?;
        let schema_generation_id = client.schema_generation_id().await?;
        let backends = client.read_backends().await?;
        let domains = client.read_domains().await?;
        let monitors = client.read_replica_monitors().await?;

        let mut replicas: Vec<ReplicaDescriptor> = Vec::new();
        for BackendInfo {
            backend_id,
            base_dns,
            entry_count,
        } in &backends
        {
            for base_dn in base_dns {
                if replicas.iter().any(|r| r.base_dn == *base_dn) {
                    continue;
                }
                replicas.push(ReplicaDescriptor {
                    base_dn: base_dn.clone(),
                    backend_id: Some(backend_id.clone()),
                    domain_id: None,
                    peers: PeerSet::new(),
                    entry_count: *entry_count,
                    missing_changes: None,
                    oldest_missing_change_ms: None,
                });
            }
        }
        for domain in domains {
            let index = match replicas.iter().position(|r| r.base_dn == domain.base_dn) {
                Some(index) => index,
                None => {
                    replicas.push(ReplicaDescriptor {
                        base_dn: domain.base_dn.clone(),
                        backend_id: None,
                        domain_id: None,
                        peers: PeerSet::new(),
                        entry_count: None,
                        missing_changes: None,
                        oldest_missing_change_ms: None,
                    });
                    replicas.len() - 1
                }
            };
            let replica = &mut replicas[index];
            replica.domain_id = Some(domain.server_id);
            replica.peers = domain.peers;
            if let Some(monitor) = monitors.iter().find(|m| {
                m.base_dn == replica.base_dn
                    && m.server_id.map_or(true, |id| id == domain.server_id)
            }) {
                replica.missing_changes = monitor.missing_changes;
                replica.oldest_missing_change_ms = monitor.oldest_missing_change_ms;
            }
        }

        Ok(Self {
            host: host.to_string(),
            ldap_port,
            secure_port,
            properties: ServerProperties {
                is_replication_server: replication_server.is_some(),
                replication_port: replication_server.as_ref().map(|rs| rs.port),
                replication_server_id: replication_server.as_ref().map(|rs| rs.server_id),
                secure_replication,
                schema_generation_id,
            },
            replicas,
            clock,
            last_error: None,
            contact: None,
        })
    }

    /// Identity key: lower-cased `host:ldap_port`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host.to_lowercase(), self.ldap_port)
    }

    /// `host:ldap_port` as spelled.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.ldap_port)
    }

    /// Parameters reaching the server through the listener it was read
    /// with, plain LDAP on `ldap_port` when unknown.
    pub fn connection_params(&self, bind_dn: &str, password: &str, trust: &TrustPolicy) -> ConnectionParams {
        let contact = self.contact.unwrap_or(ContactPoint {
            port: self.ldap_port,
            protocol: Protocol::Ldap,
        });
        ConnectionParams::new(self.host.as_str(), contact.port)
            .with_protocol(contact.protocol)
            .with_credentials(bind_dn, password)
            .with_trust(trust.clone())
    }

    /// `host:replication_port`, when this is a replication server.
    pub fn replication_server_address(&self) -> Option<String> {
        match (self.properties.is_replication_server, self.properties.replication_port) {
            (true, Some(port)) => Some(peer_address(&self.host, port)),
            _ => None,
        }
    }

    /// Replica of `base_dn`, by DN equality.
    pub fn replica(&self, base_dn: &Dn) -> Option<&ReplicaDescriptor> {
        self.replicas.iter().find(|r| r.base_dn == *base_dn)
    }

    /// True if the server holds `base_dn` (replicated or not).
    pub fn has_base_dn(&self, base_dn: &Dn) -> bool {
        self.replica(base_dn).is_some()
    }

    /// Replicas with a domain and peers.
    pub fn replicated_base_dns(&self) -> Vec<Dn> {
        self.replicas
            .iter()
            .filter(|r| r.is_replicated())
            .map(|r| r.base_dn.clone())
            .collect()
    }

    /// True if the server holds user data under `base_dn`, i.e. neither
    /// the administration nor the schema suffix.
    pub fn is_user_suffix(base_dn: &Dn) -> bool {
        *base_dn != Dn::new(ADMIN_DATA_DN) && *base_dn != Dn::new(SCHEMA_DN)
    }
}

/// Whether `base_dn` is replicated between two servers: both replicas are
/// replicated and share at least one replication server.
pub fn is_replicated_between(a: &ServerDescriptor, b: &ServerDescriptor, base_dn: &Dn) -> bool {
    match (a.replica(base_dn), b.replica(base_dn)) {
        (Some(ra), Some(rb)) => {
            ra.is_replicated() && rb.is_replicated() && ra.peers.intersects(&rb.peers)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{ConnectionFactory, ConnectionParams, Entry};
    use crate::memory::{InMemoryDirectory, InMemoryNetwork};
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;

    async fn read(dir: InMemoryDirectory) -> ServerDescriptor {
        let dir = Arc::new(dir.with_root_user("cn=dm", "pw"));
        let mut net = InMemoryNetwork::new();
        net.attach(dir.clone());
        let conn = net
            .connect(&ConnectionParams::new(dir.host(), dir.ldap_port()).with_credentials("cn=dm", "pw"))
            .await
            .unwrap();
        let client = ReplicationAdminClient::new(conn, dir.address());
        ServerDescriptor::read(&client, dir.host(), dir.ldap_port(), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_read_standalone_server() {
        let desc = read(
            InMemoryDirectory::new("ldap1", 389).with_backend("userRoot", "dc=example,dc=com", 5),
        )
        .await;
        assert!(!desc.properties.is_replication_server);
        assert_eq!(desc.replication_server_address(), None);
        let replica = desc.replica(&Dn::new("dc=Example,dc=com")).unwrap();
        assert_eq!(replica.entry_count, Some(5));
        assert!(!replica.is_replicated());
        assert!(desc.clock.is_some());
    }

    #[tokio::test]
    async fn test_read_replicated_server_with_monitor() {
        let provider = "cn=Multimaster Synchronization,cn=Synchronization Providers,cn=config";
        let dir = InMemoryDirectory::new("ldap1", 389)
            .with_backend("userRoot", "dc=example,dc=com", 5)
            .with_entries([
                Entry::new(Dn::new(format!("cn=Replication Server,{}", provider)))
                    .with("ds-cfg-replication-port", ["8989"])
                    .with("ds-cfg-replication-server-id", ["4"])
                    .with("ds-cfg-replication-server", ["ldap2:8989"]),
                Entry::new(Dn::new(format!("cn=domains,{}", provider))),
                Entry::new(Dn::new(format!("cn=example,cn=domains,{}", provider)))
                    .with("ds-cfg-base-dn", ["dc=example,dc=com"])
                    .with("ds-cfg-server-id", ["12"])
                    .with("ds-cfg-replication-server", ["ldap1:8989", "ldap2:8989"]),
                Entry::new(Dn::new("cn=replica 12,cn=monitor"))
                    .with("domain-name", ["dc=example,dc=com"])
                    .with("server-id", ["12"])
                    .with("missing-changes", ["3"])
                    .with("approx-older-change-not-synchronized-millis", ["1500"]),
            ]);
        let desc = read(dir).await;
        assert_eq!(desc.replication_server_address().as_deref(), Some("ldap1:8989"));
        assert_eq!(desc.properties.replication_server_id, Some(4));
        let replica = desc.replica(&Dn::new("dc=example,dc=com")).unwrap();
        assert!(replica.is_replicated());
        assert_eq!(replica.domain_id, Some(12));
        assert_eq!(replica.missing_changes, Some(3));
        assert_eq!(replica.oldest_missing_change_ms, Some(1500));
        assert_eq!(desc.replicated_base_dns(), vec![Dn::new("dc=example,dc=com")]);
    }

    #[test]
    fn test_clock_sample_window() {
        let before = Utc::now();
        let after = before + ChronoDuration::milliseconds(20);
        let inside = ClockSample::from_window(before, before + ChronoDuration::milliseconds(5), after);
        assert_eq!(inside.offset_ms, 0);
        let ahead = ClockSample::from_window(before, after + ChronoDuration::minutes(6), after);
        assert_eq!(ahead.offset_ms, 360_000);
        let behind = ClockSample::from_window(before, before - ChronoDuration::seconds(1), after);
        assert_eq!(behind.offset_ms, -1000);
        assert_eq!(ahead.skew(&behind), Duration::from_millis(361_000));
    }

    #[test]
    fn test_user_suffix_classification() {
        assert!(ServerDescriptor::is_user_suffix(&Dn::new("dc=example,dc=com")));
        assert!(!ServerDescriptor::is_user_suffix(&Dn::new("CN=Admin Data")));
        assert!(!ServerDescriptor::is_user_suffix(&Dn::new("cn=schema")));
    }
}
