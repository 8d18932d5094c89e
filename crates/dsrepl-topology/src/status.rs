//! Replication status report.

use serde::Serialize;
use std::fmt;

use crate::dn::Dn;
use crate::topology::TopologyCache;

/// Replication server settings of one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    /// host:port.
    pub address: String,
    /// Replication server id, when a replication server.
    pub replication_server_id: Option<u32>,
    /// Replication port, when a replication server.
    pub replication_port: Option<u16>,
    /// Replication traffic is encrypted.
    pub secure_replication: bool,
    /// Why the server could not be read.
    pub error: Option<String>,
}

/// One replica of a suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaStatus {
    /// host:port of the holder.
    pub server: String,
    /// Domain id, when replicated.
    pub domain_id: Option<u32>,
    /// Replication servers it talks to.
    pub peers: Vec<String>,
    /// Entries in the backend.
    pub entry_count: Option<u64>,
    /// Changes not yet received.
    pub missing_changes: Option<u64>,
    /// Age of the oldest missing change in milliseconds.
    pub oldest_missing_change_ms: Option<u64>,
}

/// A suffix and its replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuffixStatus {
    /// Base DN.
    pub base_dn: String,
    /// Replicas, in discovery order.
    pub replicas: Vec<ReplicaStatus>,
}

/// What one server's administration data says about the topology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Every registered server.
    pub servers: Vec<ServerStatus>,
    /// Suffixes held by readable servers.
    pub suffixes: Vec<SuffixStatus>,
    /// Discovery failures.
    pub errors: Vec<String>,
}

impl StatusReport {
    /// Build from a snapshot, restricted to `base_dns` unless empty.
    pub fn from_cache(cache: &TopologyCache, base_dns: &[Dn]) -> Self {
        let servers = cache
            .servers()
            .iter()
            .map(|s| ServerStatus {
                address: s.address(),
                replication_server_id: s.properties.replication_server_id,
                replication_port: s.properties.replication_port,
                secure_replication: s.properties.secure_replication,
                error: s.last_error.as_ref().map(|e| e.to_string()),
            })
            .collect();

        let suffixes = cache
            .suffixes()
            .iter()
            .filter(|s| base_dns.is_empty() || base_dns.contains(&s.base_dn))
            .map(|s| SuffixStatus {
                base_dn: s.base_dn.to_string(),
                replicas: s
                    .replicas
                    .iter()
                    .map(|r| ReplicaStatus {
                        server: r.server_address.clone(),
                        domain_id: r.descriptor.domain_id,
                        peers: r.descriptor.peers.to_values(),
                        entry_count: r.descriptor.entry_count,
                        missing_changes: r.descriptor.missing_changes,
                        oldest_missing_change_ms: r.descriptor.oldest_missing_change_ms,
                    })
                    .collect(),
            })
            .collect();

        Self {
            servers,
            suffixes,
            errors: cache.errors().iter().map(|e| e.to_string()).collect(),
        }
    }

    /// Suffix with `base_dn`.
    pub fn suffix(&self, base_dn: &Dn) -> Option<&SuffixStatus> {
        self.suffixes
            .iter()
            .find(|s| Dn::new(s.base_dn.as_str()) == *base_dn)
    }
}

fn or_dash<T: fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for server in &self.servers {
            write!(
                f,
                "server {} rs-id={} rs-port={} secure={}",
                server.address,
                or_dash(server.replication_server_id),
                or_dash(server.replication_port),
                server.secure_replication
            )?;
            match &server.error {
                Some(error) => writeln!(f, " error: {}", error)?,
                None => writeln!(f)?,
            }
        }
        for suffix in &self.suffixes {
            writeln!(f, "suffix {}", suffix.base_dn)?;
            for replica in &suffix.replicas {
                writeln!(
                    f,
                    "  {} domain-id={} entries={} missing={} oldest-missing-ms={} peers=[{}]",
                    replica.server,
                    or_dash(replica.domain_id),
                    or_dash(replica.entry_count),
                    or_dash(replica.missing_changes),
                    or_dash(replica.oldest_missing_change_ms),
                    replica.peers.join(", ")
                )?;
            }
        }
        Ok(())
    }
}
