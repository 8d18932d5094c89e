//! Replication server and domain identifier allocation.
//!
//! Ids are small positive integers. The allocator is fed every id visible
//! in every snapshot taken during an operation, plus the ids committed on
//! the nodes being configured directly, and always hands out the smallest
//! free one.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::dn::Dn;
use crate::error::{ReplError, Result};
use crate::server::ServerDescriptor;
use crate::topology::TopologyCache;

/// Largest id a server accepts.
pub const MAX_ID: u32 = 65_535;

fn smallest_free(used: &BTreeSet<u32>, kind: &'static str) -> Result<u32> {
    let mut candidate = 1u32;
    for &id in used.range(1..) {
        if id > candidate {
            break;
        }
        candidate = id.saturating_add(1);
    }
    if candidate > MAX_ID {
        return Err(ReplError::IdSpaceExhausted { kind });
    }
    Ok(candidate)
}

/// Smallest replication server id not in `used`.
pub fn next_replication_server_id(used: &BTreeSet<u32>) -> Result<u32> {
    smallest_free(used, "replication server")
}

/// Smallest domain id not in `used`.
pub fn next_domain_id(used: &BTreeSet<u32>) -> Result<u32> {
    smallest_free(used, "replication domain")
}

/// Tracks ids in use across one operation and records each id it hands out.
#[derive(Debug, Clone, Default)]
pub struct IdAllocator {
    server_ids: BTreeSet<u32>,
    domain_ids: BTreeMap<Dn, BTreeSet<u32>>,
}

impl IdAllocator {
    /// An allocator with nothing observed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every id in a snapshot.
    pub fn observe_cache(&mut self, cache: &TopologyCache) {
        for server in cache.servers() {
            self.observe_server(server);
        }
    }

    /// Record the ids of one server.
    pub fn observe_server(&mut self, server: &ServerDescriptor) {
        if let Some(id) = server.properties.replication_server_id {
            self.server_ids.insert(id);
        }
        for replica in &server.replicas {
            if let Some(id) = replica.domain_id {
                self.domain_ids
                    .entry(replica.base_dn.clone())
                    .or_default()
                    .insert(id);
            }
        }
    }

    /// Mark a replication server id as taken.
    pub fn reserve_server_id(&mut self, id: u32) {
        self.server_ids.insert(id);
    }

    /// Mark a domain id as taken for `base_dn`.
    pub fn reserve_domain_id(&mut self, base_dn: &Dn, id: u32) {
        self.domain_ids.entry(base_dn.clone()).or_default().insert(id);
    }

    /// Replication server ids seen so far.
    pub fn used_server_ids(&self) -> &BTreeSet<u32> {
        &self.server_ids
    }

    /// Domain ids seen so far for `base_dn`.
    pub fn used_domain_ids(&self, base_dn: &Dn) -> BTreeSet<u32> {
        self.domain_ids.get(base_dn).cloned().unwrap_or_default()
    }

    /// Allocate and reserve a replication server id.
    pub fn allocate_server_id(&mut self) -> Result<u32> {
        let id = next_replication_server_id(&self.server_ids)?;
        self.server_ids.insert(id);
        debug!(id, "replication server id allocated");
        Ok(id)
    }

    /// Allocate and reserve a domain id for `base_dn`.
    pub fn allocate_domain_id(&mut self, base_dn: &Dn) -> Result<u32> {
        let used = self.domain_ids.entry(base_dn.clone()).or_default();
        let id = next_domain_id(used)?;
        used.insert(id);
        debug!(id, base_dn = %base_dn, "domain id allocated");
        Ok(id)
    }
}
