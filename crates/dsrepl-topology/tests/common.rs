//! Shared fixtures for the topology scenarios.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use dsrepl_topology::admin_client::{DomainConfig, ReplicationAdminClient, ReplicationServerConfig};
use dsrepl_topology::ads::{administrator_dn, AdminRegistry, AdministratorProperties};
use dsrepl_topology::directory::Protocol;
use dsrepl_topology::memory::{InMemoryDirectory, InMemoryNetwork};
use dsrepl_topology::reconcile::AdsSide;
use dsrepl_topology::{
    ConnectionFactory, ConnectionParams, DirectoryConnection, DirectoryError, Dn, EnableRequest,
    OperationListener, OperationRequest, RecordingListener, ServerEndpoint, ToolConfig,
    TopologyEnabler,
};

pub const DM: &str = "cn=Directory Manager";
pub const DM_PASSWORD: &str = "pw";
pub const ADMIN_UID: &str = "admin";
pub const ADMIN_PASSWORD: &str = "secret";
pub const SUFFIX: &str = "dc=example,dc=com";
pub const REPLICATION_PORT: u16 = 8989;

/// A standalone server holding `SUFFIX`. The global administrator can bind
/// as if the administration data had already been replicated to it.
pub fn server(host: &str) -> InMemoryDirectory {
    InMemoryDirectory::new(host, 389)
        .with_root_user(DM, DM_PASSWORD)
        .with_root_user(administrator_dn(ADMIN_UID).as_str(), ADMIN_PASSWORD)
        .with_backend("userRoot", SUFFIX, 200)
        .with_schema_generation_id("8408")
}

/// A standalone server the global administrator cannot bind to.
pub fn locked_server(host: &str) -> InMemoryDirectory {
    InMemoryDirectory::new(host, 389)
        .with_root_user(DM, DM_PASSWORD)
        .with_backend("userRoot", SUFFIX, 200)
        .with_schema_generation_id("8408")
}

/// Simulated servers on one network.
pub struct Lab {
    pub network: Arc<InMemoryNetwork>,
    pub listener: Arc<RecordingListener>,
}

impl Lab {
    pub fn new(servers: Vec<InMemoryDirectory>) -> Self {
        Self::with_listener(servers, RecordingListener::new())
    }

    pub fn with_listener(servers: Vec<InMemoryDirectory>, listener: RecordingListener) -> Self {
        let mut network = InMemoryNetwork::new();
        for server in servers {
            network.attach(Arc::new(server));
        }
        Self {
            network: Arc::new(network),
            listener: Arc::new(listener),
        }
    }

    pub fn dir(&self, host: &str) -> Arc<InMemoryDirectory> {
        self.network
            .directory(host, 389)
            .unwrap_or_else(|| panic!("no server {}", host))
    }

    pub fn enabler(&self) -> TopologyEnabler {
        self.enabler_through(self.network.clone())
    }

    /// An enabler dialing through `factory` instead of the bare network.
    pub fn enabler_through(&self, factory: Arc<dyn ConnectionFactory>) -> TopologyEnabler {
        let listener: Arc<dyn OperationListener> = self.listener.clone();
        TopologyEnabler::new(factory, ToolConfig::default()).with_listener(listener)
    }

    pub async fn client(&self, host: &str) -> ReplicationAdminClient {
        let conn = self.network.connect(&dm(host)).await.unwrap();
        ReplicationAdminClient::new(conn, format!("{}:389", host))
    }

    /// Ids registered in the administration data of `host`.
    pub async fn registry(&self, host: &str) -> BTreeSet<String> {
        let client = self.client(host).await;
        let registry = AdminRegistry::new(client.connection().clone(), client.address());
        let ids = registry
            .read_server_registry()
            .await
            .map(|servers| servers.iter().map(|s| s.id()).collect())
            .unwrap_or_default();
        client.connection().close().await;
        ids
    }

    pub async fn domain(&self, host: &str, base_dn: &str) -> Option<DomainConfig> {
        let client = self.client(host).await;
        let domain = client.find_domain(&Dn::new(base_dn)).await.unwrap();
        client.connection().close().await;
        domain
    }

    pub async fn replication_server(&self, host: &str) -> Option<ReplicationServerConfig> {
        let client = self.client(host).await;
        let rs = client.read_replication_server().await.unwrap();
        client.connection().close().await;
        rs
    }

    pub fn open_connections(&self, hosts: &[&str]) -> usize {
        hosts.iter().map(|h| self.dir(h).open_connections()).sum()
    }
}

/// Refuses anything but LDAPS towards `host`.
pub struct LdapsOnly {
    pub network: Arc<InMemoryNetwork>,
    pub host: String,
}

#[async_trait]
impl ConnectionFactory for LdapsOnly {
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn DirectoryConnection>, DirectoryError> {
        if params.host.eq_ignore_ascii_case(&self.host) && params.protocol != Protocol::Ldaps {
            return Err(DirectoryError::Connect {
                address: params.address(),
                reason: "only LDAPS is accepted".to_string(),
            });
        }
        self.network.connect(params).await
    }
}

pub fn dm(host: &str) -> ConnectionParams {
    ConnectionParams::new(host, 389).with_credentials(DM, DM_PASSWORD)
}

pub fn dm_ldaps(host: &str, port: u16) -> ConnectionParams {
    ConnectionParams::new(host, port)
        .with_protocol(Protocol::Ldaps)
        .with_credentials(DM, DM_PASSWORD)
}

pub fn rs(host: &str) -> String {
    format!("{}:{}", host, REPLICATION_PORT)
}

pub fn enable_request(first: &str, second: &str, base_dns: &[&str]) -> EnableRequest {
    EnableRequest {
        first: ServerEndpoint::new(dm(first), REPLICATION_PORT),
        second: ServerEndpoint::new(dm(second), REPLICATION_PORT),
        base_dns: base_dns.iter().map(|dn| Dn::new(*dn)).collect(),
        administrator: AdministratorProperties::new(ADMIN_UID, ADMIN_PASSWORD),
        replicate_schema: None,
        schema_source: AdsSide::First,
    }
}

pub fn enable(first: &str, second: &str) -> OperationRequest {
    OperationRequest::enable(enable_request(first, second, &[SUFFIX])).unwrap()
}
