//! Operation requests, validated at construction.

use serde::{Deserialize, Serialize};

use crate::ads::AdministratorProperties;
use crate::directory::ConnectionParams;
use crate::dn::Dn;
use crate::error::{ReplError, Result};
use crate::reconcile::AdsSide;

/// A node to be made part of the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// How to reach it.
    pub connection: ConnectionParams,
    /// Replication port to use if it is not a replication server yet.
    pub replication_port: u16,
    /// Encrypt replication traffic.
    pub secure_replication: bool,
}

impl ServerEndpoint {
    /// Endpoint with plain replication.
    pub fn new(connection: ConnectionParams, replication_port: u16) -> Self {
        Self {
            connection,
            replication_port,
            secure_replication: false,
        }
    }

    /// Set replication encryption.
    pub fn with_secure_replication(mut self, secure: bool) -> Self {
        self.secure_replication = secure;
        self
    }
}

/// Enable replication between two nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnableRequest {
    /// First node.
    pub first: ServerEndpoint,
    /// Second node.
    pub second: ServerEndpoint,
    /// Suffixes to replicate.
    pub base_dns: Vec<Dn>,
    /// Global administrator, created where missing.
    pub administrator: AdministratorProperties,
    /// Also replicate the schema; `None` follows `ToolConfig::replicate_schema`.
    pub replicate_schema: Option<bool>,
    /// Node whose schema wins when the two differ.
    pub schema_source: AdsSide,
}

/// Disable replication on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisableRequest {
    /// Node to detach.
    pub server: ConnectionParams,
    /// Suffixes to stop replicating.
    pub base_dns: Vec<Dn>,
    /// Stop replicating every suffix and drop the replication server.
    pub disable_all: bool,
}

/// Copy suffixes from one node to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeRequest {
    /// Node holding the data.
    pub source: ConnectionParams,
    /// Node to overwrite.
    pub destination: ConnectionParams,
    /// Suffixes to copy.
    pub base_dns: Vec<Dn>,
}

/// Push suffixes from one node to every other replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeAllRequest {
    /// Node holding the data.
    pub source: ConnectionParams,
    /// Suffixes to push.
    pub base_dns: Vec<Dn>,
}

/// Bracket an offline copy of suffixes on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalInitializationRequest {
    /// Node whose suffixes are copied.
    pub server: ConnectionParams,
    /// Suffixes concerned.
    pub base_dns: Vec<Dn>,
}

/// Report the replication state seen from one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRequest {
    /// Node whose administration data is read.
    pub server: ConnectionParams,
    /// Suffixes to report; all when empty.
    pub base_dns: Vec<Dn>,
}

/// Everything the engine can be asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRequest {
    /// Join two nodes.
    Enable(EnableRequest),
    /// Detach one node.
    Disable(DisableRequest),
    /// Copy from a named source.
    Initialize(InitializeRequest),
    /// Copy to every peer.
    InitializeAll(InitializeAllRequest),
    /// Mark suffixes before an offline copy.
    PreExternalInitialization(ExternalInitializationRequest),
    /// Recompute generation ids after an offline copy.
    PostExternalInitialization(ExternalInitializationRequest),
    /// Report.
    Status(StatusRequest),
}

fn user_data(msg: impl Into<String>) -> ReplError {
    ReplError::UserData { msg: msg.into() }
}

fn check_connection(params: &ConnectionParams, role: &str) -> Result<()> {
    if params.host.trim().is_empty() {
        return Err(user_data(format!("{} host is empty", role)));
    }
    if params.port == 0 {
        return Err(user_data(format!("{} port must not be 0", role)));
    }
    Ok(())
}

fn check_base_dns(base_dns: &[Dn]) -> Result<()> {
    if base_dns.is_empty() {
        return Err(user_data("no base DN given"));
    }
    if let Some(root) = base_dns.iter().find(|dn| dn.is_root()) {
        return Err(user_data(format!("invalid base DN '{}'", root)));
    }
    Ok(())
}

fn same_server(a: &ConnectionParams, b: &ConnectionParams) -> bool {
    a.host.eq_ignore_ascii_case(&b.host) && a.port == b.port
}

impl OperationRequest {
    /// Validated enable request.
    pub fn enable(request: EnableRequest) -> Result<Self> {
        let request = OperationRequest::Enable(request);
        request.validate()?;
        Ok(request)
    }

    /// Validated disable request.
    pub fn disable(request: DisableRequest) -> Result<Self> {
        let request = OperationRequest::Disable(request);
        request.validate()?;
        Ok(request)
    }

    /// Validated initialize request.
    pub fn initialize(request: InitializeRequest) -> Result<Self> {
        let request = OperationRequest::Initialize(request);
        request.validate()?;
        Ok(request)
    }

    /// Validated initialize-all request.
    pub fn initialize_all(request: InitializeAllRequest) -> Result<Self> {
        let request = OperationRequest::InitializeAll(request);
        request.validate()?;
        Ok(request)
    }

    /// Validated pre-external-initialization request.
    pub fn pre_external_initialization(request: ExternalInitializationRequest) -> Result<Self> {
        let request = OperationRequest::PreExternalInitialization(request);
        request.validate()?;
        Ok(request)
    }

    /// Validated post-external-initialization request.
    pub fn post_external_initialization(request: ExternalInitializationRequest) -> Result<Self> {
        let request = OperationRequest::PostExternalInitialization(request);
        request.validate()?;
        Ok(request)
    }

    /// Validated status request.
    pub fn status(request: StatusRequest) -> Result<Self> {
        let request = OperationRequest::Status(request);
        request.validate()?;
        Ok(request)
    }

    /// Operation name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            OperationRequest::Enable(_) => "enable",
            OperationRequest::Disable(_) => "disable",
            OperationRequest::Initialize(_) => "initialize",
            OperationRequest::InitializeAll(_) => "initialize-all",
            OperationRequest::PreExternalInitialization(_) => "pre-external-initialization",
            OperationRequest::PostExternalInitialization(_) => "post-external-initialization",
            OperationRequest::Status(_) => "status",
        }
    }

    /// Check the request is self-consistent.
    pub fn validate(&self) -> Result<()> {
        match self {
            OperationRequest::Enable(r) => {
                check_connection(&r.first.connection, "first server")?;
                check_connection(&r.second.connection, "second server")?;
                if same_server(&r.first.connection, &r.second.connection) {
                    return Err(user_data(format!(
                        "both servers are {}",
                        r.first.connection.address()
                    )));
                }
                for endpoint in [&r.first, &r.second] {
                    if endpoint.replication_port == 0 {
                        return Err(user_data(format!(
                            "replication port of {} must not be 0",
                            endpoint.connection.address()
                        )));
                    }
                    if endpoint.replication_port == endpoint.connection.port {
                        return Err(user_data(format!(
                            "replication port of {} is its LDAP port",
                            endpoint.connection.address()
                        )));
                    }
                }
                if r.administrator.uid.trim().is_empty() {
                    return Err(user_data("global administrator uid is empty"));
                }
                check_base_dns(&r.base_dns)
            }
            OperationRequest::Disable(r) => {
                check_connection(&r.server, "server")?;
                if r.disable_all {
                    Ok(())
                } else {
                    check_base_dns(&r.base_dns)
                }
            }
            OperationRequest::Initialize(r) => {
                check_connection(&r.source, "source")?;
                check_connection(&r.destination, "destination")?;
                if same_server(&r.source, &r.destination) {
                    return Err(user_data("source and destination are the same server"));
                }
                check_base_dns(&r.base_dns)
            }
            OperationRequest::InitializeAll(r) => {
                check_connection(&r.source, "source")?;
                check_base_dns(&r.base_dns)
            }
            OperationRequest::PreExternalInitialization(r)
            | OperationRequest::PostExternalInitialization(r) => {
                check_connection(&r.server, "server")?;
                check_base_dns(&r.base_dns)
            }
            OperationRequest::Status(r) => check_connection(&r.server, "server"),
        }
    }
}
