#![warn(missing_docs)]

//! Directory replication topology: admits servers into a multi-master
//! topology, reconciles their administration data and drives the
//! suffix-initialization task protocol.

pub mod admin_client;
pub mod ads;
pub mod config;
pub mod configurator;
pub mod directory;
pub mod dn;
pub mod enabler;
pub mod error;
pub mod generation;
pub mod ids;
pub mod initializer;
pub mod listener;
pub mod memory;
pub mod peers;
pub mod reconcile;
pub mod request;
pub mod server;
pub mod status;
pub mod task;
pub mod telemetry;
pub mod topology;

pub use config::{LogFormat, LoggingConfig, ToolConfig};
pub use directory::{ConnectionFactory, ConnectionParams, DirectoryConnection, DirectoryError};
pub use dn::Dn;
pub use enabler::{return_code, OperationReport, TopologyEnabler};
pub use error::{ReplError, Result, ReturnCode};
pub use listener::{LoggingListener, OperationListener, ProgressEvent, RecordingListener};
pub use request::{
    DisableRequest, EnableRequest, ExternalInitializationRequest, InitializeAllRequest,
    InitializeRequest, OperationRequest, ServerEndpoint, StatusRequest,
};
pub use status::StatusReport;
pub use topology::TopologyCache;
