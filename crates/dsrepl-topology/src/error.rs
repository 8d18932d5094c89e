//! Error types for replication topology operations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::directory::DirectoryError;

/// Closed set of result codes handed back to the front-ends.
///
/// The numeric values are stable and double as process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReturnCode {
    /// The operation completed.
    Successful = 0,
    /// The caller cancelled the operation.
    UserCancelled = 1,
    /// A node could not be reached or bound to.
    ErrorConnecting = 2,
    /// The request itself is inconsistent.
    ErrorUserData = 3,
    /// None of the requested base DNs can be replicated.
    ReplicationCannotBeEnabledOnBaseDn = 4,
    /// None of the requested base DNs are replicated on the node.
    ReplicationCannotBeDisabledOnBaseDn = 5,
    /// None of the requested base DNs can be initialized.
    ReplicationCannotBeInitializedOnBaseDn = 6,
    /// The administration data could not be read.
    ErrorReadingAds = 7,
    /// The administration data could not be updated.
    ErrorUpdatingAds = 8,
    /// Topology discovery failed or was refused by the caller.
    ErrorReadingTopologyCache = 9,
    /// A replication server object could not be committed.
    ErrorConfiguringReplicationServer = 10,
    /// A replication domain could not be committed.
    ErrorEnablingReplicationOnBaseDn = 11,
    /// A replication domain could not be removed.
    ErrorDisablingReplicationOnBaseDn = 12,
    /// A peer reference to the disabled node could not be removed.
    ErrorDisablingReplicationRemovingReferences = 13,
    /// An initialization task failed.
    ErrorInitializingBaseDn = 14,
    /// Initialization kept failing with peer-not-found.
    InitializingTriesCompleted = 15,
    /// Both nodes carry divergent administration data.
    ReplicationAdsMergeNotSupported = 16,
    /// Trusted certificates could not be copied.
    ErrorSeedingTrustStore = 17,
    /// The pre-external-initialization task failed.
    ErrorLaunchingPreExternalInitialization = 18,
    /// The post-external-initialization task failed.
    ErrorLaunchingPostExternalInitialization = 19,
    /// No free replication identifier is left.
    ErrorAllocatingId = 20,
    /// A reachable node's configuration could not be read.
    ErrorReadingConfiguration = 21,
}

impl ReturnCode {
    /// Numeric value of the code.
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Errors raised by topology operations.
///
/// Every variant carries the node (and base DN where relevant) it happened
/// on, so a failure can be diagnosed without re-running the operation.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Cancellation was requested between two steps.
    #[error("operation cancelled")]
    Cancelled,

    /// A node could not be reached.
    #[error("error connecting to {address}: {source}")]
    Connecting {
        /// host:port of the node.
        address: String,
        /// Transport error.
        #[source]
        source: DirectoryError,
    },

    /// Neither node of a pair could be reached.
    #[error("error connecting to {first_address} ({first}) and to {second_address} ({second})")]
    ConnectingBoth {
        /// host:port of the first node.
        first_address: String,
        /// Its transport error.
        first: DirectoryError,
        /// host:port of the second node.
        second_address: String,
        /// Its transport error.
        second: DirectoryError,
    },

    /// The request is inconsistent.
    #[error("invalid request: {msg}")]
    UserData {
        /// What is wrong with the request.
        msg: String,
    },

    /// Reading a node's configuration failed after connecting.
    #[error("error reading configuration of {address}: {source}")]
    ReadingConfiguration {
        /// host:port of the node.
        address: String,
        /// Transport error.
        #[source]
        source: DirectoryError,
    },

    /// No requested base DN survived filtering for enable.
    #[error("replication cannot be enabled on any of the base DNs: {base_dns}")]
    CannotEnableOnBaseDn {
        /// Requested base DNs, comma separated.
        base_dns: String,
    },

    /// No requested base DN survived filtering for disable.
    #[error("replication cannot be disabled on any of the base DNs: {base_dns}")]
    CannotDisableOnBaseDn {
        /// Requested base DNs, comma separated.
        base_dns: String,
    },

    /// No requested base DN survived filtering for initialization.
    #[error("none of the base DNs can be initialized: {base_dns}")]
    CannotInitializeOnBaseDn {
        /// Requested base DNs, comma separated.
        base_dns: String,
    },

    /// Administration data could not be read.
    #[error("error reading administration data on {address}: {source}")]
    ReadingAds {
        /// host:port of the node.
        address: String,
        /// Transport error.
        #[source]
        source: DirectoryError,
    },

    /// Administration data could not be written.
    #[error("error updating administration data on {address}: {source}")]
    UpdatingAds {
        /// host:port of the node.
        address: String,
        /// Transport error.
        #[source]
        source: DirectoryError,
    },

    /// Topology discovery left errors the caller did not accept.
    #[error("error reading the topology: {summary}")]
    ReadingTopologyCache {
        /// One line per failing server.
        summary: String,
    },

    /// Committing the replication server object failed.
    #[error("error configuring replication server on {address}: {source}")]
    ConfiguringReplicationServer {
        /// host:port of the node.
        address: String,
        /// Transport error.
        #[source]
        source: DirectoryError,
    },

    /// Committing a replication domain failed.
    #[error("error enabling replication of {base_dn} on {address}: {source}")]
    EnablingReplicationOnBaseDn {
        /// host:port of the node.
        address: String,
        /// Base DN being configured.
        base_dn: String,
        /// Transport error.
        #[source]
        source: DirectoryError,
    },

    /// Removing a replication domain failed.
    #[error("error disabling replication of {base_dn} on {address}: {source}")]
    DisablingReplicationOnBaseDn {
        /// host:port of the node.
        address: String,
        /// Base DN being disabled.
        base_dn: String,
        /// Transport error.
        #[source]
        source: DirectoryError,
    },

    /// Removing references to a disabled node failed.
    #[error("error removing references to {removed} on {address}: {source}")]
    RemovingReferences {
        /// host:port of the node being updated.
        address: String,
        /// Replication server address being removed.
        removed: String,
        /// Transport error.
        #[source]
        source: DirectoryError,
    },

    /// An initialization task failed for good.
    #[error("error initializing {base_dn} on {address}: {detail}")]
    Initializing {
        /// host:port of the node running the task.
        address: String,
        /// Base DN being initialized.
        base_dn: String,
        /// Last task log line, or the creation failure.
        detail: String,
    },

    /// The task stopped before the peer was reachable; retryable.
    #[error("peer not found while initializing {base_dn} on {address}")]
    PeerNotFound {
        /// host:port of the node running the task.
        address: String,
        /// Base DN being initialized.
        base_dn: String,
        /// Last task log line, if any.
        last_log: Option<String>,
    },

    /// Retries on peer-not-found were exhausted.
    #[error("initialization of {base_dn} on {address} still failing after {attempts} attempts")]
    InitializingTriesCompleted {
        /// host:port of the node running the task.
        address: String,
        /// Base DN being initialized.
        base_dn: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Both nodes have their own, different administration data.
    #[error("cannot merge the administration data of {first} and {second}")]
    AdsMergeNotSupported {
        /// host:port of the first node.
        first: String,
        /// host:port of the second node.
        second: String,
    },

    /// Copying trusted certificates failed.
    #[error("error seeding trust store of {address}: {source}")]
    SeedingTrustStore {
        /// host:port of the node.
        address: String,
        /// Transport error.
        #[source]
        source: DirectoryError,
    },

    /// The pre-external-initialization task failed.
    #[error("error launching pre external initialization of {base_dn} on {address}: {detail}")]
    PreExternalInitialization {
        /// host:port of the node.
        address: String,
        /// Base DN.
        base_dn: String,
        /// Failure description.
        detail: String,
    },

    /// The post-external-initialization task failed.
    #[error("error launching post external initialization of {base_dn} on {address}: {detail}")]
    PostExternalInitialization {
        /// host:port of the node.
        address: String,
        /// Base DN.
        base_dn: String,
        /// Failure description.
        detail: String,
    },

    /// The identifier space is full.
    #[error("no free {kind} identifier left")]
    IdSpaceExhausted {
        /// Which identifier space.
        kind: &'static str,
    },
}

impl ReplError {
    /// Map the error onto the closed result-code set.
    pub fn return_code(&self) -> ReturnCode {
        match self {
            ReplError::Cancelled => ReturnCode::UserCancelled,
            ReplError::Connecting { .. } | ReplError::ConnectingBoth { .. } => {
                ReturnCode::ErrorConnecting
            }
            ReplError::UserData { .. } => ReturnCode::ErrorUserData,
            ReplError::ReadingConfiguration { .. } => ReturnCode::ErrorReadingConfiguration,
            ReplError::CannotEnableOnBaseDn { .. } => ReturnCode::ReplicationCannotBeEnabledOnBaseDn,
            ReplError::CannotDisableOnBaseDn { .. } => {
                ReturnCode::ReplicationCannotBeDisabledOnBaseDn
            }
            ReplError::CannotInitializeOnBaseDn { .. } => {
                ReturnCode::ReplicationCannotBeInitializedOnBaseDn
            }
            ReplError::ReadingAds { .. } => ReturnCode::ErrorReadingAds,
            ReplError::UpdatingAds { .. } => ReturnCode::ErrorUpdatingAds,
            ReplError::ReadingTopologyCache { .. } => ReturnCode::ErrorReadingTopologyCache,
            ReplError::ConfiguringReplicationServer { .. } => {
                ReturnCode::ErrorConfiguringReplicationServer
            }
            ReplError::EnablingReplicationOnBaseDn { .. } => {
                ReturnCode::ErrorEnablingReplicationOnBaseDn
            }
            ReplError::DisablingReplicationOnBaseDn { .. } => {
                ReturnCode::ErrorDisablingReplicationOnBaseDn
            }
            ReplError::RemovingReferences { .. } => {
                ReturnCode::ErrorDisablingReplicationRemovingReferences
            }
            ReplError::Initializing { .. } => ReturnCode::ErrorInitializingBaseDn,
            ReplError::PeerNotFound { .. } | ReplError::InitializingTriesCompleted { .. } => {
                ReturnCode::InitializingTriesCompleted
            }
            ReplError::AdsMergeNotSupported { .. } => ReturnCode::ReplicationAdsMergeNotSupported,
            ReplError::SeedingTrustStore { .. } => ReturnCode::ErrorSeedingTrustStore,
            ReplError::PreExternalInitialization { .. } => {
                ReturnCode::ErrorLaunchingPreExternalInitialization
            }
            ReplError::PostExternalInitialization { .. } => {
                ReturnCode::ErrorLaunchingPostExternalInitialization
            }
            ReplError::IdSpaceExhausted { .. } => ReturnCode::ErrorAllocatingId,
        }
    }
}

/// Result alias for topology operations.
pub type Result<T> = std::result::Result<T, ReplError>;
