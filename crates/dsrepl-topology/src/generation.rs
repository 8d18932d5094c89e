//! Generation id resets around an offline copy.
//!
//! Before data is copied between servers by external means the generation
//! id of the suffix is set to "undefined" so replication refuses to run
//! against the half-copied replica. Afterwards it is reset without a value
//! so each server recomputes it from the copied data.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::admin_client::ReplicationAdminClient;
use crate::dn::Dn;
use crate::error::{ReplError, Result};
use crate::listener::{OperationListener, ProgressEvent};
use crate::task::{TaskFailure, TaskKind, TaskOutcome, TaskRunner, TaskSettings};

/// Value the generation id is reset to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationId {
    /// Marks the replica as needing initialization.
    Undefined,
    /// A specific value.
    Value(i64),
    /// Let the server compute it from its data.
    Recompute,
}

impl GenerationId {
    /// Wire value of `Undefined`.
    pub const UNDEFINED: i64 = -1;

    fn task_value(self) -> Option<i64> {
        match self {
            GenerationId::Undefined => Some(Self::UNDEFINED),
            GenerationId::Value(v) => Some(v),
            GenerationId::Recompute => None,
        }
    }
}

/// Which side of the offline copy a reset belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalInitializationPhase {
    /// Before the copy.
    Pre,
    /// After the copy.
    Post,
}

/// Runs reset-generation-id tasks.
pub struct GenerationIdResetter<'a> {
    settings: &'a TaskSettings,
    listener: &'a dyn OperationListener,
    cancel: &'a CancellationToken,
}

impl<'a> GenerationIdResetter<'a> {
    /// A resetter using `settings` for polling.
    pub fn new(
        settings: &'a TaskSettings,
        listener: &'a dyn OperationListener,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            settings,
            listener,
            cancel,
        }
    }

    /// Reset the generation id of `base_dn` on the server behind `client`.
    pub async fn reset(
        &self,
        client: &ReplicationAdminClient,
        base_dn: &Dn,
        value: GenerationId,
        phase: ExternalInitializationPhase,
    ) -> Result<TaskOutcome> {
        let kind = TaskKind::ResetGenerationId {
            base_dn: base_dn.clone(),
            value: value.task_value(),
        };
        let runner = TaskRunner::new(client, self.settings, self.listener, self.cancel);
        match runner.run(&kind).await {
            Ok(outcome) => {
                if let TaskOutcome::CompletedWithErrors { last_log } = &outcome {
                    self.listener.on_event(&ProgressEvent::Warning {
                        message: format!(
                            "generation id reset of {} on {} completed with errors: {}",
                            base_dn,
                            client.address(),
                            last_log.as_deref().unwrap_or("see the server error log")
                        ),
                    });
                }
                info!(address = %client.address(), base_dn = %base_dn, value = ?value, "generation id reset");
                Ok(outcome)
            }
            Err(TaskFailure::Cancelled) => Err(ReplError::Cancelled),
            Err(failure) => {
                let address = client.address().to_string();
                let base_dn = base_dn.to_string();
                let detail = failure.detail();
                Err(match phase {
                    ExternalInitializationPhase::Pre => ReplError::PreExternalInitialization {
                        address,
                        base_dn,
                        detail,
                    },
                    ExternalInitializationPhase::Post => ReplError::PostExternalInitialization {
                        address,
                        base_dn,
                        detail,
                    },
                })
            }
        }
    }

    /// Mark `base_dn` as needing initialization before an offline copy.
    pub async fn pre_external_initialization(
        &self,
        client: &ReplicationAdminClient,
        base_dn: &Dn,
    ) -> Result<TaskOutcome> {
        self.reset(client, base_dn, GenerationId::Undefined, ExternalInitializationPhase::Pre)
            .await
    }

    /// Let the server recompute the generation id after an offline copy.
    pub async fn post_external_initialization(
        &self,
        client: &ReplicationAdminClient,
        base_dn: &Dn,
    ) -> Result<TaskOutcome> {
        self.reset(client, base_dn, GenerationId::Recompute, ExternalInitializationPhase::Post)
            .await
    }
}
