//! Progress reporting to the caller.

use serde::Serialize;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::task::TaskState;
use crate::topology::TopologyCacheException;

/// Something the caller may want to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ProgressEvent {
    /// A configuration step began.
    Step {
        /// Human readable description.
        description: String,
    },
    /// A non-fatal problem.
    Warning {
        /// Human readable description.
        message: String,
    },
    /// A task entry was created.
    TaskCreated {
        /// host:port of the server running it.
        address: String,
        /// Task id.
        task_id: String,
    },
    /// Entry counts of a running task.
    TaskProgress {
        /// host:port of the server running it.
        address: String,
        /// Task id.
        task_id: String,
        /// Entries processed so far.
        processed: u64,
        /// Entries left.
        unprocessed: u64,
        /// Completion percentage, when the total is non-zero.
        percent: Option<u8>,
    },
    /// The task log changed.
    TaskLog {
        /// host:port of the server running it.
        address: String,
        /// Task id.
        task_id: String,
        /// Newest log line.
        line: String,
    },
    /// The task reached a terminal state.
    TaskFinished {
        /// host:port of the server running it.
        address: String,
        /// Task id.
        task_id: String,
        /// Final state; `None` when the entry vanished.
        state: Option<TaskState>,
    },
    /// An initialization is about to be retried.
    Retrying {
        /// host:port of the server running it.
        address: String,
        /// Base DN being initialized.
        base_dn: String,
        /// Attempt about to start.
        attempt: u32,
        /// Wait before it, in milliseconds.
        delay_ms: u64,
    },
}

/// Receives progress and answers questions during an operation.
pub trait OperationListener: Send + Sync {
    /// Report an event.
    fn on_event(&self, event: &ProgressEvent);

    /// Whether to go on despite servers that could not be read.
    fn confirm_discovery_errors(&self, errors: &[TopologyCacheException]) -> bool {
        errors.is_empty()
    }
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Default)]
pub struct LoggingListener {
    accept_discovery_errors: bool,
}

impl LoggingListener {
    /// `accept_discovery_errors` answers every discovery confirmation.
    pub fn new(accept_discovery_errors: bool) -> Self {
        Self {
            accept_discovery_errors,
        }
    }
}

impl OperationListener for LoggingListener {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Step { description } => info!("{}", description),
            ProgressEvent::Warning { message } => warn!("{}", message),
            ProgressEvent::TaskCreated { address, task_id } => {
                info!(address = %address, task_id = %task_id, "task created")
            }
            ProgressEvent::TaskProgress {
                address,
                task_id,
                processed,
                unprocessed,
                percent,
            } => info!(
                address = %address,
                task_id = %task_id,
                processed,
                unprocessed,
                percent = ?percent,
                "task progress"
            ),
            ProgressEvent::TaskLog {
                address,
                task_id,
                line,
            } => debug!(address = %address, task_id = %task_id, "{}", line),
            ProgressEvent::TaskFinished {
                address,
                task_id,
                state,
            } => info!(address = %address, task_id = %task_id, state = ?state, "task finished"),
            ProgressEvent::Retrying {
                address,
                base_dn,
                attempt,
                delay_ms,
            } => warn!(
                address = %address,
                base_dn = %base_dn,
                attempt,
                delay_ms,
                "peer not found, retrying initialization"
            ),
        }
    }

    fn confirm_discovery_errors(&self, errors: &[TopologyCacheException]) -> bool {
        for error in errors {
            warn!(address = %error.address, kind = %error.kind, "{}", error);
        }
        errors.is_empty() || self.accept_discovery_errors
    }
}

/// Keeps every event; used by tests and by callers that render later.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ProgressEvent>>,
    accept_discovery_errors: bool,
}

impl RecordingListener {
    /// A recorder that refuses discovery errors.
    pub fn new() -> Self {
        Self::default()
    }

    /// A recorder that accepts discovery errors.
    pub fn accepting_discovery_errors() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            accept_discovery_errors: true,
        }
    }

    /// Events so far.
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Warning messages so far.
    pub fn warnings(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Warning { message } => Some(message),
                _ => None,
            })
            .collect()
    }
}

impl OperationListener for RecordingListener {
    fn on_event(&self, event: &ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }

    fn confirm_discovery_errors(&self, errors: &[TopologyCacheException]) -> bool {
        errors.is_empty() || self.accept_discovery_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{ConnectionParams, DirectoryError};

    fn exception() -> TopologyCacheException {
        TopologyCacheException::connecting(
            &ConnectionParams::new("c", 389),
            DirectoryError::Connect {
                address: "c:389".to_string(),
                reason: "refused".to_string(),
            },
        )
    }

    #[test]
    fn test_recording_listener_keeps_order() {
        let listener = RecordingListener::new();
        listener.on_event(&ProgressEvent::Step {
            description: "one".to_string(),
        });
        listener.on_event(&ProgressEvent::Warning {
            message: "two".to_string(),
        });
        assert_eq!(listener.events().len(), 2);
        assert_eq!(listener.warnings(), vec!["two".to_string()]);
    }

    #[test]
    fn test_discovery_confirmation() {
        let errors = vec![exception()];
        assert!(!RecordingListener::new().confirm_discovery_errors(&errors));
        assert!(RecordingListener::new().confirm_discovery_errors(&[]));
        assert!(RecordingListener::accepting_discovery_errors().confirm_discovery_errors(&errors));
        assert!(!LoggingListener::new(false).confirm_discovery_errors(&errors));
        assert!(LoggingListener::new(true).confirm_discovery_errors(&errors));
    }
}
