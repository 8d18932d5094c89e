//! Online suffix initialization.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::admin_client::ReplicationAdminClient;
use crate::dn::Dn;
use crate::error::{ReplError, Result};
use crate::listener::{OperationListener, ProgressEvent};
use crate::task::{TaskFailure, TaskKind, TaskOutcome, TaskRunner, TaskSettings};

/// Drives initialization tasks and their peer-not-found retries.
pub struct SuffixInitializer<'a> {
    settings: &'a TaskSettings,
    listener: &'a dyn OperationListener,
    cancel: &'a CancellationToken,
}

impl<'a> SuffixInitializer<'a> {
    /// An initializer using `settings` for polling and retries.
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

    /// One attempt: `destination` pulls `base_dn` from the replica whose
    /// domain id is `source_domain_id`.
    pub async fn initialize(
        &self,
        destination: &ReplicationAdminClient,
        base_dn: &Dn,
        source_domain_id: u32,
    ) -> Result<TaskOutcome> {
        let kind = TaskKind::InitializeFromSource {
            base_dn: base_dn.clone(),
            source_server_id: source_domain_id,
        };
        self.run_once(destination, &kind).await
    }

    /// [`SuffixInitializer::initialize`] retried while the peer is not found.
    pub async fn initialize_with_retry(
        &self,
        destination: &ReplicationAdminClient,
        base_dn: &Dn,
        source_domain_id: u32,
    ) -> Result<TaskOutcome> {
        self.settings
            .retry
            .run(self.cancel, self.listener, |_| {
                self.initialize(destination, base_dn, source_domain_id)
            })
            .await
    }

    /// `source` pushes `base_dn` to every replica it is connected to,
    /// retried while the peers are not found.
    pub async fn initialize_all(
        &self,
        source: &ReplicationAdminClient,
        base_dn: &Dn,
    ) -> Result<TaskOutcome> {
        let kind = TaskKind::InitializeAll {
            base_dn: base_dn.clone(),
        };
        self.settings
            .retry
            .run(self.cancel, self.listener, |_| self.run_once(source, &kind))
            .await
    }

    async fn run_once(&self, client: &ReplicationAdminClient, kind: &TaskKind) -> Result<TaskOutcome> {
        let runner = TaskRunner::new(client, self.settings, self.listener, self.cancel);
        let base_dn = kind.base_dn();
        match runner.run(kind).await {
            Ok(outcome) => {
                if let TaskOutcome::CompletedWithErrors { last_log } = &outcome {
                    let message = format!(
                        "initialization of {} on {} completed with errors: {}",
                        base_dn,
                        client.address(),
                        last_log.as_deref().unwrap_or("see the server error log")
                    );
                    warn!(address = %client.address(), base_dn = %base_dn, "{}", message);
                    self.listener.on_event(&ProgressEvent::Warning { message });
                } else {
                    info!(address = %client.address(), base_dn = %base_dn, "suffix initialized");
                    self.listener.on_event(&ProgressEvent::Step {
                        description: format!("{} initialized on {}", base_dn, client.address()),
                    });
                }
                Ok(outcome)
            }
            Err(failure) => Err(initialization_error(failure, client.address(), base_dn)),
        }
    }
}

fn initialization_error(failure: TaskFailure, address: &str, base_dn: &Dn) -> ReplError {
    match failure {
        TaskFailure::Cancelled => ReplError::Cancelled,
        TaskFailure::PeerNotFound { last_log } => ReplError::PeerNotFound {
            address: address.to_string(),
            base_dn: base_dn.to_string(),
            last_log,
        },
        other => ReplError::Initializing {
            address: address.to_string(),
            base_dn: base_dn.to_string(),
            detail: other.detail(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{ConnectionFactory, ConnectionParams};
    use crate::error::ReturnCode;
    use crate::listener::RecordingListener;
    use crate::memory::{InMemoryDirectory, InMemoryNetwork, TaskBehavior};
    use std::sync::Arc;

    async fn setup(behaviors: Vec<TaskBehavior>) -> (Arc<InMemoryDirectory>, ReplicationAdminClient) {
        let dir = Arc::new(InMemoryDirectory::new("ldap2", 389).with_root_user("cn=dm", "pw"));
        for behavior in behaviors {
            dir.push_task_behavior(behavior).await;
        }
        let mut net = InMemoryNetwork::new();
        net.attach(dir.clone());
        let conn = net
            .connect(&ConnectionParams::new("ldap2", 389).with_credentials("cn=dm", "pw"))
            .await
            .unwrap();
        (dir, ReplicationAdminClient::new(conn, "ldap2:389"))
    }

    fn base() -> Dn {
        Dn::new("dc=example,dc=com")
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_not_found_retried_until_success() {
        let (dir, client) = setup(vec![
            TaskBehavior::PeerNotFound,
            TaskBehavior::StopWithoutLog,
            TaskBehavior::Succeed { entries: 10 },
        ])
        .await;
        let settings = TaskSettings::default();
        let listener = RecordingListener::new();
        let cancel = CancellationToken::new();
        let initializer = SuffixInitializer::new(&settings, &listener, &cancel);

        let outcome = initializer.initialize_with_retry(&client, &base(), 4).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);
        let tasks = dir.created_tasks().await;
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].first("ds-task-initialize-replica-server-id"), Some("4"));
        let retries = listener
            .events()
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Retrying { .. }))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let (dir, client) = setup(vec![TaskBehavior::PeerNotFound; 6]).await;
        let settings = TaskSettings::default();
        let listener = RecordingListener::new();
        let cancel = CancellationToken::new();
        let initializer = SuffixInitializer::new(&settings, &listener, &cancel);

        let err = initializer
            .initialize_with_retry(&client, &base(), 4)
            .await
            .unwrap_err();
        assert_eq!(err.return_code(), ReturnCode::InitializingTriesCompleted);
        assert_eq!(dir.created_tasks().await.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_carries_log_line() {
        let (dir, client) = setup(vec![TaskBehavior::Fail {
            log: "import aborted: disk full".to_string(),
        }])
        .await;
        let settings = TaskSettings::default();
        let listener = RecordingListener::new();
        let cancel = CancellationToken::new();
        let initializer = SuffixInitializer::new(&settings, &listener, &cancel);

        match initializer.initialize_with_retry(&client, &base(), 4).await {
            Err(ReplError::Initializing { detail, address, .. }) => {
                assert_eq!(detail, "import aborted: disk full");
                assert_eq!(address, "ldap2:389");
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(dir.created_tasks().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_with_errors_is_a_warning() {
        let (_dir, client) = setup(vec![TaskBehavior::CompleteWithErrors {
            log: "2 entries rejected".to_string(),
        }])
        .await;
        let settings = TaskSettings::default();
        let listener = RecordingListener::new();
        let cancel = CancellationToken::new();
        let initializer = SuffixInitializer::new(&settings, &listener, &cancel);

        let outcome = initializer.initialize(&client, &base(), 4).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::CompletedWithErrors { .. }));
        assert_eq!(listener.warnings().len(), 1);
        assert!(listener.warnings()[0].contains("2 entries rejected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_all_targets_every_peer() {
        let (dir, client) = setup(vec![]).await;
        let settings = TaskSettings::default();
        let listener = RecordingListener::new();
        let cancel = CancellationToken::new();
        let initializer = SuffixInitializer::new(&settings, &listener, &cancel);

        initializer.initialize_all(&client, &base()).await.unwrap();
        let tasks = dir.created_tasks().await;
        assert_eq!(tasks[0].first("ds-task-initialize-replica-server-id"), Some("all"));
        assert!(tasks[0].first("ds-task-id").unwrap().contains("initialize-all"));
    }
}
