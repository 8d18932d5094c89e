//! Administrative task protocol.
//!
//! A task is an entry added under `cn=Scheduled Tasks,cn=Tasks`. The server
//! runs it asynchronously and reports progress through attributes of the
//! same entry, which the client polls until a terminal state is reached.
//! The server may purge a finished task at any time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admin_client::{layout, ReplicationAdminClient};
use crate::directory::{DirectoryError, Entry};
use crate::dn::{escape_value, Dn};
use crate::error::{ReplError, Result};
use crate::listener::{OperationListener, ProgressEvent};

/// Parent of every task entry.
pub const SCHEDULED_TASKS_DN: &str = "cn=Scheduled Tasks,cn=Tasks";

const ATTR_TASK_ID: &str = "ds-task-id";
const ATTR_TASK_CLASS: &str = "ds-task-class-name";
const ATTR_INITIALIZE_DOMAIN: &str = "ds-task-initialize-domain-dn";
const ATTR_INITIALIZE_SOURCE: &str = "ds-task-initialize-replica-server-id";
const ATTR_RESET_DOMAIN: &str = "ds-task-reset-generation-id-domain-base-dn";
const ATTR_RESET_VALUE: &str = "ds-task-reset-generation-id-new-value";

/// Server-side task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Not scheduled yet.
    Unscheduled,
    /// Disabled by an administrator.
    Disabled,
    /// Waiting for its start time.
    WaitingOnStartTime,
    /// Waiting for another task.
    WaitingOnDependency,
    /// Running.
    Running,
    /// Finished without problems.
    CompletedSuccessfully,
    /// Finished, but some entries failed.
    CompletedWithErrors,
    /// Interrupted by a server shutdown.
    StoppedByShutdown,
    /// Failed.
    StoppedByError,
    /// Interrupted by an administrator.
    StoppedByAdministrator,
    /// Cancelled before it started.
    CanceledBeforeStarting,
}

impl TaskState {
    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Unscheduled => "UNSCHEDULED",
            TaskState::Disabled => "DISABLED",
            TaskState::WaitingOnStartTime => "WAITING_ON_START_TIME",
            TaskState::WaitingOnDependency => "WAITING_ON_DEPENDENCY",
            TaskState::Running => "RUNNING",
            TaskState::CompletedSuccessfully => "COMPLETED_SUCCESSFULLY",
            TaskState::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            TaskState::StoppedByShutdown => "STOPPED_BY_SHUTDOWN",
            TaskState::StoppedByError => "STOPPED_BY_ERROR",
            TaskState::StoppedByAdministrator => "STOPPED_BY_ADMINISTRATOR",
            TaskState::CanceledBeforeStarting => "CANCELED_BEFORE_STARTING",
        }
    }

    /// Parse the wire spelling, ignoring case.
    pub fn parse(value: &str) -> Option<Self> {
        const ALL: [TaskState; 11] = [
            TaskState::Unscheduled,
            TaskState::Disabled,
            TaskState::WaitingOnStartTime,
            TaskState::WaitingOnDependency,
            TaskState::Running,
            TaskState::CompletedSuccessfully,
            TaskState::CompletedWithErrors,
            TaskState::StoppedByShutdown,
            TaskState::StoppedByError,
            TaskState::StoppedByAdministrator,
            TaskState::CanceledBeforeStarting,
        ];
        let value = value.trim();
        ALL.into_iter().find(|s| s.as_str().eq_ignore_ascii_case(value))
    }

    /// Terminal states.
    pub fn is_done(self) -> bool {
        matches!(
            self,
            TaskState::CompletedSuccessfully
                | TaskState::CompletedWithErrors
                | TaskState::StoppedByShutdown
                | TaskState::StoppedByError
                | TaskState::StoppedByAdministrator
                | TaskState::CanceledBeforeStarting
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Pull `base_dn` from the replica with domain id `source_server_id`.
    InitializeFromSource {
        /// Suffix to initialize.
        base_dn: Dn,
        /// Domain id of the source replica.
        source_server_id: u32,
    },
    /// Push `base_dn` to every other replica.
    InitializeAll {
        /// Suffix to push.
        base_dn: Dn,
    },
    /// Reset the generation id of `base_dn`; `None` lets the server
    /// recompute it from its data.
    ResetGenerationId {
        /// Suffix whose generation id is reset.
        base_dn: Dn,
        /// New value.
        value: Option<i64>,
    },
}

impl TaskKind {
    /// Suffix the task works on.
    pub fn base_dn(&self) -> &Dn {
        match self {
            TaskKind::InitializeFromSource { base_dn, .. }
            | TaskKind::InitializeAll { base_dn }
            | TaskKind::ResetGenerationId { base_dn, .. } => base_dn,
        }
    }

    /// Short name used in task ids.
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::InitializeFromSource { .. } => "initialize",
            TaskKind::InitializeAll { .. } => "initialize-all",
            TaskKind::ResetGenerationId { .. } => "reset-generation-id",
        }
    }

    fn object_class(&self) -> &'static str {
        match self {
            TaskKind::InitializeFromSource { .. } => "ds-task-initialize-from-remote-replica",
            TaskKind::InitializeAll { .. } => "ds-task-initialize-remote-replica",
            TaskKind::ResetGenerationId { .. } => "ds-task-reset-generation-id",
        }
    }

    fn class_name(&self) -> &'static str {
        match self {
            TaskKind::InitializeFromSource { .. } => "org.opends.server.tasks.InitializeTask",
            TaskKind::InitializeAll { .. } => "org.opends.server.tasks.InitializeTargetTask",
            TaskKind::ResetGenerationId { .. } => "org.opends.server.tasks.SetGenerationIdTask",
        }
    }

    /// Whether the server reports entry counts for this task.
    pub fn reports_progress(&self) -> bool {
        !matches!(self, TaskKind::ResetGenerationId { .. })
    }

    /// The entry to add for task `task_id`.
    pub fn entry(&self, task_id: &str) -> Entry {
        let dn = Dn::new(SCHEDULED_TASKS_DN).child(&format!("{}={}", ATTR_TASK_ID, escape_value(task_id)));
        let mut entry = Entry::new(dn)
            .with("objectclass", ["top", "ds-task", self.object_class()])
            .with(ATTR_TASK_ID, [task_id])
            .with(ATTR_TASK_CLASS, [self.class_name()]);
        match self {
            TaskKind::InitializeFromSource {
                base_dn,
                source_server_id,
            } => {
                entry.set(ATTR_INITIALIZE_DOMAIN, [base_dn.as_str()]);
                entry.set(ATTR_INITIALIZE_SOURCE, [source_server_id.to_string()]);
            }
            TaskKind::InitializeAll { base_dn } => {
                entry.set(ATTR_INITIALIZE_DOMAIN, [base_dn.as_str()]);
                entry.set(ATTR_INITIALIZE_SOURCE, ["all"]);
            }
            TaskKind::ResetGenerationId { base_dn, value } => {
                entry.set(ATTR_RESET_DOMAIN, [base_dn.as_str()]);
                if let Some(value) = value {
                    entry.set(ATTR_RESET_VALUE, [value.to_string()]);
                }
            }
        }
        entry
    }
}

/// How often a task is polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Wait between two reads of the task entry.
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
        }
    }
}

impl PollPolicy {
    /// Minimum wait between two progress reports for a task handling
    /// `total_entries` entries.
    pub fn refresh_period(total_entries: u64) -> Duration {
        match total_entries {
            0..=99 => Duration::ZERO,
            100..=999 => Duration::from_secs(1),
            1_000..=9_999 => Duration::from_secs(5),
            _ => Duration::from_secs(10),
        }
    }
}

/// Bounded retry of initializations that could not reach their peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up, including the first.
    pub max_attempts: u32,
    /// Backoff unit; the wait grows by one unit per failed attempt.
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_step: Duration::from_millis(3000),
        }
    }
}

impl RetryPolicy {
    /// Wait after `failed` failed attempts.
    pub fn backoff_after(&self, failed: u32) -> Duration {
        self.backoff_step.saturating_mul(failed)
    }

    /// Run `attempt` until it succeeds, fails with anything other than
    /// `PeerNotFound`, or the attempts are used up. `attempt` receives the
    /// 1-based attempt number.
    pub async fn run<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        listener: &dyn OperationListener,
        mut attempt: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut number = 1u32;
        loop {
            match attempt(number).await {
                Ok(value) => return Ok(value),
                Err(ReplError::PeerNotFound {
                    address,
                    base_dn,
                    last_log,
                }) => {
                    if number >= max_attempts {
                        warn!(address = %address, base_dn = %base_dn, attempts = number, "initialization retries exhausted");
                        return Err(ReplError::InitializingTriesCompleted {
                            address,
                            base_dn,
                            attempts: number,
                        });
                    }
                    let delay = self.backoff_after(number);
                    debug!(address = %address, base_dn = %base_dn, last_log = ?last_log, "peer not found");
                    listener.on_event(&ProgressEvent::Retrying {
                        address,
                        base_dn,
                        attempt: number + 1,
                        delay_ms: delay.as_millis() as u64,
                    });
                    if !pause(cancel, delay).await {
                        return Err(ReplError::Cancelled);
                    }
                    number += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Sleep unless cancelled first. Returns false on cancellation.
pub async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Task settings shared by initialization and generation id resets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSettings {
    /// Polling.
    pub poll: PollPolicy,
    /// Peer-not-found retries.
    pub retry: RetryPolicy,
    /// Prefix of generated task ids.
    pub id_prefix: String,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            retry: RetryPolicy::default(),
            id_prefix: "dsrepl".to_string(),
        }
    }
}

/// How a task ended, when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Completed successfully.
    Completed,
    /// Completed, but the server reported errors.
    CompletedWithErrors {
        /// Last log line.
        last_log: Option<String>,
    },
    /// The entry was gone when polled; counted as success.
    Vanished,
}

/// Why a task did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// Stopped by error because no peer was reachable.
    PeerNotFound {
        /// Last log line, if any.
        last_log: Option<String>,
    },
    /// Stopped in any other way.
    Stopped {
        /// Terminal state.
        state: TaskState,
        /// Last log line, if any.
        last_log: Option<String>,
    },
    /// The task entry could not be added.
    Creation(DirectoryError),
    /// The task entry could not be read.
    Polling(DirectoryError),
    /// Cancellation was requested.
    Cancelled,
}

impl TaskFailure {
    /// Text for error reports.
    pub fn detail(&self) -> String {
        match self {
            TaskFailure::PeerNotFound { last_log } => last_log
                .clone()
                .unwrap_or_else(|| "no peer reachable".to_string()),
            TaskFailure::Stopped { state, last_log } => match last_log {
                Some(line) => line.clone(),
                None => format!("task ended in state {}", state),
            },
            TaskFailure::Creation(e) => format!("cannot create task: {}", e),
            TaskFailure::Polling(e) => format!("cannot read task: {}", e),
            TaskFailure::Cancelled => "cancelled".to_string(),
        }
    }
}

/// True if a task log line says the peer could not be found.
pub fn is_peer_not_found_log(line: &str) -> bool {
    let line = line.to_lowercase();
    line.contains("no reachable peer") || line.contains("peer not found")
}

/// Classify a terminal state.
pub fn classify(state: TaskState, last_log: Option<String>) -> std::result::Result<TaskOutcome, TaskFailure> {
    match state {
        TaskState::CompletedSuccessfully => Ok(TaskOutcome::Completed),
        TaskState::CompletedWithErrors => Ok(TaskOutcome::CompletedWithErrors { last_log }),
        TaskState::StoppedByError
            if last_log.as_deref().map_or(true, is_peer_not_found_log) =>
        {
            Err(TaskFailure::PeerNotFound { last_log })
        }
        state => Err(TaskFailure::Stopped { state, last_log }),
    }
}

/// Creates a task on one server and follows it to the end.
pub struct TaskRunner<'a> {
    client: &'a ReplicationAdminClient,
    settings: &'a TaskSettings,
    listener: &'a dyn OperationListener,
    cancel: &'a CancellationToken,
}

impl<'a> TaskRunner<'a> {
    /// Run tasks on the server behind `client`.
    pub fn new(
        client: &'a ReplicationAdminClient,
        settings: &'a TaskSettings,
        listener: &'a dyn OperationListener,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            client,
            settings,
            listener,
            cancel,
        }
    }

    /// Create the task, retrying on id collisions. Returns its id and DN.
    pub async fn create(&self, kind: &TaskKind) -> std::result::Result<(String, Dn), TaskFailure> {
        let mut n = 1u64;
        loop {
            if self.cancel.is_cancelled() {
                return Err(TaskFailure::Cancelled);
            }
            let task_id = format!("{}-{}-{}", self.settings.id_prefix, kind.label(), n);
            let entry = kind.entry(&task_id);
            let dn = entry.dn().clone();
            match self.client.connection().add(entry).await {
                Ok(()) => {
                    info!(
                        address = %self.client.address(),
                        task_id = %task_id,
                        base_dn = %kind.base_dn(),
                        "task created"
                    );
                    self.listener.on_event(&ProgressEvent::TaskCreated {
                        address: self.client.address().to_string(),
                        task_id: task_id.clone(),
                    });
                    return Ok((task_id, dn));
                }
                Err(e) if e.is_already_exists() => {
                    debug!(task_id = %task_id, "task id taken, trying the next one");
                    n += 1;
                }
                Err(e) => return Err(TaskFailure::Creation(e)),
            }
        }
    }

    /// Poll a created task until it ends.
    pub async fn wait(
        &self,
        kind: &TaskKind,
        task_id: &str,
        dn: &Dn,
    ) -> std::result::Result<TaskOutcome, TaskFailure> {
        let attrs = [
            layout::ATTR_TASK_STATE,
            layout::ATTR_TASK_PROCESSED,
            layout::ATTR_TASK_UNPROCESSED,
            layout::ATTR_TASK_LOG,
        ];
        let mut last_log: Option<String> = None;
        let mut last_report: Option<Instant> = None;
        loop {
            if !pause(self.cancel, self.settings.poll.interval).await {
                return Err(TaskFailure::Cancelled);
            }
            let entry = match self.client.connection().read(dn, &attrs).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    debug!(address = %self.client.address(), task_id, "task entry gone, counted as success");
                    self.finished(task_id, None);
                    return Ok(TaskOutcome::Vanished);
                }
                Err(e) => return Err(TaskFailure::Polling(e)),
            };

            if let Some(line) = entry.values(layout::ATTR_TASK_LOG).last() {
                if last_log.as_deref() != Some(line.as_str()) {
                    info!(address = %self.client.address(), task_id, "{}", line);
                    self.listener.on_event(&ProgressEvent::TaskLog {
                        address: self.client.address().to_string(),
                        task_id: task_id.to_string(),
                        line: line.clone(),
                    });
                    last_log = Some(line.clone());
                }
            }

            if kind.reports_progress() {
                self.report_progress(task_id, &entry, &mut last_report);
            }

            let state = entry
                .first(layout::ATTR_TASK_STATE)
                .and_then(TaskState::parse);
            if let Some(state) = state.filter(|s| s.is_done()) {
                self.finished(task_id, Some(state));
                return classify(state, last_log);
            }
        }
    }

    /// Create and follow a task.
    pub async fn run(&self, kind: &TaskKind) -> std::result::Result<TaskOutcome, TaskFailure> {
        let (task_id, dn) = self.create(kind).await?;
        self.wait(kind, &task_id, &dn).await
    }

    fn report_progress(&self, task_id: &str, entry: &Entry, last_report: &mut Option<Instant>) {
        let processed: Option<u64> = entry.first_parsed(layout::ATTR_TASK_PROCESSED);
        let unprocessed: Option<u64> = entry.first_parsed(layout::ATTR_TASK_UNPROCESSED);
        let (Some(processed), Some(unprocessed)) = (processed, unprocessed) else {
            return;
        };
        let total = processed.saturating_add(unprocessed);
        let now = Instant::now();
        if let Some(previous) = *last_report {
            if now.duration_since(previous) < PollPolicy::refresh_period(total) {
                return;
            }
        }
        *last_report = Some(now);
        let percent = (total > 0).then(|| ((processed.saturating_mul(100)) / total).min(100) as u8);
        self.listener.on_event(&ProgressEvent::TaskProgress {
            address: self.client.address().to_string(),
            task_id: task_id.to_string(),
            processed,
            unprocessed,
            percent,
        });
    }

    fn finished(&self, task_id: &str, state: Option<TaskState>) {
        self.listener.on_event(&ProgressEvent::TaskFinished {
            address: self.client.address().to_string(),
            task_id: task_id.to_string(),
            state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{ConnectionFactory, ConnectionParams};
    use crate::listener::RecordingListener;
    use crate::memory::{InMemoryDirectory, InMemoryNetwork, TaskBehavior, PEER_NOT_FOUND_LOG};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    async fn client(dir: &Arc<InMemoryDirectory>) -> ReplicationAdminClient {
        let mut net = InMemoryNetwork::new();
        net.attach(dir.clone());
        let conn = net
            .connect(&ConnectionParams::new("ldap1", 389).with_credentials("cn=dm", "pw"))
            .await
            .unwrap();
        ReplicationAdminClient::new(conn, "ldap1:389")
    }

    fn directory() -> Arc<InMemoryDirectory> {
        Arc::new(InMemoryDirectory::new("ldap1", 389).with_root_user("cn=dm", "pw"))
    }

    fn initialize() -> TaskKind {
        TaskKind::InitializeFromSource {
            base_dn: Dn::new("dc=example,dc=com"),
            source_server_id: 7,
        }
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!(TaskState::parse("completed_successfully"), Some(TaskState::CompletedSuccessfully));
        assert_eq!(TaskState::parse("bogus"), None);
        assert!(TaskState::StoppedByAdministrator.is_done());
        assert!(!TaskState::Running.is_done());
    }

    #[test]
    fn test_refresh_period_grows_with_size() {
        assert_eq!(PollPolicy::refresh_period(99), Duration::ZERO);
        assert_eq!(PollPolicy::refresh_period(100), Duration::from_secs(1));
        assert_eq!(PollPolicy::refresh_period(5_000), Duration::from_secs(5));
        assert_eq!(PollPolicy::refresh_period(10_000), Duration::from_secs(10));
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify(TaskState::CompletedSuccessfully, None), Ok(TaskOutcome::Completed));
        assert!(matches!(
            classify(TaskState::CompletedWithErrors, Some("3 entries rejected".into())),
            Ok(TaskOutcome::CompletedWithErrors { .. })
        ));
        assert!(matches!(
            classify(TaskState::StoppedByError, None),
            Err(TaskFailure::PeerNotFound { .. })
        ));
        assert!(matches!(
            classify(TaskState::StoppedByError, Some(PEER_NOT_FOUND_LOG.to_string())),
            Err(TaskFailure::PeerNotFound { .. })
        ));
        let failure = classify(TaskState::StoppedByError, Some("disk full".into())).unwrap_err();
        assert_eq!(failure.detail(), "disk full");
        assert!(matches!(
            classify(TaskState::StoppedByAdministrator, None),
            Err(TaskFailure::Stopped { .. })
        ));
    }

    #[test]
    fn test_task_entry_attributes() {
        let entry = initialize().entry("dsrepl-initialize-1");
        assert_eq!(
            entry.dn(),
            &Dn::new("ds-task-id=dsrepl-initialize-1,cn=Scheduled Tasks,cn=Tasks")
        );
        assert_eq!(entry.first(ATTR_INITIALIZE_SOURCE), Some("7"));
        let reset = TaskKind::ResetGenerationId {
            base_dn: Dn::new("dc=example,dc=com"),
            value: None,
        }
        .entry("x");
        assert!(!reset.has_attribute(ATTR_RESET_VALUE));
        assert_eq!(reset.first(ATTR_TASK_CLASS), Some("org.opends.server.tasks.SetGenerationIdTask"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_to_completion_with_progress() {
        let dir = directory();
        dir.push_task_behavior(TaskBehavior::Succeed { entries: 50 }).await;
        let client = client(&dir).await;
        let listener = RecordingListener::new();
        let cancel = CancellationToken::new();
        let settings = TaskSettings::default();
        let runner = TaskRunner::new(&client, &settings, &listener, &cancel);

        assert_eq!(runner.run(&initialize()).await, Ok(TaskOutcome::Completed));
        let events = listener.events();
        assert!(events.iter().any(|e| matches!(e, ProgressEvent::TaskProgress { percent: Some(100), .. })));
        assert!(events.iter().any(|e| matches!(e, ProgressEvent::TaskLog { line, .. } if line == "Task completed")));
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::TaskFinished { state: Some(TaskState::CompletedSuccessfully), .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_of_large_task_is_throttled() {
        let dir = directory();
        // 40 running polls 500ms apart, each with fresh counts
        dir.push_task_behavior(TaskBehavior::Progress {
            entries: 20_000,
            polls: 40,
        })
        .await;
        let client = client(&dir).await;
        let listener = RecordingListener::new();
        let cancel = CancellationToken::new();
        let settings = TaskSettings::default();
        let runner = TaskRunner::new(&client, &settings, &listener, &cancel);

        let start = Instant::now();
        assert_eq!(runner.run(&initialize()).await, Ok(TaskOutcome::Completed));
        assert!(start.elapsed() >= Duration::from_secs(20));

        let percents: Vec<Option<u8>> = listener
            .events()
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::TaskProgress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        // one report per ten seconds instead of one per poll
        assert!((2..=3).contains(&percents.len()), "{:?}", percents);
        assert_eq!(percents[0], Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_task_reports_every_poll() {
        let dir = directory();
        dir.push_task_behavior(TaskBehavior::Progress { entries: 90, polls: 8 }).await;
        let client = client(&dir).await;
        let listener = RecordingListener::new();
        let cancel = CancellationToken::new();
        let settings = TaskSettings::default();
        let runner = TaskRunner::new(&client, &settings, &listener, &cancel);

        assert_eq!(runner.run(&initialize()).await, Ok(TaskOutcome::Completed));
        let reports = listener
            .events()
            .iter()
            .filter(|e| matches!(e, ProgressEvent::TaskProgress { .. }))
            .count();
        assert_eq!(reports, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_id_collision_increments_suffix() {
        let dir = directory();
        dir.push_task_behavior(TaskBehavior::Reject(DirectoryError::AlreadyExists {
            dn: "ds-task-id=dsrepl-initialize-1".to_string(),
        }))
        .await;
        let client = client(&dir).await;
        let listener = RecordingListener::new();
        let cancel = CancellationToken::new();
        let settings = TaskSettings::default();
        let runner = TaskRunner::new(&client, &settings, &listener, &cancel);
        let (task_id, _) = runner.create(&initialize()).await.unwrap();
        assert_eq!(task_id, "dsrepl-initialize-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_creation_failure_is_fatal() {
        let dir = directory();
        dir.push_task_behavior(TaskBehavior::Reject(DirectoryError::InsufficientAccess {
            dn: SCHEDULED_TASKS_DN.to_string(),
        }))
        .await;
        let client = client(&dir).await;
        let listener = RecordingListener::new();
        let cancel = CancellationToken::new();
        let settings = TaskSettings::default();
        let runner = TaskRunner::new(&client, &settings, &listener, &cancel);
        assert!(matches!(runner.run(&initialize()).await, Err(TaskFailure::Creation(_))));
        assert_eq!(dir.created_tasks().await.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_task_counts_as_success() {
        let dir = directory();
        dir.push_task_behavior(TaskBehavior::Vanish).await;
        let client = client(&dir).await;
        let listener = RecordingListener::new();
        let cancel = CancellationToken::new();
        let settings = TaskSettings::default();
        let runner = TaskRunner::new(&client, &settings, &listener, &cancel);
        assert_eq!(runner.run(&initialize()).await, Ok(TaskOutcome::Vanished));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() {
        let dir = directory();
        let client = client(&dir).await;
        let listener = RecordingListener::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let settings = TaskSettings::default();
        let runner = TaskRunner::new(&client, &settings, &listener, &cancel);
        assert_eq!(runner.run(&initialize()).await, Err(TaskFailure::Cancelled));
    }

    fn peer_not_found() -> ReplError {
        ReplError::PeerNotFound {
            address: "b:389".to_string(),
            base_dn: "dc=example,dc=com".to_string(),
            last_log: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let listener = RecordingListener::new();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let result: Result<()> = policy
            .run(&cancel, &listener, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(peer_not_found()) }
            })
            .await;
        assert!(matches!(
            result,
            Err(ReplError::InitializingTriesCompleted { attempts: 5, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // 3 + 6 + 9 + 12 seconds of backoff
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_success() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let listener = RecordingListener::new();
        let cancel = CancellationToken::new();
        let result = policy
            .run(&cancel, &listener, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(peer_not_found())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_does_not_retry_fatal_errors() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let listener = RecordingListener::new();
        let cancel = CancellationToken::new();
        let result: Result<()> = policy
            .run(&cancel, &listener, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ReplError::Initializing {
                        address: "b:389".to_string(),
                        base_dn: "dc=example,dc=com".to_string(),
                        detail: "disk full".to_string(),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(ReplError::Initializing { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
