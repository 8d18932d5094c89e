//! In-memory directory simulation for testing without real servers.
//!
//! `InMemoryDirectory` keeps a server's entries in a map and emulates the
//! parts of server behaviour the topology code depends on: bind checks,
//! the monitor clock, and the asynchronous task backend (scripted per task).
//! `InMemoryNetwork` routes `ConnectionParams` to registered directories and
//! implements `ConnectionFactory`.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::admin_client::layout;
use crate::directory::{
    ConnectionFactory, ConnectionParams, DirectoryConnection, DirectoryError, Entry, Filter,
    Modification, SearchScope,
};
use crate::dn::Dn;
use crate::task::{TaskState, SCHEDULED_TASKS_DN};

/// Scripted outcome for the next task created on a directory.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskBehavior {
    /// Runs then completes. Entry counts are reported when `entries > 0`.
    Succeed {
        /// Entries the task pretends to process.
        entries: u64,
    },
    /// Stays running for `polls` reads, advancing its counts each time.
    Progress {
        /// Entries the task pretends to process.
        entries: u64,
        /// Reads answered with the task still running.
        polls: u64,
    },
    /// Runs then completes with errors.
    CompleteWithErrors {
        /// Log line attached to the completion.
        log: String,
    },
    /// Stops at once because no peer is reachable.
    PeerNotFound,
    /// Stops by error without writing any log.
    StopWithoutLog,
    /// Runs then stops by error with the given log.
    Fail {
        /// Log line attached to the failure.
        log: String,
    },
    /// Accepted but purged before the first poll.
    Vanish,
    /// The add operation itself fails.
    Reject(DirectoryError),
}

/// Kind of a recorded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Entry added.
    Add,
    /// Entry modified.
    Modify,
    /// Entry deleted.
    Delete,
}

#[derive(Debug, Clone)]
struct TaskStep {
    state: TaskState,
    processed: Option<u64>,
    unprocessed: Option<u64>,
    log: Option<String>,
}

impl TaskStep {
    fn new(state: TaskState) -> Self {
        Self {
            state,
            processed: None,
            unprocessed: None,
            log: None,
        }
    }

    fn counts(mut self, processed: u64, unprocessed: u64) -> Self {
        self.processed = Some(processed);
        self.unprocessed = Some(unprocessed);
        self
    }

    fn log(mut self, line: &str) -> Self {
        self.log = Some(line.to_string());
        self
    }
}

/// Log line written by the simulated server when no peer answers.
pub const PEER_NOT_FOUND_LOG: &str =
    "Task could not be completed: there is no reachable peer in the replication domain";

#[derive(Default)]
struct DirectoryState {
    entries: BTreeMap<Dn, Entry>,
    root_users: HashMap<Dn, String>,
    task_behaviors: VecDeque<TaskBehavior>,
    task_scripts: HashMap<Dn, VecDeque<TaskStep>>,
    created_tasks: Vec<Entry>,
    writes: Vec<(WriteKind, Dn)>,
    clock_offset: Option<ChronoDuration>,
    connect_error: Option<DirectoryError>,
}

/// A simulated directory server.
pub struct InMemoryDirectory {
    host: String,
    ports: Vec<u16>,
    state: Mutex<DirectoryState>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl InMemoryDirectory {
    /// A server with the standard configuration skeleton and no data.
    pub fn new(host: &str, ldap_port: u16) -> Self {
        let mut state = DirectoryState::default();
        for entry in skeleton() {
            state.entries.insert(entry.dn().clone(), entry);
        }
        Self {
            host: host.to_string(),
            ports: vec![ldap_port],
            state: Mutex::new(state),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }

    /// Also listen on a secure port.
    pub fn with_secure_port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    /// A root user that may bind with `password`.
    pub fn with_root_user(mut self, bind_dn: &str, password: &str) -> Self {
        self.state
            .get_mut()
            .root_users
            .insert(Dn::new(bind_dn), password.to_string());
        self
    }

    /// A backend holding `base_dn` with `entry_count` entries.
    pub fn with_backend(mut self, backend_id: &str, base_dn: &str, entry_count: u64) -> Self {
        let state = self.state.get_mut();
        for entry in backend_entries(backend_id, base_dn, entry_count) {
            state.entries.insert(entry.dn().clone(), entry);
        }
        self
    }

    /// Set the schema replication identifier.
    pub fn with_schema_generation_id(mut self, generation_id: &str) -> Self {
        let schema = Dn::new(layout::SCHEMA);
        if let Some(entry) = self.state.get_mut().entries.get_mut(&schema) {
            entry.set(layout::ATTR_SYNC_GENERATION_ID, [generation_id]);
        }
        self
    }

    /// Set the instance key certificate.
    pub fn with_instance_certificate(mut self, key_id: &str, certificate: &str) -> Self {
        let entry = Entry::new(Dn::new(layout::ADS_CERTIFICATE))
            .with("objectclass", ["top", "ds-cfg-instance-key"])
            .with(layout::ATTR_KEY_ID, [key_id])
            .with(layout::ATTR_PUBLIC_KEY_CERTIFICATE, [certificate]);
        self.state
            .get_mut()
            .entries
            .insert(entry.dn().clone(), entry);
        self
    }

    /// Insert arbitrary entries, bypassing parent checks.
    pub fn with_entries(mut self, entries: impl IntoIterator<Item = Entry>) -> Self {
        let state = self.state.get_mut();
        for entry in entries {
            state.entries.insert(entry.dn().clone(), entry);
        }
        self
    }

    /// Host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Plain LDAP port.
    pub fn ldap_port(&self) -> u16 {
        self.ports[0]
    }

    /// `host:ldap_port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.ldap_port())
    }

    /// Queue the behaviour of the next created task.
    pub async fn push_task_behavior(&self, behavior: TaskBehavior) {
        self.state.lock().await.task_behaviors.push_back(behavior);
    }

    /// Shift the server clock relative to the local clock.
    pub async fn set_clock_offset(&self, offset: ChronoDuration) {
        self.state.lock().await.clock_offset = Some(offset);
    }

    /// Make every subsequent connection attempt fail.
    pub async fn set_connect_error(&self, error: Option<DirectoryError>) {
        self.state.lock().await.connect_error = error;
    }

    /// Task entries as they were when created.
    pub async fn created_tasks(&self) -> Vec<Entry> {
        self.state.lock().await.created_tasks.clone()
    }

    /// Every write applied, in order.
    pub async fn writes(&self) -> Vec<(WriteKind, Dn)> {
        self.state.lock().await.writes.clone()
    }

    /// Number of writes that touched `dn`.
    pub async fn writes_to(&self, dn: &Dn) -> usize {
        self.state
            .lock()
            .await
            .writes
            .iter()
            .filter(|(_, d)| d == dn)
            .count()
    }

    /// Read an entry directly.
    pub async fn entry(&self, dn: &Dn) -> Option<Entry> {
        self.state.lock().await.entries.get(dn).cloned()
    }

    /// Entries directly below `parent`.
    pub async fn children(&self, parent: &Dn) -> Vec<Entry> {
        self.state
            .lock()
            .await
            .entries
            .values()
            .filter(|e| e.dn().parent().as_ref() == Some(parent))
            .cloned()
            .collect()
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.opened
            .load(Ordering::SeqCst)
            .saturating_sub(self.closed.load(Ordering::SeqCst))
    }

    async fn authenticate(&self, params: &ConnectionParams) -> Result<(), DirectoryError> {
        let state = self.state.lock().await;
        if let Some(err) = &state.connect_error {
            return Err(err.clone());
        }
        let bind_dn = Dn::new(params.bind_dn.as_str());
        let accepted = match state.root_users.get(&bind_dn) {
            Some(password) => *password == params.password,
            None => state
                .entries
                .get(&bind_dn)
                .map(|e| e.values("userpassword").iter().any(|p| *p == params.password))
                .unwrap_or(false),
        };
        if accepted {
            Ok(())
        } else {
            Err(DirectoryError::AuthenticationFailed {
                bind_dn: params.bind_dn.clone(),
            })
        }
    }

    async fn search(
        &self,
        base: &Dn,
        scope: SearchScope,
        filter: &Filter,
        attrs: &[&str],
    ) -> Result<Vec<Entry>, DirectoryError> {
        let mut state = self.state.lock().await;
        advance_task(&mut state, base);
        if !state.entries.contains_key(base) {
            return Err(DirectoryError::NoSuchObject {
                dn: base.to_string(),
            });
        }
        let monitor = Dn::new(layout::MONITOR);
        let now = Utc::now() + state.clock_offset.unwrap_or_else(ChronoDuration::zero);
        let found = state
            .entries
            .values()
            .filter(|e| match scope {
                SearchScope::Base => e.dn() == base,
                SearchScope::OneLevel => e.dn().parent().as_ref() == Some(base),
                SearchScope::Subtree => e.dn() == base || e.dn().is_descendant_of(base),
            })
            .filter(|e| filter.matches(e))
            .map(|e| {
                if *e.dn() == monitor {
                    let mut e = e.clone();
                    e.set(
                        layout::ATTR_CURRENT_TIME,
                        [now.format(layout::GENERALIZED_TIME_FORMAT).to_string()],
                    );
                    e.project(attrs)
                } else {
                    e.project(attrs)
                }
            })
            .collect();
        Ok(found)
    }

    async fn add(&self, entry: Entry) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        let dn = entry.dn().clone();
        if state.entries.contains_key(&dn) {
            return Err(DirectoryError::AlreadyExists { dn: dn.to_string() });
        }
        if let Some(parent) = dn.parent() {
            if !parent.is_root() && !state.entries.contains_key(&parent) {
                return Err(DirectoryError::NoSuchObject {
                    dn: parent.to_string(),
                });
            }
        }
        if dn.parent().as_ref() == Some(&Dn::new(SCHEDULED_TASKS_DN)) {
            let behavior = state
                .task_behaviors
                .pop_front()
                .unwrap_or(TaskBehavior::Succeed { entries: 0 });
            if let TaskBehavior::Reject(err) = behavior {
                return Err(err);
            }
            state.created_tasks.push(entry.clone());
            state.writes.push((WriteKind::Add, dn.clone()));
            if behavior == TaskBehavior::Vanish {
                return Ok(());
            }
            let mut stored = entry;
            stored.set(layout::ATTR_TASK_STATE, [TaskState::WaitingOnStartTime.as_str()]);
            state.task_scripts.insert(dn.clone(), script(&behavior));
            state.entries.insert(dn, stored);
            return Ok(());
        }
        state.writes.push((WriteKind::Add, dn.clone()));
        state.entries.insert(dn, entry);
        Ok(())
    }

    async fn modify(&self, dn: &Dn, modifications: &[Modification]) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(dn)
            .ok_or_else(|| DirectoryError::NoSuchObject { dn: dn.to_string() })?;
        for modification in modifications {
            entry.apply(modification);
        }
        state.writes.push((WriteKind::Modify, dn.clone()));
        Ok(())
    }

    async fn delete(&self, dn: &Dn) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        if !state.entries.contains_key(dn) {
            return Err(DirectoryError::NoSuchObject { dn: dn.to_string() });
        }
        if state.entries.keys().any(|k| k.is_descendant_of(dn)) {
            return Err(DirectoryError::Other {
                code: 66,
                message: format!("entry {} has children", dn),
            });
        }
        state.entries.remove(dn);
        state.writes.push((WriteKind::Delete, dn.clone()));
        Ok(())
    }
}

fn advance_task(state: &mut DirectoryState, dn: &Dn) {
    let step = match state.task_scripts.get_mut(dn) {
        Some(steps) => steps.pop_front(),
        None => return,
    };
    let (Some(step), Some(entry)) = (step, state.entries.get_mut(dn)) else {
        return;
    };
    entry.set(layout::ATTR_TASK_STATE, [step.state.as_str()]);
    if let (Some(processed), Some(unprocessed)) = (step.processed, step.unprocessed) {
        entry.set(layout::ATTR_TASK_PROCESSED, [processed.to_string()]);
        entry.set(layout::ATTR_TASK_UNPROCESSED, [unprocessed.to_string()]);
    }
    if let Some(line) = step.log {
        entry.apply(&Modification::Add {
            attr: layout::ATTR_TASK_LOG.to_string(),
            values: vec![line],
        });
    }
}

fn script(behavior: &TaskBehavior) -> VecDeque<TaskStep> {
    let running = TaskStep::new(TaskState::Running);
    let steps = match behavior {
        TaskBehavior::Succeed { entries } if *entries > 0 => {
            let half = entries / 2;
            vec![
                running.counts(half, entries - half).log("Task started"),
                TaskStep::new(TaskState::CompletedSuccessfully)
                    .counts(*entries, 0)
                    .log("Task completed"),
            ]
        }
        TaskBehavior::Progress { entries, polls } => {
            let mut steps: Vec<TaskStep> = (1..=*polls)
                .map(|i| {
                    let processed = entries * i / (polls + 1);
                    running.clone().counts(processed, entries - processed)
                })
                .collect();
            if let Some(first) = steps.first_mut() {
                first.log = Some("Task started".to_string());
            }
            steps.push(
                TaskStep::new(TaskState::CompletedSuccessfully)
                    .counts(*entries, 0)
                    .log("Task completed"),
            );
            steps
        }
        TaskBehavior::Succeed { .. } => vec![
            running.log("Task started"),
            TaskStep::new(TaskState::CompletedSuccessfully),
        ],
        TaskBehavior::CompleteWithErrors { log } => vec![
            running,
            TaskStep::new(TaskState::CompletedWithErrors).log(log),
        ],
        TaskBehavior::PeerNotFound => {
            vec![TaskStep::new(TaskState::StoppedByError).log(PEER_NOT_FOUND_LOG)]
        }
        TaskBehavior::StopWithoutLog => vec![TaskStep::new(TaskState::StoppedByError)],
        TaskBehavior::Fail { log } => {
            vec![running, TaskStep::new(TaskState::StoppedByError).log(log)]
        }
        TaskBehavior::Vanish | TaskBehavior::Reject(_) => Vec::new(),
    };
    steps.into()
}

fn skeleton() -> Vec<Entry> {
    let container = |dn: &str| Entry::new(Dn::new(dn)).with("objectclass", ["top", "ds-cfg-branch"]);
    vec![
        container(layout::CONFIG),
        container(layout::BACKENDS),
        container(layout::SYNC_PROVIDERS),
        Entry::new(Dn::new(layout::SYNC_PROVIDER))
            .with("objectclass", ["top", "ds-cfg-replication-synchronization-provider"])
            .with(layout::ATTR_ENABLED, ["false"]),
        Entry::new(Dn::new(layout::CRYPTO_MANAGER))
            .with("objectclass", ["top", "ds-cfg-crypto-manager"])
            .with(layout::ATTR_SSL_ENCRYPTION, ["false"]),
        container(layout::MONITOR),
        container(layout::SCHEMA),
        container(layout::TRUSTSTORE),
        container("cn=Tasks"),
        container(SCHEDULED_TASKS_DN),
    ]
}

fn backend_entries(backend_id: &str, base_dn: &str, entry_count: u64) -> Vec<Entry> {
    let backend_dn = Dn::new(layout::BACKENDS).child(&format!("ds-cfg-backend-id={}", backend_id));
    let monitor_dn = Dn::new(layout::MONITOR).child(&format!("cn={} Backend", backend_id));
    vec![
        Entry::new(backend_dn)
            .with("objectclass", ["top", "ds-cfg-backend"])
            .with(layout::ATTR_BACKEND_ID, [backend_id])
            .with(layout::ATTR_BASE_DN, [base_dn]),
        Entry::new(monitor_dn)
            .with("objectclass", ["top", "ds-monitor-entry"])
            .with(layout::ATTR_BACKEND_ENTRY_COUNT, [entry_count.to_string()]),
        Entry::new(Dn::new(base_dn)).with("objectclass", ["top", "domain"]),
    ]
}

struct InMemoryConnection {
    directory: Arc<InMemoryDirectory>,
    closed: AtomicBool,
}

impl InMemoryConnection {
    fn check_open(&self) -> Result<(), DirectoryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DirectoryError::Other {
                code: 80,
                message: "connection closed".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DirectoryConnection for InMemoryConnection {
    async fn search(
        &self,
        base: &Dn,
        scope: SearchScope,
        filter: &Filter,
        attrs: &[&str],
    ) -> Result<Vec<Entry>, DirectoryError> {
        self.check_open()?;
        self.directory.search(base, scope, filter, attrs).await
    }

    async fn add(&self, entry: Entry) -> Result<(), DirectoryError> {
        self.check_open()?;
        self.directory.add(entry).await
    }

    async fn modify(&self, dn: &Dn, modifications: &[Modification]) -> Result<(), DirectoryError> {
        self.check_open()?;
        self.directory.modify(dn, modifications).await
    }

    async fn delete(&self, dn: &Dn) -> Result<(), DirectoryError> {
        self.check_open()?;
        self.directory.delete(dn).await
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.directory.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Routes connections to simulated directories by `host:port`.
#[derive(Default)]
pub struct InMemoryNetwork {
    directories: HashMap<String, Arc<InMemoryDirectory>>,
}

impl InMemoryNetwork {
    /// An empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a directory on every port it listens on.
    pub fn attach(&mut self, directory: Arc<InMemoryDirectory>) -> &mut Self {
        for port in &directory.ports {
            let key = format!("{}:{}", directory.host.to_lowercase(), port);
            self.directories.insert(key, directory.clone());
        }
        self
    }

    /// Directory listening on `host:port`.
    pub fn directory(&self, host: &str, port: u16) -> Option<Arc<InMemoryDirectory>> {
        self.directories
            .get(&format!("{}:{}", host.to_lowercase(), port))
            .cloned()
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryNetwork {
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn DirectoryConnection>, DirectoryError> {
        let directory =
            self.directory(&params.host, params.port)
                .ok_or_else(|| DirectoryError::Connect {
                    address: params.address(),
                    reason: "connection refused".to_string(),
                })?;
        directory.authenticate(params).await?;
        directory.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryConnection {
            directory,
            closed: AtomicBool::new(false),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "cn=Directory Manager";

    fn network() -> (InMemoryNetwork, Arc<InMemoryDirectory>) {
        let dir = Arc::new(
            InMemoryDirectory::new("ldap1", 389)
                .with_secure_port(636)
                .with_root_user(ROOT, "pw")
                .with_backend("userRoot", "dc=example,dc=com", 10),
        );
        let mut net = InMemoryNetwork::new();
        net.attach(dir.clone());
        (net, dir)
    }

    fn params(port: u16) -> ConnectionParams {
        ConnectionParams::new("LDAP1", port).with_credentials(ROOT, "pw")
    }

    #[tokio::test]
    async fn test_connect_on_both_ports() {
        let (net, dir) = network();
        let c1 = net.connect(&params(389)).await.unwrap();
        let _c2 = net.connect(&params(636)).await.unwrap();
        assert_eq!(dir.open_connections(), 2);
        c1.close().await;
        assert_eq!(dir.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_bad_password_rejected() {
        let (net, _) = network();
        let err = net
            .connect(&ConnectionParams::new("ldap1", 389).with_credentials(ROOT, "nope"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DirectoryError::AuthenticationFailed { .. }));
    }

    #[tokio::test]
    async fn test_unknown_host_refused() {
        let (net, _) = network();
        let err = net.connect(&ConnectionParams::new("ldap9", 389)).await.err().unwrap();
        assert!(matches!(err, DirectoryError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_injected_certificate_error() {
        let (net, dir) = network();
        dir.set_connect_error(Some(DirectoryError::Certificate {
            reason: "self-signed".to_string(),
        }))
        .await;
        let err = net.connect(&params(636)).await.err().unwrap();
        assert!(matches!(err, DirectoryError::Certificate { .. }));
    }

    #[tokio::test]
    async fn test_add_requires_parent_and_rejects_duplicates() {
        let (net, _) = network();
        let conn = net.connect(&params(389)).await.unwrap();
        let orphan = Entry::new(Dn::new("cn=x,cn=missing,cn=config"));
        assert!(conn.add(orphan).await.unwrap_err().is_not_found());
        let entry = Entry::new(Dn::new("ou=people,dc=example,dc=com"));
        conn.add(entry.clone()).await.unwrap();
        assert!(conn.add(entry).await.unwrap_err().is_already_exists());
    }

    #[tokio::test]
    async fn test_delete_refuses_non_leaf() {
        let (net, _) = network();
        let conn = net.connect(&params(389)).await.unwrap();
        conn.add(Entry::new(Dn::new("ou=people,dc=example,dc=com")))
            .await
            .unwrap();
        let err = conn.delete(&Dn::new("dc=example,dc=com")).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Other { code: 66, .. }));
    }

    #[tokio::test]
    async fn test_monitor_reports_clock() {
        let (net, dir) = network();
        dir.set_clock_offset(ChronoDuration::minutes(10)).await;
        let conn = net.connect(&params(389)).await.unwrap();
        let monitor = conn.read(&Dn::new("cn=monitor"), &[]).await.unwrap().unwrap();
        assert!(monitor.first(layout::ATTR_CURRENT_TIME).is_some());
    }

    #[tokio::test]
    async fn test_task_script_advances_per_read() {
        let (net, dir) = network();
        dir.push_task_behavior(TaskBehavior::Succeed { entries: 10 }).await;
        let conn = net.connect(&params(389)).await.unwrap();
        let dn = Dn::new(SCHEDULED_TASKS_DN).child("ds-task-id=t-1");
        conn.add(Entry::new(dn.clone())).await.unwrap();

        let first = conn.read(&dn, &[]).await.unwrap().unwrap();
        assert_eq!(first.first(layout::ATTR_TASK_STATE), Some("RUNNING"));
        assert_eq!(first.first_parsed::<u64>(layout::ATTR_TASK_PROCESSED), Some(5));

        let second = conn.read(&dn, &[]).await.unwrap().unwrap();
        assert_eq!(
            second.first(layout::ATTR_TASK_STATE),
            Some("COMPLETED_SUCCESSFULLY")
        );
        assert_eq!(second.values(layout::ATTR_TASK_LOG).len(), 2);
    }

    #[tokio::test]
    async fn test_vanishing_task_is_not_stored() {
        let (net, dir) = network();
        dir.push_task_behavior(TaskBehavior::Vanish).await;
        let conn = net.connect(&params(389)).await.unwrap();
        let dn = Dn::new(SCHEDULED_TASKS_DN).child("ds-task-id=t-1");
        conn.add(Entry::new(dn.clone())).await.unwrap();
        assert!(conn.read(&dn, &[]).await.unwrap().is_none());
        assert_eq!(dir.created_tasks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_connection_refuses_operations() {
        let (net, _) = network();
        let conn = net.connect(&params(389)).await.unwrap();
        conn.close().await;
        assert!(conn.read(&Dn::new("cn=config"), &[]).await.is_err());
    }
}
