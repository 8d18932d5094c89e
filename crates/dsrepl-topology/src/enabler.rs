//! The topology orchestrator.
//!
//! `TopologyEnabler::execute` runs one `OperationRequest` from start to
//! finish. Every connection it opens is closed before it returns, whatever
//! the outcome. Cancellation is checked around every blocking step; work
//! already committed on remote servers is left in place.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admin_client::ReplicationAdminClient;
use crate::ads::{AdminRegistry, AdsServerProperties};
use crate::config::ToolConfig;
use crate::configurator::ReplicationConfigurator;
use crate::directory::{self, ConnectionFactory, ConnectionParams, DirectoryConnection, Protocol};
use crate::dn::{join_dns, Dn, ADMIN_DATA_DN, SCHEMA_DN};
use crate::error::{ReplError, Result, ReturnCode};
use crate::generation::GenerationIdResetter;
use crate::ids::IdAllocator;
use crate::initializer::SuffixInitializer;
use crate::listener::{LoggingListener, OperationListener, ProgressEvent};
use crate::peers::{peer_address, PeerSet};
use crate::reconcile::{AdsNode, AdsReconciler, AdsSide, Reconciliation};
use crate::request::{
    DisableRequest, EnableRequest, ExternalInitializationRequest, InitializeAllRequest,
    InitializeRequest, OperationRequest, ServerEndpoint, StatusRequest,
};
use crate::server::{is_replicated_between, ContactPoint, ServerDescriptor};
use crate::status::StatusReport;
use crate::task::TaskSettings;
use crate::topology::{DiscoveryOptions, TopologyCache, TopologyCacheException};

/// What a successful operation did.
#[derive(Debug, Clone, Default)]
pub struct OperationReport {
    /// Operation name.
    pub operation: &'static str,
    /// Base DNs acted upon after filtering.
    pub base_dns: Vec<Dn>,
    /// Non-fatal problems, in the order they were raised.
    pub warnings: Vec<String>,
    /// Servers of the topology that could not be read.
    pub discovery_errors: Vec<TopologyCacheException>,
    /// Clock skew measured between the two nodes of an enable.
    pub clock_skew: Option<Duration>,
    /// How the administration data was reconciled, for an enable.
    pub reconciliation: Option<Reconciliation>,
    /// The report of a status request.
    pub status: Option<StatusReport>,
}

impl OperationReport {
    fn new(operation: &'static str) -> Self {
        Self {
            operation,
            ..Self::default()
        }
    }
}

/// Result code of an operation outcome.
pub fn return_code(result: &Result<OperationReport>) -> ReturnCode {
    match result {
        Ok(_) => ReturnCode::Successful,
        Err(e) => e.return_code(),
    }
}

/// State of one operation: the caller's listener, the warnings raised so
/// far and the connections to close at the end.
struct Session<'a> {
    listener: &'a dyn OperationListener,
    warnings: Mutex<Vec<String>>,
    connections: Mutex<Vec<Arc<dyn DirectoryConnection>>>,
}

impl<'a> Session<'a> {
    fn new(listener: &'a dyn OperationListener) -> Self {
        Self {
            listener,
            warnings: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        }
    }

    fn step(&self, description: impl Into<String>) {
        self.on_event(&ProgressEvent::Step {
            description: description.into(),
        });
    }

    fn warn(&self, message: impl Into<String>) {
        self.on_event(&ProgressEvent::Warning {
            message: message.into(),
        });
    }

    fn track(&self, conn: Arc<dyn DirectoryConnection>) {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(conn);
    }

    fn take_warnings(&self) -> Vec<String> {
        std::mem::take(
            &mut *self
                .warnings
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    async fn close_all(&self) {
        let connections = std::mem::take(
            &mut *self
                .connections
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for conn in connections {
            conn.close().await;
        }
    }
}

impl OperationListener for Session<'_> {
    fn on_event(&self, event: &ProgressEvent) {
        if let ProgressEvent::Warning { message } = event {
            self.warnings
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(message.clone());
        }
        self.listener.on_event(event);
    }

    fn confirm_discovery_errors(&self, errors: &[TopologyCacheException]) -> bool {
        self.listener.confirm_discovery_errors(errors)
    }
}

/// Runs topology operations against servers reached through a
/// `ConnectionFactory`.
pub struct TopologyEnabler {
    factory: Arc<dyn ConnectionFactory>,
    config: ToolConfig,
    settings: TaskSettings,
    listener: Arc<dyn OperationListener>,
    cancel: CancellationToken,
}

impl TopologyEnabler {
    /// An enabler reporting through a `LoggingListener`.
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: ToolConfig) -> Self {
        let listener = Arc::new(LoggingListener::new(config.accept_discovery_errors));
        Self {
            settings: config.task_settings(),
            factory,
            config,
            listener,
            cancel: CancellationToken::new(),
        }
    }

    /// Report progress to `listener` instead.
    pub fn with_listener(mut self, listener: Arc<dyn OperationListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Stop when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels operations of this enabler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one operation.
    pub async fn execute(&self, request: &OperationRequest) -> Result<OperationReport> {
        request.validate()?;
        let operation = request.kind();
        info!(operation, "operation started");
        let session = Session::new(self.listener.as_ref());
        let result = match request {
            OperationRequest::Enable(r) => self.enable(&session, r).await,
            OperationRequest::Disable(r) => self.disable(&session, r).await,
            OperationRequest::Initialize(r) => self.initialize(&session, r).await,
            OperationRequest::InitializeAll(r) => self.initialize_all(&session, r).await,
            OperationRequest::PreExternalInitialization(r) => {
                self.external_initialization(&session, r, true).await
            }
            OperationRequest::PostExternalInitialization(r) => {
                self.external_initialization(&session, r, false).await
            }
            OperationRequest::Status(r) => self.status(&session, r).await,
        };
        session.close_all().await;
        match result {
            Ok(mut report) => {
                report.warnings = session.take_warnings();
                info!(operation, warnings = report.warnings.len(), "operation completed");
                Ok(report)
            }
            Err(e) => {
                warn!(operation, code = e.return_code().code(), error = %e, "operation failed");
                Err(e)
            }
        }
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ReplError::Cancelled);
        }
        Ok(())
    }

    async fn connect(&self, session: &Session<'_>, params: &ConnectionParams) -> Result<ReplicationAdminClient> {
        self.checkpoint()?;
        let conn = directory::open(self.factory.as_ref(), params, self.config.connect_timeout())
            .await
            .map_err(|source| ReplError::Connecting {
                address: params.address(),
                source,
            })?;
        session.track(conn.clone());
        debug!(address = %params.address(), url = %params.ldap_url(), "connected");
        Ok(ReplicationAdminClient::new(conn, params.address()))
    }

    async fn read_server(
        &self,
        client: &ReplicationAdminClient,
        params: &ConnectionParams,
    ) -> Result<ServerDescriptor> {
        let secure_port = (params.protocol == Protocol::Ldaps).then_some(params.port);
        let mut server = ServerDescriptor::read(client, &params.host, params.port, secure_port)
            .await
            .map_err(|source| ReplError::ReadingConfiguration {
                address: client.address().to_string(),
                source,
            })?;
        server.contact = Some(ContactPoint::from(params));
        self.checkpoint()?;
        Ok(server)
    }

    fn accept_discovery_errors(&self, session: &Session<'_>, cache: &TopologyCache) -> Result<()> {
        let errors = cache.errors();
        if errors.is_empty() {
            return Ok(());
        }
        let accepted = !errors.iter().any(|e| e.is_fatal())
            && (self.config.accept_discovery_errors || session.confirm_discovery_errors(errors));
        if !accepted {
            return Err(ReplError::ReadingTopologyCache {
                summary: cache.error_summary(),
            });
        }
        for error in errors {
            session.warn(format!("{} could not be read: {}", error.address, error));
        }
        Ok(())
    }

    async fn enable(&self, session: &Session<'_>, request: &EnableRequest) -> Result<OperationReport> {
        let mut report = OperationReport::new("enable");
        let first_params = &request.first.connection;
        let second_params = &request.second.connection;

        session.step(format!(
            "connecting to {} and {}",
            first_params.address(),
            second_params.address()
        ));
        let (first, second) = match (
            self.connect(session, first_params).await,
            self.connect(session, second_params).await,
        ) {
            (Ok(first), Ok(second)) => (first, second),
            (
                Err(ReplError::Connecting {
                    address: first_address,
                    source: first,
                }),
                Err(ReplError::Connecting {
                    address: second_address,
                    source: second,
                }),
            ) => {
                return Err(ReplError::ConnectingBoth {
                    first_address,
                    first,
                    second_address,
                    second,
                })
            }
            (Err(e), _) | (_, Err(e)) => return Err(e),
        };
        let first_server = self.read_server(&first, first_params).await?;
        let second_server = self.read_server(&second, second_params).await?;

        let mut base_dns: Vec<Dn> = Vec::new();
        for dn in &request.base_dns {
            let missing: Vec<String> = [&first_server, &second_server]
                .into_iter()
                .filter(|s| ServerDescriptor::is_user_suffix(dn) && !s.has_base_dn(dn))
                .map(|s| s.address())
                .collect();
            if !missing.is_empty() {
                session.warn(format!(
                    "{} is not defined on {}, replication will not be enabled for it",
                    dn,
                    missing.join(" and ")
                ));
            } else if !base_dns.contains(dn) {
                base_dns.push(dn.clone());
            }
        }
        if base_dns.is_empty() {
            return Err(ReplError::CannotEnableOnBaseDn {
                base_dns: join_dns(&request.base_dns),
            });
        }
        let admin_dn = Dn::new(ADMIN_DATA_DN);
        let schema_dn = Dn::new(SCHEMA_DN);
        if !base_dns.contains(&admin_dn) {
            base_dns.push(admin_dn.clone());
        }
        let replicate_schema = request
            .replicate_schema
            .unwrap_or(self.config.replicate_schema);
        if replicate_schema && !base_dns.contains(&schema_dn) {
            base_dns.push(schema_dn.clone());
        }

        session.step("reconciling administration data");
        let first_node = AdsNode::new(&first, ads_properties(first_params));
        let second_node = AdsNode::new(&second, ads_properties(second_params));
        let reconciliation = AdsReconciler::new(&request.administrator)
            .reconcile(&first_node, &second_node)
            .await?;
        self.checkpoint()?;

        session.step("reading the topology");
        let options = DiscoveryOptions {
            bind_dn: request.administrator.bind_dn().to_string(),
            password: request.administrator.password.clone(),
            trust: first_params.trust.clone(),
            preferred_urls: vec![first_params.ldap_url(), second_params.ldap_url()],
            connect_timeout: self.config.connect_timeout(),
            known_servers: vec![first_server.clone(), second_server.clone()],
        };
        let mut caches = vec![TopologyCache::from_servers([
            first_server.clone(),
            second_server.clone(),
        ])];
        for node in [&first_node, &second_node] {
            caches.push(TopologyCache::reload(node.registry(), self.factory.as_ref(), &options).await?);
            self.checkpoint()?;
        }
        let cache = TopologyCache::union(caches);
        self.accept_discovery_errors(session, &cache)?;

        let first_rs = replication_server_address(&first_server, &request.first);
        let second_rs = replication_server_address(&second_server, &request.second);
        let mut suffix_peers: Vec<(Dn, PeerSet)> = Vec::with_capacity(base_dns.len());
        let mut all_replication_servers = PeerSet::new();
        for dn in &base_dns {
            let mut peers = cache.suffix(dn).map(|s| s.peer_servers()).unwrap_or_default();
            peers.insert(first_rs.as_str());
            peers.insert(second_rs.as_str());
            all_replication_servers.extend_from(&peers);
            suffix_peers.push((dn.clone(), peers));
        }

        let mut ids = IdAllocator::new();
        ids.observe_cache(&cache);
        ids.observe_server(&first_server);
        ids.observe_server(&second_server);

        let mut domain_ids: [Vec<(Dn, u32)>; 2] = [Vec::new(), Vec::new()];
        for (index, (client, endpoint)) in [(&first, &request.first), (&second, &request.second)]
            .into_iter()
            .enumerate()
        {
            session.step(format!("configuring replication on {}", client.address()));
            let configurator = ReplicationConfigurator::new(client);
            configurator
                .configure_as_replication_server(
                    endpoint.replication_port,
                    endpoint.secure_replication,
                    &all_replication_servers,
                    &mut ids,
                )
                .await?;
            self.checkpoint()?;
            for (dn, peers) in &suffix_peers {
                let outcome = configurator.configure_domain(dn, peers, &mut ids).await?;
                domain_ids[index].push((dn.clone(), outcome.id));
                self.checkpoint()?;
            }
        }

        let mut touched: BTreeSet<String> = [first_server.key(), second_server.key()].into();
        for server in cache.servers() {
            if server.last_error.is_some() || touched.contains(&server.key()) {
                continue;
            }
            let served: Vec<&(Dn, PeerSet)> = suffix_peers
                .iter()
                .filter(|(dn, _)| server.replica(dn).is_some_and(|r| r.is_replicated()))
                .collect();
            let known_peer = server
                .replication_server_address()
                .is_some_and(|address| all_replication_servers.contains(&address));
            if served.is_empty() && !known_peer {
                continue;
            }
            touched.insert(server.key());
            session.step(format!("updating replication on {}", server.address()));
            let params = server.connection_params(&options.bind_dn, &options.password, &options.trust);
            let client = self.connect(session, &params).await?;
            let configurator = ReplicationConfigurator::new(&client);
            if let (true, Some(port)) = (
                server.properties.is_replication_server,
                server.properties.replication_port,
            ) {
                configurator
                    .configure_as_replication_server(port, false, &all_replication_servers, &mut ids)
                    .await?;
            }
            for (dn, peers) in served {
                configurator.configure_domain(dn, peers, &mut ids).await?;
            }
            self.checkpoint()?;
        }

        let initializer = SuffixInitializer::new(&self.settings, session, &self.cancel);
        if reconciliation.needs_initialization() {
            let source = reconciliation.source;
            let destination = reconciliation.destination();
            self.initialize_between(
                session,
                &initializer,
                side(source, &first, &second),
                side(destination, &first, &second),
                &admin_dn,
                &domain_ids[side_index(source)],
            )
            .await?;
        }
        if replicate_schema
            && first_server.properties.schema_generation_id
                != second_server.properties.schema_generation_id
        {
            let source = request.schema_source;
            self.initialize_between(
                session,
                &initializer,
                side(source, &first, &second),
                side(source.other(), &first, &second),
                &schema_dn,
                &domain_ids[side_index(source)],
            )
            .await?;
        }

        if let (Some(a), Some(b)) = (first_server.clock, second_server.clock) {
            let skew = a.skew(&b);
            report.clock_skew = Some(skew);
            if skew > self.config.skew_threshold() {
                warn!(
                    first = %first.address(),
                    second = %second.address(),
                    skew_secs = skew.as_secs(),
                    "clock skew above threshold"
                );
                session.warn(format!(
                    "the clocks of {} and {} differ by {} seconds, replication needs them synchronized",
                    first.address(),
                    second.address(),
                    skew.as_secs()
                ));
            }
        }

        report.base_dns = base_dns;
        report.discovery_errors = cache.errors().to_vec();
        report.reconciliation = Some(reconciliation);
        Ok(report)
    }

    async fn initialize_between(
        &self,
        session: &Session<'_>,
        initializer: &SuffixInitializer<'_>,
        source: &ReplicationAdminClient,
        destination: &ReplicationAdminClient,
        base_dn: &Dn,
        source_domains: &[(Dn, u32)],
    ) -> Result<()> {
        let domain_id = source_domains
            .iter()
            .find(|(dn, _)| dn == base_dn)
            .map(|(_, id)| *id)
            .ok_or_else(|| ReplError::Initializing {
                address: destination.address().to_string(),
                base_dn: base_dn.to_string(),
                detail: format!("{} has no replication domain for it", source.address()),
            })?;
        session.step(format!(
            "initializing {} on {} from {}",
            base_dn,
            destination.address(),
            source.address()
        ));
        initializer
            .initialize_with_retry(destination, base_dn, domain_id)
            .await?;
        self.checkpoint()
    }

    async fn discover_from(
        &self,
        session: &Session<'_>,
        client: &ReplicationAdminClient,
        params: &ConnectionParams,
        server: &ServerDescriptor,
        confirm: bool,
    ) -> Result<(TopologyCache, bool)> {
        let registry = AdminRegistry::new(client.connection().clone(), client.address());
        let has_admin_data = registry
            .has_admin_data()
            .await
            .map_err(|source| ReplError::ReadingAds {
                address: client.address().to_string(),
                source,
            })?;
        if !has_admin_data {
            debug!(address = %client.address(), "no administration data, topology limited to the server");
            return Ok((TopologyCache::from_servers([server.clone()]), false));
        }
        let options = DiscoveryOptions {
            bind_dn: params.bind_dn.clone(),
            password: params.password.clone(),
            trust: params.trust.clone(),
            preferred_urls: vec![params.ldap_url()],
            connect_timeout: self.config.connect_timeout(),
            known_servers: vec![server.clone()],
        };
        let cache = TopologyCache::union([
            TopologyCache::from_servers([server.clone()]),
            TopologyCache::reload(&registry, self.factory.as_ref(), &options).await?,
        ]);
        self.checkpoint()?;
        if confirm {
            self.accept_discovery_errors(session, &cache)?;
        }
        Ok((cache, true))
    }

    async fn disable(&self, session: &Session<'_>, request: &DisableRequest) -> Result<OperationReport> {
        let mut report = OperationReport::new("disable");
        session.step(format!("connecting to {}", request.server.address()));
        let client = self.connect(session, &request.server).await?;
        let server = self.read_server(&client, &request.server).await?;

        let domains: Vec<Dn> = server
            .replicas
            .iter()
            .filter(|r| r.domain_id.is_some())
            .map(|r| r.base_dn.clone())
            .collect();
        let base_dns: Vec<Dn> = if request.disable_all {
            domains.clone()
        } else {
            let mut selected = Vec::new();
            for dn in &request.base_dns {
                if !domains.contains(dn) {
                    session.warn(format!("{} is not replicated on {}", dn, server.address()));
                } else if !selected.contains(dn) {
                    selected.push(dn.clone());
                }
            }
            selected
        };
        let remaining = domains.iter().filter(|d| !base_dns.contains(d)).count();
        let drop_replication_server =
            server.properties.is_replication_server && (request.disable_all || remaining == 0);
        if base_dns.is_empty() && !drop_replication_server {
            let requested = if request.disable_all {
                String::from("(none replicated)")
            } else {
                join_dns(&request.base_dns)
            };
            return Err(ReplError::CannotDisableOnBaseDn { base_dns: requested });
        }

        session.step("reading the topology");
        let (cache, has_admin_data) = self
            .discover_from(session, &client, &request.server, &server, true)
            .await?;

        let configurator = ReplicationConfigurator::new(&client);
        for dn in &base_dns {
            session.step(format!("disabling replication of {} on {}", dn, server.address()));
            configurator.remove_domain(dn).await?;
            self.checkpoint()?;
        }
        if drop_replication_server {
            session.step(format!("removing the replication server of {}", server.address()));
            configurator.remove_replication_server().await?;
            self.checkpoint()?;
        }

        if let Some(removed) = server.replication_server_address() {
            for other in cache.servers() {
                if other.key() == server.key() || other.last_error.is_some() {
                    continue;
                }
                let references_domain = base_dns
                    .iter()
                    .any(|dn| other.replica(dn).is_some_and(|r| r.peers.contains(&removed)));
                let references_server = drop_replication_server && other.properties.is_replication_server;
                if !references_domain && !references_server {
                    continue;
                }
                let params = peer_params(other, &request.server);
                let other_client = self.connect(session, &params).await?;
                let cleanup = ReplicationConfigurator::new(&other_client)
                    .remove_peer_references(&removed, Some(&base_dns), drop_replication_server)
                    .await?;
                if !cleanup.is_empty() {
                    session.step(format!("removed references to {} on {}", removed, other.address()));
                }
                self.checkpoint()?;
            }
        }

        if drop_replication_server && has_admin_data {
            let admin_dn = Dn::new(ADMIN_DATA_DN);
            if let Some(other) = cache.servers().iter().find(|o| {
                o.key() != server.key() && o.last_error.is_none() && o.has_base_dn(&admin_dn)
            }) {
                let params = peer_params(other, &request.server);
                let other_client = self.connect(session, &params).await?;
                AdminRegistry::new(other_client.connection().clone(), other_client.address())
                    .unregister_server(&ads_properties(&request.server))
                    .await
                    .map_err(|source| ReplError::UpdatingAds {
                        address: other_client.address().to_string(),
                        source,
                    })?;
            }
        }

        report.base_dns = base_dns;
        report.discovery_errors = cache.errors().to_vec();
        Ok(report)
    }

    async fn initialize(&self, session: &Session<'_>, request: &InitializeRequest) -> Result<OperationReport> {
        let mut report = OperationReport::new("initialize");
        let source = self.connect(session, &request.source).await?;
        let destination = self.connect(session, &request.destination).await?;
        let source_server = self.read_server(&source, &request.source).await?;
        let destination_server = self.read_server(&destination, &request.destination).await?;

        let mut selected: Vec<(Dn, u32)> = Vec::new();
        for dn in &request.base_dns {
            let source_id = source_server.replica(dn).and_then(|r| r.domain_id);
            match source_id {
                Some(id) if is_replicated_between(&source_server, &destination_server, dn) => {
                    if !selected.iter().any(|(d, _)| d == dn) {
                        selected.push((dn.clone(), id));
                    }
                }
                _ => session.warn(format!(
                    "{} is not replicated between {} and {}",
                    dn,
                    source.address(),
                    destination.address()
                )),
            }
        }
        if selected.is_empty() {
            return Err(ReplError::CannotInitializeOnBaseDn {
                base_dns: join_dns(&request.base_dns),
            });
        }

        let initializer = SuffixInitializer::new(&self.settings, session, &self.cancel);
        for (dn, source_id) in &selected {
            session.step(format!(
                "initializing {} on {} from {}",
                dn,
                destination.address(),
                source.address()
            ));
            initializer
                .initialize_with_retry(&destination, dn, *source_id)
                .await?;
            self.checkpoint()?;
        }
        report.base_dns = selected.into_iter().map(|(dn, _)| dn).collect();
        Ok(report)
    }

    async fn initialize_all(
        &self,
        session: &Session<'_>,
        request: &InitializeAllRequest,
    ) -> Result<OperationReport> {
        let mut report = OperationReport::new("initialize-all");
        let source = self.connect(session, &request.source).await?;
        let server = self.read_server(&source, &request.source).await?;
        let base_dns = replicated_subset(session, &server, &request.base_dns);
        if base_dns.is_empty() {
            return Err(ReplError::CannotInitializeOnBaseDn {
                base_dns: join_dns(&request.base_dns),
            });
        }

        let initializer = SuffixInitializer::new(&self.settings, session, &self.cancel);
        for dn in &base_dns {
            session.step(format!("initializing every replica of {} from {}", dn, source.address()));
            initializer.initialize_all(&source, dn).await?;
            self.checkpoint()?;
        }
        report.base_dns = base_dns;
        Ok(report)
    }

    async fn external_initialization(
        &self,
        session: &Session<'_>,
        request: &ExternalInitializationRequest,
        pre: bool,
    ) -> Result<OperationReport> {
        let mut report = OperationReport::new(if pre {
            "pre-external-initialization"
        } else {
            "post-external-initialization"
        });
        let client = self.connect(session, &request.server).await?;
        let server = self.read_server(&client, &request.server).await?;
        let base_dns = replicated_subset(session, &server, &request.base_dns);
        if base_dns.is_empty() {
            return Err(ReplError::CannotInitializeOnBaseDn {
                base_dns: join_dns(&request.base_dns),
            });
        }

        let resetter = GenerationIdResetter::new(&self.settings, session, &self.cancel);
        for dn in &base_dns {
            if pre {
                session.step(format!("preparing {} on {} for an external copy", dn, client.address()));
                resetter.pre_external_initialization(&client, dn).await?;
            } else {
                session.step(format!("resetting {} on {} after an external copy", dn, client.address()));
                resetter.post_external_initialization(&client, dn).await?;
            }
            self.checkpoint()?;
        }
        report.base_dns = base_dns;
        Ok(report)
    }

    async fn status(&self, session: &Session<'_>, request: &StatusRequest) -> Result<OperationReport> {
        let mut report = OperationReport::new("status");
        let client = self.connect(session, &request.server).await?;
        let server = self.read_server(&client, &request.server).await?;
        let (cache, _) = self
            .discover_from(session, &client, &request.server, &server, false)
            .await?;
        report.base_dns = request.base_dns.clone();
        report.discovery_errors = cache.errors().to_vec();
        report.status = Some(StatusReport::from_cache(&cache, &request.base_dns));
        Ok(report)
    }
}

fn side<'c>(
    side: AdsSide,
    first: &'c ReplicationAdminClient,
    second: &'c ReplicationAdminClient,
) -> &'c ReplicationAdminClient {
    match side {
        AdsSide::First => first,
        AdsSide::Second => second,
    }
}

fn side_index(side: AdsSide) -> usize {
    match side {
        AdsSide::First => 0,
        AdsSide::Second => 1,
    }
}

/// Registry entry describing the server reached through `params`.
fn ads_properties(params: &ConnectionParams) -> AdsServerProperties {
    let mut properties = AdsServerProperties::new(&params.host, params.port);
    match params.protocol {
        Protocol::Ldap => {}
        Protocol::StartTls => properties.starttls_enabled = true,
        Protocol::Ldaps => {
            properties.ldap_enabled = false;
            properties.ldaps_enabled = true;
            properties.ldaps_port = Some(params.port);
        }
    }
    properties
}

/// Existing replication server address, or the one the endpoint will get.
fn replication_server_address(server: &ServerDescriptor, endpoint: &ServerEndpoint) -> String {
    server
        .replication_server_address()
        .unwrap_or_else(|| peer_address(&server.host, endpoint.replication_port))
}

fn peer_params(server: &ServerDescriptor, credentials: &ConnectionParams) -> ConnectionParams {
    server.connection_params(&credentials.bind_dn, &credentials.password, &credentials.trust)
}

fn replicated_subset(session: &Session<'_>, server: &ServerDescriptor, requested: &[Dn]) -> Vec<Dn> {
    let mut selected = Vec::new();
    for dn in requested {
        if !server.replica(dn).is_some_and(|r| r.is_replicated()) {
            session.warn(format!("{} is not replicated on {}", dn, server.address()));
        } else if !selected.contains(dn) {
            selected.push(dn.clone());
        }
    }
    selected
}
