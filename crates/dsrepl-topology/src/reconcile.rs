//! Alignment of the administration data of two nodes being joined.
//!
//! Exactly one node ends up as the source of administrative truth. The
//! other node is registered in the source's registry, receives the source's
//! instance certificates in its trust store, and later has its
//! administration suffix initialized from the source. Two registries that
//! each know other servers and disagree are never merged.

use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::admin_client::{ReplicationAdminClient, TrustedCertificate};
use crate::ads::{AdminRegistry, AdministratorProperties, AdsServerProperties};
use crate::directory::DirectoryError;
use crate::error::{ReplError, Result};

/// One of the two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdsSide {
    /// The first node of the request.
    First,
    /// The second node of the request.
    Second,
}

impl AdsSide {
    /// The other side.
    pub fn other(self) -> Self {
        match self {
            AdsSide::First => AdsSide::Second,
            AdsSide::Second => AdsSide::First,
        }
    }
}

/// How the two registries were reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileCase {
    /// The registry of the destination only knew itself; it joins the source.
    Joined,
    /// Both registries were already identical.
    AlreadyShared,
    /// Only the source had administration data.
    Adopted,
    /// Neither node had administration data; it was created on the first.
    Bootstrapped,
}

/// Outcome of a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    /// Node holding the authoritative administration data.
    pub source: AdsSide,
    /// Which case applied.
    pub case: ReconcileCase,
    /// Key ids added to the destination trust store.
    pub seeded_certificates: usize,
}

impl Reconciliation {
    /// Node whose administration data must be initialized from the source.
    pub fn destination(&self) -> AdsSide {
        self.source.other()
    }

    /// True if the administration suffix must still be copied.
    pub fn needs_initialization(&self) -> bool {
        self.case != ReconcileCase::AlreadyShared
    }
}

/// A node taking part in reconciliation.
pub struct AdsNode<'a> {
    client: &'a ReplicationAdminClient,
    registry: AdminRegistry,
    properties: AdsServerProperties,
}

impl<'a> AdsNode<'a> {
    /// The node behind `client`, registered with `properties`.
    pub fn new(client: &'a ReplicationAdminClient, properties: AdsServerProperties) -> Self {
        Self {
            registry: AdminRegistry::new(client.connection().clone(), client.address()),
            client,
            properties,
        }
    }

    /// Its administration registry.
    pub fn registry(&self) -> &AdminRegistry {
        &self.registry
    }

    fn address(&self) -> String {
        self.client.address().to_string()
    }

    fn reading(&self, source: DirectoryError) -> ReplError {
        ReplError::ReadingAds {
            address: self.address(),
            source,
        }
    }

    fn updating(&self, source: DirectoryError) -> ReplError {
        ReplError::UpdatingAds {
            address: self.address(),
            source,
        }
    }

    async fn has_admin_data(&self) -> Result<bool> {
        self.registry.has_admin_data().await.map_err(|e| self.reading(e))
    }

    async fn server_registry(&self) -> Result<BTreeSet<AdsServerProperties>> {
        self.registry
            .read_server_registry()
            .await
            .map_err(|e| self.reading(e))
    }

    async fn certificate(&self) -> Result<Option<TrustedCertificate>> {
        self.client
            .instance_certificate()
            .await
            .map_err(|e| self.reading(e))
    }
}

/// Reconciles the administration data of two nodes.
pub struct AdsReconciler<'a> {
    administrator: &'a AdministratorProperties,
}

impl<'a> AdsReconciler<'a> {
    /// Reconcile, creating `administrator` where none exists.
    pub fn new(administrator: &'a AdministratorProperties) -> Self {
        Self { administrator }
    }

    /// Decide the source of truth, register both nodes in it and seed the
    /// destination's trust store.
    pub async fn reconcile(&self, first: &AdsNode<'_>, second: &AdsNode<'_>) -> Result<Reconciliation> {
        let first_has = first.has_admin_data().await?;
        let second_has = second.has_admin_data().await?;

        let (source, case) = match (first_has, second_has) {
            (true, true) => {
                let first_registry = first.server_registry().await?;
                let second_registry = second.server_registry().await?;
                if second_registry.len() <= 1 {
                    (AdsSide::First, ReconcileCase::Joined)
                } else if first_registry.len() <= 1 {
                    (AdsSide::Second, ReconcileCase::Joined)
                } else if first_registry == second_registry {
                    (AdsSide::First, ReconcileCase::AlreadyShared)
                } else {
                    return Err(ReplError::AdsMergeNotSupported {
                        first: first.address(),
                        second: second.address(),
                    });
                }
            }
            (true, false) => (AdsSide::First, ReconcileCase::Adopted),
            (false, true) => (AdsSide::Second, ReconcileCase::Adopted),
            (false, false) => {
                first
                    .registry
                    .create_admin_data()
                    .await
                    .map_err(|e| first.updating(e))?;
                (AdsSide::First, ReconcileCase::Bootstrapped)
            }
        };

        let (src, dst) = match source {
            AdsSide::First => (first, second),
            AdsSide::Second => (second, first),
        };
        info!(
            source = %src.address(),
            destination = %dst.address(),
            case = ?case,
            "administration data source chosen"
        );

        if case != ReconcileCase::AlreadyShared {
            self.ensure_administrator(src).await?;
            self.ensure_registered(src, src).await?;
            self.ensure_registered(src, dst).await?;
            if !dst.has_admin_data().await? {
                dst.registry
                    .create_admin_data()
                    .await
                    .map_err(|e| dst.updating(e))?;
            }
        }

        let seeded_certificates = seed_trust_store(src, dst).await?;
        Ok(Reconciliation {
            source,
            case,
            seeded_certificates,
        })
    }

    async fn ensure_administrator(&self, node: &AdsNode<'_>) -> Result<()> {
        let exists = node
            .registry
            .has_administrator(&self.administrator.uid)
            .await
            .map_err(|e| node.reading(e))?;
        if exists {
            debug!(address = %node.address(), uid = %self.administrator.uid, "global administrator exists");
            return Ok(());
        }
        node.registry
            .create_administrator(self.administrator)
            .await
            .map_err(|e| node.updating(e))
    }

    async fn ensure_registered(&self, registry: &AdsNode<'_>, server: &AdsNode<'_>) -> Result<()> {
        let registered = registry
            .registry
            .is_registered(&server.properties)
            .await
            .map_err(|e| registry.reading(e))?;
        if registered {
            return Ok(());
        }
        let certificate = server.certificate().await?;
        registry
            .registry
            .register_server(&server.properties, certificate.as_ref())
            .await
            .map_err(|e| registry.updating(e))
    }
}

async fn seed_trust_store(src: &AdsNode<'_>, dst: &AdsNode<'_>) -> Result<usize> {
    let seeding = |address: String| {
        move |source: DirectoryError| ReplError::SeedingTrustStore { address, source }
    };
    let certificates = src
        .registry
        .get_trusted_certificates()
        .await
        .map_err(seeding(src.address()))?;
    let mut added = 0;
    for certificate in &certificates {
        if dst
            .client
            .add_trusted_certificate(certificate)
            .await
            .map_err(seeding(dst.address()))?
        {
            added += 1;
        }
    }
    info!(
        source = %src.address(),
        destination = %dst.address(),
        added,
        total = certificates.len(),
        "trust store seeded"
    );
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{ConnectionFactory, ConnectionParams};
    use crate::error::ReturnCode;
    use crate::memory::{InMemoryDirectory, InMemoryNetwork};
    use std::sync::Arc;

    const ROOT: (&str, &str) = ("cn=Directory Manager", "pw");

    async fn node(host: &str, key_id: &str) -> (Arc<InMemoryDirectory>, ReplicationAdminClient) {
        let dir = Arc::new(
            InMemoryDirectory::new(host, 389)
                .with_root_user(ROOT.0, ROOT.1)
                .with_instance_certificate(key_id, &format!("MII{}", key_id)),
        );
        let mut net = InMemoryNetwork::new();
        net.attach(dir.clone());
        let conn = net
            .connect(&ConnectionParams::new(host, 389).with_credentials(ROOT.0, ROOT.1))
            .await
            .unwrap();
        (dir, ReplicationAdminClient::new(conn, format!("{}:389", host)))
    }

    fn admin() -> AdministratorProperties {
        AdministratorProperties::new("admin", "secret")
    }

    #[tokio::test]
    async fn test_bootstrap_when_neither_has_ads() {
        let (_, a) = node("a", "ka").await;
        let (_, b) = node("b", "kb").await;
        let first = AdsNode::new(&a, AdsServerProperties::new("a", 389));
        let second = AdsNode::new(&b, AdsServerProperties::new("b", 389));
        let admin = admin();
        let result = AdsReconciler::new(&admin).reconcile(&first, &second).await.unwrap();

        assert_eq!(result.source, AdsSide::First);
        assert_eq!(result.case, ReconcileCase::Bootstrapped);
        assert!(result.needs_initialization());
        assert_eq!(first.registry().read_server_registry().await.unwrap().len(), 2);
        assert!(first.registry().has_administrator("admin").await.unwrap());
        // the destination gets the skeleton and trusts both instance keys
        assert!(second.registry().has_admin_data().await.unwrap());
        let mut trusted = b.trusted_key_ids().await.unwrap();
        trusted.sort();
        assert_eq!(trusted, vec!["ka".to_string(), "kb".to_string()]);
        assert_eq!(result.seeded_certificates, 2);
    }

    #[tokio::test]
    async fn test_fresh_node_joins_existing_ads() {
        let (_, a) = node("a", "ka").await;
        let (_, b) = node("b", "kb").await;
        let existing = AdsNode::new(&b, AdsServerProperties::new("b", 389));
        existing.registry().create_admin_data().await.unwrap();
        for host in ["b", "c"] {
            existing
                .registry()
                .register_server(&AdsServerProperties::new(host, 389), None)
                .await
                .unwrap();
        }
        let fresh = AdsNode::new(&a, AdsServerProperties::new("a", 389));
        let admin = admin();
        let result = AdsReconciler::new(&admin).reconcile(&fresh, &existing).await.unwrap();

        assert_eq!(result.source, AdsSide::Second);
        assert_eq!(result.destination(), AdsSide::First);
        assert_eq!(result.case, ReconcileCase::Adopted);
        let ids: Vec<String> = existing
            .registry()
            .read_server_registry()
            .await
            .unwrap()
            .iter()
            .map(AdsServerProperties::id)
            .collect();
        assert_eq!(ids, vec!["a:389", "b:389", "c:389"]);
    }

    #[tokio::test]
    async fn test_single_entry_registry_joins_the_other() {
        let (_, a) = node("a", "ka").await;
        let (_, b) = node("b", "kb").await;
        let first = AdsNode::new(&a, AdsServerProperties::new("a", 389));
        let second = AdsNode::new(&b, AdsServerProperties::new("b", 389));
        for (n, others) in [(&first, vec!["a", "x"]), (&second, vec!["b"])] {
            n.registry().create_admin_data().await.unwrap();
            for host in others {
                n.registry()
                    .register_server(&AdsServerProperties::new(host, 389), None)
                    .await
                    .unwrap();
            }
        }
        let admin = admin();
        let result = AdsReconciler::new(&admin).reconcile(&first, &second).await.unwrap();
        assert_eq!(result.source, AdsSide::First);
        assert_eq!(result.case, ReconcileCase::Joined);
        assert!(first
            .registry()
            .is_registered(&AdsServerProperties::new("b", 389))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_divergent_registries_are_not_merged() {
        let (_, a) = node("a", "ka").await;
        let (_, b) = node("b", "kb").await;
        let first = AdsNode::new(&a, AdsServerProperties::new("a", 389));
        let second = AdsNode::new(&b, AdsServerProperties::new("b", 389));
        for (n, others) in [(&first, ["a", "x"]), (&second, ["b", "y"])] {
            n.registry().create_admin_data().await.unwrap();
            for host in others {
                n.registry()
                    .register_server(&AdsServerProperties::new(host, 389), None)
                    .await
                    .unwrap();
            }
        }
        let admin = admin();
        let err = AdsReconciler::new(&admin).reconcile(&first, &second).await.unwrap_err();
        assert_eq!(err.return_code(), ReturnCode::ReplicationAdsMergeNotSupported);
    }

    #[tokio::test]
    async fn test_identical_registries_need_no_initialization() {
        let (_, a) = node("a", "ka").await;
        let (_, b) = node("b", "kb").await;
        let first = AdsNode::new(&a, AdsServerProperties::new("a", 389));
        let second = AdsNode::new(&b, AdsServerProperties::new("b", 389));
        for n in [&first, &second] {
            n.registry().create_admin_data().await.unwrap();
            for host in ["a", "b"] {
                n.registry()
                    .register_server(&AdsServerProperties::new(host, 389), None)
                    .await
                    .unwrap();
            }
        }
        let admin = admin();
        let result = AdsReconciler::new(&admin).reconcile(&first, &second).await.unwrap();
        assert_eq!(result.case, ReconcileCase::AlreadyShared);
        assert!(!result.needs_initialization());
    }
}
