//! Administration data store (ADS) access.
//!
//! The ADS lives under `cn=admin data` on every server that has been joined
//! to a topology. It holds the registry of servers, the global
//! administrators and the instance keys used to seed trust between nodes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::admin_client::{layout, ReplicationAdminClient, TrustedCertificate};
use crate::directory::{
    ConnectionParams, DirectoryConnection, DirectoryError, Entry, Filter, Modification, Protocol,
    SearchScope,
};
use crate::dn::{escape_value, Dn, ADMIN_DATA_DN};

const SERVERS_RDN: &str = "cn=Servers";
const ADMINISTRATORS_RDN: &str = "cn=Administrators";
const SERVER_GROUPS_RDN: &str = "cn=Server Groups";
const ALL_SERVERS_GROUP_RDN: &str = "cn=all-servers";
const INSTANCE_KEYS_RDN: &str = "cn=instance keys";

/// Backend id used for the administration suffix.
pub const ADMIN_BACKEND_ID: &str = "adminRoot";

/// A server as registered in the ADS.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AdsServerProperties {
    /// Host name.
    pub host: String,
    /// LDAP port.
    pub ldap_port: u16,
    /// LDAPS port.
    pub ldaps_port: Option<u16>,
    /// Plain LDAP listener enabled.
    pub ldap_enabled: bool,
    /// LDAPS listener enabled.
    pub ldaps_enabled: bool,
    /// StartTLS allowed on the LDAP listener.
    pub starttls_enabled: bool,
    /// Key id of the instance certificate.
    pub instance_key_id: Option<String>,
}

impl AdsServerProperties {
    /// Properties for a plain LDAP server.
    pub fn new(host: &str, ldap_port: u16) -> Self {
        Self {
            host: host.to_string(),
            ldap_port,
            ldaps_port: None,
            ldap_enabled: true,
            ldaps_enabled: false,
            starttls_enabled: false,
            instance_key_id: None,
        }
    }

    /// Registry id: `host:ldap_port`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.ldap_port)
    }

    /// Lower-cased id, comparable with `ServerDescriptor::key`.
    pub fn key(&self) -> String {
        self.id().to_lowercase()
    }

    /// Ways to reach this server, most plain first.
    pub fn connection_candidates(&self) -> Vec<ConnectionParams> {
        let mut candidates = Vec::new();
        if self.ldap_enabled {
            candidates.push(ConnectionParams::new(self.host.as_str(), self.ldap_port));
            if self.starttls_enabled {
                candidates.push(
                    ConnectionParams::new(self.host.as_str(), self.ldap_port)
                        .with_protocol(Protocol::StartTls),
                );
            }
        }
        if let (true, Some(port)) = (self.ldaps_enabled, self.ldaps_port) {
            candidates.push(ConnectionParams::new(self.host.as_str(), port).with_protocol(Protocol::Ldaps));
        }
        candidates
    }

    fn to_entry(&self, dn: Dn) -> Entry {
        let mut entry = Entry::new(dn)
            .with("objectclass", ["top", "ds-cfg-branch", "extensibleobject"])
            .with("cn", [self.id()])
            .with("id", [self.id()])
            .with("hostname", [self.host.as_str()])
            .with("ldapport", [self.ldap_port.to_string()])
            .with("ldapenabled", [bool_value(self.ldap_enabled)])
            .with("ldapsenabled", [bool_value(self.ldaps_enabled)])
            .with("starttlsenabled", [bool_value(self.starttls_enabled)]);
        if let Some(port) = self.ldaps_port {
            entry.set("ldapsport", [port.to_string()]);
        }
        if let Some(key_id) = &self.instance_key_id {
            entry.set(layout::ATTR_KEY_ID, [key_id.as_str()]);
        }
        entry
    }

    fn from_entry(entry: &Entry) -> Option<Self> {
        Some(Self {
            host: entry.first("hostname")?.to_string(),
            ldap_port: entry.first_parsed("ldapport")?,
            ldaps_port: entry.first_parsed("ldapsport"),
            ldap_enabled: entry.first_bool("ldapenabled").unwrap_or(true),
            ldaps_enabled: entry.first_bool("ldapsenabled").unwrap_or(false),
            starttls_enabled: entry.first_bool("starttlsenabled").unwrap_or(false),
            instance_key_id: entry.first(layout::ATTR_KEY_ID).map(str::to_string),
        })
    }
}

fn bool_value(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// A global administrator.
#[derive(Clone, PartialEq, Eq)]
pub struct AdministratorProperties {
    /// Login id.
    pub uid: String,
    /// Password.
    pub password: String,
    /// Free text.
    pub description: Option<String>,
}

impl std::fmt::Debug for AdministratorProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdministratorProperties")
            .field("uid", &self.uid)
            .field("password", &"<redacted>")
            .field("description", &self.description)
            .finish()
    }
}

impl AdministratorProperties {
    /// Administrator with the given uid and password.
    pub fn new(uid: &str, password: &str) -> Self {
        Self {
            uid: uid.to_string(),
            password: password.to_string(),
            description: None,
        }
    }

    /// DN to bind as this administrator.
    pub fn bind_dn(&self) -> Dn {
        administrator_dn(&self.uid)
    }
}

/// Bind DN of the administrator `uid`.
pub fn administrator_dn(uid: &str) -> Dn {
    admin_data()
        .child(ADMINISTRATORS_RDN)
        .child(&format!("cn={}", escape_value(uid)))
}

fn admin_data() -> Dn {
    Dn::new(ADMIN_DATA_DN)
}

fn servers_dn() -> Dn {
    admin_data().child(SERVERS_RDN)
}

fn server_dn(id: &str) -> Dn {
    servers_dn().child(&format!("cn={}", escape_value(id)))
}

fn all_servers_group_dn() -> Dn {
    admin_data().child(SERVER_GROUPS_RDN).child(ALL_SERVERS_GROUP_RDN)
}

fn instance_keys_dn() -> Dn {
    admin_data().child(INSTANCE_KEYS_RDN)
}

/// ADS operations over one connection.
#[derive(Clone)]
pub struct AdminRegistry {
    conn: Arc<dyn DirectoryConnection>,
    address: String,
}

impl AdminRegistry {
    /// Wrap an open connection.
    pub fn new(conn: Arc<dyn DirectoryConnection>, address: impl Into<String>) -> Self {
        Self {
            conn,
            address: address.into(),
        }
    }

    /// host:port of the server.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// True if the administration suffix and its server container exist.
    pub async fn has_admin_data(&self) -> Result<bool, DirectoryError> {
        if self.conn.read(&admin_data(), &[]).await?.is_none() {
            return Ok(false);
        }
        Ok(self.conn.read(&servers_dn(), &[]).await?.is_some())
    }

    /// Create the administration suffix skeleton. Existing pieces are kept.
    pub async fn create_admin_data(&self) -> Result<(), DirectoryError> {
        ReplicationAdminClient::new(self.conn.clone(), self.address.as_str())
            .ensure_backend(ADMIN_BACKEND_ID, &admin_data())
            .await?;
        let containers = [
            admin_data(),
            servers_dn(),
            admin_data().child(ADMINISTRATORS_RDN),
            admin_data().child(SERVER_GROUPS_RDN),
            instance_keys_dn(),
        ];
        for dn in containers {
            let entry = Entry::new(dn).with("objectclass", ["top", "ds-cfg-branch"]);
            self.add_if_missing(entry).await?;
        }
        let group = Entry::new(all_servers_group_dn())
            .with("objectclass", ["top", "groupOfUniqueNames"])
            .with("cn", ["all-servers"]);
        self.add_if_missing(group).await?;
        info!(address = %self.address, "administration data created");
        Ok(())
    }

    async fn add_if_missing(&self, entry: Entry) -> Result<(), DirectoryError> {
        match self.conn.add(entry).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Register a server, publishing its instance certificate if given.
    pub async fn register_server(
        &self,
        server: &AdsServerProperties,
        certificate: Option<&TrustedCertificate>,
    ) -> Result<(), DirectoryError> {
        let mut server = server.clone();
        if let Some(cert) = certificate {
            server.instance_key_id = Some(cert.key_id.clone());
            let key_entry = Entry::new(
                instance_keys_dn().child(&format!("{}={}", layout::ATTR_KEY_ID, escape_value(&cert.key_id))),
            )
            .with("objectclass", ["top", "ds-cfg-instance-key"])
            .with(layout::ATTR_KEY_ID, [cert.key_id.as_str()])
            .with(layout::ATTR_PUBLIC_KEY_CERTIFICATE, [cert.certificate.as_str()]);
            self.add_if_missing(key_entry).await?;
        }
        let dn = server_dn(&server.id());
        match self.conn.add(server.to_entry(dn.clone())).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                self.conn.delete(&dn).await?;
                self.conn.add(server.to_entry(dn.clone())).await?;
            }
            Err(e) => return Err(e),
        }
        let member = Modification::Add {
            attr: "uniquemember".to_string(),
            values: vec![format!("cn={}", server.id())],
        };
        match self.conn.modify(&all_servers_group_dn(), &[member]).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        info!(address = %self.address, server = %server.id(), "server registered");
        Ok(())
    }

    /// Remove a server from the registry.
    pub async fn unregister_server(&self, server: &AdsServerProperties) -> Result<(), DirectoryError> {
        match self.conn.delete(&server_dn(&server.id())).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let member = Modification::Delete {
            attr: "uniquemember".to_string(),
            values: vec![format!("cn={}", server.id())],
        };
        match self.conn.modify(&all_servers_group_dn(), &[member]).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        info!(address = %self.address, server = %server.id(), "server unregistered");
        Ok(())
    }

    /// Every registered server.
    pub async fn read_server_registry(&self) -> Result<BTreeSet<AdsServerProperties>, DirectoryError> {
        let entries = self
            .conn
            .search(&servers_dn(), SearchScope::OneLevel, &Filter::any(), &[])
            .await?;
        Ok(entries.iter().filter_map(AdsServerProperties::from_entry).collect())
    }

    /// True if `server` is in the registry.
    pub async fn is_registered(&self, server: &AdsServerProperties) -> Result<bool, DirectoryError> {
        Ok(self
            .read_server_registry()
            .await?
            .iter()
            .any(|s| s.key() == server.key()))
    }

    /// Create a global administrator.
    pub async fn create_administrator(
        &self,
        admin: &AdministratorProperties,
    ) -> Result<(), DirectoryError> {
        let mut entry = Entry::new(admin.bind_dn())
            .with("objectclass", ["top", "person"])
            .with("cn", [admin.uid.as_str()])
            .with("sn", [admin.uid.as_str()])
            .with("userpassword", [admin.password.as_str()]);
        if let Some(description) = &admin.description {
            entry.set("description", [description.as_str()]);
        }
        self.conn.add(entry).await?;
        info!(address = %self.address, uid = %admin.uid, "global administrator created");
        Ok(())
    }

    /// True if an administrator with this uid exists.
    pub async fn has_administrator(&self, uid: &str) -> Result<bool, DirectoryError> {
        Ok(self.conn.read(&administrator_dn(uid), &[]).await?.is_some())
    }

    /// Uids of every administrator.
    pub async fn read_administrator_registry(&self) -> Result<Vec<String>, DirectoryError> {
        let entries = self
            .conn
            .search(
                &admin_data().child(ADMINISTRATORS_RDN),
                SearchScope::OneLevel,
                &Filter::any(),
                &["cn"],
            )
            .await?;
        Ok(entries
            .iter()
            .filter_map(|e| e.first("cn").map(str::to_string))
            .collect())
    }

    /// Instance certificates published in the ADS.
    pub async fn get_trusted_certificates(&self) -> Result<Vec<TrustedCertificate>, DirectoryError> {
        let entries = match self
            .conn
            .search(&instance_keys_dn(), SearchScope::OneLevel, &Filter::any(), &[])
            .await
        {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let certificates: Vec<TrustedCertificate> = entries
            .iter()
            .filter_map(|e| {
                Some(TrustedCertificate {
                    key_id: e.first(layout::ATTR_KEY_ID)?.to_string(),
                    certificate: e.first(layout::ATTR_PUBLIC_KEY_CERTIFICATE)?.to_string(),
                })
            })
            .collect();
        debug!(address = %self.address, count = certificates.len(), "trusted certificates read");
        Ok(certificates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ConnectionFactory;
    use crate::memory::{InMemoryDirectory, InMemoryNetwork};

    async fn registry() -> AdminRegistry {
        let dir = Arc::new(InMemoryDirectory::new("ldap1", 389).with_root_user("cn=dm", "pw"));
        let mut net = InMemoryNetwork::new();
        net.attach(dir);
        let conn = net
            .connect(&ConnectionParams::new("ldap1", 389).with_credentials("cn=dm", "pw"))
            .await
            .unwrap();
        AdminRegistry::new(conn, "ldap1:389")
    }

    #[tokio::test]
    async fn test_create_admin_data_is_idempotent() {
        let ads = registry().await;
        assert!(!ads.has_admin_data().await.unwrap());
        ads.create_admin_data().await.unwrap();
        ads.create_admin_data().await.unwrap();
        assert!(ads.has_admin_data().await.unwrap());
        assert!(ads.read_server_registry().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_and_unregister_server() {
        let ads = registry().await;
        ads.create_admin_data().await.unwrap();
        let server = AdsServerProperties::new("ldap2.example.com", 389);
        let cert = TrustedCertificate {
            key_id: "k2".to_string(),
            certificate: "MIIcert2".to_string(),
        };
        ads.register_server(&server, Some(&cert)).await.unwrap();
        // re-registration replaces the entry
        ads.register_server(&server, Some(&cert)).await.unwrap();

        let registry = ads.read_server_registry().await.unwrap();
        assert_eq!(registry.len(), 1);
        let stored = registry.iter().next().unwrap();
        assert_eq!(stored.instance_key_id.as_deref(), Some("k2"));
        assert!(ads.is_registered(&AdsServerProperties::new("LDAP2.example.com", 389)).await.unwrap());
        assert_eq!(ads.get_trusted_certificates().await.unwrap(), vec![cert]);

        ads.unregister_server(&server).await.unwrap();
        assert!(ads.read_server_registry().await.unwrap().is_empty());
        ads.unregister_server(&server).await.unwrap();
    }

    #[tokio::test]
    async fn test_administrators() {
        let ads = registry().await;
        ads.create_admin_data().await.unwrap();
        assert!(!ads.has_administrator("admin").await.unwrap());
        let admin = AdministratorProperties::new("admin", "secret");
        ads.create_administrator(&admin).await.unwrap();
        assert!(ads.has_administrator("admin").await.unwrap());
        assert_eq!(ads.read_administrator_registry().await.unwrap(), vec!["admin".to_string()]);
        assert!(ads.create_administrator(&admin).await.unwrap_err().is_already_exists());
        assert!(!format!("{:?}", admin).contains("secret"));
    }

    #[test]
    fn test_connection_candidates() {
        let mut props = AdsServerProperties::new("ldap1", 389);
        props.starttls_enabled = true;
        props.ldaps_enabled = true;
        props.ldaps_port = Some(636);
        let urls: Vec<String> = props.connection_candidates().iter().map(|p| p.ldap_url()).collect();
        assert_eq!(urls, vec!["ldap://ldap1:389", "ldap://ldap1:389", "ldaps://ldap1:636"]);
        assert_eq!(props.connection_candidates()[1].protocol, Protocol::StartTls);
    }

    #[test]
    fn test_administrator_dn() {
        assert_eq!(
            administrator_dn("admin"),
            Dn::new("cn=admin,cn=Administrators,cn=admin data")
        );
    }
}
