//! Directory connection capability.
//!
//! This module defines the `DirectoryConnection` and `ConnectionFactory`
//! traits that the LDAP transport implements, plus the entry, filter and
//! modification types passed across them. Nothing here knows about the
//! replication configuration layout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::dn::Dn;

/// Structured errors returned by a directory connection.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryError {
    /// Bind credentials were rejected.
    #[error("invalid credentials for {bind_dn}")]
    AuthenticationFailed {
        /// DN used to bind.
        bind_dn: String,
    },

    /// The bound user may not perform the operation.
    #[error("insufficient access rights on {dn}")]
    InsufficientAccess {
        /// Target entry.
        dn: String,
    },

    /// The server certificate was not trusted.
    #[error("certificate not trusted: {reason}")]
    Certificate {
        /// Details from the TLS layer.
        reason: String,
    },

    /// The server could not be reached.
    #[error("cannot connect to {address}: {reason}")]
    Connect {
        /// host:port that was dialed.
        address: String,
        /// Details from the transport.
        reason: String,
    },

    /// Connection establishment exceeded its deadline.
    #[error("connection to {address} timed out after {timeout_ms}ms")]
    Timeout {
        /// host:port that was dialed.
        address: String,
        /// Deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The target entry does not exist.
    #[error("no such entry: {dn}")]
    NoSuchObject {
        /// Missing entry.
        dn: String,
    },

    /// The entry being added already exists.
    #[error("entry already exists: {dn}")]
    AlreadyExists {
        /// Conflicting entry.
        dn: String,
    },

    /// A configuration attribute is missing or does not parse.
    #[error("invalid {attr} on {dn}: {}", .value.as_deref().unwrap_or("missing"))]
    InvalidAttribute {
        /// Entry holding the attribute.
        dn: String,
        /// Attribute name.
        attr: String,
        /// Raw value, if there was one.
        value: Option<String>,
    },

    /// Any other LDAP result.
    #[error("LDAP error {code}: {message}")]
    Other {
        /// LDAP result code.
        code: u32,
        /// Diagnostic message.
        message: String,
    },
}

impl DirectoryError {
    /// True for "no such object".
    pub fn is_not_found(&self) -> bool {
        matches!(self, DirectoryError::NoSuchObject { .. })
    }

    /// True for "entry already exists".
    pub fn is_already_exists(&self) -> bool {
        matches!(self, DirectoryError::AlreadyExists { .. })
    }
}

/// Search scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchScope {
    /// Only the base entry.
    Base,
    /// Immediate children of the base.
    OneLevel,
    /// The base and everything below it.
    Subtree,
}

/// The subset of LDAP filters used by the topology code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `(attr=*)`
    Present(String),
    /// `(attr=value)`, case-insensitive.
    Equals(String, String),
    /// `(&...)`
    And(Vec<Filter>),
}

impl Filter {
    /// Matches every entry.
    pub fn any() -> Self {
        Filter::Present("objectclass".to_string())
    }

    /// `(objectclass=<oc>)`
    pub fn object_class(oc: &str) -> Self {
        Filter::Equals("objectclass".to_string(), oc.to_string())
    }

    /// Evaluate the filter against an entry.
    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Filter::Present(attr) => {
                attr.eq_ignore_ascii_case("objectclass") || entry.has_attribute(attr)
            }
            Filter::Equals(attr, value) => entry
                .values(attr)
                .iter()
                .any(|v| v.eq_ignore_ascii_case(value)),
            Filter::And(parts) => parts.iter().all(|p| p.matches(entry)),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Present(attr) => write!(f, "({}=*)", attr),
            Filter::Equals(attr, value) => write!(f, "({}={})", attr, value),
            Filter::And(parts) => {
                f.write_str("(&")?;
                for part in parts {
                    write!(f, "{}", part)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// A directory entry with case-insensitive, multi-valued attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    dn: Dn,
    attributes: BTreeMap<String, Vec<String>>,
}

impl Entry {
    /// An entry with no attributes.
    pub fn new(dn: Dn) -> Self {
        Self {
            dn,
            attributes: BTreeMap::new(),
        }
    }

    /// Builder form of [`Entry::set`].
    pub fn with<I, S>(mut self, attr: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set(attr, values);
        self
    }

    /// The entry DN.
    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    /// Replace all values of an attribute. An empty list removes it.
    pub fn set<I, S>(&mut self, attr: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        let key = attr.to_lowercase();
        if values.is_empty() {
            self.attributes.remove(&key);
        } else {
            self.attributes.insert(key, values);
        }
    }

    /// All values of an attribute (empty if absent).
    pub fn values(&self, attr: &str) -> &[String] {
        self.attributes
            .get(&attr.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First value of an attribute.
    pub fn first(&self, attr: &str) -> Option<&str> {
        self.values(attr).first().map(String::as_str)
    }

    /// First value parsed as a number.
    pub fn first_parsed<T: std::str::FromStr>(&self, attr: &str) -> Option<T> {
        self.first(attr).and_then(|v| v.trim().parse().ok())
    }

    /// First value read as an LDAP boolean.
    pub fn first_bool(&self, attr: &str) -> Option<bool> {
        self.first(attr).map(|v| v.trim().eq_ignore_ascii_case("true"))
    }

    /// True if the attribute has at least one value.
    pub fn has_attribute(&self, attr: &str) -> bool {
        !self.values(attr).is_empty()
    }

    /// Lower-cased attribute names.
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    /// Apply one modification in place.
    pub fn apply(&mut self, modification: &Modification) {
        match modification {
            Modification::Add { attr, values } => {
                let key = attr.to_lowercase();
                let existing = self.attributes.entry(key).or_default();
                for value in values {
                    if !existing.iter().any(|v| v.eq_ignore_ascii_case(value)) {
                        existing.push(value.clone());
                    }
                }
            }
            Modification::Replace { attr, values } => self.set(attr, values.clone()),
            Modification::Delete { attr, values } => {
                let key = attr.to_lowercase();
                if values.is_empty() {
                    self.attributes.remove(&key);
                } else if let Some(existing) = self.attributes.get_mut(&key) {
                    existing.retain(|v| !values.iter().any(|d| d.eq_ignore_ascii_case(v)));
                    if existing.is_empty() {
                        self.attributes.remove(&key);
                    }
                }
            }
        }
    }

    /// Copy restricted to the requested attributes (all when empty).
    pub fn project(&self, attrs: &[&str]) -> Entry {
        if attrs.is_empty() || attrs.contains(&"*") {
            return self.clone();
        }
        let mut projected = Entry::new(self.dn.clone());
        for attr in attrs {
            let values = self.values(attr);
            if !values.is_empty() {
                projected.set(attr, values.to_vec());
            }
        }
        projected
    }
}

/// A change to one attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    /// Add values.
    Add {
        /// Attribute name.
        attr: String,
        /// Values to add.
        values: Vec<String>,
    },
    /// Replace all values.
    Replace {
        /// Attribute name.
        attr: String,
        /// New values.
        values: Vec<String>,
    },
    /// Delete the given values, or the whole attribute if none are given.
    Delete {
        /// Attribute name.
        attr: String,
        /// Values to delete.
        values: Vec<String>,
    },
}

impl Modification {
    /// Replace `attr` with `values`.
    pub fn replace<I, S>(attr: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Modification::Replace {
            attr: attr.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// An open connection to one directory server.
#[async_trait]
pub trait DirectoryConnection: Send + Sync {
    /// Search below `base`. An empty attribute list returns everything.
    async fn search(
        &self,
        base: &Dn,
        scope: SearchScope,
        filter: &Filter,
        attrs: &[&str],
    ) -> Result<Vec<Entry>, DirectoryError>;

    /// Add an entry.
    async fn add(&self, entry: Entry) -> Result<(), DirectoryError>;

    /// Modify an entry.
    async fn modify(&self, dn: &Dn, modifications: &[Modification]) -> Result<(), DirectoryError>;

    /// Delete a leaf entry.
    async fn delete(&self, dn: &Dn) -> Result<(), DirectoryError>;

    /// Release the connection.
    async fn close(&self);

    /// Read one entry, mapping "no such object" to `None`.
    async fn read(&self, dn: &Dn, attrs: &[&str]) -> Result<Option<Entry>, DirectoryError> {
        match self.search(dn, SearchScope::Base, &Filter::any(), attrs).await {
            Ok(mut entries) => Ok(entries.pop()),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Transport security for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Plain LDAP.
    Ldap,
    /// LDAP over TLS.
    Ldaps,
    /// LDAP upgraded with StartTLS.
    StartTls,
}

impl Protocol {
    /// URL scheme.
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Ldaps => "ldaps",
            Protocol::Ldap | Protocol::StartTls => "ldap",
        }
    }
}

/// How server certificates are checked.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrustPolicy {
    /// Accept any certificate.
    #[default]
    TrustAll,
    /// Accept only certificates with these key ids.
    Certificates(Vec<String>),
}

/// Everything needed to open a connection to one server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Host name.
    pub host: String,
    /// Port to dial.
    pub port: u16,
    /// Transport security.
    pub protocol: Protocol,
    /// DN to bind as.
    pub bind_dn: String,
    /// Bind password.
    #[serde(skip_serializing, default)]
    pub password: String,
    /// Certificate trust.
    pub trust: TrustPolicy,
}

impl ConnectionParams {
    /// Anonymous plain-LDAP parameters.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: Protocol::Ldap,
            bind_dn: String::new(),
            password: String::new(),
            trust: TrustPolicy::default(),
        }
    }

    /// Set bind credentials.
    pub fn with_credentials(mut self, bind_dn: impl Into<String>, password: impl Into<String>) -> Self {
        self.bind_dn = bind_dn.into();
        self.password = password.into();
        self
    }

    /// Set transport security.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Set certificate trust.
    pub fn with_trust(mut self, trust: TrustPolicy) -> Self {
        self.trust = trust;
        self
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `ldap://host:port` or `ldaps://host:port`
    pub fn ldap_url(&self) -> String {
        format!("{}://{}:{}", self.protocol.scheme(), self.host, self.port)
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("bind_dn", &self.bind_dn)
            .field("password", &"<redacted>")
            .field("trust", &self.trust)
            .finish()
    }
}

/// Opens connections; implemented by the transport layer.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Connect and bind.
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn DirectoryConnection>, DirectoryError>;
}

/// Connect with a deadline on establishment.
pub async fn open(
    factory: &dyn ConnectionFactory,
    params: &ConnectionParams,
    timeout: Duration,
) -> Result<Arc<dyn DirectoryConnection>, DirectoryError> {
    match tokio::time::timeout(timeout, factory.connect(params)).await {
        Ok(result) => result,
        Err(_) => Err(DirectoryError::Timeout {
            address: params.address(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Entry {
        Entry::new(Dn::new("cn=x,cn=config"))
            .with("objectClass", ["top", "ds-cfg-replication-domain"])
            .with("ds-cfg-server-id", ["3"])
    }

    #[test]
    fn test_attribute_lookup_ignores_case() {
        let entry = sample();
        assert_eq!(entry.first("DS-CFG-SERVER-ID"), Some("3"));
        assert_eq!(entry.first_parsed::<u32>("ds-cfg-server-id"), Some(3));
        assert!(entry.values("missing").is_empty());
    }

    #[test]
    fn test_filter_matching() {
        let entry = sample();
        assert!(Filter::any().matches(&entry));
        assert!(Filter::object_class("DS-CFG-REPLICATION-DOMAIN").matches(&entry));
        assert!(!Filter::object_class("ds-task").matches(&entry));
        assert!(Filter::And(vec![
            Filter::Present("ds-cfg-server-id".to_string()),
            Filter::Equals("ds-cfg-server-id".to_string(), "3".to_string()),
        ])
        .matches(&entry));
    }

    #[test]
    fn test_filter_rendering() {
        let filter = Filter::And(vec![Filter::object_class("ds-task"), Filter::any()]);
        assert_eq!(filter.to_string(), "(&(objectclass=ds-task)(objectclass=*))");
    }

    #[test]
    fn test_apply_modifications() {
        let mut entry = sample();
        entry.apply(&Modification::Add {
            attr: "ds-cfg-replication-server".to_string(),
            values: vec!["a:1".to_string(), "A:1".to_string(), "b:2".to_string()],
        });
        assert_eq!(entry.values("ds-cfg-replication-server").len(), 2);
        entry.apply(&Modification::Delete {
            attr: "ds-cfg-replication-server".to_string(),
            values: vec!["A:1".to_string()],
        });
        assert_eq!(entry.values("ds-cfg-replication-server"), ["b:2".to_string()]);
        entry.apply(&Modification::replace("ds-cfg-server-id", ["9"]));
        assert_eq!(entry.first("ds-cfg-server-id"), Some("9"));
        entry.apply(&Modification::Delete {
            attr: "ds-cfg-server-id".to_string(),
            values: vec![],
        });
        assert!(!entry.has_attribute("ds-cfg-server-id"));
    }

    #[test]
    fn test_projection() {
        let entry = sample();
        let projected = entry.project(&["ds-cfg-server-id"]);
        assert!(!projected.has_attribute("objectclass"));
        assert_eq!(projected.first("ds-cfg-server-id"), Some("3"));
        assert_eq!(entry.project(&[]), entry);
    }

    #[test]
    fn test_connection_params_url_and_redaction() {
        let params = ConnectionParams::new("ldap1.example.com", 636)
            .with_protocol(Protocol::Ldaps)
            .with_credentials("cn=Directory Manager", "secret");
        assert_eq!(params.ldap_url(), "ldaps://ldap1.example.com:636");
        assert_eq!(params.address(), "ldap1.example.com:636");
        assert!(!format!("{:?}", params).contains("secret"));
    }
}
