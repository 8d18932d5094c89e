//! Distinguished names compared the way the directory compares them.
//!
//! Two DNs are equal when their attribute types and values match ignoring
//! case and insignificant whitespace, so `dc=Example,dc=Com` and
//! `dc=example, dc=com` name the same suffix. Values are compared after
//! resolving escapes, so `cn=a\,b` and `cn=a\2Cb` are the same RDN while an
//! escaped trailing space stays significant. Raw string equality is never
//! used for suffix identity.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// The administration data suffix.
pub const ADMIN_DATA_DN: &str = "cn=admin data";

/// The schema suffix.
pub const SCHEMA_DN: &str = "cn=schema";

/// A DN that could not be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid DN {dn:?}: {reason}")]
pub struct DnParseError {
    /// The offending input.
    pub dn: String,
    /// Why it was rejected.
    pub reason: String,
}

/// A distinguished name.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Dn {
    raw: String,
    rdns: Vec<String>,
}

impl Dn {
    /// Build a DN without validation. Malformed components are kept as
    /// lower-cased tokens so comparisons still behave.
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let rdns = split_unescaped(&raw, &[',', ';'])
            .into_iter()
            .filter(|rdn| !rdn.trim().is_empty())
            .map(|rdn| normalize_rdn(&rdn))
            .collect();
        Self { raw, rdns }
    }

    /// Parse a user-supplied DN, rejecting components without a type.
    pub fn parse(raw: &str) -> Result<Self, DnParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DnParseError {
                dn: raw.to_string(),
                reason: "empty DN".to_string(),
            });
        }
        for rdn in split_unescaped(trimmed, &[',', ';']) {
            for ava in split_unescaped(&rdn, &['+']) {
                match split_first_unescaped(&ava, '=') {
                    Some((attr, _)) if !attr.trim().is_empty() => {}
                    _ => {
                        return Err(DnParseError {
                            dn: raw.to_string(),
                            reason: format!("component {:?} has no attribute type", ava.trim()),
                        })
                    }
                }
            }
        }
        Ok(Self::new(trimmed))
    }

    /// The DN as originally spelled.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Normalized form used for comparisons.
    pub fn normalized(&self) -> String {
        self.rdns.join(",")
    }

    /// Number of RDN components.
    pub fn rdn_count(&self) -> usize {
        self.rdns.len()
    }

    /// True for the empty (root DSE) DN.
    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// The immediate parent, or `None` for the root DSE.
    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            return None;
        }
        let parts = split_unescaped(&self.raw, &[',', ';']);
        let rest: Vec<&str> = parts
            .iter()
            .skip(1)
            .filter(|p| !p.trim().is_empty())
            .map(|p| p.trim_start())
            .collect();
        Some(Dn::new(rest.join(",")))
    }

    /// A child of this DN with the given RDN (`attr=value`, already escaped).
    pub fn child(&self, rdn: &str) -> Dn {
        if self.is_root() {
            Dn::new(rdn)
        } else {
            Dn::new(format!("{},{}", rdn, self.raw))
        }
    }

    /// True if `self` lies strictly below `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &Dn) -> bool {
        self.rdns.len() > ancestor.rdns.len() && self.rdns.ends_with(&ancestor.rdns)
    }

    /// Value of the first RDN, unescaped.
    pub fn rdn_value(&self) -> Option<String> {
        let first = split_unescaped(&self.raw, &[',', ';']).into_iter().next()?;
        let (_, value) = split_first_unescaped(&first, '=')?;
        Some(unescape(value))
    }
}

/// Escape a value so it can be embedded in an RDN.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if is_special(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn is_special(c: char) -> bool {
    matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=')
}

/// Value characters with `\c` and `\XX` escapes resolved, each flagged
/// with whether it was escaped.
fn decode_value(value: &str) -> Vec<(char, bool)> {
    let mut out = Vec::with_capacity(value.len());
    let mut bytes: Vec<u8> = Vec::new();
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            flush_bytes(&mut bytes, &mut out);
            out.push((c, false));
            continue;
        }
        let mut lookahead = chars.clone();
        match (lookahead.next(), lookahead.next()) {
            (Some(high), Some(low)) if high.is_ascii_hexdigit() && low.is_ascii_hexdigit() => {
                bytes.push((hex_value(high) << 4) | hex_value(low));
                chars = lookahead;
            }
            _ => {
                flush_bytes(&mut bytes, &mut out);
                if let Some(next) = chars.next() {
                    out.push((next, true));
                }
            }
        }
    }
    flush_bytes(&mut bytes, &mut out);
    out
}

fn hex_value(c: char) -> u8 {
    c.to_digit(16).map_or(0, |d| d as u8)
}

fn flush_bytes(bytes: &mut Vec<u8>, out: &mut Vec<(char, bool)>) {
    if bytes.is_empty() {
        return;
    }
    out.extend(String::from_utf8_lossy(bytes).chars().map(|c| (c, true)));
    bytes.clear();
}

/// Drop leading and trailing spaces that were not escaped.
fn trim_unescaped(decoded: &[(char, bool)]) -> &[(char, bool)] {
    let significant = |&(c, escaped): &(char, bool)| escaped || c != ' ';
    let Some(start) = decoded.iter().position(significant) else {
        return &[];
    };
    let end = decoded.iter().rposition(significant).map_or(start, |i| i + 1);
    &decoded[start..end]
}

fn unescape(value: &str) -> String {
    trim_unescaped(&decode_value(value))
        .iter()
        .map(|&(c, _)| c)
        .collect()
}

/// Lower-cased value with space runs collapsed, re-escaped canonically.
fn normalize_value(value: &str) -> String {
    let decoded = decode_value(value);
    let mut chars: Vec<char> = Vec::with_capacity(decoded.len());
    for &(c, _) in trim_unescaped(&decoded) {
        if c == ' ' && chars.last() == Some(&' ') {
            continue;
        }
        chars.extend(c.to_lowercase());
    }
    let mut out = String::with_capacity(chars.len());
    let last = chars.len().saturating_sub(1);
    for (i, &c) in chars.iter().enumerate() {
        let edge_space = c == ' ' && (i == 0 || i == last);
        if is_special(c) || edge_space || (i == 0 && c == '#') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn split_unescaped(input: &str, separators: &[char]) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in input.chars() {
        if escaped {
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            current.push(c);
            escaped = true;
        } else if separators.contains(&c) {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

fn split_first_unescaped(input: &str, separator: char) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == separator {
            return Some((&input[..i], &input[i + c.len_utf8()..]));
        }
    }
    None
}

fn normalize_rdn(rdn: &str) -> String {
    let mut avas: Vec<String> = split_unescaped(rdn, &['+'])
        .iter()
        .map(|ava| match split_first_unescaped(ava, '=') {
            Some((attr, value)) => format!("{}={}", attr.trim().to_lowercase(), normalize_value(value)),
            None => normalize_value(ava),
        })
        .collect();
    avas.sort();
    avas.join("+")
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.rdns == other.rdns
    }
}

impl Eq for Dn {}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rdns.hash(state);
    }
}

impl PartialOrd for Dn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Dn {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rdns.cmp(&other.rdns)
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dn({:?})", self.raw)
    }
}

impl From<String> for Dn {
    fn from(raw: String) -> Self {
        Dn::new(raw)
    }
}

impl From<&str> for Dn {
    fn from(raw: &str) -> Self {
        Dn::new(raw)
    }
}

impl From<Dn> for String {
    fn from(dn: Dn) -> Self {
        dn.raw
    }
}

impl FromStr for Dn {
    type Err = DnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dn::parse(s)
    }
}

/// Join DNs for messages.
pub fn join_dns<'a>(dns: impl IntoIterator<Item = &'a Dn>) -> String {
    dns.into_iter()
        .map(|dn| dn.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_case_and_space_insensitive_equality() {
        assert_eq!(Dn::new("dc=Example,dc=Com"), Dn::new("dc=example, dc=com"));
        assert_eq!(Dn::new("CN = Admin  Data"), Dn::new("cn=admin data"));
    }

    #[test]
    fn test_different_dns_not_equal() {
        assert_ne!(Dn::new("dc=example,dc=com"), Dn::new("dc=example,dc=org"));
        assert_ne!(Dn::new("dc=example,dc=com"), Dn::new("dc=com"));
    }

    #[test]
    fn test_hash_follows_equality() {
        let mut set = HashSet::new();
        set.insert(Dn::new("dc=Example,dc=Com"));
        assert!(set.contains(&Dn::new("dc=example, dc=com")));
    }

    #[test]
    fn test_display_keeps_spelling() {
        let dn = Dn::new("dc=Example, dc=Com");
        assert_eq!(dn.to_string(), "dc=Example, dc=Com");
        assert_eq!(dn.normalized(), "dc=example,dc=com");
    }

    #[test]
    fn test_parent_and_child() {
        let base = Dn::new("dc=example,dc=com");
        let child = base.child("ou=people");
        assert_eq!(child, Dn::new("ou=People,dc=Example,dc=com"));
        assert_eq!(child.parent(), Some(base.clone()));
        assert!(child.is_descendant_of(&base));
        assert!(!base.is_descendant_of(&base));
        assert_eq!(Dn::new("").parent(), None);
    }

    #[test]
    fn test_escaped_comma_stays_in_value() {
        let parent = Dn::new("cn=domains,cn=config");
        let child = parent.child(&format!("cn={}", escape_value("dc=example,dc=com")));
        assert_eq!(child.rdn_count(), 3);
        assert_eq!(child.rdn_value().as_deref(), Some("dc=example,dc=com"));
        assert_eq!(child.parent(), Some(parent));
    }

    #[test]
    fn test_hex_and_char_escapes_compare_equal() {
        assert_eq!(Dn::new("cn=a\\,b,dc=x"), Dn::new("cn=a\\2Cb,dc=x"));
        assert_eq!(Dn::new("cn=A\\2cB,dc=x"), Dn::new("cn=a\\,b,dc=x"));
        assert_eq!(Dn::new("cn=a\\,b,dc=x").rdn_count(), 2);
        assert_eq!(Dn::new("cn=caf\\C3\\A9"), Dn::new("cn=Caf\u{e9}"));
        assert_eq!(Dn::new("cn=caf\\C3\\A9").rdn_value().as_deref(), Some("caf\u{e9}"));
        assert_eq!(Dn::new("cn=a\\,b").normalized(), "cn=a\\,b");
    }

    #[test]
    fn test_escaped_trailing_space_is_significant() {
        assert_ne!(Dn::new("cn=a\\ ,dc=x"), Dn::new("cn=a,dc=x"));
        assert_eq!(Dn::new("cn=a\\ ,dc=x"), Dn::new("cn=A\\20 ,dc=x"));
        assert_eq!(Dn::new("cn=a  ,dc=x"), Dn::new("cn=a,dc=x"));
        assert_eq!(Dn::new("cn=\\ a"), Dn::new("cn=\\20A"));
        assert_ne!(Dn::new("cn=\\ a"), Dn::new("cn=a"));
        assert_eq!(Dn::new("cn=a\\ ").rdn_value().as_deref(), Some("a "));
        let child = Dn::new("cn=a\\ ,dc=x").child("cn=b");
        assert_eq!(child.parent(), Some(Dn::new("cn=a\\20,dc=x")));
    }

    #[test]
    fn test_multi_valued_rdn_order_independent() {
        assert_eq!(Dn::new("cn=a+uid=b,dc=x"), Dn::new("uid=B+cn=A,dc=x"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Dn::parse("").is_err());
        assert!(Dn::parse("example.com").is_err());
        assert!(Dn::parse("=foo,dc=com").is_err());
        assert!(Dn::parse("dc=example,dc=com").is_ok());
    }

    #[test]
    fn test_serde_as_string() {
        let dn = Dn::new("dc=example,dc=com");
        let json = serde_json::to_string(&dn).unwrap();
        assert_eq!(json, "\"dc=example,dc=com\"");
        let back: Dn = serde_json::from_str("\"DC=Example, DC=com\"").unwrap();
        assert_eq!(back, dn);
    }
}
