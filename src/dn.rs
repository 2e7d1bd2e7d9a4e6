//! Distinguished names (RFC 4514).
//!
//! A `Dn` keeps the attribute types and values as the client spelled them, so
//! responses echo the caller's form, plus a normalized key used for identity,
//! indexing and suffix tests.

use crate::schema::{matching_rule, MatchingRule};
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid DN {dn:?}: {reason}")]
pub struct DnError {
    pub dn: String,
    pub reason: String,
}

impl DnError {
    fn new(dn: &str, reason: impl Into<String>) -> Self {
        Self {
            dn: dn.to_string(),
            reason: reason.into(),
        }
    }
}

/// One `type=value` pair of an RDN.
#[derive(Debug, Clone)]
pub struct Ava {
    pub attr: String,
    pub value: String,
}

impl Ava {
    pub fn new(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attr: attr.into(),
            value: value.into(),
        }
    }

    fn normalized(&self) -> String {
        let rule = match matching_rule(&self.attr) {
            MatchingRule::DistinguishedName => MatchingRule::CaseIgnore,
            rule => rule,
        };
        let value = rule.normalize(self.value.as_bytes());
        format!(
            "{}={}",
            self.attr.to_ascii_lowercase(),
            escape_value(&String::from_utf8_lossy(&value))
        )
    }
}

/// Relative distinguished name: one or more AVAs joined with `+`.
#[derive(Debug, Clone)]
pub struct Rdn {
    avas: Vec<Ava>,
    norm: String,
}

impl Rdn {
    pub fn new(avas: Vec<Ava>) -> Self {
        let mut parts: Vec<String> = avas.iter().map(Ava::normalized).collect();
        parts.sort();
        Self {
            avas,
            norm: parts.join("+"),
        }
    }

    /// Parse a single RDN such as `uid=jahn` or `cn=a+sn=b`.
    pub fn parse(text: &str) -> Result<Rdn, DnError> {
        let dn = Dn::parse(text)?;
        match dn.rdns.len() {
            1 => Ok(dn.rdns.into_iter().next().ok_or_else(|| DnError::new(text, "empty RDN"))?),
            0 => Err(DnError::new(text, "empty RDN")),
            _ => Err(DnError::new(text, "expected a single RDN")),
        }
    }

    pub fn avas(&self) -> &[Ava] {
        &self.avas
    }

    pub fn normalized(&self) -> &str {
        &self.norm
    }
}

impl PartialEq for Rdn {
    fn eq(&self, other: &Self) -> bool {
        self.norm == other.norm
    }
}

impl Eq for Rdn {}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ava) in self.avas.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            write!(f, "{}={}", ava.attr, escape_value(&ava.value))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Dn {
    rdns: Vec<Rdn>,
    norm: String,
}

impl Dn {
    /// The empty DN naming the root DSE.
    pub fn root() -> Dn {
        Dn::from_rdns(Vec::new())
    }

    pub fn from_rdns(rdns: Vec<Rdn>) -> Dn {
        let norm = rdns
            .iter()
            .map(Rdn::normalized)
            .collect::<Vec<_>>()
            .join(",");
        Dn { rdns, norm }
    }

    pub fn parse(text: &str) -> Result<Dn, DnError> {
        if text.trim().is_empty() {
            return Ok(Dn::root());
        }
        let mut parser = Parser {
            input: text,
            chars: text.char_indices().peekable(),
        };
        let mut rdns = Vec::new();
        let mut avas = Vec::new();
        loop {
            let attr = parser.attribute_type()?;
            let (value, terminator) = parser.attribute_value()?;
            avas.push(Ava::new(attr, value));
            match terminator {
                Some('+') => continue,
                Some(',') | Some(';') => {
                    rdns.push(Rdn::new(std::mem::take(&mut avas)));
                }
                _ => {
                    rdns.push(Rdn::new(std::mem::take(&mut avas)));
                    break;
                }
            }
        }
        Ok(Dn::from_rdns(rdns))
    }

    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            None
        } else {
            Some(Dn::from_rdns(self.rdns[1..].to_vec()))
        }
    }

    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    /// Canonical key: lower-cased types, normalized values, sorted multi-valued RDNs.
    pub fn normalized(&self) -> &str {
        &self.norm
    }

    /// True when `self` lies strictly below `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &Dn) -> bool {
        self.depth() > ancestor.depth() && self.ends_with(ancestor)
    }

    /// True when `self` is `base` or lies below it.
    pub fn is_within(&self, base: &Dn) -> bool {
        self.depth() >= base.depth() && self.ends_with(base)
    }

    fn ends_with(&self, suffix: &Dn) -> bool {
        let offset = self.depth() - suffix.depth();
        self.rdns[offset..]
            .iter()
            .zip(suffix.rdns.iter())
            .all(|(a, b)| a == b)
    }

    /// DN of a child of `self` named by `rdn`.
    pub fn child(&self, rdn: Rdn) -> Dn {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(rdn);
        rdns.extend(self.rdns.iter().cloned());
        Dn::from_rdns(rdns)
    }

    /// Same parent, different leading RDN.
    pub fn with_rdn(&self, rdn: Rdn) -> Dn {
        match self.parent() {
            Some(parent) => parent.child(rdn),
            None => Dn::from_rdns(vec![rdn]),
        }
    }

    /// Move `self` from below `old_base` to below `new_base`. `None` when `self` is not within `old_base`.
    pub fn rebase(&self, old_base: &Dn, new_base: &Dn) -> Option<Dn> {
        if !self.is_within(old_base) {
            return None;
        }
        let keep = self.depth() - old_base.depth();
        let mut rdns: Vec<Rdn> = self.rdns[..keep].to_vec();
        rdns.extend(new_base.rdns.iter().cloned());
        Some(Dn::from_rdns(rdns))
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.norm == other.norm
    }
}

impl Eq for Dn {}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.norm.hash(state);
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", rdn)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Dn {
    type Err = DnError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dn::parse(s)
    }
}

/// Escape a value for the string form of a DN.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        match c {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                out.push('\\');
                out.push(c);
            }
            '#' if i == 0 => out.push_str("\\#"),
            ' ' if i == 0 || i == last => out.push_str("\\ "),
            '\0' => out.push_str("\\00"),
            _ => out.push(c),
        }
    }
    out
}

struct Parser<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl Parser<'_> {
    fn error(&self, reason: impl Into<String>) -> DnError {
        DnError::new(self.input, reason)
    }

    fn skip_spaces(&mut self) {
        while matches!(self.chars.peek(), Some((_, ' '))) {
            self.chars.next();
        }
    }

    fn attribute_type(&mut self) -> Result<String, DnError> {
        self.skip_spaces();
        let mut attr = String::new();
        while let Some(&(_, c)) = self.chars.peek() {
            if c == '=' {
                break;
            }
            if !(c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ' ') {
                return Err(self.error(format!("unexpected {:?} in attribute type", c)));
            }
            attr.push(c);
            self.chars.next();
        }
        if self.chars.next().is_none() {
            return Err(self.error("missing '=' after attribute type"));
        }
        let attr = attr.trim_end().to_string();
        if attr.is_empty() || attr.contains(' ') {
            return Err(self.error("empty or malformed attribute type"));
        }
        Ok(attr)
    }

    /// Returns the unescaped value and the separator that ended it (None at end of input).
    fn attribute_value(&mut self) -> Result<(String, Option<char>), DnError> {
        self.skip_spaces();
        let mut bytes: Vec<u8> = Vec::new();
        // Length of `bytes` up to and including the last escaped character.
        let mut protected = 0usize;
        let mut terminator = None;
        while let Some((_, c)) = self.chars.next() {
            match c {
                ',' | '+' | ';' => {
                    terminator = Some(c);
                    break;
                }
                '\\' => {
                    let (_, next) = self
                        .chars
                        .next()
                        .ok_or_else(|| self.error("dangling escape at end of DN"))?;
                    if next.is_ascii_hexdigit() {
                        let (_, low) = self
                            .chars
                            .next()
                            .ok_or_else(|| self.error("truncated hex escape"))?;
                        let pair = format!("{}{}", next, low);
                        let byte = u8::from_str_radix(&pair, 16)
                            .map_err(|_| self.error(format!("invalid hex escape \\{}", pair)))?;
                        bytes.push(byte);
                    } else if matches!(next, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' | ' ' | '#') {
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(next.encode_utf8(&mut buf).as_bytes());
                    } else {
                        return Err(self.error(format!("invalid escape \\{}", next)));
                    }
                    protected = bytes.len();
                }
                '"' | '<' | '>' => {
                    return Err(self.error(format!("unescaped {:?} in attribute value", c)));
                }
                _ => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        while bytes.len() > protected && bytes.last() == Some(&b' ') {
            bytes.pop();
        }
        if terminator.is_some() && self.chars.peek().is_none() {
            return Err(self.error("trailing separator"));
        }
        let value = String::from_utf8(bytes).map_err(|_| self.error("value is not valid UTF-8"))?;
        Ok((value, terminator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let dn = Dn::parse("uid=jahn,ou=people,dc=ldap,dc=com").unwrap();
        assert_eq!(dn.depth(), 4);
        assert_eq!(dn.to_string(), "uid=jahn,ou=people,dc=ldap,dc=com");
        assert_eq!(dn.rdn().unwrap().avas()[0].attr, "uid");
        assert_eq!(dn.rdn().unwrap().avas()[0].value, "jahn");
    }

    #[test]
    fn test_parse_root() {
        assert!(Dn::parse("").unwrap().is_root());
        assert!(Dn::parse("  ").unwrap().is_root());
        assert!(Dn::root().parent().is_none());
    }

    #[test]
    fn test_normalized_ignores_case_and_spacing() {
        let a = Dn::parse("UID=Jahn , OU=People,DC=ldap,DC=com").unwrap();
        let b = Dn::parse("uid=jahn,ou=people,dc=ldap,dc=com").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.normalized(), "uid=jahn,ou=people,dc=ldap,dc=com");
        // client spelling is kept for output
        assert_eq!(a.to_string(), "UID=Jahn,OU=People,DC=ldap,DC=com");
    }

    #[test]
    fn test_multi_valued_rdn_order_insensitive() {
        let a = Dn::parse("cn=Jahn+sn=Dae,dc=com").unwrap();
        let b = Dn::parse("sn=dae+cn=jahn,dc=com").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.rdn().unwrap().avas().len(), 2);
    }

    #[test]
    fn test_escapes() {
        let dn = Dn::parse(r"cn=Dae\, Jahn,dc=com").unwrap();
        assert_eq!(dn.rdn().unwrap().avas()[0].value, "Dae, Jahn");
        assert_eq!(dn.depth(), 2);
        assert_eq!(dn.to_string(), r"cn=Dae\, Jahn,dc=com");

        let dn = Dn::parse(r"cn=J\C3\A4hn,dc=com").unwrap();
        assert_eq!(dn.rdn().unwrap().avas()[0].value, "Jähn");

        let dn = Dn::parse(r"cn=\ padded\ ,dc=com").unwrap();
        assert_eq!(dn.rdn().unwrap().avas()[0].value, " padded ");

        // '=' may appear unescaped in a value but is escaped on output
        let dn = Dn::parse("cn=a=b,dc=x").unwrap();
        assert_eq!(dn.rdn().unwrap().avas()[0].value, "a=b");
        assert_eq!(dn.to_string(), r"cn=a\=b,dc=x");
        assert_eq!(dn, Dn::parse(r"cn=a\=b,dc=x").unwrap());
    }

    #[test]
    fn test_parse_errors() {
        assert!(Dn::parse("uid").is_err());
        assert!(Dn::parse("=jahn").is_err());
        assert!(Dn::parse("uid=jahn,").is_err());
        assert!(Dn::parse(r"cn=bad\").is_err());
        assert!(Dn::parse("cn=a<b").is_err());
        assert!(Dn::parse("c n=x").is_err());
    }

    #[test]
    fn test_hierarchy() {
        let base = Dn::parse("dc=ldap,dc=com").unwrap();
        let people = Dn::parse("ou=people,dc=ldap,dc=com").unwrap();
        let jahn = Dn::parse("uid=jahn,ou=People,dc=LDAP,dc=com").unwrap();
        assert!(jahn.is_descendant_of(&base));
        assert!(jahn.is_descendant_of(&people));
        assert!(!people.is_descendant_of(&people));
        assert!(people.is_within(&people));
        assert!(!base.is_within(&people));
        assert_eq!(jahn.parent().unwrap(), people);
        assert!(people.is_descendant_of(&Dn::root()));
    }

    #[test]
    fn test_child_with_rdn_and_rebase() {
        let people = Dn::parse("ou=people,dc=ldap,dc=com").unwrap();
        let jahn = people.child(Rdn::parse("uid=jahn").unwrap());
        assert_eq!(jahn.to_string(), "uid=jahn,ou=people,dc=ldap,dc=com");

        let renamed = jahn.with_rdn(Rdn::parse("uid=john").unwrap());
        assert_eq!(renamed.to_string(), "uid=john,ou=people,dc=ldap,dc=com");

        let staff = Dn::parse("ou=staff,dc=ldap,dc=com").unwrap();
        let moved = jahn.rebase(&people, &staff).unwrap();
        assert_eq!(moved.to_string(), "uid=jahn,ou=staff,dc=ldap,dc=com");
        assert!(staff.rebase(&people, &staff).is_none());
    }

    #[test]
    fn test_rdn_parse() {
        assert!(Rdn::parse("uid=jahn").is_ok());
        assert!(Rdn::parse("uid=jahn,dc=com").is_err());
        assert!(Rdn::parse("").is_err());
    }

    #[test]
    fn test_escape_value() {
        assert_eq!(escape_value("a,b"), r"a\,b");
        assert_eq!(escape_value("#x"), r"\#x");
        assert_eq!(escape_value(" x "), r"\ x\ ");
        assert_eq!(escape_value("plain"), "plain");
    }
}
