//! Matching rules and the minimal validation applied to fixtures and client writes.
//!
//! There is no schema registry: each attribute is mapped to an equality rule by
//! name, everything unknown is compared case-insensitively.

use crate::dn::Dn;
use crate::entry::Entry;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingRule {
    CaseIgnore,
    CaseExact,
    OctetString,
    Integer,
    DistinguishedName,
}

const INTEGER_ATTRIBUTES: &[&str] = &[
    "uidnumber",
    "gidnumber",
    "shadowlastchange",
    "shadowmin",
    "shadowmax",
    "shadowwarning",
    "shadowinactive",
    "shadowexpire",
    "shadowflag",
    "supportedldapversion",
];

const OCTET_ATTRIBUTES: &[&str] = &[
    "userpassword",
    "jpegphoto",
    "usercertificate",
    "cacertificate",
    "certificaterevocationlist",
    "authorityrevocationlist",
    "audio",
    "photo",
];

const DN_ATTRIBUTES: &[&str] = &[
    "member",
    "uniquemember",
    "owner",
    "seealso",
    "manager",
    "secretary",
    "roleoccupant",
    "aliasedobjectname",
    "distinguishedname",
    "namingcontexts",
    "creatorsname",
    "modifiersname",
    "entrydn",
];

const CASE_EXACT_ATTRIBUTES: &[&str] = &["homedirectory", "loginshell"];

/// Attributes maintained by the server. Clients may read them but not write them.
pub const OPERATIONAL_ATTRIBUTES: &[&str] = &[
    "creatorsName",
    "createTimestamp",
    "modifiersName",
    "modifyTimestamp",
    "entryDN",
];

/// Strip attribute options: `userCertificate;binary` -> `userCertificate`.
pub fn attribute_base(description: &str) -> &str {
    description.split(';').next().unwrap_or(description).trim()
}

/// Case-insensitive comparison of two attribute descriptions, ignoring options.
pub fn same_attribute(a: &str, b: &str) -> bool {
    attribute_base(a).eq_ignore_ascii_case(attribute_base(b))
}

pub fn is_operational(description: &str) -> bool {
    OPERATIONAL_ATTRIBUTES
        .iter()
        .any(|op| same_attribute(op, description))
}

fn listed(list: &[&str], description: &str) -> bool {
    let base = attribute_base(description);
    list.iter().any(|name| name.eq_ignore_ascii_case(base))
}

/// Equality rule for an attribute description.
pub fn matching_rule(description: &str) -> MatchingRule {
    if listed(OCTET_ATTRIBUTES, description) {
        MatchingRule::OctetString
    } else if listed(INTEGER_ATTRIBUTES, description) {
        MatchingRule::Integer
    } else if listed(DN_ATTRIBUTES, description) {
        MatchingRule::DistinguishedName
    } else if listed(CASE_EXACT_ATTRIBUTES, description) {
        MatchingRule::CaseExact
    } else {
        MatchingRule::CaseIgnore
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_integer(value: &[u8]) -> Option<i64> {
    std::str::from_utf8(value).ok()?.trim().parse::<i64>().ok()
}

impl MatchingRule {
    /// Look up a rule by the name or OID used in extensible match filters.
    pub fn from_name(name: &str) -> Option<Self> {
        let rule = match name.trim().to_ascii_lowercase().as_str() {
            "caseignorematch" | "2.5.13.2" | "caseignoreia5match" | "1.3.6.1.4.1.1466.109.114.2" => {
                MatchingRule::CaseIgnore
            }
            "caseexactmatch" | "2.5.13.5" | "caseexactia5match" | "1.3.6.1.4.1.1466.109.114.1" => {
                MatchingRule::CaseExact
            }
            "octetstringmatch" | "2.5.13.17" => MatchingRule::OctetString,
            "integermatch" | "2.5.13.14" => MatchingRule::Integer,
            "distinguishednamematch" | "2.5.13.1" => MatchingRule::DistinguishedName,
            _ => return None,
        };
        Some(rule)
    }

    /// Canonical form used for equality.
    pub fn normalize(self, value: &[u8]) -> Vec<u8> {
        match self {
            MatchingRule::OctetString => value.to_vec(),
            MatchingRule::CaseExact => collapse_whitespace(&String::from_utf8_lossy(value)).into_bytes(),
            MatchingRule::CaseIgnore => collapse_whitespace(&String::from_utf8_lossy(value))
                .to_lowercase()
                .into_bytes(),
            MatchingRule::Integer => match parse_integer(value) {
                Some(n) => n.to_string().into_bytes(),
                None => String::from_utf8_lossy(value).trim().as_bytes().to_vec(),
            },
            MatchingRule::DistinguishedName => {
                let text = String::from_utf8_lossy(value);
                match Dn::parse(&text) {
                    Ok(dn) => dn.normalized().as_bytes().to_vec(),
                    Err(_) => text.trim().to_lowercase().into_bytes(),
                }
            }
        }
    }

    pub fn values_equal(self, a: &[u8], b: &[u8]) -> bool {
        match self {
            MatchingRule::OctetString => a == b,
            _ => self.normalize(a) == self.normalize(b),
        }
    }

    /// Ordering for `>=` / `<=`. Integers compare numerically when both sides parse.
    /// `None` when the rule has no ordering for these values.
    pub fn order(self, a: &[u8], b: &[u8]) -> Option<Ordering> {
        if let (Some(x), Some(y)) = (parse_integer(a), parse_integer(b)) {
            return Some(x.cmp(&y));
        }
        match self {
            MatchingRule::Integer | MatchingRule::DistinguishedName => None,
            MatchingRule::OctetString => Some(a.cmp(b)),
            _ => Some(self.normalize(a).cmp(&self.normalize(b))),
        }
    }

    /// Form used for substring assertions; `None` when the rule has no substring semantics.
    pub fn substring_form(self, value: &[u8]) -> Option<Vec<u8>> {
        match self {
            MatchingRule::Integer => None,
            MatchingRule::OctetString | MatchingRule::CaseExact => Some(value.to_vec()),
            MatchingRule::CaseIgnore | MatchingRule::DistinguishedName => {
                Some(String::from_utf8_lossy(value).to_lowercase().into_bytes())
            }
        }
    }

    /// Approximate match: case-insensitive, whitespace removed.
    pub fn approx_equal(self, a: &[u8], b: &[u8]) -> bool {
        match self {
            MatchingRule::OctetString | MatchingRule::Integer => self.values_equal(a, b),
            _ => {
                let squash = |v: &[u8]| -> String {
                    String::from_utf8_lossy(v)
                        .chars()
                        .filter(|c| !c.is_whitespace())
                        .flat_map(char::to_lowercase)
                        .collect()
                };
                squash(a) == squash(b)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaViolation {
    #[error("entry {0} has no objectClass")]
    MissingObjectClass(String),
}

/// Structural checks performed when validation is enabled.
pub fn validate_entry(entry: &Entry) -> Result<(), SchemaViolation> {
    if entry.values("objectClass").is_empty() {
        return Err(SchemaViolation::MissingObjectClass(entry.dn().to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap_protocol::Attribute;

    #[test]
    fn test_matching_rule_lookup() {
        assert_eq!(matching_rule("userPassword"), MatchingRule::OctetString);
        assert_eq!(matching_rule("uidNumber"), MatchingRule::Integer);
        assert_eq!(matching_rule("uniqueMember"), MatchingRule::DistinguishedName);
        assert_eq!(matching_rule("homeDirectory"), MatchingRule::CaseExact);
        assert_eq!(matching_rule("cn"), MatchingRule::CaseIgnore);
        assert_eq!(matching_rule("userCertificate;binary"), MatchingRule::OctetString);
    }

    #[test]
    fn test_case_ignore_equality() {
        let rule = MatchingRule::CaseIgnore;
        assert!(rule.values_equal(b"Jahn  Dae", b"jahn dae"));
        assert!(rule.values_equal(b" JAHN ", b"jahn"));
        assert!(!rule.values_equal(b"jahn", b"john"));
    }

    #[test]
    fn test_octet_and_exact_equality() {
        assert!(!MatchingRule::OctetString.values_equal(b"Secret", b"secret"));
        assert!(MatchingRule::OctetString.values_equal(b"secret", b"secret"));
        assert!(!MatchingRule::CaseExact.values_equal(b"/home/Jahn", b"/home/jahn"));
    }

    #[test]
    fn test_integer_rule() {
        let rule = MatchingRule::Integer;
        assert!(rule.values_equal(b"0100", b"100"));
        assert_eq!(rule.order(b"9", b"10"), Some(Ordering::Less));
        assert_eq!(rule.order(b"abc", b"10"), None);
        assert_eq!(rule.substring_form(b"10"), None);
    }

    #[test]
    fn test_ordering_falls_back_to_lexical() {
        assert_eq!(MatchingRule::CaseIgnore.order(b"Apple", b"banana"), Some(Ordering::Less));
        assert_eq!(MatchingRule::CaseIgnore.order(b"20", b"3"), Some(Ordering::Greater));
    }

    #[test]
    fn test_dn_rule() {
        let rule = MatchingRule::DistinguishedName;
        assert!(rule.values_equal(b"UID=Jahn, OU=People,DC=ldap,DC=com", b"uid=jahn,ou=people,dc=ldap,dc=com"));
    }

    #[test]
    fn test_approx_equal() {
        assert!(MatchingRule::CaseIgnore.approx_equal(b"Jahn Dae", b"jahndae"));
        assert!(!MatchingRule::CaseIgnore.approx_equal(b"Jahn", b"John"));
    }

    #[test]
    fn test_from_name() {
        assert_eq!(MatchingRule::from_name("caseExactMatch"), Some(MatchingRule::CaseExact));
        assert_eq!(MatchingRule::from_name("2.5.13.14"), Some(MatchingRule::Integer));
        assert_eq!(MatchingRule::from_name("1.2.3.4"), None);
    }

    #[test]
    fn test_operational_attributes() {
        assert!(is_operational("createTimestamp"));
        assert!(is_operational("ENTRYDN"));
        assert!(!is_operational("cn"));
        assert!(same_attribute("cn;lang-en", "CN"));
    }

    #[test]
    fn test_validate_entry() {
        let dn = Dn::parse("uid=jahn,dc=ldap,dc=com").unwrap();
        let mut entry = Entry::new(dn.clone());
        entry.push_attribute(Attribute::from_strs("uid", &["jahn"]));
        assert!(matches!(validate_entry(&entry), Err(SchemaViolation::MissingObjectClass(_))));

        let mut entry = Entry::new(dn);
        entry.push_attribute(Attribute::from_strs("objectClass", &["top", "person"]));
        assert!(validate_entry(&entry).is_ok());
    }
}
