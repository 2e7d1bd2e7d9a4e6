//! Search filters: BER decoding, RFC 4515 string form and evaluation against entries.

use crate::entry::Entry;
use crate::ldap_protocol::{BerReader, BerWriter};
use crate::schema::{matching_rule, MatchingRule};
use anyhow::{Result, bail};
use std::cmp::Ordering;
use std::fmt;

// Filter CHOICE tags (context-specific)
const FILTER_AND: u8 = 0xA0;
const FILTER_OR: u8 = 0xA1;
const FILTER_NOT: u8 = 0xA2;
const FILTER_EQUALITY: u8 = 0xA3;
const FILTER_SUBSTRINGS: u8 = 0xA4;
const FILTER_GREATER_OR_EQUAL: u8 = 0xA5;
const FILTER_LESS_OR_EQUAL: u8 = 0xA6;
const FILTER_PRESENT: u8 = 0x87;
const FILTER_APPROX: u8 = 0xA8;
const FILTER_EXTENSIBLE: u8 = 0xA9;

const SUBSTRING_INITIAL: u8 = 0x80;
const SUBSTRING_ANY: u8 = 0x81;
const SUBSTRING_FINAL: u8 = 0x82;

const MATCHING_RULE_ID: u8 = 0x81;
const MATCHING_RULE_TYPE: u8 = 0x82;
const MATCHING_RULE_VALUE: u8 = 0x83;
const MATCHING_RULE_DN_ATTRIBUTES: u8 = 0x84;

/// Nesting limit for `&`, `|` and `!`.
const MAX_FILTER_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    EqualityMatch {
        attr: String,
        value: Vec<u8>,
    },
    Substrings {
        attr: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        final_: Option<Vec<u8>>,
    },
    GreaterOrEqual {
        attr: String,
        value: Vec<u8>,
    },
    LessOrEqual {
        attr: String,
        value: Vec<u8>,
    },
    Present(String),
    ApproxMatch {
        attr: String,
        value: Vec<u8>,
    },
    ExtensibleMatch {
        matching_rule: Option<String>,
        attr: Option<String>,
        value: Vec<u8>,
        dn_attributes: bool,
    },
}

/// Three-valued filter outcome (RFC 4511 section 4.5.1.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    True,
    False,
    Undefined,
}

impl From<bool> for FilterResult {
    fn from(value: bool) -> Self {
        if value {
            FilterResult::True
        } else {
            FilterResult::False
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid filter at offset {offset}: {reason}")]
pub struct FilterParseError {
    pub offset: usize,
    pub reason: String,
}

impl Filter {
    /// `(objectClass=*)`
    pub fn match_all() -> Filter {
        Filter::Present("objectClass".to_string())
    }

    pub(crate) fn from_ber(reader: &mut BerReader) -> Result<Filter> {
        Self::read_ber(reader, 0)
    }

    fn read_ber(reader: &mut BerReader, depth: usize) -> Result<Filter> {
        if depth > MAX_FILTER_DEPTH {
            bail!("Filter nested deeper than {} levels", MAX_FILTER_DEPTH);
        }
        let (tag, mut r) = reader.read_element()?;
        let filter = match tag {
            FILTER_AND | FILTER_OR => {
                let mut items = Vec::new();
                while !r.is_empty() {
                    items.push(Self::read_ber(&mut r, depth + 1)?);
                }
                if tag == FILTER_AND {
                    Filter::And(items)
                } else {
                    Filter::Or(items)
                }
            }
            FILTER_NOT => {
                let inner = Self::read_ber(&mut r, depth + 1)?;
                if !r.is_empty() {
                    bail!("NOT filter holds more than one element");
                }
                Filter::Not(Box::new(inner))
            }
            FILTER_EQUALITY | FILTER_GREATER_OR_EQUAL | FILTER_LESS_OR_EQUAL | FILTER_APPROX => {
                let attr = r.read_string()?;
                let value = r.read_octet_string()?;
                match tag {
                    FILTER_EQUALITY => Filter::EqualityMatch { attr, value },
                    FILTER_GREATER_OR_EQUAL => Filter::GreaterOrEqual { attr, value },
                    FILTER_LESS_OR_EQUAL => Filter::LessOrEqual { attr, value },
                    _ => Filter::ApproxMatch { attr, value },
                }
            }
            FILTER_SUBSTRINGS => {
                let attr = r.read_string()?;
                let mut subs = r.read_sequence()?;
                let mut initial = None;
                let mut any = Vec::new();
                let mut final_ = None;
                let mut count = 0usize;
                while !subs.is_empty() {
                    let (sub_tag, mut sub) = subs.read_element()?;
                    let value = sub.rest().to_vec();
                    match sub_tag {
                        SUBSTRING_INITIAL if count == 0 => initial = Some(value),
                        SUBSTRING_ANY if final_.is_none() => any.push(value),
                        SUBSTRING_FINAL if final_.is_none() => final_ = Some(value),
                        _ => bail!("Misplaced substring component 0x{:02X}", sub_tag),
                    }
                    count += 1;
                }
                if count == 0 {
                    bail!("Substring filter without components");
                }
                Filter::Substrings {
                    attr,
                    initial,
                    any,
                    final_,
                }
            }
            FILTER_PRESENT => {
                let attr = String::from_utf8(r.rest().to_vec())?;
                if attr.is_empty() {
                    bail!("Present filter with empty attribute");
                }
                Filter::Present(attr)
            }
            FILTER_EXTENSIBLE => {
                let mut matching_rule = None;
                let mut attr = None;
                let mut value = None;
                let mut dn_attributes = false;
                while !r.is_empty() {
                    let (part_tag, mut part) = r.read_element()?;
                    let bytes = part.rest();
                    match part_tag {
                        MATCHING_RULE_ID => matching_rule = Some(String::from_utf8(bytes.to_vec())?),
                        MATCHING_RULE_TYPE => attr = Some(String::from_utf8(bytes.to_vec())?),
                        MATCHING_RULE_VALUE => value = Some(bytes.to_vec()),
                        MATCHING_RULE_DN_ATTRIBUTES => dn_attributes = bytes.first().is_some_and(|b| *b != 0),
                        _ => bail!("Unknown extensible match component 0x{:02X}", part_tag),
                    }
                }
                let Some(value) = value else {
                    bail!("Extensible match without matchValue");
                };
                if matching_rule.is_none() && attr.is_none() {
                    bail!("Extensible match needs a matching rule or an attribute type");
                }
                Filter::ExtensibleMatch {
                    matching_rule,
                    attr,
                    value,
                    dn_attributes,
                }
            }
            _ => bail!("Unknown filter tag: 0x{:02X}", tag),
        };
        Ok(filter)
    }

    pub fn write_ber(&self, w: &mut BerWriter) {
        match self {
            Filter::And(items) | Filter::Or(items) => {
                let tag = if matches!(self, Filter::And(_)) { FILTER_AND } else { FILTER_OR };
                let pos = w.start_constructed(tag);
                for item in items {
                    item.write_ber(w);
                }
                w.end_constructed(pos);
            }
            Filter::Not(inner) => {
                let pos = w.start_constructed(FILTER_NOT);
                inner.write_ber(w);
                w.end_constructed(pos);
            }
            Filter::EqualityMatch { attr, value } => write_ava(w, FILTER_EQUALITY, attr, value),
            Filter::GreaterOrEqual { attr, value } => write_ava(w, FILTER_GREATER_OR_EQUAL, attr, value),
            Filter::LessOrEqual { attr, value } => write_ava(w, FILTER_LESS_OR_EQUAL, attr, value),
            Filter::ApproxMatch { attr, value } => write_ava(w, FILTER_APPROX, attr, value),
            Filter::Substrings {
                attr,
                initial,
                any,
                final_,
            } => {
                let pos = w.start_constructed(FILTER_SUBSTRINGS);
                w.write_string(attr);
                let seq = w.start_sequence();
                if let Some(v) = initial {
                    w.write_tagged(SUBSTRING_INITIAL, v);
                }
                for v in any {
                    w.write_tagged(SUBSTRING_ANY, v);
                }
                if let Some(v) = final_ {
                    w.write_tagged(SUBSTRING_FINAL, v);
                }
                w.end_sequence(seq);
                w.end_constructed(pos);
            }
            Filter::Present(attr) => w.write_tagged(FILTER_PRESENT, attr.as_bytes()),
            Filter::ExtensibleMatch {
                matching_rule,
                attr,
                value,
                dn_attributes,
            } => {
                let pos = w.start_constructed(FILTER_EXTENSIBLE);
                if let Some(rule) = matching_rule {
                    w.write_tagged(MATCHING_RULE_ID, rule.as_bytes());
                }
                if let Some(attr) = attr {
                    w.write_tagged(MATCHING_RULE_TYPE, attr.as_bytes());
                }
                w.write_tagged(MATCHING_RULE_VALUE, value);
                if *dn_attributes {
                    w.write_tagged(MATCHING_RULE_DN_ATTRIBUTES, &[0xFF]);
                }
                w.end_constructed(pos);
            }
        }
    }

    /// Parse the RFC 4515 string representation, e.g. `(&(objectClass=person)(cn=J*))`.
    /// A bare item without surrounding parentheses is accepted.
    pub fn parse(text: &str) -> Result<Filter, FilterParseError> {
        let trimmed = text.trim();
        let wrapped;
        let input = if trimmed.starts_with('(') {
            trimmed
        } else {
            wrapped = format!("({})", trimmed);
            &wrapped
        };
        let mut parser = FilterParser {
            input: input.as_bytes(),
            pos: 0,
        };
        let filter = parser.filter(0)?;
        if parser.pos != parser.input.len() {
            return Err(parser.error("unexpected data after filter"));
        }
        Ok(filter)
    }

    pub fn to_ldap_string(&self) -> String {
        self.to_string()
    }

    pub fn evaluate(&self, entry: &Entry) -> FilterResult {
        match self {
            Filter::And(items) => {
                let mut result = FilterResult::True;
                for item in items {
                    match item.evaluate(entry) {
                        FilterResult::False => return FilterResult::False,
                        FilterResult::Undefined => result = FilterResult::Undefined,
                        FilterResult::True => {}
                    }
                }
                result
            }
            Filter::Or(items) => {
                let mut result = FilterResult::False;
                for item in items {
                    match item.evaluate(entry) {
                        FilterResult::True => return FilterResult::True,
                        FilterResult::Undefined => result = FilterResult::Undefined,
                        FilterResult::False => {}
                    }
                }
                result
            }
            Filter::Not(inner) => match inner.evaluate(entry) {
                FilterResult::True => FilterResult::False,
                FilterResult::False => FilterResult::True,
                FilterResult::Undefined => FilterResult::Undefined,
            },
            Filter::EqualityMatch { attr, value } => {
                let rule = matching_rule(attr);
                entry
                    .lookup(attr)
                    .iter()
                    .any(|v| rule.values_equal(v, value))
                    .into()
            }
            Filter::ApproxMatch { attr, value } => {
                let rule = matching_rule(attr);
                entry
                    .lookup(attr)
                    .iter()
                    .any(|v| rule.approx_equal(v, value))
                    .into()
            }
            Filter::GreaterOrEqual { attr, value } => evaluate_ordering(entry, attr, value, Ordering::Greater),
            Filter::LessOrEqual { attr, value } => evaluate_ordering(entry, attr, value, Ordering::Less),
            Filter::Present(attr) => entry.has_attribute(attr).into(),
            Filter::Substrings {
                attr,
                initial,
                any,
                final_,
            } => {
                let rule = matching_rule(attr);
                if rule.substring_form(b"").is_none() {
                    return FilterResult::Undefined;
                }
                let fold = |v: &[u8]| rule.substring_form(v).unwrap_or_default();
                let initial = initial.as_deref().map(fold);
                let any: Vec<Vec<u8>> = any.iter().map(|v| fold(v)).collect();
                let final_ = final_.as_deref().map(fold);
                entry
                    .lookup(attr)
                    .iter()
                    .map(|v| fold(v))
                    .any(|v| substring_match(&v, initial.as_deref(), &any, final_.as_deref()))
                    .into()
            }
            Filter::ExtensibleMatch {
                matching_rule: rule_name,
                attr,
                value,
                dn_attributes,
            } => evaluate_extensible(entry, rule_name.as_deref(), attr.as_deref(), value, *dn_attributes),
        }
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        self.evaluate(entry) == FilterResult::True
    }
}

fn write_ava(w: &mut BerWriter, tag: u8, attr: &str, value: &[u8]) {
    let pos = w.start_constructed(tag);
    w.write_string(attr);
    w.write_octet_string(value);
    w.end_constructed(pos);
}

fn evaluate_ordering(entry: &Entry, attr: &str, assertion: &[u8], wanted: Ordering) -> FilterResult {
    let rule = matching_rule(attr);
    let values = entry.lookup(attr);
    let mut undefined = false;
    for v in values.iter() {
        match rule.order(v, assertion) {
            Some(Ordering::Equal) => return FilterResult::True,
            Some(ord) if ord == wanted => return FilterResult::True,
            Some(_) => {}
            None => undefined = true,
        }
    }
    if undefined {
        FilterResult::Undefined
    } else {
        FilterResult::False
    }
}

fn substring_match(value: &[u8], initial: Option<&[u8]>, any: &[Vec<u8>], final_: Option<&[u8]>) -> bool {
    let mut rest = value;
    if let Some(prefix) = initial {
        if !rest.starts_with(prefix) {
            return false;
        }
        rest = &rest[prefix.len()..];
    }
    if let Some(suffix) = final_ {
        if rest.len() < suffix.len() || !rest.ends_with(suffix) {
            return false;
        }
        rest = &rest[..rest.len() - suffix.len()];
    }
    for part in any {
        if part.is_empty() {
            continue;
        }
        match rest.windows(part.len()).position(|w| w == part.as_slice()) {
            Some(i) => rest = &rest[i + part.len()..],
            None => return false,
        }
    }
    true
}

fn evaluate_extensible(
    entry: &Entry,
    rule_name: Option<&str>,
    attr: Option<&str>,
    value: &[u8],
    dn_attributes: bool,
) -> FilterResult {
    let explicit = match rule_name {
        Some(name) => match MatchingRule::from_name(name) {
            Some(rule) => Some(rule),
            None => return FilterResult::Undefined,
        },
        None => None,
    };
    let rule_for = |desc: &str| explicit.unwrap_or_else(|| matching_rule(desc));
    let wanted = |desc: &str| attr.map_or(true, |a| crate::schema::same_attribute(a, desc));

    let in_entry = entry
        .attributes()
        .iter()
        .filter(|a| wanted(&a.attr_type))
        .any(|a| {
            let rule = rule_for(&a.attr_type);
            a.attr_values.iter().any(|v| rule.values_equal(v, value))
        });
    if in_entry {
        return FilterResult::True;
    }
    if dn_attributes {
        let in_dn = entry
            .dn()
            .rdns()
            .iter()
            .flat_map(|rdn| rdn.avas().iter())
            .filter(|ava| wanted(&ava.attr))
            .any(|ava| rule_for(&ava.attr).values_equal(ava.value.as_bytes(), value));
        return in_dn.into();
    }
    FilterResult::False
}

/// Escape an assertion value for the RFC 4515 string form.
fn escape_filter_value(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(text) => text
            .chars()
            .map(|c| match c {
                '*' | '(' | ')' | '\\' => format!("\\{:02x}", c as u32),
                c if (c as u32) < 0x20 => format!("\\{:02x}", c as u32),
                c => c.to_string(),
            })
            .collect(),
        Err(_) => value.iter().map(|b| format!("\\{:02x}", b)).collect(),
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(items) => {
                f.write_str("(&")?;
                for item in items {
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
            Filter::Or(items) => {
                f.write_str("(|")?;
                for item in items {
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
            Filter::EqualityMatch { attr, value } => write!(f, "({}={})", attr, escape_filter_value(value)),
            Filter::GreaterOrEqual { attr, value } => write!(f, "({}>={})", attr, escape_filter_value(value)),
            Filter::LessOrEqual { attr, value } => write!(f, "({}<={})", attr, escape_filter_value(value)),
            Filter::ApproxMatch { attr, value } => write!(f, "({}~={})", attr, escape_filter_value(value)),
            Filter::Present(attr) => write!(f, "({}=*)", attr),
            Filter::Substrings {
                attr,
                initial,
                any,
                final_,
            } => {
                write!(f, "({}=", attr)?;
                if let Some(v) = initial {
                    f.write_str(&escape_filter_value(v))?;
                }
                f.write_str("*")?;
                for v in any {
                    write!(f, "{}*", escape_filter_value(v))?;
                }
                if let Some(v) = final_ {
                    f.write_str(&escape_filter_value(v))?;
                }
                f.write_str(")")
            }
            Filter::ExtensibleMatch {
                matching_rule,
                attr,
                value,
                dn_attributes,
            } => {
                f.write_str("(")?;
                if let Some(attr) = attr {
                    f.write_str(attr)?;
                }
                if *dn_attributes {
                    f.write_str(":dn")?;
                }
                if let Some(rule) = matching_rule {
                    write!(f, ":{}", rule)?;
                }
                write!(f, ":={})", escape_filter_value(value))
            }
        }
    }
}

struct FilterParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl FilterParser<'_> {
    fn error(&self, reason: impl Into<String>) -> FilterParseError {
        FilterParseError {
            offset: self.pos,
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, c: u8) -> Result<(), FilterParseError> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", c as char)))
        }
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    fn filter(&mut self, depth: usize) -> Result<Filter, FilterParseError> {
        if depth > MAX_FILTER_DEPTH {
            return Err(self.error("filter nested too deeply"));
        }
        self.skip_spaces();
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.filter_list(depth)?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.filter_list(depth)?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter(depth + 1)?))
            }
            Some(_) => self.item()?,
            None => return Err(self.error("unexpected end of filter")),
        };
        self.skip_spaces();
        self.expect(b')')?;
        Ok(filter)
    }

    fn filter_list(&mut self, depth: usize) -> Result<Vec<Filter>, FilterParseError> {
        let mut items = Vec::new();
        loop {
            self.skip_spaces();
            match self.peek() {
                Some(b'(') => items.push(self.filter(depth + 1)?),
                _ => return Ok(items),
            }
        }
    }

    fn item(&mut self) -> Result<Filter, FilterParseError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == b')' || c == b'(' {
                break;
            }
            self.pos += 1;
        }
        if self.peek() != Some(b')') {
            return Err(self.error("unterminated filter item"));
        }
        let item = &self.input[start..self.pos];
        let eq = item
            .iter()
            .position(|&c| c == b'=')
            .ok_or_else(|| FilterParseError {
                offset: start,
                reason: "filter item without '='".to_string(),
            })?;
        let raw_value = &item[eq + 1..];
        let (desc, op) = match eq.checked_sub(1).map(|i| item[i]) {
            Some(b'~') => (&item[..eq - 1], b'~'),
            Some(b'>') => (&item[..eq - 1], b'>'),
            Some(b'<') => (&item[..eq - 1], b'<'),
            Some(b':') => (&item[..eq - 1], b':'),
            _ => (&item[..eq], b'='),
        };
        let desc = std::str::from_utf8(desc)
            .map_err(|_| self.error("attribute description is not UTF-8"))?
            .trim();
        let value_error = |reason: &str| FilterParseError {
            offset: start + eq + 1,
            reason: reason.to_string(),
        };

        if op == b':' {
            return parse_extensible(desc, raw_value).map_err(|r| value_error(&r));
        }
        validate_description(desc).map_err(|r| FilterParseError { offset: start, reason: r })?;
        let attr = desc.to_string();

        match op {
            b'~' => Ok(Filter::ApproxMatch {
                attr,
                value: unescape(raw_value).map_err(|r| value_error(&r))?,
            }),
            b'>' => Ok(Filter::GreaterOrEqual {
                attr,
                value: unescape(raw_value).map_err(|r| value_error(&r))?,
            }),
            b'<' => Ok(Filter::LessOrEqual {
                attr,
                value: unescape(raw_value).map_err(|r| value_error(&r))?,
            }),
            _ if raw_value == b"*" => Ok(Filter::Present(attr)),
            _ if raw_value.contains(&b'*') => {
                let parts: Vec<&[u8]> = raw_value.split(|&c| c == b'*').collect();
                let last = parts.len() - 1;
                let mut initial = None;
                let mut any = Vec::new();
                let mut final_ = None;
                for (i, part) in parts.iter().enumerate() {
                    if part.is_empty() {
                        continue;
                    }
                    let value = unescape(part).map_err(|r| value_error(&r))?;
                    if i == 0 {
                        initial = Some(value);
                    } else if i == last {
                        final_ = Some(value);
                    } else {
                        any.push(value);
                    }
                }
                Ok(Filter::Substrings {
                    attr,
                    initial,
                    any,
                    final_,
                })
            }
            _ => Ok(Filter::EqualityMatch {
                attr,
                value: unescape(raw_value).map_err(|r| value_error(&r))?,
            }),
        }
    }
}

fn validate_description(desc: &str) -> Result<(), String> {
    if desc.is_empty() {
        return Err("empty attribute description".to_string());
    }
    if !desc
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | ';' | '.' | '_'))
    {
        return Err(format!("invalid attribute description {:?}", desc));
    }
    Ok(())
}

/// `attr:dn:rule:=value`, any of the three left-hand parts optional.
fn parse_extensible(desc: &str, raw_value: &[u8]) -> Result<Filter, String> {
    let mut parts = desc.split(':');
    let attr_part = parts.next().unwrap_or("").trim();
    let mut dn_attributes = false;
    let mut matching_rule = None;
    for part in parts {
        let part = part.trim();
        if part.eq_ignore_ascii_case("dn") && matching_rule.is_none() {
            dn_attributes = true;
        } else if !part.is_empty() && matching_rule.is_none() {
            matching_rule = Some(part.to_string());
        } else {
            return Err(format!("malformed extensible match {:?}", desc));
        }
    }
    let attr = if attr_part.is_empty() {
        None
    } else {
        validate_description(attr_part)?;
        Some(attr_part.to_string())
    };
    if attr.is_none() && matching_rule.is_none() {
        return Err("extensible match needs an attribute or a matching rule".to_string());
    }
    Ok(Filter::ExtensibleMatch {
        matching_rule,
        attr,
        value: unescape(raw_value)?,
        dn_attributes,
    })
}

/// Decode `\XX` hex escapes. A backslash before a non-hex character is taken literally.
fn unescape(raw: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' {
            let hex = raw
                .get(i + 1..i + 3)
                .and_then(|pair| std::str::from_utf8(pair).ok())
                .and_then(|pair| u8::from_str_radix(pair, 16).ok());
            match (hex, raw.get(i + 1)) {
                (Some(byte), _) => {
                    out.push(byte);
                    i += 3;
                }
                (None, Some(&next)) if !next.is_ascii_hexdigit() => {
                    out.push(next);
                    i += 2;
                }
                _ => return Err("invalid escape sequence".to_string()),
            }
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dn::Dn;
    use crate::ldap_protocol::Attribute;

    fn jahn() -> Entry {
        Entry::from_attributes(
            Dn::parse("uid=jahn,ou=people,dc=ldap,dc=com").unwrap(),
            vec![
                Attribute::from_strs("objectClass", &["top", "person", "inetOrgPerson"]),
                Attribute::from_strs("cn", &["Jahn Dae"]),
                Attribute::from_strs("sn", &["Jahn"]),
                Attribute::from_strs("uid", &["jahn"]),
                Attribute::from_strs("uidNumber", &["1001"]),
                Attribute::from_strs("telephoneNumber", &["11111111"]),
            ],
        )
        .unwrap()
    }

    fn eval(text: &str) -> FilterResult {
        Filter::parse(text).unwrap().evaluate(&jahn())
    }

    #[test]
    fn test_parse_simple_items() {
        assert_eq!(
            Filter::parse("(uid=jahn)").unwrap(),
            Filter::EqualityMatch {
                attr: "uid".to_string(),
                value: b"jahn".to_vec()
            }
        );
        assert_eq!(Filter::parse("(objectClass=*)").unwrap(), Filter::match_all());
        assert_eq!(Filter::parse("uid=jahn").unwrap(), Filter::parse("(uid=jahn)").unwrap());
        assert!(matches!(Filter::parse("(uidNumber>=1000)").unwrap(), Filter::GreaterOrEqual { .. }));
        assert!(matches!(Filter::parse("(uidNumber<=1000)").unwrap(), Filter::LessOrEqual { .. }));
        assert!(matches!(Filter::parse("(cn~=jahn)").unwrap(), Filter::ApproxMatch { .. }));
    }

    #[test]
    fn test_parse_substrings() {
        assert_eq!(
            Filter::parse("(cn=J*h*n*ae)").unwrap(),
            Filter::Substrings {
                attr: "cn".to_string(),
                initial: Some(b"J".to_vec()),
                any: vec![b"h".to_vec(), b"n".to_vec()],
                final_: Some(b"ae".to_vec()),
            }
        );
        assert_eq!(
            Filter::parse("(cn=*Dae)").unwrap(),
            Filter::Substrings {
                attr: "cn".to_string(),
                initial: None,
                any: vec![],
                final_: Some(b"Dae".to_vec()),
            }
        );
    }

    #[test]
    fn test_parse_escapes() {
        assert_eq!(
            Filter::parse(r"(cn=a\2ab\28\29\5c)").unwrap(),
            Filter::EqualityMatch {
                attr: "cn".to_string(),
                value: b"a*b()\\".to_vec()
            }
        );
        assert!(Filter::parse(r"(cn=bad\4)").is_err());
    }

    #[test]
    fn test_parse_nested_and_extensible() {
        let filter = Filter::parse("(&(objectClass=person)(|(uid=jahn)(!(sn=x))))").unwrap();
        match &filter {
            Filter::And(items) => {
                assert_eq!(items.len(), 2);
                assert!(matches!(&items[1], Filter::Or(or) if or.len() == 2));
            }
            _ => panic!("expected And"),
        }
        assert_eq!(
            Filter::parse("(ou:dn:caseExactMatch:=people)").unwrap(),
            Filter::ExtensibleMatch {
                matching_rule: Some("caseExactMatch".to_string()),
                attr: Some("ou".to_string()),
                value: b"people".to_vec(),
                dn_attributes: true,
            }
        );
        assert!(matches!(
            Filter::parse("(:2.5.13.2:=x)").unwrap(),
            Filter::ExtensibleMatch { attr: None, .. }
        ));
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["(uid=jahn", "(uid)", "(&(uid=a)", "((uid=a))", "(=a)", "(uid=a))", "(:=x)", "(c n=x)"] {
            assert!(Filter::parse(bad).is_err(), "{} should not parse", bad);
        }
    }

    #[test]
    fn test_display_round_trip() {
        for text in [
            "(&(objectClass=person)(uid=jahn))",
            "(|(cn=J*)(!(sn=x)))",
            "(cn=*a*b*)",
            r"(cn=a\2ab)",
            "(uid:dn:caseIgnoreMatch:=jahn)",
            "(&)",
        ] {
            assert_eq!(Filter::parse(text).unwrap().to_ldap_string(), text);
        }
    }

    #[test]
    fn test_ber_decode() {
        let filter = Filter::parse("(&(objectClass=person)(cn=J*e)(!(uidNumber<=10))(uid:dn:=jahn))").unwrap();
        let mut w = BerWriter::new();
        filter.write_ber(&mut w);
        let bytes = w.into_vec();
        assert_eq!(bytes[0], FILTER_AND);
        let mut reader = BerReader::new(&bytes);
        assert_eq!(Filter::from_ber(&mut reader).unwrap(), filter);
        assert!(reader.is_empty());

        // present filter on its own: [7] "cn"
        let mut reader = BerReader::new(&[0x87, 0x02, b'c', b'n']);
        assert_eq!(Filter::from_ber(&mut reader).unwrap(), Filter::Present("cn".to_string()));
    }

    #[test]
    fn test_ber_decode_rejects_garbage() {
        assert!(Filter::from_ber(&mut BerReader::new(&[0xAF, 0x00])).is_err());
        // substrings with "final" followed by "initial"
        let bytes = [0xA4, 0x0B, 0x04, 0x02, b'c', b'n', 0x30, 0x05, 0x82, 0x01, b'x', 0x80, 0x00];
        assert!(Filter::from_ber(&mut BerReader::new(&bytes)).is_err());
        // NOT with nothing inside
        assert!(Filter::from_ber(&mut BerReader::new(&[0xA2, 0x00])).is_err());
    }

    #[test]
    fn test_evaluate_equality_and_presence() {
        assert_eq!(eval("(uid=JAHN)"), FilterResult::True);
        assert_eq!(eval("(uid=john)"), FilterResult::False);
        assert_eq!(eval("(mail=*)"), FilterResult::False);
        assert_eq!(eval("(objectClass=*)"), FilterResult::True);
        assert_eq!(eval("(objectClass=inetorgperson)"), FilterResult::True);
        assert_eq!(eval("(entryDN=UID=jahn,ou=people,dc=ldap,dc=com)"), FilterResult::True);
    }

    #[test]
    fn test_evaluate_substrings_and_approx() {
        assert_eq!(eval("(cn=jahn*)"), FilterResult::True);
        assert_eq!(eval("(cn=*DAE)"), FilterResult::True);
        assert_eq!(eval("(cn=j*n*d*)"), FilterResult::True);
        assert_eq!(eval("(cn=*x*)"), FilterResult::False);
        assert_eq!(eval("(cn=Jahn D*ae)"), FilterResult::True);
        assert_eq!(eval("(cn=Jahn Dae*ae)"), FilterResult::False);
        assert_eq!(eval("(uidNumber=10*)"), FilterResult::Undefined);
        assert_eq!(eval("(cn~=jahndae)"), FilterResult::True);
    }

    #[test]
    fn test_evaluate_ordering() {
        assert_eq!(eval("(uidNumber>=1000)"), FilterResult::True);
        assert_eq!(eval("(uidNumber>=999)"), FilterResult::True);
        assert_eq!(eval("(uidNumber<=999)"), FilterResult::False);
        assert_eq!(eval("(uidNumber<=abc)"), FilterResult::Undefined);
        assert_eq!(eval("(sn>=A)"), FilterResult::True);
        assert_eq!(eval("(sn<=A)"), FilterResult::False);
    }

    #[test]
    fn test_three_valued_logic() {
        assert_eq!(eval("(&)"), FilterResult::True);
        assert_eq!(eval("(|)"), FilterResult::False);
        assert_eq!(eval("(!(uidNumber<=abc))"), FilterResult::Undefined);
        assert_eq!(eval("(&(uid=jahn)(uidNumber<=abc))"), FilterResult::Undefined);
        assert_eq!(eval("(&(uid=john)(uidNumber<=abc))"), FilterResult::False);
        assert_eq!(eval("(|(uid=jahn)(uidNumber<=abc))"), FilterResult::True);
        assert_eq!(eval("(|(uid=john)(uidNumber<=abc))"), FilterResult::Undefined);
        assert!(!Filter::parse("(!(uidNumber<=abc))").unwrap().matches(&jahn()));
    }

    #[test]
    fn test_evaluate_extensible() {
        assert_eq!(eval("(sn:caseExactMatch:=Jahn)"), FilterResult::True);
        assert_eq!(eval("(sn:caseExactMatch:=jahn)"), FilterResult::False);
        assert_eq!(eval("(ou:dn:=people)"), FilterResult::True);
        assert_eq!(eval("(ou:=people)"), FilterResult::False);
        assert_eq!(eval("(:caseIgnoreMatch:=JAHN DAE)"), FilterResult::True);
        assert_eq!(eval("(sn:1.2.3.4:=Jahn)"), FilterResult::Undefined);
    }
}
