//! Directory entries: a DN plus attributes with multiple values.

use crate::dn::Dn;
use crate::ldap_protocol::{Attribute, SearchResultEntry};
use crate::schema::{self, matching_rule};
use std::borrow::Cow;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntryError {
    #[error("attribute {attr} already contains value {value:?}")]
    ValueExists { attr: String, value: String },
    #[error("no such attribute {0}")]
    NoSuchAttribute(String),
    #[error("attribute {attr} has no value {value:?}")]
    NoSuchValue { attr: String, value: String },
}

/// Server time in LDAP GeneralizedTime form (`20240131120000Z`).
pub fn generalized_time_now() -> String {
    chrono::Utc::now().format("%Y%m%d%H%M%SZ").to_string()
}

#[derive(Debug, Clone)]
pub struct Entry {
    dn: Dn,
    attributes: Vec<Attribute>,
}

impl Entry {
    pub fn new(dn: Dn) -> Self {
        Self {
            dn,
            attributes: Vec::new(),
        }
    }

    /// Build an entry from the attribute list of an add request or fixture.
    /// Repeated attribute descriptions are merged; a repeated value is an error.
    /// Attributes without values are dropped.
    pub fn from_attributes(dn: Dn, attributes: Vec<Attribute>) -> Result<Self, EntryError> {
        let mut entry = Entry::new(dn);
        for attr in attributes {
            if attr.attr_values.is_empty() {
                continue;
            }
            entry.add_values(&attr.attr_type, attr.attr_values)?;
        }
        Ok(entry)
    }

    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    pub fn set_dn(&mut self, dn: Dn) {
        self.dn = dn;
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Append an attribute as-is, merging into an existing one with the same description.
    pub fn push_attribute(&mut self, attr: Attribute) {
        match self.position(&attr.attr_type) {
            Some(i) => self.attributes[i].attr_values.extend(attr.attr_values),
            None => self.attributes.push(attr),
        }
    }

    fn position(&self, description: &str) -> Option<usize> {
        self.attributes
            .iter()
            .position(|a| schema::same_attribute(&a.attr_type, description))
    }

    pub fn get(&self, description: &str) -> Option<&Attribute> {
        self.position(description).map(|i| &self.attributes[i])
    }

    /// Stored values of an attribute; empty when absent.
    pub fn values(&self, description: &str) -> &[Vec<u8>] {
        self.get(description)
            .map(|a| a.attr_values.as_slice())
            .unwrap_or(&[])
    }

    /// Stored values, or the computed value of a virtual attribute such as `entryDN`.
    pub fn lookup(&self, description: &str) -> Cow<'_, [Vec<u8>]> {
        if schema::same_attribute(description, "entryDN") {
            return Cow::Owned(vec![self.dn.to_string().into_bytes()]);
        }
        Cow::Borrowed(self.values(description))
    }

    pub fn first_str(&self, description: &str) -> Option<&str> {
        self.values(description)
            .first()
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn has_attribute(&self, description: &str) -> bool {
        !self.lookup(description).is_empty()
    }

    pub fn has_value(&self, description: &str, value: &[u8]) -> bool {
        let rule = matching_rule(description);
        self.lookup(description)
            .iter()
            .any(|v| rule.values_equal(v, value))
    }

    /// Add values; fails if any value is already present (or repeated in `values`).
    pub fn add_values(&mut self, description: &str, values: Vec<Vec<u8>>) -> Result<(), EntryError> {
        let rule = matching_rule(description);
        let mut merged: Vec<Vec<u8>> = self.values(description).to_vec();
        for value in values {
            if merged.iter().any(|v| rule.values_equal(v, &value)) {
                return Err(EntryError::ValueExists {
                    attr: description.to_string(),
                    value: String::from_utf8_lossy(&value).into_owned(),
                });
            }
            merged.push(value);
        }
        match self.position(description) {
            Some(i) => self.attributes[i].attr_values = merged,
            None => self.attributes.push(Attribute::new(description, merged)),
        }
        Ok(())
    }

    /// Remove the given values, or the whole attribute when `values` is empty.
    pub fn remove_values(&mut self, description: &str, values: &[Vec<u8>]) -> Result<(), EntryError> {
        let i = self
            .position(description)
            .ok_or_else(|| EntryError::NoSuchAttribute(description.to_string()))?;
        if values.is_empty() {
            self.attributes.remove(i);
            return Ok(());
        }
        let rule = matching_rule(description);
        let mut remaining = self.attributes[i].attr_values.clone();
        for value in values {
            let pos = remaining
                .iter()
                .position(|v| rule.values_equal(v, value))
                .ok_or_else(|| EntryError::NoSuchValue {
                    attr: description.to_string(),
                    value: String::from_utf8_lossy(value).into_owned(),
                })?;
            remaining.remove(pos);
        }
        if remaining.is_empty() {
            self.attributes.remove(i);
        } else {
            self.attributes[i].attr_values = remaining;
        }
        Ok(())
    }

    /// Replace all values; an empty list deletes the attribute if present.
    pub fn replace_values(&mut self, description: &str, values: Vec<Vec<u8>>) -> Result<(), EntryError> {
        if let Some(i) = self.position(description) {
            self.attributes.remove(i);
        }
        if values.is_empty() {
            return Ok(());
        }
        self.add_values(description, values)
    }

    pub fn remove_attribute(&mut self, description: &str) -> bool {
        match self.position(description) {
            Some(i) => {
                self.attributes.remove(i);
                true
            }
            None => false,
        }
    }

    /// Make sure every AVA of the leading RDN is present as an attribute value.
    pub fn insert_rdn_values(&mut self) {
        let avas = match self.dn.rdn() {
            Some(rdn) => rdn.avas().to_vec(),
            None => return,
        };
        for ava in avas {
            if !self.has_value(&ava.attr, ava.value.as_bytes()) {
                self.push_attribute(Attribute::new(ava.attr.clone(), vec![ava.value.into_bytes()]));
            }
        }
    }

    /// First RDN attribute whose value is missing from the entry.
    pub fn missing_rdn_value(&self) -> Option<String> {
        let rdn = self.dn.rdn()?;
        rdn.avas()
            .iter()
            .find(|ava| !self.has_value(&ava.attr, ava.value.as_bytes()))
            .map(|ava| ava.attr.clone())
    }

    fn set_operational(&mut self, description: &str, value: &str) {
        self.remove_attribute(description);
        self.attributes
            .push(Attribute::new(description, vec![value.as_bytes().to_vec()]));
    }

    /// Stamp creation metadata. `actor` is the bound DN, empty for anonymous or internal writes.
    pub fn stamp_created(&mut self, actor: &str, now: &str) {
        self.set_operational("createTimestamp", now);
        self.set_operational("creatorsName", actor);
        self.stamp_modified(actor, now);
    }

    pub fn stamp_modified(&mut self, actor: &str, now: &str) {
        self.set_operational("modifyTimestamp", now);
        self.set_operational("modifiersName", actor);
    }

    /// Render for a SearchResultEntry according to the requested attribute list.
    pub fn to_search_result(&self, selection: &AttributeSelection, types_only: bool) -> SearchResultEntry {
        let mut attributes: Vec<Attribute> = self
            .attributes
            .iter()
            .filter(|a| selection.includes(&a.attr_type))
            .cloned()
            .collect();
        if selection.includes("entryDN") {
            attributes.push(Attribute::new("entryDN", self.lookup("entryDN").into_owned()));
        }
        if types_only {
            for attr in &mut attributes {
                attr.attr_values.clear();
            }
        }
        SearchResultEntry {
            object_name: self.dn.to_string(),
            attributes,
        }
    }
}

/// Which attributes a search asked for.
#[derive(Debug, Clone, Default)]
pub struct AttributeSelection {
    all_user: bool,
    all_operational: bool,
    names: Vec<String>,
}

impl AttributeSelection {
    pub fn from_request(requested: &[String]) -> Self {
        if requested.is_empty() {
            return Self {
                all_user: true,
                ..Self::default()
            };
        }
        let mut selection = Self::default();
        for name in requested {
            match name.trim() {
                "*" => selection.all_user = true,
                "+" => selection.all_operational = true,
                // "1.1" alone means no attributes; alongside other names it is ignored
                "1.1" | "" => {}
                other => selection.names.push(other.to_string()),
            }
        }
        selection
    }

    pub fn includes(&self, description: &str) -> bool {
        let operational = schema::is_operational(description);
        (operational && self.all_operational)
            || (!operational && self.all_user)
            || self.names.iter().any(|n| schema::same_attribute(n, description))
    }
}
