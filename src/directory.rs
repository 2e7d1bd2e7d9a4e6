//! In-memory directory tree.
//!
//! Entries are keyed by normalized DN. A parent -> children index serves
//! one-level and subtree scopes and the leaf check on delete. Every operation
//! takes the lock once, so each is atomic with respect to the others.

use crate::dn::{Dn, DnError, Rdn};
use crate::entry::{generalized_time_now, Entry, EntryError};
use crate::filter::Filter;
use crate::ldap_protocol::{
    Attribute, LdapResult, ModifyChange, ModifyOperation, ResultCode, SearchScope, START_TLS_OID, WHO_AM_I_OID,
};
use crate::schema::{self, SchemaViolation};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Error of a directory operation, mapped 1:1 onto an LDAP result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct DirectoryError {
    pub code: ResultCode,
    pub matched_dn: String,
    pub message: String,
}

impl DirectoryError {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            matched_dn: String::new(),
            message: message.into(),
        }
    }

    pub fn with_matched_dn(mut self, matched_dn: impl Into<String>) -> Self {
        self.matched_dn = matched_dn.into();
        self
    }
}

impl From<DirectoryError> for LdapResult {
    fn from(err: DirectoryError) -> Self {
        LdapResult {
            result_code: err.code,
            matched_dn: err.matched_dn,
            diagnostic_message: err.message,
        }
    }
}

impl From<DnError> for DirectoryError {
    fn from(err: DnError) -> Self {
        DirectoryError::new(ResultCode::InvalidDnSyntax, err.to_string())
    }
}

impl From<EntryError> for DirectoryError {
    fn from(err: EntryError) -> Self {
        let code = match err {
            EntryError::ValueExists { .. } => ResultCode::AttributeOrValueExists,
            EntryError::NoSuchAttribute(_) | EntryError::NoSuchValue { .. } => ResultCode::NoSuchAttribute,
        };
        DirectoryError::new(code, err.to_string())
    }
}

impl From<SchemaViolation> for DirectoryError {
    fn from(err: SchemaViolation) -> Self {
        DirectoryError::new(ResultCode::ObjectClassViolation, err.to_string())
    }
}

/// Additional bind identity accepted next to the entries' own `userPassword`.
#[derive(Debug, Clone)]
pub struct BindCredential {
    pub dn: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub base_dns: Vec<String>,
    pub schema_validation: bool,
    /// Server-side cap on returned entries; 0 means unlimited.
    pub size_limit: usize,
    pub credentials: Vec<BindCredential>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_dns: vec!["dc=example,dc=com".to_string()],
            schema_validation: true,
            size_limit: 0,
            credentials: Vec::new(),
        }
    }
}

/// Entries found by a search and the result that closes it.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub entries: Vec<Entry>,
    pub result: LdapResult,
}

#[derive(Debug, Default)]
struct Tree {
    entries: BTreeMap<String, Entry>,
    children: HashMap<String, BTreeSet<String>>,
}

impl Tree {
    fn contains(&self, dn: &Dn) -> bool {
        self.entries.contains_key(dn.normalized())
    }

    fn get(&self, dn: &Dn) -> Option<&Entry> {
        self.entries.get(dn.normalized())
    }

    fn insert(&mut self, entry: Entry) {
        let key = entry.dn().normalized().to_string();
        if let Some(parent) = entry.dn().parent() {
            self.children
                .entry(parent.normalized().to_string())
                .or_default()
                .insert(key.clone());
        }
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, dn: &Dn) -> Option<Entry> {
        let key = dn.normalized();
        let entry = self.entries.remove(key)?;
        if let Some(parent) = dn.parent() {
            let parent_key = parent.normalized();
            if let Some(siblings) = self.children.get_mut(parent_key) {
                siblings.remove(key);
                if siblings.is_empty() {
                    self.children.remove(parent_key);
                }
            }
        }
        Some(entry)
    }

    fn has_children(&self, dn: &Dn) -> bool {
        self.children
            .get(dn.normalized())
            .is_some_and(|c| !c.is_empty())
    }

    fn children_of(&self, key: &str) -> impl Iterator<Item = &Entry> {
        self.children
            .get(key)
            .into_iter()
            .flat_map(|keys| keys.iter())
            .filter_map(|k| self.entries.get(k))
    }

    /// `key` and everything below it, parents before children.
    fn subtree_keys(&self, key: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = vec![key.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(kids) = self.children.get(&current) {
                stack.extend(kids.iter().rev().cloned());
            }
            out.push(current);
        }
        out
    }

    /// Closest existing ancestor, rendered for matchedDN.
    fn matched_dn(&self, dn: &Dn) -> String {
        let mut current = dn.parent();
        while let Some(candidate) = current {
            if let Some(entry) = self.get(&candidate) {
                return entry.dn().to_string();
            }
            current = candidate.parent();
        }
        String::new()
    }
}

pub struct Directory {
    config: DirectoryConfig,
    base_dns: Vec<Dn>,
    credentials: Vec<(Dn, Vec<u8>)>,
    tree: RwLock<Tree>,
}

impl Directory {
    pub fn new(config: DirectoryConfig) -> Result<Self, DirectoryError> {
        let base_dns = config
            .base_dns
            .iter()
            .map(|b| Dn::parse(b))
            .collect::<Result<Vec<_>, _>>()?;
        if base_dns.iter().any(Dn::is_root) {
            return Err(DirectoryError::new(
                ResultCode::UnwillingToPerform,
                "the empty DN cannot be a naming context",
            ));
        }
        let credentials = config
            .credentials
            .iter()
            .map(|c| Ok((Dn::parse(&c.dn)?, c.password.as_bytes().to_vec())))
            .collect::<Result<Vec<_>, DirectoryError>>()?;
        Ok(Self {
            config,
            base_dns,
            credentials,
            tree: RwLock::new(Tree::default()),
        })
    }

    pub fn base_dns(&self) -> &[Dn] {
        &self.base_dns
    }

    pub fn len(&self) -> usize {
        self.tree.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, dn: &Dn) -> Option<Entry> {
        self.tree.read().get(dn).cloned()
    }

    fn is_base_dn(&self, dn: &Dn) -> bool {
        self.base_dns.iter().any(|b| b == dn)
    }

    fn in_naming_context(&self, dn: &Dn) -> bool {
        self.base_dns.iter().any(|b| dn.is_within(b))
    }

    /// Seed the tree at startup. Missing naming-context entries are created
    /// first; fixtures are then added parents-first.
    pub fn load_fixtures(&self, fixtures: Vec<Entry>) -> Result<usize, DirectoryError> {
        let mut fixtures = fixtures;
        fixtures.sort_by_key(|e| e.dn().depth());
        let mut loaded = 0;
        for base in self.base_dns.clone() {
            let provided = fixtures.iter().any(|e| e.dn() == &base);
            if !provided && !self.tree.read().contains(&base) {
                self.add(default_base_entry(&base), "")?;
                info!(dn = %base, "Created naming context entry");
                loaded += 1;
            }
        }
        for entry in fixtures {
            let dn = entry.dn().to_string();
            self.add(entry, "")
                .map_err(|e| DirectoryError { message: format!("fixture {}: {}", dn, e.message), ..e })?;
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn add(&self, mut entry: Entry, actor: &str) -> Result<(), DirectoryError> {
        let dn = entry.dn().clone();
        if dn.is_root() {
            return Err(DirectoryError::new(ResultCode::UnwillingToPerform, "cannot add the root DSE"));
        }
        if !self.in_naming_context(&dn) {
            return Err(DirectoryError::new(
                ResultCode::NoSuchObject,
                format!("{} is not within any naming context", dn),
            ));
        }
        entry.insert_rdn_values();
        if self.config.schema_validation {
            schema::validate_entry(&entry)?;
        }
        entry.stamp_created(actor, &generalized_time_now());

        let mut tree = self.tree.write();
        if tree.contains(&dn) {
            return Err(DirectoryError::new(
                ResultCode::EntryAlreadyExists,
                format!("entry {} already exists", dn),
            ));
        }
        if !self.is_base_dn(&dn) {
            let parent_exists = dn.parent().is_some_and(|p| tree.contains(&p));
            if !parent_exists {
                return Err(DirectoryError::new(
                    ResultCode::NoSuchObject,
                    format!("parent of {} does not exist", dn),
                )
                .with_matched_dn(tree.matched_dn(&dn)));
            }
        }
        debug!(dn = %dn, "Entry added");
        tree.insert(entry);
        Ok(())
    }

    pub fn delete(&self, dn: &Dn) -> Result<(), DirectoryError> {
        let mut tree = self.tree.write();
        if !tree.contains(dn) {
            return Err(no_such_object(&tree, dn));
        }
        if tree.has_children(dn) {
            return Err(DirectoryError::new(
                ResultCode::NotAllowedOnNonLeaf,
                format!("entry {} has subordinates", dn),
            ));
        }
        tree.remove(dn);
        debug!(dn = %dn, "Entry deleted");
        Ok(())
    }

    /// Apply all changes to a copy and commit only if every change succeeds.
    pub fn modify(&self, dn: &Dn, changes: &[ModifyChange], actor: &str) -> Result<(), DirectoryError> {
        let mut tree = self.tree.write();
        let mut entry = match tree.get(dn) {
            Some(entry) => entry.clone(),
            None => return Err(no_such_object(&tree, dn)),
        };

        for change in changes {
            let Attribute { attr_type, attr_values } = &change.modification;
            if schema::is_operational(attr_type) {
                return Err(DirectoryError::new(
                    ResultCode::ConstraintViolation,
                    format!("attribute {} is not user-modifiable", attr_type),
                ));
            }
            match change.operation {
                ModifyOperation::Add => {
                    if attr_values.is_empty() {
                        return Err(DirectoryError::new(
                            ResultCode::ProtocolError,
                            format!("modify/add of {} without values", attr_type),
                        ));
                    }
                    entry.add_values(attr_type, attr_values.clone())?;
                }
                ModifyOperation::Delete => entry.remove_values(attr_type, attr_values)?,
                ModifyOperation::Replace => entry.replace_values(attr_type, attr_values.clone())?,
            }
        }

        if let Some(attr) = entry.missing_rdn_value() {
            return Err(DirectoryError::new(
                ResultCode::NotAllowedOnRdn,
                format!("cannot remove RDN value of {}", attr),
            ));
        }
        if self.config.schema_validation {
            schema::validate_entry(&entry)?;
        }
        entry.stamp_modified(actor, &generalized_time_now());
        tree.insert(entry);
        debug!(dn = %dn, changes = changes.len(), "Entry modified");
        Ok(())
    }

    /// Rename and/or move an entry together with its subtree.
    pub fn modify_dn(
        &self,
        dn: &Dn,
        new_rdn: &Rdn,
        delete_old_rdn: bool,
        new_superior: Option<&Dn>,
        actor: &str,
    ) -> Result<Dn, DirectoryError> {
        let mut tree = self.tree.write();
        let Some(current) = tree.get(dn).cloned() else {
            return Err(no_such_object(&tree, dn));
        };
        if self.is_base_dn(dn) {
            return Err(DirectoryError::new(
                ResultCode::UnwillingToPerform,
                format!("cannot rename naming context {}", dn),
            ));
        }

        let parent = match new_superior {
            Some(superior) => {
                if superior.is_within(dn) {
                    return Err(DirectoryError::new(
                        ResultCode::UnwillingToPerform,
                        "cannot move an entry below itself",
                    ));
                }
                if !tree.contains(superior) {
                    return Err(DirectoryError::new(
                        ResultCode::NoSuchObject,
                        format!("new superior {} does not exist", superior),
                    )
                    .with_matched_dn(tree.matched_dn(superior)));
                }
                superior.clone()
            }
            None => dn.parent().unwrap_or_else(Dn::root),
        };
        let new_dn = parent.child(new_rdn.clone());
        if !self.in_naming_context(&new_dn) {
            return Err(DirectoryError::new(
                ResultCode::UnwillingToPerform,
                format!("{} is not within any naming context", new_dn),
            ));
        }
        if new_dn != *dn && tree.contains(&new_dn) {
            return Err(DirectoryError::new(
                ResultCode::EntryAlreadyExists,
                format!("entry {} already exists", new_dn),
            ));
        }

        let mut renamed = current;
        if delete_old_rdn {
            if let Some(old_rdn) = dn.rdn() {
                for ava in old_rdn.avas() {
                    let kept = new_rdn
                        .avas()
                        .iter()
                        .any(|n| schema::same_attribute(&n.attr, &ava.attr)
                            && schema::matching_rule(&ava.attr).values_equal(n.value.as_bytes(), ava.value.as_bytes()));
                    if !kept {
                        // The old value may already be gone; that is not an error here
                        let _ = renamed.remove_values(&ava.attr, &[ava.value.as_bytes().to_vec()]);
                    }
                }
            }
        }
        renamed.set_dn(new_dn.clone());
        renamed.insert_rdn_values();
        if self.config.schema_validation {
            schema::validate_entry(&renamed)?;
        }
        renamed.stamp_modified(actor, &generalized_time_now());

        // All checks passed: relocate the subtree.
        let keys = tree.subtree_keys(dn.normalized());
        let mut moved = Vec::with_capacity(keys.len());
        for key in keys.iter().skip(1) {
            if let Some(mut descendant) = tree.entries.get(key).cloned() {
                if let Some(rebased) = descendant.dn().rebase(dn, &new_dn) {
                    descendant.set_dn(rebased);
                }
                moved.push(descendant);
            }
        }
        for key in keys.iter().rev() {
            if let Some(old) = tree.entries.get(key).map(|e| e.dn().clone()) {
                tree.remove(&old);
            }
        }
        tree.insert(renamed);
        for descendant in moved {
            tree.insert(descendant);
        }
        debug!(from = %dn, to = %new_dn, subtree = keys.len(), "Entry renamed");
        Ok(new_dn)
    }

    /// Returns `true` for compareTrue, `false` for compareFalse.
    pub fn compare(&self, dn: &Dn, attr: &str, value: &[u8]) -> Result<bool, DirectoryError> {
        let tree = self.tree.read();
        let entry = tree.get(dn).ok_or_else(|| no_such_object(&tree, dn))?;
        if !entry.has_attribute(attr) {
            return Err(DirectoryError::new(
                ResultCode::NoSuchAttribute,
                format!("entry {} has no attribute {}", dn, attr),
            ));
        }
        Ok(entry.has_value(attr, value))
    }

    /// `size_limit` and `time_limit` of zero mean "no client limit"; the server size limit still applies.
    pub fn search(
        &self,
        base: &Dn,
        scope: SearchScope,
        filter: &Filter,
        size_limit: usize,
        time_limit: Option<Duration>,
    ) -> Result<SearchOutcome, DirectoryError> {
        let limit = match (size_limit, self.config.size_limit) {
            (0, server) => server,
            (client, 0) => client,
            (client, server) => client.min(server),
        };
        let deadline = time_limit.map(|t| Instant::now() + t);

        let tree = self.tree.read();
        let candidates: Vec<&Entry> = if base.is_root() {
            // Below the root DSE: the naming contexts and their subtrees
            let roots = self.base_dns.iter().filter(|b| tree.contains(b));
            match scope {
                SearchScope::BaseObject => Vec::new(),
                SearchScope::SingleLevel => roots.filter_map(|b| tree.get(b)).collect(),
                SearchScope::WholeSubtree => roots
                    .flat_map(|b| tree.subtree_keys(b.normalized()))
                    .filter_map(|k| tree.entries.get(&k))
                    .collect(),
            }
        } else {
            if !tree.contains(base) {
                return Err(no_such_object(&tree, base));
            }
            match scope {
                SearchScope::BaseObject => tree.get(base).into_iter().collect(),
                SearchScope::SingleLevel => tree.children_of(base.normalized()).collect(),
                SearchScope::WholeSubtree => tree
                    .subtree_keys(base.normalized())
                    .iter()
                    .filter_map(|k| tree.entries.get(k))
                    .collect(),
            }
        };

        let mut entries = Vec::new();
        let mut result = LdapResult::success();
        let mut candidates = candidates.into_iter().peekable();
        while let Some(entry) = candidates.next() {
            if filter.matches(entry) {
                if limit > 0 && entries.len() >= limit {
                    result = LdapResult::new(ResultCode::SizeLimitExceeded, "size limit exceeded");
                    break;
                }
                entries.push(entry.clone());
            }
            // The deadline is checked between candidates, so every search examines at least one
            if candidates.peek().is_some() && deadline.is_some_and(|d| Instant::now() >= d) {
                result = LdapResult::new(ResultCode::TimeLimitExceeded, "time limit exceeded");
                break;
            }
        }
        Ok(SearchOutcome { entries, result })
    }

    /// Simple bind check: configured credentials first, then the entry's `userPassword`.
    pub fn authenticate(&self, dn: &Dn, password: &[u8]) -> Result<(), DirectoryError> {
        let invalid = || DirectoryError::new(ResultCode::InvalidCredentials, "invalid credentials");
        if let Some((_, expected)) = self.credentials.iter().find(|(cred_dn, _)| cred_dn == dn) {
            return if expected.as_slice() == password { Ok(()) } else { Err(invalid()) };
        }
        let tree = self.tree.read();
        let entry = tree.get(dn).ok_or_else(invalid)?;
        if entry.values("userPassword").iter().any(|v| v.as_slice() == password) {
            Ok(())
        } else {
            Err(invalid())
        }
    }

    /// The root DSE (RFC 4512 section 5.1).
    pub fn root_dse(&self, start_tls: bool) -> Entry {
        let mut extensions = vec![WHO_AM_I_OID];
        if start_tls {
            extensions.push(START_TLS_OID);
        }
        let contexts: Vec<String> = self.base_dns.iter().map(|b| b.to_string()).collect();
        let mut entry = Entry::new(Dn::root());
        entry.push_attribute(Attribute::from_strs("objectClass", &["top", "extensibleObject"]));
        entry.push_attribute(Attribute::new(
            "namingContexts",
            contexts.into_iter().map(String::into_bytes).collect(),
        ));
        entry.push_attribute(Attribute::from_strs("supportedLDAPVersion", &["3"]));
        entry.push_attribute(Attribute::from_strs("supportedExtension", &extensions));
        entry.push_attribute(Attribute::from_strs("vendorName", &[env!("CARGO_PKG_NAME")]));
        entry.push_attribute(Attribute::from_strs("vendorVersion", &[env!("CARGO_PKG_VERSION")]));
        entry
    }
}

fn no_such_object(tree: &Tree, dn: &Dn) -> DirectoryError {
    DirectoryError::new(ResultCode::NoSuchObject, format!("entry {} does not exist", dn))
        .with_matched_dn(tree.matched_dn(dn))
}

/// Minimal entry for a naming context that no fixture provides.
fn default_base_entry(dn: &Dn) -> Entry {
    let mut entry = Entry::new(dn.clone());
    let attr = dn
        .rdn()
        .and_then(|r| r.avas().first())
        .map(|a| a.attr.to_ascii_lowercase())
        .unwrap_or_default();
    let classes: &[&str] = match attr.as_str() {
        "dc" => &["top", "domain"],
        "o" => &["top", "organization"],
        "ou" => &["top", "organizationalUnit"],
        "c" => &["top", "country"],
        _ => &["top", "extensibleObject"],
    };
    entry.push_attribute(Attribute::from_strs("objectClass", classes));
    entry
}
