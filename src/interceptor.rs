//! Ordered hooks around every operation.
//!
//! Each interceptor sees the request before the store does and may answer it
//! itself, then sees every search entry and the final result on the way out.

use crate::dn::Dn;
use crate::entry::Entry;
use crate::ldap_protocol::{
    AddRequest, BindRequest, CompareRequest, DelRequest, ExtendedRequest, LdapResult, ModifyDNRequest,
    ModifyRequest, SearchRequest,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Who is asking and on which connection.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub connection_id: u64,
    pub message_id: i32,
    pub peer: Option<SocketAddr>,
    /// Bound DN, empty for anonymous.
    pub bound_dn: String,
    pub secure: bool,
}

/// A request on its way to the store. Interceptors may rewrite it.
#[derive(Debug, Clone)]
pub enum Operation {
    Bind(BindRequest),
    Search(SearchRequest),
    Add(AddRequest),
    Modify(ModifyRequest),
    Delete(DelRequest),
    ModifyDn(ModifyDNRequest),
    Compare(CompareRequest),
    Extended(ExtendedRequest),
}

impl Operation {
    /// Label used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Bind(_) => "bind",
            Operation::Search(_) => "search",
            Operation::Add(_) => "add",
            Operation::Modify(_) => "modify",
            Operation::Delete(_) => "delete",
            Operation::ModifyDn(_) => "modify_dn",
            Operation::Compare(_) => "compare",
            Operation::Extended(_) => "extended",
        }
    }

    /// The DN the operation targets (search base for searches, OID for extended operations).
    pub fn target(&self) -> &str {
        match self {
            Operation::Bind(r) => &r.name,
            Operation::Search(r) => &r.base_object,
            Operation::Add(r) => &r.entry,
            Operation::Modify(r) => &r.object,
            Operation::Delete(r) => &r.entry,
            Operation::ModifyDn(r) => &r.entry,
            Operation::Compare(r) => &r.entry,
            Operation::Extended(r) => &r.request_name,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Intercept {
    /// Hand the request to the next interceptor, and finally to the store.
    Continue,
    /// Answer without touching the store.
    Respond { entries: Vec<Entry>, result: LdapResult },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDisposition {
    Keep,
    Drop,
}

pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    fn process_request(&self, _ctx: &OperationContext, _op: &mut Operation) -> Intercept {
        Intercept::Continue
    }

    fn process_search_entry(&self, _ctx: &OperationContext, _entry: &mut Entry) -> EntryDisposition {
        EntryDisposition::Keep
    }

    fn process_result(&self, _ctx: &OperationContext, _op: &Operation, _result: &mut LdapResult) {}
}

/// Interceptors in registration order.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.push(interceptor);
        self
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// First `Respond` wins; later interceptors do not see the request.
    pub fn process_request(&self, ctx: &OperationContext, op: &mut Operation) -> Intercept {
        for interceptor in &self.interceptors {
            if let Intercept::Respond { entries, result } = interceptor.process_request(ctx, op) {
                debug!(
                    interceptor = interceptor.name(),
                    op = op.name(),
                    message_id = ctx.message_id,
                    "Request answered by interceptor"
                );
                return Intercept::Respond { entries, result };
            }
        }
        Intercept::Continue
    }

    pub fn process_search_entry(&self, ctx: &OperationContext, entry: &mut Entry) -> EntryDisposition {
        for interceptor in &self.interceptors {
            if interceptor.process_search_entry(ctx, entry) == EntryDisposition::Drop {
                return EntryDisposition::Drop;
            }
        }
        EntryDisposition::Keep
    }

    pub fn process_result(&self, ctx: &OperationContext, op: &Operation, result: &mut LdapResult) {
        for interceptor in &self.interceptors {
            interceptor.process_result(ctx, op, result);
        }
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Answers searches based at a configured DN with a canned entry.
///
/// The entry is sent whatever the filter and scope say; the search then
/// completes with success and the store is never consulted.
pub struct StaticEntryInterceptor {
    entries: HashMap<String, Entry>,
}

impl StaticEntryInterceptor {
    pub fn new(entries: Vec<Entry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|e| (e.dn().normalized().to_string(), e))
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Interceptor for StaticEntryInterceptor {
    fn name(&self) -> &str {
        "static_entries"
    }

    fn process_request(&self, _ctx: &OperationContext, op: &mut Operation) -> Intercept {
        let Operation::Search(request) = op else {
            return Intercept::Continue;
        };
        let Ok(base) = Dn::parse(&request.base_object) else {
            return Intercept::Continue;
        };
        match self.entries.get(base.normalized()) {
            Some(entry) => Intercept::Respond {
                entries: vec![entry.clone()],
                result: LdapResult::success(),
            },
            None => Intercept::Continue,
        }
    }
}

/// Debug-level trace of every hook.
#[derive(Debug, Default)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &str {
        "log_operations"
    }

    fn process_request(&self, ctx: &OperationContext, op: &mut Operation) -> Intercept {
        match op {
            Operation::Search(r) => debug!(
                conn = ctx.connection_id,
                message_id = ctx.message_id,
                base = %r.base_object,
                scope = ?r.scope,
                filter = %r.filter,
                "Search request"
            ),
            other => debug!(
                conn = ctx.connection_id,
                message_id = ctx.message_id,
                op = other.name(),
                target = other.target(),
                "Request"
            ),
        }
        Intercept::Continue
    }

    fn process_search_entry(&self, ctx: &OperationContext, entry: &mut Entry) -> EntryDisposition {
        debug!(conn = ctx.connection_id, message_id = ctx.message_id, dn = %entry.dn(), "Search entry");
        EntryDisposition::Keep
    }

    fn process_result(&self, ctx: &OperationContext, op: &Operation, result: &mut LdapResult) {
        debug!(
            conn = ctx.connection_id,
            message_id = ctx.message_id,
            op = op.name(),
            code = %result.result_code,
            "Result"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::ldap_protocol::{Attribute, ResultCode, SearchScope};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> OperationContext {
        OperationContext {
            connection_id: 1,
            message_id: 2,
            peer: None,
            bound_dn: String::new(),
            secure: false,
        }
    }

    fn search(base: &str, filter: &str) -> Operation {
        Operation::Search(SearchRequest {
            base_object: base.to_string(),
            scope: SearchScope::BaseObject,
            deref_aliases: 0,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: Filter::parse(filter).unwrap(),
            attributes: vec![],
        })
    }

    fn jahn() -> Entry {
        Entry::from_attributes(
            Dn::parse("uid=jahn,ou=people,dc=ldap,dc=com").unwrap(),
            vec![
                Attribute::from_strs("objectclass", &["top", "person", "organizationalPerson", "inetOrgPerson"]),
                Attribute::from_strs("cn", &["Jahn Dae"]),
                Attribute::from_strs("uid", &["jahn"]),
            ],
        )
        .unwrap()
    }

    struct Counting {
        requests: AtomicUsize,
        respond: bool,
    }

    impl Interceptor for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn process_request(&self, _ctx: &OperationContext, _op: &mut Operation) -> Intercept {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.respond {
                Intercept::Respond {
                    entries: vec![],
                    result: LdapResult::new(ResultCode::UnwillingToPerform, "counting"),
                }
            } else {
                Intercept::Continue
            }
        }

        fn process_search_entry(&self, _ctx: &OperationContext, entry: &mut Entry) -> EntryDisposition {
            if entry.has_value("uid", b"hidden") {
                EntryDisposition::Drop
            } else {
                entry.push_attribute(Attribute::from_strs("description", &["seen"]));
                EntryDisposition::Keep
            }
        }

        fn process_result(&self, _ctx: &OperationContext, _op: &Operation, result: &mut LdapResult) {
            result.diagnostic_message.push_str("+counted");
        }
    }

    #[test]
    fn test_static_entry_interceptor_answers_configured_base() {
        let interceptor = StaticEntryInterceptor::new(vec![jahn()]);
        let mut op = search("UID=jahn, ou=people,dc=ldap,dc=com", "(objectClass=*)");
        match interceptor.process_request(&ctx(), &mut op) {
            Intercept::Respond { entries, result } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(result.result_code, ResultCode::Success);
            }
            Intercept::Continue => panic!("expected Respond"),
        }

        // the canned entry is sent even when the filter does not select it
        let mut op = search("uid=jahn,ou=people,dc=ldap,dc=com", "(uid=someoneelse)");
        match interceptor.process_request(&ctx(), &mut op) {
            Intercept::Respond { entries, result } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].first_str("uid"), Some("jahn"));
                assert_eq!(result.result_code, ResultCode::Success);
            }
            Intercept::Continue => panic!("expected Respond"),
        }

        let mut op = search("ou=people,dc=ldap,dc=com", "(objectClass=*)");
        assert!(matches!(interceptor.process_request(&ctx(), &mut op), Intercept::Continue));
    }

    #[test]
    fn test_static_entry_interceptor_ignores_other_operations() {
        let interceptor = StaticEntryInterceptor::new(vec![jahn()]);
        let mut op = Operation::Delete(DelRequest {
            entry: "uid=jahn,ou=people,dc=ldap,dc=com".to_string(),
        });
        assert!(matches!(interceptor.process_request(&ctx(), &mut op), Intercept::Continue));
    }

    #[test]
    fn test_chain_first_respond_wins() {
        let first = Arc::new(Counting {
            requests: AtomicUsize::new(0),
            respond: true,
        });
        let second = Arc::new(Counting {
            requests: AtomicUsize::new(0),
            respond: true,
        });
        let chain = InterceptorChain::new().with(first.clone()).with(second.clone());
        let mut op = search("dc=ldap,dc=com", "(objectClass=*)");
        match chain.process_request(&ctx(), &mut op) {
            Intercept::Respond { result, .. } => assert_eq!(result.result_code, ResultCode::UnwillingToPerform),
            Intercept::Continue => panic!("expected Respond"),
        }
        assert_eq!(first.requests.load(Ordering::SeqCst), 1);
        assert_eq!(second.requests.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_chain_entry_and_result_hooks() {
        let counting = Arc::new(Counting {
            requests: AtomicUsize::new(0),
            respond: false,
        });
        let chain = InterceptorChain::new()
            .with(Arc::new(LoggingInterceptor))
            .with(counting.clone())
            .with(counting);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.names(), vec!["log_operations", "counting", "counting"]);

        let mut op = search("dc=ldap,dc=com", "(objectClass=*)");
        assert!(matches!(chain.process_request(&ctx(), &mut op), Intercept::Continue));

        let mut entry = jahn();
        assert_eq!(chain.process_search_entry(&ctx(), &mut entry), EntryDisposition::Keep);
        assert_eq!(entry.values("description").len(), 2);

        let mut hidden = Entry::from_attributes(
            Dn::parse("uid=hidden,dc=ldap,dc=com").unwrap(),
            vec![Attribute::from_strs("objectClass", &["top"])],
        )
        .unwrap();
        hidden.insert_rdn_values();
        assert_eq!(chain.process_search_entry(&ctx(), &mut hidden), EntryDisposition::Drop);

        let mut result = LdapResult::success();
        chain.process_result(&ctx(), &op, &mut result);
        assert_eq!(result.diagnostic_message, "+counted+counted");
    }

    #[test]
    fn test_empty_chain_continues() {
        let chain = InterceptorChain::new();
        assert!(chain.is_empty());
        let mut op = search("dc=ldap,dc=com", "(objectClass=*)");
        assert!(matches!(chain.process_request(&ctx(), &mut op), Intercept::Continue));
    }
}
