//! Per-connection LDAP session: bind state and request dispatch.
//!
//! The listener feeds decoded messages to `Session::handle` one at a time and
//! writes back whatever responses it returns. StartTLS is handled by the
//! listener before a message reaches the session.

use crate::directory::{Directory, DirectoryError};
use crate::dn::{Dn, Rdn};
use crate::entry::{AttributeSelection, Entry};
use crate::interceptor::{EntryDisposition, Intercept, InterceptorChain, Operation, OperationContext};
use crate::ldap_protocol::{
    BindAuthentication, BindRequest, ExtendedResponse, LdapMessage, LdapResult, ModifyDNRequest, ProtocolOp,
    ResultCode, SearchRequest, SearchScope, START_TLS_OID, WHO_AM_I_OID,
};
use crate::metrics::Metrics;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Not bound, or bound anonymously.
    Anonymous,
    Bound { dn: String },
    /// Unbind received; no further requests are processed.
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub allow_anonymous: bool,
    /// Advertise StartTLS in the root DSE.
    pub start_tls_available: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            allow_anonymous: true,
            start_tls_available: false,
        }
    }
}

/// What an operation produced before it is turned into response PDUs.
struct Outcome {
    entries: Vec<Entry>,
    result: LdapResult,
    response_name: Option<String>,
    response_value: Option<Vec<u8>>,
}

impl Outcome {
    fn result(result: LdapResult) -> Self {
        Self {
            entries: Vec::new(),
            result,
            response_name: None,
            response_value: None,
        }
    }
}

impl From<Result<(), DirectoryError>> for Outcome {
    fn from(res: Result<(), DirectoryError>) -> Self {
        match res {
            Ok(()) => Outcome::result(LdapResult::success()),
            Err(e) => Outcome::result(e.into()),
        }
    }
}

pub struct Session {
    id: u64,
    peer: Option<SocketAddr>,
    state: SessionState,
    secure: bool,
    operations: u64,
    abandoned: HashSet<i32>,
    directory: Arc<Directory>,
    interceptors: Arc<InterceptorChain>,
    metrics: Option<Arc<Metrics>>,
    options: SessionOptions,
}

impl Session {
    pub fn new(
        id: u64,
        directory: Arc<Directory>,
        interceptors: Arc<InterceptorChain>,
        options: SessionOptions,
    ) -> Self {
        Self {
            id,
            peer: None,
            state: SessionState::Anonymous,
            secure: false,
            operations: 0,
            abandoned: HashSet::new(),
            directory,
            interceptors,
            metrics: None,
            options,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn bound_dn(&self) -> Option<&str> {
        match &self.state {
            SessionState::Bound { dn } => Some(dn),
            _ => None,
        }
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Called by the listener once TLS is established on the connection.
    pub fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    pub fn operation_count(&self) -> u64 {
        self.operations
    }

    pub fn abandoned(&self) -> &HashSet<i32> {
        &self.abandoned
    }

    fn context(&self, message_id: i32) -> OperationContext {
        OperationContext {
            connection_id: self.id,
            message_id,
            peer: self.peer,
            bound_dn: self.bound_dn().unwrap_or_default().to_string(),
            secure: self.secure,
        }
    }

    /// Process one request and return the responses to send, in order.
    pub fn handle(&mut self, message: LdapMessage) -> Vec<LdapMessage> {
        if self.is_closed() {
            return Vec::new();
        }
        self.operations += 1;
        let LdapMessage {
            message_id,
            protocol_op,
            controls,
        } = message;

        let operation = match protocol_op {
            ProtocolOp::UnbindRequest => {
                debug!(conn = self.id, "Unbind received");
                self.state = SessionState::Closed;
                return Vec::new();
            }
            ProtocolOp::AbandonRequest(id) => {
                // Requests run to completion before the next one is read, so there is nothing to cancel
                debug!(conn = self.id, abandon = id, "Abandon received");
                self.abandoned.insert(id);
                return Vec::new();
            }
            ProtocolOp::BindRequest(r) => Operation::Bind(r),
            ProtocolOp::SearchRequest(r) => Operation::Search(r),
            ProtocolOp::AddRequest(r) => Operation::Add(r),
            ProtocolOp::ModifyRequest(r) => Operation::Modify(r),
            ProtocolOp::DelRequest(r) => Operation::Delete(r),
            ProtocolOp::ModifyDNRequest(r) => Operation::ModifyDn(r),
            ProtocolOp::CompareRequest(r) => Operation::Compare(r),
            ProtocolOp::ExtendedRequest(r) => Operation::Extended(r),
            other => {
                warn!(conn = self.id, message_id, "Client sent a response PDU: {:?}", other);
                return vec![LdapMessage::new(
                    message_id,
                    ProtocolOp::ExtendedResponse(ExtendedResponse {
                        result: LdapResult::new(ResultCode::ProtocolError, "unexpected response PDU"),
                        response_name: None,
                        response_value: None,
                    }),
                )];
            }
        };

        if let Some(control) = controls.iter().flatten().find(|c| c.critical) {
            let result = LdapResult::new(
                ResultCode::UnavailableCriticalExtension,
                format!("critical control {} is not supported", control.ctype),
            );
            self.record(operation.name(), &result, Duration::ZERO);
            return vec![LdapMessage::new(message_id, response_op(&operation, Outcome::result(result)))];
        }

        self.dispatch(message_id, operation)
    }

    fn dispatch(&mut self, message_id: i32, mut operation: Operation) -> Vec<LdapMessage> {
        let started = Instant::now();
        let op_name = operation.name();

        if let Operation::Bind(_) = operation {
            // A bind always starts from the anonymous state, whatever its outcome
            self.state = SessionState::Anonymous;
        }

        let ctx = self.context(message_id);
        let mut outcome = if let Some(denied) = self.access_denied(&operation) {
            Outcome::result(denied)
        } else {
            match self.interceptors.process_request(&ctx, &mut operation) {
                Intercept::Respond { entries, result } => {
                    if let Some(m) = &self.metrics {
                        m.inc_intercepted(op_name);
                    }
                    Outcome {
                        entries,
                        result,
                        response_name: None,
                        response_value: None,
                    }
                }
                Intercept::Continue => self.execute(&ctx, &operation),
            }
        };

        let mut kept = Vec::with_capacity(outcome.entries.len());
        for mut entry in std::mem::take(&mut outcome.entries) {
            if self.interceptors.process_search_entry(&ctx, &mut entry) == EntryDisposition::Keep {
                kept.push(entry);
            }
        }
        outcome.entries = kept;
        self.interceptors.process_result(&ctx, &operation, &mut outcome.result);

        if let Operation::Bind(request) = &operation {
            if outcome.result.result_code == ResultCode::Success && !request.name.is_empty() {
                let dn = Dn::parse(&request.name)
                    .map(|d| d.to_string())
                    .unwrap_or_else(|_| request.name.clone());
                info!(conn = self.id, dn = %dn, "Bind successful");
                self.state = SessionState::Bound { dn };
            }
        }

        if let Some(m) = &self.metrics {
            m.add_entries_returned(outcome.entries.len() as u64);
        }
        self.record(op_name, &outcome.result, started.elapsed());
        debug!(
            conn = self.id,
            message_id,
            op = op_name,
            code = %outcome.result.result_code,
            entries = outcome.entries.len(),
            "Operation complete"
        );

        let mut responses = Vec::with_capacity(outcome.entries.len() + 1);
        if let Operation::Search(request) = &operation {
            let selection = AttributeSelection::from_request(&request.attributes);
            for entry in &outcome.entries {
                responses.push(LdapMessage::new(
                    message_id,
                    ProtocolOp::SearchResultEntry(entry.to_search_result(&selection, request.types_only)),
                ));
            }
        }
        responses.push(LdapMessage::new(message_id, response_op(&operation, outcome)));
        responses
    }

    fn record(&self, op: &str, result: &LdapResult, elapsed: Duration) {
        if let Some(m) = &self.metrics {
            m.inc_request(op);
            m.inc_result(op, result.result_code);
            if !result.result_code.is_success() {
                m.inc_error(op);
            }
            m.observe_duration(op, elapsed);
        }
    }

    fn access_denied(&self, operation: &Operation) -> Option<LdapResult> {
        if self.options.allow_anonymous || self.bound_dn().is_some() {
            return None;
        }
        let allowed = match operation {
            Operation::Bind(_) | Operation::Extended(_) => true,
            Operation::Search(r) => is_root_dse_request(r),
            _ => false,
        };
        if allowed {
            None
        } else {
            Some(LdapResult::new(
                ResultCode::InsufficientAccessRights,
                "anonymous access is disabled",
            ))
        }
    }

    fn actor(ctx: &OperationContext) -> &str {
        &ctx.bound_dn
    }

    fn execute(&self, ctx: &OperationContext, operation: &Operation) -> Outcome {
        match operation {
            Operation::Bind(r) => Outcome::result(self.bind(r)),
            Operation::Search(r) => self.search(r),
            Operation::Add(r) => parse_dn(&r.entry)
                .and_then(|dn| {
                    let entry = Entry::from_attributes(dn, r.attributes.clone())?;
                    self.directory.add(entry, Self::actor(ctx))
                })
                .into(),
            Operation::Modify(r) => parse_dn(&r.object)
                .and_then(|dn| self.directory.modify(&dn, &r.changes, Self::actor(ctx)))
                .into(),
            Operation::Delete(r) => parse_dn(&r.entry).and_then(|dn| self.directory.delete(&dn)).into(),
            Operation::ModifyDn(r) => self.rename(r, Self::actor(ctx)).into(),
            Operation::Compare(r) => {
                let compared = parse_dn(&r.entry)
                    .and_then(|dn| self.directory.compare(&dn, &r.attr, &r.assertion_value));
                Outcome::result(match compared {
                    Ok(true) => LdapResult::new(ResultCode::CompareTrue, ""),
                    Ok(false) => LdapResult::new(ResultCode::CompareFalse, ""),
                    Err(e) => e.into(),
                })
            }
            Operation::Extended(r) => self.extended(&r.request_name),
        }
    }

    fn rename(&self, request: &ModifyDNRequest, actor: &str) -> Result<(), DirectoryError> {
        let dn = parse_dn(&request.entry)?;
        let new_rdn = Rdn::parse(&request.newrdn)?;
        let superior = request.new_superior.as_deref().map(parse_dn).transpose()?;
        let new_dn = self
            .directory
            .modify_dn(&dn, &new_rdn, request.delete_old_rdn, superior.as_ref(), actor)?;
        debug!(conn = self.id, from = %dn, to = %new_dn, "Entry renamed");
        Ok(())
    }

    fn bind(&self, request: &BindRequest) -> LdapResult {
        if request.version != 3 {
            return LdapResult::new(
                ResultCode::ProtocolError,
                format!("LDAP version {} is not supported", request.version),
            );
        }
        let password = match &request.authentication {
            BindAuthentication::Simple(password) => password,
            BindAuthentication::Sasl { mechanism, .. } => {
                return LdapResult::new(
                    ResultCode::AuthMethodNotSupported,
                    format!("SASL mechanism {} is not supported", mechanism),
                );
            }
        };
        match (request.name.is_empty(), password.is_empty()) {
            (true, true) => LdapResult::success(),
            (false, true) => LdapResult::new(
                ResultCode::UnwillingToPerform,
                "unauthenticated bind (DN without password) is not allowed",
            ),
            (true, false) => LdapResult::new(ResultCode::InvalidCredentials, "password given without a DN"),
            (false, false) => {
                let verified = parse_dn(&request.name).and_then(|dn| self.directory.authenticate(&dn, password));
                match verified {
                    Ok(()) => LdapResult::success(),
                    Err(e) => {
                        debug!(conn = self.id, dn = %request.name, "Bind rejected: {}", e.message);
                        e.into()
                    }
                }
            }
        }
    }

    fn search(&self, request: &SearchRequest) -> Outcome {
        if is_root_dse_request(request) {
            let dse = self.directory.root_dse(self.options.start_tls_available);
            let entries = if request.filter.matches(&dse) { vec![dse] } else { Vec::new() };
            return Outcome {
                entries,
                result: LdapResult::success(),
                response_name: None,
                response_value: None,
            };
        }
        let base = match parse_dn(&request.base_object) {
            Ok(base) => base,
            Err(e) => return Outcome::result(e.into()),
        };
        let size_limit = request.size_limit.max(0) as usize;
        let time_limit = (request.time_limit > 0).then(|| Duration::from_secs(request.time_limit as u64));
        match self
            .directory
            .search(&base, request.scope, &request.filter, size_limit, time_limit)
        {
            Ok(found) => Outcome {
                entries: found.entries,
                result: found.result,
                response_name: None,
                response_value: None,
            },
            Err(e) => Outcome::result(e.into()),
        }
    }

    fn extended(&self, oid: &str) -> Outcome {
        match oid {
            WHO_AM_I_OID => {
                let authz_id = match self.bound_dn() {
                    Some(dn) => format!("dn:{}", dn),
                    None => String::new(),
                };
                Outcome {
                    entries: Vec::new(),
                    result: LdapResult::success(),
                    response_name: None,
                    response_value: Some(authz_id.into_bytes()),
                }
            }
            START_TLS_OID => Outcome::result(LdapResult::new(
                ResultCode::UnwillingToPerform,
                "StartTLS is not available on this connection",
            )),
            other => Outcome::result(LdapResult::new(
                ResultCode::ProtocolError,
                format!("unsupported extended operation {}", other),
            )),
        }
    }
}

fn parse_dn(text: &str) -> Result<Dn, DirectoryError> {
    Ok(Dn::parse(text)?)
}

/// Base-scope search on the empty DN.
fn is_root_dse_request(request: &SearchRequest) -> bool {
    request.scope == SearchScope::BaseObject && request.base_object.trim().is_empty()
}

/// Wrap an outcome in the response PDU that answers `operation`.
fn response_op(operation: &Operation, outcome: Outcome) -> ProtocolOp {
    let result = outcome.result;
    match operation {
        Operation::Bind(_) => ProtocolOp::BindResponse(result),
        Operation::Search(_) => ProtocolOp::SearchResultDone(result),
        Operation::Add(_) => ProtocolOp::AddResponse(result),
        Operation::Modify(_) => ProtocolOp::ModifyResponse(result),
        Operation::Delete(_) => ProtocolOp::DelResponse(result),
        Operation::ModifyDn(_) => ProtocolOp::ModifyDNResponse(result),
        Operation::Compare(_) => ProtocolOp::CompareResponse(result),
        Operation::Extended(_) => ProtocolOp::ExtendedResponse(ExtendedResponse {
            result,
            response_name: outcome.response_name,
            response_value: outcome.response_value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{BindCredential, DirectoryConfig};
    use crate::filter::Filter;
    use crate::interceptor::StaticEntryInterceptor;
    use crate::ldap_protocol::{
        AddRequest, Attribute, CompareRequest, Control, DelRequest, ExtendedRequest, ModifyChange, ModifyOperation,
        ModifyRequest,
    };

    fn directory() -> Arc<Directory> {
        let dir = Directory::new(DirectoryConfig {
            base_dns: vec!["dc=ldap,dc=com".to_string()],
            credentials: vec![BindCredential {
                dn: "cn=admin,dc=ldap,dc=com".to_string(),
                password: "admin".to_string(),
            }],
            ..DirectoryConfig::default()
        })
        .unwrap();
        let people = Entry::from_attributes(
            Dn::parse("ou=people,dc=ldap,dc=com").unwrap(),
            vec![Attribute::from_strs("objectClass", &["top", "organizationalUnit"])],
        )
        .unwrap();
        let mary = Entry::from_attributes(
            Dn::parse("uid=mary,ou=people,dc=ldap,dc=com").unwrap(),
            vec![
                Attribute::from_strs("objectClass", &["top", "person", "inetOrgPerson"]),
                Attribute::from_strs("cn", &["Mary Major"]),
                Attribute::from_strs("sn", &["Major"]),
                Attribute::from_strs("userPassword", &["marypw"]),
            ],
        )
        .unwrap();
        dir.load_fixtures(vec![people, mary]).unwrap();
        Arc::new(dir)
    }

    fn session_with(options: SessionOptions, chain: InterceptorChain) -> Session {
        Session::new(7, directory(), Arc::new(chain), options).with_metrics(Arc::new(Metrics::new()))
    }

    fn session() -> Session {
        session_with(SessionOptions::default(), InterceptorChain::new())
    }

    fn msg(id: i32, op: ProtocolOp) -> LdapMessage {
        LdapMessage::new(id, op)
    }

    fn bind(name: &str, password: &str) -> ProtocolOp {
        ProtocolOp::BindRequest(BindRequest {
            version: 3,
            name: name.to_string(),
            authentication: BindAuthentication::Simple(password.as_bytes().to_vec()),
        })
    }

    fn search(base: &str, scope: SearchScope, filter: &str, attrs: &[&str]) -> ProtocolOp {
        ProtocolOp::SearchRequest(SearchRequest {
            base_object: base.to_string(),
            scope,
            deref_aliases: 0,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: Filter::parse(filter).unwrap(),
            attributes: attrs.iter().map(|a| a.to_string()).collect(),
        })
    }

    fn result_of(responses: &[LdapMessage]) -> &LdapResult {
        match &responses.last().unwrap().protocol_op {
            ProtocolOp::BindResponse(r)
            | ProtocolOp::SearchResultDone(r)
            | ProtocolOp::AddResponse(r)
            | ProtocolOp::ModifyResponse(r)
            | ProtocolOp::DelResponse(r)
            | ProtocolOp::ModifyDNResponse(r)
            | ProtocolOp::CompareResponse(r) => r,
            ProtocolOp::ExtendedResponse(e) => &e.result,
            other => panic!("not a response: {:?}", other),
        }
    }

    fn code(responses: &[LdapMessage]) -> ResultCode {
        result_of(responses).result_code
    }

    #[test]
    fn test_bind_state_transitions() {
        let mut s = session();
        assert_eq!(s.state(), &SessionState::Anonymous);

        let r = s.handle(msg(1, bind("uid=mary,ou=people,dc=ldap,dc=com", "marypw")));
        assert_eq!(code(&r), ResultCode::Success);
        assert_eq!(r[0].message_id, 1);
        assert_eq!(s.bound_dn(), Some("uid=mary,ou=people,dc=ldap,dc=com"));

        // a failed bind drops the previous identity
        let r = s.handle(msg(2, bind("uid=mary,ou=people,dc=ldap,dc=com", "nope")));
        assert_eq!(code(&r), ResultCode::InvalidCredentials);
        assert_eq!(s.state(), &SessionState::Anonymous);

        let r = s.handle(msg(3, bind("cn=admin,dc=ldap,dc=com", "admin")));
        assert_eq!(code(&r), ResultCode::Success);
        assert_eq!(s.bound_dn(), Some("cn=admin,dc=ldap,dc=com"));

        let r = s.handle(msg(4, bind("", "")));
        assert_eq!(code(&r), ResultCode::Success);
        assert_eq!(s.state(), &SessionState::Anonymous);

        assert!(s.handle(msg(5, ProtocolOp::UnbindRequest)).is_empty());
        assert!(s.is_closed());
        assert!(s.handle(msg(6, bind("", ""))).is_empty());
        assert_eq!(s.operation_count(), 5);
    }

    #[test]
    fn test_bind_rejections() {
        let mut s = session();
        assert_eq!(
            code(&s.handle(msg(1, bind("uid=mary,ou=people,dc=ldap,dc=com", "")))),
            ResultCode::UnwillingToPerform
        );
        assert_eq!(code(&s.handle(msg(2, bind("", "pw")))), ResultCode::InvalidCredentials);
        assert_eq!(code(&s.handle(msg(3, bind("not a dn", "pw")))), ResultCode::InvalidDnSyntax);

        let v2 = ProtocolOp::BindRequest(BindRequest {
            version: 2,
            name: String::new(),
            authentication: BindAuthentication::Simple(Vec::new()),
        });
        assert_eq!(code(&s.handle(msg(4, v2))), ResultCode::ProtocolError);

        let sasl = ProtocolOp::BindRequest(BindRequest {
            version: 3,
            name: String::new(),
            authentication: BindAuthentication::Sasl {
                mechanism: "DIGEST-MD5".to_string(),
                credentials: None,
            },
        });
        assert_eq!(code(&s.handle(msg(5, sasl))), ResultCode::AuthMethodNotSupported);
    }

    #[test]
    fn test_search_returns_entries_then_done() {
        let mut s = session();
        let r = s.handle(msg(
            2,
            search("dc=ldap,dc=com", SearchScope::WholeSubtree, "(objectClass=person)", &["cn"]),
        ));
        assert_eq!(r.len(), 2);
        match &r[0].protocol_op {
            ProtocolOp::SearchResultEntry(e) => {
                assert_eq!(e.object_name, "uid=mary,ou=people,dc=ldap,dc=com");
                assert_eq!(e.attributes, vec![Attribute::from_strs("cn", &["Mary Major"])]);
            }
            other => panic!("expected entry, got {:?}", other),
        }
        assert_eq!(code(&r), ResultCode::Success);
        assert!(r.iter().all(|m| m.message_id == 2));

        let r = s.handle(msg(3, search("ou=nope,dc=ldap,dc=com", SearchScope::BaseObject, "(objectClass=*)", &[])));
        assert_eq!(code(&r), ResultCode::NoSuchObject);
        assert_eq!(result_of(&r).matched_dn, "dc=ldap,dc=com");
    }

    #[test]
    fn test_root_dse() {
        let mut s = session_with(
            SessionOptions {
                allow_anonymous: false,
                start_tls_available: true,
            },
            InterceptorChain::new(),
        );
        let r = s.handle(msg(1, search("", SearchScope::BaseObject, "(objectClass=*)", &["+", "*"])));
        assert_eq!(r.len(), 2);
        match &r[0].protocol_op {
            ProtocolOp::SearchResultEntry(e) => {
                assert_eq!(e.object_name, "");
                let ext = e.attributes.iter().find(|a| a.attr_type == "supportedExtension").unwrap();
                assert!(ext.attr_values.contains(&START_TLS_OID.as_bytes().to_vec()));
            }
            other => panic!("expected root DSE, got {:?}", other),
        }
    }

    #[test]
    fn test_anonymous_access_disabled() {
        let mut s = session_with(
            SessionOptions {
                allow_anonymous: false,
                start_tls_available: false,
            },
            InterceptorChain::new(),
        );
        let r = s.handle(msg(1, search("dc=ldap,dc=com", SearchScope::BaseObject, "(objectClass=*)", &[])));
        assert_eq!(code(&r), ResultCode::InsufficientAccessRights);
        assert_eq!(r.len(), 1);

        s.handle(msg(2, bind("cn=admin,dc=ldap,dc=com", "admin")));
        let r = s.handle(msg(3, search("dc=ldap,dc=com", SearchScope::BaseObject, "(objectClass=*)", &[])));
        assert_eq!(code(&r), ResultCode::Success);
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn test_write_operations() {
        let mut s = session();
        s.handle(msg(1, bind("cn=admin,dc=ldap,dc=com", "admin")));

        let add = ProtocolOp::AddRequest(AddRequest {
            entry: "uid=jahn,ou=people,dc=ldap,dc=com".to_string(),
            attributes: vec![
                Attribute::from_strs("objectClass", &["top", "person"]),
                Attribute::from_strs("cn", &["Jahn Dae"]),
                Attribute::from_strs("sn", &["Jahn"]),
            ],
        });
        assert_eq!(code(&s.handle(msg(2, add.clone()))), ResultCode::Success);
        assert_eq!(code(&s.handle(msg(3, add))), ResultCode::EntryAlreadyExists);

        let modify = ProtocolOp::ModifyRequest(ModifyRequest {
            object: "uid=jahn,ou=people,dc=ldap,dc=com".to_string(),
            changes: vec![ModifyChange {
                operation: ModifyOperation::Add,
                modification: Attribute::from_strs("telephoneNumber", &["11111111"]),
            }],
        });
        assert_eq!(code(&s.handle(msg(4, modify))), ResultCode::Success);

        let compare = |value: &str| {
            ProtocolOp::CompareRequest(CompareRequest {
                entry: "uid=jahn,ou=people,dc=ldap,dc=com".to_string(),
                attr: "telephoneNumber".to_string(),
                assertion_value: value.as_bytes().to_vec(),
            })
        };
        assert_eq!(code(&s.handle(msg(5, compare("11111111")))), ResultCode::CompareTrue);
        assert_eq!(code(&s.handle(msg(6, compare("2")))), ResultCode::CompareFalse);

        let rename = ProtocolOp::ModifyDNRequest(ModifyDNRequest {
            entry: "uid=jahn,ou=people,dc=ldap,dc=com".to_string(),
            newrdn: "uid=john".to_string(),
            delete_old_rdn: true,
            new_superior: None,
        });
        assert_eq!(code(&s.handle(msg(7, rename))), ResultCode::Success);

        let delete = |dn: &str| ProtocolOp::DelRequest(DelRequest { entry: dn.to_string() });
        assert_eq!(code(&s.handle(msg(8, delete("uid=jahn,ou=people,dc=ldap,dc=com")))), ResultCode::NoSuchObject);
        assert_eq!(code(&s.handle(msg(9, delete("uid=john,ou=people,dc=ldap,dc=com")))), ResultCode::Success);
        assert_eq!(code(&s.handle(msg(10, delete("not a dn")))), ResultCode::InvalidDnSyntax);
    }

    #[test]
    fn test_creators_name_is_bound_identity() {
        let mut s = session();
        s.handle(msg(1, bind("cn=admin,dc=ldap,dc=com", "admin")));
        let add = ProtocolOp::AddRequest(AddRequest {
            entry: "cn=x,dc=ldap,dc=com".to_string(),
            attributes: vec![Attribute::from_strs("objectClass", &["top", "device"])],
        });
        s.handle(msg(2, add));
        let entry = s.directory.get(&Dn::parse("cn=x,dc=ldap,dc=com").unwrap()).unwrap();
        assert_eq!(entry.first_str("creatorsName"), Some("cn=admin,dc=ldap,dc=com"));
    }

    #[test]
    fn test_extended_operations() {
        let mut s = session();
        let who_am_i = || {
            ProtocolOp::ExtendedRequest(ExtendedRequest {
                request_name: WHO_AM_I_OID.to_string(),
                request_value: None,
            })
        };
        let value = |r: &[LdapMessage]| match &r[0].protocol_op {
            ProtocolOp::ExtendedResponse(e) => e.response_value.clone(),
            other => panic!("expected extended response, got {:?}", other),
        };
        assert_eq!(value(&s.handle(msg(1, who_am_i()))), Some(Vec::new()));
        s.handle(msg(2, bind("uid=mary,ou=people,dc=ldap,dc=com", "marypw")));
        assert_eq!(
            value(&s.handle(msg(3, who_am_i()))),
            Some(b"dn:uid=mary,ou=people,dc=ldap,dc=com".to_vec())
        );

        let unknown = ProtocolOp::ExtendedRequest(ExtendedRequest {
            request_name: "1.2.3.4".to_string(),
            request_value: None,
        });
        assert_eq!(code(&s.handle(msg(4, unknown))), ResultCode::ProtocolError);
    }

    #[test]
    fn test_critical_control_rejected() {
        let mut s = session();
        let mut message = msg(1, search("dc=ldap,dc=com", SearchScope::BaseObject, "(objectClass=*)", &[]));
        message.controls = Some(vec![Control {
            ctype: "1.2.840.113556.1.4.319".to_string(),
            critical: true,
            value: None,
        }]);
        let r = s.handle(message);
        assert_eq!(r.len(), 1);
        assert_eq!(code(&r), ResultCode::UnavailableCriticalExtension);

        let mut message = msg(2, search("dc=ldap,dc=com", SearchScope::BaseObject, "(objectClass=*)", &[]));
        message.controls = Some(vec![Control {
            ctype: "1.2.840.113556.1.4.319".to_string(),
            critical: false,
            value: None,
        }]);
        assert_eq!(code(&s.handle(message)), ResultCode::Success);
    }

    #[test]
    fn test_abandon_is_recorded_without_response() {
        let mut s = session();
        assert!(s.handle(msg(3, ProtocolOp::AbandonRequest(2))).is_empty());
        assert!(s.abandoned().contains(&2));
    }

    #[test]
    fn test_static_entry_interceptor_short_circuits_store() {
        let jahn = Entry::from_attributes(
            Dn::parse("uid=jahn,ou=people,dc=ldap,dc=com").unwrap(),
            vec![
                Attribute::from_strs("objectclass", &["top", "person", "organizationalPerson", "inetOrgPerson"]),
                Attribute::from_strs("cn", &["Jahn Dae"]),
                Attribute::from_strs("sn", &["Jahn"]),
                Attribute::from_strs("uid", &["jahn"]),
            ],
        )
        .unwrap();
        let chain = InterceptorChain::new().with(Arc::new(StaticEntryInterceptor::new(vec![jahn])));
        let mut s = session_with(SessionOptions::default(), chain);

        // jahn is not in the store, yet the search succeeds with the canned entry
        let r = s.handle(msg(
            1,
            search("uid=jahn,ou=people,dc=ldap,dc=com", SearchScope::BaseObject, "(objectClass=*)", &[]),
        ));
        assert_eq!(r.len(), 2);
        assert_eq!(code(&r), ResultCode::Success);
        let metrics = s.metrics.clone().unwrap();
        assert!(metrics.render(0).contains("ldap_server_intercepted_total{op=\"search\"} 1"));
    }
}
