// LDAP protocol handling with BER encoding/decoding
// Decodes LDAPv3 request PDUs and encodes the responses the directory sends back

use crate::filter::Filter;
use anyhow::{Context, Result, bail};
use std::fmt;
use std::io::{Cursor, Read};

// LDAP Control (request)
#[derive(Debug, Clone)]
pub struct Control {
    pub ctype: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

/// RFC 4511 StartTLS extended operation.
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";
/// RFC 4532 "Who am I?" extended operation.
pub const WHO_AM_I_OID: &str = "1.3.6.1.4.1.4203.1.11.3";
/// RFC 4511 unsolicited Notice of Disconnection.
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

// LDAP Message structure
#[derive(Debug, Clone)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Option<Vec<Control>>,
}

impl LdapMessage {
    pub fn new(message_id: i32, protocol_op: ProtocolOp) -> Self {
        Self {
            message_id,
            protocol_op,
            controls: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(LdapResult),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultDone(LdapResult),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DelRequest(DelRequest),
    DelResponse(LdapResult),
    ModifyDNRequest(ModifyDNRequest),
    ModifyDNResponse(LdapResult),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
}

/// LDAP result codes produced by this server (RFC 4511 section 4.1.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    TimeLimitExceeded = 3,
    SizeLimitExceeded = 4,
    CompareFalse = 5,
    CompareTrue = 6,
    AuthMethodNotSupported = 7,
    UnavailableCriticalExtension = 12,
    NoSuchAttribute = 16,
    UndefinedAttributeType = 17,
    ConstraintViolation = 19,
    AttributeOrValueExists = 20,
    InvalidAttributeSyntax = 21,
    NoSuchObject = 32,
    InvalidDnSyntax = 34,
    InvalidCredentials = 49,
    InsufficientAccessRights = 50,
    Busy = 51,
    Unavailable = 52,
    UnwillingToPerform = 53,
    NamingViolation = 64,
    ObjectClassViolation = 65,
    NotAllowedOnNonLeaf = 66,
    NotAllowedOnRdn = 67,
    EntryAlreadyExists = 68,
    Other = 80,
}

impl ResultCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::OperationsError => "operationsError",
            ResultCode::ProtocolError => "protocolError",
            ResultCode::TimeLimitExceeded => "timeLimitExceeded",
            ResultCode::SizeLimitExceeded => "sizeLimitExceeded",
            ResultCode::CompareFalse => "compareFalse",
            ResultCode::CompareTrue => "compareTrue",
            ResultCode::AuthMethodNotSupported => "authMethodNotSupported",
            ResultCode::UnavailableCriticalExtension => "unavailableCriticalExtension",
            ResultCode::NoSuchAttribute => "noSuchAttribute",
            ResultCode::UndefinedAttributeType => "undefinedAttributeType",
            ResultCode::ConstraintViolation => "constraintViolation",
            ResultCode::AttributeOrValueExists => "attributeOrValueExists",
            ResultCode::InvalidAttributeSyntax => "invalidAttributeSyntax",
            ResultCode::NoSuchObject => "noSuchObject",
            ResultCode::InvalidDnSyntax => "invalidDNSyntax",
            ResultCode::InvalidCredentials => "invalidCredentials",
            ResultCode::InsufficientAccessRights => "insufficientAccessRights",
            ResultCode::Busy => "busy",
            ResultCode::Unavailable => "unavailable",
            ResultCode::UnwillingToPerform => "unwillingToPerform",
            ResultCode::NamingViolation => "namingViolation",
            ResultCode::ObjectClassViolation => "objectClassViolation",
            ResultCode::NotAllowedOnNonLeaf => "notAllowedOnNonLeaf",
            ResultCode::NotAllowedOnRdn => "notAllowedOnRDN",
            ResultCode::EntryAlreadyExists => "entryAlreadyExists",
            ResultCode::Other => "other",
        }
    }

    /// Codes that report a completed operation rather than a failure.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ResultCode::Success | ResultCode::CompareTrue | ResultCode::CompareFalse
        )
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// LDAPResult: the common tail of every response PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub result_code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
}

impl LdapResult {
    pub fn success() -> Self {
        Self::new(ResultCode::Success, "")
    }

    pub fn new(result_code: ResultCode, diagnostic_message: impl Into<String>) -> Self {
        Self {
            result_code,
            matched_dn: String::new(),
            diagnostic_message: diagnostic_message.into(),
        }
    }

    pub fn with_matched_dn(mut self, matched_dn: impl Into<String>) -> Self {
        self.matched_dn = matched_dn.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone)]
pub enum BindAuthentication {
    Simple(Vec<u8>),
    Sasl { mechanism: String, credentials: Option<Vec<u8>> },
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: i32,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<i32> for SearchScope {
    type Error = anyhow::Error;
    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => bail!("Invalid search scope: {}", value),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

#[derive(Debug, Clone)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct DelRequest {
    pub entry: String,
}

#[derive(Debug, Clone)]
pub struct ModifyDNRequest {
    pub entry: String,
    pub newrdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompareRequest {
    pub entry: String,
    pub attr: String,
    pub assertion_value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new(attr_type: impl Into<String>, attr_values: Vec<Vec<u8>>) -> Self {
        Self {
            attr_type: attr_type.into(),
            attr_values,
        }
    }

    pub fn from_strs(attr_type: &str, values: &[&str]) -> Self {
        Self::new(
            attr_type,
            values.iter().map(|v| v.as_bytes().to_vec()).collect(),
        )
    }
}

// BER parsing utilities. Each constructed element is handed out as its own
// reader, so `remaining()` never runs past the end of the enclosing element.
pub(crate) struct BerReader<'a> {
    pub(crate) cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.cursor
            .read_exact(&mut buf)
            .context("BER truncated: unexpected end of element")?;
        Ok(buf[0])
    }

    pub(crate) fn read_tag(&mut self) -> Result<u8> {
        self.read_byte()
    }

    pub(crate) fn peek_tag(&self) -> Option<u8> {
        let pos = self.cursor.position() as usize;
        self.cursor.get_ref().get(pos).copied()
    }

    pub(crate) fn read_length(&mut self) -> Result<usize> {
        let first_byte = self.read_byte()?;

        if (first_byte & 0x80) == 0 {
            // Short form
            Ok(first_byte as usize)
        } else {
            // Long form
            let length_bytes = (first_byte & 0x7F) as usize;
            if length_bytes == 0 {
                bail!("Indefinite length not supported");
            }
            if length_bytes > 4 {
                bail!("Length too large: {} bytes", length_bytes);
            }
            if self.remaining() < length_bytes {
                bail!("BER truncated: length encoding needs {} bytes, {} remaining", length_bytes, self.remaining());
            }
            let mut length = 0usize;
            for _ in 0..length_bytes {
                length = (length << 8) | self.read_byte()? as usize;
            }
            Ok(length)
        }
    }

    /// Read tag and length, and return the tag with a reader bounded to the element content.
    pub(crate) fn read_element(&mut self) -> Result<(u8, BerReader<'a>)> {
        let tag = self.read_tag()?;
        let content = self.read_value_bytes()?;
        Ok((tag, BerReader::new(content)))
    }

    /// Read a constructed element, failing unless its tag is `expected`.
    pub(crate) fn read_constructed(&mut self, expected: u8) -> Result<BerReader<'a>> {
        let (tag, reader) = self.read_element()?;
        if tag != expected {
            bail!("Expected tag 0x{:02X}, got: 0x{:02X}", expected, tag);
        }
        Ok(reader)
    }

    pub(crate) fn read_sequence(&mut self) -> Result<BerReader<'a>> {
        self.read_constructed(0x30)
    }

    /// Read length + value (tag already consumed) as a borrowed slice.
    fn read_value_bytes(&mut self) -> Result<&'a [u8]> {
        let length = self.read_length()?;
        if self.remaining() < length {
            bail!("BER truncated: element needs {} bytes, {} remaining", length, self.remaining());
        }
        let data: &'a [u8] = self.cursor.get_ref();
        let start = self.cursor.position() as usize;
        self.cursor.set_position((start + length) as u64);
        Ok(&data[start..start + length])
    }

    pub(crate) fn read_integer(&mut self) -> Result<i32> {
        let tag = self.read_tag()?;
        if tag != 0x02 {
            bail!("Expected INTEGER tag (0x02), got: 0x{:02X}", tag);
        }
        decode_integer(self.read_value_bytes()?)
    }

    pub(crate) fn read_enumerated(&mut self) -> Result<i32> {
        let tag = self.read_tag()?;
        if tag != 0x0A {
            bail!("Expected ENUMERATED tag, got: 0x{:02X}", tag);
        }
        decode_integer(self.read_value_bytes()?)
    }

    pub(crate) fn read_boolean(&mut self) -> Result<bool> {
        let tag = self.read_tag()?;
        if tag != 0x01 {
            bail!("Expected BOOLEAN tag, got: 0x{:02X}", tag);
        }
        let value = self.read_value_bytes()?;
        if value.len() != 1 {
            bail!("Boolean value must be 1 byte, got: {}", value.len());
        }
        Ok(value[0] != 0)
    }

    /// Read a universal OCTET STRING TLV.
    pub(crate) fn read_octet_string(&mut self) -> Result<Vec<u8>> {
        let tag = self.read_tag()?;
        if tag != 0x04 {
            bail!("Expected OCTET STRING tag (0x04), got: 0x{:02X}", tag);
        }
        Ok(self.read_value_bytes()?.to_vec())
    }

    pub(crate) fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_octet_string()?;
        String::from_utf8(bytes).context("Invalid UTF-8 string")
    }

    /// Consume and return everything left in this element.
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let data: &'a [u8] = self.cursor.get_ref();
        let start = (self.cursor.position() as usize).min(data.len());
        self.cursor.set_position(data.len() as u64);
        &data[start..]
    }

    pub(crate) fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        let len = self.cursor.get_ref().len();
        len.saturating_sub(pos)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

pub(crate) fn decode_integer(bytes: &[u8]) -> Result<i32> {
    if bytes.is_empty() {
        bail!("Integer has no content octets");
    }
    if bytes.len() > 4 {
        bail!("Integer too large: {} bytes", bytes.len());
    }
    // Sign extension for negative numbers
    let mut value: i32 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    for &byte in bytes {
        value = (value << 8) | byte as i32;
    }
    Ok(value)
}

fn integer_octets(value: i32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 3 {
        let (b, next) = (bytes[start], bytes[start + 1]);
        let redundant = (b == 0x00 && next & 0x80 == 0) || (b == 0xFF && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

fn length_octets(length: usize) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut len = length;
    while len > 0 {
        bytes.push((len & 0xFF) as u8);
        len >>= 8;
    }
    bytes.reverse();
    bytes
}

// BER encoding utilities
#[derive(Default)]
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn write_length(&mut self, length: usize) {
        if length < 128 {
            // Short form
            self.buffer.push(length as u8);
        } else {
            // Long form
            let bytes = length_octets(length);
            self.buffer.push(0x80 | bytes.len() as u8);
            self.buffer.extend_from_slice(&bytes);
        }
    }

    pub fn write_integer(&mut self, value: i32) {
        self.write_tagged(0x02, &integer_octets(value));
    }

    pub fn write_enumerated(&mut self, value: i32) {
        self.write_tagged(0x0A, &integer_octets(value));
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_tagged(0x01, &[if value { 0xFF } else { 0x00 }]);
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_tagged(0x04, data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    /// Primitive element with an arbitrary (usually context-specific) tag.
    pub fn write_tagged(&mut self, tag: u8, data: &[u8]) {
        self.write_tag(tag);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    /// Write `tag` and reserve a length byte. Call `end_constructed(pos)` after writing the content.
    pub fn start_constructed(&mut self, tag: u8) -> usize {
        self.write_tag(tag);
        let pos = self.buffer.len();
        self.buffer.push(0);
        pos
    }

    /// Back-patch length at pos for content written after the placeholder.
    /// Supports short and long form.
    pub fn end_constructed(&mut self, pos: usize) {
        let content_len = self.buffer.len() - (pos + 1);
        if content_len < 128 {
            self.buffer[pos] = content_len as u8;
        } else {
            let bytes = length_octets(content_len);
            self.buffer[pos] = 0x80 | bytes.len() as u8;
            self.buffer.splice(pos + 1..pos + 1, bytes);
        }
    }

    pub fn start_sequence(&mut self) -> usize {
        self.start_constructed(0x30)
    }

    pub fn end_sequence(&mut self, pos: usize) {
        self.end_constructed(pos)
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

// LDAP protocol tag constants
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;

/// Context [0] IMPLICIT SEQUENCE OF control
const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;
/// SASL credentials inside a BindRequest: [3] SaslCredentials
const LDAP_TAG_SASL_CREDENTIALS: u8 = 0xA3;
/// Top-level LDAP message is always a SEQUENCE.
pub const LDAP_MESSAGE_SEQUENCE_TAG: u8 = 0x30;

/// Response tag used to answer a request with the given tag. None for requests that get no response.
pub fn response_tag_for_request(request_tag: u8) -> Option<u8> {
    match request_tag {
        LDAP_TAG_BIND_REQUEST => Some(LDAP_TAG_BIND_RESPONSE),
        LDAP_TAG_SEARCH_REQUEST => Some(LDAP_TAG_SEARCH_RESULT_DONE),
        LDAP_TAG_MODIFY_REQUEST => Some(LDAP_TAG_MODIFY_RESPONSE),
        LDAP_TAG_ADD_REQUEST => Some(LDAP_TAG_ADD_RESPONSE),
        LDAP_TAG_DEL_REQUEST => Some(LDAP_TAG_DEL_RESPONSE),
        LDAP_TAG_MODIFY_DN_REQUEST => Some(LDAP_TAG_MODIFY_DN_RESPONSE),
        LDAP_TAG_COMPARE_REQUEST => Some(LDAP_TAG_COMPARE_RESPONSE),
        LDAP_TAG_EXTENDED_REQUEST => Some(LDAP_TAG_EXTENDED_RESPONSE),
        LDAP_TAG_UNBIND_REQUEST | LDAP_TAG_ABANDON_REQUEST => None,
        _ => Some(LDAP_TAG_EXTENDED_RESPONSE),
    }
}

/// Outcome of looking for one complete top-level element at the front of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Framing {
    /// Not enough data yet.
    Incomplete,
    /// A whole message of this many bytes is available.
    Complete(usize),
    /// The stream cannot be framed (wrong tag, bad length, too large).
    Invalid(String),
}

pub fn frame_length(buffer: &[u8], max_message_size: usize) -> Framing {
    if buffer.len() < 2 {
        return Framing::Incomplete;
    }
    if buffer[0] != LDAP_MESSAGE_SEQUENCE_TAG {
        return Framing::Invalid(format!("expected SEQUENCE (0x30), got 0x{:02X}", buffer[0]));
    }
    let first_byte = buffer[1];
    let total = if (first_byte & 0x80) == 0 {
        2 + first_byte as usize
    } else {
        let length_bytes = (first_byte & 0x7F) as usize;
        if length_bytes == 0 {
            return Framing::Invalid("indefinite length".to_string());
        }
        if length_bytes > 4 {
            return Framing::Invalid(format!("length uses {} octets", length_bytes));
        }
        if buffer.len() < 2 + length_bytes {
            return Framing::Incomplete;
        }
        let mut length = 0usize;
        for &b in &buffer[2..2 + length_bytes] {
            length = (length << 8) | b as usize;
        }
        2 + length_bytes + length
    };
    if total > max_message_size {
        return Framing::Invalid(format!(
            "message of {} bytes exceeds limit of {} bytes",
            total, max_message_size
        ));
    }
    if buffer.len() < total {
        Framing::Incomplete
    } else {
        Framing::Complete(total)
    }
}

/// Parse only the LDAP message header (SEQUENCE, messageID, protocolOp tag).
/// Returns (message_id, request_tag) for building error responses when full parse fails.
pub fn parse_ldap_message_header(data: &[u8]) -> Result<(i32, u8)> {
    let mut outer = BerReader::new(data);
    let mut reader = outer.read_sequence()?;
    let message_id = reader.read_integer()?;
    let tag = reader.read_tag()?;
    Ok((message_id, tag))
}

pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage> {
    let mut outer = BerReader::new(data);

    // LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
    let mut reader = outer.read_sequence()?;
    if !outer.is_empty() {
        bail!("{} trailing bytes after LDAPMessage", outer.remaining());
    }

    let message_id = reader.read_integer()?;
    if message_id < 0 {
        bail!("Invalid message ID: {}", message_id);
    }

    let (tag, mut op) = reader.read_element()?;
    let protocol_op = match tag {
        LDAP_TAG_BIND_REQUEST => ProtocolOp::BindRequest(parse_bind_request(&mut op)?),
        LDAP_TAG_UNBIND_REQUEST => ProtocolOp::UnbindRequest,
        LDAP_TAG_SEARCH_REQUEST => ProtocolOp::SearchRequest(parse_search_request(&mut op)?),
        LDAP_TAG_MODIFY_REQUEST => ProtocolOp::ModifyRequest(parse_modify_request(&mut op)?),
        LDAP_TAG_ADD_REQUEST => ProtocolOp::AddRequest(parse_add_request(&mut op)?),
        LDAP_TAG_DEL_REQUEST => ProtocolOp::DelRequest(parse_del_request(&mut op)?),
        LDAP_TAG_MODIFY_DN_REQUEST => ProtocolOp::ModifyDNRequest(parse_modify_dn_request(&mut op)?),
        LDAP_TAG_COMPARE_REQUEST => ProtocolOp::CompareRequest(parse_compare_request(&mut op)?),
        LDAP_TAG_ABANDON_REQUEST => ProtocolOp::AbandonRequest(decode_integer(op.rest())?),
        LDAP_TAG_EXTENDED_REQUEST => ProtocolOp::ExtendedRequest(parse_extended_request(&mut op)?),
        _ => bail!("Unsupported LDAP operation tag: 0x{:02X}", tag),
    };

    let controls = if !reader.is_empty() {
        let (next_tag, mut controls) = reader.read_element()?;
        if next_tag != LDAP_CONTEXT_CONTROLS {
            bail!("Unexpected element 0x{:02X} after protocolOp", next_tag);
        }
        Some(parse_controls(&mut controls)?)
    } else {
        None
    };

    Ok(LdapMessage {
        message_id,
        protocol_op,
        controls,
    })
}

/// Parse controls: SEQUENCE OF Control, each Control ::= SEQUENCE { type, critical DEFAULT FALSE, value OPTIONAL }
fn parse_controls(reader: &mut BerReader) -> Result<Vec<Control>> {
    let mut controls = Vec::new();
    while !reader.is_empty() {
        let mut ctrl = reader.read_sequence()?;
        let ctype = ctrl.read_string()?;
        let critical = if ctrl.peek_tag() == Some(0x01) {
            ctrl.read_boolean()?
        } else {
            false
        };
        let value = if ctrl.peek_tag() == Some(0x04) {
            Some(ctrl.read_octet_string()?)
        } else {
            None
        };
        controls.push(Control {
            ctype,
            critical,
            value,
        });
    }
    Ok(controls)
}

fn parse_bind_request(reader: &mut BerReader) -> Result<BindRequest> {
    let version = reader.read_integer()?;
    let name = reader.read_string()?;

    // Authentication: RFC 4511 simple is [0] IMPLICIT OCTET STRING (0x80), but clients send various tags (0x41, 0x61, 0xD0, etc.).
    // Treat anything that is not SASL (0xA3) as simple bind.
    let (auth_tag, mut auth) = reader.read_element()?;
    let authentication = if auth_tag == LDAP_TAG_SASL_CREDENTIALS {
        let mechanism = auth.read_string()?;
        let credentials = if !auth.is_empty() {
            Some(auth.read_octet_string()?)
        } else {
            None
        };
        BindAuthentication::Sasl {
            mechanism,
            credentials,
        }
    } else {
        BindAuthentication::Simple(auth.rest().to_vec())
    };

    Ok(BindRequest {
        version,
        name,
        authentication,
    })
}

fn parse_search_request(reader: &mut BerReader) -> Result<SearchRequest> {
    let base_object = reader.read_string()?;
    let scope = SearchScope::try_from(reader.read_enumerated()?)?;
    let deref_aliases = reader.read_enumerated()?;
    let size_limit = reader.read_integer()?;
    let time_limit = reader.read_integer()?;
    let types_only = reader.read_boolean()?;
    let filter = Filter::from_ber(reader).context("Invalid search filter")?;

    let mut attrs = reader.read_sequence()?;
    let mut attributes = Vec::new();
    while !attrs.is_empty() {
        attributes.push(attrs.read_string()?);
    }

    Ok(SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    })
}

fn parse_modify_request(reader: &mut BerReader) -> Result<ModifyRequest> {
    let object = reader.read_string()?;

    let mut changes_seq = reader.read_sequence()?;
    let mut changes = Vec::new();
    while !changes_seq.is_empty() {
        let mut change = changes_seq.read_sequence()?;
        let operation = change.read_enumerated()?;
        let modification = parse_attribute(&mut change)?;

        changes.push(ModifyChange {
            operation: match operation {
                0 => ModifyOperation::Add,
                1 => ModifyOperation::Delete,
                2 => ModifyOperation::Replace,
                _ => bail!("Invalid modify operation: {}", operation),
            },
            modification,
        });
    }

    Ok(ModifyRequest { object, changes })
}

fn parse_add_request(reader: &mut BerReader) -> Result<AddRequest> {
    let entry = reader.read_string()?;

    let mut attrs = reader.read_sequence()?;
    let mut attributes = Vec::new();
    while !attrs.is_empty() {
        attributes.push(parse_attribute(&mut attrs)?);
    }

    Ok(AddRequest { entry, attributes })
}

/// DelRequest ::= [APPLICATION 10] LDAPDN, primitive: the content is the DN itself.
fn parse_del_request(reader: &mut BerReader) -> Result<DelRequest> {
    let entry = String::from_utf8(reader.rest().to_vec()).context("Invalid UTF-8 DN")?;
    Ok(DelRequest { entry })
}

/// ModifyDNRequest ::= [APPLICATION 12] SEQUENCE { entry, newrdn, deleteoldrdn, newSuperior [0] OPTIONAL }
fn parse_modify_dn_request(reader: &mut BerReader) -> Result<ModifyDNRequest> {
    let entry = reader.read_string()?;
    let newrdn = reader.read_string()?;
    let delete_old_rdn = reader.read_boolean()?;
    let new_superior = if !reader.is_empty() {
        let (tag, mut value) = reader.read_element()?;
        if tag != 0x80 {
            bail!("ModifyDNRequest: expected newSuperior [0], got tag 0x{:02X}", tag);
        }
        Some(String::from_utf8(value.rest().to_vec()).context("Invalid UTF-8 newSuperior")?)
    } else {
        None
    };
    Ok(ModifyDNRequest {
        entry,
        newrdn,
        delete_old_rdn,
        new_superior,
    })
}

/// CompareRequest ::= [APPLICATION 14] SEQUENCE { entry, ava AttributeValueAssertion }
/// AttributeValueAssertion ::= SEQUENCE { attributeDesc, assertionValue OCTET STRING }
fn parse_compare_request(reader: &mut BerReader) -> Result<CompareRequest> {
    let entry = reader.read_string()?;
    let mut ava = reader.read_sequence()?;
    let attr = ava.read_string()?;
    let assertion_value = ava.read_octet_string()?;
    Ok(CompareRequest {
        entry,
        attr,
        assertion_value,
    })
}

/// ExtendedRequest ::= [APPLICATION 23] SEQUENCE { requestName [0] LDAPOID, requestValue [1] OCTET STRING OPTIONAL }
fn parse_extended_request(reader: &mut BerReader) -> Result<ExtendedRequest> {
    let (name_tag, mut name) = reader.read_element()?;
    if name_tag != 0x80 {
        bail!("ExtendedRequest: expected requestName [0], got tag 0x{:02X}", name_tag);
    }
    let request_name = String::from_utf8(name.rest().to_vec()).context("Invalid UTF-8 OID")?;
    let request_value = if !reader.is_empty() {
        let (value_tag, mut value) = reader.read_element()?;
        if value_tag != 0x81 {
            bail!("ExtendedRequest: expected requestValue [1], got tag 0x{:02X}", value_tag);
        }
        Some(value.rest().to_vec())
    } else {
        None
    };
    Ok(ExtendedRequest {
        request_name,
        request_value,
    })
}

/// PartialAttribute ::= SEQUENCE { type AttributeDescription, vals SET OF value }
fn parse_attribute(reader: &mut BerReader) -> Result<Attribute> {
    let mut attr = reader.read_sequence()?;
    let attr_type = attr.read_string()?;

    let (vals_tag, mut vals) = attr.read_element()?;
    if vals_tag != 0x31 && vals_tag != 0x30 {
        bail!("Expected SET OF values, got tag 0x{:02X}", vals_tag);
    }
    let mut attr_values = Vec::new();
    while !vals.is_empty() {
        attr_values.push(vals.read_octet_string()?);
    }

    Ok(Attribute {
        attr_type,
        attr_values,
    })
}

pub fn encode_ldap_message(message: &LdapMessage) -> Result<Vec<u8>> {
    let mut writer = BerWriter::new();
    let seq_start = writer.start_sequence();

    writer.write_integer(message.message_id);

    match &message.protocol_op {
        ProtocolOp::BindResponse(result) => encode_result(&mut writer, LDAP_TAG_BIND_RESPONSE, result),
        ProtocolOp::SearchResultEntry(entry) => encode_search_result_entry(&mut writer, entry),
        ProtocolOp::SearchResultDone(result) => encode_result(&mut writer, LDAP_TAG_SEARCH_RESULT_DONE, result),
        ProtocolOp::ModifyResponse(result) => encode_result(&mut writer, LDAP_TAG_MODIFY_RESPONSE, result),
        ProtocolOp::AddResponse(result) => encode_result(&mut writer, LDAP_TAG_ADD_RESPONSE, result),
        ProtocolOp::DelResponse(result) => encode_result(&mut writer, LDAP_TAG_DEL_RESPONSE, result),
        ProtocolOp::ModifyDNResponse(result) => encode_result(&mut writer, LDAP_TAG_MODIFY_DN_RESPONSE, result),
        ProtocolOp::CompareResponse(result) => encode_result(&mut writer, LDAP_TAG_COMPARE_RESPONSE, result),
        ProtocolOp::ExtendedResponse(resp) => encode_extended_response(&mut writer, resp),
        other => bail!("Cannot encode request operation {:?}", std::mem::discriminant(other)),
    }

    writer.end_sequence(seq_start);
    Ok(writer.into_vec())
}

/// Encode a bare response: messageID plus an LDAPResult under `response_tag`.
pub fn encode_error_response(message_id: i32, response_tag: u8, result: &LdapResult) -> Vec<u8> {
    let mut writer = BerWriter::new();
    let seq_start = writer.start_sequence();
    writer.write_integer(message_id);
    encode_result(&mut writer, response_tag, result);
    writer.end_sequence(seq_start);
    writer.into_vec()
}

/// Unsolicited notification sent right before the server drops a connection.
pub fn encode_notice_of_disconnection(result_code: ResultCode, message: &str) -> Vec<u8> {
    let notice = LdapMessage::new(
        0,
        ProtocolOp::ExtendedResponse(ExtendedResponse {
            result: LdapResult::new(result_code, message),
            response_name: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
            response_value: None,
        }),
    );
    let mut writer = BerWriter::new();
    let seq_start = writer.start_sequence();
    writer.write_integer(notice.message_id);
    if let ProtocolOp::ExtendedResponse(resp) = &notice.protocol_op {
        encode_extended_response(&mut writer, resp);
    }
    writer.end_sequence(seq_start);
    writer.into_vec()
}

fn write_result_fields(writer: &mut BerWriter, result: &LdapResult) {
    writer.write_enumerated(result.result_code.code());
    writer.write_string(&result.matched_dn);
    writer.write_string(&result.diagnostic_message);
}

fn encode_result(writer: &mut BerWriter, tag: u8, result: &LdapResult) {
    let len_pos = writer.start_constructed(tag);
    write_result_fields(writer, result);
    writer.end_constructed(len_pos);
}

fn encode_search_result_entry(writer: &mut BerWriter, entry: &SearchResultEntry) {
    let len_pos = writer.start_constructed(LDAP_TAG_SEARCH_RESULT_ENTRY);
    writer.write_string(&entry.object_name);
    let attrs_start = writer.start_sequence();
    for attr in &entry.attributes {
        encode_attribute(writer, attr);
    }
    writer.end_sequence(attrs_start);
    writer.end_constructed(len_pos);
}

/// ExtendedResponse ::= [APPLICATION 24] SEQUENCE { COMPONENTS OF LDAPResult,
///     responseName [10] LDAPOID OPTIONAL, responseValue [11] OCTET STRING OPTIONAL }
fn encode_extended_response(writer: &mut BerWriter, resp: &ExtendedResponse) {
    let len_pos = writer.start_constructed(LDAP_TAG_EXTENDED_RESPONSE);
    write_result_fields(writer, &resp.result);
    if let Some(ref name) = resp.response_name {
        writer.write_tagged(0x8A, name.as_bytes());
    }
    if let Some(ref value) = resp.response_value {
        writer.write_tagged(0x8B, value);
    }
    writer.end_constructed(len_pos);
}

fn encode_attribute(writer: &mut BerWriter, attr: &Attribute) {
    let seq_start = writer.start_sequence();
    writer.write_string(&attr.attr_type);

    let vals_start = writer.start_constructed(0x31);
    for value in &attr.attr_values {
        writer.write_octet_string(value);
    }
    writer.end_constructed(vals_start);

    writer.end_sequence(seq_start);
}
