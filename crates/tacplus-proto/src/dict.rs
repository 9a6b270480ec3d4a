// SPDX-License-Identifier: AGPL-3.0-only
//! The attribute dictionary: typed attribute names, values, enum alias tables,
//! and the Auth-Type registry populated from configured `process` sections.

use std::collections::BTreeMap;
use std::fmt;

/// Packet families of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Authen,
    Author,
    Acct,
}

impl PacketKind {
    pub fn from_wire(packet_type: u8) -> Option<PacketKind> {
        match packet_type {
            crate::TYPE_AUTHEN => Some(PacketKind::Authen),
            crate::TYPE_AUTHOR => Some(PacketKind::Author),
            crate::TYPE_ACCT => Some(PacketKind::Acct),
            _ => None,
        }
    }

    pub fn wire(&self) -> u8 {
        match self {
            PacketKind::Authen => crate::TYPE_AUTHEN,
            PacketKind::Author => crate::TYPE_AUTHOR,
            PacketKind::Acct => crate::TYPE_ACCT,
        }
    }

    /// Name used to select `recv`/`send` policy sections.
    pub fn name(&self) -> &'static str {
        match self {
            PacketKind::Authen => "Authentication",
            PacketKind::Author => "Authorization",
            PacketKind::Acct => "Accounting",
        }
    }
}

/// Dictionary attributes the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attr {
    AuthType,
    State,
    PacketType,
    SequenceNumber,
    SessionId,
    VersionMinor,
    Action,
    PrivilegeLevel,
    AuthenticationType,
    AuthenticationService,
    AuthenticationMethod,
    AuthenticationFlags,
    AccountingFlags,
    UserName,
    ClientPort,
    RemoteAddress,
    Data,
    UserMessage,
    ServerMessage,
    AuthenticationStatus,
    AuthorizationStatus,
    AccountingStatus,
    ArgumentList,
}

impl Attr {
    pub fn name(&self) -> &'static str {
        match self {
            Attr::AuthType => "Auth-Type",
            Attr::State => "State",
            Attr::PacketType => "TACACS-Packet-Type",
            Attr::SequenceNumber => "TACACS-Sequence-Number",
            Attr::SessionId => "TACACS-Session-Id",
            Attr::VersionMinor => "TACACS-Version-Minor",
            Attr::Action => "TACACS-Action",
            Attr::PrivilegeLevel => "TACACS-Privilege-Level",
            Attr::AuthenticationType => "TACACS-Authentication-Type",
            Attr::AuthenticationService => "TACACS-Authentication-Service",
            Attr::AuthenticationMethod => "TACACS-Authentication-Method",
            Attr::AuthenticationFlags => "TACACS-Authentication-Flags",
            Attr::AccountingFlags => "TACACS-Accounting-Flags",
            Attr::UserName => "TACACS-User-Name",
            Attr::ClientPort => "TACACS-Client-Port",
            Attr::RemoteAddress => "TACACS-Remote-Address",
            Attr::Data => "TACACS-Data",
            Attr::UserMessage => "TACACS-User-Message",
            Attr::ServerMessage => "TACACS-Server-Message",
            Attr::AuthenticationStatus => "TACACS-Authentication-Status",
            Attr::AuthorizationStatus => "TACACS-Authorization-Status",
            Attr::AccountingStatus => "TACACS-Accounting-Status",
            Attr::ArgumentList => "TACACS-Argument-List",
        }
    }

    pub fn from_name(name: &str) -> Option<Attr> {
        const ALL: &[Attr] = &[
            Attr::AuthType,
            Attr::State,
            Attr::PacketType,
            Attr::SequenceNumber,
            Attr::SessionId,
            Attr::VersionMinor,
            Attr::Action,
            Attr::PrivilegeLevel,
            Attr::AuthenticationType,
            Attr::AuthenticationService,
            Attr::AuthenticationMethod,
            Attr::AuthenticationFlags,
            Attr::AccountingFlags,
            Attr::UserName,
            Attr::ClientPort,
            Attr::RemoteAddress,
            Attr::Data,
            Attr::UserMessage,
            Attr::ServerMessage,
            Attr::AuthenticationStatus,
            Attr::AuthorizationStatus,
            Attr::AccountingStatus,
            Attr::ArgumentList,
        ];
        ALL.iter().find(|a| a.name() == name).copied()
    }
}

/// Attribute values. TACACS+ bodies only ever need these four shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Octets(Vec<u8>),
    Str(String),
    U8(u8),
    U32(u32),
}

impl Value {
    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Value::U8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            Value::U8(v) => Some(u32::from(*v)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_octets(&self) -> Option<&[u8]> {
        match self {
            Value::Octets(v) => Some(v.as_slice()),
            Value::Str(v) => Some(v.as_bytes()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Octets(v) => {
                write!(f, "0x")?;
                for b in v {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Value::Str(v) => write!(f, "{v:?}"),
            Value::U8(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
        }
    }
}

/// One attribute/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    pub attr: Attr,
    pub value: Value,
}

/// An ordered attribute list, the unit the codec and the policy pipeline
/// exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttrList(Vec<Pair>);

impl AttrList {
    pub fn new() -> AttrList {
        AttrList(Vec::new())
    }

    pub fn add(&mut self, attr: Attr, value: Value) {
        self.0.push(Pair { attr, value });
    }

    /// Replace the first pair of `attr`, or append when absent.
    pub fn update(&mut self, attr: Attr, value: Value) {
        match self.0.iter_mut().find(|p| p.attr == attr) {
            Some(pair) => pair.value = value,
            None => self.add(attr, value),
        }
    }

    pub fn find(&self, attr: Attr) -> Option<&Value> {
        self.0.iter().find(|p| p.attr == attr).map(|p| &p.value)
    }

    pub fn find_all(&self, attr: Attr) -> impl Iterator<Item = &Value> {
        self.0.iter().filter(move |p| p.attr == attr).map(|p| &p.value)
    }

    pub fn find_u8(&self, attr: Attr) -> Option<u8> {
        self.find(attr).and_then(Value::as_u8)
    }

    pub fn find_u32(&self, attr: Attr) -> Option<u32> {
        self.find(attr).and_then(Value::as_u32)
    }

    pub fn find_str(&self, attr: Attr) -> Option<&str> {
        self.find(attr).and_then(Value::as_str)
    }

    pub fn find_octets(&self, attr: Attr) -> Option<&[u8]> {
        self.find(attr).and_then(Value::as_octets)
    }

    pub fn remove(&mut self, attr: Attr) {
        self.0.retain(|p| p.attr != attr);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pair> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Enum space of `TACACS-Authentication-Status`.
pub mod authen_status {
    pub const PASS: u8 = 0x01;
    pub const FAIL: u8 = 0x02;
    pub const GETDATA: u8 = 0x03;
    pub const GETUSER: u8 = 0x04;
    pub const GETPASS: u8 = 0x05;
    pub const RESTART: u8 = 0x06;
    pub const ERROR: u8 = 0x07;
    pub const FOLLOW: u8 = 0x21;

    pub fn alias(value: u8) -> Option<&'static str> {
        match value {
            PASS => Some("Pass"),
            FAIL => Some("Fail"),
            GETDATA => Some("GetData"),
            GETUSER => Some("GetUser"),
            GETPASS => Some("GetPass"),
            RESTART => Some("Restart"),
            ERROR => Some("Error"),
            FOLLOW => Some("Follow"),
            _ => None,
        }
    }

    pub fn from_alias(alias: &str) -> Option<u8> {
        for value in [PASS, FAIL, GETDATA, GETUSER, GETPASS, RESTART, ERROR, FOLLOW] {
            if self::alias(value) == Some(alias) {
                return Some(value);
            }
        }
        None
    }

    /// A status that ends the conversation; anything else asks the client for
    /// another turn.
    pub fn is_terminal(value: u8) -> bool {
        matches!(value, PASS | FAIL | RESTART | ERROR | FOLLOW)
    }
}

/// Enum space of `TACACS-Authorization-Status`.
pub mod author_status {
    pub const PASS_ADD: u8 = 0x01;
    pub const PASS_REPL: u8 = 0x02;
    pub const FAIL: u8 = 0x10;
    pub const ERROR: u8 = 0x11;

    pub fn alias(value: u8) -> Option<&'static str> {
        match value {
            PASS_ADD => Some("Pass-Add"),
            PASS_REPL => Some("Pass-Repl"),
            FAIL => Some("Fail"),
            ERROR => Some("Error"),
            _ => None,
        }
    }

    pub fn from_alias(alias: &str) -> Option<u8> {
        for value in [PASS_ADD, PASS_REPL, FAIL, ERROR] {
            if self::alias(value) == Some(alias) {
                return Some(value);
            }
        }
        None
    }
}

/// Enum space of `TACACS-Accounting-Status`.
pub mod acct_status {
    pub const SUCCESS: u8 = 0x01;
    pub const ERROR: u8 = 0x02;

    pub fn alias(value: u8) -> Option<&'static str> {
        match value {
            SUCCESS => Some("Success"),
            ERROR => Some("Error"),
            _ => None,
        }
    }

    pub fn from_alias(alias: &str) -> Option<u8> {
        for value in [SUCCESS, ERROR] {
            if self::alias(value) == Some(alias) {
                return Some(value);
            }
        }
        None
    }
}

/// `Auth-Type = Accept`: allow without running a process section.
pub const AUTH_TYPE_ACCEPT: u32 = 1;
/// `Auth-Type = Reject`: deny without running a process section.
pub const AUTH_TYPE_REJECT: u32 = 2;

const AUTH_TYPE_DYNAMIC_BASE: u32 = 16;

/// Enum space of `Auth-Type`. The two sentinels are fixed; every configured
/// `process <name>` section registers its alias here at startup.
#[derive(Debug, Clone)]
pub struct AuthTypes {
    by_value: BTreeMap<u32, String>,
    by_alias: BTreeMap<String, u32>,
}

impl AuthTypes {
    pub fn new() -> AuthTypes {
        let mut types = AuthTypes {
            by_value: BTreeMap::new(),
            by_alias: BTreeMap::new(),
        };
        types.insert(AUTH_TYPE_ACCEPT, "Accept");
        types.insert(AUTH_TYPE_REJECT, "Reject");
        types
    }

    fn insert(&mut self, value: u32, alias: &str) {
        self.by_value.insert(value, alias.to_string());
        self.by_alias.insert(alias.to_string(), value);
    }

    /// Register a new alias, returning its enum value. Registering an existing
    /// alias returns the value it already holds.
    pub fn register(&mut self, alias: &str) -> u32 {
        if let Some(value) = self.by_alias.get(alias) {
            return *value;
        }
        let value = self
            .by_value
            .keys()
            .next_back()
            .map(|v| v + 1)
            .unwrap_or(AUTH_TYPE_DYNAMIC_BASE)
            .max(AUTH_TYPE_DYNAMIC_BASE);
        self.insert(value, alias);
        value
    }

    pub fn alias(&self, value: u32) -> Option<&str> {
        self.by_value.get(&value).map(String::as_str)
    }

    pub fn value(&self, alias: &str) -> Option<u32> {
        self.by_alias.get(alias).copied()
    }
}

impl Default for AuthTypes {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== AttrList Tests ====================

    #[test]
    fn attr_list_find_first_of_duplicates() {
        let mut attrs = AttrList::new();
        attrs.add(Attr::ArgumentList, Value::Str("service=shell".into()));
        attrs.add(Attr::ArgumentList, Value::Str("cmd=show".into()));

        assert_eq!(
            attrs.find_str(Attr::ArgumentList),
            Some("service=shell")
        );
        assert_eq!(attrs.find_all(Attr::ArgumentList).count(), 2);
    }

    #[test]
    fn attr_list_update_replaces_first() {
        let mut attrs = AttrList::new();
        attrs.add(Attr::AuthenticationStatus, Value::U8(authen_status::FAIL));
        attrs.update(Attr::AuthenticationStatus, Value::U8(authen_status::PASS));

        assert_eq!(attrs.len(), 1);
        assert_eq!(
            attrs.find_u8(Attr::AuthenticationStatus),
            Some(authen_status::PASS)
        );
    }

    #[test]
    fn attr_list_update_appends_when_absent() {
        let mut attrs = AttrList::new();
        attrs.update(Attr::ServerMessage, Value::Str("hi".into()));
        assert_eq!(attrs.find_str(Attr::ServerMessage), Some("hi"));
    }

    #[test]
    fn attr_name_roundtrip() {
        assert_eq!(Attr::from_name("Auth-Type"), Some(Attr::AuthType));
        assert_eq!(
            Attr::from_name("TACACS-Authentication-Status"),
            Some(Attr::AuthenticationStatus)
        );
        assert_eq!(Attr::from_name("No-Such-Attribute"), None);
    }

    // ==================== Status alias Tests ====================

    #[test]
    fn authen_status_terminal_set() {
        assert!(authen_status::is_terminal(authen_status::PASS));
        assert!(authen_status::is_terminal(authen_status::FAIL));
        assert!(authen_status::is_terminal(authen_status::RESTART));
        assert!(authen_status::is_terminal(authen_status::ERROR));
        assert!(authen_status::is_terminal(authen_status::FOLLOW));
        assert!(!authen_status::is_terminal(authen_status::GETPASS));
        assert!(!authen_status::is_terminal(authen_status::GETUSER));
        assert!(!authen_status::is_terminal(authen_status::GETDATA));
    }

    #[test]
    fn status_aliases() {
        assert_eq!(authen_status::alias(authen_status::PASS), Some("Pass"));
        assert_eq!(
            author_status::alias(author_status::PASS_REPL),
            Some("Pass-Repl")
        );
        assert_eq!(acct_status::alias(acct_status::SUCCESS), Some("Success"));
        assert_eq!(authen_status::alias(0x7f), None);
    }

    // ==================== AuthTypes Tests ====================

    #[test]
    fn auth_types_sentinels_preloaded() {
        let types = AuthTypes::new();
        assert_eq!(types.value("Accept"), Some(AUTH_TYPE_ACCEPT));
        assert_eq!(types.value("Reject"), Some(AUTH_TYPE_REJECT));
        assert_eq!(types.alias(AUTH_TYPE_ACCEPT), Some("Accept"));
    }

    #[test]
    fn auth_types_register_assigns_distinct_values() {
        let mut types = AuthTypes::new();
        let pap = types.register("pap");
        let chap = types.register("chap");

        assert_ne!(pap, chap);
        assert!(pap >= 16 && chap >= 16);
        assert_eq!(types.alias(pap), Some("pap"));
        assert_eq!(types.value("chap"), Some(chap));
    }

    #[test]
    fn auth_types_register_is_idempotent() {
        let mut types = AuthTypes::new();
        let first = types.register("pap");
        let second = types.register("pap");
        assert_eq!(first, second);
    }

    #[test]
    fn packet_kind_names() {
        assert_eq!(PacketKind::Authen.name(), "Authentication");
        assert_eq!(PacketKind::Author.name(), "Authorization");
        assert_eq!(PacketKind::Acct.name(), "Accounting");
        assert_eq!(PacketKind::from_wire(0x02), Some(PacketKind::Author));
        assert_eq!(PacketKind::from_wire(0x09), None);
    }
}
