// SPDX-License-Identifier: AGPL-3.0-only
//! The Request: the processing unit for one inbound packet, owned exclusively
//! by the session machine from assembly until it reaches the terminal phase.

use crate::machine::{Outcome, SectionId};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tacplus_proto::{AttrList, Frame, PacketKind, Value};

/// Stable identifier for one accepted TCP connection. Client-chosen session
/// ids are only unique per connection, so this id disambiguates them in the
/// state store key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate the next process-wide connection id.
    pub fn next() -> ConnectionId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A decoded packet: attribute list plus bookkeeping. Inbound packets are
/// immutable once decoded; the reply is mutable until it is sent.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketKind,
    pub attrs: AttrList,
    pub timestamp: Option<SystemTime>,
}

impl Packet {
    pub fn empty(kind: PacketKind) -> Packet {
        Packet {
            kind,
            attrs: AttrList::new(),
            timestamp: None,
        }
    }
}

/// Module-scoped data stashed on a Request; entries with `persist` survive
/// into the state store between conversation turns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestData {
    pub key: String,
    pub value: Value,
    pub persist: bool,
}

/// The arena of one conversation: session-state attributes plus persisted
/// request data. Ownership of the whole value moves between Request and
/// state entry as the conversation progresses; it is never deep-copied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionData {
    pub vps: AttrList,
    pub data: Vec<RequestData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Recv,
    Process,
    Send,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Running,
    StopProcessing,
}

/// A policy section scheduled on this Request, with the outcome it defaults
/// to when the section does not set one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledSection {
    pub section: SectionId,
    pub default: Outcome,
}

#[derive(Debug)]
pub struct Request {
    pub conn: ConnectionId,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    /// The raw frame as assembled from the wire; decoded during INIT.
    pub frame: Frame,
    pub packet: Packet,
    pub reply: Packet,
    /// Policy-set control attributes (Auth-Type and friends).
    pub control: AttrList,
    pub data: Vec<RequestData>,
    pub session_state: Option<SessionData>,
    pub phase: Phase,
    pub master_state: MasterState,
    /// The resolved `process` alias, when one was dispatched.
    pub process_alias: Option<String>,
    pub scheduled: Option<ScheduledSection>,
    /// Encoded reply, handed to the connection driver once SEND completes.
    pub reply_frame: Option<Vec<u8>>,
}

impl Request {
    pub fn new(
        conn: ConnectionId,
        peer: SocketAddr,
        local: SocketAddr,
        kind: PacketKind,
        frame: Frame,
    ) -> Request {
        Request {
            conn,
            peer,
            local,
            frame,
            packet: Packet::empty(kind),
            reply: Packet::empty(kind),
            control: AttrList::new(),
            data: Vec::new(),
            session_state: None,
            phase: Phase::Init,
            master_state: MasterState::Running,
            process_alias: None,
            scheduled: None,
            reply_frame: None,
        }
    }

    /// Remove and return the persistable request data entries.
    pub fn take_persistable(&mut self) -> Vec<RequestData> {
        let mut persisted = Vec::new();
        self.data.retain(|entry| {
            if entry.persist {
                persisted.push(entry.clone());
                false
            } else {
                true
            }
        });
        persisted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tacplus_proto::{Attr, Header};

    fn make_request() -> Request {
        let header = Header {
            version: 0xC0,
            packet_type: 0x01,
            seq_no: 1,
            flags: 0,
            session_id: 1,
            length: 0,
        };
        Request::new(
            ConnectionId(7),
            "10.0.0.1:50000".parse().unwrap(),
            "10.0.0.2:49".parse().unwrap(),
            PacketKind::Authen,
            Frame {
                header,
                body: Vec::new(),
            },
        )
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn new_request_starts_at_init() {
        let request = make_request();
        assert_eq!(request.phase, Phase::Init);
        assert_eq!(request.master_state, MasterState::Running);
        assert!(request.session_state.is_none());
        assert!(request.reply.attrs.is_empty());
    }

    #[test]
    fn take_persistable_splits_by_flag() {
        let mut request = make_request();
        request.data.push(RequestData {
            key: "transient".into(),
            value: Value::U8(1),
            persist: false,
        });
        request.data.push(RequestData {
            key: "kept".into(),
            value: Value::Str("x".into()),
            persist: true,
        });

        let persisted = request.take_persistable();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].key, "kept");
        assert_eq!(request.data.len(), 1);
        assert_eq!(request.data[0].key, "transient");
    }

    #[test]
    fn session_data_moves_wholesale() {
        let mut request = make_request();
        let mut session = SessionData::default();
        session.vps.add(Attr::UserName, Value::Str("alice".into()));
        request.session_state = Some(session);

        let taken = request.session_state.take().unwrap();
        assert_eq!(taken.vps.find_str(Attr::UserName), Some("alice"));
        assert!(request.session_state.is_none());
    }
}
