// SPDX-License-Identifier: AGPL-3.0-only
//! End-to-end conversation scenarios driven through the session machine with
//! a scripted policy: multi-turn authentication, sequence wrap, capacity and
//! timeout behavior, and cross-connection key isolation.

use std::time::{Duration, Instant};
use tacplus_core::{
    ConnectionId, Hook, Interpretation, MachineCtx, Outcome, PolicyRunner, Request, RunStatus,
    ScheduledSection, SectionId, SessionData, Signal, StateStore, machine, state_add,
};
use tacplus_proto::crypto::apply_body_crypto;
use tacplus_proto::dict::{AUTH_TYPE_ACCEPT, authen_status};
use tacplus_proto::{
    AUTHEN_TYPE_ASCII, Attr, AttrList, AuthTypes, Frame, Header, PacketKind, TYPE_AUTHEN, VERSION,
    Value,
};

const SECRET: &[u8] = b"testing123456";

fn authen_start(session_id: u32, user: &[u8]) -> Frame {
    let mut body = vec![
        0x01, // action: login
        0x01, // priv_lvl
        AUTHEN_TYPE_ASCII,
        0x01, // service: login
        user.len() as u8,
        0, // port_len
        0, // rem_addr_len
        0, // data_len
    ];
    body.extend_from_slice(user);
    frame(session_id, 1, body)
}

fn authen_continue(session_id: u32, seq_no: u8, user_msg: &[u8]) -> Frame {
    let mut body = Vec::new();
    body.extend_from_slice(&(user_msg.len() as u16).to_be_bytes());
    body.extend_from_slice(&0u16.to_be_bytes());
    body.push(0);
    body.extend_from_slice(user_msg);
    frame(session_id, seq_no, body)
}

fn frame(session_id: u32, seq_no: u8, mut body: Vec<u8>) -> Frame {
    let header = Header {
        version: VERSION,
        packet_type: TYPE_AUTHEN,
        seq_no,
        flags: 0,
        session_id,
        length: body.len() as u32,
    };
    apply_body_crypto(&header, &mut body, SECRET).unwrap();
    Frame { header, body }
}

fn request(conn: u64, frame: Frame) -> Request {
    Request::new(
        ConnectionId(conn),
        "192.0.2.10:50000".parse().unwrap(),
        "192.0.2.1:49".parse().unwrap(),
        PacketKind::Authen,
        frame,
    )
}

/// A two-round password policy: the first turn stashes the username in
/// session-state and prompts, the second accepts when the state round-tripped.
struct PromptPolicy;

impl PolicyRunner for PromptPolicy {
    fn find_section(&self, hook: Hook, name: &str) -> Option<SectionId> {
        match (hook, name) {
            (Hook::Recv, "Authentication") => Some(SectionId(0)),
            _ => None,
        }
    }

    fn push_section(&self, request: &mut Request, section: SectionId, default: Outcome) {
        request.scheduled = Some(ScheduledSection { section, default });
    }

    fn resume(&self, request: &mut Request) -> Interpretation {
        request.scheduled = None;
        let known_user = request
            .session_state
            .as_ref()
            .and_then(|s| s.vps.find_str(Attr::UserName))
            .is_some();
        if known_user {
            request
                .control
                .add(Attr::AuthType, Value::U32(AUTH_TYPE_ACCEPT));
            return Interpretation::Done(Outcome::Ok);
        }

        let user = request
            .packet
            .attrs
            .find_str(Attr::UserName)
            .unwrap_or("unknown")
            .to_string();
        request
            .session_state
            .get_or_insert_with(SessionData::default)
            .vps
            .add(Attr::UserName, Value::Str(user));
        request.reply.attrs.update(
            Attr::AuthenticationStatus,
            Value::U8(authen_status::GETPASS),
        );
        Interpretation::Done(Outcome::Handled)
    }
}

/// A policy that never finishes: every turn stashes state and prompts again.
struct AlwaysPromptPolicy;

impl PolicyRunner for AlwaysPromptPolicy {
    fn find_section(&self, hook: Hook, name: &str) -> Option<SectionId> {
        match (hook, name) {
            (Hook::Recv, "Authentication") => Some(SectionId(0)),
            _ => None,
        }
    }

    fn push_section(&self, request: &mut Request, section: SectionId, default: Outcome) {
        request.scheduled = Some(ScheduledSection { section, default });
    }

    fn resume(&self, request: &mut Request) -> Interpretation {
        request.scheduled = None;
        request
            .session_state
            .get_or_insert_with(SessionData::default)
            .vps
            .update(Attr::UserName, Value::Str("alice".into()));
        request.reply.attrs.update(
            Attr::AuthenticationStatus,
            Value::U8(authen_status::GETDATA),
        );
        Interpretation::Done(Outcome::Handled)
    }
}

/// Always-accept policy for single-turn scenarios.
struct AcceptPolicy;

impl PolicyRunner for AcceptPolicy {
    fn find_section(&self, hook: Hook, name: &str) -> Option<SectionId> {
        match (hook, name) {
            (Hook::Recv, "Authentication") => Some(SectionId(0)),
            _ => None,
        }
    }

    fn push_section(&self, request: &mut Request, section: SectionId, default: Outcome) {
        request.scheduled = Some(ScheduledSection { section, default });
    }

    fn resume(&self, request: &mut Request) -> Interpretation {
        request.scheduled = None;
        request
            .control
            .add(Attr::AuthType, Value::U32(AUTH_TYPE_ACCEPT));
        Interpretation::Done(Outcome::Ok)
    }
}

fn run_to_done(request: &mut Request, ctx: &MachineCtx<'_>) {
    assert_eq!(machine::run(request, ctx, Signal::Run), RunStatus::Done);
}

fn authen_reply_status(request: &Request) -> Option<u8> {
    request.reply.attrs.find_u8(Attr::AuthenticationStatus)
}

// ==================== Scenario Tests ====================

#[test]
fn single_turn_accept_leaves_no_state() {
    let store = StateStore::new(2, Duration::from_secs(30), 256);
    let auth_types = AuthTypes::new();
    let policy = AcceptPolicy;
    let ctx = MachineCtx {
        store: &store,
        policy: &policy,
        auth_types: &auth_types,
        secret: SECRET,
    };

    let mut req = request(1, authen_start(0xAA, b"alice"));
    run_to_done(&mut req, &ctx);

    assert_eq!(authen_reply_status(&req), Some(authen_status::PASS));
    assert!(req.reply_frame.is_some());
    assert_eq!(store.sizes(), (0, 0));
}

#[test]
fn two_turn_conversation_round_trips_session_state() {
    let store = StateStore::new(2, Duration::from_secs(30), 256);
    let auth_types = AuthTypes::new();
    let policy = PromptPolicy;
    let ctx = MachineCtx {
        store: &store,
        policy: &policy,
        auth_types: &auth_types,
        secret: SECRET,
    };

    // Turn 1: prompted for a password, state persisted.
    let mut first = request(1, authen_start(0xAA, b"alice"));
    run_to_done(&mut first, &ctx);
    assert_eq!(authen_reply_status(&first), Some(authen_status::GETPASS));
    let token = first
        .reply
        .attrs
        .find_octets(Attr::State)
        .expect("reply must carry a state token");
    assert_eq!(token.len(), 16);
    assert_eq!(store.sizes(), (1, 1));

    // Turn 2 on the same connection and session: session-state restored,
    // conversation accepted, entry discarded.
    let mut second = request(1, authen_continue(0xAA, 3, b"hunter2"));
    run_to_done(&mut second, &ctx);
    assert_eq!(authen_reply_status(&second), Some(authen_status::PASS));
    assert_eq!(store.sizes(), (0, 0));
}

#[test]
fn sequence_overflow_restarts_once() {
    let store = StateStore::new(2, Duration::from_secs(30), 256);
    let auth_types = AuthTypes::new();
    let policy = AlwaysPromptPolicy;
    let ctx = MachineCtx {
        store: &store,
        policy: &policy,
        auth_types: &auth_types,
        secret: SECRET,
    };

    // Establish the conversation so there is an entry to discard.
    let mut first = request(1, authen_start(0xAA, b"alice"));
    run_to_done(&mut first, &ctx);
    assert_eq!(store.sizes(), (1, 1));

    // Inbound seq 253 with a non-terminal reply: mutated to RESTART, entry
    // discarded, nothing new persisted.
    let mut wrapped = request(1, authen_continue(0xAA, 253, b"pw"));
    run_to_done(&mut wrapped, &ctx);
    assert_eq!(authen_reply_status(&wrapped), Some(authen_status::RESTART));
    assert_eq!(store.sizes(), (0, 0));
}

#[test]
fn capacity_exhaustion_leaves_existing_conversations_intact() {
    let store = StateStore::new(2, Duration::from_secs(30), 256);
    let auth_types = AuthTypes::new();
    let policy = PromptPolicy;
    let ctx = MachineCtx {
        store: &store,
        policy: &policy,
        auth_types: &auth_types,
        secret: SECRET,
    };

    // Two concurrent conversations fill the store.
    let mut a = request(1, authen_start(0x1, b"alice"));
    let mut b = request(2, authen_start(0x1, b"bob"));
    run_to_done(&mut a, &ctx);
    run_to_done(&mut b, &ctx);
    assert_eq!(store.sizes(), (2, 2));

    // The third conversation is prompted but its state cannot persist.
    let mut c = request(3, authen_start(0x1, b"carol"));
    run_to_done(&mut c, &ctx);
    assert_eq!(authen_reply_status(&c), Some(authen_status::GETPASS));
    assert_eq!(store.sizes(), (2, 2));

    // The first two still resume and complete normally.
    let mut a2 = request(1, authen_continue(0x1, 3, b"pw"));
    run_to_done(&mut a2, &ctx);
    assert_eq!(authen_reply_status(&a2), Some(authen_status::PASS));

    // The third client's next turn finds no session-state; the policy treats
    // it as a fresh conversation and prompts again.
    let mut c2 = request(3, authen_continue(0x1, 3, b"pw"));
    run_to_done(&mut c2, &ctx);
    assert_eq!(authen_reply_status(&c2), Some(authen_status::GETPASS));
}

#[test]
fn timeout_reaps_stalled_conversations() {
    let store = StateStore::new(2, Duration::from_secs(30), 256);
    let now = Instant::now();

    let mut first = AttrList::new();
    store.create_at(now, &mut first, None).unwrap();
    assert_eq!(store.sizes(), (1, 1));

    // Past the lifetime, the next create reaps the stalled entry.
    let mut second = AttrList::new();
    store
        .create_at(now + Duration::from_secs(31), &mut second, None)
        .unwrap();
    assert_eq!(store.sizes(), (1, 1));
    assert!(store.find(&first).is_none());
    assert!(store.find(&second).is_some());
}

#[test]
fn colliding_session_ids_stay_disjoint_across_connections() {
    let store = StateStore::new(4, Duration::from_secs(30), 256);
    let auth_types = AuthTypes::new();
    let policy = PromptPolicy;
    let ctx = MachineCtx {
        store: &store,
        policy: &policy,
        auth_types: &auth_types,
        secret: SECRET,
    };

    // Same client-chosen session_id on two different connections.
    let mut a = request(10, authen_start(0x1, b"alice"));
    let mut b = request(11, authen_start(0x1, b"bob"));
    run_to_done(&mut a, &ctx);
    run_to_done(&mut b, &ctx);
    assert_eq!(store.sizes(), (2, 2));

    let token_a = a.reply.attrs.find_octets(Attr::State).unwrap().to_vec();
    let token_b = b.reply.attrs.find_octets(Attr::State).unwrap().to_vec();
    assert_ne!(token_a, token_b);
    // The low four bytes are the shared session_id; the connection id in the
    // high-order bytes keeps the keys apart.
    assert_eq!(token_a[12..], token_b[12..]);
    assert_ne!(token_a[..8], token_b[..8]);

    // Completing one conversation leaves the other's entry alone.
    let mut a2 = request(10, authen_continue(0x1, 3, b"pw"));
    run_to_done(&mut a2, &ctx);
    assert_eq!(store.sizes(), (1, 1));

    let mut probe = AttrList::new();
    state_add(ConnectionId(11), 0x1, &mut probe);
    assert!(store.find(&probe).is_some());
}
