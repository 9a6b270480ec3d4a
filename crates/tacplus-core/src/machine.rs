// SPDX-License-Identifier: AGPL-3.0-only
//! The per-request state machine.
//!
//! Each Request walks INIT -> RECV -> PROCESS -> SEND -> DONE, running one
//! policy section per phase. The interpreter is cooperative: it either runs a
//! section to completion or yields, in which case the machine returns to the
//! scheduler with the Request's phase preserved and is re-entered later.

use crate::request::{ConnectionId, MasterState, Phase, Request};
use crate::state::{StateStore, TOKEN_LEN};
use crate::status::update_reply_status;
use std::time::SystemTime;
use tacplus_proto::dict::{AUTH_TYPE_ACCEPT, AUTH_TYPE_REJECT, authen_status};
use tacplus_proto::{Attr, AttrList, AuthTypes, Decoded, PacketKind, Value, decode_body, encode_reply};
use tracing::{debug, error, trace, warn};

/// What a policy section reported back, the protocol-agnostic rcode space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Reject,
    Fail,
    Ok,
    Handled,
    Invalid,
    Userlock,
    Notfound,
    Noop,
    Updated,
}

/// Result of driving the interpreter: a completed section or a cooperative
/// suspension to be resumed at the same phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpretation {
    Yielded,
    Done(Outcome),
}

/// The three hooks a virtual server exposes sections under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Recv,
    Process,
    Send,
}

/// Opaque handle to a compiled policy section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionId(pub usize);

/// The policy interpreter as the machine sees it. Sections are compiled once
/// at startup; scheduling state lives on the Request, so implementations stay
/// shareable across connections.
pub trait PolicyRunner {
    fn find_section(&self, hook: Hook, name: &str) -> Option<SectionId>;
    fn push_section(&self, request: &mut Request, section: SectionId, default: Outcome);
    fn resume(&self, request: &mut Request) -> Interpretation;
}

/// Signal delivered with a machine entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Run,
    /// Drop the Request without running (more) policy.
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The interpreter yielded; re-enter with `Signal::Run` to continue.
    Yielded,
    /// The Request reached DONE; a reply, if any, is in `reply_frame`.
    Done,
}

/// Everything the machine needs besides the Request itself.
pub struct MachineCtx<'a> {
    pub store: &'a StateStore,
    pub policy: &'a dyn PolicyRunner,
    pub auth_types: &'a AuthTypes,
    pub secret: &'a [u8],
}

/// Install the per-connection state key on a packet. `session_id` is only
/// unique per TCP connection, so the key leads with the connection id:
/// conversations on distinct connections never collide in the state store.
pub fn state_add(conn: ConnectionId, session_id: u32, attrs: &mut AttrList) {
    let mut buf = [0u8; TOKEN_LEN];
    buf[..8].copy_from_slice(&conn.0.to_ne_bytes());
    buf[TOKEN_LEN - 4..].copy_from_slice(&session_id.to_ne_bytes());
    attrs.add(Attr::State, Value::Octets(buf.to_vec()));
}

fn debug_packet(request: &Request, received: bool) {
    let packet = if received { &request.packet } else { &request.reply };
    debug!(
        direction = if received { "received" } else { "sending" },
        code = packet.kind.name(),
        session_id = request.frame.header.session_id,
        peer = %request.peer,
        local = %request.local,
        length = request.frame.header.length,
        "packet"
    );
    for pair in packet.attrs.iter() {
        trace!("  {} = {}", pair.attr.name(), pair.value);
    }
}

/// Drive one Request. Returns `Yielded` when the interpreter suspended; the
/// caller re-enters later and processing picks up at the preserved phase.
pub fn run(request: &mut Request, ctx: &MachineCtx<'_>, signal: Signal) -> RunStatus {
    if signal == Signal::Cancel {
        request.phase = Phase::Done;
        return RunStatus::Done;
    }

    loop {
        match request.phase {
            Phase::Init => init(request, ctx),
            Phase::Recv => {
                let rcode = match ctx.policy.resume(request) {
                    Interpretation::Yielded => return RunStatus::Yielded,
                    Interpretation::Done(rcode) => rcode,
                };
                if request.master_state == MasterState::StopProcessing {
                    stop_processing(request, ctx);
                    continue;
                }
                recv_done(request, ctx, rcode);
            }
            Phase::Process => {
                let rcode = match ctx.policy.resume(request) {
                    Interpretation::Yielded => return RunStatus::Yielded,
                    Interpretation::Done(rcode) => rcode,
                };
                if request.master_state == MasterState::StopProcessing {
                    stop_processing(request, ctx);
                    continue;
                }
                process_done(request, ctx, rcode);
            }
            Phase::Send => {
                if request.scheduled.is_some() {
                    match ctx.policy.resume(request) {
                        Interpretation::Yielded => return RunStatus::Yielded,
                        Interpretation::Done(_) => {}
                    }
                    if request.master_state == MasterState::StopProcessing {
                        stop_processing(request, ctx);
                        continue;
                    }
                }
                send_reply(request, ctx);
            }
            Phase::Done => return RunStatus::Done,
        }
    }
}

fn init(request: &mut Request, ctx: &MachineCtx<'_>) {
    let attrs = match decode_body(&request.frame, ctx.secret) {
        Err(err) => {
            warn!(error = %err, "failed decoding TACACS+ packet");
            update_reply_status(request.packet.kind, &mut request.reply.attrs, Outcome::Invalid);
            setup_send(request, ctx);
            return;
        }
        Ok(Decoded::ClientAbort) => {
            // Client aborted; it expects no reply.
            request.phase = Phase::Done;
            return;
        }
        Ok(Decoded::Request(attrs)) => attrs,
    };

    request.packet.attrs = attrs;
    request.packet.timestamp = Some(SystemTime::now());
    debug_packet(request, true);

    let kind = request.packet.kind;
    let section = ctx
        .policy
        .find_section(Hook::Recv, kind.name())
        .or_else(|| ctx.policy.find_section(Hook::Recv, "*"));
    let Some(section) = section else {
        error!("failed to find 'recv' section");
        setup_send(request, ctx);
        return;
    };

    if kind == PacketKind::Authen {
        state_add(
            request.conn,
            request.frame.header.session_id,
            &mut request.packet.attrs,
        );
        ctx.store.to_request(request);
    }

    debug!(section = kind.name(), "running 'recv' section");
    ctx.policy.push_section(request, section, Outcome::Reject);
    request.phase = Phase::Recv;
}

fn recv_done(request: &mut Request, ctx: &MachineCtx<'_>, rcode: Outcome) {
    let kind = request.packet.kind;
    match rcode {
        Outcome::Noop | Outcome::Notfound | Outcome::Ok | Outcome::Updated => {}
        Outcome::Handled => {
            setup_send(request, ctx);
            return;
        }
        other => {
            update_reply_status(kind, &mut request.reply.attrs, other);
            setup_send(request, ctx);
            return;
        }
    }

    // Find Auth-Type, first one wins; complain about the rest.
    let mut auth_type: Option<u32> = None;
    for value in request.control.find_all(Attr::AuthType) {
        let Some(value) = value.as_u32() else { continue };
        if auth_type.is_none() {
            auth_type = Some(value);
        } else {
            warn!(
                ignored = ctx.auth_types.alias(value).unwrap_or("<unknown>"),
                "ignoring extra Auth-Type"
            );
        }
    }

    let Some(auth_type) = auth_type else {
        debug!("no Auth-Type available: rejecting the user");
        update_reply_status(kind, &mut request.reply.attrs, Outcome::Reject);
        setup_send(request, ctx);
        return;
    };

    if auth_type == AUTH_TYPE_ACCEPT {
        debug!("Auth-Type = Accept, allowing user");
        update_reply_status(kind, &mut request.reply.attrs, Outcome::Ok);
        setup_send(request, ctx);
        return;
    }
    if auth_type == AUTH_TYPE_REJECT {
        debug!("Auth-Type = Reject, rejecting user");
        update_reply_status(kind, &mut request.reply.attrs, Outcome::Reject);
        setup_send(request, ctx);
        return;
    }

    let Some(alias) = ctx.auth_types.alias(auth_type) else {
        warn!(value = auth_type, "unknown Auth-Type found: rejecting the user");
        update_reply_status(kind, &mut request.reply.attrs, Outcome::Fail);
        setup_send(request, ctx);
        return;
    };

    let Some(section) = ctx.policy.find_section(Hook::Process, alias) else {
        warn!(alias, "no 'process' section found: rejecting the user");
        update_reply_status(kind, &mut request.reply.attrs, Outcome::Fail);
        setup_send(request, ctx);
        return;
    };

    debug!(alias, "running 'process' section");
    request.process_alias = Some(alias.to_string());
    ctx.policy.push_section(request, section, Outcome::Notfound);
    request.phase = Phase::Process;
}

fn process_done(request: &mut Request, ctx: &MachineCtx<'_>, rcode: Outcome) {
    let kind = request.packet.kind;
    match rcode {
        Outcome::Ok => {
            update_reply_status(kind, &mut request.reply.attrs, Outcome::Ok);
        }
        Outcome::Handled => {}
        _ => {
            // Any unexpected authentication rcode is an explicit reject.
            debug!("failed to authenticate the user");
            update_reply_status(kind, &mut request.reply.attrs, Outcome::Fail);
        }
    }
    setup_send(request, ctx);
}

fn setup_send(request: &mut Request, ctx: &MachineCtx<'_>) {
    let mut section = None;
    if request.process_alias.is_some() {
        section = ctx
            .policy
            .find_section(Hook::Send, request.packet.kind.name());
    }
    if section.is_none() {
        section = ctx.policy.find_section(Hook::Send, "*");
    }

    request.phase = Phase::Send;
    if let Some(section) = section {
        debug!(section = request.packet.kind.name(), "running 'send' section");
        ctx.policy.push_section(request, section, Outcome::Noop);
    }
    // No section: SEND falls straight through to reply emission.
}

fn stop_processing(request: &mut Request, ctx: &MachineCtx<'_>) {
    if request.packet.kind == PacketKind::Authen {
        ctx.store.discard(request);
    }
    request.phase = Phase::Done;
}

fn send_reply(request: &mut Request, ctx: &MachineCtx<'_>) {
    request.reply.timestamp = Some(SystemTime::now());

    if request.packet.kind == PacketKind::Authen {
        match request.reply.attrs.find_u8(Attr::AuthenticationStatus) {
            Some(status) if authen_status::is_terminal(status) => {
                // The conversation ended one way or another.
                ctx.store.discard(request);
            }
            Some(_) => {
                let Some(seq_no) = request.packet.attrs.find_u8(Attr::SequenceNumber) else {
                    error!("no sequence number found");
                    request.phase = Phase::Done;
                    return;
                };
                if seq_no == 253 {
                    // The next turn would overflow the 8-bit sequence space.
                    warn!("sequence number would wrap, restarting authentication");
                    ctx.store.discard(request);
                    request.reply.attrs.clear();
                    request.reply.attrs.update(
                        Attr::AuthenticationStatus,
                        Value::U8(authen_status::RESTART),
                    );
                } else {
                    state_add(
                        request.conn,
                        request.frame.header.session_id,
                        &mut request.reply.attrs,
                    );
                    if !ctx.store.from_request(request) {
                        warn!("state store full, dropping this conversation's session state");
                    }
                }
            }
            None => ctx.store.discard(request),
        }
    }

    debug_packet(request, false);

    match encode_reply(
        request.packet.kind,
        &request.frame.header,
        &request.reply.attrs,
        ctx.secret,
    ) {
        Ok(bytes) => request.reply_frame = Some(bytes),
        Err(err) => error!(error = %err, "failed sending TACACS+ reply"),
    }
    request.phase = Phase::Done;
}
