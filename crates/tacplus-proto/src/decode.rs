// SPDX-License-Identifier: AGPL-3.0-only
//! Decode wire bodies into dictionary attribute lists and encode reply
//! attribute lists back into wire bodies.

use crate::crypto::apply_body_crypto;
use crate::dict::{
    Attr, AttrList, PacketKind, Value, acct_status, authen_status, author_status,
};
use crate::frame::Frame;
use crate::header::{Header, validate_request_header};
use crate::{
    AUTHEN_TYPE_ARAP, AUTHEN_TYPE_ASCII, AUTHEN_TYPE_CHAP, AUTHEN_TYPE_PAP, CONTINUE_FLAG_ABORT,
    FLAG_SINGLE_CONNECT, FLAG_UNENCRYPTED, VERSION,
};
use anyhow::{Result, anyhow, bail, ensure};
use bytes::{BufMut, BytesMut};
use log::warn;

/// Result of decoding one inbound frame.
#[derive(Debug)]
pub enum Decoded {
    /// A request to process, as a dictionary attribute list.
    Request(AttrList),
    /// The client aborted the conversation; no reply is expected.
    ClientAbort,
}

fn read_bytes(body: &[u8], offset: usize, len: usize, label: &str) -> Result<(Vec<u8>, usize)> {
    let next = offset
        .checked_add(len)
        .ok_or_else(|| anyhow!("overflow parsing {label}"))?;
    let slice = body
        .get(offset..next)
        .ok_or_else(|| anyhow!("{label} truncated"))?;
    Ok((slice.to_vec(), next))
}

/// Text fields are strings on the wire but not guaranteed UTF-8; keep the raw
/// bytes when they are not.
fn str_or_octets(bytes: Vec<u8>) -> Value {
    match String::from_utf8(bytes) {
        Ok(s) => Value::Str(s),
        Err(e) => Value::Octets(e.into_bytes()),
    }
}

/// Decode an assembled frame into an attribute list. De-obfuscates the body
/// with the shared secret, validates the header, and parses the body by
/// packet kind.
pub fn decode_body(frame: &Frame, secret: &[u8]) -> Result<Decoded> {
    let header = &frame.header;
    if header.flags & FLAG_UNENCRYPTED != 0 {
        bail!("unencrypted TACACS+ packet received (deprecated and refused)");
    }
    validate_request_header(header, FLAG_SINGLE_CONNECT, VERSION >> 4)?;
    let kind = PacketKind::from_wire(header.packet_type)
        .ok_or_else(|| anyhow!("unsupported TACACS+ type {}", header.packet_type))?;

    let mut body = frame.body.clone();
    apply_body_crypto(header, &mut body, secret)?;

    let mut attrs = AttrList::new();
    attrs.add(Attr::PacketType, Value::U8(kind.wire()));
    attrs.add(Attr::SequenceNumber, Value::U8(header.seq_no));
    attrs.add(Attr::SessionId, Value::U32(header.session_id));
    attrs.add(Attr::VersionMinor, Value::U8(header.version & 0x0f));

    match kind {
        PacketKind::Authen => {
            // seq 1 is the START of a conversation, later odd seqs are CONTINUEs
            if header.seq_no == 1 {
                parse_authen_start(&body, &mut attrs)?;
            } else if parse_authen_continue(&body, &mut attrs)? {
                return Ok(Decoded::ClientAbort);
            }
        }
        PacketKind::Author => parse_author(&body, &mut attrs)?,
        PacketKind::Acct => parse_acct(&body, &mut attrs)?,
    }

    Ok(Decoded::Request(attrs))
}

fn parse_authen_start(body: &[u8], attrs: &mut AttrList) -> Result<()> {
    ensure!(body.len() >= 8, "authentication start body too short");
    ensure!(
        body[0] == 0x01 || body[0] == 0x02,
        "invalid authen action (only login/enable allowed)"
    );
    ensure!(body[1] <= 0x0f, "invalid priv_lvl");
    ensure!(
        matches!(
            body[2],
            AUTHEN_TYPE_ASCII | AUTHEN_TYPE_PAP | AUTHEN_TYPE_CHAP | AUTHEN_TYPE_ARAP
        ),
        "invalid authen_type"
    );

    let user_len = body[4] as usize;
    let port_len = body[5] as usize;
    let rem_addr_len = body[6] as usize;
    let data_len = body[7] as usize;
    ensure!(
        8 + user_len + port_len + rem_addr_len + data_len <= body.len(),
        "authentication start exceeds body"
    );

    attrs.add(Attr::Action, Value::U8(body[0]));
    attrs.add(Attr::PrivilegeLevel, Value::U8(body[1]));
    attrs.add(Attr::AuthenticationType, Value::U8(body[2]));
    attrs.add(Attr::AuthenticationService, Value::U8(body[3]));

    let mut cursor = 8;
    let (user, next) = read_bytes(body, cursor, user_len, "user")?;
    cursor = next;
    let (port, next) = read_bytes(body, cursor, port_len, "port")?;
    cursor = next;
    let (rem_addr, next) = read_bytes(body, cursor, rem_addr_len, "rem_addr")?;
    cursor = next;
    let (data, _) = read_bytes(body, cursor, data_len, "data")?;

    if !user.is_empty() {
        attrs.add(Attr::UserName, str_or_octets(user));
    }
    if !port.is_empty() {
        attrs.add(Attr::ClientPort, str_or_octets(port));
    }
    if !rem_addr.is_empty() {
        attrs.add(Attr::RemoteAddress, str_or_octets(rem_addr));
    }
    if !data.is_empty() {
        attrs.add(Attr::Data, Value::Octets(data));
    }
    Ok(())
}

/// Returns `true` when the client set the abort flag.
fn parse_authen_continue(body: &[u8], attrs: &mut AttrList) -> Result<bool> {
    ensure!(body.len() >= 5, "authentication continue body too short");
    let user_msg_len = u16::from_be_bytes([body[0], body[1]]) as usize;
    let data_len = u16::from_be_bytes([body[2], body[3]]) as usize;
    let flags = body[4];
    ensure!(
        5 + user_msg_len + data_len <= body.len(),
        "authentication continue exceeds body"
    );

    if flags & CONTINUE_FLAG_ABORT != 0 {
        return Ok(true);
    }

    let (user_msg, next) = read_bytes(body, 5, user_msg_len, "user_msg")?;
    let (data, _) = read_bytes(body, next, data_len, "data")?;
    if !user_msg.is_empty() {
        attrs.add(Attr::UserMessage, str_or_octets(user_msg));
    }
    if !data.is_empty() {
        attrs.add(Attr::Data, Value::Octets(data));
    }
    Ok(false)
}

fn parse_aaa_fixed(body: &[u8], attrs: &mut AttrList, offset: usize) -> Result<()> {
    let authen_method = body[offset];
    let priv_lvl = body[offset + 1];
    let authen_type = body[offset + 2];
    let authen_service = body[offset + 3];
    ensure!(priv_lvl <= 0x0f, "invalid priv_lvl");
    ensure!(authen_type <= 0x04, "invalid authen_type");
    ensure!(authen_service <= 0x07, "invalid authen_service");

    attrs.add(Attr::AuthenticationMethod, Value::U8(authen_method));
    attrs.add(Attr::PrivilegeLevel, Value::U8(priv_lvl));
    attrs.add(Attr::AuthenticationType, Value::U8(authen_type));
    attrs.add(Attr::AuthenticationService, Value::U8(authen_service));
    Ok(())
}

fn parse_var_fields(
    body: &[u8],
    attrs: &mut AttrList,
    mut cursor: usize,
    user_len: usize,
    port_len: usize,
    rem_addr_len: usize,
    arg_cnt: usize,
) -> Result<()> {
    let arg_lens: Vec<usize> = body
        .get(cursor..cursor + arg_cnt)
        .ok_or_else(|| anyhow!("args length table truncated"))?
        .iter()
        .map(|l| *l as usize)
        .collect();
    cursor += arg_cnt;

    let (user, next) = read_bytes(body, cursor, user_len, "user")?;
    cursor = next;
    let (port, next) = read_bytes(body, cursor, port_len, "port")?;
    cursor = next;
    let (rem_addr, next) = read_bytes(body, cursor, rem_addr_len, "rem_addr")?;
    cursor = next;

    if !user.is_empty() {
        attrs.add(Attr::UserName, str_or_octets(user));
    }
    if !port.is_empty() {
        attrs.add(Attr::ClientPort, str_or_octets(port));
    }
    if !rem_addr.is_empty() {
        attrs.add(Attr::RemoteAddress, str_or_octets(rem_addr));
    }

    for (idx, len) in arg_lens.iter().enumerate() {
        ensure!(*len > 0, "arg[{idx}] length invalid");
        let (arg, next) = read_bytes(body, cursor, *len, "arg")?;
        cursor = next;
        attrs.add(Attr::ArgumentList, str_or_octets(arg));
    }
    Ok(())
}

fn parse_author(body: &[u8], attrs: &mut AttrList) -> Result<()> {
    ensure!(body.len() >= 8, "authorization body too short");
    parse_aaa_fixed(body, attrs, 0)?;
    let user_len = body[4] as usize;
    let port_len = body[5] as usize;
    let rem_addr_len = body[6] as usize;
    let arg_cnt = body[7] as usize;
    parse_var_fields(body, attrs, 8, user_len, port_len, rem_addr_len, arg_cnt)
}

fn parse_acct(body: &[u8], attrs: &mut AttrList) -> Result<()> {
    ensure!(body.len() >= 9, "accounting body too short");
    attrs.add(Attr::AccountingFlags, Value::U8(body[0]));
    parse_aaa_fixed(body, attrs, 1)?;
    let user_len = body[5] as usize;
    let port_len = body[6] as usize;
    let rem_addr_len = body[7] as usize;
    let arg_cnt = body[8] as usize;
    parse_var_fields(body, attrs, 9, user_len, port_len, rem_addr_len, arg_cnt)
}

/// Serialize the reply attribute list for an inbound request into a complete
/// obfuscated wire packet ready to write.
pub fn encode_reply(
    kind: PacketKind,
    inbound: &Header,
    reply: &AttrList,
    secret: &[u8],
) -> Result<Vec<u8>> {
    let mut body = BytesMut::new();
    let server_msg = reply.find_octets(Attr::ServerMessage).unwrap_or(&[]);
    let data = reply.find_octets(Attr::Data).unwrap_or(&[]);
    ensure!(server_msg.len() <= u16::MAX as usize, "server_msg too long");
    ensure!(data.len() <= u16::MAX as usize, "data too long");

    match kind {
        PacketKind::Authen => {
            let status = reply
                .find_u8(Attr::AuthenticationStatus)
                .unwrap_or_else(|| {
                    warn!("authentication reply carries no status, sending Error");
                    authen_status::ERROR
                });
            let flags = reply.find_u8(Attr::AuthenticationFlags).unwrap_or(0);
            body.put_u8(status);
            body.put_u8(flags);
            body.put_u16(server_msg.len() as u16);
            body.put_u16(data.len() as u16);
            body.extend_from_slice(server_msg);
            body.extend_from_slice(data);
        }
        PacketKind::Author => {
            let status = reply
                .find_u8(Attr::AuthorizationStatus)
                .unwrap_or(author_status::ERROR);
            let args: Vec<&[u8]> = reply
                .find_all(Attr::ArgumentList)
                .filter_map(Value::as_octets)
                .collect();
            ensure!(args.len() <= u8::MAX as usize, "too many reply args");
            body.put_u8(status);
            body.put_u8(args.len() as u8);
            body.put_u16(server_msg.len() as u16);
            body.put_u16(data.len() as u16);
            for arg in &args {
                ensure!(arg.len() <= u8::MAX as usize, "reply arg too long");
                body.put_u8(arg.len() as u8);
            }
            body.extend_from_slice(server_msg);
            body.extend_from_slice(data);
            for arg in &args {
                body.extend_from_slice(arg);
            }
        }
        PacketKind::Acct => {
            let status = reply
                .find_u8(Attr::AccountingStatus)
                .unwrap_or(acct_status::ERROR);
            body.put_u16(server_msg.len() as u16);
            body.put_u16(data.len() as u16);
            body.put_u8(status);
            body.extend_from_slice(server_msg);
            body.extend_from_slice(data);
        }
    }

    let mut body = body.to_vec();
    apply_body_crypto(inbound, &mut body, secret)?;
    let header = inbound.response(body.len() as u32);
    Ok(Frame::to_bytes(&header, &body))
}

/// Classification of the opaque `data` field of an authentication START, per
/// the declared authentication type.
#[derive(Debug, Clone)]
pub enum AuthenData {
    Pap { password: String },
    Chap { chap_id: u8, response: Vec<u8> },
    Raw(Vec<u8>),
}

pub fn authen_data(attrs: &AttrList) -> AuthenData {
    let data = attrs
        .find_octets(Attr::Data)
        .map(<[u8]>::to_vec)
        .unwrap_or_default();
    match attrs.find_u8(Attr::AuthenticationType) {
        Some(AUTHEN_TYPE_PAP) => match String::from_utf8(data) {
            Ok(password) => AuthenData::Pap { password },
            Err(e) => AuthenData::Raw(e.into_bytes()),
        },
        Some(AUTHEN_TYPE_CHAP) if data.len() >= 2 => AuthenData::Chap {
            chap_id: data[0],
            response: data[1..].to_vec(),
        },
        _ => AuthenData::Raw(data),
    }
}
