// SPDX-License-Identifier: AGPL-3.0-only
//! TACACS+ wire protocol: 12-byte headers, incremental frame assembly,
//! shared-secret body obfuscation, and decode/encode between packet bodies and
//! dictionary attribute lists.

pub mod crypto;
pub mod decode;
pub mod dict;
pub mod frame;
pub mod header;

pub use decode::{AuthenData, Decoded, decode_body, encode_reply};
pub use dict::{Attr, AttrList, AuthTypes, Pair, PacketKind, Value};
pub use frame::{Frame, FrameAssembler};
pub use header::Header;

pub const VERSION: u8 = 0xc << 4; // Major version 0xC, minor 0

pub const TYPE_AUTHEN: u8 = 0x01;
pub const TYPE_AUTHOR: u8 = 0x02;
pub const TYPE_ACCT: u8 = 0x03;

pub const FLAG_UNENCRYPTED: u8 = 0x01;
pub const FLAG_SINGLE_CONNECT: u8 = 0x04;
pub const MIN_SECRET_LEN: usize = 8;

pub const AUTHEN_TYPE_ASCII: u8 = 0x01;
pub const AUTHEN_TYPE_PAP: u8 = 0x02;
pub const AUTHEN_TYPE_CHAP: u8 = 0x03;
pub const AUTHEN_TYPE_ARAP: u8 = 0x04;

/// Abort flag on an authentication CONTINUE body.
pub const CONTINUE_FLAG_ABORT: u8 = 0x01;
