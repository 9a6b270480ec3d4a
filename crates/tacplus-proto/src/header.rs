// SPDX-License-Identifier: AGPL-3.0-only
//! TACACS+ packet header parsing and serialization.

use anyhow::{Result, ensure};

pub const HEADER_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct Header {
    pub version: u8,
    pub packet_type: u8,
    pub seq_no: u8,
    pub flags: u8,
    pub session_id: u32,
    pub length: u32,
}

impl Header {
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Header {
        Header {
            version: buf[0],
            packet_type: buf[1],
            seq_no: buf[2],
            flags: buf[3],
            session_id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.version;
        buf[1] = self.packet_type;
        buf[2] = self.seq_no;
        buf[3] = self.flags;
        buf[4..8].copy_from_slice(&self.session_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Header for the reply to this request.
    pub fn response(&self, length: u32) -> Header {
        Header {
            version: self.version,
            packet_type: self.packet_type,
            seq_no: self.seq_no.wrapping_add(1),
            flags: self.flags, // mirrors request flags; caller can override if needed
            session_id: self.session_id,
            length,
        }
    }
}

pub fn validate_request_header(header: &Header, allowed_flags: u8, expected_major: u8) -> Result<()> {
    ensure!(
        header.version >> 4 == expected_major,
        "unsupported TACACS+ major version {:x}",
        header.version >> 4
    );
    ensure!(
        header.flags & !allowed_flags == 0,
        "unsupported TACACS+ flags set {:02x}",
        header.flags & !allowed_flags
    );
    ensure!(
        header.seq_no % 2 == 1,
        "client TACACS+ packets must use odd seq numbers"
    );
    Ok(())
}
