// SPDX-License-Identifier: AGPL-3.0-only
//! Incremental frame assembly for the TCP bytestream. The assembler owns the
//! partial-read buffer; the connection driver feeds it whatever the socket
//! yields and pulls out complete frames.

use crate::header::{HEADER_LEN, Header};
use anyhow::{Result, bail};
use bytes::{Buf, BytesMut};

/// Upper bound on a body we will buffer. Well above anything a conforming
/// client sends; refusing larger keeps a misbehaving peer from pinning memory.
pub const MAX_BODY_LEN: u32 = 65_535;

/// One complete wire packet: header plus the (still obfuscated) body.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    pub body: Vec<u8>,
}

impl Frame {
    /// Serialize a header/body pair back to wire bytes.
    pub fn to_bytes(header: &Header, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(body);
        out
    }
}

#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: BytesMut,
}

impl FrameAssembler {
    pub fn new() -> FrameAssembler {
        FrameAssembler { buf: BytesMut::new() }
    }

    /// Append bytes read from the socket to the partial-read buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// True when no partial packet is buffered, i.e. a peer close here is a
    /// clean end of stream rather than a truncation.
    pub fn is_idle(&self) -> bool {
        self.buf.is_empty()
    }

    /// Try to complete one packet. `Ok(Some(frame))` hands out a full packet
    /// and clears its bytes from the buffer so the next packet starts fresh;
    /// `Ok(None)` means a partial read whose state is retained; `Err` means
    /// the stream is unframeable and the connection must be torn down.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header_bytes = [0u8; HEADER_LEN];
        header_bytes.copy_from_slice(&self.buf[..HEADER_LEN]);
        let header = Header::parse(&header_bytes);

        if header.length > MAX_BODY_LEN {
            bail!("TACACS+ body length {} exceeds limit", header.length);
        }

        let total = HEADER_LEN + header.length as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let body = self.buf.split_to(header.length as usize).to_vec();
        Ok(Some(Frame { header, body }))
    }
}
