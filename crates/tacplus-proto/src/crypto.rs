// SPDX-License-Identifier: AGPL-3.0-only
//! TACACS+ shared-secret body obfuscation (MD5 pad).

use crate::MIN_SECRET_LEN;
use crate::header::Header;
use anyhow::{Result, anyhow, bail};
use openssl::hash::{MessageDigest, hash};
use std::convert::TryInto;

/// XOR the body with the RFC 8907 MD5 pad. The operation is its own inverse,
/// so the same call both obfuscates outgoing and de-obfuscates incoming bodies.
pub fn apply_body_crypto(header: &Header, body: &mut [u8], secret: &[u8]) -> Result<()> {
    if secret.len() < MIN_SECRET_LEN {
        bail!(
            "shared secret too short; minimum {} bytes required",
            MIN_SECRET_LEN
        );
    }

    let mut pad: Vec<u8> = Vec::with_capacity(body.len());
    let mut prev: Option<[u8; 16]> = None;

    while pad.len() < body.len() {
        let mut seed: Vec<u8> = Vec::with_capacity(4 + secret.len() + 2 + 16);
        seed.extend_from_slice(&header.session_id.to_be_bytes());
        seed.extend_from_slice(secret);
        seed.push(header.version);
        seed.push(header.seq_no);
        if let Some(prev_pad) = prev {
            seed.extend_from_slice(&prev_pad);
        }
        let digest = hash(MessageDigest::md5(), &seed)?;
        let digest: [u8; 16] = digest
            .as_ref()
            .try_into()
            .map_err(|_| anyhow!("unexpected MD5 length"))?;
        pad.extend_from_slice(&digest);
        prev = Some(digest);
    }

    for (b, p) in body.iter_mut().zip(pad.iter()) {
        *b ^= *p;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Header {
        Header {
            version: 0xC0,
            packet_type: 0x01,
            seq_no: 1,
            flags: 0,
            session_id: 0xDEADBEEF,
            length: 0,
        }
    }

    #[test]
    fn crypto_is_symmetric() {
        let plain = b"hello tacacs body".to_vec();
        let mut body = plain.clone();
        apply_body_crypto(&header(), &mut body, b"sharedsecret").unwrap();
        assert_ne!(body, plain);
        apply_body_crypto(&header(), &mut body, b"sharedsecret").unwrap();
        assert_eq!(body, plain);
    }

    #[test]
    fn crypto_depends_on_seq_no() {
        let mut a = b"same body".to_vec();
        let mut b = b"same body".to_vec();
        let h1 = header();
        let mut h2 = header();
        h2.seq_no = 3;
        apply_body_crypto(&h1, &mut a, b"sharedsecret").unwrap();
        apply_body_crypto(&h2, &mut b, b"sharedsecret").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn crypto_rejects_short_secret() {
        let mut body = b"body".to_vec();
        let result = apply_body_crypto(&header(), &mut body, b"short");
        assert!(result.is_err());
    }
}
