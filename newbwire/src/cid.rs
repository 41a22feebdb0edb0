//! Connection ID minting and stateless reset tokens.

use std::fmt;

use hkdf::Hkdf;
use newbmux::{CidPlaintext, ConnectionId};
use sha2::Sha256;

use crate::error::{Result, WireError};
use crate::header::{CID_LEN, RESET_TOKEN_LEN};

const RESET_SALT: &[u8] = b"newbwire stateless reset";

/// Lays the plaintext out as `master_id(4) thread_id(2) node_id(2)`.
pub fn encode_cid(plaintext: CidPlaintext) -> ConnectionId {
    let mut raw = [0u8; CID_LEN];
    raw[0..4].copy_from_slice(&plaintext.master_id.to_be_bytes());
    raw[4..6].copy_from_slice(&plaintext.thread_id.to_be_bytes());
    raw[6..8].copy_from_slice(&plaintext.node_id.to_be_bytes());
    ConnectionId::from_slice(&raw)
}

/// Recovers the plaintext of an ID minted by [`encode_cid`]. IDs of any
/// other length carry no plaintext and decode as anonymous.
pub fn decode_cid(cid: &ConnectionId) -> CidPlaintext {
    let raw = cid.as_bytes();
    if raw.len() != CID_LEN {
        return CidPlaintext::default();
    }
    CidPlaintext::new(
        u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
        u16::from_be_bytes([raw[4], raw[5]]),
        u16::from_be_bytes([raw[6], raw[7]]),
    )
}

/// Derives the stateless reset token of a connection ID from the installed
/// private key. The same key always yields the same token, so a restarted
/// server can still reset connections it no longer knows.
#[derive(Clone)]
pub struct ResetTokenKey {
    hk: Hkdf<Sha256>,
}

impl ResetTokenKey {
    pub fn new(private_key: &[u8]) -> Self {
        Self {
            hk: Hkdf::<Sha256>::new(Some(RESET_SALT), private_key),
        }
    }

    pub fn token(&self, cid: &ConnectionId) -> Result<[u8; RESET_TOKEN_LEN]> {
        let mut okm = [0u8; RESET_TOKEN_LEN];
        self.hk
            .expand(cid.as_bytes(), &mut okm)
            .map_err(|e| WireError::Internal(format!("HKDF expand failed: {e}")))?;
        Ok(okm)
    }
}

impl fmt::Debug for ResetTokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResetTokenKey(<redacted>)")
    }
}
