use sha2::{Digest as _, Sha256};
use std::fmt;

pub const DIGEST_BYTES: usize = 32;
pub const DIGEST_HEX_LENGTH: usize = DIGEST_BYTES * 2;

/// SHA-256 of a client-visible name. Keys the mapping store and is embedded in
/// the on-disk alias.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_BYTES]);

impl Digest {
    pub fn of(name: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name);
        let mut out = [0u8; DIGEST_BYTES];
        out.copy_from_slice(&hasher.finalize());
        Self(out)
    }

    pub fn from_bytes(bytes: [u8; DIGEST_BYTES]) -> Self {
        Self(bytes)
    }

    /// Parses exactly 64 lowercase hex digits. Anything else is rejected so
    /// that every digest has a single textual form.
    pub fn from_hex(text: &[u8]) -> Option<Self> {
        if text.len() != DIGEST_HEX_LENGTH
            || !text
                .iter()
                .all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(c))
        {
            return None;
        }
        let mut out = [0u8; DIGEST_BYTES];
        hex::decode_to_slice(text, &mut out).ok()?;
        Some(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Stable small number derived from the digest, used to pick a lock stripe.
    pub fn stripe(&self, count: usize) -> usize {
        debug_assert!(count.is_power_of_two());
        (self.0[0] as usize) & (count - 1)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}
