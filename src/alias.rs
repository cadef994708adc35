use crate::digest::{DIGEST_HEX_LENGTH, Digest};

/// Marker every alias starts with on the backing store.
pub const ALIAS_MARKER: &str = ".LFN.";
pub const ALIAS_LENGTH: usize = ALIAS_MARKER.len() + DIGEST_HEX_LENGTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    Alias(Digest),
    /// Carries the marker but the rest is not a digest. Treated as a plain name.
    Malformed,
    Plain,
}

impl Decoded {
    pub fn digest(self) -> Option<Digest> {
        match self {
            Decoded::Alias(digest) => Some(digest),
            Decoded::Malformed | Decoded::Plain => None,
        }
    }
}

pub fn encode(digest: &Digest) -> String {
    let mut alias = String::with_capacity(ALIAS_LENGTH);
    alias.push_str(ALIAS_MARKER);
    alias.push_str(&digest.to_hex());
    alias
}

pub fn decode(name: &[u8]) -> Decoded {
    match name.strip_prefix(ALIAS_MARKER.as_bytes()) {
        None => Decoded::Plain,
        Some(rest) => match Digest::from_hex(rest) {
            Some(digest) => Decoded::Alias(digest),
            None => Decoded::Malformed,
        },
    }
}
