//! On-disk encoding of the mapping store.
//!
//! The store is a snapshot (`mappings.idx`) plus an append-only journal
//! (`mappings.journal`) of operations made since the snapshot was written.
//! Applying an operation is an assignment, so replaying a journal over a
//! snapshot that already contains it yields the same state.

use crate::digest::{DIGEST_BYTES, Digest};
use crate::error::{CoreError, CoreResult};
use crate::util::DirKey;
use std::collections::{HashMap, HashSet};
use std::ffi::CStr;
use std::io::{Read, Write};
use std::sync::Arc;
use zstd::stream::{read::Decoder as ZstdDecoder, write::Encoder as ZstdEncoder};

pub const JOURNAL_NAME: &CStr = c"mappings.journal";
pub const INDEX_NAME: &CStr = c"mappings.idx";

const MAGIC: &[u8; 4] = b"LFNS";
const MAGIC_ZSTD: &[u8; 4] = b"LFNZ";
const VERSION: u32 = 1;
const MAX_INDEX_BYTES: usize = 64 * 1024 * 1024;

pub const JOURNAL_MAX_BYTES: u64 = 8 * 1024 * 1024;
pub const JOURNAL_MAX_OPS: u64 = 4096;

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;
const OP_ATTACH: u8 = 3;
const OP_DETACH: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalOp {
    Put(Digest, Vec<u8>),
    Delete(Digest),
    Attach(Digest, DirKey),
    Detach(Digest, DirKey),
}

#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub names: HashMap<Digest, Arc<[u8]>>,
    pub attachments: HashMap<Digest, HashSet<DirKey>>,
}

impl Snapshot {
    pub fn apply(&mut self, op: &JournalOp) {
        match op {
            JournalOp::Put(digest, name) => {
                self.names.insert(*digest, Arc::from(name.as_slice()));
            }
            JournalOp::Delete(digest) => {
                self.names.remove(digest);
                self.attachments.remove(digest);
            }
            JournalOp::Attach(digest, dir) => {
                self.attachments.entry(*digest).or_default().insert(*dir);
            }
            JournalOp::Detach(digest, dir) => {
                if let Some(dirs) = self.attachments.get_mut(digest) {
                    dirs.remove(dir);
                    if dirs.is_empty() {
                        self.attachments.remove(digest);
                    }
                }
            }
        }
    }

    pub fn attachment_count(&self, digest: &Digest) -> usize {
        self.attachments.get(digest).map_or(0, HashSet::len)
    }
}

pub fn encode_op(op: &JournalOp, buf: &mut Vec<u8>) {
    let put_dir = |buf: &mut Vec<u8>, dir: &DirKey| {
        buf.extend_from_slice(&dir.dev.to_le_bytes());
        buf.extend_from_slice(&dir.ino.to_le_bytes());
    };
    match op {
        JournalOp::Put(digest, name) => {
            buf.push(OP_PUT);
            buf.extend_from_slice(digest.as_bytes());
            buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
            buf.extend_from_slice(name);
        }
        JournalOp::Delete(digest) => {
            buf.push(OP_DELETE);
            buf.extend_from_slice(digest.as_bytes());
        }
        JournalOp::Attach(digest, dir) => {
            buf.push(OP_ATTACH);
            buf.extend_from_slice(digest.as_bytes());
            put_dir(buf, dir);
        }
        JournalOp::Detach(digest, dir) => {
            buf.push(OP_DETACH);
            buf.extend_from_slice(digest.as_bytes());
            put_dir(buf, dir);
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let out = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        Some(out)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.take(4)?.try_into().ok()?))
    }

    fn u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.take(8)?.try_into().ok()?))
    }

    fn digest(&mut self) -> Option<Digest> {
        let bytes: [u8; DIGEST_BYTES] = self.take(DIGEST_BYTES)?.try_into().ok()?;
        Some(Digest::from_bytes(bytes))
    }

    fn dir(&mut self) -> Option<DirKey> {
        Some(DirKey {
            dev: self.u64()?,
            ino: self.u64()?,
        })
    }
}

#[derive(Debug)]
pub struct DecodedJournal {
    pub ops: Vec<JournalOp>,
    /// Length of the prefix made of whole records. Shorter than the input when
    /// the last append was torn by a crash.
    pub valid_len: usize,
}

pub fn decode_journal(bytes: &[u8]) -> CoreResult<DecodedJournal> {
    let mut cursor = Cursor::new(bytes);
    let mut ops = Vec::new();
    let mut valid_len = 0usize;

    while cursor.remaining() > 0 {
        let start = cursor.offset;
        let Some(op_type) = cursor.u8() else { break };
        let op = match op_type {
            OP_PUT => cursor.digest().and_then(|digest| {
                let len = cursor.u32()? as usize;
                let name = cursor.take(len)?;
                Some(JournalOp::Put(digest, name.to_vec()))
            }),
            OP_DELETE => cursor.digest().map(JournalOp::Delete),
            OP_ATTACH => cursor
                .digest()
                .and_then(|digest| Some(JournalOp::Attach(digest, cursor.dir()?))),
            OP_DETACH => cursor
                .digest()
                .and_then(|digest| Some(JournalOp::Detach(digest, cursor.dir()?))),
            // Zero-filled blocks past the last write come from a crash.
            0 if bytes[start..].iter().all(|b| *b == 0) => break,
            other => {
                return Err(CoreError::Corrupt(format!(
                    "unknown journal op {other} at offset {start}"
                )));
            }
        };
        match op {
            Some(op) => {
                ops.push(op);
                valid_len = cursor.offset;
            }
            None => break,
        }
    }

    Ok(DecodedJournal { ops, valid_len })
}

pub fn encode_snapshot(snapshot: &Snapshot) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&(snapshot.names.len() as u32).to_le_bytes());

    for (digest, name) in &snapshot.names {
        buf.extend_from_slice(digest.as_bytes());
        buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
        buf.extend_from_slice(name);

        let dirs = snapshot.attachments.get(digest);
        buf.extend_from_slice(&(dirs.map_or(0, HashSet::len) as u32).to_le_bytes());
        for dir in dirs.into_iter().flatten() {
            buf.extend_from_slice(&dir.dev.to_le_bytes());
            buf.extend_from_slice(&dir.ino.to_le_bytes());
        }
    }

    buf
}

fn encode_snapshot_compressed(raw: &[u8]) -> CoreResult<Vec<u8>> {
    let mut encoder = ZstdEncoder::new(Vec::new(), 3)?;
    encoder.write_all(raw)?;
    let mut compressed = encoder.finish()?;
    let mut out = Vec::with_capacity(MAGIC_ZSTD.len() + compressed.len());
    out.extend_from_slice(MAGIC_ZSTD);
    out.append(&mut compressed);
    Ok(out)
}

/// Picks the compressed form unless compression does not help.
pub fn encode_snapshot_for_disk(snapshot: &Snapshot) -> CoreResult<Vec<u8>> {
    let raw = encode_snapshot(snapshot);
    let compressed = encode_snapshot_compressed(&raw)?;
    let data = if compressed.len() < raw.len() {
        compressed
    } else {
        raw
    };
    if data.len() > MAX_INDEX_BYTES {
        return Err(CoreError::Backing(nix::Error::ENOSPC));
    }
    Ok(data)
}

fn decode_plain_snapshot(bytes: &[u8]) -> Option<Snapshot> {
    let mut cursor = Cursor::new(bytes);
    if cursor.take(MAGIC.len())? != MAGIC {
        return None;
    }
    if cursor.u32()? != VERSION {
        return None;
    }
    let count = cursor.u32()? as usize;
    let mut snapshot = Snapshot::default();

    for _ in 0..count {
        let digest = cursor.digest()?;
        let name_len = cursor.u32()? as usize;
        let name = cursor.take(name_len)?;
        snapshot.names.insert(digest, Arc::from(name));

        let dir_count = cursor.u32()? as usize;
        if dir_count > 0 {
            let dirs = snapshot.attachments.entry(digest).or_default();
            for _ in 0..dir_count {
                dirs.insert(cursor.dir()?);
            }
        }
    }

    if cursor.remaining() != 0 {
        return None;
    }
    Some(snapshot)
}

pub fn decode_snapshot(bytes: &[u8]) -> CoreResult<Snapshot> {
    let decoded = match bytes.get(..MAGIC.len()) {
        Some(magic) if magic == MAGIC => decode_plain_snapshot(bytes),
        Some(magic) if magic == MAGIC_ZSTD => {
            let mut decoder = ZstdDecoder::new(&bytes[MAGIC_ZSTD.len()..])?;
            let mut decoded = Vec::new();
            decoder
                .by_ref()
                .take(MAX_INDEX_BYTES as u64 * 4)
                .read_to_end(&mut decoded)?;
            // The decompressed body must be a plain snapshot; nested LFNZ is rejected.
            decode_plain_snapshot(&decoded)
        }
        _ => None,
    };
    decoded.ok_or_else(|| CoreError::Corrupt("unreadable mapping snapshot".to_owned()))
}
