//! Persistent digest → long name mapping.
//!
//! Every mutation is appended to the journal and synced before the call
//! returns. All mutations go through one writer lock, which also serializes
//! concurrent `put`s of the same digest.

pub mod journal;

use crate::digest::Digest;
use crate::error::{CoreError, CoreResult};
use crate::util::{DirKey, begin_temp_file, fsync_dir, retry_eintr, sync_and_commit};
use journal::{
    INDEX_NAME, JOURNAL_MAX_BYTES, JOURNAL_MAX_OPS, JOURNAL_NAME, JournalOp, Snapshot,
    decode_journal, decode_snapshot, encode_op, encode_snapshot_for_disk,
};
use nix::fcntl::{OFlag, openat};
use nix::sys::stat::Mode;
use nix::unistd::write;
use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct JournalWriter {
    file: File,
    ops: u64,
    size: u64,
}

#[derive(Debug)]
pub struct MappingStore {
    path: PathBuf,
    dir_fd: OwnedFd,
    state: RwLock<Snapshot>,
    writer: Mutex<JournalWriter>,
}

fn read_optional(dir_fd: &OwnedFd, name: &std::ffi::CStr) -> CoreResult<Option<Vec<u8>>> {
    let fd = match openat(
        dir_fd.as_fd(),
        name,
        OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    ) {
        Ok(fd) => fd,
        Err(nix::errno::Errno::ENOENT) => return Ok(None),
        Err(err) => return Err(CoreError::from(err)),
    };
    let mut buf = Vec::new();
    File::from(fd).read_to_end(&mut buf)?;
    Ok(Some(buf))
}

impl MappingStore {
    /// Opens (creating if needed) the store directory and replays its journal.
    pub fn open(path: &Path) -> CoreResult<Self> {
        std::fs::create_dir_all(path)?;
        let dir_fd = OwnedFd::from(File::open(path)?);

        let mut snapshot = match read_optional(&dir_fd, INDEX_NAME)? {
            Some(bytes) => decode_snapshot(&bytes)?,
            None => Snapshot::default(),
        };

        let journal_bytes = read_optional(&dir_fd, JOURNAL_NAME)?.unwrap_or_default();
        let decoded = decode_journal(&journal_bytes)?;
        for op in &decoded.ops {
            snapshot.apply(op);
        }

        let journal_fd = openat(
            dir_fd.as_fd(),
            JOURNAL_NAME,
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND | OFlag::O_CLOEXEC,
            Mode::from_bits_truncate(0o600),
        )?;
        let file = File::from(journal_fd);
        if decoded.valid_len < journal_bytes.len() {
            warn!(
                store = %path.display(),
                dropped = journal_bytes.len() - decoded.valid_len,
                "discarding torn mapping journal tail"
            );
            file.set_len(decoded.valid_len as u64)?;
            file.sync_all()?;
        }
        fsync_dir(dir_fd.as_fd())?;

        info!(
            store = %path.display(),
            records = snapshot.names.len(),
            journal_ops = decoded.ops.len(),
            "mapping store opened"
        );

        let store = Self {
            path: path.to_path_buf(),
            dir_fd,
            state: RwLock::new(snapshot),
            writer: Mutex::new(JournalWriter {
                file,
                ops: decoded.ops.len() as u64,
                size: decoded.valid_len as u64,
            }),
        };

        {
            let mut writer = store.writer.lock();
            if writer.ops > JOURNAL_MAX_OPS || writer.size > JOURNAL_MAX_BYTES {
                store.compact_locked(&mut writer)?;
            }
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, digest: &Digest) -> Option<Arc<[u8]>> {
        self.state.read().names.get(digest).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().names.len()
    }

    pub fn attachment_count(&self, digest: &Digest) -> usize {
        self.state.read().attachment_count(digest)
    }

    /// Records `name` under `digest`. A second identical put is a no-op; a put
    /// of a different name under an existing digest fails with `Conflict`.
    pub fn put(&self, digest: Digest, name: &[u8]) -> CoreResult<()> {
        let mut writer = self.writer.lock();
        if let Some(existing) = self.state.read().names.get(&digest) {
            if existing.as_ref() == name {
                return Ok(());
            }
            error!(%digest, "digest collision between two different names");
            return Err(CoreError::Conflict { digest });
        }
        self.commit(&mut writer, JournalOp::Put(digest, name.to_vec()))
    }

    pub fn delete(&self, digest: &Digest) -> CoreResult<()> {
        let mut writer = self.writer.lock();
        {
            let state = self.state.read();
            if !state.names.contains_key(digest) && !state.attachments.contains_key(digest) {
                return Ok(());
            }
        }
        self.commit(&mut writer, JournalOp::Delete(*digest))
    }

    pub fn attach(&self, digest: Digest, dir: DirKey) -> CoreResult<()> {
        let mut writer = self.writer.lock();
        let present = self
            .state
            .read()
            .attachments
            .get(&digest)
            .is_some_and(|dirs| dirs.contains(&dir));
        if present {
            return Ok(());
        }
        self.commit(&mut writer, JournalOp::Attach(digest, dir))
    }

    /// Drops `dir` from the digest's attachments and returns how many remain.
    pub fn detach(&self, digest: Digest, dir: DirKey) -> CoreResult<usize> {
        let mut writer = self.writer.lock();
        let present = self
            .state
            .read()
            .attachments
            .get(&digest)
            .is_some_and(|dirs| dirs.contains(&dir));
        if present {
            self.commit(&mut writer, JournalOp::Detach(digest, dir))?;
        }
        Ok(self.state.read().attachment_count(&digest))
    }

    pub fn compact(&self) -> CoreResult<()> {
        let mut writer = self.writer.lock();
        self.compact_locked(&mut writer)
    }

    fn commit(&self, writer: &mut JournalWriter, op: JournalOp) -> CoreResult<()> {
        let mut buf = Vec::new();
        encode_op(&op, &mut buf);
        writer.file.write_all(&buf)?;
        writer.file.sync_data()?;
        writer.ops += 1;
        writer.size += buf.len() as u64;
        debug!(?op, "mapping journal append");

        self.state.write().apply(&op);

        if writer.ops > JOURNAL_MAX_OPS || writer.size > JOURNAL_MAX_BYTES {
            self.compact_locked(writer)?;
        }
        Ok(())
    }

    fn compact_locked(&self, writer: &mut JournalWriter) -> CoreResult<()> {
        let data = encode_snapshot_for_disk(&self.state.read())?;
        let temp = begin_temp_file(self.dir_fd.as_fd(), INDEX_NAME, "compact")?;
        let mut written = 0;
        while written < data.len() {
            written += retry_eintr(|| write(temp.fd.as_fd(), &data[written..]))?;
        }
        sync_and_commit(self.dir_fd.as_fd(), temp, INDEX_NAME)?;

        writer.file.set_len(0)?;
        writer.file.sync_all()?;
        debug!(
            ops = writer.ops,
            bytes = data.len(),
            "mapping journal folded into snapshot"
        );
        writer.ops = 0;
        writer.size = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn dir(ino: u64) -> DirKey {
        DirKey { dev: 1, ino }
    }

    #[test]
    fn put_get_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MappingStore::open(tmp.path()).unwrap();
        let name = vec![b'a'; 300];
        let digest = Digest::of(&name);

        assert!(store.get(&digest).is_none());
        store.put(digest, &name).unwrap();
        assert_eq!(store.get(&digest).as_deref(), Some(name.as_slice()));

        store.delete(&digest).unwrap();
        assert!(store.get(&digest).is_none());
        store.delete(&digest).unwrap();
    }

    #[test]
    fn identical_put_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MappingStore::open(tmp.path()).unwrap();
        let digest = Digest::of(b"same");
        store.put(digest, b"same").unwrap();
        store.put(digest, b"same").unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.writer.lock().ops, 1);
    }

    #[test]
    fn conflicting_put_keeps_original_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MappingStore::open(tmp.path()).unwrap();
        let digest = Digest::of(b"original");
        store.put(digest, b"original").unwrap();

        let err = store.put(digest, b"impostor").unwrap_err();
        assert!(matches!(err, CoreError::Conflict { digest: d } if d == digest));
        assert_eq!(store.get(&digest).as_deref(), Some(&b"original"[..]));
    }

    #[test]
    fn committed_records_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let kept = Digest::of(b"kept");
        let dropped = Digest::of(b"dropped");
        {
            let store = MappingStore::open(tmp.path()).unwrap();
            store.put(kept, b"kept").unwrap();
            store.attach(kept, dir(5)).unwrap();
            store.put(dropped, b"dropped").unwrap();
            store.delete(&dropped).unwrap();
        }

        let store = MappingStore::open(tmp.path()).unwrap();
        assert_eq!(store.get(&kept).as_deref(), Some(&b"kept"[..]));
        assert!(store.get(&dropped).is_none());
        assert_eq!(store.attachment_count(&kept), 1);
    }

    #[test]
    fn torn_journal_tail_is_truncated_on_open() {
        let tmp = tempfile::tempdir().unwrap();
        let digest = Digest::of(b"whole");
        {
            let store = MappingStore::open(tmp.path()).unwrap();
            store.put(digest, b"whole").unwrap();
        }
        let journal = tmp.path().join("mappings.journal");
        let whole_len = std::fs::metadata(&journal).unwrap().len();
        let mut file = std::fs::OpenOptions::new().append(true).open(&journal).unwrap();
        file.write_all(&[1u8, 0xaa, 0xbb]).unwrap();
        drop(file);

        let store = MappingStore::open(tmp.path()).unwrap();
        assert_eq!(store.get(&digest).as_deref(), Some(&b"whole"[..]));
        assert_eq!(std::fs::metadata(&journal).unwrap().len(), whole_len);

        let other = Digest::of(b"after");
        store.put(other, b"after").unwrap();
        drop(store);
        let store = MappingStore::open(tmp.path()).unwrap();
        assert_eq!(store.get(&other).as_deref(), Some(&b"after"[..]));
    }

    #[test]
    fn compaction_folds_journal_into_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let digest = Digest::of(b"compacted");
        {
            let store = MappingStore::open(tmp.path()).unwrap();
            store.put(digest, b"compacted").unwrap();
            store.attach(digest, dir(3)).unwrap();
            store.compact().unwrap();
            assert_eq!(
                std::fs::metadata(tmp.path().join("mappings.journal"))
                    .unwrap()
                    .len(),
                0
            );
        }

        let store = MappingStore::open(tmp.path()).unwrap();
        assert_eq!(store.get(&digest).as_deref(), Some(&b"compacted"[..]));
        assert_eq!(store.attachment_count(&digest), 1);
    }

    #[test]
    fn detach_reports_remaining_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MappingStore::open(tmp.path()).unwrap();
        let digest = Digest::of(b"shared");
        store.put(digest, b"shared").unwrap();
        store.attach(digest, dir(1)).unwrap();
        store.attach(digest, dir(2)).unwrap();
        store.attach(digest, dir(2)).unwrap();

        assert_eq!(store.detach(digest, dir(1)).unwrap(), 1);
        assert_eq!(store.detach(digest, dir(1)).unwrap(), 1);
        assert_eq!(store.detach(digest, dir(2)).unwrap(), 0);
    }

    #[test]
    fn concurrent_identical_puts_agree() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MappingStore::open(tmp.path()).unwrap());
        let name = vec![b'z'; 400];
        let digest = Digest::of(&name);

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let name = name.clone();
                thread::spawn(move || store.put(digest, &name))
            })
            .collect();
        for worker in workers {
            worker.join().unwrap().unwrap();
        }

        assert_eq!(store.len(), 1);
        assert_eq!(store.writer.lock().ops, 1);
    }
}
