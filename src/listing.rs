use crate::error::CoreResult;
use crate::translate::NameTranslator;
use crate::util::{DirKey, file_attr_from_stat};
use fuse3::FileType;
use fuse3::path::reply::FileAttr;
use nix::dir::Dir;
use nix::fcntl::{AtFlags, OFlag};
use nix::sys::stat::{Mode, fstatat};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::{CString, OsString};
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    /// Client-visible name.
    pub name: OsString,
    /// Name on the backing store.
    pub backing: CString,
    pub kind: FileType,
    pub attr: FileAttr,
    pub unresolved: bool,
}

/// Lists a backing directory with every entry translated for the client.
/// Entries that vanish while listing are skipped.
pub fn list_entries(
    dir_fd: BorrowedFd<'_>,
    translator: &NameTranslator,
) -> CoreResult<Vec<DirEntryInfo>> {
    let mut dir = Dir::openat(
        dir_fd,
        ".",
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;

    let mut entries = Vec::new();
    for entry in dir.iter() {
        let entry = match entry {
            Ok(v) => v,
            Err(_) => continue,
        };
        let backing = entry.file_name();
        let raw = backing.to_bytes();
        if raw == b"." || raw == b".." {
            continue;
        }

        let stat = match fstatat(dir_fd, backing, AtFlags::AT_SYMLINK_NOFOLLOW) {
            Ok(st) => st,
            Err(_) => continue,
        };
        let attr = file_attr_from_stat(&stat);
        let client = translator.to_client_name(raw);
        entries.push(DirEntryInfo {
            name: client.name,
            backing: backing.to_owned(),
            kind: attr.kind,
            attr,
            unresolved: client.unresolved,
        });
    }

    entries.sort_by(|a, b| a.backing.cmp(&b.backing));
    Ok(entries)
}

#[derive(Debug)]
struct DirCacheEntry {
    expires_at: Instant,
    entries: Arc<Vec<DirEntryInfo>>,
}

const DIR_CACHE_MAX_DIRS: usize = 4096;

/// TTL-bound cache of translated listings, keyed by backing directory.
/// Every mutation of a directory invalidates its entry.
#[derive(Debug)]
pub struct DirCache {
    ttl: Duration,
    enabled: bool,
    entries: RwLock<HashMap<DirKey, DirCacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DirCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        let (enabled, ttl) = match ttl {
            Some(t) => (true, t),
            None => (false, Duration::ZERO),
        };
        Self {
            ttl,
            enabled,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: DirKey) -> Option<Arc<Vec<DirEntryInfo>>> {
        if !self.enabled {
            return None;
        }
        let now = Instant::now();
        {
            let guard = self.entries.read();
            if let Some(entry) = guard.get(&key)
                && entry.expires_at > now
            {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.entries.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.entries.write();
        if guard.get(&key).is_some_and(|entry| entry.expires_at <= now) {
            guard.remove(&key);
        }
        None
    }

    pub fn insert(&self, key: DirKey, items: Vec<DirEntryInfo>) -> Arc<Vec<DirEntryInfo>> {
        let entries = Arc::new(items);
        if !self.enabled {
            return entries;
        }
        let expires_at = Instant::now() + self.ttl;
        let mut guard = self.entries.write();
        if guard.len() >= DIR_CACHE_MAX_DIRS {
            guard.clear();
        }
        guard.insert(
            key,
            DirCacheEntry {
                expires_at,
                entries: entries.clone(),
            },
        );
        entries
    }

    pub fn invalidate(&self, key: DirKey) {
        if !self.enabled {
            return;
        }
        self.entries.write().remove(&key);
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
