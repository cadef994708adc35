//! Translation between client-visible names and backing-store names.
//!
//! Names up to the threshold are stored as-is. Longer names are stored under
//! an alias derived from their digest, and the digest → name record is made
//! durable before the aliased entry is created on the backing store.

use crate::alias::{self, Decoded};
use crate::digest::Digest;
use crate::error::{CoreError, CoreResult};
use crate::store::MappingStore;
use crate::util::{DirKey, bytes_to_cstring};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashSet;
use std::ffi::{CStr, CString, OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use tracing::{debug, info, warn};

const NAME_LOCK_STRIPES: usize = 64;
const UNRESOLVED_MAX: usize = 4096;

/// A name as it is used on the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingName {
    c_name: CString,
    digest: Option<Digest>,
}

impl BackingName {
    pub fn as_c_str(&self) -> &CStr {
        self.c_name.as_c_str()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.c_name.as_bytes()
    }

    /// The digest when this name is an alias.
    pub fn digest(&self) -> Option<Digest> {
        self.digest
    }

    pub fn is_alias(&self) -> bool {
        self.digest.is_some()
    }
}

/// A backing entry name translated for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientName {
    pub name: OsString,
    /// The entry is an alias whose record is missing; `name` is the raw alias.
    pub unresolved: bool,
}

/// Holds the lock stripes of the digests an operation touches.
pub struct NameGuard<'a> {
    _guards: Vec<MutexGuard<'a, ()>>,
}

#[derive(Debug)]
pub struct NameTranslator {
    threshold: usize,
    long_name_max: usize,
    store: MappingStore,
    locks: Vec<Mutex<()>>,
    unresolved: RwLock<HashSet<Digest>>,
}

impl NameTranslator {
    pub fn new(store: MappingStore, threshold: usize, long_name_max: usize) -> Self {
        Self {
            threshold,
            long_name_max,
            store,
            locks: (0..NAME_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            unresolved: RwLock::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &MappingStore {
        &self.store
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn long_name_max(&self) -> usize {
        self.long_name_max
    }

    pub fn needs_alias(&self, name: &[u8]) -> bool {
        name.len() > self.threshold
    }

    fn validate(&self, name: &[u8]) -> CoreResult<()> {
        if name.is_empty() || name == b"." || name == b".." || name.contains(&b'/') {
            return Err(CoreError::InvalidName);
        }
        if name.len() > self.long_name_max {
            return Err(CoreError::NameTooLong {
                max: self.long_name_max,
            });
        }
        Ok(())
    }

    /// Backing name for `name` without touching the store. Used wherever the
    /// entry is expected to exist already. A raw alias always maps to itself,
    /// whatever the threshold.
    pub fn backing_name(&self, name: &OsStr) -> CoreResult<BackingName> {
        let raw = name.as_bytes();
        self.validate(raw)?;
        if !self.needs_alias(raw) || alias::decode(raw).digest().is_some() {
            return Ok(BackingName {
                c_name: bytes_to_cstring(raw)?,
                digest: None,
            });
        }
        if raw.contains(&0) {
            return Err(CoreError::InvalidName);
        }
        let digest = Digest::of(raw);
        Ok(BackingName {
            c_name: bytes_to_cstring(alias::encode(&digest).as_bytes())?,
            digest: Some(digest),
        })
    }

    /// Rejects names that would read back as an alias. Only applies to names
    /// being created; looking such a name up is allowed.
    pub fn check_creatable(&self, name: &OsStr) -> CoreResult<()> {
        if alias::decode(name.as_bytes()).digest().is_some() {
            return Err(CoreError::ReservedName);
        }
        Ok(())
    }

    /// Forward translation for a name about to be created in `dir`. The record
    /// and the directory attachment are durable when this returns.
    pub fn to_backing_name(&self, dir: DirKey, name: &OsStr) -> CoreResult<BackingName> {
        let backing = self.backing_name(name)?;
        self.record(dir, name, &backing)?;
        Ok(backing)
    }

    /// Persists the record behind an already computed backing name.
    pub fn record(&self, dir: DirKey, name: &OsStr, backing: &BackingName) -> CoreResult<()> {
        let Some(digest) = backing.digest else {
            return Ok(());
        };
        self.store.put(digest, name.as_bytes())?;
        self.store.attach(digest, dir)?;
        if self.unresolved.write().remove(&digest) {
            info!(%digest, "alias resolved again");
        }
        Ok(())
    }

    /// Reverse translation of a backing directory entry.
    pub fn to_client_name(&self, entry: &[u8]) -> ClientName {
        let digest = match alias::decode(entry) {
            Decoded::Alias(digest) => digest,
            Decoded::Malformed => {
                debug!(entry = %String::from_utf8_lossy(entry), "malformed alias passed through");
                return ClientName {
                    name: OsString::from_vec(entry.to_vec()),
                    unresolved: false,
                };
            }
            Decoded::Plain => {
                return ClientName {
                    name: OsString::from_vec(entry.to_vec()),
                    unresolved: false,
                };
            }
        };

        match self.store.get(&digest) {
            Some(name) => ClientName {
                name: OsString::from_vec(name.to_vec()),
                unresolved: false,
            },
            None => {
                let mut unresolved = self.unresolved.write();
                if unresolved.len() >= UNRESOLVED_MAX && !unresolved.contains(&digest) {
                    debug!(tracked = unresolved.len(), "resetting unresolved alias set");
                    unresolved.clear();
                }
                if unresolved.insert(digest) {
                    warn!(%digest, "alias without mapping record; exposing raw alias");
                }
                ClientName {
                    name: OsString::from_vec(entry.to_vec()),
                    unresolved: true,
                }
            }
        }
    }

    pub fn is_unresolved(&self, digest: &Digest) -> bool {
        self.unresolved.read().contains(digest)
    }

    /// Stops tracking a raw alias entry that is gone from the backing store.
    pub fn forget_unresolved(&self, entry: &[u8]) {
        if let Some(digest) = alias::decode(entry).digest() {
            self.unresolved.write().remove(&digest);
        }
    }

    /// Called when an alias was found on disk by its long name. Re-creates a
    /// missing record and makes sure `dir` is attached to it.
    pub fn heal(&self, dir: DirKey, name: &OsStr, backing: &BackingName) -> CoreResult<()> {
        let Some(digest) = backing.digest else {
            return Ok(());
        };
        if self.store.get(&digest).is_some() {
            return self.store.attach(digest, dir);
        }
        info!(%digest, "restoring mapping record for alias found on disk");
        self.record(dir, name, backing)
    }

    /// Drops `dir`'s hold on an alias whose entry is gone from it. The record
    /// is deleted once no directory holds the alias.
    pub fn release(&self, dir: DirKey, backing: &BackingName) -> CoreResult<()> {
        let Some(digest) = backing.digest else {
            return Ok(());
        };
        if self.store.detach(digest, dir)? == 0 {
            self.store.delete(&digest)?;
            debug!(%digest, "mapping record reclaimed");
        }
        Ok(())
    }

    /// Locks the stripes of every aliased name in `names`, in stripe order.
    pub fn lock<'a>(&'a self, names: &[&BackingName]) -> NameGuard<'a> {
        let mut stripes: Vec<usize> = names
            .iter()
            .filter_map(|name| name.digest)
            .map(|digest| digest.stripe(NAME_LOCK_STRIPES))
            .collect();
        stripes.sort_unstable();
        stripes.dedup();
        NameGuard {
            _guards: stripes.into_iter().map(|idx| self.locks[idx].lock()).collect(),
        }
    }
}
