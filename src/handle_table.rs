use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    File,
    Dir,
}

/// An open backing fd handed to the kernel as `fh`.
#[derive(Debug, Clone)]
pub struct OpenHandle {
    kind: HandleKind,
    fd: Arc<OwnedFd>,
}

impl OpenHandle {
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[derive(Debug)]
pub struct HandleTable {
    next_id: AtomicU64,
    entries: RwLock<HashMap<u64, OpenHandle>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        // 0 is left unused so a zeroed fh never matches.
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, kind: HandleKind, fd: OwnedFd) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert(
            id,
            OpenHandle {
                kind,
                fd: Arc::new(fd),
            },
        );
        id
    }

    /// The handle `id`, provided it is of `kind`. Anything else is `EBADF`.
    pub fn get(&self, id: u64, kind: HandleKind) -> CoreResult<OpenHandle> {
        match self.entries.read().get(&id) {
            Some(handle) if handle.kind == kind => Ok(handle.clone()),
            _ => Err(CoreError::Backing(nix::Error::EBADF)),
        }
    }

    pub fn remove(&self, id: u64) -> Option<OpenHandle> {
        self.entries.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}
