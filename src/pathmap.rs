use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::translate::{BackingName, NameTranslator};
use crate::util::DirKey;
use nix::fcntl::{OFlag, openat};
use nix::sys::stat::Mode;
use nix::unistd::dup;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ffi::{OsStr, OsString};
use std::ops::Range;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;

const DIR_FD_CACHE_CAPACITY: usize = 64;

/// A client path resolved down to the backing directory holding its last
/// component.
#[derive(Debug)]
pub struct BackingPath {
    pub dir_fd: OwnedFd,
    pub dir: DirKey,
    pub name: BackingName,
    pub client_name: OsString,
}

#[derive(Debug)]
struct DirFdCacheInner {
    map: HashMap<Vec<u8>, OwnedFd>,
    order: VecDeque<Vec<u8>>,
}

impl DirFdCacheInner {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    fn get(&mut self, key: &[u8]) -> Option<OwnedFd> {
        let fd = self.map.get(key)?;
        let dup_fd = dup(fd.as_fd()).ok();
        self.touch(key);
        dup_fd
    }

    fn touch(&mut self, key: &[u8]) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(key) = self.order.remove(pos) {
                self.order.push_back(key);
            }
        }
    }

    fn insert(&mut self, key: Vec<u8>, fd: OwnedFd, capacity: usize) {
        if self.map.contains_key(&key) {
            self.touch(&key);
            self.map.insert(key, fd);
            return;
        }

        if self.map.len() >= capacity
            && let Some(old) = self.order.pop_front()
        {
            self.map.remove(&old);
        }

        self.order.push_back(key.clone());
        self.map.insert(key, fd);
    }

    fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

/// Walks client paths through the translator, caching the `O_PATH` fds of
/// intermediate backing directories.
#[derive(Debug)]
pub struct PathResolver {
    cache: Mutex<DirFdCacheInner>,
    capacity: usize,
}

#[derive(Debug)]
struct PathSegments<'a> {
    buf: &'a [u8],
    parts: Vec<Range<usize>>,
}

impl<'a> PathSegments<'a> {
    fn new(path: &'a OsStr) -> Self {
        let buf = path.as_bytes();
        let mut parts = Vec::new();
        let mut start = 0usize;
        for (idx, b) in buf.iter().enumerate() {
            if *b == b'/' {
                if idx > start {
                    parts.push(start..idx);
                }
                start = idx + 1;
            }
        }
        if start < buf.len() {
            parts.push(start..buf.len());
        }
        Self { buf, parts }
    }

    fn split_last(&self) -> Option<(&'a [u8], impl Iterator<Item = &'a [u8]> + '_)> {
        let (last, init) = self.parts.split_last()?;
        let buf = self.buf;
        Some((&buf[last.clone()], init.iter().map(move |r| &buf[r.clone()])))
    }
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PathResolver {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(DirFdCacheInner::new(DIR_FD_CACHE_CAPACITY)),
            capacity: DIR_FD_CACHE_CAPACITY,
        }
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    fn walk(
        &self,
        config: &Config,
        translator: &NameTranslator,
        dirs: impl Iterator<Item = impl AsRef<[u8]>>,
        use_cache: bool,
    ) -> CoreResult<OwnedFd> {
        let mut dir_fd = openat(
            config.backend_fd(),
            ".",
            OFlag::O_PATH | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        let mut prefix: Vec<u8> = Vec::new();

        for seg in dirs {
            let backing = translator.backing_name(OsStr::from_bytes(seg.as_ref()))?;
            prefix.push(b'/');
            prefix.extend_from_slice(backing.as_bytes());

            if use_cache && let Some(fd) = self.cache.lock().get(&prefix) {
                dir_fd = fd;
                continue;
            }

            let next_fd = openat(
                dir_fd.as_fd(),
                backing.as_c_str(),
                OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
                Mode::empty(),
            )?;

            if use_cache && let Ok(dup_fd) = dup(next_fd.as_fd()) {
                self.cache.lock().insert(prefix.clone(), dup_fd, self.capacity);
            }
            dir_fd = next_fd;
        }

        Ok(dir_fd)
    }

    fn resolve_with_cache(
        &self,
        config: &Config,
        translator: &NameTranslator,
        path: &OsStr,
        use_cache: bool,
    ) -> CoreResult<BackingPath> {
        let parts = PathSegments::new(path);
        let (last, dirs) = parts.split_last().ok_or(CoreError::InvalidName)?;

        let name = translator.backing_name(OsStr::from_bytes(last))?;
        let dir_fd = self.walk(config, translator, dirs, use_cache)?;
        let dir = config.dir_key(dir_fd.as_fd())?;

        Ok(BackingPath {
            dir_fd,
            dir,
            name,
            client_name: OsStr::from_bytes(last).to_os_string(),
        })
    }

    /// Resolves a non-root client path. A cache miss caused by a stale entry
    /// retries once against the backing store directly.
    pub fn resolve(
        &self,
        config: &Config,
        translator: &NameTranslator,
        path: &OsStr,
    ) -> CoreResult<BackingPath> {
        match self.resolve_with_cache(config, translator, path, true) {
            Ok(v) => Ok(v),
            Err(err) if err.is_not_found() || err.errno() == libc::ENOTDIR => {
                self.clear();
                self.resolve_with_cache(config, translator, path, false)
            }
            Err(err) => Err(err),
        }
    }
}

pub fn is_root(path: &OsStr) -> bool {
    path.as_bytes().iter().all(|b| *b == b'/')
}

pub fn make_child_path(parent: &OsStr, name: &OsStr) -> OsString {
    if is_root(parent) {
        let mut composed = OsString::from("/");
        composed.push(name);
        composed
    } else {
        let mut composed = OsString::from(parent);
        composed.push(OsStr::new("/"));
        composed.push(name);
        composed
    }
}
