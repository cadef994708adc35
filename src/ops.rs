//! Translated filesystem operations.
//!
//! Each request from the transport becomes one [`FsOp`] and goes through
//! [`Mount::dispatch`]. Client names are translated before the backing call,
//! backing names are translated back before the reply.

use crate::config::{Config, LONG_NAME_MAX};
use crate::error::{CoreError, CoreResult};
use crate::listing::{DirCache, DirEntryInfo, list_entries};
use crate::pathmap::{BackingPath, PathResolver, is_root, make_child_path};
use crate::store::MappingStore;
use crate::translate::{BackingName, NameTranslator};
use crate::util::{access_mask_from_bits, file_attr_from_stat, oflag_from_bits};
use fuse3::path::reply::FileAttr;
use nix::fcntl::{AtFlags, OFlag, openat, readlinkat, renameat};
use nix::sys::stat::{
    FchmodatFlags, Mode, SFlag, UtimensatFlags, fchmodat, fstat, fstatat, mkdirat, mknodat,
    utimensat,
};
use nix::sys::statvfs::{Statvfs, fstatvfs};
use nix::sys::time::TimeSpec;
use nix::unistd::{
    Gid, LinkatFlags, Uid, UnlinkatFlags, faccessat, fchown, fchownat, geteuid, linkat, symlinkat,
    unlinkat,
};
use std::ffi::{CStr, OsStr, OsString};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Identity of the requesting process. Entries it creates are handed to it
/// when the mount runs as root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AttrChanges {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeSpec>,
    pub mtime: Option<TimeSpec>,
}

#[derive(Debug)]
pub enum FsOp<'a> {
    Lookup {
        parent: &'a OsStr,
        name: &'a OsStr,
    },
    GetAttr {
        path: &'a OsStr,
    },
    SetAttr {
        path: &'a OsStr,
        changes: AttrChanges,
    },
    ReadLink {
        path: &'a OsStr,
    },
    Access {
        path: &'a OsStr,
        mask: u32,
    },
    Open {
        path: &'a OsStr,
        flags: u32,
    },
    OpenDir {
        path: &'a OsStr,
    },
    ReadDir {
        dir: BorrowedFd<'a>,
    },
    Create {
        parent: &'a OsStr,
        name: &'a OsStr,
        mode: u32,
        flags: u32,
        caller: Caller,
    },
    MkNod {
        parent: &'a OsStr,
        name: &'a OsStr,
        mode: u32,
        rdev: u32,
        caller: Caller,
    },
    MkDir {
        parent: &'a OsStr,
        name: &'a OsStr,
        mode: u32,
        umask: u32,
        caller: Caller,
    },
    Symlink {
        parent: &'a OsStr,
        name: &'a OsStr,
        target: &'a OsStr,
        caller: Caller,
    },
    Link {
        path: &'a OsStr,
        new_parent: &'a OsStr,
        new_name: &'a OsStr,
    },
    Unlink {
        parent: &'a OsStr,
        name: &'a OsStr,
    },
    RmDir {
        parent: &'a OsStr,
        name: &'a OsStr,
    },
    Rename {
        from_parent: &'a OsStr,
        from_name: &'a OsStr,
        to_parent: &'a OsStr,
        to_name: &'a OsStr,
    },
}

#[derive(Debug)]
pub enum FsReply {
    Attr(FileAttr),
    Target(OsString),
    Opened(OwnedFd),
    Created { fd: OwnedFd, attr: FileAttr },
    Entries(Arc<Vec<DirEntryInfo>>),
    Done,
}

/// Mount-wide context: backend, translator, path and listing caches.
#[derive(Debug)]
pub struct Mount {
    config: Config,
    translator: NameTranslator,
    paths: PathResolver,
    dir_cache: DirCache,
}

fn stat_entry(dir: BorrowedFd<'_>, name: &CStr) -> CoreResult<FileAttr> {
    let stat = fstatat(dir, name, AtFlags::AT_SYMLINK_NOFOLLOW)?;
    Ok(file_attr_from_stat(&stat))
}

fn entry_exists(dir: BorrowedFd<'_>, name: &CStr) -> CoreResult<bool> {
    match fstatat(dir, name, AtFlags::AT_SYMLINK_NOFOLLOW) {
        Ok(_) => Ok(true),
        Err(nix::Error::ENOENT) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

impl Mount {
    pub fn new(config: Config, dir_cache_ttl: Option<Duration>) -> CoreResult<Self> {
        let store = MappingStore::open(&config.store_path)?;
        let translator = NameTranslator::new(store, config.name_threshold, LONG_NAME_MAX);
        Ok(Self {
            config,
            translator,
            paths: PathResolver::new(),
            dir_cache: DirCache::new(dir_cache_ttl),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn translator(&self) -> &NameTranslator {
        &self.translator
    }

    pub fn dir_cache(&self) -> &DirCache {
        &self.dir_cache
    }

    pub fn dispatch(&self, op: FsOp<'_>) -> CoreResult<FsReply> {
        debug!(?op, "dispatch");
        match op {
            FsOp::Lookup { parent, name } => self.lookup(parent, name).map(FsReply::Attr),
            FsOp::GetAttr { path } => self.getattr(path).map(FsReply::Attr),
            FsOp::SetAttr { path, changes } => self.setattr(path, &changes).map(FsReply::Attr),
            FsOp::ReadLink { path } => {
                let target = self.resolve(path)?;
                let link = readlinkat(target.dir_fd.as_fd(), target.name.as_c_str())?;
                Ok(FsReply::Target(link))
            }
            FsOp::Access { path, mask } => {
                let flags = access_mask_from_bits(mask);
                if is_root(path) {
                    faccessat(self.config.backend_fd(), ".", flags, AtFlags::empty())?;
                } else {
                    let target = self.resolve(path)?;
                    faccessat(
                        target.dir_fd.as_fd(),
                        target.name.as_c_str(),
                        flags,
                        AtFlags::AT_SYMLINK_NOFOLLOW,
                    )?;
                }
                Ok(FsReply::Done)
            }
            FsOp::Open { path, flags } => {
                let oflag = (oflag_from_bits(flags) & !(OFlag::O_CREAT | OFlag::O_EXCL))
                    | OFlag::O_CLOEXEC;
                let fd = if is_root(path) {
                    openat(self.config.backend_fd(), ".", oflag, Mode::empty())?
                } else {
                    let target = self.resolve(path)?;
                    openat(
                        target.dir_fd.as_fd(),
                        target.name.as_c_str(),
                        oflag,
                        Mode::empty(),
                    )?
                };
                Ok(FsReply::Opened(fd))
            }
            FsOp::OpenDir { path } => self.open_dir(path).map(FsReply::Opened),
            FsOp::ReadDir { dir } => self.read_dir(dir).map(FsReply::Entries),
            FsOp::Create {
                parent,
                name,
                mode,
                flags,
                caller,
            } => {
                let oflag = oflag_from_bits(flags) | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_CLOEXEC;
                let (fd, _) = self.create_entry(parent, name, Some(caller), |dir, c_name| {
                    openat(dir, c_name, oflag, Mode::from_bits_truncate(mode & 0o7777))
                })?;
                let attr = file_attr_from_stat(&fstat(fd.as_fd())?);
                Ok(FsReply::Created { fd, attr })
            }
            FsOp::MkNod {
                parent,
                name,
                mode,
                rdev,
                caller,
            } => {
                let (_, attr) = self.create_entry(parent, name, Some(caller), |dir, c_name| {
                    mknodat(
                        dir,
                        c_name,
                        SFlag::from_bits_truncate(mode),
                        Mode::from_bits_truncate(mode),
                        rdev as libc::dev_t,
                    )
                })?;
                Ok(FsReply::Attr(attr))
            }
            FsOp::MkDir {
                parent,
                name,
                mode,
                umask,
                caller,
            } => {
                let (_, attr) = self.create_entry(parent, name, Some(caller), |dir, c_name| {
                    mkdirat(dir, c_name, Mode::from_bits_truncate(mode & !umask))
                })?;
                Ok(FsReply::Attr(attr))
            }
            FsOp::Symlink {
                parent,
                name,
                target,
                caller,
            } => {
                let (_, attr) = self.create_entry(parent, name, Some(caller), |dir, c_name| {
                    symlinkat(target, dir, c_name)
                })?;
                Ok(FsReply::Attr(attr))
            }
            FsOp::Link {
                path,
                new_parent,
                new_name,
            } => {
                let source = self.resolve(path)?;
                let (_, attr) = self.create_entry(new_parent, new_name, None, |dir, c_name| {
                    linkat(
                        source.dir_fd.as_fd(),
                        source.name.as_c_str(),
                        dir,
                        c_name,
                        LinkatFlags::empty(),
                    )
                })?;
                Ok(FsReply::Attr(attr))
            }
            FsOp::Unlink { parent, name } => {
                self.remove_entry(parent, name, UnlinkatFlags::NoRemoveDir)?;
                Ok(FsReply::Done)
            }
            FsOp::RmDir { parent, name } => {
                self.remove_entry(parent, name, UnlinkatFlags::RemoveDir)?;
                self.paths.clear();
                Ok(FsReply::Done)
            }
            FsOp::Rename {
                from_parent,
                from_name,
                to_parent,
                to_name,
            } => {
                self.rename(from_parent, from_name, to_parent, to_name)?;
                Ok(FsReply::Done)
            }
        }
    }

    fn resolve(&self, path: &OsStr) -> CoreResult<BackingPath> {
        self.paths.resolve(&self.config, &self.translator, path)
    }

    fn lookup(&self, parent: &OsStr, name: &OsStr) -> CoreResult<FileAttr> {
        let target = self.resolve(&make_child_path(parent, name))?;
        // Held across the stat so an unlink cannot slip in before the heal.
        let _guard = self.translator.lock(&[&target.name]);
        let attr = stat_entry(target.dir_fd.as_fd(), target.name.as_c_str())?;
        if target.name.is_alias()
            && let Err(err) = self.translator.heal(target.dir, name, &target.name)
        {
            warn!(error = %err, "could not restore mapping record");
        }
        Ok(attr)
    }

    fn getattr(&self, path: &OsStr) -> CoreResult<FileAttr> {
        if is_root(path) {
            let stat = fstatat(
                self.config.backend_fd(),
                "",
                AtFlags::AT_EMPTY_PATH | AtFlags::AT_SYMLINK_NOFOLLOW,
            )?;
            return Ok(file_attr_from_stat(&stat));
        }
        let target = self.resolve(path)?;
        stat_entry(target.dir_fd.as_fd(), target.name.as_c_str())
    }

    fn setattr(&self, path: &OsStr, changes: &AttrChanges) -> CoreResult<FileAttr> {
        if is_root(path) {
            let backend = self.config.backend_fd();
            if let Some(mode) = changes.mode {
                nix::sys::stat::fchmod(backend, Mode::from_bits_truncate(mode))?;
            }
            if changes.uid.is_some() || changes.gid.is_some() {
                fchown(
                    backend,
                    changes.uid.map(Uid::from_raw),
                    changes.gid.map(Gid::from_raw),
                )?;
            }
            if changes.size.is_some() {
                return Err(CoreError::Backing(nix::Error::EISDIR));
            }
            if changes.atime.is_some() || changes.mtime.is_some() {
                let times = [
                    *changes.atime.unwrap_or(TimeSpec::UTIME_OMIT).as_ref(),
                    *changes.mtime.unwrap_or(TimeSpec::UTIME_OMIT).as_ref(),
                ];
                let res = unsafe { libc::futimens(backend.as_raw_fd(), times.as_ptr()) };
                if res < 0 {
                    return Err(std::io::Error::last_os_error().into());
                }
            }
            return self.getattr(path);
        }

        let target = self.resolve(path)?;
        let dir = target.dir_fd.as_fd();
        let name = target.name.as_c_str();

        if let Some(mode) = changes.mode {
            fchmodat(
                dir,
                name,
                Mode::from_bits_truncate(mode),
                FchmodatFlags::FollowSymlink,
            )?;
        }
        if changes.uid.is_some() || changes.gid.is_some() {
            fchownat(
                dir,
                name,
                changes.uid.map(Uid::from_raw),
                changes.gid.map(Gid::from_raw),
                AtFlags::AT_SYMLINK_NOFOLLOW,
            )?;
        }
        if let Some(size) = changes.size {
            let file = openat(dir, name, OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty())?;
            nix::unistd::ftruncate(&file, size as i64)?;
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            utimensat(
                dir,
                name,
                &changes.atime.unwrap_or(TimeSpec::UTIME_OMIT),
                &changes.mtime.unwrap_or(TimeSpec::UTIME_OMIT),
                UtimensatFlags::NoFollowSymlink,
            )?;
        }
        self.dir_cache.invalidate(target.dir);
        stat_entry(dir, name)
    }

    fn open_dir(&self, path: &OsStr) -> CoreResult<OwnedFd> {
        let oflag = OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC;
        if is_root(path) {
            return Ok(openat(self.config.backend_fd(), ".", oflag, Mode::empty())?);
        }
        let target = self.resolve(path)?;
        Ok(openat(
            target.dir_fd.as_fd(),
            target.name.as_c_str(),
            oflag,
            Mode::empty(),
        )?)
    }

    fn read_dir(&self, dir: BorrowedFd<'_>) -> CoreResult<Arc<Vec<DirEntryInfo>>> {
        let key = self.config.dir_key(dir)?;
        if let Some(entries) = self.dir_cache.get(key) {
            return Ok(entries);
        }
        let entries = list_entries(dir, &self.translator)?;
        Ok(self.dir_cache.insert(key, entries))
    }

    /// Fd for xattr calls on `path`. Symlinks cannot be opened this way and
    /// fail with `ELOOP`.
    pub fn open_xattr_target(&self, path: &OsStr) -> CoreResult<OwnedFd> {
        let oflag = OFlag::O_RDONLY | OFlag::O_NONBLOCK | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC;
        if is_root(path) {
            return Ok(openat(self.config.backend_fd(), ".", oflag, Mode::empty())?);
        }
        let target = self.resolve(path)?;
        Ok(openat(
            target.dir_fd.as_fd(),
            target.name.as_c_str(),
            oflag,
            Mode::empty(),
        )?)
    }

    pub fn statfs(&self) -> CoreResult<Statvfs> {
        Ok(fstatvfs(self.config.backend_fd())?)
    }

    /// Allocates the backing name for a new entry, makes its record durable,
    /// then runs `make` against the backing directory.
    fn create_entry<T>(
        &self,
        parent: &OsStr,
        name: &OsStr,
        caller: Option<Caller>,
        make: impl FnOnce(BorrowedFd<'_>, &CStr) -> nix::Result<T>,
    ) -> CoreResult<(T, FileAttr)> {
        self.translator.check_creatable(name)?;
        let target = self.resolve(&make_child_path(parent, name))?;
        let dir = target.dir_fd.as_fd();

        let _guard = self.translator.lock(&[&target.name]);
        let backing = self.translator.to_backing_name(target.dir, name)?;
        let out = match make(dir, backing.as_c_str()) {
            Ok(out) => out,
            Err(err) => {
                self.drop_unused_attachment(&target, &backing);
                return Err(err.into());
            }
        };
        self.dir_cache.invalidate(target.dir);

        if let Some(caller) = caller
            && geteuid().is_root()
        {
            fchownat(
                dir,
                backing.as_c_str(),
                Some(Uid::from_raw(caller.uid)),
                Some(Gid::from_raw(caller.gid)),
                AtFlags::AT_SYMLINK_NOFOLLOW,
            )?;
        }

        let attr = stat_entry(dir, backing.as_c_str())?;
        debug!(alias = backing.is_alias(), "created entry");
        Ok((out, attr))
    }

    /// Removes an entry, then lets go of its record. A failed removal leaves
    /// the record alone.
    fn remove_entry(&self, parent: &OsStr, name: &OsStr, flags: UnlinkatFlags) -> CoreResult<()> {
        let target = self.resolve(&make_child_path(parent, name))?;
        let _guard = self.translator.lock(&[&target.name]);
        unlinkat(target.dir_fd.as_fd(), target.name.as_c_str(), flags)?;
        self.dir_cache.invalidate(target.dir);
        self.translator.forget_unresolved(target.name.as_bytes());

        if let Err(err) = self.translator.release(target.dir, &target.name) {
            warn!(error = %err, "could not reclaim mapping record");
        }
        Ok(())
    }

    /// Undoes the attachment `to_backing_name` made when the backing call
    /// that should have produced the alias in `dir` failed.
    fn drop_unused_attachment(&self, dir: &BackingPath, backing: &BackingName) {
        if !backing.is_alias() {
            return;
        }
        match entry_exists(dir.dir_fd.as_fd(), backing.as_c_str()) {
            Ok(true) => {}
            Ok(false) => {
                if let Err(err) = self.translator.release(dir.dir, backing) {
                    warn!(error = %err, "could not drop unused attachment");
                }
            }
            Err(err) => warn!(error = %err, "could not check for alias after failed call"),
        }
    }

    fn rename(
        &self,
        from_parent: &OsStr,
        from_name: &OsStr,
        to_parent: &OsStr,
        to_name: &OsStr,
    ) -> CoreResult<()> {
        let from = self.resolve(&make_child_path(from_parent, from_name))?;
        self.translator.check_creatable(to_name)?;
        let to = self.resolve(&make_child_path(to_parent, to_name))?;
        if from.dir == to.dir && from.name == to.name {
            stat_entry(from.dir_fd.as_fd(), from.name.as_c_str())?;
            return Ok(());
        }

        let _guard = self.translator.lock(&[&from.name, &to.name]);
        let to_backing = self.translator.to_backing_name(to.dir, to_name)?;
        if let Err(err) = renameat(
            from.dir_fd.as_fd(),
            from.name.as_c_str(),
            to.dir_fd.as_fd(),
            to_backing.as_c_str(),
        ) {
            self.drop_unused_attachment(&to, &to_backing);
            return Err(err.into());
        }
        self.dir_cache.invalidate(from.dir);
        self.dir_cache.invalidate(to.dir);
        self.paths.clear();

        // Renaming onto another link of the same file leaves the source in place.
        if !entry_exists(from.dir_fd.as_fd(), from.name.as_c_str())? {
            self.translator.forget_unresolved(from.name.as_bytes());
            if let Err(err) = self.translator.release(from.dir, &from.name) {
                warn!(error = %err, "could not reclaim mapping record");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias::{self, ALIAS_LENGTH, Decoded};
    use crate::digest::Digest;
    use std::os::unix::ffi::{OsStrExt, OsStringExt};
    use std::path::Path;
    use std::thread;

    struct Fixture {
        backend: tempfile::TempDir,
        _store: tempfile::TempDir,
        mount: Mount,
    }

    const CALLER: Caller = Caller { uid: 0, gid: 0 };

    fn fixture() -> Fixture {
        fixture_with_cache(None)
    }

    fn fixture_with_cache(ttl: Option<Duration>) -> Fixture {
        fixture_with(ttl, 255)
    }

    fn fixture_with(ttl: Option<Duration>, threshold: usize) -> Fixture {
        let backend = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let config = Config::open_backend(
            backend.path().to_path_buf(),
            store.path().join("store"),
            threshold,
            false,
        )
        .unwrap();
        let mount = Mount::new(config, ttl).unwrap();
        Fixture {
            backend,
            _store: store,
            mount,
        }
    }

    fn name(byte: u8, len: usize) -> OsString {
        OsString::from_vec(vec![byte; len])
    }

    fn backing_entries(dir: &Path) -> Vec<Vec<u8>> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_vec())
            .collect();
        names.sort();
        names
    }

    impl Fixture {
        fn create(&self, parent: &str, name: &OsStr) -> CoreResult<FsReply> {
            self.mount.dispatch(FsOp::Create {
                parent: OsStr::new(parent),
                name,
                mode: 0o644,
                flags: libc::O_RDWR as u32,
                caller: CALLER,
            })
        }

        fn mkdir(&self, parent: &str, name: &OsStr) -> CoreResult<FsReply> {
            self.mount.dispatch(FsOp::MkDir {
                parent: OsStr::new(parent),
                name,
                mode: 0o755,
                umask: 0o022,
                caller: CALLER,
            })
        }

        fn list(&self, path: &OsStr) -> Vec<OsString> {
            let FsReply::Opened(fd) = self.mount.dispatch(FsOp::OpenDir { path }).unwrap() else {
                panic!("expected a directory fd");
            };
            let FsReply::Entries(entries) = self
                .mount
                .dispatch(FsOp::ReadDir { dir: fd.as_fd() })
                .unwrap()
            else {
                panic!("expected entries");
            };
            entries.iter().map(|e| e.name.clone()).collect()
        }

        fn child(parent: &OsStr, name: &OsStr) -> OsString {
            make_child_path(parent, name)
        }
    }

    #[test]
    fn create_long_name_lists_once_and_stores_alias() {
        let fx = fixture();
        let n = name(b'n', 300);
        fx.create("/", &n).unwrap();

        assert_eq!(fx.list(OsStr::new("/")), vec![n.clone()]);

        let on_disk = backing_entries(fx.backend.path());
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk[0].len(), ALIAS_LENGTH);
        assert_eq!(
            alias::decode(&on_disk[0]),
            Decoded::Alias(Digest::of(n.as_bytes()))
        );
    }

    #[test]
    fn short_names_are_stored_verbatim() {
        let fx = fixture();
        fx.create("/", OsStr::new("plain.txt")).unwrap();
        assert_eq!(backing_entries(fx.backend.path()), vec![b"plain.txt".to_vec()]);
        assert_eq!(fx.mount.translator().store().len(), 0);
    }

    #[test]
    fn rename_long_to_short_drops_alias_and_record() {
        let fx = fixture();
        let n = name(b'n', 300);
        let m = name(b'm', 10);
        fx.create("/", &n).unwrap();
        let digest = Digest::of(n.as_bytes());

        fx.mount
            .dispatch(FsOp::Rename {
                from_parent: OsStr::new("/"),
                from_name: &n,
                to_parent: OsStr::new("/"),
                to_name: &m,
            })
            .unwrap();

        assert_eq!(backing_entries(fx.backend.path()), vec![m.as_bytes().to_vec()]);
        assert!(fx.mount.translator().store().get(&digest).is_none());
        assert_eq!(fx.list(OsStr::new("/")), vec![m]);
    }

    #[test]
    fn rename_short_to_long_records_before_commit() {
        let fx = fixture();
        let short = OsString::from("s");
        let long = name(b'q', 500);
        fx.create("/", &short).unwrap();

        fx.mount
            .dispatch(FsOp::Rename {
                from_parent: OsStr::new("/"),
                from_name: &short,
                to_parent: OsStr::new("/"),
                to_name: &long,
            })
            .unwrap();

        let digest = Digest::of(long.as_bytes());
        assert_eq!(
            fx.mount.translator().store().get(&digest).as_deref(),
            Some(long.as_bytes())
        );
        assert_eq!(fx.list(OsStr::new("/")), vec![long]);
    }

    #[test]
    fn concurrent_creates_of_same_long_name_have_one_winner() {
        let fx = Arc::new(fixture());
        let n = name(b'c', 300);

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let fx = fx.clone();
                let n = n.clone();
                thread::spawn(move || fx.create("/", &n).map(|_| ()))
            })
            .collect();
        let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let loser = results.into_iter().find_map(Result::err).unwrap();
        assert_eq!(loser.errno(), libc::EEXIST);
        assert_eq!(backing_entries(fx.backend.path()).len(), 1);
        assert_eq!(fx.list(OsStr::new("/")), vec![n]);
    }

    #[test]
    fn unlink_reclaims_record() {
        let fx = fixture();
        let n = name(b'u', 300);
        fx.create("/", &n).unwrap();
        let digest = Digest::of(n.as_bytes());
        assert!(fx.mount.translator().store().get(&digest).is_some());

        fx.mount
            .dispatch(FsOp::Unlink {
                parent: OsStr::new("/"),
                name: &n,
            })
            .unwrap();
        assert!(fx.mount.translator().store().get(&digest).is_none());
        assert!(backing_entries(fx.backend.path()).is_empty());
    }

    #[test]
    fn failed_removal_keeps_record() {
        let fx = fixture();
        let d = name(b'd', 300);
        fx.mkdir("/", &d).unwrap();
        let digest = Digest::of(d.as_bytes());

        let err = fx
            .mount
            .dispatch(FsOp::Unlink {
                parent: OsStr::new("/"),
                name: &d,
            })
            .unwrap_err();
        assert_eq!(err.errno(), libc::EISDIR);
        assert!(fx.mount.translator().store().get(&digest).is_some());

        fx.mount
            .dispatch(FsOp::RmDir {
                parent: OsStr::new("/"),
                name: &d,
            })
            .unwrap();
        assert!(fx.mount.translator().store().get(&digest).is_none());
    }

    #[test]
    fn same_long_name_in_two_directories_shares_record() {
        let fx = fixture();
        let n = name(b's', 300);
        fx.mkdir("/", OsStr::new("a")).unwrap();
        fx.mkdir("/", OsStr::new("b")).unwrap();
        fx.create("/a", &n).unwrap();
        fx.create("/b", &n).unwrap();

        fx.mount
            .dispatch(FsOp::Unlink {
                parent: OsStr::new("/a"),
                name: &n,
            })
            .unwrap();
        assert_eq!(fx.list(OsStr::new("/b")), vec![n.clone()]);

        fx.mount
            .dispatch(FsOp::Unlink {
                parent: OsStr::new("/b"),
                name: &n,
            })
            .unwrap();
        assert!(
            fx.mount
                .translator()
                .store()
                .get(&Digest::of(n.as_bytes()))
                .is_none()
        );
    }

    #[test]
    fn orphaned_alias_lists_raw_and_stays_reachable() {
        let fx = fixture();
        let n = name(b'o', 300);
        fx.create("/", &n).unwrap();
        let digest = Digest::of(n.as_bytes());
        fx.mount.translator().store().delete(&digest).unwrap();

        let raw = OsString::from(alias::encode(&digest));
        assert_eq!(fx.list(OsStr::new("/")), vec![raw.clone()]);
        assert!(fx.mount.translator().is_unresolved(&digest));

        let reply = fx
            .mount
            .dispatch(FsOp::Lookup {
                parent: OsStr::new("/"),
                name: &raw,
            })
            .unwrap();
        assert!(matches!(reply, FsReply::Attr(_)));
    }

    #[test]
    fn lookup_by_long_name_restores_lost_record() {
        let fx = fixture();
        let n = name(b'h', 300);
        fx.create("/", &n).unwrap();
        let digest = Digest::of(n.as_bytes());
        fx.mount.translator().store().delete(&digest).unwrap();

        fx.mount
            .dispatch(FsOp::Lookup {
                parent: OsStr::new("/"),
                name: &n,
            })
            .unwrap();
        assert_eq!(
            fx.mount.translator().store().get(&digest).as_deref(),
            Some(n.as_bytes())
        );
        assert_eq!(fx.list(OsStr::new("/")), vec![n]);
    }

    #[test]
    fn lookup_miss_leaves_no_record() {
        let fx = fixture();
        let err = fx
            .mount
            .dispatch(FsOp::Lookup {
                parent: OsStr::new("/"),
                name: &name(b'x', 300),
            })
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        assert_eq!(fx.mount.translator().store().len(), 0);
    }

    #[test]
    fn alias_shaped_names_cannot_be_created() {
        let fx = fixture();
        let raw = OsString::from(alias::encode(&Digest::of(b"fake")));
        let err = fx.create("/", &raw).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        assert!(backing_entries(fx.backend.path()).is_empty());
    }

    #[test]
    fn nested_long_directories_resolve() {
        let fx = fixture();
        let dir = name(b'D', 280);
        let file = name(b'F', 600);
        fx.mkdir("/", &dir).unwrap();
        let dir_path = Fixture::child(OsStr::new("/"), &dir);
        fx.mount
            .dispatch(FsOp::Create {
                parent: &dir_path,
                name: &file,
                mode: 0o600,
                flags: libc::O_WRONLY as u32,
                caller: CALLER,
            })
            .unwrap();

        assert_eq!(fx.list(&dir_path), vec![file.clone()]);
        let file_path = Fixture::child(&dir_path, &file);
        let FsReply::Attr(attr) = fx.mount.dispatch(FsOp::GetAttr { path: &file_path }).unwrap()
        else {
            panic!("expected attributes");
        };
        assert_eq!(attr.kind, fuse3::FileType::RegularFile);
    }

    #[test]
    fn symlink_and_hard_link_use_translated_names() {
        let fx = fixture();
        let target = name(b't', 300);
        let link = name(b'l', 300);
        let hard = name(b'k', 300);
        fx.create("/", &target).unwrap();

        fx.mount
            .dispatch(FsOp::Symlink {
                parent: OsStr::new("/"),
                name: &link,
                target: OsStr::new("relative/target"),
                caller: CALLER,
            })
            .unwrap();
        let link_path = Fixture::child(OsStr::new("/"), &link);
        let FsReply::Target(dest) = fx.mount.dispatch(FsOp::ReadLink { path: &link_path }).unwrap()
        else {
            panic!("expected link target");
        };
        assert_eq!(dest, "relative/target");

        let target_path = Fixture::child(OsStr::new("/"), &target);
        let FsReply::Attr(attr) = fx
            .mount
            .dispatch(FsOp::Link {
                path: &target_path,
                new_parent: OsStr::new("/"),
                new_name: &hard,
            })
            .unwrap()
        else {
            panic!("expected attributes");
        };
        assert_eq!(attr.nlink, 2);

        let mut listed = fx.list(OsStr::new("/"));
        listed.sort();
        let mut expected = vec![target, link, hard];
        expected.sort();
        assert_eq!(listed, expected);
        assert_eq!(fx.mount.translator().store().len(), 3);
    }

    #[test]
    fn setattr_truncates_through_alias() {
        let fx = fixture();
        let n = name(b'z', 300);
        let FsReply::Created { fd, .. } = fx.create("/", &n).unwrap() else {
            panic!("expected created handle");
        };
        nix::unistd::write(fd.as_fd(), b"hello world").unwrap();

        let path = Fixture::child(OsStr::new("/"), &n);
        let FsReply::Attr(attr) = fx
            .mount
            .dispatch(FsOp::SetAttr {
                path: &path,
                changes: AttrChanges {
                    size: Some(5),
                    ..AttrChanges::default()
                },
            })
            .unwrap()
        else {
            panic!("expected attributes");
        };
        assert_eq!(attr.size, 5);
    }

    #[test]
    fn listing_cache_is_invalidated_by_mutations() {
        let fx = fixture_with_cache(Some(Duration::from_secs(60)));
        fx.create("/", OsStr::new("one")).unwrap();
        assert_eq!(fx.list(OsStr::new("/")).len(), 1);
        assert_eq!(fx.list(OsStr::new("/")).len(), 1);
        let (hits, _) = fx.mount.dir_cache().stats();
        assert_eq!(hits, 1);

        fx.create("/", &name(b'w', 400)).unwrap();
        assert_eq!(fx.list(OsStr::new("/")).len(), 2);
    }

    #[test]
    fn backing_errors_propagate_unchanged() {
        let fx = fixture();
        let err = fx
            .mount
            .dispatch(FsOp::RmDir {
                parent: OsStr::new("/"),
                name: OsStr::new("missing"),
            })
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);

        fx.mkdir("/", OsStr::new("full")).unwrap();
        fx.create("/full", OsStr::new("x")).unwrap();
        let err = fx
            .mount
            .dispatch(FsOp::RmDir {
                parent: OsStr::new("/"),
                name: OsStr::new("full"),
            })
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOTEMPTY);
    }

    #[test]
    fn orphaned_alias_is_reachable_at_lowest_threshold() {
        let fx = fixture_with(None, crate::config::NAME_THRESHOLD_MIN);
        let n = name(b'p', 100);
        fx.create("/", &n).unwrap();
        let digest = Digest::of(n.as_bytes());
        assert_eq!(backing_entries(fx.backend.path())[0].len(), ALIAS_LENGTH);
        fx.mount.translator().store().delete(&digest).unwrap();

        let raw = OsString::from(alias::encode(&digest));
        assert_eq!(fx.list(OsStr::new("/")), vec![raw.clone()]);
        fx.mount
            .dispatch(FsOp::Lookup {
                parent: OsStr::new("/"),
                name: &raw,
            })
            .unwrap();
    }

    #[test]
    fn failed_rename_does_not_pin_the_record() {
        let fx = fixture();
        let n = name(b'r', 300);
        let digest = Digest::of(n.as_bytes());
        fx.mkdir("/", OsStr::new("a")).unwrap();
        fx.mkdir("/", OsStr::new("b")).unwrap();

        let err = fx
            .mount
            .dispatch(FsOp::Rename {
                from_parent: OsStr::new("/"),
                from_name: OsStr::new("missing"),
                to_parent: OsStr::new("/a"),
                to_name: &n,
            })
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);

        fx.create("/b", &n).unwrap();
        assert_eq!(fx.mount.translator().store().attachment_count(&digest), 1);
        fx.mount
            .dispatch(FsOp::Unlink {
                parent: OsStr::new("/b"),
                name: &n,
            })
            .unwrap();
        assert!(fx.mount.translator().store().get(&digest).is_none());
        assert_eq!(fx.mount.translator().store().attachment_count(&digest), 0);
    }

    #[test]
    fn failed_create_keeps_only_real_attachments() {
        let fx = fixture();
        let n = name(b'e', 300);
        let digest = Digest::of(n.as_bytes());
        fx.mkdir("/", OsStr::new("a")).unwrap();

        // A directory node cannot be made through mknod.
        let err = fx
            .mount
            .dispatch(FsOp::MkNod {
                parent: OsStr::new("/a"),
                name: &n,
                mode: libc::S_IFDIR | 0o755,
                rdev: 0,
                caller: CALLER,
            })
            .unwrap_err();
        assert_ne!(err.errno(), 0);
        assert_eq!(fx.mount.translator().store().attachment_count(&digest), 0);

        fx.create("/", &n).unwrap();
        let again = fx.create("/", &n).unwrap_err();
        assert_eq!(again.errno(), libc::EEXIST);
        assert_eq!(fx.mount.translator().store().attachment_count(&digest), 1);

        fx.mount
            .dispatch(FsOp::Unlink {
                parent: OsStr::new("/"),
                name: &n,
            })
            .unwrap();
        assert!(fx.mount.translator().store().get(&digest).is_none());
    }

    #[test]
    fn lookup_after_unlink_does_not_restore_record() {
        let fx = fixture();
        let n = name(b'g', 300);
        let digest = Digest::of(n.as_bytes());
        fx.create("/", &n).unwrap();
        fx.mount
            .dispatch(FsOp::Unlink {
                parent: OsStr::new("/"),
                name: &n,
            })
            .unwrap();

        let err = fx
            .mount
            .dispatch(FsOp::Lookup {
                parent: OsStr::new("/"),
                name: &n,
            })
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        assert!(fx.mount.translator().store().get(&digest).is_none());
        assert_eq!(fx.mount.translator().store().attachment_count(&digest), 0);
    }

    #[test]
    fn lookups_racing_an_unlink_leave_no_record() {
        let fx = Arc::new(fixture());
        let n = name(b'k', 300);
        let digest = Digest::of(n.as_bytes());

        for _ in 0..20 {
            fx.create("/", &n).unwrap();
            let looker = {
                let fx = fx.clone();
                let n = n.clone();
                thread::spawn(move || {
                    while fx
                        .mount
                        .dispatch(FsOp::Lookup {
                            parent: OsStr::new("/"),
                            name: &n,
                        })
                        .is_ok()
                    {}
                })
            };
            fx.mount
                .dispatch(FsOp::Unlink {
                    parent: OsStr::new("/"),
                    name: &n,
                })
                .unwrap();
            looker.join().unwrap();

            assert!(fx.mount.translator().store().get(&digest).is_none());
            assert_eq!(fx.mount.translator().store().attachment_count(&digest), 0);
        }
    }

    #[test]
    fn rename_onto_itself_needs_an_existing_source() {
        let fx = fixture();
        let err = fx
            .mount
            .dispatch(FsOp::Rename {
                from_parent: OsStr::new("/"),
                from_name: OsStr::new("ghost"),
                to_parent: OsStr::new("/"),
                to_name: OsStr::new("ghost"),
            })
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);

        fx.create("/", OsStr::new("here")).unwrap();
        fx.mount
            .dispatch(FsOp::Rename {
                from_parent: OsStr::new("/"),
                from_name: OsStr::new("here"),
                to_parent: OsStr::new("/"),
                to_name: OsStr::new("here"),
            })
            .unwrap();
    }

    #[test]
    fn removing_an_orphan_stops_tracking_it() {
        let fx = fixture();
        let n = name(b'f', 300);
        let digest = Digest::of(n.as_bytes());
        fx.create("/", &n).unwrap();
        fx.mount.translator().store().delete(&digest).unwrap();

        let raw = OsString::from(alias::encode(&digest));
        fx.list(OsStr::new("/"));
        assert!(fx.mount.translator().is_unresolved(&digest));

        fx.mount
            .dispatch(FsOp::Unlink {
                parent: OsStr::new("/"),
                name: &raw,
            })
            .unwrap();
        assert!(!fx.mount.translator().is_unresolved(&digest));
    }
}
