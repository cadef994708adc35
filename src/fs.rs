use crate::error::CoreError;
use crate::handle_table::{HandleKind, HandleTable, OpenHandle};
use crate::listing::DirEntryInfo;
use crate::ops::{AttrChanges, Caller, FsOp, FsReply, Mount};
use crate::util::{file_attr_from_stat, retry_eintr};
use bytes::Bytes;
use fuse3::notify::Notify;
use fuse3::path::prelude::*;
use fuse3::path::reply::{DirectoryEntryPlus, ReplyPoll, ReplyXAttr};
use fuse3::{FileType, SetAttr};
use nix::sys::stat::fstat;
use nix::sys::time::TimeSpec;
use nix::sys::uio::{pread, pwrite};
use nix::unistd::{fdatasync, fsync};
use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::num::NonZeroU32;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const ATTR_TTL: Duration = Duration::from_secs(1);
const MIN_WRITE: u32 = 4096;

type FsResult<T> = Result<T, fuse3::Errno>;

fn xattr_name_to_cstring(name: &OsStr) -> FsResult<CString> {
    CString::new(name.as_bytes()).map_err(|_| fuse3::Errno::from(libc::EINVAL))
}

fn last_errno() -> fuse3::Errno {
    io::Error::last_os_error().into()
}

fn caller(req: &Request) -> Caller {
    Caller {
        uid: req.uid,
        gid: req.gid,
    }
}

fn time_spec(time: fuse3::Timestamp) -> TimeSpec {
    TimeSpec::new(time.sec, time.nsec as _)
}

fn entry_reply(reply: FsReply) -> FsResult<ReplyEntry> {
    match reply {
        FsReply::Attr(attr) => Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr,
        }),
        _ => Err(fuse3::Errno::from(libc::EIO)),
    }
}

/// FUSE binding over [`Mount`]. Name-bearing calls go through the
/// dispatcher, fd-level calls act on the open handle.
pub struct LongNameFs {
    mount: Mount,
    handles: HandleTable,
    max_write: NonZeroU32,
}

impl LongNameFs {
    pub fn new(mount: Mount, max_write_kb: u32) -> Self {
        let bytes = max_write_kb.saturating_mul(1024).max(MIN_WRITE);
        Self {
            mount,
            handles: HandleTable::new(),
            max_write: NonZeroU32::new(bytes).unwrap_or(NonZeroU32::MIN),
        }
    }

    fn dispatch(&self, op: FsOp<'_>) -> FsResult<FsReply> {
        self.mount.dispatch(op).map_err(|err| {
            debug!(error = %err, "operation failed");
            fuse3::Errno::from(err)
        })
    }

    fn file_fd(&self, fh: u64) -> FsResult<OpenHandle> {
        Ok(self.handles.get(fh, HandleKind::File)?)
    }

    fn dir_fd(&self, fh: u64) -> FsResult<OpenHandle> {
        Ok(self.handles.get(fh, HandleKind::Dir)?)
    }

    fn sync_fd(fd: BorrowedFd<'_>, datasync: bool) -> FsResult<()> {
        let res = if datasync { fdatasync(fd) } else { fsync(fd) };
        res.map_err(|err| CoreError::from(err).into())
    }

    fn with_xattr_target<F, T>(&self, path: &OsStr, func: F) -> FsResult<T>
    where
        F: FnOnce(BorrowedFd<'_>) -> FsResult<T>,
    {
        let fd = self.mount.open_xattr_target(path)?;
        func(fd.as_fd())
    }

    fn load_entries(&self, fh: u64) -> FsResult<(OpenHandle, Arc<Vec<DirEntryInfo>>)> {
        let handle = self.dir_fd(fh)?;
        match self.dispatch(FsOp::ReadDir { dir: handle.as_fd() })? {
            FsReply::Entries(entries) => Ok((handle, entries)),
            _ => Err(fuse3::Errno::from(libc::EIO)),
        }
    }
}

impl PathFilesystem for LongNameFs {
    async fn init(&self, _req: Request) -> FsResult<ReplyInit> {
        info!(
            backend = %self.mount.config().backend_path.display(),
            threshold = self.mount.translator().threshold(),
            records = self.mount.translator().store().len(),
            "filesystem initialised"
        );
        Ok(ReplyInit {
            max_write: self.max_write,
        })
    }

    async fn destroy(&self, _req: Request) {
        let (hits, misses) = self.mount.dir_cache().stats();
        info!(
            dir_cache_hits = hits,
            dir_cache_misses = misses,
            open_handles = self.handles.len(),
            "filesystem released"
        );
    }

    async fn lookup(&self, _req: Request, parent: &OsStr, name: &OsStr) -> FsResult<ReplyEntry> {
        entry_reply(self.dispatch(FsOp::Lookup { parent, name })?)
    }

    async fn getattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        _flags: u32,
    ) -> FsResult<ReplyAttr> {
        if let Some(handle) = fh.and_then(|id| self.handles.get(id, HandleKind::File).ok()) {
            let stat = fstat(handle.as_fd()).map_err(CoreError::from)?;
            return Ok(ReplyAttr {
                ttl: ATTR_TTL,
                attr: file_attr_from_stat(&stat),
            });
        }

        let path = path.ok_or(CoreError::NotFound)?;
        match self.dispatch(FsOp::GetAttr { path })? {
            FsReply::Attr(attr) => Ok(ReplyAttr {
                ttl: ATTR_TTL,
                attr,
            }),
            _ => Err(fuse3::Errno::from(libc::EIO)),
        }
    }

    async fn setattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FsResult<ReplyAttr> {
        let Some(path) = path else {
            // Unlinked but still open: only the size can be changed via the handle.
            let handle = self.file_fd(fh.ok_or(CoreError::NotFound)?)?;
            if let Some(size) = set_attr.size {
                nix::unistd::ftruncate(handle.as_fd(), size as i64).map_err(CoreError::from)?;
            }
            let stat = fstat(handle.as_fd()).map_err(CoreError::from)?;
            return Ok(ReplyAttr {
                ttl: ATTR_TTL,
                attr: file_attr_from_stat(&stat),
            });
        };

        let changes = AttrChanges {
            mode: set_attr.mode,
            uid: set_attr.uid,
            gid: set_attr.gid,
            size: set_attr.size,
            atime: set_attr.atime.map(time_spec),
            mtime: set_attr.mtime.map(time_spec),
        };
        match self.dispatch(FsOp::SetAttr { path, changes })? {
            FsReply::Attr(attr) => Ok(ReplyAttr {
                ttl: ATTR_TTL,
                attr,
            }),
            _ => Err(fuse3::Errno::from(libc::EIO)),
        }
    }

    async fn readlink(&self, _req: Request, path: &OsStr) -> FsResult<ReplyData> {
        match self.dispatch(FsOp::ReadLink { path })? {
            FsReply::Target(target) => Ok(Bytes::from(target.into_vec()).into()),
            _ => Err(fuse3::Errno::from(libc::EIO)),
        }
    }

    async fn symlink(
        &self,
        req: Request,
        parent: &OsStr,
        name: &OsStr,
        link_path: &OsStr,
    ) -> FsResult<ReplyEntry> {
        entry_reply(self.dispatch(FsOp::Symlink {
            parent,
            name,
            target: link_path,
            caller: caller(&req),
        })?)
    }

    async fn mknod(
        &self,
        req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> FsResult<ReplyEntry> {
        entry_reply(self.dispatch(FsOp::MkNod {
            parent,
            name,
            mode,
            rdev,
            caller: caller(&req),
        })?)
    }

    async fn mkdir(
        &self,
        req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> FsResult<ReplyEntry> {
        entry_reply(self.dispatch(FsOp::MkDir {
            parent,
            name,
            mode,
            umask,
            caller: caller(&req),
        })?)
    }

    async fn unlink(&self, _req: Request, parent: &OsStr, name: &OsStr) -> FsResult<()> {
        self.dispatch(FsOp::Unlink { parent, name })?;
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: &OsStr, name: &OsStr) -> FsResult<()> {
        self.dispatch(FsOp::RmDir { parent, name })?;
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        origin_parent: &OsStr,
        origin_name: &OsStr,
        parent: &OsStr,
        name: &OsStr,
    ) -> FsResult<()> {
        self.dispatch(FsOp::Rename {
            from_parent: origin_parent,
            from_name: origin_name,
            to_parent: parent,
            to_name: name,
        })?;
        Ok(())
    }

    async fn link(
        &self,
        _req: Request,
        path: &OsStr,
        new_parent: &OsStr,
        new_name: &OsStr,
    ) -> FsResult<ReplyEntry> {
        entry_reply(self.dispatch(FsOp::Link {
            path,
            new_parent,
            new_name,
        })?)
    }

    async fn open(&self, _req: Request, path: &OsStr, flags: u32) -> FsResult<ReplyOpen> {
        match self.dispatch(FsOp::Open { path, flags })? {
            FsReply::Opened(fd) => Ok(ReplyOpen {
                fh: self.handles.insert(HandleKind::File, fd),
                flags: 0,
            }),
            _ => Err(fuse3::Errno::from(libc::EIO)),
        }
    }

    async fn read(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FsResult<ReplyData> {
        let handle = self.file_fd(fh)?;
        let mut buf = vec![0u8; size as usize];
        let read_len = retry_eintr(|| pread(handle.as_fd(), &mut buf, offset as i64))
            .map_err(CoreError::from)?;
        buf.truncate(read_len);
        Ok(Bytes::from(buf).into())
    }

    async fn write(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FsResult<ReplyWrite> {
        let handle = self.file_fd(fh)?;
        let written = retry_eintr(|| pwrite(handle.as_fd(), data, offset as i64))
            .map_err(CoreError::from)?;
        if self.mount.config().sync_data() {
            Self::sync_fd(handle.as_fd(), true)?;
        }
        Ok(ReplyWrite {
            written: written as u32,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FsResult<()> {
        self.handles.remove(fh);
        Ok(())
    }

    async fn fsync(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        datasync: bool,
    ) -> FsResult<()> {
        let handle = self.file_fd(fh)?;
        Self::sync_fd(handle.as_fd(), datasync)
    }

    async fn setxattr(
        &self,
        _req: Request,
        path: &OsStr,
        name: &OsStr,
        value: &[u8],
        flags: u32,
        position: u32,
    ) -> FsResult<()> {
        if position != 0 {
            return Err(fuse3::Errno::from(libc::EINVAL));
        }
        let name = xattr_name_to_cstring(name)?;
        self.with_xattr_target(path, |fd| {
            let res = unsafe {
                libc::fsetxattr(
                    fd.as_raw_fd(),
                    name.as_ptr(),
                    value.as_ptr() as *const libc::c_void,
                    value.len(),
                    flags as libc::c_int,
                )
            };
            if res < 0 {
                return Err(last_errno());
            }
            Ok(())
        })
    }

    async fn getxattr(
        &self,
        _req: Request,
        path: &OsStr,
        name: &OsStr,
        size: u32,
    ) -> FsResult<ReplyXAttr> {
        let name = xattr_name_to_cstring(name)?;
        self.with_xattr_target(path, |fd| {
            let mut buf = vec![0u8; size as usize];
            let (ptr, len) = if size == 0 {
                (std::ptr::null_mut(), 0)
            } else {
                (buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            let res = unsafe { libc::fgetxattr(fd.as_raw_fd(), name.as_ptr(), ptr, len) };
            if res < 0 {
                return Err(last_errno());
            }
            if size == 0 {
                return Ok(ReplyXAttr::Size(res as u32));
            }
            buf.truncate(res as usize);
            Ok(ReplyXAttr::Data(buf.into()))
        })
    }

    async fn listxattr(&self, _req: Request, path: &OsStr, size: u32) -> FsResult<ReplyXAttr> {
        self.with_xattr_target(path, |fd| {
            let mut buf = vec![0u8; size as usize];
            let (ptr, len) = if size == 0 {
                (std::ptr::null_mut(), 0)
            } else {
                (buf.as_mut_ptr() as *mut libc::c_char, buf.len())
            };
            let res = unsafe { libc::flistxattr(fd.as_raw_fd(), ptr, len) };
            if res < 0 {
                return Err(last_errno());
            }
            if size == 0 {
                return Ok(ReplyXAttr::Size(res as u32));
            }
            buf.truncate(res as usize);
            Ok(ReplyXAttr::Data(buf.into()))
        })
    }

    async fn removexattr(&self, _req: Request, path: &OsStr, name: &OsStr) -> FsResult<()> {
        let name = xattr_name_to_cstring(name)?;
        self.with_xattr_target(path, |fd| {
            let res = unsafe { libc::fremovexattr(fd.as_raw_fd(), name.as_ptr()) };
            if res < 0 {
                return Err(last_errno());
            }
            Ok(())
        })
    }

    async fn flush(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _lock_owner: u64,
    ) -> FsResult<()> {
        self.file_fd(fh)?;
        Ok(())
    }

    async fn access(&self, _req: Request, path: &OsStr, mask: u32) -> FsResult<()> {
        self.dispatch(FsOp::Access { path, mask })?;
        Ok(())
    }

    async fn create(
        &self,
        req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FsResult<ReplyCreated> {
        match self.dispatch(FsOp::Create {
            parent,
            name,
            mode,
            flags,
            caller: caller(&req),
        })? {
            FsReply::Created { fd, attr } => Ok(ReplyCreated {
                ttl: ATTR_TTL,
                attr,
                generation: 0,
                fh: self.handles.insert(HandleKind::File, fd),
                flags: 0,
            }),
            _ => Err(fuse3::Errno::from(libc::EIO)),
        }
    }

    async fn opendir(&self, _req: Request, path: &OsStr, flags: u32) -> FsResult<ReplyOpen> {
        match self.dispatch(FsOp::OpenDir { path })? {
            FsReply::Opened(fd) => Ok(ReplyOpen {
                fh: self.handles.insert(HandleKind::Dir, fd),
                flags,
            }),
            _ => Err(fuse3::Errno::from(libc::EIO)),
        }
    }

    type DirEntryStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
    where
        Self: 'a;
    type DirEntryPlusStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
    where
        Self: 'a;

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        _path: &'a OsStr,
        fh: u64,
        offset: i64,
    ) -> FsResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let (_, listed) = self.load_entries(fh)?;

        let dots = [".", ".."].map(|name| (OsString::from(name), FileType::Directory));
        let entries: Vec<fuse3::Result<DirectoryEntry>> = dots
            .into_iter()
            .chain(listed.iter().map(|e| (e.name.clone(), e.kind)))
            .enumerate()
            .map(|(idx, (name, kind))| {
                Ok(DirectoryEntry {
                    kind,
                    name,
                    offset: idx as i64 + 1,
                })
            })
            .skip(offset.max(0) as usize)
            .collect();
        Ok(ReplyDirectory {
            entries: futures_util::stream::iter(entries),
        })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        _parent: &'a OsStr,
        fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FsResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let (handle, listed) = self.load_entries(fh)?;
        let dir_attr = fstat(handle.as_fd())
            .map(|stat| file_attr_from_stat(&stat))
            .map_err(CoreError::from)?;

        let dots = [".", ".."].map(|name| (OsString::from(name), dir_attr));
        let entries: Vec<fuse3::Result<DirectoryEntryPlus>> = dots
            .into_iter()
            .chain(listed.iter().map(|e| (e.name.clone(), e.attr)))
            .enumerate()
            .map(|(idx, (name, attr))| {
                Ok(DirectoryEntryPlus {
                    kind: attr.kind,
                    name,
                    offset: idx as i64 + 1,
                    attr,
                    entry_ttl: ATTR_TTL,
                    attr_ttl: ATTR_TTL,
                })
            })
            .skip(offset as usize)
            .collect();
        Ok(ReplyDirectoryPlus {
            entries: futures_util::stream::iter(entries),
        })
    }

    async fn releasedir(&self, _req: Request, _path: &OsStr, fh: u64, _flags: u32) -> FsResult<()> {
        self.handles.remove(fh);
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _path: &OsStr,
        fh: u64,
        datasync: bool,
    ) -> FsResult<()> {
        let handle = self.dir_fd(fh)?;
        Self::sync_fd(handle.as_fd(), datasync)
    }

    async fn statfs(&self, _req: Request, _path: &OsStr) -> FsResult<ReplyStatFs> {
        let stats = self.mount.statfs()?;
        Ok(ReplyStatFs {
            blocks: stats.blocks(),
            bfree: stats.blocks_free(),
            bavail: stats.blocks_available(),
            files: stats.files(),
            ffree: stats.files_free(),
            bsize: stats.block_size() as u32,
            // Clients may use names up to this length regardless of the backend.
            namelen: self.mount.translator().long_name_max() as u32,
            frsize: stats.fragment_size() as u32,
        })
    }

    async fn poll(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _kn: Option<u64>,
        _flags: u32,
        _events: u32,
        _notify: &Notify,
    ) -> FsResult<ReplyPoll> {
        self.file_fd(fh)?;
        Ok(ReplyPoll { revents: 0 })
    }
}
