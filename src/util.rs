use crate::error::{CoreError, CoreResult};
use fuse3::FileType;
use fuse3::path::reply::FileAttr;
use libc;
use nix::errno::Errno as NixErrno;
use nix::fcntl::{OFlag, openat, renameat};
use nix::sys::stat::{FileStat, Mode, fstat};
use nix::unistd::fsync;
use std::ffi::{CStr, CString};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Identity of a backing directory. Stable across renames of the directory.
/// `st_dev` may change across reboots; attachments go through
/// `Config::dir_key`, which drops it for the backend's own filesystem.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct DirKey {
    pub dev: u64,
    pub ino: u64,
}

pub fn dir_key(fd: BorrowedFd<'_>) -> CoreResult<DirKey> {
    let stat = fstat(fd)?;
    Ok(DirKey {
        dev: stat.st_dev as u64,
        ino: stat.st_ino as u64,
    })
}

pub fn bytes_to_cstring(value: &[u8]) -> CoreResult<CString> {
    CString::new(value).map_err(|_| CoreError::InvalidName)
}

pub fn file_type_from_mode(mode: libc::mode_t) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn system_time_from_raw(sec: i64, nsec: i64) -> SystemTime {
    if sec < 0 {
        return UNIX_EPOCH;
    }
    let nanos = if nsec < 0 { 0 } else { nsec as u32 };
    UNIX_EPOCH + Duration::new(sec as u64, nanos)
}

pub fn file_attr_from_stat(stat: &FileStat) -> FileAttr {
    let kind = file_type_from_mode(stat.st_mode);
    let perm = fuse3::perm_from_mode_and_kind(kind, stat.st_mode as libc::mode_t);

    FileAttr {
        size: stat.st_size as u64,
        blocks: stat.st_blocks as u64,
        atime: system_time_from_raw(stat.st_atime, stat.st_atime_nsec.into()),
        mtime: system_time_from_raw(stat.st_mtime, stat.st_mtime_nsec.into()),
        ctime: system_time_from_raw(stat.st_ctime, stat.st_ctime_nsec.into()),
        kind,
        perm,
        nlink: stat.st_nlink as u32,
        uid: stat.st_uid,
        gid: stat.st_gid,
        rdev: stat.st_rdev as u32,
        blksize: stat.st_blksize as u32,
        #[cfg(target_os = "macos")]
        crtime: UNIX_EPOCH,
        #[cfg(target_os = "macos")]
        flags: 0,
    }
}

pub fn oflag_from_bits(flags: u32) -> OFlag {
    OFlag::from_bits_truncate(flags as i32)
}

pub fn access_mask_from_bits(mask: u32) -> nix::unistd::AccessFlags {
    nix::unistd::AccessFlags::from_bits_truncate(mask as i32)
}

pub fn retry_eintr<T, F>(mut op: F) -> Result<T, nix::Error>
where
    F: FnMut() -> Result<T, nix::Error>,
{
    loop {
        match op() {
            Err(err) if err == NixErrno::EINTR => continue,
            other => return other,
        }
    }
}

pub fn fsync_dir(dir_fd: BorrowedFd<'_>) -> CoreResult<()> {
    retry_eintr(|| fsync(dir_fd))?;
    Ok(())
}

#[derive(Debug)]
pub struct TempFile {
    pub fd: OwnedFd,
    pub name: CString,
}

/// Opens a scratch file next to `target` that [`sync_and_commit`] later renames
/// over it.
pub fn begin_temp_file(dir_fd: BorrowedFd<'_>, target: &CStr, tag: &str) -> CoreResult<TempFile> {
    let mut composed = Vec::with_capacity(target.to_bytes().len() + tag.len() + 16);
    composed.push(b'.');
    composed.extend_from_slice(target.to_bytes());
    composed.push(b'.');
    composed.extend_from_slice(tag.as_bytes());
    composed.extend_from_slice(format!(".{}", std::process::id()).as_bytes());
    let name = bytes_to_cstring(&composed)?;

    let fd = openat(
        dir_fd,
        name.as_c_str(),
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_CLOEXEC,
        Mode::from_bits_truncate(0o600),
    )?;
    Ok(TempFile { fd, name })
}

pub fn sync_and_commit(dir_fd: BorrowedFd<'_>, temp: TempFile, target: &CStr) -> CoreResult<()> {
    retry_eintr(|| fsync(temp.fd.as_fd()))?;
    renameat(dir_fd, temp.name.as_c_str(), dir_fd, target)?;
    fsync_dir(dir_fd)
}
