use crate::alias::ALIAS_LENGTH;
use crate::error::{CoreError, CoreResult};
use crate::util::{DirKey, dir_key};
use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Longest name the backing filesystem accepts.
pub const BACKING_NAME_MAX: usize = 255;
/// Longest client-visible name.
pub const LONG_NAME_MAX: usize = 4096;
/// Smallest usable threshold: an alias must itself fit under it.
pub const NAME_THRESHOLD_MIN: usize = ALIAS_LENGTH;

#[derive(Debug)]
pub struct Config {
    pub backend_path: PathBuf,
    pub backend_fd: OwnedFd,
    pub store_path: PathBuf,
    pub name_threshold: usize,
    pub sync_data: bool,
    backend_dev: u64,
}

/// `$XDG_DATA_HOME/longnamefs`, or `~/.local/share/longnamefs` when unset.
pub fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("longnamefs")
}

impl Config {
    pub fn open_backend(
        path: PathBuf,
        store_path: PathBuf,
        name_threshold: usize,
        sync_data: bool,
    ) -> CoreResult<Self> {
        if path == Path::new("/") {
            return Err(CoreError::InvalidName);
        }
        if name_threshold < NAME_THRESHOLD_MIN {
            return Err(CoreError::InvalidName);
        }
        if name_threshold > BACKING_NAME_MAX {
            return Err(CoreError::NameTooLong {
                max: BACKING_NAME_MAX,
            });
        }

        let fd = open(
            &path,
            OFlag::O_RDONLY | OFlag::O_CLOEXEC | OFlag::O_DIRECTORY,
            Mode::empty(),
        )?;
        let backend_dev = dir_key(fd.as_fd())?.dev;

        if let (Ok(backend), Ok(store)) = (path.canonicalize(), store_path.canonicalize())
            && store.starts_with(&backend)
        {
            warn!(
                store = %store.display(),
                "mapping store lives inside the backend and will show up in listings"
            );
        }

        Ok(Self {
            backend_path: path,
            backend_fd: fd,
            store_path,
            name_threshold,
            sync_data,
            backend_dev,
        })
    }

    pub fn backend_fd(&self) -> BorrowedFd<'_> {
        self.backend_fd.as_fd()
    }

    pub fn sync_data(&self) -> bool {
        self.sync_data
    }

    /// Key of a backing directory as stored in attachments. Directories on
    /// the backend's own filesystem get device 0, so their keys survive a
    /// device number change across reboots (LVM, NFS, overlay). Directories
    /// on other filesystems mounted below the backend keep their `st_dev`.
    pub fn dir_key(&self, fd: BorrowedFd<'_>) -> CoreResult<DirKey> {
        let key = dir_key(fd)?;
        if key.dev == self.backend_dev {
            return Ok(DirKey { dev: 0, ..key });
        }
        Ok(key)
    }
}
