use crate::digest::Digest;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no such entry")]
    NotFound,

    /// Two different long names produced the same digest. Never retried.
    #[error("digest {digest} is already mapped to a different name")]
    Conflict { digest: Digest },

    #[error("name is longer than {max} bytes")]
    NameTooLong { max: usize },

    #[error("invalid name")]
    InvalidName,

    #[error("name collides with the alias namespace")]
    ReservedName,

    #[error("mapping store is corrupted: {0}")]
    Corrupt(String),

    #[error("backing store: {0}")]
    Backing(#[from] nix::Error),

    #[error(transparent)]
    Io(io::Error),
}

impl CoreError {
    pub fn errno(&self) -> i32 {
        match self {
            CoreError::NotFound => libc::ENOENT,
            CoreError::Conflict { .. } | CoreError::Corrupt(_) => libc::EIO,
            CoreError::NameTooLong { .. } => libc::ENAMETOOLONG,
            CoreError::InvalidName | CoreError::ReservedName => libc::EINVAL,
            CoreError::Backing(errno) => *errno as i32,
            CoreError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.errno() == libc::ENOENT
    }
}

impl From<io::Error> for CoreError {
    fn from(value: io::Error) -> Self {
        match value.raw_os_error() {
            Some(errno) => CoreError::Backing(nix::Error::from_raw(errno)),
            None => CoreError::Io(value),
        }
    }
}

impl From<CoreError> for fuse3::Errno {
    fn from(value: CoreError) -> Self {
        fuse3::Errno::from(value.errno())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
