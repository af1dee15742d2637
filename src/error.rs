//! Error types shared across the crate.
//!
//! Kept as several small `thiserror` types instead of one flat enum:
//! [`ProbeError`] and [`DreError`] are call-site specific and convert into
//! [`FsError`] at the boundary where the rest of the filesystem only cares
//! about the `spec.md` §7 error kinds.

use thiserror::Error;

/// Errors the process probe can report for a single `probe(pid)` call.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no such process")]
    NotFound,
    #[error("permission denied reading process metadata")]
    Denied,
    #[error("i/o error probing process: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the deferred removal engine's own lifecycle API (`start`,
/// `stop`). Never surfaced through the VFS path.
#[derive(Debug, Error)]
pub enum DreError {
    #[error("deferred removal engine is already running")]
    AlreadyRunning,
    #[error("deferred removal engine is not running")]
    NotRunning,
}

/// The error kinds surfaced to the VFS kernel (`spec.md` §7), translated to
/// `errno` at the `fuser` boundary in [`crate::fuse_adapter`].
#[derive(Debug, Error)]
pub enum FsError {
    /// Entry absent, or declared invalid by this call.
    #[error("no such entry")]
    NoEntry,
    /// Allocation failed.
    #[error("out of memory")]
    NoMem,
    /// The process probe failed transiently.
    #[error("i/o error")]
    Io,
    /// Cannot read process metadata.
    #[error("permission denied")]
    Denied,
    /// Should-never-happen internal consistency failure.
    #[error("internal consistency failure (missing record on initialized entry)")]
    Nosys,
    /// Misuse of an engine API; never reached via the VFS path.
    #[error("invalid argument")]
    Invalid,
    /// `rmdir` on a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,
}

impl FsError {
    /// Maps a [`FsError`] to the `errno` value `fuser` expects from a
    /// `reply.error(..)` call.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            FsError::NoEntry => libc::ENOENT,
            FsError::NoMem => libc::ENOMEM,
            FsError::Io => libc::EIO,
            FsError::Denied => libc::EACCES,
            FsError::Nosys => libc::ENOSYS,
            FsError::Invalid => libc::EINVAL,
            FsError::NotEmpty => libc::ENOTEMPTY,
        }
    }
}

/// `probe()` failures other than "process doesn't exist" are downgraded to
/// `INVALID` by [`crate::inode::InodeRecord::is_valid`], per `spec.md` §7's
/// propagation policy; this conversion exists for call sites (like
/// `create`/`mkdir`/`mknod`) where a probe failure is a hard error instead.
impl From<ProbeError> for FsError {
    fn from(e: ProbeError) -> Self {
        match e {
            ProbeError::NotFound => FsError::NoEntry,
            ProbeError::Denied => FsError::Denied,
            ProbeError::Io(_) => FsError::Io,
        }
    }
}
