// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::ffi::OsString;

use pathbridge::OsError;
use thiserror::Error;

/// Convenience alias for results of filesystem operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors specific to fuse operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The kernel referred to an inode that was never handed out.
    #[error("Unknown inode {0}")]
    UnknownInode(u64),

    /// The kernel referred to a handle that is not open.
    #[error("Unknown handle {0}")]
    UnknownHandle(u64),

    /// A file operation was attempted on a directory handle or inode.
    #[error("Is a directory: {0}")]
    IsDirectory(u64),

    /// A directory operation was attempted on a file handle or inode.
    #[error("Not a directory: {0}")]
    NotDirectory(u64),

    /// The name is the host spelling of a renamed directory and is
    /// only reachable through its container spelling.
    #[error("Name is shadowed by a directory mapping: {0:?}")]
    Shadowed(OsString),

    /// The request carried flags that are not supported.
    #[error("Unsupported flags for {op}: {flags:#x}")]
    Unsupported {
        /// The operation that was requested
        op: &'static str,
        /// The flags that were given
        flags: u32,
    },

    /// An error from the path mapping layer.
    #[error(transparent)]
    Core(#[from] pathbridge::Error),
}

impl Error {
    /// Wrap an io error of a real filesystem call.
    pub fn io(op: &'static str, path: &std::path::Path, err: std::io::Error) -> Self {
        Self::Core(pathbridge::Error::io(op, path, err))
    }
}

impl OsError for Error {
    fn os_error(&self) -> Option<i32> {
        match self {
            Error::UnknownInode(_) => Some(libc::ENOENT),
            Error::UnknownHandle(_) => Some(libc::EBADF),
            Error::IsDirectory(_) => Some(libc::EISDIR),
            Error::NotDirectory(_) => Some(libc::ENOTDIR),
            Error::Shadowed(_) => Some(libc::ENOENT),
            Error::Unsupported { .. } => Some(libc::EINVAL),
            Error::Core(err) => err.os_error(),
        }
    }
}
