// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::io;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while configuring, mounting or serving a path-mapped tree.
#[derive(Diagnostic, Debug, Error)]
pub enum Error {
    #[error("Invalid mount configuration")]
    #[diagnostic(code("pathbridge::config"))]
    Config(#[from] ConfigError),

    #[error("Failed to mount filesystem at {}", mountpoint.display())]
    #[diagnostic(
        code("pathbridge::mount"),
        help(
            "Check that /dev/fuse exists, that fusermount is installed, and that you may mount over the target directory"
        )
    )]
    Mount {
        mountpoint: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{op} failed: {}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Translation skipped for {}: {reason}", path.display())]
    Degraded { path: PathBuf, reason: String },

    #[error("{} would grow to {size} bytes, past the {limit} byte translation limit", path.display())]
    #[diagnostic(code("pathbridge::too_large"))]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("Failed to write back {}, original content was kept", path.display())]
    #[diagnostic(code("pathbridge::flush"))]
    Flush {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Rejections raised while resolving a mount configuration.
///
/// All of these are fatal and are reported before any mount is attempted.
#[derive(Diagnostic, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No source directory was given")]
    #[diagnostic(help("Pass -o source=<dir>"))]
    MissingSource,
    #[error("Source directory does not exist: {0}")]
    SourceNotFound(PathBuf),
    #[error("Source is not a directory: {0}")]
    SourceNotDirectory(PathBuf),
    #[error("Malformed mapping entry '{0}', expected from=to")]
    MalformedRule(String),
    #[error("Rule maps '{0}' onto itself")]
    ReflexiveRule(String),
    #[error("Ambiguous mapping: '{from}' maps to both '{first}' and '{second}'")]
    AmbiguousMapping {
        from: String,
        first: String,
        second: String,
    },
    #[error("Overlapping rule: '{to}' is a substring of '{from}'")]
    OverlappingRule { to: String, from: String },
    #[error("Ambiguous directory mapping: '{segment}' is claimed by both '{first}' and '{second}'")]
    AmbiguousDirMapping {
        segment: String,
        first: String,
        second: String,
    },
    #[error("Invalid directory segment '{0}'")]
    InvalidSegment(String),
    #[error("No eligible extensions were given")]
    EmptyExtensions,
    #[error("Invalid trace level '{0}'")]
    InvalidTraceLevel(String),
    #[error("Invalid size threshold '{0}'")]
    InvalidSizeThreshold(String),
    #[error("Unsupported mount option '{0}'")]
    UnknownOption(String),
    #[error("Failed to read environment: {0}")]
    Environment(String),
}

/// Conversion of an error into the errno reported to the kernel.
pub trait OsError {
    /// The errno this error should surface as, if any
    fn os_error(&self) -> Option<i32>;
}

impl OsError for io::Error {
    fn os_error(&self) -> Option<i32> {
        if let Some(errno) = self.raw_os_error() {
            return Some(errno);
        }
        let errno = match self.kind() {
            io::ErrorKind::NotFound => libc::ENOENT,
            io::ErrorKind::PermissionDenied => libc::EACCES,
            io::ErrorKind::AlreadyExists => libc::EEXIST,
            io::ErrorKind::StorageFull => libc::ENOSPC,
            io::ErrorKind::NotADirectory => libc::ENOTDIR,
            io::ErrorKind::IsADirectory => libc::EISDIR,
            io::ErrorKind::DirectoryNotEmpty => libc::ENOTEMPTY,
            io::ErrorKind::InvalidInput => libc::EINVAL,
            io::ErrorKind::UnexpectedEof => libc::EIO,
            _ => return None,
        };
        Some(errno)
    }
}

impl OsError for Error {
    fn os_error(&self) -> Option<i32> {
        match self {
            Error::Config(_) => Some(libc::EINVAL),
            Error::Mount { source, .. } => source.os_error(),
            Error::Io { source, .. } => source.os_error(),
            Error::Degraded { .. } => None,
            Error::TooLarge { .. } => Some(libc::EFBIG),
            Error::Flush { source, .. } => source.os_error().or(Some(libc::EIO)),
        }
    }
}
