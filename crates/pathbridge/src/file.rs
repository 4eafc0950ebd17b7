// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Per-handle state of files opened through the mount.
//!
//! Eligible files are buffered whole: a length-changing substitution
//! shifts every offset that follows it, so reads cannot be served from
//! the real file at the requested offset. The buffer holds the container
//! view of the content and doubles as the write buffer; it is translated
//! back and atomically written over the real file when the handle is
//! flushed or released. The buffer never grows past the configured
//! translation limit.

use std::borrow::Cow;
use std::fs::{File, Metadata};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use dashmap::DashMap;
use nix::fcntl::{Flock, FlockArg};

use crate::config::MountConfig;
use crate::error::{Error, Result};
use crate::rules::{Direction, Syntax};

#[cfg(test)]
#[path = "./file_test.rs"]
mod file_test;

/// The access requested when opening a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags {
        read: true,
        write: false,
        truncate: false,
    };

    /// Decode the access mode and truncation bits of `open(2)` flags.
    pub fn from_libc(flags: i32) -> Self {
        let (read, write) = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => (false, true),
            libc::O_RDWR => (true, true),
            _ => (true, false),
        };
        Self {
            read,
            write,
            truncate: write && flags & libc::O_TRUNC != 0,
        }
    }
}

#[derive(Debug)]
enum FileState {
    /// Served directly from the real file
    Passthrough { file: File },
    /// Served from a whole-file buffer in the container representation
    Translated {
        syntax: Syntax,
        content: Vec<u8>,
        dirty: bool,
        original_size: u64,
        limit: u64,
    },
}

/// An open file, owned by exactly one handle until it is released.
#[derive(Debug)]
pub struct OpenFile {
    real_path: PathBuf,
    state: FileState,
    /// Set once the real file was removed while this handle stayed open
    detached: bool,
}

impl OpenFile {
    /// Open the real file at `real_path` with the given access.
    pub fn open(
        config: &MountConfig,
        cache: &TranslationCache,
        real_path: PathBuf,
        flags: OpenFlags,
    ) -> Result<Self> {
        let Some(syntax) = config.eligibility(&real_path) else {
            return Self::open_passthrough(real_path, flags);
        };
        if config.rules().is_empty() {
            return Self::open_passthrough(real_path, flags);
        }

        let metadata =
            std::fs::metadata(&real_path).map_err(|err| Error::io("stat", &real_path, err))?;
        if !metadata.is_file() {
            return Self::open_passthrough(real_path, flags);
        }
        if flags.write {
            // the buffer is written back later, refuse up front
            std::fs::OpenOptions::new()
                .write(true)
                .open(&real_path)
                .map_err(|err| Error::io("open", &real_path, err))?;
        }
        if flags.truncate {
            return Ok(Self {
                real_path,
                state: FileState::Translated {
                    syntax,
                    content: Vec::new(),
                    dirty: true,
                    original_size: metadata.len(),
                    limit: config.max_translated_size(),
                },
                detached: false,
            });
        }
        if metadata.len() > config.max_translated_size() {
            let err = Error::Degraded {
                path: real_path.clone(),
                reason: format!(
                    "{} bytes exceeds the translation limit of {}",
                    metadata.len(),
                    config.max_translated_size()
                ),
            };
            tracing::warn!("{err}");
            return Self::open_passthrough(real_path, flags);
        }

        let raw = std::fs::read(&real_path).map_err(|err| Error::io("read", &real_path, err))?;
        let content = translate_content(
            config,
            &real_path,
            Direction::HostToContainer,
            syntax,
            &raw,
        )
        .into_owned();
        cache.insert(&real_path, &metadata, content.len() as u64);
        tracing::trace!(
            path = %real_path.display(),
            original = raw.len(),
            translated = content.len(),
            "buffered"
        );
        Ok(Self {
            real_path,
            state: FileState::Translated {
                syntax,
                content,
                dirty: false,
                original_size: metadata.len(),
                limit: config.max_translated_size(),
            },
            detached: false,
        })
    }

    /// Create a new, empty real file and open it for writing.
    pub fn create(config: &MountConfig, real_path: PathBuf, mode: u32) -> Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&real_path)
            .map_err(|err| Error::io("create", &real_path, err))?;
        let eligibility = config
            .eligibility(&real_path)
            .filter(|_| !config.rules().is_empty());
        let state = match eligibility {
            Some(syntax) => FileState::Translated {
                syntax,
                content: Vec::new(),
                dirty: false,
                original_size: 0,
                limit: config.max_translated_size(),
            },
            None => FileState::Passthrough { file },
        };
        Ok(Self {
            real_path,
            state,
            detached: false,
        })
    }

    fn open_passthrough(real_path: PathBuf, flags: OpenFlags) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(flags.read)
            .write(flags.write)
            .truncate(flags.truncate)
            .open(&real_path)
            .map_err(|err| Error::io("open", &real_path, err))?;
        Ok(Self {
            real_path,
            state: FileState::Passthrough { file },
            detached: false,
        })
    }

    pub fn real_path(&self) -> &Path {
        &self.real_path
    }

    /// Follow the real file to a new location after it was renamed.
    pub fn set_real_path(&mut self, real_path: PathBuf) {
        self.real_path = real_path;
    }

    /// Stop writing this file back, because the real file was removed.
    ///
    /// Reads and writes keep working on the buffer, as they would on an
    /// unlinked but still open file.
    pub fn detach(&mut self) {
        self.detached = true;
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// True if reads and writes are translated through a buffer
    pub fn is_translated(&self) -> bool {
        matches!(self.state, FileState::Translated { .. })
    }

    /// True if the buffer holds changes that were not yet written back
    pub fn is_dirty(&self) -> bool {
        matches!(self.state, FileState::Translated { dirty: true, .. })
    }

    /// The size of the real file when this handle was opened, if buffered
    pub fn original_size(&self) -> Option<u64> {
        match &self.state {
            FileState::Translated { original_size, .. } => Some(*original_size),
            FileState::Passthrough { .. } => None,
        }
    }

    /// The size of this file as seen through the mount.
    pub fn size(&self) -> Result<u64> {
        match &self.state {
            FileState::Translated { content, .. } => Ok(content.len() as u64),
            FileState::Passthrough { file } => file
                .metadata()
                .map(|m| m.len())
                .map_err(|err| Error::io("stat", &self.real_path, err)),
        }
    }

    /// Read up to `size` bytes at `offset`; empty when out of range.
    pub fn read(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        match &self.state {
            FileState::Translated { content, .. } => {
                let len = content.len() as u64;
                if offset >= len {
                    return Ok(Vec::new());
                }
                let start = offset as usize;
                let end = content.len().min(start.saturating_add(size));
                Ok(content[start..end].to_vec())
            }
            FileState::Passthrough { file } => {
                let mut buf = vec![0; size];
                let mut consumed = 0;
                while consumed < size {
                    let count = file
                        .read_at(&mut buf[consumed..], offset + consumed as u64)
                        .map_err(|err| Error::io("read", &self.real_path, err))?;
                    if count == 0 {
                        // the end of the file has been reached
                        break;
                    }
                    consumed += count;
                }
                buf.truncate(consumed);
                Ok(buf)
            }
        }
    }

    /// Write `data` at `offset`, zero-filling any gap.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        match &mut self.state {
            FileState::Translated {
                content,
                dirty,
                limit,
                ..
            } => {
                let (start, end) = offset
                    .checked_add(data.len() as u64)
                    .and_then(|end| buffer_range(offset, end, *limit))
                    .ok_or_else(|| Error::TooLarge {
                        path: self.real_path.clone(),
                        size: offset.saturating_add(data.len() as u64),
                        limit: *limit,
                    })?;
                if content.len() < end {
                    content.resize(end, 0);
                }
                content[start..end].copy_from_slice(data);
                *dirty = true;
                Ok(data.len())
            }
            FileState::Passthrough { file } => {
                file.write_all_at(data, offset)
                    .map_err(|err| Error::io("write", &self.real_path, err))?;
                Ok(data.len())
            }
        }
    }

    /// Truncate or extend the file to `size` bytes.
    pub fn set_len(&mut self, size: u64) -> Result<()> {
        match &mut self.state {
            FileState::Translated {
                content,
                dirty,
                limit,
                ..
            } => {
                let (_, end) =
                    buffer_range(0, size, *limit).ok_or_else(|| Error::TooLarge {
                        path: self.real_path.clone(),
                        size,
                        limit: *limit,
                    })?;
                content.resize(end, 0);
                *dirty = true;
                Ok(())
            }
            FileState::Passthrough { file } => file
                .set_len(size)
                .map_err(|err| Error::io("truncate", &self.real_path, err)),
        }
    }

    /// Persist any buffered changes to the real file.
    ///
    /// The buffer stays usable and clean afterwards.
    pub fn sync(&mut self, config: &MountConfig, cache: &TranslationCache) -> Result<()> {
        match &mut self.state {
            FileState::Translated {
                syntax,
                content,
                dirty,
                original_size,
                ..
            } => {
                if !*dirty {
                    return Ok(());
                }
                if self.detached {
                    tracing::debug!(
                        path = %self.real_path.display(),
                        "discarding changes to removed file"
                    );
                    *dirty = false;
                    return Ok(());
                }
                let host = translate_content(
                    config,
                    &self.real_path,
                    Direction::ContainerToHost,
                    *syntax,
                    content,
                );
                cache.invalidate(&self.real_path);
                if let Err(source) = replace_contents(&self.real_path, &host) {
                    let err = Error::Flush {
                        path: self.real_path.clone(),
                        source,
                    };
                    tracing::error!(?err, "{err}");
                    return Err(err);
                }
                tracing::debug!(
                    path = %self.real_path.display(),
                    before = *original_size,
                    after = host.len(),
                    "wrote back"
                );
                *original_size = host.len() as u64;
                *dirty = false;
                Ok(())
            }
            FileState::Passthrough { file } => file
                .sync_all()
                .map_err(|err| Error::io("fsync", &self.real_path, err)),
        }
    }

    /// Close this file, writing back any buffered changes.
    ///
    /// The file is consumed either way; a failed write back leaves
    /// the real file as it was before.
    pub fn release(mut self, config: &MountConfig, cache: &TranslationCache) -> Result<()> {
        match &self.state {
            FileState::Translated { dirty: true, .. } => self.sync(config, cache),
            _ => Ok(()),
        }
    }
}

/// The buffer indices for `start..end`, if `end` stays within `limit`.
fn buffer_range(start: u64, end: u64, limit: u64) -> Option<(usize, usize)> {
    if end > limit {
        return None;
    }
    Some((usize::try_from(start).ok()?, usize::try_from(end).ok()?))
}

/// Translate `input`, falling back to the untouched input if the result
/// would break json content that was well-formed beforehand.
pub fn translate_content<'a>(
    config: &MountConfig,
    path: &Path,
    direction: Direction,
    syntax: Syntax,
    input: &'a [u8],
) -> Cow<'a, [u8]> {
    let output = config.rules().translate(direction, syntax, input);
    if syntax == Syntax::Json
        && matches!(output, Cow::Owned(_))
        && is_well_formed_json(input)
        && !is_well_formed_json(&output)
    {
        let err = Error::Degraded {
            path: path.to_owned(),
            reason: format!("translating {direction:?} would corrupt json content"),
        };
        tracing::warn!("{err}");
        return Cow::Borrowed(input);
    }
    output
}

/// True for a single json document, or for content where
/// every non-blank line is a json document.
pub fn is_well_formed_json(content: &[u8]) -> bool {
    fn parses(bytes: &[u8]) -> bool {
        serde_json::from_slice::<serde::de::IgnoredAny>(bytes).is_ok()
    }
    if parses(content) {
        return true;
    }
    let mut lines = content
        .split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .peekable();
    lines.peek().is_some() && lines.all(parses)
}

/// Atomically replace the content of the file at `path`.
pub(crate) fn replace_contents(path: &Path, content: &[u8]) -> io::Result<()> {
    replace_contents_with(path, |file| file.write_all(content))
}

/// Replace the file at `path` with whatever `write` puts into a
/// temporary sibling file.
///
/// An exclusive advisory lock is held on the target for the duration,
/// and the target is only replaced once the sibling was fully written.
/// The target must exist; a file that vanished is never recreated.
pub(crate) fn replace_contents_with<F>(path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let target = File::open(path)?;
    let permissions = target.metadata()?.permissions();
    // unlocked when dropped, on every return path
    let _lock = Flock::lock(target, FlockArg::LockExclusive)
        .map_err(|(_, errno)| io::Error::from(errno))?;

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = tempfile::Builder::new()
        .prefix(".pathbridge-")
        .tempfile_in(parent)?;
    write(temp.as_file_mut())?;
    temp.as_file().set_permissions(permissions)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct CachedSize {
    modified: Option<SystemTime>,
    real_size: u64,
    translated_size: u64,
}

/// Remembers the translated size of eligible files so that attribute
/// queries do not need to re-read and translate unchanged files.
#[derive(Debug, Default)]
pub struct TranslationCache {
    sizes: DashMap<PathBuf, CachedSize>,
}

impl TranslationCache {
    /// The translated size recorded for this generation of the file
    pub fn get(&self, path: &Path, metadata: &Metadata) -> Option<u64> {
        let cached = *self.sizes.get(path)?;
        if cached.modified == metadata.modified().ok() && cached.real_size == metadata.len() {
            Some(cached.translated_size)
        } else {
            self.sizes.remove(path);
            None
        }
    }

    pub fn insert(&self, path: &Path, metadata: &Metadata, translated_size: u64) {
        self.sizes.insert(
            path.to_owned(),
            CachedSize {
                modified: metadata.modified().ok(),
                real_size: metadata.len(),
                translated_size,
            },
        );
    }

    pub fn invalidate(&self, path: &Path) {
        self.sizes.remove(path);
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

/// The size of the real file at `path` as it appears through the mount.
///
/// Eligible files are translated (or found in the cache) to learn their
/// size; any failure to do so reports the real size instead.
pub fn apparent_size(
    config: &MountConfig,
    cache: &TranslationCache,
    path: &Path,
    metadata: &Metadata,
) -> u64 {
    if !metadata.is_file() || metadata.len() > config.max_translated_size() {
        return metadata.len();
    }
    let Some(syntax) = config.eligibility(path) else {
        return metadata.len();
    };
    if config.rules().is_empty() {
        return metadata.len();
    }
    if let Some(size) = cache.get(path, metadata) {
        return size;
    }
    match std::fs::read(path) {
        Ok(raw) => {
            let size =
                translate_content(config, path, Direction::HostToContainer, syntax, &raw).len()
                    as u64;
            cache.insert(path, metadata, size);
            size
        }
        Err(err) => {
            tracing::debug!(path = %path.display(), ?err, "could not compute translated size");
            metadata.len()
        }
    }
}
