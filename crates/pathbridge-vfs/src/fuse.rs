// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::ffi::{OsStr, OsString};
use std::fs::Metadata;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fuser::{
    FileAttr,
    FileType,
    ReplyAttr,
    ReplyCreate,
    ReplyData,
    ReplyDirectory,
    ReplyEmpty,
    ReplyEntry,
    ReplyOpen,
    ReplyStatfs,
    ReplyWrite,
    Request,
    TimeOrNow,
};
use pathbridge::file::apparent_size;
use pathbridge::{MountConfig, OpenFile, OpenFlags, OsError, Tracer, TranslationCache};
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};

#[cfg(test)]
#[path = "./fuse_test.rs"]
mod fuse_test;

/// The inode of the mount root, as required by fuse
pub const ROOT_INODE: u64 = 1;

/// One name listed by [`Filesystem::readdir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// The inode that the name resolves to
    pub ino: u64,
    /// The type of file, as found on the host
    pub kind: FileType,
    /// The container spelling of the name
    pub name: OsString,
}

/// Attribute changes requested through [`Filesystem::setattr`].
#[derive(Debug, Clone, Default)]
pub struct SetAttr {
    /// New permission bits
    pub mode: Option<u32>,
    /// New owning user
    pub uid: Option<u32>,
    /// New owning group
    pub gid: Option<u32>,
    /// New size, in the container representation
    pub size: Option<u64>,
    /// New access time
    pub atime: Option<SystemTime>,
    /// New modification time
    pub mtime: Option<SystemTime>,
}

enum Handle {
    File(Arc<Mutex<OpenFile>>),
    Dir { entries: Arc<Vec<DirEntry>> },
}

/// Serves a source directory through the path mapping rules of one mount.
///
/// Inodes are allocated lazily as paths are looked up and stay valid
/// until their path is removed. Every operation is a plain blocking call that
/// returns a [`Result`], the fuse adapter in [`Session`] only forwards
/// requests and replies.
pub struct Filesystem {
    config: MountConfig,
    tracer: Tracer,
    cache: TranslationCache,

    ttl: Duration,
    next_inode: AtomicU64,
    next_handle: AtomicU64,
    /// container-relative path of every allocated inode
    inodes: DashMap<u64, PathBuf>,
    paths: DashMap<PathBuf, u64>,
    handles: DashMap<u64, Handle>,
}

impl Filesystem {
    // reported to the kernel for block counts, the real
    // block usage of translated content is not known
    const BLOCK_SIZE: u32 = 512;

    /// Create a filesystem serving `config`, logging to `tracer`.
    pub fn new(config: MountConfig, tracer: Tracer) -> Self {
        let fs = Self {
            config,
            tracer,
            cache: TranslationCache::default(),
            ttl: Duration::from_secs(1),
            next_inode: AtomicU64::new(ROOT_INODE + 1),
            // we do not allocate handle 0, so skip it for now
            next_handle: AtomicU64::new(1),
            inodes: Default::default(),
            paths: Default::default(),
            handles: Default::default(),
        };
        fs.inodes.insert(ROOT_INODE, PathBuf::new());
        fs.paths.insert(PathBuf::new(), ROOT_INODE);
        fs
    }

    /// The configuration this filesystem serves
    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    /// The tracer that requests are scoped to
    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// The number of handles that are currently open
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn allocate_inode(&self) -> u64 {
        self.next_inode.fetch_add(1, Ordering::Relaxed)
    }

    fn allocate_handle(&self, data: Handle) -> u64 {
        loop {
            let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                // the 'empty/zero' handle value is never allocated
                // so that the explicit lack of handle can be detected
                continue;
            }
            match self.handles.entry(id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(v) => {
                    v.insert(data);
                    break id;
                }
            }
        }
    }

    /// The inode for a container-relative path, allocating one if needed
    fn inode_for(&self, path: &Path) -> u64 {
        match self.paths.entry(path.to_owned()) {
            Entry::Occupied(e) => *e.get(),
            Entry::Vacant(v) => {
                let ino = self.allocate_inode();
                self.inodes.insert(ino, path.to_owned());
                v.insert(ino);
                ino
            }
        }
    }

    fn path_of(&self, ino: u64) -> Result<PathBuf> {
        self.inodes
            .get(&ino)
            .map(|path| path.value().clone())
            .ok_or(Error::UnknownInode(ino))
    }

    /// The container-relative path of `name` inside the directory `parent`.
    fn child(&self, parent: u64, name: &OsStr) -> Result<PathBuf> {
        let mapper = self.config.dir_mapper();
        if mapper.segment_to_container(mapper.segment_to_host(name)) != name {
            return Err(Error::Shadowed(name.to_owned()));
        }
        Ok(self.path_of(parent)?.join(name))
    }

    fn real_path(&self, path: &Path) -> PathBuf {
        self.config.real_path(path)
    }

    /// Every file that is currently open, in no particular order
    fn open_files(&self) -> Vec<Arc<Mutex<OpenFile>>> {
        self.handles
            .iter()
            .filter_map(|handle| match handle.value() {
                Handle::File(file) => Some(Arc::clone(file)),
                Handle::Dir { .. } => None,
            })
            .collect()
    }

    /// Drop the inodes of `path` and everything below it.
    fn forget_path(&self, path: &Path) {
        let removed: Vec<PathBuf> = self
            .paths
            .iter()
            .filter(|entry| entry.key().starts_with(path))
            .map(|entry| entry.key().clone())
            .collect();
        for old in removed {
            if let Some((_, ino)) = self.paths.remove(&old) {
                self.inodes.remove(&ino);
            }
        }
    }

    fn file(&self, fh: u64) -> Result<Arc<Mutex<OpenFile>>> {
        match self.handles.get(&fh).as_deref() {
            Some(Handle::File(file)) => Ok(Arc::clone(file)),
            Some(Handle::Dir { .. }) => Err(Error::IsDirectory(fh)),
            None => Err(Error::UnknownHandle(fh)),
        }
    }

    fn attr(&self, ino: u64, real_path: &Path, metadata: &Metadata) -> FileAttr {
        let size = apparent_size(&self.config, &self.cache, real_path, metadata);
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(Self::BLOCK_SIZE as u64),
            atime: metadata.accessed().unwrap_or(UNIX_EPOCH),
            mtime: metadata.modified().unwrap_or(UNIX_EPOCH),
            ctime: system_time(metadata.ctime(), metadata.ctime_nsec()),
            crtime: metadata.created().unwrap_or(UNIX_EPOCH),
            kind: file_kind(metadata.file_type()),
            perm: (metadata.mode() & 0o7777) as u16,
            nlink: metadata.nlink() as u32,
            uid: metadata.uid(),
            gid: metadata.gid(),
            rdev: metadata.rdev() as u32,
            blksize: Self::BLOCK_SIZE,
            flags: 0,
        }
    }

    fn stat(&self, ino: u64, path: &Path) -> Result<FileAttr> {
        let real_path = self.real_path(path);
        let metadata = std::fs::symlink_metadata(&real_path)
            .map_err(|err| Error::io("stat", &real_path, err))?;
        Ok(self.attr(ino, &real_path, &metadata))
    }

    /// Resolve `name` in the directory `parent`.
    pub fn lookup(&self, parent: u64, name: &OsStr) -> Result<FileAttr> {
        let path = self.child(parent, name)?;
        let real_path = self.real_path(&path);
        let metadata = std::fs::symlink_metadata(&real_path)
            .map_err(|err| Error::io("lookup", &real_path, err))?;
        let ino = self.inode_for(&path);
        tracing::trace!("lookup {} = {ino}", path.display());
        Ok(self.attr(ino, &real_path, &metadata))
    }

    /// The attributes of `ino`, with the live size of `fh` when given.
    pub fn getattr(&self, ino: u64, fh: Option<u64>) -> Result<FileAttr> {
        let path = self.path_of(ino)?;
        let mut attr = self.stat(ino, &path)?;
        if let Some(file) = fh.and_then(|fh| self.file(fh).ok()) {
            attr.size = lock(&file).size()?;
            attr.blocks = attr.size.div_ceil(Self::BLOCK_SIZE as u64);
        }
        Ok(attr)
    }

    /// Apply attribute changes to `ino`.
    ///
    /// Size changes go through the open file when a handle is given, so
    /// that they are applied to its buffer rather than the real file.
    pub fn setattr(&self, ino: u64, fh: Option<u64>, changes: SetAttr) -> Result<FileAttr> {
        let path = self.path_of(ino)?;
        let real_path = self.real_path(&path);

        if let Some(size) = changes.size {
            match fh.map(|fh| self.file(fh)).transpose()? {
                Some(file) => lock(&file).set_len(size)?,
                None => {
                    let flags = OpenFlags {
                        read: true,
                        write: true,
                        truncate: size == 0,
                    };
                    let mut file =
                        OpenFile::open(&self.config, &self.cache, real_path.clone(), flags)?;
                    file.set_len(size)?;
                    file.release(&self.config, &self.cache)?;
                }
            }
        }
        if let Some(mode) = changes.mode {
            std::fs::set_permissions(&real_path, std::fs::Permissions::from_mode(mode))
                .map_err(|err| Error::io("chmod", &real_path, err))?;
        }
        if changes.uid.is_some() || changes.gid.is_some() {
            std::os::unix::fs::lchown(&real_path, changes.uid, changes.gid)
                .map_err(|err| Error::io("chown", &real_path, err))?;
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            let mut times = std::fs::FileTimes::new();
            if let Some(atime) = changes.atime {
                times = times.set_accessed(atime);
            }
            if let Some(mtime) = changes.mtime {
                times = times.set_modified(mtime);
            }
            std::fs::File::open(&real_path)
                .and_then(|file| file.set_times(times))
                .map_err(|err| Error::io("utimens", &real_path, err))?;
        }
        self.getattr(ino, fh)
    }

    /// The target of the symlink at `ino`, unchanged.
    pub fn readlink(&self, ino: u64) -> Result<Vec<u8>> {
        let real_path = self.real_path(&self.path_of(ino)?);
        let target =
            std::fs::read_link(&real_path).map_err(|err| Error::io("readlink", &real_path, err))?;
        Ok(target.into_os_string().into_vec())
    }

    /// Open the file at `ino`, returning a new handle.
    pub fn open(&self, ino: u64, flags: i32) -> Result<u64> {
        let path = self.path_of(ino)?;
        let real_path = self.real_path(&path);
        if real_path.is_dir() {
            return Err(Error::IsDirectory(ino));
        }
        let file = OpenFile::open(
            &self.config,
            &self.cache,
            real_path,
            OpenFlags::from_libc(flags),
        )?;
        let translated = file.is_translated();
        let fh = self.allocate_handle(Handle::File(Arc::new(Mutex::new(file))));
        tracing::trace!(translated, "open {} = {fh}", path.display());
        Ok(fh)
    }

    /// Create and open a new file named `name` in `parent`.
    pub fn create(&self, parent: u64, name: &OsStr, mode: u32) -> Result<(FileAttr, u64)> {
        let path = self.child(parent, name)?;
        let real_path = self.real_path(&path);
        let file = OpenFile::create(&self.config, real_path, mode)?;
        let ino = self.inode_for(&path);
        let mut attr = self.stat(ino, &path)?;
        attr.size = file.size()?;
        let fh = self.allocate_handle(Handle::File(Arc::new(Mutex::new(file))));
        tracing::trace!("create {} = {ino}/{fh}", path.display());
        Ok((attr, fh))
    }

    /// Read up to `size` bytes at `offset` from an open file.
    pub fn read(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>> {
        let file = self.file(fh)?;
        let data = lock(&file).read(offset.max(0) as u64, size as usize)?;
        tracing::trace!("read {fh} = {}/{size}", data.len());
        Ok(data)
    }

    /// Write `data` at `offset` into an open file.
    pub fn write(&self, fh: u64, offset: i64, data: &[u8]) -> Result<u32> {
        let file = self.file(fh)?;
        let written = lock(&file).write(offset.max(0) as u64, data)?;
        tracing::trace!("write {fh} = {written}");
        Ok(written as u32)
    }

    /// Called on every close of a file descriptor, writes back any
    /// buffered changes.
    ///
    /// The kernel releases handles asynchronously, so a close followed
    /// by a rename must already find the content in the real file.
    pub fn flush(&self, fh: u64) -> Result<()> {
        let file = self.file(fh)?;
        lock(&file).sync(&self.config, &self.cache)?;
        tracing::trace!("flush {fh}");
        Ok(())
    }

    /// Persist any buffered writes of an open file.
    pub fn fsync(&self, fh: u64) -> Result<()> {
        let file = self.file(fh)?;
        lock(&file).sync(&self.config, &self.cache)?;
        Ok(())
    }

    /// Close a file handle, writing back any buffered changes.
    ///
    /// The handle is gone afterwards even when the write back fails.
    pub fn release(&self, fh: u64) -> Result<()> {
        let Some((_, handle)) = self.handles.remove(&fh) else {
            return Err(Error::UnknownHandle(fh));
        };
        let Handle::File(file) = handle else {
            return Err(Error::IsDirectory(fh));
        };
        match Arc::try_unwrap(file) {
            Ok(file) => file
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner)
                .release(&self.config, &self.cache)?,
            // a request still holds the file, write back what we have
            Err(shared) => lock(&shared).sync(&self.config, &self.cache)?,
        }
        tracing::trace!("release {fh}");
        Ok(())
    }

    /// Release every handle that is still open, returning how many there were.
    ///
    /// Failures are logged, each handle is released regardless.
    pub fn release_all(&self) -> usize {
        let open: Vec<(u64, bool)> = self
            .handles
            .iter()
            .map(|h| (*h.key(), matches!(h.value(), Handle::File(_))))
            .collect();
        for (fh, is_file) in open.iter().copied() {
            let result = if is_file {
                self.release(fh)
            } else {
                self.releasedir(fh)
            };
            if let Err(err) = result {
                tracing::error!(?err, "failed to release handle {fh} at unmount");
            }
        }
        open.len()
    }

    /// Snapshot the listing of the directory at `ino`, returning a new handle.
    ///
    /// Names are reported in their container spelling. Host names that
    /// are shadowed by a directory mapping are left out.
    pub fn opendir(&self, ino: u64) -> Result<u64> {
        let path = self.path_of(ino)?;
        let real_path = self.real_path(&path);
        let metadata =
            std::fs::metadata(&real_path).map_err(|err| Error::io("opendir", &real_path, err))?;
        if !metadata.is_dir() {
            return Err(Error::NotDirectory(ino));
        }
        let parent_ino = match path.parent() {
            Some(parent) => self.inode_for(parent),
            None => ROOT_INODE,
        };
        let mut entries = vec![
            DirEntry {
                ino,
                kind: FileType::Directory,
                name: ".".into(),
            },
            DirEntry {
                ino: parent_ino,
                kind: FileType::Directory,
                name: "..".into(),
            },
        ];

        let mapper = self.config.dir_mapper();
        let listing =
            std::fs::read_dir(&real_path).map_err(|err| Error::io("readdir", &real_path, err))?;
        for entry in listing {
            let entry = entry.map_err(|err| Error::io("readdir", &real_path, err))?;
            let host_name = entry.file_name();
            let name = mapper.segment_to_container(&host_name);
            if mapper.segment_to_host(name) != host_name.as_os_str() {
                tracing::trace!(?host_name, "hidden by directory mapping");
                continue;
            }
            let kind = match entry.file_type() {
                Ok(file_type) => file_kind(file_type),
                // it may have been removed since the listing was read
                Err(_) => continue,
            };
            entries.push(DirEntry {
                ino: self.inode_for(&path.join(name)),
                kind,
                name: name.to_owned(),
            });
        }
        tracing::trace!("opendir {} = {} entries", path.display(), entries.len());
        let entries = Arc::new(entries);
        Ok(self.allocate_handle(Handle::Dir { entries }))
    }

    /// The entries of an open directory that follow `offset`, each
    /// with the offset that resumes after it.
    pub fn readdir(&self, fh: u64, offset: i64) -> Result<Vec<(i64, DirEntry)>> {
        let entries = match self.handles.get(&fh).as_deref() {
            Some(Handle::Dir { entries }) => Arc::clone(entries),
            Some(Handle::File(_)) => return Err(Error::NotDirectory(fh)),
            None => return Err(Error::UnknownHandle(fh)),
        };
        Ok(entries
            .iter()
            .enumerate()
            .skip(offset.max(0) as usize)
            .map(|(index, entry)| (index as i64 + 1, entry.clone()))
            .collect())
    }

    /// Close a directory handle.
    pub fn releasedir(&self, fh: u64) -> Result<()> {
        match self.handles.remove(&fh) {
            Some(_) => Ok(()),
            None => Err(Error::UnknownHandle(fh)),
        }
    }

    /// Check access to `ino` against the real file.
    pub fn access(&self, ino: u64, mask: i32) -> Result<()> {
        let real_path = self.real_path(&self.path_of(ino)?);
        nix::unistd::access(
            &real_path,
            nix::unistd::AccessFlags::from_bits_truncate(mask),
        )
        .map_err(|errno| Error::io("access", &real_path, errno.into()))
    }

    /// Usage statistics of the filesystem holding the source directory.
    pub fn statfs(&self) -> Result<nix::sys::statvfs::Statvfs> {
        let root = self.config.source_root();
        nix::sys::statvfs::statvfs(root).map_err(|errno| Error::io("statfs", root, errno.into()))
    }

    /// Create the directory `name` in `parent`.
    pub fn mkdir(&self, parent: u64, name: &OsStr, mode: u32) -> Result<FileAttr> {
        let path = self.child(parent, name)?;
        let real_path = self.real_path(&path);
        std::fs::DirBuilder::new()
            .mode(mode)
            .create(&real_path)
            .map_err(|err| Error::io("mkdir", &real_path, err))?;
        self.lookup(parent, name)
    }

    /// Remove the file `name` from `parent`.
    ///
    /// Handles that are still open on it keep working, but their
    /// changes are no longer written back.
    pub fn unlink(&self, parent: u64, name: &OsStr) -> Result<()> {
        let path = self.child(parent, name)?;
        let real_path = self.real_path(&path);
        std::fs::remove_file(&real_path).map_err(|err| Error::io("unlink", &real_path, err))?;
        self.cache.invalidate(&real_path);
        for shared in self.open_files() {
            let mut file = lock(&shared);
            if file.real_path() == real_path {
                file.detach();
            }
        }
        self.forget_path(&path);
        tracing::trace!("unlink {}", path.display());
        Ok(())
    }

    /// Remove the empty directory `name` from `parent`.
    pub fn rmdir(&self, parent: u64, name: &OsStr) -> Result<()> {
        let path = self.child(parent, name)?;
        let real_path = self.real_path(&path);
        std::fs::remove_dir(&real_path).map_err(|err| Error::io("rmdir", &real_path, err))?;
        self.forget_path(&path);
        tracing::trace!("rmdir {}", path.display());
        Ok(())
    }

    /// Move `name` in `parent` to `new_name` in `new_parent`.
    ///
    /// Inodes and open handles below the moved path follow it, so that
    /// lookups made before the rename keep resolving and buffered
    /// changes are written back to the new location.
    pub fn rename(
        &self,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
        flags: u32,
    ) -> Result<()> {
        if flags != 0 {
            return Err(Error::Unsupported { op: "rename", flags });
        }
        let from = self.child(parent, name)?;
        let to = self.child(new_parent, new_name)?;
        let real_from = self.real_path(&from);
        let real_to = self.real_path(&to);
        std::fs::rename(&real_from, &real_to)
            .map_err(|err| Error::io("rename", &real_from, err))?;
        self.cache.invalidate(&real_from);
        self.cache.invalidate(&real_to);
        if from == to {
            return Ok(());
        }

        // the replaced target, if any, is no longer reachable by its path
        self.forget_path(&to);
        let moved: Vec<PathBuf> = self
            .paths
            .iter()
            .filter(|entry| entry.key().starts_with(&from))
            .map(|entry| entry.key().clone())
            .collect();
        for old in moved {
            let Some((_, ino)) = self.paths.remove(&old) else {
                continue;
            };
            let new = match old.strip_prefix(&from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.clone(),
                Ok(rest) => to.join(rest),
                Err(_) => continue,
            };
            self.inodes.insert(ino, new.clone());
            self.paths.insert(new, ino);
        }

        for shared in self.open_files() {
            let mut file = lock(&shared);
            let moved_to = match file.real_path().strip_prefix(&real_from) {
                Ok(rest) if rest.as_os_str().is_empty() => Some(real_to.clone()),
                Ok(rest) => Some(real_to.join(rest)),
                Err(_) => None,
            };
            match moved_to {
                Some(path) => file.set_real_path(path),
                None if file.real_path() == real_to => file.detach(),
                None => {}
            }
        }
        tracing::trace!("rename {} -> {}", from.display(), to.display());
        Ok(())
    }

    /// Create a symlink `name` in `parent` pointing at `target`, unchanged.
    pub fn symlink(&self, parent: u64, name: &OsStr, target: &Path) -> Result<FileAttr> {
        let real_path = self.real_path(&self.child(parent, name)?);
        std::os::unix::fs::symlink(target, &real_path)
            .map_err(|err| Error::io("symlink", &real_path, err))?;
        self.lookup(parent, name)
    }

    /// Create a hard link to `ino` named `new_name` in `new_parent`.
    pub fn link(&self, ino: u64, new_parent: u64, new_name: &OsStr) -> Result<FileAttr> {
        let real_path = self.real_path(&self.path_of(ino)?);
        let real_link = self.real_path(&self.child(new_parent, new_name)?);
        std::fs::hard_link(&real_path, &real_link)
            .map_err(|err| Error::io("link", &real_link, err))?;
        self.lookup(new_parent, new_name)
    }
}

fn lock(file: &Mutex<OpenFile>) -> MutexGuard<'_, OpenFile> {
    file.lock().unwrap_or_else(PoisonError::into_inner)
}

fn file_kind(file_type: std::fs::FileType) -> FileType {
    if file_type.is_dir() {
        FileType::Directory
    } else if file_type.is_symlink() {
        FileType::Symlink
    } else if file_type.is_fifo() {
        FileType::NamedPipe
    } else if file_type.is_socket() {
        FileType::Socket
    } else if file_type.is_block_device() {
        FileType::BlockDevice
    } else if file_type.is_char_device() {
        FileType::CharDevice
    } else {
        FileType::RegularFile
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs.clamp(0, 999_999_999) as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn system_time_or_now(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Extract the ok value from a result, or reply with an error in FUSE
macro_rules! unwrap {
    ($reply:ident, $op:expr) => {{
        match $op {
            Ok(r) => r,
            Err(err) => err!($reply, err),
        }
    }};
}

/// Reply with an error to FUSE and return
macro_rules! err {
    ($reply:ident, $err:expr) => {{
        let err = $err;
        let errno = err.os_error().unwrap_or(libc::EIO);
        if errno == libc::EIO {
            tracing::error!("{err:?}");
        } else {
            tracing::debug!(errno, "{err}");
        }
        $reply.error(errno);
        return;
    }};
}

/// Represents a connected FUSE session.
///
/// This implements the [`fuser::Filesystem`] trait, receives all
/// requests and runs each one on the blocking pool of the mount's
/// runtime, scoped to the mount's tracer.
pub struct Session {
    fs: Arc<Filesystem>,
    runtime: tokio::runtime::Handle,
    tracker: TaskTracker,
}

impl Session {
    /// Construct a new session which dispatches requests to `fs`
    ///
    /// Every request is tracked by `tracker` so that the caller can
    /// wait for in-flight requests after the session ends.
    pub fn new(fs: Arc<Filesystem>, runtime: tokio::runtime::Handle, tracker: TaskTracker) -> Self {
        Self {
            fs,
            runtime,
            tracker,
        }
    }

    fn spawn<F>(&self, op: F)
    where
        F: FnOnce(&Filesystem) + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        let token = self.tracker.token();
        self.runtime.spawn_blocking(move || {
            let _token = token;
            fs.tracer().in_scope(|| op(&fs));
        });
    }
}

// these functions mirror the actual fuse ones and
// so we don't have much control over the shape
#[allow(clippy::too_many_arguments)]
impl fuser::Filesystem for Session {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        self.fs.tracer().in_scope(|| {
            tracing::info!(
                source = %self.fs.config().source_root().display(),
                rules = self.fs.config().rules().len(),
                "Filesystem initialized"
            )
        });
        Ok(())
    }

    fn destroy(&mut self) {
        self.fs
            .tracer()
            .in_scope(|| tracing::debug!("Filesystem destroyed"));
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_owned();
        self.spawn(move |fs| {
            let attr = unwrap!(reply, fs.lookup(parent, &name));
            reply.entry(&fs.ttl, &attr, 0);
        });
    }

    fn forget(&mut self, _req: &Request<'_>, _ino: u64, _nlookup: u64) {
        // nothing to do, inodes stay mapped to their path
        // for the lifetime of the mount
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        self.spawn(move |fs| {
            let attr = unwrap!(reply, fs.getattr(ino, fh));
            reply.attr(&fs.ttl, &attr);
        });
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(system_time_or_now),
            mtime: mtime.map(system_time_or_now),
        };
        self.spawn(move |fs| {
            let attr = unwrap!(reply, fs.setattr(ino, fh, changes));
            reply.attr(&fs.ttl, &attr);
        });
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        self.spawn(move |fs| {
            let target = unwrap!(reply, fs.readlink(ino));
            reply.data(&target);
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_owned();
        self.spawn(move |fs| {
            let attr = unwrap!(reply, fs.mkdir(parent, &name, mode & !umask));
            reply.entry(&fs.ttl, &attr, 0);
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_owned();
        self.spawn(move |fs| {
            unwrap!(reply, fs.unlink(parent, &name));
            reply.ok();
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_owned();
        self.spawn(move |fs| {
            unwrap!(reply, fs.rmdir(parent, &name));
            reply.ok();
        });
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let link_name = link_name.to_owned();
        let target = target.to_owned();
        self.spawn(move |fs| {
            let attr = unwrap!(reply, fs.symlink(parent, &link_name, &target));
            reply.entry(&fs.ttl, &attr, 0);
        });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_owned();
        let newname = newname.to_owned();
        self.spawn(move |fs| {
            unwrap!(reply, fs.rename(parent, &name, newparent, &newname, flags));
            reply.ok();
        });
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let newname = newname.to_owned();
        self.spawn(move |fs| {
            let attr = unwrap!(reply, fs.link(ino, newparent, &newname));
            reply.entry(&fs.ttl, &attr, 0);
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        self.spawn(move |fs| {
            let fh = unwrap!(reply, fs.open(ino, flags));
            reply.opened(fh, 0);
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        self.spawn(move |fs| {
            let data = unwrap!(reply, fs.read(fh, offset, size));
            reply.data(&data);
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let data = data.to_vec();
        self.spawn(move |fs| {
            let written = unwrap!(reply, fs.write(fh, offset, &data));
            reply.written(written);
        });
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        self.spawn(move |fs| {
            unwrap!(reply, fs.flush(fh));
            reply.ok();
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.spawn(move |fs| {
            unwrap!(reply, fs.release(fh));
            reply.ok();
        });
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        self.spawn(move |fs| {
            unwrap!(reply, fs.fsync(fh));
            reply.ok();
        });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        self.spawn(move |fs| {
            let fh = unwrap!(reply, fs.opendir(ino));
            reply.opened(fh, 0);
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        self.spawn(move |fs| {
            let remaining = unwrap!(reply, fs.readdir(fh, offset));
            for (next_offset, entry) in remaining {
                let buffer_full = reply.add(entry.ino, next_offset, entry.kind, &entry.name);
                if buffer_full {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        self.spawn(move |fs| {
            unwrap!(reply, fs.releasedir(fh));
            reply.ok();
        });
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        self.spawn(move |fs| {
            let stat = unwrap!(reply, fs.statfs());
            reply.statfs(
                stat.blocks() as u64,
                stat.blocks_free() as u64,
                stat.blocks_available() as u64,
                stat.files() as u64,
                stat.files_free() as u64,
                stat.block_size() as u32,
                stat.name_max() as u32,
                stat.fragment_size() as u32,
            );
        });
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        self.spawn(move |fs| {
            unwrap!(reply, fs.access(ino, mask));
            reply.ok();
        });
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = name.to_owned();
        self.spawn(move |fs| {
            let (attr, fh) = unwrap!(reply, fs.create(parent, &name, mode & !umask));
            reply.created(&fs.ttl, &attr, 0, fh, 0);
        });
    }
}
