// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use fuser::{MountOption, SessionUnmounter};
use pathbridge::{Error, MountConfig, Result, Tracer};
use tokio_util::task::TaskTracker;

use crate::fuse::{Filesystem, Session};

#[cfg(test)]
#[path = "./mount_test.rs"]
mod mount_test;

/// How long to wait for stray runtime tasks once the mount is gone
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Mount a path-mapped view of `config`'s source directory at `mountpoint`.
///
/// Shorthand for [`Mounter::mount`] with default fuse options.
pub fn mount(config: MountConfig, mountpoint: &Path, tracer: Tracer) -> Result<MountHandle> {
    Mounter::default().mount(config, mountpoint, tracer)
}

/// Establishes new mounts.
#[derive(Debug, Clone)]
pub struct Mounter {
    options: Vec<MountOption>,
}

impl Default for Mounter {
    fn default() -> Self {
        Self {
            options: vec![
                MountOption::FSName("pathbridge".into()),
                MountOption::Subtype("pathbridge".into()),
            ],
        }
    }
}

impl Mounter {
    /// Add fuse mount options, eg `allow_other` or `ro`.
    ///
    /// A given `fsname` or `subtype` replaces the default one.
    pub fn with_mount_options<I>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = MountOption>,
    {
        for option in options {
            match &option {
                MountOption::FSName(_) => self
                    .options
                    .retain(|o| !matches!(o, MountOption::FSName(_))),
                MountOption::Subtype(_) => self
                    .options
                    .retain(|o| !matches!(o, MountOption::Subtype(_))),
                _ if self.options.contains(&option) => continue,
                _ => {}
            }
            self.options.push(option);
        }
        self
    }

    /// The fuse options that new mounts are created with
    pub fn mount_options(&self) -> &[MountOption] {
        &self.options
    }

    /// Mount `config` at `mountpoint`, serving requests in the background.
    ///
    /// The mount is live once this returns; it is served until it is
    /// unmounted through the returned handle or externally. Events are
    /// limited to the trace level of `config` before they reach `tracer`.
    pub fn mount(
        &self,
        config: MountConfig,
        mountpoint: &Path,
        tracer: Tracer,
    ) -> Result<MountHandle> {
        let mount_error = |source: io::Error| Error::Mount {
            mountpoint: mountpoint.to_owned(),
            source,
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("pathbridge-worker")
            .build()
            .map_err(mount_error)?;
        let tracker = TaskTracker::new();
        let tracer = tracer.with_level(config.trace_level());
        let fs = Arc::new(Filesystem::new(config, tracer.clone()));
        let session = Session::new(Arc::clone(&fs), runtime.handle().clone(), tracker.clone());

        tracer.in_scope(|| {
            tracing::debug!(
                mountpoint = %mountpoint.display(),
                options = ?self.options,
                "Establishing fuse session..."
            )
        });
        let mut session =
            fuser::Session::new(session, mountpoint, &self.options).map_err(mount_error)?;
        let unmounter = Unmounter {
            mountpoint: mountpoint.to_owned(),
            inner: Arc::new(Mutex::new(Some(session.unmount_callable()))),
        };
        let thread = std::thread::Builder::new()
            .name("pathbridge-fuse".into())
            .spawn(move || session.run())
            .map_err(mount_error)?;
        tracer.in_scope(|| tracing::info!(mountpoint = %mountpoint.display(), "mounted"));

        Ok(MountHandle {
            mountpoint: mountpoint.to_owned(),
            fs,
            tracer,
            tracker,
            unmounter,
            runtime: Some(runtime),
            thread: Some(thread),
        })
    }
}

/// Unmounts a live mount, can be cloned and sent to other threads.
#[derive(Clone)]
pub struct Unmounter {
    mountpoint: PathBuf,
    inner: Arc<Mutex<Option<SessionUnmounter>>>,
}

impl Unmounter {
    /// Request the mount to be removed.
    ///
    /// Only the first call does anything, later calls succeed immediately.
    pub fn unmount(&self) -> Result<()> {
        let unmounter = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match unmounter {
            Some(mut unmounter) => unmounter
                .unmount()
                .map_err(|err| Error::io("unmount", &self.mountpoint, err)),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Unmounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unmounter")
            .field("mountpoint", &self.mountpoint)
            .finish_non_exhaustive()
    }
}

/// A live mount, see [`mount`].
///
/// Dropping the handle unmounts the filesystem and waits for it to stop.
pub struct MountHandle {
    mountpoint: PathBuf,
    fs: Arc<Filesystem>,
    tracer: Tracer,
    tracker: TaskTracker,
    unmounter: Unmounter,
    runtime: Option<tokio::runtime::Runtime>,
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl MountHandle {
    /// The location of the mount
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// A trigger that unmounts this mount from anywhere
    pub fn unmounter(&self) -> Unmounter {
        self.unmounter.clone()
    }

    /// Request the mount to be removed, see [`Self::wait_until_unmounted`]
    pub fn unmount(&self) -> Result<()> {
        self.unmounter.unmount()
    }

    /// Block until the mount has been removed and every request is done.
    ///
    /// Requests that were in flight are awaited and any handles that
    /// the kernel never released are written back before this returns.
    pub fn wait_until_unmounted(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let served = thread
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("fuse session thread panicked")));

        self.tracker.close();
        futures::executor::block_on(self.tracker.wait());
        let leftover = self.tracer.in_scope(|| self.fs.release_all());
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        }
        self.tracer.in_scope(|| {
            tracing::info!(
                mountpoint = %self.mountpoint.display(),
                leftover,
                "unmounted"
            )
        });
        served.map_err(|err| Error::io("serve", &self.mountpoint, err))
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if self.thread.is_none() {
            return;
        }
        let result = self.unmount().and_then(|_| self.shutdown());
        if let Err(err) = result {
            self.tracer
                .in_scope(|| tracing::error!(?err, "failed to unmount cleanly"));
        }
    }
}
