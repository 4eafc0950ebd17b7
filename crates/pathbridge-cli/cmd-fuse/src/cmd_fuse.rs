// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pathbridge::{ConfigError, MountConfig, RawOptions, TraceLevel, Tracer};
use pathbridge_cli_common as cli;
use pathbridge_vfs::{MountOption, Mounter};
use tokio::signal::unix::{SignalKind, signal};

#[cfg(test)]
#[path = "./cmd_fuse_test.rs"]
mod cmd_fuse_test;

fn main() {
    // because this function exits right away it does not
    // properly handle destruction of data, so we put the actual
    // logic into a separate function/scope
    std::process::exit(main2())
}

fn main2() -> i32 {
    let mut opt = CmdFuse::parse();
    let resolved = opt.resolve().map(|(config, options)| {
        let (verbose, level) = align_verbosity(opt.logging.verbose, config.trace_level());
        opt.logging.verbose = verbose;
        (config.with_trace_level(level), options)
    });
    if let Err(err) = opt.logging.configure() {
        eprintln!("{err:#}");
        return 1;
    }

    let result = resolved.and_then(|(config, options)| opt.run(config, options));
    cli::handle_result!(result)
}

/// Mount a directory with path references rewritten for a container
#[derive(Debug, Parser)]
#[clap(name = "pathbridge-fuse", version = pathbridge::VERSION)]
pub struct CmdFuse {
    #[clap(flatten)]
    logging: cli::Logging,

    /// Options for the mount in the form opt1,opt2=value
    ///
    /// In addition to the common fuse mount options, the following custom
    /// options are also supported:
    ///
    ///  source     - the real directory to serve, required
    ///  pathmap    - host=container path rules separated by ';'
    ///  dirmap     - host=container directory name rules separated by ';'
    ///  extensions - file extensions whose content is translated, separated
    ///               by ':', defaults to json:jsonl
    ///  trace      - translation trace level, 0 for errors only up to 3
    ///  maxsize    - eligible files larger than this many bytes are
    ///               served untranslated
    ///
    /// Every custom option except source falls back to the matching
    /// PATHBRIDGE_* environment variable when not given.
    #[clap(long, short, value_delimiter = ',')]
    options: Vec<String>,

    /// The location where to mount the translated view
    mountpoint: PathBuf,
}

impl CmdFuse {
    /// Validate the command line into a mount configuration and the
    /// fuse options that remain.
    pub fn resolve(&self) -> Result<(MountConfig, Vec<MountOption>)> {
        let (raw, remaining) = RawOptions::from_mount_options(&self.options);
        let config = raw
            .with_process_environment()
            .and_then(RawOptions::resolve)
            .map_err(pathbridge::Error::from)
            .context("Invalid mount options")?;
        let options = parse_options_from_args(&remaining)
            .map_err(pathbridge::Error::from)
            .context("Invalid mount options")?;
        Ok((config, options))
    }

    pub fn run(&self, config: MountConfig, options: Vec<MountOption>) -> Result<i32> {
        let mountpoint = self
            .mountpoint
            .canonicalize()
            .context("Invalid mount point")?;
        let mounter = Mounter::default().with_mount_options(options);
        tracing::debug!(?config, options = ?mounter.mount_options(), "FUSE config");

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to establish runtime")?;

        let result = rt.block_on(async move {
            // handlers are in place before the mount exists so that
            // no signal can leave it behind
            let mut interrupt = signal(SignalKind::interrupt()).context("interrupt signal handler")?;
            let mut quit = signal(SignalKind::quit()).context("quit signal handler")?;
            let mut terminate = signal(SignalKind::terminate()).context("terminate signal handler")?;

            let handle = mounter
                .mount(config, &mountpoint, Tracer::current())
                .context("Failed to mount filesystem")?;
            let unmounter = handle.unmounter();
            tracing::info!(mountpoint = %mountpoint.display(), "Serving FUSE filesystem");

            let mut served = tokio::task::spawn_blocking(move || handle.wait_until_unmounted());
            tokio::select! {
                res = &mut served => {
                    tracing::info!("Filesystem was unmounted externally");
                    return res
                        .context("FUSE session failed")?
                        .context("Filesystem did not shut down cleanly");
                }
                _ = terminate.recv() => tracing::info!("Terminate signal received, filesystem shutting down"),
                _ = interrupt.recv() => tracing::info!("Interrupt signal received, filesystem shutting down"),
                _ = quit.recv() => tracing::info!("Quit signal received, filesystem shutting down"),
            }
            unmounter.unmount().context("Failed to unmount filesystem")?;
            served
                .await
                .context("FUSE session failed")?
                .context("Filesystem did not shut down cleanly")
        });

        // the mount owns its own runtime, anything left here is
        // only waiting on signals that will never come
        rt.shutdown_timeout(std::time::Duration::from_secs(2));
        result?;
        Ok(0)
    }
}

/// Line up the process verbosity with the trace level of the mount.
///
/// Trace level 1 matches the default output and each level above it is
/// one more -v. An explicit -v raises the trace level in turn, while
/// trace level 0 keeps the mount to errors only.
fn align_verbosity(verbose: u8, level: TraceLevel) -> (u8, TraceLevel) {
    let verbose = verbose.max(level.get().saturating_sub(1));
    if verbose == 0 {
        return (verbose, level);
    }
    (verbose, level.max(TraceLevel::new(verbose.saturating_add(1))))
}

/// Parse the fuse options understood by [`fuser::MountOption`].
///
/// Unlike fuser's own parsing, unknown options are rejected rather
/// than passed through to the mount helper.
fn parse_options_from_args(args: &[String]) -> std::result::Result<Vec<MountOption>, ConfigError> {
    args.iter()
        .map(|s| {
            let option = match s.as_str() {
                "auto_unmount" => MountOption::AutoUnmount,
                "allow_other" => MountOption::AllowOther,
                "allow_root" => MountOption::AllowRoot,
                "default_permissions" => MountOption::DefaultPermissions,
                "dev" => MountOption::Dev,
                "nodev" => MountOption::NoDev,
                "suid" => MountOption::Suid,
                "nosuid" => MountOption::NoSuid,
                "ro" => MountOption::RO,
                "rw" => MountOption::RW,
                "exec" => MountOption::Exec,
                "noexec" => MountOption::NoExec,
                "atime" => MountOption::Atime,
                "noatime" => MountOption::NoAtime,
                "dirsync" => MountOption::DirSync,
                "sync" => MountOption::Sync,
                "async" => MountOption::Async,
                x => match x.split_once('=') {
                    Some(("fsname", name)) => MountOption::FSName(name.into()),
                    Some(("subtype", name)) => MountOption::Subtype(name.into()),
                    _ => return Err(ConfigError::UnknownOption(x.into())),
                },
            };
            Ok(option)
        })
        .collect()
}
