// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

#[cfg(test)]
#[path = "./args_test.rs"]
mod args_test;

const PATHBRIDGE_LOG: &str = "PATHBRIDGE_LOG";

/// Command line flags for configuring logging
#[derive(Debug, Clone, Default, clap::Args)]
pub struct Logging {
    /// Make output more verbose, can be specified more than once
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Send log output to syslog instead of stderr
    #[clap(long, global = true, env = "PATHBRIDGE_SYSLOG")]
    pub syslog: bool,

    /// Additionally append log output to this file
    #[clap(long, global = true, env = "PATHBRIDGE_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl Logging {
    /// Install the global logging subscriber described by these flags
    pub fn configure(&self) -> Result<()> {
        configure_logging(self.verbose, self.syslog, self.log_file.as_deref())
    }
}

/// The filter directives for a given verbosity.
///
/// At the default verbosity an existing `PATHBRIDGE_LOG` value is used
/// as is. `RUST_LOG` overrides are always appended.
pub fn log_filter(verbosity: u8, existing: Option<&str>, overrides: Option<&str>) -> String {
    let mut config = match verbosity {
        0 => existing.unwrap_or("pathbridge=info,warn").to_string(),
        1 => "pathbridge=debug,info".to_string(),
        2 => "pathbridge=trace,info".to_string(),
        3 => "pathbridge=trace,debug".to_string(),
        _ => "trace".to_string(),
    };
    if let Some(overrides) = overrides.filter(|o| !o.is_empty()) {
        config.push(',');
        config.push_str(overrides);
    }
    config
}

pub fn configure_logging(verbosity: u8, syslog: bool, log_file: Option<&Path>) -> Result<()> {
    let existing = std::env::var(PATHBRIDGE_LOG).ok();
    let overrides = std::env::var("RUST_LOG").ok();
    let env_filter = EnvFilter::new(log_filter(
        verbosity,
        existing.as_deref(),
        overrides.as_deref(),
    ));
    let with_target = verbosity > 2;

    let syslog_layer = if syslog {
        let (options, facility) = Default::default();
        let writer = syslog_tracing::Syslog::new(c"pathbridge", options, facility)
            .ok_or_else(|| anyhow!("Syslog was already initialized"))?;
        let layer = fmt::layer()
            .without_time()
            .with_ansi(false)
            .with_target(with_target)
            .with_writer(writer);
        Some(layer)
    } else {
        None
    };
    let stderr_layer = (!syslog).then(|| {
        fmt::layer()
            .without_time()
            .with_target(with_target)
            .with_writer(std::io::stderr)
    });
    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            Some(layer)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(syslog_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install logging")
}

/// Turn the result of a command into a process exit code, logging
/// any error with a message suited to its cause.
#[macro_export]
macro_rules! handle_result {
    ($result:ident) => {{
        use $crate::__private::pathbridge::Error as CoreError;
        match $result {
            Err(err) => {
                let core = err
                    .chain()
                    .find_map(|cause| cause.downcast_ref::<CoreError>());
                match core {
                    Some(CoreError::Io { path, source, .. })
                    | Some(CoreError::Flush { path, source })
                        if std::matches!(
                            source.raw_os_error(),
                            Some($crate::__private::libc::ENOSPC)
                        ) =>
                    {
                        $crate::__private::tracing::error!(
                            "Out of disk space writing to {path}",
                            path = path.display()
                        );
                    }
                    Some(CoreError::Mount { .. }) => {
                        $crate::__private::tracing::error!("{err:#}");
                        $crate::__private::tracing::error!(
                            "Check that /dev/fuse exists, that fusermount is installed, and that you may mount over the target directory"
                        );
                    }
                    _ => $crate::__private::tracing::error!("{err:#}"),
                }
                1
            }
            Ok(code) => code,
        }
    }};
}
