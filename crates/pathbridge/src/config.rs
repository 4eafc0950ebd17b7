// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Resolution of raw mount options into a validated [`MountConfig`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use config::{Config as ConfigBase, Environment};
use serde::Deserialize;

use crate::dirmap::DirMapper;
use crate::error::ConfigError;
use crate::rules::{RuleSet, Syntax};
use crate::trace::TraceLevel;

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

/// Prefix of the environment variables consulted for missing options,
/// eg: `PATHBRIDGE_PATHMAP`, `PATHBRIDGE_DIRMAP`, `PATHBRIDGE_TRACE`,
/// `PATHBRIDGE_EXTENSIONS` and `PATHBRIDGE_MAX_FILE_SIZE`
pub const ENV_PREFIX: &str = "PATHBRIDGE";

/// Extensions whose content is translated when none are configured
pub const DEFAULT_EXTENSIONS: &[&str] = &["json", "jsonl"];

/// Eligible files larger than this are served untranslated
pub const DEFAULT_MAX_TRANSLATED_SIZE: u64 = 16 * 1024 * 1024;

/// Unvalidated option strings, as given on the command line or
/// found in the environment.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RawOptions {
    pub source: Option<String>,
    pub pathmap: Option<String>,
    pub dirmap: Option<String>,
    pub extensions: Option<String>,
    pub trace: Option<String>,
    pub max_file_size: Option<String>,
}

impl RawOptions {
    /// Pull the options understood here out of a list of `key=value`
    /// mount options, returning the ones that were not recognized.
    pub fn from_mount_options<S: AsRef<str>>(options: &[S]) -> (Self, Vec<String>) {
        let mut raw = Self::default();
        let mut remaining = Vec::new();
        for option in options {
            let option = option.as_ref();
            let slot = match option.split_once('=') {
                Some(("source", value)) => Some((&mut raw.source, value)),
                Some(("pathmap", value)) => Some((&mut raw.pathmap, value)),
                Some(("dirmap", value)) => Some((&mut raw.dirmap, value)),
                Some(("extensions", value)) => Some((&mut raw.extensions, value)),
                Some(("trace", value)) => Some((&mut raw.trace, value)),
                Some(("maxsize", value)) => Some((&mut raw.max_file_size, value)),
                _ => None,
            };
            match slot {
                Some((slot, value)) => *slot = Some(value.to_string()),
                None => remaining.push(option.to_string()),
            }
        }
        (raw, remaining)
    }

    /// Fill any option that was not given explicitly from the
    /// provided environment source.
    ///
    /// The source directory is never taken from the environment.
    pub fn with_environment(self, env: Environment) -> Result<Self, ConfigError> {
        let from_env: RawOptions = ConfigBase::builder()
            .add_source(env)
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|err| ConfigError::Environment(err.to_string()))?;
        Ok(Self {
            source: self.source,
            pathmap: self.pathmap.or(from_env.pathmap),
            dirmap: self.dirmap.or(from_env.dirmap),
            extensions: self.extensions.or(from_env.extensions),
            trace: self.trace.or(from_env.trace),
            max_file_size: self.max_file_size.or(from_env.max_file_size),
        })
    }

    /// Fill missing options from the `PATHBRIDGE_*` process environment.
    pub fn with_process_environment(self) -> Result<Self, ConfigError> {
        self.with_environment(Environment::with_prefix(ENV_PREFIX))
    }

    /// Validate these options into an immutable mount configuration.
    pub fn resolve(self) -> Result<MountConfig, ConfigError> {
        let source = self.source.ok_or(ConfigError::MissingSource)?;
        let mut config = MountConfig::new(source)?;
        if let Some(spec) = self.pathmap.as_deref() {
            config.rules = RuleSet::parse(spec)?;
        }
        if let Some(spec) = self.dirmap.as_deref() {
            config.dir_mapper = DirMapper::parse(spec)?;
        }
        if let Some(list) = self.extensions.as_deref() {
            config.eligible_extensions = parse_extensions(list)?;
        }
        if let Some(level) = self.trace.as_deref() {
            config.trace_level = level
                .trim()
                .parse::<u8>()
                .map(TraceLevel::new)
                .map_err(|_| ConfigError::InvalidTraceLevel(level.to_string()))?;
        }
        if let Some(size) = self.max_file_size.as_deref() {
            config.max_translated_size = match size.trim().parse::<u64>() {
                Ok(size) if size > 0 => size,
                _ => return Err(ConfigError::InvalidSizeThreshold(size.to_string())),
            };
        }
        tracing::debug!(
            source = %config.source_root.display(),
            rules = config.rules.len(),
            extensions = ?config.eligible_extensions,
            "resolved mount configuration"
        );
        Ok(config)
    }
}

/// The validated, immutable configuration of one mount.
#[derive(Debug, Clone)]
pub struct MountConfig {
    source_root: PathBuf,
    rules: RuleSet,
    dir_mapper: DirMapper,
    eligible_extensions: BTreeSet<String>,
    trace_level: TraceLevel,
    max_translated_size: u64,
}

impl MountConfig {
    /// A passthrough configuration serving the given source directory.
    pub fn new<P: AsRef<Path>>(source_root: P) -> Result<Self, ConfigError> {
        let source_root = source_root.as_ref();
        let metadata = std::fs::metadata(source_root)
            .map_err(|_| ConfigError::SourceNotFound(source_root.to_owned()))?;
        if !metadata.is_dir() {
            return Err(ConfigError::SourceNotDirectory(source_root.to_owned()));
        }
        let source_root = std::fs::canonicalize(source_root)
            .map_err(|_| ConfigError::SourceNotFound(source_root.to_owned()))?;
        Ok(Self {
            source_root,
            rules: RuleSet::default(),
            dir_mapper: DirMapper::default(),
            eligible_extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            trace_level: TraceLevel::default(),
            max_translated_size: DEFAULT_MAX_TRANSLATED_SIZE,
        })
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_dir_mapper(mut self, dir_mapper: DirMapper) -> Self {
        self.dir_mapper = dir_mapper;
        self
    }

    pub fn with_eligible_extensions(mut self, extensions: BTreeSet<String>) -> Self {
        self.eligible_extensions = extensions;
        self
    }

    pub fn with_max_translated_size(mut self, size: u64) -> Self {
        self.max_translated_size = size;
        self
    }

    pub fn with_trace_level(mut self, level: TraceLevel) -> Self {
        self.trace_level = level;
        self
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn dir_mapper(&self) -> &DirMapper {
        &self.dir_mapper
    }

    pub fn eligible_extensions(&self) -> &BTreeSet<String> {
        &self.eligible_extensions
    }

    pub fn trace_level(&self) -> TraceLevel {
        self.trace_level
    }

    pub fn max_translated_size(&self) -> u64 {
        self.max_translated_size
    }

    /// The content syntax of `path` if its content should be
    /// translated, or `None` for passthrough files.
    pub fn eligibility(&self, path: &Path) -> Option<Syntax> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.eligible_extensions
            .contains(&ext)
            .then(|| Syntax::from_extension(&ext))
    }

    /// The real location of a path relative to the mount root,
    /// as seen from inside the container.
    pub fn real_path(&self, container_relative: &Path) -> PathBuf {
        self.source_root
            .join(self.dir_mapper.path_to_host(container_relative))
    }
}

/// Parse a comma-separated extension list, eg: `json,.JSONL`
///
/// A colon also separates entries, since commas already split
/// the mount options that the list may be given in.
pub fn parse_extensions(list: &str) -> Result<BTreeSet<String>, ConfigError> {
    let extensions: BTreeSet<String> = list
        .split([',', ':'])
        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect();
    if extensions.is_empty() {
        return Err(ConfigError::EmptyExtensions);
    }
    Ok(extensions)
}
