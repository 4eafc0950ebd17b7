// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Path translation between host and container conventions.
//!
//! Provides the configuration, translation engine and per-file state
//! that back the path-mapping filesystem in `pathbridge-vfs`.

#![deny(unsafe_op_in_unsafe_fn)]

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
pub mod fixtures;

pub mod config;
pub mod dirmap;
mod error;
pub mod file;
pub mod rules;
mod trace;
pub mod translate;

pub use config::{MountConfig, RawOptions};
pub use dirmap::{DirMapper, DirRule, parse_dir_rules};
pub use error::{ConfigError, Error, OsError, Result};
pub use file::{OpenFile, OpenFlags, TranslationCache};
pub use rules::{Direction, MappingRule, RuleSet, Syntax, parse_rules};
pub use trace::{TraceLevel, Tracer};
pub use translate::translate;
