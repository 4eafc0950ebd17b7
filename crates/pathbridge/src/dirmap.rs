// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};

use crate::error::ConfigError;
use crate::rules::parse_rules;

#[cfg(test)]
#[path = "./dirmap_test.rs"]
mod dirmap_test;

/// Renames one directory entry between its host and container spelling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRule {
    pub host_segment: OsString,
    pub container_segment: OsString,
}

/// Maps whole path segments between host and container naming.
///
/// Only exact segment matches are renamed, a rule for `home` never
/// touches `homework`.
#[derive(Debug, Clone, Default)]
pub struct DirMapper {
    to_host: HashMap<OsString, OsString>,
    to_container: HashMap<OsString, OsString>,
}

impl DirMapper {
    pub fn new(rules: Vec<DirRule>) -> Result<Self, ConfigError> {
        let mut mapper = Self::default();
        for rule in rules {
            for segment in [&rule.host_segment, &rule.container_segment] {
                validate_segment(segment)?;
            }
            if rule.host_segment == rule.container_segment {
                return Err(ConfigError::ReflexiveRule(
                    rule.host_segment.to_string_lossy().into_owned(),
                ));
            }
            claim(
                &mut mapper.to_host,
                &rule.container_segment,
                &rule.host_segment,
            )?;
            claim(
                &mut mapper.to_container,
                &rule.host_segment,
                &rule.container_segment,
            )?;
        }
        Ok(mapper)
    }

    /// Parse and validate a `host=container;...` specification.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        Self::new(parse_dir_rules(spec)?)
    }

    pub fn is_empty(&self) -> bool {
        self.to_host.is_empty()
    }

    /// The host spelling of a single name seen by the container
    pub fn segment_to_host<'a>(&'a self, name: &'a OsStr) -> &'a OsStr {
        self.to_host.get(name).map(OsString::as_os_str).unwrap_or(name)
    }

    /// The container spelling of a single name found on the host
    pub fn segment_to_container<'a>(&'a self, name: &'a OsStr) -> &'a OsStr {
        self.to_container
            .get(name)
            .map(OsString::as_os_str)
            .unwrap_or(name)
    }

    /// Rename every segment of a container-relative path to its host spelling.
    pub fn path_to_host(&self, path: &Path) -> PathBuf {
        self.map_path(path, |name| self.segment_to_host(name))
    }

    /// Rename every segment of a host-relative path to its container spelling.
    pub fn path_to_container(&self, path: &Path) -> PathBuf {
        self.map_path(path, |name| self.segment_to_container(name))
    }

    fn map_path<'a, F>(&'a self, path: &'a Path, map: F) -> PathBuf
    where
        F: Fn(&'a OsStr) -> &'a OsStr,
    {
        if self.is_empty() {
            return path.to_path_buf();
        }
        path.components()
            .map(|component| match component {
                Component::Normal(name) => map(name),
                other => other.as_os_str(),
            })
            .collect()
    }
}

/// Split a `host=container;...` specification into directory rules,
/// without validating the segments themselves.
pub fn parse_dir_rules(spec: &str) -> Result<Vec<DirRule>, ConfigError> {
    let rules = parse_rules(spec)?
        .into_iter()
        .map(|(host, container)| DirRule {
            host_segment: host.into(),
            container_segment: container.into(),
        })
        .collect();
    Ok(rules)
}

fn validate_segment(segment: &OsStr) -> Result<(), ConfigError> {
    let text = segment.to_string_lossy();
    if text.is_empty() || text == "." || text == ".." || text.contains('/') || text.contains('\0')
    {
        return Err(ConfigError::InvalidSegment(text.into_owned()));
    }
    Ok(())
}

fn claim(
    table: &mut HashMap<OsString, OsString>,
    key: &OsStr,
    value: &OsStr,
) -> Result<(), ConfigError> {
    match table.get(key) {
        Some(existing) if existing == value => Ok(()),
        Some(existing) => Err(ConfigError::AmbiguousDirMapping {
            segment: key.to_string_lossy().into_owned(),
            first: existing.to_string_lossy().into_owned(),
            second: value.to_string_lossy().into_owned(),
        }),
        None => {
            table.insert(key.to_owned(), value.to_owned());
            Ok(())
        }
    }
}
