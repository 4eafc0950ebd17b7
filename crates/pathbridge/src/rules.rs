// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Path mapping rules and their compiled, per-direction pattern tables.

use std::borrow::Cow;
use std::collections::HashMap;

use crate::error::ConfigError;
use crate::translate::PatternTable;

#[cfg(test)]
#[path = "./rules_test.rs"]
mod rules_test;

/// The separator between entries of a rule specification string
pub const RULE_SEPARATOR: char = ';';

/// Which way content is crossing the mount boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Real file content being presented inside the container
    HostToContainer,
    /// Container writes being persisted to the real file
    ContainerToHost,
}

impl Direction {
    pub fn inverse(self) -> Self {
        match self {
            Self::HostToContainer => Self::ContainerToHost,
            Self::ContainerToHost => Self::HostToContainer,
        }
    }
}

/// One bidirectional substitution between a host path and a container path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRule {
    host: String,
    container: String,
}

impl MappingRule {
    pub fn new<H: Into<String>, C: Into<String>>(host: H, container: C) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// The token that is searched for when translating in `direction`
    pub fn from(&self, direction: Direction) -> &str {
        match direction {
            Direction::HostToContainer => &self.host,
            Direction::ContainerToHost => &self.container,
        }
    }

    /// The token that replaces [`Self::from`] when translating in `direction`
    pub fn to(&self, direction: Direction) -> &str {
        self.from(direction.inverse())
    }

    /// The `(from, to)` pairs for both the raw and the json-escaped
    /// spelling of this rule.
    ///
    /// A `from` token without backslashes is spelled the same way inside
    /// json strings, in which case json content gets the escaped `to`.
    fn variants(&self, direction: Direction, syntax: Syntax) -> Vec<(String, String)> {
        let from = self.from(direction);
        let to = self.to(direction);
        match json_escape(from) {
            Cow::Owned(escaped_from) => vec![
                (from.to_string(), to.to_string()),
                (escaped_from, json_escape(to).into_owned()),
            ],
            Cow::Borrowed(_) => match syntax {
                Syntax::Plain => vec![(from.to_string(), to.to_string())],
                Syntax::Json => vec![(from.to_string(), json_escape(to).into_owned())],
            },
        }
    }
}

/// How path strings are spelled inside a file's content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Syntax {
    /// Paths appear verbatim
    Plain,
    /// Paths appear inside json string literals, with escaped backslashes
    Json,
}

impl Syntax {
    /// The syntax implied by a (lowercase) file extension
    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "json" | "jsonl" | "ndjson" => Self::Json,
            _ => Self::Plain,
        }
    }
}

/// Double every backslash, the way a json string encodes it.
pub fn json_escape(token: &str) -> Cow<'_, str> {
    if token.contains('\\') {
        Cow::Owned(token.replace('\\', "\\\\"))
    } else {
        Cow::Borrowed(token)
    }
}

/// A validated collection of [`MappingRule`]s, compiled for both directions.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<MappingRule>,
    // indexed by [`Self::slot`]
    tables: [PatternTable; 4],
}

impl RuleSet {
    /// Validate and compile the given rules.
    pub fn new(rules: Vec<MappingRule>) -> Result<Self, ConfigError> {
        let mut unique: Vec<MappingRule> = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.host.is_empty() || rule.container.is_empty() {
                return Err(ConfigError::MalformedRule(format!(
                    "{}={}",
                    rule.host, rule.container
                )));
            }
            if rule.host == rule.container {
                return Err(ConfigError::ReflexiveRule(rule.host));
            }
            if unique.contains(&rule) {
                tracing::debug!(host = %rule.host, container = %rule.container, "dropping duplicate rule");
                continue;
            }
            unique.push(rule);
        }

        for direction in [Direction::HostToContainer, Direction::ContainerToHost] {
            for (i, rule) in unique.iter().enumerate() {
                for (j, other) in unique.iter().enumerate() {
                    if i != j && other.from(direction).contains(rule.to(direction)) {
                        return Err(ConfigError::OverlappingRule {
                            to: rule.to(direction).to_string(),
                            from: other.from(direction).to_string(),
                        });
                    }
                }
            }
        }

        let tables = [
            Self::compile(&unique, Direction::HostToContainer, Syntax::Plain)?,
            Self::compile(&unique, Direction::HostToContainer, Syntax::Json)?,
            Self::compile(&unique, Direction::ContainerToHost, Syntax::Plain)?,
            Self::compile(&unique, Direction::ContainerToHost, Syntax::Json)?,
        ];
        Ok(Self {
            rules: unique,
            tables,
        })
    }

    /// Parse and validate a rule specification string.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let rules = parse_rules(spec)?
            .into_iter()
            .map(|(host, container)| MappingRule::new(host, container))
            .collect();
        Self::new(rules)
    }

    fn slot(direction: Direction, syntax: Syntax) -> usize {
        match (direction, syntax) {
            (Direction::HostToContainer, Syntax::Plain) => 0,
            (Direction::HostToContainer, Syntax::Json) => 1,
            (Direction::ContainerToHost, Syntax::Plain) => 2,
            (Direction::ContainerToHost, Syntax::Json) => 3,
        }
    }

    fn compile(
        rules: &[MappingRule],
        direction: Direction,
        syntax: Syntax,
    ) -> Result<PatternTable, ConfigError> {
        let mut seen: HashMap<String, String> = HashMap::new();
        let mut pairs = Vec::new();
        for rule in rules {
            for (from, to) in rule.variants(direction, syntax) {
                match seen.get(&from) {
                    Some(existing) if existing == &to => continue,
                    Some(existing) => {
                        return Err(ConfigError::AmbiguousMapping {
                            from,
                            first: existing.clone(),
                            second: to,
                        });
                    }
                    None => {
                        seen.insert(from.clone(), to.clone());
                        pairs.push((from.into_bytes(), to.into_bytes()));
                    }
                }
            }
        }
        Ok(PatternTable::new(pairs))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MappingRule> {
        self.rules.iter()
    }

    /// The compiled patterns used to translate `syntax` content in `direction`
    pub fn table(&self, direction: Direction, syntax: Syntax) -> &PatternTable {
        &self.tables[Self::slot(direction, syntax)]
    }

    /// Rewrite every configured token in `input`, see [`crate::translate()`].
    pub fn translate<'a>(
        &self,
        direction: Direction,
        syntax: Syntax,
        input: &'a [u8],
    ) -> Cow<'a, [u8]> {
        crate::translate::translate(input, self.table(direction, syntax))
    }
}

/// Split a `from=to;from=to` specification into its pairs.
///
/// Entries are split at their first `=` and trimmed of surrounding
/// whitespace. Empty entries are ignored so that trailing separators
/// are harmless.
pub fn parse_rules(spec: &str) -> Result<Vec<(String, String)>, ConfigError> {
    spec.split(RULE_SEPARATOR)
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((from, to)) if !from.trim().is_empty() && !to.trim().is_empty() => {
                Ok((from.trim().to_string(), to.trim().to_string()))
            }
            _ => Err(ConfigError::MalformedRule(entry.to_string())),
        })
        .collect()
}
