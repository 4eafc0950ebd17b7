// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! The byte-level substitution engine.
//!
//! Translation is a single left-to-right scan over the input. At every
//! position the longest pattern that matches is replaced and the scan
//! continues after the matched span, so emitted text is never rescanned
//! and a more specific token is never shadowed by a shorter prefix of it.
//! The engine works on raw bytes and cannot fail: content that is not valid
//! utf-8 is copied through untouched.

use std::borrow::Cow;

#[cfg(test)]
#[path = "./translate_test.rs"]
mod translate_test;

/// A set of `(from, to)` byte patterns, ordered for longest-match lookup.
#[derive(Debug, Clone, Default)]
pub struct PatternTable {
    /// Sorted by descending `from` length
    patterns: Vec<(Vec<u8>, Vec<u8>)>,
    /// For each leading byte, the indices into `patterns` that start with it,
    /// preserving the longest-first order
    by_first_byte: Vec<Vec<usize>>,
}

impl PatternTable {
    pub fn new(mut patterns: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        patterns.retain(|(from, _)| !from.is_empty());
        // stable, so that equal-length patterns keep their configured order
        patterns.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        let mut by_first_byte = vec![Vec::new(); 256];
        for (index, (from, _)) in patterns.iter().enumerate() {
            by_first_byte[from[0] as usize].push(index);
        }
        Self {
            patterns,
            by_first_byte,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The longest pattern matching at the start of `input`, if any
    pub(crate) fn longest_match(&self, input: &[u8]) -> Option<&(Vec<u8>, Vec<u8>)> {
        let first = *input.first()?;
        self.by_first_byte
            .get(first as usize)?
            .iter()
            .map(|index| &self.patterns[*index])
            .find(|(from, _)| input.starts_with(from))
    }
}

/// Rewrite every pattern of `table` found in `input`.
///
/// The input is returned borrowed when nothing matched.
pub fn translate<'a>(input: &'a [u8], table: &PatternTable) -> Cow<'a, [u8]> {
    if table.is_empty() {
        return Cow::Borrowed(input);
    }

    let mut output: Option<Vec<u8>> = None;
    // start of the input that has not yet been copied to the output
    let mut pending = 0;
    let mut cursor = 0;
    while cursor < input.len() {
        match table.longest_match(&input[cursor..]) {
            Some((from, to)) => {
                let out = output.get_or_insert_with(|| Vec::with_capacity(input.len()));
                out.extend_from_slice(&input[pending..cursor]);
                out.extend_from_slice(to);
                cursor += from.len();
                pending = cursor;
            }
            None => cursor += 1,
        }
    }

    match output {
        None => Cow::Borrowed(input),
        Some(mut out) => {
            out.extend_from_slice(&input[pending..]);
            Cow::Owned(out)
        }
    }
}
