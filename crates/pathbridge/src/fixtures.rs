// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use rstest::fixture;
use tempfile::TempDir;

use crate::{MappingRule, MountConfig, RuleSet};

#[allow(dead_code)]
pub fn init_logging() {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::TRACE)
        .without_time()
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(sub);
}

#[fixture]
pub fn tmpdir() -> TempDir {
    tempfile::Builder::new()
        .prefix("pathbridge-test-")
        .tempdir()
        .expect("failed to create dir for test")
}

/// The rules of a typical windows host sharing a project with a container
#[fixture]
pub fn windows_rules() -> RuleSet {
    RuleSet::new(vec![
        MappingRule::new(r"C:\Users\dev\project", "/workspace"),
        MappingRule::new(r"C:\Users\dev", "/home/dev"),
    ])
    .expect("valid rules")
}

/// A mount over a fresh temporary directory using [`windows_rules`]
#[fixture]
pub fn windows_mount(tmpdir: TempDir, windows_rules: RuleSet) -> (TempDir, MountConfig) {
    let config = MountConfig::new(tmpdir.path())
        .expect("tmpdir is a valid source")
        .with_rules(windows_rules);
    (tmpdir, config)
}
