// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::io;
use std::sync::{Arc, Mutex};

use rstest::rstest;

use super::{TraceLevel, Tracer};

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn lines(&self) -> Vec<String> {
        let buf = self.0.lock().unwrap();
        String::from_utf8_lossy(&buf)
            .lines()
            .map(|line| line.trim().to_string())
            .collect()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capturing_tracer() -> (Captured, Tracer) {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .without_time()
        .with_ansi(false)
        .with_level(false)
        .with_target(false)
        .with_writer(move || writer.clone())
        .finish();
    (captured, Tracer::new(subscriber))
}

#[rstest]
#[case::errors_only(0, &["error"])]
#[case::info(1, &["error", "warn", "info"])]
#[case::debug(2, &["error", "warn", "info", "debug"])]
#[case::trace(3, &["error", "warn", "info", "debug", "trace"])]
#[case::beyond(9, &["error", "warn", "info", "debug", "trace"])]
fn test_level_limits_events(#[case] level: u8, #[case] expected: &[&str]) {
    let (captured, tracer) = capturing_tracer();
    let tracer = tracer.with_level(TraceLevel::new(level));
    tracer.in_scope(|| {
        tracing::error!("error");
        tracing::warn!("warn");
        tracing::info!("info");
        tracing::debug!("debug");
        tracing::trace!("trace");
    });
    assert_eq!(captured.lines(), expected);
}

#[rstest]
fn test_level_keeps_spans() {
    let (captured, tracer) = capturing_tracer();
    let tracer = tracer.with_level(TraceLevel::new(1));
    tracer.in_scope(|| {
        let span = tracing::info_span!("request", fh = 3);
        let _enter = span.enter();
        tracing::info!("served");
        tracing::debug!("hidden");
    });
    assert_eq!(captured.lines(), vec!["request{fh=3}: served"]);
}

#[rstest]
fn test_silent_records_nothing() {
    let (captured, _) = capturing_tracer();
    Tracer::silent().in_scope(|| tracing::error!("dropped"));
    assert!(captured.lines().is_empty());
}
