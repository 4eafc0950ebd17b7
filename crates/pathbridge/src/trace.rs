// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use tracing::level_filters::LevelFilter;
use tracing::span::{Attributes, Id, Record};
use tracing_core::span::Current;
use tracing::subscriber::{Interest, Subscriber};
use tracing::{Dispatch, Event, Metadata};

#[cfg(test)]
#[path = "./trace_test.rs"]
mod trace_test;

/// The verbosity of translation tracing for a mount.
///
/// Zero keeps the mount silent apart from errors that risk data loss,
/// each step up adds more detail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TraceLevel(u8);

impl TraceLevel {
    pub const SILENT: TraceLevel = TraceLevel(0);

    pub fn new(level: u8) -> Self {
        Self(level)
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    /// The most verbose level of event that should be recorded
    pub fn filter(&self) -> LevelFilter {
        match self.0 {
            0 => LevelFilter::ERROR,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

/// The logging sink that a mount writes to.
///
/// The tracer is created and owned by the caller, the mount only
/// scopes its work to it so that several mounts (or tests) in one
/// process never share hidden logging state.
#[derive(Clone, Debug)]
pub struct Tracer {
    dispatch: Dispatch,
}

impl Tracer {
    pub fn new(dispatch: impl Into<Dispatch>) -> Self {
        Self {
            dispatch: dispatch.into(),
        }
    }

    /// Capture whatever subscriber is currently in effect for this thread.
    pub fn current() -> Self {
        Self::new(tracing::dispatcher::get_default(Dispatch::clone))
    }

    /// A tracer that discards everything.
    pub fn silent() -> Self {
        Self::new(Dispatch::none())
    }

    /// Limit this tracer to the events and spans enabled at `level`.
    ///
    /// Everything that passes is still subject to the filtering of the
    /// wrapped subscriber.
    pub fn with_level(self, level: TraceLevel) -> Self {
        Self::new(LevelLimited {
            inner: self.dispatch,
            max: level.filter(),
        })
    }

    /// Run `f` with this tracer as the default subscriber.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}

/// Forwards to another dispatch, dropping anything more verbose than `max`.
struct LevelLimited {
    inner: Dispatch,
    max: LevelFilter,
}

impl Subscriber for LevelLimited {
    fn register_callsite(&self, metadata: &'static Metadata<'static>) -> Interest {
        if *metadata.level() > self.max {
            // interest is shared with every other dispatch in the process
            return Interest::sometimes();
        }
        self.inner.register_callsite(metadata)
    }

    fn max_level_hint(&self) -> Option<LevelFilter> {
        let inner = self.inner.max_level_hint().unwrap_or(LevelFilter::TRACE);
        Some(inner.min(self.max))
    }

    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        *metadata.level() <= self.max && self.inner.enabled(metadata)
    }

    fn new_span(&self, span: &Attributes<'_>) -> Id {
        self.inner.new_span(span)
    }

    fn record(&self, span: &Id, values: &Record<'_>) {
        self.inner.record(span, values)
    }

    fn record_follows_from(&self, span: &Id, follows: &Id) {
        self.inner.record_follows_from(span, follows)
    }

    fn event_enabled(&self, event: &Event<'_>) -> bool {
        self.inner.event_enabled(event)
    }

    fn event(&self, event: &Event<'_>) {
        self.inner.event(event)
    }

    fn enter(&self, span: &Id) {
        self.inner.enter(span)
    }

    fn exit(&self, span: &Id) {
        self.inner.exit(span)
    }

    fn clone_span(&self, id: &Id) -> Id {
        self.inner.clone_span(id)
    }

    fn try_close(&self, id: Id) -> bool {
        self.inner.try_close(id)
    }

    fn current_span(&self) -> Current {
        self.inner.current_span()
    }
}
