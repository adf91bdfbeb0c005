//! Session lifecycle hooks.
//!
//! `on_cache_miss` fires before a compile starts, `on_cache_hit` when one is
//! skipped and `on_built` after a new artifact is published. Errors go to
//! `on_error`, except a missing source which is not a fault.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use jitbuild_compiler::BuildResult;
use jitbuild_telemetry::{
    log_build_completed, log_cache_hit, log_cache_miss, log_passthrough, log_session_error,
    MetricsRegistry,
};

use crate::error::ProtocolError;
use crate::session::Session;

/// Receives session notifications. Every method defaults to a no-op.
pub trait SessionObserver: Send + Sync {
    fn on_started(&self, _session: &Session) {}

    fn on_cache_hit(&self, _session: &Session) {}

    fn on_cache_miss(&self, _session: &Session) {}

    /// The session awaited a compile started by another session.
    fn on_joined(&self, _session: &Session) {}

    fn on_built(&self, _session: &Session, _result: &BuildResult) {}

    fn on_passthrough(&self, _session: &Session) {}

    fn on_error(&self, _error: &ProtocolError, _session: &Session) {}

    fn on_finished(&self, _session: &Session) {}
}

/// An ordered set of session observers. A panicking observer is logged and
/// skipped.
#[derive(Clone, Default)]
pub struct SessionObservers(Vec<Arc<dyn SessionObserver>>);

impl SessionObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Arc<dyn SessionObserver>) {
        self.0.push(observer);
    }

    pub fn with(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.push(observer);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn emit(&self, hook: &str, f: impl Fn(&dyn SessionObserver)) {
        for observer in &self.0 {
            if catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))).is_err() {
                tracing::warn!(hook, "session observer panicked");
            }
        }
    }
}

impl fmt::Debug for SessionObservers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionObservers")
            .field("count", &self.0.len())
            .finish()
    }
}

/// Reports session events through `tracing`. The default error reporter.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl SessionObserver for TracingReporter {
    fn on_cache_hit(&self, session: &Session) {
        log_cache_hit!(
            source = %session.source_path.display(),
            dest = ?session.dest_path,
            "using cached build"
        );
    }

    fn on_cache_miss(&self, session: &Session) {
        log_cache_miss!(
            source = %session.source_path.display(),
            format = session.format_title(),
            "building"
        );
    }

    fn on_joined(&self, session: &Session) {
        tracing::debug!(
            source = %session.source_path.display(),
            "joined build in flight"
        );
    }

    fn on_built(&self, session: &Session, result: &BuildResult) {
        log_build_completed!(
            source = %session.source_path.display(),
            dest = ?session.dest_path,
            size = result.dest_size,
            duration_ms = result.build_time.as_millis() as u64,
            warnings = result.warnings.len(),
            "published"
        );
    }

    fn on_passthrough(&self, session: &Session) {
        log_passthrough!(source = %session.source_path.display(), "serving raw");
    }

    fn on_error(&self, error: &ProtocolError, session: &Session) {
        log_session_error!(
            kind = error.kind(),
            source = %session.source_path.display(),
            error = %error,
            "build session failed"
        );
    }
}

/// Feeds session events into the metrics registry.
#[derive(Clone)]
pub struct MetricsObserver {
    metrics: Arc<MetricsRegistry>,
}

impl MetricsObserver {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self { metrics }
    }
}

impl SessionObserver for MetricsObserver {
    fn on_started(&self, _session: &Session) {
        self.metrics.session_started();
    }

    fn on_cache_hit(&self, session: &Session) {
        self.metrics.record_cache_lookup(session.format_title(), true);
    }

    fn on_cache_miss(&self, session: &Session) {
        self.metrics.record_cache_lookup(session.format_title(), false);
    }

    fn on_joined(&self, _session: &Session) {
        self.metrics.record_coalesced();
    }

    fn on_built(&self, session: &Session, result: &BuildResult) {
        self.metrics.record_build(
            session.format_title(),
            true,
            result.build_time.as_secs_f64(),
            result.dest_size as u64,
        );
    }

    fn on_passthrough(&self, _session: &Session) {
        self.metrics.record_passthrough();
    }

    fn on_error(&self, error: &ProtocolError, session: &Session) {
        self.metrics.record_session_error(error.kind());
        if matches!(error, ProtocolError::BuildFailure(_)) {
            self.metrics
                .record_build(session.format_title(), false, 0.0, 0);
        }
    }

    fn on_finished(&self, _session: &Session) {
        self.metrics.session_finished();
    }
}
