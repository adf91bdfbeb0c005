//! Build lifecycle observers.
//!
//! Observers are notified before the engine runs and after a result is
//! published. They exist purely for side effects: a panicking observer is
//! logged and otherwise ignored.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::build::BuildResult;

/// Receives `building` and `built` notifications.
pub trait BuildObserver: Send + Sync {
    /// A build for `source` is about to start.
    fn on_building(&self, _source: &Path) {}

    /// `result` has just been published.
    fn on_built(&self, _result: &BuildResult) {}
}

/// An ordered set of observers.
#[derive(Clone, Default)]
pub struct Observers(Vec<Arc<dyn BuildObserver>>);

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Arc<dyn BuildObserver>) {
        self.0.push(observer);
    }

    pub fn with(mut self, observer: Arc<dyn BuildObserver>) -> Self {
        self.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn building(&self, source: &Path) {
        for observer in &self.0 {
            notify("building", || observer.on_building(source));
        }
    }

    pub(crate) fn built(&self, result: &BuildResult) {
        for observer in &self.0 {
            notify("built", || observer.on_built(result));
        }
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers").field("count", &self.0.len()).finish()
    }
}

fn notify(event: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!(event, "build observer panicked");
    }
}

/// Logs every build through `tracing`.
#[derive(Debug, Clone)]
pub struct LogObserver {
    log_building: bool,
    log_built: bool,
    root: Option<PathBuf>,
}

impl Default for LogObserver {
    fn default() -> Self {
        Self {
            log_building: true,
            log_built: true,
            root: None,
        }
    }
}

impl LogObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Show paths relative to `root`.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn log_building(mut self, enabled: bool) -> Self {
        self.log_building = enabled;
        self
    }

    pub fn log_built(mut self, enabled: bool) -> Self {
        self.log_built = enabled;
        self
    }

    /// Format a path for display, trimming the configured root.
    pub fn format_path(&self, path: &Path) -> String {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        };

        match &self.root {
            Some(root) => match absolute.strip_prefix(root) {
                Ok(relative) => format!("/{}", relative.display()),
                Err(_) => absolute.display().to_string(),
            },
            None => absolute.display().to_string(),
        }
    }
}

impl BuildObserver for LogObserver {
    fn on_building(&self, source: &Path) {
        if self.log_building {
            tracing::info!(source = %self.format_path(source), "Building");
        }
    }

    fn on_built(&self, result: &BuildResult) {
        if !self.log_built {
            return;
        }
        let source_size = result
            .source_stats
            .map(|stats| stats.size)
            .or_else(|| {
                result
                    .source
                    .path()
                    .and_then(|p| std::fs::metadata(p).ok())
                    .map(|m| m.len())
            });

        tracing::info!(
            source = %self.format_path(result.source.display_path()),
            source_size = %source_size.map(format_bytes).unwrap_or_else(|| "?".into()),
            dest = %self.format_path(&result.dest),
            dest_size = %format_bytes(result.dest_size as u64),
            build_time = %format_duration(result.build_time),
            "Built"
        );
    }
}

/// Human readable byte count (`512 B`, `1.5 KB`, `2.0 MB`).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Human readable duration (`850ms`, `1.2s`).
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1000 {
        format!("{millis}ms")
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}
