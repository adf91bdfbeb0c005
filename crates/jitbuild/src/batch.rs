//! Batch compilation of glob matches, for pre-deploy builds.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use futures_util::future::join_all;
use jitbuild_compiler::Compiler;
use jitbuild_telemetry::log_batch_completed;

use crate::error::ProtocolError;
use crate::protocol::{default_handle, Protocol, ProtocolConfig};
use crate::session::{Delivery, Outcome};

/// Batch configuration over matched paths.
///
/// Defaults: the matched path is the source, the destination is
/// `<stem>.compiled.<ext>` beside it, and unhandled paths (including earlier
/// batch artifacts) are skipped.
pub struct BatchConfig {
    pub protocol: ProtocolConfig<PathBuf>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        let protocol = ProtocolConfig::new(
            |path: &PathBuf| Ok(path.clone()),
            |path: &PathBuf| Ok(jitbuild_formats::compiled_path(path)?),
        )
        .with_handle(batch_handle)
        .serve_non_handled(false);
        Self { protocol }
    }
}

/// Handle known formats, except artifacts a previous batch run produced.
pub fn batch_handle(path: &Path) -> bool {
    let is_artifact = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(|stem| stem.ends_with(".compiled"));
    !is_artifact && default_handle(path)
}

impl BatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol(
        mut self,
        f: impl FnOnce(ProtocolConfig<PathBuf>) -> ProtocolConfig<PathBuf>,
    ) -> Self {
        self.protocol = f(self.protocol).serve_non_handled(false);
        self
    }
}

/// What a batch run did with every matched path.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub built: Vec<PathBuf>,
    /// Artifact was already fresh.
    pub fresh: Vec<PathBuf>,
    /// Rejected by the handle predicate.
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, ProtocolError)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of matched paths.
    pub fn total(&self) -> usize {
        self.built.len() + self.fresh.len() + self.skipped.len() + self.failed.len()
    }
}

/// Compiles every handled glob match once.
pub struct BatchCompiler {
    protocol: Protocol<PathBuf>,
}

impl BatchCompiler {
    pub fn new(compiler: Compiler, config: BatchConfig) -> Self {
        Self {
            protocol: Protocol::new(compiler, config.protocol),
        }
    }

    /// Expand `patterns` into a sorted, deduplicated path list.
    pub fn expand<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<PathBuf>, ProtocolError> {
        let mut paths = BTreeSet::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let matches = glob::glob(pattern)
                .map_err(|e| ProtocolError::Resolve(format!("invalid pattern '{pattern}': {e}")))?;
            for entry in matches {
                match entry {
                    Ok(path) if path.is_file() => {
                        paths.insert(path);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "skipping unreadable glob match"),
                }
            }
        }
        Ok(paths.into_iter().collect())
    }

    /// Build every match of `patterns`. Sessions run concurrently; a failing
    /// path is recorded and does not stop the others.
    pub async fn run<S: AsRef<str>>(&self, patterns: &[S]) -> Result<BatchReport, ProtocolError> {
        let paths = Self::expand(patterns)?;
        let handle = &self.protocol.config().handle;

        let mut report = BatchReport::default();
        let (handled, skipped): (Vec<_>, Vec<_>) =
            paths.into_iter().partition(|path| handle(path));
        report.skipped = skipped;

        let sessions = handled.into_iter().map(|path| async move {
            let result = self.protocol.run(&path, Delivery::Discard).await;
            (path, result)
        });

        for (path, result) in join_all(sessions).await {
            match result.map(|session| session.outcome) {
                Ok(Some(Outcome::CacheHit)) => report.fresh.push(path),
                Ok(Some(Outcome::Built | Outcome::Joined)) => report.built.push(path),
                Ok(_) => report.skipped.push(path),
                Err(err) => report.failed.push((path, err)),
            }
        }

        log_batch_completed!(
            built = report.built.len(),
            fresh = report.fresh.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "batch build finished"
        );
        Ok(report)
    }
}
