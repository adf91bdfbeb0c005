//! Cache validity by modification-time drift.
//!
//! An artifact is fresh when its mtime lies within `hash_drift` of the
//! source's. Publishing copies the source's timestamps onto the artifact, so a
//! freshly built artifact has a drift of zero. Contents are never compared.

use std::sync::Arc;
use std::time::Duration;

use jitbuild_compiler::FileStamp;

/// Default tolerance between source and artifact modification times.
pub const DEFAULT_HASH_DRIFT: Duration = Duration::from_millis(250);

/// Caller-supplied replacement for the drift comparison. Only called when an
/// artifact exists.
pub type FreshnessFn = Arc<dyn Fn(&FileStamp, &FileStamp) -> bool + Send + Sync>;

/// How a session decides between cache hit and miss.
#[derive(Clone)]
pub struct Freshness {
    pub hash_drift: Duration,
    /// Any existing artifact is a hit, regardless of drift.
    pub immutable: bool,
    /// Always rebuild.
    pub force: bool,
    pub check: Option<FreshnessFn>,
}

impl Default for Freshness {
    fn default() -> Self {
        Self {
            hash_drift: DEFAULT_HASH_DRIFT,
            immutable: false,
            force: false,
            check: None,
        }
    }
}

impl std::fmt::Debug for Freshness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Freshness")
            .field("hash_drift", &self.hash_drift)
            .field("immutable", &self.immutable)
            .field("force", &self.force)
            .field("check", &self.check.as_ref().map(|_| ".."))
            .finish()
    }
}

impl Freshness {
    pub fn with_hash_drift(mut self, drift: Duration) -> Self {
        self.hash_drift = drift;
        self
    }

    pub fn immutable(mut self, immutable: bool) -> Self {
        self.immutable = immutable;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&FileStamp, &FileStamp) -> bool + Send + Sync + 'static,
    {
        self.check = Some(Arc::new(check));
        self
    }

    /// Whether the artifact described by `dest` can be served as-is.
    ///
    /// `force` wins over `immutable`. A missing artifact is always a miss.
    pub fn is_fresh(&self, source: &FileStamp, dest: Option<&FileStamp>) -> bool {
        if self.force {
            return false;
        }
        let Some(dest) = dest else {
            return false;
        };
        if self.immutable {
            return true;
        }
        match &self.check {
            Some(check) => check(source, dest),
            None => drift(source, dest) <= self.hash_drift.as_nanos(),
        }
    }
}

/// Absolute difference between two modification times, in nanoseconds.
pub fn drift(a: &FileStamp, b: &FileStamp) -> u128 {
    (a.modified_nanos() - b.modified_nanos()).unsigned_abs()
}
