//! Coalescing of concurrent compiles for the same destination.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use jitbuild_compiler::{BuildResult, CompileError};

/// Result of a compile, cloneable so every waiting session gets a copy.
pub type SharedOutcome = Result<Arc<BuildResult>, Arc<CompileError>>;

/// A compile any number of sessions can await.
pub type SharedBuild = Shared<BoxFuture<'static, SharedOutcome>>;

/// Compiles in flight, keyed by resolved destination path.
///
/// An entry lives until its compile settles, then removes itself.
#[derive(Clone, Default)]
pub struct InFlight {
    builds: Arc<DashMap<PathBuf, SharedBuild>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the compile for `key`, or start one with `start`.
    ///
    /// Returns the shared compile and whether the caller started it.
    pub fn join_or_start<F>(&self, key: PathBuf, start: F) -> (SharedBuild, bool)
    where
        F: FnOnce() -> BoxFuture<'static, SharedOutcome>,
    {
        match self.builds.entry(key.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let builds = Arc::clone(&self.builds);
                let compile = start();
                let shared = async move {
                    let outcome = compile.await;
                    builds.remove(&key);
                    outcome
                }
                .boxed()
                .shared();
                entry.insert(shared.clone());
                (shared, true)
            }
        }
    }

    /// Number of compiles in flight.
    pub fn len(&self) -> usize {
        self.builds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builds.is_empty()
    }
}

impl std::fmt::Debug for InFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight").field("len", &self.len()).finish()
    }
}
