//! Per-attempt session state and result delivery.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use jitbuild_compiler::{BuildResult, FileStamp};
use jitbuild_formats::Format;
use tokio::sync::oneshot;

/// Where a session is in the freshness protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Init,
    Resolving,
    CacheHit,
    CacheMiss,
    Compiling,
    Publishing,
    Served,
    /// Not handled and raw serving is disabled.
    Forbidden,
    Errored,
}

/// How a successful session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Served raw, never compiled.
    Passthrough,
    /// Not handled and raw serving disabled. Nothing was delivered.
    Forbidden,
    /// The existing artifact was fresh.
    CacheHit,
    /// Compiled and published by this session.
    Built,
    /// Joined a compile already in flight for the same destination.
    Joined,
}

/// One source/destination/swap triple tracked through the protocol.
///
/// `build_result` is present exactly when the session compiled or joined a
/// compile, which only happens when `fresh` is false.
#[derive(Debug, Default)]
pub struct Session {
    pub state: SessionState,
    pub source_path: PathBuf,
    pub source_stats: Option<FileStamp>,
    pub source_format: Option<&'static Format>,
    pub dest_path: Option<PathBuf>,
    pub dest_stats: Option<FileStamp>,
    pub swap_path: Option<PathBuf>,
    /// Set once the swap file has been renamed into place.
    pub swap_consumed: bool,
    pub fresh: Option<bool>,
    pub build_result: Option<Arc<BuildResult>>,
    pub outcome: Option<Outcome>,
}

impl Session {
    /// Format title for logs and metric labels.
    pub fn format_title(&self) -> &'static str {
        self.source_format.map_or("passthrough", |format| format.title)
    }
}

/// Bytes handed back to whoever started the session.
#[derive(Debug, Clone)]
pub struct Served {
    pub body: Bytes,
    pub content_type: Option<&'static str>,
}

/// Where served bytes go.
#[derive(Debug)]
pub enum Delivery {
    /// Nobody reads the result. Cache hits skip reading the artifact.
    Discard,
    /// Send the bytes as soon as they are known, before publishing finishes.
    Channel(oneshot::Sender<Served>),
}

impl Delivery {
    pub fn channel() -> (Self, oneshot::Receiver<Served>) {
        let (tx, rx) = oneshot::channel();
        (Delivery::Channel(tx), rx)
    }

    pub fn wants_body(&self) -> bool {
        match self {
            Delivery::Discard => false,
            Delivery::Channel(tx) => !tx.is_closed(),
        }
    }

    pub(crate) fn deliver(self, served: Served) {
        if let Delivery::Channel(tx) = self {
            // The receiver going away does not stop the session.
            let _ = tx.send(served);
        }
    }
}
