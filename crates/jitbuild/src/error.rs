use std::path::PathBuf;
use std::sync::Arc;

use jitbuild_compiler::CompileError;
use jitbuild_formats::FormatError;
use thiserror::Error;

/// Errors ending a build session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The resolved source does not exist.
    #[error("source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    /// The resolved source normalizes outside the confinement root.
    #[error("path {} escapes root {}", .path.display(), .root.display())]
    PathEscape { path: PathBuf, root: PathBuf },

    /// The source was accepted for compilation but no format handles it.
    #[error(transparent)]
    UnsupportedFormat(#[from] FormatError),

    /// Writing, stamping or renaming the artifact failed.
    #[error("failed to publish artifact: {0}")]
    WriteFailure(#[source] CompileError),

    /// The compile itself failed. Shared between coalesced sessions.
    #[error("{0}")]
    BuildFailure(Arc<CompileError>),

    /// Any other filesystem failure.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A caller resolver refused the input.
    #[error("failed to resolve path: {0}")]
    Resolve(String),
}

impl ProtocolError {
    /// Short machine-readable name, used for metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::SourceNotFound(_) => "source_not_found",
            ProtocolError::PathEscape { .. } => "path_escape",
            ProtocolError::UnsupportedFormat(_) => "unsupported_format",
            ProtocolError::WriteFailure(_) => "write_failure",
            ProtocolError::BuildFailure(_) => "build_failure",
            ProtocolError::Io { .. } => "io",
            ProtocolError::Resolve(_) => "resolve",
        }
    }

    /// Whether this is the user-facing "not found" case.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProtocolError::SourceNotFound(_))
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ProtocolError::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify an error raised while publishing.
    pub(crate) fn from_publish(err: CompileError) -> Self {
        match err {
            CompileError::Write { .. } => ProtocolError::WriteFailure(err),
            other => ProtocolError::BuildFailure(Arc::new(other)),
        }
    }
}
