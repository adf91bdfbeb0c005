use std::path::PathBuf;

use thiserror::Error;

use crate::engine::{EngineError, Message};

/// Errors produced by the compiler adapter.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Neither an entry point nor inline source was given.
    #[error("must specify at least one entry point")]
    NoEntryPoint,

    /// The engine was asked to write to disk, bypassing output post-processing.
    #[error("build requires write mode to be off when compiling entry points")]
    IncompatibleWriteMode,

    /// The source format is not supported.
    #[error(transparent)]
    UnsupportedFormat(#[from] jitbuild_formats::FormatError),

    /// The engine failed or reported errors.
    #[error("build failed: {}", format_messages(.0))]
    BuildFailure(Vec<Message>),

    /// The engine returned nothing to publish.
    #[error("no output files returned by the engine")]
    EmptyOutput,

    /// Several output units exist and no index was given.
    #[error("{0} output files returned by the engine, specify which one to publish")]
    AmbiguousOutput(usize),

    /// The requested output index does not exist.
    #[error("output index {index} out of range ({count} output files)")]
    OutputIndex { index: usize, count: usize },

    /// Writing, stamping or renaming the artifact failed.
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl From<EngineError> for CompileError {
    fn from(err: EngineError) -> Self {
        CompileError::BuildFailure(vec![Message::new(err.to_string())])
    }
}

fn format_messages(messages: &[Message]) -> String {
    messages
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
