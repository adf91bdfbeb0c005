//! Compiler adapter for jitbuild.
//!
//! Merges layered options, drives a pluggable compiler [`Engine`], rewrites
//! default exports in its output and publishes artifacts atomically.

pub mod build;
pub mod command;
pub mod engine;
pub mod error;
pub mod observer;
pub mod options;
pub mod publish;
pub mod rewrite;

pub use build::{BuildResult, BuildSource, Compiler, CompilerConfig};
pub use command::{CommandEngine, CommandSpec, CommandTable, ConfigError, DEFAULT_COMMAND};
pub use engine::{
    resolve_root_import, Engine, EngineError, EngineOptions, EngineOutput, Message, OutputFile,
    PluginSpec, StdinInput, ROOT_PLUGIN, SASS_PLUGIN, VUE_PLUGIN,
};
pub use error::CompileError;
pub use observer::{format_bytes, format_duration, BuildObserver, LogObserver, Observers};
pub use options::{resolve_engine_options, AdapterOptions, BuildOptions, EngineDefaults};
pub use publish::{write_artifact, FileStamp, PublishOptions};
pub use rewrite::RewriteExport;
