//! The compiler adapter: run the engine, normalize its response, publish.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::{Engine, Message, OutputFile};
use crate::error::CompileError;
use crate::observer::Observers;
use crate::options::{resolve_engine_options, AdapterOptions, BuildOptions, EngineDefaults};
use crate::publish::{write_artifact, FileStamp, PublishOptions};

/// Process-wide compiler configuration, fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct CompilerConfig {
    pub defaults: EngineDefaults,
    pub observers: Observers,
}

/// Where a build's source came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildSource {
    /// A file on disk.
    Path(PathBuf),
    /// Inline contents with a virtual file name.
    Stdin(PathBuf),
}

impl BuildSource {
    /// The on-disk path, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            BuildSource::Path(path) => Some(path),
            BuildSource::Stdin(_) => None,
        }
    }

    /// A path suitable for logs.
    pub fn display_path(&self) -> &Path {
        match self {
            BuildSource::Path(path) | BuildSource::Stdin(path) => path,
        }
    }
}

/// Compiles sources through an [`Engine`].
#[derive(Clone)]
pub struct Compiler {
    engine: Arc<dyn Engine>,
    config: CompilerConfig,
}

impl Compiler {
    pub fn new(engine: Arc<dyn Engine>, config: CompilerConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Compile one source.
    ///
    /// Validation happens before any I/O. Engine errors, a non-empty error
    /// list and an empty output all fail the build.
    pub async fn compile(
        &self,
        build: BuildOptions,
        adapter: AdapterOptions,
    ) -> Result<BuildResult, CompileError> {
        build.validate()?;

        let source = match (build.entry_points.first(), &build.stdin) {
            (Some(entry), _) => BuildSource::Path(entry.clone()),
            (None, Some(stdin)) => BuildSource::Stdin(stdin.sourcefile.clone()),
            (None, None) => return Err(CompileError::NoEntryPoint),
        };

        let dest = computed_dest(
            source.display_path(),
            build.outdir.as_deref(),
            adapter.preserve_extension,
        )?;

        let options = resolve_engine_options(&self.config.defaults, &build, &adapter);

        self.config.observers.building(source.display_path());
        let started = Instant::now();
        let output = self.engine.build(&options).await?;
        let build_time = started.elapsed();

        if !output.errors.is_empty() {
            return Err(CompileError::BuildFailure(output.errors));
        }
        if output.output_files.is_empty() {
            return Err(CompileError::EmptyOutput);
        }

        let output_files = match &adapter.rewrite_export {
            Some(rule) => output
                .output_files
                .into_iter()
                .map(|file| OutputFile {
                    text: rule.apply(&file.text),
                    path: file.path,
                })
                .collect(),
            None => output.output_files,
        };

        let dest_size = output_files.first().map_or(0, |file| file.text.len());

        Ok(BuildResult {
            output_files,
            source,
            dest,
            dest_size,
            build_time,
            warnings: output.warnings,
            source_stats: adapter.source_stats,
            observers: self.config.observers.clone(),
        })
    }
}

fn computed_dest(
    source: &Path,
    outdir: Option<&Path>,
    preserve_extension: bool,
) -> Result<PathBuf, CompileError> {
    let out = jitbuild_formats::output_path(source, preserve_extension)?;
    Ok(match (outdir, out.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => out,
    })
}

/// A finished build, ready to be published any number of times.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub output_files: Vec<OutputFile>,
    pub source: BuildSource,
    /// Destination computed from the source and adapter options.
    pub dest: PathBuf,
    /// Size in bytes of the primary output unit.
    pub dest_size: usize,
    pub build_time: Duration,
    pub warnings: Vec<Message>,
    pub source_stats: Option<FileStamp>,
    observers: Observers,
}

impl BuildResult {
    /// The first output unit.
    pub fn primary(&self) -> Option<&OutputFile> {
        self.output_files.first()
    }

    /// Pick the output unit a publish call refers to.
    pub fn select(&self, index: Option<usize>) -> Result<&OutputFile, CompileError> {
        let count = self.output_files.len();
        match (index, count) {
            (_, 0) => Err(CompileError::EmptyOutput),
            (Some(index), _) => self
                .output_files
                .get(index)
                .ok_or(CompileError::OutputIndex { index, count }),
            (None, 1) => Ok(&self.output_files[0]),
            (None, count) => Err(CompileError::AmbiguousOutput(count)),
        }
    }

    /// Atomically write the selected output unit to `path`, then notify
    /// observers. Publishing again rewrites the same content.
    pub async fn publish(&self, path: &Path, options: &PublishOptions) -> Result<(), CompileError> {
        let file = self.select(options.output_index)?;
        write_artifact(path, file.text.as_bytes(), options).await?;
        self.observers.built(self);
        Ok(())
    }
}
