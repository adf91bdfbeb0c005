//! Layered build configuration.
//!
//! Engine options are resolved from three layers, in increasing precedence:
//! the safe [`EngineDefaults`], the fixed plugin set covering every supported
//! format, and the caller's [`BuildOptions`]. Callers can only extend the
//! plugin set, through [`AdapterOptions::plugins_append`].

use std::path::{Path, PathBuf};

use crate::engine::{EngineOptions, PluginSpec, StdinInput};
use crate::error::CompileError;
use crate::publish::FileStamp;
use crate::rewrite::RewriteExport;

/// Safe defaults applied before anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineDefaults {
    pub minify: bool,
    pub sourcemap: bool,
    pub sources_content: bool,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            minify: false,
            sourcemap: false,
            sources_content: false,
        }
    }
}

/// Caller-supplied engine options. `None` leaves the lower layer in place.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub entry_points: Vec<PathBuf>,
    pub stdin: Option<StdinInput>,
    pub write: Option<bool>,
    pub outdir: Option<PathBuf>,
    pub bundle: Option<bool>,
    pub minify: Option<bool>,
    pub sourcemap: Option<bool>,
    pub sources_content: Option<bool>,
    pub abs_working_dir: Option<PathBuf>,
}

impl BuildOptions {
    /// Options compiling a single entry point.
    pub fn entry(path: impl Into<PathBuf>) -> Self {
        Self {
            entry_points: vec![path.into()],
            ..Self::default()
        }
    }

    /// Options compiling inline source.
    pub fn stdin(input: StdinInput) -> Self {
        Self {
            stdin: Some(input),
            ..Self::default()
        }
    }

    pub fn with_minify(mut self, minify: bool) -> Self {
        self.minify = Some(minify);
        self
    }

    pub fn with_bundle(mut self, bundle: bool) -> Self {
        self.bundle = Some(bundle);
        self
    }

    pub fn with_outdir(mut self, outdir: impl Into<PathBuf>) -> Self {
        self.outdir = Some(outdir.into());
        self
    }

    pub fn with_write(mut self, write: bool) -> Self {
        self.write = Some(write);
        self
    }

    /// The entry the build is named after.
    pub fn primary_source(&self) -> Option<&Path> {
        self.entry_points
            .first()
            .map(PathBuf::as_path)
            .or_else(|| self.stdin.as_ref().map(|s| s.sourcefile.as_path()))
    }

    /// Reject option combinations the adapter cannot serve.
    pub fn validate(&self) -> Result<(), CompileError> {
        if self.stdin.is_none() && self.entry_points.is_empty() {
            return Err(CompileError::NoEntryPoint);
        }
        if !self.entry_points.is_empty() && self.write == Some(true) {
            return Err(CompileError::IncompatibleWriteMode);
        }
        Ok(())
    }
}

/// Options steering the adapter itself rather than the engine.
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    /// Rewrite the default export of every output unit.
    pub rewrite_export: Option<RewriteExport>,
    /// Prefix trimmed from paths when logging.
    pub root: Option<PathBuf>,
    /// Remap `/`-absolute imports into this directory.
    pub root_dir: Option<PathBuf>,
    /// Source stats already known to the caller, saves a stat when logging.
    pub source_stats: Option<FileStamp>,
    /// Keep the source extension when computing the destination.
    pub preserve_extension: bool,
    /// Plugins appended after the fixed set.
    pub plugins_append: Vec<PluginSpec>,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            rewrite_export: None,
            root: None,
            root_dir: None,
            source_stats: None,
            preserve_extension: true,
            plugins_append: Vec::new(),
        }
    }
}

impl AdapterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rewrite_export(mut self, rule: RewriteExport) -> Self {
        self.rewrite_export = Some(rule);
        self
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(root_dir.into());
        self
    }

    pub fn with_source_stats(mut self, stats: FileStamp) -> Self {
        self.source_stats = Some(stats);
        self
    }

    pub fn with_preserve_extension(mut self, preserve: bool) -> Self {
        self.preserve_extension = preserve;
        self
    }

    pub fn with_plugin(mut self, plugin: PluginSpec) -> Self {
        self.plugins_append.push(plugin);
        self
    }
}

/// The plugin layer: fixed plugins first, then the caller's appended ones.
pub fn plugin_layer(bundle: bool, adapter: &AdapterOptions) -> Vec<PluginSpec> {
    let mut plugins = Vec::with_capacity(3 + adapter.plugins_append.len());
    if let Some(root_dir) = &adapter.root_dir {
        plugins.push(PluginSpec::root(root_dir));
    }
    plugins.push(PluginSpec::vue());
    plugins.push(PluginSpec::sass(bundle));
    plugins.extend(adapter.plugins_append.iter().cloned());
    plugins
}

/// Resolve the final engine options from all three layers.
pub fn resolve_engine_options(
    defaults: &EngineDefaults,
    build: &BuildOptions,
    adapter: &AdapterOptions,
) -> EngineOptions {
    let bundle = build.bundle.unwrap_or(false);

    EngineOptions {
        entry_points: build.entry_points.clone(),
        stdin: build.stdin.clone(),
        write: build.write.unwrap_or(false),
        outdir: build.outdir.clone(),
        bundle,
        plugins: plugin_layer(bundle, adapter),
        minify: build.minify.unwrap_or(defaults.minify),
        sourcemap: build.sourcemap.unwrap_or(defaults.sourcemap),
        sources_content: build.sources_content.unwrap_or(defaults.sources_content),
        abs_working_dir: build
            .abs_working_dir
            .clone()
            .or_else(|| adapter.root_dir.clone()),
    }
}
