//! The boundary to the external compiler engine.
//!
//! The engine performs the actual source-to-output transformation. This crate
//! only prepares its options, interprets its response and publishes the
//! result; anything implementing [`Engine`] can be plugged in.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use futures_util::future::BoxFuture;
use thiserror::Error;

/// Plugin name resolving `/`-absolute imports under a root directory.
pub const ROOT_PLUGIN: &str = "root";
/// Plugin name handling Vue single file components.
pub const VUE_PLUGIN: &str = "vue";
/// Plugin name handling SASS / SCSS stylesheets.
pub const SASS_PLUGIN: &str = "sass";

/// A compiler engine.
pub trait Engine: Send + Sync {
    /// Run one build with fully resolved options.
    fn build<'a>(
        &'a self,
        options: &'a EngineOptions,
    ) -> BoxFuture<'a, Result<EngineOutput, EngineError>>;
}

/// Options handed to the engine after all configuration layers are merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOptions {
    /// Files to compile. Empty when `stdin` is used.
    pub entry_points: Vec<PathBuf>,
    /// Inline source, used instead of entry points.
    pub stdin: Option<StdinInput>,
    /// Ask the engine to write output files itself.
    pub write: bool,
    /// Output directory override.
    pub outdir: Option<PathBuf>,
    /// Bundle imports into the output.
    pub bundle: bool,
    /// Plugins, in the order the engine should consult them.
    pub plugins: Vec<PluginSpec>,
    pub minify: bool,
    pub sourcemap: bool,
    pub sources_content: bool,
    /// Working directory for the engine.
    pub abs_working_dir: Option<PathBuf>,
}

/// Inline source contents compiled without a file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdinInput {
    pub contents: String,
    /// Virtual file name, used to pick the format and name the output.
    pub sourcefile: PathBuf,
    /// Directory relative imports resolve against.
    pub resolve_dir: Option<PathBuf>,
}

/// A plugin descriptor passed through to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    pub name: String,
    /// Source extensions (without the dot) this plugin loads.
    pub extensions: Vec<String>,
    /// Free-form plugin settings.
    pub settings: BTreeMap<String, String>,
}

impl PluginSpec {
    /// A plugin with no settings.
    pub fn new(name: impl Into<String>, extensions: &[&str]) -> Self {
        Self {
            name: name.into(),
            extensions: extensions.iter().map(|ext| ext.to_string()).collect(),
            settings: BTreeMap::new(),
        }
    }

    /// Add a setting.
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// The root-path plugin.
    pub fn root(root_dir: &Path) -> Self {
        Self::new(ROOT_PLUGIN, &[]).with_setting("root", root_dir.to_string_lossy())
    }

    /// The Vue SFC plugin.
    pub fn vue() -> Self {
        Self::new(VUE_PLUGIN, &["vue"])
    }

    /// The SASS plugin. When bundling, styles are injected as a module.
    pub fn sass(bundle: bool) -> Self {
        let plugin = Self::new(SASS_PLUGIN, &["scss"]);
        if bundle {
            plugin
                .with_setting("type", "style")
                .with_setting("transform", "postcss-modules")
        } else {
            plugin
        }
    }

    /// Whether this plugin loads `path`.
    pub fn loads(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e == ext))
    }
}

/// Map an import path through the root plugin.
///
/// Paths already inside `root` are left alone, `//x` addresses the real
/// filesystem root and any other `/x` is taken relative to `root`.
pub fn resolve_root_import(root: &Path, import: &str) -> PathBuf {
    if Path::new(import).starts_with(root) {
        PathBuf::from(import)
    } else if let Some(real) = import.strip_prefix("//") {
        PathBuf::from(format!("/{real}"))
    } else if let Some(relative) = import.strip_prefix('/') {
        root.join(relative)
    } else {
        PathBuf::from(import)
    }
}

/// What the engine produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOutput {
    pub output_files: Vec<OutputFile>,
    pub errors: Vec<Message>,
    pub warnings: Vec<Message>,
}

/// One compiled output unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub path: PathBuf,
    pub text: String,
}

/// A diagnostic reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub text: String,
    pub location: Option<String>,
}

impl Message {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            location: None,
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{}: {}", location, self.text),
            None => f.write_str(&self.text),
        }
    }
}

/// Failures of the engine itself, as opposed to diagnostics in its output.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No command is configured for the plugin that should load an entry.
    #[error("no engine command configured for '{plugin}' (entry {})", .entry.display())]
    NoCommand { plugin: String, entry: PathBuf },

    /// The engine process could not be started.
    #[error("failed to start engine '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// I/O while talking to the engine.
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else an engine implementation wants to report.
    #[error("{0}")]
    Other(String),
}
