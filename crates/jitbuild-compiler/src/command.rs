//! An [`Engine`] that shells out to external compilers.
//!
//! Each plugin name maps to a command. The command for an entry is the one
//! registered for the first plugin loading it, falling back to `default`.
//! Standard output becomes the output unit, standard error the diagnostics.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures_util::future::BoxFuture;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::engine::{
    resolve_root_import, Engine, EngineError, EngineOptions, EngineOutput, Message, OutputFile,
    ROOT_PLUGIN, SASS_PLUGIN, VUE_PLUGIN,
};

/// Table key used when no plugin claims an entry.
pub const DEFAULT_COMMAND: &str = "default";

const ENTRY_PLACEHOLDER: &str = "{entry}";

/// One external compiler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    /// Arguments; `{entry}` expands to the entry path and is dropped in stdin mode.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra arguments when minifying.
    #[serde(default)]
    pub minify: Vec<String>,
    /// Extra arguments when source maps are requested.
    #[serde(default)]
    pub sourcemap: Vec<String>,
    /// Extra arguments when bundling.
    #[serde(default)]
    pub bundle: Vec<String>,
    /// Extra arguments when the source is piped through stdin.
    #[serde(default)]
    pub stdin: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            minify: Vec::new(),
            sourcemap: Vec::new(),
            bundle: Vec::new(),
            stdin: Vec::new(),
        }
    }

    /// Expand the argument list for one invocation.
    pub fn argv(&self, entry: Option<&Path>, options: &EngineOptions) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 4);
        for arg in &self.args {
            if arg == ENTRY_PLACEHOLDER {
                if let Some(entry) = entry {
                    argv.push(entry.to_string_lossy().into_owned());
                }
            } else if let Some(entry) = entry {
                argv.push(arg.replace(ENTRY_PLACEHOLDER, &entry.to_string_lossy()));
            } else {
                argv.push(arg.clone());
            }
        }
        let flags = [
            (options.minify, &self.minify),
            (options.sourcemap, &self.sourcemap),
            (options.bundle, &self.bundle),
            (entry.is_none(), &self.stdin),
        ];
        for (enabled, extra) in flags {
            if enabled {
                argv.extend(extra.iter().cloned());
            }
        }
        argv
    }
}

/// Errors loading a command table.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read engine config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid engine config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Plugin name to command mapping.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct CommandTable(BTreeMap<String, CommandSpec>);

impl Default for CommandTable {
    fn default() -> Self {
        let mut esbuild = CommandSpec::new("esbuild", &[ENTRY_PLACEHOLDER, "--log-level=error"]);
        esbuild.minify = vec!["--minify".into()];
        esbuild.sourcemap = vec!["--sourcemap=inline".into()];
        esbuild.bundle = vec!["--bundle".into()];

        let mut sass = CommandSpec::new("sass", &["--no-source-map", ENTRY_PLACEHOLDER]);
        sass.minify = vec!["--style=compressed".into()];
        sass.stdin = vec!["--stdin".into()];

        let mut table = BTreeMap::new();
        table.insert(DEFAULT_COMMAND.to_string(), esbuild.clone());
        table.insert(VUE_PLUGIN.to_string(), esbuild);
        table.insert(SASS_PLUGIN.to_string(), sass);
        Self(table)
    }
}

impl CommandTable {
    /// An empty table.
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with(mut self, plugin: impl Into<String>, spec: CommandSpec) -> Self {
        self.0.insert(plugin.into(), spec);
        self
    }

    pub fn get(&self, plugin: &str) -> Option<&CommandSpec> {
        self.0.get(plugin)
    }

    /// Parse YAML and lay it over the built-in commands.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let overrides: CommandTable = serde_yaml::from_str(yaml)?;
        let mut table = Self::default();
        table.0.extend(overrides.0);
        Ok(table)
    }

    /// Load a YAML command table from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }
}

/// Runs one external command per entry point.
#[derive(Debug, Clone, Default)]
pub struct CommandEngine {
    table: CommandTable,
}

impl CommandEngine {
    pub fn new(table: CommandTable) -> Self {
        Self { table }
    }

    fn command_for(&self, entry: &Path, options: &EngineOptions) -> Result<&CommandSpec, EngineError> {
        let plugin = options
            .plugins
            .iter()
            .find(|plugin| plugin.loads(entry))
            .map_or(DEFAULT_COMMAND, |plugin| plugin.name.as_str());

        self.table
            .get(plugin)
            .or_else(|| self.table.get(DEFAULT_COMMAND))
            .ok_or_else(|| EngineError::NoCommand {
                plugin: plugin.to_string(),
                entry: entry.to_path_buf(),
            })
    }

    async fn run(
        &self,
        spec: &CommandSpec,
        entry: Option<&Path>,
        stdin: Option<&str>,
        options: &EngineOptions,
    ) -> Result<std::process::Output, EngineError> {
        let mut command = Command::new(&spec.program);
        command
            .args(spec.argv(entry, options))
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &options.abs_working_dir {
            command.current_dir(dir);
        }

        tracing::debug!(program = %spec.program, entry = ?entry, "running engine command");

        let mut child = command.spawn().map_err(|source| EngineError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let pipe = child.stdin.take();
        let contents = stdin.unwrap_or_default().as_bytes();
        let writer = async move {
            if let Some(mut pipe) = pipe {
                pipe.write_all(contents).await?;
                pipe.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };

        let (written, output) = tokio::join!(writer, child.wait_with_output());
        let output = output?;
        // Prefer the command's own failure over a broken stdin pipe.
        if let Err(err) = written {
            if output.status.success() {
                return Err(err.into());
            }
        }
        Ok(output)
    }
}

impl Engine for CommandEngine {
    fn build<'a>(
        &'a self,
        options: &'a EngineOptions,
    ) -> BoxFuture<'a, Result<EngineOutput, EngineError>> {
        Box::pin(async move {
            let root = options
                .plugins
                .iter()
                .find(|plugin| plugin.name == ROOT_PLUGIN)
                .and_then(|plugin| plugin.settings.get("root"))
                .map(PathBuf::from);

            let jobs: Vec<(PathBuf, Option<PathBuf>, Option<&str>)> = match &options.stdin {
                Some(stdin) => vec![(stdin.sourcefile.clone(), None, Some(stdin.contents.as_str()))],
                None => options
                    .entry_points
                    .iter()
                    .map(|entry| {
                        let resolved = match &root {
                            Some(root) => resolve_root_import(root, &entry.to_string_lossy()),
                            None => entry.clone(),
                        };
                        (entry.clone(), Some(resolved), None)
                    })
                    .collect(),
            };

            let mut output = EngineOutput::default();
            for (name, entry, stdin) in jobs {
                let spec = self.command_for(&name, options)?;
                let result = self.run(spec, entry.as_deref(), stdin, options).await?;
                let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
                let location = Some(name.display().to_string());

                if !result.status.success() {
                    let text = if stderr.is_empty() {
                        format!("{} exited with {}", spec.program, result.status)
                    } else {
                        stderr
                    };
                    output.errors.push(Message { text, location });
                    continue;
                }
                if !stderr.is_empty() {
                    output.warnings.push(Message {
                        text: stderr,
                        location,
                    });
                }
                output.output_files.push(OutputFile {
                    path: name,
                    text: String::from_utf8_lossy(&result.stdout).into_owned(),
                });
            }
            Ok(output)
        })
    }
}
