//! StubEngine: a deterministic in-process engine.
//!
//! Stands in for esbuild and sass so scenario tests run without external
//! tools. Scripts pass through, Vue components become a module exporting
//! `__vue_component__` and SCSS nesting is flattened.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use jitbuild_compiler::{Engine, EngineError, EngineOptions, EngineOutput, Message, OutputFile};

/// Deterministic engine that counts its builds.
#[derive(Debug, Default)]
pub struct StubEngine {
    builds: AtomicUsize,
    delay: Option<Duration>,
}

impl StubEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `delay` inside every build.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of builds run so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    fn compile_one(name: &Path, contents: &str, output: &mut EngineOutput) {
        let location = Some(name.display().to_string());
        let compiled = match name.extension().and_then(|ext| ext.to_str()) {
            Some("vue") => Ok(compile_vue(name, contents)),
            Some("scss") => compile_scss(contents),
            _ => Ok(contents.to_string()),
        };

        match compiled {
            Ok(text) => output.output_files.push(OutputFile {
                path: name.to_path_buf(),
                text,
            }),
            Err(text) => output.errors.push(Message { text, location }),
        }
    }
}

impl Engine for StubEngine {
    fn build<'a>(
        &'a self,
        options: &'a EngineOptions,
    ) -> BoxFuture<'a, Result<EngineOutput, EngineError>> {
        Box::pin(async move {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let mut output = EngineOutput::default();
            if let Some(stdin) = &options.stdin {
                Self::compile_one(&stdin.sourcefile, &stdin.contents, &mut output);
                return Ok(output);
            }
            for entry in &options.entry_points {
                let path = match &options.abs_working_dir {
                    Some(dir) if entry.is_relative() => dir.join(entry),
                    _ => entry.clone(),
                };
                let contents = tokio::fs::read_to_string(&path).await?;
                Self::compile_one(entry, &contents, &mut output);
            }
            Ok(output)
        })
    }
}

fn compile_vue(name: &Path, contents: &str) -> String {
    let component = name
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let source = serde_json::Value::String(contents.to_string());
    format!(
        "const __vue_script__ = {{\n  name: {},\n  source: {}\n}};\n\
         const __vue_component__ = __vue_script__;\n\
         export default __vue_component__;\n",
        serde_json::Value::String(component),
        source
    )
}

/// Flatten nested rules into `parent child { ... }` blocks. `@error` fails
/// the build with its message.
fn compile_scss(contents: &str) -> Result<String, String> {
    if let Some(message) = contents
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("@error"))
    {
        return Err(message.trim().trim_end_matches(';').trim_matches('"').to_string());
    }

    let mut out = String::new();
    let mut selectors: Vec<String> = Vec::new();
    let mut declarations: Vec<Vec<String>> = Vec::new();
    let mut buf = String::new();

    for ch in contents.chars() {
        match ch {
            '{' => {
                selectors.push(buf.trim().to_string());
                declarations.push(Vec::new());
                buf.clear();
            }
            ';' => {
                let declaration = buf.trim().to_string();
                buf.clear();
                if declaration.is_empty() {
                    continue;
                }
                declarations
                    .last_mut()
                    .ok_or_else(|| format!("declaration outside of a rule: {declaration}"))?
                    .push(declaration);
            }
            '}' => {
                let block = declarations
                    .pop()
                    .ok_or_else(|| "unexpected \"}\"".to_string())?;
                if !block.is_empty() {
                    out.push_str(&selectors.join(" "));
                    out.push_str(" {\n");
                    for declaration in block {
                        out.push_str("  ");
                        out.push_str(&declaration);
                        out.push_str(";\n");
                    }
                    out.push_str("}\n");
                }
                selectors.pop();
                buf.clear();
            }
            _ => buf.push(ch),
        }
    }

    if !selectors.is_empty() {
        return Err("expected \"}\"".to_string());
    }
    Ok(out)
}
