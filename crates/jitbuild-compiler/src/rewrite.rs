//! Post-processing of `export default <expr>;` statements.

use std::fmt;
use std::sync::{Arc, LazyLock};

use regex_lite::{Captures, Regex};

static EXPORT_DEFAULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(?P<lead>^|;)export default (?P<exported>.+?);")
        .expect("export default pattern is valid")
});

/// Rule rewriting the first top-level `export default <expr>;` of an output unit.
#[derive(Clone)]
pub enum RewriteExport {
    /// Replacement template; `${exported}` expands to the exported expression.
    /// Any other `$` text is kept literally.
    Template(String),
    /// Called as `(statement, exported)`, returns the replacement statement.
    Function(Arc<dyn Fn(&str, &str) -> String + Send + Sync>),
}

impl RewriteExport {
    /// Build a function rule.
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&str, &str) -> String + Send + Sync + 'static,
    {
        RewriteExport::Function(Arc::new(f))
    }

    /// Apply the rule to `text`. At most one statement is rewritten.
    pub fn apply(&self, text: &str) -> String {
        EXPORT_DEFAULT
            .replacen(text, 1, |caps: &Captures| {
                let lead = caps.name("lead").map_or("", |m| m.as_str());
                let exported = caps.name("exported").map_or("", |m| m.as_str());
                let statement = &caps[0][lead.len()..];

                let replaced = match self {
                    RewriteExport::Template(template) => template.replace("${exported}", exported),
                    RewriteExport::Function(f) => f(statement, exported),
                };
                format!("{lead}{replaced}")
            })
            .into_owned()
    }
}

impl fmt::Debug for RewriteExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewriteExport::Template(template) => f.debug_tuple("Template").field(template).finish(),
            RewriteExport::Function(_) => f.write_str("Function(..)"),
        }
    }
}
