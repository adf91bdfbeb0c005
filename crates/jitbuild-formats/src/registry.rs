use std::path::{Path, PathBuf};

use thiserror::Error;

/// A supported source format.
#[derive(Debug, PartialEq, Eq)]
pub struct Format {
    /// Human readable name, used in logs.
    pub title: &'static str,
    /// Source extensions (without the leading dot) handled by this format.
    pub extensions: &'static [&'static str],
    /// Extension (without the leading dot) of the compiled output.
    pub output_extension: &'static str,
    /// Content type the compiled output is served with.
    pub content_type: &'static str,
}

impl Format {
    /// Whether `path` carries one of this format's source extensions.
    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.contains(&ext))
    }
}

/// Every format the compiler adapter ships plugins for.
pub static FORMATS: &[Format] = &[
    Format {
        title: "JavaScript",
        extensions: &["js"],
        output_extension: "js",
        content_type: "text/javascript",
    },
    Format {
        title: "Vue SFC",
        extensions: &["vue"],
        output_extension: "js",
        content_type: "text/javascript",
    },
    Format {
        title: "SASS / SCSS",
        extensions: &["scss"],
        output_extension: "css",
        content_type: "text/css",
    },
];

/// Errors raised by format lookups.
#[derive(Debug, Error)]
pub enum FormatError {
    /// No registered format handles the path's extension.
    #[error("unable to determine supported format from path \"{}\"", .0.display())]
    UnsupportedFormat(PathBuf),
}

/// Find the format handling `path`.
pub fn lookup(path: &Path) -> Result<&'static Format, FormatError> {
    FORMATS
        .iter()
        .find(|format| format.matches(path))
        .ok_or_else(|| FormatError::UnsupportedFormat(path.to_path_buf()))
}

/// Compute the output path for `source`.
///
/// The extension is replaced by the format's output extension unless
/// `preserve_extension` is set, in which case the path is returned as-is.
/// The lookup still runs so unsupported sources fail either way.
pub fn output_path(source: &Path, preserve_extension: bool) -> Result<PathBuf, FormatError> {
    let format = lookup(source)?;
    if preserve_extension {
        Ok(source.to_path_buf())
    } else {
        Ok(source.with_extension(format.output_extension))
    }
}

/// Default destination used by batch builds: `<dir>/<stem>.compiled.<ext>`.
pub fn compiled_path(source: &Path) -> Result<PathBuf, FormatError> {
    let format = lookup(source)?;
    let stem = source
        .file_stem()
        .ok_or_else(|| FormatError::UnsupportedFormat(source.to_path_buf()))?;

    let mut name = stem.to_os_string();
    name.push(".compiled.");
    name.push(format.output_extension);
    Ok(source.with_file_name(name))
}

/// Best-effort content type for files served without compilation.
///
/// Uncompiled `.vue` and `.scss` sources have no content type.
pub fn passthrough_content_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let content_type = match ext.as_str() {
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "html" | "htm" => "text/html",
        "json" | "map" => "application/json",
        "txt" => "text/plain",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "wasm" => "application/wasm",
        _ => return None,
    };
    Some(content_type)
}
