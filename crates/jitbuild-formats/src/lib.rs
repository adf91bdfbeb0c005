//! Source format registry.
//!
//! Maps a source file extension to the descriptor used to compile and serve
//! it: a human title, the extension of the compiled output and the
//! content type the output is served with.

pub mod registry;

pub use registry::{
    compiled_path, lookup, output_path, passthrough_content_type, Format, FormatError, FORMATS,
};
