//! Exporters: sinks reading the final (or in-flight) graph.

pub mod ascii;
pub mod json;

pub use ascii::{export_tree, AsciiOptions};
pub use json::export_json;
