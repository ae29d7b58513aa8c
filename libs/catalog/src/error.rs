//! Catalog error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or querying catalog configuration.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("unable to read catalog file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed catalog file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("unknown protocol: {ref_}")]
    UnknownProtocol { ref_: String },

    #[error("no protocols defined beyond the built-ins; define protocols in the catalog before discovering")]
    NoUserProtocols,

    #[error("invalid address pattern {pattern:?} in child provider rule: {source}")]
    InvalidAddressPattern {
        pattern: String,
        source: regex::Error,
    },
}

impl CatalogError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(path: impl Into<PathBuf>, source: serde_yaml::Error) -> Self {
        Self::Parse {
            path: path.into(),
            source,
        }
    }

    pub fn unknown_protocol(ref_: impl Into<String>) -> Self {
        Self::UnknownProtocol { ref_: ref_.into() }
    }
}
