//! Configuration errors surfaced to session creators.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal at session or model load time. Aborts the session being built and
/// nothing else.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing asset: {}", .0.display())]
    MissingAsset(PathBuf),

    #[error("unknown model '{name}'; expected one of: {known}")]
    UnknownModel { name: String, known: String },

    #[error("failed to load {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },
}
