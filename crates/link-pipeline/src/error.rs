use std::path::PathBuf;

use link_common::error::CommonError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("config error: {0}")]
    Config(String),

    #[error("artifact {}: {message}", path.display())]
    Artifact { path: PathBuf, message: String },

    #[error("{} not found, run `{stage}` first", path.display())]
    MissingArtifact { path: PathBuf, stage: &'static str },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
