//! Error taxonomy shared by the engines.
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PlanetError {
    #[error("persistence error at {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("remote protocol error: {0}")]
    RemoteProtocol(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("already following {0}")]
    AlreadyFollowing(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("missing template: {0}")]
    MissingTemplate(String),

    #[error("{operation} already in progress for site {site}")]
    AlreadyInProgress { site: Uuid, operation: &'static str },

    #[error("file exists: {0}")]
    FileExists(PathBuf),

    #[error("media processing error: {0}")]
    Media(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = PlanetError> = std::result::Result<T, E>;

impl PlanetError {
    pub fn persistence(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        PlanetError::Persistence {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether a scheduled run may retry this on the next tick without
    /// anyone looking at it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlanetError::Network(_) | PlanetError::RemoteProtocol(_) | PlanetError::NotFound(_)
        )
    }
}

impl From<reqwest::Error> for PlanetError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PlanetError::RemoteProtocol(err.to_string())
        } else {
            PlanetError::Network(err.to_string())
        }
    }
}

/// Attach a path to I/O failures, in the spirit of `anyhow::Context`.
pub trait IoContext<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|err| PlanetError::persistence(path, err))
    }
}
