use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("action load failed: {0}")]
    Load(String),

    #[error("action timed out after {0} ms")]
    Timeout(u64),

    #[error("{0}")]
    Runtime(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HostError>;
