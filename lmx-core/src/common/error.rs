use thiserror::Error;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

pub type Result<T> = std::result::Result<T, NormalizeError>;
