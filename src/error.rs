use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Capture error: {0}")]
    CaptureError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Worker error: {0}")]
    WorkerError(String),
}

impl From<std::io::Error> for FlowError {
    fn from(err: std::io::Error) -> Self {
        FlowError::IoError(err.to_string())
    }
}

impl From<csv::Error> for FlowError {
    fn from(err: csv::Error) -> Self {
        FlowError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::ParseError(err.to_string())
    }
}

impl From<ctrlc::Error> for FlowError {
    fn from(err: ctrlc::Error) -> Self {
        FlowError::ConfigError(err.to_string())
    }
}

impl From<&str> for FlowError {
    fn from(msg: &str) -> Self {
        FlowError::ConfigError(msg.to_string())
    }
}

impl From<String> for FlowError {
    fn from(msg: String) -> Self {
        FlowError::ConfigError(msg)
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
