use thiserror::Error;

/// Crate-wide error type for the courier node.
#[derive(Error, Debug)]
pub enum CourierError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("registry error: {url} returned {status}: {body}")]
    Registry {
        url: String,
        status: u16,
        body: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("insufficient staging space: need {needed} bytes, {available} available")]
    DiskExhausted { needed: u64, available: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Conflict(String),

    #[error("logic error: {0}")]
    Logic(String),
}

impl CourierError {
    /// Whether a retry has any chance of succeeding. Drives the
    /// requeue-vs-trouble decision in stage post-processing.
    pub fn is_transient(&self) -> bool {
        match self {
            CourierError::Io(_) | CourierError::Transport(_) => true,
            CourierError::Registry { status, .. } => *status >= 500,
            CourierError::DiskExhausted { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(e: serde_json::Error) -> Self {
        CourierError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for CourierError {
    fn from(e: reqwest::Error) -> Self {
        CourierError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CourierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CourierError::Transport("timeout".into()).is_transient());
        assert!(CourierError::Registry {
            url: "http://x".into(),
            status: 503,
            body: String::new(),
        }
        .is_transient());
        assert!(!CourierError::Registry {
            url: "http://x".into(),
            status: 409,
            body: String::new(),
        }
        .is_transient());
        assert!(!CourierError::Validation("bad digest".into()).is_transient());
        assert!(CourierError::DiskExhausted {
            needed: 10,
            available: 1,
        }
        .is_transient());
    }
}
