use thiserror::Error;

/// Unified error type for the gwproxy application
#[derive(Error, Debug)]
pub enum GwProxyError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration file error: {0}")]
    ConfigRead(String),

    // Upstream errors
    #[error("Upstream is not connected")]
    UpstreamUnavailable,

    #[error("Upstream send queue is full")]
    UpstreamBusy,

    // Per-message protocol errors
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unknown correlation id: {0}")]
    UnknownCorrelationId(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for gwproxy operations
pub type Result<T> = std::result::Result<T, GwProxyError>;

impl GwProxyError {
    /// Whether this error should terminate the process.
    ///
    /// Only a structurally invalid configuration is fatal; everything else
    /// is handled per connection or per message.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GwProxyError::InvalidConfig(_) | GwProxyError::ConfigRead(_)
        )
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for GwProxyError {
    fn from(err: url::ParseError) -> Self {
        GwProxyError::InvalidConfig(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(GwProxyError::InvalidConfig("bad".to_string()).is_fatal());
        assert!(GwProxyError::ConfigRead("bad".to_string()).is_fatal());
    }

    #[test]
    fn test_non_fatal_errors() {
        assert!(!GwProxyError::UpstreamUnavailable.is_fatal());
        assert!(!GwProxyError::MalformedMessage("{".to_string()).is_fatal());
        assert!(!GwProxyError::UnknownCorrelationId("42".to_string()).is_fatal());
    }
}
