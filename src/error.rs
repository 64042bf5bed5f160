use thiserror::Error;

#[derive(Error, Debug)]
pub enum EdgesyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Authentication error: {message}")]
    Auth { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl EdgesyncError {
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn component<C: Into<String>, M: Into<String>>(component: C, message: M) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Whether the failure is transient and worth retrying on the next
    /// scheduled cycle. Validation failures are terminal; protocol failures
    /// (unexpected response shape) are treated like network failures.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Auth { .. } | Self::Protocol { .. }
        )
    }
}

impl From<reqwest::Error> for EdgesyncError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EdgesyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EdgesyncError::network("connection refused").is_retryable());
        assert!(EdgesyncError::auth("token expired").is_retryable());
        assert!(EdgesyncError::protocol("missing field").is_retryable());
        assert!(!EdgesyncError::validation("fps out of range").is_retryable());
        assert!(!EdgesyncError::component("store", "disk full").is_retryable());
    }
}
