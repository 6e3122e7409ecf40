
use thiserror::Error;

/// Error type for the publish/subscribe client layer.
#[derive(Debug, Error)]
pub enum AmqpError {
    /// Error originating from the underlying `lapin` library.
    #[error("broker communication error: {0}")]
    Broker(#[from] lapin::Error),

    /// Error during payload serialization.
    #[error("failed to serialize message payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Bad or missing configuration. Fatal, never retried.
    #[error("invalid configuration: {message}")]
    Config { message: String },
}

impl AmqpError {
    /// Builds a configuration error from anything string-like.
    pub fn config(message: impl Into<String>) -> Self {
        AmqpError::Config { message: message.into() }
    }
}

// Allow converting from a string-like type into a configuration error
impl From<&str> for AmqpError {
    fn from(s: &str) -> Self {
        AmqpError::Config { message: s.to_string() }
    }
}

impl From<String> for AmqpError {
    fn from(s: String) -> Self {
        AmqpError::Config { message: s }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_conversions_build_config_errors() {
        let from_str: AmqpError = "missing RABBIT_URL".into();
        assert!(matches!(from_str, AmqpError::Config { .. }));

        let from_string: AmqpError = String::from("bad value").into();
        assert_eq!(
            from_string.to_string(),
            "invalid configuration: bad value"
        );
    }

    #[test]
    fn test_serialization_errors_wrap_serde() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let wrapped = AmqpError::from(err);
        assert!(wrapped.to_string().starts_with("failed to serialize"));
    }
}
