use thiserror::Error;

/// Domain errors for the gateway.
///
/// Expected failures are always surfaced as values of this enum; panics are
/// reserved for broken invariants in tests.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    ConfigValidation(String),

    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Underlying OS error code, when one was available.
        code: Option<i32>,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Device error: {message} (code: {code})")]
    Device { message: String, code: i32 },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Translation error: {0}")]
    Translation(String),
}

impl GatewayError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            code: None,
        }
    }

    pub fn network_with_code(message: impl Into<String>, code: i32) -> Self {
        Self::Network {
            message: message.into(),
            code: Some(code),
        }
    }

    pub fn device(message: impl Into<String>, code: i32) -> Self {
        Self::Device {
            message: message.into(),
            code,
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::Timeout(err.to_string())
            }
            _ => Self::Network {
                message: err.to_string(),
                code: err.raw_os_error(),
            },
        }
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_timeout_maps_to_timeout() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline elapsed");
        assert!(matches!(GatewayError::from(io), GatewayError::Timeout(_)));
    }

    #[test]
    fn io_refused_maps_to_network() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            GatewayError::from(io),
            GatewayError::Network { .. }
        ));
    }
}
