//! Configuration validation support

use config::ConfigError;
use serde::{Deserialize, Serialize};

/// Trait for validating configuration values
pub trait ValidateConfig: Serialize + for<'de> Deserialize<'de> {
    /// Returns Ok(()) if valid, or an error describing what's wrong
    fn validate(&self) -> Result<(), ConfigError>;
}

/// Common validation helpers
pub mod validators {
    use config::ConfigError;
    use std::net::{IpAddr, SocketAddr};

    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::Message(format!("{field}: cannot be empty")));
        }
        Ok(())
    }

    /// Validate that a string is a literal IPv4 or IPv6 address
    pub fn validate_ip(value: &str, field: &str) -> Result<(), ConfigError> {
        value
            .parse::<IpAddr>()
            .map_err(|e| ConfigError::Message(format!("{field}: invalid IP address - {e}")))?;
        Ok(())
    }

    /// Validate that a string is an `ip:port` socket address
    pub fn validate_socket_addr(value: &str, field: &str) -> Result<(), ConfigError> {
        value.parse::<SocketAddr>().map_err(|e| {
            ConfigError::Message(format!("{field}: invalid socket address - {e}"))
        })?;
        Ok(())
    }

    /// Validate URL format
    pub fn validate_url(url: &str, field: &str) -> Result<(), ConfigError> {
        url::Url::parse(url)
            .map_err(|e| ConfigError::Message(format!("{field}: invalid URL - {e}")))?;
        Ok(())
    }

    /// Validate email format (basic check)
    pub fn validate_email(email: &str, field: &str) -> Result<(), ConfigError> {
        if !email.contains('@') || email.split('@').count() != 2 {
            return Err(ConfigError::Message(format!(
                "{field}: invalid email format"
            )));
        }
        Ok(())
    }
}
