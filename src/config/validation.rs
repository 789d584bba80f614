use std::time::Duration;

use crate::config::models::{BackendConfig, ServerConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid bind address '{address}': {reason}")]
    InvalidBindAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("cannot modify '{field}' while server is running. restart to apply.")]
    ImmutableField { field: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration, collecting every problem found.
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = config.bind_addr() {
            errors.push(ValidationError::InvalidBindAddress {
                address: config.bind.clone(),
                reason: e.to_string(),
            });
        }

        if config.https {
            if config.tls_cert_file.is_none() {
                errors.push(ValidationError::InvalidTls {
                    message: "HTTPS requested, but no 'tls-cert-file' specified".to_string(),
                });
            }
            if config.tls_key_file.is_none() {
                errors.push(ValidationError::InvalidTls {
                    message: "HTTPS requested, but no 'tls-key-file' specified".to_string(),
                });
            }
        }

        if config.inventory_file.as_os_str().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "inventory-file".to_string(),
            });
        }

        if config.shutdown_timeout.is_zero() {
            errors.push(ValidationError::InvalidField {
                field: "shutdown-timeout".to_string(),
                message: "cannot be 0".to_string(),
            });
        }

        errors.extend(Self::validate_backend_config(&config.backend));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Check that `next` may replace `current` on a running server.
    pub fn validate_reload(current: &ServerConfig, next: &ServerConfig) -> ValidationResult<()> {
        Self::validate(next)?;
        match current.immutable_change(next) {
            Some(field) => Err(ValidationError::ImmutableField {
                field: field.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn validate_backend_config(config: &BackendConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if config.health_check_timeout.is_zero() {
            errors.push(ValidationError::InvalidField {
                field: "health-check-timeout".to_string(),
                message: "cannot be 0".to_string(),
            });
        } else if config.health_check_timeout > Duration::from_secs(1) {
            errors.push(ValidationError::InvalidField {
                field: "health-check-timeout".to_string(),
                message: format!(
                    "'{}' cannot be longer than '1s'",
                    humantime::format_duration(config.health_check_timeout)
                ),
            });
        }

        if config.dial_timeout.is_zero() {
            errors.push(ValidationError::InvalidField {
                field: "dial-timeout".to_string(),
                message: "cannot be 0".to_string(),
            });
        }

        if config.latency_average_seconds == 0 {
            errors.push(ValidationError::InvalidField {
                field: "latency-average-seconds".to_string(),
                message: "cannot be 0".to_string(),
            });
        }

        if !config.new_host_health_path.is_empty() && !config.new_host_health_path.starts_with('/')
        {
            errors.push(ValidationError::InvalidField {
                field: "new-host-health-path".to_string(),
                message: "must start with '/'".to_string(),
            });
        }

        errors
    }

    /// Format multiple validation errors into a readable message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
