use crate::config::models::AppConfig;

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Application configuration validator
pub struct AppConfigValidator;

impl AppConfigValidator {
    /// Validate the entire application configuration
    pub fn validate(config: &AppConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_origin(&config.proxy_to) {
            errors.push(e);
        }

        if config.port == 0 {
            errors.push(ValidationError::InvalidField {
                field: "port".to_string(),
                message: "Port must be non-zero".to_string(),
            });
        }

        if config.timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "timeout_secs".to_string(),
                message: "Timeout must be at least one second".to_string(),
            });
        }

        if config.events.max_events == 0 {
            errors.push(ValidationError::InvalidField {
                field: "events.max_events".to_string(),
                message: "Event ring must hold at least one event".to_string(),
            });
        }

        if config.max_body_bytes == 0 {
            errors.push(ValidationError::InvalidField {
                field: "max_body_bytes".to_string(),
                message: "Body inspection cap must be non-zero".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// The origin URL must carry an explicit scheme.
    fn validate_origin(origin: &str) -> ValidationResult<()> {
        if origin.is_empty() {
            return Err(ValidationError::MissingField {
                field: "proxy_to".to_string(),
            });
        }

        if !origin.starts_with("http://") && !origin.starts_with("https://") {
            return Err(ValidationError::InvalidField {
                field: "proxy_to".to_string(),
                message: format!(
                    "Origin '{origin}' must start with http:// or https://"
                ),
            });
        }

        Ok(())
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        errors
            .iter()
            .enumerate()
            .map(|(i, e)| format!("  {}. {}", i + 1, e))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            proxy_to: "http://localhost:3000".to_string(),
            ..AppConfig::default()
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(AppConfigValidator::validate(&valid_config()).is_ok());
    }

    #[test]
    fn missing_origin_is_rejected() {
        let config = AppConfig::default();
        assert!(AppConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn origin_without_scheme_is_rejected() {
        let mut config = valid_config();
        config.proxy_to = "localhost:3000".to_string();
        let err = AppConfigValidator::validate(&config).expect_err("rejects");
        assert!(err.to_string().contains("http://"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut config = valid_config();
        config.timeout_secs = 0;
        assert!(AppConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn multiple_errors_are_reported_together() {
        let mut config = AppConfig::default();
        config.port = 0;
        config.timeout_secs = 0;
        let err = AppConfigValidator::validate(&config).expect_err("rejects");
        let message = err.to_string();
        assert!(message.contains("proxy_to"));
        assert!(message.contains("port"));
        assert!(message.contains("timeout_secs"));
    }
}
