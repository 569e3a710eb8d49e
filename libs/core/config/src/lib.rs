pub mod server;
pub mod tracing;

use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

/// Deployment environment, selects the log format
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Helper to load and parse environment variable with a default value
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Helper to load and parse environment variable or return error
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Parse `key` into `T`, falling back to `default` when unset or empty.
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => {
            value.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
                key: key.to_string(),
                details: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

/// Boolean flag: `1`, `true`, `yes` and `on` (any case) are true.
pub fn env_flag(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::ParseError {
                key: key.to_string(),
                details: format!("'{other}' is not a boolean"),
            }),
        },
        _ => Ok(default),
    }
}

/// Comma separated list with blanks removed; `default` when unset.
pub fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(String::from)
            .collect(),
        _ => default.iter().map(|item| item.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_defaults_to_development() {
        temp_env::with_var_unset("APP_ENV", || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
            assert!(env.is_development());
        });
    }

    #[test]
    fn test_environment_production_case_insensitive() {
        temp_env::with_var("APP_ENV", Some("PRODUCTION"), || {
            assert!(Environment::from_env().is_production());
        });
        temp_env::with_var("APP_ENV", Some("staging"), || {
            assert_eq!(Environment::from_env(), Environment::Development);
        });
    }

    #[test]
    fn test_env_required_missing() {
        temp_env::with_var_unset("MISSING_REQUIRED", || {
            let err = env_required("MISSING_REQUIRED").unwrap_err();
            assert!(err.to_string().contains("MISSING_REQUIRED"));
            assert!(err.to_string().contains("required"));
        });
    }

    #[test]
    fn test_env_parse_default_and_value() {
        temp_env::with_var_unset("QUEUE_TEST_NUM", || {
            assert_eq!(env_parse("QUEUE_TEST_NUM", 3u64).unwrap(), 3);
        });
        temp_env::with_var("QUEUE_TEST_NUM", Some(" 42 "), || {
            assert_eq!(env_parse("QUEUE_TEST_NUM", 3u64).unwrap(), 42);
        });
    }

    #[test]
    fn test_env_parse_invalid_names_variable() {
        temp_env::with_var("QUEUE_TEST_NUM", Some("soon"), || {
            let err = env_parse("QUEUE_TEST_NUM", 3u64).unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { ref key, .. } if key == "QUEUE_TEST_NUM"));
        });
    }

    #[test]
    fn test_env_flag() {
        temp_env::with_var("QUEUE_TEST_FLAG", Some("Yes"), || {
            assert!(env_flag("QUEUE_TEST_FLAG", false).unwrap());
        });
        temp_env::with_var("QUEUE_TEST_FLAG", Some("maybe"), || {
            assert!(env_flag("QUEUE_TEST_FLAG", false).is_err());
        });
        temp_env::with_var_unset("QUEUE_TEST_FLAG", || {
            assert!(env_flag("QUEUE_TEST_FLAG", true).unwrap());
        });
    }

    #[test]
    fn test_env_list_trims_and_skips_blanks() {
        temp_env::with_var("QUEUE_TEST_LIST", Some("high, default,,low "), || {
            assert_eq!(env_list("QUEUE_TEST_LIST", &["x"]), vec!["high", "default", "low"]);
        });
        temp_env::with_var_unset("QUEUE_TEST_LIST", || {
            assert_eq!(env_list("QUEUE_TEST_LIST", &["default"]), vec!["default"]);
        });
    }
}
