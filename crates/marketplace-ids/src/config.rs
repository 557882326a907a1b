use std::env;

use thiserror::Error;

use crate::transaction::RetryPolicy;

#[derive(Clone, Debug, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    /// Postgres connection string; `None` selects the in-memory store.
    pub db_url: Option<String>,
    pub retry: RetryPolicy,
    pub log_format: LogFormat,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid IDS_TX_MAX_ATTEMPTS: {0}")]
    InvalidTxMaxAttempts(String),
    #[error("invalid IDS_TX_BASE_BACKOFF_MS: {0}")]
    InvalidTxBaseBackoffMs(String),
    #[error("invalid IDS_TX_MAX_BACKOFF_MS: {0}")]
    InvalidTxMaxBackoffMs(String),
    #[error("invalid IDS_LOG_FORMAT: {0}")]
    InvalidLogFormat(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let service_name = lookup("IDS_SERVICE_NAME")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "marketplace-ids".to_string());
        let db_url = lookup("DB_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let defaults = RetryPolicy::default();
        let max_attempts = parse_with_lookup(
            &lookup,
            "IDS_TX_MAX_ATTEMPTS",
            defaults.max_attempts,
            |raw| {
                raw.trim()
                    .parse::<u32>()
                    .map_err(|error| ConfigError::InvalidTxMaxAttempts(error.to_string()))
                    .map(|value| value.clamp(1, 100))
            },
        )?;
        let base_backoff_ms = parse_with_lookup(
            &lookup,
            "IDS_TX_BASE_BACKOFF_MS",
            defaults.base_backoff_ms,
            |raw| {
                raw.trim()
                    .parse::<u64>()
                    .map_err(|error| ConfigError::InvalidTxBaseBackoffMs(error.to_string()))
                    .map(|value| value.clamp(0, 10_000))
            },
        )?;
        let max_backoff_ms = parse_with_lookup(
            &lookup,
            "IDS_TX_MAX_BACKOFF_MS",
            defaults.max_backoff_ms,
            |raw| {
                raw.trim()
                    .parse::<u64>()
                    .map_err(|error| ConfigError::InvalidTxMaxBackoffMs(error.to_string()))
                    .map(|value| value.clamp(0, 60_000))
            },
        )?
        .max(base_backoff_ms);
        let log_format = parse_with_lookup(&lookup, "IDS_LOG_FORMAT", LogFormat::Text, |raw| {
            parse_log_format(raw.as_str())
        })?;

        Ok(Self {
            service_name,
            db_url,
            retry: RetryPolicy {
                max_attempts,
                base_backoff_ms,
                max_backoff_ms,
            },
            log_format,
        })
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "text" | "" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        other => Err(ConfigError::InvalidLogFormat(other.to_string())),
    }
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{Config, ConfigError, LogFormat};
    use crate::transaction::RetryPolicy;

    fn parse(values: &HashMap<&str, &str>) -> Result<Config, ConfigError> {
        Config::from_lookup(|key| values.get(key).map(ToString::to_string))
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() -> Result<(), ConfigError> {
        let config = parse(&HashMap::new())?;
        assert_eq!(config.service_name, "marketplace-ids");
        assert_eq!(config.db_url, None);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.log_format, LogFormat::Text);
        Ok(())
    }

    #[test]
    fn env_overrides_are_applied_and_clamped() -> Result<(), ConfigError> {
        let values = HashMap::from([
            ("IDS_SERVICE_NAME", "ids-staging"),
            ("DATABASE_URL", " postgres://ids@localhost/ids "),
            ("IDS_TX_MAX_ATTEMPTS", "500"),
            ("IDS_TX_BASE_BACKOFF_MS", "40"),
            ("IDS_TX_MAX_BACKOFF_MS", "10"),
            ("IDS_LOG_FORMAT", "JSON"),
        ]);
        let config = parse(&values)?;
        assert_eq!(config.service_name, "ids-staging");
        assert_eq!(
            config.db_url.as_deref(),
            Some("postgres://ids@localhost/ids")
        );
        assert_eq!(config.retry.max_attempts, 100);
        assert_eq!(config.retry.base_backoff_ms, 40);
        assert_eq!(config.retry.max_backoff_ms, 40);
        assert_eq!(config.log_format, LogFormat::Json);
        Ok(())
    }

    #[test]
    fn db_url_wins_over_database_url_and_blank_means_memory() -> Result<(), ConfigError> {
        let values = HashMap::from([("DB_URL", "postgres://primary"), ("DATABASE_URL", "postgres://other")]);
        assert_eq!(parse(&values)?.db_url.as_deref(), Some("postgres://primary"));

        let blank = HashMap::from([("DB_URL", "  ")]);
        assert_eq!(parse(&blank)?.db_url, None);
        Ok(())
    }

    #[test]
    fn zero_attempts_still_allow_one_try() -> Result<(), ConfigError> {
        let values = HashMap::from([("IDS_TX_MAX_ATTEMPTS", "0")]);
        assert_eq!(parse(&values)?.retry.max_attempts, 1);
        Ok(())
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let values = HashMap::from([("IDS_TX_MAX_ATTEMPTS", "many")]);
        let error = parse(&values).err();
        assert!(matches!(error, Some(ConfigError::InvalidTxMaxAttempts(_))));
        assert!(
            error
                .map(|error| error.to_string())
                .is_some_and(|message| message.starts_with("invalid IDS_TX_MAX_ATTEMPTS"))
        );

        let values = HashMap::from([("IDS_LOG_FORMAT", "yaml")]);
        assert_eq!(
            parse(&values).err(),
            Some(ConfigError::InvalidLogFormat("yaml".to_string()))
        );
    }
}
