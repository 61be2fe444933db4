// ⚙️ Configuration - environment (and optional .env) for both binaries

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::recognition::GOOGLE_VISION_ENDPOINT;

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file holding bills, ledger and audit trail
    pub database_path: PathBuf,

    /// Google Vision API key; without it only text uploads work
    pub vision_api_key: Option<String>,

    pub vision_endpoint: String,

    /// Per-call timeout of the recognition request
    pub recognition_timeout: Duration,

    /// Deadline for one whole operation (server requests)
    pub request_timeout: Duration,

    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: PathBuf::from("receipts.db"),
            vision_api_key: None,
            vision_endpoint: GOOGLE_VISION_ENDPOINT.to_string(),
            recognition_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            port: 8080,
        }
    }
}

impl Config {
    /// Load `.env` if present, then read the environment
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Config {
            database_path: non_empty("RECEIPT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            vision_api_key: non_empty("VISION_API_KEY"),
            vision_endpoint: non_empty("VISION_ENDPOINT").unwrap_or(defaults.vision_endpoint),
            recognition_timeout: parse_var::<u64>(&non_empty, "RECOGNITION_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.recognition_timeout),
            request_timeout: parse_var::<u64>(&non_empty, "REQUEST_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            port: parse_var::<u16>(&non_empty, "PORT")?.unwrap_or(defaults.port),
        })
    }
}

fn parse_var<T>(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {}: {:?}", key, raw))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.database_path, PathBuf::from("receipts.db"));
        assert_eq!(config.vision_api_key, None);
        assert_eq!(config.vision_endpoint, GOOGLE_VISION_ENDPOINT);
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("RECEIPT_DB_PATH", "/tmp/ledger.db"),
            ("VISION_API_KEY", "secret"),
            ("RECOGNITION_TIMEOUT_SECS", "5"),
            ("PORT", "9090"),
        ])
        .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/tmp/ledger.db"));
        assert_eq!(config.vision_api_key.as_deref(), Some("secret"));
        assert_eq!(config.recognition_timeout, Duration::from_secs(5));
        assert_eq!(config.port, 9090);
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let err = config_from(&[("PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn test_blank_key_counts_as_unset() {
        let config = config_from(&[("VISION_API_KEY", "  ")]).unwrap();
        assert_eq!(config.vision_api_key, None);
    }
}
