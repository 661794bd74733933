use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MediadexError, Result};

/// Runtime configuration, resolved once from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub data_dir: PathBuf,
    pub forensics_dir: PathBuf,
    pub use_raw_previews: bool,
    pub allow_mock_default: bool,
    pub heartbeat_interval: Duration,
    pub lease_ttl: Duration,
    pub poll_interval: Duration,
}

fn env_secs(key: &str, default: u64) -> Result<Duration> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| MediadexError::Config(format!("{key} must be an integer, got {raw:?}"))),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| MediadexError::Config("DATABASE_URL is not set".into()))?;
        let data_dir = env::var("MEDIA_SEARCH_DATA_DIR").unwrap_or_else(|_| "./data".into());
        let forensics_dir =
            env::var("MEDIA_SEARCH_FORENSICS_DIR").unwrap_or_else(|_| "./logs/forensics".into());
        Ok(Self {
            database_url,
            data_dir: PathBuf::from(data_dir),
            forensics_dir: PathBuf::from(forensics_dir),
            use_raw_previews: env::var("MEDIA_SEARCH_USE_RAW_PREVIEWS")
                .map(|v| v != "false")
                .unwrap_or(true),
            allow_mock_default: env::var("MEDIASEARCH_ALLOW_MOCK_DEFAULT")
                .map(|v| v == "1")
                .unwrap_or(false),
            heartbeat_interval: env_secs("HEARTBEAT_INTERVAL_SEC", 15)?,
            lease_ttl: env_secs("LEASE_TTL_SEC", 300)?,
            poll_interval: env_secs("POLL_INTERVAL_SEC", 5)?,
        })
    }

    pub fn lease_ttl_secs(&self) -> i64 {
        self.lease_ttl.as_secs() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_secs_rejects_garbage() {
        std::env::set_var("MEDIADEX_TEST_SECS", "soon");
        let err = env_secs("MEDIADEX_TEST_SECS", 5).unwrap_err();
        assert!(matches!(err, MediadexError::Config(_)));
        std::env::remove_var("MEDIADEX_TEST_SECS");
    }

    #[test]
    fn env_secs_defaults_when_unset() {
        assert_eq!(
            env_secs("MEDIADEX_TEST_UNSET", 15).unwrap(),
            Duration::from_secs(15)
        );
    }
}
