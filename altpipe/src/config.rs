//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::policy::PolicyLimits;

/// Upper bound on one job, fetch to final event.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(360);

/// Application configuration, resolved from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Generation proxy endpoint.
    pub proxy_url: Url,
    /// Path to the transcoder binary.
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// When set, logs also go to daily-rolling files under this directory.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default)]
    pub limits: PolicyLimits,
}

fn default_ffmpeg_path() -> PathBuf {
    std::env::var("FFMPEG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("ffmpeg"))
}

fn default_job_timeout_secs() -> u64 {
    DEFAULT_JOB_TIMEOUT.as_secs()
}

impl AppConfig {
    /// Resolve configuration from environment variables.
    ///
    /// `ALTPIPE_PROXY_URL` is required; everything else has defaults.
    pub fn from_env() -> Result<Self> {
        let proxy_url = std::env::var("ALTPIPE_PROXY_URL")
            .map_err(|_| Error::config("ALTPIPE_PROXY_URL is not set"))?;
        let proxy_url = Url::parse(&proxy_url)
            .map_err(|e| Error::config(format!("invalid ALTPIPE_PROXY_URL: {e}")))?;

        let job_timeout_secs = match std::env::var("ALTPIPE_JOB_TIMEOUT_SECS") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| Error::config("ALTPIPE_JOB_TIMEOUT_SECS must be an integer"))?,
            Err(_) => default_job_timeout_secs(),
        };

        Ok(Self {
            proxy_url,
            ffmpeg_path: default_ffmpeg_path(),
            log_dir: std::env::var("ALTPIPE_LOG_DIR").ok().map(PathBuf::from),
            job_timeout_secs,
            limits: PolicyLimits::default(),
        })
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_deserialize() {
        let config: AppConfig =
            serde_json::from_str(r#"{"proxy_url":"https://proxy.example/generate"}"#).unwrap();
        assert_eq!(config.job_timeout().as_secs(), 360);
        assert_eq!(config.limits.max_chunks, 15);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_invalid_proxy_url_rejected() {
        let parsed = serde_json::from_str::<AppConfig>(r#"{"proxy_url":"not a url"}"#);
        assert!(parsed.is_err());
    }
}
