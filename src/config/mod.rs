//! # Configuration
//!
//! Harness settings loaded from a JSON file, and logging setup.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::ConfigError;
use crate::instance::{FhirVersion, InstanceContext, TestingInstance};

/// Environment variable overriding the configured log filter.
pub const LOG_ENV: &str = "FHIR_HARNESS_LOG";

const DEFAULT_ACCEPT: &str = "application/fhir+json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_ms: Option<u64>,
    pub verify_ssl: bool,
    pub accept: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: Some(30_000),
            verify_ssl: true,
            accept: DEFAULT_ACCEPT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// SQLite file for sequence runs. In-memory when absent.
    pub database_path: Option<PathBuf>,
    pub log_filter: String,
    pub http: HttpConfig,
    pub instance: TestingInstance,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            log_filter: "info".to_string(),
            http: HttpConfig::default(),
            instance: TestingInstance::new("local"),
        }
    }
}

impl HarnessConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: HarnessConfig = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http.accept.trim().is_empty() {
            return Err(ConfigError::Invalid("http.accept cannot be empty".to_string()));
        }

        if let Some(raw) = self.instance.get("fhir_version") {
            raw.parse::<FhirVersion>().map_err(ConfigError::Invalid)?;
        }

        if let Some(url) = self.instance.get("url") {
            reqwest::Url::parse(url)
                .map_err(|e| ConfigError::Invalid(format!("instance url `{url}`: {e}")))?;
        }

        Ok(())
    }
}

/// Installs the global tracing subscriber, writing to stderr. `FHIR_HARNESS_LOG`
/// takes precedence over `default_filter`. Safe to call more than once.
pub fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
