//! Server configuration: defaults, then a TOML file, then `MEGAMODEL_*`
//! environment variables, then command-line flags.

use std::path::Path;

use megamodel_engine::{ConfigError, EngineConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub(crate) enum LoadError {
    #[error("error reading config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("error parsing config file '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: '{value}'")]
    Env { var: &'static str, value: String },
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Origins allowed to make credentialed cross-origin requests. Empty
    /// mirrors the request's origin.
    pub allowed_origins: Vec<String>,
    /// Period of the metrics report log line; 0 disables it.
    pub metrics_report_interval_ms: u64,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: Vec::new(),
            metrics_report_interval_ms: 60_000,
            engine: EngineConfig::default(),
        }
    }
}

/// Flag values that override everything else.
#[derive(Debug, Clone, Default)]
pub(crate) struct Overrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub allowed_origins: Vec<String>,
}

impl ServerConfig {
    /// Resolve the effective configuration from every source.
    pub(crate) fn load(path: Option<&Path>, overrides: Overrides) -> Result<Self, LoadError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        if let Some(bind) = overrides.bind {
            config.bind = bind;
        }
        if let Some(port) = overrides.port {
            config.port = port;
        }
        if !overrides.allowed_origins.is_empty() {
            config.allowed_origins = overrides.allowed_origins;
        }
        config.engine.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, LoadError> {
        let text = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| LoadError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), LoadError> {
        if let Some(bind) = lookup("MEGAMODEL_BIND") {
            self.bind = bind;
        }
        if let Some(port) = parse_var(&lookup, "MEGAMODEL_PORT")? {
            self.port = port;
        }
        if let Some(origins) = lookup("MEGAMODEL_ALLOWED_ORIGINS") {
            self.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(ms) = parse_var(&lookup, "MEGAMODEL_FENCE_TIMEOUT_MS")? {
            self.engine.fence_timeout_ms = ms;
        }
        if let Some(retries) = parse_var(&lookup, "MEGAMODEL_MAX_WRITE_RETRIES")? {
            self.engine.max_write_retries = retries;
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, LoadError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| LoadError::Env { var, value }),
    }
}
