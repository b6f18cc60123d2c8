use anyhow::{anyhow, Context};
use medquery_storage::MongoConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_addr: SocketAddr,
    pub mongo_uri: Option<String>,
    pub database: String,
    pub seed_file: Option<PathBuf>,
    pub server_selection_timeout: Duration,
    pub operation_timeout: Duration,
    pub tls: bool,
    pub tls_allow_invalid: bool,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads every `MEDQUERY_*` setting through `get`; blank values count
    /// as unset.
    pub fn from_lookup<F>(get: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        let http_addr = get("MEDQUERY_HTTP_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".into())
            .parse()
            .context("MEDQUERY_HTTP_ADDR")?;
        Ok(Self {
            http_addr,
            mongo_uri: get("MEDQUERY_MONGO_URI"),
            database: get("MEDQUERY_DATABASE").unwrap_or_else(|| "logs".into()),
            seed_file: get("MEDQUERY_SEED_FILE").map(PathBuf::from),
            server_selection_timeout: millis(
                "MEDQUERY_SERVER_SELECTION_TIMEOUT_MS",
                get("MEDQUERY_SERVER_SELECTION_TIMEOUT_MS"),
            )?,
            operation_timeout: millis(
                "MEDQUERY_OPERATION_TIMEOUT_MS",
                get("MEDQUERY_OPERATION_TIMEOUT_MS"),
            )?,
            tls: flag("MEDQUERY_TLS", get("MEDQUERY_TLS"), true)?,
            tls_allow_invalid: flag(
                "MEDQUERY_TLS_ALLOW_INVALID",
                get("MEDQUERY_TLS_ALLOW_INVALID"),
                false,
            )?,
        })
    }

    /// Store settings, present only when a MongoDB URI was given.
    pub fn mongo(&self) -> Option<MongoConfig> {
        let uri = self.mongo_uri.as_ref()?;
        let mut cfg = MongoConfig::new(uri.clone(), self.database.clone());
        cfg.server_selection_timeout = self.server_selection_timeout;
        cfg.operation_timeout = self.operation_timeout;
        cfg.tls = self.tls;
        cfg.tls_allow_invalid_certificates = self.tls_allow_invalid;
        Some(cfg)
    }
}

fn millis(key: &str, raw: Option<String>) -> anyhow::Result<Duration> {
    match raw {
        None => Ok(Duration::from_millis(5000)),
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .with_context(|| format!("{key} must be a number of milliseconds, got {v:?}")),
    }
}

fn flag(key: &str, raw: Option<String>, default: bool) -> anyhow::Result<bool> {
    let Some(v) = raw else {
        return Ok(default);
    };
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{key} must be a boolean, got {v:?}")),
    }
}
