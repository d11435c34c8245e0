//! `cihub.toml`: every field has a default, so an absent file is a valid
//! configuration.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:7070"
//! base_path = "/api"
//!
//! [engine]
//! call_timeout_ms = 10000
//! poll_ttl_ms = 2000
//!
//! [store]
//! path = "/var/lib/cihub/nodes.json"
//!
//! [telemetry]
//! format = "json"
//! otlp_endpoint = "http://collector:4317"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use engine::EngineSettings;
use jenkins::JenkinsConfig;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub jenkins: JenkinsSection,
    pub store: StoreConfig,
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Reads and validates the file at `path`, or returns the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                Self::parse(&text)
                    .with_context(|| format!("invalid configuration in {}", path.display()))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let e = &self.engine;
        let timings = [
            ("engine.call_timeout_ms", e.call_timeout_ms),
            ("engine.fanout_timeout_ms", e.fanout_timeout_ms),
            ("engine.view_cache_ttl_ms", e.view_cache_ttl_ms),
            ("engine.poll_ttl_ms", e.poll_ttl_ms),
            ("engine.retention_ms", e.retention_ms),
            ("engine.sweep_interval_ms", e.sweep_interval_ms),
        ];
        for (name, value) in timings {
            if value == 0 {
                bail!("{name} must be greater than 0");
            }
        }
        if e.fanout_timeout_ms < e.call_timeout_ms.saturating_mul(2) {
            bail!("engine.fanout_timeout_ms must be at least twice engine.call_timeout_ms");
        }
        if e.view_cache_ttl_ms >= e.retention_ms || e.poll_ttl_ms >= e.retention_ms {
            bail!("engine.retention_ms must be longer than every cache TTL");
        }
        if !self.server.base_path.is_empty() && !self.server.base_path.starts_with('/') {
            bail!("server.base_path must start with '/'");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Prefix all routes are mounted under; empty mounts at the root.
    pub base_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 7070)),
            base_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub call_timeout_ms: u64,
    pub fanout_timeout_ms: u64,
    pub view_cache_ttl_ms: u64,
    pub poll_ttl_ms: u64,
    pub start_grace_ms: u64,
    pub retention_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let d = EngineSettings::default();
        Self {
            call_timeout_ms: millis(d.call_timeout),
            fanout_timeout_ms: millis(d.fanout_timeout),
            view_cache_ttl_ms: millis(d.view_cache_ttl),
            poll_ttl_ms: millis(d.poll_ttl),
            start_grace_ms: millis(d.start_grace),
            retention_ms: millis(d.retention),
            sweep_interval_ms: 60_000,
        }
    }
}

impl EngineConfig {
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            fanout_timeout: Duration::from_millis(self.fanout_timeout_ms),
            view_cache_ttl: Duration::from_millis(self.view_cache_ttl_ms),
            poll_ttl: Duration::from_millis(self.poll_ttl_ms),
            start_grace: Duration::from_millis(self.start_grace_ms),
            retention: Duration::from_millis(self.retention_ms),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JenkinsSection {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub user_agent: Option<String>,
}

impl Default for JenkinsSection {
    fn default() -> Self {
        let d = JenkinsConfig::default();
        Self {
            max_retries: d.max_retries,
            retry_backoff_ms: millis(d.retry_backoff),
            user_agent: None,
        }
    }
}

impl JenkinsSection {
    pub fn client_config(&self) -> JenkinsConfig {
        let mut config = JenkinsConfig {
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            ..JenkinsConfig::default()
        };
        if let Some(agent) = &self.user_agent {
            config.user_agent = agent.clone();
        }
        config
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// JSON file holding registered nodes; in-memory when absent.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub format: LogFormat,
    /// OTLP/gRPC collector; spans are only exported when set.
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            format: LogFormat::Pretty,
            otlp_endpoint: None,
            service_name: "cihub".into(),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_match_the_engine() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.engine.settings(), EngineSettings::default());
        assert_eq!(config.jenkins.client_config(), JenkinsConfig::default());
        assert_eq!(config.server.bind.port(), 7070);
        assert!(config.store.path.is_none());
    }

    #[test]
    fn partial_file_overrides_only_what_it_names() {
        let config = Config::parse(
            r#"
            [server]
            bind = "0.0.0.0:9000"
            base_path = "/api"

            [engine]
            poll_ttl_ms = 500

            [telemetry]
            format = "json"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.bind, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.engine.settings().poll_ttl, Duration::from_millis(500));
        assert_eq!(config.engine.call_timeout_ms, EngineConfig::default().call_timeout_ms);
        assert_eq!(config.telemetry.format, LogFormat::Json);
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let config = Config::parse("[engine]\ncall_timeout_ms = 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("call_timeout_ms"));
    }

    #[test]
    fn fan_out_must_hold_two_calls() {
        let config = Config::parse(
            "[engine]\ncall_timeout_ms = 10000\nfanout_timeout_ms = 15000\n",
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fanout_timeout_ms"));

        let config = Config::parse(
            "[engine]\ncall_timeout_ms = 10000\nfanout_timeout_ms = 20000\n",
        )
        .unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn retention_must_outlive_the_cache() {
        let config = Config::parse("[engine]\nretention_ms = 1000\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::parse("[server]\nport = 1\n").is_err());
    }

    #[test]
    fn file_is_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cihub.toml");
        std::fs::write(&path, "[store]\npath = \"nodes.json\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.store.path, Some(PathBuf::from("nodes.json")));
        assert!(Config::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
