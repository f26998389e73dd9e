use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub api_key: Option<String>,
    /// Per-subscriber capacity of progress snapshot queues.
    pub progress_buffer: usize,
    /// Feature flags reported as enabled to the compiler.
    pub features: Vec<String>,
    pub default_list_limit: u64,
    pub config_push_timeout: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    chquery_listen_addr: Option<String>,
    #[serde(default)]
    chquery_listen_host: Option<String>,
    #[serde(default)]
    chquery_listen_port: Option<u16>,
    #[serde(default)]
    chquery_api_key: Option<String>,
    #[serde(default = "default_progress_buffer")]
    chquery_progress_buffer: usize,
    #[serde(default)]
    chquery_features: Option<String>,
    #[serde(default = "default_list_limit")]
    chquery_default_list_limit: u64,
    #[serde(default = "default_push_timeout_secs")]
    chquery_config_push_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    chquery_request_timeout_secs: u64,
}

const fn default_progress_buffer() -> usize {
    1000
}

const fn default_list_limit() -> u64 {
    100
}

const fn default_push_timeout_secs() -> u64 {
    60
}

const fn default_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse CHQUERY_* environment variables")?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let listen_addr = resolve_addr(
            raw.chquery_listen_addr,
            raw.chquery_listen_host,
            raw.chquery_listen_port,
        )?;

        let features = raw
            .chquery_features
            .map(|csv| {
                csv.split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            listen_addr,
            api_key: raw.chquery_api_key.filter(|key| !key.is_empty()),
            progress_buffer: raw.chquery_progress_buffer.max(1),
            features,
            default_list_limit: raw.chquery_default_list_limit.max(1),
            config_push_timeout: Duration::from_secs(raw.chquery_config_push_timeout_secs.max(1)),
            request_timeout: Duration::from_secs(raw.chquery_request_timeout_secs.max(1)),
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8481)),
            api_key: None,
            progress_buffer: default_progress_buffer(),
            features: Vec::new(),
            default_list_limit: default_list_limit(),
            config_push_timeout: Duration::from_secs(default_push_timeout_secs()),
            request_timeout: Duration::from_secs(default_timeout_secs()),
        }
    }
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid CHQUERY_LISTEN_ADDR value")?
            .next()
            .context("CHQUERY_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8481);
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(vars: &[(&str, &str)]) -> RawConfig {
        envy::from_iter(
            vars.iter()
                .map(|(key, value)| (key.to_string(), value.to_string())),
        )
        .unwrap()
    }

    #[test]
    fn defaults_apply() {
        let config = AppConfig::from_raw(raw(&[])).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8481".parse().unwrap());
        assert_eq!(config.progress_buffer, 1000);
        assert_eq!(config.default_list_limit, 100);
        assert_eq!(config.config_push_timeout, Duration::from_secs(60));
        assert!(config.features.is_empty());
        assert!(config.api_key.is_none());
    }

    #[test]
    fn features_are_split_and_trimmed() {
        let config = AppConfig::from_raw(raw(&[
            ("CHQUERY_FEATURES", " PreferRPM, ,Other "),
            ("CHQUERY_LISTEN_PORT", "9000"),
        ]))
        .unwrap();
        assert_eq!(config.features, vec!["PreferRPM", "Other"]);
        assert_eq!(config.listen_addr.port(), 9000);
    }

    #[test]
    fn bad_listen_addr_fails() {
        let err = AppConfig::from_raw(raw(&[("CHQUERY_LISTEN_ADDR", "nowhere")])).unwrap_err();
        assert!(err.to_string().contains("CHQUERY_LISTEN_ADDR"), "{err}");
    }
}
