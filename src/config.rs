use anyhow::Context;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Dial deadline used when a configuration does not set `requestTimeout`.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub configurations: Vec<ListenerConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Path to a kubeconfig file. Empty means: try in-cluster credentials,
    /// then fall back to the default user location.
    #[serde(default)]
    pub kubeconfig_path: String,
}

/// One listener bound to a named backend port.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ListenerConfig {
    pub name: String,
    pub listener_address: String,
    /// Outbound dial deadline in seconds. 0 or absent uses the default.
    #[serde(default)]
    pub request_timeout: u64,
    pub backend_port_name: String,
    /// Namespace to discover services in. Empty means all namespaces.
    #[serde(default)]
    pub namespace: String,
}

impl ListenerConfig {
    /// Address in a form `TcpListener::bind` accepts. `:port` binds all
    /// interfaces.
    pub fn bind_addr(&self) -> String {
        if self.listener_address.starts_with(':') {
            format!("0.0.0.0{}", self.listener_address)
        } else {
            self.listener_address.clone()
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        if self.request_timeout == 0 {
            DEFAULT_DIAL_TIMEOUT
        } else {
            Duration::from_secs(self.request_timeout)
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(&self.namespace)
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration at index {0}: name must not be empty")]
    EmptyName(usize),
    #[error("duplicate configuration name '{0}'")]
    DuplicateName(String),
    #[error("configuration '{0}': listenerAddress must not be empty")]
    EmptyListenerAddress(String),
    #[error("configuration '{name}': invalid listenerAddress '{addr}'")]
    InvalidListenerAddress { name: String, addr: String },
    #[error("configuration '{0}': backendPortName must not be empty")]
    EmptyBackendPortName(String),
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();

        for (i, c) in self.configurations.iter().enumerate() {
            if c.name.is_empty() {
                return Err(ConfigError::EmptyName(i));
            }
            if !names.insert(c.name.as_str()) {
                return Err(ConfigError::DuplicateName(c.name.clone()));
            }
            if c.listener_address.is_empty() {
                return Err(ConfigError::EmptyListenerAddress(c.name.clone()));
            }
            if !valid_listener_address(&c.listener_address) {
                return Err(ConfigError::InvalidListenerAddress {
                    name: c.name.clone(),
                    addr: c.listener_address.clone(),
                });
            }
            if c.backend_port_name.is_empty() {
                return Err(ConfigError::EmptyBackendPortName(c.name.clone()));
            }
        }

        Ok(())
    }
}

/// Accepts `host:port` and `:port`; the port must be a non-zero u16.
fn valid_listener_address(addr: &str) -> bool {
    match addr.rfind(':') {
        Some(idx) => matches!(addr[idx + 1..].parse::<u16>(), Ok(p) if p > 0),
        None => false,
    }
}

/// Extract the port from `host:port` or `:port` for log lines. Returns the
/// input unchanged when it carries no colon.
pub fn extract_port(addr: &str) -> &str {
    match addr.rfind(':') {
        Some(idx) => &addr[idx + 1..],
        None => addr,
    }
}

/// Read and validate the configuration file.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;

    let config: Config =
        serde_yaml::from_str(&data).context("failed to parse configuration file")?;
    config.validate()?;

    for c in &config.configurations {
        tracing::info!(
            "loaded configuration: {} > {}",
            c.name,
            extract_port(&c.listener_address)
        );
    }

    Ok(config)
}
