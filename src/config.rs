use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{fs, net::IpAddr, path::Path, time::Duration};

use crate::credential::Credential;
use crate::relay::RelayOptions;
use crate::resolver::{DEFAULT_RESERVED_PREFIX, FallbackPolicy};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    pub tunnel: TunnelConfig,
}

#[derive(Debug, Deserialize)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    pub allowed_proxy_ips: Option<Vec<String>>,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Deserialize)]
pub struct TunnelConfig {
    pub credential: String,
    pub fallback_address: String,
    #[serde(default = "default_reserved_prefix")]
    pub reserved_prefix: String,
    /// Zero disables the timeout.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Zero disables the timeout.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,
}

fn default_path() -> String {
    "/".to_string()
}
fn default_reserved_prefix() -> String {
    DEFAULT_RESERVED_PREFIX.to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_outbound_queue_depth() -> usize {
    16
}

/// Validated, immutable per-process tunnel settings shared by every session.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub credential: Credential,
    pub fallback: FallbackPolicy,
    pub connect_timeout: Option<Duration>,
    pub relay: RelayOptions,
}

impl TunnelConfig {
    pub fn settings(&self) -> Result<TunnelSettings> {
        let credential: Credential = self
            .credential
            .parse()
            .context("Invalid tunnel.credential")?;

        validate_fallback_address(&self.fallback_address)?;
        if self.reserved_prefix.is_empty() {
            bail!("tunnel.reserved_prefix must not be empty");
        }
        if self.outbound_queue_depth == 0 {
            bail!("tunnel.outbound_queue_depth must be greater than zero");
        }

        Ok(TunnelSettings {
            credential,
            fallback: FallbackPolicy::new(&self.reserved_prefix, self.fallback_address.trim()),
            connect_timeout: seconds(self.connect_timeout_secs),
            relay: RelayOptions {
                idle_timeout: seconds(self.idle_timeout_secs),
                queue_depth: self.outbound_queue_depth,
            },
        })
    }
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Accepts an IP literal or a DNS hostname.
fn validate_fallback_address(address: &str) -> Result<()> {
    let address = address.trim();
    if address.is_empty() {
        bail!("tunnel.fallback_address must not be empty");
    }
    if address.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    let valid_hostname = address.len() <= 253
        && address.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        });
    if !valid_hostname {
        bail!("tunnel.fallback_address is neither an IP address nor a hostname: {address}");
    }
    Ok(())
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config as valid TOML")?;
    if !config.listen.path.starts_with('/') {
        bail!("listen.path must start with '/'");
    }
    Ok(config)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Invalid config file {}", path.display()))
}
