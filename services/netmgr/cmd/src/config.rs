//! Configuration for the netmgr binary.
//!
//! Settings come from a YAML file, then `NETMGR_*` environment variables,
//! then command line flags (applied in `main`). Durations are written the
//! humantime way: `500ms`, `30s`, `2m`.

use anyhow::{Context, Result};
use netmgr_transport::{NetConfig, Timeouts};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Which transport the demo listens and connects with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Tcpdns,
    Tls,
    Tlsdns,
}

impl Transport {
    pub fn is_dns(self) -> bool {
        matches!(self, Transport::Tcpdns | Transport::Tlsdns)
    }

    pub fn is_tls(self) -> bool {
        matches!(self, Transport::Tls | Transport::Tlsdns)
    }
}

impl std::str::FromStr for Transport {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "tcpdns" => Ok(Transport::Tcpdns),
            "tls" => Ok(Transport::Tls),
            "tlsdns" => Ok(Transport::Tlsdns),
            other => anyhow::bail!("unknown transport: {}", other),
        }
    }
}

/// Certificate material
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Server certificate chain (PEM)
    pub cert_file: Option<PathBuf>,
    /// Server private key (PEM)
    pub key_file: Option<PathBuf>,
    /// CA bundle the client trusts (PEM)
    pub ca_file: Option<PathBuf>,
    /// Name verified on the server certificate instead of its address
    pub server_name: Option<String>,
    /// Offer the `dot` ALPN as a client
    pub dot_alpn: bool,
}

/// Read timeouts as humantime strings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(with = "humantime_str")]
    pub init: Duration,
    #[serde(with = "humantime_str")]
    pub idle: Duration,
    #[serde(with = "humantime_str")]
    pub keepalive: Duration,
    #[serde(with = "humantime_str")]
    pub advertised: Duration,
    #[serde(with = "humantime_str")]
    pub write: Duration,
    #[serde(with = "humantime_str")]
    pub connect: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let t = Timeouts::default();
        Self {
            init: t.init,
            idle: t.idle,
            keepalive: t.keepalive,
            advertised: t.advertised,
            write: Duration::from_secs(30),
            connect: Duration::from_secs(5),
        }
    }
}

/// netmgr binary configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Worker threads; 0 means one per CPU
    pub workers: usize,
    pub transport: Transport,
    pub listen: SocketAddr,
    pub backlog: u32,
    /// Concurrent accepted connections; 0 disables admission control
    pub quota: usize,
    pub load_balance_sockets: bool,
    pub timeouts: TimeoutConfig,
    /// Period of the statistics log line; 0s disables it
    #[serde(with = "humantime_str")]
    pub stats_interval: Duration,
    pub tls: TlsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            transport: Transport::Tcpdns,
            listen: SocketAddr::from(([127, 0, 0, 1], 5300)),
            backlog: 128,
            quota: 0,
            load_balance_sockets: NetConfig::default().load_balance_sockets,
            timeouts: TimeoutConfig::default(),
            stats_interval: Duration::from_secs(60),
            tls: TlsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from `config_path` when it exists, then apply environment overrides
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: AppConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read config file {:?}", path))
            }
        };

        config.apply_environment_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `NETMGR_*` overrides read through `lookup`
    pub fn apply_environment_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("NETMGR_WORKERS") {
            self.workers = v.parse().context("NETMGR_WORKERS")?;
            info!("Workers overridden by environment: {}", self.workers);
        }
        if let Some(v) = lookup("NETMGR_TRANSPORT") {
            self.transport = v.parse().context("NETMGR_TRANSPORT")?;
            info!("Transport overridden by environment: {:?}", self.transport);
        }
        if let Some(v) = lookup("NETMGR_LISTEN") {
            self.listen = v.parse().context("NETMGR_LISTEN")?;
            info!("Listen address overridden by environment: {}", self.listen);
        }
        if let Some(v) = lookup("NETMGR_QUOTA") {
            self.quota = v.parse().context("NETMGR_QUOTA")?;
            info!("Quota overridden by environment: {}", self.quota);
        }
        if let Some(v) = lookup("NETMGR_STATS_INTERVAL") {
            self.stats_interval = humantime::parse_duration(&v).context("NETMGR_STATS_INTERVAL")?;
        }
        if let Some(v) = lookup("NETMGR_TLS_CERT") {
            self.tls.cert_file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("NETMGR_TLS_KEY") {
            self.tls.key_file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("NETMGR_TLS_CA") {
            self.tls.ca_file = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Settings for the network manager
    pub fn net_config(&self) -> NetConfig {
        let mut net = NetConfig::default().with_timeouts(Timeouts {
            init: self.timeouts.init,
            idle: self.timeouts.idle,
            keepalive: self.timeouts.keepalive,
            advertised: self.timeouts.advertised,
        });
        if self.workers > 0 {
            net = net.with_workers(self.workers);
        }
        net.write_timeout = self.timeouts.write;
        net.load_balance_sockets = self.load_balance_sockets;
        net
    }
}

mod humantime_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
