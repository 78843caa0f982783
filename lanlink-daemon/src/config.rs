//! Daemon Configuration
//!
//! TOML configuration for the LAN link daemon, stored as `daemon.toml`
//! under the user's config directory.

use anyhow::{Context, Result};
use lanlink_protocol::discovery::service::DEFAULT_BROADCAST_INTERVAL;
use lanlink_protocol::identity::generate_device_id;
use lanlink_protocol::ServiceConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "lanlink";
const CONFIG_FILE: &str = "daemon.toml";
const DEVICES_FILE: &str = "devices.json";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device configuration
    pub device: DeviceConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Capability manifests to enable
    #[serde(default)]
    pub plugins: PluginConfig,

    /// Storage paths
    pub paths: PathConfig,
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name
    pub name: String,

    /// Device type (desktop, laptop, phone, tablet, tv)
    pub device_type: String,

    /// Device ID (generated and written back on first run)
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// UDP discovery port
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    /// TCP control port
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// TCP transfer port range start
    #[serde(default = "default_transfer_port_start")]
    pub transfer_port_start: u16,

    /// TCP transfer port range end
    #[serde(default = "default_transfer_port_end")]
    pub transfer_port_end: u16,

    /// Target of undirected announcements
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: IpAddr,

    /// Announcement interval in seconds, 0 to announce only at startup
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval: u64,

    /// Admit identities from hosts we have not announced to
    #[serde(default = "default_true")]
    pub discoverable: bool,

    /// Hosts announced to directly
    #[serde(default)]
    pub broadcast_to: Vec<IpAddr>,
}

/// Capability manifest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default = "default_true")]
    pub enable_ping: bool,

    #[serde(default = "default_true")]
    pub enable_battery: bool,

    #[serde(default = "default_true")]
    pub enable_clipboard: bool,

    #[serde(default = "default_true")]
    pub enable_share: bool,

    #[serde(default = "default_true")]
    pub enable_findmyphone: bool,

    #[serde(default = "default_true")]
    pub enable_notification: bool,

    /// Remote command execution, off unless asked for
    #[serde(default)]
    pub enable_runcommand: bool,

    #[serde(default = "default_true")]
    pub enable_mpris: bool,
}

/// Storage paths configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory
    pub config_dir: PathBuf,

    /// Data directory (device registry)
    pub data_dir: PathBuf,

    /// Certificate directory (self certificate and pinned peers)
    pub cert_dir: PathBuf,
}

fn default_discovery_port() -> u16 {
    lanlink_protocol::DISCOVERY_PORT
}

fn default_control_port() -> u16 {
    lanlink_protocol::CONTROL_PORT
}

fn default_transfer_port_start() -> u16 {
    lanlink_protocol::TRANSFER_PORT_START
}

fn default_transfer_port_end() -> u16 {
    lanlink_protocol::TRANSFER_PORT_END
}

fn default_broadcast_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::BROADCAST)
}

fn default_broadcast_interval() -> u64 {
    DEFAULT_BROADCAST_INTERVAL.as_secs()
}

fn default_true() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            control_port: default_control_port(),
            transfer_port_start: default_transfer_port_start(),
            transfer_port_end: default_transfer_port_end(),
            broadcast_address: default_broadcast_address(),
            broadcast_interval: default_broadcast_interval(),
            discoverable: true,
            broadcast_to: Vec::new(),
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enable_ping: true,
            enable_battery: true,
            enable_clipboard: true,
            enable_share: true,
            enable_findmyphone: true,
            enable_notification: true,
            enable_runcommand: false,
            enable_mpris: true,
        }
    }
}

impl PluginConfig {
    /// Names of the enabled built-in manifests
    pub fn enabled(&self) -> Vec<&'static str> {
        [
            ("ping", self.enable_ping),
            ("battery", self.enable_battery),
            ("clipboard", self.enable_clipboard),
            ("share", self.enable_share),
            ("findmyphone", self.enable_findmyphone),
            ("notification", self.enable_notification),
            ("runcommand", self.enable_runcommand),
            ("mpris", self.enable_mpris),
        ]
        .into_iter()
        .filter_map(|(name, enabled)| enabled.then_some(name))
        .collect()
    }
}

impl PathConfig {
    fn under(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            cert_dir: config_dir.join("certs"),
            config_dir,
            data_dir,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                name: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "Unknown Device".to_string()),
                device_type: "desktop".to_string(),
                device_id: None,
            },
            network: NetworkConfig::default(),
            plugins: PluginConfig::default(),
            paths: PathConfig::under(default_config_dir(), default_data_dir()),
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join(APP_DIR)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join(APP_DIR)
}

impl Config {
    /// Default location of `daemon.toml`
    pub fn default_path() -> PathBuf {
        default_config_dir().join(CONFIG_FILE)
    }

    /// Load configuration from file, creating default if not found
    ///
    /// A missing device id is generated and saved so the certificate common
    /// name stays stable across restarts.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        let mut config = if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file {:?}", config_path))?;
            toml::from_str::<Config>(&contents)
                .with_context(|| format!("Failed to parse config file {:?}", config_path))?
        } else {
            let mut config = Config::default();
            if let Some(dir) = config_path.parent().filter(|d| !d.as_os_str().is_empty()) {
                config.paths = PathConfig::under(dir.to_path_buf(), config.paths.data_dir);
            }
            config
        };

        if config.device.device_id.is_none() || !config_path.exists() {
            config.device.device_id.get_or_insert_with(generate_device_id);
            config.save_to(&config_path)?;
        }

        Ok(config)
    }

    /// Save configuration to `daemon.toml` in the config directory
    pub fn save(&self) -> Result<()> {
        self.save_to(&self.paths.config_dir.join(CONFIG_FILE))
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir)
            .context("Failed to create config directory")?;
        fs::create_dir_all(&self.paths.data_dir)
            .context("Failed to create data directory")?;
        fs::create_dir_all(&self.paths.cert_dir)
            .context("Failed to create certificate directory")?;
        Ok(())
    }

    /// Path of the persisted device registry
    pub fn devices_path(&self) -> PathBuf {
        self.paths.data_dir.join(DEVICES_FILE)
    }

    /// Library service configuration for these settings
    pub fn service_config(&self) -> ServiceConfig {
        let network = &self.network;
        ServiceConfig {
            udp_port: network.discovery_port,
            tcp_port: network.control_port,
            broadcast_address: SocketAddr::new(network.broadcast_address, network.discovery_port),
            broadcast_to: network
                .broadcast_to
                .iter()
                .map(|host| SocketAddr::new(*host, network.discovery_port))
                .collect(),
            transfer_ports: network.transfer_port_start..=network.transfer_port_end,
            broadcast_interval: Duration::from_secs(network.broadcast_interval),
            discoverable: network.discoverable,
            ..ServiceConfig::default()
        }
    }
}
