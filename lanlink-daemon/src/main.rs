mod config;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use lanlink_protocol::{
    capability::builtin_manifest, DeviceInfo, DeviceRegistry, DeviceType, DiscoveryService, Packet,
    PacketRouter, PluginRegistry, RegistryEvent, ServiceEvent, TlsContext, TrustStore,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;

/// LAN link daemon - device discovery and secure connections
#[derive(Parser, Debug)]
#[command(name = "lanlink-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to daemon.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the advertised device name
    #[arg(short, long)]
    name: Option<String>,

    /// Admit identities from unknown hosts
    #[arg(long)]
    discoverable: Option<bool>,

    /// Announce directly to this host (repeatable)
    #[arg(long = "broadcast-to", value_name = "IP")]
    broadcast_to: Vec<IpAddr>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(name) = &self.name {
            config.device.name = name.clone();
        }
        if let Some(discoverable) = self.discoverable {
            config.network.discoverable = discoverable;
        }
        for host in &self.broadcast_to {
            if !config.network.broadcast_to.contains(host) {
                config.network.broadcast_to.push(*host);
            }
        }
    }
}

/// Routes packets from attached channels to the manifest owning their type
///
/// Payload handling is out of scope for the daemon; packets are logged.
struct LoggingRouter {
    plugins: Arc<PluginRegistry>,
}

#[async_trait]
impl PacketRouter for LoggingRouter {
    async fn route(&self, device_id: &str, packet: Packet) -> lanlink_protocol::Result<()> {
        match self.plugins.handler_for(&packet.packet_type) {
            Some(plugin) => debug!(
                "Packet {} from {} handled by {}",
                packet.packet_type, device_id, plugin
            ),
            None => warn!(
                "No enabled plugin handles {} from {}",
                packet.packet_type, device_id
            ),
        }
        Ok(())
    }
}

fn build_plugins(config: &Config) -> Result<PluginRegistry> {
    let mut plugins = PluginRegistry::new();

    for name in config.plugins.enabled() {
        let manifest = builtin_manifest(name)
            .with_context(|| format!("Unknown built-in plugin {}", name))?;
        info!("Registering {} plugin", name);
        plugins
            .register(manifest)
            .with_context(|| format!("Failed to register {} plugin", name))?;
    }

    Ok(plugins)
}

/// Main daemon state
struct Daemon {
    config: Config,
    registry: Arc<DeviceRegistry>,
    service: DiscoveryService,
}

impl Daemon {
    /// Open the trust store and device registry and bind the sockets
    async fn new(config: Config) -> Result<Self> {
        config.ensure_directories()
            .context("Failed to create directories")?;

        let device_id = config
            .device
            .device_id
            .clone()
            .context("Configuration has no device id")?;

        let trust = Arc::new(
            TrustStore::open(&config.paths.cert_dir, &device_id)
                .context("Failed to open certificate store")?,
        );
        info!("Certificate fingerprint: {}", trust.self_certificate().fingerprint);

        let tls = Arc::new(TlsContext::new(trust.clone()).context("Failed to set up TLS")?);
        let plugins = Arc::new(build_plugins(&config)?);

        let registry = Arc::new(DeviceRegistry::with_storage(
            plugins.clone(),
            trust,
            config.devices_path(),
        ));
        let restored = registry.load().await.context("Failed to load known devices")?;
        info!("Restored {} paired device(s)", restored);

        let local = DeviceInfo::with_id(
            device_id,
            &config.device.name,
            DeviceType::from_name(&config.device.device_type),
            config.network.control_port,
        );

        let router = Arc::new(LoggingRouter { plugins });
        let service = DiscoveryService::bind(config.service_config(), local, registry.clone(), tls, router)
            .await
            .context("Failed to bind discovery sockets")?;

        Ok(Self {
            config,
            registry,
            service,
        })
    }

    /// Run until interrupted
    async fn run(&self) -> Result<()> {
        let local = self.service.local_identity();
        info!("LAN link daemon running");
        info!("Device: {} ({})", local.device_name, local.device_id);
        info!("Type: {:?}", local.device_type);
        info!("Protocol version: {}", local.protocol_version);
        info!("Incoming capabilities: {}", local.incoming_capabilities.len());
        info!("Outgoing capabilities: {}", local.outgoing_capabilities.len());

        tokio::spawn(log_service_events(self.service.clone()));
        tokio::spawn(log_registry_events(self.registry.clone()));

        self.service.start().await.context("Failed to start discovery service")?;

        if self.config.network.broadcast_interval == 0 {
            self.announce_once().await;
        }

        info!("Press Ctrl+C to stop");
        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");

        Ok(())
    }

    async fn announce_once(&self) {
        if let Err(e) = self.service.broadcast(None).await {
            warn!("Failed to broadcast identity: {}", e);
        }
        for host in &self.config.network.broadcast_to {
            let target = SocketAddr::new(*host, self.config.network.discovery_port);
            if let Err(e) = self.service.broadcast(Some(target)).await {
                warn!("Failed to send identity to {}: {}", target, e);
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down daemon...");
        self.service.stop();

        if let Err(e) = self.registry.save().await {
            error!("Failed to save known devices: {}", e);
        }

        info!("Daemon shutdown complete");
        Ok(())
    }
}

async fn log_service_events(service: DiscoveryService) {
    let mut events = service.subscribe();
    loop {
        match events.recv().await {
            Ok(ServiceEvent::AuthenticationFailed {
                device_id,
                device_name,
                host,
                remote_fingerprint,
                local_fingerprint,
            }) => {
                error!(
                    "Device {} ({}) at {} presented an unexpected certificate. \
                     Remote fingerprint: {}. Local fingerprint: {}",
                    device_name, device_id, host, remote_fingerprint, local_fingerprint
                );
            }
            Ok(ServiceEvent::ChannelAttached {
                device_id,
                direction,
                ..
            }) => info!("Connected to {} ({:?})", device_id, direction),
            Ok(ServiceEvent::Stopped) => break,
            Ok(event) => debug!("Service event: {:?}", event),
            Err(RecvError::Lagged(skipped)) => warn!("Dropped {} service events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn log_registry_events(registry: Arc<DeviceRegistry>) {
    let mut events = registry.subscribe();
    loop {
        match events.recv().await {
            Ok(RegistryEvent::DeviceDiscovered {
                device_id,
                device_name,
            }) => info!("Discovered {} ({})", device_name, device_id),
            Ok(RegistryEvent::DeviceRemoved { device_id }) => info!("Removed {}", device_id),
            Err(RecvError::Lagged(skipped)) => warn!("Dropped {} registry events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting LAN link daemon...");

    let mut config = Config::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    args.apply(&mut config);

    info!("Configuration loaded");
    info!("Device name: {}", config.device.name);
    info!("Discovery port: {}", config.network.discovery_port);
    info!("Discoverable: {}", config.network.discoverable);

    let daemon = Daemon::new(config).await
        .context("Failed to create daemon")?;

    let result = daemon.run().await;

    daemon.shutdown().await?;

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "lanlink-daemon",
            "--name",
            "bench",
            "--discoverable",
            "false",
            "--broadcast-to",
            "10.0.0.2",
            "--broadcast-to",
            "10.0.0.3",
        ]);

        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.device.name, "bench");
        assert!(!config.network.discoverable);
        assert_eq!(config.network.broadcast_to.len(), 2);
    }

    #[test]
    fn test_build_plugins_follows_config() {
        let mut config = Config::default();
        config.plugins.enable_share = false;

        let plugins = build_plugins(&config).unwrap();
        let names = plugins.list_plugins();
        assert!(names.contains(&"ping".to_string()));
        assert!(!names.contains(&"share".to_string()));
        assert!(plugins.handler_for("kdeconnect.ping").is_some());
    }

    #[tokio::test]
    async fn test_daemon_binds_ephemeral_ports() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::load(Some(&dir.path().join("daemon.toml"))).unwrap();
        config.paths.data_dir = dir.path().join("data");
        config.paths.cert_dir = dir.path().join("certs");
        config.network.discovery_port = 0;
        config.network.control_port = 0;

        let daemon = Daemon::new(config).await.unwrap();
        assert_ne!(daemon.service.tcp_port(), 0);
        assert_eq!(daemon.service.local_identity().tcp_port, daemon.service.tcp_port());
        assert!(daemon.registry.is_empty().await);
    }
}
