//! Device Discovery
//!
//! UDP broadcast discovery plus the TCP control listener.
//!
//! ## Discovery Protocol
//!
//! 1. **Broadcast**: send the identity packet via UDP on port 1716
//! 2. **Listen**: receive identity packets from other devices
//! 3. **Connect**: dial devices that announced themselves and accept the
//!    channels other devices open to us
//!
//! ## Usage
//!
//! ```no_run
//! use lanlink_protocol::discovery::{DiscoveryService, ServiceConfig};
//! use lanlink_protocol::{DeviceInfo, DeviceRegistry, DeviceType, PluginRegistry, TlsContext, TrustStore};
//! # use lanlink_protocol::{device::PacketRouter, Packet, Result};
//! # use std::sync::Arc;
//! # struct Router;
//! # #[async_trait::async_trait]
//! # impl PacketRouter for Router {
//! #     async fn route(&self, _: &str, _: Packet) -> Result<()> { Ok(()) }
//! # }
//!
//! # async fn run() -> Result<()> {
//! let local = DeviceInfo::new("My Computer", DeviceType::Desktop, 1716);
//! let trust = Arc::new(TrustStore::open("/tmp/lanlink", &local.device_id)?);
//! let tls = Arc::new(TlsContext::new(Arc::clone(&trust))?);
//! let registry = Arc::new(DeviceRegistry::new(Arc::new(PluginRegistry::with_builtins()), trust));
//!
//! let service = DiscoveryService::bind(ServiceConfig::default(), local, registry, tls, Arc::new(Router)).await?;
//! let mut events = service.subscribe();
//! service.start().await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("Discovery event: {:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod service;

pub use events::ServiceEvent;
pub use service::{DiscoveryService, ServiceConfig, BROADCAST_ADDR, DEFAULT_BROADCAST_INTERVAL};
