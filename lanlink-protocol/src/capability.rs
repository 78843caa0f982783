//! Capability Manifests and Action Gating
//!
//! Every feature module describes itself with a [`PluginManifest`]: the packet
//! types it accepts (`incoming`), the packet types it sends (`outgoing`) and the
//! actions it exposes together with the packet types each action depends on.
//!
//! The [`PluginRegistry`] is a static table populated by explicit
//! [`PluginRegistry::register`] calls. It provides the capability union that
//! goes into the identity packet and evaluates which actions are usable
//! against a given peer.
//!
//! ## Gating rule
//!
//! An action is enabled iff
//! - every type in its `incoming` list is in the peer's **outgoing** set, and
//! - every type in its `outgoing` list is in the peer's **incoming** set.
//!
//! ```
//! use lanlink_protocol::capability::{ActionRequirements, PeerCapabilities, PluginManifest, PluginRegistry};
//!
//! let mut registry = PluginRegistry::new();
//! registry
//!     .register(
//!         PluginManifest::new("ping")
//!             .with_incoming("kdeconnect.ping")
//!             .with_outgoing("kdeconnect.ping")
//!             .with_action("ping", ActionRequirements::new().outgoing("kdeconnect.ping")),
//!     )
//!     .unwrap();
//!
//! let peer = PeerCapabilities::new(["kdeconnect.ping"], Vec::<String>::new());
//! let states = registry.evaluate_actions(&peer);
//! assert!(states.is_enabled("ping", "ping"));
//! ```

use crate::{ProtocolError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

/// Packet types an action needs the peer to support
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionRequirements {
    /// Types this action receives; the peer must list them as outgoing
    pub incoming: Vec<String>,
    /// Types this action sends; the peer must list them as incoming
    pub outgoing: Vec<String>,
}

impl ActionRequirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incoming(mut self, packet_type: impl Into<String>) -> Self {
        self.incoming.push(packet_type.into());
        self
    }

    pub fn outgoing(mut self, packet_type: impl Into<String>) -> Self {
        self.outgoing.push(packet_type.into());
        self
    }

    /// Evaluate this action against a peer
    pub fn is_satisfied_by(&self, peer: &PeerCapabilities) -> bool {
        self.incoming.iter().all(|t| peer.outgoing.contains(t))
            && self.outgoing.iter().all(|t| peer.incoming.contains(t))
    }
}

/// Capability manifest of one feature module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginManifest {
    pub name: String,
    pub incoming_capabilities: Vec<String>,
    pub outgoing_capabilities: Vec<String>,
    pub actions: BTreeMap<String, ActionRequirements>,
}

impl PluginManifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
            actions: BTreeMap::new(),
        }
    }

    pub fn with_incoming(mut self, packet_type: impl Into<String>) -> Self {
        self.incoming_capabilities.push(packet_type.into());
        self
    }

    pub fn with_outgoing(mut self, packet_type: impl Into<String>) -> Self {
        self.outgoing_capabilities.push(packet_type.into());
        self
    }

    pub fn with_action(mut self, name: impl Into<String>, requirements: ActionRequirements) -> Self {
        self.actions.insert(name.into(), requirements);
        self
    }
}

/// Capability sets a peer advertised in its identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerCapabilities {
    pub incoming: BTreeSet<String>,
    pub outgoing: BTreeSet<String>,
}

impl PeerCapabilities {
    pub fn new<I, O>(incoming: I, outgoing: O) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            incoming: incoming.into_iter().map(Into::into).collect(),
            outgoing: outgoing.into_iter().map(Into::into).collect(),
        }
    }
}

/// Enablement of every registered action, keyed by `(plugin, action)`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionStates {
    states: BTreeMap<(String, String), bool>,
}

impl ActionStates {
    pub fn is_enabled(&self, plugin: &str, action: &str) -> bool {
        self.states
            .get(&(plugin.to_string(), action.to_string()))
            .copied()
            .unwrap_or(false)
    }

    /// Names of enabled actions as `plugin.action`
    pub fn enabled(&self) -> Vec<String> {
        self.states
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|((plugin, action), _)| format!("{}.{}", plugin, action))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Static registry of capability manifests
#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    manifests: BTreeMap<String, PluginManifest>,

    /// Mapping from incoming capability to plugin name
    capability_map: HashMap<String, String>,
}

impl PluginRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in manifest
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for manifest in builtin_manifests() {
            // built-in names and capabilities are unique
            let _ = registry.register(manifest);
        }
        registry
    }

    /// Register a manifest
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - A manifest with the same name is already registered
    /// - An incoming capability is already handled by another manifest
    pub fn register(&mut self, manifest: PluginManifest) -> Result<()> {
        let name = manifest.name.clone();

        if self.manifests.contains_key(&name) {
            return Err(ProtocolError::Configuration(format!(
                "Plugin '{}' is already registered",
                name
            )));
        }

        for capability in &manifest.incoming_capabilities {
            if let Some(existing) = self.capability_map.get(capability) {
                return Err(ProtocolError::Configuration(format!(
                    "Capability '{}' already handled by plugin '{}'",
                    capability, existing
                )));
            }
        }

        for capability in &manifest.incoming_capabilities {
            self.capability_map.insert(capability.clone(), name.clone());
        }

        info!("Registered plugin manifest: {}", name);
        self.manifests.insert(name, manifest);
        Ok(())
    }

    /// Get list of all registered plugin names
    pub fn list_plugins(&self) -> Vec<String> {
        self.manifests.keys().cloned().collect()
    }

    pub fn manifest(&self, name: &str) -> Option<&PluginManifest> {
        self.manifests.get(name)
    }

    /// Plugin that handles an incoming packet type
    pub fn handler_for(&self, packet_type: &str) -> Option<&str> {
        self.capability_map.get(packet_type).map(String::as_str)
    }

    /// Union of incoming capabilities, sorted
    pub fn incoming_capabilities(&self) -> Vec<String> {
        self.union(|m| &m.incoming_capabilities)
    }

    /// Union of outgoing capabilities, sorted
    pub fn outgoing_capabilities(&self) -> Vec<String> {
        self.union(|m| &m.outgoing_capabilities)
    }

    fn union<F>(&self, select: F) -> Vec<String>
    where
        F: Fn(&PluginManifest) -> &Vec<String>,
    {
        let set: BTreeSet<&String> = self.manifests.values().flat_map(select).collect();
        set.into_iter().cloned().collect()
    }

    /// Evaluate every action against the peer's capability sets
    pub fn evaluate_actions(&self, peer: &PeerCapabilities) -> ActionStates {
        let mut states = BTreeMap::new();
        for manifest in self.manifests.values() {
            for (action, requirements) in &manifest.actions {
                let enabled = requirements.is_satisfied_by(peer);
                debug!("Action {}.{} enabled={}", manifest.name, action, enabled);
                states.insert((manifest.name.clone(), action.clone()), enabled);
            }
        }
        ActionStates { states }
    }

    /// Every action disabled (no peer connected)
    pub fn disabled_actions(&self) -> ActionStates {
        let states = self
            .manifests
            .values()
            .flat_map(|m| {
                m.actions
                    .keys()
                    .map(move |action| ((m.name.clone(), action.clone()), false))
            })
            .collect();
        ActionStates { states }
    }
}

struct BuiltinAction {
    name: &'static str,
    incoming: &'static [&'static str],
    outgoing: &'static [&'static str],
}

struct BuiltinPlugin {
    name: &'static str,
    incoming: &'static [&'static str],
    outgoing: &'static [&'static str],
    actions: &'static [BuiltinAction],
}

static BUILTIN_PLUGINS: &[BuiltinPlugin] = &[
    BuiltinPlugin {
        name: "ping",
        incoming: &["kdeconnect.ping"],
        outgoing: &["kdeconnect.ping"],
        actions: &[BuiltinAction {
            name: "ping",
            incoming: &[],
            outgoing: &["kdeconnect.ping"],
        }],
    },
    BuiltinPlugin {
        name: "battery",
        incoming: &["kdeconnect.battery", "kdeconnect.battery.request"],
        outgoing: &["kdeconnect.battery", "kdeconnect.battery.request"],
        actions: &[BuiltinAction {
            name: "requestBattery",
            incoming: &["kdeconnect.battery"],
            outgoing: &["kdeconnect.battery.request"],
        }],
    },
    BuiltinPlugin {
        name: "clipboard",
        incoming: &["kdeconnect.clipboard", "kdeconnect.clipboard.connect"],
        outgoing: &["kdeconnect.clipboard", "kdeconnect.clipboard.connect"],
        actions: &[
            BuiltinAction {
                name: "clipboardPush",
                incoming: &[],
                outgoing: &["kdeconnect.clipboard"],
            },
            BuiltinAction {
                name: "clipboardPull",
                incoming: &["kdeconnect.clipboard"],
                outgoing: &[],
            },
        ],
    },
    BuiltinPlugin {
        name: "share",
        incoming: &["kdeconnect.share.request"],
        outgoing: &["kdeconnect.share.request"],
        actions: &[
            BuiltinAction {
                name: "shareFile",
                incoming: &[],
                outgoing: &["kdeconnect.share.request"],
            },
            BuiltinAction {
                name: "shareText",
                incoming: &[],
                outgoing: &["kdeconnect.share.request"],
            },
        ],
    },
    BuiltinPlugin {
        name: "findmyphone",
        incoming: &["kdeconnect.findmyphone.request"],
        outgoing: &["kdeconnect.findmyphone.request"],
        actions: &[BuiltinAction {
            name: "ring",
            incoming: &[],
            outgoing: &["kdeconnect.findmyphone.request"],
        }],
    },
    BuiltinPlugin {
        name: "notification",
        incoming: &["kdeconnect.notification", "kdeconnect.notification.request"],
        outgoing: &[
            "kdeconnect.notification",
            "kdeconnect.notification.action",
            "kdeconnect.notification.reply",
            "kdeconnect.notification.request",
        ],
        actions: &[
            BuiltinAction {
                name: "sendNotification",
                incoming: &[],
                outgoing: &["kdeconnect.notification"],
            },
            BuiltinAction {
                name: "replyNotification",
                incoming: &["kdeconnect.notification"],
                outgoing: &["kdeconnect.notification.reply"],
            },
        ],
    },
    BuiltinPlugin {
        name: "runcommand",
        incoming: &["kdeconnect.runcommand", "kdeconnect.runcommand.request"],
        outgoing: &["kdeconnect.runcommand", "kdeconnect.runcommand.request"],
        actions: &[BuiltinAction {
            name: "executeCommand",
            incoming: &["kdeconnect.runcommand"],
            outgoing: &["kdeconnect.runcommand.request"],
        }],
    },
    BuiltinPlugin {
        name: "mpris",
        incoming: &["kdeconnect.mpris", "kdeconnect.mpris.request"],
        outgoing: &["kdeconnect.mpris", "kdeconnect.mpris.request"],
        actions: &[BuiltinAction {
            name: "mediaControl",
            incoming: &["kdeconnect.mpris"],
            outgoing: &["kdeconnect.mpris.request"],
        }],
    },
];

/// Names of the built-in manifests
pub fn builtin_names() -> Vec<&'static str> {
    BUILTIN_PLUGINS.iter().map(|p| p.name).collect()
}

/// Built-in manifests, in table order
pub fn builtin_manifests() -> Vec<PluginManifest> {
    BUILTIN_PLUGINS
        .iter()
        .map(|plugin| {
            let mut manifest = PluginManifest::new(plugin.name);
            manifest.incoming_capabilities = plugin.incoming.iter().map(|s| s.to_string()).collect();
            manifest.outgoing_capabilities = plugin.outgoing.iter().map(|s| s.to_string()).collect();
            for action in plugin.actions {
                manifest.actions.insert(
                    action.name.to_string(),
                    ActionRequirements {
                        incoming: action.incoming.iter().map(|s| s.to_string()).collect(),
                        outgoing: action.outgoing.iter().map(|s| s.to_string()).collect(),
                    },
                );
            }
            manifest
        })
        .collect()
}

/// Built-in manifest by name
pub fn builtin_manifest(name: &str) -> Option<PluginManifest> {
    builtin_manifests().into_iter().find(|m| m.name == name)
}
