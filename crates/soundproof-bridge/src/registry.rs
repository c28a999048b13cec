//! The host's entry point: per-architecture server table plus the watchdog.

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::descriptor::{PluginDescriptor, TargetArch};
use crate::error::Result;
use crate::proxy::PluginProxy;
use crate::watchdog::WatchDog;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Owns every bridge this host spawns: one shared server per architecture
/// plus any sandboxed ones, with a single watchdog over all of them.
///
/// Shared servers are handed out as `Arc`s and retained weakly, so when the
/// last plugin on an architecture drops its bridge that server shuts down;
/// the next request spawns a fresh one.
pub struct BridgeHost {
    config: BridgeConfig,
    shared: Mutex<HashMap<TargetArch, Weak<Bridge>>>,
    bridges: Mutex<Vec<Weak<Bridge>>>,
    watchdog: WatchDog,
}

impl BridgeHost {
    pub fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let watchdog = WatchDog::new(config.watchdog_interval())?;
        Ok(Self {
            config,
            shared: Mutex::new(HashMap::new()),
            bridges: Mutex::new(Vec::new()),
            watchdog,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(BridgeConfig::default())
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn watchdog(&self) -> &WatchDog {
        &self.watchdog
    }

    /// The shared server for an architecture, spawned on first use or after
    /// the previous one died or was dropped.
    pub fn shared(&self, arch: TargetArch) -> Result<Arc<Bridge>> {
        let mut table = self.shared.lock();
        if let Some(bridge) = table.get(&arch).and_then(Weak::upgrade) {
            if bridge.alive() {
                return Ok(bridge);
            }
        }
        let bridge = Bridge::spawn_shared(arch, &self.config)?;
        self.watchdog.register(&bridge);
        self.track(&bridge);
        table.insert(arch, Arc::downgrade(&bridge));
        Ok(bridge)
    }

    /// A private server for one plugin that must not share an address space.
    pub fn sandboxed(&self, arch: TargetArch) -> Result<Arc<Bridge>> {
        let bridge = Bridge::spawn_sandboxed(arch, &self.config)?;
        self.watchdog.register(&bridge);
        self.track(&bridge);
        Ok(bridge)
    }

    /// The bridge a descriptor should run on.
    pub fn bridge_for(&self, descriptor: &PluginDescriptor) -> Result<Arc<Bridge>> {
        if descriptor.sandboxed {
            self.sandboxed(descriptor.arch)
        } else {
            self.shared(descriptor.arch)
        }
    }

    /// Load a plugin on the right server and hand back its proxy.
    pub fn load(&self, descriptor: PluginDescriptor) -> Result<PluginProxy> {
        let bridge = self.bridge_for(&descriptor)?;
        PluginProxy::create(bridge, descriptor)
    }

    /// Drain every live bridge's UI queue. Call from the UI thread on a timer.
    pub fn poll_ui(&self) {
        let live: Vec<Arc<Bridge>> = {
            let mut bridges = self.bridges.lock();
            bridges.retain(|w| w.strong_count() > 0);
            bridges.iter().filter_map(Weak::upgrade).collect()
        };
        for bridge in &live {
            bridge.poll_ui();
        }
    }

    fn track(&self, bridge: &Arc<Bridge>) {
        self.bridges.lock().push(Arc::downgrade(bridge));
    }
}
