//! # Soundproof - Crash-Isolated Plugin Hosting
//!
//! Runs third-party audio plugin code in separate server processes and bridges
//! audio, parameters, and events over shared memory, so a crashing plugin
//! takes down its server instead of the host.
//!
//! ## Architecture
//!
//! Soundproof is an umbrella crate that coordinates:
//! - **soundproof-shm** - Shared-memory regions and futex-waked ring channels
//! - **soundproof-bridge** - Wire protocol, server registry, watchdog, client proxy
//! - **soundproof-server** - The `soundproof-host` helper binary (spawned per
//!   architecture or per sandboxed plugin, never linked into the host)
//!
//! ## Quick Start
//!
//! ```ignore
//! use soundproof::prelude::*;
//!
//! let host = BridgeHost::with_defaults()?;
//! let mut plugin = host.load(PluginDescriptor::new("/path/to/effect.so", "Effect"))?;
//!
//! plugin.setup_processing(48_000.0, 512)?;
//! plugin.set_parameter(0, 0.7);
//!
//! let inputs: [&[f32]; 2] = [&left_in, &right_in];
//! let mut outputs: [&mut [f32]; 2] = [&mut left_out, &mut right_out];
//! plugin.process(&inputs, &mut outputs, 512)?;
//! ```

/// Re-export of soundproof-shm for direct access
pub use soundproof_shm as shm;

/// Re-export of soundproof-bridge for direct access
pub use soundproof_bridge as bridge;

// Host-facing surface
pub use soundproof_bridge::{
    Bridge, BridgeConfig, BridgeError, BridgeHost, PluginDescriptor, PluginId, PluginProxy,
    TargetArch, UiListener, WatchDog,
};

// Wire types that cross the host API (events, MIDI, transport)
pub use soundproof_bridge::wire::{EngineEvent, MidiEvent, ParamChange, TransportPosition};

// Shared-memory layer
pub use soundproof_shm::{ChannelKind, RegionBuilder, SharedRegion, ShmChannel, ShmError};

mod error;
pub use error::{Error, Result};

/// Convenience prelude for common imports
pub mod prelude {
    pub use crate::{
        BridgeConfig, BridgeHost, MidiEvent, PluginDescriptor, PluginProxy, TransportPosition,
        UiListener,
    };
}
