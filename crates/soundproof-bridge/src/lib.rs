//! Host-side plugin bridging for Soundproof.
//!
//! The host never loads plugin code into its own address space. Each plugin
//! runs in a server process reached through a [`soundproof_shm`] region, and
//! this crate owns the host end of that arrangement: spawning servers, the
//! wire protocol, crash detection, and the RT-safe [`PluginProxy`] the audio
//! engine talks to.
//!
//! ## Usage
//!
//! ```ignore
//! use soundproof_bridge::{BridgeHost, PluginDescriptor};
//!
//! let host = BridgeHost::with_defaults()?;
//! let mut plugin = host.load(PluginDescriptor::new("native:gain", "Gain"))?;
//! plugin.setup_processing(48_000.0, 512)?;
//! plugin.set_parameter(0, 0.5);
//!
//! let silence = [0.0f32; 512];
//! let mut out_l = [0.0f32; 512];
//! let mut out_r = [0.0f32; 512];
//! plugin.process(
//!     &[&silence, &silence],
//!     &mut [&mut out_l, &mut out_r],
//!     512,
//! )?;
//! ```

pub mod bridge;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod watchdog;
pub mod wire;

pub use bridge::{
    Bridge, ChannelGuard, UiListener, NRT_INDEX, RT_BASE_INDEX, UI_TO_HOST_INDEX,
    UI_TO_SERVER_INDEX,
};
pub use config::{BridgeConfig, SERVER_PROGRAM_NAME};
pub use descriptor::{PluginDescriptor, PluginId, TargetArch};
pub use error::{BridgeError, Result};
pub use proxy::PluginProxy;
pub use registry::BridgeHost;
pub use watchdog::WatchDog;
