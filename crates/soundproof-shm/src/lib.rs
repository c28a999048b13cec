//! Shared-memory plumbing for the soundproof plugin bridge.
//!
//! A [`SharedRegion`] maps one shared-memory object laid out as a validated
//! header plus up to [`MAX_CHANNELS`] fixed-capacity [`ShmChannel`] message
//! rings. The creating side (the bridge) owns the backing object and unlinks
//! it on drop; the remote server attaches by path and reconstructs every
//! channel from the header alone. Wake-ups between the two processes ride
//! atomic sequence words stored inside each channel header, so no primitive
//! is ever valid in only one address space.
//!
//! ## Usage
//!
//! ```ignore
//! use soundproof_shm::{ChannelKind, SharedRegion};
//!
//! // Owner side
//! let region = SharedRegion::builder()
//!     .add_channel(ChannelKind::Request, 64 * 1024, "nrt")?
//!     .create(&path)?;
//!
//! // Attacher side (other process)
//! let region = SharedRegion::connect(&path)?;
//! let mut chan = region.channel_handle(0).unwrap();
//! ```

pub mod error;
pub use error::{Result, ShmError};

mod notify;

mod channel;
pub use channel::{ChannelKind, ChannelStatus, ReadOutcome, ShmChannel, FRAME_OVERHEAD};

mod region;
pub use region::{
    version, RegionBuilder, SharedRegion, MAX_CHANNELS, VERSION_MAJOR, VERSION_MINOR,
    VERSION_PATCH,
};
