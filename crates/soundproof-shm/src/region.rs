//! Shared-memory regions: builder, header layout, owner/attacher mapping.

use memmap2::MmapMut;
use std::cell::UnsafeCell;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::channel::{ChannelKind, ShmChannel, CHANNEL_HEADER_SIZE, MAX_NAME_LEN};
use crate::error::{Result, ShmError};

/// Layout version stamped into every region header; checked on `connect`
/// before any channel body is trusted.
pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 1;
pub const VERSION_PATCH: u32 = 0;

/// Most channels one region can carry.
pub const MAX_CHANNELS: usize = 16;

const MAGIC: [u8; 8] = *b"SNDPRF01";

/// Bytes reserved for the region header; the first channel starts here.
const REGION_HEADER_SPAN: usize = 192;

/// Channel starts are aligned to this.
const CHANNEL_ALIGN: usize = 64;

#[repr(C)]
struct RegionHeader {
    magic: [u8; 8],
    total_size: u64,
    version_major: u32,
    version_minor: u32,
    version_patch: u32,
    channel_count: u32,
    channel_offsets: [u64; MAX_CHANNELS],
}

const _: () = assert!(std::mem::size_of::<RegionHeader>() <= REGION_HEADER_SPAN);

/// The layout version this build writes and accepts.
pub fn version() -> (u32, u32, u32) {
    (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
}

fn version_compatible(found: (u32, u32, u32)) -> bool {
    found.0 == VERSION_MAJOR && (VERSION_MAJOR > 0 || found.1 == VERSION_MINOR)
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// The mapped file behind a region. Channels hold an `Arc` to this, so the
/// mapping outlives the region handle itself if channel handles are still in
/// flight.
pub(crate) struct MappedSegment {
    map: UnsafeCell<MmapMut>,
    path: PathBuf,
    owner: bool,
}

// SAFETY: concurrent access to the mapping is coordinated entirely by the
// channel protocol (atomic cursors, one writer per channel per turn); the
// `UnsafeCell` only exists so `&self` can yield the base pointer.
unsafe impl Send for MappedSegment {}
unsafe impl Sync for MappedSegment {}

impl MappedSegment {
    pub(crate) fn base(&self) -> *mut u8 {
        // SAFETY: no `&mut MmapMut` is ever formed outside construction; we
        // only take the raw base pointer of the mapping.
        unsafe { (*self.map.get()).as_mut_ptr() }
    }

    pub(crate) fn len(&self) -> usize {
        // SAFETY: as in `base`.
        unsafe { (&(*self.map.get())).len() }
    }
}

impl Drop for MappedSegment {
    fn drop(&mut self) {
        if self.owner {
            // The mapping itself goes away with the MmapMut; the owner also
            // removes the backing name so nothing can attach afterwards.
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::debug!(path = %self.path.display(), error = %e, "shared region unlink failed");
            } else {
                tracing::debug!(path = %self.path.display(), "shared region unlinked");
            }
        }
    }
}

#[derive(Debug, Clone)]
struct ChannelSpec {
    kind: ChannelKind,
    capacity: u32,
    name: String,
}

/// Declares the channel list for a new region. Consumed by [`RegionBuilder::create`],
/// which freezes the layout; there is no way to add channels afterwards.
#[derive(Default)]
pub struct RegionBuilder {
    channels: Vec<ChannelSpec>,
}

impl RegionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares one channel of `kind` with a payload of `capacity` bytes.
    pub fn add_channel(mut self, kind: ChannelKind, capacity: u32, name: &str) -> Result<Self> {
        if self.channels.len() == MAX_CHANNELS {
            return Err(ShmError::ChannelLimit(MAX_CHANNELS));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(ShmError::NameTooLong(name.to_string()));
        }
        if capacity == 0 {
            return Err(ShmError::ZeroCapacity);
        }
        self.channels.push(ChannelSpec {
            kind,
            capacity,
            name: name.to_string(),
        });
        Ok(self)
    }

    /// Allocates and maps a new shared-memory object at `path`, zero-fills it
    /// so pages are committed, writes the header, and constructs every
    /// declared channel in place. The returned region is the owner: dropping
    /// it unlinks the backing object.
    pub fn create(self, path: &Path) -> Result<SharedRegion> {
        let mut offsets = [0u64; MAX_CHANNELS];
        let mut cursor = REGION_HEADER_SPAN;
        for (i, spec) in self.channels.iter().enumerate() {
            offsets[i] = cursor as u64;
            cursor += CHANNEL_HEADER_SIZE + align_up(spec.capacity as usize, CHANNEL_ALIGN);
        }
        let total_size = cursor;

        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let file = opts.open(path)?;
        file.set_len(total_size as u64)?;

        // SAFETY: the file stays open for the duration of the mapping; the
        // mapping is private to this pairing by path permissions.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        map[..].fill(0);

        let segment = Arc::new(MappedSegment {
            map: UnsafeCell::new(map),
            path: path.to_path_buf(),
            owner: true,
        });

        // SAFETY: the header span is inside the zeroed mapping and no other
        // process can have attached yet.
        unsafe {
            let header = segment.base() as *mut RegionHeader;
            header.write(RegionHeader {
                magic: MAGIC,
                total_size: total_size as u64,
                version_major: VERSION_MAJOR,
                version_minor: VERSION_MINOR,
                version_patch: VERSION_PATCH,
                channel_count: self.channels.len() as u32,
                channel_offsets: offsets,
            });
        }

        let mut channels = Vec::with_capacity(self.channels.len());
        for (i, spec) in self.channels.iter().enumerate() {
            // SAFETY: offsets were computed against `total_size` above and do
            // not overlap.
            let chan = unsafe {
                ShmChannel::init_at(
                    &segment,
                    offsets[i] as usize,
                    spec.kind,
                    spec.capacity,
                    &spec.name,
                )
            };
            channels.push(chan);
        }

        tracing::debug!(
            path = %path.display(),
            channels = channels.len(),
            bytes = total_size,
            "created shared region"
        );
        Ok(SharedRegion { segment, channels })
    }
}

/// One mapped shared-memory block: a validated header plus its channels.
///
/// The creating side owns the backing object and unlinks it on drop; an
/// attaching side reconstructs the channel list purely from the header and
/// never unlinks.
pub struct SharedRegion {
    segment: Arc<MappedSegment>,
    channels: Vec<ShmChannel>,
}

impl SharedRegion {
    pub fn builder() -> RegionBuilder {
        RegionBuilder::new()
    }

    /// Maps an existing region by path and rebuilds every channel handle from
    /// header metadata alone, validating magic, version and bounds first.
    pub fn connect(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        if (file_len as usize) < REGION_HEADER_SPAN {
            return Err(ShmError::TooSmall {
                size: file_len,
                need: REGION_HEADER_SPAN as u64,
            });
        }

        // SAFETY: as in `create`; the size was checked above.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let segment = Arc::new(MappedSegment {
            map: UnsafeCell::new(map),
            path: path.to_path_buf(),
            owner: false,
        });

        let (found, total_size, count, offsets) = {
            // SAFETY: REGION_HEADER_SPAN bytes are mapped, checked above.
            let header = unsafe { &*(segment.base() as *const RegionHeader) };
            if header.magic != MAGIC {
                return Err(ShmError::BadMagic);
            }
            (
                (
                    header.version_major,
                    header.version_minor,
                    header.version_patch,
                ),
                header.total_size,
                header.channel_count as usize,
                header.channel_offsets,
            )
        };

        if !version_compatible(found) {
            return Err(ShmError::Version {
                found_major: found.0,
                found_minor: found.1,
                found_patch: found.2,
                supported_major: VERSION_MAJOR,
                supported_minor: VERSION_MINOR,
            });
        }
        if file_len < total_size {
            return Err(ShmError::TooSmall {
                size: file_len,
                need: total_size,
            });
        }
        if count > MAX_CHANNELS {
            return Err(ShmError::ChannelLimit(count));
        }

        let mut channels = Vec::with_capacity(count);
        for (i, &offset) in offsets.iter().take(count).enumerate() {
            let offset = offset as usize;
            if offset < REGION_HEADER_SPAN || offset + CHANNEL_HEADER_SIZE > segment.len() {
                return Err(ShmError::BadChannel(i));
            }
            // SAFETY: the header span of the channel was just bounds-checked;
            // `attach_at` validates the rest before trusting it.
            let chan = unsafe { ShmChannel::attach_at(&segment, offset, i)? };
            channels.push(chan);
        }

        tracing::debug!(
            path = %path.display(),
            channels = channels.len(),
            version = ?found,
            "connected to shared region"
        );
        Ok(Self { segment, channels })
    }

    pub fn channel(&self, index: usize) -> Option<&ShmChannel> {
        self.channels.get(index)
    }

    /// A cloned handle on channel `index`, sharing the same ring. Handles
    /// keep the mapping alive independently of the region.
    pub fn channel_handle(&self, index: usize) -> Option<ShmChannel> {
        self.channels.get(index).cloned()
    }

    pub fn channels(&self) -> &[ShmChannel] {
        &self.channels
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// The version triple stamped by the creating side.
    pub fn region_version(&self) -> (u32, u32, u32) {
        // SAFETY: validated at create/connect time.
        let header = unsafe { &*(self.segment.base() as *const RegionHeader) };
        (
            header.version_major,
            header.version_minor,
            header.version_patch,
        )
    }

    pub fn total_size(&self) -> usize {
        self.segment.len()
    }

    pub fn is_owner(&self) -> bool {
        self.segment.owner
    }

    pub fn path(&self) -> &Path {
        &self.segment.path
    }
}
