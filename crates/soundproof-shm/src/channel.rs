//! Length-framed byte rings living inside a shared segment.
//!
//! A channel is a fixed-capacity ring of length-prefixed messages plus two
//! wake words ("data ready" and "reply ready"). Messages are never torn: one
//! that would cross the physical end of the ring is split on write and
//! reassembled on read, and a write that does not fit is rejected whole.
//! Cross-process coordination goes through the atomic cursors in the mapped
//! header; turn operations (write/read/clear) take `&mut self` so one side
//! cannot interleave two turns on the same handle.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{Result, ShmError};
use crate::notify;
use crate::region::MappedSegment;

/// Bytes from a channel's base to its payload ring.
pub(crate) const CHANNEL_HEADER_SIZE: usize = 64;

/// Longest symbolic channel name storable in the header.
pub(crate) const MAX_NAME_LEN: usize = 24;

/// Ring bytes a message occupies beyond its payload (the length prefix).
pub const FRAME_OVERHEAD: usize = 4;

/// What a channel is for: fire-and-observe or strict call/reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelKind {
    /// Best-effort message lane; writers never wait for consumption.
    Queue = 0,
    /// Call/reply lane; request and reply strictly alternate on one ring.
    Request = 1,
}

impl ChannelKind {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(ChannelKind::Queue),
            1 => Some(ChannelKind::Request),
            _ => None,
        }
    }
}

#[repr(C)]
pub(crate) struct ChannelHeader {
    capacity: u32,
    payload_offset: u32,
    kind: u32,
    name_len: u32,
    name: [u8; MAX_NAME_LEN],
    read_pos: AtomicU32,
    write_pos: AtomicU32,
    occupied: AtomicU32,
    data_seq: AtomicU32,
    reply_seq: AtomicU32,
    _pad: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<ChannelHeader>() == CHANNEL_HEADER_SIZE);

/// Cursor and occupancy snapshot, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    pub read_pos: u32,
    pub write_pos: u32,
    pub occupied: u32,
    pub capacity: u32,
}

/// Outcome of a copying read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Nothing queued.
    Empty,
    /// The caller's buffer is smaller than the oldest message, which needs
    /// this many bytes; nothing was consumed.
    TooSmall(usize),
    /// This many bytes were copied out and the message consumed.
    Read(usize),
}

/// One named message lane inside a shared segment.
///
/// Handles are cheap clones (an `Arc` on the mapping plus raw offsets); the
/// ring itself lives in shared memory and is visible to every handle in both
/// processes.
pub struct ShmChannel {
    segment: Arc<MappedSegment>,
    header: *const ChannelHeader,
    payload: *mut u8,
    capacity: u32,
    kind: ChannelKind,
    name: String,
}

// SAFETY: the raw pointers target the segment mapping, which the `Arc` keeps
// alive and which never moves. All cross-side state lives in atomics; payload
// bytes are only touched by the side whose turn it is (request/reply
// discipline for `Request` channels, producer/consumer split for `Queue`).
unsafe impl Send for ShmChannel {}
unsafe impl Sync for ShmChannel {}

impl Clone for ShmChannel {
    fn clone(&self) -> Self {
        Self {
            segment: Arc::clone(&self.segment),
            header: self.header,
            payload: self.payload,
            capacity: self.capacity,
            kind: self.kind,
            name: self.name.clone(),
        }
    }
}

impl ShmChannel {
    /// Builds a channel in place at `offset`, zero state, owner side only.
    ///
    /// # Safety
    /// `offset + CHANNEL_HEADER_SIZE + capacity` must lie inside the mapped
    /// segment, the span must not overlap any other channel, and the memory
    /// must not be observed by an attacher until this returns.
    pub(crate) unsafe fn init_at(
        segment: &Arc<MappedSegment>,
        offset: usize,
        kind: ChannelKind,
        capacity: u32,
        name: &str,
    ) -> Self {
        let base = segment.base().add(offset);
        let mut name_buf = [0u8; MAX_NAME_LEN];
        name_buf[..name.len()].copy_from_slice(name.as_bytes());
        let header = base as *mut ChannelHeader;
        header.write(ChannelHeader {
            capacity,
            payload_offset: CHANNEL_HEADER_SIZE as u32,
            kind: kind as u32,
            name_len: name.len() as u32,
            name: name_buf,
            read_pos: AtomicU32::new(0),
            write_pos: AtomicU32::new(0),
            occupied: AtomicU32::new(0),
            data_seq: AtomicU32::new(0),
            reply_seq: AtomicU32::new(0),
            _pad: [0; 4],
        });
        Self {
            segment: Arc::clone(segment),
            header,
            payload: base.add(CHANNEL_HEADER_SIZE),
            capacity,
            kind,
            name: name.to_string(),
        }
    }

    /// Reconstructs a channel handle from header metadata written by the
    /// owner, validating every field before trusting it.
    ///
    /// # Safety
    /// `offset + CHANNEL_HEADER_SIZE` must lie inside the mapped segment.
    pub(crate) unsafe fn attach_at(
        segment: &Arc<MappedSegment>,
        offset: usize,
        index: usize,
    ) -> Result<Self> {
        let base = segment.base().add(offset);
        let header = base as *const ChannelHeader;
        let capacity = (*header).capacity;
        let payload_offset = (*header).payload_offset as usize;
        let kind = ChannelKind::from_raw((*header).kind);
        let name_len = (*header).name_len as usize;

        let in_bounds = offset
            .checked_add(CHANNEL_HEADER_SIZE + capacity as usize)
            .map(|end| end <= segment.len())
            .unwrap_or(false);
        if capacity == 0
            || payload_offset != CHANNEL_HEADER_SIZE
            || kind.is_none()
            || name_len > MAX_NAME_LEN
            || !in_bounds
        {
            return Err(ShmError::BadChannel(index));
        }

        let name = String::from_utf8_lossy(&(&(*header).name)[..name_len]).into_owned();
        Ok(Self {
            segment: Arc::clone(segment),
            header,
            payload: base.add(CHANNEL_HEADER_SIZE),
            capacity,
            kind: kind.unwrap_or(ChannelKind::Queue),
            name,
        })
    }

    fn header(&self) -> &ChannelHeader {
        // SAFETY: the header pointer stays valid while `self.segment` holds
        // the mapping.
        unsafe { &*self.header }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload capacity in bytes; the largest writable message is this minus
    /// the 4-byte length prefix.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn occupied(&self) -> u32 {
        self.header().occupied.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    pub fn status(&self) -> ChannelStatus {
        let header = self.header();
        ChannelStatus {
            read_pos: header.read_pos.load(Ordering::Relaxed),
            write_pos: header.write_pos.load(Ordering::Relaxed),
            occupied: header.occupied.load(Ordering::Acquire),
            capacity: self.capacity,
        }
    }

    /// Copies `bytes` into the ring starting at `at`, wrapping past the end.
    fn copy_in(&self, at: u32, bytes: &[u8]) {
        let cap = self.capacity as usize;
        let at = at as usize;
        let head = bytes.len().min(cap - at);
        // SAFETY: `at < capacity` (cursors are always reduced mod capacity)
        // and both spans stay inside the payload ring, which the segment Arc
        // keeps mapped.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.payload.add(at), head);
            if head < bytes.len() {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(head),
                    self.payload,
                    bytes.len() - head,
                );
            }
        }
    }

    /// Copies out of the ring starting at `at`, wrapping past the end.
    fn copy_out(&self, at: u32, out: &mut [u8]) {
        let cap = self.capacity as usize;
        let at = at as usize;
        let head = out.len().min(cap - at);
        // SAFETY: same bounds argument as `copy_in`.
        unsafe {
            std::ptr::copy_nonoverlapping(self.payload.add(at), out.as_mut_ptr(), head);
            if head < out.len() {
                std::ptr::copy_nonoverlapping(
                    self.payload,
                    out.as_mut_ptr().add(head),
                    out.len() - head,
                );
            }
        }
    }

    /// Appends one length-framed message. Returns `false` without writing
    /// anything if the framed size exceeds the free space.
    pub fn write(&mut self, message: &[u8]) -> bool {
        let frame = FRAME_OVERHEAD + message.len();
        let free = self.capacity as usize - self.occupied() as usize;
        if frame > free {
            return false;
        }
        let wr = self.header().write_pos.load(Ordering::Relaxed);
        self.copy_in(wr, &(message.len() as u32).to_le_bytes());
        self.copy_in((wr + FRAME_OVERHEAD as u32) % self.capacity, message);
        let next = ((wr as usize + frame) % self.capacity as usize) as u32;
        let header = self.header();
        header.write_pos.store(next, Ordering::Relaxed);
        header.occupied.fetch_add(frame as u32, Ordering::Release);
        true
    }

    fn peek_len(&self) -> usize {
        let rd = self.header().read_pos.load(Ordering::Relaxed);
        let mut len_bytes = [0u8; FRAME_OVERHEAD];
        self.copy_out(rd, &mut len_bytes);
        u32::from_le_bytes(len_bytes) as usize
    }

    fn consume(&self, rd: u32, len: usize) {
        let frame = FRAME_OVERHEAD + len;
        let header = self.header();
        let next = ((rd as usize + frame) % self.capacity as usize) as u32;
        header.read_pos.store(next, Ordering::Relaxed);
        header.occupied.fetch_sub(frame as u32, Ordering::Release);
    }

    /// Copies the oldest message into `buf` and consumes it. If `buf` is too
    /// small, reports the required size and consumes nothing.
    pub fn read_into(&mut self, buf: &mut [u8]) -> ReadOutcome {
        if self.is_empty() {
            return ReadOutcome::Empty;
        }
        let len = self.peek_len();
        if buf.len() < len {
            return ReadOutcome::TooSmall(len);
        }
        let rd = self.header().read_pos.load(Ordering::Relaxed);
        self.copy_out((rd + FRAME_OVERHEAD as u32) % self.capacity, &mut buf[..len]);
        self.consume(rd, len);
        ReadOutcome::Read(len)
    }

    /// Resizes `out` to the oldest message and consumes it into `out`.
    /// Returns `false` if the channel is empty.
    pub fn read_vec(&mut self, out: &mut Vec<u8>) -> bool {
        if self.is_empty() {
            return false;
        }
        let len = self.peek_len();
        out.resize(len, 0);
        matches!(self.read_into(out.as_mut_slice()), ReadOutcome::Read(_))
    }

    /// Turn-local fast path: consumes the oldest message and returns its
    /// bytes without copying when they are physically contiguous, falling
    /// back to reassembly through `scratch` when the message wraps.
    ///
    /// The returned slice aliases ring memory and is valid only until this
    /// side's next write/clear on the channel; the `&mut self` receiver keeps
    /// those from happening while the borrow lives.
    pub fn read_message<'a>(&'a mut self, scratch: &'a mut Vec<u8>) -> Option<&'a [u8]> {
        if self.is_empty() {
            return None;
        }
        let len = self.peek_len();
        let rd = self.header().read_pos.load(Ordering::Relaxed);
        let data_at = (rd as usize + FRAME_OVERHEAD) % self.capacity as usize;
        self.consume(rd, len);
        if data_at + len <= self.capacity as usize {
            // SAFETY: the span is inside the payload ring and the borrow is
            // tied to `&'a mut self`, so no turn operation can clobber it.
            Some(unsafe { std::slice::from_raw_parts(self.payload.add(data_at), len) })
        } else {
            scratch.resize(len, 0);
            let head = self.capacity as usize - data_at;
            // SAFETY: both spans checked against capacity; scratch was just
            // resized to `len`.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.payload.add(data_at),
                    scratch.as_mut_ptr(),
                    head,
                );
                std::ptr::copy_nonoverlapping(
                    self.payload,
                    scratch.as_mut_ptr().add(head),
                    len - head,
                );
            }
            Some(&scratch[..len])
        }
    }

    /// Resets cursors and occupancy to empty. Only valid when this side owns
    /// the turn (start of a request or reply half).
    pub fn clear(&mut self) {
        let header = self.header();
        header.read_pos.store(0, Ordering::Relaxed);
        header.write_pos.store(0, Ordering::Relaxed);
        header.occupied.store(0, Ordering::Release);
    }

    /// Current "data ready" sequence; capture before publishing a request.
    pub fn data_ticket(&self) -> u32 {
        notify::ticket(&self.header().data_seq)
    }

    /// Posts "data ready", waking the counterpart's `wait`.
    pub fn signal(&self) {
        notify::post(&self.header().data_seq);
    }

    /// Blocks until "data ready" moves past `ticket`.
    pub fn wait(&self, ticket: u32) {
        notify::wait(&self.header().data_seq, ticket);
    }

    /// Current "reply ready" sequence; capture before publishing a request.
    pub fn reply_ticket(&self) -> u32 {
        notify::ticket(&self.header().reply_seq)
    }

    /// Posts "reply ready", waking the requester's `wait_reply`.
    pub fn signal_reply(&self) {
        notify::post(&self.header().reply_seq);
    }

    /// Blocks until "reply ready" moves past `ticket`. Wakers are either the
    /// counterpart's reply or a supervisor force-post after process death, so
    /// callers must re-check liveness after returning.
    pub fn wait_reply(&self, ticket: u32) {
        notify::wait(&self.header().reply_seq, ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::SharedRegion;
    use std::time::Duration;

    fn request_channel(capacity: u32) -> (tempfile::TempDir, ShmChannel) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chan-test");
        let region = SharedRegion::builder()
            .add_channel(ChannelKind::Request, capacity, "test")
            .unwrap()
            .create(&path)
            .unwrap();
        let chan = region.channel_handle(0).unwrap();
        // Keep the region alive through the segment Arc inside the handle;
        // the TempDir keeps the backing file's directory around.
        drop(region);
        (dir, chan)
    }

    #[test]
    fn test_write_read_round_trip() {
        let (_dir, mut chan) = request_channel(256);
        let msg = b"hello ring";
        assert!(chan.write(msg));
        assert_eq!(chan.occupied(), 4 + msg.len() as u32);
        let mut scratch = Vec::new();
        let got = chan.read_message(&mut scratch).unwrap();
        assert_eq!(got, msg);
        assert!(chan.is_empty());
    }

    #[test]
    fn test_wrapped_message_reassembled() {
        let (_dir, mut chan) = request_channel(256);
        let mut scratch = Vec::new();

        // Advance both cursors to 246 so the next frame has exactly 10 bytes
        // before the physical end of the ring.
        let filler = vec![0xEEu8; 242];
        assert!(chan.write(&filler));
        assert_eq!(chan.status().write_pos, 246);
        let got = chan.read_message(&mut scratch).unwrap();
        assert_eq!(got.len(), 242);
        assert_eq!(chan.status().read_pos, 246);

        // A 40-byte frame (4-byte prefix + 36 payload): 10 bytes land before
        // the end, 30 wrap to the front.
        let msg: Vec<u8> = (0u8..36).collect();
        assert!(chan.write(&msg));
        assert_eq!(chan.status().write_pos, 30);

        let got = chan.read_message(&mut scratch).unwrap();
        assert_eq!(got, msg.as_slice());
        assert_eq!(chan.status().read_pos, 30);
        assert!(chan.is_empty());
    }

    #[test]
    fn test_capacity_rejection_leaves_occupied_unchanged() {
        let (_dir, mut chan) = request_channel(256);
        assert!(!chan.write(&[0u8; 300]));
        assert_eq!(chan.occupied(), 0);

        assert!(chan.write(&[7u8; 100]));
        let occupied = chan.occupied();
        assert_eq!(occupied, 104);

        // 160 + 4 prefix > 152 free.
        assert!(!chan.write(&[9u8; 160]));
        assert_eq!(chan.occupied(), occupied);
    }

    #[test]
    fn test_read_into_reports_required_size() {
        let (_dir, mut chan) = request_channel(256);
        let msg = [3u8; 100];
        assert!(chan.write(&msg));

        let mut small = [0u8; 10];
        assert_eq!(chan.read_into(&mut small), ReadOutcome::TooSmall(100));
        assert_eq!(chan.occupied(), 104);

        let mut big = [0u8; 128];
        assert_eq!(chan.read_into(&mut big), ReadOutcome::Read(100));
        assert_eq!(&big[..100], &msg[..]);
        assert_eq!(chan.read_into(&mut big), ReadOutcome::Empty);
    }

    #[test]
    fn test_fifo_order() {
        let (_dir, mut chan) = request_channel(256);
        for i in 0u8..3 {
            assert!(chan.write(&[i; 8]));
        }
        let mut scratch = Vec::new();
        for i in 0u8..3 {
            let got = chan.read_message(&mut scratch).unwrap().to_vec();
            assert_eq!(got, vec![i; 8]);
        }
        assert!(chan.is_empty());
    }

    #[test]
    fn test_clear_resets_cursors() {
        let (_dir, mut chan) = request_channel(256);
        assert!(chan.write(b"pending"));
        chan.clear();
        let status = chan.status();
        assert_eq!(status.read_pos, 0);
        assert_eq!(status.write_pos, 0);
        assert_eq!(status.occupied, 0);
    }

    #[test]
    fn test_zero_length_message() {
        let (_dir, mut chan) = request_channel(256);
        assert!(chan.write(&[]));
        assert_eq!(chan.occupied(), 4);
        let mut scratch = Vec::new();
        let got = chan.read_message(&mut scratch).unwrap();
        assert!(got.is_empty());
        assert!(chan.is_empty());
    }

    #[test]
    fn test_request_reply_ping_pong() {
        let (_dir, chan) = request_channel(1024);
        let mut client = chan.clone();
        let mut server = chan;

        let client_side = std::thread::spawn(move || {
            let ticket = client.reply_ticket();
            client.clear();
            assert!(client.write(b"ping"));
            client.signal();
            client.wait_reply(ticket);
            let mut scratch = Vec::new();
            let reply = client.read_message(&mut scratch).unwrap();
            assert_eq!(reply, b"pong");
        });

        let ticket = server.data_ticket();
        if server.is_empty() {
            server.wait(ticket);
        }
        let mut scratch = Vec::new();
        let req = server.read_message(&mut scratch).unwrap().to_vec();
        assert_eq!(req, b"ping");
        server.clear();
        assert!(server.write(b"pong"));
        server.signal_reply();

        client_side.join().unwrap();
    }

    #[test]
    fn test_force_post_wakes_earlier_ticket_without_payload() {
        let (_dir, chan) = request_channel(256);
        let waiter = chan.clone();

        // A supervisor force-post carries no message. A requester whose
        // ticket predates the post must still wake from it; discovering the
        // empty ring is the caller's job.
        let ticket = chan.reply_ticket();
        let parked = std::thread::spawn(move || waiter.wait_reply(ticket));
        std::thread::sleep(Duration::from_millis(20));
        chan.signal_reply();
        parked.join().unwrap();
        assert_eq!(chan.reply_ticket(), ticket + 1);
        assert!(chan.is_empty());
    }

    #[test]
    fn test_queue_concurrent_producer_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue-test");
        let region = SharedRegion::builder()
            .add_channel(ChannelKind::Queue, 512, "q")
            .unwrap()
            .create(&path)
            .unwrap();
        let mut producer = region.channel_handle(0).unwrap();
        let mut consumer = region.channel_handle(0).unwrap();

        let feeder = std::thread::spawn(move || {
            for i in 0u32..100 {
                let msg = i.to_le_bytes();
                while !producer.write(&msg) {
                    std::thread::yield_now();
                }
            }
        });

        let mut seen = Vec::new();
        let mut buf = Vec::new();
        while seen.len() < 100 {
            if consumer.read_vec(&mut buf) {
                seen.push(u32::from_le_bytes(buf[..4].try_into().unwrap()));
            } else {
                std::thread::sleep(Duration::from_micros(50));
            }
        }
        feeder.join().unwrap();
        assert_eq!(seen, (0u32..100).collect::<Vec<_>>());
    }
}
