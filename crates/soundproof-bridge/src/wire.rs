//! Wire protocol between the host bridge and server processes.
//!
//! Every message crosses a shared-memory ring as one length-framed bincode
//! blob. Requests travel on Request channels and are answered by exactly one
//! [`Reply`]; UI traffic rides Queue channels and is one-way. Audio samples
//! are not part of these enums: a [`Request::Process`] message is followed on
//! the same turn by one raw frame per input channel, and a
//! [`Reply::Processed`] by one raw frame per output channel.

use crate::descriptor::{PluginDescriptor, PluginId};
use crate::error::{BridgeError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use soundproof_shm::FRAME_OVERHEAD;
use std::fmt;

/// Stack capacity for per-block event batches (zero-alloc for typical blocks).
pub const EVENT_STACK_CAPACITY: usize = 32;

/// Per-block event batch with inline storage.
pub type ProcessEventVec = SmallVec<[ProcessEvent; EVENT_STACK_CAPACITY]>;

/// Short MIDI message pinned to a sample offset within its block.
///
/// Sysex travels as its own event variant; this type carries at most the
/// three bytes of a channel voice or realtime message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiEvent {
    pub frame: u32,
    pub data: [u8; 3],
    pub len: u8,
}

impl MidiEvent {
    pub fn new(frame: u32, bytes: &[u8]) -> Self {
        let mut data = [0u8; 3];
        let len = bytes.len().min(3);
        data[..len].copy_from_slice(&bytes[..len]);
        Self {
            frame,
            data,
            len: len as u8,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// Musical position snapshot handed to plugins ahead of a block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransportPosition {
    pub playing: bool,
    /// Absolute sample position of the block start.
    pub frame: i64,
    /// Position in quarter notes.
    pub quarters: f64,
    pub bar_start_quarters: f64,
    pub time_sig_numerator: i32,
    pub time_sig_denominator: i32,
}

impl Default for TransportPosition {
    fn default() -> Self {
        Self {
            playing: false,
            frame: 0,
            quarters: 0.0,
            bar_start_quarters: 0.0,
            time_sig_numerator: 4,
            time_sig_denominator: 4,
        }
    }
}

/// Coarse classification carried by error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// OS-level failure on the server side.
    System,
    /// Malformed, oversized, or out-of-order message.
    Protocol,
    /// The plugin rejected or failed the operation.
    Plugin,
    /// No plugin with the given id in this server.
    UnknownPlugin,
    /// The plugin does not support the operation.
    Unsupported,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::System => "system",
            ErrorCode::Protocol => "protocol",
            ErrorCode::Plugin => "plugin",
            ErrorCode::UnknownPlugin => "unknown_plugin",
            ErrorCode::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}

/// One parameter index/value pair inside a diff reply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamChange {
    pub index: u32,
    pub value: f32,
}

/// Mutations batched into a `Process` request, applied before the block runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProcessEvent {
    SetParamValue { index: u32, value: f32 },
    SetBypass { bypass: bool },
    SetTempo { bpm: f64 },
    SetTransport { transport: TransportPosition },
    SetProgram { program: i32 },
    Midi { event: MidiEvent },
    Sysex { data: Vec<u8> },
}

/// Plugin-originated events: returned in `Processed` replies, and forwarded
/// over the UI queue for plugins whose editors live host-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// Echo of a host-set value after the plugin quantized it.
    ParamValue { index: u32, value: f32 },
    /// The plugin moved one of its own parameters.
    ParamAutomated { index: u32, value: f32 },
    LatencyChanged { samples: u32 },
    ProgramChanged { program: i32 },
    Midi { event: MidiEvent },
    Sysex { data: Vec<u8> },
}

/// Host → server commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Instantiate a plugin; answered by `Created` with the parameter burst.
    CreatePlugin { descriptor: Box<PluginDescriptor> },
    DestroyPlugin {
        plugin: PluginId,
    },
    /// Stop serving and exit once the reply is posted.
    Quit,
    SetupProcessing {
        plugin: PluginId,
        sample_rate: f64,
        max_block_frames: u32,
    },
    Suspend {
        plugin: PluginId,
    },
    Resume {
        plugin: PluginId,
    },
    SetNumSpeakers {
        plugin: PluginId,
        inputs: u32,
        outputs: u32,
    },
    /// Set a parameter from its text rendering, for hosts that expose entry fields.
    SetParamString {
        plugin: PluginId,
        index: u32,
        value: String,
    },
    GetProgramName {
        plugin: PluginId,
        program: i32,
    },
    SetProgramName {
        plugin: PluginId,
        name: String,
    },
    /// Load a single-program preset into the plugin; answered by a parameter diff.
    ReadProgramData {
        plugin: PluginId,
        data: Vec<u8>,
    },
    /// Serialize the current program out of the plugin.
    WriteProgramData {
        plugin: PluginId,
    },
    /// Load a whole bank into the plugin; answered by a parameter diff.
    ReadBankData {
        plugin: PluginId,
        data: Vec<u8>,
    },
    WriteBankData {
        plugin: PluginId,
    },
    /// Run one audio block. Input sample frames follow this message on the
    /// same channel turn, one frame per input channel.
    Process {
        plugin: PluginId,
        frames: u32,
        inputs: u32,
        outputs: u32,
        events: ProcessEventVec,
    },
}

impl Request {
    /// The plugin a request addresses, if it addresses one.
    pub fn plugin(&self) -> Option<PluginId> {
        match self {
            Request::CreatePlugin { .. } | Request::Quit => None,
            Request::DestroyPlugin { plugin }
            | Request::SetupProcessing { plugin, .. }
            | Request::Suspend { plugin }
            | Request::Resume { plugin }
            | Request::SetNumSpeakers { plugin, .. }
            | Request::SetParamString { plugin, .. }
            | Request::GetProgramName { plugin, .. }
            | Request::SetProgramName { plugin, .. }
            | Request::ReadProgramData { plugin, .. }
            | Request::WriteProgramData { plugin }
            | Request::ReadBankData { plugin, .. }
            | Request::WriteBankData { plugin }
            | Request::Process { plugin, .. } => Some(*plugin),
        }
    }
}

/// Server → host answers. Exactly one per request, even on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    Ok,
    /// Result of `CreatePlugin`: the id plus a full state burst so the host
    /// cache starts populated without further round trips.
    Created {
        plugin: PluginId,
        params: Vec<f32>,
        program_names: Vec<String>,
        latency: u32,
        program: i32,
    },
    /// Parameters that changed as a side effect of a preset or bank load.
    ParamChanges { changes: Vec<ParamChange> },
    ProgramName { name: String },
    ProgramData { data: Vec<u8> },
    BankData { data: Vec<u8> },
    /// Result of `Process`. Output sample frames follow this message on the
    /// same channel turn, one frame per output channel.
    Processed {
        frames: u32,
        outputs: u32,
        events: Vec<EngineEvent>,
        process_ns: u64,
    },
    Error { code: ErrorCode, message: String },
}

/// Messages on the UI queue pair.
///
/// Client → server carries edits made from editor windows; server → client
/// carries `Event` notifications for registered listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UiMessage {
    SetParamValue {
        plugin: PluginId,
        index: u32,
        value: f32,
    },
    SetProgram {
        plugin: PluginId,
        program: i32,
    },
    Event {
        plugin: PluginId,
        event: EngineEvent,
    },
}

/// Encode a message for one channel turn.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Encode and verify the framed message fits a channel of the given capacity.
pub fn encode_bounded<T: Serialize>(value: &T, capacity: u32) -> Result<Vec<u8>> {
    let bytes = bincode::serialize(value)?;
    if bytes.len() + FRAME_OVERHEAD > capacity as usize {
        return Err(BridgeError::Oversized {
            size: bytes.len(),
            capacity,
        });
    }
    Ok(bytes)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// View samples as the raw byte frame that crosses the ring.
///
/// Both ends run on the same machine, so native f32 layout is the wire layout.
pub fn samples_as_bytes(samples: &[f32]) -> &[u8] {
    // SAFETY: f32 has no invalid bit patterns and the view covers exactly the
    // slice's memory.
    unsafe { std::slice::from_raw_parts(samples.as_ptr() as *const u8, samples.len() * 4) }
}

/// View sample storage as writable raw bytes, for reading a frame in place.
pub fn samples_as_bytes_mut(samples: &mut [f32]) -> &mut [u8] {
    // SAFETY: every byte pattern is a valid f32 and the view covers exactly
    // the slice's memory.
    unsafe { std::slice::from_raw_parts_mut(samples.as_mut_ptr() as *mut u8, samples.len() * 4) }
}

/// Copy a raw byte frame back into sample storage.
///
/// Returns false on length mismatch, leaving `out` untouched.
pub fn bytes_to_samples(bytes: &[u8], out: &mut [f32]) -> bool {
    if bytes.len() != out.len() * 4 {
        return false;
    }
    // SAFETY: destination is f32 storage of exactly bytes.len() bytes; a byte
    // copy tolerates any source alignment.
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), out.as_mut_ptr() as *mut u8, bytes.len());
    }
    true
}
