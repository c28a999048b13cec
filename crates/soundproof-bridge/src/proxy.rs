//! Host-side plugin proxy: local caches in front of a remote instance.

use crate::bridge::{Bridge, UiListener};
use crate::descriptor::{PluginDescriptor, PluginId};
use crate::error::{BridgeError, Result};
use crate::wire::{
    self, EngineEvent, MidiEvent, ParamChange, ProcessEvent, ProcessEventVec, Reply, Request,
    TransportPosition,
};
use arc_swap::ArcSwap;
use atomic_float::AtomicF32;
use ringbuf::traits::{Consumer, Producer, Split};
use soundproof_shm::{ReadOutcome, FRAME_OVERHEAD};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Pending mutations that fit between two blocks before the queue drops.
const PENDING_QUEUE_CAPACITY: usize = 1024;

/// Host-side mutation queued for the next audio block.
///
/// The richer local form; it is flattened to [`ProcessEvent`] only at the
/// shared-memory boundary.
#[derive(Debug, Clone)]
enum BlockEvent {
    Param { index: u32, value: f32 },
    Bypass(bool),
    Tempo(f64),
    Transport(TransportPosition),
    Program(i32),
    Midi(MidiEvent),
    Sysex(Vec<u8>),
}

struct ParamCache {
    values: Vec<AtomicF32>,
}

impl ParamCache {
    fn new(initial: &[f32]) -> Self {
        Self {
            values: initial.iter().map(|v| AtomicF32::new(*v)).collect(),
        }
    }

    fn get(&self, index: u32) -> f32 {
        self.values
            .get(index as usize)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0.0)
    }

    fn set(&self, index: u32, value: f32) {
        if let Some(slot) = self.values.get(index as usize) {
            slot.store(value, Ordering::Relaxed);
        }
    }

    fn apply(&self, changes: &[ParamChange]) {
        for change in changes {
            self.set(change.index, change.value);
        }
    }

    fn len(&self) -> usize {
        self.values.len()
    }
}

/// State shared by all clones of one proxy. Dropping the last clone tears
/// down the remote instance.
struct ProxyShared {
    bridge: Arc<Bridge>,
    id: PluginId,
    descriptor: PluginDescriptor,
    params: ParamCache,
    program_names: ArcSwap<Vec<String>>,
    latency: AtomicU32,
    program: AtomicI32,
    bypass: AtomicBool,
}

impl Drop for ProxyShared {
    fn drop(&mut self) {
        self.bridge.remove_ui_client(self.id);
        if self.bridge.alive() {
            if let Err(e) = self.bridge.call(&Request::DestroyPlugin { plugin: self.id }) {
                tracing::warn!(plugin = %self.id, error = %e, "remote destroy failed");
            }
        }
    }
}

/// Host-side stand-in for one remote plugin.
///
/// Reads are served from local caches and never block. Mutations queue until
/// the next [`process`](PluginProxy::process) call batches them into the
/// block turn; blocking control operations go straight over the NRT channel.
///
/// Cloning is cheap - clones share the remote instance and the pending queue
/// but keep independent block buffers. Keep the control-side clone and the
/// audio-side clone each on its own thread.
#[derive(Clone)]
pub struct PluginProxy {
    shared: Arc<ProxyShared>,
    pending_tx: Arc<UnsafeCell<ringbuf::HeapProd<BlockEvent>>>,
    pending_rx: Arc<UnsafeCell<ringbuf::HeapCons<BlockEvent>>>,
    midi_out: Vec<MidiEvent>,
    sysex_out: Vec<Vec<u8>>,
    scratch: Vec<u8>,
}

// Safety: SPSC queue - the control clone owns the producer and the audio
// clone owns the consumer, never accessed concurrently.
unsafe impl Send for PluginProxy {}
unsafe impl Sync for PluginProxy {}

impl PluginProxy {
    /// Instantiate the plugin remotely and seed a proxy with its state burst.
    pub(crate) fn create(bridge: Arc<Bridge>, descriptor: PluginDescriptor) -> Result<PluginProxy> {
        let reply = bridge.call(&Request::CreatePlugin {
            descriptor: Box::new(descriptor.clone()),
        })?;
        let (id, params, program_names, latency, program) = match reply {
            Reply::Created {
                plugin,
                params,
                program_names,
                latency,
                program,
            } => (plugin, params, program_names, latency, program),
            other => return Err(unexpected_reply("CreatePlugin", &other)),
        };
        tracing::info!(
            plugin = %id,
            name = %descriptor.name,
            params = params.len(),
            "created remote plugin"
        );

        let (pending_tx, pending_rx) =
            ringbuf::HeapRb::<BlockEvent>::new(PENDING_QUEUE_CAPACITY).split();
        Ok(PluginProxy {
            shared: Arc::new(ProxyShared {
                bridge,
                id,
                descriptor,
                params: ParamCache::new(&params),
                program_names: ArcSwap::from_pointee(program_names),
                latency: AtomicU32::new(latency),
                program: AtomicI32::new(program),
                bypass: AtomicBool::new(false),
            }),
            pending_tx: Arc::new(UnsafeCell::new(pending_tx)),
            pending_rx: Arc::new(UnsafeCell::new(pending_rx)),
            midi_out: Vec::new(),
            sysex_out: Vec::new(),
            scratch: Vec::new(),
        })
    }

    pub fn id(&self) -> PluginId {
        self.shared.id
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.shared.descriptor
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.shared.bridge
    }

    pub fn alive(&self) -> bool {
        self.shared.bridge.alive()
    }

    pub fn parameter_count(&self) -> usize {
        self.shared.params.len()
    }

    /// Cached value of one parameter; reads never cross the process boundary.
    pub fn parameter(&self, index: u32) -> f32 {
        self.shared.params.get(index)
    }

    pub fn parameters(&self) -> Vec<f32> {
        (0..self.shared.params.len() as u32)
            .map(|i| self.shared.params.get(i))
            .collect()
    }

    pub fn latency(&self) -> u32 {
        self.shared.latency.load(Ordering::Relaxed)
    }

    pub fn current_program(&self) -> i32 {
        self.shared.program.load(Ordering::Relaxed)
    }

    pub fn bypassed(&self) -> bool {
        self.shared.bypass.load(Ordering::Relaxed)
    }

    pub fn program_names(&self) -> Arc<Vec<String>> {
        self.shared.program_names.load_full()
    }

    pub fn program_name(&self, program: i32) -> Option<String> {
        usize::try_from(program)
            .ok()
            .and_then(|i| self.shared.program_names.load().get(i).cloned())
    }

    /// Route Event notifications for this plugin to `listener` during
    /// [`Bridge::poll_ui`]. Dropping the listener is unregistration.
    pub fn set_ui_listener(&self, listener: Weak<dyn UiListener>) {
        self.shared.bridge.add_ui_client(self.shared.id, listener);
    }

    /// Queue a parameter move for the next block. The cache updates
    /// immediately so reads see the value without waiting for the echo.
    pub fn set_parameter(&mut self, index: u32, value: f32) {
        self.shared.params.set(index, value);
        self.push_event(BlockEvent::Param { index, value });
    }

    pub fn set_bypass(&mut self, bypass: bool) {
        self.shared.bypass.store(bypass, Ordering::Relaxed);
        self.push_event(BlockEvent::Bypass(bypass));
    }

    pub fn set_tempo(&mut self, bpm: f64) {
        self.push_event(BlockEvent::Tempo(bpm));
    }

    pub fn set_transport(&mut self, transport: TransportPosition) {
        self.push_event(BlockEvent::Transport(transport));
    }

    pub fn set_program(&mut self, program: i32) {
        self.shared.program.store(program, Ordering::Relaxed);
        self.push_event(BlockEvent::Program(program));
    }

    pub fn send_midi(&mut self, event: MidiEvent) {
        self.push_event(BlockEvent::Midi(event));
    }

    pub fn send_sysex(&mut self, data: Vec<u8>) {
        self.push_event(BlockEvent::Sysex(data));
    }

    fn push_event(&mut self, event: BlockEvent) {
        let prod = unsafe { &mut *self.pending_tx.get() };
        if prod.try_push(event).is_err() {
            tracing::warn!(plugin = %self.shared.id, "pending queue full, dropping event");
        }
    }

    /// Run one block remotely: claim an RT channel, publish pending events
    /// plus input samples as one turn, park on the reply, copy outputs back.
    ///
    /// On any failure the outputs are silenced; a dead server reports
    /// [`BridgeError::ProcessDied`].
    pub fn process(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        frames: usize,
    ) -> Result<()> {
        self.midi_out.clear();
        self.sysex_out.clear();

        let result = self.exchange_block(inputs, outputs, frames);
        if result.is_err() {
            silence(outputs, frames);
        }
        result
    }

    fn exchange_block(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        frames: usize,
    ) -> Result<()> {
        if frames > self.shared.bridge.config().max_block_frames as usize {
            return Err(BridgeError::Protocol(format!(
                "block of {frames} frames exceeds the configured maximum"
            )));
        }
        if inputs.iter().any(|ch| ch.len() < frames)
            || outputs.iter().any(|ch| ch.len() < frames)
        {
            return Err(BridgeError::Protocol(
                "audio buffer shorter than the block".to_string(),
            ));
        }
        let events = self.drain_pending();
        let request = Request::Process {
            plugin: self.shared.id,
            frames: frames as u32,
            inputs: inputs.len() as u32,
            outputs: outputs.len() as u32,
            events,
        };
        let header = wire::encode(&request)?;

        let bridge = Arc::clone(&self.shared.bridge);
        let mut chan = bridge.rt_channel();
        let need = header.len()
            + FRAME_OVERHEAD
            + inputs.len() * (frames * 4 + FRAME_OVERHEAD);
        if need > chan.capacity() as usize {
            return Err(BridgeError::Oversized {
                size: need,
                capacity: chan.capacity(),
            });
        }

        // Ticket before the liveness check, as in `Bridge::transact`: a death
        // force-post either lands past this ticket or precedes the flag the
        // check reads.
        let ticket = chan.reply_ticket();
        if !bridge.alive() {
            return Err(BridgeError::ProcessDied);
        }
        chan.clear();
        if !chan.write(&header) {
            return Err(BridgeError::Protocol(
                "request did not fit a cleared channel".to_string(),
            ));
        }
        for ch in inputs {
            if !chan.write(wire::samples_as_bytes(&ch[..frames])) {
                return Err(BridgeError::Protocol(
                    "input frame did not fit the channel".to_string(),
                ));
            }
        }
        chan.signal();
        chan.wait_reply(ticket);

        let reply: Reply = match chan.read_message(&mut self.scratch) {
            Some(bytes) => wire::decode(bytes)?,
            None => {
                return if bridge.alive() {
                    Err(BridgeError::Protocol(
                        "reply signal with empty channel".to_string(),
                    ))
                } else {
                    Err(BridgeError::ProcessDied)
                };
            }
        };
        let (out_frames, out_count, events) = match reply {
            Reply::Processed {
                frames,
                outputs,
                events,
                process_ns: _,
            } => (frames, outputs, events),
            Reply::Error { code, message } => return Err(BridgeError::from_wire(code, message)),
            other => return Err(unexpected_reply("Process", &other)),
        };
        if out_frames as usize != frames || out_count as usize != outputs.len() {
            return Err(BridgeError::Protocol(
                "processed block shape mismatch".to_string(),
            ));
        }
        for ch in outputs.iter_mut() {
            match chan.read_into(wire::samples_as_bytes_mut(&mut ch[..frames])) {
                ReadOutcome::Read(n) if n == frames * 4 => {}
                _ => {
                    return Err(BridgeError::Protocol(
                        "truncated output frame".to_string(),
                    ))
                }
            }
        }
        drop(chan);

        self.apply_engine_events(&events);
        Ok(())
    }

    fn drain_pending(&mut self) -> ProcessEventVec {
        let cons = unsafe { &mut *self.pending_rx.get() };
        let mut events = ProcessEventVec::new();
        while let Some(event) = cons.try_pop() {
            events.push(flatten_event(event));
        }
        events
    }

    fn apply_engine_events(&mut self, events: &[EngineEvent]) {
        for event in events {
            match event {
                EngineEvent::ParamValue { index, value }
                | EngineEvent::ParamAutomated { index, value } => {
                    self.shared.params.set(*index, *value)
                }
                EngineEvent::LatencyChanged { samples } => {
                    self.shared.latency.store(*samples, Ordering::Relaxed)
                }
                EngineEvent::ProgramChanged { program } => {
                    self.shared.program.store(*program, Ordering::Relaxed)
                }
                EngineEvent::Midi { event } => self.midi_out.push(*event),
                EngineEvent::Sysex { data } => self.sysex_out.push(data.clone()),
            }
        }
    }

    /// MIDI the plugin emitted during the most recent block.
    pub fn midi_output(&self) -> &[MidiEvent] {
        &self.midi_out
    }

    pub fn sysex_output(&self) -> &[Vec<u8>] {
        &self.sysex_out
    }

    /// Prepare the remote instance for a sample rate and block size. Blocking.
    pub fn setup_processing(&self, sample_rate: f64, max_block_frames: u32) -> Result<()> {
        let reply = self.shared.bridge.call(&Request::SetupProcessing {
            plugin: self.shared.id,
            sample_rate,
            max_block_frames,
        })?;
        expect_ok("SetupProcessing", reply)
    }

    pub fn suspend(&self) -> Result<()> {
        let reply = self.shared.bridge.call(&Request::Suspend {
            plugin: self.shared.id,
        })?;
        expect_ok("Suspend", reply)
    }

    pub fn resume(&self) -> Result<()> {
        let reply = self.shared.bridge.call(&Request::Resume {
            plugin: self.shared.id,
        })?;
        expect_ok("Resume", reply)
    }

    pub fn set_num_speakers(&self, inputs: u32, outputs: u32) -> Result<()> {
        let reply = self.shared.bridge.call(&Request::SetNumSpeakers {
            plugin: self.shared.id,
            inputs,
            outputs,
        })?;
        expect_ok("SetNumSpeakers", reply)
    }

    /// Set a parameter from its text rendering. Blocking; the reply carries
    /// the value the plugin actually adopted.
    pub fn set_parameter_text(&self, index: u32, value: &str) -> Result<()> {
        let reply = self.shared.bridge.call(&Request::SetParamString {
            plugin: self.shared.id,
            index,
            value: value.to_string(),
        })?;
        match reply {
            Reply::ParamChanges { changes } => {
                self.shared.params.apply(&changes);
                Ok(())
            }
            other => Err(unexpected_reply("SetParamString", &other)),
        }
    }

    /// Ask the server for a program's name. Blocking; prefer
    /// [`program_name`](PluginProxy::program_name) for cached reads.
    pub fn fetch_program_name(&self, program: i32) -> Result<String> {
        let reply = self.shared.bridge.call(&Request::GetProgramName {
            plugin: self.shared.id,
            program,
        })?;
        match reply {
            Reply::ProgramName { name } => Ok(name),
            other => Err(unexpected_reply("GetProgramName", &other)),
        }
    }

    /// Rename the current program. Blocking.
    pub fn set_program_name(&self, name: &str) -> Result<()> {
        let reply = self.shared.bridge.call(&Request::SetProgramName {
            plugin: self.shared.id,
            name: name.to_string(),
        })?;
        expect_ok("SetProgramName", reply)?;

        let program = self.current_program();
        self.shared.program_names.rcu(|names| {
            let mut names = (**names).clone();
            if let Some(slot) = usize::try_from(program).ok().and_then(|i| names.get_mut(i)) {
                *slot = name.to_string();
            }
            names
        });
        Ok(())
    }

    /// Load a single-program preset into the plugin. Blocking; returns how
    /// many cached parameters the load changed.
    pub fn load_program_data(&self, data: &[u8]) -> Result<usize> {
        self.load_chunk(Request::ReadProgramData {
            plugin: self.shared.id,
            data: data.to_vec(),
        })
    }

    /// Serialize the current program out of the plugin. Blocking.
    pub fn save_program_data(&self) -> Result<Vec<u8>> {
        let reply = self.shared.bridge.call(&Request::WriteProgramData {
            plugin: self.shared.id,
        })?;
        match reply {
            Reply::ProgramData { data } => Ok(data),
            other => Err(unexpected_reply("WriteProgramData", &other)),
        }
    }

    /// Load a whole bank into the plugin. Blocking; returns how many cached
    /// parameters the load changed.
    pub fn load_bank_data(&self, data: &[u8]) -> Result<usize> {
        self.load_chunk(Request::ReadBankData {
            plugin: self.shared.id,
            data: data.to_vec(),
        })
    }

    /// Serialize the whole bank out of the plugin. Blocking.
    pub fn save_bank_data(&self) -> Result<Vec<u8>> {
        let reply = self.shared.bridge.call(&Request::WriteBankData {
            plugin: self.shared.id,
        })?;
        match reply {
            Reply::BankData { data } => Ok(data),
            other => Err(unexpected_reply("WriteBankData", &other)),
        }
    }

    fn load_chunk(&self, request: Request) -> Result<usize> {
        let reply = self.shared.bridge.call(&request)?;
        match reply {
            Reply::ParamChanges { changes } => {
                self.shared.params.apply(&changes);
                Ok(changes.len())
            }
            other => Err(unexpected_reply("chunk load", &other)),
        }
    }
}

fn flatten_event(event: BlockEvent) -> ProcessEvent {
    match event {
        BlockEvent::Param { index, value } => ProcessEvent::SetParamValue { index, value },
        BlockEvent::Bypass(bypass) => ProcessEvent::SetBypass { bypass },
        BlockEvent::Tempo(bpm) => ProcessEvent::SetTempo { bpm },
        BlockEvent::Transport(transport) => ProcessEvent::SetTransport { transport },
        BlockEvent::Program(program) => ProcessEvent::SetProgram { program },
        BlockEvent::Midi(event) => ProcessEvent::Midi { event },
        BlockEvent::Sysex(data) => ProcessEvent::Sysex { data },
    }
}

fn expect_ok(op: &str, reply: Reply) -> Result<()> {
    match reply {
        Reply::Ok => Ok(()),
        other => Err(unexpected_reply(op, &other)),
    }
}

fn unexpected_reply(op: &str, reply: &Reply) -> BridgeError {
    BridgeError::Protocol(format!("unexpected reply to {op}: {reply:?}"))
}

fn silence(outputs: &mut [&mut [f32]], frames: usize) {
    for ch in outputs.iter_mut() {
        let n = frames.min(ch.len());
        ch[..n].fill(0.0);
    }
}
