//! Plugin instance trait and processing types.
//!
//! One [`PluginInstance`] is the in-process face of one hosted plugin,
//! whatever its format. Format loaders live behind this trait; the rest of
//! the server only ever sees it.

use crate::error::{Result, ServerError};
use soundproof_bridge::wire::{MidiEvent, ParamChange, TransportPosition};

/// Everything a plugin sees for one block beyond the audio itself.
pub struct ProcessContext<'a> {
    pub midi_events: &'a [MidiEvent],
    pub sysex: &'a [Vec<u8>],
    pub transport: Option<&'a TransportPosition>,
    pub tempo: f64,
}

impl Default for ProcessContext<'_> {
    fn default() -> Self {
        Self {
            midi_events: &[],
            sysex: &[],
            transport: None,
            tempo: 120.0,
        }
    }
}

impl<'a> ProcessContext<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn midi(mut self, events: &'a [MidiEvent]) -> Self {
        self.midi_events = events;
        self
    }

    pub fn transport(mut self, transport: &'a TransportPosition) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn tempo(mut self, bpm: f64) -> Self {
        self.tempo = bpm;
        self
    }
}

/// What a plugin produced during one block besides audio.
#[derive(Default)]
pub struct ProcessOutput {
    pub midi_events: Vec<MidiEvent>,
    pub sysex: Vec<Vec<u8>>,
    /// Parameters the plugin moved on its own during the block.
    pub param_changes: Vec<ParamChange>,
}

/// Unified interface for hosted plugin instances.
///
/// Most methods default to the no-op or unsupported behavior a minimal
/// effect needs; loaders override what their format provides.
pub trait PluginInstance: Send {
    fn name(&self) -> &str;

    fn vendor(&self) -> &str {
        ""
    }

    fn version(&self) -> &str {
        ""
    }

    fn audio_inputs(&self) -> u32 {
        2
    }

    fn audio_outputs(&self) -> u32 {
        2
    }

    fn is_synth(&self) -> bool {
        false
    }

    fn wants_midi(&self) -> bool {
        self.is_synth()
    }

    fn parameter_count(&self) -> usize;

    /// Normalized 0..1.
    fn parameter(&self, index: u32) -> f32;

    /// Normalized 0..1.
    fn set_parameter(&mut self, index: u32, value: f32);

    fn set_parameter_text(&mut self, _index: u32, _text: &str) -> Result<()> {
        Err(ServerError::Unsupported(
            "parameter text entry".to_string(),
        ))
    }

    fn program_count(&self) -> usize {
        1
    }

    fn current_program(&self) -> i32 {
        0
    }

    fn set_program(&mut self, _program: i32) {}

    fn program_name(&self, _program: i32) -> String {
        "Default".to_string()
    }

    fn set_program_name(&mut self, _name: &str) {}

    /// Processing delay in samples.
    fn latency(&self) -> u32 {
        0
    }

    fn set_sample_rate(&mut self, _rate: f64) {}

    fn set_block_size(&mut self, _frames: u32) {}

    fn set_speakers(&mut self, _inputs: u32, _outputs: u32) -> Result<()> {
        Ok(())
    }

    fn suspend(&mut self) {}

    fn resume(&mut self) {}

    fn set_bypass(&mut self, _bypass: bool) {}

    /// Run one block. Buffers hold at least `frames` samples per channel;
    /// the instance must fill every output channel.
    fn process(
        &mut self,
        inputs: &[Vec<f32>],
        outputs: &mut [Vec<f32>],
        frames: usize,
        ctx: &ProcessContext,
    ) -> ProcessOutput;

    /// Serialize the current program.
    fn program_data(&mut self) -> Result<Vec<u8>> {
        Err(ServerError::Unsupported("program chunks".to_string()))
    }

    /// Load a program chunk produced by [`program_data`](Self::program_data).
    fn set_program_data(&mut self, _data: &[u8]) -> Result<()> {
        Err(ServerError::Unsupported("program chunks".to_string()))
    }

    /// Serialize all programs.
    fn bank_data(&mut self) -> Result<Vec<u8>> {
        Err(ServerError::Unsupported("bank chunks".to_string()))
    }

    /// Load a bank chunk produced by [`bank_data`](Self::bank_data).
    fn set_bank_data(&mut self, _data: &[u8]) -> Result<()> {
        Err(ServerError::Unsupported("bank chunks".to_string()))
    }
}
