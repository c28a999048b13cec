//! Built-in plugin units.
//!
//! Descriptors whose path uses the `native:` scheme resolve to units compiled
//! into the server itself. They are small but exercise every host path a
//! loaded plugin would: parameters, programs, chunks, MIDI and self-driven
//! parameter changes.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};
use crate::instance::{PluginInstance, ProcessContext, ProcessOutput};
use soundproof_bridge::descriptor::PluginDescriptor;
use soundproof_bridge::wire::ParamChange;

/// Path prefix that marks a built-in unit.
pub const NATIVE_SCHEME: &str = "native:";

/// Extract the unit name from a `native:` path, if it is one.
pub fn native_name(path: &str) -> Option<&str> {
    path.strip_prefix(NATIVE_SCHEME)
}

/// Construct a built-in unit by name.
pub fn create_native(name: &str) -> Option<Box<dyn PluginInstance>> {
    match name {
        "gain" => Some(Box::new(GainUnit::new())),
        "sine" => Some(Box::new(SineUnit::new())),
        _ => None,
    }
}

/// Instantiate whatever plugin a descriptor points at.
pub fn instantiate(descriptor: &PluginDescriptor) -> Result<Box<dyn PluginInstance>> {
    if let Some(name) = native_name(&descriptor.path) {
        return create_native(name)
            .ok_or_else(|| ServerError::Plugin(format!("unknown built-in unit '{name}'")));
    }
    Err(ServerError::Unsupported(format!(
        "no loader for plugin file {}",
        descriptor.path
    )))
}

#[derive(Clone, Serialize, Deserialize)]
struct GainProgram {
    name: String,
    value: f32,
}

#[derive(Serialize, Deserialize)]
struct GainBank {
    current: i32,
    programs: Vec<GainProgram>,
}

/// Stereo gain effect. One parameter, four factory programs, JSON chunks.
pub struct GainUnit {
    programs: Vec<GainProgram>,
    current: usize,
    bypass: bool,
}

impl GainUnit {
    pub fn new() -> Self {
        let programs = vec![
            GainProgram { name: "Unity".to_string(), value: 0.5 },
            GainProgram { name: "Cut".to_string(), value: 0.25 },
            GainProgram { name: "Boost".to_string(), value: 0.75 },
            GainProgram { name: "Mute".to_string(), value: 0.0 },
        ];
        Self { programs, current: 0, bypass: false }
    }

    /// Normalized 0..1 maps to a 0..2 linear amplitude, unity at 0.5.
    fn amplitude(&self) -> f32 {
        self.programs[self.current].value * 2.0
    }
}

impl Default for GainUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginInstance for GainUnit {
    fn name(&self) -> &str {
        "Gain"
    }

    fn vendor(&self) -> &str {
        "Soundproof"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn parameter_count(&self) -> usize {
        1
    }

    fn parameter(&self, index: u32) -> f32 {
        if index == 0 {
            self.programs[self.current].value
        } else {
            0.0
        }
    }

    fn set_parameter(&mut self, index: u32, value: f32) {
        if index == 0 {
            self.programs[self.current].value = value.clamp(0.0, 1.0);
        }
    }

    fn set_parameter_text(&mut self, index: u32, text: &str) -> Result<()> {
        if index != 0 {
            return Err(ServerError::Plugin(format!("no parameter {index}")));
        }
        let value: f32 = text
            .trim()
            .parse()
            .map_err(|_| ServerError::Plugin(format!("'{text}' is not a gain value")))?;
        self.set_parameter(0, value);
        Ok(())
    }

    fn program_count(&self) -> usize {
        self.programs.len()
    }

    fn current_program(&self) -> i32 {
        self.current as i32
    }

    fn set_program(&mut self, program: i32) {
        if program >= 0 && (program as usize) < self.programs.len() {
            self.current = program as usize;
        }
    }

    fn program_name(&self, program: i32) -> String {
        self.programs
            .get(program as usize)
            .map(|p| p.name.clone())
            .unwrap_or_default()
    }

    fn set_program_name(&mut self, name: &str) {
        self.programs[self.current].name = name.to_string();
    }

    fn set_bypass(&mut self, bypass: bool) {
        self.bypass = bypass;
    }

    fn process(
        &mut self,
        inputs: &[Vec<f32>],
        outputs: &mut [Vec<f32>],
        frames: usize,
        _ctx: &ProcessContext,
    ) -> ProcessOutput {
        let amp = if self.bypass { 1.0 } else { self.amplitude() };
        for (ch, out) in outputs.iter_mut().enumerate() {
            match inputs.get(ch) {
                Some(input) => {
                    for i in 0..frames {
                        out[i] = input[i] * amp;
                    }
                }
                None => out[..frames].fill(0.0),
            }
        }
        ProcessOutput::default()
    }

    fn program_data(&mut self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.programs[self.current])?)
    }

    fn set_program_data(&mut self, data: &[u8]) -> Result<()> {
        let program: GainProgram = serde_json::from_slice(data)?;
        self.programs[self.current] = program;
        Ok(())
    }

    fn bank_data(&mut self) -> Result<Vec<u8>> {
        let bank = GainBank {
            current: self.current as i32,
            programs: self.programs.clone(),
        };
        Ok(serde_json::to_vec(&bank)?)
    }

    fn set_bank_data(&mut self, data: &[u8]) -> Result<()> {
        let bank: GainBank = serde_json::from_slice(data)?;
        if bank.programs.is_empty() {
            return Err(ServerError::Plugin("bank has no programs".to_string()));
        }
        self.programs = bank.programs;
        self.current = (bank.current.max(0) as usize).min(self.programs.len() - 1);
        Ok(())
    }
}

const FREQ_PARAM: u32 = 0;
const AMP_PARAM: u32 = 1;
const MAX_FREQ_HZ: f32 = 2000.0;

/// Sine synth. Two parameters, answers MIDI notes, reports the parameter
/// moves it makes for itself.
pub struct SineUnit {
    freq_hz: f32,
    amp: f32,
    phase: f32,
    sample_rate: f64,
    bypass: bool,
}

impl SineUnit {
    pub fn new() -> Self {
        Self {
            freq_hz: 440.0,
            amp: 0.0,
            phase: 0.0,
            sample_rate: 44100.0,
            bypass: false,
        }
    }

    fn note_to_freq(note: u8) -> f32 {
        440.0 * 2.0_f32.powf((note as f32 - 69.0) / 12.0)
    }
}

impl Default for SineUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginInstance for SineUnit {
    fn name(&self) -> &str {
        "Sine"
    }

    fn vendor(&self) -> &str {
        "Soundproof"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn audio_inputs(&self) -> u32 {
        0
    }

    fn is_synth(&self) -> bool {
        true
    }

    fn parameter_count(&self) -> usize {
        2
    }

    fn parameter(&self, index: u32) -> f32 {
        match index {
            FREQ_PARAM => (self.freq_hz / MAX_FREQ_HZ).clamp(0.0, 1.0),
            AMP_PARAM => self.amp,
            _ => 0.0,
        }
    }

    fn set_parameter(&mut self, index: u32, value: f32) {
        match index {
            FREQ_PARAM => self.freq_hz = value.clamp(0.0, 1.0) * MAX_FREQ_HZ,
            AMP_PARAM => self.amp = value.clamp(0.0, 1.0),
            _ => {}
        }
    }

    fn set_sample_rate(&mut self, rate: f64) {
        if rate > 0.0 {
            self.sample_rate = rate;
        }
    }

    fn suspend(&mut self) {
        self.phase = 0.0;
    }

    fn set_bypass(&mut self, bypass: bool) {
        self.bypass = bypass;
    }

    fn process(
        &mut self,
        _inputs: &[Vec<f32>],
        outputs: &mut [Vec<f32>],
        frames: usize,
        ctx: &ProcessContext,
    ) -> ProcessOutput {
        let mut output = ProcessOutput::default();

        // Notes take effect at block boundaries.
        for event in ctx.midi_events {
            let data = &event.data;
            match data[0] & 0xF0 {
                0x90 if data[2] > 0 => {
                    self.freq_hz = Self::note_to_freq(data[1]);
                    self.amp = data[2] as f32 / 127.0;
                    output.param_changes.push(ParamChange {
                        index: FREQ_PARAM,
                        value: self.parameter(FREQ_PARAM),
                    });
                    output.param_changes.push(ParamChange {
                        index: AMP_PARAM,
                        value: self.amp,
                    });
                }
                0x80 | 0x90 => {
                    self.amp = 0.0;
                    output.param_changes.push(ParamChange {
                        index: AMP_PARAM,
                        value: 0.0,
                    });
                }
                _ => {}
            }
        }

        let amp = if self.bypass { 0.0 } else { self.amp };
        let step = (self.freq_hz as f64 / self.sample_rate) as f32 * std::f32::consts::TAU;
        for i in 0..frames {
            let sample = self.phase.sin() * amp;
            self.phase += step;
            if self.phase > std::f32::consts::TAU {
                self.phase -= std::f32::consts::TAU;
            }
            for out in outputs.iter_mut() {
                out[i] = sample;
            }
        }
        output
    }
}
