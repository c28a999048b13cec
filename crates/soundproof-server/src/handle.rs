//! Per-plugin server state: one [`PluginHandle`] adapts one live
//! [`PluginInstance`] to the wire protocol.
//!
//! The handle owns the audio buffer memory, the shadow copy of parameter
//! state used for differential updates, and the musical context (tempo,
//! transport, bypass) carried between blocks.

use std::time::Instant;

use crate::error::{Result, ServerError};
use crate::instance::{PluginInstance, ProcessContext};
use soundproof_bridge::descriptor::{PluginDescriptor, PluginId};
use soundproof_bridge::wire::{
    samples_as_bytes, samples_as_bytes_mut, EngineEvent, MidiEvent, ParamChange, ProcessEvent,
    Reply, Request, TransportPosition,
};
use soundproof_shm::{ReadOutcome, ShmChannel, FRAME_OVERHEAD};

pub struct PluginHandle {
    id: PluginId,
    descriptor: PluginDescriptor,
    instance: Box<dyn PluginInstance>,
    /// Parameter values as last reported to the host. Diffed against the
    /// instance after anything that can move parameters behind the host's
    /// back, so updates go out only for values that actually changed.
    shadow: Vec<f32>,
    tempo: f64,
    transport: Option<TransportPosition>,
    latency: u32,
    program: i32,
    input_buffers: Vec<Vec<f32>>,
    output_buffers: Vec<Vec<f32>>,
    buffer_frames: usize,
    midi_scratch: Vec<MidiEvent>,
    sysex_scratch: Vec<Vec<u8>>,
}

impl PluginHandle {
    pub fn new(id: PluginId, descriptor: PluginDescriptor, instance: Box<dyn PluginInstance>) -> Self {
        let shadow: Vec<f32> = (0..instance.parameter_count())
            .map(|i| instance.parameter(i as u32))
            .collect();
        let latency = instance.latency();
        let program = instance.current_program();
        Self {
            id,
            descriptor,
            instance,
            shadow,
            tempo: 120.0,
            transport: None,
            latency,
            program,
            input_buffers: Vec::new(),
            output_buffers: Vec::new(),
            buffer_frames: 0,
            midi_scratch: Vec::new(),
            sysex_scratch: Vec::new(),
        }
    }

    pub fn id(&self) -> PluginId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.instance.name()
    }

    /// The full state burst answering `CreatePlugin`.
    pub fn created_reply(&self) -> Reply {
        let program_names = (0..self.instance.program_count())
            .map(|p| self.instance.program_name(p as i32))
            .collect();
        Reply::Created {
            plugin: self.id,
            params: self.shadow.clone(),
            program_names,
            latency: self.latency,
            program: self.program,
        }
    }

    /// Diff the instance's parameters against the shadow, update the shadow,
    /// and return one change per parameter that actually moved.
    fn refresh_shadow(&mut self) -> Vec<ParamChange> {
        let count = self.instance.parameter_count();
        if self.shadow.len() != count {
            self.shadow.resize(count, f32::NAN);
        }
        let mut changes = Vec::new();
        for (i, slot) in self.shadow.iter_mut().enumerate() {
            let value = self.instance.parameter(i as u32);
            // Bitwise compare so a NaN-valued parameter cannot emit forever.
            if value.to_bits() != slot.to_bits() {
                *slot = value;
                changes.push(ParamChange {
                    index: i as u32,
                    value,
                });
            }
        }
        changes
    }

    fn ensure_buffers(&mut self, inputs: usize, outputs: usize, frames: usize) {
        let frames = frames.max(self.buffer_frames);
        if self.input_buffers.len() != inputs
            || self.output_buffers.len() != outputs
            || frames != self.buffer_frames
        {
            self.buffer_frames = frames;
            self.input_buffers = vec![vec![0.0; frames]; inputs];
            self.output_buffers = vec![vec![0.0; frames]; outputs];
        }
    }

    /// Execute one non-realtime command against the instance.
    ///
    /// `CreatePlugin`, `DestroyPlugin`, `Quit` and `Process` never reach this
    /// point; the server routes them before per-plugin dispatch.
    pub fn dispatch(&mut self, request: &Request) -> Result<Reply> {
        match request {
            Request::SetupProcessing {
                sample_rate,
                max_block_frames,
                ..
            } => {
                self.instance.set_sample_rate(*sample_rate);
                self.instance.set_block_size(*max_block_frames);
                // Pre-size buffers so the realtime path never allocates.
                self.ensure_buffers(
                    self.descriptor.audio_inputs as usize,
                    self.descriptor.audio_outputs as usize,
                    *max_block_frames as usize,
                );
                Ok(Reply::Ok)
            }
            Request::Suspend { .. } => {
                self.instance.suspend();
                Ok(Reply::Ok)
            }
            Request::Resume { .. } => {
                self.instance.resume();
                Ok(Reply::Ok)
            }
            Request::SetNumSpeakers {
                inputs, outputs, ..
            } => {
                self.instance.set_speakers(*inputs, *outputs)?;
                self.descriptor.audio_inputs = *inputs;
                self.descriptor.audio_outputs = *outputs;
                Ok(Reply::Ok)
            }
            Request::SetParamString { index, value, .. } => {
                self.instance.set_parameter_text(*index, value)?;
                Ok(Reply::ParamChanges {
                    changes: self.refresh_shadow(),
                })
            }
            Request::GetProgramName { program, .. } => Ok(Reply::ProgramName {
                name: self.instance.program_name(*program),
            }),
            Request::SetProgramName { name, .. } => {
                self.instance.set_program_name(name);
                Ok(Reply::Ok)
            }
            Request::ReadProgramData { data, .. } => {
                self.instance.set_program_data(data)?;
                Ok(Reply::ParamChanges {
                    changes: self.refresh_shadow(),
                })
            }
            Request::WriteProgramData { .. } => Ok(Reply::ProgramData {
                data: self.instance.program_data()?,
            }),
            Request::ReadBankData { data, .. } => {
                self.instance.set_bank_data(data)?;
                Ok(Reply::ParamChanges {
                    changes: self.refresh_shadow(),
                })
            }
            Request::WriteBankData { .. } => Ok(Reply::BankData {
                data: self.instance.bank_data()?,
            }),
            other => Err(ServerError::Protocol(format!(
                "request {other:?} is not a per-plugin command"
            ))),
        }
    }

    /// Parameter edit arriving over the UI queue. The instance takes the
    /// value but the shadow does not, so the next block's diff reports the
    /// applied value back to the host cache.
    pub fn apply_ui_parameter(&mut self, index: u32, value: f32) {
        self.instance.set_parameter(index, value);
    }

    /// Program switch arriving over the UI queue; picked up by the next
    /// block's drift checks.
    pub fn apply_ui_program(&mut self, program: i32) {
        self.instance.set_program(program);
    }

    /// Run one audio block: consume the request's input frames from `chan`,
    /// apply the batched events, process, and write the `Processed` reply
    /// plus output frames back. Does not signal; the caller owns the turn.
    ///
    /// Returns the events worth forwarding to UI listeners.
    pub fn run_block(
        &mut self,
        chan: &mut ShmChannel,
        frames: u32,
        inputs: u32,
        outputs: u32,
        events: &[ProcessEvent],
    ) -> Result<Vec<EngineEvent>> {
        let frames_n = frames as usize;
        let inputs_n = inputs as usize;
        let outputs_n = outputs as usize;
        if frames == 0 {
            return Err(ServerError::Protocol("zero-frame block".to_string()));
        }
        // Bound the allocation below by what the channel could have carried.
        if frames_n * 4 + FRAME_OVERHEAD > chan.capacity() as usize {
            return Err(ServerError::Protocol(format!(
                "{frames} frames exceed channel '{}' capacity",
                chan.name()
            )));
        }

        self.ensure_buffers(inputs_n, outputs_n, frames_n);
        for ch in 0..inputs_n {
            let buf = samples_as_bytes_mut(&mut self.input_buffers[ch][..frames_n]);
            match chan.read_into(buf) {
                ReadOutcome::Read(n) if n == frames_n * 4 => {}
                ReadOutcome::Read(n) => {
                    return Err(ServerError::Protocol(format!(
                        "input frame {ch} carries {n} bytes, expected {}",
                        frames_n * 4
                    )))
                }
                ReadOutcome::Empty => {
                    return Err(ServerError::Protocol(format!(
                        "missing input frame {ch} of {inputs}"
                    )))
                }
                ReadOutcome::TooSmall(need) => {
                    return Err(ServerError::Protocol(format!(
                        "input frame {ch} is {need} bytes, larger than the block"
                    )))
                }
            }
        }

        self.midi_scratch.clear();
        self.sysex_scratch.clear();
        for event in events {
            match event {
                ProcessEvent::SetParamValue { index, value } => {
                    self.instance.set_parameter(*index, *value);
                    // Shadow takes the requested value; only a quantization
                    // delta will echo back.
                    if let Some(slot) = self.shadow.get_mut(*index as usize) {
                        *slot = *value;
                    }
                }
                ProcessEvent::SetBypass { bypass } => {
                    self.instance.set_bypass(*bypass);
                }
                ProcessEvent::SetTempo { bpm } => {
                    self.tempo = *bpm;
                }
                ProcessEvent::SetTransport { transport } => {
                    self.transport = Some(*transport);
                }
                ProcessEvent::SetProgram { program } => {
                    self.instance.set_program(*program);
                }
                ProcessEvent::Midi { event } => {
                    self.midi_scratch.push(*event);
                }
                ProcessEvent::Sysex { data } => {
                    self.sysex_scratch.push(data.clone());
                }
            }
        }

        let ctx = ProcessContext {
            midi_events: &self.midi_scratch,
            sysex: &self.sysex_scratch,
            transport: self.transport.as_ref(),
            tempo: self.tempo,
        };
        let started = Instant::now();
        let out = self.instance.process(
            &self.input_buffers[..inputs_n],
            &mut self.output_buffers[..outputs_n],
            frames_n,
            &ctx,
        );
        let process_ns = started.elapsed().as_nanos() as u64;

        let mut reply_events = Vec::new();
        // Plugin self-moves first so the diff below does not re-report them
        // as host echoes.
        for change in &out.param_changes {
            if let Some(slot) = self.shadow.get_mut(change.index as usize) {
                *slot = change.value;
            }
            reply_events.push(EngineEvent::ParamAutomated {
                index: change.index,
                value: change.value,
            });
        }
        for change in self.refresh_shadow() {
            reply_events.push(EngineEvent::ParamValue {
                index: change.index,
                value: change.value,
            });
        }
        for event in out.midi_events {
            reply_events.push(EngineEvent::Midi { event });
        }
        for data in out.sysex {
            reply_events.push(EngineEvent::Sysex { data });
        }
        let latency = self.instance.latency();
        if latency != self.latency {
            self.latency = latency;
            reply_events.push(EngineEvent::LatencyChanged { samples: latency });
        }
        let program = self.instance.current_program();
        if program != self.program {
            self.program = program;
            reply_events.push(EngineEvent::ProgramChanged { program });
        }

        let ui_events: Vec<EngineEvent> = reply_events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    EngineEvent::ParamAutomated { .. }
                        | EngineEvent::LatencyChanged { .. }
                        | EngineEvent::ProgramChanged { .. }
                )
            })
            .cloned()
            .collect();

        let reply = Reply::Processed {
            frames,
            outputs,
            events: reply_events,
            process_ns,
        };
        let encoded = bincode::serialize(&reply)?;
        // Pre-check the whole reply so a partial turn can never be published.
        let need =
            FRAME_OVERHEAD + encoded.len() + outputs_n * (frames_n * 4 + FRAME_OVERHEAD);
        if need > chan.capacity() as usize {
            return Err(ServerError::Protocol(format!(
                "processed reply needs {need} bytes, channel '{}' holds {}",
                chan.name(),
                chan.capacity()
            )));
        }
        if !chan.write(&encoded) {
            return Err(ServerError::Protocol(
                "processed reply did not fit after pre-check".to_string(),
            ));
        }
        for ch in 0..outputs_n {
            if !chan.write(samples_as_bytes(&self.output_buffers[ch][..frames_n])) {
                return Err(ServerError::Protocol(format!(
                    "output frame {ch} did not fit after pre-check"
                )));
            }
        }
        Ok(ui_events)
    }
}
