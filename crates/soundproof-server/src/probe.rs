//! Out-of-process plugin probing.
//!
//! `soundproof-host probe` runs this in a throwaway process: instantiate the
//! plugin, run one silent block, and write what was learned to a result file.
//! A plugin that crashes takes only the probe process with it; the scanner
//! reads the exit status and the result file, never the plugin.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::instance::ProcessContext;
use crate::native;
use soundproof_bridge::descriptor::PluginDescriptor;
use soundproof_bridge::wire::ErrorCode;

const PROBE_SAMPLE_RATE: f64 = 48000.0;
const PROBE_BLOCK_FRAMES: usize = 256;

/// What a successful probe learned about the plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub descriptor: PluginDescriptor,
    pub parameter_count: usize,
    pub program_count: usize,
    pub latency: u32,
}

/// Result file payload: `{"ok": {…}}` or `{"err": {code, message}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeOutcome {
    Ok(ProbeReport),
    Err { code: ErrorCode, message: String },
}

/// Probe one plugin and write the outcome to `result_path`.
///
/// The result file is written on failure too, so the scanner can distinguish
/// a rejected plugin (exit 1, `err` payload) from a crashed one (no exit
/// through here at all).
pub fn run_probe(path: &str, unique_id: Option<i32>, result_path: &Path) -> Result<ProbeReport> {
    match probe_plugin(path, unique_id) {
        Ok(report) => {
            write_outcome(result_path, &ProbeOutcome::Ok(report.clone()))?;
            Ok(report)
        }
        Err(e) => {
            // Best-effort: the exit status alone still marks the failure.
            if let Err(write_err) = write_outcome(
                result_path,
                &ProbeOutcome::Err {
                    code: e.code(),
                    message: e.to_string(),
                },
            ) {
                tracing::warn!(error = %write_err, "could not write probe failure result");
            }
            Err(e)
        }
    }
}

fn probe_plugin(path: &str, unique_id: Option<i32>) -> Result<ProbeReport> {
    let request = PluginDescriptor::new(path, "").unique_id(unique_id.unwrap_or(0));
    let mut instance = native::instantiate(&request)?;

    instance.set_sample_rate(PROBE_SAMPLE_RATE);
    instance.set_block_size(PROBE_BLOCK_FRAMES as u32);
    instance.resume();

    // One silent block proves the plugin can actually run, not just load.
    let inputs = vec![vec![0.0f32; PROBE_BLOCK_FRAMES]; instance.audio_inputs() as usize];
    let mut outputs = vec![vec![0.0f32; PROBE_BLOCK_FRAMES]; instance.audio_outputs().max(1) as usize];
    let _ = instance.process(
        &inputs,
        &mut outputs,
        PROBE_BLOCK_FRAMES,
        &ProcessContext::default(),
    );
    instance.suspend();

    let descriptor = PluginDescriptor::new(path, instance.name())
        .unique_id(unique_id.unwrap_or(0))
        .vendor(instance.vendor())
        .version(instance.version())
        .audio_io(instance.audio_inputs(), instance.audio_outputs())
        .synth(instance.is_synth())
        .midi(instance.wants_midi());
    Ok(ProbeReport {
        descriptor,
        parameter_count: instance.parameter_count(),
        program_count: instance.program_count(),
        latency: instance.latency(),
    })
}

fn write_outcome(result_path: &Path, outcome: &ProbeOutcome) -> Result<()> {
    let json = serde_json::to_string_pretty(outcome)?;
    fs::write(result_path, json)?;
    Ok(())
}
