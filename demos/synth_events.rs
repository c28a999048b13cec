//! Event plumbing walkthrough: drive the built-in sine synth with MIDI and
//! watch its parameter automation come back through the UI queue.
//!
//! **Concepts:** synth units, MIDI injection, `UiListener`, `poll_ui`
//!
//! The host spawns the `soundproof-host` helper, so build the whole
//! workspace first:
//!
//! ```bash
//! cargo build --workspace
//! cargo run --example synth_events
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use soundproof::prelude::*;

struct Printer;

impl UiListener for Printer {
    fn parameter_automated(&self, index: u32, value: f32) {
        println!("plugin moved parameter {index} to {value:.3}");
    }
}

fn main() -> soundproof::Result<()> {
    let host = BridgeHost::with_defaults()?;

    let mut synth = host.load(PluginDescriptor::new("native:sine", "Sine"))?;
    synth.setup_processing(48_000.0, 256)?;

    let printer = Arc::new(Printer);
    let listener = Arc::downgrade(&printer);
    synth.set_ui_listener(listener);

    // A4 at velocity 100: the synth answers by automating its frequency
    // and amplitude parameters.
    synth.send_midi(MidiEvent::new(0, &[0x90, 69, 100]));

    let mut out_l = vec![0.0f32; 256];
    let mut out_r = vec![0.0f32; 256];
    synth.process(&[], &mut [&mut out_l, &mut out_r], 256)?;

    let peak = out_l.iter().fold(0.0f32, |a, x| a.max(x.abs()));
    println!("rendered {} frames, peak {:.3}", out_l.len(), peak);

    // Automation notifications ride the UI queue; give the server loop a
    // few ticks to forward them.
    for _ in 0..25 {
        host.poll_ui();
        thread::sleep(Duration::from_millis(20));
    }

    Ok(())
}
