//! Minimal hosting walkthrough: spawn a plugin server, load the built-in
//! gain unit, and run one audio block through it.
//!
//! **Concepts:** host setup, plugin loading, parameter control, processing
//!
//! The host spawns the `soundproof-host` helper, so build the whole
//! workspace first:
//!
//! ```bash
//! cargo build --workspace
//! cargo run --example gain_host
//! ```

use soundproof::prelude::*;

fn main() -> soundproof::Result<()> {
    let host = BridgeHost::with_defaults()?;

    let mut plugin = host.load(PluginDescriptor::new("native:gain", "Gain"))?;
    println!(
        "Loaded {} ({} parameter(s), programs {:?})",
        plugin.descriptor().name,
        plugin.parameter_count(),
        plugin.program_names(),
    );

    plugin.setup_processing(48_000.0, 512)?;
    // Gain maps value 0.5 to unity; 0.25 halves the signal.
    plugin.set_parameter(0, 0.25);

    let input: Vec<f32> = (0..512)
        .map(|i| (i as f32 * 440.0 / 48_000.0 * std::f32::consts::TAU).sin())
        .collect();
    let mut out_l = vec![0.0f32; 512];
    let mut out_r = vec![0.0f32; 512];

    plugin.process(&[&input, &input], &mut [&mut out_l, &mut out_r], 512)?;

    let peak = |s: &[f32]| s.iter().fold(0.0f32, |a, x| a.max(x.abs()));
    println!("peak in {:.3} -> peak out {:.3}", peak(&input), peak(&out_l));
    println!("reported latency: {} samples", plugin.latency());

    Ok(())
}
