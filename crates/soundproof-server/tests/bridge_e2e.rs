//! End-to-end tests: the real helper binary, spawned and driven through the
//! host-side bridge. Each test gets its own region directory so parallel
//! tests never share a server.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use soundproof_bridge::wire::MidiEvent;
use soundproof_bridge::{BridgeConfig, BridgeError, BridgeHost, PluginDescriptor, UiListener};

fn test_host(dir: &tempfile::TempDir) -> BridgeHost {
    let config = BridgeConfig {
        shm_dir: Some(dir.path().to_path_buf()),
        server_program: Some(PathBuf::from(env!("CARGO_BIN_EXE_soundproof-host"))),
        ..Default::default()
    };
    BridgeHost::new(config).unwrap()
}

fn gain() -> PluginDescriptor {
    PluginDescriptor::new("native:gain", "Gain")
}

#[test]
fn gain_scales_audio_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let host = test_host(&dir);
    let mut proxy = host.load(gain()).unwrap();

    // The create burst populated the cache without extra round trips.
    assert_eq!(proxy.parameter_count(), 1);
    assert!((proxy.parameter(0) - 0.5).abs() < 1e-6);
    assert_eq!(proxy.program_names().len(), 4);
    assert_eq!(proxy.latency(), 0);

    proxy.setup_processing(48000.0, 512).unwrap();
    // Queued mutation; flushed with the next block's events.
    proxy.set_parameter(0, 0.25);

    let input = vec![1.0f32; 64];
    let mut left = vec![0.0f32; 64];
    let mut right = vec![0.0f32; 64];
    {
        let inputs: [&[f32]; 2] = [&input, &input];
        let mut outputs: [&mut [f32]; 2] = [&mut left[..], &mut right[..]];
        proxy.process(&inputs, &mut outputs, 64).unwrap();
    }
    assert!(left.iter().all(|s| (s - 0.5).abs() < 1e-5));
    assert!(right.iter().all(|s| (s - 0.5).abs() < 1e-5));
    assert!((proxy.parameter(0) - 0.25).abs() < 1e-6);
}

#[test]
fn presets_roundtrip_with_minimal_diffs() {
    let dir = tempfile::tempdir().unwrap();
    let host = test_host(&dir);
    let proxy = host.load(gain()).unwrap();

    proxy.set_program_name("Warm").unwrap();
    assert_eq!(proxy.fetch_program_name(0).unwrap(), "Warm");
    assert_eq!(proxy.program_name(0).as_deref(), Some("Warm"));

    let preset = proxy.save_program_data().unwrap();
    proxy.set_parameter_text(0, "0.9").unwrap();
    assert!((proxy.parameter(0) - 0.9).abs() < 1e-6);

    // Restoring the preset reports exactly the parameter it moved back.
    assert_eq!(proxy.load_program_data(&preset).unwrap(), 1);
    assert!((proxy.parameter(0) - 0.5).abs() < 1e-6);
    // Loading the same data again moves nothing.
    assert_eq!(proxy.load_program_data(&preset).unwrap(), 0);

    let bank = proxy.save_bank_data().unwrap();
    proxy.set_parameter_text(0, "0.1").unwrap();
    assert_eq!(proxy.load_bank_data(&bank).unwrap(), 1);
    assert!((proxy.parameter(0) - 0.5).abs() < 1e-6);
}

#[test]
fn killed_server_unblocks_callers_and_respawns() {
    let dir = tempfile::tempdir().unwrap();
    let host = test_host(&dir);
    let proxy = host.load(gain()).unwrap();
    let pid = proxy.bridge().server_pid();

    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }

    // A blocking call must fail with a death report, not hang.
    let started = Instant::now();
    match proxy.suspend() {
        Err(BridgeError::ProcessDied) => {}
        other => panic!("expected ProcessDied, got {other:?}"),
    }
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "death took {:?} to surface",
        started.elapsed()
    );
    assert!(!proxy.alive());

    // The one-shot death wake is spent. Later turns must observe the death
    // flag before publishing, not park waiting for a post that cannot come.
    let started = Instant::now();
    match proxy.suspend() {
        Err(BridgeError::ProcessDied) => {}
        other => panic!("expected ProcessDied, got {other:?}"),
    }
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "dead bridge stalled a caller for {:?}",
        started.elapsed()
    );

    // The registry lost the dead bridge; a fresh load spawns a replacement.
    let mut replacement = host.load(gain()).unwrap();
    assert_ne!(replacement.bridge().server_pid(), pid);
    replacement.setup_processing(48000.0, 256).unwrap();

    let input = vec![0.5f32; 32];
    let mut out = vec![0.0f32; 32];
    {
        let inputs: [&[f32]; 1] = [&input];
        let mut outputs: [&mut [f32]; 1] = [&mut out[..]];
        replacement.process(&inputs, &mut outputs, 32).unwrap();
    }
    assert!(out.iter().all(|s| (s - 0.5).abs() < 1e-5));
}

#[test]
fn rt_pool_serves_concurrent_claimants() {
    let dir = tempfile::tempdir().unwrap();
    let host = test_host(&dir);

    let mut proxies = Vec::new();
    for i in 0..4u32 {
        let mut proxy = host
            .load(PluginDescriptor::new("native:gain", format!("Gain{i}")))
            .unwrap();
        proxy.setup_processing(48000.0, 256).unwrap();
        proxy.set_parameter(0, 0.1 + i as f32 * 0.1);
        proxies.push(proxy);
    }
    // Non-sandboxed plugins of one arch share a server.
    let pid = proxies[0].bridge().server_pid();
    assert!(proxies.iter().all(|p| p.bridge().server_pid() == pid));

    // While a claim is held, the next one must land on a different pool slot.
    {
        let bridge = proxies[0].bridge().clone();
        let guards: Vec<_> = (0..4).map(|_| bridge.rt_channel()).collect();
        let mut indices: Vec<_> = guards.iter().map(|g| g.index()).collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 4, "claims piled onto a shared channel");
    }

    let mut claimants = Vec::new();
    for (i, mut proxy) in proxies.into_iter().enumerate() {
        claimants.push(thread::spawn(move || {
            let expected = (0.1 + i as f32 * 0.1) * 2.0;
            let input = vec![1.0f32; 128];
            let mut left = vec![0.0f32; 128];
            let mut right = vec![0.0f32; 128];
            for block in 0..50 {
                {
                    let inputs: [&[f32]; 2] = [&input, &input];
                    let mut outputs: [&mut [f32]; 2] = [&mut left[..], &mut right[..]];
                    proxy.process(&inputs, &mut outputs, 128).unwrap();
                }
                assert!(
                    left.iter().all(|s| (s - expected).abs() < 1e-4),
                    "claimant {i} got wrong audio in block {block}"
                );
            }
        }));
    }
    for claimant in claimants {
        claimant.join().unwrap();
    }
}

struct Recorder {
    automated: Mutex<Vec<(u32, f32)>>,
}

impl UiListener for Recorder {
    fn parameter_automated(&self, index: u32, value: f32) {
        self.automated.lock().push((index, value));
    }
}

#[test]
fn ui_listener_receives_plugin_automation() {
    let dir = tempfile::tempdir().unwrap();
    let host = test_host(&dir);
    let mut proxy = host
        .load(PluginDescriptor::new("native:sine", "Sine"))
        .unwrap();
    proxy.setup_processing(48000.0, 256).unwrap();

    let recorder = Arc::new(Recorder {
        automated: Mutex::new(Vec::new()),
    });
    let weak = Arc::downgrade(&recorder);
    proxy.set_ui_listener(weak);

    // A note-on makes the synth move its own frequency and amplitude.
    proxy.send_midi(MidiEvent::new(0, &[0x90, 69, 100]));
    let mut left = vec![0.0f32; 128];
    let mut right = vec![0.0f32; 128];
    {
        let inputs: [&[f32]; 0] = [];
        let mut outputs: [&mut [f32]; 2] = [&mut left[..], &mut right[..]];
        proxy.process(&inputs, &mut outputs, 128).unwrap();
    }
    assert!(left.iter().any(|s| s.abs() > 0.01));

    // The server publishes the automation on its next tick; poll until the
    // listener has both moves.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        host.poll_ui();
        if recorder.automated.lock().len() >= 2 {
            break;
        }
        assert!(Instant::now() < deadline, "automation never reached the listener");
        thread::sleep(Duration::from_millis(10));
    }
    let automated = recorder.automated.lock();
    assert!(automated.iter().any(|(index, _)| *index == 0));
    assert!(automated.iter().any(|(index, _)| *index == 1));
}

#[test]
fn sandboxed_plugins_get_private_servers() {
    let dir = tempfile::tempdir().unwrap();
    let host = test_host(&dir);

    let shared = host.load(gain()).unwrap();
    let mut sandboxed = host
        .load(PluginDescriptor::new("native:gain", "Isolated").sandboxed(true))
        .unwrap();

    assert_ne!(
        shared.bridge().server_pid(),
        sandboxed.bridge().server_pid()
    );
    assert!(sandboxed.bridge().is_sandboxed());
    assert!(!shared.bridge().is_sandboxed());

    // A sandboxed region has no RT pool; blocks run over the command channel.
    sandboxed.setup_processing(48000.0, 256).unwrap();
    let input = vec![0.25f32; 64];
    let mut out_l = vec![0.0f32; 64];
    let mut out_r = vec![0.0f32; 64];
    {
        let inputs: [&[f32]; 2] = [&input, &input];
        let mut outputs: [&mut [f32]; 2] = [&mut out_l[..], &mut out_r[..]];
        sandboxed.process(&inputs, &mut outputs, 64).unwrap();
    }
    assert!(out_l.iter().all(|s| (s - 0.25).abs() < 1e-6));
}

#[test]
fn probe_cli_reports_and_exits() {
    let dir = tempfile::tempdir().unwrap();
    let bin = env!("CARGO_BIN_EXE_soundproof-host");

    // A probeable unit: exit 0 and an ok envelope.
    let ok_path = dir.path().join("gain.json");
    let status = Command::new(bin)
        .args(["probe", "native:gain", "_"])
        .arg(&ok_path)
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(0));
    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&ok_path).unwrap()).unwrap();
    assert_eq!(report["ok"]["descriptor"]["name"], "Gain");
    assert_eq!(report["ok"]["parameter_count"], 1);
    assert_eq!(report["ok"]["program_count"], 4);

    // A rejected unit: exit 1 and an err envelope naming the failure.
    let err_path = dir.path().join("missing.json");
    let status = Command::new(bin)
        .args(["probe", "native:missing", "_"])
        .arg(&err_path)
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&err_path).unwrap()).unwrap();
    assert_eq!(report["err"]["code"], "plugin");
    assert!(report["err"]["message"]
        .as_str()
        .unwrap()
        .contains("missing"));

    // Bad invocations exit 2 without touching result files.
    let status = Command::new(bin).status().unwrap();
    assert_eq!(status.code(), Some(2));
}
