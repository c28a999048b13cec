//! In-process server tests.
//!
//! These build a region by hand and drive it exactly the way the host side
//! does, with the server loop running on a thread in the same process so
//! failures show up as plain test panics instead of a dead child.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use soundproof_bridge::descriptor::{PluginDescriptor, PluginId};
use soundproof_bridge::wire::{
    samples_as_bytes, samples_as_bytes_mut, EngineEvent, ErrorCode, MidiEvent, ProcessEvent,
    ProcessEventVec, Reply, Request, UiMessage,
};
use soundproof_server::Server;
use soundproof_shm::{ChannelKind, ReadOutcome, SharedRegion, ShmChannel};

const UI_C2S: usize = 0;
const UI_S2C: usize = 1;
const NRT: usize = 2;
const RT_0: usize = 3;

fn build_region(path: &Path) -> SharedRegion {
    SharedRegion::builder()
        .add_channel(ChannelKind::Queue, 16 * 1024, "ui-c2s")
        .unwrap()
        .add_channel(ChannelKind::Queue, 16 * 1024, "ui-s2c")
        .unwrap()
        .add_channel(ChannelKind::Request, 64 * 1024, "nrt")
        .unwrap()
        .add_channel(ChannelKind::Request, 64 * 1024, "rt-0")
        .unwrap()
        .create(path)
        .unwrap()
}

struct ServerFixture {
    _dir: tempfile::TempDir,
    region: SharedRegion,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerFixture {
    fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        let region = build_region(&path);
        let mut server = Server::attach(&path).unwrap();
        let thread = thread::spawn(move || server.run().unwrap());
        Self {
            _dir: dir,
            region,
            thread: Some(thread),
        }
    }

    fn channel(&self, index: usize) -> ShmChannel {
        self.region.channel_handle(index).unwrap()
    }

    /// Quit over NRT and join the server thread.
    fn stop(mut self) {
        let mut nrt = self.channel(NRT);
        assert!(matches!(transact(&mut nrt, &Request::Quit), Reply::Ok));
        self.thread.take().unwrap().join().unwrap();
    }
}

/// One host-side request turn: publish, wait, read the reply back.
fn transact(chan: &mut ShmChannel, request: &Request) -> Reply {
    let ticket = chan.reply_ticket();
    chan.clear();
    assert!(chan.write(&bincode::serialize(request).unwrap()));
    chan.signal();
    chan.wait_reply(ticket);
    let mut buf = Vec::new();
    assert!(chan.read_vec(&mut buf), "reply signal with empty channel");
    bincode::deserialize(&buf).unwrap()
}

fn create_gain(nrt: &mut ShmChannel) -> PluginId {
    let descriptor = PluginDescriptor::new("native:gain", "Gain");
    match transact(
        nrt,
        &Request::CreatePlugin {
            descriptor: Box::new(descriptor),
        },
    ) {
        Reply::Created {
            plugin,
            params,
            program_names,
            ..
        } => {
            assert_eq!(params, vec![0.5]);
            assert_eq!(program_names.len(), 4);
            plugin
        }
        other => panic!("expected Created, got {other:?}"),
    }
}

/// Run one block through an RT channel and return the reply events plus the
/// deinterleaved output channels.
fn process_block(
    chan: &mut ShmChannel,
    plugin: PluginId,
    frames: u32,
    input: &[f32],
    inputs: u32,
    outputs: u32,
    events: &[ProcessEvent],
) -> (Vec<EngineEvent>, Vec<Vec<f32>>) {
    assert!(inputs == 0 || input.len() == frames as usize);
    let mut event_vec = ProcessEventVec::new();
    event_vec.extend(events.iter().cloned());
    let request = Request::Process {
        plugin,
        frames,
        inputs,
        outputs,
        events: event_vec,
    };

    let ticket = chan.reply_ticket();
    chan.clear();
    assert!(chan.write(&bincode::serialize(&request).unwrap()));
    for _ in 0..inputs {
        assert!(chan.write(samples_as_bytes(input)));
    }
    chan.signal();
    chan.wait_reply(ticket);

    let mut buf = Vec::new();
    assert!(chan.read_vec(&mut buf));
    match bincode::deserialize::<Reply>(&buf).unwrap() {
        Reply::Processed {
            frames: reply_frames,
            outputs: reply_outputs,
            events,
            ..
        } => {
            assert_eq!(reply_frames, frames);
            assert_eq!(reply_outputs, outputs);
            let mut out = vec![vec![0.0f32; frames as usize]; outputs as usize];
            for channel in out.iter_mut() {
                let got = chan.read_into(samples_as_bytes_mut(channel));
                assert_eq!(got, ReadOutcome::Read(frames as usize * 4));
            }
            (events, out)
        }
        other => panic!("expected Processed, got {other:?}"),
    }
}

/// Poll until `check` yields a value or the deadline passes.
fn within<T>(deadline: Duration, mut check: impl FnMut() -> Option<T>) -> T {
    let start = Instant::now();
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(start.elapsed() < deadline, "timed out waiting for condition");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn quit_stops_the_server() {
    ServerFixture::start().stop();
}

#[test]
fn create_process_destroy_roundtrip() {
    let fx = ServerFixture::start();
    let mut nrt = fx.channel(NRT);
    let plugin = create_gain(&mut nrt);

    // Default value 0.5 maps to unity gain.
    let mut rt = fx.channel(RT_0);
    let input = vec![0.25f32; 32];
    let (events, out) = process_block(&mut rt, plugin, 32, &input, 2, 2, &[]);
    assert!(events.is_empty());
    assert_eq!(out.len(), 2);
    assert!(out[0].iter().all(|s| (s - 0.25).abs() < 1e-6));
    assert!(out[1].iter().all(|s| (s - 0.25).abs() < 1e-6));

    assert!(matches!(
        transact(&mut nrt, &Request::DestroyPlugin { plugin }),
        Reply::Ok
    ));

    // The id is gone; further commands must say so rather than hang.
    match transact(&mut nrt, &Request::Suspend { plugin }) {
        Reply::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownPlugin),
        other => panic!("expected UnknownPlugin error, got {other:?}"),
    }

    fx.stop();
}

#[test]
fn create_unknown_unit_reports_plugin_error() {
    let fx = ServerFixture::start();
    let mut nrt = fx.channel(NRT);
    let reply = transact(
        &mut nrt,
        &Request::CreatePlugin {
            descriptor: Box::new(PluginDescriptor::new("native:missing", "Missing")),
        },
    );
    match reply {
        Reply::Error { code, message } => {
            assert_eq!(code, ErrorCode::Plugin);
            assert!(message.contains("missing"), "message: {message}");
        }
        other => panic!("expected Plugin error, got {other:?}"),
    }
    fx.stop();
}

#[test]
fn every_request_gets_exactly_one_reply() {
    let fx = ServerFixture::start();
    let mut nrt = fx.channel(NRT);
    let plugin = create_gain(&mut nrt);

    for turn in 0..10 {
        let request = if turn % 2 == 0 {
            Request::Suspend { plugin }
        } else {
            Request::Resume { plugin }
        };
        let posted = nrt.reply_ticket();
        assert!(matches!(transact(&mut nrt, &request), Reply::Ok));
        // The reply we just consumed was the whole turn: one post, no residue.
        assert_eq!(nrt.reply_ticket(), posted + 1, "extra posts in turn {turn}");
        assert!(nrt.is_empty(), "residue after turn {turn}");
    }

    fx.stop();
}

#[test]
fn reply_waits_intact_for_a_slow_host() {
    let fx = ServerFixture::start();
    let mut nrt = fx.channel(NRT);
    let plugin = create_gain(&mut nrt);

    // A host that is paged out between the reply wake and the read must still
    // find its reply: untouched in the ring, with the reply sequence moved
    // exactly once for the turn.
    for turn in 0..3 {
        let request = if turn % 2 == 0 {
            Request::Suspend { plugin }
        } else {
            Request::Resume { plugin }
        };
        let ticket = nrt.reply_ticket();
        nrt.clear();
        assert!(nrt.write(&bincode::serialize(&request).unwrap()));
        nrt.signal();
        nrt.wait_reply(ticket);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(nrt.reply_ticket(), ticket + 1, "extra posts in turn {turn}");
        assert!(!nrt.is_empty(), "reply vanished in turn {turn}");

        let mut buf = Vec::new();
        assert!(nrt.read_vec(&mut buf));
        assert!(matches!(
            bincode::deserialize::<Reply>(&buf).unwrap(),
            Reply::Ok
        ));
        assert!(nrt.is_empty(), "residue after turn {turn}");
    }

    fx.stop();
}

#[test]
fn undecodable_request_gets_protocol_error() {
    let fx = ServerFixture::start();
    let mut nrt = fx.channel(NRT);

    let ticket = nrt.reply_ticket();
    nrt.clear();
    assert!(nrt.write(b"\xde\xad\xbe\xef"));
    nrt.signal();
    nrt.wait_reply(ticket);

    let mut buf = Vec::new();
    assert!(nrt.read_vec(&mut buf));
    match bincode::deserialize::<Reply>(&buf).unwrap() {
        Reply::Error { code, .. } => assert_eq!(code, ErrorCode::Protocol),
        other => panic!("expected Protocol error, got {other:?}"),
    }
    assert!(nrt.is_empty());

    // The channel still serves normal turns afterwards.
    let plugin = create_gain(&mut nrt);
    assert!(matches!(
        transact(&mut nrt, &Request::DestroyPlugin { plugin }),
        Reply::Ok
    ));
    fx.stop();
}

#[test]
fn ui_edits_apply_between_blocks() {
    let fx = ServerFixture::start();
    let mut nrt = fx.channel(NRT);
    let plugin = create_gain(&mut nrt);

    let mut ui = fx.channel(UI_C2S);
    let edit = UiMessage::SetParamValue {
        plugin,
        index: 0,
        value: 0.9,
    };
    assert!(ui.write(&bincode::serialize(&edit).unwrap()));

    // The main loop drains UI edits on its tick; once applied, the next block
    // both scales by the new amplitude and echoes the value back.
    let mut rt = fx.channel(RT_0);
    let input = vec![0.5f32; 64];
    let out = within(Duration::from_secs(2), || {
        let (events, out) = process_block(&mut rt, plugin, 64, &input, 2, 2, &[]);
        let echoed = events.iter().any(|event| {
            matches!(event, EngineEvent::ParamValue { index: 0, value } if (value - 0.9).abs() < 1e-6)
        });
        echoed.then_some(out)
    });
    assert!(out[0].iter().all(|s| (s - 0.9).abs() < 1e-5));

    fx.stop();
}

#[test]
fn plugin_automation_reaches_the_ui_queue() {
    let fx = ServerFixture::start();
    let mut nrt = fx.channel(NRT);
    let plugin = match transact(
        &mut nrt,
        &Request::CreatePlugin {
            descriptor: Box::new(PluginDescriptor::new("native:sine", "Sine")),
        },
    ) {
        Reply::Created { plugin, .. } => plugin,
        other => panic!("expected Created, got {other:?}"),
    };

    // A note-on moves the oscillator's own frequency and amplitude parameters.
    let mut rt = fx.channel(RT_0);
    let note_on = ProcessEvent::Midi {
        event: MidiEvent::new(0, &[0x90, 69, 100]),
    };
    let (events, out) = process_block(&mut rt, plugin, 128, &[], 0, 2, &[note_on]);
    let automated = events
        .iter()
        .filter(|event| matches!(event, EngineEvent::ParamAutomated { .. }))
        .count();
    assert_eq!(automated, 2);
    assert!(out[0].iter().any(|s| s.abs() > 0.01));

    // The same automation shows up on the server-to-client queue for editors.
    let mut s2c = fx.channel(UI_S2C);
    let mut seen = Vec::new();
    within(Duration::from_secs(2), || {
        let mut buf = Vec::new();
        while s2c.read_vec(&mut buf) {
            match bincode::deserialize::<UiMessage>(&buf).unwrap() {
                UiMessage::Event {
                    plugin: from,
                    event: EngineEvent::ParamAutomated { index, value },
                } => {
                    assert_eq!(from, plugin);
                    seen.push((index, value));
                }
                other => panic!("unexpected UI message {other:?}"),
            }
        }
        (seen.len() >= 2).then_some(())
    });

    fx.stop();
}
