//! The server side of the bridge: attach to a region, serve its channels.
//!
//! One worker thread serves each request channel. Plugin creation and
//! destruction are handed off to the main thread through a rendezvous, since
//! plugin frameworks expect lifecycle calls from one thread; the main thread
//! also drains the inbound UI queue and publishes outbound UI events.
//!
//! Every request turn is answered by exactly one reply, every error included;
//! panics out of plugin code are caught at the dispatch point and answered
//! like any other plugin failure.

use std::collections::HashMap;
use std::io::{self, Read};
use std::panic;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, never, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, ServerError};
use crate::handle::PluginHandle;
use crate::native;
use soundproof_bridge::descriptor::{PluginDescriptor, PluginId};
use soundproof_bridge::wire::{EngineEvent, Reply, Request, UiMessage};
use soundproof_bridge::{NRT_INDEX, UI_TO_HOST_INDEX, UI_TO_SERVER_INDEX};
use soundproof_shm::{ChannelKind, SharedRegion, ShmChannel};

/// Work the main thread performs on behalf of a worker.
enum MainCommand {
    Create {
        descriptor: Box<PluginDescriptor>,
        reply: Sender<Result<Reply>>,
    },
    Destroy {
        plugin: PluginId,
        reply: Sender<Result<Reply>>,
    },
    Quit,
}

/// State shared between the main thread and the channel workers.
struct ServerShared {
    plugins: RwLock<HashMap<PluginId, Arc<Mutex<PluginHandle>>>>,
    main_tx: Sender<MainCommand>,
    ui_out: Sender<(PluginId, EngineEvent)>,
    running: AtomicBool,
    /// Unlocked channel clones used only to wake parked workers on shutdown.
    wake_channels: Vec<ShmChannel>,
}

impl ServerShared {
    fn plugin(&self, id: PluginId) -> Result<Arc<Mutex<PluginHandle>>> {
        self.plugins
            .read()
            .get(&id)
            .cloned()
            .ok_or(ServerError::UnknownPlugin(id))
    }

    /// Hand one command to the main thread and block for its result.
    fn run_on_main(
        &self,
        make: impl FnOnce(Sender<Result<Reply>>) -> MainCommand,
    ) -> Result<Reply> {
        let (tx, rx) = bounded(1);
        self.main_tx
            .send(make(tx))
            .map_err(|_| ServerError::Protocol("main thread is gone".to_string()))?;
        rx.recv()
            .map_err(|_| ServerError::Protocol("main thread is gone".to_string()))?
    }

    /// Idempotent: the first caller stops the loops and wakes every worker.
    fn begin_shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            for chan in &self.wake_channels {
                chan.signal();
            }
            let _ = self.main_tx.send(MainCommand::Quit);
        }
    }
}

pub struct Server {
    region: SharedRegion,
    shared: Arc<ServerShared>,
    main_rx: Receiver<MainCommand>,
    ui_out_rx: Receiver<(PluginId, EngineEvent)>,
    ui_rx: ShmChannel,
    ui_tx: ShmChannel,
    workers: Vec<JoinHandle<()>>,
    next_id: u32,
}

impl Server {
    /// Attach to the region a bridge created at `path` and start one worker
    /// per request channel. The caller then drives [`run`](Self::run).
    pub fn attach(path: &Path) -> Result<Self> {
        let region = SharedRegion::connect(path)?;
        validate_region(&region)?;

        let ui_rx = region
            .channel_handle(UI_TO_SERVER_INDEX)
            .ok_or_else(|| ServerError::Protocol("missing host-to-server ui channel".to_string()))?;
        let ui_tx = region
            .channel_handle(UI_TO_HOST_INDEX)
            .ok_or_else(|| ServerError::Protocol("missing server-to-host ui channel".to_string()))?;

        let (main_tx, main_rx) = unbounded();
        let (ui_out, ui_out_rx) = unbounded();
        let wake_channels: Vec<ShmChannel> = (NRT_INDEX..region.channel_count())
            .filter_map(|i| region.channel_handle(i))
            .collect();
        let shared = Arc::new(ServerShared {
            plugins: RwLock::new(HashMap::new()),
            main_tx,
            ui_out,
            running: AtomicBool::new(true),
            wake_channels,
        });

        let mut workers = Vec::new();
        for index in NRT_INDEX..region.channel_count() {
            let chan = region
                .channel_handle(index)
                .ok_or_else(|| ServerError::Protocol(format!("missing channel {index}")))?;
            let shared = Arc::clone(&shared);
            let worker = thread::Builder::new()
                .name(format!("soundproof-ch{index}"))
                .spawn(move || worker_loop(shared, chan, index))?;
            workers.push(worker);
        }

        tracing::info!(
            path = %path.display(),
            channels = region.channel_count(),
            "attached to shared region"
        );
        Ok(Self {
            region,
            shared,
            main_rx,
            ui_out_rx,
            ui_rx,
            ui_tx,
            workers,
            next_id: 1,
        })
    }

    /// Watch stdin for EOF, which means the host process is gone.
    pub fn spawn_parent_watch(&self, parent_pid: u32) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("soundproof-parent".to_string())
            .spawn(move || {
                let mut stdin = io::stdin();
                let mut buf = [0u8; 64];
                loop {
                    match stdin.read(&mut buf) {
                        Ok(0) => {
                            tracing::info!(parent = parent_pid, "host closed stdin, shutting down");
                            shared.begin_shutdown();
                            break;
                        }
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            tracing::warn!(error = %e, "stdin watch failed, shutting down");
                            shared.begin_shutdown();
                            break;
                        }
                    }
                }
            })?;
        Ok(())
    }

    /// Main-thread loop: lifecycle rendezvous, UI traffic, shutdown. Returns
    /// once a `Quit` request, parent death, or main-channel loss stops it.
    pub fn run(&mut self) -> Result<()> {
        tracing::info!(path = %self.region.path().display(), "server running");
        loop {
            match self.main_rx.recv_timeout(Duration::from_millis(10)) {
                Ok(MainCommand::Create { descriptor, reply }) => {
                    let result = self.create_plugin(*descriptor);
                    let _ = reply.send(result);
                }
                Ok(MainCommand::Destroy { plugin, reply }) => {
                    let result = self.destroy_plugin(plugin);
                    let _ = reply.send(result);
                }
                Ok(MainCommand::Quit) => break,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if !self.shared.running.load(Ordering::Acquire) {
                break;
            }
            self.drain_ui();
            self.publish_ui();
        }
        self.shutdown();
        Ok(())
    }

    fn create_plugin(&mut self, descriptor: PluginDescriptor) -> Result<Reply> {
        let instance = native::instantiate(&descriptor)?;
        let id = PluginId::new(self.next_id);
        self.next_id += 1;
        let handle = PluginHandle::new(id, descriptor, instance);
        tracing::info!(plugin = %id, name = handle.name(), "created plugin");
        let reply = handle.created_reply();
        self.shared
            .plugins
            .write()
            .insert(id, Arc::new(Mutex::new(handle)));
        Ok(reply)
    }

    fn destroy_plugin(&mut self, plugin: PluginId) -> Result<Reply> {
        match self.shared.plugins.write().remove(&plugin) {
            Some(_handle) => {
                tracing::info!(plugin = %plugin, "destroyed plugin");
                Ok(Reply::Ok)
            }
            None => Err(ServerError::UnknownPlugin(plugin)),
        }
    }

    /// Apply edits arriving from editor windows. Best-effort: unknown plugins
    /// and undecodable messages are skipped, never answered.
    fn drain_ui(&mut self) {
        let mut buf = Vec::new();
        while self.ui_rx.read_vec(&mut buf) {
            match bincode::deserialize::<UiMessage>(&buf) {
                Ok(UiMessage::SetParamValue {
                    plugin,
                    index,
                    value,
                }) => match self.shared.plugin(plugin) {
                    Ok(handle) => handle.lock().apply_ui_parameter(index, value),
                    Err(_) => tracing::debug!(plugin = %plugin, "ui edit for unknown plugin"),
                },
                Ok(UiMessage::SetProgram { plugin, program }) => {
                    match self.shared.plugin(plugin) {
                        Ok(handle) => handle.lock().apply_ui_program(program),
                        Err(_) => tracing::debug!(plugin = %plugin, "ui edit for unknown plugin"),
                    }
                }
                Ok(UiMessage::Event { plugin, .. }) => {
                    tracing::debug!(plugin = %plugin, "ignoring event on the host-to-server ui queue")
                }
                Err(e) => tracing::warn!(error = %e, "skipping undecodable ui message"),
            }
        }
    }

    /// Forward events the workers collected to the host's UI queue.
    fn publish_ui(&mut self) {
        while let Ok((plugin, event)) = self.ui_out_rx.try_recv() {
            match bincode::serialize(&UiMessage::Event { plugin, event }) {
                Ok(bytes) => {
                    if !self.ui_tx.write(&bytes) {
                        tracing::debug!(plugin = %plugin, "ui queue full, dropping event");
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to encode ui event"),
            }
        }
    }

    fn shutdown(&mut self) {
        self.shared.begin_shutdown();
        // Closing the command queue fails any worker still blocked in a
        // lifecycle rendezvous, so the joins below cannot deadlock.
        drop(std::mem::replace(&mut self.main_rx, never()));
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!("worker thread panicked");
            }
        }
        // Instances drop here, on the main thread.
        self.shared.plugins.write().clear();
        tracing::info!("server stopped");
    }
}

fn validate_region(region: &SharedRegion) -> Result<()> {
    if region.channel_count() < 3 {
        return Err(ServerError::Protocol(format!(
            "region has {} channels, need at least 3",
            region.channel_count()
        )));
    }
    for (index, chan) in region.channels().iter().enumerate() {
        let expect = if index < NRT_INDEX {
            ChannelKind::Queue
        } else {
            ChannelKind::Request
        };
        if chan.kind() != expect {
            return Err(ServerError::Protocol(format!(
                "channel {index} is {:?}, expected {:?}",
                chan.kind(),
                expect
            )));
        }
    }
    Ok(())
}

fn worker_loop(shared: Arc<ServerShared>, mut chan: ShmChannel, index: usize) {
    tracing::debug!(channel = index, name = chan.name(), "worker started");
    let mut scratch = Vec::new();
    // One turn per data post, keyed on the sequence word rather than ring
    // occupancy: after a turn our own reply sits in the ring until the host
    // reads it. Sequence words start at zero in a fresh region, so a request
    // published before this thread came up is already past `served`.
    let mut served: u32 = 0;
    while shared.running.load(Ordering::Acquire) {
        let ticket = chan.data_ticket();
        if ticket == served {
            chan.wait(served);
            continue;
        }
        served = ticket;
        if chan.is_empty() {
            // Woken without a request: a shutdown signal, caught above.
            continue;
        }
        serve_turn(&shared, &mut chan, &mut scratch);
    }
    tracing::debug!(channel = index, "worker stopped");
}

/// Serve one request turn. Posts exactly one reply signal on every path.
fn serve_turn(shared: &ServerShared, chan: &mut ShmChannel, scratch: &mut Vec<u8>) {
    let decoded = match chan.read_message(scratch) {
        None => return,
        Some(bytes) => bincode::deserialize::<Request>(bytes),
    };
    let request = match decoded {
        Ok(request) => request,
        Err(e) => {
            chan.clear();
            write_error_reply(chan, &ServerError::from(e));
            chan.signal_reply();
            return;
        }
    };

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        dispatch_request(shared, chan, request)
    }))
    .unwrap_or_else(|_| Err(ServerError::Plugin("plugin code panicked".to_string())));

    match outcome {
        Ok(ui) => {
            chan.signal_reply();
            if let Some((plugin, events)) = ui {
                for event in events {
                    let _ = shared.ui_out.send((plugin, event));
                }
            }
        }
        Err(e) => {
            // Drop any residue of the failed turn before answering.
            chan.clear();
            write_error_reply(chan, &e);
            chan.signal_reply();
        }
    }
}

type UiBatch = Option<(PluginId, Vec<EngineEvent>)>;

/// Execute one request and write its success reply. Never signals; on error
/// the caller clears the turn and answers instead.
fn dispatch_request(
    shared: &ServerShared,
    chan: &mut ShmChannel,
    request: Request,
) -> Result<UiBatch> {
    match request {
        Request::CreatePlugin { descriptor } => {
            let reply = shared.run_on_main(|tx| MainCommand::Create {
                descriptor,
                reply: tx,
            })?;
            write_reply(chan, &reply)?;
            Ok(None)
        }
        Request::DestroyPlugin { plugin } => {
            let reply = shared.run_on_main(|tx| MainCommand::Destroy { plugin, reply: tx })?;
            write_reply(chan, &reply)?;
            Ok(None)
        }
        Request::Quit => {
            write_reply(chan, &Reply::Ok)?;
            tracing::info!("quit requested");
            shared.begin_shutdown();
            Ok(None)
        }
        Request::Process {
            plugin,
            frames,
            inputs,
            outputs,
            events,
        } => {
            let handle = shared.plugin(plugin)?;
            let mut handle = handle.lock();
            let ui = handle.run_block(chan, frames, inputs, outputs, &events)?;
            Ok(if ui.is_empty() {
                None
            } else {
                Some((plugin, ui))
            })
        }
        other => {
            let Some(plugin) = other.plugin() else {
                return Err(ServerError::Protocol("unroutable request".to_string()));
            };
            let handle = shared.plugin(plugin)?;
            let reply = handle.lock().dispatch(&other)?;
            write_reply(chan, &reply)?;
            Ok(None)
        }
    }
}

fn write_reply(chan: &mut ShmChannel, reply: &Reply) -> Result<()> {
    let bytes = bincode::serialize(reply)?;
    if !chan.write(&bytes) {
        return Err(ServerError::Protocol(format!(
            "reply does not fit channel '{}'",
            chan.name()
        )));
    }
    Ok(())
}

fn write_error_reply(chan: &mut ShmChannel, error: &ServerError) {
    tracing::debug!(error = %error, code = %error.code(), "answering with error");
    match bincode::serialize(&error.to_reply()) {
        Ok(bytes) => {
            if !chan.write(&bytes) {
                tracing::error!("error reply does not fit its channel");
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to encode error reply"),
    }
}
