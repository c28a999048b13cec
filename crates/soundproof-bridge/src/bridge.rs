//! One spawned server process and the shared region connecting to it.

use crate::config::BridgeConfig;
use crate::descriptor::{PluginId, TargetArch};
use crate::error::{BridgeError, Result};
use crate::wire::{self, EngineEvent, MidiEvent, Reply, Request, UiMessage};
use parking_lot::{Mutex, MutexGuard};
use soundproof_shm::{ChannelKind, SharedRegion, ShmChannel};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Channel indices fixed by the region layout, identical on both ends.
pub const UI_TO_SERVER_INDEX: usize = 0;
pub const UI_TO_HOST_INDEX: usize = 1;
pub const NRT_INDEX: usize = 2;
/// First RT pool channel of a shared region. Sandboxed regions have no pool;
/// their RT traffic runs through the nrt channel.
pub const RT_BASE_INDEX: usize = 3;

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(0);

/// Receiver for plugin-originated events, dispatched during [`Bridge::poll_ui`].
///
/// Implementations are held weakly; dropping the listener is unregistration.
pub trait UiListener: Send + Sync {
    fn parameter_automated(&self, index: u32, value: f32);
    fn latency_changed(&self, _samples: u32) {}
    fn program_changed(&self, _program: i32) {}
    fn midi_output(&self, _event: &MidiEvent) {}
    fn sysex_output(&self, _data: &[u8]) {}
}

/// Exclusive lease on one request channel of a region.
pub struct ChannelGuard<'a> {
    guard: MutexGuard<'a, ShmChannel>,
    index: usize,
}

impl ChannelGuard<'_> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Deref for ChannelGuard<'_> {
    type Target = ShmChannel;

    fn deref(&self) -> &ShmChannel {
        &self.guard
    }
}

impl DerefMut for ChannelGuard<'_> {
    fn deref_mut(&mut self) -> &mut ShmChannel {
        &mut self.guard
    }
}

/// Host-side handle to one server process.
///
/// A bridge owns the region file, the child process, and the host end of
/// every channel. All methods are callable from any thread; the RT path is
/// [`Bridge::rt_channel`] plus [`Bridge::transact`], which never take a
/// blocking lock.
pub struct Bridge {
    arch: TargetArch,
    sandboxed: bool,
    region: SharedRegion,
    child: Mutex<Child>,
    alive: AtomicBool,
    nrt: Mutex<ShmChannel>,
    rt_pool: Vec<Mutex<ShmChannel>>,
    rt_cursor: AtomicUsize,
    ui_tx: Mutex<ShmChannel>,
    ui_rx: Mutex<ShmChannel>,
    /// Unlocked clones used to force-wake request waiters on process death.
    /// Waiters hold the channel mutexes, so waking must not lock.
    wake_handles: Vec<ShmChannel>,
    ui_clients: Mutex<HashMap<PluginId, Weak<dyn UiListener>>>,
    config: BridgeConfig,
}

impl Bridge {
    pub(crate) fn spawn_shared(arch: TargetArch, config: &BridgeConfig) -> Result<Arc<Bridge>> {
        Self::spawn(arch, false, config)
    }

    pub(crate) fn spawn_sandboxed(arch: TargetArch, config: &BridgeConfig) -> Result<Arc<Bridge>> {
        Self::spawn(arch, true, config)
    }

    fn spawn(arch: TargetArch, sandboxed: bool, config: &BridgeConfig) -> Result<Arc<Bridge>> {
        let path = region_path(config, arch);

        let mut builder = SharedRegion::builder()
            .add_channel(ChannelKind::Queue, config.ui_capacity, "ui-c2s")?
            .add_channel(ChannelKind::Queue, config.ui_capacity, "ui-s2c")?
            .add_channel(ChannelKind::Request, config.nrt_capacity, "nrt")?;
        let rt_count = if sandboxed { 0 } else { config.rt_channels };
        for i in 0..rt_count {
            builder = builder.add_channel(ChannelKind::Request, config.rt_capacity, &format!("rt-{i}"))?;
        }
        let region = builder.create(&path)?;

        // The child holds the read end of its stdin; when this process goes
        // away the pipe closes and the server treats EOF as host death.
        let program = config.server_program(arch)?;
        let child = Command::new(&program)
            .arg("bridge")
            .arg(std::process::id().to_string())
            .arg(&path)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|source| BridgeError::Spawn { program, source })?;
        tracing::info!(
            %arch,
            pid = child.id(),
            region = %path.display(),
            sandboxed,
            "spawned plugin server"
        );

        let ui_tx = channel_at(&region, UI_TO_SERVER_INDEX)?;
        let ui_rx = channel_at(&region, UI_TO_HOST_INDEX)?;
        let nrt = channel_at(&region, NRT_INDEX)?;
        let mut rt_pool = Vec::with_capacity(rt_count);
        let mut wake_handles = vec![nrt.clone()];
        for i in 0..rt_count {
            let chan = channel_at(&region, RT_BASE_INDEX + i)?;
            wake_handles.push(chan.clone());
            rt_pool.push(Mutex::new(chan));
        }

        Ok(Arc::new(Bridge {
            arch,
            sandboxed,
            region,
            child: Mutex::new(child),
            alive: AtomicBool::new(true),
            nrt: Mutex::new(nrt),
            rt_pool,
            rt_cursor: AtomicUsize::new(0),
            ui_tx: Mutex::new(ui_tx),
            ui_rx: Mutex::new(ui_rx),
            wake_handles,
            ui_clients: Mutex::new(HashMap::new()),
            config: config.clone(),
        }))
    }

    pub fn arch(&self) -> TargetArch {
        self.arch
    }

    pub fn is_sandboxed(&self) -> bool {
        self.sandboxed
    }

    pub fn region_path(&self) -> &Path {
        self.region.path()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// OS pid of the server process.
    pub fn server_pid(&self) -> u32 {
        self.child.lock().id()
    }

    /// Poll the child process, force-waking request waiters if it exited.
    ///
    /// Returns true while the server lives. The watchdog calls this on its
    /// cadence; it is safe to call from anywhere except the audio thread.
    pub fn check_status(&self) -> bool {
        if !self.alive() {
            return false;
        }
        let status = match self.child.lock().try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return true,
            Err(e) => {
                tracing::warn!(error = %e, "could not poll server process");
                return true;
            }
        };
        self.mark_dead(&status.to_string());
        false
    }

    fn mark_dead(&self, reason: &str) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::warn!(arch = %self.arch, reason, "plugin server died; waking blocked callers");
        // Flag first, posts second. Requesters order a reply ticket before
        // their liveness check, so each one either holds a ticket these
        // one-shot posts move past or observes the flag before publishing.
        for chan in &self.wake_handles {
            chan.signal_reply();
        }
    }

    /// Claim an RT channel without ever parking the calling thread.
    ///
    /// Spins over the pool with try-locks until one frees up. Concurrent
    /// callers start at successive pool slots, so up to pool-size threads
    /// acquire distinct channels on their first lap.
    pub fn rt_channel(&self) -> ChannelGuard<'_> {
        if self.rt_pool.is_empty() {
            return ChannelGuard {
                guard: self.nrt.lock(),
                index: NRT_INDEX,
            };
        }
        let lap = self.rt_pool.len();
        let start = self.rt_cursor.fetch_add(1, Ordering::Relaxed);
        let mut spins = 0u32;
        loop {
            for i in 0..lap {
                let index = (start + i) % lap;
                if let Some(guard) = self.rt_pool[index].try_lock() {
                    return ChannelGuard {
                        guard,
                        index: RT_BASE_INDEX + index,
                    };
                }
            }
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
    }

    /// Claim the NRT channel, waiting behind other control-path callers.
    pub fn nrt_channel(&self) -> ChannelGuard<'_> {
        ChannelGuard {
            guard: self.nrt.lock(),
            index: NRT_INDEX,
        }
    }

    /// One call/reply turn on the NRT channel.
    pub fn call(&self, request: &Request) -> Result<Reply> {
        let mut chan = self.nrt_channel();
        self.transact(&mut chan, request)
    }

    /// One call/reply turn on an already-claimed channel.
    ///
    /// The reply ticket is taken before the request is published, so a reply
    /// posted between our write and our wait is never missed. It also comes
    /// before the liveness check: `mark_dead` stores the death flag and only
    /// then force-posts once, so a post the ticket absorbed implies the check
    /// fails here, and a post after the ticket wakes the wait.
    pub fn transact(&self, chan: &mut ShmChannel, request: &Request) -> Result<Reply> {
        let bytes = wire::encode_bounded(request, chan.capacity())?;
        let ticket = chan.reply_ticket();
        if !self.alive() {
            return Err(BridgeError::ProcessDied);
        }
        chan.clear();
        if !chan.write(&bytes) {
            return Err(BridgeError::Protocol(
                "request did not fit a cleared channel".to_string(),
            ));
        }
        chan.signal();
        chan.wait_reply(ticket);
        self.read_reply(chan)
    }

    /// Decode the reply on a channel whose reply primitive fired.
    ///
    /// An empty channel after a wake means the server died mid-request and
    /// the watchdog posted the primitive for us.
    pub(crate) fn read_reply(&self, chan: &mut ShmChannel) -> Result<Reply> {
        let mut scratch = Vec::new();
        match chan.read_message(&mut scratch) {
            Some(bytes) => match wire::decode::<Reply>(bytes)? {
                Reply::Error { code, message } => Err(BridgeError::from_wire(code, message)),
                reply => Ok(reply),
            },
            None => {
                if self.alive() {
                    Err(BridgeError::Protocol(
                        "reply signal with empty channel".to_string(),
                    ))
                } else {
                    Err(BridgeError::ProcessDied)
                }
            }
        }
    }

    /// Queue a message on the server's UI lane.
    ///
    /// Best-effort: a full queue drops the message with a warning rather than
    /// stall the caller.
    pub fn post_ui(&self, message: &UiMessage) -> Result<()> {
        if !self.alive() {
            return Err(BridgeError::ProcessDied);
        }
        let mut chan = self.ui_tx.lock();
        let bytes = wire::encode_bounded(message, chan.capacity())?;
        if chan.write(&bytes) {
            chan.signal();
        } else {
            tracing::warn!("ui queue full, dropping message");
        }
        Ok(())
    }

    /// Register a listener for one plugin's UI events.
    pub fn add_ui_client(&self, plugin: PluginId, listener: Weak<dyn UiListener>) {
        self.ui_clients.lock().insert(plugin, listener);
    }

    pub fn remove_ui_client(&self, plugin: PluginId) {
        self.ui_clients.lock().remove(&plugin);
    }

    /// Drain the server → host UI queue, dispatching to registered listeners
    /// on the calling thread. Run this from the UI thread on a timer.
    pub fn poll_ui(&self) {
        let mut chan = self.ui_rx.lock();
        let mut buf = Vec::new();
        while chan.read_vec(&mut buf) {
            match wire::decode::<UiMessage>(&buf) {
                Ok(UiMessage::Event { plugin, event }) => {
                    // Upgrade under the lock, dispatch outside it.
                    let listener = self.ui_clients.lock().get(&plugin).and_then(Weak::upgrade);
                    match listener {
                        Some(listener) => dispatch_ui_event(&*listener, &event),
                        None => tracing::debug!(%plugin, "ui event for absent listener dropped"),
                    }
                }
                Ok(_) => {
                    tracing::debug!("host-bound ui queue carried a client message, ignoring")
                }
                Err(e) => tracing::warn!(error = %e, "skipping undecodable ui message"),
            }
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if self.alive.load(Ordering::Acquire) {
            // Ask politely first so plugins get their teardown callbacks.
            if let Ok(bytes) = wire::encode(&Request::Quit) {
                let chan = self.nrt.get_mut();
                chan.clear();
                if chan.write(&bytes) {
                    chan.signal();
                }
            }
            let deadline = Instant::now() + self.config.shutdown_grace();
            let child = self.child.get_mut();
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        tracing::debug!(arch = %self.arch, %status, "plugin server exited");
                        break;
                    }
                    Ok(None) => {
                        if Instant::now() >= deadline {
                            tracing::warn!(arch = %self.arch, "plugin server ignored quit, killing");
                            let _ = child.kill();
                            let _ = child.wait();
                            break;
                        }
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                }
            }
        } else {
            let _ = self.child.get_mut().wait();
        }
    }
}

fn dispatch_ui_event(listener: &dyn UiListener, event: &EngineEvent) {
    match event {
        EngineEvent::ParamValue { index, value }
        | EngineEvent::ParamAutomated { index, value } => {
            listener.parameter_automated(*index, *value)
        }
        EngineEvent::LatencyChanged { samples } => listener.latency_changed(*samples),
        EngineEvent::ProgramChanged { program } => listener.program_changed(*program),
        EngineEvent::Midi { event } => listener.midi_output(event),
        EngineEvent::Sysex { data } => listener.sysex_output(data),
    }
}

fn channel_at(region: &SharedRegion, index: usize) -> Result<ShmChannel> {
    region
        .channel_handle(index)
        .ok_or_else(|| BridgeError::Protocol(format!("region has no channel {index}")))
}

fn region_path(config: &BridgeConfig, arch: TargetArch) -> PathBuf {
    let id = NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed);
    config.region_dir().join(format!(
        "soundproof-{}-{}-{}.shm",
        std::process::id(),
        arch.suffix(),
        id
    ))
}
