//! Host-side bridge configuration.

use crate::descriptor::TargetArch;
use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Base name of the server helper binary.
pub const SERVER_PROGRAM_NAME: &str = "soundproof-host";

/// Tuning knobs for spawned server processes and their shared regions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Directory for region files; `None` picks the platform default.
    pub shm_dir: Option<PathBuf>,
    /// Server binary override; `None` looks next to the current executable.
    pub server_program: Option<PathBuf>,
    /// RT channel pool size for shared servers.
    pub rt_channels: usize,
    pub rt_capacity: u32,
    pub nrt_capacity: u32,
    pub ui_capacity: u32,
    /// Largest block one `Process` turn may carry.
    pub max_block_frames: u32,
    pub watchdog_interval_ms: u64,
    /// How long shutdown waits for a server to exit before killing it.
    pub shutdown_grace_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            shm_dir: None,
            server_program: None,
            rt_channels: 4,
            rt_capacity: 512 * 1024,
            nrt_capacity: 4 * 1024 * 1024,
            ui_capacity: 256 * 1024,
            max_block_frames: 8192,
            watchdog_interval_ms: 100,
            shutdown_grace_ms: 2000,
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rt_channels == 0 {
            return Err(BridgeError::Config(
                "rt_channels must be at least 1".to_string(),
            ));
        }
        // The UI pair plus NRT plus the pool must fit the region's channel table.
        if 3 + self.rt_channels > soundproof_shm::MAX_CHANNELS {
            return Err(BridgeError::Config(format!(
                "rt_channels {} exceeds the limit of {}",
                self.rt_channels,
                soundproof_shm::MAX_CHANNELS - 3
            )));
        }
        if self.max_block_frames < 32 {
            return Err(BridgeError::Config(
                "max_block_frames must be at least 32".to_string(),
            ));
        }
        let min_rt = self.max_block_frames * 4 + 512;
        if self.rt_capacity < min_rt {
            return Err(BridgeError::Config(format!(
                "rt_capacity {} cannot hold one {}-frame channel of samples",
                self.rt_capacity, self.max_block_frames
            )));
        }
        if self.nrt_capacity < 4096 || self.ui_capacity < 4096 {
            return Err(BridgeError::Config(
                "channel capacities must be at least 4 KiB".to_string(),
            ));
        }
        Ok(())
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Directory where region files are created.
    pub fn region_dir(&self) -> PathBuf {
        if let Some(dir) = &self.shm_dir {
            return dir.clone();
        }
        if cfg!(target_os = "linux") {
            let dev_shm = PathBuf::from("/dev/shm");
            if dev_shm.is_dir() {
                return dev_shm;
            }
        }
        std::env::temp_dir()
    }

    /// Absolute path of the server helper for `arch`.
    ///
    /// The native helper uses the bare name; foreign architectures append a
    /// suffix, e.g. `soundproof-host-x86_64`.
    pub fn server_program(&self, arch: TargetArch) -> Result<PathBuf> {
        let base = match &self.server_program {
            Some(path) => path.clone(),
            None => default_server_program()?,
        };
        if arch == TargetArch::current() {
            return Ok(base);
        }
        let mut name = base
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| SERVER_PROGRAM_NAME.into());
        name.push(format!("-{}", arch.suffix()));
        Ok(base.with_file_name(name))
    }
}

/// Helper binary next to the current executable.
///
/// Test and example binaries run from `target/<profile>/deps` and
/// `target/<profile>/examples`, one level below where cargo places the
/// helper, so walk up when the parent is one of those.
fn default_server_program() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let mut dir = exe
        .parent()
        .ok_or_else(|| BridgeError::Config("executable has no parent directory".to_string()))?
        .to_path_buf();
    if dir
        .file_name()
        .map(|n| n == "deps" || n == "examples")
        .unwrap_or(false)
    {
        dir.pop();
    }
    Ok(dir.join(format!(
        "{}{}",
        SERVER_PROGRAM_NAME,
        std::env::consts::EXE_SUFFIX
    )))
}
