//! Plugin identity: what to load, where it runs, and how the server names it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-allocated identifier for one plugin instance.
///
/// Ids are unique within a single server process and are never reused while
/// that process lives, so a stale id after a crash can only miss, not alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginId(u32);

impl PluginId {
    pub fn new(raw: u32) -> Self {
        PluginId(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CPU architecture a plugin binary was built for.
///
/// A plugin whose architecture differs from the host is served by a helper
/// binary of the matching architecture, one server process per architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetArch {
    X86,
    X86_64,
    Aarch64,
    Arm,
}

impl TargetArch {
    /// The architecture this host was compiled for.
    pub fn current() -> Self {
        if cfg!(target_arch = "x86_64") {
            TargetArch::X86_64
        } else if cfg!(target_arch = "x86") {
            TargetArch::X86
        } else if cfg!(target_arch = "aarch64") {
            TargetArch::Aarch64
        } else {
            TargetArch::Arm
        }
    }

    /// Suffix used to name the helper binary for this architecture.
    pub fn suffix(&self) -> &'static str {
        match self {
            TargetArch::X86 => "x86",
            TargetArch::X86_64 => "x86_64",
            TargetArch::Aarch64 => "aarch64",
            TargetArch::Arm => "arm",
        }
    }
}

impl Default for TargetArch {
    fn default() -> Self {
        TargetArch::current()
    }
}

impl fmt::Display for TargetArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Everything the server needs to locate and instantiate a plugin.
///
/// `path` uses the loader's scheme: a filesystem path for binary plugins, or
/// `native:<name>` for the built-in units. `unique_id` disambiguates shell
/// binaries that contain several plugins; pass 0 to take the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub unique_id: i32,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub version: String,
    #[serde(default = "default_io")]
    pub audio_inputs: u32,
    #[serde(default = "default_io")]
    pub audio_outputs: u32,
    #[serde(default)]
    pub is_synth: bool,
    #[serde(default)]
    pub wants_midi: bool,
    /// Run in a private server process instead of the per-architecture shared one.
    #[serde(default)]
    pub sandboxed: bool,
    #[serde(default)]
    pub arch: TargetArch,
}

fn default_io() -> u32 {
    2
}

impl PluginDescriptor {
    pub fn new(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            unique_id: 0,
            vendor: String::new(),
            version: String::new(),
            audio_inputs: 2,
            audio_outputs: 2,
            is_synth: false,
            wants_midi: false,
            sandboxed: false,
            arch: TargetArch::current(),
        }
    }

    pub fn unique_id(mut self, unique_id: i32) -> Self {
        self.unique_id = unique_id;
        self
    }

    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn audio_io(mut self, inputs: u32, outputs: u32) -> Self {
        self.audio_inputs = inputs;
        self.audio_outputs = outputs;
        self
    }

    pub fn synth(mut self, is_synth: bool) -> Self {
        self.is_synth = is_synth;
        self.wants_midi = self.wants_midi || is_synth;
        self
    }

    pub fn midi(mut self, wants_midi: bool) -> Self {
        self.wants_midi = wants_midi;
        self
    }

    pub fn sandboxed(mut self, sandboxed: bool) -> Self {
        self.sandboxed = sandboxed;
        self
    }

    pub fn arch(mut self, arch: TargetArch) -> Self {
        self.arch = arch;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_builder() {
        let desc = PluginDescriptor::new("/usr/lib/vst/comp.so", "Comp")
            .unique_id(0x436f6d70)
            .vendor("Example Audio")
            .audio_io(2, 2)
            .synth(false);

        assert_eq!(desc.path, "/usr/lib/vst/comp.so");
        assert_eq!(desc.name, "Comp");
        assert_eq!(desc.unique_id, 0x436f6d70);
        assert_eq!(desc.audio_inputs, 2);
        assert!(!desc.is_synth);
        assert!(!desc.sandboxed);
    }

    #[test]
    fn test_synth_implies_midi() {
        let desc = PluginDescriptor::new("native:sine", "Sine").synth(true);
        assert!(desc.is_synth);
        assert!(desc.wants_midi);
    }

    #[test]
    fn test_descriptor_defaults_from_partial_json() {
        // Older hosts may serialize only the identity fields.
        let json = r#"{"path": "native:gain", "name": "Gain"}"#;
        let desc: PluginDescriptor = serde_json::from_str(json).unwrap();

        assert_eq!(desc.path, "native:gain");
        assert_eq!(desc.unique_id, 0);
        assert_eq!(desc.audio_inputs, 2);
        assert_eq!(desc.audio_outputs, 2);
        assert_eq!(desc.arch, TargetArch::current());
        assert!(!desc.sandboxed);
    }

    #[test]
    fn test_plugin_id_display() {
        assert_eq!(PluginId::new(7).to_string(), "7");
        assert_eq!(PluginId::new(7).raw(), 7);
    }

    #[test]
    fn test_target_arch_roundtrip() {
        let arch = TargetArch::current();
        let json = serde_json::to_string(&arch).unwrap();
        let back: TargetArch = serde_json::from_str(&json).unwrap();
        assert_eq!(arch, back);
    }
}
