//! Backend plugin capabilities.
//!
//! The engine never looks inside a simulator, error model or runtime. Each
//! is a [`Plugin`]: a native library plus the ordered arguments it is
//! initialised with. Workers load the library; the engine only forwards
//! paths, arguments and seeds.
//!
//! Before spawning anything the engine checks that each library file looks
//! like a native shared object for some platform, so that a wrong path
//! surfaces as a readable runtime failure instead of a worker crash.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Role a plugin plays in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginRole {
    Simulator,
    Runtime,
    ErrorModel,
}

impl PluginRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginRole::Simulator => "simulator",
            PluginRole::Runtime => "runtime",
            PluginRole::ErrorModel => "error model",
        }
    }
}

impl fmt::Display for PluginRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A native backend component.
pub trait Plugin: Send + Sync + fmt::Debug {
    /// Path of the native library for this platform.
    fn library_file(&self) -> &Path;

    /// Ordered initialisation arguments.
    fn init_args(&self) -> Vec<String>;

    /// Base random seed. Workers derive the per-shot seed as `seed + shot_id`.
    fn random_seed(&self) -> Option<u64> {
        None
    }
}

/// A plugin described directly by its library path and arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativePlugin {
    pub library_file: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl NativePlugin {
    pub fn new(library_file: impl Into<PathBuf>) -> Self {
        Self {
            library_file: library_file.into(),
            args: Vec::new(),
            seed: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn into_arc(self) -> Arc<dyn Plugin> {
        Arc::new(self)
    }
}

impl Plugin for NativePlugin {
    fn library_file(&self) -> &Path {
        &self.library_file
    }

    fn init_args(&self) -> Vec<String> {
        self.args.clone()
    }

    fn random_seed(&self) -> Option<u64> {
        self.seed
    }
}

/// The three plugins of a run.
#[derive(Debug, Clone)]
pub struct PluginSet {
    pub simulator: Arc<dyn Plugin>,
    pub runtime: Arc<dyn Plugin>,
    pub error_model: Arc<dyn Plugin>,
}

impl PluginSet {
    pub fn new(
        simulator: Arc<dyn Plugin>,
        runtime: Arc<dyn Plugin>,
        error_model: Arc<dyn Plugin>,
    ) -> Self {
        Self {
            simulator,
            runtime,
            error_model,
        }
    }

    /// Plugins in load order, with their roles.
    pub fn iter(&self) -> impl Iterator<Item = (PluginRole, &Arc<dyn Plugin>)> {
        [
            (PluginRole::Simulator, &self.simulator),
            (PluginRole::Runtime, &self.runtime),
            (PluginRole::ErrorModel, &self.error_model),
        ]
        .into_iter()
    }

    /// Check every library file. Returns a diagnostic for the first one
    /// that cannot be loaded.
    pub fn check_libraries(&self) -> Result<(), String> {
        for (role, plugin) in self.iter() {
            check_native_library(plugin.library_file()).map_err(|reason| {
                format!(
                    "Failed to load {role} plugin from '{}': {reason}",
                    plugin.library_file().display()
                )
            })?;
        }
        Ok(())
    }
}

/// File-header magic numbers of native libraries.
const NATIVE_MAGIC: &[&[u8]] = &[
    b"\x7fELF",         // ELF
    b"\xfe\xed\xfa\xce", // Mach-O 32
    b"\xce\xfa\xed\xfe", // Mach-O 32, little endian
    b"\xfe\xed\xfa\xcf", // Mach-O 64
    b"\xcf\xfa\xed\xfe", // Mach-O 64, little endian
    b"\xca\xfe\xba\xbe", // Mach-O universal
    b"MZ",               // PE/COFF
];

/// Check that `path` exists and starts with a native-library header.
pub fn check_native_library(path: &Path) -> Result<(), String> {
    let mut header = [0u8; 4];
    let mut file = std::fs::File::open(path).map_err(|e| e.to_string())?;
    let n = file.read(&mut header).map_err(|e| e.to_string())?;
    let header = &header[..n];
    if NATIVE_MAGIC.iter().any(|magic| header.starts_with(magic)) {
        Ok(())
    } else {
        Err("not a valid native library (unrecognised file header)".into())
    }
}
