//! Runtime configuration types.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::vm::{DEFAULT_CODE_HEAP_SIZE, DEFAULT_STACK_SIZE, MIN_CODE_HEAP_SIZE};

/// Name of the optional configuration file read by [`RuntimeConfig::load`].
pub const CONFIG_FILE: &str = "zeta.toml";

/// Runtime configuration for the VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Code heap capacity in bytes
    pub code_heap_size: usize,
    /// Value stack capacity in slots
    pub stack_size: usize,
    /// Print every compiled block to stderr
    pub trace_compile: bool,
    /// Export called by `zeta run` when none is given
    pub entry_export: String,
    /// Directories searched for `<name>.json` packages by `import`
    pub import_paths: Vec<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            code_heap_size: DEFAULT_CODE_HEAP_SIZE,
            stack_size: DEFAULT_STACK_SIZE,
            trace_compile: false,
            entry_export: "main".to_string(),
            import_paths: Vec::new(),
        }
    }
}

/// Layout of `zeta.toml`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    runtime: RuntimeConfig,
}

impl RuntimeConfig {
    /// Load configuration from `zeta.toml` in `dir`, falling back to the
    /// defaults when the file does not exist. Relative import paths are
    /// taken relative to `dir`.
    pub fn load(dir: &Path) -> Result<Self, String> {
        let path = dir.join(CONFIG_FILE);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| format!("failed to read {}: {}", CONFIG_FILE, e))?;
        let mut config = Self::parse(&content)?;
        for import_path in &mut config.import_paths {
            if import_path.is_relative() {
                *import_path = dir.join(&*import_path);
            }
        }
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| format!("failed to parse {}: {}", CONFIG_FILE, e))?;
        file.runtime.validate()?;
        Ok(file.runtime)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.stack_size == 0 || self.stack_size > u32::MAX as usize {
            return Err(format!("invalid stack_size {}", self.stack_size));
        }
        if self.code_heap_size < MIN_CODE_HEAP_SIZE || self.code_heap_size > u32::MAX as usize {
            return Err(format!(
                "invalid code_heap_size {} (at least {} bytes)",
                self.code_heap_size, MIN_CODE_HEAP_SIZE
            ));
        }
        if self.entry_export.is_empty() {
            return Err("entry_export must not be empty".to_string());
        }
        Ok(())
    }
}
