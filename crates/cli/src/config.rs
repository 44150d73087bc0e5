//! CLI configuration.
//!
//! An optional `ayu.toml` in the working directory sets defaults that
//! command-line flags override:
//!
//! ```toml
//! disasm = true
//! stack_reserve = 262144
//! log_filter = "ayu=debug"
//! ```

use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Dump bytecode before running.
    pub disasm: bool,
    /// Value-stack entries the VM pre-allocates; values below the VM's
    /// built-in floor are raised to it.
    pub stack_reserve: Option<usize>,
    /// Tracing filter used when `RUST_LOG` is unset.
    pub log_filter: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
        toml::from_str(&text).map_err(|e| format!("Invalid config {}: {e}", path.display()))
    }

    /// `ayu.toml` in the current directory, or defaults when absent.
    pub fn discover() -> Result<Config, String> {
        let path = Path::new("ayu.toml");
        if path.exists() {
            Config::load(path)
        } else {
            Ok(Config::default())
        }
    }
}
