//! Embedded Python endpoint.
//!
//! The script is compiled into the crate and written to disk on first use,
//! or again when the embedded text changes (detected via hash comparison).
//! Its path is the `main_module` of an [`InterpreterCommand`].

use crate::error::{BridgeError, Result};
use crate::process::InterpreterCommand;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Source of the interpreter-side endpoint.
pub const BRIDGE_SERVER_SCRIPT: &str = include_str!("../python/bridge_server.py");

const SCRIPT_NAME: &str = "bridge_server.py";

/// The deployable endpoint script.
pub struct MainModule;

impl MainModule {
    pub fn source() -> &'static str {
        BRIDGE_SERVER_SCRIPT
    }

    /// Hex SHA-256 of the embedded script.
    pub fn digest() -> String {
        hex::encode(Sha256::digest(BRIDGE_SERVER_SCRIPT.as_bytes()))
    }

    /// Write the script into `dir` unless an identical copy is already there.
    pub fn materialize(dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir).map_err(|e| BridgeError::io_with_path(e, dir))?;

        let script_path = dir.join(SCRIPT_NAME);
        let hash_path = dir.join(format!("{}.hash", SCRIPT_NAME));
        let current_hash = Self::digest();

        if script_path.exists() {
            if let Ok(stored_hash) = std::fs::read_to_string(&hash_path) {
                if stored_hash.trim() == current_hash {
                    debug!("Endpoint script up to date at {}", script_path.display());
                    return Ok(script_path);
                }
            }
        }

        std::fs::write(&script_path, BRIDGE_SERVER_SCRIPT)
            .map_err(|e| BridgeError::io_with_path(e, &script_path))?;
        std::fs::write(&hash_path, &current_hash)
            .map_err(|e| BridgeError::io_with_path(e, &hash_path))?;
        info!("Endpoint script deployed to {}", script_path.display());
        Ok(script_path)
    }

    /// Deploy into `dir` and build the launch command for `python`.
    pub fn command(python: impl Into<PathBuf>, dir: &Path) -> Result<InterpreterCommand> {
        let script = Self::materialize(dir)?;
        Ok(InterpreterCommand::new(python, script))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use tempfile::TempDir;

    #[test]
    fn test_script_agrees_with_protocol_constants() {
        let source = MainModule::source();
        assert!(source.contains(BridgeConfig::READY_LINE_PREFIX));
        assert!(source.contains(&format!(
            "BIND_CONFLICT_EXIT = {}",
            BridgeConfig::BIND_CONFLICT_EXIT_CODE
        )));
        for name in [
            BridgeConfig::PING_HANDLER,
            BridgeConfig::SHUTDOWN_HANDLER,
            BridgeConfig::REGISTER_HANDLER,
            BridgeConfig::EXEC_HANDLER,
            BridgeConfig::LIST_HANDLER,
        ] {
            assert!(source.contains(&format!("\"{}\"", name)), "missing {}", name);
        }
    }

    #[test]
    fn test_materialize_writes_once() {
        let dir = TempDir::new().unwrap();
        let path = MainModule::materialize(dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), BRIDGE_SERVER_SCRIPT);

        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
        let again = MainModule::materialize(dir.path()).unwrap();
        assert_eq!(path, again);
        assert_eq!(std::fs::metadata(&again).unwrap().modified().unwrap(), modified);
    }

    #[test]
    fn test_materialize_replaces_stale_copy() {
        let dir = TempDir::new().unwrap();
        let path = MainModule::materialize(dir.path()).unwrap();
        std::fs::write(&path, "stale").unwrap();
        std::fs::write(dir.path().join("bridge_server.py.hash"), "0000").unwrap();

        MainModule::materialize(dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), BRIDGE_SERVER_SCRIPT);
    }

    #[test]
    fn test_command_points_at_deployed_script() {
        let dir = TempDir::new().unwrap();
        let command = MainModule::command("python3", dir.path()).unwrap();
        assert_eq!(command.main_module, dir.path().join("bridge_server.py"));
        assert_eq!(command.args(5000)[0], "-u");
    }
}
