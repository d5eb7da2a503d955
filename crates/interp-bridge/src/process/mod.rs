//! Interpreter process supervision.
//!
//! Launching an interpreter means choosing a port, spawning
//! `[executable, (command), "-u", main_module, port]`, and waiting until the
//! endpoint answers `ping`. A child that exits before it is ready is assumed
//! to have lost the race for its port, and the next candidate is tried.
//!
//! # Example
//!
//! ```rust,no_run
//! use interp_bridge::process::{InterpreterCommand, ProcessSupervisor};
//! use interp_bridge::{Marshaller, SupervisorConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> interp_bridge::Result<()> {
//! let supervisor = ProcessSupervisor::new(SupervisorConfig::from_env());
//! let command = InterpreterCommand::new("python3", "/tmp/bridge_server.py")
//!     .prepend_path("PYTHONPATH", "/opt/project/src");
//!
//! let process = supervisor
//!     .launch("project@python3", &command, Arc::new(Marshaller::default()))
//!     .await?;
//! assert!(process.is_alive().await);
//! process.stop().await;
//! # Ok(())
//! # }
//! ```

mod ports;
mod supervisor;

pub use ports::PortAllocator;
pub use supervisor::{InterpreterProcess, ProcessSupervisor};

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;

/// An additive edit to the child's environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvEdit {
    /// Put `value` in front of the existing path list.
    Prepend { name: String, value: PathBuf },
    /// Put `value` after the existing path list.
    Append { name: String, value: PathBuf },
    /// Set `name` only when neither the parent nor an earlier edit set it.
    SetIfAbsent { name: String, value: String },
}

impl EnvEdit {
    pub fn name(&self) -> &str {
        match self {
            EnvEdit::Prepend { name, .. }
            | EnvEdit::Append { name, .. }
            | EnvEdit::SetIfAbsent { name, .. } => name,
        }
    }
}

/// How to start one interpreter endpoint.
#[derive(Debug, Clone)]
pub struct InterpreterCommand {
    pub executable: PathBuf,
    /// Sub-command placed before the interpreter flags, e.g. `serve`.
    pub command: Option<String>,
    pub main_module: PathBuf,
    pub env: Vec<EnvEdit>,
    pub working_dir: Option<PathBuf>,
}

impl InterpreterCommand {
    pub fn new(executable: impl Into<PathBuf>, main_module: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            command: None,
            main_module: main_module.into(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn prepend_path(mut self, name: impl Into<String>, value: impl Into<PathBuf>) -> Self {
        self.env.push(EnvEdit::Prepend {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn append_path(mut self, name: impl Into<String>, value: impl Into<PathBuf>) -> Self {
        self.env.push(EnvEdit::Append {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn set_if_absent(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(EnvEdit::SetIfAbsent {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Arguments after the executable.
    pub fn args(&self, port: u16) -> Vec<OsString> {
        let mut args = Vec::with_capacity(4);
        if let Some(command) = &self.command {
            args.push(OsString::from(command));
        }
        args.push(OsString::from("-u"));
        args.push(self.main_module.clone().into_os_string());
        args.push(OsString::from(port.to_string()));
        args
    }

    /// Variables to set on the child, computed against `lookup` (the parent env).
    ///
    /// Existing entries are extended, never replaced.
    pub fn resolved_env<F>(&self, lookup: F) -> Vec<(String, OsString)>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let mut overlay: HashMap<String, OsString> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        let current = |overlay: &HashMap<String, OsString>, name: &str| {
            overlay.get(name).cloned().or_else(|| lookup(name))
        };

        for edit in &self.env {
            let name = edit.name().to_string();
            let next = match edit {
                EnvEdit::Prepend { value, .. } | EnvEdit::Append { value, .. } => {
                    let existing: Vec<PathBuf> = current(&overlay, &name)
                        .filter(|v| !v.is_empty())
                        .map(|v| std::env::split_paths(&v).collect())
                        .unwrap_or_default();
                    let mut paths = Vec::with_capacity(existing.len() + 1);
                    if matches!(edit, EnvEdit::Prepend { .. }) {
                        paths.push(value.clone());
                        paths.extend(existing);
                    } else {
                        paths.extend(existing);
                        paths.push(value.clone());
                    }
                    match std::env::join_paths(paths) {
                        Ok(joined) => joined,
                        Err(e) => {
                            tracing::warn!("Skipping {} edit: {}", name, e);
                            continue;
                        }
                    }
                }
                EnvEdit::SetIfAbsent { value, .. } => {
                    if current(&overlay, &name).is_some() {
                        continue;
                    }
                    OsString::from(value)
                }
            };
            if !overlay.contains_key(&name) {
                order.push(name.clone());
            }
            overlay.insert(name, next);
        }

        order
            .into_iter()
            .filter_map(|name| overlay.remove(&name).map(|value| (name, value)))
            .collect()
    }
}
