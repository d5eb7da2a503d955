//! Centralized configuration for the bridge.
//!
//! Constant tables hold protocol limits and default timeouts. `SupervisorConfig`
//! carries the runtime knobs a caller may tune per cache.

use std::path::PathBuf;
use std::time::Duration;

/// Protocol limits and default timing.
pub struct BridgeConfig;

impl BridgeConfig {
    /// Numeric element count above which arrays are spilled to files.
    pub const INLINE_THRESHOLD: usize = 1024;

    // Framing
    pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024; // 64MB
    pub const MAX_CONNECTIONS: usize = 64;

    // Client timeouts
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(2);

    // Supervision
    pub const READY_TIMEOUT: Duration = Duration::from_secs(30);
    pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
    pub const KILL_TIMEOUT: Duration = Duration::from_secs(1);
    pub const STDERR_TAIL_LINES: usize = 20;
    /// Exit status the endpoint uses when its port is already bound.
    pub const BIND_CONFLICT_EXIT_CODE: i32 = 98;
    /// Line the endpoint prints once it is listening.
    pub const READY_LINE_PREFIX: &'static str = "BRIDGE_READY port=";

    // Port allocation
    pub const DEFAULT_BASE_PORT: u16 = 18750;
    pub const PORT_SPAN: u16 = 1000;
    pub const MAX_PORT_ATTEMPTS: u32 = 20;

    /// Subdirectory of the system temp dir used for spill files.
    pub const SPILL_DIR_NAME: &'static str = "interp-bridge";
    pub const SPILL_FILE_PREFIX: &'static str = "bridge-";
    pub const SPILL_FILE_SUFFIX: &'static str = ".npy";

    // Reserved handler names
    pub const PING_HANDLER: &'static str = "ping";
    pub const SHUTDOWN_HANDLER: &'static str = "shutdown";
    pub const REGISTER_HANDLER: &'static str = "__register__";
    pub const EXEC_HANDLER: &'static str = "__exec__";
    pub const LIST_HANDLER: &'static str = "__handlers__";
}

/// Environment variable names shared with the interpreter side.
pub struct EnvVars;

impl EnvVars {
    pub const BASE_PORT: &'static str = "INTERP_BRIDGE_BASE_PORT";
    pub const PORT_PREFIX: &'static str = "INTERP_BRIDGE_PORT_";
    pub const INLINE_THRESHOLD: &'static str = "BRIDGE_INLINE_THRESHOLD";
    pub const SPILL_DIR: &'static str = "BRIDGE_SPILL_DIR";
    pub const REGISTRATION_POLICY: &'static str = "BRIDGE_REGISTRATION_POLICY";
    /// Module search path extended before spawning the interpreter.
    pub const SEARCH_PATH: &'static str = "PYTHONPATH";

    /// Per-handle port override variable, e.g. `INTERP_BRIDGE_PORT_MY_PROJECT_PY3`.
    pub fn port_override(handle: &str) -> String {
        let suffix: String = handle
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", Self::PORT_PREFIX, suffix)
    }
}

/// Runtime configuration for process supervision and marshalling.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub base_port: u16,
    pub port_span: u16,
    pub max_port_attempts: u32,
    pub ready_timeout: Duration,
    pub shutdown_grace: Duration,
    pub kill_timeout: Duration,
    pub liveness_timeout: Duration,
    /// Per-call timeout for `request()`. `None` blocks until the response arrives.
    pub call_timeout: Option<Duration>,
    pub inline_threshold: usize,
    pub spill_dir: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_port: BridgeConfig::DEFAULT_BASE_PORT,
            port_span: BridgeConfig::PORT_SPAN,
            max_port_attempts: BridgeConfig::MAX_PORT_ATTEMPTS,
            ready_timeout: BridgeConfig::READY_TIMEOUT,
            shutdown_grace: BridgeConfig::SHUTDOWN_GRACE,
            kill_timeout: BridgeConfig::KILL_TIMEOUT,
            liveness_timeout: BridgeConfig::LIVENESS_TIMEOUT,
            call_timeout: None,
            inline_threshold: BridgeConfig::INLINE_THRESHOLD,
            spill_dir: std::env::temp_dir().join(BridgeConfig::SPILL_DIR_NAME),
        }
    }
}

impl SupervisorConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(port) = env_parse::<u16>(EnvVars::BASE_PORT) {
            config.base_port = port;
        }
        if let Some(threshold) = env_parse::<usize>(EnvVars::INLINE_THRESHOLD) {
            config.inline_threshold = threshold;
        }
        if let Ok(dir) = std::env::var(EnvVars::SPILL_DIR) {
            if !dir.is_empty() {
                config.spill_dir = PathBuf::from(dir);
            }
        }
        config
    }

    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    pub fn with_port_span(mut self, span: u16) -> Self {
        self.port_span = span.max(1);
        self
    }

    pub fn with_max_port_attempts(mut self, attempts: u32) -> Self {
        self.max_port_attempts = attempts.max(1);
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_inline_threshold(mut self, threshold: usize) -> Self {
        self.inline_threshold = threshold;
        self
    }

    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = dir.into();
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_override_name_is_sanitized() {
        assert_eq!(
            EnvVars::port_override("my-project@python3.11"),
            "INTERP_BRIDGE_PORT_MY_PROJECT_PYTHON3_11"
        );
    }

    #[test]
    fn test_defaults_are_reasonable() {
        let config = SupervisorConfig::default();
        assert!(config.port_span > 0);
        assert!(config.max_port_attempts > 0);
        assert!(config.shutdown_grace > Duration::ZERO);
        assert!(config.call_timeout.is_none());
        assert!(config.spill_dir.ends_with(BridgeConfig::SPILL_DIR_NAME));
    }

    #[test]
    fn test_builder_clamps_zero_span() {
        let config = SupervisorConfig::default()
            .with_port_span(0)
            .with_max_port_attempts(0);
        assert_eq!(config.port_span, 1);
        assert_eq!(config.max_port_attempts, 1);
    }
}
