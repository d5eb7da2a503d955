//! Deterministic port selection with bounded linear probing.
//!
//! The first candidate for a handle is `base + (sha256(handle) mod span)`,
//! unless `INTERP_BRIDGE_PORT_<HANDLE>` names a port explicitly. Candidates
//! are tried in order; a port is skipped if another instance in this process
//! already holds it or if a bind test reports it in use.

use crate::config::{EnvVars, SupervisorConfig};
use crate::error::{BridgeError, Result};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Shared table of ports handed out to running interpreters.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    span: u16,
    max_attempts: u32,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(base: u16, span: u16, max_attempts: u32) -> Self {
        let room = u16::MAX - base;
        Self {
            base,
            span: span.clamp(1, room.max(1)),
            max_attempts: max_attempts.max(1),
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(config.base_port, config.port_span, config.max_port_attempts)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Port derived from the handle alone.
    pub fn derive_port(&self, handle: &str) -> u16 {
        let digest = Sha256::digest(handle.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let offset = u64::from_be_bytes(head) % u64::from(self.span);
        self.base + offset as u16
    }

    /// First candidate for the handle, honoring the environment override.
    pub fn start_port(&self, handle: &str) -> u16 {
        let var = EnvVars::port_override(handle);
        match std::env::var(&var).ok().map(|v| v.trim().parse::<u16>()) {
            Some(Ok(port)) if port > 0 => port,
            Some(_) => {
                warn!("Ignoring invalid {}; deriving port for {}", var, handle);
                self.derive_port(handle)
            }
            None => self.derive_port(handle),
        }
    }

    /// Reserve the first usable port for `handle`.
    pub fn allocate(&self, handle: &str) -> Result<u16> {
        self.probe(handle, 0).map(|(port, _)| port)
    }

    /// Reserve the first usable port at or after candidate `first_attempt`.
    ///
    /// Returns the port and the index of the candidate it came from, so a
    /// caller whose child still failed to bind can continue the probe.
    pub fn probe(&self, handle: &str, first_attempt: u32) -> Result<(u16, u32)> {
        let start = self.start_port(handle);
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);

        for attempt in first_attempt..self.max_attempts {
            let Some(port) = u16::try_from(attempt)
                .ok()
                .and_then(|step| start.checked_add(step))
            else {
                break;
            };
            if reserved.contains(&port) {
                debug!("Port {} already reserved, probing next", port);
                continue;
            }
            match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
                Ok(listener) => {
                    drop(listener);
                    reserved.insert(port);
                    debug!("Allocated port {} for {} (attempt {})", port, handle, attempt + 1);
                    return Ok((port, attempt));
                }
                Err(e) => {
                    debug!("Port {} unavailable for {}: {}", port, handle, e);
                }
            }
        }

        Err(BridgeError::PortExhausted {
            name: handle.to_string(),
            start,
            attempts: self.max_attempts,
        })
    }

    pub fn release(&self, port: u16) {
        if self
            .reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&port)
        {
            debug!("Released port {}", port);
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&port)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_port_is_stable_and_in_range() {
        let ports = PortAllocator::new(20000, 500, 5);
        let a = ports.derive_port("proj@python3");
        assert_eq!(a, ports.derive_port("proj@python3"));
        assert!((20000..20500).contains(&a));
    }

    #[test]
    fn test_distinct_handles_usually_differ() {
        let ports = PortAllocator::new(20000, 1000, 5);
        let derived: HashSet<u16> = (0..20)
            .map(|i| ports.derive_port(&format!("project-{}@python3", i)))
            .collect();
        assert!(derived.len() > 10);
    }

    #[test]
    fn test_env_override_sets_start_port() {
        let handle = "override-test@interp";
        std::env::set_var(EnvVars::port_override(handle), "23456");
        let ports = PortAllocator::new(20000, 1000, 5);
        assert_eq!(ports.start_port(handle), 23456);
        std::env::remove_var(EnvVars::port_override(handle));
    }

    #[test]
    fn test_reserved_ports_are_skipped() {
        let ports = PortAllocator::new(31000, 200, 10);
        let first = ports.allocate("skip@interp").unwrap();
        let second = ports.allocate("skip@interp").unwrap();

        assert_ne!(first, second);
        assert!(second > first);
        assert!(ports.is_reserved(first));

        ports.release(first);
        assert!(!ports.is_reserved(first));
    }

    #[test]
    fn test_exhaustion_when_every_candidate_is_taken() {
        let ports = PortAllocator::new(32000, 200, 2);
        let handle = "exhaust@interp";
        let start = ports.start_port(handle);

        // Hold both candidates: either through our reservation or an open listener.
        let _held: Vec<TcpListener> = (0..2)
            .filter_map(|i| TcpListener::bind((Ipv4Addr::LOCALHOST, start + i)).ok())
            .collect();

        match ports.allocate(handle) {
            Err(BridgeError::PortExhausted {
                name,
                start: reported,
                attempts,
            }) => {
                assert_eq!(name, handle);
                assert_eq!(reported, start);
                assert_eq!(attempts, 2);
            }
            other => panic!("expected PortExhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_span_is_clamped_to_port_range() {
        let ports = PortAllocator::new(65000, 5000, 1);
        assert!(ports.derive_port("anything") >= 65000);
    }
}
