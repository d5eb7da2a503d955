//! Per-(project, interpreter) interpreter instances.
//!
//! A [`ServiceCache`] hands out one live [`ServiceInstance`] per key. The
//! first caller for a key launches the interpreter; concurrent callers for
//! the same key wait on that key's launch slot and then share the instance.
//! The cache lock is never held across a launch, so other keys stay usable.

use crate::command::CommandChannel;
use crate::config::SupervisorConfig;
use crate::error::{BridgeError, Result};
use crate::ipc::RpcClient;
use crate::marshal::Marshaller;
use crate::process::{InterpreterCommand, InterpreterProcess, ProcessSupervisor};
use crate::proxy::ProxyFactory;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

/// Identifies one interpreter instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub project: String,
    pub interpreter: String,
}

impl ServiceKey {
    pub fn new(project: impl Into<String>, interpreter: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            interpreter: interpreter.into(),
        }
    }

    /// Handle used for port derivation and logs.
    pub fn handle(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.project, self.interpreter)
    }
}

/// A launched interpreter plus its client.
#[derive(Debug)]
pub struct ServiceInstance {
    key: ServiceKey,
    process: InterpreterProcess,
    commands: CommandChannel,
}

impl ServiceInstance {
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn port(&self) -> u16 {
        self.process.port()
    }

    pub fn client(&self) -> &Arc<RpcClient> {
        self.process.client()
    }

    pub fn process(&self) -> &InterpreterProcess {
        &self.process
    }

    pub fn proxies(&self) -> ProxyFactory {
        ProxyFactory::new(self.client().clone())
    }

    /// Statement channel to this instance. Each command uses its own
    /// connection; every returned channel shares one in-flight counter.
    pub fn commands(&self) -> CommandChannel {
        self.commands.clone()
    }

    pub async fn is_alive(&self) -> bool {
        self.process.is_alive().await
    }

    pub async fn stop(&self) {
        self.process.stop().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.process.is_stopped()
    }
}

/// Launch slot for one key. Empty while the first launch is in progress.
type Slot = Arc<OnceCell<Arc<ServiceInstance>>>;

/// Cache of running interpreter instances keyed by [`ServiceKey`].
pub struct ServiceCache {
    supervisor: ProcessSupervisor,
    config: SupervisorConfig,
    instances: Mutex<HashMap<ServiceKey, Slot>>,
}

impl ServiceCache {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            supervisor: ProcessSupervisor::new(config.clone()),
            config,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Return the instance for `key`, launching it on first use.
    ///
    /// An instance that was stopped is replaced by a fresh launch. If the key
    /// is stopped or the cache cleared while its launch is in progress, the
    /// new instance is stopped and an error returned.
    pub async fn get_or_create(
        &self,
        key: &ServiceKey,
        command: &InterpreterCommand,
    ) -> Result<Arc<ServiceInstance>> {
        let slot = {
            let mut slots = self.instances.lock().await;
            let slot = slots.entry(key.clone()).or_default();
            if slot.get().is_some_and(|instance| instance.is_stopped()) {
                debug!("Replacing stopped instance {}", key);
                *slot = Slot::default();
            }
            slot.clone()
        };

        let mut launched_here = false;
        let launched = slot
            .get_or_try_init(|| {
                launched_here = true;
                self.launch(key, command)
            })
            .await
            .cloned();

        match launched {
            Ok(instance) => {
                if launched_here && !self.holds(key, &slot).await {
                    info!("{} was stopped while launching", key);
                    instance.stop().await;
                    return Err(BridgeError::Other(format!(
                        "{} was stopped while launching",
                        key
                    )));
                }
                Ok(instance)
            }
            Err(e) => {
                let mut slots = self.instances.lock().await;
                if slots
                    .get(key)
                    .is_some_and(|s| Arc::ptr_eq(s, &slot) && !s.initialized())
                {
                    slots.remove(key);
                }
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        key: &ServiceKey,
        command: &InterpreterCommand,
    ) -> Result<Arc<ServiceInstance>> {
        info!("Launching interpreter for {}", key);
        let marshaller = Arc::new(Marshaller::from_config(&self.config));
        let process = self
            .supervisor
            .launch(&key.handle(), command, marshaller)
            .await?;
        let commands =
            CommandChannel::new(process.client().addr(), process.client().marshaller().clone());
        Ok(Arc::new(ServiceInstance {
            key: key.clone(),
            process,
            commands,
        }))
    }

    async fn holds(&self, key: &ServiceKey, slot: &Slot) -> bool {
        self.instances
            .lock()
            .await
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    pub async fn get(&self, key: &ServiceKey) -> Option<Arc<ServiceInstance>> {
        self.instances
            .lock()
            .await
            .get(key)
            .and_then(|slot| slot.get())
            .filter(|instance| !instance.is_stopped())
            .cloned()
    }

    /// Stop and forget the instance for `key`. Returns false if none existed.
    ///
    /// A launch still in progress for `key` is abandoned once it finishes.
    pub async fn stop(&self, key: &ServiceKey) -> bool {
        let removed = self.instances.lock().await.remove(key);
        match removed {
            Some(slot) => {
                if let Some(instance) = slot.get() {
                    instance.stop().await;
                }
                true
            }
            None => false,
        }
    }

    /// Stop every instance.
    pub async fn clear(&self) {
        let drained: Vec<_> = self.instances.lock().await.drain().collect();
        for (key, slot) in drained {
            if let Some(instance) = slot.get() {
                debug!("Stopping {}", key);
                instance.stop().await;
            }
        }
    }

    /// Number of launched instances. Launches in progress are not counted.
    pub async fn len(&self) -> usize {
        self.instances
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn keys(&self) -> Vec<ServiceKey> {
        let mut keys: Vec<_> = self
            .instances
            .lock()
            .await
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl Default for ServiceCache {
    fn default() -> Self {
        Self::new(SupervisorConfig::from_env())
    }
}

impl fmt::Debug for ServiceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_key_display_and_handle() {
        let key = ServiceKey::new("analysis", "python3");
        assert_eq!(key.to_string(), "analysis@python3");
        assert_eq!(key.handle(), "analysis@python3");
    }

    #[tokio::test]
    async fn test_empty_cache_operations() {
        let cache = ServiceCache::new(SupervisorConfig::default());
        let key = ServiceKey::new("p", "i");

        assert!(cache.is_empty().await);
        assert!(cache.get(&key).await.is_none());
        assert!(!cache.stop(&key).await);
        cache.clear().await;
        assert!(cache.keys().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_slow_launch_does_not_block_other_keys() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("hang.sh");
        std::fs::write(&script, "sleep 10\n").unwrap();
        let cache = Arc::new(ServiceCache::new(
            SupervisorConfig::default()
                .with_base_port(34500)
                .with_ready_timeout(Duration::from_secs(2))
                .with_spill_dir(dir.path().join("spill")),
        ));

        let hung = ServiceKey::new("hung", "sh");
        let launching = {
            let cache = cache.clone();
            let command = InterpreterCommand::new("/bin/sh", &script);
            tokio::spawn(async move { cache.get_or_create(&hung, &command).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let other = ServiceKey::new("other", "sh");
        let quick = tokio::time::timeout(Duration::from_millis(500), async {
            (
                cache.len().await,
                cache.get(&other).await.is_none(),
                cache.stop(&other).await,
            )
        })
        .await
        .expect("cache stayed locked during a launch");
        assert_eq!(quick, (0, true, false));

        let missing = InterpreterCommand::new("/nonexistent/interp", "main.py");
        let failed = tokio::time::timeout(
            Duration::from_millis(500),
            cache.get_or_create(&other, &missing),
        )
        .await
        .expect("launch for another key waited on the hung one");
        assert!(failed.is_err());

        let err = launching.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::NotReady { .. }));
        assert!(cache.is_empty().await);
        assert!(cache.instances.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_launch_is_not_cached() {
        let cache = ServiceCache::new(SupervisorConfig::default().with_base_port(34000));
        let key = ServiceKey::new("broken", "none");
        let command = InterpreterCommand::new("/nonexistent/interp", "main.py");

        assert!(cache.get_or_create(&key, &command).await.is_err());
        assert!(cache.is_empty().await);
    }
}
