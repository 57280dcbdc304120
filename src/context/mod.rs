//! Device context snapshots.
//!
//! Every agent registers a [`ContextStateProvider`]. A snapshot asks each one
//! for its current state and assembles `{ "<namespace>": state, ... }`, which
//! recognition events carry so the dialog service knows what the device is
//! doing. A provider that misses its deadline is left out of the snapshot.

use crate::executor::{lock, Scheduler};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

pub trait ContextStateProvider: Send + Sync {
    fn namespace(&self) -> String;

    /// Current state, or `None` when it could not be produced in `timeout`.
    fn provide_state(&self, timeout: Duration) -> Option<Value>;
}

pub struct ContextManager {
    providers: Mutex<Vec<Arc<dyn ContextStateProvider>>>,
    provider_timeout: Duration,
    scheduler: Arc<Scheduler>,
}

impl ContextManager {
    pub fn new(scheduler: Arc<Scheduler>, provider_timeout: Duration) -> Self {
        Self {
            providers: Mutex::new(Vec::new()),
            provider_timeout,
            scheduler,
        }
    }

    /// Registers a provider, replacing any earlier one for the same namespace.
    pub fn add_provider(&self, provider: Arc<dyn ContextStateProvider>) {
        let namespace = provider.namespace();
        let mut providers = lock(&self.providers);
        providers.retain(|p| p.namespace() != namespace);
        providers.push(provider);
    }

    pub fn remove_provider(&self, namespace: &str) -> bool {
        let mut providers = lock(&self.providers);
        let before = providers.len();
        providers.retain(|p| p.namespace() != namespace);
        providers.len() != before
    }

    /// Builds a snapshot on the calling thread.
    ///
    /// Agents must not call this from their own executor; use
    /// [`ContextManager::get_context`] there.
    pub fn snapshot(&self) -> Value {
        let providers = lock(&self.providers).clone();
        let mut context = Map::new();
        for provider in providers {
            let namespace = provider.namespace();
            match provider.provide_state(self.provider_timeout) {
                Some(state) => {
                    context.insert(namespace, state);
                }
                None => warn!(namespace = namespace.as_str(), "context provider missed its deadline"),
            }
        }
        debug!(entries = context.len(), "context snapshot built");
        Value::Object(context)
    }

    /// Builds a snapshot on the scheduler's blocking pool and hands it to
    /// `callback`.
    pub fn get_context<F>(self: &Arc<Self>, callback: F)
    where
        F: FnOnce(Value) + Send + 'static,
    {
        let manager = self.clone();
        self.scheduler.spawn_blocking(move || callback(manager.snapshot()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc::channel;
    use std::thread;

    fn new_manager() -> ContextManager {
        let scheduler = Arc::new(Scheduler::new("test-context").unwrap());
        ContextManager::new(scheduler, Duration::from_millis(50))
    }

    struct Fixed(&'static str, Option<Value>);

    impl ContextStateProvider for Fixed {
        fn namespace(&self) -> String {
            self.0.to_string()
        }

        fn provide_state(&self, _timeout: Duration) -> Option<Value> {
            self.1.clone()
        }
    }

    #[test]
    fn test_snapshot_skips_silent_providers() {
        let manager = new_manager();
        manager.add_provider(Arc::new(Fixed("TTS", Some(json!({"state": "IDLE"})))));
        manager.add_provider(Arc::new(Fixed("ASR", None)));
        assert_eq!(manager.snapshot(), json!({"TTS": {"state": "IDLE"}}));
    }

    #[test]
    fn test_provider_replaced_by_namespace() {
        let manager = new_manager();
        manager.add_provider(Arc::new(Fixed("TTS", Some(json!(1)))));
        manager.add_provider(Arc::new(Fixed("TTS", Some(json!(2)))));
        assert_eq!(manager.snapshot(), json!({"TTS": 2}));
        assert!(manager.remove_provider("TTS"));
        assert!(!manager.remove_provider("TTS"));
        assert_eq!(manager.snapshot(), json!({}));
    }

    #[test]
    fn test_get_context_runs_off_thread() {
        let manager = Arc::new(new_manager());
        manager.add_provider(Arc::new(Fixed("ASR", Some(json!({"state": "IDLE"})))));
        let (tx, rx) = channel();
        let caller = thread::current().id();
        manager.get_context(move |context| {
            let _ = tx.send((thread::current().id(), context));
        });
        let (worker, context) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_ne!(worker, caller);
        assert_eq!(context["ASR"]["state"], "IDLE");
    }
}
