//! Directive lifecycle tracking.
//!
//! Each agent keeps one [`DirectiveRegistry`] mapping the `message_id` of every
//! in-flight directive to its [`DirectiveHandle`]. A handle resolves exactly
//! once: the first of complete/fail/cancel wins, detaches the handle from the
//! registry and only then reports to the sink. Everything after that is a
//! no-op, which is what makes racing completion paths safe.

use crate::directive::{Directive, DirectiveResultSink};
use crate::executor::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Pending,
    Handling,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl HandleState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HandleState::Completed | HandleState::Failed | HandleState::Cancelled
        )
    }

    fn is_open(self) -> bool {
        matches!(self, HandleState::Pending | HandleState::Handling)
    }
}

type Entries = Mutex<HashMap<String, DirectiveHandle>>;

struct HandleInner {
    directive: Arc<Directive>,
    state: Mutex<HandleState>,
    sink: Arc<dyn DirectiveResultSink>,
    registry: Weak<Entries>,
}

/// One in-flight directive.
#[derive(Clone)]
pub struct DirectiveHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for DirectiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectiveHandle")
            .field("message_id", &self.message_id())
            .field("state", &self.state())
            .finish()
    }
}

impl DirectiveHandle {
    pub fn directive(&self) -> &Directive {
        &self.inner.directive
    }

    pub fn message_id(&self) -> &str {
        self.inner.directive.message_id()
    }

    pub fn dialog_request_id(&self) -> &str {
        self.inner.directive.dialog_request_id()
    }

    pub fn state(&self) -> HandleState {
        *lock(&self.inner.state)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.state(),
            HandleState::Cancelling | HandleState::Cancelled
        )
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn same_as(&self, other: &DirectiveHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Marks the directive as completed. Returns `false` if it had already
    /// been resolved or cancelled.
    pub fn set_completed(&self) -> bool {
        if !self.resolve(HandleState::Completed) {
            return false;
        }
        debug!(message_id = self.message_id(), "directive completed");
        self.inner.sink.on_completed(&self.inner.directive);
        true
    }

    /// Marks the directive as failed. Returns `false` if it had already been
    /// resolved or cancelled.
    pub fn set_failed(&self, description: &str) -> bool {
        if !self.resolve(HandleState::Failed) {
            return false;
        }
        debug!(
            message_id = self.message_id(),
            description, "directive failed"
        );
        self.inner.sink.on_failed(&self.inner.directive, description);
        true
    }

    fn resolve(&self, to: HandleState) -> bool {
        {
            let mut state = lock(&self.inner.state);
            if !state.is_open() {
                return false;
            }
            *state = to;
        }
        self.detach();
        true
    }

    fn begin_handling(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if *state != HandleState::Pending {
            return false;
        }
        *state = HandleState::Handling;
        true
    }

    fn begin_cancel(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if !state.is_open() {
            return false;
        }
        *state = HandleState::Cancelling;
        true
    }

    fn finish_cancel(&self) {
        *lock(&self.inner.state) = HandleState::Cancelled;
        self.inner.sink.on_cancelled(&self.inner.directive);
    }

    fn detach(&self) {
        if let Some(entries) = self.inner.registry.upgrade() {
            let mut entries = lock(&entries);
            let ours = entries
                .get(self.message_id())
                .map(|h| h.same_as(self))
                .unwrap_or(false);
            if ours {
                entries.remove(self.message_id());
            }
        }
    }
}

/// Per-agent registry of in-flight directives keyed by `message_id`.
pub struct DirectiveRegistry {
    entries: Arc<Entries>,
}

impl Default for DirectiveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectiveRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts tracking a directive. Returns `None` when a directive with the
    /// same `message_id` is already in flight.
    pub fn pre_handle(
        &self,
        directive: Directive,
        sink: Arc<dyn DirectiveResultSink>,
    ) -> Option<DirectiveHandle> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(directive.message_id()) {
            debug!(
                message_id = directive.message_id(),
                "duplicate directive ignored"
            );
            return None;
        }
        let handle = DirectiveHandle {
            inner: Arc::new(HandleInner {
                directive: Arc::new(directive),
                state: Mutex::new(HandleState::Pending),
                sink,
                registry: Arc::downgrade(&self.entries),
            }),
        };
        entries.insert(handle.message_id().to_string(), handle.clone());
        Some(handle)
    }

    /// Moves a pre-handled directive into handling. `None` when the directive
    /// is unknown, already cancelled/finished, or already being handled.
    pub fn handle(&self, message_id: &str) -> Option<DirectiveHandle> {
        let handle = self.get(message_id)?;
        if handle.begin_handling() {
            Some(handle)
        } else {
            None
        }
    }

    pub fn get(&self, message_id: &str) -> Option<DirectiveHandle> {
        lock(&self.entries).get(message_id).cloned()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        lock(&self.entries).contains_key(message_id)
    }

    /// Cancels a directive: removes it, runs `hook` exactly once, then reports
    /// the cancellation. Returns `false` if there was nothing to cancel.
    pub fn cancel<F>(&self, message_id: &str, hook: F) -> bool
    where
        F: FnOnce(&DirectiveHandle),
    {
        let removed = lock(&self.entries).remove(message_id);
        let handle = match removed {
            Some(handle) => handle,
            None => return false,
        };
        if !handle.begin_cancel() {
            return false;
        }
        debug!(message_id, "cancelling directive");
        hook(&handle);
        handle.finish_cancel();
        true
    }

    /// Cancels every tracked directive without agent hooks.
    pub fn clear(&self) -> usize {
        let drained: Vec<DirectiveHandle> = lock(&self.entries).drain().map(|(_, h)| h).collect();
        let mut count = 0;
        for handle in drained {
            if handle.begin_cancel() {
                handle.finish_cancel();
                count += 1;
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingSink;
    use super::*;
    use crate::directive::test_support::directive;
    use std::thread;

    fn registry_with(id: &str) -> (DirectiveRegistry, Arc<RecordingSink>, DirectiveHandle) {
        let registry = DirectiveRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        let handle = registry
            .pre_handle(directive("TTS", "Speak", id, "{}"), sink.clone())
            .unwrap();
        (registry, sink, handle)
    }

    #[test]
    fn test_duplicate_pre_handle_is_rejected() {
        let (registry, sink, _) = registry_with("m1");
        assert!(registry
            .pre_handle(directive("TTS", "Speak", "m1", "{}"), sink)
            .is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_complete_twice_reports_once() {
        let (registry, sink, handle) = registry_with("m1");
        assert!(handle.set_completed());
        assert!(!handle.set_completed());
        assert!(!handle.set_failed("late"));
        assert!(registry.is_empty());
        assert_eq!(sink.outcomes().len(), 1);
        assert_eq!(handle.state(), HandleState::Completed);
    }

    #[test]
    fn test_handle_unknown_directive() {
        let registry = DirectiveRegistry::new();
        assert!(registry.handle("nope").is_none());
    }

    #[test]
    fn test_handle_only_once() {
        let (registry, _, _) = registry_with("m1");
        assert!(registry.handle("m1").is_some());
        assert!(registry.handle("m1").is_none());
        assert_eq!(registry.get("m1").unwrap().state(), HandleState::Handling);
    }

    #[test]
    fn test_cancel_runs_hook_once() {
        let (registry, sink, handle) = registry_with("m1");
        let mut hooks = 0;
        assert!(registry.cancel("m1", |h| {
            assert_eq!(h.state(), HandleState::Cancelling);
            hooks += 1;
        }));
        assert!(!registry.cancel("m1", |_| hooks += 1));
        assert_eq!(hooks, 1);
        assert!(handle.is_cancelled());
        assert!(!handle.set_completed());
        assert_eq!(sink.outcomes(), vec![("m1".to_string(), "cancelled".to_string())]);
    }

    #[test]
    fn test_cancel_after_completion_is_noop() {
        let (registry, sink, handle) = registry_with("m1");
        handle.set_failed("boom");
        assert!(!registry.cancel("m1", |_| panic!("hook must not run")));
        assert_eq!(sink.outcome_of("m1").unwrap(), "failed: boom");
    }

    #[test]
    fn test_message_id_reusable_after_completion() {
        let (registry, sink, handle) = registry_with("m1");
        handle.set_completed();
        let again = registry
            .pre_handle(directive("TTS", "Speak", "m1", "{}"), sink)
            .unwrap();
        // The stale handle must not detach the new one.
        assert!(!handle.set_completed());
        assert!(registry.contains("m1"));
        assert!(again.set_completed());
    }

    #[test]
    fn test_racing_completions_report_once() {
        for _ in 0..50 {
            let (registry, sink, handle) = registry_with("race");
            let threads: Vec<_> = (0..4)
                .map(|i| {
                    let handle = handle.clone();
                    thread::spawn(move || {
                        if i % 2 == 0 {
                            handle.set_completed()
                        } else {
                            handle.set_failed("other path")
                        }
                    })
                })
                .collect();
            let winners = threads
                .into_iter()
                .map(|t| t.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);
            assert_eq!(sink.outcomes().len(), 1);
            assert!(registry.is_empty());
        }
    }

    #[test]
    fn test_clear_cancels_everything() {
        let (registry, sink, _) = registry_with("m1");
        registry.pre_handle(directive("TTS", "Speak", "m2", "{}"), sink.clone());
        assert_eq!(registry.clear(), 2);
        assert!(registry.is_empty());
        assert_eq!(sink.outcomes().len(), 2);
    }
}
