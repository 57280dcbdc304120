//! Capability agents and directive routing.
//!
//! An agent is a thin, thread-safe facade over state owned by its
//! [`Executor`](crate::executor::Executor). The relays in this module turn
//! callbacks arriving on foreign threads (focus dispatch, media player,
//! play-sync, timers) into jobs on the agent's mailbox.

use crate::context::ContextManager;
use crate::device::{MediaEvent, MediaPlayerListener, SourceId};
use crate::directive::{BlockingPolicy, Directive, DirectiveResultSink, NamespaceAndName};
use crate::error::{AgentError, AgentResult};
use crate::executor::{lock, Mailbox, Scheduler};
use crate::focus::{FocusArbiter, FocusObserver, FocusState};
use crate::message::{send_with_deadline, EventMessage, MessageSender, SendStatus};
use crate::playsync::{PlaySynchronizer, SynchronizeObject};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Shared coordination services every agent is built on.
#[derive(Clone)]
pub struct AgentServices {
    pub arbiter: Arc<FocusArbiter>,
    pub playsync: Arc<PlaySynchronizer>,
    pub scheduler: Arc<Scheduler>,
    pub sender: Arc<dyn MessageSender>,
    pub context: Arc<ContextManager>,
    pub event_ack_timeout: Duration,
}

impl AgentServices {
    /// Sends an event nobody waits on; failures are only logged.
    pub fn send_event(&self, event: EventMessage) {
        let name = event.full_name();
        self.send_event_then(event, move |status| {
            if !status.is_success() {
                warn!(event = name.as_str(), ?status, "event was not delivered");
            }
        });
    }

    /// Sends an event and runs `then` once on its acknowledgement or after
    /// `event_ack_timeout`.
    pub fn send_event_then<F>(&self, event: EventMessage, then: F)
    where
        F: FnOnce(SendStatus) + Send + 'static,
    {
        send_with_deadline(
            self.sender.as_ref(),
            &self.scheduler,
            self.event_ack_timeout,
            event,
            then,
        );
    }
}

pub trait CapabilityAgent: Send + Sync {
    fn namespace(&self) -> &'static str;

    /// Directive names this agent handles and their blocking policies.
    fn configurations(&self) -> Vec<(NamespaceAndName, BlockingPolicy)>;

    /// Registers and validates a directive. Payload errors fail the directive
    /// through `sink` before this returns.
    fn pre_handle(&self, directive: Directive, sink: Arc<dyn DirectiveResultSink>)
        -> AgentResult<()>;

    /// Starts handling a pre-handled directive. `false` when it is unknown or
    /// was cancelled in the meantime.
    fn handle(&self, message_id: &str) -> bool;

    fn cancel(&self, message_id: &str);

    fn state_snapshot(&self) -> Option<Value>;
}

pub(crate) struct FocusRelay<S> {
    mailbox: Mailbox<S>,
    apply: fn(&mut S, FocusState),
}

impl<S: Send + 'static> FocusRelay<S> {
    pub(crate) fn observer(mailbox: Mailbox<S>, apply: fn(&mut S, FocusState)) -> Arc<dyn FocusObserver> {
        Arc::new(FocusRelay { mailbox, apply })
    }
}

impl<S: Send + 'static> FocusObserver for FocusRelay<S> {
    fn on_focus_changed(&self, channel: &str, state: FocusState) {
        debug!(executor = self.mailbox.name(), channel, ?state, "focus relayed");
        let apply = self.apply;
        self.mailbox.post(move |s| apply(s, state));
    }
}

pub(crate) struct MediaRelay<S> {
    mailbox: Mailbox<S>,
    apply: fn(&mut S, SourceId, MediaEvent),
}

impl<S: Send + 'static> MediaRelay<S> {
    pub(crate) fn listener(
        mailbox: Mailbox<S>,
        apply: fn(&mut S, SourceId, MediaEvent),
    ) -> Arc<dyn MediaPlayerListener> {
        Arc::new(MediaRelay { mailbox, apply })
    }
}

impl<S: Send + 'static> MediaPlayerListener for MediaRelay<S> {
    fn on_media_event(&self, source: SourceId, event: MediaEvent) {
        let apply = self.apply;
        self.mailbox.post(move |s| apply(s, source, event));
    }
}

/// Play-sync identity of one speak, play or card.
pub(crate) struct SyncTicket<S> {
    id: u64,
    dialog_request_id: String,
    play_service_id: Option<String>,
    mailbox: Mailbox<S>,
    apply: fn(&mut S, u64, bool),
}

impl<S: Send + 'static> SyncTicket<S> {
    pub(crate) fn new(
        id: u64,
        dialog_request_id: &str,
        play_service_id: Option<String>,
        mailbox: Mailbox<S>,
        apply: fn(&mut S, u64, bool),
    ) -> Arc<dyn SynchronizeObject> {
        Arc::new(SyncTicket {
            id,
            dialog_request_id: dialog_request_id.to_string(),
            play_service_id,
            mailbox,
            apply,
        })
    }
}

impl<S: Send + 'static> SynchronizeObject for SyncTicket<S> {
    fn dialog_request_id(&self) -> String {
        self.dialog_request_id.clone()
    }

    fn play_service_id(&self) -> Option<String> {
        self.play_service_id.clone()
    }

    fn request_release_sync(&self, immediate: bool) {
        let (id, apply) = (self.id, self.apply);
        self.mailbox.post(move |s| apply(s, id, immediate));
    }
}

struct Route {
    agent: Arc<dyn CapabilityAgent>,
    policy: BlockingPolicy,
}

type InFlight = Mutex<HashMap<String, Arc<dyn CapabilityAgent>>>;

/// Forgets the route of a directive once it resolved.
struct RoutedSink {
    inner: Arc<dyn DirectiveResultSink>,
    in_flight: Weak<InFlight>,
}

impl RoutedSink {
    fn forget(&self, directive: &Directive) {
        if let Some(in_flight) = self.in_flight.upgrade() {
            lock(&in_flight).remove(directive.message_id());
        }
    }
}

impl DirectiveResultSink for RoutedSink {
    fn on_completed(&self, directive: &Directive) {
        self.forget(directive);
        self.inner.on_completed(directive);
    }

    fn on_failed(&self, directive: &Directive, description: &str) {
        self.forget(directive);
        self.inner.on_failed(directive, description);
    }

    fn on_cancelled(&self, directive: &Directive) {
        self.forget(directive);
        self.inner.on_cancelled(directive);
    }
}

/// Routes directives to the agent registered for their namespace and name.
pub struct DirectiveRouter {
    routes: RwLock<HashMap<NamespaceAndName, Route>>,
    in_flight: Arc<InFlight>,
}

impl Default for DirectiveRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectiveRouter {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn add_agent(&self, agent: Arc<dyn CapabilityAgent>) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        for (name, policy) in agent.configurations() {
            if routes.contains_key(&name) {
                warn!(directive = %name, "route replaced");
            }
            routes.insert(
                name,
                Route {
                    agent: agent.clone(),
                    policy,
                },
            );
        }
    }

    pub fn blocking_policy(&self, name: &NamespaceAndName) -> Option<BlockingPolicy> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|r| r.policy)
    }

    pub fn pre_handle(
        &self,
        directive: Directive,
        sink: Arc<dyn DirectiveResultSink>,
    ) -> AgentResult<()> {
        let name = directive.namespace_and_name();
        let agent = self
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&name)
            .map(|r| r.agent.clone());
        let agent = match agent {
            Some(agent) => agent,
            None => {
                warn!(directive = %name, "no agent for directive");
                sink.on_failed(&directive, "unsupported directive");
                return Err(AgentError::UnknownDirective(name.to_string()));
            }
        };

        let message_id = directive.message_id().to_string();
        lock(&self.in_flight).insert(message_id.clone(), agent.clone());
        let routed = Arc::new(RoutedSink {
            inner: sink,
            in_flight: Arc::downgrade(&self.in_flight),
        });
        let result = agent.pre_handle(directive, routed);
        if result.is_err() {
            lock(&self.in_flight).remove(&message_id);
        }
        result
    }

    pub fn handle(&self, message_id: &str) -> bool {
        let agent = lock(&self.in_flight).get(message_id).cloned();
        match agent {
            Some(agent) => agent.handle(message_id),
            None => false,
        }
    }

    /// Pre-handles and handles in one step.
    pub fn dispatch(
        &self,
        directive: Directive,
        sink: Arc<dyn DirectiveResultSink>,
    ) -> AgentResult<()> {
        let message_id = directive.message_id().to_string();
        self.pre_handle(directive, sink)?;
        if self.handle(&message_id) {
            Ok(())
        } else {
            Err(AgentError::UnknownDirective(message_id))
        }
    }

    pub fn cancel(&self, message_id: &str) -> bool {
        let agent = lock(&self.in_flight).get(message_id).cloned();
        match agent {
            Some(agent) => {
                agent.cancel(message_id);
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }
}
