//! Text-to-speech agent.
//!
//! One speak plays at a time. A new `Speak` is pre-handled while the current
//! one is still running: the caller is held until the current speak has fully
//! released its resources, and a speak from a different dialog request barges
//! in by stopping the current one first.

mod payload;

pub use payload::{SpeakPayload, SpeechEventPayload, StopPayload};

use crate::agent::{AgentServices, CapabilityAgent, FocusRelay, MediaRelay, SyncTicket};
use crate::context::ContextStateProvider;
use crate::device::{MediaEvent, MediaPlayer, SourceId};
use crate::directive::{BlockingPolicy, Directive, DirectiveResultSink, Medium, NamespaceAndName};
use crate::error::{AgentError, AgentResult};
use crate::executor::{Executor, Gate, Mailbox, Signal, TimerHandle};
use crate::focus::{channels, FocusObserver, FocusState};
use crate::lifecycle::{DirectiveHandle, DirectiveRegistry};
use crate::message::EventMessage;
use crate::playsync::{SyncResult, SynchronizeObject};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const NAMESPACE: &str = "TTS";
const VERSION: &str = "1.2";
const INTERFACE: &str = "TextToSpeech";
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// Longest a pre-handled speak waits for the current one.
    pub prehandle_wait: Duration,
    /// Grace given to a player that has not confirmed start or stop yet.
    pub graceful_stop_wait: Duration,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            prehandle_wait: Duration::from_secs(10),
            graceful_stop_wait: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TtsState {
    Idle,
    Playing,
    Stopped,
    Finished,
}

pub trait TtsListener: Send + Sync {
    fn on_state_changed(&self, state: TtsState, dialog_request_id: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Finished,
    Stopped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Prepared,
    AwaitingFocus,
    Starting,
    Playing,
    Stopping,
    Releasing(Outcome),
}

struct Speak {
    id: u64,
    handle: DirectiveHandle,
    payload: SpeakPayload,
    sync: Arc<dyn SynchronizeObject>,
    phase: Phase,
    source: Option<SourceId>,
    started: bool,
    waiters: Vec<Signal<()>>,
    guard: Option<TimerHandle>,
}

impl Speak {
    fn dialog_request_id(&self) -> String {
        self.handle.dialog_request_id().to_string()
    }

    fn event(&self, name: &str) -> EventMessage {
        let payload = SpeechEventPayload {
            play_service_id: self.payload.play_service_id.clone(),
            token: self.payload.token.clone(),
        };
        EventMessage::builder(NAMESPACE, name, VERSION)
            .payload(json!(payload))
            .referrer_dialog_request_id(Some(self.dialog_request_id()))
            .build()
    }

    fn cancel_guard(&mut self) {
        if let Some(timer) = self.guard.take() {
            timer.cancel();
        }
    }

    fn is_releasing(&self) -> bool {
        matches!(self.phase, Phase::Releasing(_))
    }
}

struct TtsCore {
    config: TtsConfig,
    services: AgentServices,
    player: Arc<dyn MediaPlayer>,
    mailbox: Mailbox<TtsCore>,
    observer: Arc<dyn FocusObserver>,
    focus: FocusState,
    holds_focus: bool,
    state: TtsState,
    current: Option<Speak>,
    prepared: Option<Speak>,
    listeners: Vec<Arc<dyn TtsListener>>,
    next_id: u64,
}

impl TtsCore {
    fn set_state(&mut self, state: TtsState, dialog_request_id: &str) {
        if self.state == state {
            return;
        }
        info!(from = ?self.state, to = ?state, dialog_request_id, "TTS state changed");
        self.state = state;
        for listener in &self.listeners {
            listener.on_state_changed(state, dialog_request_id);
        }
    }

    fn pre_handle_speak(&mut self, handle: DirectiveHandle, payload: SpeakPayload, done: Signal<()>) {
        if let Some(old) = self.prepared.take() {
            info!(message_id = old.handle.message_id(), "unhandled speak superseded");
            self.services.playsync.release_sync(&old.sync, None);
            old.handle.set_failed("superseded by a newer speak");
        }

        self.next_id += 1;
        let sync = SyncTicket::new(
            self.next_id,
            handle.dialog_request_id(),
            payload.play_service_id.clone(),
            self.mailbox.clone(),
            TtsCore::on_release_requested,
        );
        self.services.playsync.prepare_sync(&sync);
        let dialog_request_id = handle.dialog_request_id().to_string();
        debug!(message_id = handle.message_id(), "speak prepared");
        self.prepared = Some(Speak {
            id: self.next_id,
            handle,
            payload,
            sync,
            phase: Phase::Prepared,
            source: None,
            started: false,
            waiters: Vec::new(),
            guard: None,
        });

        let barge_in = match self.current.as_mut() {
            None => {
                done.fire(());
                return;
            }
            Some(current) => {
                current.waiters.push(done);
                current.handle.dialog_request_id() != dialog_request_id
            }
        };
        if barge_in {
            info!(dialog_request_id = dialog_request_id.as_str(), "speak from a new dialog barges in");
            self.stop_current();
        }
    }

    fn handle_speak(&mut self, message_id: &str) {
        let mut speak = match self.prepared.take() {
            Some(speak) if speak.handle.message_id() == message_id => speak,
            other => {
                self.prepared = other;
                warn!(message_id, "handle for a speak that is not prepared");
                return;
            }
        };
        if self.current.is_some() {
            self.force_finish_current();
        }
        speak.phase = Phase::AwaitingFocus;
        self.current = Some(speak);

        if self.holds_focus && self.focus == FocusState::Foreground {
            self.start_playback();
            return;
        }
        if self
            .services
            .arbiter
            .acquire(channels::DIALOG, self.observer.clone(), INTERFACE)
        {
            self.holds_focus = true;
        } else {
            self.begin_release(Outcome::Failed("dialog channel unavailable".to_string()));
        }
    }

    fn on_focus(&mut self, state: FocusState) {
        self.focus = state;
        if state == FocusState::None {
            self.holds_focus = false;
        }
        let phase = match &self.current {
            Some(current) => current.phase.clone(),
            None => return,
        };
        match (state, phase) {
            (FocusState::Foreground, Phase::AwaitingFocus) => self.start_playback(),
            (FocusState::Foreground, _) | (FocusState::Background, Phase::AwaitingFocus) => {}
            (FocusState::None, Phase::AwaitingFocus) => self.begin_release(Outcome::Stopped),
            (_, Phase::Starting) => self.arm_guard(),
            (_, Phase::Playing) => self.stop_current(),
            _ => {}
        }
    }

    fn start_playback(&mut self) {
        let failure = {
            let current = match self.current.as_mut() {
                Some(current) => current,
                None => return,
            };
            if self.services.playsync.start_sync(&current.sync) == SyncResult::Denied {
                info!(message_id = current.handle.message_id(), "speak was released before it started");
                Some(Outcome::Stopped)
            } else {
                match current
                    .payload
                    .source()
                    .and_then(|media| self.player.set_source(&media))
                {
                    Ok(source) => {
                        current.source = Some(source);
                        current.phase = Phase::Starting;
                        if self.player.play(source) {
                            None
                        } else {
                            Some(Outcome::Failed("player refused to play".to_string()))
                        }
                    }
                    Err(e) => Some(Outcome::Failed(e.to_string())),
                }
            }
        };
        if let Some(outcome) = failure {
            self.begin_release(outcome);
        }
    }

    fn on_media(&mut self, source: SourceId, event: MediaEvent) {
        let phase = match &self.current {
            Some(current) if current.source == Some(source) && !current.is_releasing() => {
                current.phase.clone()
            }
            _ => {
                debug!(source, ?event, "media event for a speak that is gone");
                return;
            }
        };
        match event {
            MediaEvent::Started if phase == Phase::Starting => self.on_started(),
            MediaEvent::Started | MediaEvent::Paused | MediaEvent::Resumed => {}
            MediaEvent::Finished => self.begin_release(Outcome::Finished),
            MediaEvent::Stopped => self.begin_release(Outcome::Stopped),
            MediaEvent::Error(reason) => {
                warn!(source, reason = reason.as_str(), "speech playback failed");
                self.begin_release(Outcome::Failed(reason));
            }
        }
    }

    fn on_started(&mut self) {
        let (dialog_request_id, event) = match self.current.as_mut() {
            Some(current) => {
                current.phase = Phase::Playing;
                current.started = true;
                current.cancel_guard();
                (current.dialog_request_id(), current.event("SpeechStarted"))
            }
            None => return,
        };
        self.set_state(TtsState::Playing, &dialog_request_id);
        self.services.send_event(event);
        if self.focus != FocusState::Foreground {
            self.stop_current();
        }
    }

    fn arm_guard(&mut self) {
        let wait = self.config.graceful_stop_wait;
        let scheduler = self.services.scheduler.clone();
        let mailbox = self.mailbox.clone();
        if let Some(current) = self.current.as_mut() {
            current.cancel_guard();
            let id = current.id;
            current.guard = Some(scheduler.schedule(wait, move || {
                mailbox.post(move |core| core.on_guard_expired(id));
            }));
        }
    }

    fn on_guard_expired(&mut self, id: u64) {
        let phase = match &self.current {
            Some(current) if current.id == id => current.phase.clone(),
            _ => return,
        };
        match phase {
            Phase::Starting => {
                warn!("player did not start in time after focus loss; forcing stop");
                if let Some(source) = self.current.as_ref().and_then(|c| c.source) {
                    self.player.stop(source);
                }
                self.begin_release(Outcome::Stopped);
            }
            Phase::Stopping => {
                warn!("player did not confirm stop in time");
                self.begin_release(Outcome::Stopped);
            }
            _ => {}
        }
    }

    fn stop_current(&mut self) {
        enum Next {
            Release,
            Wait,
            Nothing,
        }
        let next = match self.current.as_mut() {
            None => return,
            Some(current) => match current.phase {
                Phase::Prepared | Phase::AwaitingFocus => Next::Release,
                Phase::Starting | Phase::Playing => {
                    current.phase = Phase::Stopping;
                    match current.source {
                        Some(source) if self.player.stop(source) => Next::Wait,
                        _ => Next::Release,
                    }
                }
                Phase::Stopping => Next::Nothing,
                Phase::Releasing(_) => {
                    debug!(message_id = current.handle.message_id(), "stop while releasing");
                    self.services.playsync.release_sync_immediately(&current.sync);
                    Next::Nothing
                }
            },
        };
        match next {
            Next::Release => self.begin_release(Outcome::Stopped),
            Next::Wait => self.arm_guard(),
            Next::Nothing => {}
        }
    }

    /// Reports the outcome, then releases resources once the event is
    /// acknowledged.
    fn begin_release(&mut self, outcome: Outcome) {
        let (id, started, dialog_request_id, event) = match self.current.as_mut() {
            Some(current) if !current.is_releasing() => {
                current.cancel_guard();
                current.phase = Phase::Releasing(outcome.clone());
                let name = match outcome {
                    Outcome::Finished => "SpeechFinished",
                    _ => "SpeechStopped",
                };
                (
                    current.id,
                    current.started,
                    current.dialog_request_id(),
                    current.event(name),
                )
            }
            _ => return,
        };
        if !started {
            self.complete_release(id);
            return;
        }
        let state = match outcome {
            Outcome::Finished => TtsState::Finished,
            _ => TtsState::Stopped,
        };
        self.set_state(state, &dialog_request_id);
        let mailbox = self.mailbox.clone();
        self.services.send_event_then(event, move |status| {
            if !status.is_success() {
                warn!(?status, "speech result event not acknowledged");
            }
            mailbox.post(move |core| core.complete_release(id));
        });
    }

    fn complete_release(&mut self, id: u64) {
        let mut speak = match self.current.take() {
            Some(speak) if speak.id == id => speak,
            other => {
                self.current = other;
                return;
            }
        };
        let outcome = match &speak.phase {
            Phase::Releasing(outcome) => outcome.clone(),
            _ => Outcome::Stopped,
        };
        speak.cancel_guard();
        self.services.playsync.release_sync(&speak.sync, None);
        if self.prepared.is_none() {
            self.release_focus();
        }
        let dialog_request_id = speak.dialog_request_id();
        self.set_state(TtsState::Idle, &dialog_request_id);
        match outcome {
            Outcome::Finished => speak.handle.set_completed(),
            Outcome::Stopped => speak.handle.set_failed("stopped"),
            Outcome::Failed(reason) => speak.handle.set_failed(&reason),
        };
        for waiter in speak.waiters.drain(..) {
            waiter.fire(());
        }
    }

    /// Ends the current speak at once, without waiting for the player or an
    /// event acknowledgement.
    fn force_finish_current(&mut self) {
        let (id, stopped_event) = match self.current.as_mut() {
            Some(current) => {
                current.cancel_guard();
                let mut stopped_event = None;
                if !current.is_releasing() {
                    if let Some(source) = current.source {
                        self.player.stop(source);
                    }
                    if current.started {
                        stopped_event = Some(current.event("SpeechStopped"));
                    }
                    current.phase = Phase::Releasing(Outcome::Stopped);
                }
                (current.id, stopped_event)
            }
            None => return,
        };
        warn!("current speak force-finished");
        if let Some(event) = stopped_event {
            self.services.send_event(event);
        }
        self.complete_release(id);
    }

    fn release_focus(&mut self) {
        if self.holds_focus {
            self.services
                .arbiter
                .release(channels::DIALOG, &self.observer);
            self.holds_focus = false;
        }
        self.focus = FocusState::None;
    }

    fn on_release_requested(&mut self, id: u64, immediate: bool) {
        // The last speak of a group finishes on its own.
        if !immediate {
            return;
        }
        if self.current.as_ref().map(|c| c.id == id).unwrap_or(false) {
            self.stop_current();
            return;
        }
        let prepared_matches = self.prepared.as_ref().map(|p| p.id == id).unwrap_or(false);
        if prepared_matches {
            if let Some(prepared) = self.prepared.take() {
                self.services.playsync.release_sync(&prepared.sync, None);
                prepared.handle.set_failed("released with its play group");
            }
            if self.current.is_none() {
                self.release_focus();
            }
        }
    }

    fn cancel_speak(&mut self, message_id: &str) {
        if self
            .current
            .as_ref()
            .map(|c| c.handle.message_id() == message_id)
            .unwrap_or(false)
        {
            self.stop_current();
            return;
        }
        let prepared_matches = self
            .prepared
            .as_ref()
            .map(|p| p.handle.message_id() == message_id)
            .unwrap_or(false);
        if prepared_matches {
            if let Some(prepared) = self.prepared.take() {
                self.services.playsync.release_sync(&prepared.sync, None);
            }
            if self.current.is_none() {
                self.release_focus();
            }
        }
    }

    fn stop_by_directive(&mut self, handle: DirectiveHandle, payload: StopPayload) {
        let matches = self
            .current
            .as_ref()
            .map(|c| match &payload.token {
                Some(token) => *token == c.payload.token,
                None => true,
            })
            .unwrap_or(false);
        if matches {
            self.stop_current();
        }
        handle.set_completed();
    }

    fn snapshot(&self) -> Value {
        let token = self.current.as_ref().map(|c| c.payload.token.clone());
        json!({
            "version": VERSION,
            "ttsActivity": self.state,
            "token": token,
        })
    }
}

/// Text-to-speech capability agent.
pub struct TtsAgent {
    executor: Executor<TtsCore>,
    registry: DirectiveRegistry,
    config: TtsConfig,
}

impl TtsAgent {
    pub fn new(
        config: TtsConfig,
        services: AgentServices,
        player: Arc<dyn MediaPlayer>,
    ) -> AgentResult<Arc<Self>> {
        let core_config = config.clone();
        let core_player = player.clone();
        let executor = Executor::spawn_with("tts", move |mailbox: Mailbox<TtsCore>| TtsCore {
            config: core_config,
            services,
            player: core_player,
            observer: FocusRelay::observer(mailbox.clone(), TtsCore::on_focus),
            mailbox,
            focus: FocusState::None,
            holds_focus: false,
            state: TtsState::Idle,
            current: None,
            prepared: None,
            listeners: Vec::new(),
            next_id: 0,
        })?;
        player.set_listener(MediaRelay::listener(executor.mailbox(), TtsCore::on_media));
        Ok(Arc::new(Self {
            executor,
            registry: DirectiveRegistry::new(),
            config,
        }))
    }

    fn mailbox(&self) -> Mailbox<TtsCore> {
        self.executor.mailbox()
    }

    pub fn add_listener(&self, listener: Arc<dyn TtsListener>) {
        self.mailbox().post(move |core| core.listeners.push(listener));
    }

    /// Stops whatever is being spoken.
    pub fn stop(&self) {
        self.mailbox().post(|core| core.stop_current());
    }

    pub fn state(&self) -> AgentResult<TtsState> {
        self.mailbox().call(|core| core.state, QUERY_TIMEOUT)
    }

    fn pre_handle_speak(&self, handle: DirectiveHandle) -> AgentResult<()> {
        let payload = match SpeakPayload::parse(&handle.directive().payload) {
            Ok(payload) => payload,
            Err(e) => {
                handle.set_failed(&e.to_string());
                return Err(e);
            }
        };
        let (gate, signal) = Gate::pair();
        self.mailbox()
            .post(move |core| core.pre_handle_speak(handle, payload, signal));
        match gate.wait(self.config.prehandle_wait, "previous speak to finish") {
            Ok(()) => Ok(()),
            Err(AgentError::Timeout(what)) => {
                warn!("timed out waiting for {}; stopping it", what);
                self.mailbox().post(|core| core.force_finish_current());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl CapabilityAgent for TtsAgent {
    fn namespace(&self) -> &'static str {
        NAMESPACE
    }

    fn configurations(&self) -> Vec<(NamespaceAndName, BlockingPolicy)> {
        vec![
            (
                NamespaceAndName::new(NAMESPACE, "Speak"),
                BlockingPolicy::new(Medium::Audio, Some(Medium::Audio)),
            ),
            (
                NamespaceAndName::new(NAMESPACE, "Stop"),
                BlockingPolicy::NON_BLOCKING,
            ),
        ]
    }

    fn pre_handle(
        &self,
        directive: Directive,
        sink: Arc<dyn DirectiveResultSink>,
    ) -> AgentResult<()> {
        let handle = match self.registry.pre_handle(directive, sink) {
            Some(handle) => handle,
            None => return Ok(()),
        };
        match handle.directive().header.name.as_str() {
            "Speak" => self.pre_handle_speak(handle),
            "Stop" => Ok(()),
            other => {
                let name = format!("{}.{}", NAMESPACE, other);
                handle.set_failed("unsupported directive");
                Err(AgentError::UnknownDirective(name))
            }
        }
    }

    fn handle(&self, message_id: &str) -> bool {
        let handle = match self.registry.handle(message_id) {
            Some(handle) => handle,
            None => return false,
        };
        if handle.directive().header.name == "Stop" {
            let parsed = handle.directive().parse_payload::<StopPayload>();
            match parsed {
                Ok(payload) => {
                    self.mailbox()
                        .post(move |core| core.stop_by_directive(handle, payload));
                }
                Err(e) => {
                    handle.set_failed(&e.to_string());
                }
            }
        } else {
            let message_id = message_id.to_string();
            self.mailbox()
                .post(move |core| core.handle_speak(&message_id));
        }
        true
    }

    fn cancel(&self, message_id: &str) {
        let mailbox = self.mailbox();
        self.registry.cancel(message_id, |handle| {
            let message_id = handle.message_id().to_string();
            mailbox.post(move |core| core.cancel_speak(&message_id));
        });
    }

    fn state_snapshot(&self) -> Option<Value> {
        self.mailbox().call(|core| core.snapshot(), QUERY_TIMEOUT).ok()
    }
}

impl ContextStateProvider for TtsAgent {
    fn namespace(&self) -> String {
        NAMESPACE.to_string()
    }

    fn provide_state(&self, timeout: Duration) -> Option<Value> {
        self.mailbox().call(|core| core.snapshot(), timeout).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_support::{services, wait_until};
    use crate::directive::test_support::directive_in_dialog;
    use crate::executor::lock;
    use crate::focus::test_support::RecordingObserver;
    use crate::lifecycle::test_support::RecordingSink;
    use crate::sim::{RecordingSender, SimPlayer, SimSourceState};
    use std::sync::mpsc::channel;
    use std::sync::Mutex;
    use std::thread;

    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        agent: Arc<TtsAgent>,
        player: Arc<SimPlayer>,
        sender: Arc<RecordingSender>,
        services: AgentServices,
        sink: Arc<RecordingSink>,
    }

    fn fixture_with(config: TtsConfig, sender: RecordingSender, ack: Duration) -> Fixture {
        let sender = Arc::new(sender);
        let services = services(sender.clone(), ack);
        let player = Arc::new(SimPlayer::new("tts", services.scheduler.clone(), None));
        let agent = TtsAgent::new(config, services.clone(), player.clone()).unwrap();
        Fixture {
            agent,
            player,
            sender,
            services,
            sink: Arc::new(RecordingSink::default()),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            TtsConfig::default(),
            RecordingSender::default(),
            Duration::from_secs(1),
        )
    }

    fn speak(id: &str, dialog: &str) -> Directive {
        directive_in_dialog(
            "TTS",
            "Speak",
            id,
            dialog,
            &format!(r#"{{"token":"tok-{}","text":"hello there","playServiceId":"svc"}}"#, id),
        )
    }

    impl Fixture {
        fn play(&self, id: &str, dialog: &str) -> SourceId {
            let before = self.player.source_count();
            self.agent.pre_handle(speak(id, dialog), self.sink.clone()).unwrap();
            assert!(self.agent.handle(id));
            assert!(wait_until(WAIT, || self.player.source_count() > before));
            let source = self.player.last_source().unwrap();
            assert!(wait_until(WAIT, || self.agent.state().unwrap() == TtsState::Playing));
            source
        }

        fn outcome(&self, id: &str) -> Option<String> {
            wait_until(WAIT, || self.sink.outcome_of(id).is_some());
            self.sink.outcome_of(id)
        }
    }

    #[test]
    fn test_speak_plays_to_completion() {
        let f = fixture();
        let source = f.play("a", "d1");
        assert_eq!(
            f.player.media_of(source),
            Some(crate::device::MediaSource::Text("hello there".into()))
        );
        assert_eq!(
            f.services.arbiter.focus_state(channels::DIALOG),
            FocusState::Foreground
        );
        f.player.finish(source);
        assert_eq!(f.outcome("a").unwrap(), "completed");
        assert_eq!(
            f.sender.names(),
            vec!["TTS.SpeechStarted", "TTS.SpeechFinished"]
        );
        assert!(wait_until(WAIT, || f.agent.state().unwrap() == TtsState::Idle));
        assert_eq!(f.services.arbiter.focus_state(channels::DIALOG), FocusState::None);
        assert_eq!(f.services.playsync.tracked_count(), 0);
    }

    #[test]
    fn test_event_payload_carries_token() {
        let f = fixture();
        f.play("a", "d1");
        let started = f.sender.wait_for("TTS.SpeechStarted", WAIT).unwrap();
        assert_eq!(started.payload["token"], "tok-a");
        assert_eq!(started.payload["playServiceId"], "svc");
        assert_eq!(started.header.referrer_dialog_request_id.as_deref(), Some("d1"));
    }

    #[test]
    fn test_new_dialog_barges_in() {
        let f = fixture();
        let first = f.play("a", "d1");
        f.agent.pre_handle(speak("b", "d2"), f.sink.clone()).unwrap();
        // pre_handle only returns once "a" has released everything.
        assert_eq!(f.sink.outcome_of("a").unwrap(), "failed: stopped");
        assert_eq!(f.player.state_of(first), Some(SimSourceState::Stopped));
        assert!(f.agent.handle("b"));
        assert!(wait_until(WAIT, || f.player.source_count() == 2));
        assert!(wait_until(WAIT, || f.agent.state().unwrap() == TtsState::Playing));
        assert_eq!(f.sender.count("TTS.SpeechStopped"), 1);
    }

    #[test]
    fn test_same_dialog_waits_for_finish() {
        let f = fixture();
        let first = f.play("a", "d1");
        let (tx, rx) = channel();
        let agent = f.agent.clone();
        let sink = f.sink.clone();
        thread::spawn(move || {
            let result = agent.pre_handle(speak("b", "d1"), sink);
            let _ = tx.send(result.is_ok());
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(f.player.state_of(first), Some(SimSourceState::Playing));
        f.player.finish(first);
        assert!(rx.recv_timeout(WAIT).unwrap());
        assert_eq!(f.sink.outcome_of("a").unwrap(), "completed");
    }

    #[test]
    fn test_pre_handle_wait_is_bounded() {
        let config = TtsConfig {
            prehandle_wait: Duration::from_millis(100),
            ..TtsConfig::default()
        };
        let f = fixture_with(config, RecordingSender::default(), Duration::from_secs(1));
        let first = f.play("a", "d1");
        f.agent.pre_handle(speak("b", "d1"), f.sink.clone()).unwrap();
        assert_eq!(f.outcome("a").unwrap(), "failed: stopped");
        assert_eq!(f.player.state_of(first), Some(SimSourceState::Stopped));
    }

    #[test]
    fn test_focus_lost_before_start_forces_stop() {
        let config = TtsConfig {
            graceful_stop_wait: Duration::from_millis(50),
            ..TtsConfig::default()
        };
        let f = fixture_with(config, RecordingSender::default(), Duration::from_secs(1));
        f.player.set_hold_start(true);
        f.agent.pre_handle(speak("a", "d1"), f.sink.clone()).unwrap();
        f.agent.handle("a");
        assert!(wait_until(WAIT, || f.player.source_count() == 1));

        let intruder = Arc::new(RecordingObserver::default());
        f.services
            .arbiter
            .acquire(channels::DIALOG, intruder.clone(), "Intruder");
        assert_eq!(f.outcome("a").unwrap(), "failed: stopped");
        assert_eq!(f.sender.count("TTS.SpeechStarted"), 0);
        assert_eq!(intruder.last(), Some(FocusState::Foreground));
    }

    #[test]
    fn test_invalid_payload_fails_without_side_effects() {
        let f = fixture();
        let bad = directive_in_dialog("TTS", "Speak", "bad", "d1", r#"{"token":"t"}"#);
        assert!(f.agent.pre_handle(bad, f.sink.clone()).is_err());
        assert!(f.sink.outcome_of("bad").unwrap().starts_with("failed: invalid TTS.Speak"));
        assert!(!f.agent.handle("bad"));
        assert_eq!(f.player.source_count(), 0);
        assert_eq!(f.services.playsync.tracked_count(), 0);
    }

    struct Card {
        requests: Mutex<Vec<bool>>,
    }

    impl SynchronizeObject for Card {
        fn dialog_request_id(&self) -> String {
            "d1".to_string()
        }

        fn request_release_sync(&self, immediate: bool) {
            lock(&self.requests).push(immediate);
        }
    }

    #[test]
    fn test_stop_while_releasing_releases_group_immediately() {
        // The transport never answers, so "a" sits in its release phase until
        // the ack deadline.
        let f = fixture_with(
            TtsConfig::default(),
            RecordingSender::answering(None),
            Duration::from_millis(300),
        );
        let card = Arc::new(Card {
            requests: Mutex::new(Vec::new()),
        });
        let card_dyn: Arc<dyn SynchronizeObject> = card.clone();
        f.services.playsync.prepare_sync(&card_dyn);

        let source = f.play("a", "d1");
        f.player.finish(source);
        assert!(f.sender.wait_for("TTS.SpeechFinished", WAIT).is_some());
        f.agent.stop();
        assert!(wait_until(WAIT, || !lock(&card.requests).is_empty()));
        assert_eq!(*lock(&card.requests), vec![true]);
        assert_eq!(f.outcome("a").unwrap(), "completed");
    }

    #[test]
    fn test_last_speak_of_group_releases_card_gracefully() {
        let f = fixture();
        let card = Arc::new(Card {
            requests: Mutex::new(Vec::new()),
        });
        let card_dyn: Arc<dyn SynchronizeObject> = card.clone();
        f.services.playsync.prepare_sync(&card_dyn);
        let source = f.play("a", "d1");
        f.player.finish(source);
        assert_eq!(f.outcome("a").unwrap(), "completed");
        assert_eq!(*lock(&card.requests), vec![false]);
    }

    #[test]
    fn test_cancel_prepared_speak() {
        let f = fixture();
        f.agent.pre_handle(speak("a", "d1"), f.sink.clone()).unwrap();
        f.agent.cancel("a");
        assert_eq!(f.sink.outcome_of("a").unwrap(), "cancelled");
        assert!(wait_until(WAIT, || f.services.playsync.tracked_count() == 0));
        assert!(!f.agent.handle("a"));
    }

    #[test]
    fn test_stop_directive_stops_matching_token() {
        let f = fixture();
        let source = f.play("a", "d1");
        let stop = directive_in_dialog("TTS", "Stop", "s1", "d9", r#"{"token":"other"}"#);
        f.agent.pre_handle(stop, f.sink.clone()).unwrap();
        f.agent.handle("s1");
        assert_eq!(f.outcome("s1").unwrap(), "completed");
        assert_eq!(f.player.state_of(source), Some(SimSourceState::Playing));

        let stop = directive_in_dialog("TTS", "Stop", "s2", "d9", r#"{"token":"tok-a"}"#);
        f.agent.pre_handle(stop, f.sink.clone()).unwrap();
        f.agent.handle("s2");
        assert_eq!(f.outcome("a").unwrap(), "failed: stopped");
    }

    #[test]
    fn test_media_error_fails_speak() {
        let f = fixture();
        let source = f.play("a", "d1");
        f.player.fail(source, "decoder crashed");
        assert_eq!(f.outcome("a").unwrap(), "failed: decoder crashed");
        assert_eq!(f.sender.count("TTS.SpeechStopped"), 1);
    }

    #[test]
    fn test_snapshot_reports_activity() {
        let f = fixture();
        assert_eq!(f.agent.state_snapshot().unwrap()["ttsActivity"], "IDLE");
        f.play("a", "d1");
        let state = f.agent.provide_state(WAIT).unwrap();
        assert_eq!(state["ttsActivity"], "PLAYING");
        assert_eq!(state["token"], "tok-a");
    }
}
