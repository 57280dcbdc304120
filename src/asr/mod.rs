//! Speech-recognition agent.
//!
//! A recognition session runs `Idle → Listening → Recognizing → Busy → Idle`.
//! Starting a session fetches a context snapshot, takes the dialog channel
//! and starts the recognizer back-end, in that order; any failure on the way
//! rolls all of it back.

mod payload;
mod processor;

pub use payload::{ExpectSpeechPayload, NotifyResultPayload, ResultState};
pub use processor::{
    ClientEpdProcessor, EndpointMode, ProcessorCallback, ProcessorEvent, ServerEpdProcessor,
    SpeechProcessor,
};

use crate::agent::{AgentServices, CapabilityAgent, FocusRelay};
use crate::context::ContextStateProvider;
use crate::device::{AudioInput, EndPointDetector};
use crate::directive::{BlockingPolicy, Directive, DirectiveResultSink, Medium, NamespaceAndName};
use crate::error::{AgentError, AgentResult};
use crate::executor::{Executor, Gate, Mailbox, Signal, TimerHandle};
use crate::focus::{channels, FocusObserver, FocusState};
use crate::lifecycle::{DirectiveHandle, DirectiveRegistry};
use crate::message::{generate_id, EventMessage};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const NAMESPACE: &str = "ASR";
const VERSION: &str = "1.0";
const INTERFACE: &str = "SpeechRecognizer";
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);
const START_MARGIN: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct AsrConfig {
    pub endpoint_mode: EndpointMode,
    pub start_timeout: Duration,
    /// Longest wait for speech to begin.
    pub listen_timeout: Duration,
    /// Longest wait for a result once speech ended.
    pub response_timeout: Duration,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            endpoint_mode: EndpointMode::Server,
            start_timeout: Duration::from_secs(5),
            listen_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AsrState {
    Idle,
    ExpectingSpeech,
    Listening,
    Recognizing,
    Busy,
}

impl AsrState {
    pub fn can_recognize(self) -> bool {
        matches!(self, AsrState::Idle | AsrState::Busy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    ListeningTimeout,
    ResponseTimeout,
    Network,
    AudioInput,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionResult {
    Partial(String),
    Complete(String),
    NoMatch,
    Error(ErrorType),
    Cancel,
}

pub trait RecognitionListener: Send + Sync {
    fn on_state_changed(&self, _state: AsrState, _dialog_request_id: &str) {}
    fn on_result(&self, _result: &RecognitionResult, _dialog_request_id: &str) {}
}

#[derive(Debug, Clone, Default)]
pub struct RecognitionRequest {
    pub play_service_id: Option<String>,
    pub referrer_dialog_request_id: Option<String>,
    pub asr_context: Option<Value>,
    pub listen_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    FetchingContext,
    AwaitingFocus,
    Capturing,
    Busy,
}

impl Stage {
    fn is_starting(self) -> bool {
        matches!(self, Stage::FetchingContext | Stage::AwaitingFocus)
    }
}

struct Session {
    id: u64,
    dialog_request_id: String,
    request: RecognitionRequest,
    expect: Option<DirectiveHandle>,
    stage: Stage,
    mode: EndpointMode,
    processor: Option<Box<dyn SpeechProcessor>>,
    context: Option<Value>,
    starter: Option<Signal<AgentResult<()>>>,
    timers: Vec<TimerHandle>,
    recognize_sent: bool,
}

impl Session {
    fn cancel_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.cancel();
        }
    }

    fn event(&self, name: &str, payload: Value) -> EventMessage {
        EventMessage::builder(NAMESPACE, name, VERSION)
            .payload(payload)
            .dialog_request_id(self.dialog_request_id.clone())
            .referrer_dialog_request_id(self.request.referrer_dialog_request_id.clone())
            .build()
    }

    fn play_service_payload(&self) -> Value {
        json!({ "playServiceId": self.request.play_service_id })
    }
}

struct PendingExpect {
    handle: DirectiveHandle,
    payload: ExpectSpeechPayload,
}

struct AsrCore {
    config: AsrConfig,
    services: AgentServices,
    input: Arc<dyn AudioInput>,
    detector: Option<Arc<dyn EndPointDetector>>,
    mailbox: Mailbox<AsrCore>,
    observer: Arc<dyn FocusObserver>,
    focus: FocusState,
    holds_focus: bool,
    state: AsrState,
    endpoint_mode: EndpointMode,
    session: Option<Session>,
    expect: Option<PendingExpect>,
    listeners: Vec<Arc<dyn RecognitionListener>>,
    next_session: u64,
}

impl AsrCore {
    fn set_state(&mut self, state: AsrState, dialog_request_id: &str) {
        if self.state == state {
            return;
        }
        info!(from = ?self.state, to = ?state, dialog_request_id, "ASR state changed");
        self.state = state;
        for listener in &self.listeners {
            listener.on_state_changed(state, dialog_request_id);
        }
    }

    fn stage_of(&self, id: u64) -> Option<Stage> {
        self.session
            .as_ref()
            .filter(|s| s.id == id)
            .map(|s| s.stage)
    }

    fn start_session(
        &mut self,
        request: RecognitionRequest,
        expect: Option<DirectiveHandle>,
        starter: Option<Signal<AgentResult<()>>>,
    ) {
        let starting = self
            .session
            .as_ref()
            .map(|s| s.stage.is_starting())
            .unwrap_or(false);
        let allowed = !starting
            && (self.state.can_recognize()
                || (expect.is_some() && self.state == AsrState::ExpectingSpeech));
        if !allowed {
            let err = if starting {
                AgentError::invalid_state("start_recognition", "Starting")
            } else {
                AgentError::invalid_state("start_recognition", self.state)
            };
            warn!(error = %err, "recognition refused");
            if let Some(handle) = expect {
                handle.set_failed(&err.to_string());
            }
            if let Some(starter) = starter {
                starter.fire(Err(err));
            }
            return;
        }
        if self.state == AsrState::Busy {
            info!("new recognition cancels the busy session");
            self.finish_session(RecognitionResult::Cancel);
        }

        self.next_session += 1;
        let id = self.next_session;
        let mailbox = self.mailbox.clone();
        let start_timer = self.services.scheduler.schedule(self.config.start_timeout, move || {
            mailbox.post(move |core| core.on_start_timeout(id));
        });
        let session = Session {
            id,
            dialog_request_id: generate_id(),
            request,
            expect,
            stage: Stage::FetchingContext,
            mode: self.endpoint_mode,
            processor: None,
            context: None,
            starter,
            timers: vec![start_timer],
            recognize_sent: false,
        };
        debug!(dialog_request_id = session.dialog_request_id.as_str(), mode = ?session.mode, "recognition starting");
        self.session = Some(session);

        let mailbox = self.mailbox.clone();
        self.services.context.get_context(move |context| {
            mailbox.post(move |core| core.on_context(id, context));
        });
    }

    fn on_context(&mut self, id: u64, context: Value) {
        if self.stage_of(id) != Some(Stage::FetchingContext) {
            return;
        }
        let focused = self.holds_focus && self.focus == FocusState::Foreground;
        if let Some(session) = self.session.as_mut() {
            session.context = Some(context);
            session.stage = Stage::AwaitingFocus;
        }
        if focused {
            self.begin_capture();
        } else if self
            .services
            .arbiter
            .acquire(channels::DIALOG, self.observer.clone(), INTERFACE)
        {
            self.holds_focus = true;
        } else {
            self.fail_start(AgentError::UnknownChannel(channels::DIALOG.to_string()));
        }
    }

    fn on_start_timeout(&mut self, id: u64) {
        if self.stage_of(id).map(Stage::is_starting).unwrap_or(false) {
            self.fail_start(AgentError::Timeout("recognition start"));
        }
    }

    fn on_focus(&mut self, state: FocusState) {
        self.focus = state;
        if state == FocusState::None {
            self.holds_focus = false;
        }
        let stage = match &self.session {
            Some(session) => session.stage,
            None => return,
        };
        match (stage, state) {
            (Stage::AwaitingFocus, FocusState::Foreground) => self.begin_capture(),
            (Stage::AwaitingFocus, _) => {
                self.fail_start(AgentError::FocusDenied(channels::DIALOG.to_string()))
            }
            (Stage::Capturing, FocusState::None) => {
                info!("focus lost while capturing; cancelling recognition");
                self.finish_session(RecognitionResult::Cancel);
            }
            (Stage::Capturing, FocusState::Background) => {
                debug!("dialog channel backgrounded; capture continues without it");
                self.release_focus();
            }
            _ => {}
        }
    }

    fn make_processor(&self, mode: EndpointMode) -> AgentResult<Box<dyn SpeechProcessor>> {
        match (mode, &self.detector) {
            (EndpointMode::Server, _) => Ok(Box::new(ServerEpdProcessor::new(self.input.clone()))),
            (EndpointMode::Client, Some(detector)) => Ok(Box::new(ClientEpdProcessor::new(
                self.input.clone(),
                detector.clone(),
            ))),
            (EndpointMode::Client, None) => Err(AgentError::invalid_state(
                "client endpointing",
                "no end-point detector",
            )),
        }
    }

    fn begin_capture(&mut self) {
        let (id, mode, listen_timeout) = match &self.session {
            Some(s) => (
                s.id,
                s.mode,
                s.request.listen_timeout.unwrap_or(self.config.listen_timeout),
            ),
            None => return,
        };
        let mut processor = match self.make_processor(mode) {
            Ok(processor) => processor,
            Err(e) => return self.fail_start(e),
        };
        let mailbox = self.mailbox.clone();
        let callback: ProcessorCallback = Arc::new(move |event| {
            mailbox.post(move |core| core.on_processor_event(id, event));
        });
        if let Err(e) = processor.start(listen_timeout, callback) {
            return self.fail_start(e);
        }

        let mailbox = self.mailbox.clone();
        let listen_timer = self.services.scheduler.schedule(listen_timeout, move || {
            mailbox.post(move |core| core.on_listen_timeout(id));
        });
        let dialog_request_id = match self.session.as_mut() {
            Some(session) => {
                session.cancel_timers();
                session.timers.push(listen_timer);
                session.processor = Some(processor);
                session.stage = Stage::Capturing;
                if let Some(starter) = session.starter.take() {
                    starter.fire(Ok(()));
                }
                session.dialog_request_id.clone()
            }
            None => return,
        };
        self.set_state(AsrState::Listening, &dialog_request_id);
        if mode == EndpointMode::Server {
            self.send_recognize();
        }
    }

    fn send_recognize(&mut self) {
        let (id, event) = match self.session.as_mut() {
            Some(session) if !session.recognize_sent => {
                session.recognize_sent = true;
                let payload = json!({
                    "playServiceId": session.request.play_service_id,
                    "endpointing": session.mode.wire_name(),
                    "asrContext": session.request.asr_context,
                });
                let mut event = session.event("Recognize", payload);
                event.context = Some(session.context.clone().unwrap_or_else(|| json!({})));
                (session.id, event)
            }
            _ => return,
        };
        let mailbox = self.mailbox.clone();
        self.services.send_event_then(event, move |status| {
            if !status.is_success() {
                warn!(?status, "Recognize event failed");
                mailbox.post(move |core| {
                    if core.stage_of(id).is_some() {
                        core.finish_session(RecognitionResult::Error(ErrorType::Network));
                    }
                });
            }
        });
    }

    fn on_processor_event(&mut self, id: u64, event: ProcessorEvent) {
        if self.stage_of(id).is_none() {
            debug!(?event, "recognizer event for a finished session");
            return;
        }
        match event {
            ProcessorEvent::SpeechStart => self.on_speech_start(),
            ProcessorEvent::SpeechEnd => self.on_speech_end(true),
            ProcessorEvent::Timeout => self.on_listen_timeout(id),
            ProcessorEvent::Error(reason) => {
                warn!(reason = reason.as_str(), "recognizer back-end failed");
                self.finish_session(RecognitionResult::Error(ErrorType::AudioInput));
            }
        }
    }

    fn on_speech_start(&mut self) {
        if self.state != AsrState::Listening {
            return;
        }
        let (dialog_request_id, mode) = match self.session.as_mut() {
            Some(session) => {
                session.cancel_timers();
                (session.dialog_request_id.clone(), session.mode)
            }
            None => return,
        };
        self.set_state(AsrState::Recognizing, &dialog_request_id);
        if mode == EndpointMode::Client {
            self.send_recognize();
        }
    }

    /// Capture is over; wait for the result. `send_stop` tells the service
    /// to stop recognizing, which it needs unless it found the end itself.
    fn on_speech_end(&mut self, send_stop: bool) {
        if !matches!(self.state, AsrState::Listening | AsrState::Recognizing) {
            return;
        }
        let timeout = self.config.response_timeout;
        let scheduler = self.services.scheduler.clone();
        let mailbox = self.mailbox.clone();
        let (dialog_request_id, stop_event) = match self.session.as_mut() {
            Some(session) => {
                session.cancel_timers();
                if let Some(mut processor) = session.processor.take() {
                    processor.stop();
                }
                session.stage = Stage::Busy;
                let id = session.id;
                session.timers.push(scheduler.schedule(timeout, move || {
                    mailbox.post(move |core| core.on_response_timeout(id));
                }));
                let stop_event = if send_stop && session.recognize_sent {
                    Some(session.event("StopRecognize", json!({})))
                } else {
                    None
                };
                (session.dialog_request_id.clone(), stop_event)
            }
            None => return,
        };
        if let Some(event) = stop_event {
            self.services.send_event(event);
        }
        self.release_focus();
        self.set_state(AsrState::Busy, &dialog_request_id);
    }

    fn on_listen_timeout(&mut self, id: u64) {
        if self.stage_of(id) != Some(Stage::Capturing) || self.state != AsrState::Listening {
            return;
        }
        if let Some(session) = &self.session {
            let event = session.event("ListenTimeout", session.play_service_payload());
            self.services.send_event(event);
        }
        self.finish_session(RecognitionResult::Error(ErrorType::ListeningTimeout));
    }

    fn on_response_timeout(&mut self, id: u64) {
        if self.stage_of(id) != Some(Stage::Busy) {
            return;
        }
        if let Some(session) = &self.session {
            let event = session.event("ResponseTimeout", session.play_service_payload());
            self.services.send_event(event);
        }
        self.finish_session(RecognitionResult::Error(ErrorType::ResponseTimeout));
    }

    fn fail_start(&mut self, err: AgentError) {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => return,
        };
        warn!(error = %err, "recognition could not start");
        session.cancel_timers();
        if let Some(mut processor) = session.processor.take() {
            processor.stop();
        }
        self.release_focus();
        self.set_state(AsrState::Idle, &session.dialog_request_id);
        if let Some(handle) = session.expect.take() {
            handle.set_failed(&err.to_string());
        }
        if let Some(starter) = session.starter.take() {
            starter.fire(Err(err));
        }
    }

    fn finish_session(&mut self, result: RecognitionResult) {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => return,
        };
        session.cancel_timers();
        if let Some(mut processor) = session.processor.take() {
            processor.stop();
        }
        if result == RecognitionResult::Cancel
            && session.recognize_sent
            && session.stage == Stage::Capturing
        {
            self.services
                .send_event(session.event("StopRecognize", json!({})));
        }
        self.release_focus();
        if let Some(starter) = session.starter.take() {
            starter.fire(Err(AgentError::Abandoned("recognition start")));
        }

        let dialog_request_id = session.dialog_request_id.clone();
        info!(?result, dialog_request_id = dialog_request_id.as_str(), "recognition finished");
        for listener in &self.listeners {
            listener.on_result(&result, &dialog_request_id);
        }
        self.set_state(AsrState::Idle, &dialog_request_id);
        if let Some(handle) = session.expect.take() {
            match result {
                RecognitionResult::Error(error) => handle.set_failed(&format!("{:?}", error)),
                RecognitionResult::Cancel => handle.set_failed("cancelled"),
                _ => handle.set_completed(),
            };
        }
    }

    fn stop_recognition(&mut self, cancel: bool) {
        if self.session.is_none() {
            return;
        }
        if cancel {
            self.finish_session(RecognitionResult::Cancel);
        } else {
            self.on_speech_end(true);
        }
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

    fn pre_handle_expect(&mut self, handle: DirectiveHandle, payload: ExpectSpeechPayload) {
        if let Some(old) = self.expect.take() {
            old.handle.set_failed("superseded by a newer ExpectSpeech");
        }
        let dialog_request_id = handle.dialog_request_id().to_string();
        self.expect = Some(PendingExpect { handle, payload });
        if self.state == AsrState::Idle {
            self.set_state(AsrState::ExpectingSpeech, &dialog_request_id);
        }
    }

    fn handle_expect(&mut self, message_id: &str) {
        let pending = match self.expect.take() {
            Some(pending) if pending.handle.message_id() == message_id => pending,
            other => {
                self.expect = other;
                warn!(message_id, "handle for an ExpectSpeech that is not pending");
                return;
            }
        };
        let PendingExpect { handle, payload } = pending;
        let request = RecognitionRequest {
            play_service_id: payload.play_service_id,
            referrer_dialog_request_id: Some(handle.dialog_request_id().to_string()),
            asr_context: payload.asr_context,
            listen_timeout: payload.timeout_in_milliseconds.map(Duration::from_millis),
        };
        self.start_session(request, Some(handle), None);
    }

    fn cancel_expect(&mut self, message_id: &str) {
        let pending = self
            .expect
            .as_ref()
            .map(|p| p.handle.message_id() == message_id)
            .unwrap_or(false);
        if pending {
            self.expect = None;
            if self.state == AsrState::ExpectingSpeech && self.session.is_none() {
                self.set_state(AsrState::Idle, "");
            }
            return;
        }
        let active = self
            .session
            .as_ref()
            .and_then(|s| s.expect.as_ref())
            .map(|h| h.message_id() == message_id)
            .unwrap_or(false);
        if active {
            self.finish_session(RecognitionResult::Cancel);
        }
    }

    fn notify_result(&mut self, handle: DirectiveHandle, payload: NotifyResultPayload) {
        let ours = self
            .session
            .as_ref()
            .map(|s| s.dialog_request_id == handle.dialog_request_id())
            .unwrap_or(false);
        if !ours {
            debug!(
                dialog_request_id = handle.dialog_request_id(),
                "result for a session that is gone"
            );
            handle.set_completed();
            return;
        }
        let text = payload.result.unwrap_or_default();
        match payload.state {
            ResultState::Sos => self.on_speech_start(),
            ResultState::Eos => self.on_speech_end(false),
            ResultState::Partial => {
                let result = RecognitionResult::Partial(text);
                for listener in &self.listeners {
                    listener.on_result(&result, handle.dialog_request_id());
                }
            }
            ResultState::Complete => self.finish_session(RecognitionResult::Complete(text)),
            ResultState::None => self.finish_session(RecognitionResult::NoMatch),
            ResultState::Error => self.finish_session(RecognitionResult::Error(ErrorType::Server)),
            ResultState::Fa => self.finish_session(RecognitionResult::Cancel),
        }
        handle.set_completed();
    }

    fn snapshot(&self) -> Value {
        json!({
            "version": VERSION,
            "state": self.state,
            "endpointing": self.endpoint_mode.wire_name(),
        })
    }
}

/// Speech-recognition capability agent.
pub struct AsrAgent {
    executor: Executor<AsrCore>,
    registry: DirectiveRegistry,
    config: AsrConfig,
}

impl AsrAgent {
    pub fn new(
        config: AsrConfig,
        services: AgentServices,
        input: Arc<dyn AudioInput>,
        detector: Option<Arc<dyn EndPointDetector>>,
    ) -> AgentResult<Arc<Self>> {
        let core_config = config.clone();
        let executor = Executor::spawn_with("asr", move |mailbox: Mailbox<AsrCore>| AsrCore {
            endpoint_mode: core_config.endpoint_mode,
            config: core_config,
            services,
            input,
            detector,
            observer: FocusRelay::observer(mailbox.clone(), AsrCore::on_focus),
            mailbox,
            focus: FocusState::None,
            holds_focus: false,
            state: AsrState::Idle,
            session: None,
            expect: None,
            listeners: Vec::new(),
            next_session: 0,
        })?;
        Ok(Arc::new(Self {
            executor,
            registry: DirectiveRegistry::new(),
            config,
        }))
    }

    fn mailbox(&self) -> Mailbox<AsrCore> {
        self.executor.mailbox()
    }

    /// Starts a recognition session and returns once capture is running.
    pub fn start_recognition(&self, request: RecognitionRequest) -> AgentResult<()> {
        let mailbox = self.mailbox();
        if mailbox.is_current() {
            return Err(AgentError::Reentrant(mailbox.name().to_string()));
        }
        let (gate, signal) = Gate::pair();
        mailbox.post(move |core| core.start_session(request, None, Some(signal)));
        gate.wait(self.config.start_timeout + START_MARGIN, "recognition start")?
    }

    /// Ends capture. With `cancel` the session is dropped; otherwise the
    /// agent waits for the result of what was captured so far.
    pub fn stop_recognition(&self, cancel: bool) {
        self.mailbox().post(move |core| core.stop_recognition(cancel));
    }

    /// Takes effect with the next session.
    pub fn set_endpoint_mode(&self, mode: EndpointMode) {
        self.mailbox().post(move |core| core.endpoint_mode = mode);
    }

    pub fn add_listener(&self, listener: Arc<dyn RecognitionListener>) {
        self.mailbox().post(move |core| core.listeners.push(listener));
    }

    pub fn state(&self) -> AgentResult<AsrState> {
        self.mailbox().call(|core| core.state, QUERY_TIMEOUT)
    }
}

impl CapabilityAgent for AsrAgent {
    fn namespace(&self) -> &'static str {
        NAMESPACE
    }

    fn configurations(&self) -> Vec<(NamespaceAndName, BlockingPolicy)> {
        vec![
            (
                NamespaceAndName::new(NAMESPACE, "ExpectSpeech"),
                BlockingPolicy::new(Medium::Audio, Some(Medium::AudioInput)),
            ),
            (
                NamespaceAndName::new(NAMESPACE, "NotifyResult"),
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
        let name = handle.directive().header.name.clone();
        match name.as_str() {
            "ExpectSpeech" => match ExpectSpeechPayload::parse(&handle.directive().payload) {
                Ok(payload) => {
                    self.mailbox()
                        .post(move |core| core.pre_handle_expect(handle, payload));
                    Ok(())
                }
                Err(e) => {
                    handle.set_failed(&e.to_string());
                    Err(e)
                }
            },
            "NotifyResult" => match NotifyResultPayload::parse(&handle.directive().payload) {
                Ok(_) => Ok(()),
                Err(e) => {
                    handle.set_failed(&e.to_string());
                    Err(e)
                }
            },
            other => {
                handle.set_failed("unsupported directive");
                Err(AgentError::UnknownDirective(format!("{}.{}", NAMESPACE, other)))
            }
        }
    }

    fn handle(&self, message_id: &str) -> bool {
        let handle = match self.registry.handle(message_id) {
            Some(handle) => handle,
            None => return false,
        };
        if handle.directive().header.name == "NotifyResult" {
            let parsed = NotifyResultPayload::parse(&handle.directive().payload);
            match parsed {
                Ok(payload) => {
                    self.mailbox()
                        .post(move |core| core.notify_result(handle, payload));
                }
                Err(e) => {
                    handle.set_failed(&e.to_string());
                }
            }
        } else {
            let message_id = message_id.to_string();
            self.mailbox()
                .post(move |core| core.handle_expect(&message_id));
        }
        true
    }

    fn cancel(&self, message_id: &str) {
        let mailbox = self.mailbox();
        self.registry.cancel(message_id, |handle| {
            let message_id = handle.message_id().to_string();
            mailbox.post(move |core| core.cancel_expect(&message_id));
        });
    }

    fn state_snapshot(&self) -> Option<Value> {
        self.mailbox().call(|core| core.snapshot(), QUERY_TIMEOUT).ok()
    }
}

impl ContextStateProvider for AsrAgent {
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
    use crate::device::EpdEvent;
    use crate::directive::test_support::directive_in_dialog;
    use crate::executor::lock;
    use crate::focus::test_support::RecordingObserver;
    use crate::lifecycle::test_support::RecordingSink;
    use crate::sim::{RecordingSender, SimAudioInput, SimEndPointDetector};
    use std::sync::Mutex;

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<AsrState>>,
        results: Mutex<Vec<RecognitionResult>>,
    }

    impl RecognitionListener for Recorder {
        fn on_state_changed(&self, state: AsrState, _dialog_request_id: &str) {
            lock(&self.states).push(state);
        }

        fn on_result(&self, result: &RecognitionResult, _dialog_request_id: &str) {
            lock(&self.results).push(result.clone());
        }
    }

    struct Fixture {
        agent: Arc<AsrAgent>,
        input: Arc<SimAudioInput>,
        detector: Arc<SimEndPointDetector>,
        sender: Arc<RecordingSender>,
        services: AgentServices,
        recorder: Arc<Recorder>,
        sink: Arc<RecordingSink>,
    }

    fn fixture(config: AsrConfig) -> Fixture {
        let sender = Arc::new(RecordingSender::default());
        let services = services(sender.clone(), Duration::from_secs(1));
        let input = Arc::new(SimAudioInput::default());
        let detector = Arc::new(SimEndPointDetector::new(services.scheduler.clone(), None));
        let agent = AsrAgent::new(
            config,
            services.clone(),
            input.clone(),
            Some(detector.clone() as Arc<dyn EndPointDetector>),
        )
        .unwrap();
        let recorder = Arc::new(Recorder::default());
        agent.add_listener(recorder.clone());
        Fixture {
            agent,
            input,
            detector,
            sender,
            services,
            recorder,
            sink: Arc::new(RecordingSink::default()),
        }
    }

    fn mode(endpoint_mode: EndpointMode) -> AsrConfig {
        AsrConfig {
            endpoint_mode,
            ..AsrConfig::default()
        }
    }

    impl Fixture {
        fn wait_state(&self, state: AsrState) -> bool {
            wait_until(WAIT, || self.agent.state().unwrap() == state)
        }

        fn recognize_dialog(&self) -> String {
            self.sender
                .wait_for("ASR.Recognize", WAIT)
                .unwrap()
                .header
                .dialog_request_id
        }

        fn notify(&self, id: &str, dialog: &str, state: &str) {
            let payload = format!(r#"{{"state":"{}","result":"turn on the light"}}"#, state);
            let directive = directive_in_dialog("ASR", "NotifyResult", id, dialog, &payload);
            self.agent.pre_handle(directive, self.sink.clone()).unwrap();
            assert!(self.agent.handle(id));
        }
    }

    #[test]
    fn test_client_epd_session_walks_all_states() {
        let f = fixture(mode(EndpointMode::Client));
        f.agent.start_recognition(RecognitionRequest::default()).unwrap();
        assert_eq!(f.agent.state().unwrap(), AsrState::Listening);
        assert!(f.input.is_acquired());
        assert_eq!(f.sender.count("ASR.Recognize"), 0);

        f.detector.emit(EpdEvent::SpeechStart);
        assert!(f.wait_state(AsrState::Recognizing));
        let dialog = f.recognize_dialog();

        f.detector.emit(EpdEvent::SpeechEnd);
        assert!(f.wait_state(AsrState::Busy));
        assert!(f.sender.wait_for("ASR.StopRecognize", WAIT).is_some());
        assert!(!f.input.is_acquired());
        assert_eq!(f.services.arbiter.focus_state(channels::DIALOG), FocusState::None);

        f.notify("r1", &dialog, "COMPLETE");
        assert!(f.wait_state(AsrState::Idle));
        assert_eq!(
            *lock(&f.recorder.states),
            vec![
                AsrState::Listening,
                AsrState::Recognizing,
                AsrState::Busy,
                AsrState::Idle
            ]
        );
        assert_eq!(
            *lock(&f.recorder.results),
            vec![RecognitionResult::Complete("turn on the light".into())]
        );
        assert_eq!(f.sink.outcome_of("r1").unwrap(), "completed");
    }

    #[test]
    fn test_server_epd_recognizes_immediately() {
        let f = fixture(mode(EndpointMode::Server));
        f.agent
            .start_recognition(RecognitionRequest {
                play_service_id: Some("svc".into()),
                ..RecognitionRequest::default()
            })
            .unwrap();
        let recognize = f.sender.wait_for("ASR.Recognize", WAIT).unwrap();
        assert_eq!(recognize.payload["endpointing"], "SERVER");
        assert_eq!(recognize.payload["playServiceId"], "svc");
        assert!(recognize.context.is_some());
        let dialog = recognize.header.dialog_request_id;

        f.notify("r1", &dialog, "SOS");
        assert!(f.wait_state(AsrState::Recognizing));
        f.notify("r2", &dialog, "PARTIAL");
        f.notify("r3", &dialog, "EOS");
        assert!(f.wait_state(AsrState::Busy));
        assert_eq!(f.sender.count("ASR.StopRecognize"), 0);
        f.notify("r4", &dialog, "NONE");
        assert!(f.wait_state(AsrState::Idle));
        assert_eq!(
            *lock(&f.recorder.results),
            vec![
                RecognitionResult::Partial("turn on the light".into()),
                RecognitionResult::NoMatch
            ]
        );
    }

    #[test]
    fn test_focus_loss_cancels_capture() {
        let f = fixture(mode(EndpointMode::Server));
        f.agent.start_recognition(RecognitionRequest::default()).unwrap();
        let dialog = f.recognize_dialog();
        f.notify("r1", &dialog, "SOS");
        assert!(f.wait_state(AsrState::Recognizing));

        let intruder = Arc::new(RecordingObserver::default());
        f.services
            .arbiter
            .acquire(channels::DIALOG, intruder, "Intruder");
        assert!(f.wait_state(AsrState::Idle));
        assert!(!f.input.is_acquired());
        assert_eq!(*lock(&f.recorder.results), vec![RecognitionResult::Cancel]);
    }

    #[test]
    fn test_background_keeps_capturing() {
        let f = fixture(mode(EndpointMode::Server));
        f.agent.start_recognition(RecognitionRequest::default()).unwrap();
        let call = Arc::new(RecordingObserver::default());
        f.services.arbiter.acquire(channels::CALL, call, "Call");
        assert!(wait_until(WAIT, || f
            .services
            .arbiter
            .holder_interface(channels::DIALOG)
            .is_none()));
        assert_eq!(f.agent.state().unwrap(), AsrState::Listening);
        assert!(f.input.is_acquired());
    }

    #[test]
    fn test_second_start_is_refused() {
        let f = fixture(mode(EndpointMode::Server));
        f.agent.start_recognition(RecognitionRequest::default()).unwrap();
        let err = f
            .agent
            .start_recognition(RecognitionRequest::default())
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidState { .. }));
        assert_eq!(f.input.acquisitions(), 1);
    }

    #[test]
    fn test_start_while_busy_cancels_busy_session() {
        let f = fixture(mode(EndpointMode::Server));
        f.agent.start_recognition(RecognitionRequest::default()).unwrap();
        let dialog = f.recognize_dialog();
        f.notify("r1", &dialog, "EOS");
        assert!(f.wait_state(AsrState::Busy));
        f.agent.start_recognition(RecognitionRequest::default()).unwrap();
        assert_eq!(f.agent.state().unwrap(), AsrState::Listening);
        assert_eq!(*lock(&f.recorder.results), vec![RecognitionResult::Cancel]);
        assert_eq!(f.input.acquisitions(), 2);
    }

    #[test]
    fn test_listening_timeout() {
        let f = fixture(AsrConfig {
            listen_timeout: Duration::from_millis(50),
            ..AsrConfig::default()
        });
        f.agent.start_recognition(RecognitionRequest::default()).unwrap();
        assert!(f.wait_state(AsrState::Idle));
        assert!(f.sender.wait_for("ASR.ListenTimeout", WAIT).is_some());
        assert_eq!(
            *lock(&f.recorder.results),
            vec![RecognitionResult::Error(ErrorType::ListeningTimeout)]
        );
    }

    #[test]
    fn test_response_timeout_reports_play_service() {
        let f = fixture(AsrConfig {
            response_timeout: Duration::from_millis(50),
            ..AsrConfig::default()
        });
        f.agent
            .start_recognition(RecognitionRequest {
                play_service_id: Some("svc".into()),
                ..RecognitionRequest::default()
            })
            .unwrap();
        let dialog = f.recognize_dialog();
        f.notify("r1", &dialog, "SOS");
        f.notify("r2", &dialog, "EOS");
        let timeout = f.sender.wait_for("ASR.ResponseTimeout", WAIT).unwrap();
        assert_eq!(timeout.payload["playServiceId"], "svc");
        assert!(f.wait_state(AsrState::Idle));
        assert_eq!(
            *lock(&f.recorder.results),
            vec![RecognitionResult::Error(ErrorType::ResponseTimeout)]
        );
    }

    #[test]
    fn test_capture_failure_rolls_back() {
        let f = fixture(mode(EndpointMode::Server));
        f.input.set_unavailable(true);
        let err = f
            .agent
            .start_recognition(RecognitionRequest::default())
            .unwrap_err();
        assert!(matches!(err, AgentError::AudioInput(_)));
        assert_eq!(f.agent.state().unwrap(), AsrState::Idle);
        assert!(wait_until(WAIT, || f
            .services
            .arbiter
            .holder_interface(channels::DIALOG)
            .is_none()));
        assert_eq!(f.sender.count("ASR.Recognize"), 0);
    }

    #[test]
    fn test_expect_speech_resolves_with_session() {
        let f = fixture(mode(EndpointMode::Server));
        let expect = directive_in_dialog(
            "ASR",
            "ExpectSpeech",
            "e1",
            "d1",
            r#"{"playServiceId":"svc"}"#,
        );
        f.agent.pre_handle(expect, f.sink.clone()).unwrap();
        assert!(f.wait_state(AsrState::ExpectingSpeech));
        assert!(f.agent.handle("e1"));
        assert!(f.wait_state(AsrState::Listening));

        let recognize = f.sender.wait_for("ASR.Recognize", WAIT).unwrap();
        assert_eq!(recognize.header.referrer_dialog_request_id.as_deref(), Some("d1"));
        f.notify("r1", &recognize.header.dialog_request_id, "COMPLETE");
        assert!(wait_until(WAIT, || f.sink.outcome_of("e1").is_some()));
        assert_eq!(f.sink.outcome_of("e1").unwrap(), "completed");
    }

    #[test]
    fn test_cancelled_expect_speech_returns_to_idle() {
        let f = fixture(mode(EndpointMode::Server));
        let expect = directive_in_dialog("ASR", "ExpectSpeech", "e1", "d1", "{}");
        f.agent.pre_handle(expect, f.sink.clone()).unwrap();
        assert!(f.wait_state(AsrState::ExpectingSpeech));
        f.agent.cancel("e1");
        assert!(f.wait_state(AsrState::Idle));
        assert_eq!(f.sink.outcome_of("e1").unwrap(), "cancelled");
    }

    #[test]
    fn test_endpoint_mode_switch_waits_for_next_session() {
        let f = fixture(mode(EndpointMode::Server));
        f.agent.start_recognition(RecognitionRequest::default()).unwrap();
        f.agent.set_endpoint_mode(EndpointMode::Client);
        let dialog = f.recognize_dialog();
        // The running session still takes end points from the server.
        f.notify("r1", &dialog, "SOS");
        assert!(f.wait_state(AsrState::Recognizing));
        f.agent.stop_recognition(true);
        assert!(f.wait_state(AsrState::Idle));

        f.agent.start_recognition(RecognitionRequest::default()).unwrap();
        assert_eq!(f.sender.count("ASR.Recognize"), 1);
        f.detector.emit(EpdEvent::SpeechStart);
        assert!(f.sender.wait_for_count("ASR.Recognize", 2, WAIT));
        assert_eq!(
            f.agent.state_snapshot().unwrap()["endpointing"],
            "CLIENT"
        );
    }

    #[test]
    fn test_stale_result_is_ignored() {
        let f = fixture(mode(EndpointMode::Server));
        f.agent.start_recognition(RecognitionRequest::default()).unwrap();
        f.notify("r1", "some-other-dialog", "COMPLETE");
        assert_eq!(f.agent.state().unwrap(), AsrState::Listening);
        assert!(wait_until(WAIT, || f.sink.outcome_of("r1").is_some()));
        assert!(lock(&f.recorder.results).is_empty());
    }
}
