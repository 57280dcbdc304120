//! Audio-player agent.
//!
//! `current` is the item bound to the media player and `next` holds at most
//! one pre-fetched `Play`. A queued play is promoted once it has been handled
//! and the current item has ended. A play that carries the current token
//! takes over the running source instead: it is resumed or sought in place.

mod payload;

pub use payload::{AudioItem, ControlPayload, PlayPayload, PlaybackEventPayload, Stream};

use crate::agent::{AgentServices, CapabilityAgent, FocusRelay, MediaRelay, SyncTicket};
use crate::context::ContextStateProvider;
use crate::device::{MediaEvent, MediaPlayer, MediaSource, SourceId};
use crate::directive::{BlockingPolicy, Directive, DirectiveResultSink, Medium, NamespaceAndName};
use crate::error::{AgentError, AgentResult};
use crate::executor::{Executor, Mailbox, TimerHandle};
use crate::focus::{channels, FocusObserver, FocusState};
use crate::lifecycle::{DirectiveHandle, DirectiveRegistry};
use crate::message::EventMessage;
use crate::playsync::{SyncResult, SynchronizeObject};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const NAMESPACE: &str = "AudioPlayer";
const VERSION: &str = "1.0";
const INTERFACE: &str = "AudioPlayer";
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct AudioPlayerConfig {
    /// A source paused this long is stopped.
    pub paused_auto_stop: Duration,
    /// How long a finished item keeps its play group alive.
    pub release_grace: Duration,
    /// Longest wait for the player to confirm a stop.
    pub stop_timeout: Duration,
}

impl Default for AudioPlayerConfig {
    fn default() -> Self {
        Self {
            paused_auto_stop: Duration::from_secs(600),
            release_grace: Duration::from_secs(3),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioPlayerState {
    Idle,
    Playing,
    Paused,
    Stopped,
    Finished,
}

/// Why playback is paused. No reason means focus took it away, and regaining
/// focus resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    ByPauseDirective,
    ByPlayDirectiveForResume,
    /// A handled play waits behind the paused item until focus returns.
    ByPlayDirectiveForNextPlay,
}

pub trait AudioPlayerListener: Send + Sync {
    fn on_state_changed(&self, state: AudioPlayerState, token: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Ending {
    Finished,
    Stopped,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemPhase {
    Queued,
    AwaitingFocus,
    Starting,
    Active,
    Stopping,
}

struct Item {
    id: u64,
    handle: DirectiveHandle,
    payload: PlayPayload,
    sync: Arc<dyn SynchronizeObject>,
    handled: bool,
    phase: ItemPhase,
    source: Option<SourceId>,
    started: bool,
    /// A pause that arrived before playback started.
    pause_on_start: bool,
    stop_guard: Option<TimerHandle>,
}

impl Item {
    fn token(&self) -> &str {
        self.payload.token()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

struct AudioPlayerCore {
    config: AudioPlayerConfig,
    services: AgentServices,
    player: Arc<dyn MediaPlayer>,
    mailbox: Mailbox<AudioPlayerCore>,
    observer: Arc<dyn FocusObserver>,
    focus: FocusState,
    holds_focus: bool,
    state: AudioPlayerState,
    current: Option<Item>,
    next: Option<Item>,
    pause_reason: Option<PauseReason>,
    pause_timer: Option<TimerHandle>,
    listeners: Vec<Arc<dyn AudioPlayerListener>>,
    next_id: u64,
}

impl AudioPlayerCore {
    fn set_state(&mut self, state: AudioPlayerState, token: &str) {
        if self.state == state {
            return;
        }
        info!(from = ?self.state, to = ?state, token, "audio player state changed");
        self.state = state;
        for listener in &self.listeners {
            listener.on_state_changed(state, token);
        }
    }

    fn playback_event(&self, name: &str, item: &Item) -> EventMessage {
        let offset = item
            .source
            .and_then(|source| self.player.offset(source))
            .unwrap_or(Duration::ZERO);
        let payload = PlaybackEventPayload {
            play_service_id: item.payload.play_service_id.clone(),
            token: item.token().to_string(),
            offset_in_milliseconds: millis(offset),
        };
        EventMessage::builder(NAMESPACE, name, VERSION)
            .payload(json!(payload))
            .referrer_dialog_request_id(Some(item.handle.dialog_request_id().to_string()))
            .build()
    }

    fn pre_handle_play(&mut self, handle: DirectiveHandle, payload: PlayPayload) {
        self.drop_next("superseded by a newer play");
        self.next_id += 1;
        let sync = SyncTicket::new(
            self.next_id,
            handle.dialog_request_id(),
            payload.play_service_id.clone(),
            self.mailbox.clone(),
            AudioPlayerCore::on_release_requested,
        );
        self.services.playsync.prepare_sync(&sync);
        debug!(message_id = handle.message_id(), token = payload.token(), "play queued");
        self.next = Some(Item {
            id: self.next_id,
            handle,
            payload,
            sync,
            handled: false,
            phase: ItemPhase::Queued,
            source: None,
            started: false,
            pause_on_start: false,
            stop_guard: None,
        });
    }

    fn drop_next(&mut self, reason: &str) {
        if let Some(next) = self.next.take() {
            debug!(message_id = next.handle.message_id(), reason, "queued play dropped");
            self.services.playsync.release_sync(&next.sync, None);
            next.handle.set_failed(reason);
        }
    }

    fn handle_play(&mut self, message_id: &str) {
        match self.next.as_mut() {
            Some(next) if next.handle.message_id() == message_id => next.handled = true,
            _ => {
                warn!(message_id, "handle for a play that is not queued");
                return;
            }
        }
        let same_token = match (&self.current, &self.next) {
            (Some(current), Some(next)) => {
                current.token() == next.token() && current.phase != ItemPhase::Stopping
            }
            _ => false,
        };
        if same_token {
            self.play_in_place();
            return;
        }
        match self.current.as_ref().map(|c| c.phase) {
            None => self.promote_next(),
            Some(ItemPhase::Stopping) => {}
            Some(ItemPhase::Active)
                if self.state == AudioPlayerState::Paused
                    && self.focus != FocusState::Foreground =>
            {
                debug!(message_id, "next play waits for focus behind the paused item");
                self.pause_reason = Some(PauseReason::ByPlayDirectiveForNextPlay);
            }
            Some(_) => self.stop_current(),
        }
    }

    /// The queued play takes over the current item without a new source.
    fn play_in_place(&mut self) {
        let next = match self.next.take() {
            Some(next) => next,
            None => return,
        };
        let current = match self.current.as_mut() {
            Some(current) => current,
            None => return,
        };
        let old_handle = std::mem::replace(&mut current.handle, next.handle);
        let old_sync = std::mem::replace(&mut current.sync, next.sync);
        current.payload = next.payload;
        current.id = next.id;
        current.pause_on_start = false;
        if matches!(current.phase, ItemPhase::Starting | ItemPhase::Active) {
            self.services.playsync.start_sync(&current.sync);
        }
        self.services.playsync.release_sync(&old_sync, None);
        old_handle.set_completed();

        let source = current.source;
        let offset = current.payload.offset();
        info!(token = current.token(), "same token; playing in place");
        if let Some(source) = source {
            if !offset.is_zero() {
                self.player.seek(source, offset);
            }
        }
        if self.state == AudioPlayerState::Paused {
            if self.holds_focus && self.focus == FocusState::Foreground {
                self.pause_reason = None;
                if let Some(source) = source {
                    self.player.resume(source);
                }
            } else {
                self.pause_reason = Some(PauseReason::ByPlayDirectiveForResume);
                self.acquire_focus();
            }
        }
    }

    fn promote_next(&mut self) {
        let mut item = match self.next.take() {
            Some(next) if next.handled => next,
            other => {
                self.next = other;
                return;
            }
        };
        item.phase = ItemPhase::AwaitingFocus;
        self.pause_reason = None;
        self.current = Some(item);
        if self.holds_focus && self.focus == FocusState::Foreground {
            self.start_item();
        } else {
            self.acquire_focus();
        }
    }

    fn acquire_focus(&mut self) {
        if self.holds_focus {
            return;
        }
        if self
            .services
            .arbiter
            .acquire(channels::CONTENT, self.observer.clone(), INTERFACE)
        {
            self.holds_focus = true;
        } else {
            self.finish_current(Ending::Failed("content channel unavailable".to_string()));
        }
    }

    fn release_focus(&mut self) {
        if self.holds_focus {
            self.services
                .arbiter
                .release(channels::CONTENT, &self.observer);
            self.holds_focus = false;
        }
        self.focus = FocusState::None;
    }

    fn start_item(&mut self) {
        let failure = {
            let current = match self.current.as_mut() {
                Some(current) if current.phase == ItemPhase::AwaitingFocus => current,
                _ => return,
            };
            if self.services.playsync.start_sync(&current.sync) == SyncResult::Denied {
                info!(token = current.token(), "play was released before it started");
                Some(Ending::Stopped)
            } else {
                let media = MediaSource::Url(current.payload.audio_item.stream.url.clone());
                match self.player.set_source(&media) {
                    Ok(source) => {
                        current.source = Some(source);
                        current.phase = ItemPhase::Starting;
                        let offset = current.payload.offset();
                        if !offset.is_zero() {
                            self.player.seek(source, offset);
                        }
                        if self.player.play(source) {
                            None
                        } else {
                            Some(Ending::Failed("player refused to play".to_string()))
                        }
                    }
                    Err(e) => Some(Ending::Failed(e.to_string())),
                }
            }
        };
        if let Some(ending) = failure {
            self.finish_current(ending);
        }
    }

    fn on_media(&mut self, source: SourceId, event: MediaEvent) {
        let phase = match &self.current {
            Some(current) if current.source == Some(source) => current.phase,
            _ => {
                debug!(source, ?event, "media event for an item that is gone");
                return;
            }
        };
        match event {
            MediaEvent::Started if phase == ItemPhase::Starting => self.on_started(),
            MediaEvent::Started => {}
            MediaEvent::Paused => self.on_paused(),
            MediaEvent::Resumed => self.on_resumed(),
            MediaEvent::Stopped => self.finish_current(Ending::Stopped),
            MediaEvent::Finished => self.finish_current(Ending::Finished),
            MediaEvent::Error(reason) => {
                warn!(source, reason = reason.as_str(), "playback failed");
                self.finish_current(Ending::Failed(reason));
            }
        }
    }

    fn on_started(&mut self) {
        let token = match self.current.as_mut() {
            Some(current) => {
                current.phase = ItemPhase::Active;
                current.started = true;
                current.token().to_string()
            }
            None => return,
        };
        self.set_state(AudioPlayerState::Playing, &token);
        let pause_on_start = match &self.current {
            Some(current) => {
                self.services
                    .send_event(self.playback_event("PlaybackStarted", current));
                current.pause_on_start
            }
            None => return,
        };
        if pause_on_start {
            self.pause_playback(Some(PauseReason::ByPauseDirective));
        } else if self.focus != FocusState::Foreground {
            self.pause_playback(None);
        }
    }

    fn on_paused(&mut self) {
        let (id, event) = match &self.current {
            Some(current) => (current.id, self.playback_event("PlaybackPaused", current)),
            None => return,
        };
        let token = self.current_token();
        self.set_state(AudioPlayerState::Paused, &token);
        self.services.send_event(event);

        self.cancel_pause_timer();
        let mailbox = self.mailbox.clone();
        self.pause_timer = Some(self.services.scheduler.schedule(
            self.config.paused_auto_stop,
            move || {
                mailbox.post(move |core| core.on_pause_expired(id));
            },
        ));
    }

    fn on_resumed(&mut self) {
        self.cancel_pause_timer();
        self.pause_reason = None;
        let event = match &self.current {
            Some(current) => self.playback_event("PlaybackResumed", current),
            None => return,
        };
        let token = self.current_token();
        self.set_state(AudioPlayerState::Playing, &token);
        self.services.send_event(event);
    }

    fn on_pause_expired(&mut self, id: u64) {
        let paused = self.state == AudioPlayerState::Paused
            && self.current.as_ref().map(|c| c.id == id).unwrap_or(false);
        if paused {
            info!(after = ?self.config.paused_auto_stop, "paused too long; stopping");
            self.stop_current();
        }
    }

    fn cancel_pause_timer(&mut self) {
        if let Some(timer) = self.pause_timer.take() {
            timer.cancel();
        }
    }

    fn current_token(&self) -> String {
        self.current
            .as_ref()
            .map(|c| c.token().to_string())
            .unwrap_or_default()
    }

    fn pause_playback(&mut self, reason: Option<PauseReason>) {
        let source = match &self.current {
            Some(current) if current.phase == ItemPhase::Active => current.source,
            _ => return,
        };
        self.pause_reason = reason;
        if let Some(source) = source {
            self.player.pause(source);
        }
    }

    fn pause_by_directive(&mut self) {
        match self.current.as_mut() {
            Some(current)
                if matches!(current.phase, ItemPhase::AwaitingFocus | ItemPhase::Starting) =>
            {
                debug!(token = current.token(), "pause held until playback starts");
                current.pause_on_start = true;
            }
            _ => self.pause_playback(Some(PauseReason::ByPauseDirective)),
        }
    }

    fn resume_playback(&mut self) {
        if let Some(current) = self.current.as_mut() {
            current.pause_on_start = false;
        }
        if self.state != AudioPlayerState::Paused {
            return;
        }
        self.pause_reason = None;
        if self.holds_focus && self.focus == FocusState::Foreground {
            if let Some(source) = self.current.as_ref().and_then(|c| c.source) {
                self.player.resume(source);
            }
        } else {
            self.acquire_focus();
        }
    }

    fn stop_current(&mut self) {
        let next = match self.current.as_mut() {
            None => return,
            Some(current) => match current.phase {
                ItemPhase::Queued | ItemPhase::AwaitingFocus => Some(Ending::Stopped),
                ItemPhase::Starting | ItemPhase::Active => {
                    current.phase = ItemPhase::Stopping;
                    match current.source {
                        Some(source) if self.player.stop(source) => {
                            let (id, mailbox) = (current.id, self.mailbox.clone());
                            current.stop_guard = Some(self.services.scheduler.schedule(
                                self.config.stop_timeout,
                                move || {
                                    mailbox.post(move |core| core.on_stop_expired(id));
                                },
                            ));
                            None
                        }
                        _ => Some(Ending::Stopped),
                    }
                }
                ItemPhase::Stopping => None,
            },
        };
        if let Some(ending) = next {
            self.finish_current(ending);
        }
    }

    fn on_stop_expired(&mut self, id: u64) {
        let stuck = self
            .current
            .as_ref()
            .map(|c| c.id == id && c.phase == ItemPhase::Stopping)
            .unwrap_or(false);
        if stuck {
            warn!(after = ?self.config.stop_timeout, "player never confirmed the stop");
            self.finish_current(Ending::Stopped);
        }
    }

    fn stop_all(&mut self) {
        self.drop_next("stopped");
        self.stop_current();
    }

    fn finish_current(&mut self, ending: Ending) {
        let item = match self.current.take() {
            Some(item) => item,
            None => return,
        };
        if let Some(guard) = &item.stop_guard {
            guard.cancel();
        }
        self.cancel_pause_timer();
        self.pause_reason = None;
        let token = item.token().to_string();
        match ending {
            Ending::Finished => {
                self.set_state(AudioPlayerState::Finished, &token);
                self.services
                    .send_event(self.playback_event("PlaybackFinished", &item));
                self.services
                    .playsync
                    .release_sync(&item.sync, Some(self.config.release_grace));
                item.handle.set_completed();
            }
            Ending::Stopped => {
                self.set_state(AudioPlayerState::Stopped, &token);
                if item.started {
                    self.services
                        .send_event(self.playback_event("PlaybackStopped", &item));
                }
                self.services.playsync.release_sync(&item.sync, None);
                item.handle.set_failed("stopped");
            }
            Ending::Failed(reason) => {
                self.set_state(AudioPlayerState::Stopped, &token);
                let mut event = self.playback_event("PlaybackFailed", &item);
                event.payload["error"] = json!({
                    "type": "MEDIA_ERROR_UNKNOWN",
                    "message": reason,
                });
                self.services.send_event(event);
                self.services.playsync.release_sync(&item.sync, None);
                item.handle.set_failed(&reason);
            }
        }

        if self.next_is_handled() {
            self.promote_next();
        } else {
            self.release_focus();
        }
    }

    fn next_is_handled(&self) -> bool {
        self.next.as_ref().map(|n| n.handled).unwrap_or(false)
    }

    fn on_focus(&mut self, state: FocusState) {
        self.focus = state;
        if state == FocusState::None {
            self.holds_focus = false;
        }
        let phase = match &self.current {
            Some(current) => current.phase,
            None => return,
        };
        match state {
            FocusState::Foreground => match phase {
                ItemPhase::AwaitingFocus => self.start_item(),
                ItemPhase::Active if self.state == AudioPlayerState::Paused => {
                    match self.pause_reason {
                        Some(PauseReason::ByPauseDirective) => {
                            debug!("paused by directive; focus does not resume")
                        }
                        Some(PauseReason::ByPlayDirectiveForNextPlay) if self.next_is_handled() => {
                            self.stop_current()
                        }
                        _ => self.resume_playback(),
                    }
                }
                _ => {}
            },
            FocusState::Background => {
                if phase == ItemPhase::Active && self.state == AudioPlayerState::Playing {
                    self.pause_playback(None);
                }
            }
            FocusState::None => {
                self.drop_next("content focus lost");
                self.stop_current();
            }
        }
    }

    fn on_release_requested(&mut self, id: u64, immediate: bool) {
        // A playing item outlives the rest of its group.
        if !immediate {
            return;
        }
        if self.current.as_ref().map(|c| c.id == id).unwrap_or(false) {
            self.stop_current();
        } else if self.next.as_ref().map(|n| n.id == id).unwrap_or(false) {
            self.drop_next("released with its play group");
        }
    }

    fn cancel_play(&mut self, message_id: &str) {
        if self
            .next
            .as_ref()
            .map(|n| n.handle.message_id() == message_id)
            .unwrap_or(false)
        {
            self.drop_next("cancelled");
        } else if self
            .current
            .as_ref()
            .map(|c| c.handle.message_id() == message_id)
            .unwrap_or(false)
        {
            self.stop_current();
        }
    }

    fn snapshot(&self) -> Value {
        let offset = self
            .current
            .as_ref()
            .and_then(|c| c.source)
            .and_then(|source| self.player.offset(source))
            .unwrap_or(Duration::ZERO);
        json!({
            "version": VERSION,
            "playerActivity": self.state,
            "token": self.current.as_ref().map(|c| c.token().to_string()),
            "offsetInMilliseconds": millis(offset),
        })
    }
}

/// Audio-player capability agent.
pub struct AudioPlayerAgent {
    executor: Executor<AudioPlayerCore>,
    registry: DirectiveRegistry,
}

impl AudioPlayerAgent {
    pub fn new(
        config: AudioPlayerConfig,
        services: AgentServices,
        player: Arc<dyn MediaPlayer>,
    ) -> AgentResult<Arc<Self>> {
        let core_player = player.clone();
        let executor = Executor::spawn_with(
            "audioplayer",
            move |mailbox: Mailbox<AudioPlayerCore>| AudioPlayerCore {
                config,
                services,
                player: core_player,
                observer: FocusRelay::observer(mailbox.clone(), AudioPlayerCore::on_focus),
                mailbox,
                focus: FocusState::None,
                holds_focus: false,
                state: AudioPlayerState::Idle,
                current: None,
                next: None,
                pause_reason: None,
                pause_timer: None,
                listeners: Vec::new(),
                next_id: 0,
            },
        )?;
        player.set_listener(MediaRelay::listener(
            executor.mailbox(),
            AudioPlayerCore::on_media,
        ));
        Ok(Arc::new(Self {
            executor,
            registry: DirectiveRegistry::new(),
        }))
    }

    fn mailbox(&self) -> Mailbox<AudioPlayerCore> {
        self.executor.mailbox()
    }

    pub fn add_listener(&self, listener: Arc<dyn AudioPlayerListener>) {
        self.mailbox().post(move |core| core.listeners.push(listener));
    }

    /// Stops playback and drops the queued play.
    pub fn stop(&self) {
        self.mailbox().post(|core| core.stop_all());
    }

    /// Pauses until [`AudioPlayerAgent::resume`]; regaining focus alone does
    /// not resume.
    pub fn pause(&self) {
        self.mailbox().post(|core| core.pause_by_directive());
    }

    pub fn resume(&self) {
        self.mailbox().post(|core| core.resume_playback());
    }

    pub fn state(&self) -> AgentResult<AudioPlayerState> {
        self.mailbox().call(|core| core.state, QUERY_TIMEOUT)
    }
}

impl CapabilityAgent for AudioPlayerAgent {
    fn namespace(&self) -> &'static str {
        NAMESPACE
    }

    fn configurations(&self) -> Vec<(NamespaceAndName, BlockingPolicy)> {
        vec![
            (
                NamespaceAndName::new(NAMESPACE, "Play"),
                BlockingPolicy::new(Medium::Audio, Some(Medium::Audio)),
            ),
            (
                NamespaceAndName::new(NAMESPACE, "Pause"),
                BlockingPolicy::NON_BLOCKING,
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
        let name = handle.directive().namespace_and_name().to_string();
        let parsed = match handle.directive().header.name.as_str() {
            "Play" => PlayPayload::parse(&handle.directive().payload).map(Some),
            "Pause" | "Stop" => ControlPayload::parse(&name, &handle.directive().payload).map(|_| None),
            _ => Err(AgentError::UnknownDirective(name)),
        };
        match parsed {
            Ok(Some(payload)) => {
                self.mailbox()
                    .post(move |core| core.pre_handle_play(handle, payload));
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                handle.set_failed(&e.to_string());
                Err(e)
            }
        }
    }

    fn handle(&self, message_id: &str) -> bool {
        let handle = match self.registry.handle(message_id) {
            Some(handle) => handle,
            None => return false,
        };
        match handle.directive().header.name.as_str() {
            "Play" => {
                let message_id = message_id.to_string();
                self.mailbox()
                    .post(move |core| core.handle_play(&message_id));
            }
            "Pause" => {
                self.mailbox().post(move |core| {
                    core.pause_by_directive();
                    handle.set_completed();
                });
            }
            _ => {
                self.mailbox().post(move |core| {
                    core.stop_all();
                    handle.set_completed();
                });
            }
        }
        true
    }

    fn cancel(&self, message_id: &str) {
        let mailbox = self.mailbox();
        self.registry.cancel(message_id, |handle| {
            let message_id = handle.message_id().to_string();
            mailbox.post(move |core| core.cancel_play(&message_id));
        });
    }

    fn state_snapshot(&self) -> Option<Value> {
        self.mailbox().call(|core| core.snapshot(), QUERY_TIMEOUT).ok()
    }
}

impl ContextStateProvider for AudioPlayerAgent {
    fn namespace(&self) -> String {
        NAMESPACE.to_string()
    }

    fn provide_state(&self, timeout: Duration) -> Option<Value> {
        self.mailbox().call(|core| core.snapshot(), timeout).ok()
    }
}
