//! Simulated devices.
//!
//! The daemon runs on these when no real audio stack is attached, and the
//! scenario tests use them to drive the agents step by step. With a
//! [`SimTiming`] the player finishes sources on its own; without one, sources
//! play until the test finishes them.

use crate::device::{
    AudioInput, EndPointDetector, EpdCallback, EpdEvent, MediaEvent, MediaPlayer,
    MediaPlayerListener, MediaSource, Renderer, SourceId,
};
use crate::display::DisplayAgent;
use crate::error::{AgentError, AgentResult};
use crate::executor::{lock, Scheduler, TimerHandle};
use crate::message::{EventMessage, MessageSender, SendCallback, SendStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct SimTiming {
    pub per_word: Duration,
    pub url_length: Duration,
}

impl Default for SimTiming {
    fn default() -> Self {
        Self {
            per_word: Duration::from_millis(300),
            url_length: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimSourceState {
    Loaded,
    Playing,
    Paused,
    Stopped,
    Finished,
}

struct SimSource {
    media: MediaSource,
    state: SimSourceState,
    offset: Duration,
    length: Option<Duration>,
    resumed_at: Option<Instant>,
    finish_timer: Option<TimerHandle>,
}

impl SimSource {
    fn position(&self) -> Duration {
        match self.resumed_at {
            Some(at) if self.state == SimSourceState::Playing => self.offset + at.elapsed(),
            _ => self.offset,
        }
    }

    fn freeze(&mut self) {
        self.offset = self.position();
        self.resumed_at = None;
        if let Some(timer) = self.finish_timer.take() {
            timer.cancel();
        }
    }
}

#[derive(Default)]
struct PlayerInner {
    listener: Option<Arc<dyn MediaPlayerListener>>,
    sources: HashMap<SourceId, SimSource>,
    next_id: SourceId,
    hold_start: bool,
    fail_next_source: bool,
}

type Shared = Arc<Mutex<PlayerInner>>;

/// In-memory media player.
pub struct SimPlayer {
    name: String,
    inner: Shared,
    scheduler: Arc<Scheduler>,
    timing: Option<SimTiming>,
}

impl SimPlayer {
    pub fn new(name: &str, scheduler: Arc<Scheduler>, timing: Option<SimTiming>) -> Self {
        Self {
            name: name.to_string(),
            inner: Arc::new(Mutex::new(PlayerInner::default())),
            scheduler,
            timing,
        }
    }

    /// When set, `play` does not report `Started` until [`SimPlayer::emit_started`].
    pub fn set_hold_start(&self, hold: bool) {
        lock(&self.inner).hold_start = hold;
    }

    /// Makes the next `set_source` fail.
    pub fn fail_next_source(&self) {
        lock(&self.inner).fail_next_source = true;
    }

    pub fn emit_started(&self, source: SourceId) {
        emit(&self.inner, source, MediaEvent::Started);
    }

    /// Plays `source` to its end.
    pub fn finish(&self, source: SourceId) {
        finish(&self.inner, source);
    }

    pub fn fail(&self, source: SourceId, reason: &str) {
        {
            let mut inner = lock(&self.inner);
            match inner.sources.get_mut(&source) {
                Some(s) => {
                    s.freeze();
                    s.state = SimSourceState::Stopped;
                }
                None => return,
            }
        }
        emit(&self.inner, source, MediaEvent::Error(reason.to_string()));
    }

    pub fn last_source(&self) -> Option<SourceId> {
        let inner = lock(&self.inner);
        inner.sources.keys().max().copied()
    }

    pub fn source_count(&self) -> usize {
        lock(&self.inner).sources.len()
    }

    pub fn state_of(&self, source: SourceId) -> Option<SimSourceState> {
        lock(&self.inner).sources.get(&source).map(|s| s.state)
    }

    pub fn media_of(&self, source: SourceId) -> Option<MediaSource> {
        lock(&self.inner).sources.get(&source).map(|s| s.media.clone())
    }

    /// Applies a state change and reports `event` when `allowed` accepts the
    /// current state.
    fn transition<F>(&self, source: SourceId, allowed: F, to: SimSourceState, event: MediaEvent) -> bool
    where
        F: Fn(SimSourceState) -> bool,
    {
        let report = {
            let mut inner = lock(&self.inner);
            let hold_start = inner.hold_start;
            let s = match inner.sources.get_mut(&source) {
                Some(s) if allowed(s.state) => s,
                _ => return false,
            };
            s.freeze();
            s.state = to;
            if to == SimSourceState::Playing {
                s.resumed_at = Some(Instant::now());
                arm(&self.scheduler, &self.inner, source, s);
            }
            !(event == MediaEvent::Started && hold_start)
        };
        debug!(player = self.name.as_str(), source, ?to, "sim player transition");
        if report {
            emit(&self.inner, source, event);
        }
        true
    }
}

fn arm(scheduler: &Scheduler, shared: &Shared, source: SourceId, s: &mut SimSource) {
    if let Some(length) = s.length {
        let remaining = length.saturating_sub(s.offset);
        let shared = shared.clone();
        s.finish_timer = Some(scheduler.schedule(remaining, move || finish(&shared, source)));
    }
}

fn emit(inner: &Shared, source: SourceId, event: MediaEvent) {
    let listener = lock(inner).listener.clone();
    if let Some(listener) = listener {
        listener.on_media_event(source, event);
    }
}

fn finish(inner: &Shared, source: SourceId) {
    {
        let mut guard = lock(inner);
        match guard.sources.get_mut(&source) {
            Some(s) if matches!(s.state, SimSourceState::Playing | SimSourceState::Paused) => {
                s.freeze();
                if let Some(length) = s.length {
                    s.offset = length;
                }
                s.state = SimSourceState::Finished;
            }
            _ => return,
        }
    }
    emit(inner, source, MediaEvent::Finished);
}

impl MediaPlayer for SimPlayer {
    fn set_listener(&self, listener: Arc<dyn MediaPlayerListener>) {
        lock(&self.inner).listener = Some(listener);
    }

    fn set_source(&self, source: &MediaSource) -> AgentResult<SourceId> {
        let mut inner = lock(&self.inner);
        if inner.fail_next_source {
            inner.fail_next_source = false;
            return Err(AgentError::Media("source rejected".to_string()));
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let length = self.timing.map(|t| match source {
            MediaSource::Text(text) => {
                let words = text.split_whitespace().count().max(1);
                t.per_word * u32::try_from(words).unwrap_or(u32::MAX)
            }
            MediaSource::Url(_) => t.url_length,
        });
        inner.sources.insert(
            id,
            SimSource {
                media: source.clone(),
                state: SimSourceState::Loaded,
                offset: Duration::ZERO,
                length,
                resumed_at: None,
                finish_timer: None,
            },
        );
        info!(player = self.name.as_str(), id, ?source, "source loaded");
        Ok(id)
    }

    fn play(&self, source: SourceId) -> bool {
        self.transition(
            source,
            |s| s == SimSourceState::Loaded,
            SimSourceState::Playing,
            MediaEvent::Started,
        )
    }

    fn stop(&self, source: SourceId) -> bool {
        self.transition(
            source,
            |s| {
                matches!(
                    s,
                    SimSourceState::Loaded | SimSourceState::Playing | SimSourceState::Paused
                )
            },
            SimSourceState::Stopped,
            MediaEvent::Stopped,
        )
    }

    fn pause(&self, source: SourceId) -> bool {
        self.transition(
            source,
            |s| s == SimSourceState::Playing,
            SimSourceState::Paused,
            MediaEvent::Paused,
        )
    }

    fn resume(&self, source: SourceId) -> bool {
        self.transition(
            source,
            |s| s == SimSourceState::Paused,
            SimSourceState::Playing,
            MediaEvent::Resumed,
        )
    }

    fn seek(&self, source: SourceId, offset: Duration) -> bool {
        let mut inner = lock(&self.inner);
        let s = match inner.sources.get_mut(&source) {
            Some(s) if !matches!(s.state, SimSourceState::Stopped | SimSourceState::Finished) => s,
            _ => return false,
        };
        let playing = s.state == SimSourceState::Playing;
        s.freeze();
        s.offset = offset;
        if playing {
            s.resumed_at = Some(Instant::now());
            arm(&self.scheduler, &self.inner, source, s);
        }
        true
    }

    fn offset(&self, source: SourceId) -> Option<Duration> {
        lock(&self.inner).sources.get(&source).map(|s| s.position())
    }

    fn duration(&self, source: SourceId) -> Option<Duration> {
        lock(&self.inner).sources.get(&source).and_then(|s| s.length)
    }
}

/// Message sender that keeps every event it was given.
pub struct RecordingSender {
    events: Mutex<Vec<EventMessage>>,
    arrived: Condvar,
    answer: Option<SendStatus>,
}

impl Default for RecordingSender {
    fn default() -> Self {
        Self::answering(Some(SendStatus::Success))
    }
}

impl RecordingSender {
    /// `None` never answers, so callers fall back on their own deadline.
    pub fn answering(answer: Option<SendStatus>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            arrived: Condvar::new(),
            answer,
        }
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.events).iter().map(|e| e.full_name()).collect()
    }

    pub fn count(&self, full_name: &str) -> usize {
        lock(&self.events)
            .iter()
            .filter(|e| e.full_name() == full_name)
            .count()
    }

    /// Waits until at least `n` events named `full_name` were sent.
    pub fn wait_for_count(&self, full_name: &str, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = lock(&self.events);
        loop {
            if events.iter().filter(|e| e.full_name() == full_name).count() >= n {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            events = self
                .arrived
                .wait_timeout(events, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
    }

    pub fn wait_for(&self, full_name: &str, timeout: Duration) -> Option<EventMessage> {
        if !self.wait_for_count(full_name, 1, timeout) {
            return None;
        }
        lock(&self.events)
            .iter()
            .rev()
            .find(|e| e.full_name() == full_name)
            .cloned()
    }
}

impl MessageSender for RecordingSender {
    fn send(&self, event: EventMessage, on_result: SendCallback) {
        debug!(event = event.full_name().as_str(), "event recorded");
        lock(&self.events).push(event);
        self.arrived.notify_all();
        if let Some(answer) = &self.answer {
            on_result(answer.clone());
        }
    }
}

/// Microphone stand-in.
#[derive(Default)]
pub struct SimAudioInput {
    acquired: AtomicBool,
    unavailable: AtomicBool,
    acquisitions: AtomicUsize,
}

impl SimAudioInput {
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

impl AudioInput for SimAudioInput {
    fn acquire(&self) -> AgentResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AgentError::AudioInput("no capture device".to_string()));
        }
        self.acquired.store(true, Ordering::SeqCst);
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        self.acquired.store(false, Ordering::SeqCst);
    }
}

/// End-point detector driven by the caller, or by a fixed script of
/// (speech start, speech length) when one is given.
pub struct SimEndPointDetector {
    callback: Mutex<Option<EpdCallback>>,
    timers: Mutex<Vec<TimerHandle>>,
    scheduler: Arc<Scheduler>,
    script: Option<(Duration, Duration)>,
}

impl SimEndPointDetector {
    pub fn new(scheduler: Arc<Scheduler>, script: Option<(Duration, Duration)>) -> Self {
        Self {
            callback: Mutex::new(None),
            timers: Mutex::new(Vec::new()),
            scheduler,
            script,
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.callback).is_some()
    }

    pub fn emit(&self, event: EpdEvent) {
        let callback = lock(&self.callback).clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }
}

impl EndPointDetector for SimEndPointDetector {
    fn start(&self, _listen_timeout: Duration, on_event: EpdCallback) -> AgentResult<()> {
        *lock(&self.callback) = Some(on_event.clone());
        if let Some((start, length)) = self.script {
            let mut timers = lock(&self.timers);
            let cb = on_event.clone();
            timers.push(self.scheduler.schedule(start, move || cb(EpdEvent::SpeechStart)));
            timers.push(
                self.scheduler
                    .schedule(start + length, move || on_event(EpdEvent::SpeechEnd)),
            );
        }
        Ok(())
    }

    fn stop(&self) {
        lock(&self.callback).take();
        for timer in lock(&self.timers).drain(..) {
            timer.cancel();
        }
    }
}

/// Renderer that reports every card back to its display agent at once.
#[derive(Default)]
pub struct SimRenderer {
    display: Mutex<Weak<DisplayAgent>>,
    rendered: Mutex<Vec<String>>,
    cleared: Mutex<Vec<String>>,
}

impl SimRenderer {
    /// Until connected, cards are drawn but never reported.
    pub fn connect(&self, display: &Arc<DisplayAgent>) {
        *lock(&self.display) = Arc::downgrade(display);
    }

    pub fn rendered(&self) -> Vec<String> {
        lock(&self.rendered).clone()
    }

    pub fn cleared(&self) -> Vec<String> {
        lock(&self.cleared).clone()
    }

    fn display(&self) -> Option<Arc<DisplayAgent>> {
        lock(&self.display).upgrade()
    }
}

impl Renderer for SimRenderer {
    fn render(&self, token: &str, template: &str, _payload: &str) -> bool {
        info!(token, template, "card rendered");
        if let Some(display) = self.display() {
            display.display_card_rendered(token);
        }
        // Recorded after the report so observers see it already queued.
        lock(&self.rendered).push(token.to_string());
        true
    }

    fn clear(&self, token: &str, force: bool) {
        info!(token, force, "card cleared");
        lock(&self.cleared).push(token.to_string());
        if let Some(display) = self.display() {
            display.display_card_cleared(token);
        }
    }

    fn update(&self, token: &str, _payload: &str) -> bool {
        lock(&self.rendered).iter().any(|t| t == token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<(SourceId, MediaEvent)>>);

    impl MediaPlayerListener for Collect {
        fn on_media_event(&self, source: SourceId, event: MediaEvent) {
            lock(&self.0).push((source, event));
        }
    }

    fn player(timing: Option<SimTiming>) -> (SimPlayer, Arc<Collect>) {
        let scheduler = Arc::new(Scheduler::new("test-sim").unwrap());
        let player = SimPlayer::new("test", scheduler, timing);
        let events = Arc::new(Collect::default());
        player.set_listener(events.clone());
        (player, events)
    }

    #[test]
    fn test_play_pause_resume_stop() {
        let (player, events) = player(None);
        let id = player.set_source(&MediaSource::Url("u".into())).unwrap();
        assert!(player.play(id));
        assert!(!player.play(id));
        assert!(player.pause(id));
        assert!(player.resume(id));
        assert!(player.stop(id));
        assert!(!player.stop(id));
        let seen: Vec<MediaEvent> = lock(&events.0).iter().map(|(_, e)| e.clone()).collect();
        assert_eq!(
            seen,
            vec![
                MediaEvent::Started,
                MediaEvent::Paused,
                MediaEvent::Resumed,
                MediaEvent::Stopped
            ]
        );
    }

    #[test]
    fn test_timed_source_finishes_itself() {
        let timing = SimTiming {
            per_word: Duration::from_millis(10),
            url_length: Duration::from_secs(1),
        };
        let (player, events) = player(Some(timing));
        let id = player.set_source(&MediaSource::Text("two words".into())).unwrap();
        player.play(id);
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(player.state_of(id), Some(SimSourceState::Finished));
        assert_eq!(lock(&events.0).last().unwrap().1, MediaEvent::Finished);
    }

    #[test]
    fn test_held_start() {
        let (player, events) = player(None);
        player.set_hold_start(true);
        let id = player.set_source(&MediaSource::Text("hi".into())).unwrap();
        player.play(id);
        assert!(lock(&events.0).is_empty());
        player.emit_started(id);
        assert_eq!(lock(&events.0).len(), 1);
    }

    #[test]
    fn test_recording_sender_waits() {
        let sender = Arc::new(RecordingSender::default());
        let background = sender.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            background.send(
                EventMessage::builder("TTS", "SpeechStarted", "1.0").build(),
                Box::new(|_| {}),
            );
        });
        assert!(sender
            .wait_for("TTS.SpeechStarted", Duration::from_secs(1))
            .is_some());
        assert_eq!(sender.count("TTS.SpeechStarted"), 1);
    }
}
