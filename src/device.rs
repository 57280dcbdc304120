//! Boundaries to the device: playback, capture, end-point detection and the
//! card renderer. The agents only sequence calls into these; codecs, device
//! access and pixels live behind them.

use crate::error::AgentResult;
use std::sync::Arc;
use std::time::Duration;

/// Identifies one source loaded into a [`MediaPlayer`].
pub type SourceId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    Started,
    Paused,
    Resumed,
    Stopped,
    Finished,
    Error(String),
}

/// Receives player notifications. Called from the player's own threads.
pub trait MediaPlayerListener: Send + Sync {
    fn on_media_event(&self, source: SourceId, event: MediaEvent);
}

pub trait MediaPlayer: Send + Sync {
    fn set_listener(&self, listener: Arc<dyn MediaPlayerListener>);

    /// Loads a new source. Text sources are synthesized by the player.
    fn set_source(&self, source: &MediaSource) -> AgentResult<SourceId>;

    fn play(&self, source: SourceId) -> bool;
    fn stop(&self, source: SourceId) -> bool;
    fn pause(&self, source: SourceId) -> bool;
    fn resume(&self, source: SourceId) -> bool;
    fn seek(&self, source: SourceId, offset: Duration) -> bool;
    fn offset(&self, source: SourceId) -> Option<Duration>;
    fn duration(&self, source: SourceId) -> Option<Duration>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Url(String),
    Text(String),
}

/// Microphone capture. The recognizer holds the stream for one session.
pub trait AudioInput: Send + Sync {
    fn acquire(&self) -> AgentResult<()>;
    fn release(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpdEvent {
    SpeechStart,
    SpeechEnd,
    /// No speech within the listening window.
    Timeout,
    Error(String),
}

pub type EpdCallback = Arc<dyn Fn(EpdEvent) + Send + Sync>;

/// On-device end-point detection used by the client-EPD recognizer.
pub trait EndPointDetector: Send + Sync {
    fn start(&self, listen_timeout: Duration, on_event: EpdCallback) -> AgentResult<()>;
    fn stop(&self);
}

/// Card renderer. Outcomes come back through the display agent's
/// `display_card_rendered`, `display_card_render_failed` and
/// `display_card_cleared`.
pub trait Renderer: Send + Sync {
    fn render(&self, token: &str, template: &str, payload: &str) -> bool;
    fn clear(&self, token: &str, force: bool);
    fn update(&self, token: &str, payload: &str) -> bool;
}
