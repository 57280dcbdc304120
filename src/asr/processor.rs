//! Recognizer back-ends.
//!
//! Both back-ends hold the microphone for one session. They differ in who
//! finds the end points: with server EPD the dialog service reports start and
//! end of speech through `NotifyResult`, with client EPD a local detector
//! does.

use crate::device::{AudioInput, EndPointDetector, EpdEvent};
use crate::error::AgentResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointMode {
    Server,
    Client,
}

impl EndpointMode {
    pub fn wire_name(self) -> &'static str {
        match self {
            EndpointMode::Server => "SERVER",
            EndpointMode::Client => "CLIENT",
        }
    }
}

impl std::str::FromStr for EndpointMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "server" => Ok(EndpointMode::Server),
            "client" => Ok(EndpointMode::Client),
            other => Err(format!("unknown endpoint mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorEvent {
    SpeechStart,
    SpeechEnd,
    Timeout,
    Error(String),
}

pub type ProcessorCallback = Arc<dyn Fn(ProcessorEvent) + Send + Sync>;

pub trait SpeechProcessor: Send {
    fn mode(&self) -> EndpointMode;

    fn start(&mut self, listen_timeout: Duration, on_event: ProcessorCallback) -> AgentResult<()>;

    /// Releases everything the session holds. Safe to call more than once.
    fn stop(&mut self);
}

pub struct ServerEpdProcessor {
    input: Arc<dyn AudioInput>,
    capturing: bool,
}

impl ServerEpdProcessor {
    pub fn new(input: Arc<dyn AudioInput>) -> Self {
        Self {
            input,
            capturing: false,
        }
    }
}

impl SpeechProcessor for ServerEpdProcessor {
    fn mode(&self) -> EndpointMode {
        EndpointMode::Server
    }

    fn start(&mut self, _listen_timeout: Duration, _on_event: ProcessorCallback) -> AgentResult<()> {
        self.input.acquire()?;
        self.capturing = true;
        debug!("server EPD capture started");
        Ok(())
    }

    fn stop(&mut self) {
        if self.capturing {
            self.input.release();
            self.capturing = false;
        }
    }
}

pub struct ClientEpdProcessor {
    input: Arc<dyn AudioInput>,
    detector: Arc<dyn EndPointDetector>,
    capturing: bool,
}

impl ClientEpdProcessor {
    pub fn new(input: Arc<dyn AudioInput>, detector: Arc<dyn EndPointDetector>) -> Self {
        Self {
            input,
            detector,
            capturing: false,
        }
    }
}

impl SpeechProcessor for ClientEpdProcessor {
    fn mode(&self) -> EndpointMode {
        EndpointMode::Client
    }

    fn start(&mut self, listen_timeout: Duration, on_event: ProcessorCallback) -> AgentResult<()> {
        self.input.acquire()?;
        let started = self.detector.start(
            listen_timeout,
            Arc::new(move |event| {
                on_event(match event {
                    EpdEvent::SpeechStart => ProcessorEvent::SpeechStart,
                    EpdEvent::SpeechEnd => ProcessorEvent::SpeechEnd,
                    EpdEvent::Timeout => ProcessorEvent::Timeout,
                    EpdEvent::Error(reason) => ProcessorEvent::Error(reason),
                })
            }),
        );
        if let Err(e) = started {
            self.input.release();
            return Err(e);
        }
        self.capturing = true;
        debug!(?listen_timeout, "client EPD capture started");
        Ok(())
    }

    fn stop(&mut self) {
        if self.capturing {
            self.detector.stop();
            self.input.release();
            self.capturing = false;
        }
    }
}
