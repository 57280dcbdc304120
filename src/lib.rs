//! dialogd: client-side dialog control plane for voice-assistant devices.
//!
//! Directives from the dialog service are routed to capability agents (speech
//! recognition, speech synthesis, audio playback, display). The agents share
//! a focus arbiter for audio channels and a play synchronizer that ties the
//! speech, audio and cards of one dialog turn together.

pub mod agent;
pub mod asr;
pub mod audioplayer;
pub mod config_loader;
pub mod context;
pub mod device;
pub mod directive;
pub mod display;
pub mod error;
pub mod executor;
pub mod focus;
pub mod ingress;
pub mod lifecycle;
pub mod message;
pub mod playsync;
pub mod sim;
pub mod tts;

pub use agent::{AgentServices, CapabilityAgent, DirectiveRouter};
pub use error::{AgentError, AgentResult};
