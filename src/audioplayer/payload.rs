use crate::error::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub url: String,
    pub token: String,
    #[serde(default)]
    pub offset_in_milliseconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioItem {
    pub stream: Stream,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayPayload {
    #[serde(default)]
    pub play_service_id: Option<String>,
    pub audio_item: AudioItem,
}

impl PlayPayload {
    pub fn parse(raw: &str) -> AgentResult<Self> {
        let payload: PlayPayload = serde_json::from_str(raw)
            .map_err(|e| AgentError::invalid_payload("AudioPlayer.Play", e))?;
        let stream = &payload.audio_item.stream;
        if stream.token.is_empty() {
            return Err(AgentError::invalid_payload("AudioPlayer.Play", "empty token"));
        }
        if stream.url.is_empty() {
            return Err(AgentError::invalid_payload("AudioPlayer.Play", "empty url"));
        }
        Ok(payload)
    }

    pub fn token(&self) -> &str {
        &self.audio_item.stream.token
    }

    pub fn offset(&self) -> Duration {
        Duration::from_millis(self.audio_item.stream.offset_in_milliseconds)
    }
}

/// Payload of `Pause` and `Stop`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPayload {
    #[serde(default)]
    pub play_service_id: Option<String>,
}

impl ControlPayload {
    pub fn parse(directive: &str, raw: &str) -> AgentResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw).map_err(|e| AgentError::invalid_payload(directive, e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackEventPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub play_service_id: Option<String>,
    pub token: String,
    pub offset_in_milliseconds: u64,
}
