use crate::device::MediaSource;
use crate::error::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakPayload {
    #[serde(default)]
    pub play_service_id: Option<String>,
    pub token: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl SpeakPayload {
    pub fn parse(raw: &str) -> AgentResult<Self> {
        let payload: SpeakPayload =
            serde_json::from_str(raw).map_err(|e| AgentError::invalid_payload("TTS.Speak", e))?;
        if payload.token.is_empty() {
            return Err(AgentError::invalid_payload("TTS.Speak", "empty token"));
        }
        payload.source()?;
        Ok(payload)
    }

    /// A URL wins over inline text.
    pub fn source(&self) -> AgentResult<MediaSource> {
        match (&self.url, &self.text) {
            (Some(url), _) if !url.is_empty() => Ok(MediaSource::Url(url.clone())),
            (_, Some(text)) if !text.trim().is_empty() => Ok(MediaSource::Text(text.clone())),
            _ => Err(AgentError::invalid_payload("TTS.Speak", "neither url nor text")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopPayload {
    #[serde(default)]
    pub play_service_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// Payload of `SpeechStarted`, `SpeechFinished` and `SpeechStopped`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechEventPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub play_service_id: Option<String>,
    pub token: String,
}
