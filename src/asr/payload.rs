use crate::error::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectSpeechPayload {
    #[serde(default)]
    pub play_service_id: Option<String>,
    #[serde(default)]
    pub asr_context: Option<Value>,
    /// Overrides the configured listening timeout for this turn.
    #[serde(default)]
    pub timeout_in_milliseconds: Option<u64>,
}

impl ExpectSpeechPayload {
    pub fn parse(raw: &str) -> AgentResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw).map_err(|e| AgentError::invalid_payload("ASR.ExpectSpeech", e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultState {
    Partial,
    Complete,
    None,
    Error,
    /// False acceptance of the wake word.
    Fa,
    /// Start of speech detected by the server.
    Sos,
    /// End of speech detected by the server.
    Eos,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyResultPayload {
    pub state: ResultState,
    #[serde(default)]
    pub result: Option<String>,
}

impl NotifyResultPayload {
    pub fn parse(raw: &str) -> AgentResult<Self> {
        serde_json::from_str(raw).map_err(|e| AgentError::invalid_payload("ASR.NotifyResult", e))
    }
}
