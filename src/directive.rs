//! Directive records as they arrive from the dialog service.

use crate::error::{AgentError, AgentResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespaceAndName {
    pub namespace: String,
    pub name: String,
}

impl NamespaceAndName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespaceAndName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub namespace: String,
    pub name: String,
    pub message_id: String,
    pub dialog_request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer_dialog_request_id: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Header {
    pub fn namespace_and_name(&self) -> NamespaceAndName {
        NamespaceAndName::new(self.namespace.clone(), self.name.clone())
    }
}

/// An instruction pushed from the dialog service to one capability agent.
///
/// Immutable once received; the payload stays opaque until the owning agent
/// parses it into its own payload type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub header: Header,
    #[serde(default)]
    pub payload: String,
}

impl Directive {
    pub fn new(header: Header, payload: impl Into<String>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.header.message_id
    }

    pub fn dialog_request_id(&self) -> &str {
        &self.header.dialog_request_id
    }

    pub fn namespace_and_name(&self) -> NamespaceAndName {
        self.header.namespace_and_name()
    }

    /// Parses the payload into the directive-specific type.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> AgentResult<T> {
        serde_json::from_str(&self.payload)
            .map_err(|e| AgentError::invalid_payload(self.namespace_and_name().to_string(), e))
    }
}

/// Shared mode a directive needs while it is being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Medium {
    None,
    Audio,
    AudioInput,
    Visual,
    Any,
}

impl Medium {
    pub fn overlaps(self, other: Medium) -> bool {
        match (self, other) {
            (Medium::None, _) | (_, Medium::None) => false,
            (Medium::Any, _) | (_, Medium::Any) => true,
            (a, b) => a == b,
        }
    }
}

/// Declares how a directive type interacts with the external sequencer.
///
/// `blocked_by`: the directive waits while another directive holding an
/// overlapping medium is being handled. `blocking`: the medium this directive
/// holds exclusively while it is being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingPolicy {
    pub blocked_by: Medium,
    pub blocking: Option<Medium>,
}

impl BlockingPolicy {
    pub const NON_BLOCKING: BlockingPolicy = BlockingPolicy {
        blocked_by: Medium::None,
        blocking: None,
    };

    pub fn new(blocked_by: Medium, blocking: Option<Medium>) -> Self {
        Self {
            blocked_by,
            blocking,
        }
    }

    /// Whether a directive with this policy must wait for one holding `other`.
    pub fn is_blocked_by(&self, other: &BlockingPolicy) -> bool {
        other
            .blocking
            .map(|held| self.blocked_by.overlaps(held))
            .unwrap_or(false)
    }
}

impl Default for BlockingPolicy {
    fn default() -> Self {
        Self::NON_BLOCKING
    }
}

/// Receives the final outcome of a directive. Implemented by the sequencer
/// that fed the directive in.
pub trait DirectiveResultSink: Send + Sync {
    fn on_completed(&self, directive: &Directive);
    fn on_failed(&self, directive: &Directive, description: &str);
    fn on_cancelled(&self, _directive: &Directive) {}
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn directive(namespace: &str, name: &str, message_id: &str, payload: &str) -> Directive {
        directive_in_dialog(namespace, name, message_id, "dialog-1", payload)
    }

    pub fn directive_in_dialog(
        namespace: &str,
        name: &str,
        message_id: &str,
        dialog_request_id: &str,
        payload: &str,
    ) -> Directive {
        Directive::new(
            Header {
                namespace: namespace.to_string(),
                name: name.to_string(),
                message_id: message_id.to_string(),
                dialog_request_id: dialog_request_id.to_string(),
                referrer_dialog_request_id: None,
                version: "1.0".to_string(),
            },
            payload,
        )
    }
}
