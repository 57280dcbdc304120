//! Outbound events and the message sender boundary.

use crate::executor::{lock, Scheduler};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Generates a random id for message ids and dialog request ids.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHeader {
    pub namespace: String,
    pub name: String,
    pub version: String,
    pub message_id: String,
    pub dialog_request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer_dialog_request_id: Option<String>,
}

/// A notification pushed from the device to the dialog service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub header: EventHeader,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl EventMessage {
    pub fn builder(namespace: &str, name: &str, version: &str) -> EventBuilder {
        EventBuilder {
            namespace: namespace.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            dialog_request_id: None,
            referrer_dialog_request_id: None,
            payload: Value::Object(Default::default()),
            context: None,
        }
    }

    /// `Namespace.Name`, handy for logs and tests.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.header.namespace, self.header.name)
    }
}

pub struct EventBuilder {
    namespace: String,
    name: String,
    version: String,
    dialog_request_id: Option<String>,
    referrer_dialog_request_id: Option<String>,
    payload: Value,
    context: Option<Value>,
}

impl EventBuilder {
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn dialog_request_id(mut self, id: impl Into<String>) -> Self {
        self.dialog_request_id = Some(id.into());
        self
    }

    pub fn referrer_dialog_request_id(mut self, id: Option<String>) -> Self {
        self.referrer_dialog_request_id = id;
        self
    }

    pub fn context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn build(self) -> EventMessage {
        EventMessage {
            header: EventHeader {
                namespace: self.namespace,
                name: self.name,
                version: self.version,
                message_id: generate_id(),
                dialog_request_id: self.dialog_request_id.unwrap_or_else(generate_id),
                referrer_dialog_request_id: self.referrer_dialog_request_id,
            },
            payload: self.payload,
            context: self.context,
        }
    }
}

/// Outcome of an event submission as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    Failed(String),
    Timeout,
}

impl SendStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, SendStatus::Success)
    }
}

pub type SendCallback = Box<dyn FnOnce(SendStatus) + Send>;

/// Event egress. Implementations report the outcome asynchronously through
/// `on_result`, from any thread.
pub trait MessageSender: Send + Sync {
    fn send(&self, event: EventMessage, on_result: SendCallback);
}

/// Sends an event and runs `then` exactly once: on the transport's answer, or
/// with [`SendStatus::Timeout`] once `deadline` passes without one.
pub fn send_with_deadline<F>(
    sender: &dyn MessageSender,
    scheduler: &Scheduler,
    deadline: Duration,
    event: EventMessage,
    then: F,
) where
    F: FnOnce(SendStatus) + Send + 'static,
{
    let slot: Arc<Mutex<Option<F>>> = Arc::new(Mutex::new(Some(then)));
    let name = event.full_name();

    let on_deadline = slot.clone();
    let timer = scheduler.schedule(deadline, move || {
        let pending = lock(&on_deadline).take();
        if let Some(then) = pending {
            warn!(event = name.as_str(), "no answer from transport before deadline");
            then(SendStatus::Timeout);
        }
    });

    sender.send(
        event,
        Box::new(move |status| {
            timer.cancel();
            let pending = lock(&slot).take();
            if let Some(then) = pending {
                then(status);
            }
        }),
    );
}
