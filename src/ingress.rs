//! Line-delimited JSON ingress.
//!
//! Every client line is one [`Request`]. The daemon answers with [`Reply`]
//! lines on the same connection: directive outcomes go to the client that sent
//! the directive, events sent by the agents go to every connected client.

use crate::agent::DirectiveRouter;
use crate::context::ContextManager;
use crate::directive::{Directive, DirectiveResultSink};
use crate::error::AgentResult;
use crate::message::{EventMessage, MessageSender, SendCallback, SendStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Directive { directive: Directive },
    Cancel { message_id: String },
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Ready {
        version: String,
    },
    Event {
        event: EventMessage,
    },
    Result {
        message_id: String,
        outcome: Outcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Cancel {
        message_id: String,
        found: bool,
    },
    Context {
        context: Value,
    },
    Error {
        message: String,
    },
}

impl Reply {
    pub fn to_line(&self) -> AgentResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Message sender that broadcasts events to the connected clients.
///
/// An event sent while nobody is connected reports [`SendStatus::Failed`].
#[derive(Clone)]
pub struct ChannelSender {
    events: broadcast::Sender<EventMessage>,
}

impl ChannelSender {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self { events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventMessage> {
        self.events.subscribe()
    }
}

impl MessageSender for ChannelSender {
    fn send(&self, event: EventMessage, on_result: SendCallback) {
        let name = event.full_name();
        match self.events.send(event) {
            Ok(receivers) => {
                debug!(event = name.as_str(), receivers, "event broadcast");
                on_result(SendStatus::Success);
            }
            Err(_) => on_result(SendStatus::Failed("no client connected".to_string())),
        }
    }
}

/// Reports directive outcomes back to the connection that sent them.
struct ConnectionSink {
    replies: mpsc::UnboundedSender<Reply>,
}

impl ConnectionSink {
    fn reply(&self, directive: &Directive, outcome: Outcome, description: Option<&str>) {
        let reply = Reply::Result {
            message_id: directive.message_id().to_string(),
            outcome,
            description: description.map(str::to_string),
        };
        if self.replies.send(reply).is_err() {
            debug!(
                message_id = directive.message_id(),
                "client left before the directive resolved"
            );
        }
    }
}

impl DirectiveResultSink for ConnectionSink {
    fn on_completed(&self, directive: &Directive) {
        self.reply(directive, Outcome::Completed, None);
    }

    fn on_failed(&self, directive: &Directive, description: &str) {
        self.reply(directive, Outcome::Failed, Some(description));
    }

    fn on_cancelled(&self, directive: &Directive) {
        self.reply(directive, Outcome::Cancelled, None);
    }
}

pub struct Ingress {
    router: Arc<DirectiveRouter>,
    context: Arc<ContextManager>,
    events: ChannelSender,
}

impl Ingress {
    pub fn new(
        router: Arc<DirectiveRouter>,
        context: Arc<ContextManager>,
        events: ChannelSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            context,
            events,
        })
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> AgentResult<()> {
        info!(addr = ?listener.local_addr()?, "ingress listening");
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    let ingress = self.clone();
                    tokio::spawn(async move {
                        info!(%addr, "client connected");
                        if let Err(e) = ingress.handle_connection(socket).await {
                            warn!(%addr, error = %e, "connection error");
                        }
                        info!(%addr, "client disconnected");
                    });
                }
                Err(e) => warn!(error = %e, "accept error"),
            }
        }
    }

    /// Serves one client until it closes its side.
    pub async fn handle_connection<S>(self: Arc<Self>, stream: S) -> AgentResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();
        let mut events = self.events.subscribe();
        let (replies, mut outbox) = mpsc::unbounded_channel();

        let ready = Reply::Ready {
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        writer.write_all(ready.to_line()?.as_bytes()).await?;

        loop {
            let reply = tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => {
                        self.accept_line(line.trim(), &replies);
                        continue;
                    }
                    None => break,
                },
                Some(reply) = outbox.recv() => reply,
                event = events.recv() => match event {
                    Ok(event) => Reply::Event { event },
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "client too slow, events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            writer.write_all(reply.to_line()?.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok(())
    }

    fn accept_line(&self, line: &str, replies: &mpsc::UnboundedSender<Reply>) {
        if line.is_empty() {
            return;
        }
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                let _ = replies.send(Reply::Error {
                    message: format!("malformed request: {}", e),
                });
                return;
            }
        };

        // Agent entry points may block on their executors.
        let replies = replies.clone();
        match request {
            Request::Directive { directive } => {
                let router = self.router.clone();
                tokio::task::spawn_blocking(move || {
                    let name = directive.namespace_and_name();
                    let sink = Arc::new(ConnectionSink { replies });
                    if let Err(e) = router.dispatch(directive, sink) {
                        debug!(directive = %name, error = %e, "dispatch rejected");
                    }
                });
            }
            Request::Cancel { message_id } => {
                let router = self.router.clone();
                tokio::task::spawn_blocking(move || {
                    let found = router.cancel(&message_id);
                    let _ = replies.send(Reply::Cancel { message_id, found });
                });
            }
            Request::Context => {
                let context = self.context.clone();
                tokio::task::spawn_blocking(move || {
                    let _ = replies.send(Reply::Context {
                        context: context.snapshot(),
                    });
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::CapabilityAgent;
    use crate::directive::test_support::directive;
    use crate::directive::{BlockingPolicy, NamespaceAndName};
    use crate::executor::Scheduler;
    use crate::lifecycle::DirectiveRegistry;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    /// Completes `Echo.Say` and announces it with an `Echo.Said` event.
    struct EchoAgent {
        registry: DirectiveRegistry,
        sender: ChannelSender,
    }

    impl CapabilityAgent for EchoAgent {
        fn namespace(&self) -> &'static str {
            "Echo"
        }

        fn configurations(&self) -> Vec<(NamespaceAndName, BlockingPolicy)> {
            vec![(NamespaceAndName::new("Echo", "Say"), BlockingPolicy::NON_BLOCKING)]
        }

        fn pre_handle(
            &self,
            directive: Directive,
            sink: Arc<dyn DirectiveResultSink>,
        ) -> AgentResult<()> {
            self.registry.pre_handle(directive, sink);
            Ok(())
        }

        fn handle(&self, message_id: &str) -> bool {
            match self.registry.handle(message_id) {
                Some(handle) => {
                    let event = EventMessage::builder("Echo", "Said", "1.0")
                        .dialog_request_id(handle.dialog_request_id())
                        .build();
                    self.sender.send(event, Box::new(|_| {}));
                    handle.set_completed();
                    true
                }
                None => false,
            }
        }

        fn cancel(&self, message_id: &str) {
            self.registry.cancel(message_id, |_| {});
        }

        fn state_snapshot(&self) -> Option<Value> {
            None
        }
    }

    fn ingress() -> Arc<Ingress> {
        let sender = ChannelSender::new(16);
        let router = Arc::new(DirectiveRouter::new());
        router.add_agent(Arc::new(EchoAgent {
            registry: DirectiveRegistry::new(),
            sender: sender.clone(),
        }));
        Ingress::new(
            router,
            Arc::new(ContextManager::new(
                Arc::new(Scheduler::with_handle(tokio::runtime::Handle::current())),
                Duration::from_millis(50),
            )),
            sender,
        )
    }

    fn ready_line() -> String {
        Reply::Ready {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
        .to_line()
        .unwrap()
    }

    #[tokio::test]
    async fn test_context_request_is_answered() {
        let mock = tokio_test::io::Builder::new()
            .write(ready_line().as_bytes())
            .read(b"{\"type\":\"context\"}\n")
            .write(b"{\"type\":\"context\",\"context\":{}}\n")
            .build();
        ingress().handle_connection(mock).await.unwrap();
    }

    #[tokio::test]
    async fn test_blank_lines_are_skipped() {
        let mock = tokio_test::io::Builder::new()
            .write(ready_line().as_bytes())
            .read(b"\n   \n")
            .read(b"{\"type\":\"cancel\",\"message_id\":\"nope\"}\n")
            .write(b"{\"type\":\"cancel\",\"message_id\":\"nope\",\"found\":false}\n")
            .build();
        ingress().handle_connection(mock).await.unwrap();
    }

    #[tokio::test]
    async fn test_directive_round_trip_over_stream() {
        let (client, server) = duplex(4096);
        let task = tokio::spawn(ingress().handle_connection(server));
        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();

        let first = lines.next_line().await.unwrap().unwrap();
        assert!(matches!(
            serde_json::from_str::<Reply>(&first).unwrap(),
            Reply::Ready { .. }
        ));

        let request = Request::Directive {
            directive: directive("Echo", "Say", "m-1", "{}"),
        };
        let mut line = serde_json::to_string(&request).unwrap();
        line.push('\n');
        write.write_all(line.as_bytes()).await.unwrap();

        let mut saw_event = false;
        let mut outcome = None;
        while outcome.is_none() || !saw_event {
            let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            match serde_json::from_str::<Reply>(&line).unwrap() {
                Reply::Event { event } => {
                    assert_eq!(event.full_name(), "Echo.Said");
                    assert_eq!(event.header.dialog_request_id, "dialog-1");
                    saw_event = true;
                }
                Reply::Result {
                    message_id,
                    outcome: o,
                    ..
                } => {
                    assert_eq!(message_id, "m-1");
                    outcome = Some(o);
                }
                other => panic!("unexpected reply {:?}", other),
            }
        }
        assert_eq!(outcome, Some(Outcome::Completed));

        drop(write);
        drop(lines);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_directive_and_garbage() {
        let (client, server) = duplex(4096);
        let task = tokio::spawn(ingress().handle_connection(server));
        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();
        lines.next_line().await.unwrap().unwrap();

        write.write_all(b"not json\n").await.unwrap();
        let reply: Reply = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(reply, Reply::Error { ref message } if message.starts_with("malformed")));

        let request = Request::Directive {
            directive: directive("Nope", "Nothing", "m-2", ""),
        };
        let mut line = serde_json::to_string(&request).unwrap();
        line.push('\n');
        write.write_all(line.as_bytes()).await.unwrap();
        let reply: Reply = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(
            reply,
            Reply::Result {
                message_id: "m-2".to_string(),
                outcome: Outcome::Failed,
                description: Some("unsupported directive".to_string()),
            }
        );

        drop(write);
        drop(lines);
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_sender_without_clients_fails() {
        let sender = ChannelSender::new(4);
        let (tx, rx) = std::sync::mpsc::channel();
        sender.send(
            EventMessage::builder("Echo", "Said", "1.0").build(),
            Box::new(move |status| tx.send(status).unwrap()),
        );
        assert!(matches!(rx.recv().unwrap(), SendStatus::Failed(_)));

        let mut events = sender.subscribe();
        let (tx, rx) = std::sync::mpsc::channel();
        sender.send(
            EventMessage::builder("Echo", "Said", "1.0").build(),
            Box::new(move |status| tx.send(status).unwrap()),
        );
        assert_eq!(rx.recv().unwrap(), SendStatus::Success);
        assert_eq!(events.try_recv().unwrap().full_name(), "Echo.Said");
    }
}
