//! Focus arbitration over named output channels.
//!
//! Each channel has at most one holder. The holder of the highest-priority
//! occupied channel (lowest `priority` value, most recent acquisition on ties)
//! is in the foreground; every other holder is in the background. Acquiring a
//! channel that another observer holds evicts that observer (`None`).
//!
//! Notifications are computed under the arbiter lock and queued, in order, on
//! the arbiter's own dispatch executor. Observers are never called from inside
//! `acquire`/`release`.

use crate::error::AgentResult;
use crate::executor::{lock, Executor, Mailbox};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FocusState {
    Foreground,
    Background,
    None,
}

/// Channel names used by the built-in agents.
pub mod channels {
    pub const CALL: &str = "Call";
    pub const DIALOG: &str = "Dialog";
    pub const ALERT: &str = "Alert";
    pub const CONTENT: &str = "Content";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    /// Lower value wins.
    pub priority: u32,
}

impl ChannelConfig {
    pub fn new(name: &str, priority: u32) -> Self {
        Self {
            name: name.to_string(),
            priority,
        }
    }

    pub fn defaults() -> Vec<ChannelConfig> {
        vec![
            ChannelConfig::new(channels::CALL, 50),
            ChannelConfig::new(channels::DIALOG, 100),
            ChannelConfig::new(channels::ALERT, 200),
            ChannelConfig::new(channels::CONTENT, 300),
        ]
    }
}

pub trait FocusObserver: Send + Sync {
    /// Called on the arbiter's dispatch thread; implementations re-post to
    /// their own execution context.
    fn on_focus_changed(&self, channel: &str, state: FocusState);
}

fn same_observer(a: &Arc<dyn FocusObserver>, b: &Arc<dyn FocusObserver>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

struct Holder {
    observer: Arc<dyn FocusObserver>,
    interface: String,
    seq: u64,
    notified: FocusState,
}

struct Channel {
    config: ChannelConfig,
    holder: Option<Holder>,
}

struct ArbiterState {
    channels: Vec<Channel>,
    seq: u64,
}

type Notice = (Arc<dyn FocusObserver>, String, FocusState);

pub struct FocusArbiter {
    state: Mutex<ArbiterState>,
    _dispatcher: Executor<()>,
    mailbox: Mailbox<()>,
}

impl FocusArbiter {
    pub fn new(configs: Vec<ChannelConfig>) -> AgentResult<Self> {
        let dispatcher = Executor::spawn("focus-dispatch", ())?;
        let mailbox = dispatcher.mailbox();
        let channels = configs
            .into_iter()
            .map(|config| Channel {
                config,
                holder: None,
            })
            .collect();
        Ok(Self {
            state: Mutex::new(ArbiterState { channels, seq: 0 }),
            _dispatcher: dispatcher,
            mailbox,
        })
    }

    /// Registers `observer` as holder of `channel`. Returns `false` only when
    /// the channel is not configured.
    pub fn acquire(
        &self,
        channel: &str,
        observer: Arc<dyn FocusObserver>,
        interface: &str,
    ) -> bool {
        let mut state = lock(&self.state);
        let index = match state.channels.iter().position(|c| c.config.name == channel) {
            Some(index) => index,
            None => {
                warn!(channel, interface, "acquire on unknown focus channel");
                return false;
            }
        };
        state.seq += 1;
        let seq = state.seq;
        let mut notices = Vec::new();

        let slot = &mut state.channels[index].holder;
        let reacquire = slot
            .as_ref()
            .map(|h| same_observer(&h.observer, &observer))
            .unwrap_or(false);
        if reacquire {
            if let Some(holder) = slot.as_mut() {
                holder.seq = seq;
                holder.interface = interface.to_string();
            }
        } else {
            if let Some(evicted) = slot.take() {
                debug!(
                    channel,
                    from = evicted.interface.as_str(),
                    to = interface,
                    "channel taken over"
                );
                if evicted.notified != FocusState::None {
                    notices.push((evicted.observer, channel.to_string(), FocusState::None));
                }
            }
            *slot = Some(Holder {
                observer,
                interface: interface.to_string(),
                seq,
                notified: FocusState::None,
            });
        }

        Self::recompute(&mut state, &mut notices);
        self.dispatch(notices);
        true
    }

    /// Gives up `channel` if `observer` holds it. The releasing observer is not
    /// notified; the next contender is promoted.
    pub fn release(&self, channel: &str, observer: &Arc<dyn FocusObserver>) -> bool {
        let mut state = lock(&self.state);
        let entry = match state.channels.iter_mut().find(|c| c.config.name == channel) {
            Some(entry) => entry,
            None => return false,
        };
        let held = entry
            .holder
            .as_ref()
            .map(|h| same_observer(&h.observer, observer))
            .unwrap_or(false);
        if !held {
            return false;
        }
        if let Some(holder) = entry.holder.take() {
            debug!(channel, interface = holder.interface.as_str(), "channel released");
        }

        let mut notices = Vec::new();
        Self::recompute(&mut state, &mut notices);
        self.dispatch(notices);
        true
    }

    /// Current focus of whoever holds `channel`; `None` when it is free.
    pub fn focus_state(&self, channel: &str) -> FocusState {
        lock(&self.state)
            .channels
            .iter()
            .find(|c| c.config.name == channel)
            .and_then(|c| c.holder.as_ref())
            .map(|h| h.notified)
            .unwrap_or(FocusState::None)
    }

    pub fn holder_interface(&self, channel: &str) -> Option<String> {
        lock(&self.state)
            .channels
            .iter()
            .find(|c| c.config.name == channel)
            .and_then(|c| c.holder.as_ref())
            .map(|h| h.interface.clone())
    }

    pub fn foreground_channel(&self) -> Option<String> {
        lock(&self.state)
            .channels
            .iter()
            .find(|c| {
                c.holder
                    .as_ref()
                    .map(|h| h.notified == FocusState::Foreground)
                    .unwrap_or(false)
            })
            .map(|c| c.config.name.clone())
    }

    pub fn is_configured(&self, channel: &str) -> bool {
        lock(&self.state)
            .channels
            .iter()
            .any(|c| c.config.name == channel)
    }

    /// Waits until every queued notification has been delivered.
    pub fn flush(&self, timeout: Duration) -> AgentResult<()> {
        self.mailbox.call(|_| (), timeout)
    }

    fn recompute(state: &mut ArbiterState, notices: &mut Vec<Notice>) {
        let foreground = state
            .channels
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.holder.as_ref().map(|h| (i, c.config.priority, h.seq)))
            .min_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)))
            .map(|(i, _, _)| i);

        for (i, channel) in state.channels.iter_mut().enumerate() {
            if let Some(holder) = channel.holder.as_mut() {
                let desired = if Some(i) == foreground {
                    FocusState::Foreground
                } else {
                    FocusState::Background
                };
                if holder.notified != desired {
                    holder.notified = desired;
                    notices.push((holder.observer.clone(), channel.config.name.clone(), desired));
                }
            }
        }
    }

    fn dispatch(&self, notices: Vec<Notice>) {
        for (observer, channel, state) in notices {
            debug!(channel = channel.as_str(), ?state, "focus changed");
            self.mailbox.post(move |_| observer.on_focus_changed(&channel, state));
        }
    }
}
