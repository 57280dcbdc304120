//! Display agent.
//!
//! A template directive becomes a card: it joins the play group of its dialog
//! request when pre-handled, is drawn by the [`Renderer`] when handled, and is
//! dismissed once the rest of its group has finished and the dismiss timer
//! ran out. The renderer reports back through
//! [`DisplayAgent::display_card_rendered`],
//! [`DisplayAgent::display_card_render_failed`] and
//! [`DisplayAgent::display_card_cleared`].

use crate::agent::{AgentServices, CapabilityAgent, SyncTicket};
use crate::context::ContextStateProvider;
use crate::device::Renderer;
use crate::directive::{BlockingPolicy, Directive, DirectiveResultSink, Medium, NamespaceAndName};
use crate::error::{AgentError, AgentResult};
use crate::executor::{Executor, Mailbox, TimerHandle};
use crate::lifecycle::{DirectiveHandle, DirectiveRegistry};
use crate::playsync::SynchronizeObject;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const NAMESPACE: &str = "Display";
const VERSION: &str = "1.0";
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Templates this agent renders.
pub const TEMPLATES: &[&str] = &[
    "FullText1",
    "FullText2",
    "ImageText1",
    "ImageText2",
    "TextList1",
    "Weather1",
    "Score1",
];

#[derive(Debug, Clone)]
pub struct DisplayConfig {
    /// How long a card stays up once nothing else in its group is playing.
    pub dismiss_timeout: Duration,
    /// Longest wait for the renderer to report a card as drawn.
    pub render_timeout: Duration,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            dismiss_timeout: Duration::from_secs(7),
            render_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplatePayload {
    #[serde(default)]
    pub play_service_id: Option<String>,
    pub token: String,
}

impl TemplatePayload {
    pub fn parse(directive: &str, raw: &str) -> AgentResult<Self> {
        let payload: TemplatePayload =
            serde_json::from_str(raw).map_err(|e| AgentError::invalid_payload(directive, e))?;
        if payload.token.is_empty() {
            return Err(AgentError::invalid_payload(directive, "empty token"));
        }
        Ok(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CardPhase {
    Prepared,
    Rendering,
    Shown,
    Clearing,
}

struct Card {
    id: u64,
    handle: DirectiveHandle,
    token: String,
    sync: Arc<dyn SynchronizeObject>,
    phase: CardPhase,
    /// Render guard while rendering, dismiss timer once shown.
    timer: Option<TimerHandle>,
}

impl Card {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

struct DisplayCore {
    config: DisplayConfig,
    services: AgentServices,
    renderer: Arc<dyn Renderer>,
    mailbox: Mailbox<DisplayCore>,
    cards: Vec<Card>,
    next_id: u64,
}

impl DisplayCore {
    fn position(&self, token: &str) -> Option<usize> {
        self.cards.iter().position(|c| c.token == token)
    }

    fn prepare_card(&mut self, handle: DirectiveHandle, payload: TemplatePayload) {
        if let Some(index) = self.position(&payload.token) {
            let old = self.cards.remove(index);
            self.drop_card(old, "replaced by a card with the same token");
        }
        self.next_id += 1;
        let sync = SyncTicket::new(
            self.next_id,
            handle.dialog_request_id(),
            payload.play_service_id.clone(),
            self.mailbox.clone(),
            DisplayCore::on_release_requested,
        );
        self.services.playsync.prepare_sync(&sync);
        debug!(token = payload.token.as_str(), "card prepared");
        self.cards.push(Card {
            id: self.next_id,
            handle,
            token: payload.token,
            sync,
            phase: CardPhase::Prepared,
            timer: None,
        });
    }

    fn drop_card(&mut self, mut card: Card, reason: &str) {
        card.stop_timer();
        if matches!(card.phase, CardPhase::Rendering | CardPhase::Shown) {
            self.renderer.clear(&card.token, true);
        }
        self.services.playsync.release_sync(&card.sync, None);
        card.handle.set_failed(reason);
    }

    fn render(&mut self, message_id: &str) {
        let index = match self
            .cards
            .iter()
            .position(|c| c.handle.message_id() == message_id)
        {
            Some(index) => index,
            None => {
                warn!(message_id, "handle for a card that is not prepared");
                return;
            }
        };
        let (timeout, mailbox) = (self.config.render_timeout, self.mailbox.clone());
        let scheduler = self.services.scheduler.clone();
        let (token, template, raw) = {
            let card = &mut self.cards[index];
            card.phase = CardPhase::Rendering;
            let id = card.id;
            card.timer = Some(scheduler.schedule(timeout, move || {
                mailbox.post(move |core| core.on_render_expired(id));
            }));
            let directive = card.handle.directive();
            (
                card.token.clone(),
                directive.header.name.clone(),
                directive.payload.clone(),
            )
        };
        if !self.renderer.render(&token, &template, &raw) {
            self.render_failed(&token, "render failed");
        }
    }

    fn on_render_expired(&mut self, id: u64) {
        let token = match self
            .cards
            .iter()
            .find(|c| c.id == id && c.phase == CardPhase::Rendering)
        {
            Some(card) => card.token.clone(),
            None => return,
        };
        warn!(
            token = token.as_str(),
            after = ?self.config.render_timeout,
            "renderer never reported the card"
        );
        self.renderer.clear(&token, true);
        self.render_failed(&token, "render timed out");
    }

    fn rendered(&mut self, token: &str) {
        let index = match self.position(token) {
            Some(index) if self.cards[index].phase == CardPhase::Rendering => index,
            _ => {
                debug!(token, "render report for an unknown card");
                return;
            }
        };
        self.cards[index].stop_timer();
        self.cards[index].phase = CardPhase::Shown;
        let sync = self.cards[index].sync.clone();
        self.services.playsync.start_sync(&sync);
        info!(token, "card shown");
        if !self.services.playsync.exist_other_sync_object(&sync) {
            self.start_dismiss_timer(token);
        }
    }

    fn render_failed(&mut self, token: &str, reason: &str) {
        if let Some(index) = self.position(token) {
            let mut card = self.cards.remove(index);
            warn!(token, reason, "card could not be rendered");
            card.stop_timer();
            self.services.playsync.release_sync(&card.sync, None);
            card.handle.set_failed(reason);
        }
    }

    fn cleared(&mut self, token: &str) {
        let index = self.position(token).filter(|&index| {
            matches!(self.cards[index].phase, CardPhase::Shown | CardPhase::Clearing)
        });
        if let Some(index) = index {
            let mut card = self.cards.remove(index);
            info!(token, "card cleared");
            card.stop_timer();
            self.services.playsync.release_sync(&card.sync, None);
            card.handle.set_completed();
        }
    }

    fn start_dismiss_timer(&mut self, token: &str) {
        let timeout = self.config.dismiss_timeout;
        let scheduler = self.services.scheduler.clone();
        let mailbox = self.mailbox.clone();
        if let Some(index) = self.position(token) {
            let card = &mut self.cards[index];
            if card.phase != CardPhase::Shown {
                return;
            }
            card.stop_timer();
            let id = card.id;
            debug!(token, ?timeout, "dismiss timer started");
            card.timer = Some(scheduler.schedule(timeout, move || {
                mailbox.post(move |core| core.on_dismiss(id));
            }));
        }
    }

    fn on_dismiss(&mut self, id: u64) {
        let token = match self.cards.iter_mut().find(|c| c.id == id) {
            Some(card) => {
                card.timer = None;
                card.token.clone()
            }
            None => return,
        };
        self.clear_card(&token, false);
    }

    fn stop_rendering_timer(&mut self, token: &str) {
        if let Some(index) = self.position(token) {
            if self.cards[index].phase == CardPhase::Shown {
                self.cards[index].stop_timer();
            }
        }
    }

    fn clear_card(&mut self, token: &str, force: bool) {
        let index = match self.position(token) {
            Some(index) => index,
            None => return,
        };
        match self.cards[index].phase {
            CardPhase::Prepared => {
                let card = self.cards.remove(index);
                self.drop_card(card, "cleared before rendering");
            }
            CardPhase::Rendering | CardPhase::Shown => {
                self.cards[index].stop_timer();
                self.cards[index].phase = CardPhase::Clearing;
                self.renderer.clear(token, force);
            }
            CardPhase::Clearing => {}
        }
    }

    fn on_release_requested(&mut self, id: u64, immediate: bool) {
        let token = match self.cards.iter().find(|c| c.id == id) {
            Some(card) => card.token.clone(),
            None => return,
        };
        if immediate {
            self.clear_card(&token, true);
        } else {
            self.start_dismiss_timer(&token);
        }
    }

    fn update(&mut self, handle: DirectiveHandle, token: &str) {
        let shown = self
            .position(token)
            .map(|index| self.cards[index].phase == CardPhase::Shown)
            .unwrap_or(false);
        if shown && self.renderer.update(token, &handle.directive().payload) {
            handle.set_completed();
        } else {
            handle.set_failed("no such card on screen");
        }
    }

    fn cancel_card(&mut self, message_id: &str) {
        let index = match self
            .cards
            .iter()
            .position(|c| c.handle.message_id() == message_id)
        {
            Some(index) => index,
            None => return,
        };
        let card = self.cards.remove(index);
        self.drop_card(card, "cancelled");
    }

    fn snapshot(&self) -> Value {
        let shown = self
            .cards
            .iter()
            .rev()
            .find(|c| c.phase == CardPhase::Shown)
            .map(|c| c.token.clone());
        json!({ "version": VERSION, "token": shown })
    }
}

/// Display capability agent.
pub struct DisplayAgent {
    executor: Executor<DisplayCore>,
    registry: DirectiveRegistry,
}

impl DisplayAgent {
    pub fn new(
        config: DisplayConfig,
        services: AgentServices,
        renderer: Arc<dyn Renderer>,
    ) -> AgentResult<Arc<Self>> {
        let executor = Executor::spawn_with("display", move |mailbox: Mailbox<DisplayCore>| {
            DisplayCore {
                config,
                services,
                renderer,
                mailbox,
                cards: Vec::new(),
                next_id: 0,
            }
        })?;
        Ok(Arc::new(Self {
            executor,
            registry: DirectiveRegistry::new(),
        }))
    }

    fn mailbox(&self) -> Mailbox<DisplayCore> {
        self.executor.mailbox()
    }

    pub fn display_card_rendered(&self, token: &str) {
        let token = token.to_string();
        self.mailbox().post(move |core| core.rendered(&token));
    }

    pub fn display_card_render_failed(&self, token: &str) {
        let token = token.to_string();
        self.mailbox()
            .post(move |core| core.render_failed(&token, "render failed"));
    }

    pub fn display_card_cleared(&self, token: &str) {
        let token = token.to_string();
        self.mailbox().post(move |core| core.cleared(&token));
    }

    /// Keeps a shown card up, e.g. while the user is interacting with it.
    pub fn stop_rendering_timer(&self, token: &str) {
        let token = token.to_string();
        self.mailbox()
            .post(move |core| core.stop_rendering_timer(&token));
    }

    pub fn clear_card(&self, token: &str) {
        let token = token.to_string();
        self.mailbox().post(move |core| core.clear_card(&token, true));
    }

    /// Tokens of the cards currently tracked, oldest first.
    pub fn cards(&self) -> AgentResult<Vec<String>> {
        self.mailbox().call(
            |core| core.cards.iter().map(|c| c.token.clone()).collect(),
            QUERY_TIMEOUT,
        )
    }
}

impl CapabilityAgent for DisplayAgent {
    fn namespace(&self) -> &'static str {
        NAMESPACE
    }

    fn configurations(&self) -> Vec<(NamespaceAndName, BlockingPolicy)> {
        let mut configurations: Vec<_> = TEMPLATES
            .iter()
            .map(|name| {
                (
                    NamespaceAndName::new(NAMESPACE, *name),
                    BlockingPolicy::new(Medium::Visual, None),
                )
            })
            .collect();
        configurations.push((
            NamespaceAndName::new(NAMESPACE, "Update"),
            BlockingPolicy::NON_BLOCKING,
        ));
        configurations
    }

    fn pre_handle(
        &self,
        directive: Directive,
        sink: Arc<dyn DirectiveResultSink>,
    ) -> AgentResult<()> {
        let handle = match self.registry.pre_handle(directive, sink) {
            Some(handle) => handle,
            None => return Ok(()),
        };
        let name = handle.directive().namespace_and_name().to_string();
        let is_template = TEMPLATES.contains(&handle.directive().header.name.as_str());
        if !is_template && handle.directive().header.name != "Update" {
            handle.set_failed("unsupported directive");
            return Err(AgentError::UnknownDirective(name));
        }
        match TemplatePayload::parse(&name, &handle.directive().payload) {
            Ok(payload) if is_template => {
                self.mailbox()
                    .post(move |core| core.prepare_card(handle, payload));
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                handle.set_failed(&e.to_string());
                Err(e)
            }
        }
    }

    fn handle(&self, message_id: &str) -> bool {
        let handle = match self.registry.handle(message_id) {
            Some(handle) => handle,
            None => return false,
        };
        if handle.directive().header.name == "Update" {
            let parsed = TemplatePayload::parse("Display.Update", &handle.directive().payload);
            match parsed {
                Ok(payload) => {
                    self.mailbox()
                        .post(move |core| core.update(handle, &payload.token));
                }
                Err(e) => {
                    handle.set_failed(&e.to_string());
                }
            }
        } else {
            let message_id = message_id.to_string();
            self.mailbox().post(move |core| core.render(&message_id));
        }
        true
    }

    fn cancel(&self, message_id: &str) {
        let mailbox = self.mailbox();
        self.registry.cancel(message_id, |handle| {
            let message_id = handle.message_id().to_string();
            mailbox.post(move |core| core.cancel_card(&message_id));
        });
    }

    fn state_snapshot(&self) -> Option<Value> {
        self.mailbox().call(|core| core.snapshot(), QUERY_TIMEOUT).ok()
    }
}

impl ContextStateProvider for DisplayAgent {
    fn namespace(&self) -> String {
        NAMESPACE.to_string()
    }

    fn provide_state(&self, timeout: Duration) -> Option<Value> {
        self.mailbox().call(|core| core.snapshot(), timeout).ok()
    }
}
