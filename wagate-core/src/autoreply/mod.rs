//! Auto-reply engine: picks one responder per eligible inbound text in
//! explicit priority order (manual rules, shipping command, AI fallback)
//! and sends the reply with rate limiting and human-like pacing.

pub mod ai;
pub mod rules;
pub mod shipping;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use wagate_common::models::{
    AutoReplySource, Direction, Message, MessageStatus, MessageType, Session,
};
use wagate_common::Error;

use crate::eventbus::{events, topics, EventBus, GatewayEvent};
use crate::ratelimit::RateLimiter;
use crate::repositories::{AutoReplyRuleRepository, ConversationRepository, MessageRepository};
use crate::transport::{ChatTransport, Presence};
use crate::util::{pacing, Clock};

use ai::{AiClient, ChatTurn, PromptCategory};
use shipping::{ShippingClient, ShippingQuery};

/// Everything the engine needs to know about the inbound message it is
/// answering.
#[derive(Debug, Clone)]
pub struct ReplyContext {
    pub conversation_id: i64,
    /// Original remote JID; the transport routes LID senders through it.
    pub reply_jid: String,
    pub sender_phone: String,
    pub content: String,
    pub inbound_message_id: String,
}

/// Entry point used by the dispatcher; the engine runs as a detached task
/// per inbound message.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AutoResponder: Send + Sync {
    async fn handle(
        &self,
        session: &Session,
        transport: Arc<dyn ChatTransport>,
        ctx: ReplyContext,
    ) -> Result<(), Error>;
}

/// Responder kinds, selected first-match-wins.
enum Responder {
    Manual { reply: String },
    Shipping { query: ShippingQuery },
    Ai,
}

pub struct AutoReplyEngine {
    rules: Arc<dyn AutoReplyRuleRepository>,
    messages: Arc<dyn MessageRepository>,
    conversations: Arc<dyn ConversationRepository>,
    limiter: Arc<RateLimiter>,
    shipping: Arc<dyn ShippingClient>,
    ai: Arc<dyn AiClient>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl AutoReplyEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rules: Arc<dyn AutoReplyRuleRepository>,
        messages: Arc<dyn MessageRepository>,
        conversations: Arc<dyn ConversationRepository>,
        limiter: Arc<RateLimiter>,
        shipping: Arc<dyn ShippingClient>,
        ai: Arc<dyn AiClient>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rules,
            messages,
            conversations,
            limiter,
            shipping,
            ai,
            bus,
            clock,
        }
    }

    async fn select_responder(&self, session_id: &str, content: &str) -> Responder {
        match self.rules.active_for_session(session_id).await {
            Ok(active) => {
                if let Some(rule) = rules::select(&active, content) {
                    debug!(rule_id = rule.id, "manual rule matched");
                    return Responder::Manual {
                        reply: rule.reply.clone(),
                    };
                }
            }
            Err(e) => warn!(session_id, "rule lookup failed, falling through: {}", e),
        }
        if let Some(query) = shipping::parse_command(content) {
            return Responder::Shipping { query };
        }
        Responder::Ai
    }

    async fn resolve_reply(
        &self,
        session: &Session,
        ctx: &ReplyContext,
        responder: Responder,
    ) -> (String, AutoReplySource) {
        match responder {
            Responder::Manual { reply } => (reply, AutoReplySource::Manual),
            Responder::Shipping { query } => {
                let reply = match self.shipping.cost(&query).await {
                    Ok(services) if !services.is_empty() => {
                        shipping::format_reply(&query, &services)
                    }
                    Ok(_) => shipping::help_reply(),
                    Err(e) => {
                        warn!("shipping lookup failed: {}", e);
                        shipping::help_reply()
                    }
                };
                (reply, AutoReplySource::Rajaongkir)
            }
            Responder::Ai => {
                let history = match self
                    .conversations
                    .recent_messages(ctx.conversation_id, ai::HISTORY_WINDOW)
                    .await
                {
                    Ok(lines) => lines
                        .into_iter()
                        .map(|line| ChatTurn {
                            direction: line.direction,
                            content: line.content,
                        })
                        .collect(),
                    Err(e) => {
                        warn!("history load failed, prompting without it: {}", e);
                        Vec::new()
                    }
                };
                let settings = session.settings();
                let prompt = ai::system_prompt(
                    PromptCategory::for_session(session),
                    &session.display_name,
                    settings.custom_system_prompt.as_deref(),
                );
                let reply = match self.ai.complete(&prompt, &history, &ctx.content).await {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("ai completion failed: {}", e);
                        ai::FALLBACK_REPLY.to_string()
                    }
                };
                (reply, AutoReplySource::Openai)
            }
        }
    }

    /// Presence failures on a dead transport abort the send; anything else
    /// is cosmetic and ignored.
    async fn presence(
        &self,
        transport: &Arc<dyn ChatTransport>,
        to: &str,
        presence: Presence,
    ) -> Result<(), Error> {
        match transport.send_presence(to, presence).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transport() => Err(e),
            Err(e) => {
                debug!("presence update failed (ignored): {}", e);
                Ok(())
            }
        }
    }

    async fn send_with_pacing(
        &self,
        session: &Session,
        transport: Arc<dyn ChatTransport>,
        ctx: &ReplyContext,
        reply: &str,
        source: AutoReplySource,
    ) -> Result<(), Error> {
        let now = self.clock.now();
        let pending = Message {
            id: 0,
            session_id: session.session_id.clone(),
            message_id: format!("out-{}", Uuid::new_v4()),
            direction: Direction::Outgoing,
            message_type: MessageType::Text,
            from_number: session.phone_number.clone().unwrap_or_default(),
            to_number: ctx.sender_phone.clone(),
            push_name: None,
            content: Some(reply.to_string()),
            media: serde_json::Value::Null,
            status: MessageStatus::Pending,
            is_auto_reply: true,
            auto_reply_source: Some(source),
            reply_context: json!({ "inReplyTo": ctx.inbound_message_id.clone() }),
            sent_at: None,
            delivered_at: None,
            read_at: None,
            created_at: now,
        };
        let row = self.messages.insert_outgoing(&pending).await?;

        let decision = self.limiter.check(&session.session_id).await?;
        if !decision.can_send {
            self.messages.mark_failed(&row.message_id).await?;
            return Err(decision.into_error());
        }
        if decision.delay_ms > 0 {
            self.clock
                .sleep(std::time::Duration::from_millis(decision.delay_ms as u64))
                .await;
        }

        // Simulated typing: composing, a length-scaled pause, paused, a
        // short settle, then the actual send.
        if let Err(e) = self.presence(&transport, &ctx.reply_jid, Presence::Composing).await {
            self.messages.mark_failed(&row.message_id).await?;
            return Err(e);
        }
        let typing = pacing::typing_delay(
            reply.split_whitespace().count(),
            &mut rand::thread_rng(),
        );
        self.clock.sleep(typing).await;
        if let Err(e) = self.presence(&transport, &ctx.reply_jid, Presence::Paused).await {
            self.messages.mark_failed(&row.message_id).await?;
            return Err(e);
        }
        let settle = pacing::settle_delay(&mut rand::thread_rng());
        self.clock.sleep(settle).await;

        match transport.send_text(&ctx.reply_jid, reply).await {
            Ok(receipt) => {
                let message_id = match self.messages.set_message_id(row.id, &receipt.message_id).await
                {
                    Ok(()) => receipt.message_id.clone(),
                    Err(e) => {
                        warn!("external id swap failed: {}", e);
                        row.message_id.clone()
                    }
                };
                self.messages
                    .advance_status(&message_id, MessageStatus::Sent, self.clock.now())
                    .await?;
                if let Err(e) = self
                    .conversations
                    .append_message(ctx.conversation_id, Direction::Outgoing, reply)
                    .await
                {
                    warn!("ledger append failed: {}", e);
                }
                self.limiter.record_sent(&session.session_id).await?;
                self.bus
                    .publish(
                        &[
                            topics::user(&session.user_id),
                            topics::session(&session.session_id),
                        ],
                        GatewayEvent::new(
                            events::MESSAGE_SENT,
                            json!({
                                "messageId": message_id,
                                "to": ctx.sender_phone,
                                "content": reply,
                                "autoReplySource": source,
                            }),
                        ),
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                self.messages.mark_failed(&row.message_id).await?;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl AutoResponder for AutoReplyEngine {
    async fn handle(
        &self,
        session: &Session,
        transport: Arc<dyn ChatTransport>,
        ctx: ReplyContext,
    ) -> Result<(), Error> {
        let responder = self.select_responder(&session.session_id, &ctx.content).await;
        let (reply, source) = self.resolve_reply(session, &ctx, responder).await;
        self.send_with_pacing(session, transport, &ctx, &reply, source)
            .await
    }
}
