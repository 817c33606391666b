//! Inbound pipeline: converts raw transport events into normalized message
//! rows with at-most-once persistence, then routes to contacts, the
//! conversation ledger, live fan-out, and auto-reply.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use serde_json::json;
use tracing::{debug, error, warn};

use wagate_common::models::{
    Contact, Direction, Group, GroupMember, Message, MessageStatus, MessageType, Session,
};
use wagate_common::Error;

use crate::autoreply::{AutoResponder, ReplyContext};
use crate::eventbus::{events, topics, EventBus, GatewayEvent};
use crate::repositories::{
    ContactRepository, ConversationRepository, GroupRepository, MessageRepository,
    SessionRepository,
};
use crate::transport::{jid, ChatTransport, InboundMessage, UpsertKind};
use crate::util::{pacing, Clock};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Freshness window for live notifications.
    pub live_window: ChronoDuration,
    /// Wider window for history appends so a resync is accepted without
    /// replaying ancient history.
    pub history_window: ChronoDuration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            live_window: ChronoDuration::minutes(5),
            history_window: ChronoDuration::minutes(30),
        }
    }
}

/// Receives transport events from the session drivers. Implemented by the
/// dispatcher; injected into the session manager after construction.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn dispatch(
        &self,
        session_id: &str,
        transport: Arc<dyn ChatTransport>,
        event: InboundMessage,
    ) -> Result<(), Error>;

    /// Delivery/read receipt for a previously sent message.
    async fn receipt(
        &self,
        session_id: &str,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<(), Error>;
}

pub struct InboundDispatcher {
    sessions: Arc<dyn SessionRepository>,
    messages: Arc<dyn MessageRepository>,
    contacts: Arc<dyn ContactRepository>,
    groups: Arc<dyn GroupRepository>,
    conversations: Arc<dyn ConversationRepository>,
    auto_reply: Arc<dyn AutoResponder>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
}

impl InboundDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        messages: Arc<dyn MessageRepository>,
        contacts: Arc<dyn ContactRepository>,
        groups: Arc<dyn GroupRepository>,
        conversations: Arc<dyn ConversationRepository>,
        auto_reply: Arc<dyn AutoResponder>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            sessions,
            messages,
            contacts,
            groups,
            conversations,
            auto_reply,
            bus,
            clock,
            config,
        }
    }

    fn is_stale(&self, event: &InboundMessage) -> bool {
        let age = self.clock.now() - event.timestamp;
        let window = match event.upsert_kind {
            UpsertKind::Notify => self.config.live_window,
            UpsertKind::Append => self.config.history_window,
        };
        age > window
    }

    /// Insert with one retry; the event re-arrives as an append if the
    /// transport re-syncs, so two failures mean giving up is safe.
    async fn persist_with_retry(&self, message: &Message) -> Result<Option<Message>, Error> {
        match self.messages.insert_incoming(message).await {
            Ok(row) => Ok(row),
            Err(first) => {
                warn!(
                    message_id = %message.message_id,
                    "message persist failed, retrying once: {}", first
                );
                self.messages.insert_incoming(message).await
            }
        }
    }

    async fn auto_save_contact(&self, session: &Session, phone: &str, push_name: Option<&str>) {
        let mut contact = Contact::new(session.user_id, &session.session_id, phone);
        contact.push_name = push_name.map(str::to_string);
        contact.metadata = json!({ "source": "incoming_message" });
        contact.last_message_at = Some(self.clock.now());
        if let Err(e) = self.contacts.upsert(&contact).await {
            warn!(phone, "contact auto-save failed: {}", e);
        }
    }

    async fn capture_group_member(
        &self,
        session: &Session,
        remote_jid: &str,
        participant_jid: &str,
        push_name: Option<&str>,
    ) {
        let group = match self
            .groups
            .get(session.user_id, &session.session_id, remote_jid)
            .await
        {
            Ok(Some(group)) => group,
            Ok(None) => {
                let stub = Group {
                    id: 0,
                    user_id: session.user_id,
                    session_id: session.session_id.clone(),
                    group_jid: remote_jid.to_string(),
                    name: None,
                    description: None,
                    owner_jid: None,
                    participant_count: 0,
                    admin_count: 0,
                    is_announce: false,
                    is_locked: false,
                    metadata: json!({ "source": "incoming_message" }),
                    created_at: self.clock.now(),
                    updated_at: self.clock.now(),
                };
                match self.groups.upsert(&stub).await {
                    Ok(group) => group,
                    Err(e) => {
                        warn!(remote_jid, "group upsert failed: {}", e);
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(remote_jid, "group lookup failed: {}", e);
                return;
            }
        };

        let identity = jid::identify(participant_jid);
        let member = GroupMember {
            id: 0,
            group_id: group.id,
            participant_jid: participant_jid.to_string(),
            phone_number: identity.phone().map(str::to_string),
            display_name: None,
            push_name: push_name.map(str::to_string),
            is_admin: false,
            is_super_admin: false,
            is_lid_format: identity.is_lid(),
            created_at: self.clock.now(),
            updated_at: self.clock.now(),
        };
        if let Err(e) = self.groups.upsert_member(&member).await {
            warn!(participant_jid, "group member upsert failed: {}", e);
            return;
        }
        if let Err(e) = self.groups.refresh_counts(group.id).await {
            warn!(group_id = group.id, "participant count refresh failed: {}", e);
        }
    }

    /// Mark the message read after a human-plausible delay derived from
    /// its length.
    fn schedule_read_mark(
        &self,
        transport: Arc<dyn ChatTransport>,
        remote_jid: String,
        message_id: String,
        content_len: usize,
    ) {
        let delay = pacing::read_mark_delay(content_len, &mut rand::thread_rng());
        let clock = Arc::clone(&self.clock);
        tokio::spawn(async move {
            clock.sleep(delay).await;
            if let Err(e) = transport.mark_read(&remote_jid, &message_id).await {
                debug!(message_id, "read mark failed: {}", e);
            }
        });
    }
}

#[async_trait]
impl InboundSink for InboundDispatcher {
    async fn dispatch(
        &self,
        session_id: &str,
        transport: Arc<dyn ChatTransport>,
        event: InboundMessage,
    ) -> Result<(), Error> {
        // Own messages are echoes of our sends; never processed.
        if event.from_me {
            return Ok(());
        }
        if self.is_stale(&event) {
            debug!(
                remote_jid = %event.remote_jid,
                "dropping stale event ({:?})", event.upsert_kind
            );
            return Ok(());
        }
        let Some(message_id) = event.message_id.clone() else {
            debug!(remote_jid = %event.remote_jid, "event without message id, skipping");
            return Ok(());
        };

        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session '{}'", session_id)))?;

        // Liveness gate: either an authenticated transport or a row that
        // says connected (the transport may still be settling after a
        // reconnect).
        if !transport.is_authenticated().await
            && session.status != wagate_common::models::SessionStatus::Connected
        {
            debug!(session_id, "session not live, skipping inbound event");
            return Ok(());
        }

        if self.messages.exists(&message_id).await? {
            return Ok(());
        }

        // For group messages the participant identifies the sender; the
        // reply target stays the original remote JID either way.
        let is_group = jid::is_group_jid(&event.remote_jid);
        let sender_jid = if is_group {
            event.participant.clone().unwrap_or_else(|| event.remote_jid.clone())
        } else {
            event.remote_jid.clone()
        };
        let identity = jid::identify(&sender_jid);
        let sender_key = identity.storage_key();
        let reply_jid = event.remote_jid.clone();

        let now = self.clock.now();
        let message = Message {
            id: 0,
            session_id: session_id.to_string(),
            message_id: message_id.clone(),
            direction: Direction::Incoming,
            message_type: event.message_type,
            from_number: sender_key.clone(),
            to_number: session.phone_number.clone().unwrap_or_default(),
            push_name: event.push_name.clone(),
            content: event.content.clone(),
            media: event.media.clone(),
            status: MessageStatus::Delivered,
            is_auto_reply: false,
            auto_reply_source: None,
            reply_context: json!({
                "remoteJid": event.remote_jid.clone(),
                "replyJid": reply_jid.clone(),
                "participant": event.participant.clone(),
                "isLidSender": identity.is_lid(),
            }),
            sent_at: Some(event.timestamp),
            delivered_at: Some(now),
            read_at: None,
            created_at: now,
        };

        let Some(persisted) = self.persist_with_retry(&message).await? else {
            // Unique violation under a concurrent insert: already handled.
            return Ok(());
        };

        let settings = session.settings();
        if settings.auto_save_contacts && !identity.is_lid() {
            self.auto_save_contact(&session, &sender_key, event.push_name.as_deref())
                .await;
        }

        if is_group {
            if let Some(participant) = event.participant.as_deref() {
                self.capture_group_member(
                    &session,
                    &event.remote_jid,
                    participant,
                    event.push_name.as_deref(),
                )
                .await;
            }
        }

        self.schedule_read_mark(
            Arc::clone(&transport),
            event.remote_jid.clone(),
            message_id.clone(),
            event.content.as_deref().map(str::len).unwrap_or(0),
        );

        let conversation = self
            .conversations
            .upsert_inbound(
                session.user_id,
                session_id,
                &sender_key,
                event.push_name.as_deref(),
                now,
            )
            .await?;
        if let Some(content) = event.content.as_deref() {
            if let Err(e) = self
                .conversations
                .append_message(conversation.id, Direction::Incoming, content)
                .await
            {
                warn!(conversation_id = conversation.id, "ledger append failed: {}", e);
            }
        }

        self.bus
            .publish(
                &[topics::user(&session.user_id), topics::session(session_id)],
                GatewayEvent::new(
                    events::MESSAGE_INCOMING,
                    json!({
                        "messageId": persisted.message_id,
                        "from": persisted.from_number,
                        "pushName": persisted.push_name,
                        "type": persisted.message_type,
                        "content": persisted.content,
                    }),
                ),
            )
            .await;

        // Auto-reply decision. A human agent owns the conversation once
        // assigned; the engine runs detached so inbound intake never waits
        // on pacing or collaborators.
        if conversation.human_agent_id.is_some() {
            debug!(
                conversation_id = conversation.id,
                "conversation handled by human agent, skipping auto-reply"
            );
            return Ok(());
        }
        if settings.auto_reply_enabled && event.message_type == MessageType::Text {
            if let Some(content) = event.content.clone() {
                let engine = Arc::clone(&self.auto_reply);
                let ctx = ReplyContext {
                    conversation_id: conversation.id,
                    reply_jid,
                    sender_phone: sender_key,
                    content,
                    inbound_message_id: message_id,
                };
                let session = session.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.handle(&session, transport, ctx).await {
                        error!(
                            session_id = %session.session_id,
                            "auto-reply failed: {}", e
                        );
                    }
                });
            }
        }

        Ok(())
    }

    async fn receipt(
        &self,
        session_id: &str,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<(), Error> {
        let now = self.clock.now();
        let advanced = self.messages.advance_status(message_id, status, now).await?;
        if !advanced {
            return Ok(());
        }
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session '{}'", session_id)))?;
        self.bus
            .publish(
                &[topics::user(&session.user_id), topics::session(session_id)],
                GatewayEvent::new(
                    events::MESSAGE_STATUS,
                    json!({ "messageId": message_id, "status": status }),
                ),
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoreply::MockAutoResponder;
    use crate::repositories::postgres::contacts::MockContactRepository;
    use crate::repositories::postgres::conversations::MockConversationRepository;
    use crate::repositories::postgres::groups::MockGroupRepository;
    use crate::repositories::postgres::messages::MockMessageRepository;
    use crate::repositories::postgres::sessions::MockSessionRepository;
    use crate::test_utils::ManualClock;
    use crate::transport::MockChatTransport;
    use chrono::Utc;
    use serde_json::Value;
    use std::time::Duration as StdDuration;
    use tokio::time::timeout;
    use uuid::Uuid;
    use wagate_common::models::{Conversation, SessionStatus};

    fn sample_session(user_id: Uuid) -> Session {
        Session {
            id: 1,
            session_id: "s1".into(),
            user_id,
            display_name: "Toko".into(),
            phone_number: Some("628111111111".into()),
            status: SessionStatus::Connected,
            qr_code: None,
            qr_expires_at: None,
            ai_assistant_type: None,
            ai_config: json!({}),
            webhook_url: None,
            settings: json!({}),
            last_connected_at: None,
            last_disconnected_at: None,
            is_active: true,
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn conversation(id: i64, user_id: Uuid, agent: Option<Uuid>) -> Conversation {
        Conversation {
            id,
            user_id,
            session_id: "s1".into(),
            customer_phone: "628122222222".into(),
            customer_name: Some("Budi".into()),
            human_agent_id: agent,
            last_message_at: Some(Utc::now()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    struct Fixture {
        sessions: MockSessionRepository,
        messages: MockMessageRepository,
        contacts: MockContactRepository,
        groups: MockGroupRepository,
        conversations: MockConversationRepository,
        responder: MockAutoResponder,
        clock: Arc<ManualClock>,
        bus: Arc<EventBus>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                sessions: MockSessionRepository::new(),
                messages: MockMessageRepository::new(),
                contacts: MockContactRepository::new(),
                groups: MockGroupRepository::new(),
                conversations: MockConversationRepository::new(),
                responder: MockAutoResponder::new(),
                clock: Arc::new(ManualClock::epoch()),
                bus: Arc::new(EventBus::new()),
            }
        }

        fn build(self) -> (InboundDispatcher, Arc<ManualClock>, Arc<EventBus>) {
            let clock = self.clock.clone();
            let bus = self.bus.clone();
            (
                InboundDispatcher::new(
                    Arc::new(self.sessions),
                    Arc::new(self.messages),
                    Arc::new(self.contacts),
                    Arc::new(self.groups),
                    Arc::new(self.conversations),
                    Arc::new(self.responder),
                    self.bus,
                    self.clock,
                    DispatchConfig::default(),
                ),
                clock,
                bus,
            )
        }
    }

    fn inbound(at: chrono::DateTime<Utc>, message_id: &str, content: &str) -> InboundMessage {
        InboundMessage {
            remote_jid: "628122222222@s.whatsapp.net".into(),
            from_me: false,
            participant: None,
            message_id: Some(message_id.into()),
            push_name: Some("Budi".into()),
            timestamp: at,
            message_type: MessageType::Text,
            content: Some(content.into()),
            media: Value::Null,
            upsert_kind: UpsertKind::Notify,
        }
    }

    fn live_transport() -> Arc<MockChatTransport> {
        let mut transport = MockChatTransport::new();
        transport.expect_is_authenticated().returning(|| true);
        transport.expect_mark_read().returning(|_, _| Ok(()));
        Arc::new(transport)
    }

    #[tokio::test]
    async fn own_and_stale_events_are_dropped() {
        let mut f = Fixture::new();
        // Only the history-append probe below should reach the lookup.
        f.sessions.expect_get().times(1).returning(|_| Ok(None));
        let (dispatcher, clock, _bus) = f.build();

        let mut own = inbound(clock.now(), "m-1", "hi");
        own.from_me = true;
        dispatcher
            .dispatch("s1", live_transport(), own)
            .await
            .unwrap();

        let stale = inbound(clock.now() - chrono::Duration::minutes(10), "m-2", "hi");
        dispatcher
            .dispatch("s1", live_transport(), stale)
            .await
            .unwrap();

        // History appends get the wider window: 10 minutes old is fine.
        let mut history = inbound(clock.now() - chrono::Duration::minutes(10), "m-3", "hi");
        history.upsert_kind = UpsertKind::Append;
        let err = dispatcher
            .dispatch("s1", live_transport(), history)
            .await
            .unwrap_err();
        // It got past the freshness gate and failed on the absent session.
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_message_id_is_persisted_once() {
        let user_id = Uuid::new_v4();
        let mut f = Fixture::new();
        f.sessions
            .expect_get()
            .returning(move |_| Ok(Some(sample_session(user_id))));
        f.messages
            .expect_exists()
            .withf(|mid| mid == "m-42")
            .returning(|_| Ok(true));
        // No insert/auto-reply expectations: any call would panic.

        let (dispatcher, clock, _bus) = f.build();
        dispatcher
            .dispatch("s1", live_transport(), inbound(clock.now(), "m-42", "hi"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn persists_fans_out_and_auto_replies() {
        let user_id = Uuid::new_v4();
        let mut f = Fixture::new();
        f.sessions
            .expect_get()
            .returning(move |_| Ok(Some(sample_session(user_id))));
        f.messages.expect_exists().returning(|_| Ok(false));
        f.messages
            .expect_insert_incoming()
            .withf(|m| {
                m.message_id == "m-42"
                    && m.direction == Direction::Incoming
                    && m.status == MessageStatus::Delivered
                    && !m.is_auto_reply
                    && m.from_number == "628122222222"
                    && m.to_number == "628111111111"
            })
            .times(1)
            .returning(|m| Ok(Some(Message { id: 5, ..m.clone() })));
        f.contacts
            .expect_upsert()
            .withf(|c| c.phone_number == "628122222222" && c.push_name.as_deref() == Some("Budi"))
            .returning(|_| Ok(()));
        f.conversations
            .expect_upsert_inbound()
            .returning(move |u, _, _, _, _| Ok(conversation(11, u, None)));
        f.conversations
            .expect_append_message()
            .withf(|cid, dir, content| {
                *cid == 11 && *dir == Direction::Incoming && content == "hi"
            })
            .returning(|_, _, _| Ok(()));

        let (reply_tx, mut reply_rx) = tokio::sync::mpsc::unbounded_channel();
        f.responder
            .expect_handle()
            .withf(|_, _, ctx| {
                ctx.conversation_id == 11
                    && ctx.reply_jid == "628122222222@s.whatsapp.net"
                    && ctx.content == "hi"
                    && ctx.inbound_message_id == "m-42"
            })
            .times(1)
            .returning(move |_, _, _| {
                reply_tx.send(()).unwrap();
                Ok(())
            });

        let (dispatcher, clock, bus) = f.build();
        let mut rx = bus.subscribe(&topics::session("s1"), Some(16)).await;

        dispatcher
            .dispatch("s1", live_transport(), inbound(clock.now(), "m-42", "hi"))
            .await
            .unwrap();

        let evt = timeout(StdDuration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(evt.event, events::MESSAGE_INCOMING);
        assert_eq!(evt.data["messageId"], "m-42");

        timeout(StdDuration::from_secs(2), reply_rx.recv())
            .await
            .expect("auto-reply should have been scheduled")
            .unwrap();
    }

    #[tokio::test]
    async fn human_agent_assignment_skips_auto_reply() {
        let user_id = Uuid::new_v4();
        let agent = Uuid::new_v4();
        let mut f = Fixture::new();
        f.sessions
            .expect_get()
            .returning(move |_| Ok(Some(sample_session(user_id))));
        f.messages.expect_exists().returning(|_| Ok(false));
        f.messages
            .expect_insert_incoming()
            .returning(|m| Ok(Some(Message { id: 5, ..m.clone() })));
        f.contacts.expect_upsert().returning(|_| Ok(()));
        f.conversations
            .expect_upsert_inbound()
            .returning(move |u, _, _, _, _| Ok(conversation(11, u, Some(agent))));
        f.conversations
            .expect_append_message()
            .returning(|_, _, _| Ok(()));
        // No responder expectation: a call would panic the mock.

        let (dispatcher, clock, _bus) = f.build();
        dispatcher
            .dispatch("s1", live_transport(), inbound(clock.now(), "m-42", "hi"))
            .await
            .unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn group_messages_capture_members_and_reply_to_group() {
        let user_id = Uuid::new_v4();
        let mut f = Fixture::new();
        f.sessions
            .expect_get()
            .returning(move |_| Ok(Some(sample_session(user_id))));
        f.messages.expect_exists().returning(|_| Ok(false));
        f.messages
            .expect_insert_incoming()
            .withf(|m| m.from_number == "628122222222")
            .returning(|m| Ok(Some(Message { id: 5, ..m.clone() })));
        f.contacts.expect_upsert().returning(|_| Ok(()));
        f.groups.expect_get().returning(|_, _, _| Ok(None));
        f.groups.expect_upsert().returning(|g| {
            Ok(wagate_common::models::Group { id: 3, ..g.clone() })
        });
        f.groups
            .expect_upsert_member()
            .withf(|m| {
                m.group_id == 3
                    && m.participant_jid == "628122222222@s.whatsapp.net"
                    && m.phone_number.as_deref() == Some("628122222222")
                    && !m.is_lid_format
            })
            .times(1)
            .returning(|_| Ok(()));
        f.groups.expect_refresh_counts().returning(|_| Ok(()));
        f.conversations
            .expect_upsert_inbound()
            .returning(move |u, _, _, _, _| Ok(conversation(11, u, None)));
        f.conversations
            .expect_append_message()
            .returning(|_, _, _| Ok(()));

        let (reply_tx, mut reply_rx) = tokio::sync::mpsc::unbounded_channel();
        f.responder
            .expect_handle()
            .withf(|_, _, ctx| ctx.reply_jid == "123456789@g.us")
            .returning(move |_, _, _| {
                reply_tx.send(()).unwrap();
                Ok(())
            });

        let (dispatcher, clock, _bus) = f.build();
        let mut event = inbound(clock.now(), "m-77", "halo semua");
        event.remote_jid = "123456789@g.us".into();
        event.participant = Some("628122222222@s.whatsapp.net".into());

        dispatcher
            .dispatch("s1", live_transport(), event)
            .await
            .unwrap();
        timeout(StdDuration::from_secs(2), reply_rx.recv())
            .await
            .expect("group auto-reply should route to the group jid")
            .unwrap();
    }

    #[tokio::test]
    async fn receipts_advance_status_monotonically() {
        let user_id = Uuid::new_v4();
        let mut f = Fixture::new();
        f.sessions
            .expect_get()
            .returning(move |_| Ok(Some(sample_session(user_id))));
        let mut calls = 0;
        f.messages.expect_advance_status().returning(move |_, _, _| {
            calls += 1;
            // Second receipt is a regression the repository refuses.
            Ok(calls == 1)
        });

        let (dispatcher, _clock, bus) = f.build();
        let mut rx = bus.subscribe(&topics::session("s1"), Some(16)).await;

        dispatcher
            .receipt("s1", "m-42", MessageStatus::Read)
            .await
            .unwrap();
        let evt = timeout(StdDuration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(evt.event, events::MESSAGE_STATUS);

        dispatcher
            .receipt("s1", "m-42", MessageStatus::Delivered)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err(), "refused transitions publish nothing");
    }
}
