//! Broadcast executor: delivers a campaign's template to a bounded
//! recipient list with batching, progress reporting, and cancellation.
//! One task per running campaign; the rate limiter is the only gate
//! between campaigns that share a session.

pub mod template;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use wagate_common::models::{
    BroadcastCampaign, CampaignStatus, MessageTemplate, TemplateKind,
};
use wagate_common::Error;

use crate::eventbus::{events, topics, EventBus, GatewayEvent};
use crate::ratelimit::RateLimiter;
use crate::repositories::{CampaignRepository, SessionRepository};
use crate::transport::{jid, TransportProvider};
use crate::util::{phone, Clock};

pub const MAX_RECIPIENTS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct BroadcastDefaults {
    pub batch_size: i32,
    pub batch_delay_ms: i64,
}

impl Default for BroadcastDefaults {
    fn default() -> Self {
        Self {
            batch_size: 20,
            batch_delay_ms: 60_000,
        }
    }
}

impl BroadcastDefaults {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            batch_size: env::var("WAGATE_BROADCAST_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.batch_size),
            batch_delay_ms: env::var("WAGATE_BROADCAST_BATCH_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.batch_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecipientInput {
    pub phone: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCampaignInput {
    pub session_id: String,
    pub name: String,
    pub template: MessageTemplate,
    pub recipients: Vec<RecipientInput>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub batch_size: Option<i32>,
    pub batch_delay_ms: Option<i64>,
}

/// Outcome of a one-shot group broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct GroupBroadcastReport {
    pub sent: usize,
    pub failed: Vec<GroupBroadcastFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupBroadcastFailure {
    pub group_jid: String,
    pub error: String,
}

pub struct BroadcastExecutor {
    campaigns: Arc<dyn CampaignRepository>,
    sessions: Arc<dyn SessionRepository>,
    transports: Arc<dyn TransportProvider>,
    limiter: Arc<RateLimiter>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    defaults: BroadcastDefaults,
}

impl BroadcastExecutor {
    pub fn new(
        campaigns: Arc<dyn CampaignRepository>,
        sessions: Arc<dyn SessionRepository>,
        transports: Arc<dyn TransportProvider>,
        limiter: Arc<RateLimiter>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        defaults: BroadcastDefaults,
    ) -> Self {
        Self {
            campaigns,
            sessions,
            transports,
            limiter,
            bus,
            clock,
            defaults,
        }
    }

    /// Validate and persist a campaign with every recipient pending.
    pub async fn create(
        &self,
        user_id: Uuid,
        input: CreateCampaignInput,
    ) -> Result<BroadcastCampaign, Error> {
        let session = self
            .sessions
            .get_owned(&input.session_id, user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session '{}'", input.session_id)))?;
        if !session.is_active {
            return Err(Error::Precondition(format!(
                "session '{}' is not active",
                input.session_id
            )));
        }

        if input.recipients.is_empty() || input.recipients.len() > MAX_RECIPIENTS {
            return Err(Error::InvalidArgument(format!(
                "recipient count must be between 1 and {}",
                MAX_RECIPIENTS
            )));
        }
        if input.template.content.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "template content is required".to_string(),
            ));
        }
        if matches!(input.template.kind, TemplateKind::Image | TemplateKind::Document)
            && input.template.media_url.as_deref().map(str::trim).unwrap_or("").is_empty()
        {
            return Err(Error::InvalidArgument(
                "mediaUrl is required for image and document templates".to_string(),
            ));
        }

        let mut recipients = Vec::with_capacity(input.recipients.len());
        for r in &input.recipients {
            let normalized = phone::normalize(&r.phone);
            if !phone::is_plausible(&normalized) {
                return Err(Error::InvalidArgument(format!(
                    "invalid recipient phone '{}'",
                    r.phone
                )));
            }
            recipients.push((normalized, r.name.clone()));
        }

        let now = self.clock.now();
        let status = match input.scheduled_at {
            Some(at) if at > now => CampaignStatus::Scheduled,
            _ => CampaignStatus::Draft,
        };
        let campaign = BroadcastCampaign {
            id: 0,
            user_id,
            session_id: input.session_id.clone(),
            name: input.name.clone(),
            template: serde_json::to_value(&input.template)?,
            status,
            scheduled_at: input.scheduled_at,
            started_at: None,
            completed_at: None,
            total_recipients: recipients.len() as i32,
            sent_count: 0,
            failed_count: 0,
            batch_size: input.batch_size.unwrap_or(self.defaults.batch_size).max(1),
            batch_delay_ms: input
                .batch_delay_ms
                .unwrap_or(self.defaults.batch_delay_ms)
                .max(0),
            created_at: now,
            updated_at: now,
        };
        let created = self.campaigns.create(&campaign, &recipients).await?;
        info!(
            campaign_id = created.id,
            recipients = created.total_recipients,
            status = %created.status,
            "campaign created"
        );
        Ok(created)
    }

    /// Start processing in the background. Returns once the campaign has
    /// transitioned to processing.
    pub async fn execute(self: &Arc<Self>, campaign_id: i64, user_id: Uuid) -> Result<(), Error> {
        let campaign = self
            .campaigns
            .get_owned(campaign_id, user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("campaign {}", campaign_id)))?;

        if let Some(at) = campaign.scheduled_at {
            if campaign.status == CampaignStatus::Scheduled && at > self.clock.now() {
                return Err(Error::Precondition(format!(
                    "campaign {} is scheduled for {}",
                    campaign_id, at
                )));
            }
        }
        if !campaign.status.startable() {
            return Err(Error::Precondition(format!(
                "campaign {} cannot start from status {}",
                campaign_id, campaign.status
            )));
        }
        if !self.transports.is_connected(&campaign.session_id).await {
            return Err(Error::Precondition(format!(
                "session '{}' is not connected",
                campaign.session_id
            )));
        }
        let started = self
            .campaigns
            .try_transition(
                campaign_id,
                &[CampaignStatus::Draft, CampaignStatus::Scheduled],
                CampaignStatus::Processing,
                self.clock.now(),
            )
            .await?;
        if !started {
            return Err(Error::Precondition(format!(
                "campaign {} cannot start from status {}",
                campaign_id, campaign.status
            )));
        }

        self.publish(
            &campaign,
            events::BROADCAST_STARTED,
            json!({
                "campaignId": campaign.id,
                "total": campaign.total_recipients,
            }),
        )
        .await;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_campaign(campaign).await;
        });
        Ok(())
    }

    pub async fn list(
        &self,
        user_id: Uuid,
        status: Option<CampaignStatus>,
    ) -> Result<Vec<BroadcastCampaign>, Error> {
        self.campaigns.list(user_id, status).await
    }

    pub async fn detail(
        &self,
        campaign_id: i64,
        user_id: Uuid,
    ) -> Result<Option<BroadcastCampaign>, Error> {
        self.campaigns.get_owned(campaign_id, user_id).await
    }

    /// Permitted from draft, scheduled, or processing; the running loop
    /// observes the new status and stops after the current recipient.
    pub async fn cancel(&self, campaign_id: i64, user_id: Uuid) -> Result<(), Error> {
        let campaign = self
            .campaigns
            .get_owned(campaign_id, user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("campaign {}", campaign_id)))?;
        if !campaign.status.cancellable() {
            return Err(Error::Precondition(format!(
                "campaign {} cannot be cancelled from status {}",
                campaign_id, campaign.status
            )));
        }
        let cancelled = self
            .campaigns
            .try_transition(
                campaign_id,
                &[
                    CampaignStatus::Draft,
                    CampaignStatus::Scheduled,
                    CampaignStatus::Processing,
                ],
                CampaignStatus::Cancelled,
                self.clock.now(),
            )
            .await?;
        if !cancelled {
            return Err(Error::Precondition(format!(
                "campaign {} cannot be cancelled from status {}",
                campaign_id, campaign.status
            )));
        }
        info!(campaign_id, "campaign cancelled");
        Ok(())
    }

    async fn run_campaign(&self, campaign: BroadcastCampaign) {
        let campaign_id = campaign.id;
        match self.process(&campaign).await {
            Ok(()) => {}
            Err(e) => {
                error!(campaign_id, "campaign failed: {}", e);
                if let Err(te) = self
                    .campaigns
                    .try_transition(
                        campaign_id,
                        &[CampaignStatus::Processing],
                        CampaignStatus::Failed,
                        self.clock.now(),
                    )
                    .await
                {
                    warn!(campaign_id, "failed-state transition error: {}", te);
                }
                self.publish(
                    &campaign,
                    events::BROADCAST_FAILED,
                    json!({ "campaignId": campaign_id, "error": e.to_string() }),
                )
                .await;
            }
        }
    }

    async fn process(&self, campaign: &BroadcastCampaign) -> Result<(), Error> {
        let template = campaign
            .template()
            .map_err(|e| Error::InvalidArgument(format!("broken template: {}", e)))?;
        let recipients = self.campaigns.pending_recipients(campaign.id).await?;
        let run_total = recipients.len();
        let batch_size = campaign.batch_size.max(1) as usize;

        let mut sent = campaign.sent_count;
        let mut failed = campaign.failed_count;
        let mut in_batch = 0usize;

        for (idx, recipient) in recipients.iter().enumerate() {
            match self.campaigns.status(campaign.id).await? {
                Some(CampaignStatus::Processing) => {}
                Some(CampaignStatus::Cancelled) => {
                    info!(campaign_id = campaign.id, "cancellation observed, stopping");
                    return Ok(());
                }
                other => {
                    warn!(
                        campaign_id = campaign.id,
                        "unexpected campaign status {:?}, stopping", other
                    );
                    return Ok(());
                }
            }

            // Denials retry the same recipient after the limiter's delay;
            // nothing is counted until the send resolves.
            loop {
                let decision = self.limiter.check(&campaign.session_id).await?;
                if decision.can_send {
                    if decision.delay_ms > 0 {
                        self.clock
                            .sleep(Duration::from_millis(decision.delay_ms as u64))
                            .await;
                    }
                    break;
                }
                debug!(
                    campaign_id = campaign.id,
                    delay_ms = decision.delay_ms,
                    "rate limited, waiting before retrying recipient"
                );
                self.clock
                    .sleep(Duration::from_millis(decision.delay_ms.max(1000) as u64))
                    .await;
            }

            let transport = self
                .transports
                .transport(&campaign.session_id)
                .await
                .ok_or_else(|| {
                    Error::Precondition(format!(
                        "session '{}' disconnected mid-campaign",
                        campaign.session_id
                    ))
                })?;

            let body = template::render(
                &template.content,
                recipient,
                template.variables.as_ref(),
            );
            let caption = template
                .caption
                .as_deref()
                .map(|c| template::render(c, recipient, template.variables.as_ref()));
            let to_jid = jid::jid_from_phone(&recipient.phone_number);

            let result = match template.kind {
                TemplateKind::Text => transport.send_text(&to_jid, &body).await,
                TemplateKind::Image => {
                    let media_url = template.media_url.as_deref().unwrap_or_default();
                    transport
                        .send_image(&to_jid, media_url, caption.as_deref().or(Some(&body)))
                        .await
                }
                TemplateKind::Document => {
                    let media_url = template.media_url.as_deref().unwrap_or_default();
                    transport
                        .send_document(
                            &to_jid,
                            media_url,
                            "application/octet-stream",
                            caption.as_deref().or(Some(&body)),
                        )
                        .await
                }
            };

            match result {
                Ok(_receipt) => {
                    self.campaigns
                        .mark_recipient_sent(recipient.id, self.clock.now())
                        .await?;
                    sent += 1;
                    self.limiter.record_sent(&campaign.session_id).await?;
                }
                Err(e) => {
                    warn!(
                        campaign_id = campaign.id,
                        phone = %recipient.phone_number,
                        "recipient send failed: {}", e
                    );
                    self.campaigns
                        .mark_recipient_failed(recipient.id, &e.to_string())
                        .await?;
                    failed += 1;
                }
            }
            self.campaigns.update_counts(campaign.id, sent, failed).await?;

            let position = idx + 1;
            if position % 5 == 0 || position == run_total {
                self.publish(
                    campaign,
                    events::BROADCAST_PROGRESS,
                    json!({
                        "campaignId": campaign.id,
                        "total": campaign.total_recipients,
                        "sent": sent,
                        "failed": failed,
                        "pending": campaign.total_recipients - sent - failed,
                    }),
                )
                .await;
            }

            in_batch += 1;
            if in_batch >= batch_size && position < run_total {
                debug!(
                    campaign_id = campaign.id,
                    batch_delay_ms = campaign.batch_delay_ms,
                    "batch boundary, sleeping"
                );
                self.clock
                    .sleep(Duration::from_millis(campaign.batch_delay_ms.max(0) as u64))
                    .await;
                in_batch = 0;
            }
        }

        let completed = self
            .campaigns
            .try_transition(
                campaign.id,
                &[CampaignStatus::Processing],
                CampaignStatus::Completed,
                self.clock.now(),
            )
            .await?;
        if completed {
            self.publish(
                campaign,
                events::BROADCAST_COMPLETED,
                json!({
                    "campaignId": campaign.id,
                    "total": campaign.total_recipients,
                    "sent": sent,
                    "failed": failed,
                }),
            )
            .await;
            info!(campaign_id = campaign.id, sent, failed, "campaign completed");
        }
        Ok(())
    }

    /// One-shot broadcast to explicit group JIDs, outside any campaign.
    pub async fn send_to_groups(
        &self,
        user_id: Uuid,
        session_id: &str,
        group_jids: &[String],
        content: &str,
    ) -> Result<GroupBroadcastReport, Error> {
        let session = self
            .sessions
            .get_owned(session_id, user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session '{}'", session_id)))?;
        if group_jids.is_empty() {
            return Err(Error::InvalidArgument("no group ids given".to_string()));
        }
        if content.trim().is_empty() {
            return Err(Error::InvalidArgument("message content is required".to_string()));
        }
        let transport = self
            .transports
            .transport(&session.session_id)
            .await
            .ok_or_else(|| {
                Error::Precondition(format!("session '{}' is not connected", session_id))
            })?;

        let mut report = GroupBroadcastReport {
            sent: 0,
            failed: Vec::new(),
        };
        for group_jid in group_jids {
            let decision = self.limiter.check(session_id).await?;
            if !decision.can_send {
                return Err(decision.into_error());
            }
            if decision.delay_ms > 0 {
                self.clock
                    .sleep(Duration::from_millis(decision.delay_ms as u64))
                    .await;
            }
            match transport.send_text(group_jid, content).await {
                Ok(_) => {
                    report.sent += 1;
                    self.limiter.record_sent(session_id).await?;
                }
                Err(e) => report.failed.push(GroupBroadcastFailure {
                    group_jid: group_jid.clone(),
                    error: e.to_string(),
                }),
            }
        }
        Ok(report)
    }

    async fn publish(&self, campaign: &BroadcastCampaign, event: &str, data: serde_json::Value) {
        self.bus
            .publish(
                &[
                    topics::user(&campaign.user_id),
                    topics::broadcast(campaign.id),
                    topics::session(&campaign.session_id),
                ],
                GatewayEvent::new(event, data),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimitConfig;
    use crate::repositories::postgres::broadcasts::MockCampaignRepository;
    use crate::repositories::postgres::rate_limits::MockRateLimitRepository;
    use crate::repositories::postgres::sessions::MockSessionRepository;
    use crate::test_utils::ManualClock;
    use crate::transport::{MockChatTransport, MockTransportProvider, SendReceipt};
    use chrono::Utc;
    use std::sync::Mutex;
    use wagate_common::models::{BroadcastRecipient, RateBucket, RecipientStatus, Session, SessionStatus};

    fn recipient(id: i64, phone: &str) -> BroadcastRecipient {
        BroadcastRecipient {
            id,
            campaign_id: 1,
            phone_number: phone.to_string(),
            name: None,
            status: RecipientStatus::Pending,
            sent_at: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    fn campaign(total: i32, batch_size: i32, batch_delay_ms: i64) -> BroadcastCampaign {
        BroadcastCampaign {
            id: 1,
            user_id: Uuid::new_v4(),
            session_id: "s1".into(),
            name: "promo".into(),
            template: json!({ "type": "text", "content": "Halo {{name}}" }),
            status: CampaignStatus::Processing,
            scheduled_at: None,
            started_at: Some(Utc::now()),
            completed_at: None,
            total_recipients: total,
            sent_count: 0,
            failed_count: 0,
            batch_size,
            batch_delay_ms,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

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

    struct Fixture {
        campaigns: MockCampaignRepository,
        sessions: MockSessionRepository,
        transports: MockTransportProvider,
        rate: MockRateLimitRepository,
        clock: Arc<ManualClock>,
        bus: Arc<EventBus>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                campaigns: MockCampaignRepository::new(),
                sessions: MockSessionRepository::new(),
                transports: MockTransportProvider::new(),
                rate: MockRateLimitRepository::new(),
                clock: Arc::new(ManualClock::epoch()),
                bus: Arc::new(EventBus::new()),
            }
        }

        fn build(self) -> (Arc<BroadcastExecutor>, Arc<ManualClock>, Arc<EventBus>) {
            let limiter = Arc::new(RateLimiter::new(
                Arc::new(self.rate),
                self.clock.clone(),
                RateLimitConfig::default(),
            ));
            let executor = Arc::new(BroadcastExecutor::new(
                Arc::new(self.campaigns),
                Arc::new(self.sessions),
                Arc::new(self.transports),
                limiter,
                self.bus.clone(),
                self.clock.clone(),
                BroadcastDefaults::default(),
            ));
            (executor, self.clock, self.bus)
        }
    }

    fn happy_transport() -> MockChatTransport {
        let mut transport = MockChatTransport::new();
        transport.expect_send_text().returning(|_, _| {
            Ok(SendReceipt {
                message_id: "prov".into(),
                timestamp: Utc::now(),
            })
        });
        transport
    }

    #[tokio::test]
    async fn processes_in_batches_with_progress_and_accounting() {
        let mut f = Fixture::new();
        let recipients: Vec<_> = (1..=25).map(|i| recipient(i, &format!("62812{:07}", i))).collect();
        f.campaigns
            .expect_pending_recipients()
            .returning(move |_| Ok(recipients.clone()));
        f.campaigns
            .expect_status()
            .returning(|_| Ok(Some(CampaignStatus::Processing)));
        f.campaigns
            .expect_mark_recipient_sent()
            .times(25)
            .returning(|_, _| Ok(()));

        let counts = Arc::new(Mutex::new(Vec::new()));
        let counts_probe = counts.clone();
        f.campaigns
            .expect_update_counts()
            .times(25)
            .returning(move |_, sent, failed| {
                counts_probe.lock().unwrap().push((sent, failed));
                Ok(())
            });
        f.campaigns
            .expect_try_transition()
            .withf(|_, from, to, _| {
                from.len() == 1
                    && from[0] == CampaignStatus::Processing
                    && *to == CampaignStatus::Completed
            })
            .times(1)
            .returning(|_, _, _, _| Ok(true));

        let transport = Arc::new(happy_transport());
        f.transports
            .expect_transport()
            .returning(move |_| Some(transport.clone() as Arc<dyn crate::transport::ChatTransport>));
        f.rate
            .expect_refresh()
            .returning(|_, _| Ok(RateBucket::empty("s1")));
        f.rate
            .expect_record_sent()
            .times(25)
            .returning(|_, _, _, _| Ok(RateBucket::empty("s1")));

        let (executor, clock, bus) = f.build();
        let mut progress_rx = bus.subscribe(&topics::broadcast(1), Some(64)).await;

        executor
            .process(&campaign(25, 10, 100))
            .await
            .expect("campaign should drain");

        // Two batch boundaries: after recipients 10 and 20.
        let batch_sleeps: Vec<_> = clock
            .slept
            .lock()
            .unwrap()
            .iter()
            .filter(|d| **d == Duration::from_millis(100))
            .cloned()
            .collect();
        assert_eq!(batch_sleeps.len(), 2);

        // Counters are monotone and account for every recipient.
        let counts = counts.lock().unwrap();
        let mut prev = 0;
        for (sent, failed) in counts.iter() {
            assert!(sent + failed >= prev, "sent+failed regressed");
            prev = sent + failed;
        }
        assert_eq!(*counts.last().unwrap(), (25, 0));

        // One progress event per 5 recipients, then the completion event.
        let mut progress = 0;
        let mut completed = 0;
        while let Ok(evt) = progress_rx.try_recv() {
            match evt.event.as_str() {
                events::BROADCAST_PROGRESS => progress += 1,
                events::BROADCAST_COMPLETED => completed += 1,
                _ => {}
            }
        }
        assert_eq!(progress, 5);
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn failed_recipients_are_counted_not_fatal() {
        let mut f = Fixture::new();
        let recipients: Vec<_> = (1..=4).map(|i| recipient(i, &format!("62812{:07}", i))).collect();
        f.campaigns
            .expect_pending_recipients()
            .returning(move |_| Ok(recipients.clone()));
        f.campaigns
            .expect_status()
            .returning(|_| Ok(Some(CampaignStatus::Processing)));
        f.campaigns.expect_mark_recipient_sent().times(3).returning(|_, _| Ok(()));
        f.campaigns
            .expect_mark_recipient_failed()
            .withf(|id, error| *id == 2 && error.contains("number not on network"))
            .times(1)
            .returning(|_, _| Ok(()));
        let final_counts = Arc::new(Mutex::new((0, 0)));
        let probe = final_counts.clone();
        f.campaigns.expect_update_counts().returning(move |_, s, fl| {
            *probe.lock().unwrap() = (s, fl);
            Ok(())
        });
        f.campaigns.expect_try_transition().returning(|_, _, _, _| Ok(true));

        let mut transport = MockChatTransport::new();
        let mut call = 0;
        transport.expect_send_text().returning(move |_, _| {
            call += 1;
            if call == 2 {
                Err(Error::Dependency("number not on network".into()))
            } else {
                Ok(SendReceipt {
                    message_id: "prov".into(),
                    timestamp: Utc::now(),
                })
            }
        });
        let transport = Arc::new(transport);
        f.transports
            .expect_transport()
            .returning(move |_| Some(transport.clone() as Arc<dyn crate::transport::ChatTransport>));
        f.rate.expect_refresh().returning(|_, _| Ok(RateBucket::empty("s1")));
        f.rate.expect_record_sent().times(3).returning(|_, _, _, _| Ok(RateBucket::empty("s1")));

        let (executor, _clock, _bus) = f.build();
        executor.process(&campaign(4, 20, 0)).await.unwrap();
        assert_eq!(*final_counts.lock().unwrap(), (3, 1));
    }

    #[tokio::test]
    async fn cancellation_stops_after_current_recipient() {
        let mut f = Fixture::new();
        let recipients: Vec<_> = (1..=10).map(|i| recipient(i, &format!("62812{:07}", i))).collect();
        f.campaigns
            .expect_pending_recipients()
            .returning(move |_| Ok(recipients.clone()));
        let mut checks = 0;
        f.campaigns.expect_status().returning(move |_| {
            checks += 1;
            Ok(Some(if checks <= 3 {
                CampaignStatus::Processing
            } else {
                CampaignStatus::Cancelled
            }))
        });
        f.campaigns
            .expect_mark_recipient_sent()
            .times(3)
            .returning(|_, _| Ok(()));
        f.campaigns.expect_update_counts().returning(|_, _, _| Ok(()));
        // No completed transition may happen after a cancel.
        f.campaigns.expect_try_transition().times(0);

        let transport = Arc::new(happy_transport());
        f.transports
            .expect_transport()
            .returning(move |_| Some(transport.clone() as Arc<dyn crate::transport::ChatTransport>));
        f.rate.expect_refresh().returning(|_, _| Ok(RateBucket::empty("s1")));
        f.rate.expect_record_sent().returning(|_, _, _, _| Ok(RateBucket::empty("s1")));

        let (executor, _clock, _bus) = f.build();
        executor.process(&campaign(10, 20, 0)).await.unwrap();
    }

    #[tokio::test]
    async fn rate_limit_denial_retries_same_recipient() {
        let mut f = Fixture::new();
        let recipients = vec![recipient(1, "6281234567")];
        f.campaigns
            .expect_pending_recipients()
            .returning(move |_| Ok(recipients.clone()));
        f.campaigns
            .expect_status()
            .returning(|_| Ok(Some(CampaignStatus::Processing)));
        f.campaigns.expect_mark_recipient_sent().times(1).returning(|_, _| Ok(()));
        f.campaigns.expect_update_counts().returning(|_, _, _| Ok(()));
        f.campaigns.expect_try_transition().returning(|_, _, _, _| Ok(true));

        // First refresh: in cooldown; second: clear.
        let mut refreshes = 0;
        let base = ManualClock::epoch().now();
        f.rate.expect_refresh().returning(move |_, now| {
            refreshes += 1;
            let mut b = RateBucket::empty("s1");
            if refreshes == 1 {
                b.cooldown_until = Some(base + chrono::Duration::seconds(30));
                assert!(now >= base);
            }
            Ok(b)
        });
        f.rate.expect_record_sent().times(1).returning(|_, _, _, _| Ok(RateBucket::empty("s1")));

        let transport = Arc::new(happy_transport());
        f.transports
            .expect_transport()
            .returning(move |_| Some(transport.clone() as Arc<dyn crate::transport::ChatTransport>));

        let (executor, clock, _bus) = f.build();
        executor.process(&campaign(1, 20, 0)).await.unwrap();
        // The cooldown wait was actually slept.
        assert!(clock
            .slept
            .lock()
            .unwrap()
            .iter()
            .any(|d| *d >= Duration::from_secs(29)));
    }

    #[tokio::test]
    async fn create_normalizes_phones_and_validates_bounds() {
        let mut f = Fixture::new();
        let user_id = Uuid::new_v4();
        f.sessions
            .expect_get_owned()
            .returning(move |_, _| Ok(Some(sample_session(user_id))));
        f.campaigns
            .expect_create()
            .withf(|campaign, recipients| {
                campaign.status == CampaignStatus::Draft
                    && recipients.len() == 2
                    && recipients[0].0 == "6281234567890"
                    && recipients[1].0 == "6289876543210"
            })
            .returning(|campaign, _| Ok(BroadcastCampaign { id: 9, ..campaign.clone() }));

        let (executor, _clock, _bus) = f.build();
        let input = CreateCampaignInput {
            session_id: "s1".into(),
            name: "promo".into(),
            template: MessageTemplate {
                kind: TemplateKind::Text,
                content: "Halo {{name}}".into(),
                media_url: None,
                caption: None,
                variables: None,
            },
            recipients: vec![
                RecipientInput { phone: "081234567890".into(), name: Some("Budi".into()) },
                RecipientInput { phone: "+62 898 7654 3210".into(), name: None },
            ],
            scheduled_at: None,
            batch_size: None,
            batch_delay_ms: None,
        };
        let created = executor.create(user_id, input).await.unwrap();
        assert_eq!(created.id, 9);
    }

    #[tokio::test]
    async fn create_rejects_media_template_without_url() {
        let mut f = Fixture::new();
        let user_id = Uuid::new_v4();
        f.sessions
            .expect_get_owned()
            .returning(move |_, _| Ok(Some(sample_session(user_id))));

        let (executor, _clock, _bus) = f.build();
        let input = CreateCampaignInput {
            session_id: "s1".into(),
            name: "promo".into(),
            template: MessageTemplate {
                kind: TemplateKind::Image,
                content: "lihat gambar".into(),
                media_url: None,
                caption: None,
                variables: None,
            },
            recipients: vec![RecipientInput { phone: "081234567890".into(), name: None }],
            scheduled_at: None,
            batch_size: None,
            batch_delay_ms: None,
        };
        let err = executor.create(user_id, input).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn create_rejects_empty_recipient_list() {
        let mut f = Fixture::new();
        let user_id = Uuid::new_v4();
        f.sessions
            .expect_get_owned()
            .returning(move |_, _| Ok(Some(sample_session(user_id))));

        let (executor, _clock, _bus) = f.build();
        let input = CreateCampaignInput {
            session_id: "s1".into(),
            name: "promo".into(),
            template: MessageTemplate {
                kind: TemplateKind::Text,
                content: "halo".into(),
                media_url: None,
                caption: None,
                variables: None,
            },
            recipients: vec![],
            scheduled_at: None,
            batch_size: None,
            batch_delay_ms: None,
        };
        assert!(matches!(
            executor.create(user_id, input).await.unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }
}
