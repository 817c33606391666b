//! Wires repositories, engines, and the event bus into one shared context
//! handed to every HTTP/WS handler.

use std::sync::Arc;

use wagate_core::autoreply::ai::AiClient;
use wagate_core::autoreply::shipping::ShippingClient;
use wagate_core::autoreply::AutoReplyEngine;
use wagate_core::broadcast::BroadcastExecutor;
use wagate_core::config::GatewayConfig;
use wagate_core::dispatch::{InboundDispatcher, InboundSink};
use wagate_core::eventbus::EventBus;
use wagate_core::ratelimit::RateLimiter;
use wagate_core::repositories::{
    ContactRepository, GroupRepository, MessageRepository, PostgresAutoReplyRuleRepository,
    PostgresCampaignRepository, PostgresContactRepository, PostgresConversationRepository,
    PostgresGroupRepository, PostgresMessageRepository, PostgresRateLimitRepository,
    PostgresScrapingLogRepository, PostgresSessionRepository, SessionRepository,
};
use wagate_core::scraper::ContactScraper;
use wagate_core::sessions::SessionManager;
use wagate_core::transport::{TransportFactory, TransportProvider};
use wagate_core::util::{Clock, SystemClock};
use wagate_core::Database;

pub struct ServerContext {
    pub config: GatewayConfig,
    pub bus: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
    pub sessions: Arc<dyn SessionRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub contacts: Arc<dyn ContactRepository>,
    pub groups: Arc<dyn GroupRepository>,
    pub manager: Arc<SessionManager>,
    pub limiter: Arc<RateLimiter>,
    pub broadcasts: Arc<BroadcastExecutor>,
    pub scraper: Arc<ContactScraper>,
}

impl ServerContext {
    pub async fn build(
        db: &Database,
        config: GatewayConfig,
        factory: Arc<dyn TransportFactory>,
        shipping: Arc<dyn ShippingClient>,
        ai: Arc<dyn AiClient>,
    ) -> Arc<Self> {
        let pool = db.pool().clone();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let bus = Arc::new(EventBus::new());

        let sessions: Arc<dyn SessionRepository> =
            Arc::new(PostgresSessionRepository::new(pool.clone()));
        let messages: Arc<dyn MessageRepository> =
            Arc::new(PostgresMessageRepository::new(pool.clone()));
        let contacts: Arc<dyn ContactRepository> =
            Arc::new(PostgresContactRepository::new(pool.clone()));
        let groups: Arc<dyn GroupRepository> =
            Arc::new(PostgresGroupRepository::new(pool.clone()));
        let conversations = Arc::new(PostgresConversationRepository::new(pool.clone()));
        let rules = Arc::new(PostgresAutoReplyRuleRepository::new(pool.clone()));
        let rate_limits = Arc::new(PostgresRateLimitRepository::new(pool.clone()));
        let campaigns = Arc::new(PostgresCampaignRepository::new(pool.clone()));
        let scraping_logs = Arc::new(PostgresScrapingLogRepository::new(pool.clone()));

        let limiter = Arc::new(RateLimiter::new(
            rate_limits,
            Arc::clone(&clock),
            config.rate.clone(),
        ));

        let manager = Arc::new(SessionManager::new(
            Arc::clone(&sessions),
            Arc::clone(&bus),
            Arc::clone(&clock),
            factory,
            config.manager_config(),
        ));

        let auto_reply = Arc::new(AutoReplyEngine::new(
            rules,
            Arc::clone(&messages),
            conversations.clone(),
            Arc::clone(&limiter),
            shipping,
            ai,
            Arc::clone(&bus),
            Arc::clone(&clock),
        ));

        let dispatcher: Arc<dyn InboundSink> = Arc::new(InboundDispatcher::new(
            Arc::clone(&sessions),
            Arc::clone(&messages),
            Arc::clone(&contacts),
            Arc::clone(&groups),
            conversations,
            auto_reply,
            Arc::clone(&bus),
            Arc::clone(&clock),
            config.dispatch.clone(),
        ));
        manager.set_inbound_sink(dispatcher).await;

        let transports: Arc<dyn TransportProvider> = Arc::clone(&manager) as Arc<dyn TransportProvider>;
        let broadcasts = Arc::new(BroadcastExecutor::new(
            campaigns,
            Arc::clone(&sessions),
            Arc::clone(&transports),
            Arc::clone(&limiter),
            Arc::clone(&bus),
            Arc::clone(&clock),
            config.broadcast.clone(),
        ));

        let scraper = Arc::new(ContactScraper::new(
            Arc::clone(&sessions),
            Arc::clone(&contacts),
            Arc::clone(&groups),
            scraping_logs,
            transports,
            Arc::clone(&clock),
            config.scraper.clone(),
        ));

        Arc::new(Self {
            config,
            bus,
            clock,
            sessions,
            messages,
            contacts,
            groups,
            manager,
            limiter,
            broadcasts,
            scraper,
        })
    }
}
