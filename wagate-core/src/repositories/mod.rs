pub mod postgres;

pub use postgres::auto_reply_rules::{AutoReplyRuleRepository, PostgresAutoReplyRuleRepository};
pub use postgres::broadcasts::{CampaignRepository, PostgresCampaignRepository};
pub use postgres::contacts::{ContactRepository, PostgresContactRepository};
pub use postgres::conversations::{ConversationRepository, PostgresConversationRepository};
pub use postgres::groups::{GroupRepository, PostgresGroupRepository};
pub use postgres::messages::{MessageRepository, PostgresMessageRepository};
pub use postgres::rate_limits::{PostgresRateLimitRepository, RateLimitRepository};
pub use postgres::scraping_logs::{PostgresScrapingLogRepository, ScrapingLogRepository};
pub use postgres::sessions::{PostgresSessionRepository, SessionRepository};
