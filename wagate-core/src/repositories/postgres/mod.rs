pub mod auto_reply_rules;
pub mod broadcasts;
pub mod contacts;
pub mod conversations;
pub mod groups;
pub mod messages;
pub mod rate_limits;
pub mod scraping_logs;
pub mod sessions;
