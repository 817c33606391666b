pub mod auto_reply;
pub mod broadcast;
pub mod contact;
pub mod conversation;
pub mod group;
pub mod message;
pub mod rate_limit;
pub mod scrape;
pub mod session;

pub use auto_reply::{AutoReplyRule, MatchMode};
pub use broadcast::{
    BroadcastCampaign, BroadcastRecipient, CampaignStatus, MessageTemplate, RecipientStatus,
    TemplateKind,
};
pub use contact::Contact;
pub use conversation::{Conversation, ConversationMessage};
pub use group::{Group, GroupMember};
pub use message::{AutoReplySource, Direction, Message, MessageStatus, MessageType};
pub use rate_limit::RateBucket;
pub use scrape::{ScrapeStatus, ScrapeTarget, ScrapingLog};
pub use session::{Session, SessionSettings, SessionStatus};
