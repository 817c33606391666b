use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Hash, sqlx::Type)]
#[sqlx(type_name = "TEXT")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    QrPending,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::QrPending => write!(f, "qr_pending"),
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Connected => write!(f, "connected"),
            SessionStatus::Disconnected => write!(f, "disconnected"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qr_pending" => Ok(SessionStatus::QrPending),
            "connecting" => Ok(SessionStatus::Connecting),
            "connected" => Ok(SessionStatus::Connected),
            "disconnected" => Ok(SessionStatus::Disconnected),
            "failed" => Ok(SessionStatus::Failed),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

/// One authenticated attachment to the chat network for one tenant phone.
///
/// `session_id` is the tenant-scoped external key used everywhere above the
/// persistence layer; `id` is the internal row handle.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Session {
    pub id: i64,
    pub session_id: String,
    pub user_id: Uuid,
    pub display_name: String,
    pub phone_number: Option<String>,
    pub status: SessionStatus,
    pub qr_code: Option<String>,
    pub qr_expires_at: Option<DateTime<Utc>>,
    pub ai_assistant_type: Option<String>,
    pub ai_config: Value,
    pub webhook_url: Option<String>,
    pub settings: Value,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn settings(&self) -> SessionSettings {
        serde_json::from_value(self.settings.clone()).unwrap_or_default()
    }

    /// A QR payload is only valid while `now < qr_expires_at`.
    pub fn qr_valid_at(&self, now: DateTime<Utc>) -> bool {
        matches!((self.qr_code.as_ref(), self.qr_expires_at), (Some(_), Some(exp)) if now < exp)
    }
}

/// Recognized keys of the free-form session settings blob. Unknown keys are
/// preserved in the raw `Value` but ignored here.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub auto_reply_enabled: bool,
    pub auto_save_contacts: bool,
    pub custom_system_prompt: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            auto_reply_enabled: true,
            auto_save_contacts: true,
            custom_system_prompt: None,
        }
    }
}
