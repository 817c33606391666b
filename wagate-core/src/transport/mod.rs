//! Contract with the underlying chat-network client library. The provider
//! is opaque: it exposes a per-session socket, QR pairing, and send/receive
//! events. Everything the gateway needs from it is behind these traits so
//! the engines are testable against mocks.

pub mod jid;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use wagate_common::models::{MessageStatus, MessageType};
use wagate_common::Error;

pub use jid::Identity;

/// Why the transport closed. Fatal reasons must not trigger reconnection:
/// the session's credentials are no longer valid on the network side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    LoggedOut,
    BadSession,
    Replaced,
    AuthFailure(u16),
    TimedOut,
    ConnectionLost,
    ConnectionClosed,
    Other(String),
}

impl CloseReason {
    pub fn is_fatal(&self) -> bool {
        match self {
            CloseReason::LoggedOut | CloseReason::BadSession | CloseReason::Replaced => true,
            CloseReason::AuthFailure(code) => matches!(code, 401 | 403 | 500),
            _ => false,
        }
    }

    /// User-facing description published with `session:connection_failed`
    /// and `session:disconnected` events.
    pub fn friendly(&self) -> String {
        match self {
            CloseReason::LoggedOut => "logged out from the device".to_string(),
            CloseReason::BadSession => "session is no longer valid".to_string(),
            CloseReason::Replaced => "session was replaced by another device".to_string(),
            CloseReason::AuthFailure(code) => format!("authentication failed ({})", code),
            CloseReason::TimedOut => "connection timed out".to_string(),
            CloseReason::ConnectionLost => "connection lost".to_string(),
            CloseReason::ConnectionClosed => "connection closed".to_string(),
            CloseReason::Other(s) => s.clone(),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.friendly())
    }
}

/// Whether a message event is a live notification or a history resync.
/// History gets the wider freshness window on intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Notify,
    Append,
}

/// Raw inbound message as delivered by the provider, before normalization.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub remote_jid: String,
    pub from_me: bool,
    pub participant: Option<String>,
    pub message_id: Option<String>,
    pub push_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub message_type: MessageType,
    pub content: Option<String>,
    pub media: Value,
    pub upsert_kind: UpsertKind,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Ephemeral pairing token; re-emitted by the provider until scanned.
    Qr { payload: String },
    /// Pairing confirmed; the session is authenticated as `phone`.
    PairingSuccess { phone: String },
    /// Delivery/read receipt for a previously sent message.
    Receipt {
        message_id: String,
        status: MessageStatus,
    },
    Message(Box<InboundMessage>),
    Closed { reason: CloseReason },
}

/// Provider's acknowledgment of an accepted send.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Composing,
    Paused,
    Available,
}

#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub jid: String,
    pub phone: Option<String>,
    pub display_name: Option<String>,
    pub push_name: Option<String>,
    pub is_business: bool,
}

#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub group_jid: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub owner_jid: Option<String>,
    pub is_announce: bool,
    pub is_locked: bool,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct ParticipantInfo {
    pub participant_jid: String,
    pub push_name: Option<String>,
    pub is_admin: bool,
    pub is_super_admin: bool,
}

/// One live, possibly-authenticated socket to the chat network.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// True once pairing completed and the internal user identity is known.
    async fn is_authenticated(&self) -> bool;

    async fn send_text(&self, to: &str, body: &str) -> Result<SendReceipt, Error>;

    async fn send_image<'a>(
        &self,
        to: &str,
        media_url: &str,
        caption: Option<&'a str>,
    ) -> Result<SendReceipt, Error>;

    async fn send_document<'a>(
        &self,
        to: &str,
        media_url: &str,
        mimetype: &str,
        caption: Option<&'a str>,
    ) -> Result<SendReceipt, Error>;

    async fn send_presence(&self, to: &str, presence: Presence) -> Result<(), Error>;

    async fn mark_read(&self, remote_jid: &str, message_id: &str) -> Result<(), Error>;

    /// Graceful close that keeps on-disk credentials usable.
    async fn disconnect(&self) -> Result<(), Error>;

    /// Close and invalidate the pairing on the network side.
    async fn logout(&self) -> Result<(), Error>;

    async fn contact_store(&self) -> Result<Vec<DirectoryEntry>, Error>;

    async fn chat_list(&self) -> Result<Vec<DirectoryEntry>, Error>;

    async fn joined_groups(&self) -> Result<Vec<GroupInfo>, Error>;

    async fn group_participants(&self, group_jid: &str) -> Result<Vec<ParticipantInfo>, Error>;

    /// Batched LID -> phone resolution. Callers chunk to at most 50 LIDs
    /// per request; unresolved entries are simply absent from the map.
    async fn resolve_lids(&self, lids: &[String]) -> Result<HashMap<String, String>, Error>;
}

/// Read-only view of the session manager's handle map, used by the
/// broadcast executor and the scraper to reach a session's live socket.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn transport(&self, session_id: &str) -> Option<Arc<dyn ChatTransport>>;
    async fn is_connected(&self, session_id: &str) -> bool;
}

/// Opens transports. The factory loads or initializes the on-disk auth
/// state under `credential_dir` and hands back the live socket plus its
/// event stream. Implementations own their connect/query timeouts
/// (60 s default); callers never wait unbounded on a dead socket.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        session_id: &str,
        credential_dir: &Path,
    ) -> Result<(Arc<dyn ChatTransport>, mpsc::Receiver<TransportEvent>), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_close_reasons() {
        assert!(CloseReason::LoggedOut.is_fatal());
        assert!(CloseReason::BadSession.is_fatal());
        assert!(CloseReason::Replaced.is_fatal());
        assert!(CloseReason::AuthFailure(401).is_fatal());
        assert!(CloseReason::AuthFailure(403).is_fatal());
        assert!(CloseReason::AuthFailure(500).is_fatal());
    }

    #[test]
    fn transient_close_reasons() {
        assert!(!CloseReason::TimedOut.is_fatal());
        assert!(!CloseReason::ConnectionLost.is_fatal());
        assert!(!CloseReason::ConnectionClosed.is_fatal());
        assert!(!CloseReason::AuthFailure(429).is_fatal());
        assert!(!CloseReason::Other("stream error".into()).is_fatal());
    }
}
