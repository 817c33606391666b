//! Development transport provider. The production chat-network client is
//! an external library linked behind `TransportFactory`; this in-process
//! provider stands in for it in local runs: it emits a QR, auto-pairs
//! after a short delay, and acknowledges sends, so the full session /
//! dispatch / broadcast machinery can be exercised end to end.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use wagate_common::Error;
use wagate_core::transport::{
    ChatTransport, CloseReason, DirectoryEntry, GroupInfo, ParticipantInfo, Presence,
    SendReceipt, TransportEvent, TransportFactory,
};

pub struct DevTransportFactory {
    auto_pair_after: Duration,
    phone: String,
}

impl DevTransportFactory {
    pub fn from_env() -> Self {
        let secs = std::env::var("WAGATE_DEV_AUTOPAIR_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5u64);
        let phone = std::env::var("WAGATE_DEV_PHONE")
            .unwrap_or_else(|_| "628000000000".to_string());
        Self {
            auto_pair_after: Duration::from_secs(secs),
            phone,
        }
    }
}

#[async_trait]
impl TransportFactory for DevTransportFactory {
    async fn open(
        &self,
        session_id: &str,
        _credential_dir: &Path,
    ) -> Result<(Arc<dyn ChatTransport>, mpsc::Receiver<TransportEvent>), Error> {
        let (tx, rx) = mpsc::channel(64);
        let transport = Arc::new(DevTransport {
            authenticated: AtomicBool::new(false),
            phone: self.phone.clone(),
            events: tx.clone(),
        });

        info!(session_id, "dev transport opened");
        let pairing = Arc::clone(&transport);
        let delay = self.auto_pair_after;
        tokio::spawn(async move {
            let _ = pairing
                .events
                .send(TransportEvent::Qr {
                    payload: format!("dev-pairing-{}", Uuid::new_v4()),
                })
                .await;
            tokio::time::sleep(delay).await;
            pairing.authenticated.store(true, Ordering::SeqCst);
            let _ = pairing
                .events
                .send(TransportEvent::PairingSuccess {
                    phone: pairing.phone.clone(),
                })
                .await;
        });

        Ok((transport, rx))
    }
}

struct DevTransport {
    authenticated: AtomicBool,
    phone: String,
    events: mpsc::Sender<TransportEvent>,
}

impl DevTransport {
    fn receipt(&self) -> SendReceipt {
        SendReceipt {
            message_id: format!("dev-{}", Uuid::new_v4()),
            timestamp: Utc::now(),
        }
    }

    async fn close(&self, reason: CloseReason) {
        self.authenticated.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Closed { reason }).await;
    }
}

#[async_trait]
impl ChatTransport for DevTransport {
    async fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    async fn send_text(&self, _to: &str, _body: &str) -> Result<SendReceipt, Error> {
        Ok(self.receipt())
    }

    async fn send_image<'a>(
        &self,
        _to: &str,
        _media_url: &str,
        _caption: Option<&'a str>,
    ) -> Result<SendReceipt, Error> {
        Ok(self.receipt())
    }

    async fn send_document<'a>(
        &self,
        _to: &str,
        _media_url: &str,
        _mimetype: &str,
        _caption: Option<&'a str>,
    ) -> Result<SendReceipt, Error> {
        Ok(self.receipt())
    }

    async fn send_presence(&self, _to: &str, _presence: Presence) -> Result<(), Error> {
        Ok(())
    }

    async fn mark_read(&self, _remote_jid: &str, _message_id: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        self.close(CloseReason::ConnectionClosed).await;
        Ok(())
    }

    async fn logout(&self) -> Result<(), Error> {
        self.close(CloseReason::LoggedOut).await;
        Ok(())
    }

    async fn contact_store(&self) -> Result<Vec<DirectoryEntry>, Error> {
        Ok(Vec::new())
    }

    async fn chat_list(&self) -> Result<Vec<DirectoryEntry>, Error> {
        Ok(Vec::new())
    }

    async fn joined_groups(&self) -> Result<Vec<GroupInfo>, Error> {
        Ok(Vec::new())
    }

    async fn group_participants(&self, _group_jid: &str) -> Result<Vec<ParticipantInfo>, Error> {
        Ok(Vec::new())
    }

    async fn resolve_lids(&self, _lids: &[String]) -> Result<HashMap<String, String>, Error> {
        Ok(HashMap::new())
    }
}
