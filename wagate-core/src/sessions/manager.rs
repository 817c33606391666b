//! Owns the per-session transports and drives the connection state machine
//! under faults. One driver task per live session consumes the transport's
//! event stream; the handle map is mutated only here.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use wagate_common::models::SessionStatus;
use wagate_common::Error;

use crate::dispatch::InboundSink;
use crate::eventbus::{events, topics, EventBus, GatewayEvent};
use crate::sessions::qr;
use crate::sessions::reconnect::ReconnectPolicy;
use crate::transport::{
    ChatTransport, CloseReason, SendReceipt, TransportEvent, TransportFactory,
};
use crate::util::Clock;

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Root of the per-session credential directories.
    pub storage_path: PathBuf,
    pub qr_ttl: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./sessions"),
            qr_ttl: Duration::from_secs(60),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

type TransportSlot = Arc<RwLock<Option<Arc<dyn ChatTransport>>>>;
type SinkSlot = Arc<RwLock<Option<Arc<dyn InboundSink>>>>;

struct SessionHandle {
    transport: TransportSlot,
    driver: JoinHandle<()>,
    manual_disconnect: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

pub struct SessionManager {
    sessions: Arc<dyn crate::repositories::SessionRepository>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    factory: Arc<dyn TransportFactory>,
    config: SessionManagerConfig,
    handles: Mutex<HashMap<String, SessionHandle>>,
    sink: SinkSlot,
}

impl SessionManager {
    pub fn new(
        sessions: Arc<dyn crate::repositories::SessionRepository>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        factory: Arc<dyn TransportFactory>,
        config: SessionManagerConfig,
    ) -> Self {
        Self {
            sessions,
            bus,
            clock,
            factory,
            config,
            handles: Mutex::new(HashMap::new()),
            sink: Arc::new(RwLock::new(None)),
        }
    }

    /// Wire the inbound pipeline. Injected after construction because the
    /// dispatcher is built on top of this manager's send primitives.
    pub async fn set_inbound_sink(&self, sink: Arc<dyn InboundSink>) {
        *self.sink.write().await = Some(sink);
    }

    pub fn credential_dir(&self, session_id: &str) -> PathBuf {
        self.config.storage_path.join(session_id)
    }

    /// Idempotent: a session with a live driver is left untouched. The
    /// transport is opened inside the driver task, so this returns before
    /// pairing completes; QR issuance is reported via live events.
    pub async fn create(&self, session_id: &str, user_id: Uuid) -> Result<(), Error> {
        let row = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session '{}'", session_id)))?;
        if row.user_id != user_id {
            return Err(Error::Forbidden(format!(
                "session '{}' belongs to another user",
                session_id
            )));
        }

        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(session_id) {
            if !handle.finished.load(Ordering::SeqCst) {
                debug!(session_id, "session already live, create is a no-op");
                return Ok(());
            }
            handles.remove(session_id);
        }

        let credential_dir = self.credential_dir(session_id);
        tokio::fs::create_dir_all(&credential_dir).await?;

        let transport: TransportSlot = Arc::new(RwLock::new(None));
        let manual_disconnect = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let driver = Driver {
            session_id: session_id.to_string(),
            user_id,
            sessions: Arc::clone(&self.sessions),
            bus: Arc::clone(&self.bus),
            clock: Arc::clone(&self.clock),
            factory: Arc::clone(&self.factory),
            sink: Arc::clone(&self.sink),
            transport: Arc::clone(&transport),
            manual_disconnect: Arc::clone(&manual_disconnect),
            finished: Arc::clone(&finished),
            credential_dir,
            qr_ttl: self.config.qr_ttl,
            policy: self.config.reconnect.clone(),
        };
        let join = tokio::spawn(driver.run());

        handles.insert(
            session_id.to_string(),
            SessionHandle {
                transport,
                driver: join,
                manual_disconnect,
                finished,
            },
        );
        info!(session_id, "session driver started");
        Ok(())
    }

    /// Handle to the live transport, or None.
    pub async fn get(&self, session_id: &str) -> Option<Arc<dyn ChatTransport>> {
        let handles = self.handles.lock().await;
        let handle = handles.get(session_id)?;
        let transport = handle.transport.read().await.clone();
        transport
    }

    /// True while a driver exists for the session, paired or not.
    pub async fn is_active(&self, session_id: &str) -> bool {
        let handles = self.handles.lock().await;
        handles
            .get(session_id)
            .map(|h| !h.finished.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// True only after the transport confirmed authentication.
    pub async fn is_connected(&self, session_id: &str) -> bool {
        match self.get(session_id).await {
            Some(transport) => transport.is_authenticated().await,
            None => false,
        }
    }

    /// Graceful close. `logout` additionally destroys the on-disk
    /// credentials and the cached QR. Reconnection will not fire.
    pub async fn disconnect(&self, session_id: &str, logout: bool) -> Result<(), Error> {
        let row = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session '{}'", session_id)))?;

        let handle = self.handles.lock().await.remove(session_id);
        if let Some(handle) = handle {
            handle.manual_disconnect.store(true, Ordering::SeqCst);
            let transport = handle.transport.write().await.take();
            if let Some(transport) = transport {
                let result = if logout {
                    transport.logout().await
                } else {
                    transport.disconnect().await
                };
                if let Err(e) = result {
                    warn!(session_id, "transport close error: {}", e);
                }
            }
            handle.driver.abort();
        }

        self.sessions
            .mark_disconnected(session_id, SessionStatus::Disconnected)
            .await?;
        if logout {
            self.sessions.clear_qr(session_id).await?;
            purge_dir(&self.credential_dir(session_id)).await?;
        }

        let reason = if logout { "logged out" } else { "manual disconnect" };
        self.bus
            .publish(
                &[topics::user(&row.user_id), topics::session(session_id)],
                GatewayEvent::new(events::SESSION_DISCONNECTED, json!({ "reason": reason })),
            )
            .await;
        info!(session_id, logout, "session disconnected");
        Ok(())
    }

    /// Purge the on-disk credential directory. Disconnects first when the
    /// session is still live.
    pub async fn cleanup(&self, session_id: &str) -> Result<(), Error> {
        if self.is_active(session_id).await {
            self.disconnect(session_id, false).await?;
        }
        purge_dir(&self.credential_dir(session_id)).await
    }

    pub async fn send_text(
        &self,
        session_id: &str,
        to: &str,
        body: &str,
    ) -> Result<SendReceipt, Error> {
        self.transport_for(session_id).await?.send_text(to, body).await
    }

    pub async fn send_image(
        &self,
        session_id: &str,
        to: &str,
        media_url: &str,
        caption: Option<&str>,
    ) -> Result<SendReceipt, Error> {
        self.transport_for(session_id)
            .await?
            .send_image(to, media_url, caption)
            .await
    }

    pub async fn send_document(
        &self,
        session_id: &str,
        to: &str,
        media_url: &str,
        mimetype: &str,
        caption: Option<&str>,
    ) -> Result<SendReceipt, Error> {
        self.transport_for(session_id)
            .await?
            .send_document(to, media_url, mimetype, caption)
            .await
    }

    async fn transport_for(&self, session_id: &str) -> Result<Arc<dyn ChatTransport>, Error> {
        self.get(session_id)
            .await
            .ok_or_else(|| Error::Precondition(format!("session '{}' is not connected", session_id)))
    }

    /// Re-attach transports for sessions that were connected before the
    /// process stopped. Failures are logged per session, never fatal.
    pub async fn restore_sessions(&self) -> Result<usize, Error> {
        let rows = self.sessions.connected_sessions().await?;
        let mut restored = 0;
        for row in rows {
            match self.create(&row.session_id, row.user_id).await {
                Ok(()) => restored += 1,
                Err(e) => warn!(
                    session_id = %row.session_id,
                    "failed to restore session: {}", e
                ),
            }
        }
        info!(restored, "session restore finished");
        Ok(restored)
    }

    /// Close every live transport. Session rows keep their status so a
    /// later restore can re-attach them.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, SessionHandle)> =
            self.handles.lock().await.drain().collect();
        for (session_id, handle) in handles {
            handle.manual_disconnect.store(true, Ordering::SeqCst);
            let transport = handle.transport.write().await.take();
            if let Some(transport) = transport {
                if let Err(e) = transport.disconnect().await {
                    warn!(session_id, "shutdown close error: {}", e);
                }
            }
            handle.driver.abort();
        }
        info!("session manager shut down");
    }
}

#[async_trait::async_trait]
impl crate::transport::TransportProvider for SessionManager {
    async fn transport(&self, session_id: &str) -> Option<Arc<dyn ChatTransport>> {
        self.get(session_id).await
    }

    async fn is_connected(&self, session_id: &str) -> bool {
        SessionManager::is_connected(self, session_id).await
    }
}

enum DriveOutcome {
    Fatal(CloseReason),
    Transient { reason: CloseReason, was_paired: bool },
}

/// Per-session task: opens the transport, pumps its events, reconnects
/// with exponential backoff on transient closes.
struct Driver {
    session_id: String,
    user_id: Uuid,
    sessions: Arc<dyn crate::repositories::SessionRepository>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    factory: Arc<dyn TransportFactory>,
    sink: SinkSlot,
    transport: TransportSlot,
    manual_disconnect: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    credential_dir: PathBuf,
    qr_ttl: Duration,
    policy: ReconnectPolicy,
}

impl Driver {
    async fn run(self) {
        let mut attempt: u32 = 0;
        loop {
            if self.manual_disconnect.load(Ordering::SeqCst) {
                break;
            }

            if let Err(e) = self
                .sessions
                .set_status(&self.session_id, SessionStatus::Connecting)
                .await
            {
                warn!(session_id = %self.session_id, "status write failed: {}", e);
            }
            self.publish(events::SESSION_STATUS, json!({ "status": "connecting" }))
                .await;

            match self.factory.open(&self.session_id, &self.credential_dir).await {
                Ok((transport, events_rx)) => {
                    *self.transport.write().await = Some(Arc::clone(&transport));
                    let outcome = self.drive(transport, events_rx).await;
                    *self.transport.write().await = None;

                    match outcome {
                        DriveOutcome::Fatal(reason) => {
                            self.fatal_cleanup(&reason).await;
                            break;
                        }
                        DriveOutcome::Transient { reason, was_paired } => {
                            if self.manual_disconnect.load(Ordering::SeqCst) {
                                break;
                            }
                            if let Err(e) = self
                                .sessions
                                .mark_disconnected(&self.session_id, SessionStatus::Disconnected)
                                .await
                            {
                                warn!(session_id = %self.session_id, "status write failed: {}", e);
                            }
                            self.publish(
                                events::SESSION_DISCONNECTED,
                                json!({ "reason": reason.friendly() }),
                            )
                            .await;
                            if was_paired {
                                attempt = 0;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(session_id = %self.session_id, "transport open failed: {}", e);
                }
            }

            if self.manual_disconnect.load(Ordering::SeqCst) {
                break;
            }
            attempt += 1;
            if attempt > self.policy.max_quick_attempts {
                info!(
                    session_id = %self.session_id,
                    "reconnect attempts exhausted, entering long cool-off"
                );
                self.clock.sleep(self.policy.long_cooloff).await;
                attempt = 0;
                continue;
            }
            let delay = self.policy.delay_for(attempt);
            debug!(
                session_id = %self.session_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            self.clock.sleep(delay).await;
        }
        self.finished.store(true, Ordering::SeqCst);
        debug!(session_id = %self.session_id, "session driver ended");
    }

    async fn drive(
        &self,
        transport: Arc<dyn ChatTransport>,
        mut events_rx: mpsc::Receiver<TransportEvent>,
    ) -> DriveOutcome {
        let mut was_paired = false;
        while let Some(event) = events_rx.recv().await {
            match event {
                TransportEvent::Qr { payload } => self.on_qr(&payload).await,
                TransportEvent::PairingSuccess { phone } => {
                    was_paired = true;
                    self.on_paired(&phone).await;
                }
                TransportEvent::Receipt { message_id, status } => {
                    let sink = self.sink.read().await.clone();
                    if let Some(sink) = sink {
                        if let Err(e) = self.session_receipt(&sink, &message_id, status).await {
                            warn!(session_id = %self.session_id, "receipt handling failed: {}", e);
                        }
                    }
                }
                TransportEvent::Message(message) => {
                    let sink = self.sink.read().await.clone();
                    match sink {
                        Some(sink) => {
                            if let Err(e) = sink
                                .dispatch(&self.session_id, Arc::clone(&transport), *message)
                                .await
                            {
                                error!(
                                    session_id = %self.session_id,
                                    "inbound dispatch failed: {}", e
                                );
                            }
                        }
                        None => {
                            debug!(session_id = %self.session_id, "no inbound sink; message dropped")
                        }
                    }
                }
                TransportEvent::Closed { reason } => {
                    return if reason.is_fatal() {
                        DriveOutcome::Fatal(reason)
                    } else {
                        DriveOutcome::Transient { reason, was_paired }
                    };
                }
            }
        }
        // Event stream gone without a close frame: treat as a transient drop.
        DriveOutcome::Transient {
            reason: CloseReason::ConnectionClosed,
            was_paired,
        }
    }

    async fn session_receipt(
        &self,
        sink: &Arc<dyn InboundSink>,
        message_id: &str,
        status: wagate_common::models::MessageStatus,
    ) -> Result<(), Error> {
        sink.receipt(&self.session_id, message_id, status).await
    }

    async fn on_qr(&self, payload: &str) {
        let data_url = match qr::to_data_url(payload) {
            Ok(url) => url,
            Err(e) => {
                error!(session_id = %self.session_id, "QR render failed: {}", e);
                return;
            }
        };
        let expires_at = self.clock.now()
            + chrono::Duration::from_std(self.qr_ttl).unwrap_or(chrono::Duration::seconds(60));
        if let Err(e) = self
            .sessions
            .set_qr(&self.session_id, &data_url, expires_at)
            .await
        {
            warn!(session_id = %self.session_id, "QR persist failed: {}", e);
        }
        self.publish(
            events::SESSION_QR,
            json!({ "qr": data_url, "expiresAt": expires_at }),
        )
        .await;
    }

    async fn on_paired(&self, phone: &str) {
        if let Err(e) = self.sessions.mark_connected(&self.session_id, phone).await {
            warn!(session_id = %self.session_id, "connected persist failed: {}", e);
        }
        self.publish(events::SESSION_CONNECTED, json!({ "phoneNumber": phone }))
            .await;
        info!(session_id = %self.session_id, phone, "session paired");
    }

    /// Fatal close: the pairing is dead on the network side. Persist the
    /// terminal state, purge credentials, then tell subscribers.
    async fn fatal_cleanup(&self, reason: &CloseReason) {
        if let Err(e) = self
            .sessions
            .mark_disconnected(&self.session_id, SessionStatus::Failed)
            .await
        {
            warn!(session_id = %self.session_id, "status write failed: {}", e);
        }
        if let Err(e) = self.sessions.clear_qr(&self.session_id).await {
            warn!(session_id = %self.session_id, "QR clear failed: {}", e);
        }
        if let Err(e) = purge_dir(&self.credential_dir).await {
            warn!(session_id = %self.session_id, "credential purge failed: {}", e);
        }
        self.publish(
            events::SESSION_CONNECTION_FAILED,
            json!({ "reason": reason.friendly() }),
        )
        .await;
        error!(session_id = %self.session_id, reason = %reason, "session failed");
    }

    async fn publish(&self, event: &str, data: serde_json::Value) {
        self.bus
            .publish(
                &[
                    topics::user(&self.user_id),
                    topics::session(&self.session_id),
                ],
                GatewayEvent::new(event, data),
            )
            .await;
    }
}

async fn purge_dir(dir: &Path) -> Result<(), Error> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::postgres::sessions::MockSessionRepository;
    use crate::test_utils::ManualClock;
    use crate::transport::{MockChatTransport, MockTransportFactory};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;
    use tokio::time::timeout;
    use wagate_common::models::Session;

    fn sample_session(session_id: &str, user_id: Uuid) -> Session {
        Session {
            id: 1,
            session_id: session_id.to_string(),
            user_id,
            display_name: "Toko".into(),
            phone_number: None,
            status: SessionStatus::QrPending,
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

    type Senders = Arc<StdMutex<Vec<mpsc::Sender<TransportEvent>>>>;

    /// Factory whose transports are inert mocks; every open hands the test
    /// a sender for injecting transport events.
    fn scripted_factory(opens: Arc<AtomicUsize>) -> (MockTransportFactory, Senders) {
        let senders: Senders = Arc::new(StdMutex::new(Vec::new()));
        let senders_out = Arc::clone(&senders);
        let mut factory = MockTransportFactory::new();
        factory.expect_open().returning(move |_, _| {
            opens.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(16);
            senders.lock().unwrap().push(tx);
            let mut transport = MockChatTransport::new();
            transport.expect_disconnect().returning(|| Ok(()));
            transport.expect_logout().returning(|| Ok(()));
            transport.expect_is_authenticated().returning(|| true);
            Ok((Arc::new(transport) as Arc<dyn ChatTransport>, rx))
        });
        (factory, senders_out)
    }

    /// Repo with just the lookup wired; tests add the write expectations
    /// they want to observe, then a blanket fallback where order allows.
    fn repo_with_row(row: Session) -> MockSessionRepository {
        let mut repo = MockSessionRepository::new();
        repo.expect_get().returning(move |_| Ok(Some(row.clone())));
        repo
    }

    fn build_manager(
        repo: MockSessionRepository,
        factory: MockTransportFactory,
        storage: &std::path::Path,
    ) -> (Arc<SessionManager>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let manager = Arc::new(SessionManager::new(
            Arc::new(repo),
            Arc::clone(&bus),
            Arc::new(ManualClock::epoch()),
            Arc::new(factory),
            SessionManagerConfig {
                storage_path: storage.to_path_buf(),
                qr_ttl: StdDuration::from_secs(60),
                reconnect: ReconnectPolicy::default(),
            },
        ));
        (manager, bus)
    }

    async fn next_event(rx: &mut mpsc::Receiver<GatewayEvent>, name: &str) -> GatewayEvent {
        timeout(StdDuration::from_secs(2), async {
            loop {
                let evt = rx.recv().await.expect("bus subscription closed");
                if evt.event == name {
                    return evt;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for event '{}'", name))
    }

    #[tokio::test]
    async fn create_is_idempotent_while_driver_lives() {
        let user_id = Uuid::new_v4();
        let storage = TempDir::new().unwrap();
        let opens = Arc::new(AtomicUsize::new(0));
        let (factory, _senders) = scripted_factory(Arc::clone(&opens));
        let mut repo = repo_with_row(sample_session("s1", user_id));
        repo.expect_set_status().returning(|_, _| Ok(()));
        repo.expect_mark_disconnected().returning(|_, _| Ok(()));
        let (manager, _bus) = build_manager(repo, factory, storage.path());

        manager.create("s1", user_id).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        manager.create("s1", user_id).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert!(manager.is_active("s1").await);
        assert!(storage.path().join("s1").is_dir());

        manager.disconnect("s1", false).await.unwrap();
        assert!(!manager.is_active("s1").await);
    }

    #[tokio::test]
    async fn create_rejects_foreign_sessions() {
        let storage = TempDir::new().unwrap();
        let opens = Arc::new(AtomicUsize::new(0));
        let (factory, _senders) = scripted_factory(opens);
        let repo = repo_with_row(sample_session("s1", Uuid::new_v4()));
        let (manager, _bus) = build_manager(repo, factory, storage.path());

        let err = manager.create("s1", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn qr_is_persisted_before_the_event_is_published() {
        let user_id = Uuid::new_v4();
        let storage = TempDir::new().unwrap();
        let opens = Arc::new(AtomicUsize::new(0));
        let (factory, senders) = scripted_factory(opens);

        let persisted = Arc::new(AtomicBool::new(false));
        let persisted_probe = Arc::clone(&persisted);
        let mut repo = repo_with_row(sample_session("s1", user_id));
        repo.expect_set_qr()
            .withf(|_, qr, _| qr.starts_with("data:image/png;base64,"))
            .returning(move |_, _, _| {
                persisted_probe.store(true, Ordering::SeqCst);
                Ok(())
            });
        repo.expect_set_status().returning(|_, _| Ok(()));
        repo.expect_mark_disconnected().returning(|_, _| Ok(()));

        let (manager, bus) = build_manager(repo, factory, storage.path());
        let mut rx = bus.subscribe(&topics::session("s1"), Some(16)).await;

        manager.create("s1", user_id).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        senders.lock().unwrap()[0]
            .send(TransportEvent::Qr { payload: "2@pairing-ref".into() })
            .await
            .unwrap();

        let evt = next_event(&mut rx, events::SESSION_QR).await;
        assert!(persisted.load(Ordering::SeqCst), "row must be written before publish");
        assert!(evt.data["qr"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));

        manager.disconnect("s1", false).await.unwrap();
    }

    #[tokio::test]
    async fn pairing_success_marks_connected() {
        let user_id = Uuid::new_v4();
        let storage = TempDir::new().unwrap();
        let opens = Arc::new(AtomicUsize::new(0));
        let (factory, senders) = scripted_factory(opens);

        let mut repo = repo_with_row(sample_session("s1", user_id));
        repo.expect_mark_connected()
            .withf(|sid, phone| sid == "s1" && phone == "628111111111")
            .returning(|_, _| Ok(()));
        repo.expect_set_status().returning(|_, _| Ok(()));
        repo.expect_mark_disconnected().returning(|_, _| Ok(()));

        let (manager, bus) = build_manager(repo, factory, storage.path());
        let mut rx = bus.subscribe(&topics::session("s1"), Some(16)).await;

        manager.create("s1", user_id).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        senders.lock().unwrap()[0]
            .send(TransportEvent::PairingSuccess { phone: "628111111111".into() })
            .await
            .unwrap();

        let evt = next_event(&mut rx, events::SESSION_CONNECTED).await;
        assert_eq!(evt.data["phoneNumber"], "628111111111");
        assert!(manager.is_connected("s1").await);

        manager.disconnect("s1", false).await.unwrap();
    }

    #[tokio::test]
    async fn fatal_close_purges_credentials_and_ends_driver() {
        let user_id = Uuid::new_v4();
        let storage = TempDir::new().unwrap();
        let opens = Arc::new(AtomicUsize::new(0));
        let (factory, senders) = scripted_factory(Arc::clone(&opens));

        let failed_written = Arc::new(AtomicBool::new(false));
        let failed_probe = Arc::clone(&failed_written);
        let mut repo = repo_with_row(sample_session("s1", user_id));
        // Only the fatal transition may touch the status columns here.
        repo.expect_mark_disconnected()
            .withf(|sid, status| sid == "s1" && *status == SessionStatus::Failed)
            .returning(move |_, _| {
                failed_probe.store(true, Ordering::SeqCst);
                Ok(())
            });
        repo.expect_clear_qr().returning(|_| Ok(()));
        repo.expect_set_status().returning(|_, _| Ok(()));

        let (manager, bus) = build_manager(repo, factory, storage.path());
        let mut rx = bus.subscribe(&topics::session("s1"), Some(16)).await;

        manager.create("s1", user_id).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(storage.path().join("s1").is_dir());

        senders.lock().unwrap()[0]
            .send(TransportEvent::Closed { reason: CloseReason::LoggedOut })
            .await
            .unwrap();

        let evt = next_event(&mut rx, events::SESSION_CONNECTION_FAILED).await;
        assert!(evt.data["reason"].as_str().unwrap().contains("logged out"));
        assert!(failed_written.load(Ordering::SeqCst));

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(!storage.path().join("s1").exists(), "credentials must be purged");
        assert!(!manager.is_active("s1").await);
        // No reconnect after a fatal close.
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_close_triggers_reconnect() {
        let user_id = Uuid::new_v4();
        let storage = TempDir::new().unwrap();
        let opens = Arc::new(AtomicUsize::new(0));
        let (factory, senders) = scripted_factory(Arc::clone(&opens));
        let mut repo = repo_with_row(sample_session("s1", user_id));
        repo.expect_set_status().returning(|_, _| Ok(()));
        repo.expect_mark_disconnected().returning(|_, _| Ok(()));
        let (manager, bus) = build_manager(repo, factory, storage.path());
        let mut rx = bus.subscribe(&topics::session("s1"), Some(32)).await;

        manager.create("s1", user_id).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        senders.lock().unwrap()[0]
            .send(TransportEvent::Closed { reason: CloseReason::ConnectionLost })
            .await
            .unwrap();

        let evt = next_event(&mut rx, events::SESSION_DISCONNECTED).await;
        assert!(evt.data["reason"].as_str().unwrap().contains("connection lost"));

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        assert!(
            opens.load(Ordering::SeqCst) >= 2,
            "a transient close must reopen the transport"
        );
        assert!(manager.is_active("s1").await);

        manager.disconnect("s1", false).await.unwrap();
    }

    #[tokio::test]
    async fn logout_clears_qr_and_credentials() {
        let user_id = Uuid::new_v4();
        let storage = TempDir::new().unwrap();
        let opens = Arc::new(AtomicUsize::new(0));
        let (factory, _senders) = scripted_factory(opens);

        let mut repo = repo_with_row(sample_session("s1", user_id));
        repo.expect_clear_qr().times(1..).returning(|_| Ok(()));
        repo.expect_set_status().returning(|_, _| Ok(()));
        repo.expect_mark_disconnected().returning(|_, _| Ok(()));

        let (manager, _bus) = build_manager(repo, factory, storage.path());
        manager.create("s1", user_id).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        manager.disconnect("s1", true).await.unwrap();
        assert!(!storage.path().join("s1").exists());
        assert!(!manager.is_active("s1").await);
    }
}
