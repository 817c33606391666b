//! Directory scraper: enumerates the session's address book and joined
//! groups without tripping anti-abuse heuristics. Pacing, daily quota, and
//! cooldown all come from one profile-selected config.

use std::collections::HashSet;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveTime;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use wagate_common::models::{Contact, Group, GroupMember, ScrapeTarget, Session};
use wagate_common::Error;

use crate::repositories::{
    ContactRepository, GroupRepository, ScrapingLogRepository, SessionRepository,
};
use crate::transport::{jid, Identity, ParticipantInfo, TransportProvider};
use crate::util::{pacing, phone, Clock};

#[derive(Debug, Clone)]
pub struct ScraperConfig {
    pub max_scrapes_per_day: i64,
    pub cooldown_between_scrapes: Duration,
    pub min_delay_between_groups: Duration,
    pub max_delay_between_groups: Duration,
    pub contacts_per_batch: usize,
    pub batch_save_delay: Duration,
    pub max_contacts_per_scrape: usize,
    /// Provider limit per identity-resolution query.
    pub lid_resolve_batch: usize,
}

impl ScraperConfig {
    pub fn safe() -> Self {
        Self {
            max_scrapes_per_day: 2,
            cooldown_between_scrapes: Duration::from_secs(6 * 3600),
            min_delay_between_groups: Duration::from_secs(8),
            max_delay_between_groups: Duration::from_secs(15),
            contacts_per_batch: 25,
            batch_save_delay: Duration::from_secs(3),
            max_contacts_per_scrape: 500,
            lid_resolve_batch: 50,
        }
    }

    pub fn balanced() -> Self {
        Self {
            max_scrapes_per_day: 3,
            cooldown_between_scrapes: Duration::from_secs(2 * 3600),
            min_delay_between_groups: Duration::from_secs(5),
            max_delay_between_groups: Duration::from_secs(12),
            contacts_per_batch: 50,
            batch_save_delay: Duration::from_secs(2),
            max_contacts_per_scrape: 1000,
            lid_resolve_batch: 50,
        }
    }

    pub fn aggressive() -> Self {
        Self {
            max_scrapes_per_day: 5,
            cooldown_between_scrapes: Duration::from_secs(3600),
            min_delay_between_groups: Duration::from_secs(3),
            max_delay_between_groups: Duration::from_secs(6),
            contacts_per_batch: 100,
            batch_save_delay: Duration::from_secs(1),
            max_contacts_per_scrape: 3000,
            lid_resolve_batch: 50,
        }
    }

    /// `WAGATE_SCRAPER_PROFILE` ∈ {safe, balanced, aggressive}.
    pub fn from_env() -> Self {
        match env::var("WAGATE_SCRAPER_PROFILE").as_deref() {
            Ok("safe") => Self::safe(),
            Ok("aggressive") => Self::aggressive(),
            _ => Self::balanced(),
        }
    }
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self::balanced()
    }
}

/// Quota/cooldown snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeQuotaStatus {
    pub scrapes_today: i64,
    pub max_scrapes_per_day: i64,
    pub cooldown_remaining_ms: i64,
    pub can_scrape: bool,
}

pub struct ContactScraper {
    sessions: Arc<dyn SessionRepository>,
    contacts: Arc<dyn ContactRepository>,
    groups: Arc<dyn GroupRepository>,
    logs: Arc<dyn ScrapingLogRepository>,
    transports: Arc<dyn TransportProvider>,
    clock: Arc<dyn Clock>,
    config: ScraperConfig,
}

impl ContactScraper {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        contacts: Arc<dyn ContactRepository>,
        groups: Arc<dyn GroupRepository>,
        logs: Arc<dyn ScrapingLogRepository>,
        transports: Arc<dyn TransportProvider>,
        clock: Arc<dyn Clock>,
        config: ScraperConfig,
    ) -> Self {
        Self {
            sessions,
            contacts,
            groups,
            logs,
            transports,
            clock,
            config,
        }
    }

    async fn owned_connected_session(
        &self,
        user_id: Uuid,
        session_id: &str,
    ) -> Result<Session, Error> {
        let session = self
            .sessions
            .get_owned(session_id, user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session '{}'", session_id)))?;
        if !self.transports.is_connected(session_id).await {
            return Err(Error::Precondition(format!(
                "session '{}' is not connected",
                session_id
            )));
        }
        Ok(session)
    }

    fn day_start(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock
            .now()
            .date_naive()
            .and_time(NaiveTime::MIN)
            .and_utc()
    }

    pub async fn quota_status(
        &self,
        user_id: Uuid,
        session_id: &str,
    ) -> Result<ScrapeQuotaStatus, Error> {
        let now = self.clock.now();
        let scrapes_today = self
            .logs
            .completed_count_since(user_id, session_id, self.day_start())
            .await?;
        let cooldown_remaining_ms = match self.logs.last_completed_at(user_id, session_id).await? {
            Some(last) => {
                let next = last
                    + chrono::Duration::from_std(self.config.cooldown_between_scrapes)
                        .unwrap_or_default();
                (next - now).num_milliseconds().max(0)
            }
            None => 0,
        };
        Ok(ScrapeQuotaStatus {
            scrapes_today,
            max_scrapes_per_day: self.config.max_scrapes_per_day,
            cooldown_remaining_ms,
            can_scrape: scrapes_today < self.config.max_scrapes_per_day
                && cooldown_remaining_ms == 0,
        })
    }

    async fn check_quota(&self, user_id: Uuid, session_id: &str) -> Result<(), Error> {
        let status = self.quota_status(user_id, session_id).await?;
        if status.scrapes_today >= status.max_scrapes_per_day {
            let midnight = self.day_start() + chrono::Duration::days(1);
            return Err(Error::RateLimited {
                reason: format!(
                    "daily scrape quota reached ({}/{})",
                    status.scrapes_today, status.max_scrapes_per_day
                ),
                retry_after_ms: (midnight - self.clock.now()).num_milliseconds().max(0),
            });
        }
        if status.cooldown_remaining_ms > 0 {
            let minutes = (status.cooldown_remaining_ms + 59_999) / 60_000;
            return Err(Error::RateLimited {
                reason: format!("scrape cooldown active, try again in {} minutes", minutes),
                retry_after_ms: status.cooldown_remaining_ms,
            });
        }
        Ok(())
    }

    /// Enumerate contacts from the contact store, the chat list, and joined
    /// groups; dedup by phone, resolve LIDs in batches, persist in paced
    /// batches. Returns the number of unique entries collected.
    pub async fn scrape_contacts(&self, user_id: Uuid, session_id: &str) -> Result<i32, Error> {
        let session = self.owned_connected_session(user_id, session_id).await?;
        self.check_quota(user_id, session_id).await?;

        let log = self
            .logs
            .start(user_id, session_id, ScrapeTarget::Contacts, self.clock.now())
            .await?;
        match self.collect_contacts(&session).await {
            Ok(total) => {
                self.logs.complete(log.id, total, self.clock.now()).await?;
                info!(session_id, total, "contact scrape completed");
                Ok(total)
            }
            Err(e) => {
                self.logs
                    .fail(log.id, &e.to_string(), self.clock.now())
                    .await?;
                Err(e)
            }
        }
    }

    async fn collect_contacts(&self, session: &Session) -> Result<i32, Error> {
        let transport = self
            .transports
            .transport(&session.session_id)
            .await
            .ok_or_else(|| {
                Error::Precondition(format!(
                    "session '{}' is not connected",
                    session.session_id
                ))
            })?;

        let cap = self.config.max_contacts_per_scrape;
        let mut seen: HashSet<String> = HashSet::new();
        let mut collected: Vec<Contact> = Vec::new();
        let mut pending_lids: Vec<String> = Vec::new();
        let mut lid_seen: HashSet<String> = HashSet::new();

        // Source priority: the durable contact store first, then active
        // chats, then group rosters.
        for (source, entries) in [
            ("contact_store", transport.contact_store().await?),
            ("chat_list", transport.chat_list().await?),
        ] {
            for entry in entries {
                if collected.len() >= cap {
                    break;
                }
                let identity = entry
                    .phone
                    .as_deref()
                    .map(|p| Identity::Phone(phone::normalize(p)))
                    .unwrap_or_else(|| jid::identify(&entry.jid));
                let Identity::Phone(number) = identity else {
                    continue;
                };
                if !phone::is_plausible(&number) || !seen.insert(number.clone()) {
                    continue;
                }
                let mut contact = Contact::new(session.user_id, &session.session_id, &number);
                contact.display_name = entry.display_name.clone();
                contact.push_name = entry.push_name.clone();
                contact.is_business = entry.is_business;
                contact.metadata = json!({ "source": source, "jid": entry.jid });
                collected.push(contact);
            }
        }

        if collected.len() < cap {
            let groups = transport.joined_groups().await?;
            for group in groups {
                if collected.len() >= cap {
                    break;
                }
                let pause = pacing::uniform_delay(
                    self.config.min_delay_between_groups,
                    self.config.max_delay_between_groups,
                    &mut rand::thread_rng(),
                );
                self.clock.sleep(pause).await;
                let participants = match transport.group_participants(&group.group_jid).await {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(group_jid = %group.group_jid, "participant fetch failed: {}", e);
                        continue;
                    }
                };
                for participant in participants {
                    if collected.len() >= cap {
                        break;
                    }
                    match jid::identify(&participant.participant_jid) {
                        Identity::Phone(number) => {
                            if !phone::is_plausible(&number) || !seen.insert(number.clone()) {
                                continue;
                            }
                            let mut contact =
                                Contact::new(session.user_id, &session.session_id, &number);
                            contact.push_name = participant.push_name.clone();
                            contact.metadata = json!({
                                "source": "group",
                                "fromGroup": group.name.clone(),
                                "jid": participant.participant_jid.clone(),
                            });
                            collected.push(contact);
                        }
                        Identity::Lid(lid) => {
                            if lid_seen.insert(lid.clone()) {
                                pending_lids.push(lid);
                            }
                        }
                    }
                }
            }
        }

        // Batched LID -> phone recovery; unresolved entries are stored
        // under the LID pseudo-identifier so later scrapes can merge them.
        for chunk in pending_lids.chunks(self.config.lid_resolve_batch.max(1)) {
            if collected.len() >= cap {
                break;
            }
            let resolved = match transport.resolve_lids(chunk).await {
                Ok(map) => map,
                Err(e) => {
                    warn!("lid resolution failed for batch of {}: {}", chunk.len(), e);
                    Default::default()
                }
            };
            for lid in chunk {
                if collected.len() >= cap {
                    break;
                }
                let contact = match resolved.get(lid) {
                    Some(number) => {
                        let number = phone::normalize(number);
                        if !phone::is_plausible(&number) || !seen.insert(number.clone()) {
                            continue;
                        }
                        let mut c = Contact::new(session.user_id, &session.session_id, &number);
                        c.metadata = json!({ "source": "lid_resolution", "lid": lid });
                        c
                    }
                    None => {
                        let key = format!("LID_{}", lid);
                        if !seen.insert(key.clone()) {
                            continue;
                        }
                        let mut c = Contact::new(session.user_id, &session.session_id, &key);
                        c.metadata = json!({ "source": "group", "isLidFormat": true, "lid": lid });
                        c
                    }
                };
                collected.push(contact);
            }
        }

        let total = collected.len() as i32;
        let batches: Vec<&[Contact]> = collected.chunks(self.config.contacts_per_batch.max(1)).collect();
        let batch_count = batches.len();
        for (i, batch) in batches.into_iter().enumerate() {
            self.contacts.upsert_batch(batch).await?;
            debug!(batch = i + 1, of = batch_count, "contact batch saved");
            if i + 1 < batch_count {
                self.clock.sleep(self.config.batch_save_delay).await;
            }
        }
        Ok(total)
    }

    /// One row per joined group, with participant/admin counts derived
    /// from a paced roster walk.
    pub async fn scrape_groups(&self, user_id: Uuid, session_id: &str) -> Result<i32, Error> {
        let session = self.owned_connected_session(user_id, session_id).await?;
        self.check_quota(user_id, session_id).await?;

        let log = self
            .logs
            .start(user_id, session_id, ScrapeTarget::Groups, self.clock.now())
            .await?;
        match self.collect_groups(&session).await {
            Ok(total) => {
                self.logs.complete(log.id, total, self.clock.now()).await?;
                info!(session_id, total, "group scrape completed");
                Ok(total)
            }
            Err(e) => {
                self.logs
                    .fail(log.id, &e.to_string(), self.clock.now())
                    .await?;
                Err(e)
            }
        }
    }

    async fn collect_groups(&self, session: &Session) -> Result<i32, Error> {
        let transport = self
            .transports
            .transport(&session.session_id)
            .await
            .ok_or_else(|| {
                Error::Precondition(format!(
                    "session '{}' is not connected",
                    session.session_id
                ))
            })?;

        let groups = transport.joined_groups().await?;
        let mut total = 0;
        for info in groups {
            let pause = pacing::uniform_delay(
                self.config.min_delay_between_groups,
                self.config.max_delay_between_groups,
                &mut rand::thread_rng(),
            );
            self.clock.sleep(pause).await;
            let participants = match transport.group_participants(&info.group_jid).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(group_jid = %info.group_jid, "participant fetch failed: {}", e);
                    Vec::new()
                }
            };
            let admin_count = participants
                .iter()
                .filter(|p| p.is_admin || p.is_super_admin)
                .count() as i32;

            let row = Group {
                id: 0,
                user_id: session.user_id,
                session_id: session.session_id.clone(),
                group_jid: info.group_jid.clone(),
                name: info.name.clone(),
                description: info.description.clone(),
                owner_jid: info.owner_jid.clone(),
                participant_count: participants.len() as i32,
                admin_count,
                is_announce: info.is_announce,
                is_locked: info.is_locked,
                metadata: info.metadata.clone(),
                created_at: self.clock.now(),
                updated_at: self.clock.now(),
            };
            let stored = self.groups.upsert(&row).await?;
            self.store_members(stored.id, &participants).await;
            total += 1;
        }
        Ok(total)
    }

    /// Enumerate one group's roster, resolving LIDs, and refresh counts.
    pub async fn scrape_group_members(
        &self,
        user_id: Uuid,
        group_db_id: i64,
    ) -> Result<i32, Error> {
        let group = self
            .groups
            .get_by_id(group_db_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("group {}", group_db_id)))?;
        if group.user_id != user_id {
            return Err(Error::Forbidden(format!(
                "group {} belongs to another user",
                group_db_id
            )));
        }
        let session = self
            .owned_connected_session(user_id, &group.session_id)
            .await?;
        let transport = self
            .transports
            .transport(&session.session_id)
            .await
            .ok_or_else(|| {
                Error::Precondition(format!(
                    "session '{}' is not connected",
                    session.session_id
                ))
            })?;

        let log = self
            .logs
            .start(
                user_id,
                &session.session_id,
                ScrapeTarget::GroupMembers,
                self.clock.now(),
            )
            .await?;
        match transport.group_participants(&group.group_jid).await {
            Ok(participants) => {
                self.store_members(group.id, &participants).await;
                let total = participants.len() as i32;
                self.logs.complete(log.id, total, self.clock.now()).await?;
                Ok(total)
            }
            Err(e) => {
                self.logs
                    .fail(log.id, &e.to_string(), self.clock.now())
                    .await?;
                Err(e)
            }
        }
    }

    async fn store_members(&self, group_id: i64, participants: &[ParticipantInfo]) {
        for participant in participants {
            let identity = jid::identify(&participant.participant_jid);
            let member = GroupMember {
                id: 0,
                group_id,
                participant_jid: participant.participant_jid.clone(),
                phone_number: identity.phone().map(str::to_string),
                display_name: None,
                push_name: participant.push_name.clone(),
                is_admin: participant.is_admin,
                is_super_admin: participant.is_super_admin,
                is_lid_format: identity.is_lid(),
                created_at: self.clock.now(),
                updated_at: self.clock.now(),
            };
            if let Err(e) = self.groups.upsert_member(&member).await {
                warn!(
                    participant_jid = %participant.participant_jid,
                    "member upsert failed: {}", e
                );
            }
        }
        if let Err(e) = self.groups.refresh_counts(group_id).await {
            warn!(group_id, "count refresh failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::postgres::contacts::MockContactRepository;
    use crate::repositories::postgres::groups::MockGroupRepository;
    use crate::repositories::postgres::scraping_logs::MockScrapingLogRepository;
    use crate::repositories::postgres::sessions::MockSessionRepository;
    use crate::test_utils::ManualClock;
    use crate::transport::{
        ChatTransport, DirectoryEntry, GroupInfo, MockChatTransport, MockTransportProvider,
    };
    use chrono::Utc;
    use std::collections::HashMap;
    use wagate_common::models::{ScrapeStatus, ScrapingLog, SessionStatus};

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

    fn log_row(id: i64) -> ScrapingLog {
        ScrapingLog {
            id,
            user_id: Uuid::new_v4(),
            session_id: "s1".into(),
            target: ScrapeTarget::Contacts,
            status: ScrapeStatus::InProgress,
            total_scraped: 0,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    fn entry(jid: &str, phone: Option<&str>, push: Option<&str>) -> DirectoryEntry {
        DirectoryEntry {
            jid: jid.to_string(),
            phone: phone.map(str::to_string),
            display_name: None,
            push_name: push.map(str::to_string),
            is_business: false,
        }
    }

    struct Fixture {
        sessions: MockSessionRepository,
        contacts: MockContactRepository,
        groups: MockGroupRepository,
        logs: MockScrapingLogRepository,
        transports: MockTransportProvider,
        clock: Arc<ManualClock>,
        config: ScraperConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let mut config = ScraperConfig::balanced();
            config.contacts_per_batch = 2;
            Self {
                sessions: MockSessionRepository::new(),
                contacts: MockContactRepository::new(),
                groups: MockGroupRepository::new(),
                logs: MockScrapingLogRepository::new(),
                transports: MockTransportProvider::new(),
                clock: Arc::new(ManualClock::epoch()),
                config,
            }
        }

        fn with_owned_session(mut self, user_id: Uuid) -> Self {
            self.sessions
                .expect_get_owned()
                .returning(move |_, _| Ok(Some(sample_session(user_id))));
            self.transports.expect_is_connected().returning(|_| true);
            self
        }

        fn build(self) -> (ContactScraper, Arc<ManualClock>) {
            let clock = self.clock.clone();
            (
                ContactScraper::new(
                    Arc::new(self.sessions),
                    Arc::new(self.contacts),
                    Arc::new(self.groups),
                    Arc::new(self.logs),
                    Arc::new(self.transports),
                    self.clock,
                    self.config,
                ),
                clock,
            )
        }
    }

    #[tokio::test]
    async fn daily_quota_denies_before_logging() {
        let user_id = Uuid::new_v4();
        let mut f = Fixture::new().with_owned_session(user_id);
        f.logs
            .expect_completed_count_since()
            .returning(|_, _, _| Ok(3));
        f.logs
            .expect_last_completed_at()
            .returning(|_, _| Ok(None));
        // No expect_start: reaching it would panic the mock.

        let (scraper, _clock) = f.build();
        let err = scraper.scrape_contacts(user_id, "s1").await.unwrap_err();
        match err {
            Error::RateLimited { reason, .. } => assert!(reason.contains("quota")),
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cooldown_denies_with_remaining_minutes_then_allows() {
        let user_id = Uuid::new_v4();
        let mut f = Fixture::new().with_owned_session(user_id);
        let clock = f.clock.clone();
        let cooldown = f.config.cooldown_between_scrapes;
        let last = clock.now() - chrono::Duration::from_std(cooldown / 2).unwrap();
        f.logs
            .expect_completed_count_since()
            .returning(|_, _, _| Ok(1));
        f.logs
            .expect_last_completed_at()
            .returning(move |_, _| Ok(Some(last)));
        f.logs.expect_start().returning(|_, _, _, at| {
            Ok(ScrapingLog {
                started_at: at,
                ..log_row(5)
            })
        });
        f.logs
            .expect_complete()
            .withf(|id, total, _| *id == 5 && *total == 0)
            .returning(|_, _, _| Ok(()));

        let mut transport = MockChatTransport::new();
        transport.expect_contact_store().returning(|| Ok(vec![]));
        transport.expect_chat_list().returning(|| Ok(vec![]));
        transport.expect_joined_groups().returning(|| Ok(vec![]));
        let transport = Arc::new(transport);
        f.transports
            .expect_transport()
            .returning(move |_| Some(transport.clone() as Arc<dyn ChatTransport>));

        let (scraper, clock) = f.build();

        // Halfway through the cooldown: denied with a minutes hint.
        let err = scraper.scrape_contacts(user_id, "s1").await.unwrap_err();
        match err {
            Error::RateLimited { reason, retry_after_ms } => {
                assert!(reason.contains("minutes"));
                assert!(retry_after_ms > 0);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }

        // Just past the cooldown: proceeds and completes.
        clock.advance(cooldown / 2 + Duration::from_secs(1));
        let total = scraper.scrape_contacts(user_id, "s1").await.unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn dedups_across_sources_and_saves_in_batches() {
        let user_id = Uuid::new_v4();
        let mut f = Fixture::new().with_owned_session(user_id);
        f.logs
            .expect_completed_count_since()
            .returning(|_, _, _| Ok(0));
        f.logs.expect_last_completed_at().returning(|_, _| Ok(None));
        f.logs.expect_start().returning(|_, _, _, _| Ok(log_row(5)));
        f.logs
            .expect_complete()
            .withf(|_, total, _| *total == 3)
            .returning(|_, _, _| Ok(()));

        let mut transport = MockChatTransport::new();
        transport.expect_contact_store().returning(|| {
            Ok(vec![
                entry("6281111111111@s.whatsapp.net", Some("6281111111111"), Some("Ani")),
                entry("6282222222222@s.whatsapp.net", Some("6282222222222"), None),
            ])
        });
        transport.expect_chat_list().returning(|| {
            Ok(vec![
                // Same number again, plus one new.
                entry("6281111111111@s.whatsapp.net", None, Some("Ani")),
                entry("6283333333333@s.whatsapp.net", Some("083333333333"), None),
            ])
        });
        transport.expect_joined_groups().returning(|| Ok(vec![]));
        let transport = Arc::new(transport);
        f.transports
            .expect_transport()
            .returning(move |_| Some(transport.clone() as Arc<dyn ChatTransport>));

        // 3 unique contacts, batch size 2 -> two batches.
        f.contacts.expect_upsert_batch().times(2).returning(|_| Ok(()));

        let (scraper, clock) = f.build();
        let total = scraper.scrape_contacts(user_id, "s1").await.unwrap();
        assert_eq!(total, 3);
        // One save delay between the two batches.
        assert!(clock
            .slept
            .lock()
            .unwrap()
            .iter()
            .any(|d| *d == Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn unresolved_lids_become_pseudo_identifiers() {
        let user_id = Uuid::new_v4();
        let mut f = Fixture::new().with_owned_session(user_id);
        f.logs
            .expect_completed_count_since()
            .returning(|_, _, _| Ok(0));
        f.logs.expect_last_completed_at().returning(|_, _| Ok(None));
        f.logs.expect_start().returning(|_, _, _, _| Ok(log_row(5)));
        f.logs.expect_complete().returning(|_, _, _| Ok(()));

        let mut transport = MockChatTransport::new();
        transport.expect_contact_store().returning(|| Ok(vec![]));
        transport.expect_chat_list().returning(|| Ok(vec![]));
        transport.expect_joined_groups().returning(|| {
            Ok(vec![GroupInfo {
                group_jid: "123@g.us".into(),
                name: Some("Komunitas".into()),
                description: None,
                owner_jid: None,
                is_announce: false,
                is_locked: false,
                metadata: json!({}),
            }])
        });
        transport.expect_group_participants().returning(|_| {
            Ok(vec![
                ParticipantInfo {
                    participant_jid: "111111111111111111111@lid".into(),
                    push_name: None,
                    is_admin: false,
                    is_super_admin: false,
                },
                ParticipantInfo {
                    participant_jid: "222222222222222222222@lid".into(),
                    push_name: None,
                    is_admin: false,
                    is_super_admin: false,
                },
            ])
        });
        transport.expect_resolve_lids().returning(|lids| {
            // Only the first LID resolves to a phone.
            let mut map = HashMap::new();
            map.insert(lids[0].clone(), "6281234567890".to_string());
            Ok(map)
        });
        let transport = Arc::new(transport);
        f.transports
            .expect_transport()
            .returning(move |_| Some(transport.clone() as Arc<dyn ChatTransport>));

        let saved = Arc::new(std::sync::Mutex::new(Vec::<Contact>::new()));
        let probe = saved.clone();
        f.contacts.expect_upsert_batch().returning(move |batch| {
            probe.lock().unwrap().extend_from_slice(batch);
            Ok(())
        });

        let (scraper, _clock) = f.build();
        let total = scraper.scrape_contacts(user_id, "s1").await.unwrap();
        assert_eq!(total, 2);

        let saved = saved.lock().unwrap();
        assert!(saved.iter().any(|c| c.phone_number == "6281234567890"));
        let pseudo = saved
            .iter()
            .find(|c| c.phone_number.starts_with("LID_"))
            .expect("unresolved LID should be stored as pseudo-identifier");
        assert_eq!(pseudo.metadata["isLidFormat"], true);
    }

    #[tokio::test]
    async fn group_scrape_counts_rosters() {
        let user_id = Uuid::new_v4();
        let mut f = Fixture::new().with_owned_session(user_id);
        f.logs
            .expect_completed_count_since()
            .returning(|_, _, _| Ok(0));
        f.logs.expect_last_completed_at().returning(|_, _| Ok(None));
        f.logs.expect_start().returning(|_, _, _, _| Ok(log_row(5)));
        f.logs
            .expect_complete()
            .withf(|_, total, _| *total == 1)
            .returning(|_, _, _| Ok(()));
        f.groups
            .expect_upsert()
            .withf(|g| g.participant_count == 2 && g.admin_count == 1)
            .returning(|g| Ok(Group { id: 3, ..g.clone() }));
        f.groups.expect_upsert_member().times(2).returning(|_| Ok(()));
        f.groups.expect_refresh_counts().returning(|_| Ok(()));

        let mut transport = MockChatTransport::new();
        transport.expect_joined_groups().returning(|| {
            Ok(vec![GroupInfo {
                group_jid: "123@g.us".into(),
                name: Some("Tim".into()),
                description: None,
                owner_jid: Some("6281@s.whatsapp.net".into()),
                is_announce: false,
                is_locked: false,
                metadata: json!({}),
            }])
        });
        transport.expect_group_participants().returning(|_| {
            Ok(vec![
                ParticipantInfo {
                    participant_jid: "6281234567890@s.whatsapp.net".into(),
                    push_name: Some("Ani".into()),
                    is_admin: true,
                    is_super_admin: false,
                },
                ParticipantInfo {
                    participant_jid: "6289876543210@s.whatsapp.net".into(),
                    push_name: None,
                    is_admin: false,
                    is_super_admin: false,
                },
            ])
        });
        let transport = Arc::new(transport);
        f.transports
            .expect_transport()
            .returning(move |_| Some(transport.clone() as Arc<dyn ChatTransport>));

        let (scraper, _clock) = f.build();
        assert_eq!(scraper.scrape_groups(user_id, "s1").await.unwrap(), 1);
    }
}
