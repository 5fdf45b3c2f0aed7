use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channel::{Channel, ChannelSummary};
use super::member::MemberId;
use super::services::Services;

/// Every live room in the process, keyed by canonical lowercase name.
///
/// Rooms are created on first reference and evicted when their last member
/// leaves. Eviction saves the room and tears it down.
pub struct RoomRegistry {
    rooms: DashMap<String, Arc<Channel>>,
    services: Services,
}

impl RoomRegistry {
    pub fn new(services: Services) -> Self {
        Self {
            rooms: DashMap::new(),
            services,
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    // ── Lookup ──────────────────────────────────────────────────────

    /// The room called `name`, creating it if needed. A new room loads its
    /// snapshot in the background; joins wait for it.
    pub fn get_or_create(&self, name: &str) -> Arc<Channel> {
        let key = name.to_lowercase();
        if let Some(existing) = self.rooms.get(&key) {
            return existing.clone();
        }

        let mut created = false;
        let channel = self
            .rooms
            .entry(key)
            .or_insert_with(|| {
                created = true;
                Channel::new(name, self.services.clone())
            })
            .clone();

        if created {
            debug!(channel = %channel.key(), "room created");
            let loading = channel.clone();
            tokio::spawn(async move {
                loading.load_state().await;
                if !loading.is_dead() {
                    loading.start_ticker();
                }
            });
        }
        channel
    }

    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.rooms.get(&name.to_lowercase()).map(|c| c.clone())
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Rooms that opted into the public listing, busiest first.
    pub fn public_listing(&self) -> Vec<ChannelSummary> {
        let rooms: Vec<Arc<Channel>> = self.rooms.iter().map(|r| r.value().clone()).collect();
        let mut listing: Vec<ChannelSummary> = rooms
            .iter()
            .filter(|c| c.is_ready())
            .filter_map(|c| c.summary())
            .collect();
        listing.sort_by(|a, b| b.usercount.cmp(&a.usercount).then(a.name.cmp(&b.name)));
        listing
    }

    // ── Departure ───────────────────────────────────────────────────

    /// Remove a member from a room, unloading the room if it is now empty.
    pub async fn leave(&self, channel: &Arc<Channel>, id: MemberId) {
        if channel.part(id) {
            self.unload(channel).await;
        }
    }

    /// Drop a room nobody managed to join, so refused connections do not
    /// keep it loaded.
    pub async fn release(&self, channel: &Arc<Channel>) {
        if channel.usercount() == 0 {
            self.unload(channel).await;
        }
    }

    /// Evict an empty room: save it, then tear it down. The room stays
    /// listed while it saves, so a member arriving meantime joins it and
    /// the eviction is abandoned.
    async fn unload(&self, channel: &Arc<Channel>) {
        if channel.usercount() > 0 {
            return;
        }
        if let Err(e) = channel.save_state().await {
            warn!(channel = %channel.key(), error = %e, "save on unload failed");
        }

        let removed = self
            .rooms
            .remove_if(channel.key(), |_, c| {
                Arc::ptr_eq(c, channel) && c.close_if_empty()
            })
            .is_some();
        if !removed {
            debug!(channel = %channel.key(), "room regained members, kept loaded");
            return;
        }
        channel.teardown();
        info!(channel = %channel.key(), "room unloaded");
    }

    // ── Persistence ─────────────────────────────────────────────────

    /// Save every loaded room. Returns how many saves failed.
    pub async fn save_all(&self) -> usize {
        let rooms: Vec<Arc<Channel>> = self.rooms.iter().map(|r| r.value().clone()).collect();
        let mut failed = 0;
        for channel in rooms {
            if !channel.is_ready() || channel.is_dead() {
                continue;
            }
            if let Err(e) = channel.save_state().await {
                warn!(channel = %channel.key(), error = %e, "room save failed");
                failed += 1;
            }
        }
        failed
    }

    /// Save every room on a fixed interval until `cancel` fires.
    pub fn spawn_autosave(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let failed = registry.save_all().await;
                        debug!(rooms = registry.len(), failed, "periodic save finished");
                    }
                }
            }
        })
    }

    /// Save and tear down every room. Used on process shutdown.
    pub async fn shutdown(&self) {
        let failed = self.save_all().await;
        let keys: Vec<String> = self.rooms.iter().map(|r| r.key().clone()).collect();
        for key in keys {
            if let Some((_, channel)) = self.rooms.remove(&key) {
                channel.teardown();
            }
        }
        info!(failed, "all rooms saved and unloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::{create_pool, run_migrations};
    use crate::db::queries::{channels, users};
    use crate::db::sqlite::SqliteDatabase;
    use crate::engine::channel::JoinRequest;
    use crate::engine::error::{JoinError, LookupError};
    use crate::engine::events::{ChannelEvent, ChannelRequest};
    use crate::engine::media::Media;
    use crate::engine::member::MpscRecipient;
    use crate::engine::services::{ChannelSettings, MetadataResolver};
    use async_trait::async_trait;
    use sqlx::SqlitePool;
    use tempfile::TempDir;

    struct NoResolver;

    #[async_trait]
    impl MetadataResolver for NoResolver {
        async fn resolve(&self, _id: &str, _media_type: &str) -> Result<Vec<Media>, LookupError> {
            Err(LookupError::NotFound)
        }
    }

    async fn setup() -> (Arc<RoomRegistry>, SqlitePool, TempDir) {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let settings = ChannelSettings {
            dump_dir: dir.path().to_path_buf(),
            log_dir: None,
            ..ChannelSettings::default()
        };
        let services = Services::new(
            Arc::new(SqliteDatabase::new(pool.clone())),
            Arc::new(NoResolver),
            settings,
        );
        (Arc::new(RoomRegistry::new(services)), pool, dir)
    }

    async fn enter(channel: &Channel, name: &str) -> MemberId {
        let (recipient, _rx) = MpscRecipient::channel();
        channel
            .join(JoinRequest {
                name: name.to_string(),
                ip: "203.0.113.1".to_string(),
                password: None,
                recipient: Arc::new(recipient),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_lookup_is_case_insensitive() {
        let (registry, _pool, _dir) = setup().await;
        let a = registry.get_or_create("Lobby");
        let b = registry.get_or_create("lobby");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "Lobby");
        assert_eq!(registry.len(), 1);
        assert!(registry.get("LOBBY").is_some());
    }

    #[tokio::test]
    async fn test_last_leave_saves_and_evicts() {
        let (registry, pool, dir) = setup().await;
        channels::register_channel(&pool, "lobby", "owner")
            .await
            .unwrap();
        let channel = registry.get_or_create("lobby");
        let id = enter(&channel, "owner").await;
        assert!(channel.is_registered());

        registry.leave(&channel, id).await;
        assert!(registry.is_empty());
        assert!(channel.is_dead());
        assert!(dir.path().join("lobby").exists());

        let fresh = registry.get_or_create("lobby");
        assert!(!Arc::ptr_eq(&channel, &fresh));
    }

    #[tokio::test]
    async fn test_room_with_members_stays_loaded() {
        let (registry, _pool, _dir) = setup().await;
        let channel = registry.get_or_create("lobby");
        let alice = enter(&channel, "alice").await;
        let _bob = enter(&channel, "bob").await;

        registry.leave(&channel, alice).await;
        assert_eq!(registry.len(), 1);
        assert!(!channel.is_dead());
    }

    async fn join_viewer(
        registry: &RoomRegistry,
        name: &str,
    ) -> (Arc<Channel>, MemberId, tokio::sync::mpsc::Receiver<ChannelEvent>) {
        loop {
            let room = registry.get_or_create("lobby");
            let (recipient, rx) = MpscRecipient::channel();
            let req = JoinRequest {
                name: name.to_string(),
                ip: "203.0.113.2".to_string(),
                password: None,
                recipient: Arc::new(recipient),
            };
            match room.join(req).await {
                Ok(id) => return (room, id, rx),
                Err(JoinError::Dead) => continue,
                Err(e) => panic!("join refused: {e}"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rejoin_during_unload_sees_latest_state() {
        let (registry, pool, _dir) = setup().await;
        channels::register_channel(&pool, "lobby", "owner")
            .await
            .unwrap();

        for i in 0..40 {
            let channel = registry.get_or_create("lobby");
            let owner = enter(&channel, "owner").await;
            let motd = format!("v{i}");
            channel.handle(owner, ChannelRequest::SetMotd { motd: motd.clone() });

            let (_, (room, viewer, mut rx)) = tokio::join!(
                registry.leave(&channel, owner),
                join_viewer(&registry, "viewer"),
            );

            let mut seen = None;
            while let Ok(event) = rx.try_recv() {
                if let ChannelEvent::SetMotd(m) = event {
                    seen = Some(m.motd);
                }
            }
            assert_eq!(seen.as_deref(), Some(motd.as_str()), "iteration {i}");
            registry.leave(&room, viewer).await;
            assert!(registry.is_empty());
        }
    }

    #[tokio::test]
    async fn test_overlapping_saves_of_one_room() {
        let (registry, pool, dir) = setup().await;
        channels::register_channel(&pool, "lobby", "owner")
            .await
            .unwrap();
        let channel = registry.get_or_create("lobby");
        enter(&channel, "owner").await;

        let (a, b, c) = tokio::join!(channel.save_state(), channel.save_state(), registry.save_all());
        a.unwrap();
        b.unwrap();
        assert_eq!(c, 0);
        assert!(dir.path().join("lobby").exists());
        assert!(!dir.path().join(".lobby.tmp").exists());
    }

    fn make_public(channel: &Channel, admin: MemberId) {
        let opts = serde_json::json!({"show_public": true});
        channel.handle(
            admin,
            ChannelRequest::SetOptions(opts.as_object().cloned().unwrap()),
        );
    }

    #[tokio::test]
    async fn test_public_listing() {
        let (registry, pool, _dir) = setup().await;
        users::upsert_user(&pool, "alice", 3.0).await.unwrap();
        users::upsert_user(&pool, "carol", 3.0).await.unwrap();
        let busy = registry.get_or_create("busy");
        let alice = enter(&busy, "alice").await;
        enter(&busy, "bob").await;
        let quiet = registry.get_or_create("quiet");
        let carol = enter(&quiet, "carol").await;
        assert!(registry.public_listing().is_empty());

        make_public(&busy, alice);
        make_public(&quiet, carol);

        let listing = registry.public_listing();
        let names: Vec<&str> = listing.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["busy", "quiet"]);
        assert_eq!(listing[0].usercount, 2);
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_rooms() {
        let (registry, _pool, _dir) = setup().await;
        let channel = registry.get_or_create("lobby");
        enter(&channel, "alice").await;

        registry.shutdown().await;
        assert!(registry.is_empty());
        assert!(channel.is_dead());
        assert_eq!(channel.usercount(), 0);
    }
}
