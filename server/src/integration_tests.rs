//! Integration tests for Marquee: cross-layer flows through the room
//! registry, the SQLite-backed database and the snapshot store.
//!
//! Each test creates its own in-memory SQLite database and temp directory so
//! tests are fully isolated.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use sqlx::SqlitePool;
    use tempfile::TempDir;
    use tokio::sync::Notify;
    use tokio::sync::mpsc::Receiver;

    use crate::db::pool::{create_pool, run_migrations};
    use crate::db::queries::{channels, users};
    use crate::db::sqlite::SqliteDatabase;
    use crate::engine::channel::{Channel, JoinRequest};
    use crate::engine::error::LookupError;
    use crate::engine::events::{
        After, ChannelEvent, ChannelRequest, InboundChatMeta, QueueRequest,
    };
    use crate::engine::filter::{FilterList, FilterSpec};
    use crate::engine::media::Media;
    use crate::engine::member::{MemberId, MpscRecipient};
    use crate::engine::playlist::PlaylistMeta;
    use crate::engine::registry::RoomRegistry;
    use crate::engine::services::{ChannelSettings, MetadataResolver, Services};

    // ── Helpers ──────────────────────────────────────────────────

    /// `abc` is two minutes long; `slow` waits for the test to open the gate.
    struct GatedResolver {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl MetadataResolver for GatedResolver {
        async fn resolve(&self, id: &str, media_type: &str) -> Result<Vec<Media>, LookupError> {
            match id {
                "abc" => Ok(vec![Media::new(id, "ABC", 120, media_type)]),
                "slow" => {
                    self.gate.notified().await;
                    Ok(vec![Media::new(id, "Slow", 60, media_type)])
                }
                _ => Ok(vec![Media::new(id, id, 60, media_type)]),
            }
        }
    }

    /// Create an in-memory SQLite pool with all migrations applied.
    async fn setup_db() -> SqlitePool {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    /// Create a registry backed by a fresh database and snapshot directory.
    async fn setup_registry() -> (Arc<RoomRegistry>, SqlitePool, Arc<Notify>, TempDir) {
        let pool = setup_db().await;
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let settings = ChannelSettings {
            dump_dir: dir.path().join("chandump"),
            log_dir: None,
            ..ChannelSettings::default()
        };
        let services = Services::new(
            Arc::new(SqliteDatabase::new(pool.clone())),
            Arc::new(GatedResolver { gate: gate.clone() }),
            settings,
        );
        (Arc::new(RoomRegistry::new(services)), pool, gate, dir)
    }

    /// Join a member and return (member_id, receiver).
    async fn connect(channel: &Channel, name: &str, ip: &str) -> (MemberId, Receiver<ChannelEvent>) {
        let (recipient, rx) = MpscRecipient::channel();
        let id = channel
            .join(JoinRequest {
                name: name.to_string(),
                ip: ip.to_string(),
                password: None,
                recipient: Arc::new(recipient),
            })
            .await
            .unwrap();
        (id, rx)
    }

    /// Drain all pending events from a receiver.
    fn drain_events(rx: &mut Receiver<ChannelEvent>) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    async fn wait_for(
        rx: &mut Receiver<ChannelEvent>,
        pred: impl Fn(&ChannelEvent) -> bool,
    ) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(ev) if pred(&ev) => return ev,
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn queue(id: &str) -> ChannelRequest {
        ChannelRequest::Queue(QueueRequest {
            id: id.to_string(),
            media_type: "yt".to_string(),
            pos: None,
            temp: None,
            title: None,
            duration: None,
        })
    }

    fn queued(id: &'static str) -> impl Fn(&ChannelEvent) -> bool {
        move |e| matches!(e, ChannelEvent::Queue { item, .. } if item.media.id == id)
    }

    // ── Playlist ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_site_admin_queues_into_empty_room() {
        let (registry, pool, _gate, _dir) = setup_registry().await;
        users::upsert_user(&pool, "admin", 5.0).await.unwrap();
        let channel = registry.get_or_create("lobby");
        let (admin, mut rx) = connect(&channel, "admin", "203.0.113.1").await;
        assert!(drain_events(&mut rx).contains(&ChannelEvent::Rank(5.0)));

        channel.handle(admin, queue("abc"));
        let added = wait_for(&mut rx, queued("abc")).await;
        let ChannelEvent::Queue { item, .. } = added else {
            unreachable!()
        };
        assert_eq!(item.uid, 0);
        assert_eq!(item.queueby, "admin");

        let meta = wait_for(&mut rx, |e| matches!(e, ChannelEvent::SetPlaylistMeta(_))).await;
        assert_eq!(
            meta,
            ChannelEvent::SetPlaylistMeta(PlaylistMeta {
                count: 1,
                time: "00:02:00".to_string()
            })
        );

        channel.handle(admin, queue("second"));
        let ChannelEvent::Queue { item, .. } = wait_for(&mut rx, queued("second")).await else {
            unreachable!()
        };
        assert_eq!(item.uid, 1);
    }

    #[tokio::test]
    async fn test_mutations_apply_in_receipt_order() {
        let (registry, _pool, gate, _dir) = setup_registry().await;
        let channel = registry.get_or_create("lobby");
        let (alice, mut rx) = connect(&channel, "alice", "203.0.113.1").await;
        let (bob, _bob_rx) = connect(&channel, "bob", "203.0.113.2").await;
        let (carol, _carol_rx) = connect(&channel, "carol", "203.0.113.3").await;

        channel.handle(alice, queue("x"));
        wait_for(&mut rx, queued("x")).await;
        channel.handle(alice, queue("y"));
        wait_for(&mut rx, queued("y")).await;
        drain_events(&mut rx);

        // The add holds the queue while its lookup is parked on the gate
        channel.handle(alice, queue("slow"));
        channel.handle(bob, ChannelRequest::Delete(0));
        channel.handle(
            carol,
            ChannelRequest::MoveMedia {
                from: 1,
                after: After::Item(2),
            },
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            !drain_events(&mut rx)
                .iter()
                .any(|e| matches!(e, ChannelEvent::Delete { .. } | ChannelEvent::MoveVideo { .. }))
        );

        gate.notify_one();
        let mut order = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while order.len() < 3 {
                match rx.recv().await {
                    Some(ChannelEvent::Queue { item, .. }) => order.push(format!("queue {}", item.uid)),
                    Some(ChannelEvent::Delete { uid }) => order.push(format!("delete {uid}")),
                    Some(ChannelEvent::MoveVideo { from, after }) => {
                        assert_eq!(after, After::Item(2));
                        order.push(format!("move {from}"));
                    }
                    Some(_) => {}
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for playlist mutations");
        assert_eq!(order, vec!["queue 2", "delete 0", "move 1"]);
    }

    // ── Voteskip ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_voteskip_passes_at_half_of_four() {
        let (registry, pool, _gate, _dir) = setup_registry().await;
        channels::register_channel(&pool, "lobby", "owner")
            .await
            .unwrap();
        let channel = registry.get_or_create("lobby");
        let (owner, mut rx) = connect(&channel, "owner", "203.0.113.1").await;
        let (alice, _a) = connect(&channel, "alice", "203.0.113.2").await;
        let (bob, _b) = connect(&channel, "bob", "203.0.113.3").await;
        let (_carol, _c) = connect(&channel, "carol", "203.0.113.4").await;

        channel.handle(owner, queue("first"));
        channel.handle(owner, queue("second"));
        wait_for(&mut rx, queued("second")).await;
        drain_events(&mut rx);

        channel.handle(alice, ChannelRequest::Voteskip);
        let events = drain_events(&mut rx);
        assert!(!events.iter().any(|e| matches!(e, ChannelEvent::ChangeMedia(_))));
        assert!(events.iter().any(
            |e| matches!(e, ChannelEvent::Voteskip(p) if p.count == 1 && p.need == 2)
        ));

        channel.handle(bob, ChannelRequest::Voteskip);
        let events = drain_events(&mut rx);
        assert!(events.iter().any(
            |e| matches!(e, ChannelEvent::ChangeMedia(update) if update.media.id == "second")
        ));
        // The finished vote is discarded rather than carried to the next item
        assert!(matches!(
            events.last(),
            Some(ChannelEvent::Voteskip(p)) if p.count == 0
        ));
    }

    // ── Persistence ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_oversized_snapshot_blocks_load_and_save() {
        let (registry, pool, _gate, _dir) = setup_registry().await;
        channels::register_channel(&pool, "lobby", "owner")
            .await
            .unwrap();
        let path = registry.services().snapshots.path_for("lobby");
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        let oversized = vec![b' '; 2 * 1024 * 1024];
        tokio::fs::write(&path, &oversized).await.unwrap();

        let channel = registry.get_or_create("lobby");
        let (owner, mut rx) = connect(&channel, "owner", "203.0.113.1").await;
        assert!(channel.has_error());
        assert!(drain_events(&mut rx).iter().any(|e| matches!(
            e,
            ChannelEvent::SetMotd(m) if m.motd.contains("exceeded the maximum size")
        )));

        registry.leave(&channel, owner).await;
        assert!(registry.is_empty());
        let on_disk = tokio::fs::read(&path).await.unwrap();
        assert_eq!(on_disk.len(), oversized.len());
    }

    #[tokio::test]
    async fn test_registered_room_survives_unload() {
        let (registry, pool, _gate, _dir) = setup_registry().await;
        channels::register_channel(&pool, "lobby", "owner")
            .await
            .unwrap();
        let channel = registry.get_or_create("lobby");
        let (owner, mut rx) = connect(&channel, "owner", "203.0.113.1").await;
        channel.handle(owner, queue("abc"));
        wait_for(&mut rx, queued("abc")).await;
        channel.handle(
            owner,
            ChannelRequest::SetMotd {
                motd: "welcome".to_string(),
            },
        );
        registry.leave(&channel, owner).await;
        assert!(channel.is_dead());

        let reloaded = registry.get_or_create("lobby");
        let (_, mut rx) = connect(&reloaded, "owner", "203.0.113.1").await;
        let events = drain_events(&mut rx);
        assert!(events.iter().any(
            |e| matches!(e, ChannelEvent::SetMotd(m) if m.motd == "welcome")
        ));
        assert!(events.iter().any(
            |e| matches!(e, ChannelEvent::Playlist(items) if items.len() == 1 && items[0].media.id == "abc")
        ));
    }

    // ── Chat filters ─────────────────────────────────────────────

    #[test]
    fn test_plain_filter_skips_autolinked_url() {
        let list = FilterList::from_specs(vec![FilterSpec {
            name: "a to b".to_string(),
            source: "a".to_string(),
            flags: "g".to_string(),
            replace: "b".to_string(),
            active: true,
            filterlinks: false,
        }]);
        assert_eq!(
            list.filter_message("aaa http://x.test aaa", true),
            r#"bbb <a href="http://x.test" target="_blank">http://x.test</a> bbb"#
        );
    }

    #[tokio::test]
    async fn test_room_filter_applies_to_chat() {
        let (registry, pool, _gate, _dir) = setup_registry().await;
        channels::register_channel(&pool, "lobby", "owner")
            .await
            .unwrap();
        let channel = registry.get_or_create("lobby");
        let (owner, _owner_rx) = connect(&channel, "owner", "203.0.113.1").await;
        let (_, mut bob_rx) = connect(&channel, "bob", "203.0.113.2").await;

        channel.handle(
            owner,
            ChannelRequest::UpdateFilter(json!({
                "name": "a to b",
                "source": "a",
                "flags": "g",
                "replace": "b",
                "active": true,
                "filterlinks": false
            })),
        );
        drain_events(&mut bob_rx);

        channel.handle(
            owner,
            ChannelRequest::ChatMsg {
                msg: "aaa http://x.test aaa".to_string(),
                meta: InboundChatMeta::default(),
            },
        );
        let msg = wait_for(&mut bob_rx, |e| matches!(e, ChannelEvent::ChatMsg(_))).await;
        let ChannelEvent::ChatMsg(msg) = msg else {
            unreachable!()
        };
        assert_eq!(
            msg.msg,
            r#"bbb <a href="http://x.test" target="_blank">http://x.test</a> bbb"#
        );
    }

    // ── Registry ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_listing_shows_rooms_admins_made_public() {
        let (registry, pool, _gate, _dir) = setup_registry().await;
        users::upsert_user(&pool, "alice", 3.0).await.unwrap();
        let open = registry.get_or_create("open");
        let (alice, _a) = connect(&open, "alice", "203.0.113.1").await;
        let quiet = registry.get_or_create("quiet");
        let (_bob, _b) = connect(&quiet, "bob", "203.0.113.2").await;
        assert!(registry.public_listing().is_empty());

        let opts = json!({"show_public": true});
        open.handle(
            alice,
            ChannelRequest::SetOptions(opts.as_object().cloned().unwrap()),
        );
        let names: Vec<String> = registry
            .public_listing()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["open".to_string()]);

        registry.leave(&open, alice).await;
        assert!(registry.get("open").is_none());
        assert!(registry.get("quiet").is_some());
    }

}
