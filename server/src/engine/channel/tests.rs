use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio::sync::mpsc::Receiver;

use super::*;
use crate::db::pool::{create_pool, run_migrations};
use crate::db::queries::{bans, channels, users};
use crate::db::sqlite::SqliteDatabase;
use crate::engine::error::{JoinError, LookupError};
use crate::engine::events::{InboundChatMeta, QueueRequest};
use crate::engine::media::Media;
use crate::engine::member::MpscRecipient;
use crate::engine::permissions::LEADER_RANK;
use crate::engine::services::{ChannelSettings, MetadataResolver};

// ── Helpers ──────────────────────────────────────────────────────

const RANK_FAIL: &str = "Updating user rank failed: You can't promote someone to equal or higher \
                         rank than yourself, or demote them below rank 1.";

/// Resolves every id to a one-minute video titled after the id.
struct StubResolver;

#[async_trait]
impl MetadataResolver for StubResolver {
    async fn resolve(&self, id: &str, media_type: &str) -> Result<Vec<Media>, LookupError> {
        match id {
            "missing" => Err(LookupError::NotFound),
            "long" => Ok(vec![Media::new(id, "Long video", 7200, media_type)]),
            _ => Ok(vec![Media::new(id, &format!("Video {id}"), 60, media_type)]),
        }
    }
}

struct Fixture {
    pool: SqlitePool,
    services: Services,
    _dir: TempDir,
}

async fn setup(registered_by: Option<&str>) -> Fixture {
    let pool = create_pool("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();
    if let Some(owner) = registered_by {
        channels::register_channel(&pool, "lobby", owner)
            .await
            .unwrap();
    }
    let dir = tempfile::tempdir().unwrap();
    let settings = ChannelSettings {
        dump_dir: dir.path().join("chandump"),
        log_dir: None,
        ..ChannelSettings::default()
    };
    let services = Services::new(
        Arc::new(SqliteDatabase::new(pool.clone())),
        Arc::new(StubResolver),
        settings,
    );
    Fixture {
        pool,
        services,
        _dir: dir,
    }
}

async fn open_room(fx: &Fixture) -> Arc<Channel> {
    let channel = Channel::new("lobby", fx.services.clone());
    channel.load_state().await;
    channel
}

async fn join(channel: &Channel, name: &str, ip: &str) -> (MemberId, Receiver<ChannelEvent>) {
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

fn chat(msg: &str) -> ChannelRequest {
    ChannelRequest::ChatMsg {
        msg: msg.to_string(),
        meta: InboundChatMeta::default(),
    }
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

// ── Join and part ────────────────────────────────────────────────

#[tokio::test]
async fn test_join_sends_room_state() {
    let fx = setup(None).await;
    let channel = open_room(&fx).await;
    let (_, mut rx) = join(&channel, "alice", "203.0.113.1").await;

    let events = drain_events(&mut rx);
    assert_eq!(events.first(), Some(&ChannelEvent::Rank(0.0)));
    assert!(events.contains(&ChannelEvent::ChannelNotRegistered));
    assert!(events.contains(&ChannelEvent::Usercount(1)));
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ChannelEvent::Userlist(list) if list.len() == 1))
    );
    assert!(events.iter().any(|e| matches!(e, ChannelEvent::SetMotd(_))));
}

#[tokio::test]
async fn test_anonymous_viewer_is_unlisted() {
    let fx = setup(None).await;
    let channel = open_room(&fx).await;
    let (_, mut alice_rx) = join(&channel, "alice", "203.0.113.1").await;
    drain_events(&mut alice_rx);

    let (anon, _anon_rx) = join(&channel, "", "203.0.113.2").await;
    let events = drain_events(&mut alice_rx);
    assert!(events.contains(&ChannelEvent::Usercount(2)));
    assert!(!events.iter().any(|e| matches!(e, ChannelEvent::AddUser(_))));

    channel.handle(anon, chat("hello"));
    let events = drain_events(&mut alice_rx);
    assert!(!events.iter().any(|e| matches!(e, ChannelEvent::ChatMsg(_))));
}

#[tokio::test]
async fn test_duplicate_login_replaces_old_connection() {
    let fx = setup(None).await;
    let channel = open_room(&fx).await;
    let (_, mut first_rx) = join(&channel, "alice", "203.0.113.1").await;
    let (_, _second_rx) = join(&channel, "Alice", "203.0.113.1").await;

    let kicked = wait_for(&mut first_rx, |e| matches!(e, ChannelEvent::Kick { .. })).await;
    assert_eq!(
        kicked,
        ChannelEvent::Kick {
            reason: "Duplicate login".to_string()
        }
    );
    assert_eq!(channel.usercount(), 1);
}

#[tokio::test]
async fn test_part_reports_empty_room() {
    let fx = setup(None).await;
    let channel = open_room(&fx).await;
    let (alice, _rx_a) = join(&channel, "alice", "203.0.113.1").await;
    let (bob, mut bob_rx) = join(&channel, "bob", "203.0.113.2").await;
    drain_events(&mut bob_rx);

    assert!(!channel.part(alice));
    let events = drain_events(&mut bob_rx);
    assert!(events.contains(&ChannelEvent::UserLeave {
        name: "alice".to_string()
    }));
    assert!(channel.part(bob));
    assert!(!channel.part(bob));
}

#[tokio::test]
async fn test_password_gate() {
    let fx = setup(None).await;
    let channel = open_room(&fx).await;
    channel.state.lock().opts.password = Some("hunter2".to_string());

    let (recipient, mut rx) = MpscRecipient::channel();
    let denied = channel
        .join(JoinRequest {
            name: "alice".to_string(),
            ip: "203.0.113.1".to_string(),
            password: None,
            recipient: Arc::new(recipient),
        })
        .await;
    assert_eq!(denied, Err(JoinError::PasswordRequired));
    assert_eq!(rx.try_recv().ok(), Some(ChannelEvent::NeedPassword(false)));
    assert_eq!(channel.usercount(), 0);

    let (recipient, mut rx) = MpscRecipient::channel();
    let admitted = channel
        .join(JoinRequest {
            name: "alice".to_string(),
            ip: "203.0.113.1".to_string(),
            password: Some("hunter2".to_string()),
            recipient: Arc::new(recipient),
        })
        .await;
    assert!(admitted.is_ok());
    assert_eq!(rx.try_recv().ok(), Some(ChannelEvent::CancelNeedPassword));
}

#[tokio::test]
async fn test_teardown_refuses_joins() {
    let fx = setup(None).await;
    let channel = open_room(&fx).await;
    channel.teardown();

    let (recipient, _rx) = MpscRecipient::channel();
    let result = channel
        .join(JoinRequest {
            name: "alice".to_string(),
            ip: "203.0.113.1".to_string(),
            password: None,
            recipient: Arc::new(recipient),
        })
        .await;
    assert_eq!(result, Err(JoinError::Dead));
}

// ── Playlist ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_first_queued_item_starts_playing() {
    let fx = setup(None).await;
    let channel = open_room(&fx).await;
    let (alice, mut rx) = join(&channel, "alice", "203.0.113.1").await;
    drain_events(&mut rx);

    channel.handle(alice, queue("abc"));
    let changed = wait_for(&mut rx, |e| matches!(e, ChannelEvent::ChangeMedia(_))).await;
    let ChannelEvent::ChangeMedia(update) = changed else {
        unreachable!()
    };
    assert_eq!(update.media.id, "abc");
    assert!(channel.summary().is_some_and(|s| s.mediatitle == "Video abc"));
}

#[tokio::test]
async fn test_duplicate_queue_fails() {
    let fx = setup(None).await;
    let channel = open_room(&fx).await;
    let (alice, mut rx) = join(&channel, "alice", "203.0.113.1").await;

    channel.handle(alice, queue("abc"));
    wait_for(&mut rx, |e| matches!(e, ChannelEvent::Queue { .. })).await;
    channel.handle(alice, queue("abc"));
    let failed = wait_for(&mut rx, |e| matches!(e, ChannelEvent::QueueFail { .. })).await;
    assert!(matches!(
        failed,
        ChannelEvent::QueueFail { ref msg, .. } if msg.contains("already on the playlist")
    ));
}

#[tokio::test]
async fn test_unresolvable_media_reports_failure() {
    let fx = setup(None).await;
    let channel = open_room(&fx).await;
    let (alice, mut rx) = join(&channel, "alice", "203.0.113.1").await;

    channel.handle(alice, queue("missing"));
    let failed = wait_for(&mut rx, |e| matches!(e, ChannelEvent::QueueFail { .. })).await;
    assert_eq!(
        failed,
        ChannelEvent::queue_fail("Media not found", Some("https://youtu.be/missing".to_string()))
    );
}

#[tokio::test]
async fn test_maxlength_applies_to_guests_only() {
    let fx = setup(Some("owner")).await;
    let channel = open_room(&fx).await;
    channel.state.lock().opts.maxlength = 600;
    channel.state.lock().playlist_locked = false;

    let (guest, mut guest_rx) = join(&channel, "guest", "203.0.113.2").await;
    channel.handle(guest, queue("long"));
    let failed = wait_for(&mut guest_rx, |e| matches!(e, ChannelEvent::QueueFail { .. })).await;
    assert!(matches!(
        failed,
        ChannelEvent::QueueFail { ref msg, .. } if msg.contains("Maximum length")
    ));

    let (owner, mut owner_rx) = join(&channel, "owner", "203.0.113.1").await;
    channel.handle(owner, queue("long"));
    wait_for(&mut owner_rx, |e| matches!(e, ChannelEvent::ChangeMedia(_))).await;
}

#[tokio::test]
async fn test_voteskip_advances_playlist() {
    let fx = setup(None).await;
    let channel = open_room(&fx).await;
    let (alice, mut rx) = join(&channel, "alice", "203.0.113.1").await;
    let (_bob, _bob_rx) = join(&channel, "bob", "203.0.113.2").await;

    channel.handle(alice, queue("first"));
    channel.handle(alice, queue("second"));
    wait_for(&mut rx, |e| matches!(e, ChannelEvent::Queue { item, .. } if item.media.id == "second"))
        .await;

    channel.handle(alice, ChannelRequest::Voteskip);
    let changed = wait_for(&mut rx, |e| matches!(e, ChannelEvent::ChangeMedia(_))).await;
    let ChannelEvent::ChangeMedia(update) = changed else {
        unreachable!()
    };
    assert_eq!(update.media.id, "second");
    assert!(channel.state.lock().voteskip.is_none());
}

/// Four eligible members, two queued videos and one skip vote: a vote short
/// of the default half.
async fn one_skip_vote_short(
    fx: &Fixture,
) -> (Arc<Channel>, Vec<MemberId>, Receiver<ChannelEvent>) {
    let channel = open_room(fx).await;
    let mut ids = Vec::new();
    let mut receivers = Vec::new();
    for (i, name) in ["alice", "bob", "carol", "dave"].iter().enumerate() {
        let (id, rx) = join(&channel, name, &format!("203.0.113.{}", i + 1)).await;
        ids.push(id);
        receivers.push(rx);
    }
    let mut rx = receivers.remove(0);

    channel.handle(ids[0], queue("first"));
    channel.handle(ids[0], queue("second"));
    wait_for(&mut rx, |e| matches!(e, ChannelEvent::Queue { item, .. } if item.media.id == "second"))
        .await;

    channel.handle(ids[0], ChannelRequest::Voteskip);
    {
        let st = channel.state.lock();
        assert_eq!(st.voteskip_packet().count, 1);
        assert_eq!(st.voteskip_packet().need, 2);
        assert_eq!(st.playlist.current().map(|it| it.media.id.as_str()), Some("first"));
    }
    drain_events(&mut rx);
    (channel, ids, rx)
}

#[tokio::test]
async fn test_voteskip_passes_when_non_voters_leave() {
    let fx = setup(None).await;
    let (channel, ids, mut rx) = one_skip_vote_short(&fx).await;

    channel.part(ids[2]);
    assert!(channel.state.lock().voteskip.is_some());
    channel.part(ids[3]);

    let changed = wait_for(&mut rx, |e| matches!(e, ChannelEvent::ChangeMedia(_))).await;
    let ChannelEvent::ChangeMedia(update) = changed else {
        unreachable!()
    };
    assert_eq!(update.media.id, "second");
    assert!(channel.state.lock().voteskip.is_none());
}

#[tokio::test]
async fn test_voteskip_passes_when_non_voters_go_afk() {
    let fx = setup(None).await;
    let (channel, ids, mut rx) = one_skip_vote_short(&fx).await;

    channel.handle(ids[2], chat("/afk"));
    assert!(channel.state.lock().voteskip.is_some());
    channel.handle(ids[3], chat("/afk"));

    let changed = wait_for(&mut rx, |e| matches!(e, ChannelEvent::ChangeMedia(_))).await;
    let ChannelEvent::ChangeMedia(update) = changed else {
        unreachable!()
    };
    assert_eq!(update.media.id, "second");
    assert_eq!(channel.usercount(), 4);
}

// ── Chat ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chat_is_broadcast_with_greentext() {
    let fx = setup(None).await;
    let channel = open_room(&fx).await;
    let (alice, _rx_a) = join(&channel, "alice", "203.0.113.1").await;
    let (_, mut bob_rx) = join(&channel, "bob", "203.0.113.2").await;
    drain_events(&mut bob_rx);

    channel.handle(alice, chat(">implying"));
    let events = drain_events(&mut bob_rx);
    let msg = events
        .iter()
        .find_map(|e| match e {
            ChannelEvent::ChatMsg(m) => Some(m),
            _ => None,
        })
        .expect("chat message delivered");
    assert_eq!(msg.username, "alice");
    assert_eq!(msg.meta.add_class.as_deref(), Some("greentext"));
    assert_eq!(channel.state.lock().history.len(), 1);
}

#[tokio::test]
async fn test_mute_command_blocks_chat() {
    let fx = setup(Some("owner")).await;
    let channel = open_room(&fx).await;
    let (owner, mut owner_rx) = join(&channel, "owner", "203.0.113.1").await;
    let (bob, mut bob_rx) = join(&channel, "bob", "203.0.113.2").await;

    channel.handle(owner, chat("/mute bob"));
    assert_eq!(channel.state.lock().mute_of("BOB"), Some(MuteKind::Muted));
    drain_events(&mut owner_rx);
    drain_events(&mut bob_rx);

    channel.handle(bob, chat("let me talk"));
    assert!(
        drain_events(&mut bob_rx).contains(&ChannelEvent::error("You have been muted on this channel."))
    );
    assert!(
        !drain_events(&mut owner_rx)
            .iter()
            .any(|e| matches!(e, ChannelEvent::ChatMsg(_)))
    );

    channel.handle(owner, chat("/unmute bob"));
    assert_eq!(channel.state.lock().mute_of("bob"), None);
}

#[tokio::test]
async fn test_shadow_mute_reaches_moderators_only() {
    let fx = setup(Some("owner")).await;
    let channel = open_room(&fx).await;
    let (owner, mut owner_rx) = join(&channel, "owner", "203.0.113.1").await;
    let (troll, mut troll_rx) = join(&channel, "troll", "203.0.113.2").await;
    let (_, mut carol_rx) = join(&channel, "carol", "203.0.113.3").await;

    channel.handle(owner, chat("/smute troll"));
    drain_events(&mut owner_rx);
    drain_events(&mut troll_rx);
    drain_events(&mut carol_rx);

    channel.handle(troll, chat("spam"));
    let is_chat = |e: &ChannelEvent| matches!(e, ChannelEvent::ChatMsg(_));
    assert!(drain_events(&mut owner_rx).iter().any(is_chat));
    assert!(drain_events(&mut troll_rx).iter().any(is_chat));
    assert!(!drain_events(&mut carol_rx).iter().any(is_chat));
}

#[tokio::test]
async fn test_pm_to_absent_member() {
    let fx = setup(None).await;
    let channel = open_room(&fx).await;
    let (alice, mut rx) = join(&channel, "alice", "203.0.113.1").await;
    drain_events(&mut rx);

    channel.handle(
        alice,
        ChannelRequest::Pm {
            to: "Ghost".to_string(),
            msg: "boo".to_string(),
            meta: InboundChatMeta::default(),
        },
    );
    assert_eq!(
        drain_events(&mut rx),
        vec![ChannelEvent::error("ghost is not on this channel.")]
    );
}

// ── Polls ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_poll_vote_updates_tally() {
    let fx = setup(None).await;
    let channel = open_room(&fx).await;
    let (alice, mut alice_rx) = join(&channel, "alice", "203.0.113.1").await;
    let (bob, _bob_rx) = join(&channel, "bob", "203.0.113.2").await;

    channel.handle(
        alice,
        ChannelRequest::NewPoll {
            title: "Next?".to_string(),
            opts: vec!["a".to_string(), "b".to_string()],
            obscured: false,
            timeout: None,
        },
    );
    drain_events(&mut alice_rx);

    channel.handle(bob, ChannelRequest::Vote { option: 1 });
    let update = wait_for(&mut alice_rx, |e| matches!(e, ChannelEvent::UpdatePoll(_))).await;
    let ChannelEvent::UpdatePoll(packet) = update else {
        unreachable!()
    };
    assert_eq!(packet.counts, vec![json!(0), json!(1)]);

    channel.handle(alice, ChannelRequest::ClosePoll);
    assert!(channel.state.lock().poll.is_none());
}

#[tokio::test]
async fn test_poll_timer_closes_poll() {
    let fx = setup(None).await;
    let channel = open_room(&fx).await;
    let (alice, mut rx) = join(&channel, "alice", "203.0.113.1").await;

    channel.handle(
        alice,
        ChannelRequest::NewPoll {
            title: "Quick".to_string(),
            opts: vec!["yes".to_string()],
            obscured: false,
            timeout: Some(1),
        },
    );
    wait_for(&mut rx, |e| matches!(e, ChannelEvent::ClosePoll)).await;
    assert!(channel.state.lock().poll.is_none());
}

// ── Moderation ───────────────────────────────────────────────────

#[tokio::test]
async fn test_non_admin_set_permissions_is_kicked() {
    let fx = setup(Some("owner")).await;
    let channel = open_room(&fx).await;
    let (bob, mut rx) = join(&channel, "bob", "203.0.113.2").await;

    let mut data = Map::new();
    data.insert("chat".to_string(), json!(3));
    channel.handle(bob, ChannelRequest::SetPermissions(data));
    let kicked = wait_for(&mut rx, |e| matches!(e, ChannelEvent::Kick { .. })).await;
    assert_eq!(
        kicked,
        ChannelEvent::Kick {
            reason: "Attempted setPermissions as a non-admin".to_string()
        }
    );
    assert_eq!(
        channel.state.lock().permissions.get(PermissionKey::Chat),
        Some(0.0)
    );
}

#[tokio::test]
async fn test_set_options_rejects_reserved_pagetitle() {
    let pool = create_pool("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();
    channels::register_channel(&pool, "lobby", "owner")
        .await
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let settings = ChannelSettings {
        dump_dir: dir.path().to_path_buf(),
        log_dir: None,
        reserved_pagetitles: Some(regex::Regex::new("(?i)^official").unwrap()),
        ..ChannelSettings::default()
    };
    let services = Services::new(
        Arc::new(SqliteDatabase::new(pool)),
        Arc::new(StubResolver),
        settings,
    );
    let channel = Channel::new("lobby", services);
    channel.load_state().await;
    let (owner, mut rx) = join(&channel, "owner", "203.0.113.1").await;
    drain_events(&mut rx);

    let mut data = Map::new();
    data.insert("pagetitle".to_string(), json!("Official Lobby"));
    data.insert("afk_timeout".to_string(), json!(300));
    channel.handle(owner, ChannelRequest::SetOptions(data));

    let events = drain_events(&mut rx);
    assert!(events.contains(&ChannelEvent::ErrorMsg {
        msg: "That pagetitle is reserved".to_string(),
        alert: true,
    }));
    let st = channel.state.lock();
    assert_eq!(st.opts.pagetitle, "lobby");
    assert_eq!(st.opts.afk_timeout, 300);
}

#[tokio::test]
async fn test_set_channel_rank_persists() {
    let fx = setup(Some("owner")).await;
    let channel = open_room(&fx).await;
    let (owner, mut owner_rx) = join(&channel, "owner", "203.0.113.1").await;
    let (_, mut bob_rx) = join(&channel, "bob", "203.0.113.2").await;

    channel.handle(
        owner,
        ChannelRequest::SetChannelRank {
            user: "bob".to_string(),
            rank: 2.0,
        },
    );
    wait_for(&mut owner_rx, |e| {
        matches!(e, ChannelEvent::SetUserRank { name, rank } if name == "bob" && *rank == 2.0)
    })
    .await;
    wait_for(&mut bob_rx, |e| *e == ChannelEvent::Rank(2.0)).await;
    assert_eq!(
        channels::get_rank(&fx.pool, "lobby", "bob").await.unwrap(),
        2.0
    );
}

#[tokio::test]
async fn test_set_channel_rank_refuses_equal_rank() {
    let fx = setup(Some("owner")).await;
    channels::set_rank(&fx.pool, "lobby", "mod", 2.0)
        .await
        .unwrap();
    let channel = open_room(&fx).await;
    let (moderator, mut rx) = join(&channel, "mod", "203.0.113.1").await;
    drain_events(&mut rx);

    channel.handle(
        moderator,
        ChannelRequest::SetChannelRank {
            user: "bob".to_string(),
            rank: 2.0,
        },
    );
    assert_eq!(
        drain_events(&mut rx),
        vec![ChannelEvent::ChannelRankFail {
            msg: RANK_FAIL.to_string()
        }]
    );
}

#[tokio::test]
async fn test_name_ban_kicks_and_blocks_rejoin() {
    let fx = setup(Some("owner")).await;
    let channel = open_room(&fx).await;
    let (owner, mut owner_rx) = join(&channel, "owner", "203.0.113.1").await;
    let (_, mut bob_rx) = join(&channel, "bob", "203.0.113.2").await;

    channel.handle(
        owner,
        ChannelRequest::BanName {
            name: "Bob".to_string(),
            reason: "spam".to_string(),
        },
    );
    let kicked = wait_for(&mut bob_rx, |e| matches!(e, ChannelEvent::Kick { .. })).await;
    assert_eq!(
        kicked,
        ChannelEvent::Kick {
            reason: "You're banned!".to_string()
        }
    );
    wait_for(&mut owner_rx, |e| matches!(e, ChannelEvent::Banlist(_))).await;
    assert!(bans::is_name_banned(&fx.pool, "lobby", "bob").await.unwrap());

    let (recipient, _rx) = MpscRecipient::channel();
    let rejoin = channel
        .join(JoinRequest {
            name: "bob".to_string(),
            ip: "203.0.113.9".to_string(),
            password: None,
            recipient: Arc::new(recipient),
        })
        .await;
    assert_eq!(rejoin, Err(JoinError::Banned));
}

#[tokio::test]
async fn test_cannot_ban_self_or_superior() {
    let fx = setup(Some("owner")).await;
    users::upsert_user(&fx.pool, "admin", 255.0).await.unwrap();
    channels::set_rank(&fx.pool, "lobby", "mod", 2.0)
        .await
        .unwrap();
    let channel = open_room(&fx).await;
    let (moderator, mut rx) = join(&channel, "mod", "203.0.113.1").await;
    drain_events(&mut rx);

    channel.handle(
        moderator,
        ChannelRequest::BanName {
            name: "MOD".to_string(),
            reason: String::new(),
        },
    );
    assert_eq!(
        drain_events(&mut rx),
        vec![ChannelEvent::Costanza {
            msg: "Trying to ban yourself?".to_string()
        }]
    );

    channel.handle(
        moderator,
        ChannelRequest::BanName {
            name: "admin".to_string(),
            reason: String::new(),
        },
    );
    let refused = wait_for(&mut rx, |e| matches!(e, ChannelEvent::ErrorMsg { .. })).await;
    assert_eq!(refused, ChannelEvent::error("You don't have permission to ban admin"));
}

#[tokio::test]
async fn test_ip_ban_and_unban() {
    let fx = setup(Some("owner")).await;
    let channel = open_room(&fx).await;
    let (owner, mut owner_rx) = join(&channel, "owner", "203.0.113.1").await;
    let (_, mut bob_rx) = join(&channel, "bob", "198.51.100.7").await;

    channel.handle(
        owner,
        ChannelRequest::BanAllIps {
            name: "bob".to_string(),
            reason: String::new(),
            range: false,
        },
    );
    wait_for(&mut bob_rx, |e| matches!(e, ChannelEvent::Kick { .. })).await;
    let listed = wait_for(&mut owner_rx, |e| matches!(e, ChannelEvent::Banlist(_))).await;
    let ChannelEvent::Banlist(list) = listed else {
        unreachable!()
    };
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].ip, "x.x.100.7");
    assert!(
        bans::is_ip_banned(&fx.pool, "lobby", "198.51.100.7")
            .await
            .unwrap()
    );

    channel.handle(
        owner,
        ChannelRequest::Unban {
            id: list[0].id,
            name: "bob".to_string(),
        },
    );
    wait_for(&mut owner_rx, |e| matches!(e, ChannelEvent::BanlistRemove { .. })).await;
    assert!(
        !bans::is_ip_banned(&fx.pool, "lobby", "198.51.100.7")
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_ban_requires_registration() {
    let fx = setup(None).await;
    let channel = open_room(&fx).await;
    channel
        .state
        .lock()
        .permissions
        .set(PermissionKey::Ban, 0.0);
    let (alice, mut rx) = join(&channel, "alice", "203.0.113.1").await;
    drain_events(&mut rx);

    channel.handle(
        alice,
        ChannelRequest::BanName {
            name: "bob".to_string(),
            reason: String::new(),
        },
    );
    assert_eq!(
        drain_events(&mut rx),
        vec![ChannelEvent::error(
            "Banning is only supported in registered channels"
        )]
    );
}

#[tokio::test]
async fn test_leader_departure_resumes_autolead() {
    let fx = setup(Some("owner")).await;
    let channel = open_room(&fx).await;
    let (owner, mut owner_rx) = join(&channel, "owner", "203.0.113.1").await;
    let (bob, _bob_rx) = join(&channel, "bob", "203.0.113.2").await;

    channel.handle(
        owner,
        ChannelRequest::AssignLeader {
            name: "bob".to_string(),
        },
    );
    assert_eq!(channel.state.lock().leader, Some(bob));
    assert_eq!(
        channel.state.lock().member(bob).map(|m| m.rank),
        Some(LEADER_RANK)
    );
    drain_events(&mut owner_rx);

    channel.part(bob);
    assert!(drain_events(&mut owner_rx).contains(&ChannelEvent::SetLeader(String::new())));
    assert_eq!(channel.state.lock().leader, None);
}

#[tokio::test]
async fn test_motd_is_sanitized() {
    let fx = setup(Some("owner")).await;
    let channel = open_room(&fx).await;
    let (owner, mut rx) = join(&channel, "owner", "203.0.113.1").await;
    drain_events(&mut rx);

    channel.handle(
        owner,
        ChannelRequest::SetMotd {
            motd: "Welcome<script>alert(1)</script>\nhave fun".to_string(),
        },
    );
    let st = channel.state.lock();
    assert!(!st.motd.motd.contains("<script>"));
    assert!(st.motd.html.contains("<br>"));
}

#[tokio::test]
async fn test_read_chan_log_needs_registration() {
    let fx = setup(None).await;
    let channel = open_room(&fx).await;
    users::upsert_user(&fx.pool, "root", 255.0).await.unwrap();
    let (root, mut rx) = join(&channel, "root", "203.0.113.1").await;
    drain_events(&mut rx);

    channel.handle(root, ChannelRequest::ReadChanLog);
    assert_eq!(
        drain_events(&mut rx),
        vec![ChannelEvent::ReadChanLog {
            success: false,
            data: "Channel log is only available to registered channels.".to_string(),
        }]
    );
}

// ── Persistence ──────────────────────────────────────────────────

#[tokio::test]
async fn test_state_survives_reload() {
    let fx = setup(Some("owner")).await;
    let channel = open_room(&fx).await;
    let (owner, mut rx) = join(&channel, "owner", "203.0.113.1").await;

    channel.handle(owner, queue("keep"));
    wait_for(&mut rx, |e| matches!(e, ChannelEvent::ChangeMedia(_))).await;
    channel.handle(
        owner,
        ChannelRequest::SetChannelCss {
            css: "body { color: red; }".to_string(),
        },
    );
    channel.save_state().await.unwrap();
    channel.teardown();

    let reopened = open_room(&fx).await;
    let st = reopened.state.lock();
    assert_eq!(st.css, "body { color: red; }");
    assert_eq!(st.playlist.len(), 1);
    assert_eq!(st.playlist.current().map(|it| it.media.id.as_str()), Some("keep"));
}

#[tokio::test]
async fn test_corrupt_snapshot_disables_saving() {
    let fx = setup(Some("owner")).await;
    let path = fx.services.snapshots.path_for("lobby");
    tokio::fs::create_dir_all(path.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&path, b"{ not json").await.unwrap();

    let channel = open_room(&fx).await;
    assert!(channel.is_ready());
    assert!(channel.has_error());
    channel.save_state().await.unwrap();
    assert_eq!(tokio::fs::read(&path).await.unwrap(), b"{ not json");
}

#[tokio::test]
async fn test_unregistered_room_is_open() {
    let fx = setup(None).await;
    let channel = open_room(&fx).await;
    let st = channel.state.lock();
    assert!(!st.registered);
    assert!(!st.playlist_locked);
    assert_eq!(st.permissions.get(PermissionKey::PlaylistAdd), Some(-1.0));
    let value: Value = serde_json::to_value(&st.opts).unwrap();
    assert_eq!(value["pagetitle"], "lobby");
}
