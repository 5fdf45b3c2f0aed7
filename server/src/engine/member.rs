use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events::ChannelEvent;
use super::permissions::{MODERATOR_RANK, Rank, SITE_ADMIN_RANK};
use super::rate_limiter::TokenBucket;

/// Maximum queued outbound events per member (prevents memory exhaustion from slow clients).
pub const MAX_OUTBOUND_QUEUE: usize = 1024;

/// Unique identifier for one connection to a room.
pub type MemberId = Uuid;

/// Where a room delivers events for one member.
pub trait Recipient: Send + Sync {
    /// Queue an event. Returns false if the member is gone or too far behind.
    fn send(&self, event: ChannelEvent) -> bool;
    /// Tell the member why, then disconnect them.
    fn kick(&self, reason: &str);
}

/// [`Recipient`] feeding a bounded channel drained by the connection's
/// write loop. Kicking cancels the connection.
#[derive(Debug, Clone)]
pub struct MpscRecipient {
    outbound: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
}

impl MpscRecipient {
    pub fn new(outbound: mpsc::Sender<ChannelEvent>, cancel: CancellationToken) -> Self {
        Self { outbound, cancel }
    }

    /// A recipient plus the receiving end of its queue.
    pub fn channel() -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (tx, rx) = mpsc::channel(MAX_OUTBOUND_QUEUE);
        (Self::new(tx, CancellationToken::new()), rx)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Recipient for MpscRecipient {
    fn send(&self, event: ChannelEvent) -> bool {
        // Drop rather than block when the client falls behind
        !self.cancel.is_cancelled() && self.outbound.try_send(event).is_ok()
    }

    fn kick(&self, reason: &str) {
        let _ = self.outbound.try_send(ChannelEvent::Kick {
            reason: reason.to_string(),
        });
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub image: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemberMeta {
    pub afk: bool,
    pub muted: bool,
    pub smuted: bool,
    pub aliases: Vec<String>,
}

/// A connected viewer.
pub struct Member {
    pub id: MemberId,
    /// Empty for anonymous viewers, who never appear in the user list.
    pub name: String,
    pub ip: String,
    pub global_rank: Rank,
    pub rank: Rank,
    /// Rank to restore when a temporary leader promotion ends.
    pub old_rank: Option<Rank>,
    pub meta: MemberMeta,
    pub profile: Profile,
    pub chat_limiter: TokenBucket,
    pub queue_limiter: TokenBucket,
    pub last_active: Instant,
    recipient: Arc<dyn Recipient>,
}

impl Member {
    pub fn new(name: &str, ip: &str, global_rank: Rank, recipient: Arc<dyn Recipient>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            ip: ip.to_string(),
            global_rank,
            rank: global_rank,
            old_rank: None,
            meta: MemberMeta::default(),
            profile: Profile::default(),
            chat_limiter: TokenBucket::new(),
            queue_limiter: TokenBucket::new(),
            last_active: Instant::now(),
            recipient,
        }
    }

    pub fn is_named(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn send(&self, event: ChannelEvent) -> bool {
        self.recipient.send(event)
    }

    pub fn kick(&self, reason: &str) {
        self.recipient.kick(reason);
    }

    /// Which view of other members this member is entitled to.
    pub fn view_tier(&self) -> ViewTier {
        ViewTier::for_ranks(self.global_rank, self.rank)
    }

    pub fn view(&self, tier: ViewTier) -> UserView {
        UserView {
            name: self.name.clone(),
            rank: self.rank,
            profile: self.profile.clone(),
            meta: self.meta_view(tier),
        }
    }

    pub fn meta_view(&self, tier: ViewTier) -> UserMetaView {
        match tier {
            ViewTier::Ordinary => UserMetaView {
                afk: self.meta.afk,
                muted: self.meta.muted && !self.meta.smuted,
                smuted: None,
                aliases: None,
                ip: None,
            },
            ViewTier::Moderator | ViewTier::Admin => UserMetaView {
                afk: self.meta.afk,
                muted: self.meta.muted,
                smuted: Some(self.meta.smuted),
                aliases: Some(self.meta.aliases.clone()),
                ip: Some(if tier == ViewTier::Admin {
                    self.ip.clone()
                } else {
                    mask_ip(&self.ip)
                }),
            },
        }
    }
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("rank", &self.rank)
            .finish_non_exhaustive()
    }
}

// ── Views ───────────────────────────────────────────────────────────

/// How much of another member's presence a recipient may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewTier {
    Ordinary,
    Moderator,
    Admin,
}

impl ViewTier {
    pub fn for_ranks(global_rank: Rank, rank: Rank) -> Self {
        if global_rank >= SITE_ADMIN_RANK {
            ViewTier::Admin
        } else if rank >= MODERATOR_RANK {
            ViewTier::Moderator
        } else {
            ViewTier::Ordinary
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserMetaView {
    pub afk: bool,
    pub muted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smuted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserView {
    pub name: String,
    pub rank: Rank,
    pub profile: Profile,
    pub meta: UserMetaView,
}

// ── Addresses ───────────────────────────────────────────────────────

/// Canonical form used for ban matching: IPv4 dotted quads, IPv6 fully
/// expanded without zero compression. IPv4-mapped IPv6 becomes IPv4.
pub fn normalize_ip(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.to_string(),
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6
                .segments()
                .iter()
                .map(|s| format!("{s:x}"))
                .collect::<Vec<_>>()
                .join(":"),
        },
        Err(_) => ip.to_string(),
    }
}

/// Hide the leading part of an address: `x.x.c.d`, or `x:x:x:x:` plus the
/// last four IPv6 groups. Range prefixes are masked the same way.
pub fn mask_ip(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let o = v4.octets();
            format!("x.x.{}.{}", o[2], o[3])
        }
        Ok(IpAddr::V6(v6)) => {
            let s = v6.segments();
            format!("x:x:x:x:{:x}:{:x}:{:x}:{:x}", s[4], s[5], s[6], s[7])
        }
        Err(_) if ip.contains('.') => ip
            .split('.')
            .enumerate()
            .map(|(i, part)| if i < 2 { "x" } else { part })
            .collect::<Vec<_>>()
            .join("."),
        Err(_) => ip.split(':').map(|_| "x").collect::<Vec<_>>().join(":"),
    }
}

/// The range prefix a range ban stores: the first three IPv4 octets or the
/// first four IPv6 groups.
pub fn range_prefix(ip: &str) -> String {
    let normalized = normalize_ip(ip);
    if normalized.contains(':') {
        normalized.split(':').take(4).collect::<Vec<_>>().join(":")
    } else {
        normalized.split('.').take(3).collect::<Vec<_>>().join(".")
    }
}
