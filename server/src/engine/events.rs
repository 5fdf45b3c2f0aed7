use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::chat::{ChatMessage, PrivateMessage};
use super::emotes::Emote;
use super::filter::FilterSpec;
use super::media::{FullMediaUpdate, Media, TimeUpdate};
use super::member::{UserMetaView, UserView};
use super::options::ChannelOptions;
use super::permissions::{PermissionTable, Rank};
use super::persistence::Motd;
use super::playlist::{ItemId, PackedItem, PlaylistMeta};
use super::poll::{PollPacket, VoteskipPacket};
use super::services::{BanEntry, RankEntry};

/// Marker used where an item lands at the head of the playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadMarker {
    #[serde(rename = "prepend")]
    Prepend,
}

/// The item something was placed after: a uid, or `"prepend"` for the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum After {
    Item(ItemId),
    Head(HeadMarker),
}

impl After {
    pub fn from_option(after: Option<ItemId>) -> Self {
        match after {
            Some(uid) => After::Item(uid),
            None => After::Head(HeadMarker::Prepend),
        }
    }

    pub fn item(self) -> Option<ItemId> {
        match self {
            After::Item(uid) => Some(uid),
            After::Head(_) => None,
        }
    }
}

/// Everything a room sends to a member, framed as `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ChannelEvent {
    Rank(Rank),
    NeedPassword(bool),
    CancelNeedPassword,
    ChannelNotRegistered,

    // ── Playlist ────────────────────────────────────────────────────
    Playlist(Vec<PackedItem>),
    SetPlaylistMeta(PlaylistMeta),
    SetCurrent(ItemId),
    Queue {
        item: PackedItem,
        after: After,
    },
    Delete {
        uid: ItemId,
    },
    SetTemp {
        uid: ItemId,
        temp: bool,
    },
    MoveVideo {
        from: ItemId,
        after: After,
    },
    ChangeMedia(FullMediaUpdate),
    MediaUpdate(TimeUpdate),
    SetPlaylistLocked(bool),
    QueueFail {
        msg: String,
        link: Option<String>,
    },
    QueueWarn {
        msg: String,
        link: Option<String>,
    },
    SearchResults {
        results: Vec<Media>,
    },

    // ── Members ─────────────────────────────────────────────────────
    Userlist(Vec<UserView>),
    AddUser(UserView),
    UserLeave {
        name: String,
    },
    SetUserMeta {
        name: String,
        meta: UserMetaView,
    },
    SetUserRank {
        name: String,
        rank: Rank,
    },
    SetLeader(String),
    Usercount(usize),

    // ── Chat ────────────────────────────────────────────────────────
    ChatMsg(ChatMessage),
    Pm(PrivateMessage),
    ChatCooldown(u64),
    DrinkCount(i64),
    EmoteList(Vec<Emote>),
    UpdateEmote(Emote),
    RemoveEmote(Emote),
    ChatFilters(Vec<FilterSpec>),
    UpdateChatFilter(FilterSpec),
    DeleteChatFilter(FilterSpec),

    // ── Polls ───────────────────────────────────────────────────────
    NewPoll(PollPacket),
    UpdatePoll(PollPacket),
    ClosePoll,
    Voteskip(VoteskipPacket),

    // ── Room settings ───────────────────────────────────────────────
    SetPermissions(PermissionTable),
    ChannelOpts(ChannelOptions),
    #[serde(rename = "channelCSSJS")]
    ChannelCssJs {
        css: String,
        js: String,
    },
    SetMotd(Motd),

    // ── Moderation ──────────────────────────────────────────────────
    Banlist(Vec<BanEntry>),
    BanlistRemove {
        id: i64,
        name: String,
        actor: String,
    },
    ChannelRanks(Vec<RankEntry>),
    ReadChanLog {
        success: bool,
        data: String,
    },

    // ── Notices ─────────────────────────────────────────────────────
    ErrorMsg {
        msg: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        alert: bool,
    },
    Costanza {
        msg: String,
    },
    ChannelRankFail {
        msg: String,
    },
    Kick {
        reason: String,
    },
}

impl ChannelEvent {
    pub fn error(msg: impl Into<String>) -> Self {
        ChannelEvent::ErrorMsg {
            msg: msg.into(),
            alert: false,
        }
    }

    pub fn queue_fail(msg: impl Into<String>, link: Option<String>) -> Self {
        ChannelEvent::QueueFail {
            msg: msg.into(),
            link,
        }
    }
}

// ── Inbound ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InboundChatMeta {
    #[serde(default)]
    pub modflair: Option<f64>,
}

/// A `queue` request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub media_type: String,
    #[serde(default)]
    pub pos: Option<String>,
    #[serde(default)]
    pub temp: Option<bool>,
    /// Only kept for custom embeds.
    #[serde(default)]
    pub title: Option<String>,
    /// Declared length for live media.
    #[serde(default)]
    pub duration: Option<f64>,
}

/// Everything a member may send to a room. Frames that fail to decode are
/// dropped by the transport before they reach the room.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ChannelRequest {
    ChatMsg {
        msg: String,
        #[serde(default)]
        meta: InboundChatMeta,
    },
    Pm {
        to: String,
        msg: String,
        #[serde(default)]
        meta: InboundChatMeta,
    },
    ChannelPassword(String),

    // ── Playlist ────────────────────────────────────────────────────
    Queue(QueueRequest),
    QueuePlaylist {
        name: String,
        #[serde(default)]
        pos: Option<String>,
        #[serde(default)]
        temp: Option<bool>,
    },
    Delete(ItemId),
    MoveMedia {
        from: ItemId,
        after: After,
    },
    SetTemp {
        uid: ItemId,
        temp: bool,
    },
    PlayNext,
    JumpTo(ItemId),
    ClearPlaylist,
    ShufflePlaylist,
    MediaUpdate {
        id: String,
        #[serde(rename = "currentTime")]
        current_time: f64,
        #[serde(default)]
        paused: bool,
    },
    SetPlaylistLock(bool),
    TogglePlaylistLock,
    Uncache {
        id: String,
    },
    SearchMedia {
        query: String,
    },

    // ── Polls ───────────────────────────────────────────────────────
    NewPoll {
        title: String,
        opts: Vec<String>,
        #[serde(default)]
        obscured: bool,
        /// Seconds until the poll closes itself.
        #[serde(default)]
        timeout: Option<u64>,
    },
    ClosePoll,
    Vote {
        option: usize,
    },
    Voteskip,

    // ── Filters and emotes ──────────────────────────────────────────
    ImportFilters(Vec<Value>),
    UpdateFilter(Value),
    RemoveFilter {
        name: String,
    },
    MoveFilter {
        from: usize,
        to: usize,
    },
    ImportEmotes(Vec<Value>),
    UpdateEmote(Value),
    RemoveEmote {
        name: String,
    },

    // ── Room settings ───────────────────────────────────────────────
    SetPermissions(Map<String, Value>),
    SetOptions(Map<String, Value>),
    #[serde(rename = "setChannelCSS")]
    SetChannelCss {
        css: String,
    },
    #[serde(rename = "setChannelJS")]
    SetChannelJs {
        js: String,
    },
    SetMotd {
        motd: String,
    },

    // ── Moderation ──────────────────────────────────────────────────
    SetChannelRank {
        user: String,
        rank: Rank,
    },
    AssignLeader {
        name: String,
    },
    BanName {
        name: String,
        #[serde(default)]
        reason: String,
    },
    BanAllIps {
        name: String,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        range: bool,
    },
    Unban {
        id: i64,
        #[serde(default)]
        name: String,
    },
    ReadChanLog,
    RequestBanlist,
    RequestChannelRanks,
    RequestChatFilters,
}

impl ChannelRequest {
    /// Decode a text frame; `None` for anything malformed.
    pub fn decode(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}
