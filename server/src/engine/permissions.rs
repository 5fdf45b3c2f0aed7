use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Numeric privilege level. Fractional tiers exist (1.5 is the temporary
/// leader tier), so ranks are compared as floats.
pub type Rank = f64;

/// Rank at which a member sees the moderator projection of the user list.
pub const MODERATOR_RANK: Rank = 2.0;
/// Room administrator (owner-level settings).
pub const ADMIN_RANK: Rank = 3.0;
/// Room founder.
pub const FOUNDER_RANK: Rank = 4.0;
/// Site-wide administrator.
pub const SITE_ADMIN_RANK: Rank = 255.0;
/// Temporary rank granted to a leader who is below it.
pub const LEADER_RANK: Rank = 1.5;

/// Every permission node a room can configure. The set is fixed: unknown keys
/// coming from clients or old snapshots are dropped, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionKey {
    SeePlaylist,
    PlaylistAdd,
    PlaylistNext,
    PlaylistMove,
    PlaylistDelete,
    PlaylistJump,
    PlaylistAddList,
    OPlaylistAdd,
    OPlaylistNext,
    OPlaylistMove,
    OPlaylistDelete,
    OPlaylistJump,
    OPlaylistAddList,
    PlaylistAddCustom,
    PlaylistAddLive,
    ExceedMaxLength,
    AddNonTemp,
    SetTemp,
    PlaylistShuffle,
    PlaylistClear,
    PollCtl,
    PollVote,
    ViewHiddenPoll,
    Voteskip,
    Mute,
    Kick,
    Ban,
    MotdEdit,
    FilterEdit,
    FilterImport,
    EmoteEdit,
    EmoteImport,
    PlaylistLock,
    LeaderCtl,
    Drink,
    Chat,
}

impl PermissionKey {
    pub const ALL: [PermissionKey; 36] = [
        Self::SeePlaylist,
        Self::PlaylistAdd,
        Self::PlaylistNext,
        Self::PlaylistMove,
        Self::PlaylistDelete,
        Self::PlaylistJump,
        Self::PlaylistAddList,
        Self::OPlaylistAdd,
        Self::OPlaylistNext,
        Self::OPlaylistMove,
        Self::OPlaylistDelete,
        Self::OPlaylistJump,
        Self::OPlaylistAddList,
        Self::PlaylistAddCustom,
        Self::PlaylistAddLive,
        Self::ExceedMaxLength,
        Self::AddNonTemp,
        Self::SetTemp,
        Self::PlaylistShuffle,
        Self::PlaylistClear,
        Self::PollCtl,
        Self::PollVote,
        Self::ViewHiddenPoll,
        Self::Voteskip,
        Self::Mute,
        Self::Kick,
        Self::Ban,
        Self::MotdEdit,
        Self::FilterEdit,
        Self::FilterImport,
        Self::EmoteEdit,
        Self::EmoteImport,
        Self::PlaylistLock,
        Self::LeaderCtl,
        Self::Drink,
        Self::Chat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SeePlaylist => "seeplaylist",
            Self::PlaylistAdd => "playlistadd",
            Self::PlaylistNext => "playlistnext",
            Self::PlaylistMove => "playlistmove",
            Self::PlaylistDelete => "playlistdelete",
            Self::PlaylistJump => "playlistjump",
            Self::PlaylistAddList => "playlistaddlist",
            Self::OPlaylistAdd => "oplaylistadd",
            Self::OPlaylistNext => "oplaylistnext",
            Self::OPlaylistMove => "oplaylistmove",
            Self::OPlaylistDelete => "oplaylistdelete",
            Self::OPlaylistJump => "oplaylistjump",
            Self::OPlaylistAddList => "oplaylistaddlist",
            Self::PlaylistAddCustom => "playlistaddcustom",
            Self::PlaylistAddLive => "playlistaddlive",
            Self::ExceedMaxLength => "exceedmaxlength",
            Self::AddNonTemp => "addnontemp",
            Self::SetTemp => "settemp",
            Self::PlaylistShuffle => "playlistshuffle",
            Self::PlaylistClear => "playlistclear",
            Self::PollCtl => "pollctl",
            Self::PollVote => "pollvote",
            Self::ViewHiddenPoll => "viewhiddenpoll",
            Self::Voteskip => "voteskip",
            Self::Mute => "mute",
            Self::Kick => "kick",
            Self::Ban => "ban",
            Self::MotdEdit => "motdedit",
            Self::FilterEdit => "filteredit",
            Self::FilterImport => "filterimport",
            Self::EmoteEdit => "emoteedit",
            Self::EmoteImport => "emoteimport",
            Self::PlaylistLock => "playlistlock",
            Self::LeaderCtl => "leaderctl",
            Self::Drink => "drink",
            Self::Chat => "chat",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// The looser threshold consulted while the playlist is unlocked.
    pub fn open_variant(&self) -> Option<Self> {
        match self {
            Self::PlaylistAdd => Some(Self::OPlaylistAdd),
            Self::PlaylistNext => Some(Self::OPlaylistNext),
            Self::PlaylistMove => Some(Self::OPlaylistMove),
            Self::PlaylistDelete => Some(Self::OPlaylistDelete),
            Self::PlaylistJump => Some(Self::OPlaylistJump),
            Self::PlaylistAddList => Some(Self::OPlaylistAddList),
            _ => None,
        }
    }
}

/// Minimum rank per permission node.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PermissionTable(BTreeMap<PermissionKey, Rank>);

impl Default for PermissionTable {
    fn default() -> Self {
        use PermissionKey::*;
        Self(BTreeMap::from([
            (SeePlaylist, -1.0),
            (PlaylistAdd, 1.5),
            (PlaylistNext, 1.5),
            (PlaylistMove, 1.5),
            (PlaylistDelete, 2.0),
            (PlaylistJump, 1.5),
            (PlaylistAddList, 1.5),
            (OPlaylistAdd, -1.0),
            (OPlaylistNext, 1.5),
            (OPlaylistMove, 1.5),
            (OPlaylistDelete, 2.0),
            (OPlaylistJump, 1.5),
            (OPlaylistAddList, 1.5),
            (PlaylistAddCustom, 3.0),
            (PlaylistAddLive, 1.5),
            (ExceedMaxLength, 2.0),
            (AddNonTemp, 2.0),
            (SetTemp, 2.0),
            (PlaylistShuffle, 2.0),
            (PlaylistClear, 2.0),
            (PollCtl, 1.5),
            (PollVote, -1.0),
            (ViewHiddenPoll, 1.5),
            (Voteskip, -1.0),
            (Mute, 1.5),
            (Kick, 1.5),
            (Ban, 2.0),
            (MotdEdit, 3.0),
            (FilterEdit, 3.0),
            (FilterImport, 3.0),
            (EmoteEdit, 3.0),
            (EmoteImport, 3.0),
            (PlaylistLock, 2.0),
            (LeaderCtl, 2.0),
            (Drink, 1.5),
            (Chat, 0.0),
        ]))
    }
}

impl PermissionTable {
    /// Threshold for a node, if configured.
    pub fn get(&self, key: PermissionKey) -> Option<Rank> {
        self.0.get(&key).copied()
    }

    pub fn set(&mut self, key: PermissionKey, rank: Rank) {
        self.0.insert(key, rank);
    }

    /// Overlay the recognised, numeric entries of a loosely-typed object.
    /// Returns how many entries were rejected for an unknown key or a
    /// non-numeric rank.
    pub fn merge_from(&mut self, value: &Value) -> usize {
        let Some(map) = value.as_object() else {
            return 0;
        };
        let mut rejected = 0;
        for (name, v) in map {
            match (PermissionKey::parse(name), v.as_f64()) {
                (Some(key), Some(rank)) => {
                    self.0.insert(key, rank);
                }
                _ => rejected += 1,
            }
        }
        rejected
    }

    /// Looser preset used by rooms that are not registered to anyone.
    pub fn apply_unregistered_preset(&mut self) {
        use PermissionKey::*;
        let preset: [(PermissionKey, Rank); 28] = [
            (SeePlaylist, -1.0),
            (PlaylistAdd, -1.0),
            (PlaylistNext, 0.0),
            (PlaylistMove, 0.0),
            (PlaylistDelete, 0.0),
            (PlaylistJump, 0.0),
            (PlaylistAddList, 0.0),
            (OPlaylistAdd, -1.0),
            (OPlaylistNext, 0.0),
            (OPlaylistMove, 0.0),
            (OPlaylistDelete, 0.0),
            (OPlaylistJump, 0.0),
            (OPlaylistAddList, 0.0),
            (PlaylistAddCustom, 0.0),
            (PlaylistAddLive, 0.0),
            (ExceedMaxLength, 0.0),
            (AddNonTemp, 0.0),
            (SetTemp, 0.0),
            (PlaylistShuffle, 0.0),
            (PlaylistClear, 0.0),
            (PollCtl, 0.0),
            (PollVote, -1.0),
            (ViewHiddenPoll, 1.5),
            (Voteskip, -1.0),
            (PlaylistLock, 2.0),
            (LeaderCtl, 0.0),
            (Drink, 0.0),
            (Chat, 0.0),
        ];
        for (key, rank) in preset {
            self.0.insert(key, rank);
        }
    }
}

/// Decide whether `rank` may use `key`.
///
/// While the playlist is unlocked, playlist nodes also accept the "open"
/// threshold (`o` + key); either threshold grants access. Nodes missing from
/// the table always deny.
pub fn has_permission(
    rank: Rank,
    key: PermissionKey,
    table: &PermissionTable,
    playlist_locked: bool,
) -> bool {
    if !playlist_locked
        && let Some(open) = key.open_variant()
        && let Some(threshold) = table.get(open)
        && rank >= threshold
    {
        return true;
    }

    match table.get(key) {
        Some(threshold) => rank >= threshold,
        None => false,
    }
}
