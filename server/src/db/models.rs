use serde::{Deserialize, Serialize};

/// A registered account.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserRow {
    pub name: String,
    pub global_rank: f64,
    pub created_at: String,
}

/// A registered room.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChannelRow {
    pub name: String,
    pub owner: String,
    pub created_at: String,
}

/// A per-room rank grant.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChannelRankRow {
    pub channel: String,
    pub name: String,
    pub rank: f64,
}

/// A ban entry. `ip` is `*` for name-only bans.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BanRow {
    pub id: i64,
    pub channel: String,
    pub ip: String,
    pub name: String,
    pub reason: String,
    pub bannedby: String,
    pub created_at: String,
}

/// A cached media descriptor. `meta` is the JSON-encoded media meta.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LibraryRow {
    pub channel: String,
    pub id: String,
    pub media_type: String,
    pub title: String,
    pub seconds: i64,
    pub meta: String,
}

/// A saved personal playlist. `contents` is a JSON array of media.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserPlaylistRow {
    pub owner: String,
    pub name: String,
    pub contents: String,
    pub count: i64,
    pub duration: i64,
    pub updated_at: String,
}
