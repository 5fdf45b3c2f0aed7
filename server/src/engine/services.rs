use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::chat::{BuiltinCommands, CommandInterpreter, MAX_CHAT_LENGTH};
use super::error::LookupError;
use super::media::Media;
use super::permissions::Rank;
use super::persistence::{MAX_SNAPSHOT_BYTES, SnapshotStore};
use super::sanitize::{HtmlSanitizer, TextSanitizer};

/// A row of a room's ban list. Name bans carry `*` as the address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanEntry {
    pub id: i64,
    pub ip: String,
    pub name: String,
    pub reason: String,
    pub bannedby: String,
}

/// Address placeholder stored for bans that only match a name.
pub const NAME_BAN_IP: &str = "*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankEntry {
    pub name: String,
    pub rank: Rank,
}

/// Accounts, per-room ranks, bans, aliases and the per-room media library.
///
/// Every call may suspend; rooms re-check their dead marker after each one.
#[async_trait]
pub trait Database: Send + Sync {
    async fn is_channel_registered(&self, channel: &str) -> Result<bool, LookupError>;

    /// Site-wide rank of an account. Unknown names are guests (rank 0).
    async fn global_rank(&self, name: &str) -> Result<Rank, LookupError>;
    async fn global_ranks(&self, names: &[String]) -> Result<Vec<Rank>, LookupError>;

    /// Rank granted inside one room. Absent entries are rank 0.
    async fn channel_rank(&self, channel: &str, name: &str) -> Result<Rank, LookupError>;
    async fn channel_ranks(&self, channel: &str, names: &[String])
    -> Result<Vec<Rank>, LookupError>;
    async fn set_channel_rank(&self, channel: &str, name: &str, rank: Rank)
    -> Result<(), LookupError>;
    async fn list_channel_ranks(&self, channel: &str) -> Result<Vec<RankEntry>, LookupError>;

    /// True if `ip` matches a full-address ban or a range-ban prefix.
    async fn is_ip_banned(&self, channel: &str, ip: &str) -> Result<bool, LookupError>;
    async fn is_name_banned(&self, channel: &str, name: &str) -> Result<bool, LookupError>;
    async fn add_ban(
        &self,
        channel: &str,
        ip: &str,
        name: &str,
        reason: &str,
        banned_by: &str,
    ) -> Result<(), LookupError>;
    /// Remove a ban by id, returning what was removed.
    async fn remove_ban(&self, channel: &str, id: i64) -> Result<Option<BanEntry>, LookupError>;
    async fn list_bans(&self, channel: &str) -> Result<Vec<BanEntry>, LookupError>;

    /// Every name seen from an address.
    async fn aliases(&self, ip: &str) -> Result<Vec<String>, LookupError>;
    async fn record_alias(&self, ip: &str, name: &str) -> Result<(), LookupError>;
    /// Every address a name has been seen from.
    async fn ips_for_name(&self, name: &str) -> Result<Vec<String>, LookupError>;

    async fn library_lookup(
        &self,
        channel: &str,
        id: &str,
        media_type: &str,
    ) -> Result<Option<Media>, LookupError>;
    async fn cache_media(&self, channel: &str, media: &Media) -> Result<(), LookupError>;
    async fn uncache_media(&self, channel: &str, id: &str) -> Result<(), LookupError>;
    async fn search_library(&self, channel: &str, query: &str) -> Result<Vec<Media>, LookupError>;

    /// A saved personal playlist. Missing playlists are [`LookupError::NotFound`].
    async fn user_playlist(&self, owner: &str, name: &str) -> Result<Vec<Media>, LookupError>;
}

/// Turns a media id and type into playable descriptors. Playlist types may
/// yield many.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve(&self, id: &str, media_type: &str) -> Result<Vec<Media>, LookupError>;
}

/// Tunables every room reads.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub dump_dir: PathBuf,
    /// `None` keeps room logs in the tracing output only.
    pub log_dir: Option<PathBuf>,
    pub max_snapshot_bytes: u64,
    pub reserved_pagetitles: Option<Regex>,
    pub max_chat_length: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            dump_dir: PathBuf::from("chandump"),
            log_dir: Some(PathBuf::from("chanlogs")),
            max_snapshot_bytes: MAX_SNAPSHOT_BYTES,
            reserved_pagetitles: None,
            max_chat_length: MAX_CHAT_LENGTH,
        }
    }
}

/// The collaborators shared by every room in the process.
#[derive(Clone)]
pub struct Services {
    pub db: Arc<dyn Database>,
    pub resolver: Arc<dyn MetadataResolver>,
    pub sanitizer: Arc<dyn TextSanitizer>,
    pub commands: Arc<dyn CommandInterpreter>,
    pub snapshots: SnapshotStore,
    pub settings: Arc<ChannelSettings>,
}

impl Services {
    /// Wire the stock sanitizer and command set around a database and resolver.
    pub fn new(
        db: Arc<dyn Database>,
        resolver: Arc<dyn MetadataResolver>,
        settings: ChannelSettings,
    ) -> Self {
        Self {
            db,
            resolver,
            sanitizer: Arc::new(HtmlSanitizer),
            commands: Arc::new(BuiltinCommands),
            snapshots: SnapshotStore::new(settings.dump_dir.clone(), settings.max_snapshot_bytes),
            settings: Arc::new(settings),
        }
    }
}
