use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::chat::ChatMessage;
use super::emotes::Emote;
use super::error::SnapshotError;
use super::filter::FilterSpec;
use super::playlist::PlaylistDump;

/// Snapshots larger than this are refused before parsing.
pub const MAX_SNAPSHOT_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Motd {
    pub motd: String,
    pub html: String,
}

/// Everything about a room that survives a restart.
///
/// Options and permissions are kept loosely typed here and merged into the
/// fixed schemas on load, so unknown keys from older files are dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSnapshot {
    pub playlist: Option<PlaylistDump>,
    pub opts: Value,
    pub permissions: Value,
    /// Absent in snapshots that predate filters; the defaults apply then.
    pub filters: Option<Vec<FilterSpec>>,
    pub emotes: Vec<Emote>,
    pub motd: Motd,
    #[serde(rename = "playlistLock")]
    pub playlist_lock: bool,
    pub chatbuffer: Vec<ChatMessage>,
    pub css: String,
    pub js: String,
}

/// One JSON file per room under a dump directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    max_bytes: u64,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Read a room's snapshot. `Ok(None)` means there is none yet.
    pub async fn load(&self, key: &str) -> Result<Option<ChannelSnapshot>, SnapshotError> {
        let path = self.path_for(key);
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if meta.len() > self.max_bytes {
            return Err(SnapshotError::Oversized {
                size: meta.len(),
                limit: self.max_bytes,
            });
        }

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot = serde_json::from_slice(&data)?;
        debug!(channel = %key, bytes = data.len(), "snapshot loaded");
        Ok(Some(snapshot))
    }

    /// Write a snapshot to a temporary file, then rename it into place.
    pub async fn save(&self, key: &str, snapshot: &ChannelSnapshot) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let data = serde_json::to_vec(snapshot)?;
        let path = self.path_for(key);
        let tmp = self.dir.join(format!(".{key}.tmp"));

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &path).await?;
        debug!(channel = %key, bytes = data.len(), "snapshot saved");
        Ok(())
    }
}
