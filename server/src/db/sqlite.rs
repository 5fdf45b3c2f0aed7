use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::warn;

use crate::db::models::{BanRow, LibraryRow};
use crate::db::queries::{aliases, bans, channels, library, playlists, users};
use crate::engine::error::LookupError;
use crate::engine::media::{Media, MediaMeta};
use crate::engine::permissions::Rank;
use crate::engine::services::{BanEntry, Database, RankEntry};

/// [`Database`] backed by the SQLite pool.
#[derive(Clone)]
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> LookupError {
    LookupError::Database(e.to_string())
}

fn media_from_row(row: LibraryRow) -> Media {
    let mut media = Media::new(&row.id, &row.title, row.seconds.max(0) as u64, &row.media_type);
    media.meta = serde_json::from_str::<MediaMeta>(&row.meta).unwrap_or_default();
    media
}

impl From<BanRow> for BanEntry {
    fn from(row: BanRow) -> Self {
        Self {
            id: row.id,
            ip: row.ip,
            name: row.name,
            reason: row.reason,
            bannedby: row.bannedby,
        }
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn is_channel_registered(&self, channel: &str) -> Result<bool, LookupError> {
        channels::is_registered(&self.pool, channel).await.map_err(db_err)
    }

    async fn global_rank(&self, name: &str) -> Result<Rank, LookupError> {
        users::get_global_rank(&self.pool, name).await.map_err(db_err)
    }

    async fn global_ranks(&self, names: &[String]) -> Result<Vec<Rank>, LookupError> {
        let mut ranks = Vec::with_capacity(names.len());
        for name in names {
            ranks.push(self.global_rank(name).await?);
        }
        Ok(ranks)
    }

    async fn channel_rank(&self, channel: &str, name: &str) -> Result<Rank, LookupError> {
        channels::get_rank(&self.pool, channel, name).await.map_err(db_err)
    }

    async fn channel_ranks(
        &self,
        channel: &str,
        names: &[String],
    ) -> Result<Vec<Rank>, LookupError> {
        let mut ranks = Vec::with_capacity(names.len());
        for name in names {
            ranks.push(self.channel_rank(channel, name).await?);
        }
        Ok(ranks)
    }

    async fn set_channel_rank(
        &self,
        channel: &str,
        name: &str,
        rank: Rank,
    ) -> Result<(), LookupError> {
        channels::set_rank(&self.pool, channel, name, rank)
            .await
            .map_err(db_err)
    }

    async fn list_channel_ranks(&self, channel: &str) -> Result<Vec<RankEntry>, LookupError> {
        let rows = channels::list_ranks(&self.pool, channel)
            .await
            .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|r| RankEntry {
                name: r.name,
                rank: r.rank,
            })
            .collect())
    }

    async fn is_ip_banned(&self, channel: &str, ip: &str) -> Result<bool, LookupError> {
        bans::is_ip_banned(&self.pool, channel, ip).await.map_err(db_err)
    }

    async fn is_name_banned(&self, channel: &str, name: &str) -> Result<bool, LookupError> {
        bans::is_name_banned(&self.pool, channel, name)
            .await
            .map_err(db_err)
    }

    async fn add_ban(
        &self,
        channel: &str,
        ip: &str,
        name: &str,
        reason: &str,
        banned_by: &str,
    ) -> Result<(), LookupError> {
        bans::create_ban(&self.pool, channel, ip, name, reason, banned_by)
            .await
            .map(|_| ())
            .map_err(db_err)
    }

    async fn remove_ban(&self, channel: &str, id: i64) -> Result<Option<BanEntry>, LookupError> {
        let row = bans::remove_ban(&self.pool, channel, id)
            .await
            .map_err(db_err)?;
        Ok(row.map(BanEntry::from))
    }

    async fn list_bans(&self, channel: &str) -> Result<Vec<BanEntry>, LookupError> {
        let rows = bans::list_bans(&self.pool, channel).await.map_err(db_err)?;
        Ok(rows.into_iter().map(BanEntry::from).collect())
    }

    async fn aliases(&self, ip: &str) -> Result<Vec<String>, LookupError> {
        aliases::get_aliases(&self.pool, ip).await.map_err(db_err)
    }

    async fn record_alias(&self, ip: &str, name: &str) -> Result<(), LookupError> {
        aliases::record_alias(&self.pool, ip, name)
            .await
            .map_err(db_err)
    }

    async fn ips_for_name(&self, name: &str) -> Result<Vec<String>, LookupError> {
        aliases::get_ips(&self.pool, name).await.map_err(db_err)
    }

    async fn library_lookup(
        &self,
        channel: &str,
        id: &str,
        media_type: &str,
    ) -> Result<Option<Media>, LookupError> {
        let row = library::get_from_library(&self.pool, channel, id, media_type)
            .await
            .map_err(db_err)?;
        Ok(row.map(media_from_row))
    }

    async fn cache_media(&self, channel: &str, media: &Media) -> Result<(), LookupError> {
        let meta = serde_json::to_string(&media.meta).unwrap_or_else(|_| "{}".into());
        library::add_to_library(
            &self.pool,
            channel,
            &media.id,
            &media.media_type,
            &media.title,
            media.seconds as i64,
            &meta,
        )
        .await
        .map_err(db_err)
    }

    async fn uncache_media(&self, channel: &str, id: &str) -> Result<(), LookupError> {
        library::delete_from_library(&self.pool, channel, id)
            .await
            .map(|_| ())
            .map_err(db_err)
    }

    async fn search_library(&self, channel: &str, query: &str) -> Result<Vec<Media>, LookupError> {
        let rows = library::search_library(&self.pool, channel, query)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(media_from_row).collect())
    }

    async fn user_playlist(&self, owner: &str, name: &str) -> Result<Vec<Media>, LookupError> {
        let row = playlists::get_playlist(&self.pool, owner, name)
            .await
            .map_err(db_err)?
            .ok_or(LookupError::NotFound)?;
        serde_json::from_str::<Vec<Media>>(&row.contents).map_err(|e| {
            warn!(%owner, playlist = %name, error = %e, "stored playlist is unreadable");
            LookupError::Database(format!("Playlist is corrupt: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::{create_pool, run_migrations};

    async fn setup_db() -> SqliteDatabase {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        channels::register_channel(&pool, "lobby", "alice")
            .await
            .unwrap();
        SqliteDatabase::new(pool)
    }

    #[tokio::test]
    async fn test_library_round_trip_keeps_meta() {
        let db = setup_db().await;
        let mut media = Media::new("abc", "Song", 200, "yt");
        media.meta.restricted = Some("DE".into());
        db.cache_media("lobby", &media).await.unwrap();

        let found = db.library_lookup("lobby", "abc", "yt").await.unwrap().unwrap();
        assert_eq!(found.title, "Song");
        assert_eq!(found.duration, "00:03:20");
        assert_eq!(found.meta.restricted.as_deref(), Some("DE"));

        db.uncache_media("lobby", "abc").await.unwrap();
        assert!(db.library_lookup("lobby", "abc", "yt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_user_playlist_missing_is_not_found() {
        let db = setup_db().await;
        let err = db.user_playlist("alice", "nope").await.unwrap_err();
        assert!(matches!(err, LookupError::NotFound));
    }

    #[tokio::test]
    async fn test_user_playlist_decodes_media() {
        let db = setup_db().await;
        let contents = serde_json::to_string(&vec![
            Media::new("a", "A", 10, "yt"),
            Media::new("b", "B", 20, "vi"),
        ])
        .unwrap();
        playlists::save_playlist(db.pool(), "alice", "mix", &contents, 2, 30)
            .await
            .unwrap();

        let items = db.user_playlist("alice", "mix").await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].media_type, "vi");
    }

    #[tokio::test]
    async fn test_rank_lists() {
        let db = setup_db().await;
        users::upsert_user(db.pool(), "bob", 255.0).await.unwrap();
        db.set_channel_rank("lobby", "carol", 2.0).await.unwrap();

        let names = vec!["bob".to_string(), "carol".to_string()];
        assert_eq!(db.global_ranks(&names).await.unwrap(), vec![255.0, 0.0]);
        assert_eq!(db.channel_ranks("lobby", &names).await.unwrap(), vec![0.0, 2.0]);
        assert_eq!(db.list_channel_ranks("lobby").await.unwrap().len(), 2);
    }
}
