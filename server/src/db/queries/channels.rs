use sqlx::SqlitePool;

use crate::db::models::{ChannelRankRow, ChannelRow};

/// Rank the owner of a newly registered room receives.
pub const OWNER_RANK: f64 = 4.0;

/// Register a room and grant its owner the founder rank.
pub async fn register_channel(pool: &SqlitePool, name: &str, owner: &str) -> Result<(), sqlx::Error> {
    let name = name.to_lowercase();
    let mut tx = pool.begin().await?;
    sqlx::query("INSERT INTO channels (name, owner) VALUES (?, ?)")
        .bind(&name)
        .bind(owner)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO channel_ranks (channel, name, rank) VALUES (?, ?, ?) \
         ON CONFLICT(channel, name) DO UPDATE SET rank = excluded.rank",
    )
    .bind(&name)
    .bind(owner)
    .bind(OWNER_RANK)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn get_channel(pool: &SqlitePool, name: &str) -> Result<Option<ChannelRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelRow>("SELECT * FROM channels WHERE name = ?")
        .bind(name.to_lowercase())
        .fetch_optional(pool)
        .await
}

pub async fn is_registered(pool: &SqlitePool, name: &str) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM channels WHERE name = ?")
        .bind(name.to_lowercase())
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

pub async fn delete_channel(pool: &SqlitePool, name: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM channels WHERE name = ?")
        .bind(name.to_lowercase())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ── Ranks ───────────────────────────────────────────────────────────

/// Rank granted in a room, or 0 when there is no grant.
pub async fn get_rank(pool: &SqlitePool, channel: &str, name: &str) -> Result<f64, sqlx::Error> {
    let rank: Option<f64> =
        sqlx::query_scalar("SELECT rank FROM channel_ranks WHERE channel = ? AND name = ?")
            .bind(channel)
            .bind(name)
            .fetch_optional(pool)
            .await?;
    Ok(rank.unwrap_or(0.0))
}

pub async fn set_rank(
    pool: &SqlitePool,
    channel: &str,
    name: &str,
    rank: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO channel_ranks (channel, name, rank) VALUES (?, ?, ?) \
         ON CONFLICT(channel, name) DO UPDATE SET rank = excluded.rank",
    )
    .bind(channel)
    .bind(name)
    .bind(rank)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_ranks(pool: &SqlitePool, channel: &str) -> Result<Vec<ChannelRankRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelRankRow>(
        "SELECT * FROM channel_ranks WHERE channel = ? ORDER BY rank DESC, name",
    )
    .bind(channel)
    .fetch_all(pool)
    .await
}
