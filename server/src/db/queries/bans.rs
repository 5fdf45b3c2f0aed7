use sqlx::SqlitePool;

use crate::db::models::BanRow;

pub async fn create_ban(
    pool: &SqlitePool,
    channel: &str,
    ip: &str,
    name: &str,
    reason: &str,
    bannedby: &str,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO channel_bans (channel, ip, name, reason, bannedby) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(channel)
    .bind(ip)
    .bind(name)
    .bind(reason)
    .bind(bannedby)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn get_ban(pool: &SqlitePool, channel: &str, id: i64) -> Result<Option<BanRow>, sqlx::Error> {
    sqlx::query_as::<_, BanRow>("SELECT * FROM channel_bans WHERE channel = ? AND id = ?")
        .bind(channel)
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Delete a ban by id and return it.
pub async fn remove_ban(
    pool: &SqlitePool,
    channel: &str,
    id: i64,
) -> Result<Option<BanRow>, sqlx::Error> {
    let Some(ban) = get_ban(pool, channel, id).await? else {
        return Ok(None);
    };
    sqlx::query("DELETE FROM channel_bans WHERE channel = ? AND id = ?")
        .bind(channel)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(Some(ban))
}

pub async fn list_bans(pool: &SqlitePool, channel: &str) -> Result<Vec<BanRow>, sqlx::Error> {
    sqlx::query_as::<_, BanRow>("SELECT * FROM channel_bans WHERE channel = ? ORDER BY id")
        .bind(channel)
        .fetch_all(pool)
        .await
}

/// True if `ip` equals a banned address or falls under a banned range prefix.
pub async fn is_ip_banned(pool: &SqlitePool, channel: &str, ip: &str) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM channel_bans WHERE channel = ? AND ip != '*' \
         AND (ip = ? OR ? LIKE ip || '.%' OR ? LIKE ip || ':%')",
    )
    .bind(channel)
    .bind(ip)
    .bind(ip)
    .bind(ip)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

pub async fn is_name_banned(
    pool: &SqlitePool,
    channel: &str,
    name: &str,
) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM channel_bans WHERE channel = ? AND ip = '*' AND name = ?",
    )
    .bind(channel)
    .bind(name)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}
