use sqlx::SqlitePool;

use crate::db::models::LibraryRow;

/// Longest search query accepted.
pub const MAX_QUERY_LENGTH: usize = 100;

pub async fn add_to_library(
    pool: &SqlitePool,
    channel: &str,
    id: &str,
    media_type: &str,
    title: &str,
    seconds: i64,
    meta: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO channel_library (channel, id, media_type, title, seconds, meta) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(channel, id, media_type) DO UPDATE SET \
         title = excluded.title, seconds = excluded.seconds, meta = excluded.meta",
    )
    .bind(channel)
    .bind(id)
    .bind(media_type)
    .bind(title)
    .bind(seconds)
    .bind(meta)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_from_library(
    pool: &SqlitePool,
    channel: &str,
    id: &str,
    media_type: &str,
) -> Result<Option<LibraryRow>, sqlx::Error> {
    sqlx::query_as::<_, LibraryRow>(
        "SELECT * FROM channel_library WHERE channel = ? AND id = ? AND media_type = ?",
    )
    .bind(channel)
    .bind(id)
    .bind(media_type)
    .fetch_optional(pool)
    .await
}

/// Remove every cached entry with this id, whatever its type.
pub async fn delete_from_library(pool: &SqlitePool, channel: &str, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM channel_library WHERE channel = ? AND id = ?")
        .bind(channel)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Case-insensitive title substring search, ordered by title.
pub async fn search_library(
    pool: &SqlitePool,
    channel: &str,
    query: &str,
) -> Result<Vec<LibraryRow>, sqlx::Error> {
    let escaped = query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    let pattern = format!("%{escaped}%");
    sqlx::query_as::<_, LibraryRow>(
        "SELECT * FROM channel_library WHERE channel = ? AND title LIKE ? ESCAPE '\\' \
         ORDER BY lower(title)",
    )
    .bind(channel)
    .bind(pattern)
    .fetch_all(pool)
    .await
}
