use sqlx::SqlitePool;

use crate::db::models::UserPlaylistRow;

/// Store a personal playlist, replacing any with the same name.
pub async fn save_playlist(
    pool: &SqlitePool,
    owner: &str,
    name: &str,
    contents: &str,
    count: i64,
    duration: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO user_playlists (owner, name, contents, count, duration) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(owner, name) DO UPDATE SET contents = excluded.contents, \
         count = excluded.count, duration = excluded.duration, updated_at = datetime('now')",
    )
    .bind(owner)
    .bind(name)
    .bind(contents)
    .bind(count)
    .bind(duration)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_playlist(
    pool: &SqlitePool,
    owner: &str,
    name: &str,
) -> Result<Option<UserPlaylistRow>, sqlx::Error> {
    sqlx::query_as::<_, UserPlaylistRow>(
        "SELECT * FROM user_playlists WHERE owner = ? AND name = ?",
    )
    .bind(owner)
    .bind(name)
    .fetch_optional(pool)
    .await
}

pub async fn list_playlists(pool: &SqlitePool, owner: &str) -> Result<Vec<UserPlaylistRow>, sqlx::Error> {
    sqlx::query_as::<_, UserPlaylistRow>("SELECT * FROM user_playlists WHERE owner = ? ORDER BY name")
        .bind(owner)
        .fetch_all(pool)
        .await
}
