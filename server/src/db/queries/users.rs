use sqlx::SqlitePool;

use crate::db::models::UserRow;

/// Create an account or change its site-wide rank.
pub async fn upsert_user(pool: &SqlitePool, name: &str, global_rank: f64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO users (name, global_rank) VALUES (?, ?) \
         ON CONFLICT(name) DO UPDATE SET global_rank = excluded.global_rank",
    )
    .bind(name)
    .bind(global_rank)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_user(pool: &SqlitePool, name: &str) -> Result<Option<UserRow>, sqlx::Error> {
    sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
}

/// Site-wide rank, or 0 for names with no account.
pub async fn get_global_rank(pool: &SqlitePool, name: &str) -> Result<f64, sqlx::Error> {
    let rank: Option<f64> = sqlx::query_scalar("SELECT global_rank FROM users WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(rank.unwrap_or(0.0))
}
