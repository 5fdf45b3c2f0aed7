use sqlx::SqlitePool;

/// Remember that `name` connected from `ip`.
pub async fn record_alias(pool: &SqlitePool, ip: &str, name: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO aliases (ip, name) VALUES (?, ?) \
         ON CONFLICT(ip, name) DO UPDATE SET last_seen = datetime('now')",
    )
    .bind(ip)
    .bind(name)
    .execute(pool)
    .await?;
    Ok(())
}

/// Names seen from an address, most recent first.
pub async fn get_aliases(pool: &SqlitePool, ip: &str) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT name FROM aliases WHERE ip = ? ORDER BY last_seen DESC, name")
        .bind(ip)
        .fetch_all(pool)
        .await
}

/// Addresses a name has connected from.
pub async fn get_ips(pool: &SqlitePool, name: &str) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT ip FROM aliases WHERE name = ? ORDER BY ip")
        .bind(name)
        .fetch_all(pool)
        .await
}
