use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{Sqlite, SqlitePool, SqlitePoolOptions},
    Pool,
};

pub type DbPool = Pool<Sqlite>;

fn is_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

pub async fn ensure_database_file(url: &str) -> Result<(), sqlx::Error> {
    if is_memory(url) {
        return Ok(());
    }

    let exists = Sqlite::database_exists(url).await?;

    if !exists {
        Sqlite::create_database(url).await?;
    }

    Ok(())
}

pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    ensure_database_file(database_url).await?;

    // Every connection to an in-memory database gets its own database.
    let pool: SqlitePool = if is_memory(database_url) {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(database_url)
            .await?
    } else {
        SqlitePool::connect(database_url).await?
    };

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            path TEXT PRIMARY KEY NOT NULL,
            data BLOB NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            mtime INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO nodes (path, data, version, mtime) VALUES ('/', x'', 0, 0)")
        .execute(&pool)
        .await?;

    Ok(pool)
}
