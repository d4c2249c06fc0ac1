use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use uuid::Uuid;

use super::Db;
use crate::Result;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub async fn init_pool(database_url: &str) -> Result<Db> {
    let is_memory = database_url.starts_with("sqlite::memory");
    let resolved_url = if is_memory {
        // With the default settings each connection to an in-memory SQLite
        // URL gets its own private database, so pooled queries would hop
        // between unrelated databases. Back "memory" requests with a unique
        // tempfile instead and keep the pool at one connection.
        let db_path = std::env::temp_dir().join(format!("corral-test-{}.sqlite", Uuid::new_v4()));
        format!("sqlite://{}", db_path.display())
    } else {
        database_url.to_string()
    };

    ensure_db_dir(&resolved_url)?;

    let mut opts = SqliteConnectOptions::from_str(&resolved_url)?.create_if_missing(true);
    if is_memory {
        opts = opts.shared_cache(true);
    } else {
        opts = opts.journal_mode(SqliteJournalMode::Wal);
    }

    let pool_opts = if is_memory {
        SqlitePoolOptions::new().max_connections(1)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };

    let pool = pool_opts
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(opts)
        .await?;

    Ok(pool)
}

fn ensure_db_dir(database_url: &str) -> Result<()> {
    if let Some(path_str) = database_url.strip_prefix("sqlite://") {
        let path = Path::new(path_str);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }
    Ok(())
}

pub async fn run_migrations(pool: &Db) -> Result<()> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

pub fn latest_migration_version() -> Option<i64> {
    MIGRATOR.iter().map(|m| m.version).max()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_and_migrate_memory_pool() {
        let db = init_pool("sqlite::memory:").await.expect("db init");
        run_migrations(&db).await.expect("migrations");

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(&db)
                .await
                .expect("table count");
        assert!(count > 0, "migrations should create tables");
        assert!(latest_migration_version().is_some());
    }
}
