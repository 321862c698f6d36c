use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Mutex,
};
use tracing::debug;

const DEFAULT_DATABASE_URL: &str = "sqlite://./data/client.db";

/// Persistent string key-value storage. Multi-key writes and removals are
/// atomic: either every entry is applied or none is.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put_many(&self, entries: &[(&str, &str)]) -> Result<()>;
    async fn remove_many(&self, keys: &[&str]) -> Result<()>;

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.put_many(&[(key, value)]).await
    }
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_database_dir(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every pooled connection to an in-memory database would see its own
        // empty database.
        let max_connections = if database_url.starts_with("sqlite::memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open sqlite store at '{database_url}'"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!(database_url, "storage: key-value store ready");
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for Storage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM key_value WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read key '{key}'"))?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    async fn put_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (key, value) in entries {
            sqlx::query(
                "INSERT INTO key_value (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
            )
            .bind(*key)
            .bind(*value)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to write key '{key}'"))?;
        }
        tx.commit().await.context("failed to commit key-value write")?;
        Ok(())
    }

    async fn remove_many(&self, keys: &[&str]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for key in keys {
            sqlx::query("DELETE FROM key_value WHERE key = ?")
                .bind(*key)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to remove key '{key}'"))?;
        }
        tx.commit()
            .await
            .context("failed to commit key-value removal")?;
        Ok(())
    }
}

/// Process-local store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    async fn put_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut guard = self.entries()?;
        for (key, value) in entries {
            guard.insert((*key).to_string(), (*value).to_string());
        }
        Ok(())
    }

    async fn remove_many(&self, keys: &[&str]) -> Result<()> {
        let mut guard = self.entries()?;
        for key in keys {
            guard.remove(*key);
        }
        Ok(())
    }
}

/// Turns a configured location (URL, `sqlite:` path or plain path) into a
/// sqlite URL and makes sure the directory for its file exists.
pub fn prepare_database_url(raw_database_url: &str) -> Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_database_dir(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    match raw_database_url.trim() {
        "" => DEFAULT_DATABASE_URL.to_string(),
        url if url.contains("://") || url.starts_with("sqlite::memory:") => url.to_string(),
        path => {
            let path = path.strip_prefix("sqlite:").unwrap_or(path);
            format!("sqlite://{}", path.replace('\\', "/"))
        }
    }
}

fn ensure_database_dir(database_url: &str) -> Result<()> {
    let file = database_file(database_url);
    let Some(dir) = file
        .as_deref()
        .and_then(Path::parent)
        .filter(|dir| !dir.as_os_str().is_empty())
    else {
        return Ok(());
    };
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create '{}' for the client store", dir.display()))
}

/// On-disk file behind a sqlite URL; `None` for in-memory and non-sqlite URLs.
fn database_file(database_url: &str) -> Option<PathBuf> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    if rest.starts_with(":memory:") {
        return None;
    }
    let path = rest.split('?').next().unwrap_or_default();
    (!path.is_empty()).then(|| PathBuf::from(path))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
