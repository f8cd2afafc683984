//! Session credential storage.
//!
//! The client keeps exactly two strings, the access and refresh credentials,
//! under fixed keys. Everything that needs them goes through a
//! [`SessionStore`], so the API client and the payment workflow can run
//! against [`MemorySessionStore`] in tests and [`SqliteSessionStore`] in the
//! CLI. Writes are last-write-wins.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::errors::Result;
use crate::models::TokenPair;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Access,
    Refresh,
}

impl SessionKey {
    pub const ALL: [SessionKey; 2] = [SessionKey::Access, SessionKey::Refresh];

    /// Storage key, shared with the web frontend's local storage layout.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access_token",
            Self::Refresh => "refresh_token",
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: SessionKey) -> Result<Option<String>>;
    async fn set(&self, key: SessionKey, value: &str) -> Result<()>;
    /// Remove both credentials.
    async fn clear(&self) -> Result<()>;
}

pub type SharedSessionStore = Arc<dyn SessionStore>;

/// Persist a freshly issued credential pair.
pub async fn store_tokens(store: &dyn SessionStore, tokens: &TokenPair) -> Result<()> {
    store.set(SessionKey::Access, &tokens.access).await?;
    store.set(SessionKey::Refresh, &tokens.refresh).await?;
    Ok(())
}

pub async fn is_authenticated(store: &dyn SessionStore) -> Result<bool> {
    Ok(store
        .get(SessionKey::Access)
        .await?
        .is_some_and(|token| !token.is_empty()))
}

// ─────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────

/// Process-local store; nothing survives a restart.
#[derive(Default, Clone)]
pub struct MemorySessionStore {
    entries: Arc<RwLock<HashMap<SessionKey, String>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: SessionKey) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(&key).cloned())
    }

    async fn set(&self, key: SessionKey, value: &str) -> Result<()> {
        self.entries.write().await.insert(key, value.to_string());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// SQLite store
// ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Open (creating if needed) the database at `database_url` and run
    /// pending migrations.
    pub async fn open(database_url: &str) -> Result<Self> {
        let url = if database_url.starts_with("sqlite:") {
            database_url.to_string()
        } else {
            format!("sqlite:{database_url}")
        };

        let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

        // Every connection to `:memory:` is its own database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Session store ready at {url}");
        Ok(Self { pool })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, key: SessionKey) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM session_entries WHERE key = ?1")
                .bind(key.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn set(&self, key: SessionKey, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session_entries (key, value, updated_at)
            VALUES (?1, ?2, strftime('%s', 'now'))
            ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                           updated_at = excluded.updated_at
            "#,
        )
        .bind(key.as_str())
        .bind(value)
        .execute(&self.pool)
        .await?;
        debug!("Stored {}", key.as_str());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        for key in SessionKey::ALL {
            sqlx::query("DELETE FROM session_entries WHERE key = ?1")
                .bind(key.as_str())
                .execute(&self.pool)
                .await?;
        }
        debug!("Session cleared");
        Ok(())
    }
}
