//! SQLite-backed `ConfigStore`. One table per concern; JSON columns for maps.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde_json::{Map, Value};

use crate::descriptor::ChannelType;
use crate::store::{ChannelConfig, ConfigStore, StoreError};

/// SQLite-backed store: `channel_configs` keyed by id, `user_channel_configs`
/// keyed by `(user_id, channel_type)`. Connections are opened per call inside
/// `spawn_blocking`; rusqlite is not async.
pub struct SqliteConfigStore {
    db_path: std::path::PathBuf,
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn json_column(raw: &str) -> Map<String, Value> {
    serde_json::from_str::<Map<String, Value>>(raw).unwrap_or_default()
}

fn map_to_json(map: &Map<String, Value>) -> String {
    Value::Object(map.clone()).to_string()
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChannelConfig> {
    let credentials: String = row.get("credentials")?;
    let self_identity: String = row.get("self_identity")?;
    let routing: String = row.get("routing")?;
    let verified_at: Option<String> = row.get("verified_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let channel_type: String = row.get("channel_type")?;
    Ok(ChannelConfig {
        id: row.get("id")?,
        bot_id: row.get("bot_id")?,
        channel_type: ChannelType::new(channel_type),
        credentials: json_column(&credentials),
        external_id: row.get("external_id")?,
        self_identity: json_column(&self_identity),
        routing: json_column(&routing),
        status: row.get("status")?,
        verified_at: verified_at.as_deref().map(parse_ts),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

impl SqliteConfigStore {
    /// Creates the store and ensures tables exist. `path` is the SQLite file path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = rusqlite::Connection::open(&db_path).map_err(backend)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS channel_configs (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL,
                channel_type TEXT NOT NULL,
                credentials TEXT NOT NULL DEFAULT '{}',
                external_id TEXT NOT NULL DEFAULT '',
                self_identity TEXT NOT NULL DEFAULT '{}',
                routing TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT '',
                verified_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_channel_configs_type ON channel_configs(channel_type);
            CREATE INDEX IF NOT EXISTS idx_channel_configs_bot ON channel_configs(bot_id);
            CREATE TABLE IF NOT EXISTS user_channel_configs (
                user_id TEXT NOT NULL,
                channel_type TEXT NOT NULL,
                config TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, channel_type)
            );
            "#,
        )
        .map_err(backend)?;
        Ok(Self { db_path })
    }

    /// Inserts or replaces a config row.
    pub async fn put_config(&self, config: ChannelConfig) -> Result<(), StoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(backend)?;
            conn.execute(
                r#"
                INSERT OR REPLACE INTO channel_configs
                    (id, bot_id, channel_type, credentials, external_id, self_identity,
                     routing, status, verified_at, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
                params![
                    config.id,
                    config.bot_id,
                    config.channel_type.as_str(),
                    map_to_json(&config.credentials),
                    config.external_id,
                    map_to_json(&config.self_identity),
                    map_to_json(&config.routing),
                    config.status,
                    config.verified_at.map(|t| t.to_rfc3339()),
                    config.created_at.to_rfc3339(),
                    config.updated_at.to_rfc3339(),
                ],
            )
            .map_err(backend)?;
            Ok::<(), StoreError>(())
        })
        .await
        .map_err(backend)?
    }
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    async fn resolve_effective_config(
        &self,
        bot_id: &str,
        channel_type: &ChannelType,
    ) -> Result<ChannelConfig, StoreError> {
        let db_path = self.db_path.clone();
        let bot = bot_id.to_string();
        let ty = channel_type.as_str().to_string();
        let found = tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(backend)?;
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM channel_configs WHERE bot_id = ?1 AND channel_type = ?2 \
                     ORDER BY updated_at DESC LIMIT 1",
                )
                .map_err(backend)?;
            let mut rows = stmt.query(params![bot, ty]).map_err(backend)?;
            match rows.next().map_err(backend)? {
                Some(row) => Ok(Some(row_to_config(row).map_err(backend)?)),
                None => Ok::<Option<ChannelConfig>, StoreError>(None),
            }
        })
        .await
        .map_err(backend)??;
        found.ok_or_else(|| {
            StoreError::NotFound(format!("config for bot {bot_id} on {channel_type}"))
        })
    }

    async fn list_configs_by_type(
        &self,
        channel_type: &ChannelType,
    ) -> Result<Vec<ChannelConfig>, StoreError> {
        let db_path = self.db_path.clone();
        let ty = channel_type.as_str().to_string();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(backend)?;
            let mut stmt = conn
                .prepare("SELECT * FROM channel_configs WHERE channel_type = ?1 ORDER BY id ASC")
                .map_err(backend)?;
            let mut rows = stmt.query(params![ty]).map_err(backend)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(backend)? {
                out.push(row_to_config(row).map_err(backend)?);
            }
            Ok::<Vec<ChannelConfig>, StoreError>(out)
        })
        .await
        .map_err(backend)?
    }

    async fn get_user_config(
        &self,
        user_id: &str,
        channel_type: &ChannelType,
    ) -> Result<Map<String, Value>, StoreError> {
        let db_path = self.db_path.clone();
        let user_id_owned = user_id.to_string();
        let ty = channel_type.as_str().to_string();
        let found = tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(backend)?;
            let mut stmt = conn
                .prepare(
                    "SELECT config FROM user_channel_configs WHERE user_id = ?1 AND channel_type = ?2",
                )
                .map_err(backend)?;
            let mut rows = stmt.query(params![user_id_owned, ty]).map_err(backend)?;
            match rows.next().map_err(backend)? {
                Some(row) => {
                    let raw: String = row.get(0).map_err(backend)?;
                    Ok(Some(json_column(&raw)))
                }
                None => Ok::<Option<Map<String, Value>>, StoreError>(None),
            }
        })
        .await
        .map_err(backend)??;
        found.ok_or_else(|| {
            StoreError::NotFound(format!("user config {user_id} on {channel_type}"))
        })
    }

    async fn upsert_user_config(
        &self,
        user_id: &str,
        channel_type: &ChannelType,
        config: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let db_path = self.db_path.clone();
        let user_id = user_id.to_string();
        let ty = channel_type.as_str().to_string();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(backend)?;
            conn.execute(
                "INSERT OR REPLACE INTO user_channel_configs (user_id, channel_type, config, updated_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, ty, map_to_json(&config), Utc::now().to_rfc3339()],
            )
            .map_err(backend)?;
            Ok::<(), StoreError>(())
        })
        .await
        .map_err(backend)?
    }

    async fn resolve_user_binding(
        &self,
        channel_type: &ChannelType,
        criteria: &Map<String, Value>,
    ) -> Result<String, StoreError> {
        let db_path = self.db_path.clone();
        let ty = channel_type.as_str().to_string();
        let criteria = criteria.clone();
        let found = tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(backend)?;
            let mut stmt = conn
                .prepare(
                    "SELECT user_id, config FROM user_channel_configs WHERE channel_type = ?1 \
                     ORDER BY updated_at DESC",
                )
                .map_err(backend)?;
            let mut rows = stmt.query(params![ty]).map_err(backend)?;
            while let Some(row) = rows.next().map_err(backend)? {
                let user_id: String = row.get(0).map_err(backend)?;
                let raw: String = row.get(1).map_err(backend)?;
                let config = json_column(&raw);
                if criteria.iter().all(|(k, v)| config.get(k) == Some(v)) {
                    return Ok(Some(user_id));
                }
            }
            Ok::<Option<String>, StoreError>(None)
        })
        .await
        .map_err(backend)??;
        found.ok_or_else(|| StoreError::NotFound(format!("user binding on {channel_type}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn round_trips_config_rows() {
        let file = NamedTempFile::new().unwrap();
        let store = SqliteConfigStore::new(file.path()).unwrap();
        let ty = ChannelType::new("telegram");
        let mut cfg = ChannelConfig::new("cfg-1", "bot-1", ty.clone());
        cfg.status = "verified".into();
        cfg.credentials
            .insert("token".into(), serde_json::json!("secret"));
        store.put_config(cfg).await.unwrap();

        let listed = store.list_configs_by_type(&ty).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "cfg-1");
        assert_eq!(listed[0].credentials["token"], "secret");
        assert!(listed[0].is_active());

        let effective = store.resolve_effective_config("bot-1", &ty).await.unwrap();
        assert_eq!(effective.id, "cfg-1");
        assert!(matches!(
            store.resolve_effective_config("bot-2", &ty).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn user_config_and_binding() {
        let file = NamedTempFile::new().unwrap();
        let store = SqliteConfigStore::new(file.path()).unwrap();
        let ty = ChannelType::new("feishu");
        let mut config = Map::new();
        config.insert("open_id".into(), serde_json::json!("ou-42"));
        store.upsert_user_config("u-1", &ty, config).await.unwrap();

        let got = store.get_user_config("u-1", &ty).await.unwrap();
        assert_eq!(got["open_id"], "ou-42");

        let mut criteria = Map::new();
        criteria.insert("open_id".into(), serde_json::json!("ou-42"));
        assert_eq!(store.resolve_user_binding(&ty, &criteria).await.unwrap(), "u-1");
    }
}
