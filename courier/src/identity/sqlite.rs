//! SQLite-backed `IdentityStore`.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::{Map, Value};

use crate::descriptor::ChannelType;
use crate::identity::{
    BindCode, BotProfile, ChannelIdentity, IdentityError, IdentityStore, PreauthKey,
};

/// SQLite-backed identity store. Connections are opened per call inside
/// `spawn_blocking`; rusqlite is not async.
pub struct SqliteIdentityStore {
    db_path: std::path::PathBuf,
}

fn backend(e: impl std::fmt::Display) -> IdentityError {
    IdentityError::Backend(e.to_string())
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_identity(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChannelIdentity> {
    let channel_type: String = row.get("channel_type")?;
    let metadata: String = row.get("metadata")?;
    Ok(ChannelIdentity {
        id: row.get("id")?,
        channel_type: ChannelType::new(channel_type),
        subject_id: row.get("subject_id")?,
        display_name: row.get("display_name")?,
        avatar_url: row.get("avatar_url")?,
        user_id: row.get("user_id")?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
    })
}

impl SqliteIdentityStore {
    /// Creates the store and ensures tables exist.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = rusqlite::Connection::open(&db_path).map_err(backend)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS channel_identities (
                id TEXT PRIMARY KEY,
                channel_type TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                display_name TEXT NOT NULL DEFAULT '',
                avatar_url TEXT,
                user_id TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                UNIQUE (channel_type, subject_id)
            );
            CREATE TABLE IF NOT EXISTS bind_codes (
                token TEXT PRIMARY KEY,
                channel_type TEXT NOT NULL,
                bot_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                consumed_at TEXT
            );
            CREATE TABLE IF NOT EXISTS preauth_keys (
                key TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                used_at TEXT
            );
            CREATE TABLE IF NOT EXISTS bot_profiles (
                bot_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                owner_user_id TEXT,
                allow_guests INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS bot_members (
                bot_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                PRIMARY KEY (bot_id, user_id)
            );
            "#,
        )
        .map_err(backend)?;
        Ok(Self { db_path })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, IdentityError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, IdentityError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(backend)?;
            f(&conn)
        })
        .await
        .map_err(backend)?
    }

    pub async fn put_bot_profile(&self, profile: BotProfile) -> Result<(), IdentityError> {
        self.with_conn(move |conn| {
            let kind = match profile.kind {
                crate::identity::BotKind::Personal => "personal",
                crate::identity::BotKind::Shared => "shared",
            };
            conn.execute(
                "INSERT OR REPLACE INTO bot_profiles (bot_id, kind, owner_user_id, allow_guests) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    profile.bot_id,
                    kind,
                    profile.owner_user_id,
                    profile.allow_guests as i64
                ],
            )
            .map_err(backend)?;
            Ok(())
        })
        .await
    }

    pub async fn put_bind_code(&self, code: BindCode) -> Result<(), IdentityError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO bind_codes \
                 (token, channel_type, bot_id, user_id, expires_at, consumed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    code.token,
                    code.channel_type.as_str(),
                    code.bot_id,
                    code.user_id,
                    code.expires_at.to_rfc3339(),
                    code.consumed_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(backend)?;
            Ok(())
        })
        .await
    }

    pub async fn put_preauth_key(&self, key: PreauthKey) -> Result<(), IdentityError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO preauth_keys (key, bot_id, expires_at, used_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    key.key,
                    key.bot_id,
                    key.expires_at.to_rfc3339(),
                    key.used_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(backend)?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn upsert_channel_identity(
        &self,
        channel_type: &ChannelType,
        subject_id: &str,
        display_name: &str,
        attributes: &Map<String, Value>,
    ) -> Result<ChannelIdentity, IdentityError> {
        let ty = channel_type.as_str().to_string();
        let subject = subject_id.to_string();
        let name = display_name.to_string();
        let attrs = Value::Object(attributes.clone()).to_string();
        self.with_conn(move |conn| {
            let existing = conn
                .query_row(
                    "SELECT * FROM channel_identities WHERE channel_type = ?1 AND subject_id = ?2",
                    params![ty, subject],
                    row_to_identity,
                )
                .optional()
                .map_err(backend)?;
            match existing {
                Some(mut identity) => {
                    if !name.trim().is_empty() {
                        identity.display_name = name.clone();
                    }
                    let incoming: Map<String, Value> =
                        serde_json::from_str(&attrs).unwrap_or_default();
                    for (k, v) in incoming {
                        identity.metadata.insert(k, v);
                    }
                    conn.execute(
                        "UPDATE channel_identities SET display_name = ?1, metadata = ?2 WHERE id = ?3",
                        params![
                            identity.display_name,
                            Value::Object(identity.metadata.clone()).to_string(),
                            identity.id
                        ],
                    )
                    .map_err(backend)?;
                    Ok(identity)
                }
                None => {
                    let id = format!("ci-{}", uuid::Uuid::new_v4());
                    conn.execute(
                        "INSERT INTO channel_identities \
                         (id, channel_type, subject_id, display_name, avatar_url, user_id, metadata) \
                         VALUES (?1, ?2, ?3, ?4, NULL, NULL, ?5)",
                        params![id, ty, subject, name, attrs],
                    )
                    .map_err(backend)?;
                    Ok(ChannelIdentity {
                        id,
                        channel_type: ChannelType::new(&ty),
                        subject_id: subject,
                        display_name: name,
                        avatar_url: None,
                        user_id: None,
                        metadata: serde_json::from_str(&attrs).unwrap_or_default(),
                    })
                }
            }
        })
        .await
    }

    async fn update_identity_profile(
        &self,
        identity_id: &str,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<(), IdentityError> {
        let id = identity_id.to_string();
        let name = display_name.map(str::to_string);
        let avatar = avatar_url.map(str::to_string);
        self.with_conn(move |conn| {
            if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
                conn.execute(
                    "UPDATE channel_identities SET display_name = ?1 WHERE id = ?2",
                    params![name, id],
                )
                .map_err(backend)?;
            }
            if let Some(avatar) = avatar {
                conn.execute(
                    "UPDATE channel_identities SET avatar_url = ?1, \
                     metadata = json_set(metadata, '$.avatar_url', ?1) WHERE id = ?2",
                    params![avatar, id],
                )
                .map_err(backend)?;
            }
            Ok(())
        })
        .await
    }

    async fn find_identity(
        &self,
        channel_type: &ChannelType,
        subject_id: &str,
    ) -> Result<Option<ChannelIdentity>, IdentityError> {
        let ty = channel_type.as_str().to_string();
        let subject = subject_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM channel_identities WHERE channel_type = ?1 AND subject_id = ?2",
                params![ty, subject],
                row_to_identity,
            )
            .optional()
            .map_err(backend)
        })
        .await
    }

    async fn link_identity_to_user(
        &self,
        identity_id: &str,
        user_id: &str,
    ) -> Result<(), IdentityError> {
        let id = identity_id.to_string();
        let user = user_id.to_string();
        self.with_conn(move |conn| {
            let n = conn
                .execute(
                    "UPDATE channel_identities SET user_id = ?1 WHERE id = ?2",
                    params![user, id],
                )
                .map_err(backend)?;
            if n == 0 {
                return Err(IdentityError::NotFound(format!("identity {id}")));
            }
            Ok(())
        })
        .await
    }

    async fn find_live_bind_code(&self, token: &str) -> Result<Option<BindCode>, IdentityError> {
        let token = token.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT token, channel_type, bot_id, user_id, expires_at, consumed_at \
                 FROM bind_codes WHERE token = ?1 AND consumed_at IS NULL",
                params![token],
                |row| {
                    let ty: String = row.get(1)?;
                    let expires: String = row.get(4)?;
                    let consumed: Option<String> = row.get(5)?;
                    Ok(BindCode {
                        token: row.get(0)?,
                        channel_type: ChannelType::new(ty),
                        bot_id: row.get(2)?,
                        user_id: row.get(3)?,
                        expires_at: parse_ts(&expires),
                        consumed_at: consumed.as_deref().map(parse_ts),
                    })
                },
            )
            .optional()
            .map_err(backend)
        })
        .await
    }

    async fn consume_bind_code(&self, token: &str) -> Result<(), IdentityError> {
        let token = token.to_string();
        self.with_conn(move |conn| {
            let n = conn
                .execute(
                    "UPDATE bind_codes SET consumed_at = ?1 WHERE token = ?2",
                    params![Utc::now().to_rfc3339(), token],
                )
                .map_err(backend)?;
            if n == 0 {
                return Err(IdentityError::NotFound("bind code".into()));
            }
            Ok(())
        })
        .await
    }

    async fn find_preauth_key(&self, key: &str) -> Result<Option<PreauthKey>, IdentityError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT key, bot_id, expires_at, used_at FROM preauth_keys WHERE key = ?1",
                params![key],
                |row| {
                    let expires: String = row.get(2)?;
                    let used: Option<String> = row.get(3)?;
                    Ok(PreauthKey {
                        key: row.get(0)?,
                        bot_id: row.get(1)?,
                        expires_at: parse_ts(&expires),
                        used_at: used.as_deref().map(parse_ts),
                    })
                },
            )
            .optional()
            .map_err(backend)
        })
        .await
    }

    async fn mark_preauth_used(&self, key: &str) -> Result<(), IdentityError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let n = conn
                .execute(
                    "UPDATE preauth_keys SET used_at = ?1 WHERE key = ?2",
                    params![Utc::now().to_rfc3339(), key],
                )
                .map_err(backend)?;
            if n == 0 {
                return Err(IdentityError::NotFound("preauth key".into()));
            }
            Ok(())
        })
        .await
    }

    async fn bot_profile(&self, bot_id: &str) -> Result<Option<BotProfile>, IdentityError> {
        let bot = bot_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT bot_id, kind, owner_user_id, allow_guests FROM bot_profiles WHERE bot_id = ?1",
                params![bot],
                |row| {
                    let kind: String = row.get(1)?;
                    let allow: i64 = row.get(3)?;
                    Ok(BotProfile {
                        bot_id: row.get(0)?,
                        kind: if kind == "personal" {
                            crate::identity::BotKind::Personal
                        } else {
                            crate::identity::BotKind::Shared
                        },
                        owner_user_id: row.get(2)?,
                        allow_guests: allow != 0,
                    })
                },
            )
            .optional()
            .map_err(backend)
        })
        .await
    }

    async fn is_member(&self, bot_id: &str, user_id: &str) -> Result<bool, IdentityError> {
        let bot = bot_id.to_string();
        let user = user_id.to_string();
        self.with_conn(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM bot_members WHERE bot_id = ?1 AND user_id = ?2",
                    params![bot, user],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend)?;
            Ok(found.is_some())
        })
        .await
    }

    async fn upsert_member(&self, bot_id: &str, user_id: &str) -> Result<(), IdentityError> {
        let bot = bot_id.to_string();
        let user = user_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO bot_members (bot_id, user_id) VALUES (?1, ?2)",
                params![bot, user],
            )
            .map_err(backend)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn identity_upsert_and_link() {
        let file = NamedTempFile::new().unwrap();
        let store = SqliteIdentityStore::new(file.path()).unwrap();
        let ty = ChannelType::new("telegram");
        let a = store
            .upsert_channel_identity(&ty, "u-1", "Ada", &Map::new())
            .await
            .unwrap();
        let b = store
            .upsert_channel_identity(&ty, "u-1", "Ada Lovelace", &Map::new())
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.display_name, "Ada Lovelace");

        store.link_identity_to_user(&a.id, "user-1").await.unwrap();
        let found = store.find_identity(&ty, "u-1").await.unwrap().unwrap();
        assert_eq!(found.user_id.as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn bind_code_consumption_is_one_shot() {
        let file = NamedTempFile::new().unwrap();
        let store = SqliteIdentityStore::new(file.path()).unwrap();
        let code = BindCode {
            token: "tok-1".into(),
            channel_type: ChannelType::new("telegram"),
            bot_id: "b1".into(),
            user_id: "user-1".into(),
            expires_at: Utc::now() + chrono::Duration::minutes(10),
            consumed_at: None,
        };
        store.put_bind_code(code).await.unwrap();
        assert!(store.find_live_bind_code("tok-1").await.unwrap().is_some());
        store.consume_bind_code("tok-1").await.unwrap();
        assert!(store.find_live_bind_code("tok-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn membership_round_trip() {
        let file = NamedTempFile::new().unwrap();
        let store = SqliteIdentityStore::new(file.path()).unwrap();
        assert!(!store.is_member("b1", "u1").await.unwrap());
        store.upsert_member("b1", "u1").await.unwrap();
        store.upsert_member("b1", "u1").await.unwrap();
        assert!(store.is_member("b1", "u1").await.unwrap());
    }
}
