use anyhow::{anyhow, Result};
use rand::RngCore;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::profile::CustomerProfile;

const MAX_SESSION_ID_LEN: usize = 64;

/// A profile as recorded for a kiosk session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredProfile {
    pub id: i64,
    pub session_id: String,
    pub created_at: u64,
    /// Hex SHA-256 of the stored JSON payload.
    pub digest: String,
    pub profile: CustomerProfile,
}

pub trait ProfileStore: Send {
    fn record_profile(&mut self, session_id: &str, profile: &CustomerProfile)
        -> Result<StoredProfile>;

    /// Most recent profile for the session.
    fn latest_profile(&mut self, session_id: &str) -> Result<Option<StoredProfile>>;

    /// Up to `limit` profiles for the session, newest first.
    fn profiles_for_session(&mut self, session_id: &str, limit: usize)
        -> Result<Vec<StoredProfile>>;
}

/// Session ids are 1-64 characters of `[A-Za-z0-9_:-]`.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
        return Err(anyhow!(
            "session id must be 1-{} characters",
            MAX_SESSION_ID_LEN
        ));
    }
    if !session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '-'))
    {
        return Err(anyhow!("session id contains unsupported characters"));
    }
    Ok(())
}

pub fn profile_digest(payload_json: &str) -> String {
    hex::encode(Sha256::digest(payload_json.as_bytes()))
}

/// Fresh shared-cache in-memory database URI, unique per call.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:kiosk_vision_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

pub struct SqliteProfileStore {
    conn: Connection,
}

impl SqliteProfileStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS profiles (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              session_id TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              payload_json TEXT NOT NULL,
              digest TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_profiles_session ON profiles(session_id, id);
            "#,
        )?;
        Ok(())
    }

    fn row_to_stored(
        id: i64,
        session_id: String,
        created_at: i64,
        payload_json: String,
        digest: String,
    ) -> Result<StoredProfile> {
        if profile_digest(&payload_json) != digest {
            return Err(anyhow!("corrupt profile row {}: digest mismatch", id));
        }
        let created_at = u64::try_from(created_at)
            .map_err(|_| anyhow!("corrupt profile row {}: created_at", id))?;
        Ok(StoredProfile {
            id,
            session_id,
            created_at,
            digest,
            profile: serde_json::from_str(&payload_json)?,
        })
    }
}

impl ProfileStore for SqliteProfileStore {
    fn record_profile(
        &mut self,
        session_id: &str,
        profile: &CustomerProfile,
    ) -> Result<StoredProfile> {
        validate_session_id(session_id)?;
        let created_at = now_s()?;
        let payload_json = serde_json::to_string(profile)?;
        let digest = profile_digest(&payload_json);
        self.conn.execute(
            r#"
            INSERT INTO profiles(session_id, created_at, payload_json, digest)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                session_id,
                i64::try_from(created_at).map_err(|_| anyhow!("clock exceeds i64 range"))?,
                payload_json,
                digest
            ],
        )?;
        Ok(StoredProfile {
            id: self.conn.last_insert_rowid(),
            session_id: session_id.to_string(),
            created_at,
            digest,
            profile: profile.clone(),
        })
    }

    fn latest_profile(&mut self, session_id: &str) -> Result<Option<StoredProfile>> {
        validate_session_id(session_id)?;
        let row = self
            .conn
            .query_row(
                r#"
                SELECT id, session_id, created_at, payload_json, digest
                FROM profiles WHERE session_id = ?1 ORDER BY id DESC LIMIT 1
                "#,
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(id, sid, created_at, payload, digest)| {
            Self::row_to_stored(id, sid, created_at, payload, digest)
        })
        .transpose()
    }

    fn profiles_for_session(
        &mut self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredProfile>> {
        validate_session_id(session_id)?;
        let rows = {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT id, session_id, created_at, payload_json, digest
                FROM profiles WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2
                "#,
            )?;
            let mut rows = stmt.query(params![session_id, limit as i64])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ));
            }
            out
        };
        rows.into_iter()
            .map(|(id, sid, created_at, payload, digest)| {
                Self::row_to_stored(id, sid, created_at, payload, digest)
            })
            .collect()
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryProfileStore {
    entries: Vec<StoredProfile>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ProfileStore for InMemoryProfileStore {
    fn record_profile(
        &mut self,
        session_id: &str,
        profile: &CustomerProfile,
    ) -> Result<StoredProfile> {
        validate_session_id(session_id)?;
        let payload_json = serde_json::to_string(profile)?;
        let stored = StoredProfile {
            id: self.entries.len() as i64 + 1,
            session_id: session_id.to_string(),
            created_at: now_s()?,
            digest: profile_digest(&payload_json),
            profile: profile.clone(),
        };
        self.entries.push(stored.clone());
        Ok(stored)
    }

    fn latest_profile(&mut self, session_id: &str) -> Result<Option<StoredProfile>> {
        validate_session_id(session_id)?;
        Ok(self
            .entries
            .iter()
            .rev()
            .find(|e| e.session_id == session_id)
            .cloned())
    }

    fn profiles_for_session(
        &mut self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredProfile>> {
        validate_session_id(session_id)?;
        Ok(self
            .entries
            .iter()
            .rev()
            .filter(|e| e.session_id == session_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_rules() {
        assert!(validate_session_id("kiosk-7:session_42").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("has space").is_err());
        assert!(validate_session_id("../etc").is_err());
        assert!(validate_session_id(&"a".repeat(65)).is_err());
    }

    #[test]
    fn shared_memory_uris_are_unique() {
        assert_ne!(shared_memory_uri(), shared_memory_uri());
        assert!(shared_memory_uri().starts_with("file:"));
    }
}
