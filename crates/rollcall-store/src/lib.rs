//! rollcall-store: SQLite persistence for enrolled people and attendance.
//!
//! Tables: `NewPerson` (profiles and enrollment face), `attendance`
//! (append-only log) and `latest_attendance` (one row per person).

use chrono::{DateTime, SecondsFormat, Utc};
use rollcall_core::{AttendanceStore, Identity, Observation, StoreError};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA_VERSION: u32 = 1;
const INITIAL_SCHEMA: &str = include_str!("sql/001_initial.sql");

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("could not create database directory {path}: {source}")]
    CreateDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid timestamp {value:?} in database: {source}")]
    Timestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Database file under a data home.
pub fn db_path_in(data_home: &Path) -> std::path::PathBuf {
    data_home.join("rollcall/attendance.db")
}

/// `$XDG_DATA_HOME/rollcall/attendance.db`, falling back to `~/.local/share`.
pub fn default_db_path() -> std::path::PathBuf {
    db_path_in(&rollcall_core::data_home(|key| std::env::var(key).ok()))
}

/// An enrolled person.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Person {
    pub national_code: String,
    pub first_name: String,
    pub last_name: String,
    /// PNG-encoded grayscale face.
    pub image: Vec<u8>,
}

impl Person {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRow {
    pub id: i64,
    pub national_code: String,
    pub checkin_at: DateTime<Utc>,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceRow {
    pub national_code: String,
    pub first_name: String,
    pub last_name: String,
    pub last_seen: DateTime<Utc>,
    pub location: String,
}

/// Handle to the attendance database. Cheap to clone; all clones share one
/// background connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create the database file, creating its directory if needed.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| DbError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path).await?;
        // WAL lets report readers run while the daemon writes.
        conn.call(|conn| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
            Ok(())
        })
        .await?;
        let store = Self { conn };
        store.migrate().await?;
        tracing::info!(path = %path.display(), "attendance store opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory().await?,
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Bring the schema up to date. Returns the version found before migrating.
    async fn migrate(&self) -> Result<u32> {
        let version = self
            .conn
            .call(|conn| {
                let version: u32 = conn.query_row("SELECT user_version FROM pragma_user_version", [], |row| row.get(0))?;
                if version < SCHEMA_VERSION {
                    let tx = conn.transaction()?;
                    tx.execute_batch(INITIAL_SCHEMA)?;
                    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
                    tx.commit()?;
                }
                Ok(version)
            })
            .await?;
        if version < SCHEMA_VERSION {
            tracing::info!(from = version, to = SCHEMA_VERSION, "store schema migrated");
        }
        Ok(version)
    }

    /// Insert a person unless the national code is already enrolled.
    ///
    /// Returns `false` when the existing row was kept.
    pub async fn enroll(&self, person: Person) -> Result<bool> {
        let inserted = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "INSERT OR IGNORE INTO NewPerson (national_code, first_name, last_name, image) VALUES (?1, ?2, ?3, ?4)",
                    params![person.national_code, person.first_name, person.last_name, person.image],
                )?;
                Ok(changed == 1)
            })
            .await?;
        Ok(inserted)
    }

    pub async fn person(&self, identity: &Identity) -> Result<Option<Person>> {
        let code = identity.as_str().to_string();
        let person = self
            .conn
            .call(move |conn| {
                let person = conn
                    .query_row(
                        "SELECT national_code, first_name, last_name, image FROM NewPerson WHERE national_code = ?1",
                        [&code],
                        person_from_row,
                    )
                    .optional()?;
                Ok(person)
            })
            .await?;
        Ok(person)
    }

    /// Every enrolled person, for training the recognizer at startup.
    pub async fn load_people(&self) -> Result<Vec<Person>> {
        let people = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT national_code, first_name, last_name, image FROM NewPerson ORDER BY national_code",
                )?;
                let people = stmt.query_map([], person_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(people)
            })
            .await?;
        Ok(people)
    }

    pub async fn record_event(&self, observation: &Observation) -> Result<i64> {
        let code = observation.identity.as_str().to_string();
        let at = to_text(observation.observed_at);
        let location = observation.location.clone();
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance (national_code, checkin_time, location) VALUES (?1, ?2, ?3)",
                    params![code, at, location],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    /// Upsert the latest-seen row. An older timestamp never overwrites a newer one.
    pub async fn record_presence(&self, observation: &Observation) -> Result<()> {
        let code = observation.identity.as_str().to_string();
        let at = to_text(observation.observed_at);
        let location = observation.location.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO latest_attendance (national_code, first_name, last_name, last_seen, location)
                     VALUES (
                        ?1,
                        COALESCE((SELECT first_name FROM NewPerson WHERE national_code = ?1), ''),
                        COALESCE((SELECT last_name FROM NewPerson WHERE national_code = ?1), ''),
                        ?2, ?3
                     )
                     ON CONFLICT (national_code) DO UPDATE SET
                        first_name = excluded.first_name,
                        last_name = excluded.last_name,
                        last_seen = excluded.last_seen,
                        location = excluded.location
                     WHERE excluded.last_seen >= latest_attendance.last_seen",
                    params![code, at, location],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Attendance log, newest first.
    pub async fn list_events(&self, identity: Option<&Identity>, limit: usize) -> Result<Vec<AttendanceRow>> {
        let code = identity.map(|i| i.as_str().to_string());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let raw = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, national_code, checkin_time, location FROM attendance
                     WHERE ?1 IS NULL OR national_code = ?1
                     ORDER BY checkin_time DESC, id DESC
                     LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![code, limit], |row| {
                        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?, row.get::<_, String>(3)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        raw.into_iter()
            .map(|(id, national_code, at, location)| {
                Ok(AttendanceRow {
                    id,
                    national_code,
                    checkin_at: from_text(at)?,
                    location,
                })
            })
            .collect()
    }

    /// Latest-seen table, most recent first.
    pub async fn list_presence(&self) -> Result<Vec<PresenceRow>> {
        let raw = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT national_code, first_name, last_name, last_seen, location FROM latest_attendance
                     ORDER BY last_seen DESC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        raw.into_iter()
            .map(|(national_code, first_name, last_name, seen, location)| {
                Ok(PresenceRow {
                    national_code,
                    first_name,
                    last_name,
                    last_seen: from_text(seen)?,
                    location,
                })
            })
            .collect()
    }

    /// Close the background connection, flushing anything pending.
    pub async fn close(self) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}

impl AttendanceStore for SqliteStore {
    async fn append_event(&self, observation: &Observation) -> std::result::Result<(), StoreError> {
        self.record_event(observation).await?;
        Ok(())
    }

    async fn upsert_presence(&self, observation: &Observation) -> std::result::Result<(), StoreError> {
        Ok(self.record_presence(observation).await?)
    }
}

fn person_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Person> {
    Ok(Person {
        national_code: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        image: row.get(3)?,
    })
}

/// Fixed-width UTC so text order matches time order.
fn to_text(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn from_text(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|source| DbError::Timestamp { value, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn obs(code: &str, loc: &str, secs: i64) -> Observation {
        Observation::new(Identity::new(code).unwrap(), loc, at(secs))
    }

    fn person(code: &str, first: &str, last: &str) -> Person {
        Person {
            national_code: code.into(),
            first_name: first.into(),
            last_name: last.into(),
            image: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn test_enroll_keeps_existing_person() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        assert!(store.enroll(person("1", "Sara", "Ahmadi")).await.unwrap());
        assert!(!store.enroll(person("1", "Other", "Name")).await.unwrap());

        let people = store.load_people().await.unwrap();
        assert_eq!(people.len(), 1);
        assert_eq!(people[0].display_name(), "Sara Ahmadi");

        let found = store.person(&Identity::new("1").unwrap()).await.unwrap();
        assert_eq!(found.map(|p| p.image), Some(vec![1, 2, 3]));
        assert!(store.person(&Identity::new("2").unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_events_are_appended_and_listed_newest_first() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.append_event(&obs("1", "Lobby", 0)).await.unwrap();
        store.append_event(&obs("2", "Gate", 10)).await.unwrap();
        store.append_event(&obs("1", "Gate", 20)).await.unwrap();

        let all = store.list_events(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].checkin_at, at(20));

        let one = store.list_events(Some(&Identity::new("1").unwrap()), 10).await.unwrap();
        assert_eq!(one.iter().map(|r| r.location.as_str()).collect::<Vec<_>>(), vec!["Gate", "Lobby"]);

        assert_eq!(store.list_events(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_presence_is_one_row_per_person_with_latest_sighting() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.enroll(person("1", "Sara", "Ahmadi")).await.unwrap();

        store.upsert_presence(&obs("1", "Lobby", 0)).await.unwrap();
        store.upsert_presence(&obs("1", "Gate", 30)).await.unwrap();
        // Late write with an older timestamp must not win.
        store.upsert_presence(&obs("1", "Lobby", 10)).await.unwrap();

        let rows = store.list_presence().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].first_name, "Sara");
        assert_eq!(rows[0].location, "Gate");
        assert_eq!(rows[0].last_seen, at(30));
    }

    #[tokio::test]
    async fn test_presence_without_profile_has_empty_names() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.upsert_presence(&obs("9", "Lobby", 0)).await.unwrap();
        let rows = store.list_presence().await.unwrap();
        assert_eq!(rows[0].national_code, "9");
        assert_eq!(rows[0].first_name, "");
    }

    #[tokio::test]
    async fn test_migration_is_idempotent() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        assert_eq!(store.migrate().await.unwrap(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_closed_store_reports_failure() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let handle = store.clone();
        store.close().await.unwrap();
        assert!(handle.append_event(&obs("1", "Lobby", 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_file_store_uses_wal() {
        let dir = std::env::temp_dir().join(format!("rollcall-store-{}", std::process::id()));
        let store = SqliteStore::open(&dir.join("nested/attendance.db")).await.unwrap();
        let mode = store
            .conn
            .call(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))?))
            .await
            .unwrap();
        assert_eq!(mode, "wal");
        store.close().await.unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
