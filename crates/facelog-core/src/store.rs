//! SQLite-backed face registry and deduplicated recognition log.
//!
//! A single [`Storage`] owns the connection for the lifetime of a session;
//! [`FaceStore`] and [`RecognitionLog`] are borrowed views over it.

use crate::types::{Embedding, KnownFace, Registry};
use chrono::{NaiveDateTime, SubsecRound};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Timestamp format of the `logs.timestamp` column and the flat log file.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Default minimum spacing between two logged events for one identity.
pub const DEFAULT_BUFFER_SECS: i64 = 300;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS faces (
        name     TEXT NOT NULL,
        encoding BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS logs (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        name      TEXT,
        timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
    );
    CREATE INDEX IF NOT EXISTS idx_faces_name ON faces(name);
    CREATE INDEX IF NOT EXISTS idx_logs_name_timestamp ON logs(name, timestamp);
";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("corrupt encoding for {name}: {len} bytes is not a whole number of f64 values")]
    CorruptEncoding { name: String, len: usize },
    #[error("unparsable log timestamp {0:?}")]
    BadTimestamp(String),
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Owned storage connection plus the path of the flat text log.
pub struct Storage {
    conn: Connection,
    log_file: PathBuf,
}

impl Storage {
    /// Open (creating if needed) the database at `db_path` and ensure the schema exists.
    pub fn open(db_path: &Path, log_file: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        let conn = Connection::open(db_path)?;
        tracing::debug!(path = %db_path.display(), "opened face database");
        Self::with_connection(conn, log_file)
    }

    /// In-memory database; the flat log still goes to `log_file`.
    pub fn open_in_memory(log_file: &Path) -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?, log_file)
    }

    fn with_connection(conn: Connection, log_file: &Path) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            log_file: log_file.to_path_buf(),
        })
    }

    pub fn faces(&self) -> FaceStore<'_> {
        FaceStore { conn: &self.conn }
    }

    pub fn log(&self) -> RecognitionLog<'_> {
        RecognitionLog {
            conn: &self.conn,
            log_file: &self.log_file,
            buffer_secs: DEFAULT_BUFFER_SECS,
        }
    }

    /// Close the connection, surfacing any error sqlite reports on close.
    pub fn close(self) -> Result<(), StorageError> {
        self.conn.close().map_err(|(_, e)| StorageError::Sqlite(e))
    }
}

/// Registry of (name, encoding) rows. Rows are append-only.
pub struct FaceStore<'a> {
    conn: &'a Connection,
}

impl FaceStore<'_> {
    /// All rows in insertion order.
    pub fn load_all(&self) -> Result<Vec<KnownFace>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, encoding FROM faces ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut faces = Vec::new();
        for row in rows {
            let (name, blob) = row?;
            let embedding = Embedding::from_bytes(&blob).ok_or_else(|| {
                StorageError::CorruptEncoding {
                    name: name.clone(),
                    len: blob.len(),
                }
            })?;
            faces.push(KnownFace { name, embedding });
        }
        Ok(faces)
    }

    /// Load all rows as a [`Registry`] snapshot.
    pub fn registry(&self) -> Result<Registry, StorageError> {
        self.load_all().map(Registry::new)
    }

    /// Append a row. Never deduplicates or overwrites.
    pub fn insert(&self, name: &str, embedding: &Embedding) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO faces (name, encoding) VALUES (?1, ?2)",
            params![name, embedding.to_bytes()],
        )?;
        Ok(())
    }

    /// Case-sensitive exact-match existence check.
    pub fn name_exists(&self, name: &str) -> Result<bool, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM faces WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Distinct names with the number of stored encodings each, sorted by name.
    pub fn names(&self) -> Result<Vec<(String, usize)>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, COUNT(*) FROM faces GROUP BY name ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }
}

/// A persisted recognition event.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionEvent {
    pub id: i64,
    pub name: String,
    pub timestamp: NaiveDateTime,
}

/// Deduplicated event log: `logs` table plus an append-only text file.
pub struct RecognitionLog<'a> {
    conn: &'a Connection,
    log_file: &'a Path,
    buffer_secs: i64,
}

impl RecognitionLog<'_> {
    /// Override the dedup buffer (seconds).
    pub fn with_buffer_secs(mut self, buffer_secs: i64) -> Self {
        self.buffer_secs = buffer_secs;
        self
    }

    /// Record that `name` was seen at `now` (local wall-clock time).
    ///
    /// Returns `false` without writing anything when the most recent event
    /// for `name` is less than the buffer old.
    pub fn record(&self, name: &str, now: NaiveDateTime) -> Result<bool, StorageError> {
        let now = now.trunc_subsecs(0);

        if let Some(last) = self.last_seen(name)? {
            let elapsed = (now - last).num_seconds();
            if elapsed < self.buffer_secs {
                tracing::debug!(name, elapsed, "duplicate recognition suppressed");
                return Ok(false);
            }
        }

        // Commit only after the flat-log line is written.
        let stamp = now.format(TIMESTAMP_FORMAT).to_string();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO logs (name, timestamp) VALUES (?1, ?2)",
            params![name, stamp],
        )?;
        self.append_line(&format!("{stamp} - {name} recognized"))?;
        tx.commit()?;

        tracing::info!(name, timestamp = %stamp, "recognition logged");
        Ok(true)
    }

    /// Timestamp of the most recent event for `name`, if any.
    pub fn last_seen(&self, name: &str) -> Result<Option<NaiveDateTime>, StorageError> {
        let stamp: Option<String> = self
            .conn
            .query_row(
                "SELECT timestamp FROM logs WHERE name = ?1 ORDER BY timestamp DESC, id DESC LIMIT 1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        stamp.map(|s| parse_timestamp(&s)).transpose()
    }

    /// Most recent events across all names, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<RecognitionEvent>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, timestamp FROM logs ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, name, stamp) = row?;
            events.push(RecognitionEvent {
                id,
                name,
                timestamp: parse_timestamp(&stamp)?,
            });
        }
        Ok(events)
    }

    fn append_line(&self, line: &str) -> Result<(), StorageError> {
        let path = self.log_file;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| StorageError::io(path, e))?;
        writeln!(file, "{line}").map_err(|e| StorageError::io(path, e))
    }
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime, StorageError> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .map_err(|_| StorageError::BadTimestamp(s.to_string()))
}
