use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use crate::jobs::JobTarget;
use crate::sqlite::configure_connection;

use super::{IngestError, IngestResult, SessionStatus, UploadSession, UploadedPart};

const SESSION_SCHEMA: &str = include_str!("../../../sql/sessions.sql");

#[derive(Debug, Clone)]
pub struct SqliteSessionStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteSessionStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteSessionStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> IngestResult<SqliteSessionStore> {
        let path = self.path.ok_or(IngestError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteSessionStore { path, flags })
    }
}

/// Durable upload-session table. Sessions outlive process restarts so a
/// client can resume a multi-hour upload against the same part handles.
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteSessionStore {
    pub fn builder() -> SqliteSessionStoreBuilder {
        SqliteSessionStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> IngestResult<Self> {
        SqliteSessionStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> IngestResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            IngestError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| IngestError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> IngestResult<()> {
        let conn = self.open()?;
        conn.execute_batch(SESSION_SCHEMA)?;
        Ok(())
    }

    pub fn create_session(&self, session: &UploadSession) -> IngestResult<()> {
        let conn = self.open()?;
        let target = serde_json::to_string(&session.target)
            .map_err(|err| IngestError::Validation(err.to_string()))?;
        conn.execute(
            "INSERT INTO upload_sessions (
                session_id, target, object_key, upload_ref, total_size,
                part_size, expected_parts, content_type, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &session.session_id,
                target,
                &session.object_key,
                &session.upload_ref,
                session.total_size as i64,
                session.part_size as i64,
                session.expected_parts as i64,
                &session.content_type,
                session.status.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn fetch(&self, session_id: &str) -> IngestResult<Option<UploadSession>> {
        let conn = self.open()?;
        let session = conn
            .query_row(
                "SELECT * FROM upload_sessions WHERE session_id = ?1",
                [session_id],
                session_from_row,
            )
            .optional()?;
        let Some(mut session) = session else {
            return Ok(None);
        };
        session.uploaded_parts = self.fetch_parts(&conn, session_id)?;
        Ok(Some(session))
    }

    fn fetch_parts(&self, conn: &Connection, session_id: &str) -> IngestResult<Vec<UploadedPart>> {
        let mut stmt = conn.prepare(
            "SELECT part_number, checksum FROM upload_parts
             WHERE session_id = ?1 ORDER BY part_number ASC",
        )?;
        let mut rows = stmt.query([session_id])?;
        let mut parts = Vec::new();
        while let Some(row) = rows.next()? {
            parts.push(UploadedPart {
                part_number: row.get::<_, i64>(0)? as u32,
                checksum: row.get(1)?,
            });
        }
        Ok(parts)
    }

    /// Records a part acknowledgement. Re-acking a part number replaces the
    /// prior checksum so a client can retry a single part.
    pub fn upsert_part(
        &self,
        session_id: &str,
        part_number: u32,
        checksum: &str,
    ) -> IngestResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO upload_parts (session_id, part_number, checksum)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id, part_number) DO UPDATE SET
                checksum = excluded.checksum,
                acked_at = CURRENT_TIMESTAMP",
            params![session_id, part_number as i64, checksum],
        )?;
        conn.execute(
            "UPDATE upload_sessions SET updated_at = CURRENT_TIMESTAMP WHERE session_id = ?1",
            [session_id],
        )?;
        Ok(())
    }

    pub fn mark_status(&self, session_id: &str, status: SessionStatus) -> IngestResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE upload_sessions SET status = ?1, updated_at = CURRENT_TIMESTAMP
             WHERE session_id = ?2",
            params![status.as_str(), session_id],
        )?;
        if affected == 0 {
            return Err(IngestError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Uploading sessions idle since before `cutoff`. The cutoff is applied
    /// after parsing: the column is CURRENT_TIMESTAMP-written, and mixing
    /// that format with bound datetimes in a SQL comparison misorders them.
    pub fn list_stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> IngestResult<Vec<UploadSession>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM upload_sessions
             WHERE status = 'uploading'
             ORDER BY updated_at ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next()? {
            let session = session_from_row(row)?;
            let idle = session
                .updated_at
                .or(session.created_at)
                .map(|at| at < cutoff)
                .unwrap_or(true);
            if idle {
                sessions.push(session);
            }
            if sessions.len() >= limit {
                break;
            }
        }
        for session in &mut sessions {
            session.uploaded_parts = self.fetch_parts(&conn, &session.session_id)?;
        }
        Ok(sessions)
    }

    pub fn list_recent(&self, limit: usize) -> IngestResult<Vec<UploadSession>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM upload_sessions ORDER BY created_at DESC, session_id DESC LIMIT ?1",
        )?;
        let mut rows = stmt.query([limit as i64])?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next()? {
            sessions.push(session_from_row(row)?);
        }
        Ok(sessions)
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<UploadSession> {
    let target_raw: String = row.get("target")?;
    let target: JobTarget = serde_json::from_str(&target_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(UploadSession {
        session_id: row.get("session_id")?,
        target,
        object_key: row.get("object_key")?,
        upload_ref: row.get("upload_ref")?,
        total_size: row.get::<_, i64>("total_size")? as u64,
        part_size: row.get::<_, i64>("part_size")? as u64,
        expected_parts: row.get::<_, i64>("expected_parts")? as u32,
        content_type: row.get("content_type")?,
        status: row
            .get::<_, String>("status")?
            .parse()
            .unwrap_or(SessionStatus::Uploading),
        uploaded_parts: Vec::new(),
        created_at: parse_timestamp(row.get("created_at")?),
        updated_at: parse_timestamp(row.get("updated_at")?),
    })
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Option<DateTime<Utc>> {
    value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
}
