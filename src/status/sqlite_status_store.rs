use super::models::*;
use super::schema::STATUS_VERSIONED_SCHEMAS;
use super::{PropertyStore, StatusStore, StoreTransaction};
use crate::sqlite_persistence::open_versioned;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{info, warn};

const RECORD_COLUMNS: &str = "id, job_guid, parent_guid, container_id, provider, status, info, \
     data_url, description, file_path, email, had_error, checkpoint, active_task, created_at, \
     modified_at";

/// SQLite backed [`StatusStore`] and [`PropertyStore`].
///
/// The connection sits behind a reentrant mutex. An open transaction keeps
/// the lock, so calls from the owning thread join it while other threads
/// wait for the commit.
pub struct SqliteStatusStore {
    conn: ReentrantMutex<Connection>,
    tx_depth: AtomicUsize,
    rollback_only: AtomicBool,
}

impl SqliteStatusStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        info!("Opening status database at {:?}", path);
        let mut conn = Connection::open(path).context("Failed to open status database")?;
        open_versioned(&mut conn, STATUS_VERSIONED_SCHEMAS, "status")?;
        Ok(Self::from_connection(conn))
    }

    pub fn in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        open_versioned(&mut conn, STATUS_VERSIONED_SCHEMAS, "status")?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: ReentrantMutex::new(conn),
            tx_depth: AtomicUsize::new(0),
            rollback_only: AtomicBool::new(false),
        }
    }

    fn begin_transaction(&self) -> Result<SqliteTransaction<'_>> {
        let guard = self.conn.lock();
        if self.tx_depth.load(Ordering::SeqCst) == 0 {
            guard
                .execute_batch("BEGIN IMMEDIATE")
                .context("Failed to begin status transaction")?;
            self.rollback_only.store(false, Ordering::SeqCst);
        }
        self.tx_depth.fetch_add(1, Ordering::SeqCst);
        Ok(SqliteTransaction {
            store: self,
            guard: Some(guard),
        })
    }

    fn format_datetime(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Reads a TEXT column through `parse`, turning a value it rejects into a
    /// conversion error instead of a made-up one.
    fn parse_column<T>(
        row: &rusqlite::Row,
        column: &str,
        parse: impl FnOnce(&str) -> std::result::Result<T, String>,
    ) -> rusqlite::Result<T> {
        let raw: String = row.get(column)?;
        parse(&raw).map_err(|e| {
            let idx = row.as_ref().column_index(column).unwrap_or_default();
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
        })
    }

    fn parse_datetime(s: &str) -> std::result::Result<DateTime<Utc>, String> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| format!("invalid timestamp '{}': {}", s, e))
    }

    fn parse_status(s: &str) -> std::result::Result<JobStatus, String> {
        JobStatus::parse(s).ok_or_else(|| format!("unknown job status '{}'", s))
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<StatusRecord> {
        Ok(StatusRecord {
            row_id: row.get("id")?,
            job_guid: row.get("job_guid")?,
            parent_guid: row.get("parent_guid")?,
            container_id: row.get("container_id")?,
            provider: row.get("provider")?,
            status: Self::parse_column(row, "status", Self::parse_status)?,
            info: row.get("info")?,
            data_url: row.get("data_url")?,
            description: row.get("description")?,
            file_path: row.get("file_path")?,
            email: row.get("email")?,
            had_error: row.get::<_, i64>("had_error")? != 0,
            checkpoint: row.get("checkpoint")?,
            active_task: row.get("active_task")?,
            created_at: Self::parse_column(row, "created_at", Self::parse_datetime)?,
            modified_at: Self::parse_column(row, "modified_at", Self::parse_datetime)?,
        })
    }

    fn query_one(conn: &Connection, status_ref: &StatusRef) -> Result<Option<StatusRecord>> {
        let record = match status_ref {
            StatusRef::RowId(id) => conn
                .query_row(
                    &format!("SELECT {} FROM job_status WHERE id = ?1", RECORD_COLUMNS),
                    params![id],
                    Self::row_to_record,
                )
                .optional()?,
            StatusRef::Guid(guid) => conn
                .query_row(
                    &format!(
                        "SELECT {} FROM job_status WHERE job_guid = ?1 ORDER BY id DESC LIMIT 1",
                        RECORD_COLUMNS
                    ),
                    params![guid],
                    Self::row_to_record,
                )
                .optional()?,
        };
        Ok(record)
    }

    /// Resolves the parent GUID to store, keeping `current` when `proposed`
    /// names a job this store does not know.
    fn resolve_parent(
        conn: &Connection,
        job_guid: &str,
        current: Option<String>,
        proposed: Option<&str>,
    ) -> Result<Option<String>> {
        let Some(proposed) = proposed else {
            return Ok(current);
        };
        if current.as_deref() == Some(proposed) {
            return Ok(current);
        }
        let known = Self::query_one(conn, &StatusRef::Guid(proposed.to_string()))?.is_some();
        if known {
            Ok(Some(proposed.to_string()))
        } else {
            warn!(
                "Ignoring unresolvable parent {} for job {}, keeping {:?}",
                proposed, job_guid, current
            );
            Ok(current)
        }
    }
}

fn truncated(value: Option<&str>, max: usize) -> Option<String> {
    value.map(|v| truncate_chars(v, max))
}

struct SqliteTransaction<'a> {
    store: &'a SqliteStatusStore,
    guard: Option<ReentrantMutexGuard<'a, Connection>>,
}

impl SqliteTransaction<'_> {
    fn finish(&mut self, commit: bool) -> Result<()> {
        let Some(guard) = self.guard.take() else {
            return Ok(());
        };
        let store = self.store;
        if !commit {
            store.rollback_only.store(true, Ordering::SeqCst);
        }
        if store.tx_depth.fetch_sub(1, Ordering::SeqCst) > 1 {
            return Ok(());
        }
        if store.rollback_only.swap(false, Ordering::SeqCst) {
            guard.execute_batch("ROLLBACK")?;
            if commit {
                bail!("Status transaction was rolled back by a nested scope");
            }
            return Ok(());
        }
        if let Err(e) = guard.execute_batch("COMMIT") {
            let _ = guard.execute_batch("ROLLBACK");
            return Err(e).context("Failed to commit status transaction");
        }
        Ok(())
    }
}

impl StoreTransaction for SqliteTransaction<'_> {
    fn commit(mut self: Box<Self>) -> Result<()> {
        self.finish(true)
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish(false) {
            warn!("Failed to roll back status transaction: {:#}", e);
        }
    }
}

impl StatusStore for SqliteStatusStore {
    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>> {
        Ok(Box::new(self.begin_transaction()?))
    }

    fn insert(&self, record: NewStatusRecord) -> Result<StatusRecord> {
        let conn = self.conn.lock();
        if Self::query_one(&conn, &StatusRef::Guid(record.job_guid.clone()))?.is_some() {
            bail!("Status record for job {} already exists", record.job_guid);
        }
        let now = Self::format_datetime(&Utc::now());
        let active_task = if record.status == JobStatus::Complete {
            None
        } else {
            record.active_task
        };
        let checkpoint = if record.status == JobStatus::Complete {
            None
        } else {
            record.checkpoint
        };
        conn.execute(
            "INSERT INTO job_status (job_guid, parent_guid, container_id, provider, status, info, \
             data_url, description, file_path, email, had_error, checkpoint, active_task, \
             created_at, modified_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?12, ?13, ?13)",
            params![
                record.job_guid,
                record.parent_guid,
                record.container_id,
                record.provider,
                truncate_chars(record.status.as_str(), MAX_STATUS_LEN),
                truncated(record.info.as_deref(), MAX_INFO_LEN),
                truncated(record.data_url.as_deref(), MAX_PATH_LEN),
                truncated(record.description.as_deref(), MAX_DESCRIPTION_LEN),
                truncated(record.file_path.as_deref(), MAX_PATH_LEN),
                truncated(record.email.as_deref(), MAX_EMAIL_LEN),
                checkpoint,
                active_task,
                now,
            ],
        )?;
        let row_id = conn.last_insert_rowid();
        Self::query_one(&conn, &StatusRef::RowId(row_id))?
            .with_context(|| format!("Inserted status record {} not found", row_id))
    }

    fn get(&self, status_ref: &StatusRef) -> Result<Option<StatusRecord>> {
        let conn = self.conn.lock();
        Self::query_one(&conn, status_ref)
    }

    fn update(&self, status_ref: &StatusRef, update: StatusUpdate) -> Result<StatusRecord> {
        let conn = self.conn.lock();
        let mut record = Self::query_one(&conn, status_ref)?
            .with_context(|| format!("Status record for {} not found", status_ref))?;

        if let Some(guid) = non_blank(&update.job_guid) {
            record.job_guid = guid.to_string();
        }
        record.parent_guid = Self::resolve_parent(
            &conn,
            &record.job_guid,
            record.parent_guid.take(),
            non_blank(&update.parent_guid),
        )?;
        if let Some(provider) = non_blank(&update.provider) {
            record.provider = provider.to_string();
        }
        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(info) = non_blank(&update.info) {
            record.info = truncated(Some(info), MAX_INFO_LEN);
        }
        if let Some(data_url) = non_blank(&update.data_url) {
            record.data_url = truncated(Some(data_url), MAX_PATH_LEN);
        }
        if let Some(description) = non_blank(&update.description) {
            record.description = truncated(Some(description), MAX_DESCRIPTION_LEN);
        }
        if let Some(file_path) = non_blank(&update.file_path) {
            record.file_path = truncated(Some(file_path), MAX_PATH_LEN);
        }
        if let Some(email) = non_blank(&update.email) {
            record.email = truncated(Some(email), MAX_EMAIL_LEN);
        }
        if let Some(had_error) = update.had_error {
            record.had_error = had_error;
        }
        if let Some(checkpoint) = update.checkpoint {
            record.checkpoint = checkpoint;
        }
        if let Some(active_task) = update.active_task {
            record.active_task = active_task;
        }
        if record.status == JobStatus::Complete {
            record.checkpoint = None;
            record.active_task = None;
        }
        record.modified_at = Utc::now();

        conn.execute(
            "UPDATE job_status SET job_guid = ?1, parent_guid = ?2, provider = ?3, status = ?4, \
             info = ?5, data_url = ?6, description = ?7, file_path = ?8, email = ?9, \
             had_error = ?10, checkpoint = ?11, active_task = ?12, modified_at = ?13 \
             WHERE id = ?14",
            params![
                record.job_guid,
                record.parent_guid,
                record.provider,
                truncate_chars(record.status.as_str(), MAX_STATUS_LEN),
                record.info,
                record.data_url,
                record.description,
                record.file_path,
                record.email,
                record.had_error as i64,
                record.checkpoint,
                record.active_task,
                Self::format_datetime(&record.modified_at),
                record.row_id,
            ],
        )?;
        Ok(record)
    }

    fn list(&self, filter: &StatusFilter) -> Result<Vec<StatusRecord>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();

        if !filter.statuses.is_empty() {
            let placeholders = filter
                .statuses
                .iter()
                .map(|status| {
                    args.push(status.as_str().to_string());
                    format!("?{}", args.len())
                })
                .collect::<Vec<_>>()
                .join(", ");
            clauses.push(format!("status IN ({})", placeholders));
        }
        if let Some(container) = filter.container.as_deref().filter(|c| *c != "/") {
            let container = container.trim_end_matches('/');
            args.push(container.to_string());
            args.push(format!("{}/%", container));
            clauses.push(format!(
                "(container_id = ?{} OR container_id LIKE ?{})",
                args.len() - 1,
                args.len()
            ));
        }
        if let Some(from) = &filter.modified_from {
            args.push(Self::format_datetime(from));
            clauses.push(format!("modified_at >= ?{}", args.len()));
        }
        if let Some(before) = &filter.modified_before {
            args.push(Self::format_datetime(before));
            clauses.push(format!("modified_at < ?{}", args.len()));
        }

        let mut sql = format!("SELECT {} FROM job_status", RECORD_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id ASC");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(args.iter()), Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn count_incomplete_children(&self, parent_guid: &str, container_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM job_status \
             WHERE parent_guid = ?1 AND container_id = ?2 AND status != ?3",
            params![parent_guid, container_id, JobStatus::Complete.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl PropertyStore for SqliteStatusStore {
    fn get_property(&self, scope: &str, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM properties WHERE scope = ?1 AND key = ?2",
                params![scope, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_property(&self, scope: &str, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        let now = Self::format_datetime(&Utc::now());
        let updated = conn.execute(
            "UPDATE properties SET value = ?1, updated_at = ?2 WHERE scope = ?3 AND key = ?4",
            params![value, now, scope, key],
        )?;
        if updated == 0 {
            conn.execute(
                "INSERT INTO properties (scope, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![scope, key, value, now],
            )?;
        }
        Ok(())
    }

    fn delete_property(&self, scope: &str, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM properties WHERE scope = ?1 AND key = ?2",
            params![scope, key],
        )?;
        Ok(deleted > 0)
    }

    fn list_properties(&self, scope: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT key, value FROM properties WHERE scope = ?1 ORDER BY key")?;
        let entries = stmt
            .query_map(params![scope], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}
