//! SQLite-backed tracking store
//!
//! Timestamps are stored as RFC 3339 text with microsecond precision in UTC,
//! so lexicographic order matches chronological order. Enums are stored as
//! their stable integer codes.

use crate::error::{Result, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use flowtrail_core::{
    Category, Counter, Flow, FlowFilter, FlowStatus, LogEntry, LogLevel, Metadata, NewProcess,
    Process, ProcessStats, TrackingStore,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PROCESS_COLUMNS: &str =
    "id, identifier, name, category, active, description, created_at, updated_at";

const FLOW_COLUMNS: &str = "id, process_id, correlation_id, status, started_at, finished_at, \
     duration_ms, metadata, error_message, error_backtrace, progress, total_items, ok_count, \
     ko_count, skip_count, triggered_by, created_at, updated_at";

const LOG_COLUMNS: &str = "id, flow_id, level, message, context, logged_at";

/// SQLite-backed store for processes, flows and their log entries
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and bootstrap the schema.
    ///
    /// URL format: `sqlite:///path/to/db.sqlite?mode=rwc` or `sqlite::memory:`
    pub async fn new(url: &str) -> Result<Self> {
        info!("Initializing SQLite tracking store: {}", url);

        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // every connection to an in-memory url opens its own database
        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new().max_connections(5).connect_with(options).await?
        };

        let store = Self { pool };
        store.initialize_schema().await?;

        info!("SQLite tracking store initialized");
        Ok(store)
    }

    /// Create an in-memory store for testing
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn initialize_schema(&self) -> Result<()> {
        debug!("Initializing database schema");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processes (
                id TEXT PRIMARY KEY,
                identifier TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                category INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                description TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                process_id TEXT NOT NULL REFERENCES processes(id) ON DELETE CASCADE,
                correlation_id TEXT NOT NULL,
                status INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                duration_ms INTEGER,
                metadata TEXT NOT NULL DEFAULT '{}',
                error_message TEXT,
                error_backtrace TEXT,
                progress REAL NOT NULL DEFAULT 0,
                total_items INTEGER,
                ok_count INTEGER NOT NULL DEFAULT 0,
                ko_count INTEGER NOT NULL DEFAULT 0,
                skip_count INTEGER NOT NULL DEFAULT 0,
                triggered_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS log_entries (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL REFERENCES flows(id) ON DELETE CASCADE,
                level INTEGER NOT NULL,
                message TEXT NOT NULL,
                context TEXT NOT NULL DEFAULT '{}',
                logged_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_flows_created ON flows(created_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_flows_process ON flows(process_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_log_entries_flow ON log_entries(flow_id)")
            .execute(&self.pool)
            .await?;

        debug!("Database schema initialized");
        Ok(())
    }

    async fn upsert_process(&self, new: NewProcess) -> Result<Process> {
        let candidate = new.into_process();

        // the unique identifier makes concurrent creators converge on one row
        let inserted = sqlx::query(
            r#"
            INSERT INTO processes
                (id, identifier, name, category, active, description, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(identifier) DO NOTHING
            "#,
        )
        .bind(candidate.id.to_string())
        .bind(&candidate.identifier)
        .bind(&candidate.name)
        .bind(candidate.category.code())
        .bind(candidate.active)
        .bind(&candidate.description)
        .bind(ts(&candidate.created_at))
        .bind(ts(&candidate.updated_at))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            debug!("Created process {} ({})", candidate.identifier, candidate.id);
        }

        self.fetch_process_by_identifier(&candidate.identifier)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("process {}", candidate.identifier)))
    }

    async fn fetch_process(&self, id: Uuid) -> Result<Option<Process>> {
        let row = sqlx::query(&format!("SELECT {} FROM processes WHERE id = ?", PROCESS_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_process).transpose()
    }

    async fn fetch_process_by_identifier(&self, identifier: &str) -> Result<Option<Process>> {
        let sql = format!("SELECT {} FROM processes WHERE identifier = ?", PROCESS_COLUMNS);
        let row = sqlx::query(&sql).bind(identifier).fetch_optional(&self.pool).await?;

        row.as_ref().map(row_to_process).transpose()
    }

    async fn fetch_processes(&self) -> Result<Vec<Process>> {
        let sql = format!("SELECT {} FROM processes ORDER BY name ASC", PROCESS_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        rows.iter().map(row_to_process).collect()
    }

    async fn update_process_active(&self, id: Uuid, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE processes SET active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(ts(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("process {}", id)));
        }
        Ok(())
    }

    async fn remove_process(&self, id: Uuid) -> Result<bool> {
        let id = id.to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM log_entries WHERE flow_id IN (SELECT id FROM flows WHERE process_id = ?)",
        )
        .bind(&id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM flows WHERE process_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM processes WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        if deleted > 0 {
            info!("Deleted process {} with its flows", id);
        }
        Ok(deleted > 0)
    }

    async fn compute_stats(&self, process_id: Uuid) -> Result<ProcessStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN status = ? THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN status = ? THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(SUM(CASE WHEN status = ? THEN 1 ELSE 0 END), 0) AS running,
                COALESCE(SUM(CASE WHEN status = ? THEN 1 ELSE 0 END), 0) AS skipped,
                AVG(CASE WHEN status = ? THEN duration_ms END) AS avg_duration_ms,
                MAX(started_at) AS last_run_at
            FROM flows
            WHERE process_id = ?
            "#,
        )
        .bind(FlowStatus::Completed.code())
        .bind(FlowStatus::Failed.code())
        .bind(FlowStatus::Running.code())
        .bind(FlowStatus::Skipped.code())
        .bind(FlowStatus::Completed.code())
        .bind(process_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        let last_run_at: Option<String> = row.try_get("last_run_at")?;
        Ok(ProcessStats {
            total: row.try_get::<i64, _>("total")? as u64,
            completed: row.try_get::<i64, _>("completed")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
            running: row.try_get::<i64, _>("running")? as u64,
            skipped: row.try_get::<i64, _>("skipped")? as u64,
            avg_duration_ms: row.try_get("avg_duration_ms")?,
            last_run_at: last_run_at.as_deref().map(parse_ts).transpose()?,
        })
    }

    async fn insert_flow_row(&self, flow: &Flow) -> Result<()> {
        let metadata_json = serde_json::to_string(&flow.metadata)?;

        sqlx::query(&format!(
            "INSERT INTO flows ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            FLOW_COLUMNS
        ))
        .bind(flow.id.to_string())
        .bind(flow.process_id.to_string())
        .bind(&flow.correlation_id)
        .bind(flow.status.code())
        .bind(ts(&flow.started_at))
        .bind(flow.finished_at.as_ref().map(ts))
        .bind(flow.duration_ms)
        .bind(&metadata_json)
        .bind(&flow.error_message)
        .bind(&flow.error_backtrace)
        .bind(flow.progress)
        .bind(flow.total_items)
        .bind(flow.ok_count)
        .bind(flow.ko_count)
        .bind(flow.skip_count)
        .bind(&flow.triggered_by)
        .bind(ts(&flow.created_at))
        .bind(ts(&flow.updated_at))
        .execute(&self.pool)
        .await?;

        debug!("Inserted flow {} for process {}", flow.id, flow.process_id);
        Ok(())
    }

    async fn update_flow_row(&self, flow: &Flow) -> Result<()> {
        let metadata_json = serde_json::to_string(&flow.metadata)?;

        let result = sqlx::query(
            r#"
            UPDATE flows
            SET progress = ?, total_items = ?, metadata = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(flow.progress)
        .bind(flow.total_items)
        .bind(&metadata_json)
        .bind(ts(&flow.updated_at))
        .bind(flow.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!("Flow {} not found for update", flow.id);
            return Err(StoreError::NotFound(format!("flow {}", flow.id)));
        }
        Ok(())
    }

    async fn finish_flow_row(&self, flow: &Flow) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE flows
            SET status = ?, finished_at = ?, duration_ms = ?,
                error_message = ?, error_backtrace = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(flow.status.code())
        .bind(flow.finished_at.as_ref().map(ts))
        .bind(flow.duration_ms)
        .bind(&flow.error_message)
        .bind(&flow.error_backtrace)
        .bind(ts(&flow.updated_at))
        .bind(flow.id.to_string())
        .bind(FlowStatus::Running.code())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            debug!("Flow {} finished as {}", flow.id, flow.status);
            return Ok(true);
        }
        match self.fetch_flow(flow.id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("flow {}", flow.id))),
        }
    }

    async fn bump_counter(&self, flow_id: Uuid, counter: Counter) -> Result<i64> {
        let column = match counter {
            Counter::Ok => "ok_count",
            Counter::Ko => "ko_count",
            Counter::Skip => "skip_count",
        };
        let sql = format!(
            "UPDATE flows SET {c} = {c} + 1, updated_at = ? WHERE id = ? RETURNING {c}",
            c = column
        );

        let value: Option<i64> = sqlx::query_scalar(&sql)
            .bind(ts(&Utc::now()))
            .bind(flow_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        value.ok_or_else(|| StoreError::NotFound(format!("flow {}", flow_id)))
    }

    async fn fetch_flow(&self, id: Uuid) -> Result<Option<Flow>> {
        let row = sqlx::query(&format!("SELECT {} FROM flows WHERE id = ?", FLOW_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_flow).transpose()
    }

    async fn fetch_flows(&self, filter: &FlowFilter) -> Result<Vec<Flow>> {
        // LIMIT -1 means no limit in SQLite
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);

        let rows = sqlx::query(&format!(
            "SELECT {} FROM flows \
             WHERE (?1 IS NULL OR process_id = ?1) AND (?2 IS NULL OR status = ?2) \
             ORDER BY started_at DESC, rowid DESC LIMIT ?3",
            FLOW_COLUMNS
        ))
        .bind(filter.process_id.map(|id| id.to_string()))
        .bind(filter.status.map(FlowStatus::code))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_flow).collect()
    }

    async fn insert_log_row(&self, entry: &LogEntry) -> Result<()> {
        let context_json = serde_json::to_string(&entry.context)?;

        sqlx::query(&format!("INSERT INTO log_entries ({}) VALUES (?, ?, ?, ?, ?, ?)", LOG_COLUMNS))
            .bind(entry.id.to_string())
            .bind(entry.flow_id.to_string())
            .bind(entry.level.code())
            .bind(&entry.message)
            .bind(&context_json)
            .bind(ts(&entry.logged_at))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn fetch_log_entries(
        &self,
        flow_id: Uuid,
        min_level: Option<LogLevel>,
    ) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM log_entries WHERE flow_id = ? AND level >= ? \
             ORDER BY logged_at ASC, rowid ASC",
            LOG_COLUMNS
        ))
        .bind(flow_id.to_string())
        .bind(min_level.unwrap_or(LogLevel::Debug).code())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_log_entry).collect()
    }

    async fn delete_old_flows(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff_str = ts(&cutoff);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM log_entries WHERE flow_id IN (SELECT id FROM flows WHERE created_at < ?)",
        )
            .bind(&cutoff_str)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM flows WHERE created_at < ?")
            .bind(&cutoff_str)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        info!("Deleted {} flows created before {}", deleted, cutoff_str);
        Ok(deleted)
    }
}

#[async_trait]
impl TrackingStore for SqliteStore {
    async fn find_or_create_process(&self, new: NewProcess) -> flowtrail_core::Result<Process> {
        Ok(self.upsert_process(new).await?)
    }

    async fn get_process(&self, id: Uuid) -> flowtrail_core::Result<Option<Process>> {
        Ok(self.fetch_process(id).await?)
    }

    async fn get_process_by_identifier(
        &self,
        identifier: &str,
    ) -> flowtrail_core::Result<Option<Process>> {
        Ok(self.fetch_process_by_identifier(identifier).await?)
    }

    async fn list_processes(&self) -> flowtrail_core::Result<Vec<Process>> {
        Ok(self.fetch_processes().await?)
    }

    async fn set_process_active(&self, id: Uuid, active: bool) -> flowtrail_core::Result<()> {
        Ok(self.update_process_active(id, active).await?)
    }

    async fn delete_process(&self, id: Uuid) -> flowtrail_core::Result<bool> {
        Ok(self.remove_process(id).await?)
    }

    async fn process_stats(&self, process_id: Uuid) -> flowtrail_core::Result<ProcessStats> {
        Ok(self.compute_stats(process_id).await?)
    }

    async fn insert_flow(&self, flow: &Flow) -> flowtrail_core::Result<()> {
        Ok(self.insert_flow_row(flow).await?)
    }

    async fn update_flow(&self, flow: &Flow) -> flowtrail_core::Result<()> {
        Ok(self.update_flow_row(flow).await?)
    }

    async fn finish_flow(&self, flow: &Flow) -> flowtrail_core::Result<bool> {
        Ok(self.finish_flow_row(flow).await?)
    }

    async fn increment_counter(
        &self,
        flow_id: Uuid,
        counter: Counter,
    ) -> flowtrail_core::Result<i64> {
        Ok(self.bump_counter(flow_id, counter).await?)
    }

    async fn get_flow(&self, id: Uuid) -> flowtrail_core::Result<Option<Flow>> {
        Ok(self.fetch_flow(id).await?)
    }

    async fn list_flows(&self, filter: &FlowFilter) -> flowtrail_core::Result<Vec<Flow>> {
        Ok(self.fetch_flows(filter).await?)
    }

    async fn insert_log_entry(&self, entry: &LogEntry) -> flowtrail_core::Result<()> {
        Ok(self.insert_log_row(entry).await?)
    }

    async fn list_log_entries(
        &self,
        flow_id: Uuid,
        min_level: Option<LogLevel>,
    ) -> flowtrail_core::Result<Vec<LogEntry>> {
        Ok(self.fetch_log_entries(flow_id, min_level).await?)
    }

    async fn delete_flows_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> flowtrail_core::Result<u64> {
        Ok(self.delete_old_flows(cutoff).await?)
    }
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", s, e)))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("uuid '{}': {}", s, e)))
}

fn parse_metadata(s: &str) -> Result<Metadata> {
    Ok(serde_json::from_str(s)?)
}

fn row_to_process(row: &SqliteRow) -> Result<Process> {
    let id: String = row.try_get("id")?;
    let category: i64 = row.try_get("category")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Process {
        id: parse_uuid(&id)?,
        identifier: row.try_get("identifier")?,
        name: row.try_get("name")?,
        category: Category::from_code(category)
            .ok_or_else(|| StoreError::Corrupt(format!("category code {}", category)))?,
        active: row.try_get("active")?,
        description: row.try_get("description")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn row_to_flow(row: &SqliteRow) -> Result<Flow> {
    let id: String = row.try_get("id")?;
    let process_id: String = row.try_get("process_id")?;
    let status: i64 = row.try_get("status")?;
    let started_at: String = row.try_get("started_at")?;
    let finished_at: Option<String> = row.try_get("finished_at")?;
    let metadata: String = row.try_get("metadata")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Flow {
        id: parse_uuid(&id)?,
        process_id: parse_uuid(&process_id)?,
        correlation_id: row.try_get("correlation_id")?,
        status: FlowStatus::from_code(status)
            .ok_or_else(|| StoreError::Corrupt(format!("flow status code {}", status)))?,
        started_at: parse_ts(&started_at)?,
        finished_at: finished_at.as_deref().map(parse_ts).transpose()?,
        duration_ms: row.try_get("duration_ms")?,
        metadata: parse_metadata(&metadata)?,
        error_message: row.try_get("error_message")?,
        error_backtrace: row.try_get("error_backtrace")?,
        progress: row.try_get("progress")?,
        total_items: row.try_get("total_items")?,
        ok_count: row.try_get("ok_count")?,
        ko_count: row.try_get("ko_count")?,
        skip_count: row.try_get("skip_count")?,
        triggered_by: row.try_get("triggered_by")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn row_to_log_entry(row: &SqliteRow) -> Result<LogEntry> {
    let id: String = row.try_get("id")?;
    let flow_id: String = row.try_get("flow_id")?;
    let level: i64 = row.try_get("level")?;
    let context: String = row.try_get("context")?;
    let logged_at: String = row.try_get("logged_at")?;

    Ok(LogEntry {
        id: parse_uuid(&id)?,
        flow_id: parse_uuid(&flow_id)?,
        level: LogLevel::from_code(level)
            .ok_or_else(|| StoreError::Corrupt(format!("log level code {}", level)))?,
        message: row.try_get("message")?,
        context: parse_metadata(&context)?,
        logged_at: parse_ts(&logged_at)?,
    })
}
