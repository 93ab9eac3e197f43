//! SQLite-backed Category Store.
//!
//! Grounded in the teacher's `memory::SqliteMemoryStore`: a single
//! `Connection` behind `Arc<Mutex<_>>`, schema/migrations in a sibling
//! module, and row-mapping helpers. Since Store operations are suspension
//! points per spec §5, each public method hands the blocking `rusqlite`
//! work to `spawn_blocking` rather than holding the async runtime hostage.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::schema::initialize_schema;
use super::types::{CategoryRow, CodePatch, DataSource, Level, RowFilter, RowPatch, RowStatus, VersionHistoryEntry};

/// Persistence contract for versioned hierarchical classification rows.
#[async_trait]
pub trait CategoryStore: Send + Sync {
    async fn ingest_batch(&self, task_id: Uuid, batch_id: Uuid, rows: Vec<CategoryRow>) -> Result<()>;
    async fn update_by_code(&self, task_id: Uuid, code: &str, patch: RowPatch) -> Result<()>;
    async fn batch_update_by_code(&self, task_id: Uuid, patches: Vec<CodePatch>) -> Result<()>;
    async fn get_current(&self, task_id: Uuid, filter: RowFilter) -> Result<Vec<CategoryRow>>;
    async fn get_children(&self, task_id: Uuid, batch_id: Option<Uuid>, parent_code: &str) -> Result<Vec<CategoryRow>>;
    async fn version_history(&self, task_id: Uuid) -> Result<Vec<VersionHistoryEntry>>;

    /// Not part of §4.1's public operation list, but needed to persist the
    /// Task entity of §3: set/read the owning task's terminal status.
    async fn set_task_status(&self, task_id: Uuid, status: &str, error: Option<&str>) -> Result<()>;
    async fn task_status(&self, task_id: Uuid) -> Result<Option<String>>;
}

fn row_to_category_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CategoryRow> {
    let task_id: String = row.get("task_id")?;
    let upload_batch_id: String = row.get("upload_batch_id")?;
    let level: String = row.get("level")?;
    let status: String = row.get("status")?;
    let data_source: String = row.get("data_source")?;
    let upload_timestamp: String = row.get("upload_timestamp")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let is_current: i64 = row.get("is_current")?;

    Ok(CategoryRow {
        task_id: Uuid::parse_str(&task_id).unwrap_or_default(),
        code: row.get("code")?,
        name: row.get("name")?,
        level: Level::parse(&level).unwrap_or(Level::Detail),
        parent_code: row.get("parent_code")?,
        status: RowStatus::parse(&status).unwrap_or(RowStatus::ExcelParsed),
        data_source: DataSource::parse(&data_source).unwrap_or(DataSource::Excel),
        pdf_info: row.get("pdf_info")?,
        llm_enhancements: row.get("llm_enhancements")?,
        upload_batch_id: Uuid::parse_str(&upload_batch_id).unwrap_or_default(),
        upload_timestamp: parse_timestamp(&upload_timestamp),
        is_current: is_current != 0,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub struct SqliteCategoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCategoryStore {
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::storage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::storage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite connection mutex poisoned");
            f(&conn)
        })
        .await
        .map_err(|e| Error::Internal(format!("blocking task panicked: {e}")))?
        .map_err(|e| Error::storage(e.to_string()))
    }

    /// Codes among `codes` that currently have a live (`is_current = 1`) row
    /// for `task_id`. Used to detect a missing patch target before opening a
    /// write transaction, so a miss surfaces as `Error::NotFound` rather than
    /// the generic storage-fault path.
    async fn existing_current_codes(&self, task_id: Uuid, codes: &[String]) -> Result<HashSet<String>> {
        let codes = codes.to_vec();
        self.with_conn(move |conn| {
            let mut found = HashSet::new();
            for code in &codes {
                let exists: Option<i64> = conn
                    .query_row(
                        "SELECT id FROM category_rows WHERE task_id = ?1 AND code = ?2 AND is_current = 1",
                        params![task_id.to_string(), code],
                        |r| r.get(0),
                    )
                    .optional()?;
                if exists.is_some() {
                    found.insert(code.clone());
                }
            }
            Ok(found)
        })
        .await
    }
}

#[async_trait]
impl CategoryStore for SqliteCategoryStore {
    async fn ingest_batch(&self, task_id: Uuid, batch_id: Uuid, rows: Vec<CategoryRow>) -> Result<()> {
        self.with_conn(move |conn| {
            // Idempotency: a prior call with the same batch_id already
            // inserted rows for it; treat a repeat call as a no-op.
            let existing: i64 = conn.query_row(
                "SELECT COUNT(*) FROM category_rows WHERE task_id = ?1 AND upload_batch_id = ?2",
                params![task_id.to_string(), batch_id.to_string()],
                |r| r.get(0),
            )?;
            if existing > 0 {
                return Ok(());
            }

            let tx = conn.unchecked_transaction()?;

            tx.execute(
                "UPDATE category_rows SET is_current = 0, updated_at = datetime('now')
                 WHERE task_id = ?1 AND is_current = 1",
                params![task_id.to_string()],
            )?;

            for row in &rows {
                tx.execute(
                    "INSERT INTO category_rows
                        (task_id, code, name, level, parent_code, status, data_source,
                         pdf_info, llm_enhancements, upload_batch_id, upload_timestamp, is_current)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1)",
                    params![
                        row.task_id.to_string(),
                        row.code,
                        row.name,
                        row.level.as_str(),
                        row.parent_code,
                        row.status.as_str(),
                        row.data_source.as_str(),
                        row.pdf_info,
                        row.llm_enhancements,
                        batch_id.to_string(),
                        row.upload_timestamp.to_rfc3339(),
                    ],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn update_by_code(&self, task_id: Uuid, code: &str, patch: RowPatch) -> Result<()> {
        let code = code.to_string();
        self.batch_update_by_code(task_id, vec![CodePatch { code, patch }]).await
    }

    async fn batch_update_by_code(&self, task_id: Uuid, patches: Vec<CodePatch>) -> Result<()> {
        let codes: Vec<String> = patches.iter().map(|p| p.code.clone()).collect();
        let existing = self.existing_current_codes(task_id, &codes).await?;
        if let Some(missing) = codes.iter().find(|c| !existing.contains(c.as_str())) {
            return Err(Error::not_found(task_id.to_string(), missing.clone()));
        }

        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;

            for CodePatch { code, patch } in &patches {
                let current_id: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM category_rows WHERE task_id = ?1 AND code = ?2 AND is_current = 1",
                        params![task_id.to_string(), code],
                        |r| r.get(0),
                    )
                    .optional()?;

                let Some(id) = current_id else {
                    // Already verified to exist above; a row vanishing here
                    // means a concurrent writer raced us. Roll back whole-hog
                    // rather than leave partial visibility (spec §4.1).
                    drop(tx);
                    return Err(rusqlite::Error::QueryReturnedNoRows);
                };

                if let Some(name) = &patch.name {
                    tx.execute(
                        "UPDATE category_rows SET name = ?1, updated_at = datetime('now') WHERE id = ?2",
                        params![name, id],
                    )?;
                }
                if let Some(status) = &patch.status {
                    tx.execute(
                        "UPDATE category_rows SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                        params![status.as_str(), id],
                    )?;
                }
                if let Some(data_source) = &patch.data_source {
                    tx.execute(
                        "UPDATE category_rows SET data_source = ?1, updated_at = datetime('now') WHERE id = ?2",
                        params![data_source.as_str(), id],
                    )?;
                }
                if let Some(pdf_info) = &patch.pdf_info {
                    tx.execute(
                        "UPDATE category_rows SET pdf_info = ?1, updated_at = datetime('now') WHERE id = ?2",
                        params![pdf_info, id],
                    )?;
                }
                if let Some(llm_enhancements) = &patch.llm_enhancements {
                    tx.execute(
                        "UPDATE category_rows SET llm_enhancements = ?1, updated_at = datetime('now') WHERE id = ?2",
                        params![llm_enhancements, id],
                    )?;
                }
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_current(&self, task_id: Uuid, filter: RowFilter) -> Result<Vec<CategoryRow>> {
        self.with_conn(move |conn| {
            let mut stmt = if filter.status.is_some() {
                conn.prepare(
                    "SELECT * FROM category_rows WHERE task_id = ?1 AND is_current = 1 AND status = ?2 ORDER BY code ASC",
                )?
            } else {
                conn.prepare(
                    "SELECT * FROM category_rows WHERE task_id = ?1 AND is_current = 1 ORDER BY code ASC",
                )?
            };

            let rows = if let Some(status) = filter.status {
                stmt.query_map(params![task_id.to_string(), status.as_str()], row_to_category_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            } else {
                stmt.query_map(params![task_id.to_string()], row_to_category_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };

            Ok(rows)
        })
        .await
    }

    async fn get_children(&self, task_id: Uuid, batch_id: Option<Uuid>, parent_code: &str) -> Result<Vec<CategoryRow>> {
        let parent_code = parent_code.to_string();
        self.with_conn(move |conn| {
            let rows = if let Some(batch_id) = batch_id {
                let mut stmt = conn.prepare(
                    "SELECT * FROM category_rows WHERE task_id = ?1 AND upload_batch_id = ?2 AND parent_code = ?3 ORDER BY code ASC",
                )?;
                stmt.query_map(
                    params![task_id.to_string(), batch_id.to_string(), parent_code],
                    row_to_category_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?
            } else {
                let mut stmt = conn.prepare(
                    "SELECT * FROM category_rows WHERE task_id = ?1 AND is_current = 1 AND parent_code = ?2 ORDER BY code ASC",
                )?;
                stmt.query_map(params![task_id.to_string(), parent_code], row_to_category_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };
            Ok(rows)
        })
        .await
    }

    async fn version_history(&self, task_id: Uuid) -> Result<Vec<VersionHistoryEntry>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT upload_batch_id, MIN(upload_timestamp) as ts, COUNT(*) as cnt, MAX(is_current) as cur
                 FROM category_rows WHERE task_id = ?1
                 GROUP BY upload_batch_id
                 ORDER BY ts DESC",
            )?;
            let rows = stmt
                .query_map(params![task_id.to_string()], |r| {
                    let batch_id: String = r.get(0)?;
                    let ts: String = r.get(1)?;
                    let cnt: i64 = r.get(2)?;
                    let cur: i64 = r.get(3)?;
                    Ok(VersionHistoryEntry {
                        batch_id: Uuid::parse_str(&batch_id).unwrap_or_default(),
                        timestamp: parse_timestamp(&ts),
                        row_count: cnt as usize,
                        is_current: cur != 0,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn set_task_status(&self, task_id: Uuid, status: &str, error: Option<&str>) -> Result<()> {
        let status = status.to_string();
        let error = error.map(|s| s.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, status, error) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status, error = excluded.error, updated_at = datetime('now')",
                params![task_id.to_string(), status, error],
            )?;
            Ok(())
        })
        .await
    }

    async fn task_status(&self, task_id: Uuid) -> Result<Option<String>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT status FROM tasks WHERE id = ?1",
                params![task_id.to_string()],
                |r| r.get(0),
            )
            .optional()
        })
        .await
    }
}
