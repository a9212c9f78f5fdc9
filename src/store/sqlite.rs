//! SQLite-backed job store.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;

use super::{JobStore, StoreError};
use crate::types::{
    millis_to_rfc3339, now_millis, CleanupRun, Job, NewJob, PortResult, ScanQuery, ScanRecord,
    ScanStats,
};

const JOB_COLUMNS: &str =
    "id, target, start_port, end_port, interval_seconds, active, created_at";
const SCAN_COLUMNS: &str = "id, target, port, is_open, duration_ms, created_at";

/// Durable store on a single SQLite file, schema applied on open.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{path_str}"))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Private in-memory database; lives as long as the store.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn port_from(row: &SqliteRow, column: &str) -> Result<u16, StoreError> {
    let raw: i64 = row.try_get(column)?;
    u16::try_from(raw).map_err(|_| StoreError::Corrupt(format!("{column} out of range: {raw}")))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    let interval: i64 = row.try_get("interval_seconds")?;
    Ok(Job {
        id: row.try_get("id")?,
        target: row.try_get("target")?,
        start_port: port_from(row, "start_port")?,
        end_port: port_from(row, "end_port")?,
        interval_seconds: u64::try_from(interval)
            .map_err(|_| StoreError::Corrupt(format!("interval_seconds: {interval}")))?,
        active: row.try_get::<i64, _>("active")? != 0,
        created_at: millis_to_rfc3339(row.try_get("created_at")?),
    })
}

fn scan_from_row(row: &SqliteRow) -> Result<ScanRecord, StoreError> {
    Ok(ScanRecord {
        id: row.try_get("id")?,
        target: row.try_get("target")?,
        port: port_from(row, "port")?,
        is_open: row.try_get::<i64, _>("is_open")? != 0,
        duration_ms: row.try_get::<i64, _>("duration_ms")?.max(0) as u64,
        created_at: millis_to_rfc3339(row.try_get("created_at")?),
    })
}

fn cleanup_from_row(row: &SqliteRow) -> Result<CleanupRun, StoreError> {
    Ok(CleanupRun {
        id: row.try_get("id")?,
        deleted_count: row.try_get::<i64, _>("deleted_count")?.max(0) as u64,
        run_time_ms: row.try_get::<i64, _>("run_time_ms")?.max(0) as u64,
        ran_at: millis_to_rfc3339(row.try_get("created_at")?),
    })
}

/// `%fragment%` with LIKE wildcards in `fragment` matched literally (`ESCAPE '\'`).
fn like_contains(fragment: &str) -> String {
    let mut pattern = String::with_capacity(fragment.len() + 2);
    pattern.push('%');
    for c in fragment.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

const INSERT_SCAN: &str = r#"
    INSERT INTO scans (target, port, is_open, duration_ms, created_at)
    VALUES (?, ?, ?, ?, ?)
"#;

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert_job(&self, job: NewJob) -> Result<Job, StoreError> {
        let created = now_millis();
        let res = sqlx::query(
            r#"
            INSERT INTO jobs (target, start_port, end_port, interval_seconds, active, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.target)
        .bind(i64::from(job.start_port))
        .bind(i64::from(job.end_port))
        .bind(job.interval_seconds as i64)
        .bind(i64::from(job.active))
        .bind(created)
        .execute(&self.pool)
        .await?;

        Ok(Job {
            id: res.last_insert_rowid(),
            target: job.target,
            start_port: job.start_port,
            end_port: job.end_port,
            interval_seconds: job.interval_seconds,
            active: job.active,
            created_at: millis_to_rfc3339(created),
        })
    }

    async fn select_active_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE active = 1 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn select_job_by_id(&self, id: i64) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        job_from_row(&row)
    }

    async fn set_active(&self, id: i64, active: bool) -> Result<(), StoreError> {
        let res = sqlx::query("UPDATE jobs SET active = ? WHERE id = ?")
            .bind(i64::from(active))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    async fn delete_job(&self, id: i64) -> Result<(), StoreError> {
        let res = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn insert_scan_result(
        &self,
        target: &str,
        result: &PortResult,
    ) -> Result<(), StoreError> {
        sqlx::query(INSERT_SCAN)
            .bind(target)
            .bind(i64::from(result.port))
            .bind(i64::from(result.is_open))
            .bind(result.duration_ms as i64)
            .bind(now_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_scan_batch(
        &self,
        target: &str,
        results: &[PortResult],
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Transaction(format!("begin: {e}")))?;
        let created = now_millis();
        for r in results {
            sqlx::query(INSERT_SCAN)
                .bind(target)
                .bind(i64::from(r.port))
                .bind(i64::from(r.is_open))
                .bind(r.duration_ms as i64)
                .bind(created)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Transaction(format!("port {}: {e}", r.port)))?;
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::Transaction(format!("commit: {e}")))?;
        Ok(())
    }

    async fn list_scans(&self, query: &ScanQuery) -> Result<Vec<ScanRecord>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {SCAN_COLUMNS} FROM scans WHERE 1=1"));
        if let Some(t) = query.target.as_deref().filter(|t| !t.is_empty()) {
            qb.push(" AND target LIKE ")
                .push_bind(like_contains(t))
                .push(" ESCAPE '\\'");
        }
        if query.open_only {
            qb.push(" AND is_open = 1");
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(query.limit));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(scan_from_row).collect()
    }

    async fn scan_stats(&self) -> Result<ScanStats, StoreError> {
        let (total, open, avg): (i64, i64, f64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(is_open), 0),
                   COALESCE(AVG(duration_ms), 0.0)
            FROM scans
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(ScanStats {
            total_scans: total.max(0) as u64,
            open_ports: open.max(0) as u64,
            avg_scan_time_ms: avg,
        })
    }

    async fn delete_scan(&self, id: i64) -> Result<(), StoreError> {
        let res = sqlx::query("DELETE FROM scans WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("scan {id}")));
        }
        Ok(())
    }

    async fn delete_scans_for_target(&self, target: &str) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM scans WHERE target = ?")
            .bind(target)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn delete_closed_scans_before(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM scans WHERE is_open = 0 AND created_at < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn insert_cleanup_log(
        &self,
        deleted_count: u64,
        run_time_ms: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO cleanup_logs (deleted_count, run_time_ms, created_at) VALUES (?, ?, ?)",
        )
        .bind(deleted_count as i64)
        .bind(run_time_ms as i64)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_cleanup_logs(&self, limit: u32) -> Result<Vec<CleanupRun>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, deleted_count, run_time_ms, created_at
            FROM cleanup_logs
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(cleanup_from_row).collect()
    }
}
