use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    Row, Sqlite, Transaction,
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
};
use tracing::{debug, warn};

use super::{
    record::{ProcessingRecord, ProcessingStatus, ProcessingSummary},
    schema::SCHEMA,
    statement::{SqlValue, Statement},
    store::{StoreTransaction, TransactionalStore},
};
use crate::error::StoreError;

/// 基于 `sqlx` 连接池的 SQLite 存储。
///
/// - 内存库（`sqlite::memory:`）每个连接都是独立数据库，因此固定为单连接；
/// - 文件库开启 WAL，读者在写事务提交前只能看到旧数据。
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)
            .map_err(StoreError::Connect)?
            .create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        }
        let mut pool_options = SqlitePoolOptions::new().max_connections(4);
        if in_memory {
            // 连接被回收即丢失整个库。
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(StoreError::Connect)?;
        debug!(url, "storage connected");
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    /// 底层连接池，供统计查询与测试直接使用。
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 幂等建表。
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// 各状态的分区计数，每个分区只取最新一条审计记录。
    pub async fn processing_summary(&self) -> Result<ProcessingSummary, StoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS partitions, COALESCE(SUM(records_processed), 0) AS records
             FROM processing_log
             WHERE id IN (SELECT MAX(id) FROM processing_log GROUP BY domain, server, period)
             GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summary = ProcessingSummary::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let partitions = row.try_get::<i64, _>("partitions")?.max(0) as u64;
            let records = row.try_get::<i64, _>("records")?.max(0) as u64;
            match status.parse::<ProcessingStatus>() {
                Ok(ProcessingStatus::Completed) => summary.completed += partitions,
                Ok(ProcessingStatus::Failed) => summary.failed += partitions,
                Ok(ProcessingStatus::Cancelled) => summary.cancelled += partitions,
                Err(reason) => warn!(reason = %reason, "ignoring processing_log rows with unknown status"),
            }
            summary.records_processed += records;
        }
        Ok(summary)
    }

    /// 最近的审计记录，按写入顺序倒序。
    pub async fn recent_records(&self, limit: u32) -> Result<Vec<ProcessingRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT domain, server, period, status, records_processed, started_at, completed_at, detail
             FROM processing_log ORDER BY id DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let Ok(status) = status.parse::<ProcessingStatus>() else {
                continue;
            };
            records.push(ProcessingRecord {
                domain: row.try_get("domain")?,
                server: row.try_get("server")?,
                period: row.try_get("period")?,
                status,
                records_processed: row.try_get::<i64, _>("records_processed")?.max(0) as u64,
                started_at: parse_timestamp(row.try_get("started_at")?),
                completed_at: parse_timestamp(row.try_get("completed_at")?),
                detail: row.try_get("detail")?,
            });
        }
        Ok(records)
    }
}

fn parse_timestamp(text: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&text)
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_default()
}

#[async_trait]
impl TransactionalStore for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction { tx }))
    }
}

struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError> {
        let mut query = sqlx::query(&statement.sql);
        for param in &statement.params {
            query = match param {
                SqlValue::Null => query.bind(None::<i64>),
                SqlValue::Integer(value) => query.bind(*value),
                SqlValue::Real(value) => query.bind(*value),
                SqlValue::Text(value) => query.bind(value.clone()),
            };
        }
        let done = query.execute(&mut *self.tx).await?;
        Ok(done.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
