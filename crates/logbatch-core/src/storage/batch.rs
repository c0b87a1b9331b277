use std::{fmt, sync::Arc, time::Instant};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use super::{
    statement::Statement,
    store::{StoreTransaction, TransactionalStore},
};
use crate::error::BatchExecutionError;

/// 分区键：一个 (domain, server, period) 三元组，也是原子提交的单位。
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PartitionKey {
    pub domain: String,
    pub server: String,
    pub period: String,
}

impl PartitionKey {
    pub fn new(
        domain: impl Into<String>,
        server: impl Into<String>,
        period: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            server: server.into(),
            period: period.into(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.domain, self.server, self.period)
    }
}

/// 批次状态：`Open → {Committed, RolledBack}`，终态后不可再追加或提交。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Open,
    Committed,
    RolledBack,
}

impl BatchState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        }
    }
}

/// 一个分区累积的变更语句。
#[derive(Clone, Debug)]
pub struct SqlBatch {
    partition: PartitionKey,
    statements: Vec<Statement>,
    state: BatchState,
}

impl SqlBatch {
    /// 批次所属分区。
    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    /// 已追加的语句，按执行顺序排列。
    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// 当前状态。
    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// 追加语句；批次已关闭时返回 `false` 并丢弃语句。
    pub fn append(&mut self, statement: Statement) -> bool {
        if self.state != BatchState::Open {
            warn!(partition = %self.partition, state = self.state.as_str(), "append to closed batch ignored");
            return false;
        }
        self.statements.push(statement);
        true
    }

    pub fn extend<I: IntoIterator<Item = Statement>>(&mut self, statements: I) {
        for statement in statements {
            if !self.append(statement) {
                break;
            }
        }
    }
}

/// 分区批量写入器。
///
/// ## 契约 (What)
/// - `begin(partition)` 创建空批次；`SqlBatch::append` 累积语句；
/// - `commit(&mut batch)` 在单个事务内按序执行全部语句：要么全部可见，要么全部不可见，
///   返回受影响行数总和；任一语句失败即回滚整个批次；
/// - 不同分区的提交相互独立，可由多个任务并发调用，写入器内部的写锁保证同一时刻只有一个写事务。
///
/// ## 注意事项 (Trade-offs)
/// - 超大分区不做跨事务切分，内存占用与语句数成正比。
pub struct BatchWriter {
    store: Arc<dyn TransactionalStore>,
    write_lock: AsyncMutex<()>,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        Self {
            store,
            write_lock: AsyncMutex::new(()),
        }
    }

    pub fn begin(&self, partition: PartitionKey) -> SqlBatch {
        SqlBatch {
            partition,
            statements: Vec::new(),
            state: BatchState::Open,
        }
    }

    pub async fn commit(&self, batch: &mut SqlBatch) -> Result<u64, BatchExecutionError> {
        if batch.state != BatchState::Open {
            return Err(BatchExecutionError::Closed {
                partition: batch.partition.clone(),
                state: batch.state.as_str(),
            });
        }

        let _guard = self.write_lock.lock().await;
        let started = Instant::now();
        let partition = &batch.partition;

        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(source) => {
                batch.state = BatchState::RolledBack;
                return Err(BatchExecutionError::Begin {
                    partition: partition.clone(),
                    source,
                });
            }
        };

        let mut rows = 0u64;
        for (index, statement) in batch.statements.iter().enumerate() {
            match tx.execute(statement).await {
                Ok(affected) => rows += affected,
                Err(source) => {
                    warn!(
                        partition = %partition,
                        index,
                        code = source.code(),
                        error = %source,
                        "statement failed, rolling back partition"
                    );
                    rollback(tx, partition).await;
                    batch.state = BatchState::RolledBack;
                    return Err(BatchExecutionError::Statement {
                        partition: partition.clone(),
                        index,
                        source,
                    });
                }
            }
        }

        if let Err(source) = tx.commit().await {
            error!(partition = %partition, error = %source, "partition commit failed");
            batch.state = BatchState::RolledBack;
            return Err(BatchExecutionError::Commit {
                partition: partition.clone(),
                source,
            });
        }

        batch.state = BatchState::Committed;
        info!(
            partition = %partition,
            statements = batch.statements.len(),
            rows,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "partition committed"
        );
        Ok(rows)
    }
}

async fn rollback(tx: Box<dyn StoreTransaction>, partition: &PartitionKey) {
    if let Err(err) = tx.rollback().await {
        // 事务句柄已被消耗，存储端在连接归还时丢弃未提交的变更。
        debug!(partition = %partition, error = %err, "explicit rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStore;

    async fn writer() -> (SqliteStore, BatchWriter) {
        let store = SqliteStore::in_memory().await.expect("in-memory store");
        store.ensure_schema().await.expect("schema");
        let writer = BatchWriter::new(Arc::new(store.clone()));
        (store, writer)
    }

    #[tokio::test]
    async fn committed_batch_rejects_further_use() {
        let (_store, writer) = writer().await;
        let mut batch = writer.begin(PartitionKey::new("shop", "web1", "2024-05"));
        batch.append(
            Statement::new("INSERT INTO partition_summary VALUES (?, ?, ?, ?, ?)")
                .bind("shop")
                .bind("web1")
                .bind("2024-05")
                .bind("hits")
                .bind(1.0),
        );
        assert_eq!(writer.commit(&mut batch).await.expect("commit"), 1);
        assert_eq!(batch.state(), BatchState::Committed);

        assert!(!batch.append(Statement::new("DELETE FROM partition_summary")));
        assert_eq!(batch.len(), 1);
        let err = writer.commit(&mut batch).await.expect_err("closed");
        assert_eq!(err.code(), "logbatch.batch.closed");
    }

    #[tokio::test]
    async fn empty_batch_commits_nothing() {
        let (_store, writer) = writer().await;
        let mut batch = writer.begin(PartitionKey::new("shop", "web1", "2024-05"));
        assert!(batch.is_empty());
        assert_eq!(writer.commit(&mut batch).await.expect("commit"), 0);
    }

    #[tokio::test]
    async fn failing_statement_reports_its_index() {
        let (_store, writer) = writer().await;
        let mut batch = writer.begin(PartitionKey::new("shop", "web1", "2024-05"));
        batch.extend([
            Statement::new("DELETE FROM partition_summary"),
            Statement::new("INSERT INTO no_such_table VALUES (1)"),
        ]);
        let err = writer.commit(&mut batch).await.expect_err("must fail");
        assert!(matches!(err, BatchExecutionError::Statement { index: 1, .. }));
        assert_eq!(batch.state(), BatchState::RolledBack);
        assert_eq!(err.partition().to_string(), "shop/web1/2024-05");
    }
}
