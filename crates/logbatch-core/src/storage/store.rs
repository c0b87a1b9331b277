use async_trait::async_trait;

use super::statement::Statement;
use crate::error::StoreError;

/// 存储引擎的事务契约：begin / execute / commit / rollback。
///
/// # 契约说明 (What)
/// - `begin` 开启一个独立事务；事务内的变更在 `commit` 成功前对其他读者不可见；
/// - 事务句柄被丢弃而未提交时，实现必须回滚；
/// - 任何满足该契约的关系型存储都可以作为 [`super::BatchWriter`] 的后端。
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// 进行中的事务。
#[async_trait]
pub trait StoreTransaction: Send {
    /// 执行一条语句，返回受影响行数。
    async fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
