//! # storage 模块说明
//!
//! ## 角色定位
//! - 以分区为单位把提取结果写入关系型存储：每个 (domain, server, period) 的全部语句在一个事务内提交；
//! - 后端通过 [`TransactionalStore`] 抽象，默认实现为基于 `sqlx` 的 [`SqliteStore`]。
//!
//! ## 数据面
//! - `partition_summary`：分区指标，提交时先删后插，重跑同一分区得到相同结果；
//! - `processing_log`：分区审计记录，每次处理（成功、失败或取消）追加一行。

mod batch;
mod record;
mod schema;
mod sqlite;
mod statement;
mod store;

pub use batch::{BatchState, BatchWriter, PartitionKey, SqlBatch};
pub use record::{ProcessingRecord, ProcessingStatus, ProcessingSummary};
pub use schema::{PARTITION_SUMMARY, PROCESSING_LOG, SCHEMA};
pub use sqlite::SqliteStore;
pub use statement::{SqlValue, Statement};
pub use store::{StoreTransaction, TransactionalStore};
