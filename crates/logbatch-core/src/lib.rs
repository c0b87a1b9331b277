#![deny(unsafe_code)]
#![doc = r#"
# logbatch-core

## 定位
- 负责访问日志批处理系统中唯一具备工程深度的部分：
  分层配置解析（server → domain → global）与外部统计引擎的并行批量执行；
- 执行结果经由 [`storage::BatchWriter`] 以分区为单位原子提交到关系型存储，
  供外部报表层读取。

## 模块概览
- [`config`]：配置文件解析、变量展开、三层优先级解析与校验；
- [`executor`]：带并发上限、超时与取消的外部进程作业池，以及进度计算；
- [`storage`]：类型化 SQL 语句、事务存储契约、SQLite 实现、批量写入器与审计记录；
- [`plan`]：为启用的 (domain, server, period) 组合构造作业列表；
- [`extract`]：将统计引擎输出文件转换为分区写入语句；
- [`pipeline`]：消费作业完成通知，逐分区提取并提交。

## 约束
- 配置在解析后只读，可无锁并发读取；
- 进程环境变量只在启动时捕获一次，以 [`config::Environment`] 显式传递；
- 单个作业或分区的失败只影响自身，最终结果以汇总形式呈现。
"#]

pub mod config;
pub mod error;
pub mod executor;
pub mod extract;
pub mod pipeline;
pub mod plan;
pub mod storage;

pub use config::{ConfigStore, Environment, HierarchicalResolver, ResolvedValue, SourceScope};
pub use error::{
    BatchExecutionError, ConfigError, ExtractError, PlanError, ResolutionError, StoreError,
    ValidationError,
};
pub use executor::{
    Cancellation, CommandDescriptor, Job, JobBatchResult, JobFailure, JobId, JobPool, JobRecord,
    JobState, PoolConfig, ProgressReport,
};
pub use pipeline::{CommitTally, PartitionCommitter};
pub use plan::{Plan, PlannedJob, Selection};
pub use storage::{BatchWriter, PartitionKey, ProcessingRecord, SqlBatch, Statement};
