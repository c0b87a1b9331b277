//! # executor 模块
//!
//! 有界并发的外部作业执行：[`JobPool`] 负责调度与汇总，[`Cancellation`] 提供池级取消，
//! [`ProgressReport`] 是对执行状态的纯计算进度快照。

mod cancel;
mod job;
mod pool;
mod progress;

pub use cancel::Cancellation;
pub use job::{CommandDescriptor, Job, JobFailure, JobId, JobRecord, JobState};
pub use pool::{JobBatchResult, JobPool, PoolConfig, PoolSnapshot, ProgressSink};
pub use progress::{ProgressReport, format_duration};
