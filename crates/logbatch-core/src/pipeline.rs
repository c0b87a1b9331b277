//! 作业完成 → 分区提交。
//!
//! ## 契约 (What)
//! - [`PartitionCommitter`] 逐个消费作业池推送的终态 [`JobRecord`]，把成功作业的输出文件转换为
//!   分区批次并原子提交；失败或取消的作业只写一条对应状态的审计记录；
//! - 提取或提交失败的分区在回滚后另起事务写入 `failed` 审计记录，其余分区不受影响；
//! - [`PartitionCommitter::drain`] 在通道关闭（作业池结束并释放发送端）后返回 [`CommitTally`]。
//!
//! ## 注意事项 (Trade-offs)
//! - 提交与仍在运行的作业并行进行，写入顺序取决于作业完成顺序。

use std::{path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::{
    error::BatchExecutionError,
    executor::{JobRecord, JobState},
    extract::Extraction,
    plan::Plan,
    storage::{BatchWriter, PartitionKey, ProcessingRecord, ProcessingStatus},
};

/// 单个分区的处理结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartitionOutcome {
    Committed { records: u64 },
    Failed { detail: String },
    Cancelled,
    /// 作业编号不在规划内，未做任何写入。
    Unplanned,
}

/// 分区提交汇总。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CommitTally {
    pub committed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub records_processed: u64,
    /// `(分区, 失败原因)`，按完成顺序排列。
    pub failures: Vec<(String, String)>,
}

impl CommitTally {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }

    fn fold(&mut self, partition: &PartitionKey, outcome: &PartitionOutcome) {
        match outcome {
            PartitionOutcome::Committed { records } => {
                self.committed += 1;
                self.records_processed += records;
            }
            PartitionOutcome::Failed { detail } => {
                self.failed += 1;
                self.failures.push((partition.to_string(), detail.clone()));
            }
            PartitionOutcome::Cancelled => self.cancelled += 1,
            PartitionOutcome::Unplanned => {}
        }
    }
}

pub struct PartitionCommitter {
    writer: Arc<BatchWriter>,
    plan: Arc<Plan>,
    batch_size: usize,
}

impl PartitionCommitter {
    pub fn new(writer: Arc<BatchWriter>, plan: Arc<Plan>, batch_size: usize) -> Self {
        Self {
            writer,
            plan,
            batch_size: batch_size.max(1),
        }
    }

    /// 消费通道直到关闭。
    pub async fn drain(self, mut completions: mpsc::UnboundedReceiver<JobRecord>) -> CommitTally {
        let mut tally = CommitTally::default();
        while let Some(record) = completions.recv().await {
            let Some(partition) = self.plan.partition(record.id).cloned() else {
                error!(job = %record.id, label = %record.label, "completed job is not part of the plan");
                continue;
            };
            let outcome = self.handle(&partition, record).await;
            tally.fold(&partition, &outcome);
        }
        info!(
            committed = tally.committed,
            failed = tally.failed,
            cancelled = tally.cancelled,
            records = tally.records_processed,
            "partition commits finished"
        );
        tally
    }

    /// 处理单个终态作业。
    pub async fn handle(&self, partition: &PartitionKey, record: JobRecord) -> PartitionOutcome {
        let started_at = record
            .started_at
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);

        match record.state {
            JobState::Succeeded => {
                let output = record.output_path.or_else(|| {
                    self.plan
                        .planned(record.id)
                        .map(|planned| planned.output_path.clone())
                });
                match self.commit_output(partition, output, started_at).await {
                    Ok(records) => PartitionOutcome::Committed { records },
                    Err(detail) => {
                        self.write_audit(
                            ProcessingRecord::new(partition, ProcessingStatus::Failed, 0, started_at)
                                .with_detail(detail.clone()),
                        )
                        .await;
                        PartitionOutcome::Failed { detail }
                    }
                }
            }
            JobState::Failed => {
                let mut detail = record
                    .failure
                    .map(|failure| failure.to_string())
                    .unwrap_or_else(|| "job failed".to_owned());
                if let Some(tail) = record.stderr_tail {
                    detail = format!("{detail}: {tail}");
                }
                self.write_audit(
                    ProcessingRecord::new(partition, ProcessingStatus::Failed, 0, started_at)
                        .with_detail(detail.clone()),
                )
                .await;
                PartitionOutcome::Failed { detail }
            }
            JobState::Cancelled => {
                self.write_audit(ProcessingRecord::new(
                    partition,
                    ProcessingStatus::Cancelled,
                    0,
                    started_at,
                ))
                .await;
                PartitionOutcome::Cancelled
            }
            JobState::Pending | JobState::Running => {
                warn!(partition = %partition, state = %record.state, "ignoring non-terminal job record");
                PartitionOutcome::Unplanned
            }
        }
    }

    async fn commit_output(
        &self,
        partition: &PartitionKey,
        output: Option<PathBuf>,
        started_at: DateTime<Utc>,
    ) -> Result<u64, String> {
        let Some(output) = output else {
            return Err("job has no output file".to_owned());
        };
        let extraction = Extraction::from_file(partition.clone(), &output)
            .await
            .map_err(|err| {
                warn!(partition = %partition, code = err.code(), error = %err, "extraction failed");
                err.to_string()
            })?;
        if extraction.skipped > 0 {
            warn!(partition = %partition, skipped = extraction.skipped, "malformed metric lines skipped");
        }
        let records = extraction.len() as u64;
        let mut batch = extraction.into_batch(&self.writer, self.batch_size, started_at);
        self.writer
            .commit(&mut batch)
            .await
            .map_err(|err: BatchExecutionError| {
                error!(partition = %partition, code = err.code(), error = %err, "partition commit failed");
                err.to_string()
            })?;
        Ok(records)
    }

    /// 审计记录单独成批提交；失败只记日志。
    async fn write_audit(&self, record: ProcessingRecord) {
        let partition = PartitionKey::new(&record.domain, &record.server, &record.period);
        let mut batch = self.writer.begin(partition);
        batch.append(record.to_statement());
        if let Err(err) = self.writer.commit(&mut batch).await {
            error!(partition = %err.partition(), code = err.code(), error = %err, "audit record lost");
        }
    }
}
