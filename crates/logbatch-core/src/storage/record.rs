use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{PartitionKey, statement::Statement};

/// 分区处理状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Completed,
    Failed,
    Cancelled,
}

impl ProcessingStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown processing status `{other}`")),
        }
    }
}

/// 持久化的分区审计记录，是唯一面向外部报表层暴露的实体。
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProcessingRecord {
    pub domain: String,
    pub server: String,
    pub period: String,
    pub status: ProcessingStatus,
    pub records_processed: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub detail: Option<String>,
}

impl ProcessingRecord {
    pub fn new(
        partition: &PartitionKey,
        status: ProcessingStatus,
        records_processed: u64,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            domain: partition.domain.clone(),
            server: partition.server.clone(),
            period: partition.period.clone(),
            status,
            records_processed,
            started_at,
            completed_at: Utc::now(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// 审计行的插入语句。
    pub fn to_statement(&self) -> Statement {
        Statement::new(
            "INSERT INTO processing_log \
             (domain, server, period, status, records_processed, started_at, completed_at, detail) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(self.domain.as_str())
        .bind(self.server.as_str())
        .bind(self.period.as_str())
        .bind(self.status.as_str())
        .bind(self.records_processed)
        .bind(self.started_at.to_rfc3339())
        .bind(self.completed_at.to_rfc3339())
        .bind(self.detail.clone())
    }
}

/// 各状态的分区计数。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingSummary {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub records_processed: u64,
}

impl ProcessingSummary {
    pub fn total(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::statement::SqlValue;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            ProcessingStatus::Completed,
            ProcessingStatus::Failed,
            ProcessingStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<ProcessingStatus>(), Ok(status));
        }
        assert!("done".parse::<ProcessingStatus>().is_err());
    }

    #[test]
    fn audit_statement_binds_every_column() {
        let partition = PartitionKey::new("shop", "web1", "2024-05");
        let record = ProcessingRecord::new(&partition, ProcessingStatus::Failed, 0, Utc::now())
            .with_detail("exited with status 2");
        let statement = record.to_statement();
        assert_eq!(statement.params.len(), 8);
        assert_eq!(statement.params[3], SqlValue::Text("failed".into()));
        assert_eq!(
            statement.params[7],
            SqlValue::Text("exited with status 2".into())
        );
    }
}
