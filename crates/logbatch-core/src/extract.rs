//! 统计引擎输出 → 分区写入语句。
//!
//! 输出文件每行一个指标：`<metric><空白><数值>`。空行与 `#` 注释行忽略，
//! 格式不符的行以 DEBUG 记录后跳过。同名指标以最后一次出现为准。

use std::{collections::BTreeMap, path::Path};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{
    error::ExtractError,
    storage::{
        BatchWriter, PartitionKey, ProcessingRecord, ProcessingStatus, SqlBatch, Statement,
    },
};

/// SQLite 单条语句的绑定变量上限为 32766，每行占 5 个。
const MAX_ROWS_PER_INSERT: usize = 32_766 / 5;

/// 单个指标。
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: f64,
}

/// 一个分区的提取结果。
#[derive(Clone, Debug, PartialEq)]
pub struct Extraction {
    pub partition: PartitionKey,
    pub metrics: Vec<Metric>,
    /// 被跳过的格式错误行数。
    pub skipped: usize,
}

impl Extraction {
    pub fn parse(partition: PartitionKey, text: &str) -> Self {
        let mut metrics = BTreeMap::new();
        let mut skipped = 0;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let parsed = match (fields.next(), fields.next(), fields.next()) {
                (Some(name), Some(value), None) => value
                    .parse::<f64>()
                    .ok()
                    .filter(|value| value.is_finite())
                    .map(|value| (name, value)),
                _ => None,
            };
            match parsed {
                Some((name, value)) => {
                    metrics.insert(name.to_owned(), value);
                }
                None => {
                    skipped += 1;
                    debug!(partition = %partition, line = lineno + 1, "skipping malformed metric line");
                }
            }
        }
        Self {
            partition,
            metrics: metrics
                .into_iter()
                .map(|(name, value)| Metric { name, value })
                .collect(),
            skipped,
        }
    }

    pub async fn from_file(partition: PartitionKey, path: &Path) -> Result<Self, ExtractError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ExtractError {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::parse(partition, &text))
    }

    /// 解析出的指标条数。
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// 分区的全部语句：先删除旧指标，再分块插入，最后追加 `completed` 审计行。
    pub fn into_batch(
        self,
        writer: &BatchWriter,
        batch_size: usize,
        started_at: DateTime<Utc>,
    ) -> SqlBatch {
        let record = ProcessingRecord::new(
            &self.partition,
            ProcessingStatus::Completed,
            self.metrics.len() as u64,
            started_at,
        );
        let mut batch = writer.begin(self.partition.clone());
        batch.extend(summary_statements(&self.partition, &self.metrics, batch_size));
        batch.append(record.to_statement());
        batch
    }
}

/// 分区指标的替换语句：一条 `DELETE` 加若干条每条至多 `batch_size` 行的多行 `INSERT`。
pub fn summary_statements(
    partition: &PartitionKey,
    metrics: &[Metric],
    batch_size: usize,
) -> Vec<Statement> {
    let rows_per_insert = batch_size.clamp(1, MAX_ROWS_PER_INSERT);
    let mut statements = Vec::with_capacity(1 + metrics.len().div_ceil(rows_per_insert));
    statements.push(
        Statement::new(
            "DELETE FROM partition_summary WHERE domain = ? AND server = ? AND period = ?",
        )
        .bind(partition.domain.as_str())
        .bind(partition.server.as_str())
        .bind(partition.period.as_str()),
    );

    for chunk in metrics.chunks(rows_per_insert) {
        let values = vec!["(?, ?, ?, ?, ?)"; chunk.len()].join(", ");
        let mut statement = Statement::new(format!(
            "INSERT INTO partition_summary (domain, server, period, metric, value) VALUES {values}"
        ));
        for metric in chunk {
            statement = statement
                .bind(partition.domain.as_str())
                .bind(partition.server.as_str())
                .bind(partition.period.as_str())
                .bind(metric.name.as_str())
                .bind(metric.value);
        }
        statements.push(statement);
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqlValue;

    fn partition() -> PartitionKey {
        PartitionKey::new("shop", "web1", "2024-05")
    }

    #[test]
    fn parse_skips_comments_blanks_and_garbage() {
        let text = "# engine v2\n\nhits 120\nvisitors\t33.5\nbroken\nbytes lots\nextra 1 2\nhits 125\nnan NaN\n";
        let extraction = Extraction::parse(partition(), text);
        assert_eq!(
            extraction.metrics,
            vec![
                Metric {
                    name: "hits".into(),
                    value: 125.0
                },
                Metric {
                    name: "visitors".into(),
                    value: 33.5
                },
            ]
        );
        assert_eq!(extraction.skipped, 4);
    }

    #[test]
    fn inserts_are_chunked_by_batch_size() {
        let metrics: Vec<Metric> = (0..7)
            .map(|i| Metric {
                name: format!("m{i}"),
                value: f64::from(i),
            })
            .collect();
        let statements = summary_statements(&partition(), &metrics, 3);
        assert_eq!(statements.len(), 1 + 3);
        assert!(statements[0].sql.starts_with("DELETE"));
        assert_eq!(statements[1].params.len(), 15);
        assert_eq!(statements[3].params.len(), 5);
        assert_eq!(statements[3].params[3], SqlValue::Text("m6".into()));
    }

    #[test]
    fn empty_output_still_clears_the_partition() {
        let statements = summary_statements(&partition(), &[], 500);
        assert_eq!(statements.len(), 1);
    }

    #[tokio::test]
    async fn missing_file_is_reported_with_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.txt");
        let err = Extraction::from_file(partition(), &path).await.unwrap_err();
        assert_eq!(err.path, path);
        assert_eq!(err.code(), "logbatch.extract.unreadable");
    }
}
