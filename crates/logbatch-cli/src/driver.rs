//! 编排驱动：配置 → 校验 → 规划 → 执行 → 分区提交 → 汇总。
//!
//! ## 契约 (What)
//! - 配置无法读取、严格校验失败或选择的域/服务器不存在时，不启动任何作业，退出码 2；
//! - 任一作业失败、分区提交失败、组合无法规划或运行被取消时退出码 1，否则 0；
//! - 进程环境只在入口捕获一次，Ctrl-C 触发作业池取消，已完成的分区照常提交。

use std::{
    io::{self, Write},
    process::ExitCode,
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::Local;
use logbatch_core::{
    BatchWriter, Cancellation, CommitTally, ConfigStore, Environment, HierarchicalResolver,
    JobBatchResult, JobPool, PartitionCommitter, PoolConfig,
    config::{RunSettings, validate},
    executor::format_duration,
    plan::{Plan, monthly_periods},
    storage::{ProcessingRecord, ProcessingSummary, SqliteStore},
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::cli::Args;

const EXIT_FAILED: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const RECENT_RECORDS: u32 = 20;

pub async fn run(args: Args) -> Result<ExitCode> {
    let store = match ConfigStore::load(&args.config) {
        Ok(store) => store,
        Err(err) => {
            error!(code = err.code(), error = %err, "cannot load configuration");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };
    let resolver = HierarchicalResolver::new(Arc::new(store), Arc::new(Environment::capture()));

    let issues = match validate(&resolver, args.strict) {
        Ok(issues) => issues,
        Err(err) => {
            for issue in &err.issues {
                error!(issue = %issue, "configuration issue");
            }
            error!(code = err.code(), error = %err, "strict validation failed");
            if args.validate {
                print_issues(&err.issues.iter().map(ToString::to_string).collect::<Vec<_>>(), args.json)?;
            }
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };
    if args.validate {
        print_issues(&issues.iter().map(ToString::to_string).collect::<Vec<_>>(), args.json)?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut settings = match RunSettings::from_resolver(&resolver) {
        Ok(settings) => settings,
        Err(err) => {
            error!(code = err.code(), error = %err, "invalid run settings");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };
    apply_overrides(&mut settings, &args);

    if args.stats {
        return stats(&settings, args.json).await;
    }

    let periods = monthly_periods(Local::now().date_naive(), settings.history_months);
    let plan = match Plan::build(&resolver, &args.selection(), &periods) {
        Ok(plan) => Arc::new(plan),
        Err(err) => {
            error!(code = err.code(), error = %err, "cannot build job plan");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    if args.dry_run {
        print_plan(&plan, args.json)?;
        return Ok(exit_code(plan.failures().is_empty()));
    }

    execute(plan, &settings, args.json).await
}

fn apply_overrides(settings: &mut RunSettings, args: &Args) {
    if let Some(parallel) = args.parallel {
        settings.max_concurrent = usize::try_from(parallel).unwrap_or(usize::MAX);
    }
    if let Some(batch_size) = args.batch_size {
        settings.batch_size = usize::try_from(batch_size).unwrap_or(usize::MAX);
    }
    if let Some(months) = args.months {
        settings.history_months = months;
    }
}

async fn execute(plan: Arc<Plan>, settings: &RunSettings, json: bool) -> Result<ExitCode> {
    let store = SqliteStore::connect(&settings.database)
        .await
        .with_context(|| format!("cannot open storage `{}`", settings.database))?;
    store.ensure_schema().await.context("cannot create storage schema")?;
    plan.ensure_output_dirs()
        .context("cannot create engine output directories")?;

    let cancellation = Cancellation::new();
    let interrupt = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() && interrupt.cancel() {
            warn!("interrupt received, cancelling outstanding jobs");
        }
    });

    let writer = Arc::new(BatchWriter::new(Arc::new(store)));
    let (tx, rx) = mpsc::unbounded_channel();
    let committer = PartitionCommitter::new(writer, Arc::clone(&plan), settings.batch_size);
    let commits = tokio::spawn(committer.drain(rx));

    let pool = JobPool::new(PoolConfig::from(settings))
        .with_cancellation(cancellation)
        .with_completion_sink(tx);
    let jobs = pool.run(plan.to_jobs()).await;
    drop(pool);
    let partitions = commits.await.context("partition committer task failed")?;

    let summary = RunSummary {
        jobs,
        partitions,
        unplanned: plan.failures().len(),
    };
    print_summary(&summary, json)?;
    info!(success = summary.is_success(), "run finished");
    Ok(exit_code(summary.is_success()))
}

async fn stats(settings: &RunSettings, json: bool) -> Result<ExitCode> {
    let store = SqliteStore::connect(&settings.database)
        .await
        .with_context(|| format!("cannot open storage `{}`", settings.database))?;
    store.ensure_schema().await.context("cannot create storage schema")?;
    let summary = store.processing_summary().await.context("summary query failed")?;
    let recent = store
        .recent_records(RECENT_RECORDS)
        .await
        .context("recent records query failed")?;

    let mut out = io::stdout().lock();
    if json {
        #[derive(Serialize)]
        struct Stats<'a> {
            summary: &'a ProcessingSummary,
            recent: &'a [ProcessingRecord],
        }
        serde_json::to_writer_pretty(&mut out, &Stats {
            summary: &summary,
            recent: &recent,
        })?;
        writeln!(out)?;
    } else {
        writeln!(
            out,
            "partitions: {} completed, {} failed, {} cancelled; {} records",
            summary.completed, summary.failed, summary.cancelled, summary.records_processed
        )?;
        for record in &recent {
            writeln!(
                out,
                "{} {}/{}/{} {} records={}{}",
                record.completed_at.format("%Y-%m-%d %H:%M:%S"),
                record.domain,
                record.server,
                record.period,
                record.status,
                record.records_processed,
                record
                    .detail
                    .as_deref()
                    .map(|detail| format!(" ({detail})"))
                    .unwrap_or_default()
            )?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// 一次运行的最终汇总。
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub jobs: JobBatchResult,
    pub partitions: CommitTally,
    /// 因缺少必填键而未规划的组合数。
    pub unplanned: usize,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.jobs.is_success() && self.partitions.is_success() && self.unplanned == 0
    }

    pub fn line(&self) -> String {
        format!(
            "jobs: {} total, {} succeeded, {} failed, {} cancelled | partitions: {} committed, {} failed | {} records | {}{}",
            self.jobs.total,
            self.jobs.succeeded,
            self.jobs.failed,
            self.jobs.cancelled,
            self.partitions.committed,
            self.partitions.failed,
            self.partitions.records_processed,
            format_duration(self.jobs.elapsed),
            if self.jobs.was_cancelled { " (cancelled)" } else { "" },
        )
    }
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    let mut out = io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut out, summary)?;
        writeln!(out)?;
    } else {
        writeln!(out, "{}", summary.line())?;
        for (partition, detail) in &summary.partitions.failures {
            writeln!(out, "  failed {partition}: {detail}")?;
        }
    }
    Ok(())
}

fn print_plan(plan: &Plan, json: bool) -> Result<()> {
    let mut out = io::stdout().lock();
    if json {
        #[derive(Serialize)]
        struct Entry {
            label: String,
            command: String,
            output: String,
        }
        let entries: Vec<Entry> = plan
            .jobs()
            .iter()
            .map(|planned| Entry {
                label: planned.job.label.clone(),
                command: planned.job.command.to_string(),
                output: planned.output_path.display().to_string(),
            })
            .collect();
        serde_json::to_writer_pretty(&mut out, &entries)?;
        writeln!(out)?;
    } else {
        for planned in plan.jobs() {
            writeln!(out, "{}: {}", planned.job.label, planned.job.command)?;
        }
        for failure in plan.failures() {
            writeln!(
                out,
                "skipped {}/{}: {}",
                failure.domain,
                failure.server.as_deref().unwrap_or("*"),
                failure.error
            )?;
        }
        writeln!(out, "{} job(s) planned, nothing executed", plan.len())?;
    }
    Ok(())
}

fn print_issues(issues: &[String], json: bool) -> Result<()> {
    let mut out = io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut out, issues)?;
        writeln!(out)?;
    } else if issues.is_empty() {
        writeln!(out, "configuration OK")?;
    } else {
        for issue in issues {
            writeln!(out, "warning: {issue}")?;
        }
    }
    Ok(())
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILED)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;

    use super::*;

    #[test]
    fn overrides_replace_resolved_values() {
        let mut settings = RunSettings {
            max_concurrent: 4,
            job_timeout: None,
            batch_size: 500,
            history_months: 1,
            database: "sqlite::memory:".into(),
        };
        let args = Args::try_parse_from([
            "logbatch",
            "--all",
            "--parallel",
            "8",
            "--batch-size",
            "50",
            "--months",
            "6",
        ])
        .unwrap();
        apply_overrides(&mut settings, &args);
        assert_eq!(settings.max_concurrent, 8);
        assert_eq!(settings.batch_size, 50);
        assert_eq!(settings.history_months, 6);
    }

    #[test]
    fn summary_line_reports_both_tallies() {
        let summary = RunSummary {
            jobs: JobBatchResult {
                total: 5,
                succeeded: 3,
                failed: 2,
                elapsed: Duration::from_millis(1500),
                ..JobBatchResult::default()
            },
            partitions: CommitTally {
                committed: 3,
                failed: 2,
                records_processed: 42,
                ..CommitTally::default()
            },
            unplanned: 0,
        };
        let line = summary.line();
        assert!(line.starts_with("jobs: 5 total, 3 succeeded, 2 failed, 0 cancelled"));
        assert!(line.contains("partitions: 3 committed, 2 failed | 42 records"));
        assert!(!summary.is_success());
    }

    #[tokio::test]
    async fn unreadable_configuration_exits_with_config_code() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args::try_parse_from([
            "logbatch",
            "--config",
            dir.path().join("missing.conf").to_str().unwrap(),
            "--all",
        ])
        .unwrap();
        assert_eq!(run(args).await.unwrap(), ExitCode::from(EXIT_CONFIG));
    }

    #[tokio::test]
    async fn dry_run_plans_without_touching_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("logbatch.conf");
        let database = dir.path().join("never-created.db");
        std::fs::write(
            &config,
            format!(
                "[global]\nstats_engine=/opt/engine\nlog_dir=/logs\ndatabase=sqlite://{}\n[shop]\nservers=web1\n[web1]\n",
                database.display()
            ),
        )
        .unwrap();
        let args = Args::try_parse_from([
            "logbatch",
            "--config",
            config.to_str().unwrap(),
            "--dry-run",
            "--all",
        ])
        .unwrap();
        assert_eq!(run(args).await.unwrap(), ExitCode::SUCCESS);
        assert!(!database.exists());
    }
}
