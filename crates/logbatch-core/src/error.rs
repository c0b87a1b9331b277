//! # error 模块说明
//!
//! ## 角色定位
//! - 集中定义批处理链路上的错误域：配置加载、键解析、配置校验、存储访问与分区批量提交；
//! - 每个错误类型提供稳定错误码 `code()`，日志与汇总报告统一以错误码作为检索维度。
//!
//! ## 传播约定
//! - [`ConfigError`] 为致命错误，驱动层在执行任何作业之前终止；
//! - [`ResolutionError`] 是否致命由调用点决定；
//! - [`PlanError`] 表示命令行选择的域或服务器不存在，驱动层按配置错误处理；
//! - [`BatchExecutionError`] 只回滚受影响的分区，其余分区照常提交；
//! - 单个作业的失败以 [`crate::executor::JobFailure`] 记录，不经由 `Result` 传播。

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::{config::ValidationIssue, storage::PartitionKey};

/// 配置文件无法读取。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 文件不存在或无读权限。
    #[error("configuration file `{}` is unreadable: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ConfigError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unreadable { .. } => "logbatch.config.unreadable",
        }
    }
}

/// 键在三层作用域中均未命中，或命中值无法解析为期望类型。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("required key `{key}` is not set for server `{}` / domain `{}` or in [global]",
        .server.as_deref().unwrap_or("-"), .domain.as_deref().unwrap_or("-"))]
    Missing {
        key: String,
        server: Option<String>,
        domain: Option<String>,
    },
    #[error("key `{key}` has invalid value `{value}`: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl ResolutionError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Missing { .. } => "logbatch.config.key_missing",
            Self::Invalid { .. } => "logbatch.config.key_invalid",
        }
    }
}

/// 严格模式下配置校验未通过。
///
/// 非严格模式下同样的问题只以 WARN 日志输出，不会构造该错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("configuration validation failed with {} issue(s)", .issues.len())]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        "logbatch.config.invalid"
    }
}

/// 作业规划的选择条件与配置不符。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("domain `{domain}` is not declared in the configuration")]
    UnknownDomain { domain: String },
    #[error("server `{server}` is not listed in domain `{domain}`")]
    UnknownServer { domain: String, server: String },
    #[error("domain `{domain}` is disabled")]
    DomainDisabled { domain: String },
}

impl PlanError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownDomain { .. } => "logbatch.plan.unknown_domain",
            Self::UnknownServer { .. } => "logbatch.plan.unknown_server",
            Self::DomainDisabled { .. } => "logbatch.plan.domain_disabled",
        }
    }
}

/// 统计引擎输出文件无法读取。
#[derive(Debug, Error)]
#[error("engine output `{}` is unreadable: {source}", .path.display())]
pub struct ExtractError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl ExtractError {
    pub fn code(&self) -> &'static str {
        "logbatch.extract.unreadable"
    }
}

/// 存储引擎访问失败。
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage connection failed: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("storage query failed: {0}")]
    Query(#[from] sqlx::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connect(_) => "logbatch.storage.connect_failed",
            Self::Query(_) => "logbatch.storage.query_failed",
        }
    }
}

/// 分区批量提交失败；失败时整个批次已回滚，分区对读者保持提交前状态。
#[derive(Debug, Error)]
pub enum BatchExecutionError {
    #[error("partition {partition}: failed to begin transaction: {source}")]
    Begin {
        partition: PartitionKey,
        #[source]
        source: StoreError,
    },
    #[error("partition {partition}: statement #{index} failed, batch rolled back: {source}")]
    Statement {
        partition: PartitionKey,
        index: usize,
        #[source]
        source: StoreError,
    },
    #[error("partition {partition}: commit failed: {source}")]
    Commit {
        partition: PartitionKey,
        #[source]
        source: StoreError,
    },
    #[error("partition {partition}: batch is already {state}")]
    Closed {
        partition: PartitionKey,
        state: &'static str,
    },
}

impl BatchExecutionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Begin { .. } => "logbatch.batch.begin_failed",
            Self::Statement { .. } => "logbatch.batch.statement_failed",
            Self::Commit { .. } => "logbatch.batch.commit_failed",
            Self::Closed { .. } => "logbatch.batch.closed",
        }
    }

    /// 返回受影响的分区。
    pub fn partition(&self) -> &PartitionKey {
        match self {
            Self::Begin { partition, .. }
            | Self::Statement { partition, .. }
            | Self::Commit { partition, .. }
            | Self::Closed { partition, .. } => partition,
        }
    }
}
