//! 应用层默认值、逐 (domain, server) 生效设置与配置校验。

use std::{fmt, path::PathBuf, time::Duration};

use tracing::warn;

use super::{
    resolve::HierarchicalResolver,
    store::{GLOBAL_SECTION, split_list},
};
use crate::error::{ResolutionError, ValidationError};

/// 配置键名。
pub mod keys {
    pub const STATS_ENGINE: &str = "stats_engine";
    pub const STATS_ARGS: &str = "stats_args";
    pub const PROFILE: &str = "profile";
    pub const LOG_DIR: &str = "log_dir";
    pub const LOG_FILE: &str = "log_file";
    pub const OUTPUT_DIR: &str = "output_dir";
    pub const MAX_CONCURRENT: &str = "maxConcurrentProcesses";
    pub const JOB_TIMEOUT: &str = "job_timeout";
    pub const BATCH_SIZE: &str = "batch_size";
    pub const HISTORY_MONTHS: &str = "history_months";
    pub const DATABASE: &str = "database";
    pub const ENABLED: &str = "enabled";
}

pub const DEFAULT_STATS_ARGS: &str =
    "-config={profile} -LogFile={log} -output={output} -period={period}";
pub const DEFAULT_LOG_FILE: &str = "access.log";
pub const DEFAULT_OUTPUT_DIR: &str = "output";
pub const DEFAULT_MAX_CONCURRENT: usize = 4;
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_HISTORY_MONTHS: u32 = 1;
pub const DEFAULT_DATABASE: &str = "sqlite://logbatch.db";

/// 整次运行共享的全局设置（只读取 `[global]` 层）。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSettings {
    pub max_concurrent: usize,
    pub job_timeout: Option<Duration>,
    pub batch_size: usize,
    pub history_months: u32,
    pub database: String,
}

impl RunSettings {
    pub fn from_resolver(resolver: &HierarchicalResolver) -> Result<Self, ResolutionError> {
        let max_concurrent =
            resolver.resolve_or(keys::MAX_CONCURRENT, None, None, DEFAULT_MAX_CONCURRENT)?;
        let timeout_secs: u64 = resolver.resolve_or(keys::JOB_TIMEOUT, None, None, 0)?;
        Ok(Self {
            max_concurrent: max_concurrent.max(1),
            job_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            batch_size: resolver
                .resolve_or(keys::BATCH_SIZE, None, None, DEFAULT_BATCH_SIZE)?
                .max(1),
            history_months: resolver
                .resolve_or(keys::HISTORY_MONTHS, None, None, DEFAULT_HISTORY_MONTHS)?
                .max(1),
            database: resolver
                .resolve(keys::DATABASE, None, None)
                .unwrap_or_else(|| DEFAULT_DATABASE.to_owned()),
        })
    }
}

/// 单个 (domain, server) 组合的生效设置。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerSettings {
    pub domain: String,
    pub server: String,
    pub engine: PathBuf,
    pub args_template: String,
    pub profile: String,
    pub log_dir: PathBuf,
    pub log_file: String,
    pub output_dir: PathBuf,
}

impl ServerSettings {
    pub fn resolve(
        resolver: &HierarchicalResolver,
        domain: &str,
        server: &str,
    ) -> Result<Self, ResolutionError> {
        let scope = (Some(server), Some(domain));
        let get = |key: &str| resolver.resolve(key, scope.0, scope.1);
        Ok(Self {
            domain: domain.to_owned(),
            server: server.to_owned(),
            engine: resolver.require(keys::STATS_ENGINE, scope.0, scope.1)?.into(),
            args_template: get(keys::STATS_ARGS).unwrap_or_else(|| DEFAULT_STATS_ARGS.to_owned()),
            profile: get(keys::PROFILE).unwrap_or_else(|| domain.to_owned()),
            log_dir: resolver.require(keys::LOG_DIR, scope.0, scope.1)?.into(),
            log_file: get(keys::LOG_FILE).unwrap_or_else(|| DEFAULT_LOG_FILE.to_owned()),
            output_dir: get(keys::OUTPUT_DIR)
                .unwrap_or_else(|| DEFAULT_OUTPUT_DIR.to_owned())
                .into(),
        })
    }
}

/// 校验发现的单个问题。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationIssue {
    MissingGlobalSection,
    MissingKey { key: &'static str },
    EmptyServerList { domain: String },
    UnknownServer { domain: String, server: String },
    InvalidValue { section: String, key: &'static str, value: String },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingGlobalSection => f.write_str("no [global] section"),
            Self::MissingKey { key } => write!(f, "required key `{key}` is not set in [global]"),
            Self::EmptyServerList { domain } => {
                write!(f, "domain [{domain}] has an empty servers= list")
            }
            Self::UnknownServer { domain, server } => {
                write!(f, "domain [{domain}] references undeclared server section [{server}]")
            }
            Self::InvalidValue {
                section,
                key,
                value,
            } => write!(f, "[{section}] {key}={value} is not a valid number"),
        }
    }
}

/// 校验配置结构。
///
/// - 非严格模式：问题以 WARN 输出并原样返回，调用方继续运行；
/// - 严格模式：存在任意问题即返回 [`ValidationError`]。
///
/// `stats_engine` 只在 `[global]` 缺失且所有域都未覆盖时才报告。
pub fn validate(
    resolver: &HierarchicalResolver,
    strict: bool,
) -> Result<Vec<ValidationIssue>, ValidationError> {
    let store = resolver.store();
    let mut issues = Vec::new();

    if !store.has_section(GLOBAL_SECTION) {
        issues.push(ValidationIssue::MissingGlobalSection);
    }

    let engine_everywhere = store.get(GLOBAL_SECTION, keys::STATS_ENGINE).is_some()
        || store.domains().all(|domain| {
            store.servers_of(domain).iter().all(|server| {
                resolver
                    .resolve(keys::STATS_ENGINE, Some(server.as_str()), Some(domain))
                    .is_some()
            })
        });
    if !engine_everywhere {
        issues.push(ValidationIssue::MissingKey {
            key: keys::STATS_ENGINE,
        });
    }

    for domain in store.domains() {
        let servers = split_list(store.get(domain, "servers").unwrap_or_default());
        if servers.is_empty() {
            issues.push(ValidationIssue::EmptyServerList {
                domain: domain.to_owned(),
            });
        }
        for server in servers {
            if !store.has_section(&server) {
                issues.push(ValidationIssue::UnknownServer {
                    domain: domain.to_owned(),
                    server,
                });
            }
        }
    }

    const NUMERIC: [&str; 4] = [
        keys::MAX_CONCURRENT,
        keys::JOB_TIMEOUT,
        keys::BATCH_SIZE,
        keys::HISTORY_MONTHS,
    ];
    for section in store.sections() {
        for key in NUMERIC {
            if let Some(value) = store.get(section, key) {
                if value.trim().parse::<u64>().is_err() && !value.contains('$') {
                    issues.push(ValidationIssue::InvalidValue {
                        section: section.to_owned(),
                        key,
                        value: value.to_owned(),
                    });
                }
            }
        }
    }

    if strict && !issues.is_empty() {
        return Err(ValidationError { issues });
    }
    for issue in &issues {
        warn!(issue = %issue, "configuration validation warning");
    }
    Ok(issues)
}
