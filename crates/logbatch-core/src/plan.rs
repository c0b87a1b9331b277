//! # plan 模块说明
//!
//! ## 契约 (What)
//! - 把已解析的配置展开为作业列表：每个启用的 (domain, server) 组合、每个统计周期各一个 [`Job`]；
//! - 周期为自然月 `YYYY-MM`，[`monthly_periods`] 给出截至当月的最近 N 个月，按时间升序；
//! - 作业编号即其在列表中的下标，[`Plan::partition`] 据此把 [`JobId`] 映射回分区。
//!
//! ## 逻辑 (How)
//! - 参数模板先按空白切分，再逐个替换 `{profile}` `{log}` `{output}` `{period}` `{domain}` `{server}`，
//!   因此替换值中的空格不会拆分参数；
//! - 某个组合缺少必填键时只跳过该组合并记入 [`Plan::failures`]，其余组合照常规划。

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{Datelike, NaiveDate};
use tracing::{debug, info, warn};

use crate::{
    config::{HierarchicalResolver, ServerSettings, settings::keys},
    error::{PlanError, ResolutionError},
    executor::{CommandDescriptor, Job, JobId},
    storage::PartitionKey,
};

/// 命令行选择的处理范围。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    /// 全部启用的域。
    All,
    Domain(String),
    Pair { domain: String, server: String },
}

impl Selection {
    pub fn from_args(domain: Option<String>, server: Option<String>) -> Self {
        match (domain, server) {
            (Some(domain), Some(server)) => Self::Pair { domain, server },
            (Some(domain), None) => Self::Domain(domain),
            (None, _) => Self::All,
        }
    }
}

/// 截至 `today` 所在月份（含）的最近 `months` 个自然月，旧的在前。
pub fn monthly_periods(today: NaiveDate, months: u32) -> Vec<String> {
    let current = i64::from(today.year()) * 12 + i64::from(today.month0());
    (0..i64::from(months.max(1)))
        .rev()
        .map(|back| {
            let index = current - back;
            format!("{:04}-{:02}", index.div_euclid(12), index.rem_euclid(12) + 1)
        })
        .collect()
}

/// 一个已规划的作业及其分区。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedJob {
    pub partition: PartitionKey,
    pub job: Job,
    pub output_path: PathBuf,
}

/// 无法规划的组合。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanFailure {
    pub domain: String,
    pub server: Option<String>,
    pub error: ResolutionError,
}

#[derive(Clone, Debug, Default)]
pub struct Plan {
    jobs: Vec<PlannedJob>,
    failures: Vec<PlanFailure>,
}

impl Plan {
    pub fn build(
        resolver: &HierarchicalResolver,
        selection: &Selection,
        periods: &[String],
    ) -> Result<Self, PlanError> {
        let store = resolver.store();
        let mut plan = Self::default();

        let domains: Vec<String> = match selection {
            Selection::All => store.domains().map(str::to_owned).collect(),
            Selection::Domain(domain) | Selection::Pair { domain, .. } => {
                if !store.domains().any(|known| known == domain) {
                    return Err(PlanError::UnknownDomain {
                        domain: domain.clone(),
                    });
                }
                vec![domain.clone()]
            }
        };

        for domain in domains {
            match resolver.resolve_flag(keys::ENABLED, None, Some(&domain), true) {
                Ok(true) => {}
                Ok(false) => {
                    if selection != &Selection::All {
                        return Err(PlanError::DomainDisabled { domain });
                    }
                    info!(domain = %domain, "domain disabled, skipping");
                    continue;
                }
                Err(error) => {
                    warn!(domain = %domain, code = error.code(), error = %error, "cannot plan domain");
                    plan.failures.push(PlanFailure {
                        domain,
                        server: None,
                        error,
                    });
                    continue;
                }
            }

            let servers = store.servers_of(&domain);
            let servers = match selection {
                Selection::Pair { server, .. } => {
                    if !servers.contains(server) {
                        return Err(PlanError::UnknownServer {
                            domain,
                            server: server.clone(),
                        });
                    }
                    vec![server.clone()]
                }
                _ => servers,
            };

            for server in servers {
                match ServerSettings::resolve(resolver, &domain, &server) {
                    Ok(settings) => {
                        for period in periods {
                            plan.jobs.push(plan_job(&settings, period));
                        }
                    }
                    Err(error) => {
                        warn!(
                            domain = %domain,
                            server = %server,
                            code = error.code(),
                            error = %error,
                            "cannot plan server"
                        );
                        plan.failures.push(PlanFailure {
                            domain: domain.clone(),
                            server: Some(server),
                            error,
                        });
                    }
                }
            }
        }

        info!(
            jobs = plan.jobs.len(),
            skipped = plan.failures.len(),
            periods = periods.len(),
            "job plan built"
        );
        Ok(plan)
    }

    /// 按提交顺序排列的全部作业。
    pub fn jobs(&self) -> &[PlannedJob] {
        &self.jobs
    }

    /// 规划阶段被跳过的组合及原因。
    pub fn failures(&self) -> &[PlanFailure] {
        &self.failures
    }

    /// 作业数量。
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// 是否没有任何可执行的作业。
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// 作业池分配的编号即提交下标。
    pub fn partition(&self, id: JobId) -> Option<&PartitionKey> {
        self.jobs.get(id.0).map(|planned| &planned.partition)
    }

    /// 按作业编号取回规划条目。
    pub fn planned(&self, id: JobId) -> Option<&PlannedJob> {
        self.jobs.get(id.0)
    }

    /// 提交给作业池的作业列表，顺序与规划一致。
    pub fn to_jobs(&self) -> Vec<Job> {
        self.jobs.iter().map(|planned| planned.job.clone()).collect()
    }

    /// 预先创建所有输出目录，统计引擎只负责写文件。
    pub fn ensure_output_dirs(&self) -> io::Result<()> {
        for planned in &self.jobs {
            if let Some(parent) = planned.output_path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

fn plan_job(settings: &ServerSettings, period: &str) -> PlannedJob {
    let partition = PartitionKey::new(&settings.domain, &settings.server, period);
    let log_path = settings
        .log_dir
        .join(settings.log_file.replace("{period}", period));
    let output_path = settings
        .output_dir
        .join(&settings.domain)
        .join(&settings.server)
        .join(format!("{period}.txt"));

    let substitutions = [
        ("{profile}", settings.profile.clone()),
        ("{log}", display(&log_path)),
        ("{output}", display(&output_path)),
        ("{period}", period.to_owned()),
        ("{domain}", settings.domain.clone()),
        ("{server}", settings.server.clone()),
    ];
    let args = settings.args_template.split_whitespace().map(|token| {
        substitutions
            .iter()
            .fold(token.to_owned(), |arg, (placeholder, value)| {
                arg.replace(placeholder, value)
            })
    });

    let command = CommandDescriptor::new(&settings.engine)
        .args(args)
        .output_path(&output_path);
    debug!(partition = %partition, command = %command, "job planned");

    PlannedJob {
        job: Job::new(partition.to_string(), command),
        partition,
        output_path,
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use std::{ffi::OsString, sync::Arc};

    use super::*;
    use crate::config::{ConfigStore, Environment};

    const CONFIG: &str = "\
[global]
stats_engine=/opt/stats/engine
log_dir=/var/log/web
output_dir=/srv/out
stats_args=-p {profile} -f {log} -o {output} -d {period}

[shop]
servers=web1,web2
profile=shop-main
log_file=access-{period}.log

[blog]
servers=web3
enabled=false

[web1]
[web2]
log_dir=/mnt/web2
[web3]
";

    fn resolver(text: &str) -> HierarchicalResolver {
        HierarchicalResolver::new(
            Arc::new(ConfigStore::parse(text)),
            Arc::new(Environment::empty()),
        )
    }

    fn periods() -> Vec<String> {
        vec!["2024-04".to_owned(), "2024-05".to_owned()]
    }

    #[test]
    fn periods_cross_year_boundary_oldest_first() {
        let today = NaiveDate::from_ymd_opt(2024, 2, 17).unwrap();
        assert_eq!(
            monthly_periods(today, 3),
            vec!["2023-12", "2024-01", "2024-02"]
        );
        assert_eq!(monthly_periods(today, 0), vec!["2024-02"]);
    }

    #[test]
    fn all_selection_skips_disabled_domains() {
        let plan = Plan::build(&resolver(CONFIG), &Selection::All, &periods()).unwrap();
        let labels: Vec<_> = plan.jobs().iter().map(|p| p.job.label.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                "shop/web1/2024-04",
                "shop/web1/2024-05",
                "shop/web2/2024-04",
                "shop/web2/2024-05",
            ]
        );
        assert!(plan.failures().is_empty());
        assert_eq!(
            plan.partition(JobId(3)),
            Some(&PartitionKey::new("shop", "web2", "2024-05"))
        );
        assert_eq!(plan.partition(JobId(4)), None);
    }

    #[test]
    fn arguments_are_split_then_substituted() {
        let plan = Plan::build(
            &resolver(CONFIG),
            &Selection::Pair {
                domain: "shop".into(),
                server: "web2".into(),
            },
            &periods()[..1],
        )
        .unwrap();
        let planned = &plan.jobs()[0];
        let args: Vec<OsString> = [
            "-p",
            "shop-main",
            "-f",
            "/mnt/web2/access-2024-04.log",
            "-o",
            "/srv/out/shop/web2/2024-04.txt",
            "-d",
            "2024-04",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        assert_eq!(planned.job.command.args, args);
        assert_eq!(planned.job.command.program, PathBuf::from("/opt/stats/engine"));
        assert_eq!(
            planned.job.command.output_path.as_deref(),
            Some(Path::new("/srv/out/shop/web2/2024-04.txt"))
        );
    }

    #[test]
    fn explicit_selection_is_checked_against_configuration() {
        let r = resolver(CONFIG);
        assert_eq!(
            Plan::build(&r, &Selection::Domain("nope".into()), &periods()).unwrap_err(),
            PlanError::UnknownDomain {
                domain: "nope".into()
            }
        );
        assert_eq!(
            Plan::build(
                &r,
                &Selection::Pair {
                    domain: "shop".into(),
                    server: "web3".into()
                },
                &periods()
            )
            .unwrap_err()
            .code(),
            "logbatch.plan.unknown_server"
        );
        assert!(matches!(
            Plan::build(&r, &Selection::Domain("blog".into()), &periods()),
            Err(PlanError::DomainDisabled { .. })
        ));
    }

    #[test]
    fn missing_required_key_skips_only_that_server() {
        let text = "[global]\nstats_engine=/e\n[shop]\nservers=web1,web2\n[web1]\nlog_dir=/l\n[web2]\n";
        let plan = Plan::build(&resolver(text), &Selection::All, &periods()).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.failures().len(), 1);
        assert_eq!(plan.failures()[0].server.as_deref(), Some("web2"));
        assert_eq!(plan.failures()[0].error.code(), "logbatch.config.key_missing");
    }

    #[test]
    fn selection_from_positional_args() {
        assert_eq!(Selection::from_args(None, None), Selection::All);
        assert_eq!(
            Selection::from_args(Some("shop".into()), None),
            Selection::Domain("shop".into())
        );
    }
}
