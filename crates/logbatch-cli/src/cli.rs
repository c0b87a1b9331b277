use std::path::PathBuf;

use clap::Parser;
use logbatch_core::Selection;

/// 访问日志批处理：按配置为每个 (domain, server, 月份) 运行统计引擎并提交结果。
#[derive(Clone, Debug, Parser)]
#[command(name = "logbatch", version, about)]
pub struct Args {
    /// 配置文件路径。
    #[arg(short, long, default_value = "logbatch.conf")]
    pub config: PathBuf,

    /// 处理全部启用的域。
    #[arg(long, conflicts_with = "domain")]
    pub all: bool,

    /// 处理的月份数（含当月），覆盖 `history_months`。
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    pub months: Option<u32>,

    /// 并发进程上限，覆盖 `maxConcurrentProcesses`。
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    pub parallel: Option<u64>,

    /// 每条 INSERT 的最大行数，覆盖 `batch_size`。
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    pub batch_size: Option<u64>,

    /// 只解析配置并列出作业，不启动进程也不写入存储。
    #[arg(long)]
    pub dry_run: bool,

    /// 只校验配置。
    #[arg(long)]
    pub validate: bool,

    /// 校验问题按错误处理。
    #[arg(long)]
    pub strict: bool,

    /// 输出存储中的处理统计。
    #[arg(long, conflicts_with_all = ["dry_run", "validate"])]
    pub stats: bool,

    /// 以 JSON 输出汇总。
    #[arg(long)]
    pub json: bool,

    /// 提升日志级别到 debug（`RUST_LOG` 优先）。
    #[arg(short, long)]
    pub verbose: bool,

    /// 只处理该域。
    #[arg(required_unless_present_any = ["all", "stats", "validate"])]
    pub domain: Option<String>,

    /// 只处理该域下的该服务器。
    #[arg(requires = "domain")]
    pub server: Option<String>,
}

impl Args {
    pub fn selection(&self) -> Selection {
        if self.all {
            Selection::All
        } else {
            Selection::from_args(self.domain.clone(), self.server.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn positional_pair_selects_one_server() {
        let args = Args::try_parse_from(["logbatch", "--months", "3", "shop", "web1"]).unwrap();
        assert_eq!(args.months, Some(3));
        assert_eq!(
            args.selection(),
            Selection::Pair {
                domain: "shop".into(),
                server: "web1".into()
            }
        );
        assert_eq!(args.config, PathBuf::from("logbatch.conf"));
    }

    #[test]
    fn a_selection_is_required_for_processing() {
        assert!(Args::try_parse_from(["logbatch"]).is_err());
        assert!(Args::try_parse_from(["logbatch", "--all", "shop"]).is_err());
        assert!(Args::try_parse_from(["logbatch", "--parallel", "0", "--all"]).is_err());

        let args = Args::try_parse_from(["logbatch", "--stats"]).unwrap();
        assert!(args.stats);
        let args = Args::try_parse_from(["logbatch", "--all", "--dry-run", "-v"]).unwrap();
        assert_eq!(args.selection(), Selection::All);
        assert!(args.dry_run && args.verbose);
    }
}
