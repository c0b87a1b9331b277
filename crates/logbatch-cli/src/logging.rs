use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// 安装全局 Subscriber：`fmt` 层写 stderr，级别由 `RUST_LOG` 决定，缺省为 `info`（`-v` 时为 `debug`）。
///
/// stdout 只留给汇总、`--stats` 与 `--dry-run` 的输出。
pub fn install(verbose: bool) -> Result<()> {
    tracing_subscriber::registry()
        .with(build_env_filter(verbose))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("tracing subscriber already installed")
}

fn build_env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }))
}
