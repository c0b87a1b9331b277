#![deny(unsafe_code)]

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::error;

use logbatch_cli::{Args, driver, logging};

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(err) = logging::install(args.verbose) {
        eprintln!("logbatch: {err:#}");
    }

    match run(args) {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "run aborted");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<ExitCode> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(driver::run(args))
}
