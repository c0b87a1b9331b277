//! logbatch 命令行驱动。
//!
//! 参数解析见 [`cli`]，日志初始化见 [`logging`]，规划、执行与提交的编排见 [`driver`]。

#![deny(unsafe_code)]

pub mod cli;
pub mod driver;
pub mod logging;

pub use cli::Args;
