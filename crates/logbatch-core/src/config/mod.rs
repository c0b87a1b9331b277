//! # config 模块
//!
//! 配置文件解析为只读索引 [`ConfigStore`]，经 [`HierarchicalResolver`] 按
//! server → domain → global 三层优先级查询，值内的 `${VAR}` / `$VAR` 由
//! [`VariableExpander`] 在有界轮数内展开。
//!
//! 文件格式：
//!
//! ```text
//! # 注释
//! [global]
//! stats_engine=/usr/local/bin/engine
//! log_root=${HOME}/logs
//!
//! [example.com]
//! servers=web01,web02
//!
//! [web01]
//! log_dir=$log_root/web01
//! ```

mod expand;
mod resolve;
pub mod settings;
mod store;

pub use expand::{
    Environment, Expansion, ExpansionOutcome, MAX_EXPANDED_LEN, MAX_EXPANSION_PASSES,
    VariableExpander,
};
pub use resolve::{HierarchicalResolver, ResolvedValue, SourceScope};
pub use settings::{RunSettings, ServerSettings, ValidationIssue, validate};
pub use store::{ConfigEntry, ConfigStore, GLOBAL_SECTION};
