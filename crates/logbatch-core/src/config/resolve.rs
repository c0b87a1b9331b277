use std::{fmt, str::FromStr, sync::Arc};

use tracing::warn;

use super::{
    expand::{Environment, ExpansionOutcome, VariableExpander},
    store::{ConfigStore, GLOBAL_SECTION},
};
use crate::error::ResolutionError;

/// 命中值所在的作用域层级。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceScope {
    Server,
    Domain,
    Global,
}

impl SourceScope {
    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Domain => "domain",
            Self::Global => "global",
        }
    }
}

impl fmt::Display for SourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次解析的完整结果，每次查询重新计算，不做缓存。
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ResolvedValue {
    pub key: String,
    pub server: Option<String>,
    pub domain: Option<String>,
    pub effective_value: String,
    pub source: SourceScope,
}

/// 三层优先级解析器：server → domain → global。
///
/// # 契约说明 (What)
/// - `resolve(key, server, domain)`：按 server 节、domain 节、`[global]` 节依次查找，首个命中的原始值
///   经变量展开后返回；三层均未命中返回 `None`，由调用方决定默认值或报错；
/// - 解析是 `(key, server, domain, 配置快照)` 的纯函数：不保存任何覆盖状态，相同输入必得相同输出；
/// - 配置与环境快照以 `Arc` 共享，解析器可廉价克隆并在多个任务间并发使用。
///
/// # 注意事项 (Trade-offs)
/// - 未声明的 server 节与不存在的节等价，直接回落到下一层；
/// - 变量展开命中轮数上限时只记录 WARN，仍返回尽力而为的结果。
#[derive(Clone, Debug)]
pub struct HierarchicalResolver {
    store: Arc<ConfigStore>,
    env: Arc<Environment>,
}

impl HierarchicalResolver {
    pub fn new(store: Arc<ConfigStore>, env: Arc<Environment>) -> Self {
        Self { store, env }
    }

    /// 底层配置索引。
    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// 解析时使用的环境快照。
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// 返回生效值。
    pub fn resolve(&self, key: &str, server: Option<&str>, domain: Option<&str>) -> Option<String> {
        self.resolve_detailed(key, server, domain)
            .map(|resolved| resolved.effective_value)
    }

    /// 返回生效值及其来源层级。
    pub fn resolve_detailed(
        &self,
        key: &str,
        server: Option<&str>,
        domain: Option<&str>,
    ) -> Option<ResolvedValue> {
        let tiers = [
            (server, SourceScope::Server),
            (domain, SourceScope::Domain),
            (Some(GLOBAL_SECTION), SourceScope::Global),
        ];
        let (raw, source) = tiers.into_iter().find_map(|(section, scope)| {
            section
                .and_then(|name| self.store.get(name, key))
                .map(|raw| (raw, scope))
        })?;

        let expansion = VariableExpander::new(&self.store, &self.env).expand(raw);
        if expansion.outcome == ExpansionOutcome::PassLimit {
            warn!(
                key,
                scope = %source,
                passes = expansion.passes,
                "variable expansion hit the pass limit, keeping best-effort value"
            );
        }

        Some(ResolvedValue {
            key: key.to_owned(),
            server: server.map(str::to_owned),
            domain: domain.map(str::to_owned),
            effective_value: expansion.value,
            source,
        })
    }

    /// 必填键：三层均未命中时返回 [`ResolutionError::Missing`]。
    pub fn require(
        &self,
        key: &str,
        server: Option<&str>,
        domain: Option<&str>,
    ) -> Result<String, ResolutionError> {
        self.resolve(key, server, domain)
            .ok_or_else(|| ResolutionError::Missing {
                key: key.to_owned(),
                server: server.map(str::to_owned),
                domain: domain.map(str::to_owned),
            })
    }

    /// 解析并转换为 `T`；未命中时返回 `default`。
    pub fn resolve_or<T>(
        &self,
        key: &str,
        server: Option<&str>,
        domain: Option<&str>,
        default: T,
    ) -> Result<T, ResolutionError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.resolve(key, server, domain) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|err: T::Err| ResolutionError::Invalid {
                key: key.to_owned(),
                reason: err.to_string(),
                value,
            }),
        }
    }

    /// 解析布尔开关，接受 `true/false`、`1/0`、`yes/no`、`on/off`（大小写不敏感）。
    pub fn resolve_flag(
        &self,
        key: &str,
        server: Option<&str>,
        domain: Option<&str>,
        default: bool,
    ) -> Result<bool, ResolutionError> {
        let Some(value) = self.resolve(key, server, domain) else {
            return Ok(default);
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ResolutionError::Invalid {
                key: key.to_owned(),
                value,
                reason: "expected a boolean".to_owned(),
            }),
        }
    }
}
