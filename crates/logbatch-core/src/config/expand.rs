use std::collections::BTreeMap;

use super::store::{ConfigStore, GLOBAL_SECTION};

/// 展开的最大轮数。
pub const MAX_EXPANSION_PASSES: usize = 5;

/// 展开结果的最大字节数；自引用值（如 `X=$X$X`）每轮按倍数增长，超出即按轮数上限处理。
pub const MAX_EXPANDED_LEN: usize = 64 * 1024;

/// 启动时捕获的进程环境变量快照。
///
/// 解析链路内部不直接读取 `std::env`，所有环境查询都经由该快照完成。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// 捕获当前进程的环境变量；只应在进程入口调用一次。
    /// 非 UTF-8 的变量被忽略。
    pub fn capture() -> Self {
        std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect()
    }

    /// 空快照，测试与不依赖环境的调用方使用。
    pub fn empty() -> Self {
        Self::default()
    }

    /// 按名称查询变量值。
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// 快照中的变量个数。
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// 快照是否不含任何变量。
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Environment
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// 展开结束的方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpansionOutcome {
    /// 某一轮替换后文本不再变化。
    Stable,
    /// 达到轮数上限仍在变化，通常意味着循环引用；返回的是最后一轮结果。
    PassLimit,
}

/// 一次展开的结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expansion {
    pub value: String,
    pub passes: usize,
    pub outcome: ExpansionOutcome,
}

/// `${NAME}` / `$NAME` 变量展开器。
///
/// ## 契约 (What)
/// - 每个变量依次在环境快照、`[global]` 节原始值中查找，均未命中时保留字面文本；
/// - 展开按轮进行，单轮替换全部变量；文本不再变化时结束，最多 [`MAX_EXPANSION_PASSES`] 轮；
/// - 循环引用（如 `A=$B`、`B=$A`）在轮数上限处停止，返回尽力而为的结果而非报错；
/// - 某一轮结果超过 [`MAX_EXPANDED_LEN`] 时立即停止，返回上一轮的文本并标记为 `PassLimit`。
///
/// ## 逻辑 (How)
/// - `$NAME` 中的名称由 `[A-Za-z_][A-Za-z0-9_]*` 组成；`${` 未闭合或名称为空时按字面保留；
/// - 引用 `[global]` 的值先以原始文本代入，其内部引用在后续轮次中继续展开。
#[derive(Clone, Copy, Debug)]
pub struct VariableExpander<'a> {
    store: &'a ConfigStore,
    env: &'a Environment,
}

impl<'a> VariableExpander<'a> {
    pub fn new(store: &'a ConfigStore, env: &'a Environment) -> Self {
        Self { store, env }
    }

    /// 按轮展开 `raw`，直到文本稳定、达到轮数上限或超出长度上限。
    pub fn expand(&self, raw: &str) -> Expansion {
        let mut current = raw.to_owned();
        for pass in 1..=MAX_EXPANSION_PASSES {
            let (next, substituted) = self.expand_once(&current);
            if !substituted || next == current {
                return Expansion {
                    value: next,
                    passes: pass,
                    outcome: ExpansionOutcome::Stable,
                };
            }
            if next.len() > MAX_EXPANDED_LEN {
                return Expansion {
                    value: current,
                    passes: pass,
                    outcome: ExpansionOutcome::PassLimit,
                };
            }
            current = next;
        }
        Expansion {
            value: current,
            passes: MAX_EXPANSION_PASSES,
            outcome: ExpansionOutcome::PassLimit,
        }
    }

    fn lookup(&self, name: &str) -> Option<&'a str> {
        self.env
            .get(name)
            .or_else(|| self.store.get(GLOBAL_SECTION, name))
    }

    /// 单轮替换，返回新文本以及是否发生过替换。
    fn expand_once(&self, input: &str) -> (String, bool) {
        let mut out = String::with_capacity(input.len());
        let mut substituted = false;
        let mut rest = input;

        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];

            let (name, consumed) = match parse_reference(after) {
                Some(found) => found,
                None => {
                    out.push('$');
                    rest = after;
                    continue;
                }
            };

            match self.lookup(name) {
                Some(value) => {
                    out.push_str(value);
                    substituted = true;
                }
                None => out.push_str(&rest[pos..pos + 1 + consumed]),
            }
            rest = &after[consumed..];
        }
        out.push_str(rest);
        (out, substituted)
    }
}

/// 解析 `$` 之后的变量引用，返回名称与消耗的字节数。
fn parse_reference(after: &str) -> Option<(&str, usize)> {
    if let Some(braced) = after.strip_prefix('{') {
        let end = braced.find('}')?;
        let name = &braced[..end];
        return is_identifier(name).then_some((name, end + 2));
    }
    let len = identifier_len(after);
    (len > 0).then(|| (&after[..len], len))
}

fn identifier_len(s: &str) -> usize {
    let mut len = 0;
    for (idx, ch) in s.char_indices() {
        let ok = if idx == 0 {
            ch.is_ascii_alphabetic() || ch == '_'
        } else {
            ch.is_ascii_alphanumeric() || ch == '_'
        };
        if !ok {
            break;
        }
        len = idx + ch.len_utf8();
    }
    len
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && identifier_len(name) == name.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (ConfigStore, Environment) {
        let store = ConfigStore::parse(
            "[global]\nroot=/srv\nlogs=${root}/logs\nA=$B\nB=$A\nGROW=x$GROW\n",
        );
        let env = Environment::from_iter([("HOME", "/home/ops"), ("root", "/env-root")]);
        (store, env)
    }

    #[test]
    fn environment_takes_precedence_over_global() {
        let (store, env) = fixture();
        let expander = VariableExpander::new(&store, &env);
        assert_eq!(expander.expand("$root/x").value, "/env-root/x");
        assert_eq!(expander.expand("${HOME}/.cfg").value, "/home/ops/.cfg");
    }

    #[test]
    fn nested_global_references_expand_over_passes() {
        let store = ConfigStore::parse("[global]\nroot=/srv\nlogs=${root}/logs\n");
        let env = Environment::empty();
        let expanded = VariableExpander::new(&store, &env).expand("$logs/web");
        assert_eq!(expanded.value, "/srv/logs/web");
        assert_eq!(expanded.outcome, ExpansionOutcome::Stable);
    }

    #[test]
    fn unresolved_and_malformed_tokens_stay_literal() {
        let (store, env) = fixture();
        let expander = VariableExpander::new(&store, &env);
        assert_eq!(expander.expand("$MISSING and ${ALSO}").value, "$MISSING and ${ALSO}");
        assert_eq!(expander.expand("cost: $5, ${unterminated").value, "cost: $5, ${unterminated");
        assert_eq!(expander.expand("trailing $").value, "trailing $");
    }

    #[test]
    fn cyclic_references_stop_at_pass_limit() {
        let (store, env) = fixture();
        let expander = VariableExpander::new(&store, &env);
        let expanded = expander.expand("$A");
        assert_eq!(expanded.outcome, ExpansionOutcome::PassLimit);
        assert_eq!(expanded.passes, MAX_EXPANSION_PASSES);
        assert!(expanded.value == "$A" || expanded.value == "$B");

        let grown = expander.expand("$GROW");
        assert_eq!(grown.outcome, ExpansionOutcome::PassLimit);
        assert!(grown.value.starts_with("xxxx"));
    }

    #[test]
    fn self_multiplying_reference_is_capped_by_length() {
        let store = ConfigStore::parse(&format!("[global]\nX={}\n", "$X".repeat(16)));
        let env = Environment::empty();
        let expanded = VariableExpander::new(&store, &env).expand("$X");
        assert_eq!(expanded.outcome, ExpansionOutcome::PassLimit);
        assert!(expanded.passes < MAX_EXPANSION_PASSES);
        assert!(expanded.value.len() <= MAX_EXPANDED_LEN);
        assert!(expanded.value.starts_with("$X$X"));
    }
}
