//! 分层配置解析的集成验证
//!
//! - 优先级：server 节 → domain 节 → `[global]`，未声明的 server 节直接回落；
//! - 确定性：同一快照上的重复解析结果一致（Proptest 随机生成配置与查询）；
//! - 展开终止：循环引用在有限轮次内返回尽力而为的字面值，不会挂起。

use std::{io::Write, sync::Arc};

use logbatch_core::{
    ConfigStore, Environment, HierarchicalResolver, SourceScope,
    config::{ExpansionOutcome, MAX_EXPANSION_PASSES, VariableExpander, validate},
};
use proptest::prelude::*;

fn resolver_with(text: &str, env: Environment) -> HierarchicalResolver {
    HierarchicalResolver::new(Arc::new(ConfigStore::parse(text)), Arc::new(env))
}

fn resolver(text: &str) -> HierarchicalResolver {
    resolver_with(text, Environment::empty())
}

#[test]
fn server_override_wins_and_undeclared_server_falls_back_to_global() {
    let r = resolver(
        "[global]\nretention_days=365\n\n[domainA]\nservers=serverX\n\n[serverX]\nretention_days=30\n",
    );
    assert_eq!(
        r.resolve("retention_days", Some("serverX"), Some("domainA")).as_deref(),
        Some("30")
    );
    let fallback = r
        .resolve_detailed("retention_days", Some("serverY"), Some("domainA"))
        .expect("global value");
    assert_eq!(fallback.effective_value, "365");
    assert_eq!(fallback.source, SourceScope::Global);
    assert_eq!(r.resolve("missing", Some("serverX"), Some("domainA")), None);
}

#[test]
fn mutually_recursive_variables_terminate_with_a_literal() {
    let store = ConfigStore::parse("[global]\nA=$B\nB=$A\n");
    let env = Environment::empty();
    let expansion = VariableExpander::new(&store, &env).expand("$A");
    assert_eq!(expansion.outcome, ExpansionOutcome::PassLimit);
    assert!(expansion.passes <= MAX_EXPANSION_PASSES);
    assert!(expansion.value == "$A" || expansion.value == "$B");

    let r = resolver("[global]\nA=$B\nB=$A\n");
    let value = r.resolve("A", None, None).expect("best-effort value");
    assert!(value.starts_with('$'));
}

#[test]
fn environment_snapshot_is_consulted_before_global() {
    let env: Environment = [("LOG_ROOT", "/data/logs")].into_iter().collect();
    let r = resolver_with(
        "[global]\nLOG_ROOT=/fallback\nlog_dir=${LOG_ROOT}/web\narchive=$ARCHIVE_ROOT/old\nARCHIVE_ROOT=/archive\n",
        env,
    );
    assert_eq!(r.resolve("log_dir", None, None).as_deref(), Some("/data/logs/web"));
    assert_eq!(r.resolve("archive", None, None).as_deref(), Some("/archive/old"));
}

#[test]
fn configuration_file_round_trip_through_disk() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(
        file,
        "# sample\n[global]\nstats_engine=/opt/engine\nlog_dir=/logs\n[shop]\nservers=web1\n[web1]\nlog_dir=/logs/web1"
    )
    .expect("write config");

    let store = ConfigStore::load(file.path()).expect("load");
    let r = HierarchicalResolver::new(Arc::new(store), Arc::new(Environment::empty()));
    assert!(validate(&r, true).expect("clean configuration").is_empty());
    assert_eq!(
        r.resolve("log_dir", Some("web1"), Some("shop")).as_deref(),
        Some("/logs/web1")
    );
}

#[test]
fn missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let err = ConfigStore::load(dir.path().join("absent.conf")).expect_err("must fail");
    assert_eq!(err.code(), "logbatch.config.unreadable");
}

fn identifier() -> impl Strategy<Value = String> {
    "[a-c][a-z0-9_]{0,3}"
}

fn value() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z0-9/]{0,6}",
        identifier().prop_map(|name| format!("${name}")),
        identifier().prop_map(|name| format!("x${{{name}}}y")),
    ]
}

fn config_text() -> impl Strategy<Value = String> {
    let section = (
        prop_oneof![Just("global".to_owned()), identifier()],
        prop::collection::vec((identifier(), value()), 0..5),
    );
    prop::collection::vec(section, 0..5).prop_map(|sections| {
        let mut text = String::new();
        for (name, entries) in sections {
            text.push_str(&format!("[{name}]\n"));
            for (key, value) in entries {
                text.push_str(&format!("{key}={value}\n"));
            }
        }
        text
    })
}

proptest! {
    #[test]
    fn resolution_is_deterministic(
        text in config_text(),
        key in identifier(),
        server in proptest::option::of(identifier()),
        domain in proptest::option::of(identifier()),
    ) {
        let r = resolver(&text);
        let first = r.resolve_detailed(&key, server.as_deref(), domain.as_deref());
        let second = r.resolve_detailed(&key, server.as_deref(), domain.as_deref());
        prop_assert_eq!(&first, &second);

        let reparsed = resolver(&text);
        prop_assert_eq!(first, reparsed.resolve_detailed(&key, server.as_deref(), domain.as_deref()));
    }

    #[test]
    fn expansion_always_terminates_within_the_pass_limit(text in config_text(), raw in value()) {
        let store = ConfigStore::parse(&text);
        let env = Environment::empty();
        let expansion = VariableExpander::new(&store, &env).expand(&raw);
        prop_assert!(expansion.passes <= MAX_EXPANSION_PASSES);
    }
}
