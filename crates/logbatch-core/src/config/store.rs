use std::{collections::BTreeMap, fs, path::Path};

use tracing::debug;

use crate::error::ConfigError;

/// 兜底层的节名。
pub const GLOBAL_SECTION: &str = "global";

/// 单条配置记录：`(section, key, raw_value)`。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigEntry {
    pub section: String,
    pub key: String,
    pub raw_value: String,
}

/// 解析后的只读配置索引：section → key → 原始值。
///
/// ## 契约 (What)
/// - 空行与 `#` 开头的整行注释被忽略；`[name]` 开启新节；`key=value` 以首个 `=` 为界，值内可再含 `=`；
/// - 同一节内重复声明的键后写覆盖先写；同名节重复出现时合并到同一节；
/// - 格式不合法的行静默跳过，解析本身永不失败；
/// - 解析完成后不再变更，可在多个任务间共享只读引用。
///
/// ## 注意事项 (Trade-offs)
/// - 节外（首个 `[name]` 之前）的 `key=value` 没有归属，按不合法行处理。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigStore {
    sections: BTreeMap<String, BTreeMap<String, String>>,
    order: Vec<String>,
}

impl ConfigStore {
    /// 读取并解析配置文件。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self::parse(&text);
        debug!(
            path = %path.display(),
            sections = store.order.len(),
            "configuration loaded"
        );
        Ok(store)
    }

    /// 解析配置文本，永不失败。
    pub fn parse(text: &str) -> Self {
        let mut store = Self::default();
        let mut current: Option<String> = None;

        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(name) = section_header(line) {
                store.open_section(name);
                current = Some(name.to_owned());
                continue;
            }

            let (Some(section), Some((key, value))) = (current.as_ref(), line.split_once('='))
            else {
                debug!(line = line_no + 1, "skipping unrecognised configuration line");
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                debug!(line = line_no + 1, "skipping configuration line without key");
                continue;
            }
            store
                .sections
                .entry(section.clone())
                .or_default()
                .insert(key.to_owned(), value.trim().to_owned());
        }

        store
    }

    fn open_section(&mut self, name: &str) {
        if !self.sections.contains_key(name) {
            self.sections.insert(name.to_owned(), BTreeMap::new());
            self.order.push(name.to_owned());
        }
    }

    /// 查询 `(section, key)` 的原始值，不做变量展开。
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|entries| entries.get(key))
            .map(String::as_str)
    }

    /// 文件中是否出现过该节（即使节内没有键）。
    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    /// 按首次出现顺序返回节名。
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// 返回指定节的全部键值，节不存在时为空迭代器。
    pub fn section_entries(&self, section: &str) -> impl Iterator<Item = (&str, &str)> {
        self.sections
            .get(section)
            .into_iter()
            .flat_map(|entries| entries.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// 展平为 [`ConfigEntry`] 列表，按节出现顺序、节内按键名排序。
    pub fn entries(&self) -> Vec<ConfigEntry> {
        self.order
            .iter()
            .flat_map(|section| {
                self.section_entries(section).map(move |(key, value)| ConfigEntry {
                    section: section.clone(),
                    key: key.to_owned(),
                    raw_value: value.to_owned(),
                })
            })
            .collect()
    }

    /// 域节：带有 `servers=` 键的节，按出现顺序返回。
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.sections()
            .filter(|name| *name != GLOBAL_SECTION && self.get(name, "servers").is_some())
    }

    /// 域节 `servers=` 列表，逗号分隔，去除空白与空项。
    pub fn servers_of(&self, domain: &str) -> Vec<String> {
        self.get(domain, "servers")
            .map(split_list)
            .unwrap_or_default()
    }
}

fn section_header(line: &str) -> Option<&str> {
    let name = line.strip_prefix('[')?.strip_suffix(']')?.trim();
    (!name.is_empty()).then_some(name)
}

pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# comment line
[global]
retention_days=365
query=a=b=c

[example.com]
servers = web01, web02 ,,
retention_days=90
retention_days=120

not a valid line
[web01]
log_dir=/var/log/web01
"#;

    #[test]
    fn parses_sections_and_last_write_wins() {
        let store = ConfigStore::parse(SAMPLE);
        assert_eq!(store.get("global", "retention_days"), Some("365"));
        assert_eq!(store.get("example.com", "retention_days"), Some("120"));
        assert_eq!(store.get("web01", "log_dir"), Some("/var/log/web01"));
        assert_eq!(
            store.sections().collect::<Vec<_>>(),
            vec!["global", "example.com", "web01"]
        );
    }

    #[test]
    fn value_keeps_everything_after_first_equals() {
        let store = ConfigStore::parse(SAMPLE);
        assert_eq!(store.get("global", "query"), Some("a=b=c"));
    }

    #[test]
    fn domains_are_sections_with_servers_key() {
        let store = ConfigStore::parse(SAMPLE);
        assert_eq!(store.domains().collect::<Vec<_>>(), vec!["example.com"]);
        assert_eq!(store.servers_of("example.com"), vec!["web01", "web02"]);
        assert!(store.servers_of("web01").is_empty());
    }

    #[test]
    fn malformed_lines_and_orphan_keys_are_skipped() {
        let store = ConfigStore::parse("orphan=1\n[]\n[ok]\n=novalue\njunk\nk=v\n");
        assert_eq!(store.sections().collect::<Vec<_>>(), vec!["ok"]);
        assert_eq!(store.section_entries("ok").collect::<Vec<_>>(), vec![("k", "v")]);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = ConfigStore::load("/definitely/not/here.conf").unwrap_err();
        assert_eq!(err.code(), "logbatch.config.unreadable");
    }
}
