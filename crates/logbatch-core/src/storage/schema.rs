//! 存储表结构。报表层只读取这两张表。

pub const PARTITION_SUMMARY: &str = "partition_summary";
pub const PROCESSING_LOG: &str = "processing_log";

/// 幂等的建表语句，按顺序执行。
pub const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS partition_summary (
        domain TEXT NOT NULL,
        server TEXT NOT NULL,
        period TEXT NOT NULL,
        metric TEXT NOT NULL,
        value  REAL NOT NULL,
        PRIMARY KEY (domain, server, period, metric)
    )",
    "CREATE TABLE IF NOT EXISTS processing_log (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        domain            TEXT NOT NULL,
        server            TEXT NOT NULL,
        period            TEXT NOT NULL,
        status            TEXT NOT NULL,
        records_processed INTEGER NOT NULL DEFAULT 0,
        started_at        TEXT NOT NULL,
        completed_at      TEXT NOT NULL,
        detail            TEXT
    )",
    "CREATE INDEX IF NOT EXISTS processing_log_partition
        ON processing_log (domain, server, period)",
];
