use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

const LOG_FILE: &str = "medlens.log";

static TELEMETRY_ENABLED: Lazy<RwLock<bool>> = Lazy::new(|| RwLock::new(false));

/** \brief 中继与控制器可能并发写日志，逐行串行追加。 */
static WRITE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

static CREDENTIAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"sk-ant-[A-Za-z0-9_\-]+").expect("credential regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Info => "INFO",
            Level::Error => "ERROR",
        })
    }
}

/**
 * \brief 日志目录，可通过 MEDLENS_LOG_DIR 覆盖，默认 `logs`。
 */
pub fn log_dir() -> PathBuf {
    std::env::var("MEDLENS_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("logs"))
}

pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = TELEMETRY_ENABLED.write() {
        *guard = enabled;
    }
}

pub fn is_enabled() -> bool {
    TELEMETRY_ENABLED.read().map(|g| *g).unwrap_or(false)
}

pub fn log_event(category: &str, message: &str) {
    record(Level::Info, category, message);
}

pub fn log_error(category: &str, message: &str) {
    record(Level::Error, category, message);
}

/**
 * \brief 凭据只保留 `sk-ant-` 前缀，其余替换为星号。
 * \details 上游错误信息可能回显请求中的密钥，写盘前统一脱敏。
 */
pub fn redact(message: &str) -> String {
    CREDENTIAL.replace_all(message, "sk-ant-***").into_owned()
}

/**
 * \brief 单行格式：`<RFC3339 时间> [<级别>] <分类> - <内容>`，内容中的换行折叠为空格。
 */
pub fn format_line(timestamp: &str, level: Level, category: &str, message: &str) -> String {
    let message = redact(message).replace(['\r', '\n'], " ");
    format!("{} [{}] {} - {}", timestamp, level, category, message)
}

fn record(level: Level, category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = append(level, category, message) {
        eprintln!("telemetry write failed: {}", err);
    }
}

fn append(level: Level, category: &str, message: &str) -> Result<()> {
    let dir = log_dir();
    std::fs::create_dir_all(&dir)?;
    let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let line = format_line(&timestamp, level, category, message);
    let _guard = WRITE_LOCK.lock().map_err(|_| anyhow::anyhow!("log lock poisoned"))?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE))?;
    writeln!(file, "{}", line)?;
    Ok(())
}
