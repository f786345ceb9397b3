use anyhow::Result;
use rusqlite::{params, ErrorCode, OptionalExtension};

pub use rusqlite::Connection;
use std::{path::Path, thread, time::Duration};

const CREDENTIAL_KEY: &str = "api_key";
const TELEMETRY_KEY: &str = "telemetry_enabled";

/**
 * \brief 打开默认的本地设置库（当前目录下的 medlens.db），可通过 MEDLENS_DB 覆盖路径。
 */
pub fn open_default_db() -> Result<Connection> {
    let path = std::env::var("MEDLENS_DB").unwrap_or_else(|_| "medlens.db".to_string());
    open_db(Path::new(&path))
}

pub fn open_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 创建设置表。工作流数据只在内存中，不落库。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

fn set_config(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

fn get_config(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key=?1",
        params![key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(Into::into)
}

fn delete_config(conn: &Connection, key: &str) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM app_config WHERE key=?1", params![key]))?;
    Ok(())
}

/**
 * \brief 保存 API 凭据（仅本地）；空串等同于清除。
 */
pub fn save_credential(conn: &Connection, credential: &str) -> Result<()> {
    let trimmed = credential.trim();
    if trimmed.is_empty() {
        return clear_credential(conn);
    }
    set_config(conn, CREDENTIAL_KEY, trimmed)
}

pub fn load_credential(conn: &Connection) -> Result<Option<String>> {
    Ok(get_config(conn, CREDENTIAL_KEY)?.filter(|v| !v.trim().is_empty()))
}

pub fn clear_credential(conn: &Connection) -> Result<()> {
    delete_config(conn, CREDENTIAL_KEY)
}

/**
 * \brief 凭据脱敏展示：保留前 7 位与后 4 位。
 */
pub fn mask_credential(credential: &str) -> String {
    let chars: Vec<char> = credential.chars().collect();
    if chars.len() <= 12 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..7].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    Ok(get_config(conn, TELEMETRY_KEY)?
        .map(|s| s == "1")
        .unwrap_or(false))
}

pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_config(conn, TELEMETRY_KEY, if enabled { "1" } else { "0" })
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并线性退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
