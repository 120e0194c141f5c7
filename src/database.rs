//! Database access for addon SQL scripts.
//!
//! Addons may ship an `install.sql` that is replayed on install and upgrade.
//! Statements are executed one at a time and a failing statement never stops
//! the rest of the script, so re-running a script is harmless.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// SQL script file name inside an addon directory.
pub const SQL_FILE: &str = "install.sql";

/// Table prefix placeholder used in addon scripts.
pub const PREFIX_TOKEN: &str = "__PREFIX__";

static PREFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)__PREFIX__").expect("valid regex"));
static INSERT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)INSERT INTO ").expect("valid regex"));

/// Connection-level operations the lifecycle needs.
pub trait Database {
    fn begin(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;
    fn execute(&mut self, sql: &str) -> Result<()>;

    /// Configured table prefix substituted for `__PREFIX__`.
    fn prefix(&self) -> &str;

    /// Insert keyword that skips rows violating a unique key.
    fn insert_ignore(&self) -> &'static str {
        "INSERT IGNORE INTO "
    }
}

/// SQLite-backed database.
pub struct SqliteDatabase {
    conn: Connection,
    prefix: String,
}

impl SqliteDatabase {
    pub fn open(path: &Path, prefix: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create database directory: {:?}", parent))?;
        }
        let conn =
            Connection::open(path).context(format!("Failed to open database: {:?}", path))?;
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    pub fn open_in_memory(prefix: &str) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    /// Underlying connection, for callers that need to query.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Database for SqliteDatabase {
    fn begin(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn insert_ignore(&self) -> &'static str {
        "INSERT OR IGNORE INTO "
    }
}

/// A statement that failed during import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlFailure {
    pub statement: String,
    pub error: String,
}

/// What happened while replaying an addon's SQL script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlImportReport {
    pub executed: usize,
    pub failed: Vec<SqlFailure>,
}

impl SqlImportReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Split a script into statements.
///
/// Lines starting with `--` or `/*` and blank lines are skipped. Lines are
/// accumulated until one ends with `;`. Trailing text without a terminator
/// is dropped.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut buffer = String::new();

    for line in script.lines() {
        if line.starts_with("--") || line.starts_with("/*") || line.trim().is_empty() {
            continue;
        }
        buffer.push_str(line);
        buffer.push('\n');
        if line.trim_end().ends_with(';') {
            statements.push(std::mem::take(&mut buffer));
        }
    }

    statements
}

/// Apply the table prefix and the duplicate-tolerant insert keyword.
pub fn rewrite_statement(statement: &str, prefix: &str, insert_ignore: &str) -> String {
    let prefixed = PREFIX_RE.replace_all(statement, regex::NoExpand(prefix));
    INSERT_RE
        .replace_all(&prefixed, regex::NoExpand(insert_ignore))
        .into_owned()
}

/// Replay `<addon_dir>/install.sql` against `db`. A missing script is a no-op.
///
/// Only reading the script can fail; statement failures are collected in the
/// report and logged.
pub fn import_sql(db: &mut dyn Database, addon_dir: &Path) -> Result<SqlImportReport> {
    let path = addon_dir.join(SQL_FILE);
    let mut report = SqlImportReport::default();
    if !path.is_file() {
        debug!("[ADDON-SQL] No {} in {:?}", SQL_FILE, addon_dir);
        return Ok(report);
    }

    // Scripts are not always UTF-8; bad bytes only spoil the line they are on.
    let bytes = fs::read(&path).context(format!("Failed to read SQL script: {:?}", path))?;
    let script = String::from_utf8_lossy(&bytes);
    let prefix = db.prefix().to_string();
    let insert_ignore = db.insert_ignore();

    for statement in split_statements(&script) {
        let sql = rewrite_statement(&statement, &prefix, insert_ignore);
        match db.execute(&sql) {
            Ok(()) => report.executed += 1,
            Err(e) => {
                warn!("[ADDON-SQL] Statement skipped: {:#}", e);
                report.failed.push(SqlFailure {
                    statement: sql.trim().to_string(),
                    error: format!("{:#}", e),
                });
            }
        }
    }

    info!(
        "[ADDON-SQL] {:?}: {} executed, {} failed",
        path,
        report.executed,
        report.failed.len()
    );
    Ok(report)
}
