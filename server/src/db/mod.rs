//! Database connections and the SQL job pool
//!
//! [`DbConnection`] is the capability surface every backend offers. Statements
//! are prepared, parameters bound with 1-based indices, and rows fetched with
//! [`DbConnection::step`]. Result columns are 1-based as well.
//!
//! Connections are created on the game thread (which does no I/O) and handed to
//! the [`pool::ConnectionPool`], whose worker threads own them from then on.

pub mod mysql;
pub mod pool;
pub mod schema;
pub mod score;
pub mod sqlite;

mod statement;

use std::fmt;
use thiserror::Error;

pub use mysql::{MysqlConfig, MysqlConnection};
pub use pool::{ConnectionPool, Mode, SqlResult, WriteTag};
pub use sqlite::SqliteConnection;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("MySQL error: {0}")]
    Mysql(#[from] sqlx::Error),
    #[error("connection is already in use")]
    InUse,
    #[error("not connected")]
    NotConnected,
    #[error("no statement prepared")]
    NoStatement,
    #[error("bind index {0} out of range")]
    BindIndex(usize),
    #[error("no current row")]
    NoRow,
    #[error("column {0} out of range")]
    Column(usize),
    #[error("column {col} has type {found}, expected {expected}")]
    ColumnType {
        col: usize,
        expected: &'static str,
        found: &'static str,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("job panicked")]
    Panic,
    #[error("{0}")]
    Job(String),
}

/// A bound parameter or a fetched column value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Int(_) => "int",
            SqlValue::Float(_) => "float",
            SqlValue::Text(_) => "text",
            SqlValue::Blob(_) => "blob",
        }
    }
}

/// Outcome of [`DbConnection::connect`]
#[derive(Debug)]
pub enum ConnectStatus {
    /// Another holder of the same physical connection is active; try another
    /// backend instead of treating this as an error
    InUse,
    Success,
    Failure(DbError),
}

/// SQL flavour of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Mysql,
}

impl Dialect {
    pub fn insert_ignore(self) -> &'static str {
        match self {
            Dialect::Sqlite => "INSERT OR IGNORE",
            Dialect::Mysql => "INSERT IGNORE",
        }
    }

    /// Placeholder expression that stores a bound timestamp as UTC
    pub fn insert_timestamp_as_utc(self) -> &'static str {
        match self {
            Dialect::Sqlite => "DATETIME(?, 'utc')",
            Dialect::Mysql => "?",
        }
    }

    pub fn collate_nocase(self) -> &'static str {
        match self {
            Dialect::Sqlite => "? COLLATE NOCASE",
            Dialect::Mysql => "?",
        }
    }

    pub fn binary_collate(self) -> &'static str {
        match self {
            Dialect::Sqlite => "BINARY",
            Dialect::Mysql => "utf8mb4_bin",
        }
    }

    pub fn random(self) -> &'static str {
        match self {
            Dialect::Sqlite => "RANDOM()",
            Dialect::Mysql => "RAND()",
        }
    }

    /// Column type used for the team id blob
    pub fn blob_id_type(self) -> &'static str {
        match self {
            Dialect::Sqlite => "BLOB",
            Dialect::Mysql => "VARBINARY(16)",
        }
    }

    pub fn to_unix_timestamp(self, timestamp: &str) -> String {
        match self {
            Dialect::Sqlite => format!("strftime('%s', {})", timestamp),
            Dialect::Mysql => format!("UNIX_TIMESTAMP({})", timestamp),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Sqlite => write!(f, "SQLite"),
            Dialect::Mysql => write!(f, "MySQL"),
        }
    }
}

/// One database backend. Owned by exactly one worker thread at a time.
pub trait DbConnection: Send {
    /// Status line shown by `dump_sqlservers`
    fn describe(&self) -> String;
    /// Table name prefix
    fn prefix(&self) -> &str;
    fn dialect(&self) -> Dialect;
    /// New handle to the same backend with its own in-use guard
    fn copy(&self) -> Box<dyn DbConnection>;

    fn connect(&mut self) -> ConnectStatus;
    fn disconnect(&mut self);

    /// Exclusive access to `table` until [`DbConnection::unlock`]. Prefer
    /// [`TableLock`], which releases on every exit path.
    fn lock(&mut self, table: &str) -> Result<(), DbError>;
    /// Releases a lock taken with [`DbConnection::lock`]; no-op without one
    fn unlock(&mut self) -> Result<(), DbError>;

    fn prepare_statement(&mut self, sql: &str) -> Result<(), DbError>;
    fn bind(&mut self, index: usize, value: SqlValue) -> Result<(), DbError>;
    /// Advances to the next result row. `Ok(false)` once exhausted.
    fn step(&mut self) -> Result<bool, DbError>;
    /// Runs the prepared statement, returning the number of affected rows
    fn execute_update(&mut self) -> Result<u64, DbError>;
    fn column(&self, col: usize) -> Result<&SqlValue, DbError>;

    /// Adds `points` to the total of `name`, creating the row if needed
    fn add_points(&mut self, name: &str, points: i32) -> Result<(), DbError>;

    fn bind_string(&mut self, index: usize, value: &str) -> Result<(), DbError> {
        self.bind(index, SqlValue::Text(value.to_string()))
    }

    fn bind_blob(&mut self, index: usize, value: &[u8]) -> Result<(), DbError> {
        self.bind(index, SqlValue::Blob(value.to_vec()))
    }

    fn bind_int(&mut self, index: usize, value: i32) -> Result<(), DbError> {
        self.bind(index, SqlValue::Int(value as i64))
    }

    fn bind_int64(&mut self, index: usize, value: i64) -> Result<(), DbError> {
        self.bind(index, SqlValue::Int(value))
    }

    fn bind_float(&mut self, index: usize, value: f32) -> Result<(), DbError> {
        self.bind(index, SqlValue::Float(value as f64))
    }

    fn bind_null(&mut self, index: usize) -> Result<(), DbError> {
        self.bind(index, SqlValue::Null)
    }

    fn is_null(&self, col: usize) -> Result<bool, DbError> {
        Ok(matches!(self.column(col)?, SqlValue::Null))
    }

    fn get_int64(&self, col: usize) -> Result<i64, DbError> {
        match self.column(col)? {
            SqlValue::Int(value) => Ok(*value),
            SqlValue::Float(value) => Ok(*value as i64),
            SqlValue::Null => Ok(0),
            other => Err(DbError::ColumnType {
                col,
                expected: "int",
                found: other.type_name(),
            }),
        }
    }

    fn get_int(&self, col: usize) -> Result<i32, DbError> {
        self.get_int64(col).map(|value| value as i32)
    }

    fn get_float(&self, col: usize) -> Result<f32, DbError> {
        match self.column(col)? {
            SqlValue::Float(value) => Ok(*value as f32),
            SqlValue::Int(value) => Ok(*value as f32),
            SqlValue::Null => Ok(0.0),
            other => Err(DbError::ColumnType {
                col,
                expected: "float",
                found: other.type_name(),
            }),
        }
    }

    fn get_string(&self, col: usize) -> Result<String, DbError> {
        match self.column(col)? {
            SqlValue::Text(value) => Ok(value.clone()),
            SqlValue::Blob(value) => Ok(String::from_utf8_lossy(value).into_owned()),
            SqlValue::Int(value) => Ok(value.to_string()),
            SqlValue::Float(value) => Ok(value.to_string()),
            SqlValue::Null => Ok(String::new()),
        }
    }

    fn get_blob(&self, col: usize) -> Result<Vec<u8>, DbError> {
        match self.column(col)? {
            SqlValue::Blob(value) => Ok(value.clone()),
            SqlValue::Text(value) => Ok(value.as_bytes().to_vec()),
            SqlValue::Null => Ok(Vec::new()),
            other => Err(DbError::ColumnType {
                col,
                expected: "blob",
                found: other.type_name(),
            }),
        }
    }
}

/// Scoped table lock, released when dropped
pub struct TableLock<'a> {
    conn: &'a mut dyn DbConnection,
}

impl<'a> TableLock<'a> {
    pub fn acquire(conn: &'a mut dyn DbConnection, table: &str) -> Result<Self, DbError> {
        conn.lock(table)?;
        Ok(Self { conn })
    }
}

impl<'a> std::ops::Deref for TableLock<'a> {
    type Target = dyn DbConnection + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.conn
    }
}

impl<'a> std::ops::DerefMut for TableLock<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.conn
    }
}

impl Drop for TableLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.conn.unlock() {
            log::error!("failed to release table lock: {}", e);
        }
    }
}
