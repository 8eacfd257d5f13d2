//! Embedded file backend
//!
//! The database file is opened on `connect` and closed on `disconnect`, so a
//! handle holds no file between jobs. Table locks are exclusive transactions.

use super::schema;
use super::statement::Statement;
use super::{ConnectStatus, DbConnection, DbError, Dialect, SqlValue};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteConnection {
    path: PathBuf,
    prefix: String,
    setup: bool,
    in_use: AtomicBool,
    db: Option<Connection>,
    statement: Option<Statement>,
    in_transaction: bool,
}

impl SqliteConnection {
    /// Creates a handle for `path`. With `setup` the schema is created on the
    /// first successful connect.
    pub fn new(path: impl AsRef<Path>, prefix: &str, setup: bool) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            prefix: prefix.to_string(),
            setup,
            in_use: AtomicBool::new(false),
            db: None,
            statement: None,
            in_transaction: false,
        }
    }

    fn open(&mut self) -> Result<(), DbError> {
        let db = Connection::open(&self.path)?;
        db.busy_timeout(BUSY_TIMEOUT)?;
        if self.setup {
            for sql in schema::create_statements(&self.prefix, Dialect::Sqlite) {
                db.execute_batch(&sql)?;
            }
            self.setup = false;
        }
        self.db = Some(db);
        Ok(())
    }

    fn run_query(&mut self) -> Result<(), DbError> {
        let db = self.db.as_ref().ok_or(DbError::NotConnected)?;
        let statement = self.statement.as_mut().ok_or(DbError::NoStatement)?;

        let mut stmt = db.prepare_cached(&statement.sql)?;
        let columns = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(statement.params.iter().map(to_sqlite)))?;
        let mut buffered = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns);
            for col in 0..columns {
                values.push(from_sqlite(row.get_ref(col)?));
            }
            buffered.push(values);
        }
        drop(rows);
        statement.set_rows(buffered);
        Ok(())
    }
}

fn to_sqlite(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Int(value) => Value::Integer(*value),
        SqlValue::Float(value) => Value::Real(*value),
        SqlValue::Text(value) => Value::Text(value.clone()),
        SqlValue::Blob(value) => Value::Blob(value.clone()),
    }
}

fn from_sqlite(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(value) => SqlValue::Int(value),
        ValueRef::Real(value) => SqlValue::Float(value),
        ValueRef::Text(value) => SqlValue::Text(String::from_utf8_lossy(value).into_owned()),
        ValueRef::Blob(value) => SqlValue::Blob(value.to_vec()),
    }
}

impl DbConnection for SqliteConnection {
    fn describe(&self) -> String {
        format!("DB: '{}'", self.path.display())
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn copy(&self) -> Box<dyn DbConnection> {
        Box::new(Self {
            path: self.path.clone(),
            prefix: self.prefix.clone(),
            setup: self.setup,
            in_use: AtomicBool::new(false),
            db: None,
            statement: None,
            in_transaction: false,
        })
    }

    fn connect(&mut self) -> ConnectStatus {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return ConnectStatus::InUse;
        }
        match self.open() {
            Ok(()) => ConnectStatus::Success,
            Err(e) => {
                self.db = None;
                self.in_use.store(false, Ordering::Release);
                ConnectStatus::Failure(e)
            }
        }
    }

    fn disconnect(&mut self) {
        self.statement = None;
        self.in_transaction = false;
        if self.db.take().is_some() {
            self.in_use.store(false, Ordering::Release);
        }
    }

    fn lock(&mut self, _table: &str) -> Result<(), DbError> {
        let db = self.db.as_ref().ok_or(DbError::NotConnected)?;
        db.execute_batch("BEGIN EXCLUSIVE TRANSACTION;")?;
        self.in_transaction = true;
        Ok(())
    }

    fn unlock(&mut self) -> Result<(), DbError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.statement = None;
        let db = self.db.as_ref().ok_or(DbError::NotConnected)?;
        if let Err(e) = db.execute_batch("COMMIT TRANSACTION;") {
            let _ = db.execute_batch("ROLLBACK;");
            return Err(e.into());
        }
        Ok(())
    }

    fn prepare_statement(&mut self, sql: &str) -> Result<(), DbError> {
        let db = self.db.as_ref().ok_or(DbError::NotConnected)?;
        let stmt = db.prepare_cached(sql)?;
        self.statement = Some(Statement::new(sql, Some(stmt.parameter_count())));
        Ok(())
    }

    fn bind(&mut self, index: usize, value: SqlValue) -> Result<(), DbError> {
        self.statement
            .as_mut()
            .ok_or(DbError::NoStatement)?
            .bind(index, value)
    }

    fn step(&mut self) -> Result<bool, DbError> {
        let executed = self
            .statement
            .as_ref()
            .ok_or(DbError::NoStatement)?
            .executed();
        if !executed {
            self.run_query()?;
        }
        Ok(self
            .statement
            .as_mut()
            .ok_or(DbError::NoStatement)?
            .advance())
    }

    fn execute_update(&mut self) -> Result<u64, DbError> {
        let db = self.db.as_ref().ok_or(DbError::NotConnected)?;
        let statement = self.statement.as_mut().ok_or(DbError::NoStatement)?;
        let mut stmt = db.prepare_cached(&statement.sql)?;
        let changed = stmt.execute(params_from_iter(statement.params.iter().map(to_sqlite)))?;
        statement.set_rows(Vec::new());
        Ok(changed as u64)
    }

    fn column(&self, col: usize) -> Result<&SqlValue, DbError> {
        self.statement
            .as_ref()
            .ok_or(DbError::NoStatement)?
            .column(col)
    }

    fn add_points(&mut self, name: &str, points: i32) -> Result<(), DbError> {
        let sql = format!(
            "INSERT INTO {}_points(Name, Points) VALUES (?, ?) \
             ON CONFLICT(Name) DO UPDATE SET Points=Points+?",
            self.prefix
        );
        self.prepare_statement(&sql)?;
        self.bind_string(1, name)?;
        self.bind_int(2, points)?;
        self.bind_int(3, points)?;
        self.execute_update()?;
        Ok(())
    }
}
