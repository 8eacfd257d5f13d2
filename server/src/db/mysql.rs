//! Network SQL backend on top of `sqlx`
//!
//! Each handle drives its connection from a private current-thread runtime,
//! so it can be used from the blocking pool worker threads. The physical
//! connection is kept across jobs and pinged before reuse.

use super::schema;
use super::statement::Statement;
use super::{ConnectStatus, DbConnection, DbError, Dialect, SqlValue};
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions, Connection, MySql, Row, TypeInfo, ValueRef};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::{Builder, Runtime};

/// Credentials and placement of one MySQL server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MysqlConfig {
    pub database: String,
    pub prefix: String,
    pub user: String,
    pub password: String,
    pub ip: String,
    pub port: u16,
    /// Create database and tables on first connect
    pub setup: bool,
}

pub struct MysqlConnection {
    config: MysqlConfig,
    setup: bool,
    in_use: AtomicBool,
    runtime: Option<Runtime>,
    conn: Option<sqlx::MySqlConnection>,
    statement: Option<Statement>,
    locked: bool,
}

impl MysqlConnection {
    pub fn new(config: MysqlConfig) -> Self {
        let setup = config.setup;
        Self {
            config,
            setup,
            in_use: AtomicBool::new(false),
            runtime: None,
            conn: None,
            statement: None,
            locked: false,
        }
    }

    pub fn config(&self) -> &MysqlConfig {
        &self.config
    }

    fn open(&mut self) -> Result<(), DbError> {
        if self.runtime.is_none() {
            self.runtime = Some(Builder::new_current_thread().enable_all().build()?);
        }
        let runtime = self.runtime.as_ref().ok_or(DbError::NotConnected)?;
        let config = &self.config;

        if let Some(mut conn) = self.conn.take() {
            if runtime.block_on(conn.ping()).is_ok() {
                self.conn = Some(conn);
                return Ok(());
            }
            log::warn!("lost connection to {}, reconnecting", config.ip);
        }

        let options = MySqlConnectOptions::new()
            .host(&config.ip)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .charset("utf8mb4");
        let setup = self.setup;

        let conn = runtime.block_on(async {
            let mut conn = options.connect().await?;
            if setup {
                let create = format!(
                    "CREATE DATABASE IF NOT EXISTS {} CHARACTER SET utf8mb4",
                    config.database
                );
                sqlx::raw_sql(&create).execute(&mut conn).await?;
            }
            let use_db = format!("USE {}", config.database);
            sqlx::raw_sql(&use_db).execute(&mut conn).await?;
            if setup {
                for sql in schema::create_statements(&config.prefix, Dialect::Mysql) {
                    sqlx::raw_sql(&sql).execute(&mut conn).await?;
                }
            }
            Ok::<_, sqlx::Error>(conn)
        })?;

        self.setup = false;
        self.conn = Some(conn);
        Ok(())
    }

    fn bound_query<'q>(statement: &'q Statement) -> Query<'q, MySql, MySqlArguments> {
        let mut query = sqlx::query(&statement.sql);
        for param in &statement.params {
            query = match param {
                SqlValue::Null => query.bind(None::<i64>),
                SqlValue::Int(value) => query.bind(*value),
                SqlValue::Float(value) => query.bind(*value),
                SqlValue::Text(value) => query.bind(value.as_str()),
                SqlValue::Blob(value) => query.bind(value.as_slice()),
            };
        }
        query
    }

    fn run_query(&mut self) -> Result<(), DbError> {
        let runtime = self.runtime.as_ref().ok_or(DbError::NotConnected)?;
        let conn = self.conn.as_mut().ok_or(DbError::NotConnected)?;
        let statement = self.statement.as_mut().ok_or(DbError::NoStatement)?;

        let rows = runtime.block_on(Self::bound_query(statement).fetch_all(&mut *conn))?;
        let buffered = rows.iter().map(row_values).collect();
        statement.set_rows(buffered);
        Ok(())
    }

    fn simple(&mut self, sql: &str) -> Result<(), DbError> {
        let runtime = self.runtime.as_ref().ok_or(DbError::NotConnected)?;
        let conn = self.conn.as_mut().ok_or(DbError::NotConnected)?;
        runtime.block_on(sqlx::raw_sql(sql).execute(&mut *conn))?;
        Ok(())
    }
}

fn column_value(row: &MySqlRow, index: usize) -> SqlValue {
    let is_null = row.try_get_raw(index).map(|raw| raw.is_null()).unwrap_or(true);
    if is_null {
        return SqlValue::Null;
    }
    let type_name = row.column(index).type_info().name().to_ascii_uppercase();
    if type_name.contains("INT") || type_name == "BOOLEAN" {
        if let Ok(value) = row.try_get::<i64, _>(index) {
            return SqlValue::Int(value);
        }
        if let Ok(value) = row.try_get::<u64, _>(index) {
            return SqlValue::Int(value as i64);
        }
    }
    if type_name == "FLOAT" {
        if let Ok(value) = row.try_get::<f32, _>(index) {
            return SqlValue::Float(value as f64);
        }
    }
    if type_name == "DOUBLE" {
        if let Ok(value) = row.try_get::<f64, _>(index) {
            return SqlValue::Float(value);
        }
    }
    if type_name == "TIMESTAMP" || type_name == "DATETIME" {
        if let Ok(value) = row.try_get::<chrono::NaiveDateTime, _>(index) {
            return SqlValue::Text(value.format("%Y-%m-%d %H:%M:%S").to_string());
        }
    }
    if let Ok(value) = row.try_get::<String, _>(index) {
        return SqlValue::Text(value);
    }
    match row.try_get::<Vec<u8>, _>(index) {
        Ok(value) => SqlValue::Blob(value),
        Err(_) => SqlValue::Null,
    }
}

fn row_values(row: &MySqlRow) -> Vec<SqlValue> {
    (0..row.len()).map(|index| column_value(row, index)).collect()
}

impl DbConnection for MysqlConnection {
    fn describe(&self) -> String {
        format!(
            "DB: '{}' Prefix: '{}' User: '{}' IP: <{{'{}'}}> Port: {}",
            self.config.database, self.config.prefix, self.config.user, self.config.ip, self.config.port
        )
    }

    fn prefix(&self) -> &str {
        &self.config.prefix
    }

    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    fn copy(&self) -> Box<dyn DbConnection> {
        let mut copy = MysqlConnection::new(self.config.clone());
        copy.setup = self.setup;
        Box::new(copy)
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
                self.conn = None;
                self.in_use.store(false, Ordering::Release);
                ConnectStatus::Failure(e)
            }
        }
    }

    fn disconnect(&mut self) {
        self.statement = None;
        self.locked = false;
        self.in_use.store(false, Ordering::Release);
    }

    fn lock(&mut self, table: &str) -> Result<(), DbError> {
        self.simple(&format!("LOCK TABLES {} WRITE", table))?;
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) -> Result<(), DbError> {
        if !self.locked {
            return Ok(());
        }
        self.locked = false;
        self.statement = None;
        self.simple("UNLOCK TABLES")
    }

    fn prepare_statement(&mut self, sql: &str) -> Result<(), DbError> {
        if self.conn.is_none() {
            return Err(DbError::NotConnected);
        }
        self.statement = Some(Statement::new(sql, None));
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
        let runtime = self.runtime.as_ref().ok_or(DbError::NotConnected)?;
        let conn = self.conn.as_mut().ok_or(DbError::NotConnected)?;
        let statement = self.statement.as_mut().ok_or(DbError::NoStatement)?;
        let result = runtime.block_on(Self::bound_query(statement).execute(&mut *conn))?;
        statement.set_rows(Vec::new());
        Ok(result.rows_affected())
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
             ON DUPLICATE KEY UPDATE Points=Points+?",
            self.config.prefix
        );
        self.prepare_statement(&sql)?;
        self.bind_string(1, name)?;
        self.bind_int(2, points)?;
        self.bind_int(3, points)?;
        self.execute_update()?;
        Ok(())
    }
}

impl Drop for MysqlConnection {
    fn drop(&mut self) {
        if let (Some(runtime), Some(conn)) = (self.runtime.as_ref(), self.conn.take()) {
            let _ = runtime.block_on(conn.close());
        }
    }
}
