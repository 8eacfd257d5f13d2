//! Table layout shared by both backends
//!
//! All statements use `CREATE TABLE IF NOT EXISTS` so running the bootstrap
//! against an initialised database changes nothing.

use super::Dialect;

/// Number of checkpoint columns in the race tables
pub const NUM_CHECKPOINTS: usize = 25;

fn backup_suffix(backup: bool) -> &'static str {
    if backup {
        "_backup"
    } else {
        ""
    }
}

pub fn format_create_race(prefix: &str, dialect: Dialect, backup: bool) -> String {
    let collate = dialect.binary_collate();
    let checkpoints: String = (1..=NUM_CHECKPOINTS)
        .map(|cp| format!("cp{} FLOAT DEFAULT 0, ", cp))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {prefix}_race{suffix} (\
         Map VARCHAR(128) COLLATE {collate} NOT NULL, \
         Name VARCHAR(16) COLLATE {collate} NOT NULL, \
         Timestamp TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP, \
         Time FLOAT DEFAULT 0, \
         Server CHAR(4), \
         {checkpoints}\
         GameId VARCHAR(64), \
         DDNet7 BOOL DEFAULT FALSE, \
         PRIMARY KEY (Map, Name, Time, Timestamp, Server)\
         )",
        suffix = backup_suffix(backup),
    )
}

pub fn format_create_teamrace(prefix: &str, dialect: Dialect, backup: bool) -> String {
    let collate = dialect.binary_collate();
    format!(
        "CREATE TABLE IF NOT EXISTS {prefix}_teamrace{suffix} (\
         Map VARCHAR(128) COLLATE {collate} NOT NULL, \
         Name VARCHAR(16) COLLATE {collate} NOT NULL, \
         Timestamp TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP, \
         Time FLOAT DEFAULT 0, \
         Id {id_type} NOT NULL, \
         GameId VARCHAR(64), \
         DDNet7 BOOL DEFAULT FALSE, \
         PRIMARY KEY (Id, Name)\
         )",
        suffix = backup_suffix(backup),
        id_type = dialect.blob_id_type(),
    )
}

pub fn format_create_maps(prefix: &str, dialect: Dialect) -> String {
    let collate = dialect.binary_collate();
    format!(
        "CREATE TABLE IF NOT EXISTS {prefix}_maps (\
         Map VARCHAR(128) COLLATE {collate} NOT NULL, \
         Server VARCHAR(32) COLLATE {collate} NOT NULL, \
         Mapper VARCHAR(128) COLLATE {collate} NOT NULL, \
         Points INT DEFAULT 0, \
         Stars INT DEFAULT 0, \
         Timestamp TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP, \
         PRIMARY KEY (Map)\
         )"
    )
}

pub fn format_create_saves(prefix: &str, dialect: Dialect, backup: bool) -> String {
    let collate = dialect.binary_collate();
    format!(
        "CREATE TABLE IF NOT EXISTS {prefix}_saves{suffix} (\
         Savegame TEXT COLLATE {collate} NOT NULL, \
         Map VARCHAR(128) COLLATE {collate} NOT NULL, \
         Code VARCHAR(128) COLLATE {collate} NOT NULL, \
         Timestamp TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP, \
         Server CHAR(4), \
         DDNet7 BOOL DEFAULT FALSE, \
         SaveId VARCHAR(36) DEFAULT NULL, \
         PRIMARY KEY (Map, Code)\
         )",
        suffix = backup_suffix(backup),
    )
}

pub fn format_create_points(prefix: &str, dialect: Dialect) -> String {
    let collate = dialect.binary_collate();
    format!(
        "CREATE TABLE IF NOT EXISTS {prefix}_points (\
         Name VARCHAR(16) COLLATE {collate} NOT NULL, \
         Points INT DEFAULT 0, \
         PRIMARY KEY (Name)\
         )"
    )
}

pub fn format_create_bans(prefix: &str, dialect: Dialect) -> String {
    let collate = dialect.binary_collate();
    format!(
        "CREATE TABLE IF NOT EXISTS {prefix}_bans (\
         IP VARCHAR(64) COLLATE {collate} NOT NULL, \
         EndTimestamp BIGINT NOT NULL DEFAULT 0, \
         Issuer VARCHAR(32), \
         PlayerName VARCHAR(32), \
         Reason VARCHAR(128), \
         PRIMARY KEY (IP)\
         )"
    )
}

/// Every bootstrap statement in creation order
pub fn create_statements(prefix: &str, dialect: Dialect) -> Vec<String> {
    vec![
        format_create_race(prefix, dialect, false),
        format_create_teamrace(prefix, dialect, false),
        format_create_maps(prefix, dialect),
        format_create_saves(prefix, dialect, false),
        format_create_points(prefix, dialect),
        format_create_bans(prefix, dialect),
        format_create_race(prefix, dialect, true),
        format_create_teamrace(prefix, dialect, true),
        format_create_saves(prefix, dialect, true),
    ]
}
