//! Race results and points
//!
//! [`save_score`] is meant for [`ConnectionPool::execute_write_fault_tolerant`]:
//! the finish is first stored in `_race_backup` and then moved or dropped
//! depending on whether the write database accepted it.
//!
//! [`ConnectionPool::execute_write_fault_tolerant`]: super::ConnectionPool::execute_write_fault_tolerant

use super::schema::NUM_CHECKPOINTS;
use super::{DbConnection, DbError, WriteTag};
use chrono::Local;
use log::{info, warn};

/// One finished race
#[derive(Debug, Clone)]
pub struct ScoreData {
    pub map: String,
    pub name: String,
    /// Local wall time of the finish, `YYYY-MM-DD HH:MM:SS`
    pub timestamp: String,
    pub time: f32,
    pub checkpoints: [f32; NUM_CHECKPOINTS],
    pub game_id: String,
    /// Short server tag stored with the rank
    pub server: String,
}

impl ScoreData {
    pub fn new(map: &str, name: &str, time: f32, checkpoints: [f32; NUM_CHECKPOINTS], game_id: &str, server: &str) -> Self {
        Self {
            map: map.to_string(),
            name: name.to_string(),
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            time,
            checkpoints,
            game_id: game_id.to_string(),
            server: server.chars().take(4).collect(),
        }
    }
}

/// Lookup key for [`best_time`]
#[derive(Debug, Clone)]
pub struct PlayerMap {
    pub map: String,
    pub name: String,
}

fn backup_filter(conn: &mut dyn DbConnection, sql: &str, data: &ScoreData) -> Result<u64, DbError> {
    conn.prepare_statement(sql)?;
    conn.bind_string(1, &data.game_id)?;
    conn.bind_string(2, &data.name)?;
    conn.bind_string(3, &data.timestamp)?;
    conn.execute_update()
}

fn delete_backup(conn: &mut dyn DbConnection, data: &ScoreData) -> Result<(), DbError> {
    let sql = format!(
        "DELETE FROM {}_race_backup WHERE GameId=? AND Name=? AND Timestamp={}",
        conn.prefix(),
        conn.dialect().insert_timestamp_as_utc()
    );
    if backup_filter(conn, &sql, data)? == 0 {
        warn!("rank of '{}' was already moved out of the backup database", data.name);
    }
    Ok(())
}

/// Awards the map's points on a player's first finish
fn award_first_finish(conn: &mut dyn DbConnection, data: &ScoreData) -> Result<(), DbError> {
    let sql = format!("SELECT COUNT(*) FROM {}_race WHERE Map=? AND Name=?", conn.prefix());
    conn.prepare_statement(&sql)?;
    conn.bind_string(1, &data.map)?;
    conn.bind_string(2, &data.name)?;
    if conn.step()? && conn.get_int(1)? > 0 {
        return Ok(());
    }

    let sql = format!("SELECT Points FROM {}_maps WHERE Map=?", conn.prefix());
    conn.prepare_statement(&sql)?;
    conn.bind_string(1, &data.map)?;
    if conn.step()? {
        let points = conn.get_int(1)?;
        conn.add_points(&data.name, points)?;
        info!("'{}' earned {} points for finishing {}", data.name, points, data.map);
    }
    Ok(())
}

/// Stores a finish
pub fn save_score(conn: &mut dyn DbConnection, data: &ScoreData, tag: WriteTag) -> Result<(), DbError> {
    match tag {
        WriteTag::NormalSucceeded => return delete_backup(conn, data),
        WriteTag::NormalFailed => {
            let sql = format!(
                "INSERT INTO {prefix}_race SELECT * FROM {prefix}_race_backup \
                 WHERE GameId=? AND Name=? AND Timestamp={timestamp}",
                prefix = conn.prefix(),
                timestamp = conn.dialect().insert_timestamp_as_utc()
            );
            backup_filter(conn, &sql, data)?;
            return delete_backup(conn, data);
        }
        WriteTag::Normal => award_first_finish(conn, data)?,
        WriteTag::BackupFirst => {}
    }

    let checkpoints = vec!["?"; NUM_CHECKPOINTS].join(", ");
    let columns: String = (1..=NUM_CHECKPOINTS).map(|cp| format!("cp{}, ", cp)).collect();
    let sql = format!(
        "{insert} INTO {prefix}_race{suffix}(Map, Name, Timestamp, Time, Server, {columns}GameId, DDNet7) \
         VALUES (?, ?, {timestamp}, ?, ?, {checkpoints}, ?, FALSE)",
        insert = conn.dialect().insert_ignore(),
        prefix = conn.prefix(),
        suffix = if tag == WriteTag::Normal { "" } else { "_backup" },
        timestamp = conn.dialect().insert_timestamp_as_utc(),
    );
    conn.prepare_statement(&sql)?;
    conn.bind_string(1, &data.map)?;
    conn.bind_string(2, &data.name)?;
    conn.bind_string(3, &data.timestamp)?;
    conn.bind_float(4, data.time)?;
    conn.bind_string(5, &data.server)?;
    for (i, cp) in data.checkpoints.iter().enumerate() {
        conn.bind_float(6 + i, *cp)?;
    }
    conn.bind_string(6 + NUM_CHECKPOINTS, &data.game_id)?;
    conn.execute_update()?;
    Ok(())
}

/// Best time of a player on a map, `None` without a finish
pub fn best_time(conn: &mut dyn DbConnection, query: &PlayerMap, out: &mut Option<f32>) -> Result<(), DbError> {
    let sql = format!(
        "SELECT MIN(Time) FROM {}_race WHERE Map=? AND Name=?",
        conn.prefix()
    );
    conn.prepare_statement(&sql)?;
    conn.bind_string(1, &query.map)?;
    conn.bind_string(2, &query.name)?;
    if conn.step()? && !conn.is_null(1)? {
        *out = Some(conn.get_float(1)?);
    }
    Ok(())
}
