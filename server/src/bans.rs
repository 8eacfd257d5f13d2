//! Address bans
//!
//! Bans take effect immediately through the in-memory [`BanList`]. When a
//! database is configured they are also written to `{prefix}_bans` so they
//! survive restarts, and every new connection is checked against that table.

use crate::db::{DbConnection, DbError};
use chrono::Utc;
use std::collections::HashMap;
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ban {
    /// Unix time the ban ends
    pub end: i64,
    pub reason: String,
}

impl Ban {
    pub fn minutes_left(&self, now: i64) -> i64 {
        ((self.end - now).max(0) + 59) / 60
    }

    /// Message shown to the banned client
    pub fn message(&self, now: i64) -> String {
        let minutes = self.minutes_left(now);
        if self.reason.is_empty() {
            format!("You have been banned for {} minutes", minutes)
        } else {
            format!("You have been banned for {} minutes ({})", minutes, self.reason)
        }
    }
}

#[derive(Debug, Default)]
pub struct BanList {
    bans: HashMap<IpAddr, Ban>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ban(&mut self, ip: IpAddr, minutes: u32, reason: &str, now: i64) -> Ban {
        let ban = Ban {
            end: now + i64::from(minutes) * 60,
            reason: reason.to_string(),
        };
        self.bans.insert(ip, ban.clone());
        ban
    }

    /// Adds a ban read back from the database
    pub fn insert(&mut self, ip: IpAddr, ban: Ban) {
        self.bans.insert(ip, ban);
    }

    pub fn unban(&mut self, ip: &IpAddr) -> bool {
        self.bans.remove(ip).is_some()
    }

    /// Active ban for `ip`; expired entries are removed on lookup
    pub fn check(&mut self, ip: &IpAddr, now: i64) -> Option<&Ban> {
        if self.bans.get(ip).is_some_and(|ban| ban.end <= now) {
            self.bans.remove(ip);
        }
        self.bans.get(ip)
    }

    pub fn len(&self) -> usize {
        self.bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }
}

pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Payload of the ban jobs
#[derive(Debug, Clone)]
pub struct BanRequest {
    pub ip: String,
    pub end: i64,
    pub issuer: String,
    pub player_name: String,
    pub reason: String,
}

/// Plain write storing a ban, replacing an older one for the same address
pub fn store_ban(conn: &mut dyn DbConnection, req: &BanRequest, _failure: bool) -> Result<(), DbError> {
    let sql = format!(
        "REPLACE INTO {}_bans(IP, EndTimestamp, Issuer, PlayerName, Reason) VALUES (?, ?, ?, ?, ?)",
        conn.prefix()
    );
    conn.prepare_statement(&sql)?;
    conn.bind_string(1, &req.ip)?;
    conn.bind_int64(2, req.end)?;
    conn.bind_string(3, &req.issuer)?;
    conn.bind_string(4, &req.player_name)?;
    conn.bind_string(5, &req.reason)?;
    conn.execute_update()?;
    Ok(())
}

/// Plain write removing every ban of an address
pub fn remove_ban(conn: &mut dyn DbConnection, ip: &String, _failure: bool) -> Result<(), DbError> {
    let sql = format!("DELETE FROM {}_bans WHERE IP=?", conn.prefix());
    conn.prepare_statement(&sql)?;
    conn.bind_string(1, ip)?;
    conn.execute_update()?;
    Ok(())
}

/// Read job looking up an active ban
pub fn check_ban(conn: &mut dyn DbConnection, ip: &String, out: &mut Option<Ban>) -> Result<(), DbError> {
    let sql = format!(
        "SELECT EndTimestamp, Reason FROM {}_bans WHERE IP=? AND EndTimestamp > ?",
        conn.prefix()
    );
    conn.prepare_statement(&sql)?;
    conn.bind_string(1, ip)?;
    conn.bind_int64(2, unix_now())?;
    if conn.step()? {
        *out = Some(Ban {
            end: conn.get_int64(1)?,
            reason: conn.get_string(2)?,
        });
    }
    Ok(())
}
