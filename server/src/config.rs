//! Command line configuration
//!
//! [`Args`] is parsed once in `main` and split into the immutable
//! [`ServerConfig`] handed to the server at construction and the
//! [`LiveConfig`] the server owns and console commands may change.

use crate::error::ServerError;
use clap::Parser;
use shared::protocol::{MAX_CLIENTS, SERVER_TICK_SPEED};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "Dedicated race server")]
pub struct Args {
    /// Address to bind the UDP socket to
    #[clap(long, default_value = "0.0.0.0")]
    pub bind: String,
    /// UDP port
    #[clap(short, long, default_value = "8303")]
    pub port: u16,
    /// Number of client slots
    #[clap(long, default_value_t = MAX_CLIENTS)]
    pub max_clients: usize,
    /// Simulation ticks per second
    #[clap(long, default_value_t = SERVER_TICK_SPEED)]
    pub tick_speed: i32,
    /// Send snapshots every tick instead of every second tick
    #[clap(long)]
    pub high_bandwidth: bool,
    /// Server name shown in the server browser
    #[clap(long, default_value = "unnamed server")]
    pub name: String,
    /// Map to load on startup, without the `.map` extension
    #[clap(long, default_value = "dm1")]
    pub map: String,
    /// Directory the map files are read from
    #[clap(long, default_value = "maps")]
    pub maps_dir: PathBuf,
    /// Password required to join
    #[clap(long, default_value = "")]
    pub password: String,
    #[clap(long, default_value = "")]
    pub rcon_password: String,
    #[clap(long, default_value = "")]
    pub rcon_mod_password: String,
    #[clap(long, default_value = "")]
    pub rcon_helper_password: String,
    /// Failed rcon logins before the address is banned, 0 disables
    #[clap(long, default_value_t = 30)]
    pub rcon_max_tries: u32,
    /// Minutes an address is banned after too many failed rcon logins
    #[clap(long, default_value_t = 5)]
    pub rcon_bantime: u32,
    /// SQLite database file; registered as backup store with `--use-sql`,
    /// as read and write store otherwise
    #[clap(long)]
    pub sqlite_file: Option<PathBuf>,
    /// Allow `add_sqlserver`
    #[clap(long)]
    pub use_sql: bool,
    /// Short server tag stored with race records
    #[clap(long, default_value = "UNK")]
    pub sql_server: String,
    /// Seconds of silence before a client is dropped
    #[clap(long, default_value_t = 30)]
    pub timeout: u64,
    /// Console command run after startup, may be repeated
    #[clap(long)]
    pub exec: Vec<String>,
}

/// Settings fixed for the lifetime of the server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_clients: usize,
    pub tick_speed: i32,
    pub high_bandwidth: bool,
    pub name: String,
    pub map: String,
    pub maps_dir: PathBuf,
    pub password: String,
    pub sqlite_file: Option<PathBuf>,
    pub use_sql: bool,
    pub timeout: Duration,
    /// Table prefix for the local SQLite store
    pub sql_prefix: String,
    /// Short server tag stored with race records
    pub sql_server: String,
    pub exec: Vec<String>,
}

/// Settings the console may change while the server runs
#[derive(Debug, Clone, Default)]
pub struct LiveConfig {
    pub rcon_password: String,
    pub rcon_mod_password: String,
    pub rcon_helper_password: String,
    pub rcon_max_tries: u32,
    pub rcon_bantime: u32,
}

impl Args {
    pub fn into_config(self) -> Result<(ServerConfig, LiveConfig), ServerError> {
        if self.max_clients == 0 || self.max_clients > MAX_CLIENTS {
            return Err(ServerError::Config(format!(
                "max clients must be between 1 and {}",
                MAX_CLIENTS
            )));
        }
        if !(1..=1000).contains(&self.tick_speed) {
            return Err(ServerError::Config(format!(
                "tick speed {} out of range",
                self.tick_speed
            )));
        }
        if self.map.is_empty() || self.map.contains(['/', '\\']) {
            return Err(ServerError::Config(format!("invalid map name '{}'", self.map)));
        }

        let config = ServerConfig {
            bind_addr: format!("{}:{}", self.bind, self.port),
            max_clients: self.max_clients,
            tick_speed: self.tick_speed,
            high_bandwidth: self.high_bandwidth,
            name: self.name,
            map: self.map,
            maps_dir: self.maps_dir,
            password: self.password,
            sqlite_file: self.sqlite_file,
            use_sql: self.use_sql,
            timeout: Duration::from_secs(self.timeout),
            sql_prefix: "record".to_string(),
            sql_server: self.sql_server,
            exec: self.exec,
        };
        let live = LiveConfig {
            rcon_password: self.rcon_password,
            rcon_mod_password: self.rcon_mod_password,
            rcon_helper_password: self.rcon_helper_password,
            rcon_max_tries: self.rcon_max_tries,
            rcon_bantime: self.rcon_bantime,
        };
        Ok((config, live))
    }
}
