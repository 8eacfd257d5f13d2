//! Console commands
//!
//! Lines come from stdin, from `--exec` and from authenticated rcon clients.
//! Parsing is separate from execution so the server can check the caller's
//! level against [`CommandInfo::level`] before running anything.

use crate::auth::AuthLevel;
use crate::db::Mode;
use crate::transport::ServerMessage;
use log::debug;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

pub struct CommandInfo {
    pub name: &'static str,
    pub params: &'static str,
    pub help: &'static str,
    pub level: AuthLevel,
}

/// Every command, in the order it is streamed to rcon clients
pub const COMMANDS: &[CommandInfo] = &[
    CommandInfo {
        name: "add_sqlserver",
        params: "r|w database prefix user password ip port [setup]",
        help: "Add a MySQL server",
        level: AuthLevel::Admin,
    },
    CommandInfo {
        name: "dump_sqlservers",
        params: "r|w",
        help: "List the registered SQL servers",
        level: AuthLevel::Admin,
    },
    CommandInfo {
        name: "auth_add",
        params: "ident level password",
        help: "Add a rcon key",
        level: AuthLevel::Admin,
    },
    CommandInfo {
        name: "auth_add_p",
        params: "ident level hash salt",
        help: "Add a rcon key from a pre-hashed password",
        level: AuthLevel::Admin,
    },
    CommandInfo {
        name: "auth_remove",
        params: "ident",
        help: "Remove a rcon key",
        level: AuthLevel::Admin,
    },
    CommandInfo {
        name: "auth_list",
        params: "",
        help: "List all rcon keys",
        level: AuthLevel::Admin,
    },
    CommandInfo {
        name: "auth_update",
        params: "ident level password",
        help: "Update a rcon key",
        level: AuthLevel::Admin,
    },
    CommandInfo {
        name: "status",
        params: "",
        help: "List players",
        level: AuthLevel::Helper,
    },
    CommandInfo {
        name: "kick",
        params: "id [reason]",
        help: "Kick a player",
        level: AuthLevel::Moderator,
    },
    CommandInfo {
        name: "ban",
        params: "ip minutes [reason]",
        help: "Ban an address",
        level: AuthLevel::Moderator,
    },
    CommandInfo {
        name: "unban",
        params: "ip",
        help: "Remove a ban",
        level: AuthLevel::Moderator,
    },
    CommandInfo {
        name: "redirect",
        params: "id port",
        help: "Send a player to another server port",
        level: AuthLevel::Admin,
    },
    CommandInfo {
        name: "reload",
        params: "",
        help: "Reload the map",
        level: AuthLevel::Admin,
    },
    CommandInfo {
        name: "shutdown",
        params: "",
        help: "Shut down the server",
        level: AuthLevel::Admin,
    },
    CommandInfo {
        name: "help",
        params: "",
        help: "List the available commands",
        level: AuthLevel::Helper,
    },
];

pub fn command_info(name: &str) -> Option<&'static CommandInfo> {
    COMMANDS.iter().find(|info| info.name == name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AddSqlServer {
        mode: Mode,
        database: String,
        prefix: String,
        user: String,
        password: String,
        ip: String,
        port: u16,
        setup: bool,
    },
    DumpSqlServers(Mode),
    AuthAdd {
        ident: String,
        level: AuthLevel,
        password: String,
    },
    AuthAddHashed {
        ident: String,
        level: AuthLevel,
        hash: String,
        salt: String,
    },
    AuthRemove(String),
    AuthList,
    AuthUpdate {
        ident: String,
        level: AuthLevel,
        password: String,
    },
    Status,
    Kick {
        client_id: usize,
        reason: String,
    },
    Ban {
        ip: String,
        minutes: u32,
        reason: String,
    },
    Unban(String),
    Redirect {
        client_id: usize,
        port: u16,
    },
    Reload,
    Shutdown,
    Help,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::AddSqlServer { .. } => "add_sqlserver",
            Command::DumpSqlServers(_) => "dump_sqlservers",
            Command::AuthAdd { .. } => "auth_add",
            Command::AuthAddHashed { .. } => "auth_add_p",
            Command::AuthRemove(_) => "auth_remove",
            Command::AuthList => "auth_list",
            Command::AuthUpdate { .. } => "auth_update",
            Command::Status => "status",
            Command::Kick { .. } => "kick",
            Command::Ban { .. } => "ban",
            Command::Unban(_) => "unban",
            Command::Redirect { .. } => "redirect",
            Command::Reload => "reload",
            Command::Shutdown => "shutdown",
            Command::Help => "help",
        }
    }

    pub fn level(&self) -> AuthLevel {
        command_info(self.name()).map_or(AuthLevel::Admin, |info| info.level)
    }
}

/// Splits a line into arguments. Double quotes group words, a backslash
/// escapes the next character inside quotes.
fn tokenize(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(&first) = chars.peek() else {
            break;
        };
        let mut arg = String::new();
        if first == '"' {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '"' => break,
                    '\\' => arg.extend(chars.next()),
                    c => arg.push(c),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                arg.push(c);
            }
        }
        args.push(arg);
    }
    args
}

fn parse_mode(arg: &str) -> Result<Mode, String> {
    match arg {
        "r" => Ok(Mode::Read),
        "w" => Ok(Mode::Write),
        other => Err(format!("unknown mode '{}', use 'r' or 'w'", other)),
    }
}

fn parse_level(arg: &str) -> Result<AuthLevel, String> {
    AuthLevel::from_name(arg).ok_or_else(|| format!("unknown level '{}', use admin, mod or helper", arg))
}

fn parse_num<T: std::str::FromStr>(arg: &str, what: &str) -> Result<T, String> {
    arg.parse().map_err(|_| format!("invalid {} '{}'", what, arg))
}

/// Parses one console line. `Ok(None)` for a blank line.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let args = tokenize(line);
    let Some((name, rest)) = args.split_first() else {
        return Ok(None);
    };
    let info = command_info(name).ok_or_else(|| format!("no such command: {}", name))?;
    let required = info.params.split_whitespace().filter(|p| !p.starts_with('[')).count();
    if rest.len() < required {
        return Err(format!("usage: {} {}", info.name, info.params));
    }
    let arg = |index: usize| rest.get(index).map(String::as_str).unwrap_or("");
    let tail = |index: usize| rest.get(index..).map(|r| r.join(" ")).unwrap_or_default();

    let command = match info.name {
        "add_sqlserver" => Command::AddSqlServer {
            mode: parse_mode(arg(0))?,
            database: arg(1).to_string(),
            prefix: arg(2).to_string(),
            user: arg(3).to_string(),
            password: arg(4).to_string(),
            ip: arg(5).to_string(),
            port: parse_num(arg(6), "port")?,
            setup: rest.get(7).map_or(Ok(true), |s| parse_num::<i32>(s, "setup flag").map(|v| v != 0))?,
        },
        "dump_sqlservers" => Command::DumpSqlServers(parse_mode(arg(0))?),
        "auth_add" => Command::AuthAdd {
            ident: arg(0).to_string(),
            level: parse_level(arg(1))?,
            password: arg(2).to_string(),
        },
        "auth_add_p" => Command::AuthAddHashed {
            ident: arg(0).to_string(),
            level: parse_level(arg(1))?,
            hash: arg(2).to_string(),
            salt: arg(3).to_string(),
        },
        "auth_remove" => Command::AuthRemove(arg(0).to_string()),
        "auth_list" => Command::AuthList,
        "auth_update" => Command::AuthUpdate {
            ident: arg(0).to_string(),
            level: parse_level(arg(1))?,
            password: arg(2).to_string(),
        },
        "status" => Command::Status,
        "kick" => Command::Kick {
            client_id: parse_num(arg(0), "client id")?,
            reason: tail(1),
        },
        "ban" => Command::Ban {
            ip: arg(0).to_string(),
            minutes: parse_num(arg(1), "minutes")?,
            reason: tail(2),
        },
        "unban" => Command::Unban(arg(0).to_string()),
        "redirect" => Command::Redirect {
            client_id: parse_num(arg(0), "client id")?,
            port: parse_num(arg(1), "port")?,
        },
        "reload" => Command::Reload,
        "shutdown" => Command::Shutdown,
        _ => Command::Help,
    };
    Ok(Some(command))
}

/// Forwards stdin lines to the tick loop until stdin closes
pub fn spawn_stdin_reader(server_tx: mpsc::UnboundedSender<ServerMessage>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if server_tx.send(ServerMessage::ConsoleLine(line)).is_err() {
                break;
            }
        }
        debug!("console input closed");
    });
}
