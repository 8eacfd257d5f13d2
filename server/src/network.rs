//! Server tick loop and protocol dispatcher

use crate::auth::{AuthLevel, AuthManager};
use crate::bans::{self, Ban, BanList, BanRequest};
use crate::client_manager::{ClientState, ClientTable, MaplistState};
use crate::config::{LiveConfig, ServerConfig};
use crate::console::{self, Command, COMMANDS};
use crate::db::schema::NUM_CHECKPOINTS;
use crate::db::score::{self, PlayerMap, ScoreData};
use crate::db::{ConnectionPool, Mode, MysqlConfig, MysqlConnection, SqlResult, SqliteConnection};
use crate::error::ServerError;
use crate::game::{GameController, RaceFinish};
use crate::map::{self, MapFile};
use crate::snap::{self, DemoRecorder};
use crate::transport::{ServerMessage, Transport};
use log::{debug, info, warn};
use shared::packet::{SERVERBROWSE_GETINFO, SERVERBROWSE_INFO};
use shared::protocol::*;
use shared::{ControlMsg, Datagram, MsgId, Packer, ProtocolError, SnapshotBuilder, SnapshotDelta, Unpacker};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;

/// Rcon commands and map names streamed to one client per tick
pub const MAX_RCONCMD_SEND: usize = 16;
/// How long a redirected client keeps its slot
pub const REDIRECT_DROP_DELAY: Duration = Duration::from_secs(10);

/// Server info stops listing players once the body reaches this size
const SERVER_INFO_BUDGET: usize = 1200;

pub struct Server {
    config: ServerConfig,
    live: LiveConfig,
    transport: Transport,
    clients: ClientTable,
    game: Box<dyn GameController>,
    auth: AuthManager,
    bans: BanList,
    pool: ConnectionPool,
    has_database: bool,
    delta: SnapshotDelta,
    map: MapFile,
    maplist: Vec<String>,
    demo: Option<Box<dyn DemoRecorder>>,
    /// Identifies this server run in stored records
    game_id: String,

    tick: i32,
    game_start: Instant,
    running: bool,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    pending_ban_checks: Vec<(IpAddr, Arc<SqlResult<Option<Ban>>>)>,
    pending_best_times: Vec<(usize, String, Arc<SqlResult<Option<f32>>>)>,
}

impl Server {
    pub async fn new(
        config: ServerConfig,
        live: LiveConfig,
        game: Box<dyn GameController>,
    ) -> Result<Self, ServerError> {
        let map = MapFile::load(&config.maps_dir, &config.map)?;
        let maplist = map::list_maps(&config.maps_dir);
        let transport = Transport::bind(&config.bind_addr).await?;
        info!("server listening on {}", transport.local_addr()?);
        info!(
            "loaded map '{}' ({} bytes, crc {:08x})",
            map.name,
            map.size(),
            map.crc
        );

        let mut auth = AuthManager::new();
        auth.set_defaults(
            &live.rcon_password,
            &live.rcon_mod_password,
            &live.rcon_helper_password,
        );

        let pool = ConnectionPool::new().map_err(ServerError::Workers)?;
        let mut has_database = false;
        if let Some(path) = &config.sqlite_file {
            if config.use_sql {
                // the local file only backs up the remote servers
                pool.register_database(
                    Box::new(SqliteConnection::new(path, &config.sql_prefix, true)),
                    Mode::WriteBackup,
                );
            } else {
                pool.register_database(
                    Box::new(SqliteConnection::new(path, &config.sql_prefix, true)),
                    Mode::Read,
                );
                pool.register_database(
                    Box::new(SqliteConnection::new(path, &config.sql_prefix, false)),
                    Mode::Write,
                );
                has_database = true;
            }
        }

        let mut delta = SnapshotDelta::new();
        for (type_id, size) in game.item_sizes() {
            delta.set_static_size(type_id, size);
        }

        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(Self {
            clients: ClientTable::new(config.max_clients),
            config,
            live,
            transport,
            game,
            auth,
            bans: BanList::new(),
            pool,
            has_database,
            delta,
            map,
            maplist,
            demo: None,
            game_id: format!("{:032x}", rand::random::<u128>()),
            tick: 0,
            game_start: Instant::now(),
            running: false,
            server_tx,
            server_rx,
            pending_ban_checks: Vec::new(),
            pending_best_times: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// Sender for console lines and the shutdown request
    pub fn message_sender(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    pub fn set_demo_recorder(&mut self, recorder: Box<dyn DemoRecorder>) {
        self.demo = Some(recorder);
    }

    pub fn tick(&self) -> i32 {
        self.tick
    }

    pub fn clients(&self) -> &ClientTable {
        &self.clients
    }

    fn tick_start_time(&self, tick: i32) -> Instant {
        let offset = Duration::from_secs_f64(tick.max(0) as f64 / self.config.tick_speed as f64);
        self.game_start + offset
    }

    /// Runs until a shutdown is requested
    pub async fn run(&mut self) -> Result<(), ServerError> {
        self.transport.spawn(self.server_tx.clone());

        for line in self.config.exec.clone() {
            for output in self.execute_line(&line, None) {
                info!("{}", output);
            }
        }

        self.game_start = Instant::now();
        self.running = true;
        info!("server started, {} ticks per second", self.config.tick_speed);

        while self.running {
            let next_tick = tokio::time::Instant::from_std(self.tick_start_time(self.tick + 1));
            tokio::select! {
                message = self.server_rx.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => break,
                },
                _ = tokio::time::sleep_until(next_tick) => self.update(),
            }
        }

        self.shutdown();
        Ok(())
    }

    fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::PacketReceived { datagram, addr } => self.handle_datagram(datagram, addr),
            ServerMessage::Connless { body, addr } => self.handle_connless(&body, addr),
            ServerMessage::ConsoleLine(line) => {
                for output in self.execute_line(&line, None) {
                    info!("{}", output);
                }
            }
            ServerMessage::Shutdown => {
                info!("shutdown requested");
                self.running = false;
            }
        }
    }

    /// Advances the simulation to the current wall clock time
    fn update(&mut self) {
        let now = Instant::now();
        let mut new_ticks = 0;

        while now >= self.tick_start_time(self.tick + 1) {
            if new_ticks == self.config.tick_speed {
                warn!("server is lagging, dropping the tick backlog at tick {}", self.tick);
                let elapsed = Duration::from_secs_f64(self.tick as f64 / self.config.tick_speed as f64);
                self.game_start = now.checked_sub(elapsed).unwrap_or(now);
                break;
            }
            self.tick += 1;
            new_ticks += 1;
            self.do_tick();
        }

        if new_ticks == 0 {
            return;
        }

        if self.config.high_bandwidth || self.tick % 2 == 0 {
            self.do_snapshots(now);
        }

        for client_id in self.clients.expired_redirects(now) {
            self.drop_client(client_id, "redirected", false);
        }
        for client_id in self.clients.check_timeouts(self.config.timeout) {
            self.drop_client(client_id, "Timeout", false);
        }
        self.poll_database();
    }

    fn do_tick(&mut self) {
        let tick = self.tick;
        for client_id in 0..self.clients.max_clients() {
            let Some(slot) = self.clients.get(client_id) else {
                continue;
            };
            if slot.state != ClientState::InGame {
                continue;
            }
            for input in slot.inputs_for_tick(tick) {
                self.game.on_client_predicted_input(client_id, &input.data);
            }
        }

        self.game.on_tick(tick, self.config.tick_speed);
        for finish in self.game.take_finishes() {
            self.store_finish(finish);
        }
        self.stream_rcon_info();
    }

    /// Whether a store for race records is registered
    fn stores_records(&self) -> bool {
        self.has_database || self.config.sqlite_file.is_some()
    }

    fn store_finish(&mut self, finish: RaceFinish) {
        let stores_records = self.stores_records();
        let Some(slot) = self.clients.get_mut(finish.client_id) else {
            return;
        };
        if slot.best_time.map_or(true, |best| finish.time < best) {
            slot.best_time = Some(finish.time);
        }
        if !stores_records {
            return;
        }

        let mut checkpoints = [0.0; NUM_CHECKPOINTS];
        for (stored, time) in checkpoints.iter_mut().zip(&finish.checkpoints) {
            *stored = *time;
        }
        let data = ScoreData::new(
            &self.map.name,
            &slot.name,
            finish.time,
            checkpoints,
            &self.game_id,
            &self.config.sql_server,
        );
        self.pool
            .execute_write_fault_tolerant(score::save_score, data, "save score");
    }

    fn do_snapshots(&mut self, now: Instant) {
        let tick = self.tick;
        let tick_speed = self.config.tick_speed;

        for client_id in 0..self.clients.max_clients() {
            let Some(slot) = self.clients.get_mut(client_id) else {
                continue;
            };
            if slot.state != ClientState::InGame || !snap::should_snap(slot, tick, tick_speed) {
                continue;
            }
            let Some(addr) = slot.addr else {
                continue;
            };

            let mut builder = SnapshotBuilder::new();
            self.game.on_snap(client_id as i32, tick, &mut builder);
            let messages = snap::build_messages(slot, builder.finish(), tick, tick_speed, &self.delta, now);
            for message in messages {
                self.transport.send(
                    addr,
                    &Datagram::Chunk {
                        vital: false,
                        sequence: 0,
                        payload: message.encode(),
                    },
                );
            }
        }

        if let Some(demo) = self.demo.as_mut() {
            let mut builder = SnapshotBuilder::new();
            self.game.on_snap(-1, tick, &mut builder);
            demo.record_snapshot(tick, &builder.finish());
        }
    }

    /// Streams pending rcon commands, then the map list, to one client
    fn stream_rcon_info(&mut self) {
        let client_id = self.tick as usize % MAX_CLIENTS;
        let maplist = &self.maplist;
        let Some(slot) = self.clients.get_mut(client_id) else {
            return;
        };
        if !slot.is_authed() {
            return;
        }

        let mut payloads = Vec::new();
        if let Some(mut cursor) = slot.rcon_cmd_cursor {
            while cursor < COMMANDS.len() && payloads.len() < MAX_RCONCMD_SEND {
                let info = &COMMANDS[cursor];
                cursor += 1;
                if info.level > slot.auth_level {
                    continue;
                }
                let mut packer = msg_packer(NETMSG_RCON_CMD_ADD, true);
                packer.add_string(info.name).add_string(info.help).add_string(info.params);
                payloads.push(packer);
            }
            slot.rcon_cmd_cursor = (cursor < COMMANDS.len()).then_some(cursor);
        }

        if slot.rcon_cmd_cursor.is_none() {
            if let MaplistState::Streaming(mut index) = slot.maplist_state {
                while index < maplist.len() && payloads.len() < MAX_RCONCMD_SEND {
                    let mut packer = ext_msg_packer(ExtMsg::MaplistAdd, true);
                    packer.add_string(&maplist[index]);
                    payloads.push(packer);
                    index += 1;
                }
                if index < maplist.len() {
                    slot.maplist_state = MaplistState::Streaming(index);
                } else if payloads.len() < MAX_RCONCMD_SEND {
                    payloads.push(ext_msg_packer(ExtMsg::MaplistDone, true));
                    slot.maplist_state = MaplistState::Done;
                } else {
                    slot.maplist_state = MaplistState::Streaming(index);
                }
            }
        }

        for packer in payloads {
            self.send_msg(client_id, packer, true);
        }
    }

    fn poll_database(&mut self) {
        while let Some(line) = self.pool.get_response() {
            info!("{}", line);
        }

        let pending = std::mem::take(&mut self.pending_ban_checks);
        for (ip, result) in pending {
            if !result.completed() {
                self.pending_ban_checks.push((ip, result));
                continue;
            }
            if !result.success() {
                continue;
            }
            let found = result.data().clone();
            if let Some(ban) = found {
                self.bans.insert(ip, ban.clone());
                self.drop_banned(ip, &ban);
            }
        }

        let pending = std::mem::take(&mut self.pending_best_times);
        for (client_id, name, result) in pending {
            if !result.completed() {
                self.pending_best_times.push((client_id, name, result));
                continue;
            }
            let best = *result.data();
            let Some(slot) = self.clients.get_mut(client_id) else {
                continue;
            };
            // the slot may have been taken over since the lookup was queued
            if !result.success() || slot.name != name {
                continue;
            }
            if let Some(best) = best {
                if slot.best_time.map_or(true, |current| best < current) {
                    slot.best_time = Some(best);
                }
                debug!("best time of '{}' on {} is {:.2}s", name, self.map.name, best);
            }
        }
    }

    fn handle_datagram(&mut self, datagram: Datagram, addr: SocketAddr) {
        let client_id = self.clients.find_client_by_addr(addr);

        if let Datagram::Control(ControlMsg::Connect { sixup }) = datagram {
            self.on_connect(addr, sixup, client_id);
            return;
        }

        let Some(client_id) = client_id else {
            debug!("ignoring packet from unknown address {}", addr);
            return;
        };
        let Some(slot) = self.clients.get_mut(client_id) else {
            return;
        };
        if slot.state == ClientState::Redirected {
            return;
        }
        slot.last_seen = Instant::now();

        match datagram {
            Datagram::Control(ControlMsg::Close { reason }) => {
                let reason = if reason.is_empty() {
                    "disconnected".to_string()
                } else {
                    reason
                };
                self.drop_client(client_id, &reason, false);
            }
            Datagram::Control(_) => {}
            Datagram::Chunk {
                vital,
                sequence,
                payload,
            } => {
                slot.traffic.packets_in += 1;
                slot.traffic.bytes_in += payload.len() as u64;
                if vital && !slot.accept_vital(sequence) {
                    return;
                }
                if let Err(e) = self.process_chunk(client_id, vital, &payload) {
                    debug!("dropping message from client {}: {}", client_id, e);
                }
            }
        }
    }

    fn on_connect(&mut self, addr: SocketAddr, sixup: bool, existing: Option<usize>) {
        if existing.is_some() {
            // our accept was lost
            self.transport.send(addr, &Datagram::Control(ControlMsg::Accept));
            return;
        }

        let now = bans::unix_now();
        if let Some(ban) = self.bans.check(&addr.ip(), now) {
            let reason = ban.message(now);
            self.transport
                .send(addr, &Datagram::Control(ControlMsg::Close { reason }));
            return;
        }

        match self.clients.add_client(addr, sixup) {
            Some(_) => {
                self.transport.send(addr, &Datagram::Control(ControlMsg::Accept));
                if self.has_database {
                    let result = self.pool.execute(bans::check_ban, addr.ip().to_string(), "check ban");
                    self.pending_ban_checks.push((addr.ip(), result));
                }
            }
            None => {
                info!("rejecting {}, server is full", addr);
                self.transport.send(
                    addr,
                    &Datagram::Control(ControlMsg::Close {
                        reason: "This server is full".to_string(),
                    }),
                );
            }
        }
    }

    fn process_chunk(&mut self, client_id: usize, vital: bool, payload: &[u8]) -> Result<(), ProtocolError> {
        let mut unpacker = Unpacker::new(payload);
        let (msg_id, system) = unpack_msg_header(&mut unpacker)?;
        let state = self.client_state(client_id);

        if !system {
            if let MsgId::Id(msg_id) = msg_id {
                if vital && state >= ClientState::Ready {
                    self.game.on_message(client_id, msg_id, &mut unpacker);
                }
            }
            return Ok(());
        }

        match msg_id {
            MsgId::Ext(ExtMsg::ClientVer) => self.on_client_version(client_id, &mut unpacker),
            MsgId::Ext(ExtMsg::PingEx) => {
                let id = unpacker.get_raw(16)?;
                let mut packer = ext_msg_packer(ExtMsg::PongEx, true);
                packer.add_raw(id);
                self.send_msg(client_id, packer, false);
                Ok(())
            }
            MsgId::Ext(msg) => {
                debug!("unexpected {} from client {}", msg.name(), client_id);
                Ok(())
            }
            MsgId::UnknownExt(uuid) => {
                debug!("unknown message {} from client {}", uuid, client_id);
                Ok(())
            }
            MsgId::Id(NETMSG_INFO) => self.on_info(client_id, &mut unpacker),
            MsgId::Id(NETMSG_REQUEST_MAP_DATA) => self.on_request_map_data(client_id, &mut unpacker),
            MsgId::Id(NETMSG_READY) => {
                self.on_ready(client_id);
                Ok(())
            }
            MsgId::Id(NETMSG_ENTERGAME) => {
                self.on_enter_game(client_id);
                Ok(())
            }
            MsgId::Id(NETMSG_INPUT) => self.on_input(client_id, &mut unpacker),
            MsgId::Id(NETMSG_RCON_CMD) => self.on_rcon_cmd(client_id, &mut unpacker),
            MsgId::Id(NETMSG_RCON_AUTH) => self.on_rcon_auth(client_id, &mut unpacker),
            MsgId::Id(NETMSG_PING) => {
                self.send_msg(client_id, msg_packer(NETMSG_PING_REPLY, true), false);
                Ok(())
            }
            MsgId::Id(other) => Err(ProtocolError::UnknownMessage(other)),
        }
    }

    fn client_state(&self, client_id: usize) -> ClientState {
        self.clients
            .get(client_id)
            .map_or(ClientState::Empty, |slot| slot.state)
    }

    fn on_client_version(&mut self, client_id: usize, unpacker: &mut Unpacker<'_>) -> Result<(), ProtocolError> {
        let Some(slot) = self.clients.get_mut(client_id) else {
            return Ok(());
        };
        if slot.state != ClientState::PreAuth {
            return Ok(());
        }
        let version = unpacker.get_int()?;
        let version_string = unpacker.get_string().unwrap_or_default();
        slot.version = version;
        slot.state = ClientState::Auth;
        debug!(
            "client {} runs version {} '{}'",
            client_id, version, version_string
        );
        Ok(())
    }

    fn on_info(&mut self, client_id: usize, unpacker: &mut Unpacker<'_>) -> Result<(), ProtocolError> {
        let state = self.client_state(client_id);
        if state != ClientState::PreAuth && state != ClientState::Auth {
            return Ok(());
        }

        let version = unpacker.get_string()?;
        if version != NET_VERSION {
            let reason = format!(
                "Wrong version. Server is running '{}' and client '{}'",
                NET_VERSION, version
            );
            self.drop_client(client_id, &reason, true);
            return Ok(());
        }

        let password = unpacker.get_string().unwrap_or_default();
        if !self.config.password.is_empty() && password != self.config.password {
            self.drop_client(client_id, "Wrong password", true);
            return Ok(());
        }

        if let Some(slot) = self.clients.get_mut(client_id) {
            if let Ok(name) = unpacker.get_string() {
                slot.name = name;
                slot.clan = unpacker.get_string().unwrap_or_default();
                slot.country = unpacker.get_int().unwrap_or(-1);
            }
            slot.state = ClientState::Connecting;
        }
        self.send_map(client_id);
        Ok(())
    }

    fn send_map(&mut self, client_id: usize) {
        let mut packer = msg_packer(NETMSG_MAP_CHANGE, true);
        packer
            .add_string(&self.map.name)
            .add_int(self.map.crc as i32)
            .add_int(self.map.size() as i32)
            .add_raw(&self.map.sha256);
        self.send_msg(client_id, packer, true);
    }

    fn on_request_map_data(&mut self, client_id: usize, unpacker: &mut Unpacker<'_>) -> Result<(), ProtocolError> {
        if self.client_state(client_id) != ClientState::Connecting {
            return Ok(());
        }
        let chunk = unpacker.get_int()?;
        let Some((data, last)) = usize::try_from(chunk).ok().and_then(|index| self.map.chunk(index)) else {
            debug!("client {} requested invalid map chunk {}", client_id, chunk);
            return Ok(());
        };

        let mut packer = msg_packer(NETMSG_MAP_DATA, true);
        packer
            .add_int(last as i32)
            .add_int(self.map.crc as i32)
            .add_int(chunk)
            .add_int(data.len() as i32)
            .add_raw(data);
        self.send_msg(client_id, packer, true);
        Ok(())
    }

    fn on_ready(&mut self, client_id: usize) {
        let Some(slot) = self.clients.get_mut(client_id) else {
            return;
        };
        if slot.state != ClientState::Connecting {
            return;
        }
        slot.state = ClientState::Ready;
        info!("player is ready. ClientID={} addr={:?}", client_id, slot.addr);
        self.game.on_client_connected(client_id);
        self.send_msg(client_id, msg_packer(NETMSG_CON_READY, true), true);
    }

    fn on_enter_game(&mut self, client_id: usize) {
        let Some(slot) = self.clients.get_mut(client_id) else {
            return;
        };
        if slot.state != ClientState::Ready {
            return;
        }
        slot.state = ClientState::InGame;
        slot.reset_snapshots();
        info!("player has entered the game. ClientID={} addr={:?}", client_id, slot.addr);
        let name = slot.name.clone();
        self.game.on_client_enter(client_id);

        if self.has_database {
            let query = PlayerMap {
                map: self.map.name.clone(),
                name: name.clone(),
            };
            let result = self.pool.execute(score::best_time, query, "best time");
            self.pending_best_times.push((client_id, name, result));
        }
    }

    fn on_input(&mut self, client_id: usize, unpacker: &mut Unpacker<'_>) -> Result<(), ProtocolError> {
        if self.client_state(client_id) != ClientState::InGame {
            return Ok(());
        }

        let ack = unpacker.get_int()?;
        let intended_tick = unpacker.get_int()?;
        let size = unpacker.get_int()?;
        if size < 0 || size as usize > MAX_INPUT_SIZE || size % 4 != 0 {
            debug!("client {} sent input of invalid size {}", client_id, size);
            return Ok(());
        }
        if !(0..MAX_TICK).contains(&intended_tick) {
            debug!("client {} sent input for invalid tick {}", client_id, intended_tick);
            return Ok(());
        }
        let data = (0..size / 4)
            .map(|_| unpacker.get_int())
            .collect::<Result<Vec<i32>, _>>()?;

        let now = Instant::now();
        let tick = self.tick;
        let target = self.tick_start_time(intended_tick);
        let Some(slot) = self.clients.get_mut(client_id) else {
            return Ok(());
        };

        slot.ack_snapshot(ack, now);

        let timing = (intended_tick > slot.last_input_tick).then(|| {
            if target >= now {
                (target - now).as_millis().min(i32::MAX as u128) as i32
            } else {
                -((now - target).as_millis().min(i32::MAX as u128) as i32)
            }
        });
        slot.last_input_tick = intended_tick;

        // late inputs still get applied, on the next tick
        let game_tick = if intended_tick <= tick { tick + 1 } else { intended_tick };
        slot.push_input(game_tick, &data);

        if let Some(time_left) = timing {
            let mut packer = msg_packer(NETMSG_INPUTTIMING, true);
            packer.add_int(intended_tick).add_int(time_left);
            self.send_msg(client_id, packer, false);
        }

        self.game.on_client_direct_input(client_id, &data);
        Ok(())
    }

    fn on_rcon_auth(&mut self, client_id: usize, unpacker: &mut Unpacker<'_>) -> Result<(), ProtocolError> {
        let name = unpacker.get_string()?;
        let password = unpacker.get_string()?;

        let Some(slot) = self.clients.get_mut(client_id) else {
            return Ok(());
        };
        if slot.state == ClientState::Empty {
            return Ok(());
        }

        match self.auth.login(&name, &password) {
            Some(key) => {
                let level = self.auth.key_level(key);
                slot.auth_level = level;
                slot.auth_key = Some(key);
                slot.auth_tries = 0;
                slot.rcon_cmd_cursor = Some(0);
                slot.maplist_state = if !slot.sixup && level >= AuthLevel::Moderator {
                    MaplistState::Streaming(0)
                } else {
                    MaplistState::Disabled
                };
                let streaming = matches!(slot.maplist_state, MaplistState::Streaming(_));
                info!(
                    "ClientID={} addr={:?} authed with key={} ({})",
                    client_id,
                    slot.addr,
                    self.auth.key_ident(key).unwrap_or_default(),
                    level
                );

                let mut packer = msg_packer(NETMSG_RCON_AUTH_STATUS, true);
                packer.add_int(1).add_int(1);
                self.send_msg(client_id, packer, true);
                if streaming {
                    let mut packer = ext_msg_packer(ExtMsg::MaplistStart, true);
                    packer.add_int(self.maplist.len() as i32);
                    self.send_msg(client_id, packer, true);
                }
                self.send_rcon_line(client_id, &format!("{} authentication successful. Remote console access granted.", level));
            }
            None if self.live.rcon_max_tries > 0 => {
                slot.auth_tries += 1;
                let tries = slot.auth_tries;
                let addr = slot.addr;
                let max_tries = self.live.rcon_max_tries;
                self.send_rcon_line(client_id, &format!("Wrong password {}/{}.", tries, max_tries));
                if tries >= max_tries {
                    let reason = "Too many remote console authentication tries";
                    match addr {
                        Some(addr) if self.live.rcon_bantime > 0 => {
                            let minutes = self.live.rcon_bantime;
                            self.ban_ip(addr.ip(), minutes, reason, "rcon");
                        }
                        _ => self.drop_client(client_id, reason, true),
                    }
                }
            }
            None => self.send_rcon_line(client_id, "Wrong password."),
        }
        Ok(())
    }

    fn on_rcon_cmd(&mut self, client_id: usize, unpacker: &mut Unpacker<'_>) -> Result<(), ProtocolError> {
        let line = unpacker.get_string()?;
        if !self.clients.get(client_id).is_some_and(|slot| slot.is_authed()) {
            return Ok(());
        }
        info!("ClientID={} rcon='{}'", client_id, line);
        for output in self.execute_line(&line, Some(client_id)) {
            self.send_rcon_line(client_id, &output);
        }
        Ok(())
    }

    fn handle_connless(&mut self, body: &[u8], addr: SocketAddr) {
        let Some(request) = body.strip_prefix(&SERVERBROWSE_GETINFO[..]) else {
            debug!("ignoring connless packet from {}", addr);
            return;
        };
        let token = Unpacker::new(request).get_int().unwrap_or(0);
        let info = self.server_info(token);
        self.transport.send_connless(addr, &SERVERBROWSE_INFO, &info);
    }

    fn server_info(&self, token: i32) -> Vec<u8> {
        let connected: Vec<usize> = self
            .clients
            .iter()
            .filter(|(_, slot)| slot.state >= ClientState::Ready && slot.state != ClientState::Redirected)
            .map(|(client_id, _)| client_id)
            .collect();
        let players = connected
            .iter()
            .filter(|&&client_id| self.game.is_player(client_id))
            .count();

        let mut packer = Packer::new();
        packer
            .add_string(&token.to_string())
            .add_string(GAME_VERSION)
            .add_string(&self.config.name)
            .add_string(&self.map.name)
            .add_string(self.game.game_type())
            .add_int(!self.config.password.is_empty() as i32)
            .add_int(players as i32)
            .add_int(self.config.max_clients as i32)
            .add_int(connected.len() as i32)
            .add_int(self.config.max_clients as i32);

        for client_id in connected {
            if packer.size() > SERVER_INFO_BUDGET {
                break;
            }
            let Some(slot) = self.clients.get(client_id) else {
                continue;
            };
            packer
                .add_string(&slot.name)
                .add_string(&slot.clan)
                .add_int(slot.country)
                .add_int(self.game.score(client_id))
                .add_int(self.game.is_player(client_id) as i32);
        }
        packer.into_bytes()
    }

    fn send_payload(&mut self, client_id: usize, payload: Vec<u8>, vital: bool) {
        let Some(slot) = self.clients.get_mut(client_id) else {
            return;
        };
        let Some(addr) = slot.addr else {
            return;
        };
        let sequence = if vital { slot.next_sequence() } else { 0 };
        self.transport.send(
            addr,
            &Datagram::Chunk {
                vital,
                sequence,
                payload,
            },
        );
    }

    fn send_msg(&mut self, client_id: usize, packer: Packer, vital: bool) {
        if packer.error() {
            warn!("message for client {} does not fit in a packet", client_id);
            return;
        }
        self.send_payload(client_id, packer.into_bytes(), vital);
    }

    fn send_rcon_line(&mut self, client_id: usize, line: &str) {
        let mut packer = msg_packer(NETMSG_RCON_LINE, true);
        packer.add_string(line);
        self.send_msg(client_id, packer, true);
    }

    /// Frees the slot of `client_id`, telling the client why when `notify` is set
    fn drop_client(&mut self, client_id: usize, reason: &str, notify: bool) {
        let Some(slot) = self.clients.get(client_id) else {
            return;
        };
        let state = slot.state;
        let addr = slot.addr;
        if state == ClientState::Empty {
            return;
        }

        if let (true, Some(addr)) = (notify, addr) {
            self.transport.send(
                addr,
                &Datagram::Control(ControlMsg::Close {
                    reason: reason.to_string(),
                }),
            );
        }
        // redirected clients already left the game
        if state >= ClientState::Ready && state != ClientState::Redirected {
            self.game.on_client_drop(client_id, reason);
        }
        info!("client dropped. ClientID={} addr={:?} reason='{}'", client_id, addr, reason);
        self.clients.remove_client(client_id);
    }

    fn drop_banned(&mut self, ip: IpAddr, ban: &Ban) {
        let reason = ban.message(bans::unix_now());
        let banned: Vec<usize> = self
            .clients
            .iter()
            .filter(|(_, slot)| slot.addr.is_some_and(|addr| addr.ip() == ip))
            .map(|(client_id, _)| client_id)
            .collect();
        for client_id in banned {
            self.drop_client(client_id, &reason, true);
        }
    }

    fn ban_ip(&mut self, ip: IpAddr, minutes: u32, reason: &str, issuer: &str) -> String {
        let ban = self.bans.ban(ip, minutes, reason, bans::unix_now());
        if self.has_database {
            let player_name = self
                .clients
                .iter()
                .find(|(_, slot)| slot.addr.is_some_and(|addr| addr.ip() == ip))
                .map(|(_, slot)| slot.name.clone())
                .unwrap_or_default();
            self.pool.execute_write(
                bans::store_ban,
                BanRequest {
                    ip: ip.to_string(),
                    end: ban.end,
                    issuer: issuer.to_string(),
                    player_name,
                    reason: reason.to_string(),
                },
                "store ban",
            );
        }
        self.drop_banned(ip, &ban);
        format!("banned {} for {} minutes ({})", ip, minutes, reason)
    }

    /// Parses and runs one console line. `caller` is the rcon client issuing
    /// it, `None` for the local console.
    pub fn execute_line(&mut self, line: &str, caller: Option<usize>) -> Vec<String> {
        let command = match console::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return Vec::new(),
            Err(e) => return vec![e],
        };

        let level = match caller {
            Some(client_id) => self
                .clients
                .get(client_id)
                .map_or(AuthLevel::None, |slot| slot.auth_level),
            None => AuthLevel::Admin,
        };
        if command.level() > level {
            return vec![format!("you are not allowed to use '{}'", command.name())];
        }
        self.execute(command, level)
    }

    fn execute(&mut self, command: Command, level: AuthLevel) -> Vec<String> {
        match command {
            Command::AddSqlServer {
                mode,
                database,
                prefix,
                user,
                password,
                ip,
                port,
                setup,
            } => {
                if !self.config.use_sql {
                    return vec!["adding sql servers is disabled, start the server with --use-sql".to_string()];
                }
                let connection = MysqlConnection::new(MysqlConfig {
                    database,
                    prefix,
                    user,
                    password,
                    ip,
                    port,
                    setup,
                });
                self.pool.register_database(Box::new(connection), mode);
                self.has_database = true;
                vec![format!("queued {} server registration", mode)]
            }
            Command::DumpSqlServers(mode) => {
                self.pool.print(mode);
                Vec::new()
            }
            Command::AuthAdd {
                ident,
                level,
                password,
            } => match self.auth.add_key(&ident, &password, level) {
                Some(_) => vec![format!("added key {} ({})", ident, level)],
                None => vec![format!("ident '{}' already exists", ident)],
            },
            Command::AuthAddHashed {
                ident,
                level,
                hash,
                salt,
            } => match self.auth.add_key_hex(&ident, &hash, &salt, level) {
                Ok(_) => vec![format!("added key {} ({})", ident, level)],
                Err(e) => vec![e],
            },
            Command::AuthRemove(ident) => {
                let Some(index) = self.auth.remove_key(&ident) else {
                    return vec![format!("ident '{}' not found", ident)];
                };
                for client_id in self.clients.on_key_removed(index) {
                    let mut packer = msg_packer(NETMSG_RCON_AUTH_STATUS, true);
                    packer.add_int(0).add_int(0);
                    self.send_msg(client_id, packer, true);
                    self.send_rcon_line(client_id, "Logged out by removal of your key.");
                }
                vec![format!("removed key {}", ident)]
            }
            Command::AuthList => {
                let mut lines = self.auth.list();
                lines.push(format!("{} keys", self.auth.num_keys()));
                lines
            }
            Command::AuthUpdate {
                ident,
                level,
                password,
            } => match self.auth.update_key(&ident, &password, level) {
                Some(_) => vec![format!("updated key {} ({})", ident, level)],
                None => vec![format!("ident '{}' not found", ident)],
            },
            Command::Status => self
                .clients
                .iter()
                .map(|(client_id, slot)| {
                    format!(
                        "id={} addr={} name='{}' state={:?} score={} latency={}{}",
                        client_id,
                        slot.addr.map(|addr| addr.to_string()).unwrap_or_default(),
                        slot.name,
                        slot.state,
                        self.game.score(client_id),
                        slot.latency,
                        if slot.is_authed() {
                            format!(" ({})", slot.auth_level)
                        } else {
                            String::new()
                        }
                    )
                })
                .collect(),
            Command::Kick { client_id, reason } => {
                let Some(target) = self.clients.get(client_id).filter(|slot| slot.state != ClientState::Empty) else {
                    return vec![format!("invalid client id {}", client_id)];
                };
                if target.auth_level > level {
                    return vec!["you can't kick someone with a higher auth level".to_string()];
                }
                let reason = if reason.is_empty() {
                    "Kicked by console".to_string()
                } else {
                    reason
                };
                self.drop_client(client_id, &reason, true);
                vec![format!("kicked client {} ({})", client_id, reason)]
            }
            Command::Ban { ip, minutes, reason } => match ip.parse::<IpAddr>() {
                Ok(ip) => vec![self.ban_ip(ip, minutes, &reason, "console")],
                Err(_) => vec![format!("invalid address '{}'", ip)],
            },
            Command::Unban(ip) => {
                let Ok(addr) = ip.parse::<IpAddr>() else {
                    return vec![format!("invalid address '{}'", ip)];
                };
                let removed = self.bans.unban(&addr);
                if self.has_database {
                    self.pool.execute_write(bans::remove_ban, addr.to_string(), "remove ban");
                }
                if removed {
                    vec![format!("unbanned {}", addr)]
                } else {
                    vec![format!("{} is not banned", addr)]
                }
            }
            Command::Redirect { client_id, port } => self.redirect(client_id, port),
            Command::Reload => self.reload_map(),
            Command::Shutdown => {
                self.running = false;
                vec!["shutting down".to_string()]
            }
            Command::Help => COMMANDS
                .iter()
                .filter(|info| info.level <= level)
                .map(|info| format!("{} {} - {}", info.name, info.params, info.help))
                .collect(),
        }
    }

    fn redirect(&mut self, client_id: usize, port: u16) -> Vec<String> {
        let state = self.client_state(client_id);
        if state != ClientState::Ready && state != ClientState::InGame {
            return vec![format!("client {} can't be redirected right now", client_id)];
        }

        let mut packer = ext_msg_packer(ExtMsg::Redirect, true);
        packer.add_int(i32::from(port));
        self.send_msg(client_id, packer, true);

        self.game.on_client_drop(client_id, "redirected");
        if let Some(slot) = self.clients.get_mut(client_id) {
            slot.state = ClientState::Redirected;
            slot.redirect_drop_time = Some(Instant::now() + REDIRECT_DROP_DELAY);
        }
        vec![format!("redirected client {} to port {}", client_id, port)]
    }

    fn reload_map(&mut self) -> Vec<String> {
        let map = match MapFile::load(&self.config.maps_dir, &self.config.map) {
            Ok(map) => map,
            Err(e) => return vec![e.to_string()],
        };
        self.map = map;
        self.maplist = map::list_maps(&self.config.maps_dir);

        let loading: Vec<(usize, ClientState)> = self
            .clients
            .iter()
            .filter(|(_, slot)| {
                matches!(
                    slot.state,
                    ClientState::Connecting | ClientState::Ready | ClientState::InGame
                )
            })
            .map(|(client_id, slot)| (client_id, slot.state))
            .collect();
        for (client_id, state) in loading {
            if state >= ClientState::Ready {
                self.game.on_client_drop(client_id, "map reload");
            }
            if let Some(slot) = self.clients.get_mut(client_id) {
                slot.state = ClientState::Connecting;
                slot.reset_snapshots();
            }
            self.send_map(client_id);
        }
        vec![format!("reloaded map '{}'", self.map.name)]
    }

    fn shutdown(&mut self) {
        let occupied: Vec<usize> = self.clients.iter().map(|(client_id, _)| client_id).collect();
        for client_id in occupied {
            self.drop_client(client_id, "Server shutdown", true);
        }
        // draining the workers blocks the thread
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.pool.on_shutdown());
            }
            _ => self.pool.on_shutdown(),
        }
        info!("server stopped at tick {}", self.tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::World;
    use std::path::PathBuf;

    fn test_config(maps_dir: PathBuf) -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            max_clients: 2,
            tick_speed: SERVER_TICK_SPEED,
            high_bandwidth: false,
            name: "test server".to_string(),
            map: "test".to_string(),
            maps_dir,
            password: String::new(),
            sqlite_file: None,
            use_sql: false,
            timeout: Duration::from_secs(30),
            sql_prefix: "record".to_string(),
            sql_server: "TST".to_string(),
            exec: Vec::new(),
        }
    }

    fn test_live() -> LiveConfig {
        LiveConfig {
            rcon_password: "admin".to_string(),
            rcon_mod_password: "mod".to_string(),
            rcon_helper_password: String::new(),
            rcon_max_tries: 3,
            rcon_bantime: 0,
        }
    }

    async fn test_server(dir: &tempfile::TempDir) -> Server {
        std::fs::write(dir.path().join("test.map"), vec![1u8; MAP_CHUNK_SIZE + 100]).unwrap();
        Server::new(test_config(dir.path().to_path_buf()), test_live(), Box::new(World::new()))
            .await
            .unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new("127.0.0.1".parse().unwrap(), port)
    }

    fn send(server: &mut Server, from: SocketAddr, datagram: Datagram) {
        server.handle_message(ServerMessage::PacketReceived { datagram, addr: from });
    }

    fn send_msg(server: &mut Server, from: SocketAddr, sequence: u16, packer: Packer) {
        send(
            server,
            from,
            Datagram::Chunk {
                vital: true,
                sequence,
                payload: packer.into_bytes(),
            },
        );
    }

    fn connect(server: &mut Server, from: SocketAddr) -> usize {
        send(server, from, Datagram::Control(ControlMsg::Connect { sixup: false }));
        server.clients.find_client_by_addr(from).unwrap()
    }

    fn info_msg(version: &str, password: &str) -> Packer {
        let mut packer = msg_packer(NETMSG_INFO, true);
        packer.add_string(version).add_string(password).add_string("nameless tee");
        packer
    }

    /// Connects a client and walks it through the handshake into the game
    fn enter_game(server: &mut Server, from: SocketAddr) -> usize {
        let client_id = connect(server, from);
        send_msg(server, from, 1, info_msg(NET_VERSION, ""));
        send_msg(server, from, 2, msg_packer(NETMSG_READY, true));
        send_msg(server, from, 3, msg_packer(NETMSG_ENTERGAME, true));
        client_id
    }

    #[tokio::test]
    async fn test_handshake_reaches_game() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(&dir).await;
        let from = addr(40001);

        let client_id = connect(&mut server, from);
        assert_eq!(server.client_state(client_id), ClientState::PreAuth);

        let mut version = ext_msg_packer(ExtMsg::ClientVer, true);
        version.add_int(16050).add_string("DDNet 16.5");
        send_msg(&mut server, from, 1, version);
        assert_eq!(server.client_state(client_id), ClientState::Auth);
        assert_eq!(server.clients.get(client_id).unwrap().version, 16050);

        send_msg(&mut server, from, 2, info_msg(NET_VERSION, ""));
        assert_eq!(server.client_state(client_id), ClientState::Connecting);
        assert_eq!(server.clients.get(client_id).unwrap().name, "nameless tee");

        send_msg(&mut server, from, 3, msg_packer(NETMSG_READY, true));
        assert_eq!(server.client_state(client_id), ClientState::Ready);

        send_msg(&mut server, from, 4, msg_packer(NETMSG_ENTERGAME, true));
        assert_eq!(server.client_state(client_id), ClientState::InGame);
        assert!(server.game.is_player(client_id));
    }

    #[tokio::test]
    async fn test_out_of_order_messages_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(&dir).await;
        let from = addr(40002);
        let client_id = connect(&mut server, from);

        send_msg(&mut server, from, 1, msg_packer(NETMSG_ENTERGAME, true));
        send_msg(&mut server, from, 2, msg_packer(NETMSG_READY, true));
        assert_eq!(server.client_state(client_id), ClientState::PreAuth);
        assert!(!server.game.is_player(client_id));
    }

    #[tokio::test]
    async fn test_wrong_version_and_password_drop_client() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(&dir).await;
        server.config.password = "secret".to_string();

        let from = addr(40003);
        connect(&mut server, from);
        send_msg(&mut server, from, 1, info_msg("0.5 b67d1f1a1eea234e", "secret"));
        assert!(server.clients.find_client_by_addr(from).is_none());

        connect(&mut server, from);
        send_msg(&mut server, from, 1, info_msg(NET_VERSION, "guess"));
        assert!(server.clients.find_client_by_addr(from).is_none());

        let client_id = connect(&mut server, from);
        send_msg(&mut server, from, 1, info_msg(NET_VERSION, "secret"));
        assert_eq!(server.client_state(client_id), ClientState::Connecting);
    }

    #[tokio::test]
    async fn test_duplicate_vital_is_processed_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(&dir).await;
        let from = addr(40004);
        let client_id = connect(&mut server, from);

        send_msg(&mut server, from, 1, info_msg(NET_VERSION, ""));
        send_msg(&mut server, from, 2, msg_packer(NETMSG_READY, true));
        // a resent INFO must not move the client back
        send_msg(&mut server, from, 1, info_msg(NET_VERSION, ""));
        assert_eq!(server.client_state(client_id), ClientState::Ready);
        assert_eq!(server.clients.get(client_id).unwrap().traffic.packets_in, 3);
    }

    #[tokio::test]
    async fn test_full_server_rejects_connect() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(&dir).await;
        connect(&mut server, addr(40010));
        connect(&mut server, addr(40011));

        send(&mut server, addr(40012), Datagram::Control(ControlMsg::Connect { sixup: false }));
        assert!(server.clients.find_client_by_addr(addr(40012)).is_none());
        assert_eq!(server.clients.len(), 2);
    }

    #[tokio::test]
    async fn test_input_is_scheduled_and_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(&dir).await;
        let from = addr(40005);
        let client_id = enter_game(&mut server, from);
        server.tick = 100;

        let mut input = msg_packer(NETMSG_INPUT, true);
        input.add_int(-1).add_int(103).add_int(16);
        for value in [1, 0, 0, 0] {
            input.add_int(value);
        }
        send(
            &mut server,
            from,
            Datagram::Chunk {
                vital: false,
                sequence: 0,
                payload: input.into_bytes(),
            },
        );

        let slot = server.clients.get(client_id).unwrap();
        assert_eq!(slot.last_input_tick, 103);
        assert_eq!(slot.inputs_for_tick(103).count(), 1);

        // an input for a tick that already passed lands on the next one
        let mut late = msg_packer(NETMSG_INPUT, true);
        late.add_int(-1).add_int(50).add_int(4).add_int(-1);
        send(
            &mut server,
            from,
            Datagram::Chunk {
                vital: false,
                sequence: 0,
                payload: late.into_bytes(),
            },
        );
        let slot = server.clients.get(client_id).unwrap();
        assert_eq!(slot.inputs_for_tick(101).next().unwrap().data, vec![-1]);
        assert_eq!(slot.last_input_tick, 50);
    }

    #[tokio::test]
    async fn test_invalid_input_size_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(&dir).await;
        let from = addr(40006);
        let client_id = enter_game(&mut server, from);

        let mut input = msg_packer(NETMSG_INPUT, true);
        input.add_int(-1).add_int(10).add_int(MAX_INPUT_SIZE as i32 + 4);
        send_msg(&mut server, from, 4, input);
        assert_eq!(server.clients.get(client_id).unwrap().last_input_tick, -1);
    }

    #[tokio::test]
    async fn test_rcon_login_and_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(&dir).await;
        let from = addr(40007);
        let client_id = enter_game(&mut server, from);

        let mut auth = msg_packer(NETMSG_RCON_AUTH, true);
        auth.add_string("").add_string("mod");
        send_msg(&mut server, from, 4, auth);
        let slot = server.clients.get(client_id).unwrap();
        assert_eq!(slot.auth_level, AuthLevel::Moderator);
        assert_eq!(slot.rcon_cmd_cursor, Some(0));
        assert_eq!(slot.maplist_state, MaplistState::Streaming(0));

        assert_eq!(
            server.execute_line("shutdown", Some(client_id)),
            vec!["you are not allowed to use 'shutdown'".to_string()]
        );
        assert!(!server.execute_line("help", Some(client_id)).is_empty());
    }

    #[tokio::test]
    async fn test_rcon_streaming_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(&dir).await;
        let from = addr(40008);
        let client_id = enter_game(&mut server, from);

        let mut auth = msg_packer(NETMSG_RCON_AUTH, true);
        auth.add_string("").add_string("admin");
        send_msg(&mut server, from, 4, auth);

        for tick in 0..4 {
            server.tick = (tick * MAX_CLIENTS + client_id) as i32;
            server.stream_rcon_info();
        }
        let slot = server.clients.get(client_id).unwrap();
        assert_eq!(slot.rcon_cmd_cursor, None);
        assert_eq!(slot.maplist_state, MaplistState::Done);
    }

    #[tokio::test]
    async fn test_rcon_brute_force_is_kicked() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(&dir).await;
        let from = addr(40009);
        connect(&mut server, from);

        for sequence in 1..=3 {
            let mut auth = msg_packer(NETMSG_RCON_AUTH, true);
            auth.add_string("").add_string("guess");
            send_msg(&mut server, from, sequence, auth);
        }
        assert!(server.clients.find_client_by_addr(from).is_none());
    }

    #[tokio::test]
    async fn test_ban_drops_and_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(&dir).await;
        let from = addr(40013);
        enter_game(&mut server, from);

        server.execute_line("ban 127.0.0.1 5 spam", None);
        assert!(server.clients.is_empty());
        assert!(!server.game.is_player(0));

        send(&mut server, from, Datagram::Control(ControlMsg::Connect { sixup: false }));
        assert!(server.clients.is_empty());

        server.execute_line("unban 127.0.0.1", None);
        connect(&mut server, from);
        assert_eq!(server.clients.len(), 1);
    }

    #[tokio::test]
    async fn test_redirect_ignores_client_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(&dir).await;
        let from = addr(40014);
        let client_id = enter_game(&mut server, from);

        server.execute_line(&format!("redirect {} 8304", client_id), None);
        assert_eq!(server.client_state(client_id), ClientState::Redirected);
        assert!(!server.game.is_player(client_id));

        let mut auth = msg_packer(NETMSG_RCON_AUTH, true);
        auth.add_string("").add_string("admin");
        send_msg(&mut server, from, 4, auth);
        assert!(!server.clients.get(client_id).unwrap().is_authed());

        let later = Instant::now() + REDIRECT_DROP_DELAY + Duration::from_secs(1);
        assert_eq!(server.clients.expired_redirects(later), vec![client_id]);
    }

    #[tokio::test]
    async fn test_reload_sends_clients_back_to_loading() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(&dir).await;
        let client_id = enter_game(&mut server, addr(40015));

        std::fs::write(dir.path().join("test.map"), b"new layout").unwrap();
        server.execute_line("reload", None);
        assert_eq!(server.map.size(), 10);
        assert_eq!(server.client_state(client_id), ClientState::Connecting);
        assert!(!server.game.is_player(client_id));
    }

    #[tokio::test]
    async fn test_tick_runs_game_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(&dir).await;
        let client_id = enter_game(&mut server, addr(40016));

        server.game_start = Instant::now() - Duration::from_millis(110);
        server.update();
        assert_eq!(server.tick, 5);
        // tick 5 is odd so nothing was built yet
        assert_eq!(server.clients.get(client_id).unwrap().snapshots.len(), 0);

        server.game_start -= Duration::from_millis(500);
        server.update();
        assert_eq!(server.tick, 30);
        // init rate snapshots land on multiples of ten
        assert_eq!(server.clients.get(client_id).unwrap().snapshots.oldest_tick(), Some(30));
    }

    struct TickLog(Arc<std::sync::Mutex<Vec<(i32, usize)>>>);

    impl DemoRecorder for TickLog {
        fn record_snapshot(&mut self, tick: i32, snap: &shared::Snapshot) {
            if let Ok(mut ticks) = self.0.lock() {
                ticks.push((tick, snap.num_items()));
            }
        }
    }

    #[tokio::test]
    async fn test_demo_sees_every_snapshot_tick() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(&dir).await;
        let recorded = Arc::new(std::sync::Mutex::new(Vec::new()));
        server.set_demo_recorder(Box::new(TickLog(Arc::clone(&recorded))));
        server.config.high_bandwidth = true;
        enter_game(&mut server, addr(40018));

        server.game_start = Instant::now() - Duration::from_millis(50);
        server.update();

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        let (tick, items) = recorded[0];
        assert_eq!(tick, server.tick());
        // game info, player info and character
        assert_eq!(items, 3);
    }

    async fn run_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(&dir).await;
        server.message_sender().send(ServerMessage::Shutdown).unwrap();
        server.run().await.unwrap();
        assert!(server.pool.is_shut_down());
    }

    #[tokio::test]
    async fn test_run_stops_on_current_thread_runtime() {
        run_until_shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_stops_on_multi_thread_runtime() {
        run_until_shutdown().await;
    }

    async fn finish_one_race(use_sql: bool) -> (tempfile::TempDir, rusqlite::Connection) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("test.map"), vec![1u8; 64]).unwrap();
        let path = dir.path().join("records.sqlite");
        let mut config = test_config(dir.path().to_path_buf());
        config.sqlite_file = Some(path.clone());
        config.use_sql = use_sql;
        let mut server = Server::new(config, test_live(), Box::new(World::new()))
            .await
            .unwrap();
        let client_id = enter_game(&mut server, addr(40019));
        server.game.on_client_predicted_input(client_id, &[1, 0, 0, 0]);

        while server.game.score(client_id) == 0 && server.tick < 1000 {
            server.tick += 1;
            server.do_tick();
        }
        assert_eq!(server.game.score(client_id), 1);
        let best = server.clients.get(client_id).unwrap().best_time.unwrap();
        assert!(best > 0.0);

        tokio::task::block_in_place(|| server.pool.on_shutdown());
        let db = rusqlite::Connection::open(&path).unwrap();
        (dir, db)
    }

    fn race_rows(db: &rusqlite::Connection, table: &str) -> Vec<(String, String, String)> {
        let mut stmt = db
            .prepare(&format!("SELECT Map, Name, Server FROM record_{}", table))
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_finish_is_stored_in_local_database() {
        let (_dir, db) = finish_one_race(false).await;
        assert_eq!(
            race_rows(&db, "race"),
            vec![("test".to_string(), "nameless tee".to_string(), "TST".to_string())]
        );
        assert!(race_rows(&db, "race_backup").is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_finish_moves_through_backup_without_write_server() {
        let (_dir, db) = finish_one_race(true).await;
        // no write server was added, so the backup row ends up in the race table
        assert_eq!(race_rows(&db, "race").len(), 1);
        assert!(race_rows(&db, "race_backup").is_empty());
    }

    #[tokio::test]
    async fn test_server_info_lists_players() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(&dir).await;
        enter_game(&mut server, addr(40017));

        let info = server.server_info(7);
        let mut unpacker = Unpacker::new(&info);
        assert_eq!(unpacker.get_string().unwrap(), "7");
        assert_eq!(unpacker.get_string().unwrap(), GAME_VERSION);
        assert_eq!(unpacker.get_string().unwrap(), "test server");
        assert_eq!(unpacker.get_string().unwrap(), "test");
        assert_eq!(unpacker.get_string().unwrap(), "DDraceNetwork");
        assert_eq!(unpacker.get_int().unwrap(), 0);
        assert_eq!(unpacker.get_int().unwrap(), 1);
        assert_eq!(unpacker.get_int().unwrap(), 2);
        assert_eq!(unpacker.get_int().unwrap(), 1);
        assert_eq!(unpacker.get_int().unwrap(), 2);
        assert_eq!(unpacker.get_string().unwrap(), "nameless tee");
    }
}
