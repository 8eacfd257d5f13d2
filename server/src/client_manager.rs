//! Client slot table
//!
//! The server owns a fixed array of slots. A slot is reinitialised when a
//! connection is accepted and reset when the client drops; slots are never
//! freed, only reused.
//!
//! Connection phases only advance when the matching system message arrives:
//!
//! ```text
//! Empty -> PreAuth -> Auth -> Connecting -> Ready -> InGame
//!                                            |         |
//!                                            +-> Redirected (expires)
//! ```

use crate::auth::AuthLevel;
use log::info;
use shared::protocol::MAX_INPUT_SIZE;
use shared::SnapshotStorage;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Size of the per-client input ring
pub const INPUT_RING_SIZE: usize = 200;
/// Number of ints in one input sample
pub const MAX_INPUT_INTS: usize = MAX_INPUT_SIZE / 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientState {
    Empty,
    PreAuth,
    Auth,
    Connecting,
    Ready,
    InGame,
    Redirected,
}

/// How often a client receives snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapRate {
    /// Freshly entered, nothing acknowledged yet
    Init,
    /// Acknowledging normally
    Full,
    /// Acknowledged snapshot fell out of the history
    Recover,
}

impl SnapRate {
    pub fn is_recovering(self) -> bool {
        matches!(self, SnapRate::Init | SnapRate::Recover)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaplistState {
    Uninitialized,
    Streaming(usize),
    Done,
    Disabled,
}

/// One input sample from a client, applied at `game_tick`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    pub game_tick: i32,
    pub data: Vec<i32>,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            game_tick: -1,
            data: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Traffic {
    pub packets_in: u64,
    pub bytes_in: u64,
}

#[derive(Debug)]
pub struct ClientSlot {
    pub state: ClientState,
    pub addr: Option<SocketAddr>,
    pub sixup: bool,
    pub last_seen: Instant,

    pub name: String,
    pub clan: String,
    pub country: i32,
    pub version: i32,

    pub auth_level: AuthLevel,
    pub auth_key: Option<usize>,
    pub auth_tries: u32,

    pub snapshots: SnapshotStorage,
    pub last_acked_snapshot: i32,
    pub snap_rate: SnapRate,
    pub latency: i32,
    /// Fastest finish on the current map, from the database or this session
    pub best_time: Option<f32>,

    pub inputs: Vec<Input>,
    pub current_input: usize,
    pub last_input_tick: i32,
    pub latest_input: Input,

    /// Next rcon command to stream, `None` when nothing is pending
    pub rcon_cmd_cursor: Option<usize>,
    pub maplist_state: MaplistState,
    pub redirect_drop_time: Option<Instant>,
    pub traffic: Traffic,

    send_sequence: u16,
    recv_sequence: Option<u16>,
}

impl ClientSlot {
    fn new() -> Self {
        Self {
            state: ClientState::Empty,
            addr: None,
            sixup: false,
            last_seen: Instant::now(),
            name: String::new(),
            clan: String::new(),
            country: -1,
            version: 0,
            auth_level: AuthLevel::None,
            auth_key: None,
            auth_tries: 0,
            snapshots: SnapshotStorage::new(),
            last_acked_snapshot: -1,
            snap_rate: SnapRate::Init,
            latency: 0,
            best_time: None,
            inputs: vec![Input::default(); INPUT_RING_SIZE],
            current_input: 0,
            last_input_tick: -1,
            latest_input: Input::default(),
            rcon_cmd_cursor: None,
            maplist_state: MaplistState::Uninitialized,
            redirect_drop_time: None,
            traffic: Traffic::default(),
            send_sequence: 0,
            recv_sequence: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Clears snapshot state so the next snapshot is sent in full
    pub fn reset_snapshots(&mut self) {
        self.snapshots.purge_all();
        self.last_acked_snapshot = -1;
        self.snap_rate = SnapRate::Init;
    }

    pub fn is_authed(&self) -> bool {
        self.auth_level > AuthLevel::None
    }

    pub fn logout(&mut self) {
        self.auth_level = AuthLevel::None;
        self.auth_key = None;
        self.rcon_cmd_cursor = None;
        self.maplist_state = MaplistState::Uninitialized;
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    pub fn next_sequence(&mut self) -> u16 {
        self.send_sequence = self.send_sequence.wrapping_add(1);
        self.send_sequence
    }

    /// Returns false for a vital chunk that was already seen
    pub fn accept_vital(&mut self, sequence: u16) -> bool {
        if let Some(last) = self.recv_sequence {
            if (sequence.wrapping_sub(last) as i16) <= 0 {
                return false;
            }
        }
        self.recv_sequence = Some(sequence);
        true
    }

    /// Records an acknowledgement. The ack only sticks while the snapshot is
    /// still in the history; otherwise the client is owed a full snapshot.
    pub fn ack_snapshot(&mut self, tick: i32, now: Instant) {
        match self.snapshots.get(tick) {
            Some(holder) => {
                let latency = now.saturating_duration_since(holder.tagtime);
                self.latency = latency.as_millis().min(i32::MAX as u128) as i32;
                self.last_acked_snapshot = tick;
                if tick > 0 {
                    self.snap_rate = SnapRate::Full;
                }
            }
            None => self.last_acked_snapshot = -1,
        }
    }

    /// Stores an input sample in the ring and returns its slot index
    pub fn push_input(&mut self, game_tick: i32, data: &[i32]) -> usize {
        let index = self.current_input;
        let input = &mut self.inputs[index];
        input.game_tick = game_tick;
        input.data.clear();
        input.data.extend_from_slice(&data[..data.len().min(MAX_INPUT_INTS)]);
        self.latest_input = input.clone();
        self.current_input = (self.current_input + 1) % INPUT_RING_SIZE;
        index
    }

    /// Inputs scheduled for `tick`, oldest first
    pub fn inputs_for_tick(&self, tick: i32) -> impl Iterator<Item = &Input> + '_ {
        (0..INPUT_RING_SIZE)
            .map(move |offset| &self.inputs[(self.current_input + offset) % INPUT_RING_SIZE])
            .filter(move |input| input.game_tick == tick)
    }
}

/// Fixed array of client slots
pub struct ClientTable {
    slots: Vec<ClientSlot>,
    max_clients: usize,
}

impl ClientTable {
    pub fn new(max_clients: usize) -> Self {
        Self {
            slots: (0..max_clients).map(|_| ClientSlot::new()).collect(),
            max_clients,
        }
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Claims the first free slot for `addr`
    pub fn add_client(&mut self, addr: SocketAddr, sixup: bool) -> Option<usize> {
        let client_id = self
            .slots
            .iter()
            .position(|slot| slot.state == ClientState::Empty)?;
        let slot = &mut self.slots[client_id];
        slot.reset();
        slot.state = ClientState::PreAuth;
        slot.addr = Some(addr);
        slot.sixup = sixup;
        slot.last_seen = Instant::now();
        info!("client {} connected from {}", client_id, addr);
        Some(client_id)
    }

    pub fn remove_client(&mut self, client_id: usize) -> bool {
        match self.slots.get_mut(client_id) {
            Some(slot) if slot.state != ClientState::Empty => {
                slot.reset();
                true
            }
            _ => false,
        }
    }

    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.state != ClientState::Empty && slot.addr == Some(addr))
    }

    pub fn get(&self, client_id: usize) -> Option<&ClientSlot> {
        self.slots.get(client_id)
    }

    pub fn get_mut(&mut self, client_id: usize) -> Option<&mut ClientSlot> {
        self.slots.get_mut(client_id)
    }

    /// Occupied slots with their ids
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ClientSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state != ClientState::Empty)
    }

    pub fn ids_in_state(&self, state: ClientState) -> Vec<usize> {
        self.iter()
            .filter(|(_, slot)| slot.state == state)
            .map(|(id, _)| id)
            .collect()
    }

    /// Slots that have been silent for longer than `timeout`
    pub fn check_timeouts(&self, timeout: Duration) -> Vec<usize> {
        self.iter()
            .filter(|(_, slot)| slot.is_timed_out(timeout))
            .map(|(id, _)| id)
            .collect()
    }

    /// Redirected slots whose drop time has passed
    pub fn expired_redirects(&self, now: Instant) -> Vec<usize> {
        self.iter()
            .filter(|(_, slot)| {
                slot.state == ClientState::Redirected
                    && slot.redirect_drop_time.is_some_and(|time| time <= now)
            })
            .map(|(id, _)| id)
            .collect()
    }

    /// Fixes up the key indices of logged in clients after a key was removed.
    /// Clients using the removed key are logged out and returned.
    pub fn on_key_removed(&mut self, removed: usize) -> Vec<usize> {
        let mut logged_out = Vec::new();
        for (id, slot) in self.slots.iter_mut().enumerate() {
            match slot.auth_key {
                Some(key) if key == removed => {
                    slot.logout();
                    logged_out.push(id);
                }
                Some(key) if key > removed => slot.auth_key = Some(key - 1),
                _ => {}
            }
        }
        logged_out
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
