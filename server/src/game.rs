//! Game logic collaborator
//!
//! The server core only talks to the game through [`GameController`]. [`World`]
//! is the built-in implementation: tees running and jumping on a flat floor
//! towards a finish line at the right edge, enough to exercise input handling,
//! snapshots and race records end to end.

use log::info;
use shared::{SnapshotBuilder, Unpacker};
use std::collections::BTreeMap;

/// Snapshot item types produced by [`World`]
pub const OBJ_GAME_INFO: u16 = 6;
pub const OBJ_CHARACTER: u16 = 9;
pub const OBJ_PLAYER_INFO: u16 = 10;

pub const GAME_INFO_SIZE: usize = 3;
pub const CHARACTER_SIZE: usize = 6;
pub const PLAYER_INFO_SIZE: usize = 3;

pub const WORLD_WIDTH: f32 = 1600.0;
pub const FLOOR_Y: f32 = 800.0;
pub const PLAYER_SIZE: f32 = 28.0;
pub const PLAYER_SPEED: f32 = 300.0;
pub const JUMP_VELOCITY: f32 = -600.0;
pub const GRAVITY: f32 = 1500.0;
/// Characters reaching this x finish the race
pub const FINISH_X: f32 = WORLD_WIDTH - PLAYER_SIZE;
/// Distance between race checkpoints
pub const CHECKPOINT_SPACING: f32 = 400.0;

/// Input layout: direction (-1, 0, 1), target x, target y, jump flag
pub const INPUT_DIRECTION: usize = 0;
pub const INPUT_JUMP: usize = 3;

/// A race completed during a tick
#[derive(Debug, Clone, PartialEq)]
pub struct RaceFinish {
    pub client_id: usize,
    /// Seconds from spawn to finish
    pub time: f32,
    /// Seconds at each checkpoint passed, in order
    pub checkpoints: Vec<f32>,
}

/// Callbacks from the server into the game
pub trait GameController: Send {
    /// The client finished loading the map and is ready to join
    fn on_client_connected(&mut self, client_id: usize);
    fn on_client_enter(&mut self, client_id: usize);
    fn on_client_drop(&mut self, client_id: usize, reason: &str);
    /// Input as soon as it arrives
    fn on_client_direct_input(&mut self, client_id: usize, input: &[i32]);
    /// Input scheduled for the current tick
    fn on_client_predicted_input(&mut self, client_id: usize, input: &[i32]);
    /// A vital game message from a client that is at least ready
    fn on_message(&mut self, client_id: usize, msg_id: i32, unpacker: &mut Unpacker<'_>);
    fn on_tick(&mut self, tick: i32, tick_speed: i32);
    /// Fills the snapshot seen by `observer`; -1 is the demo observer that
    /// sees everything
    fn on_snap(&self, observer: i32, tick: i32, builder: &mut SnapshotBuilder);
    /// Score shown in server info
    fn score(&self, client_id: usize) -> i32;
    fn is_player(&self, client_id: usize) -> bool;
    fn game_type(&self) -> &str;
    /// Fixed item sizes, in ints, shared with the clients' delta engine
    fn item_sizes(&self) -> Vec<(u16, usize)> {
        Vec::new()
    }
    /// Races finished since the last call; the server stores them
    fn take_finishes(&mut self) -> Vec<RaceFinish> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Character {
    pub x: f32,
    pub y: f32,
    pub vel_x: f32,
    pub vel_y: f32,
    pub on_ground: bool,
    pub direction: i32,
    pub jump: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub client_id: usize,
    pub character: Option<Character>,
    pub score: i32,
    /// Ticks since the character spawned
    pub race_ticks: i32,
    pub checkpoints: Vec<f32>,
}

impl Player {
    fn new(client_id: usize) -> Self {
        Self {
            client_id,
            character: None,
            score: 0,
            race_ticks: 0,
            checkpoints: Vec::new(),
        }
    }

    fn respawn(&mut self) {
        self.character = Some(World::spawn(self.client_id));
        self.race_ticks = 0;
        self.checkpoints.clear();
    }
}

#[derive(Debug, Default)]
pub struct World {
    pub players: BTreeMap<usize, Player>,
    round_start_tick: i32,
    finishes: Vec<RaceFinish>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn(client_id: usize) -> Character {
        let spawn_x = 100.0 + (client_id as f32 * 60.0) % (WORLD_WIDTH - 200.0);
        Character {
            x: spawn_x,
            y: FLOOR_Y - PLAYER_SIZE,
            vel_x: 0.0,
            vel_y: 0.0,
            on_ground: true,
            direction: 0,
            jump: false,
        }
    }

    fn apply_input(character: &mut Character, input: &[i32]) {
        character.direction = input.get(INPUT_DIRECTION).copied().unwrap_or(0).clamp(-1, 1);
        character.jump = input.get(INPUT_JUMP).is_some_and(|&jump| jump != 0);
    }

    fn step(character: &mut Character, dt: f32) {
        character.vel_x = character.direction as f32 * PLAYER_SPEED;
        if character.jump && character.on_ground {
            character.vel_y = JUMP_VELOCITY;
            character.on_ground = false;
        }
        if !character.on_ground {
            character.vel_y += GRAVITY * dt;
        }

        character.x += character.vel_x * dt;
        character.y += character.vel_y * dt;
        character.x = character.x.clamp(0.0, WORLD_WIDTH - PLAYER_SIZE);

        if character.y + PLAYER_SIZE >= FLOOR_Y {
            character.y = FLOOR_Y - PLAYER_SIZE;
            character.vel_y = 0.0;
            character.on_ground = true;
        }
        if character.y <= 0.0 {
            character.y = 0.0;
            character.vel_y = 0.0;
        }
    }
}

impl GameController for World {
    fn on_client_connected(&mut self, client_id: usize) {
        self.players.insert(client_id, Player::new(client_id));
    }

    fn on_client_enter(&mut self, client_id: usize) {
        let player = self
            .players
            .entry(client_id)
            .or_insert_with(|| Player::new(client_id));
        player.respawn();
        if let Some(character) = &player.character {
            info!(
                "player {} spawned at ({}, {})",
                client_id, character.x, character.y
            );
        }
    }

    fn on_client_drop(&mut self, client_id: usize, reason: &str) {
        if self.players.remove(&client_id).is_some() {
            info!("removed player {} ({})", client_id, reason);
        }
    }

    fn on_client_direct_input(&mut self, client_id: usize, input: &[i32]) {
        // jump is edge triggered and must not wait for the scheduled tick
        if let Some(character) = self
            .players
            .get_mut(&client_id)
            .and_then(|player| player.character.as_mut())
        {
            if input.get(INPUT_JUMP).is_some_and(|&jump| jump != 0) {
                character.jump = true;
            }
        }
    }

    fn on_client_predicted_input(&mut self, client_id: usize, input: &[i32]) {
        if let Some(character) = self
            .players
            .get_mut(&client_id)
            .and_then(|player| player.character.as_mut())
        {
            Self::apply_input(character, input);
        }
    }

    fn on_message(&mut self, _client_id: usize, _msg_id: i32, _unpacker: &mut Unpacker<'_>) {}

    fn on_tick(&mut self, tick: i32, tick_speed: i32) {
        if self.round_start_tick == 0 {
            self.round_start_tick = tick;
        }
        let dt = 1.0 / tick_speed as f32;
        for player in self.players.values_mut() {
            let Some(character) = player.character.as_mut() else {
                continue;
            };
            Self::step(character, dt);
            player.race_ticks += 1;

            let x = character.x;
            let time = player.race_ticks as f32 / tick_speed as f32;
            while x >= (player.checkpoints.len() + 1) as f32 * CHECKPOINT_SPACING
                && ((player.checkpoints.len() + 1) as f32 * CHECKPOINT_SPACING) < FINISH_X
            {
                player.checkpoints.push(time);
            }
            if x >= FINISH_X {
                info!("player {} finished in {:.2}s", player.client_id, time);
                self.finishes.push(RaceFinish {
                    client_id: player.client_id,
                    time,
                    checkpoints: std::mem::take(&mut player.checkpoints),
                });
                player.score += 1;
                player.respawn();
            }
        }
    }

    fn on_snap(&self, observer: i32, tick: i32, builder: &mut SnapshotBuilder) {
        builder.add_item(
            OBJ_GAME_INFO,
            0,
            &[0, self.round_start_tick, tick - self.round_start_tick],
        );
        for (&client_id, player) in &self.players {
            let local = observer >= 0 && observer as usize == client_id;
            builder.add_item(
                OBJ_PLAYER_INFO,
                client_id as u16,
                &[local as i32, client_id as i32, player.score],
            );
            if let Some(character) = &player.character {
                builder.add_item(
                    OBJ_CHARACTER,
                    client_id as u16,
                    &[
                        tick,
                        character.x.round() as i32,
                        character.y.round() as i32,
                        (character.vel_x * 256.0) as i32,
                        (character.vel_y * 256.0) as i32,
                        character.direction,
                    ],
                );
            }
        }
    }

    fn score(&self, client_id: usize) -> i32 {
        self.players.get(&client_id).map_or(0, |player| player.score)
    }

    fn is_player(&self, client_id: usize) -> bool {
        self.players
            .get(&client_id)
            .is_some_and(|player| player.character.is_some())
    }

    fn game_type(&self) -> &str {
        "DDraceNetwork"
    }

    fn take_finishes(&mut self) -> Vec<RaceFinish> {
        std::mem::take(&mut self.finishes)
    }

    fn item_sizes(&self) -> Vec<(u16, usize)> {
        vec![
            (OBJ_GAME_INFO, GAME_INFO_SIZE),
            (OBJ_CHARACTER, CHARACTER_SIZE),
            (OBJ_PLAYER_INFO, PLAYER_INFO_SIZE),
        ]
    }
}
