//! # Dedicated Race Server
//!
//! Authoritative server for the race game. Clients connect over UDP, download
//! the map, and then exchange inputs for delta-compressed snapshots at a fixed
//! tick rate. Records and bans go to SQL stores through a worker pool that
//! never blocks the tick loop.
//!
//! ## Architecture
//!
//! ### Single-Threaded Tick Loop
//! [`network::Server`] owns all game and client state. One task selects
//! between incoming messages and the start of the next tick, so no state is
//! shared across tasks and every change happens in a well defined order.
//!
//! ### Transport
//! [`transport::Transport`] runs a receiver task that classifies datagrams and
//! a sender task that drains the outgoing queue. The tick loop only enqueues.
//!
//! ### Client State Machine
//! [`client_manager::ClientTable`] holds a fixed array of slots. A slot moves
//! from `PreAuth` through map download to `InGame`; messages that arrive in
//! the wrong state are ignored.
//!
//! ### Snapshots
//! Each snapshot tick the game fills one snapshot per client through
//! [`game::GameController::on_snap`]. [`snap`] diffs it against the last one
//! the client acknowledged and splits the result into packets.
//!
//! ### Database Pool
//! [`db::ConnectionPool`] runs jobs on two worker threads. Writes land on a
//! local backup store first, then on the primary store, so a record survives
//! when the remote database is down. The pool reports completion through
//! shared [`db::SqlResult`] handles polled by the tick loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use clap::Parser;
//! use server::config::Args;
//! use server::game::World;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (config, live) = Args::parse().into_config()?;
//!     let mut server = Server::new(config, live, Box::new(World::new())).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod bans;
pub mod client_manager;
pub mod config;
pub mod console;
pub mod db;
pub mod error;
pub mod game;
pub mod map;
pub mod network;
pub mod snap;
pub mod transport;

pub use error::ServerError;
pub use network::Server;
