//! # Session Server Library
//!
//! Authoritative server for short team matches. Each match runs in its own
//! room that owns the canonical combat state, validates everything clients
//! propose, and streams snapshots to the room's members.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Combat
//! Movement is client-reported and clamped to the world bounds. Health,
//! super-charge, deaths and the match outcome are decided here only. Damage
//! and heal amounts are derived from server-side character stats and never
//! read from the client.
//!
//! ### Match Lifecycle
//! A room waits for its roster, runs a readiness handshake bounded by a
//! timeout, runs the fixed-step loop while the match is active, and keeps
//! the final state addressable for a grace period after game over.
//!
//! ### Rewards
//! Per-player hits, damage and kills are tallied during the match and turned
//! into currency deltas at game over. Persistence is best-effort and never
//! delays the game-over broadcast.
//!
//! ## Architecture Design
//!
//! ### One Task Per Room
//! `SessionRoom` is a synchronous state machine driven with explicit
//! monotonic timestamps. The hub spawns one tokio task per room that feeds it
//! commands and wakes it when the next tick, timer or teardown is due. Rooms
//! share no mutable state.
//!
//! ### UDP-Based Communication
//! Every datagram is one bincode-encoded `shared::Packet`. Malformed
//! datagrams are dropped. Connections identify themselves once and are timed
//! out after five silent seconds.
//!
//! ## Module Organization
//!
//! - `room`: the per-match state machine and fixed-step loop
//! - `combat`: hit and heal validation
//! - `regen`: out-of-combat healing
//! - `rewards`: match-end currency
//! - `characters` and `player`: stat table and per-participant state
//! - `tick`: fixed-step accumulator
//! - `hub`: room registry and per-room driver tasks
//! - `store` and `config`: persistence boundary and runtime overrides
//! - `client_manager` and `network`: transport identity and routing
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::{RoomConfig, RuntimeConfig};
//! use server::network::Server;
//! use server::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::from_json_file("matches.json")?);
//!     let mut server = Server::new(
//!         "127.0.0.1:8080",
//!         64,
//!         store,
//!         RuntimeConfig::load("overrides.json"),
//!         RoomConfig::default(),
//!     )
//!     .await?;
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod characters;
pub mod client_manager;
pub mod combat;
pub mod config;
pub mod hub;
pub mod network;
pub mod player;
pub mod regen;
pub mod rewards;
pub mod room;
pub mod store;
pub mod tick;
