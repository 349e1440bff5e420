//! # Game Server Library
//!
//! Authoritative server for a real-time top-down shooter. Clients send
//! per-tick commands over a WebSocket; the server advances the world at a
//! fixed rate, decides what each client may see and sends each of them the
//! changes to its own slice of the world.
//!
//! ## Architecture
//!
//! ### Single Consumer Tick Loop
//! All world state is owned by [`network::Server`], which consumes socket
//! events and ticks from one task. Socket readers, socket writers and the
//! handshake hook run concurrently but only talk to the loop through
//! channels, so no locks guard the simulation.
//!
//! ### Tick Phases
//! Each tick drains the commands buffered since the last one, applies them,
//! steps physics, removes dead entities, copies body state back, records a
//! lag compensation snapshot and finally flushes one frame per session
//! holding its engine messages, messages, entity deltas and responses.
//!
//! ## Module Organization
//!
//! - [`session`]: connection state machine and the session table
//! - [`handshake`]: asynchronous accept/deny hook
//! - [`channel`]: interest management and per-session deltas
//! - [`historian`]: pose history for lag compensated hit-scan
//! - [`physics`]: the physics engine seam and a simple engine behind it
//! - [`game`]: entities, command application and the tick phases
//! - [`endpoints`]: request/response handlers
//! - [`network`]: WebSocket transport and the loop tying it together
//! - [`config`], [`error`]: configuration and error types
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         port: 9000,
//!         ..Default::default()
//!     };
//!     Server::new(config)?.run().await
//! }
//! ```

pub mod channel;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod game;
pub mod handshake;
pub mod historian;
pub mod network;
pub mod physics;
pub mod session;
