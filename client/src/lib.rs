//! # Game Client Library
//!
//! Headless client for the authoritative game server. It keeps a mirror of
//! the slice of the world the server replicates to it, numbers its own ticks
//! and predicts its own entity so input takes effect without waiting a round
//! trip.
//!
//! ## Architecture Overview
//!
//! ### Replicated Mirror
//! The server only ever sends deltas: entities entering the view, field-level
//! updates and entities leaving it. [`game::Mirror`] applies them in that
//! order (deletes, creates, updates) so a network id recycled within one
//! server tick resolves to the new entity.
//!
//! ### Client-Side Prediction
//! Movement is applied locally as soon as it is sampled, using the same pure
//! movement function the server runs. Each tick's command and resulting
//! position are kept as a prediction record.
//!
//! ### Reconciliation
//! When the server confirms one of our ticks, the prediction for that tick is
//! compared with the authoritative position. A mismatch overwrites the local
//! value; either way every record at or before the confirmed tick is dropped.
//! Unconfirmed commands are never resent.
//!
//! ## Module Organization
//!
//! - [`game`]: the mirror and the glue between frames, input and prediction
//! - [`input`]: per-tick command sequencing with change detection
//! - [`prediction`]: prediction records and reconciliation
//! - [`network`]: WebSocket session, handshake and reconnect with backoff
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::new(ClientConfig {
//!         username: "AAA".to_string(),
//!         ..Default::default()
//!     })?;
//!     client.run().await
//! }
//! ```

pub mod game;
pub mod input;
pub mod network;
pub mod prediction;
