//! Server configuration
//!
//! Every knob has a default, so a config file only needs to name what it
//! changes. The binary loads an optional JSON file and then applies command
//! line overrides on top.

use crate::error::ServerError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Simulation ticks per second.
    pub tick_rate: u32,
    /// Maximum number of sessions past the handshake.
    pub max_clients: usize,
    /// Oldest moment a shot may be resolved against.
    pub lag_compensation_horizon_ms: u64,
    /// Added to a shooter's round trip time when rewinding.
    pub lag_compensation_buffer_ms: u64,
    pub view_width: f32,
    pub view_height: f32,
    /// Upper bound for `ResizeViewCommand`.
    pub max_view_width: f32,
    pub max_view_height: f32,
    /// Engine ping cadence, in ticks.
    pub ping_interval_ticks: u32,
    /// Skip diffing entities that never move.
    pub static_update_exemption: bool,
    /// Speed above which a body's velocity is clamped after the physics step.
    pub max_speed: f32,
    pub obstacles: usize,
    pub props: usize,
    /// Seed for spawn and scenery placement. Random when absent.
    pub seed: Option<u64>,
    /// When set, handshakes must carry this token.
    pub handshake_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            tick_rate: 30,
            max_clients: 32,
            lag_compensation_horizon_ms: 1000,
            lag_compensation_buffer_ms: 100,
            view_width: shared::VIEW_WIDTH,
            view_height: shared::VIEW_HEIGHT,
            max_view_width: 2.0 * shared::VIEW_WIDTH,
            max_view_height: 2.0 * shared::VIEW_HEIGHT,
            ping_interval_ticks: 30,
            static_update_exemption: true,
            max_speed: 4.0 * shared::PLAYER_SPEED,
            obstacles: 12,
            props: 8,
            seed: None,
            handshake_token: None,
        }
    }
}

impl ServerConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let text = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.tick_rate == 0 || self.tick_rate > 1000 {
            return Err(ServerError::Config(format!(
                "tick_rate must be between 1 and 1000, got {}",
                self.tick_rate
            )));
        }
        if self.ping_interval_ticks == 0 {
            return Err(ServerError::Config(
                "ping_interval_ticks must be at least 1".to_string(),
            ));
        }
        if !(self.view_width > 0.0 && self.view_height > 0.0) {
            return Err(ServerError::Config("view size must be positive".to_string()));
        }
        if self.max_view_width < self.view_width || self.max_view_height < self.view_height {
            return Err(ServerError::Config(
                "max view size is smaller than the default view".to_string(),
            ));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate as f64)
    }
}
