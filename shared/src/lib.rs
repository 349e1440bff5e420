//! Protocol and simulation pieces shared by client and server
//!
//! Both ends link this crate so that they agree on the wire format (the
//! schema registry, frame layout and message vocabulary) and on the movement
//! rule used by the server's `apply` and the client's prediction.

use serde::{Deserialize, Serialize};

pub mod codec;
pub mod frame;
pub mod protocol;
pub mod wrapping;

pub use codec::{CodecError, Primitive, Record, Schema, SchemaRegistry, Value};
pub use frame::{decode_frame, encode_frame, Frame, Section, SectionId};
pub use protocol::{
    standard_registry, Command, EngineMessage, EntityUpdate, Message, MoveCommand, Request,
    ResizeViewCommand, Response, ShotImpactCommand, UsernameCommand,
};

/// The world is a `WORLD_WIDTH` x `WORLD_HEIGHT` rectangle centred on the origin.
pub const WORLD_WIDTH: f32 = 2000.0;
pub const WORLD_HEIGHT: f32 = 2000.0;
pub const PLAYER_SPEED: f32 = 200.0;
pub const PLAYER_RADIUS: f32 = 16.0;
pub const MAX_HEALTH: u8 = 100;
pub const VIEW_WIDTH: f32 = 1200.0;
pub const VIEW_HEIGHT: f32 = 900.0;

/// Opaque handshake payload carried as JSON inside `ConnectionAttempt`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol_version: u32,
    #[serde(default)]
    pub token: String,
}

/// Axis-aligned box in world space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl Aabb {
    pub fn new(min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn centered(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        Self::new(
            cx - width / 2.0,
            cy - height / 2.0,
            cx + width / 2.0,
            cy + height / 2.0,
        )
    }

    pub fn width(&self) -> f32 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f32 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    /// Inclusive on every edge.
    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        !(self.max_x < other.min_x
            || other.max_x < self.min_x
            || self.max_y < other.min_y
            || other.max_y < self.min_y)
    }
}

/// Velocity a move command asks for: assignment, never accumulation.
///
/// Diagonals are normalised so that every direction moves at
/// [`PLAYER_SPEED`]. Screen coordinates: `up` is negative y.
pub fn move_velocity(cmd: &MoveCommand) -> (f32, f32) {
    let mut dx = 0.0f32;
    let mut dy = 0.0f32;
    if cmd.left {
        dx -= 1.0;
    }
    if cmd.right {
        dx += 1.0;
    }
    if cmd.up {
        dy -= 1.0;
    }
    if cmd.down {
        dy += 1.0;
    }

    let len = (dx * dx + dy * dy).sqrt();
    if len > 0.0 {
        (dx / len * PLAYER_SPEED, dy / len * PLAYER_SPEED)
    } else {
        (0.0, 0.0)
    }
}

/// Where a client predicts its entity ends up after applying `cmd`.
pub fn predict_position(x: f32, y: f32, cmd: &MoveCommand) -> (f32, f32) {
    let (vx, vy) = move_velocity(cmd);
    let delta = if cmd.delta.is_finite() {
        cmd.delta.max(0.0)
    } else {
        0.0
    };
    let bounds = world_bounds();
    (
        (x + vx * delta).clamp(bounds.min_x + PLAYER_RADIUS, bounds.max_x - PLAYER_RADIUS),
        (y + vy * delta).clamp(bounds.min_y + PLAYER_RADIUS, bounds.max_y - PLAYER_RADIUS),
    )
}

pub fn world_bounds() -> Aabb {
    Aabb::centered(0.0, 0.0, WORLD_WIDTH, WORLD_HEIGHT)
}
