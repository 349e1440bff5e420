//! Typed protocol vocabulary on top of the schema codec
//!
//! Each enum here is a closed set of variants keyed by the same numeric tag that
//! goes on the wire. [`standard_registry`] builds the schema table both ends
//! must agree on.

use crate::codec::{CodecError, Primitive, Record, Schema, SchemaRegistry, Value};

/// Bumped whenever a schema below changes shape.
pub const PROTOCOL_VERSION: u32 = 1;

// Engine messages (reserved tags)
pub const CONNECTION_ATTEMPT: u8 = 0;
pub const CONNECTION_ACCEPTED: u8 = 1;
pub const CONNECTION_DENIED: u8 = 2;
pub const CLIENT_TICK: u8 = 3;
pub const PING: u8 = 4;
pub const PONG: u8 = 5;
pub const TICK_CONFIRM: u8 = 6;

// Commands
pub const USERNAME_COMMAND: u8 = 16;
pub const MOVE_COMMAND: u8 = 17;
pub const SHOT_IMPACT_COMMAND: u8 = 18;
pub const RESIZE_VIEW_COMMAND: u8 = 19;

// Messages
pub const IDENTITY_MESSAGE: u8 = 32;
pub const SHOT_IMPACT_MESSAGE: u8 = 33;

// Entities
pub const PLAYER_ENTITY: u8 = 64;
pub const OBSTACLE_ENTITY: u8 = 65;
pub const PROP_ENTITY: u8 = 66;

// Request/response sub-protocol
pub const REQUEST: u8 = 100;
pub const RESPONSE: u8 = 101;

/// Field positions shared by every entity schema.
pub mod entity_fields {
    pub const NID: u8 = 0;
    pub const X: u8 = 1;
    pub const Y: u8 = 2;
    pub const ROTATION: u8 = 3;

    pub const PLAYER_HEALTH: u8 = 4;
    pub const PLAYER_IS_ALIVE: u8 = 5;
    pub const PLAYER_USERNAME: u8 = 6;
}

pub fn is_entity_tag(tag: u8) -> bool {
    matches!(tag, PLAYER_ENTITY | OBSTACLE_ENTITY | PROP_ENTITY)
}

/// Builds the schema table shared by client and server.
pub fn standard_registry() -> Result<SchemaRegistry, CodecError> {
    use Primitive::*;

    let schemas = [
        Schema::new(CONNECTION_ATTEMPT, "ConnectionAttempt", &[("handshake", Str)]),
        Schema::new(CONNECTION_ACCEPTED, "ConnectionAccepted", &[]),
        Schema::new(CONNECTION_DENIED, "ConnectionDenied", &[("reason", Str)]),
        Schema::new(CLIENT_TICK, "ClientTick", &[("tick", U16)]),
        Schema::new(PING, "Ping", &[("nonce", U8)]),
        Schema::new(PONG, "Pong", &[("nonce", U8)]),
        Schema::new(
            TICK_CONFIRM,
            "TickConfirm",
            &[("serverTick", U32), ("clientTick", U16)],
        ),
        Schema::new(USERNAME_COMMAND, "UsernameCommand", &[("username", Str)]),
        Schema::new(
            MOVE_COMMAND,
            "MoveCommand",
            &[
                ("up", Bool),
                ("down", Bool),
                ("left", Bool),
                ("right", Bool),
                ("rotation", F32),
                ("delta", F32),
            ],
        ),
        Schema::new(
            SHOT_IMPACT_COMMAND,
            "ShotImpactCommand",
            &[
                ("fromX", F32),
                ("fromY", F32),
                ("hitX", F32),
                ("hitY", F32),
                ("impactForce", F32),
                ("targetNid", U16),
            ],
        ),
        Schema::new(
            RESIZE_VIEW_COMMAND,
            "ResizeViewCommand",
            &[("width", F32), ("height", F32)],
        ),
        Schema::new(IDENTITY_MESSAGE, "IdentityMessage", &[("myId", U16)]),
        Schema::new(
            SHOT_IMPACT_MESSAGE,
            "ShotImpactMessage",
            &[
                ("shooterNid", U16),
                ("targetNid", U16),
                ("fromX", F32),
                ("fromY", F32),
                ("hitX", F32),
                ("hitY", F32),
            ],
        ),
        Schema::new(
            PLAYER_ENTITY,
            "PlayerCharacter",
            &[
                ("nid", U16),
                ("x", F32),
                ("y", F32),
                ("rotation", F32),
                ("health", U8),
                ("isAlive", Bool),
                ("username", Str),
            ],
        ),
        Schema::new(
            OBSTACLE_ENTITY,
            "Obstacle",
            &[
                ("nid", U16),
                ("x", F32),
                ("y", F32),
                ("rotation", F32),
                ("width", F32),
                ("height", F32),
            ],
        ),
        Schema::new(
            PROP_ENTITY,
            "Prop",
            &[
                ("nid", U16),
                ("x", F32),
                ("y", F32),
                ("rotation", F32),
                ("radius", F32),
                ("color", U32),
            ],
        ),
        Schema::new(
            REQUEST,
            "Request",
            &[("requestId", U32), ("endpoint", U32), ("body", Str)],
        ),
        Schema::new(RESPONSE, "Response", &[("requestId", U32), ("response", Str)]),
    ];

    let mut registry = SchemaRegistry::new();
    for schema in schemas {
        registry.register(schema)?;
    }
    Ok(registry)
}

fn field<T>(
    record: &Record,
    schema: &'static str,
    index: u8,
    get: impl Fn(&Value) -> Option<T>,
) -> Result<T, CodecError> {
    record
        .get(index as usize)
        .and_then(get)
        .ok_or(CodecError::NoSuchField { schema, index })
}

fn string(v: &Value) -> Option<String> {
    v.as_str().map(str::to_string)
}

/// Connection-level messages handled by the transport layer itself
#[derive(Debug, Clone, PartialEq)]
pub enum EngineMessage {
    ConnectionAttempt { handshake: String },
    ConnectionAccepted,
    ConnectionDenied { reason: String },
    ClientTick { tick: u16 },
    Ping { nonce: u8 },
    Pong { nonce: u8 },
    TickConfirm { server_tick: u32, client_tick: u16 },
}

impl EngineMessage {
    pub fn to_record(&self) -> Record {
        match self {
            EngineMessage::ConnectionAttempt { handshake } => {
                Record::new(CONNECTION_ATTEMPT, vec![Value::Str(handshake.clone())])
            }
            EngineMessage::ConnectionAccepted => Record::new(CONNECTION_ACCEPTED, vec![]),
            EngineMessage::ConnectionDenied { reason } => {
                Record::new(CONNECTION_DENIED, vec![Value::Str(reason.clone())])
            }
            EngineMessage::ClientTick { tick } => Record::new(CLIENT_TICK, vec![Value::U16(*tick)]),
            EngineMessage::Ping { nonce } => Record::new(PING, vec![Value::U8(*nonce)]),
            EngineMessage::Pong { nonce } => Record::new(PONG, vec![Value::U8(*nonce)]),
            EngineMessage::TickConfirm {
                server_tick,
                client_tick,
            } => Record::new(
                TICK_CONFIRM,
                vec![Value::U32(*server_tick), Value::U16(*client_tick)],
            ),
        }
    }

    pub fn from_record(record: &Record) -> Result<Self, CodecError> {
        let message = match record.tag {
            CONNECTION_ATTEMPT => EngineMessage::ConnectionAttempt {
                handshake: field(record, "ConnectionAttempt", 0, string)?,
            },
            CONNECTION_ACCEPTED => EngineMessage::ConnectionAccepted,
            CONNECTION_DENIED => EngineMessage::ConnectionDenied {
                reason: field(record, "ConnectionDenied", 0, string)?,
            },
            CLIENT_TICK => EngineMessage::ClientTick {
                tick: field(record, "ClientTick", 0, Value::as_u16)?,
            },
            PING => EngineMessage::Ping {
                nonce: field(record, "Ping", 0, Value::as_u8)?,
            },
            PONG => EngineMessage::Pong {
                nonce: field(record, "Pong", 0, Value::as_u8)?,
            },
            TICK_CONFIRM => EngineMessage::TickConfirm {
                server_tick: field(record, "TickConfirm", 0, Value::as_u32)?,
                client_tick: field(record, "TickConfirm", 1, Value::as_u16)?,
            },
            tag => {
                return Err(CodecError::UnexpectedTag {
                    section: "engine messages",
                    tag,
                })
            }
        };
        Ok(message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsernameCommand {
    pub username: String,
}

/// Directional input for one client tick
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MoveCommand {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    pub rotation: f32,
    /// Seconds of simulated time this input covers on the client.
    pub delta: f32,
}

/// A hit-scan shot as the shooter perceived it
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ShotImpactCommand {
    pub from_x: f32,
    pub from_y: f32,
    pub hit_x: f32,
    pub hit_y: f32,
    pub impact_force: f32,
    /// Entity the shooter claims to have hit, 0 when resolved by raycast.
    pub target_nid: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResizeViewCommand {
    pub width: f32,
    pub height: f32,
}

/// Client-authored intents, applied by the server tick loop
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Username(UsernameCommand),
    Move(MoveCommand),
    ShotImpact(ShotImpactCommand),
    ResizeView(ResizeViewCommand),
}

impl Command {
    pub fn tag(&self) -> u8 {
        match self {
            Command::Username(_) => USERNAME_COMMAND,
            Command::Move(_) => MOVE_COMMAND,
            Command::ShotImpact(_) => SHOT_IMPACT_COMMAND,
            Command::ResizeView(_) => RESIZE_VIEW_COMMAND,
        }
    }

    pub fn to_record(&self) -> Record {
        let values = match self {
            Command::Username(cmd) => vec![Value::Str(cmd.username.clone())],
            Command::Move(cmd) => vec![
                Value::Bool(cmd.up),
                Value::Bool(cmd.down),
                Value::Bool(cmd.left),
                Value::Bool(cmd.right),
                Value::F32(cmd.rotation),
                Value::F32(cmd.delta),
            ],
            Command::ShotImpact(cmd) => vec![
                Value::F32(cmd.from_x),
                Value::F32(cmd.from_y),
                Value::F32(cmd.hit_x),
                Value::F32(cmd.hit_y),
                Value::F32(cmd.impact_force),
                Value::U16(cmd.target_nid),
            ],
            Command::ResizeView(cmd) => vec![Value::F32(cmd.width), Value::F32(cmd.height)],
        };
        Record::new(self.tag(), values)
    }

    pub fn from_record(record: &Record) -> Result<Self, CodecError> {
        let command = match record.tag {
            USERNAME_COMMAND => Command::Username(UsernameCommand {
                username: field(record, "UsernameCommand", 0, string)?,
            }),
            MOVE_COMMAND => {
                let s = "MoveCommand";
                Command::Move(MoveCommand {
                    up: field(record, s, 0, Value::as_bool)?,
                    down: field(record, s, 1, Value::as_bool)?,
                    left: field(record, s, 2, Value::as_bool)?,
                    right: field(record, s, 3, Value::as_bool)?,
                    rotation: field(record, s, 4, Value::as_f32)?,
                    delta: field(record, s, 5, Value::as_f32)?,
                })
            }
            SHOT_IMPACT_COMMAND => {
                let s = "ShotImpactCommand";
                Command::ShotImpact(ShotImpactCommand {
                    from_x: field(record, s, 0, Value::as_f32)?,
                    from_y: field(record, s, 1, Value::as_f32)?,
                    hit_x: field(record, s, 2, Value::as_f32)?,
                    hit_y: field(record, s, 3, Value::as_f32)?,
                    impact_force: field(record, s, 4, Value::as_f32)?,
                    target_nid: field(record, s, 5, Value::as_u16)?,
                })
            }
            RESIZE_VIEW_COMMAND => Command::ResizeView(ResizeViewCommand {
                width: field(record, "ResizeViewCommand", 0, Value::as_f32)?,
                height: field(record, "ResizeViewCommand", 1, Value::as_f32)?,
            }),
            tag => {
                return Err(CodecError::UnexpectedTag {
                    section: "commands",
                    tag,
                })
            }
        };
        Ok(command)
    }
}

/// Server-authored notifications that are not entity state
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Identity {
        my_id: u16,
    },
    ShotImpact {
        shooter_nid: u16,
        target_nid: u16,
        from_x: f32,
        from_y: f32,
        hit_x: f32,
        hit_y: f32,
    },
}

impl Message {
    pub fn to_record(&self) -> Record {
        match self {
            Message::Identity { my_id } => Record::new(IDENTITY_MESSAGE, vec![Value::U16(*my_id)]),
            Message::ShotImpact {
                shooter_nid,
                target_nid,
                from_x,
                from_y,
                hit_x,
                hit_y,
            } => Record::new(
                SHOT_IMPACT_MESSAGE,
                vec![
                    Value::U16(*shooter_nid),
                    Value::U16(*target_nid),
                    Value::F32(*from_x),
                    Value::F32(*from_y),
                    Value::F32(*hit_x),
                    Value::F32(*hit_y),
                ],
            ),
        }
    }

    pub fn from_record(record: &Record) -> Result<Self, CodecError> {
        let message = match record.tag {
            IDENTITY_MESSAGE => Message::Identity {
                my_id: field(record, "IdentityMessage", 0, Value::as_u16)?,
            },
            SHOT_IMPACT_MESSAGE => {
                let s = "ShotImpactMessage";
                Message::ShotImpact {
                    shooter_nid: field(record, s, 0, Value::as_u16)?,
                    target_nid: field(record, s, 1, Value::as_u16)?,
                    from_x: field(record, s, 2, Value::as_f32)?,
                    from_y: field(record, s, 3, Value::as_f32)?,
                    hit_x: field(record, s, 4, Value::as_f32)?,
                    hit_y: field(record, s, 5, Value::as_f32)?,
                }
            }
            tag => {
                return Err(CodecError::UnexpectedTag {
                    section: "messages",
                    tag,
                })
            }
        };
        Ok(message)
    }
}

/// One changed field of a replicated entity
#[derive(Debug, Clone, PartialEq)]
pub struct EntityUpdate {
    pub tag: u8,
    pub nid: u16,
    pub field: u8,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub request_id: u32,
    pub endpoint: u32,
    pub body: String,
}

impl Request {
    pub fn to_record(&self) -> Record {
        Record::new(
            REQUEST,
            vec![
                Value::U32(self.request_id),
                Value::U32(self.endpoint),
                Value::Str(self.body.clone()),
            ],
        )
    }

    pub fn from_record(record: &Record) -> Result<Self, CodecError> {
        if record.tag != REQUEST {
            return Err(CodecError::UnexpectedTag {
                section: "requests",
                tag: record.tag,
            });
        }
        Ok(Request {
            request_id: field(record, "Request", 0, Value::as_u32)?,
            endpoint: field(record, "Request", 1, Value::as_u32)?,
            body: field(record, "Request", 2, string)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub request_id: u32,
    pub body: String,
}

impl Response {
    pub fn to_record(&self) -> Record {
        Record::new(
            RESPONSE,
            vec![Value::U32(self.request_id), Value::Str(self.body.clone())],
        )
    }

    pub fn from_record(record: &Record) -> Result<Self, CodecError> {
        if record.tag != RESPONSE {
            return Err(CodecError::UnexpectedTag {
                section: "responses",
                tag: record.tag,
            });
        }
        Ok(Response {
            request_id: field(record, "Response", 0, Value::as_u32)?,
            body: field(record, "Response", 1, string)?,
        })
    }
}
