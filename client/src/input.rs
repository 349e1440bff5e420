//! Per-tick command sequencing with change detection

use shared::{
    Command, MoveCommand, Request, ResizeViewCommand, ShotImpactCommand, UsernameCommand,
};

/// Re-send an unchanged move command this often, in ticks.
const KEEPALIVE_TICKS: u16 = 15;

/// What the player wants to do this tick
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Intent {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    pub rotation: f32,
}

/// Commands produced for one client tick
#[derive(Debug, Clone, PartialEq)]
pub struct TickInput {
    pub tick: u16,
    /// The movement in effect this tick, whether or not it is sent.
    pub movement: MoveCommand,
    pub commands: Vec<Command>,
    pub requests: Vec<Request>,
}

/// Turns intents into numbered ticks of commands
pub struct InputManager {
    next_tick: u16,
    current: Option<MoveCommand>,
    ticks_since_sent: u16,
    queued: Vec<Command>,
    requests: Vec<Request>,
    next_request_id: u32,
}

impl InputManager {
    pub fn new() -> Self {
        Self {
            next_tick: 1,
            current: None,
            ticks_since_sent: 0,
            queued: Vec::new(),
            requests: Vec::new(),
            next_request_id: 1,
        }
    }

    /// Queues a one-off command for the next tick.
    pub fn queue(&mut self, command: Command) {
        self.queued.push(command);
    }

    pub fn join(&mut self, username: &str) {
        self.queue(Command::Username(UsernameCommand {
            username: username.to_string(),
        }));
    }

    pub fn shoot(&mut self, from: (f32, f32), hit: (f32, f32), impact_force: f32) {
        self.queue(Command::ShotImpact(ShotImpactCommand {
            from_x: from.0,
            from_y: from.1,
            hit_x: hit.0,
            hit_y: hit.1,
            impact_force,
            target_nid: 0,
        }));
    }

    pub fn resize_view(&mut self, width: f32, height: f32) {
        self.queue(Command::ResizeView(ResizeViewCommand { width, height }));
    }

    /// Queues a request for the next tick and returns its id. Ids start at 1
    /// and wrap, skipping 0.
    pub fn request(&mut self, endpoint: u32, body: impl Into<String>) -> u32 {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        self.requests.push(Request {
            request_id,
            endpoint,
            body: body.into(),
        });
        request_id
    }

    /// Numbers the next tick and emits its commands. The move command goes
    /// out when it differs from the last one sent or as a periodic keep-alive.
    pub fn next(&mut self, intent: &Intent, dt: f32) -> TickInput {
        let tick = self.next_tick;
        self.next_tick = self.next_tick.wrapping_add(1);

        let movement = MoveCommand {
            up: intent.up,
            down: intent.down,
            left: intent.left,
            right: intent.right,
            rotation: intent.rotation,
            delta: dt,
        };
        let changed = self.current.map_or(true, |last| {
            (last.up, last.down, last.left, last.right, last.rotation)
                != (movement.up, movement.down, movement.left, movement.right, movement.rotation)
        });

        let mut commands = std::mem::take(&mut self.queued);
        self.ticks_since_sent += 1;
        if changed || self.ticks_since_sent >= KEEPALIVE_TICKS {
            commands.push(Command::Move(movement));
            self.current = Some(movement);
            self.ticks_since_sent = 0;
        }

        TickInput {
            tick,
            movement,
            commands,
            requests: std::mem::take(&mut self.requests),
        }
    }

    pub fn next_tick(&self) -> u16 {
        self.next_tick
    }
}

impl Default for InputManager {
    fn default() -> Self {
        Self::new()
    }
}
