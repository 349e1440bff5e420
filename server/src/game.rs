//! Authoritative world state and the per-tick simulation
//!
//! [`Game`] owns every entity. The interest channel and the historian only
//! ever see entities through their nid. [`Game::step`] runs the simulation
//! half of a tick, in this order:
//!
//! 1. drain each open session's buffered commands (arrival order within a
//!    session)
//! 2. apply them: spawns, movement, lag compensated shots, view resizes
//! 3. step the physics engine
//! 4. remove entities whose health reached zero
//! 5. copy body state back into entities, repairing anomalies
//! 6. record a historian snapshot
//! 7. move session views and close the channel's tick
//!
//! The network layer then asks the channel for each session's delta.

use crate::channel::Channel;
use crate::config::ServerConfig;
use crate::historian::{Historian, Pose};
use crate::physics::{Body, BodyId, PhysicsWorld, Shape, SimplePhysics, Vector2};
use crate::session::{ConnectionId, SessionManager};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::protocol::{OBSTACLE_ENTITY, PLAYER_ENTITY, PROP_ENTITY};
use shared::{
    move_velocity, world_bounds, Aabb, Command, Message, MoveCommand, Record, ShotImpactCommand,
    Value, MAX_HEALTH, PLAYER_RADIUS,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Deref;
use thiserror::Error;

pub const MAX_USERNAME_LEN: usize = 24;
const PLAYER_MASS: f32 = 1.0;
const PROP_MASS: f32 = 4.0;

#[derive(Debug, Clone, PartialEq)]
pub enum EntityKind {
    Player {
        owner: ConnectionId,
        username: String,
        health: u8,
        is_alive: bool,
    },
    Obstacle {
        width: f32,
        height: f32,
    },
    Prop {
        radius: f32,
        color: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub nid: u16,
    pub body: BodyId,
    pub x: f32,
    pub y: f32,
    pub rotation: f32,
    pub vx: f32,
    pub vy: f32,
    pub kind: EntityKind,
}

impl Entity {
    pub fn tag(&self) -> u8 {
        match self.kind {
            EntityKind::Player { .. } => PLAYER_ENTITY,
            EntityKind::Obstacle { .. } => OBSTACLE_ENTITY,
            EntityKind::Prop { .. } => PROP_ENTITY,
        }
    }

    pub fn is_static(&self) -> bool {
        matches!(self.kind, EntityKind::Obstacle { .. })
    }

    pub fn health(&self) -> Option<u8> {
        match self.kind {
            EntityKind::Player { health, .. } => Some(health),
            _ => None,
        }
    }

    pub fn is_alive(&self) -> bool {
        match self.kind {
            EntityKind::Player { is_alive, .. } => is_alive,
            _ => true,
        }
    }

    fn shape(&self) -> Shape {
        match self.kind {
            EntityKind::Player { .. } => Shape::Circle {
                radius: PLAYER_RADIUS,
            },
            EntityKind::Obstacle { width, height } => Shape::Rect { width, height },
            EntityKind::Prop { radius, .. } => Shape::Circle { radius },
        }
    }

    /// Replicated state, laid out as the entity's schema.
    pub fn to_record(&self) -> Record {
        let mut values = vec![
            Value::U16(self.nid),
            Value::F32(self.x),
            Value::F32(self.y),
            Value::F32(self.rotation),
        ];
        match &self.kind {
            EntityKind::Player {
                username,
                health,
                is_alive,
                ..
            } => {
                values.push(Value::U8(*health));
                values.push(Value::Bool(*is_alive));
                values.push(Value::Str(username.clone()));
            }
            EntityKind::Obstacle { width, height } => {
                values.push(Value::F32(*width));
                values.push(Value::F32(*height));
            }
            EntityKind::Prop { radius, color } => {
                values.push(Value::F32(*radius));
                values.push(Value::U32(*color));
            }
        }
        Record::new(self.tag(), values)
    }
}

/// What a move command does to an entity.
///
/// Velocity is assigned, never accumulated, so the result depends only on
/// the command's fields.
pub fn apply(entity: &Entity, command: &MoveCommand) -> Entity {
    let (vx, vy) = move_velocity(command);
    let mut next = entity.clone();
    next.vx = vx;
    next.vy = vy;
    if command.rotation.is_finite() {
        next.rotation = command.rotation;
    }
    next
}

/// Allocator for `u16` entity ids. Zero is never handed out; released ids
/// are recycled in the order they were released.
#[derive(Debug)]
pub struct NidPool {
    next: u32,
    limit: u16,
    free: VecDeque<u16>,
}

impl NidPool {
    pub fn new() -> Self {
        Self::with_limit(u16::MAX)
    }

    pub fn with_limit(limit: u16) -> Self {
        Self {
            next: 1,
            limit,
            free: VecDeque::new(),
        }
    }

    pub fn allocate(&mut self) -> Option<u16> {
        if let Some(nid) = self.free.pop_front() {
            return Some(nid);
        }
        if self.next > self.limit as u32 {
            return None;
        }
        let nid = self.next as u16;
        self.next += 1;
        Some(nid)
    }

    /// Returns `nid` to the pool. Ids that were never handed out, or are
    /// already free, are ignored.
    pub fn release(&mut self, nid: u16) {
        if nid == 0 || nid as u32 >= self.next || self.free.contains(&nid) {
            return;
        }
        self.free.push_back(nid);
    }
}

impl Default for NidPool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpawnError {
    #[error("username {0:?} is already taken")]
    DuplicateUsername(String),
    #[error("username must be 1 to {MAX_USERNAME_LEN} printable characters")]
    InvalidUsername,
    #[error("session already controls entity {0}")]
    AlreadySpawned(u16),
    #[error("no entity ids left")]
    NidsExhausted,
}

/// A shot that connected
#[derive(Debug, Clone, PartialEq)]
pub struct ShotHit {
    pub shooter: u16,
    pub target: u16,
    /// Target's health after the hit, for players.
    pub health: Option<u8>,
    pub is_alive: bool,
    /// Resolved against rewound positions rather than a claimed target.
    pub rewound: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub tick: u32,
    pub spawned: Vec<u16>,
    pub hits: Vec<ShotHit>,
    pub removed: Vec<u16>,
    pub repaired: Vec<u16>,
    /// Commands that referenced no usable entity.
    pub dropped_commands: usize,
}

/// Physics world with some bodies moved to historical poses.
///
/// Only shared access to the engine is possible while it exists; dropping it
/// (including during unwinding) puts every moved body back where it was.
pub struct RewindGuard<'a, P: PhysicsWorld> {
    physics: &'a mut P,
    saved: Vec<(BodyId, Vector2, f32)>,
}

impl<'a, P: PhysicsWorld> RewindGuard<'a, P> {
    pub fn new(physics: &'a mut P, poses: &[(BodyId, Pose)]) -> Self {
        let mut saved = Vec::with_capacity(poses.len());
        for (id, pose) in poses {
            if let Some(body) = physics.body_mut(*id) {
                saved.push((*id, body.position, body.rotation));
                body.position = Vector2::new(pose.x, pose.y);
                body.rotation = pose.rotation;
            }
        }
        Self { physics, saved }
    }
}

impl<P: PhysicsWorld> Deref for RewindGuard<'_, P> {
    type Target = P;

    fn deref(&self) -> &P {
        self.physics
    }
}

impl<P: PhysicsWorld> Drop for RewindGuard<'_, P> {
    fn drop(&mut self) {
        for (id, position, rotation) in self.saved.drain(..) {
            if let Some(body) = self.physics.body_mut(id) {
                body.position = position;
                body.rotation = rotation;
            }
        }
    }
}

pub struct Game<P: PhysicsWorld = SimplePhysics> {
    tick: u32,
    entities: BTreeMap<u16, Entity>,
    body_owners: BTreeMap<BodyId, u16>,
    usernames: HashMap<String, u16>,
    nids: NidPool,
    physics: P,
    pub channel: Channel,
    pub historian: Historian,
    rng: StdRng,
    lag_buffer_ms: u64,
    max_speed: f32,
    max_view: (f32, f32),
}

impl Game<SimplePhysics> {
    /// A world with the configured scenery scattered over it.
    pub fn new(config: &ServerConfig) -> Self {
        let bounds = world_bounds();
        let physics = SimplePhysics::new().with_bounds(
            Vector2::new(bounds.min_x, bounds.min_y),
            Vector2::new(bounds.max_x, bounds.max_y),
        );
        let mut game = Self::with_physics(config, physics);
        game.populate(config.obstacles, config.props);
        game
    }
}

impl<P: PhysicsWorld> Game<P> {
    /// An empty world on top of the given engine.
    pub fn with_physics(config: &ServerConfig, physics: P) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            tick: 0,
            entities: BTreeMap::new(),
            body_owners: BTreeMap::new(),
            usernames: HashMap::new(),
            nids: NidPool::new(),
            physics,
            channel: Channel::new(config.static_update_exemption),
            historian: Historian::new(config.lag_compensation_horizon_ms),
            rng,
            lag_buffer_ms: config.lag_compensation_buffer_ms,
            max_speed: config.max_speed,
            max_view: (config.max_view_width, config.max_view_height),
        }
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn entity(&self, nid: u16) -> Option<&Entity> {
        self.entities.get(&nid)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn player_count(&self) -> usize {
        self.entities
            .values()
            .filter(|e| matches!(e.kind, EntityKind::Player { .. }))
            .count()
    }

    fn populate(&mut self, obstacles: usize, props: usize) {
        let bounds = world_bounds();
        for _ in 0..obstacles {
            let width = self.rng.gen_range(40.0..160.0);
            let height = self.rng.gen_range(40.0..160.0);
            let (x, y) = self.random_point(&bounds, 200.0);
            self.spawn_obstacle(x, y, width, height);
        }
        for _ in 0..props {
            let radius = self.rng.gen_range(8.0..24.0);
            let color = self.rng.gen::<u32>() | 0xFF;
            let (x, y) = self.random_point(&bounds, 100.0);
            self.spawn_prop(x, y, radius, color);
        }
        info!(
            "World populated with {} obstacles and {} props",
            obstacles, props
        );
    }

    fn random_point(&mut self, bounds: &Aabb, margin: f32) -> (f32, f32) {
        (
            self.rng.gen_range(bounds.min_x + margin..bounds.max_x - margin),
            self.rng.gen_range(bounds.min_y + margin..bounds.max_y - margin),
        )
    }

    fn spawn(&mut self, x: f32, y: f32, kind: EntityKind) -> Option<u16> {
        let Some(nid) = self.nids.allocate() else {
            warn!("Entity ids exhausted, cannot spawn {:?}", kind);
            return None;
        };
        let mut entity = Entity {
            nid,
            body: BodyId(0),
            x,
            y,
            rotation: 0.0,
            vx: 0.0,
            vy: 0.0,
            kind,
        };
        let position = Vector2::new(x, y);
        let body = match entity.kind {
            EntityKind::Obstacle { .. } => Body::fixed(position, entity.shape()),
            EntityKind::Prop { .. } => Body::dynamic(position, entity.shape(), PROP_MASS),
            EntityKind::Player { .. } => Body::dynamic(position, entity.shape(), PLAYER_MASS),
        };
        entity.body = self.physics.add_body(body);
        self.body_owners.insert(entity.body, nid);
        self.channel.add_entity(entity.to_record(), entity.is_static());
        self.entities.insert(nid, entity);
        Some(nid)
    }

    pub fn spawn_obstacle(&mut self, x: f32, y: f32, width: f32, height: f32) -> Option<u16> {
        self.spawn(x, y, EntityKind::Obstacle { width, height })
    }

    pub fn spawn_prop(&mut self, x: f32, y: f32, radius: f32, color: u32) -> Option<u16> {
        self.spawn(x, y, EntityKind::Prop { radius, color })
    }

    /// Creates a player at a random free spot.
    pub fn spawn_player(&mut self, owner: ConnectionId, username: &str) -> Result<u16, SpawnError> {
        let bounds = world_bounds();
        let mut spot = self.random_point(&bounds, 100.0);
        for _ in 0..16 {
            if !self.blocked(spot.0, spot.1) {
                break;
            }
            spot = self.random_point(&bounds, 100.0);
        }
        self.spawn_player_at(owner, username, spot.0, spot.1)
    }

    pub fn spawn_player_at(
        &mut self,
        owner: ConnectionId,
        username: &str,
        x: f32,
        y: f32,
    ) -> Result<u16, SpawnError> {
        let valid = !username.trim().is_empty()
            && username.chars().count() <= MAX_USERNAME_LEN
            && !username.chars().any(char::is_control);
        if !valid {
            return Err(SpawnError::InvalidUsername);
        }
        if self.usernames.contains_key(username) {
            return Err(SpawnError::DuplicateUsername(username.to_string()));
        }
        let kind = EntityKind::Player {
            owner,
            username: username.to_string(),
            health: MAX_HEALTH,
            is_alive: true,
        };
        let nid = self.spawn(x, y, kind).ok_or(SpawnError::NidsExhausted)?;
        self.usernames.insert(username.to_string(), nid);
        info!("Player {:?} spawned as entity {} at ({:.1}, {:.1})", username, nid, x, y);
        Ok(nid)
    }

    fn blocked(&self, x: f32, y: f32) -> bool {
        self.entities.values().any(|e| match e.kind {
            EntityKind::Obstacle { width, height } => {
                Aabb::centered(e.x, e.y, width + 2.0 * PLAYER_RADIUS, height + 2.0 * PLAYER_RADIUS)
                    .contains_point(x, y)
            }
            _ => false,
        })
    }

    /// Deletes an entity everywhere and gives its nid and username back.
    pub fn remove_entity(&mut self, nid: u16) -> Option<Entity> {
        let entity = self.entities.remove(&nid)?;
        self.physics.remove_body(entity.body);
        self.body_owners.remove(&entity.body);
        self.channel.remove_entity(nid);
        if let EntityKind::Player { username, .. } = &entity.kind {
            self.usernames.remove(username);
        }
        self.nids.release(nid);
        Some(entity)
    }

    /// Moves an entity and its body without simulating, and stops it.
    pub fn place_entity(&mut self, nid: u16, x: f32, y: f32) -> bool {
        let Some(entity) = self.entities.get_mut(&nid) else {
            return false;
        };
        entity.x = x;
        entity.y = y;
        entity.vx = 0.0;
        entity.vy = 0.0;
        if let Some(body) = self.physics.body_mut(entity.body) {
            body.position = Vector2::new(x, y);
            body.velocity = Vector2::default();
        }
        self.channel.update_entity(entity.to_record());
        true
    }

    /// A newly accepted session starts seeing the world.
    pub fn join(&mut self, conn_id: ConnectionId, view: Aabb) {
        self.channel.subscribe(conn_id, view);
    }

    /// A departed session stops seeing the world and loses its entity.
    pub fn leave(&mut self, conn_id: ConnectionId, entity_nid: Option<u16>) {
        self.channel.unsubscribe(conn_id);
        if let Some(nid) = entity_nid {
            if let Some(entity) = self.remove_entity(nid) {
                info!("Removed entity {} of departed connection {}", entity.nid, conn_id);
            }
        }
    }

    /// Runs phases 1 to 7 of a tick.
    pub fn step(&mut self, sessions: &mut SessionManager, dt: f32, now_ms: u64) -> TickReport {
        self.tick = self.tick.wrapping_add(1);
        let mut report = TickReport {
            tick: self.tick,
            ..Default::default()
        };

        let batches: Vec<(ConnectionId, Vec<Command>)> = sessions
            .open_sessions_mut()
            .map(|s| (s.conn_id, s.take_commands()))
            .filter(|(_, commands)| !commands.is_empty())
            .collect();

        let mut impacts = Vec::new();
        for (conn_id, commands) in batches {
            for command in commands {
                self.apply_command(sessions, conn_id, command, &mut report, &mut impacts);
            }
        }
        for (x, y, message) in impacts {
            for session in sessions.open_sessions_mut() {
                if session.view.contains_point(x, y) {
                    session.message_queue.push(message.clone());
                }
            }
        }

        self.physics.step(dt);

        let dead: Vec<u16> = self
            .entities
            .values()
            .filter(|e| e.health() == Some(0))
            .map(|e| e.nid)
            .collect();
        for nid in dead {
            if let Some(entity) = self.remove_entity(nid) {
                info!("Entity {} died and was removed", entity.nid);
                if let Some(owner) = sessions.owner_of(nid) {
                    owner.entity_nid = None;
                }
                report.removed.push(nid);
            }
        }

        self.sync_bodies(&mut report);

        let poses = self
            .channel
            .poses()
            .map(|(nid, x, y, rotation)| (nid, Pose::new(x, y, rotation)));
        self.historian.snapshot(self.tick, now_ms, poses);

        for session in sessions.open_sessions_mut() {
            if let Some(entity) = session.entity_nid.and_then(|nid| self.entities.get(&nid)) {
                session.recentre_view(entity.x, entity.y);
            }
            self.channel.update_view(session.conn_id, session.view);
        }
        self.channel.advance();

        if !report.hits.is_empty() || !report.removed.is_empty() {
            debug!(
                "Tick {}: {} hits, {} removed",
                self.tick,
                report.hits.len(),
                report.removed.len()
            );
        }
        report
    }

    fn apply_command(
        &mut self,
        sessions: &mut SessionManager,
        conn_id: ConnectionId,
        command: Command,
        report: &mut TickReport,
        impacts: &mut Vec<(f32, f32, Message)>,
    ) {
        let Some(session) = sessions.get_mut(conn_id) else {
            return;
        };
        let controlled = session
            .entity_nid
            .filter(|nid| self.entities.get(nid).is_some_and(Entity::is_alive));

        match command {
            Command::Username(cmd) => {
                if let Some(nid) = controlled {
                    warn!(
                        "Connection {} rejected: {}",
                        conn_id,
                        SpawnError::AlreadySpawned(nid)
                    );
                    return;
                }
                match self.spawn_player(conn_id, &cmd.username) {
                    Ok(nid) => {
                        session.entity_nid = Some(nid);
                        session.message_queue.push(Message::Identity { my_id: nid });
                        report.spawned.push(nid);
                    }
                    Err(e) => warn!("Connection {} rejected: {}", conn_id, e),
                }
            }
            Command::Move(cmd) => {
                let Some(nid) = controlled else {
                    report.dropped_commands += 1;
                    return;
                };
                let Some(entity) = self.entities.get_mut(&nid) else {
                    return;
                };
                *entity = apply(entity, &cmd);
                if let Some(body) = self.physics.body_mut(entity.body) {
                    body.velocity = Vector2::new(entity.vx, entity.vy);
                    body.rotation = entity.rotation;
                }
            }
            Command::ShotImpact(cmd) => {
                let Some(shooter) = controlled else {
                    report.dropped_commands += 1;
                    return;
                };
                let rewind_ms = session.latency_ms.max(0.0) as u64 + self.lag_buffer_ms;
                if let Some((hit, message)) = self.resolve_shot(shooter, &cmd, rewind_ms) {
                    if let Some(hit) = hit {
                        report.hits.push(hit);
                    }
                    impacts.push((cmd.hit_x, cmd.hit_y, message));
                }
            }
            Command::ResizeView(cmd) => {
                let (max_width, max_height) = self.max_view;
                session.resize_view(cmd.width, cmd.height, max_width, max_height);
            }
        }
    }

    /// Decides what a shot hit and applies damage and impulse.
    ///
    /// A claimed `target_nid` naming a live entity other than the shooter is
    /// taken as is. Otherwise the ray is cast against every movable body as
    /// it was `rewind_ms` ago; a static body in front of the target blocks
    /// the shot. Returns `None` for shots with non-finite coordinates.
    fn resolve_shot(
        &mut self,
        shooter: u16,
        cmd: &ShotImpactCommand,
        rewind_ms: u64,
    ) -> Option<(Option<ShotHit>, Message)> {
        let coords = [cmd.from_x, cmd.from_y, cmd.hit_x, cmd.hit_y, cmd.impact_force];
        if !coords.iter().all(|v| v.is_finite()) {
            warn!("Shot from entity {} has non-finite coordinates", shooter);
            return None;
        }
        let from = Vector2::new(cmd.from_x, cmd.from_y);
        let to = Vector2::new(cmd.hit_x, cmd.hit_y);

        let claimed = Some(cmd.target_nid).filter(|&nid| {
            nid != 0
                && nid != shooter
                && self.entities.get(&nid).is_some_and(Entity::is_alive)
        });
        let target = match claimed {
            Some(nid) => Some((nid, false)),
            None => self.raycast_rewound(shooter, from, to, rewind_ms).map(|nid| (nid, true)),
        };

        let message = Message::ShotImpact {
            shooter_nid: shooter,
            target_nid: target.map(|(nid, _)| nid).unwrap_or(0),
            from_x: cmd.from_x,
            from_y: cmd.from_y,
            hit_x: cmd.hit_x,
            hit_y: cmd.hit_y,
        };
        let hit = target.and_then(|(nid, rewound)| {
            self.damage(nid, cmd.impact_force.max(0.0), to.sub(&from))
                .map(|(health, is_alive)| ShotHit {
                    shooter,
                    target: nid,
                    health,
                    is_alive,
                    rewound,
                })
        });
        Some((hit, message))
    }

    fn raycast_rewound(
        &mut self,
        shooter: u16,
        from: Vector2,
        to: Vector2,
        rewind_ms: u64,
    ) -> Option<u16> {
        let rewound: Vec<(BodyId, Pose)> = self
            .historian
            .rewind(rewind_ms)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(nid, pose)| {
                let entity = self.entities.get(&nid)?;
                (!entity.is_static()).then_some((entity.body, pose))
            })
            .collect();

        let hits = {
            let guard = RewindGuard::new(&mut self.physics, &rewound);
            guard.ray_cast(from, to)
        };

        for hit in hits {
            let Some(entity) = self
                .body_owners
                .get(&hit.body)
                .and_then(|nid| self.entities.get(nid))
            else {
                continue;
            };
            if entity.nid == shooter || !entity.is_alive() {
                continue;
            }
            if entity.is_static() {
                return None;
            }
            return Some(entity.nid);
        }
        None
    }

    /// Returns the target's health and liveness afterwards.
    fn damage(&mut self, nid: u16, force: f32, direction: Vector2) -> Option<(Option<u8>, bool)> {
        let entity = self.entities.get_mut(&nid)?;
        if let EntityKind::Player {
            health, is_alive, ..
        } = &mut entity.kind
        {
            let amount = force.min(u8::MAX as f32).round() as u8;
            *health = health.saturating_sub(amount);
            if *health == 0 {
                *is_alive = false;
            }
        }
        if !entity.is_static() {
            if let Some(body) = self.physics.body_mut(entity.body) {
                let impulse = direction.normalize().scale(force / body.mass);
                body.velocity = body.velocity.add(&impulse);
            }
        }
        Some((entity.health(), entity.is_alive()))
    }

    fn sync_bodies(&mut self, report: &mut TickReport) {
        for entity in self.entities.values_mut() {
            let Some(body) = self.physics.body_mut(entity.body) else {
                continue;
            };
            let mut repaired = false;
            if !body.position.is_finite() {
                body.position = Vector2::new(entity.x, entity.y);
                body.velocity = Vector2::default();
                repaired = true;
            }
            if !body.velocity.is_finite() {
                body.velocity = Vector2::default();
                repaired = true;
            } else if body.velocity.magnitude() > self.max_speed {
                body.velocity = body.velocity.normalize().scale(self.max_speed);
            }
            if !body.rotation.is_finite() {
                body.rotation = entity.rotation;
                repaired = true;
            }
            if repaired {
                warn!("Repaired physics state of entity {}", entity.nid);
                report.repaired.push(entity.nid);
            }

            entity.x = body.position.x;
            entity.y = body.position.y;
            entity.vx = body.velocity.x;
            entity.vy = body.velocity.y;
            entity.rotation = body.rotation;
            self.channel.update_entity(entity.to_record());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use assert_approx_eq::assert_approx_eq;
    use shared::UsernameCommand;
    use tokio::sync::mpsc;

    const DT: f32 = 1.0 / 30.0;
    const TICK_MS: u64 = 33;

    fn config() -> ServerConfig {
        ServerConfig {
            obstacles: 0,
            props: 0,
            seed: Some(3),
            ..Default::default()
        }
    }

    fn open_session(sessions: &mut SessionManager, game: &mut Game, conn_id: ConnectionId) {
        let (tx, _) = mpsc::unbounded_channel();
        let mut session = Session::new(conn_id, None, Aabb::centered(0.0, 0.0, 1200.0, 900.0), tx);
        session.begin_handshake();
        let view = session.view;
        sessions.open(session);
        sessions.complete_handshake(conn_id, Ok(()));
        game.join(conn_id, view);
    }

    fn setup() -> (Game, SessionManager) {
        (Game::new(&config()), SessionManager::new(8))
    }

    fn player_at(
        game: &mut Game,
        sessions: &mut SessionManager,
        conn_id: ConnectionId,
        name: &str,
        x: f32,
        y: f32,
    ) -> u16 {
        open_session(sessions, game, conn_id);
        let nid = game.spawn_player_at(conn_id, name, x, y).unwrap();
        sessions.get_mut(conn_id).unwrap().entity_nid = Some(nid);
        nid
    }

    fn run_ticks(game: &mut Game, sessions: &mut SessionManager, clock: &mut u64, n: usize) {
        for _ in 0..n {
            *clock += TICK_MS;
            game.step(sessions, DT, *clock);
        }
    }

    fn shoot(sessions: &mut SessionManager, conn_id: ConnectionId, cmd: ShotImpactCommand) {
        sessions
            .get_mut(conn_id)
            .unwrap()
            .push_commands([Command::ShotImpact(cmd)]);
    }

    #[test]
    fn test_apply_is_deterministic_assignment() {
        let (mut game, mut sessions) = setup();
        let nid = player_at(&mut game, &mut sessions, 1, "AAA", 0.0, 0.0);
        let entity = game.entity(nid).unwrap().clone();
        let cmd = MoveCommand {
            right: true,
            rotation: 0.5,
            delta: DT,
            ..Default::default()
        };

        let once = apply(&entity, &cmd);
        let twice = apply(&once, &cmd);
        assert_eq!(once, apply(&entity, &cmd));
        assert_eq!((once.vx, once.vy, once.rotation), (twice.vx, twice.vy, twice.rotation));
        assert_eq!(once.vx, shared::PLAYER_SPEED);
        assert_eq!(once.rotation, 0.5);

        let nan_rotation = MoveCommand {
            rotation: f32::NAN,
            ..cmd
        };
        assert_eq!(apply(&entity, &nan_rotation).rotation, entity.rotation);
    }

    #[test]
    fn test_nid_pool_recycles_only_released_ids() {
        let mut pool = NidPool::with_limit(3);
        assert_eq!(pool.allocate(), Some(1));
        assert_eq!(pool.allocate(), Some(2));
        pool.release(7);
        pool.release(0);
        assert_eq!(pool.allocate(), Some(3));
        assert_eq!(pool.allocate(), None);

        pool.release(2);
        pool.release(2);
        pool.release(1);
        assert_eq!(pool.allocate(), Some(2));
        assert_eq!(pool.allocate(), Some(1));
        assert_eq!(pool.allocate(), None);
    }

    #[test]
    fn test_username_spawns_and_identifies() {
        let (mut game, mut sessions) = setup();
        open_session(&mut sessions, &mut game, 1);
        sessions.get_mut(1).unwrap().push_commands([Command::Username(UsernameCommand {
            username: "AAA".to_string(),
        })]);

        let report = game.step(&mut sessions, DT, TICK_MS);
        assert_eq!(report.spawned, vec![1]);
        let session = sessions.get(1).unwrap();
        assert_eq!(session.entity_nid, Some(1));
        assert_eq!(session.message_queue, vec![Message::Identity { my_id: 1 }]);
    }

    #[test]
    fn test_duplicate_username_allocates_nothing() {
        let (mut game, mut sessions) = setup();
        open_session(&mut sessions, &mut game, 1);
        open_session(&mut sessions, &mut game, 2);
        for conn_id in [1, 2] {
            sessions.get_mut(conn_id).unwrap().push_commands([Command::Username(
                UsernameCommand {
                    username: "AAA".to_string(),
                },
            )]);
        }

        let report = game.step(&mut sessions, DT, TICK_MS);
        assert_eq!(report.spawned.len(), 1);
        let second = sessions.get(2).unwrap();
        assert_eq!(second.entity_nid, None);
        assert!(second.message_queue.is_empty());
        // The rejected attempt did not burn an id
        assert_eq!(game.spawn_obstacle(0.0, 0.0, 1.0, 1.0), Some(2));
    }

    #[test]
    fn test_invalid_usernames_rejected() {
        let (mut game, _) = setup();
        assert_eq!(
            game.spawn_player_at(1, "   ", 0.0, 0.0),
            Err(SpawnError::InvalidUsername)
        );
        let long = "x".repeat(MAX_USERNAME_LEN + 1);
        assert_eq!(
            game.spawn_player_at(1, &long, 0.0, 0.0),
            Err(SpawnError::InvalidUsername)
        );
        assert_eq!(game.player_count(), 0);
    }

    #[test]
    fn test_tick_moves_then_snapshots() {
        let (mut game, mut sessions) = setup();
        let nid = player_at(&mut game, &mut sessions, 1, "AAA", 0.0, 0.0);
        sessions.get_mut(1).unwrap().push_commands([Command::Move(MoveCommand {
            right: true,
            delta: DT,
            ..Default::default()
        })]);

        game.step(&mut sessions, DT, TICK_MS);
        let entity = game.entity(nid).unwrap();
        assert_approx_eq!(entity.x, shared::PLAYER_SPEED * DT, 1e-3);
        // The snapshot is taken after the physics step
        let snapshot = game.historian.latest().unwrap();
        assert_eq!(snapshot.tick, 1);
        assert_eq!(snapshot.poses[&nid].x, entity.x);
        // And the session's view followed its entity
        let (cx, cy) = sessions.get(1).unwrap().view.center();
        assert_approx_eq!(cx, entity.x, 1e-3);
        assert_approx_eq!(cy, entity.y, 1e-3);
    }

    #[test]
    fn test_command_without_entity_is_dropped() {
        let (mut game, mut sessions) = setup();
        open_session(&mut sessions, &mut game, 1);
        sessions.get_mut(1).unwrap().push_commands([
            Command::Move(MoveCommand::default()),
            Command::ShotImpact(ShotImpactCommand::default()),
        ]);
        let report = game.step(&mut sessions, DT, TICK_MS);
        assert_eq!(report.dropped_commands, 2);
        assert!(report.hits.is_empty());
    }

    fn shot_along_x(force: f32) -> ShotImpactCommand {
        ShotImpactCommand {
            from_x: 0.0,
            from_y: 0.0,
            hit_x: 200.0,
            hit_y: 0.0,
            impact_force: force,
            target_nid: 0,
        }
    }

    #[test]
    fn test_rewound_position_registers_hit() {
        let (mut game, mut sessions) = setup();
        let mut clock = 0;
        player_at(&mut game, &mut sessions, 1, "shooter", -300.0, 400.0);
        let target = player_at(&mut game, &mut sessions, 2, "target", 100.0, 0.0);
        run_ticks(&mut game, &mut sessions, &mut clock, 10);

        // Target has since walked off the line of fire
        game.place_entity(target, 100.0, 300.0);
        run_ticks(&mut game, &mut sessions, &mut clock, 1);

        shoot(&mut sessions, 1, shot_along_x(10.0));
        let report = game.step(&mut sessions, DT, clock + TICK_MS);
        assert_eq!(report.hits.len(), 1);
        assert_eq!(report.hits[0].target, target);
        assert!(report.hits[0].rewound);
        assert_eq!(report.hits[0].health, Some(90));
    }

    #[test]
    fn test_live_only_position_does_not_register() {
        let (mut game, mut sessions) = setup();
        let mut clock = 0;
        player_at(&mut game, &mut sessions, 1, "shooter", -300.0, 400.0);
        let target = player_at(&mut game, &mut sessions, 2, "target", 100.0, 300.0);
        run_ticks(&mut game, &mut sessions, &mut clock, 10);

        // Only just stepped into the line of fire
        game.place_entity(target, 100.0, 0.0);
        run_ticks(&mut game, &mut sessions, &mut clock, 1);

        shoot(&mut sessions, 1, shot_along_x(10.0));
        let report = game.step(&mut sessions, DT, clock + TICK_MS);
        assert!(report.hits.is_empty());
        assert_eq!(game.entity(target).unwrap().health(), Some(MAX_HEALTH));
        // Rewinding left the live position alone
        assert_approx_eq!(game.entity(target).unwrap().y, 0.0);
    }

    #[test]
    fn test_obstacle_blocks_shot() {
        let (mut game, mut sessions) = setup();
        let mut clock = 0;
        player_at(&mut game, &mut sessions, 1, "shooter", -300.0, 400.0);
        player_at(&mut game, &mut sessions, 2, "target", 150.0, 0.0);
        game.spawn_obstacle(60.0, 0.0, 20.0, 100.0);
        run_ticks(&mut game, &mut sessions, &mut clock, 5);

        shoot(&mut sessions, 1, shot_along_x(10.0));
        let report = game.step(&mut sessions, DT, clock + TICK_MS);
        assert!(report.hits.is_empty());
    }

    #[test]
    fn test_claimed_target_wins_over_raycast() {
        let (mut game, mut sessions) = setup();
        let mut clock = 0;
        player_at(&mut game, &mut sessions, 1, "shooter", -300.0, 400.0);
        let on_ray = player_at(&mut game, &mut sessions, 2, "on ray", 100.0, 0.0);
        let claimed = player_at(&mut game, &mut sessions, 3, "claimed", 500.0, 500.0);
        run_ticks(&mut game, &mut sessions, &mut clock, 5);

        shoot(
            &mut sessions,
            1,
            ShotImpactCommand {
                target_nid: claimed,
                ..shot_along_x(25.0)
            },
        );
        let report = game.step(&mut sessions, DT, clock + TICK_MS);
        assert_eq!(report.hits.len(), 1);
        assert_eq!(report.hits[0].target, claimed);
        assert!(!report.hits[0].rewound);
        assert_eq!(game.entity(on_ray).unwrap().health(), Some(MAX_HEALTH));
        assert_eq!(game.entity(claimed).unwrap().health(), Some(75));
    }

    #[test]
    fn test_lethal_shot_removes_target_and_frees_name() {
        let (mut game, mut sessions) = setup();
        let mut clock = 0;
        let shooter = player_at(&mut game, &mut sessions, 1, "shooter", 0.0, -50.0);
        let target = player_at(&mut game, &mut sessions, 2, "target", 10.0, 0.0);
        run_ticks(&mut game, &mut sessions, &mut clock, 5);

        shoot(
            &mut sessions,
            1,
            ShotImpactCommand {
                hit_x: 10.0,
                ..shot_along_x(200.0)
            },
        );
        let report = game.step(&mut sessions, DT, clock + TICK_MS);
        assert_eq!(
            report.hits,
            vec![ShotHit {
                shooter,
                target,
                health: Some(0),
                is_alive: false,
                rewound: true,
            }]
        );
        assert_eq!(report.removed, vec![target]);
        assert!(game.entity(target).is_none());
        assert_eq!(sessions.get(2).unwrap().entity_nid, None);

        let impacts: Vec<_> = sessions
            .get(1)
            .unwrap()
            .message_queue
            .iter()
            .filter(|m| matches!(m, Message::ShotImpact { .. }))
            .collect();
        assert_eq!(impacts.len(), 1);

        // Same name, recycled id
        assert_eq!(game.spawn_player_at(2, "target", 0.0, 0.0), Ok(target));
    }

    #[test]
    fn test_rewind_guard_restores_after_panic() {
        let mut physics = SimplePhysics::new();
        let id = physics.add_body(Body::dynamic(
            Vector2::new(1.0, 2.0),
            Shape::Circle { radius: 1.0 },
            1.0,
        ));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let guard = RewindGuard::new(&mut physics, &[(id, Pose::new(50.0, 60.0, 1.0))]);
            assert_eq!(guard.body(id).unwrap().position, Vector2::new(50.0, 60.0));
            panic!("ray test failed");
        }));
        assert!(result.is_err());
        let body = physics.body(id).unwrap();
        assert_eq!(body.position, Vector2::new(1.0, 2.0));
        assert_eq!(body.rotation, 0.0);
    }

    #[test]
    fn test_physics_anomalies_are_repaired() {
        let (mut game, mut sessions) = setup();
        let nid = player_at(&mut game, &mut sessions, 1, "AAA", 20.0, 30.0);
        let body = game.entity(nid).unwrap().body;
        game.physics.body_mut(body).unwrap().velocity = Vector2::new(f32::NAN, 0.0);

        let report = game.step(&mut sessions, DT, TICK_MS);
        assert_eq!(report.repaired, vec![nid]);
        let entity = game.entity(nid).unwrap();
        assert_eq!((entity.x, entity.y), (20.0, 30.0));
        assert_eq!((entity.vx, entity.vy), (0.0, 0.0));

        game.physics.body_mut(body).unwrap().velocity = Vector2::new(1.0e6, 0.0);
        game.step(&mut sessions, DT, 2 * TICK_MS);
        let entity = game.entity(nid).unwrap();
        assert_approx_eq!(entity.vx, game.max_speed, 1e-2);
    }

    #[test]
    fn test_leave_releases_entity() {
        let (mut game, mut sessions) = setup();
        let nid = player_at(&mut game, &mut sessions, 1, "AAA", 0.0, 0.0);
        game.leave(1, Some(nid));
        assert!(game.entity(nid).is_none());
        assert!(!game.channel.is_subscribed(1));
        assert_eq!(game.player_count(), 0);
    }
}
