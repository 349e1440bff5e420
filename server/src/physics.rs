//! Physics engine seam
//!
//! The tick loop only needs a handful of operations from a rigid-body engine:
//! add/remove bodies, read and write their position and velocity, advance
//! time and cast rays. [`PhysicsWorld`] is that surface; [`SimplePhysics`] is
//! a small top-down engine (no gravity, linear damping, circle and box shapes,
//! dynamic bodies pushed out of static ones) good enough for the game server.

use serde::Serialize;
use std::collections::BTreeMap;

///Represents a vector in 2D space.
#[derive(Debug, Clone, Copy, Serialize, Default, PartialEq)]
pub struct Vector2 {
    pub x: f32,
    pub y: f32,
}

impl Vector2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    ///Returns the magnitude of the vector.
    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    ///Returns the normalized vector.
    pub fn normalize(&self) -> Vector2 {
        let mag = self.magnitude();
        if mag == 0.0 {
            Vector2 { x: 0.0, y: 0.0 }
        } else {
            Vector2 {
                x: self.x / mag,
                y: self.y / mag,
            }
        }
    }

    ///Returns the scaled vector.
    pub fn scale(&self, scalar: f32) -> Vector2 {
        Vector2 {
            x: self.x * scalar,
            y: self.y * scalar,
        }
    }

    ///Returns the sum of two vectors.
    pub fn add(&self, other: &Vector2) -> Vector2 {
        Vector2 {
            x: self.x + other.x,
            y: self.y + other.y,
        }
    }

    pub fn sub(&self, other: &Vector2) -> Vector2 {
        Vector2 {
            x: self.x - other.x,
            y: self.y - other.y,
        }
    }

    pub fn dot(&self, other: &Vector2) -> f32 {
        self.x * other.x + self.y * other.y
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BodyId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shape {
    Circle { radius: f32 },
    Rect { width: f32, height: f32 },
}

///A rigid body. Position is the centre of the shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Body {
    pub position: Vector2,
    pub velocity: Vector2,
    pub rotation: f32,
    pub shape: Shape,
    pub mass: f32,
    pub is_static: bool,
}

impl Body {
    pub fn dynamic(position: Vector2, shape: Shape, mass: f32) -> Self {
        Self {
            position,
            velocity: Vector2::default(),
            rotation: 0.0,
            shape,
            mass,
            is_static: false,
        }
    }

    pub fn fixed(position: Vector2, shape: Shape) -> Self {
        Self {
            position,
            velocity: Vector2::default(),
            rotation: 0.0,
            shape,
            mass: f32::INFINITY,
            is_static: true,
        }
    }

    fn half_extents(&self) -> (f32, f32) {
        match self.shape {
            Shape::Circle { radius } => (radius, radius),
            Shape::Rect { width, height } => (width / 2.0, height / 2.0),
        }
    }

    /// Parametric distance along `from → to` at which the segment enters this
    /// body, in `[0, 1]`, or `None` if it misses.
    pub fn ray_fraction(&self, from: Vector2, to: Vector2) -> Option<f32> {
        let d = to.sub(&from);
        match self.shape {
            Shape::Circle { radius } => {
                let f = from.sub(&self.position);
                let a = d.dot(&d);
                let c = f.dot(&f) - radius * radius;
                if c <= 0.0 {
                    return Some(0.0);
                }
                if a == 0.0 {
                    return None;
                }
                let b = 2.0 * f.dot(&d);
                let disc = b * b - 4.0 * a * c;
                if disc < 0.0 {
                    return None;
                }
                let t = (-b - disc.sqrt()) / (2.0 * a);
                (0.0..=1.0).contains(&t).then_some(t)
            }
            Shape::Rect { .. } => {
                let (hw, hh) = self.half_extents();
                let min = [self.position.x - hw, self.position.y - hh];
                let max = [self.position.x + hw, self.position.y + hh];
                let origin = [from.x, from.y];
                let dir = [d.x, d.y];
                let mut t_enter = 0.0f32;
                let mut t_exit = 1.0f32;
                for axis in 0..2 {
                    if dir[axis] == 0.0 {
                        if origin[axis] < min[axis] || origin[axis] > max[axis] {
                            return None;
                        }
                        continue;
                    }
                    let inv = 1.0 / dir[axis];
                    let mut t0 = (min[axis] - origin[axis]) * inv;
                    let mut t1 = (max[axis] - origin[axis]) * inv;
                    if t0 > t1 {
                        std::mem::swap(&mut t0, &mut t1);
                    }
                    t_enter = t_enter.max(t0);
                    t_exit = t_exit.min(t1);
                    if t_enter > t_exit {
                        return None;
                    }
                }
                Some(t_enter)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub body: BodyId,
    pub fraction: f32,
}

/// What the tick loop needs from a physics engine
pub trait PhysicsWorld {
    fn add_body(&mut self, body: Body) -> BodyId;
    fn remove_body(&mut self, id: BodyId) -> Option<Body>;
    fn body(&self, id: BodyId) -> Option<&Body>;
    fn body_mut(&mut self, id: BodyId) -> Option<&mut Body>;
    fn step(&mut self, dt: f32);
    /// Every body crossed by the segment, nearest first.
    fn ray_cast(&self, from: Vector2, to: Vector2) -> Vec<RayHit>;
}

/// Minimal top-down rigid body engine
#[derive(Debug, Default)]
pub struct SimplePhysics {
    bodies: BTreeMap<BodyId, Body>,
    next_id: u32,
    /// Fraction of velocity lost per second.
    pub damping: f32,
    /// World rectangle dynamic bodies are kept inside, if any.
    pub bounds: Option<(Vector2, Vector2)>,
}

impl SimplePhysics {
    pub fn new() -> Self {
        Self {
            bodies: BTreeMap::new(),
            next_id: 1,
            damping: 0.0,
            bounds: None,
        }
    }

    pub fn with_bounds(mut self, min: Vector2, max: Vector2) -> Self {
        self.bounds = Some((min, max));
        self
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    ///Pushes a dynamic body out of a static one along the axis of shallowest
    ///penetration. Returns true if they overlapped.
    fn separate(body: &mut Body, other: &Body) -> bool {
        let (hw, hh) = body.half_extents();
        let (ohw, ohh) = other.half_extents();

        let self_left = body.position.x - hw;
        let self_right = body.position.x + hw;
        let self_top = body.position.y + hh;
        let self_bottom = body.position.y - hh;

        let other_left = other.position.x - ohw;
        let other_right = other.position.x + ohw;
        let other_top = other.position.y + ohh;
        let other_bottom = other.position.y - ohh;

        let collision = !(self_right <= other_left
            || self_left >= other_right
            || self_bottom >= other_top
            || self_top <= other_bottom);
        if !collision {
            return false;
        }

        let overlap_x = (self_right.min(other_right) - self_left.max(other_left)).abs();
        let overlap_y = (self_top.min(other_top) - self_bottom.max(other_bottom)).abs();

        if overlap_x < overlap_y {
            if body.position.x < other.position.x {
                body.position.x = other_left - hw;
            } else {
                body.position.x = other_right + hw;
            }
            body.velocity.x = 0.0;
        } else {
            if body.position.y < other.position.y {
                body.position.y = other_bottom - hh;
            } else {
                body.position.y = other_top + hh;
            }
            body.velocity.y = 0.0;
        }
        true
    }
}

impl PhysicsWorld for SimplePhysics {
    fn add_body(&mut self, body: Body) -> BodyId {
        let id = BodyId(self.next_id.max(1));
        self.next_id = id.0 + 1;
        self.bodies.insert(id, body);
        id
    }

    fn remove_body(&mut self, id: BodyId) -> Option<Body> {
        self.bodies.remove(&id)
    }

    fn body(&self, id: BodyId) -> Option<&Body> {
        self.bodies.get(&id)
    }

    fn body_mut(&mut self, id: BodyId) -> Option<&mut Body> {
        self.bodies.get_mut(&id)
    }

    fn step(&mut self, dt: f32) {
        let statics: Vec<Body> = self
            .bodies
            .values()
            .filter(|b| b.is_static)
            .copied()
            .collect();
        let keep = (1.0 - self.damping * dt).clamp(0.0, 1.0);

        for body in self.bodies.values_mut().filter(|b| !b.is_static) {
            body.position = body.position.add(&body.velocity.scale(dt));
            body.velocity = body.velocity.scale(keep);

            for other in &statics {
                Self::separate(body, other);
            }

            if let Some((min, max)) = self.bounds {
                let (hw, hh) = body.half_extents();
                body.position.x = body.position.x.clamp(min.x + hw, max.x - hw);
                body.position.y = body.position.y.clamp(min.y + hh, max.y - hh);
            }
        }
    }

    fn ray_cast(&self, from: Vector2, to: Vector2) -> Vec<RayHit> {
        let mut hits: Vec<RayHit> = self
            .bodies
            .iter()
            .filter_map(|(id, body)| {
                body.ray_fraction(from, to).map(|fraction| RayHit {
                    body: *id,
                    fraction,
                })
            })
            .collect();
        hits.sort_by(|a, b| a.fraction.total_cmp(&b.fraction));
        hits
    }
}
