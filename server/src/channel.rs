//! Interest management
//!
//! The channel holds one replicated record per entity and, per subscribed
//! session, the set of entity ids that session currently has. Field changes
//! are collected once per tick as entities are updated, so computing a
//! session's delta is a walk over its view, not a comparison against a
//! per-session copy of the world.
//!
//! An entity is visible to a session when its position lies inside the
//! session's view bound (edges inclusive).

use crate::session::ConnectionId;
use log::{debug, warn};
use shared::protocol::entity_fields;
use shared::{Aabb, EntityUpdate, Record, Value};
use std::collections::{BTreeMap, BTreeSet};

/// What one session needs to go from what it has to what it should see
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    /// Full state of entities that just became visible.
    pub created: Vec<Record>,
    /// Changed fields of entities that stayed visible.
    pub updated: Vec<EntityUpdate>,
    /// Entities that left the view or no longer exist.
    pub deleted: Vec<u16>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

#[derive(Debug)]
struct Tracked {
    record: Record,
    is_static: bool,
    /// Distinguishes a recycled nid from the entity that used it before.
    generation: u64,
    dirty: BTreeSet<u8>,
    changed: Vec<u8>,
}

impl Tracked {
    fn position(&self) -> Option<(f32, f32)> {
        record_position(&self.record)
    }
}

#[derive(Debug)]
struct View {
    bound: Aabb,
    visible: BTreeMap<u16, u64>,
}

pub fn record_nid(record: &Record) -> Option<u16> {
    record
        .get(entity_fields::NID as usize)
        .and_then(Value::as_u16)
}

pub fn record_position(record: &Record) -> Option<(f32, f32)> {
    let x = record.get(entity_fields::X as usize)?.as_f32()?;
    let y = record.get(entity_fields::Y as usize)?.as_f32()?;
    Some((x, y))
}

pub struct Channel {
    entities: BTreeMap<u16, Tracked>,
    views: BTreeMap<ConnectionId, View>,
    static_exemption: bool,
    next_generation: u64,
}

impl Channel {
    pub fn new(static_exemption: bool) -> Self {
        Self {
            entities: BTreeMap::new(),
            views: BTreeMap::new(),
            static_exemption,
            next_generation: 0,
        }
    }

    pub fn subscribe(&mut self, session: ConnectionId, bound: Aabb) {
        self.views.insert(
            session,
            View {
                bound,
                visible: BTreeMap::new(),
            },
        );
    }

    pub fn unsubscribe(&mut self, session: ConnectionId) {
        self.views.remove(&session);
    }

    pub fn is_subscribed(&self, session: ConnectionId) -> bool {
        self.views.contains_key(&session)
    }

    pub fn update_view(&mut self, session: ConnectionId, bound: Aabb) {
        if let Some(view) = self.views.get_mut(&session) {
            view.bound = bound;
        }
    }

    /// Starts tracking an entity. Returns false if the record has no nid or
    /// the nid is already tracked.
    pub fn add_entity(&mut self, record: Record, is_static: bool) -> bool {
        let Some(nid) = record_nid(&record) else {
            warn!("Entity record with tag {} has no nid", record.tag);
            return false;
        };
        if self.entities.contains_key(&nid) {
            warn!("Entity {} is already tracked", nid);
            return false;
        }
        self.next_generation += 1;
        self.entities.insert(
            nid,
            Tracked {
                record,
                is_static,
                generation: self.next_generation,
                dirty: BTreeSet::new(),
                changed: Vec::new(),
            },
        );
        true
    }

    pub fn remove_entity(&mut self, nid: u16) -> bool {
        self.entities.remove(&nid).is_some()
    }

    /// Replaces an entity's replicated state, noting which fields changed.
    pub fn update_entity(&mut self, record: Record) {
        let Some(nid) = record_nid(&record) else {
            return;
        };
        let Some(tracked) = self.entities.get_mut(&nid) else {
            debug!("Update for untracked entity {}", nid);
            return;
        };
        if tracked.is_static && self.static_exemption {
            return;
        }
        for (index, (old, new)) in tracked.record.values.iter().zip(&record.values).enumerate() {
            if old != new {
                tracked.dirty.insert(index as u8);
            }
        }
        tracked.record = record;
    }

    /// Closes the current tick: changes collected since the last call become
    /// what [`compute_delta`](Self::compute_delta) reports as updates.
    pub fn advance(&mut self) {
        for tracked in self.entities.values_mut() {
            tracked.changed = std::mem::take(&mut tracked.dirty).into_iter().collect();
        }
    }

    pub fn compute_delta(&mut self, session: ConnectionId) -> Delta {
        let Some(view) = self.views.get_mut(&session) else {
            return Delta::default();
        };
        let mut delta = Delta::default();
        let mut visible = BTreeMap::new();

        for (&nid, &generation) in &view.visible {
            match self.entities.get(&nid) {
                Some(tracked)
                    if tracked.generation == generation
                        && tracked
                            .position()
                            .is_some_and(|(x, y)| view.bound.contains_point(x, y)) =>
                {
                    for &field in &tracked.changed {
                        if let Some(value) = tracked.record.get(field as usize) {
                            delta.updated.push(EntityUpdate {
                                tag: tracked.record.tag,
                                nid,
                                field,
                                value: value.clone(),
                            });
                        }
                    }
                    visible.insert(nid, generation);
                }
                _ => delta.deleted.push(nid),
            }
        }

        for (&nid, tracked) in &self.entities {
            if visible.contains_key(&nid) {
                continue;
            }
            if tracked
                .position()
                .is_some_and(|(x, y)| view.bound.contains_point(x, y))
            {
                delta.created.push(tracked.record.clone());
                visible.insert(nid, tracked.generation);
            }
        }

        view.visible = visible;
        delta
    }

    /// Entities `session` currently has.
    pub fn visible(&self, session: ConnectionId) -> Vec<u16> {
        self.views
            .get(&session)
            .map(|v| v.visible.keys().copied().collect())
            .unwrap_or_default()
    }

    /// `(nid, x, y, rotation)` of every tracked entity.
    pub fn poses(&self) -> impl Iterator<Item = (u16, f32, f32, f32)> + '_ {
        self.entities.iter().filter_map(|(&nid, tracked)| {
            let (x, y) = tracked.position()?;
            let rotation = tracked
                .record
                .get(entity_fields::ROTATION as usize)
                .and_then(Value::as_f32)
                .unwrap_or(0.0);
            Some((nid, x, y, rotation))
        })
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn session_count(&self) -> usize {
        self.views.len()
    }
}
