//! Lag compensation history
//!
//! One snapshot of every tracked entity's pose per tick, kept for a bounded
//! horizon. "Now" is the timestamp of the newest snapshot, so a rewind is
//! always relative to the simulation's own clock.

use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub x: f32,
    pub y: f32,
    pub rotation: f32,
}

impl Pose {
    pub fn new(x: f32, y: f32, rotation: f32) -> Self {
        Self { x, y, rotation }
    }

    fn lerp(&self, other: &Pose, t: f32) -> Pose {
        Pose {
            x: self.x + (other.x - self.x) * t,
            y: self.y + (other.y - self.y) * t,
            rotation: lerp_angle(self.rotation, other.rotation, t),
        }
    }
}

/// Interpolates along the shorter arc.
fn lerp_angle(from: f32, to: f32, t: f32) -> f32 {
    use std::f32::consts::{PI, TAU};
    let mut diff = (to - from) % TAU;
    if diff > PI {
        diff -= TAU;
    } else if diff < -PI {
        diff += TAU;
    }
    from + diff * t
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub tick: u32,
    pub timestamp_ms: u64,
    pub poses: BTreeMap<u16, Pose>,
}

#[derive(Debug)]
pub struct Historian {
    snapshots: VecDeque<Snapshot>,
    horizon_ms: u64,
}

impl Historian {
    pub fn new(horizon_ms: u64) -> Self {
        Self {
            snapshots: VecDeque::new(),
            horizon_ms,
        }
    }

    /// Stores this tick's poses and drops snapshots older than the horizon.
    ///
    /// Timestamps must not go backwards; a snapshot older than the newest one
    /// is ignored.
    pub fn snapshot(
        &mut self,
        tick: u32,
        timestamp_ms: u64,
        poses: impl IntoIterator<Item = (u16, Pose)>,
    ) {
        if self
            .snapshots
            .back()
            .is_some_and(|latest| timestamp_ms < latest.timestamp_ms)
        {
            return;
        }
        self.snapshots.push_back(Snapshot {
            tick,
            timestamp_ms,
            poses: poses.into_iter().collect(),
        });

        let cutoff = timestamp_ms.saturating_sub(self.horizon_ms);
        while self
            .snapshots
            .front()
            .is_some_and(|oldest| oldest.timestamp_ms < cutoff)
        {
            self.snapshots.pop_front();
        }
    }

    /// Poses as they were `ms_ago` milliseconds before the newest snapshot.
    ///
    /// Between two snapshots the poses are interpolated; entities present in
    /// only the earlier one keep its pose, entities that did not exist yet are
    /// left out. Requests beyond the oldest snapshot clamp to it. `None` only
    /// when nothing has been recorded.
    pub fn rewind(&self, ms_ago: u64) -> Option<BTreeMap<u16, Pose>> {
        let latest = self.snapshots.back()?;
        let target = latest.timestamp_ms.saturating_sub(ms_ago);

        if target >= latest.timestamp_ms {
            return Some(latest.poses.clone());
        }
        let oldest = self.snapshots.front()?;
        if target <= oldest.timestamp_ms {
            return Some(oldest.poses.clone());
        }

        // First snapshot strictly after the target; the one before it is at or before.
        let after_index = self
            .snapshots
            .iter()
            .position(|s| s.timestamp_ms > target)?;
        let after = &self.snapshots[after_index];
        let before = &self.snapshots[after_index - 1];
        if before.timestamp_ms == target {
            return Some(before.poses.clone());
        }

        let span = (after.timestamp_ms - before.timestamp_ms) as f32;
        let t = (target - before.timestamp_ms) as f32 / span;
        let poses = before
            .poses
            .iter()
            .map(|(nid, pose)| {
                let pose = match after.poses.get(nid) {
                    Some(next) => pose.lerp(next, t),
                    None => *pose,
                };
                (*nid, pose)
            })
            .collect();
        Some(poses)
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.back()
    }

    pub fn oldest(&self) -> Option<&Snapshot> {
        self.snapshots.front()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn horizon_ms(&self) -> u64 {
        self.horizon_ms
    }
}
