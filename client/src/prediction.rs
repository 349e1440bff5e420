//! Client-side prediction records and reconciliation
//!
//! Every local tick the client stores what it sent and where it expects its
//! entity to be afterwards. When the server confirms a tick, the prediction
//! for that tick is compared with the authoritative value; a mismatch means
//! the local value is overwritten with the server's. Records at or before a
//! confirmed tick are never needed again and are purged.

use log::debug;
use shared::wrapping::sequence_at_or_before;
use shared::MoveCommand;
use std::collections::VecDeque;

/// Predictions further apart than this count as a mismatch.
pub const DEFAULT_TOLERANCE: f32 = 0.01;

/// Oldest records are dropped past this many, so a server that never
/// confirms cannot grow the buffer without bound.
const MAX_RECORDS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionRecord {
    pub tick: u16,
    pub command: MoveCommand,
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reconciliation {
    /// Prediction matched; the local value stands.
    Confirmed,
    /// Prediction was wrong; the property must take the server's value.
    Corrected { x: f32, y: f32 },
    /// Nothing was predicted for that tick.
    Unknown,
}

#[derive(Debug)]
pub struct Predictor {
    records: VecDeque<PredictionRecord>,
    tolerance: f32,
    corrections: u64,
}

impl Predictor {
    pub fn new() -> Self {
        Self::with_tolerance(DEFAULT_TOLERANCE)
    }

    pub fn with_tolerance(tolerance: f32) -> Self {
        Self {
            records: VecDeque::new(),
            tolerance,
            corrections: 0,
        }
    }

    pub fn record(&mut self, tick: u16, command: MoveCommand, x: f32, y: f32) {
        if self.records.len() == MAX_RECORDS {
            self.records.pop_front();
        }
        self.records.push_back(PredictionRecord { tick, command, x, y });
    }

    /// Compares the prediction for `confirmed_tick` with the server's value
    /// and purges every record at or before that tick.
    pub fn reconcile(&mut self, confirmed_tick: u16, authoritative: (f32, f32)) -> Reconciliation {
        let predicted = self.records.iter().find(|r| r.tick == confirmed_tick).copied();
        self.records
            .retain(|r| !sequence_at_or_before(r.tick, confirmed_tick));

        let Some(predicted) = predicted else {
            return Reconciliation::Unknown;
        };
        let (x, y) = authoritative;
        let error = ((predicted.x - x).powi(2) + (predicted.y - y).powi(2)).sqrt();
        if error <= self.tolerance {
            Reconciliation::Confirmed
        } else {
            self.corrections += 1;
            debug!(
                "Tick {} mispredicted by {:.2}, correcting to ({:.1}, {:.1})",
                confirmed_tick, error, x, y
            );
            Reconciliation::Corrected { x, y }
        }
    }

    pub fn pending(&self) -> impl Iterator<Item = &PredictionRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn corrections(&self) -> u64 {
        self.corrections
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl Default for Predictor {
    fn default() -> Self {
        Self::new()
    }
}
