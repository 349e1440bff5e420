//! Client-side view of the world
//!
//! [`Mirror`] holds the replicated records the server has sent and applies
//! each frame's deltas to them. [`ClientGame`] adds the local player on top:
//! it numbers ticks, predicts the own entity's movement and reconciles that
//! prediction when the server confirms a tick.

use crate::input::{InputManager, Intent};
use crate::prediction::{Predictor, Reconciliation};
use log::{debug, info, warn};
use shared::protocol::entity_fields;
use shared::{
    predict_position, EngineMessage, Frame, Message, Record, Response, Section, Value,
};
use std::collections::BTreeMap;

/// Recent shot impacts kept for effects.
const MAX_IMPACTS: usize = 32;

/// The entities this client can currently see
#[derive(Debug, Default)]
pub struct Mirror {
    entities: BTreeMap<u16, Record>,
    my_id: Option<u16>,
    impacts: Vec<Message>,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a frame's deletes, then creates, then updates, so that a nid
    /// released and reused within one tick ends up as the new entity.
    pub fn apply(&mut self, frame: &Frame) {
        for nid in frame.deletes() {
            if self.entities.remove(nid).is_none() {
                debug!("Delete for unknown entity {}", nid);
            }
            if self.my_id == Some(*nid) {
                info!("Own entity {} was removed", nid);
                self.my_id = None;
            }
        }

        for record in frame.creates() {
            match record.get(entity_fields::NID as usize).and_then(Value::as_u16) {
                Some(nid) => {
                    self.entities.insert(nid, record.clone());
                }
                None => warn!("Created entity with tag {} has no nid", record.tag),
            }
        }

        for update in frame.updates() {
            let Some(record) = self.entities.get_mut(&update.nid) else {
                debug!("Update for unknown entity {}", update.nid);
                continue;
            };
            if record.tag != update.tag {
                warn!(
                    "Update for entity {} has tag {}, expected {}",
                    update.nid, update.tag, record.tag
                );
                continue;
            }
            match record.values.get_mut(update.field as usize) {
                Some(slot) => *slot = update.value.clone(),
                None => warn!("Entity {} has no field {}", update.nid, update.field),
            }
        }

        for message in frame.messages() {
            match message {
                Message::Identity { my_id } => {
                    info!("Controlling entity {}", my_id);
                    self.my_id = Some(*my_id);
                }
                Message::ShotImpact { .. } => {
                    if self.impacts.len() == MAX_IMPACTS {
                        self.impacts.remove(0);
                    }
                    self.impacts.push(message.clone());
                }
            }
        }
    }

    pub fn entity(&self, nid: u16) -> Option<&Record> {
        self.entities.get(&nid)
    }

    pub fn entities(&self) -> impl Iterator<Item = (&u16, &Record)> {
        self.entities.iter()
    }

    pub fn nids(&self) -> Vec<u16> {
        self.entities.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn my_id(&self) -> Option<u16> {
        self.my_id
    }

    pub fn impacts(&self) -> &[Message] {
        &self.impacts
    }

    pub fn position(&self, nid: u16) -> Option<(f32, f32)> {
        let record = self.entities.get(&nid)?;
        let x = record.get(entity_fields::X as usize)?.as_f32()?;
        let y = record.get(entity_fields::Y as usize)?.as_f32()?;
        Some((x, y))
    }

    /// Forgets everything, e.g. after reconnecting.
    pub fn clear(&mut self) {
        self.entities.clear();
        self.my_id = None;
        self.impacts.clear();
    }
}

/// What handling one server frame produced
#[derive(Debug, Default, PartialEq)]
pub struct FrameOutcome {
    pub accepted: bool,
    pub denied: Option<String>,
    /// Engine messages to send back straight away.
    pub replies: Vec<EngineMessage>,
    pub reconciliation: Option<Reconciliation>,
    /// Answers to requests this client sent, in arrival order.
    pub responses: Vec<Response>,
}

/// Local game state: the mirror plus prediction for the own entity
///
/// The mirror only ever holds what the server sent. The predicted position of
/// the own entity is kept next to it and is what [`position`](Self::position)
/// reports.
pub struct ClientGame {
    pub mirror: Mirror,
    pub predictor: Predictor,
    pub input: InputManager,
    pub prediction_enabled: bool,
    predicted: Option<(f32, f32)>,
    /// request id -> endpoint
    pending_requests: BTreeMap<u32, u32>,
    last_server_tick: Option<u32>,
}

impl ClientGame {
    pub fn new() -> Self {
        Self {
            mirror: Mirror::new(),
            predictor: Predictor::new(),
            input: InputManager::new(),
            prediction_enabled: true,
            predicted: None,
            pending_requests: BTreeMap::new(),
            last_server_tick: None,
        }
    }

    pub fn last_server_tick(&self) -> Option<u32> {
        self.last_server_tick
    }

    /// Where the own entity is: the local prediction if there is one,
    /// otherwise the server's last word.
    pub fn position(&self) -> Option<(f32, f32)> {
        let nid = self.mirror.my_id()?;
        self.predicted.or_else(|| self.mirror.position(nid))
    }

    /// Sends `body` to `endpoint` with the next tick. The answer shows up in
    /// [`FrameOutcome::responses`] under the returned id.
    pub fn request(&mut self, endpoint: u32, body: impl Into<String>) -> u32 {
        let request_id = self.input.request(endpoint, body);
        self.pending_requests.insert(request_id, endpoint);
        request_id
    }

    /// Ids of requests still waiting for a response.
    pub fn pending_requests(&self) -> impl Iterator<Item = u32> + '_ {
        self.pending_requests.keys().copied()
    }

    /// Applies a frame from the server.
    ///
    /// A confirmed client tick is checked against the server's record of the
    /// own entity. On a mismatch the prediction is replaced by that record.
    pub fn handle_frame(&mut self, frame: &Frame) -> FrameOutcome {
        let mut outcome = FrameOutcome::default();
        let mut confirmed = None;
        for message in frame.engine_messages() {
            match message {
                EngineMessage::ConnectionAccepted => outcome.accepted = true,
                EngineMessage::ConnectionDenied { reason } => outcome.denied = Some(reason.clone()),
                EngineMessage::Ping { nonce } => {
                    outcome.replies.push(EngineMessage::Pong { nonce: *nonce })
                }
                EngineMessage::TickConfirm {
                    server_tick,
                    client_tick,
                } => {
                    self.last_server_tick = Some(*server_tick);
                    confirmed = Some(*client_tick);
                }
                other => debug!("Ignoring engine message {:?}", other),
            }
        }

        for response in frame.responses() {
            match self.pending_requests.remove(&response.request_id) {
                Some(endpoint) => {
                    debug!("Response to request {} (endpoint {})", response.request_id, endpoint);
                    outcome.responses.push(response.clone());
                }
                None => warn!("Response to unknown request {}", response.request_id),
            }
        }

        let me = self.mirror.my_id();
        self.mirror.apply(frame);
        let now = self.mirror.my_id();
        if now != me {
            // New or lost entity: nothing predicted for it yet
            self.predictor.clear();
            self.predicted = None;
            return outcome;
        }

        let (Some(nid), Some(tick)) = (now, confirmed) else {
            return outcome;
        };
        let Some(authoritative) = self.mirror.position(nid) else {
            return outcome;
        };
        let result = self.predictor.reconcile(tick, authoritative);
        if let Reconciliation::Corrected { x, y } = result {
            if self.predicted.is_some() {
                self.predicted = Some((x, y));
            }
        }
        outcome.reconciliation = Some(result);
        outcome
    }

    /// Builds the frame for the next local tick and predicts its movement.
    pub fn tick(&mut self, intent: &Intent, dt: f32) -> Frame {
        let input = self.input.next(intent, dt);

        if let Some((x, y)) = self.position() {
            let (x, y) = if self.prediction_enabled {
                let next = predict_position(x, y, &input.movement);
                self.predicted = Some(next);
                next
            } else {
                (x, y)
            };
            self.predictor.record(input.tick, input.movement, x, y);
        }

        let mut frame = Frame::new();
        frame.push(Section::Engine(vec![EngineMessage::ClientTick { tick: input.tick }]));
        frame.push(Section::Commands(input.commands));
        frame.push(Section::Requests(input.requests));
        frame
    }

    /// Drops all replicated and predicted state.
    pub fn reset(&mut self) {
        self.mirror.clear();
        self.predictor.clear();
        self.predicted = None;
        self.pending_requests.clear();
        self.last_server_tick = None;
    }
}

impl Default for ClientGame {
    fn default() -> Self {
        Self::new()
    }
}
