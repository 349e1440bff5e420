//! Connection lifecycle and per-session state
//!
//! Every open socket has a [`Session`]. It walks the state machine
//!
//! ```text
//! OpenPreHandshake -> OpenAwaitingHandshake -> Open -> Closed
//! ```
//!
//! and any state may jump to `Closed`, which is terminal. Only `Open` sessions
//! are registered: they hold a user id, take part in the interest channel and
//! may send commands.
//!
//! The [`SessionManager`] is owned by the tick loop. It is the only place that
//! allocates user ids, so the counter needs no synchronisation.

use log::info;
use shared::{Aabb, Command, EngineMessage, Message, Response};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    OpenPreHandshake,
    OpenAwaitingHandshake,
    Open,
    Closed,
}

/// What the tick loop asks a connection's writer task to do
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(Vec<u8>),
    Close,
}

/// Result of resolving a pending handshake against the current session state
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeOutcome {
    Accepted { user_id: u32 },
    Denied { reason: String },
    /// The session closed while the hook was running.
    Gone,
}

#[derive(Debug)]
pub struct Session {
    pub conn_id: ConnectionId,
    pub addr: Option<SocketAddr>,
    state: ConnectionState,
    /// Assigned once the handshake is accepted.
    pub user_id: Option<u32>,
    /// Entity this session controls, if it has spawned one.
    pub entity_nid: Option<u16>,
    /// Latest `ClientTick` the session reported.
    pub last_client_tick: Option<u16>,
    /// Measured round trip time.
    pub latency_ms: f32,
    pub view: Aabb,
    pending_commands: Vec<Command>,
    pub engine_queue: Vec<EngineMessage>,
    pub message_queue: Vec<Message>,
    pub response_queue: Vec<Response>,
    pending_ping: Option<(u8, Instant)>,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Session {
    pub fn new(
        conn_id: ConnectionId,
        addr: Option<SocketAddr>,
        view: Aabb,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            conn_id,
            addr,
            state: ConnectionState::OpenPreHandshake,
            user_id: None,
            entity_nid: None,
            last_client_tick: None,
            latency_ms: 0.0,
            view,
            pending_commands: Vec::new(),
            engine_queue: Vec::new(),
            message_queue: Vec::new(),
            response_queue: Vec::new(),
            pending_ping: None,
            tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// `OpenPreHandshake -> OpenAwaitingHandshake`. False from any other state.
    pub fn begin_handshake(&mut self) -> bool {
        if self.state != ConnectionState::OpenPreHandshake {
            return false;
        }
        self.state = ConnectionState::OpenAwaitingHandshake;
        true
    }

    /// Marks the session closed and returns the state it was in.
    pub fn close(&mut self) -> ConnectionState {
        std::mem::replace(&mut self.state, ConnectionState::Closed)
    }

    /// Queues bytes for the socket. Fails once the writer task is gone.
    pub fn send(&self, outbound: Outbound) -> bool {
        self.tx.send(outbound).is_ok()
    }

    /// Buffers commands in arrival order.
    pub fn push_commands(&mut self, commands: impl IntoIterator<Item = Command>) {
        self.pending_commands.extend(commands);
    }

    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.pending_commands)
    }

    pub fn pending_command_count(&self) -> usize {
        self.pending_commands.len()
    }

    /// Queues a `Ping` and remembers when it left.
    pub fn start_ping(&mut self, nonce: u8) {
        self.pending_ping = Some((nonce, Instant::now()));
        self.engine_queue.push(EngineMessage::Ping { nonce });
    }

    /// Matches a `Pong` against the outstanding ping and updates latency.
    ///
    /// Stale or unsolicited pongs are ignored.
    pub fn record_pong(&mut self, nonce: u8, now: Instant) -> Option<f32> {
        match self.pending_ping {
            Some((sent_nonce, sent_at)) if sent_nonce == nonce => {
                self.pending_ping = None;
                let rtt = now.saturating_duration_since(sent_at).as_secs_f32() * 1000.0;
                self.latency_ms = rtt;
                Some(rtt)
            }
            _ => None,
        }
    }

    /// Keeps the view's size and moves its centre.
    pub fn recentre_view(&mut self, x: f32, y: f32) {
        self.view = Aabb::centered(x, y, self.view.width(), self.view.height());
    }

    pub fn resize_view(&mut self, width: f32, height: f32, max_width: f32, max_height: f32) {
        if !(width.is_finite() && height.is_finite()) {
            return;
        }
        let (cx, cy) = self.view.center();
        self.view = Aabb::centered(
            cx,
            cy,
            width.clamp(1.0, max_width),
            height.clamp(1.0, max_height),
        );
    }
}

/// All live sessions, keyed by connection id
pub struct SessionManager {
    sessions: BTreeMap<ConnectionId, Session>,
    /// Next user id. Monotonic for the life of the process.
    next_user_id: u32,
    max_clients: usize,
}

impl SessionManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            sessions: BTreeMap::new(),
            next_user_id: 1,
            max_clients,
        }
    }

    /// Registers a freshly opened socket in `OpenPreHandshake`.
    pub fn open(&mut self, session: Session) {
        info!("Connection {} opened from {:?}", session.conn_id, session.addr);
        self.sessions.insert(session.conn_id, session);
    }

    pub fn get(&self, conn_id: ConnectionId) -> Option<&Session> {
        self.sessions.get(&conn_id)
    }

    pub fn get_mut(&mut self, conn_id: ConnectionId) -> Option<&mut Session> {
        self.sessions.get_mut(&conn_id)
    }

    /// Whether another session could be accepted right now.
    pub fn has_capacity(&self) -> bool {
        self.open_count() < self.max_clients
    }

    /// Resolves a handshake for `conn_id` using the state the session is in
    /// *now*, not when the hook started.
    pub fn complete_handshake(
        &mut self,
        conn_id: ConnectionId,
        verdict: Result<(), String>,
    ) -> HandshakeOutcome {
        let has_capacity = self.has_capacity();
        let Some(session) = self.sessions.get_mut(&conn_id) else {
            return HandshakeOutcome::Gone;
        };
        if session.state != ConnectionState::OpenAwaitingHandshake {
            return HandshakeOutcome::Gone;
        }

        match verdict {
            Ok(()) if has_capacity => {
                let user_id = self.next_user_id;
                self.next_user_id += 1;
                session.state = ConnectionState::Open;
                session.user_id = Some(user_id);
                info!("Connection {} accepted as user {}", conn_id, user_id);
                HandshakeOutcome::Accepted { user_id }
            }
            Ok(()) => HandshakeOutcome::Denied {
                reason: "server full".to_string(),
            },
            Err(reason) => HandshakeOutcome::Denied { reason },
        }
    }

    /// Removes the session, returning it with the state it was in before the
    /// close so the caller can tell whether it was ever registered.
    pub fn close(&mut self, conn_id: ConnectionId) -> Option<(Session, ConnectionState)> {
        let mut session = self.sessions.remove(&conn_id)?;
        let previous = session.close();
        if previous == ConnectionState::Open {
            info!(
                "User {:?} on connection {} disconnected",
                session.user_id, conn_id
            );
        }
        Some((session, previous))
    }

    pub fn open_sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values().filter(|s| s.is_open())
    }

    pub fn open_sessions_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut().filter(|s| s.is_open())
    }

    /// The session controlling `nid`, if any.
    pub fn owner_of(&mut self, nid: u16) -> Option<&mut Session> {
        self.sessions
            .values_mut()
            .find(|s| s.entity_nid == Some(nid))
    }

    pub fn open_count(&self) -> usize {
        self.open_sessions().count()
    }

    /// The user id the next accepted handshake will receive.
    pub fn peek_next_user_id(&self) -> u32 {
        self.next_user_id
    }

    /// Every tracked connection, in any state.
    pub fn conn_ids(&self) -> Vec<ConnectionId> {
        self.sessions.keys().copied().collect()
    }

    /// Returns the number of sockets, in any state
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
