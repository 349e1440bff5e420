//! WebSocket transport and the tick loop
//!
//! Socket tasks never touch simulation state. Each connection gets a reader
//! task that forwards binary frames as [`NetworkEvent`]s and a writer task
//! that drains an [`Outbound`] queue. The handshake hook runs on its own task
//! and reports back through the same event queue. [`Server::run`] is the
//! single consumer: it interleaves those events with fixed-rate ticks.

use crate::config::ServerConfig;
use crate::endpoints::{EndpointRegistry, RequestContext};
use crate::error::ServerError;
use crate::game::{Game, TickReport};
use crate::handshake::{parse_handshake, run_hook, DefaultHook, HandshakeHook, Verdict};
use crate::session::{ConnectionId, ConnectionState, HandshakeOutcome, Outbound, Session, SessionManager};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{
    decode_frame, encode_frame, standard_registry, Aabb, Command, EngineMessage, Frame, SchemaRegistry,
    Section,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Messages sent from connection tasks to the tick loop
#[derive(Debug)]
pub enum NetworkEvent {
    Opened {
        conn_id: ConnectionId,
        addr: Option<SocketAddr>,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    Packet {
        conn_id: ConnectionId,
        bytes: Vec<u8>,
    },
    Closed {
        conn_id: ConnectionId,
    },
    HandshakeResolved {
        conn_id: ConnectionId,
        verdict: Verdict,
    },
}

/// Authoritative server: sessions, world and the loop that drives them
pub struct Server {
    config: ServerConfig,
    registry: Arc<SchemaRegistry>,
    endpoints: Arc<EndpointRegistry>,
    hook: Arc<dyn HandshakeHook>,
    sessions: SessionManager,
    game: Game,
    events_tx: mpsc::UnboundedSender<NetworkEvent>,
    events_rx: mpsc::UnboundedReceiver<NetworkEvent>,
    next_conn_id: Arc<AtomicU64>,
    epoch: Instant,
    ping_nonce: u8,
}

impl Server {
    /// A server with the standard schema registry, the built-in endpoints
    /// and the default handshake hook.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let registry = Arc::new(standard_registry()?);
        let endpoints = Arc::new(EndpointRegistry::with_builtins());
        let hook = Arc::new(DefaultHook::new(config.handshake_token.clone()));
        Ok(Self::with_parts(config, registry, endpoints, hook))
    }

    pub fn with_parts(
        config: ServerConfig,
        registry: Arc<SchemaRegistry>,
        endpoints: Arc<EndpointRegistry>,
        hook: Arc<dyn HandshakeHook>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            sessions: SessionManager::new(config.max_clients),
            game: Game::new(&config),
            config,
            registry,
            endpoints,
            hook,
            events_tx,
            events_rx,
            next_conn_id: Arc::new(AtomicU64::new(1)),
            epoch: Instant::now(),
            ping_nonce: 0,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn game(&self) -> &Game {
        &self.game
    }

    pub fn game_mut(&mut self) -> &mut Game {
        &mut self.game
    }

    /// Producer side of the event queue, for transports.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<NetworkEvent> {
        self.events_tx.clone()
    }

    pub fn allocate_conn_id(&self) -> ConnectionId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Opens a connection backed by an in-process channel instead of a
    /// socket. The receiver sees exactly what a socket writer would.
    pub fn connect_local(&mut self) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
        let conn_id = self.allocate_conn_id();
        let (outbound, rx) = mpsc::unbounded_channel();
        self.handle_event(NetworkEvent::Opened {
            conn_id,
            addr: None,
            outbound,
        });
        (conn_id, rx)
    }

    pub fn handle_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Opened {
                conn_id,
                addr,
                outbound,
            } => {
                let view = Aabb::centered(0.0, 0.0, self.config.view_width, self.config.view_height);
                self.sessions.open(Session::new(conn_id, addr, view, outbound));
            }
            NetworkEvent::Packet { conn_id, bytes } => {
                if let Err(e) = self.handle_packet(conn_id, &bytes) {
                    warn!("Dropping connection {} after bad packet: {}", conn_id, e);
                    if let Err(e) = self.disconnect(conn_id) {
                        debug!("Disconnect of connection {} failed: {}", conn_id, e);
                    }
                }
            }
            NetworkEvent::Closed { conn_id } => {
                if let Err(e) = self.disconnect(conn_id) {
                    debug!("Close of connection {} ignored: {}", conn_id, e);
                }
            }
            NetworkEvent::HandshakeResolved { conn_id, verdict } => {
                self.resolve_handshake(conn_id, verdict);
            }
        }
    }

    /// Handles every event already queued without waiting.
    pub fn drain_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Waits for one event and handles it. False once every sender is gone.
    pub async fn process_next_event(&mut self) -> bool {
        match self.events_rx.recv().await {
            Some(event) => {
                self.handle_event(event);
                true
            }
            None => false,
        }
    }

    /// Everything that can go wrong with one inbound packet ends up in the
    /// returned error; the caller then drops the connection.
    fn handle_packet(&mut self, conn_id: ConnectionId, bytes: &[u8]) -> Result<(), ServerError> {
        let state = self
            .sessions
            .get(conn_id)
            .ok_or(ServerError::UnknownConnection(conn_id))?
            .state();
        if state == ConnectionState::Closed {
            return Err(ServerError::ConnectionClosed(conn_id));
        }

        let frame = decode_frame(&self.registry, bytes)?;
        if let Some(e) = &frame.discarded {
            warn!("Skipped the rest of a packet from connection {}: {}", conn_id, e);
        }
        for e in &frame.skipped {
            warn!("Skipped an item from connection {}: {}", conn_id, e);
        }

        for message in frame.engine_messages() {
            self.handle_engine_message(conn_id, message)?;
        }

        let ctx = RequestContext {
            conn_id,
            user_id: None,
            tick: self.game.tick(),
            tick_rate: self.config.tick_rate,
            players: self.game.player_count(),
        };
        // A denied handshake earlier in this packet removes the session
        let Some(session) = self.sessions.get_mut(conn_id) else {
            return Ok(());
        };
        let commands: Vec<Command> = frame.commands().cloned().collect();
        let mut requests = frame.requests().peekable();
        if !session.is_open() {
            if !commands.is_empty() || requests.peek().is_some() {
                warn!(
                    "Connection {} sent commands before its handshake completed",
                    conn_id
                );
            }
            return Ok(());
        }

        session.push_commands(commands);
        let ctx = RequestContext {
            user_id: session.user_id,
            ..ctx
        };
        for request in requests {
            self.endpoints
                .handle(&ctx, request, &mut session.response_queue);
        }
        Ok(())
    }

    fn handle_engine_message(
        &mut self,
        conn_id: ConnectionId,
        message: &EngineMessage,
    ) -> Result<(), ServerError> {
        let has_capacity = self.sessions.has_capacity();
        let session = self
            .sessions
            .get_mut(conn_id)
            .ok_or(ServerError::UnknownConnection(conn_id))?;

        match message {
            EngineMessage::ConnectionAttempt { handshake } => {
                if !session.begin_handshake() {
                    warn!("Connection {} repeated its ConnectionAttempt", conn_id);
                    return Ok(());
                }
                if !has_capacity {
                    self.deny(conn_id, "server full");
                    return Ok(());
                }
                match parse_handshake(handshake) {
                    Ok(handshake) => {
                        let future = self.hook.accept(handshake);
                        let events = self.events_tx.clone();
                        tokio::spawn(async move {
                            let verdict = run_hook(future).await;
                            let _ = events.send(NetworkEvent::HandshakeResolved { conn_id, verdict });
                        });
                    }
                    Err(reason) => self.deny(conn_id, &reason),
                }
            }
            EngineMessage::ClientTick { tick } => {
                if session.is_open() {
                    session.last_client_tick = Some(*tick);
                }
            }
            EngineMessage::Pong { nonce } => {
                if let Some(rtt) = session.record_pong(*nonce, Instant::now()) {
                    debug!("Connection {} round trip {:.1} ms", conn_id, rtt);
                }
            }
            other => {
                warn!("Connection {} sent unexpected {:?}", conn_id, other);
            }
        }
        Ok(())
    }

    fn resolve_handshake(&mut self, conn_id: ConnectionId, verdict: Verdict) {
        match self.sessions.complete_handshake(conn_id, verdict) {
            HandshakeOutcome::Accepted { .. } => {
                let Some(session) = self.sessions.get(conn_id) else {
                    return;
                };
                let view = session.view;
                self.send_now(conn_id, vec![EngineMessage::ConnectionAccepted]);
                self.game.join(conn_id, view);
            }
            HandshakeOutcome::Denied { reason } => self.deny(conn_id, &reason),
            HandshakeOutcome::Gone => {
                info!(
                    "Connection {} closed while its handshake was pending, denied",
                    conn_id
                );
            }
        }
    }

    /// Sends `ConnectionDenied`, closes the socket and forgets the session.
    fn deny(&mut self, conn_id: ConnectionId, reason: &str) {
        info!("Connection {} denied: {}", conn_id, reason);
        self.send_now(
            conn_id,
            vec![EngineMessage::ConnectionDenied {
                reason: reason.to_string(),
            }],
        );
        if let Some((session, _)) = self.sessions.close(conn_id) {
            session.send(Outbound::Close);
        }
    }

    /// Writes engine messages outside the tick's batched frame.
    fn send_now(&self, conn_id: ConnectionId, messages: Vec<EngineMessage>) {
        let Some(session) = self.sessions.get(conn_id) else {
            return;
        };
        let mut frame = Frame::new();
        frame.push(Section::Engine(messages));
        match encode_frame(&self.registry, &frame) {
            Ok(bytes) => {
                session.send(Outbound::Frame(bytes));
            }
            Err(e) => error!("Failed to encode engine frame for connection {}: {}", conn_id, e),
        }
    }

    /// Forgets a session and, if it was registered, its entity.
    pub fn disconnect(&mut self, conn_id: ConnectionId) -> Result<(), ServerError> {
        let (session, previous) = self
            .sessions
            .close(conn_id)
            .ok_or(ServerError::UnknownConnection(conn_id))?;
        session.send(Outbound::Close);
        if previous == ConnectionState::Open {
            self.game.leave(conn_id, session.entity_nid);
        }
        Ok(())
    }

    /// Runs one tick at `now_ms` and flushes a frame to every open session.
    pub fn tick(&mut self, now_ms: u64) -> TickReport {
        let dt = self.config.tick_duration().as_secs_f32();
        let report = self.game.step(&mut self.sessions, dt, now_ms);
        let tick = self.game.tick();
        let ping = tick % self.config.ping_interval_ticks == 0;

        let conn_ids: Vec<ConnectionId> = self.sessions.open_sessions().map(|s| s.conn_id).collect();
        for conn_id in conn_ids {
            let delta = self.game.channel.compute_delta(conn_id);
            let Some(session) = self.sessions.get_mut(conn_id) else {
                continue;
            };
            if ping {
                self.ping_nonce = self.ping_nonce.wrapping_add(1);
                session.start_ping(self.ping_nonce);
            }
            if let Some(client_tick) = session.last_client_tick {
                session.engine_queue.push(EngineMessage::TickConfirm {
                    server_tick: tick,
                    client_tick,
                });
            }

            let mut frame = Frame::new();
            frame.push(Section::Engine(std::mem::take(&mut session.engine_queue)));
            frame.push(Section::Messages(std::mem::take(&mut session.message_queue)));
            frame.push(Section::Creates(delta.created));
            frame.push(Section::Updates(delta.updated));
            frame.push(Section::Deletes(delta.deleted));
            frame.push(Section::Responses(std::mem::take(&mut session.response_queue)));
            if frame.is_empty() {
                continue;
            }
            match encode_frame(&self.registry, &frame) {
                Ok(bytes) => {
                    if !session.send(Outbound::Frame(bytes)) {
                        debug!("Writer for connection {} is gone", conn_id);
                    }
                }
                Err(e) => error!(
                    "Failed to encode tick {} frame for connection {}: {}",
                    tick, conn_id, e
                ),
            }
        }

        if tick % (self.config.tick_rate * 10) == 0 {
            debug!(
                "Tick {}: {} sessions, {} entities, {} snapshots",
                tick,
                self.sessions.open_count(),
                self.game.channel.entity_count(),
                self.game.historian.len()
            );
        }
        report
    }

    /// Listens for WebSocket clients and runs the tick loop forever.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Like [`run`](Self::run), but stops once `shutdown` completes and closes
    /// every connection on the way out.
    pub async fn run_until(
        mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(self.config.address()).await?;
        info!("Server listening on {}", listener.local_addr()?);
        self.spawn_acceptor(listener);

        let mut tick_interval = interval(self.config.tick_duration());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = tick_interval.tick() => {
                    let now_ms = self.epoch.elapsed().as_millis() as u64;
                    self.tick(now_ms);
                },
            }
        }

        info!("Server shutting down, closing {} connections", self.sessions.len());
        for conn_id in self.sessions.conn_ids() {
            if let Err(e) = self.disconnect(conn_id) {
                debug!("Close of connection {} on shutdown failed: {}", conn_id, e);
            }
        }
        Ok(())
    }

    fn spawn_acceptor(&self, listener: TcpListener) {
        let events = self.events_tx.clone();
        let next_conn_id = Arc::clone(&self.next_conn_id);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(serve_connection(stream, addr, conn_id, events.clone()));
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }
}

/// Pumps one WebSocket until either side closes it.
async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    conn_id: ConnectionId,
    events: mpsc::UnboundedSender<NetworkEvent>,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket upgrade from {} failed: {}", addr, e);
            return;
        }
    };
    let (mut write, mut read) = ws.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
    if events
        .send(NetworkEvent::Opened {
            conn_id,
            addr: Some(addr),
            outbound,
        })
        .is_err()
    {
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(item) = outbound_rx.recv().await {
            match item {
                Outbound::Frame(bytes) => {
                    if let Err(e) = write.send(WsMessage::Binary(bytes)).await {
                        debug!("Write to connection {} failed: {}", conn_id, e);
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = write.close().await;
                    break;
                }
            }
        }
    });

    while let Some(message) = read.next().await {
        match message {
            Ok(WsMessage::Binary(bytes)) => {
                if events.send(NetworkEvent::Packet { conn_id, bytes }).is_err() {
                    break;
                }
            }
            Ok(WsMessage::Text(_)) => {
                warn!("Connection {} sent a text frame, closing", conn_id);
                break;
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read from connection {} failed: {}", conn_id, e);
                break;
            }
        }
    }

    let _ = events.send(NetworkEvent::Closed { conn_id });
    writer.abort();
}
