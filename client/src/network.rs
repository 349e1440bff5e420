use crate::game::ClientGame;
use crate::input::Intent;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::protocol::PROTOCOL_VERSION;
use shared::{
    decode_frame, encode_frame, standard_registry, CodecError, EngineMessage, Frame, Handshake,
    SchemaRegistry, Section,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Patrol direction flips after this many ticks.
const PATROL_TICKS: u32 = 60;

/// Built-in endpoint describing the server.
const SERVER_INFO_ENDPOINT: u32 = 1;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid handshake payload: {0}")]
    Handshake(#[from] serde_json::Error),

    #[error("connection denied: {0}")]
    Denied(String),

    #[error("connection closed by server")]
    Closed,

    #[error("gave up after {0} reconnect attempts")]
    RetriesExhausted(u32),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub username: String,
    pub token: String,
    /// Reconnect attempts in a row before giving up.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Simulated round trip, half added to each direction.
    pub fake_latency_ms: u64,
    pub tick_rate: u32,
    pub prediction: bool,
    /// Walk left and right on its own instead of standing still.
    pub patrol: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            username: "player".to_string(),
            token: String::new(),
            max_attempts: 5,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
            fake_latency_ms: 0,
            tick_rate: 30,
            prediction: true,
            patrol: false,
        }
    }
}

/// Delay before reconnect attempt `attempt` (0-based): `base * 2^attempt`,
/// capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

fn patrol_intent(tick: u32) -> Intent {
    let right = (tick / PATROL_TICKS) % 2 == 0;
    Intent {
        left: !right,
        right,
        rotation: if right { 0.0 } else { std::f32::consts::PI },
        ..Default::default()
    }
}

pub struct Client {
    config: ClientConfig,
    registry: Arc<SchemaRegistry>,
    game: ClientGame,
    accepted: bool,
    ticks: u32,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let mut game = ClientGame::new();
        game.prediction_enabled = config.prediction;
        Ok(Client {
            config,
            registry: Arc::new(standard_registry()?),
            game,
            accepted: false,
            ticks: 0,
        })
    }

    pub fn game(&self) -> &ClientGame {
        &self.game
    }

    /// Plays until denied or until reconnecting has failed `max_attempts`
    /// times in a row. Each accepted session resets the count.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut attempt = 0;
        loop {
            let err = match self.session().await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if let ClientError::Denied(reason) = &err {
                error!("Server refused connection: {}", reason);
                return Err(err.into());
            }
            if self.accepted {
                attempt = 0;
            }
            if attempt >= self.config.max_attempts {
                return Err(ClientError::RetriesExhausted(attempt).into());
            }

            let delay = backoff_delay(attempt, self.config.base_backoff, self.config.max_backoff);
            attempt += 1;
            warn!(
                "Connection lost ({}), retrying in {:?} (attempt {}/{})",
                err, delay, attempt, self.config.max_attempts
            );
            self.game.reset();
            sleep(delay).await;
        }
    }

    async fn session(&mut self) -> Result<(), ClientError> {
        self.accepted = false;
        info!("Connecting to {}...", self.config.url);
        let (ws, _) = connect_async(self.config.url.as_str()).await?;
        let (mut write, mut read) = ws.split();

        let handshake = serde_json::to_string(&Handshake {
            protocol_version: PROTOCOL_VERSION,
            token: self.config.token.clone(),
        })?;
        let mut attempt = Frame::new();
        attempt.push(Section::Engine(vec![EngineMessage::ConnectionAttempt { handshake }]));
        self.send(&mut write, &attempt).await?;

        let dt = 1.0 / self.config.tick_rate.max(1) as f32;
        let mut ticker = interval(Duration::from_secs_f32(dt));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                message = read.next() => match message {
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        if self.config.fake_latency_ms > 0 {
                            sleep(Duration::from_millis(self.config.fake_latency_ms / 2)).await;
                        }
                        self.handle_bytes(&mut write, &bytes).await?;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Err(ClientError::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },

                _ = ticker.tick(), if self.accepted => {
                    self.ticks = self.ticks.wrapping_add(1);
                    let intent = if self.config.patrol {
                        patrol_intent(self.ticks)
                    } else {
                        Intent::default()
                    };
                    let frame = self.game.tick(&intent, dt);
                    self.send(&mut write, &frame).await?;
                }
            }
        }
    }

    async fn handle_bytes(&mut self, write: &mut WsSink, bytes: &[u8]) -> Result<(), ClientError> {
        let frame = decode_frame(&self.registry, bytes)?;
        if let Some(e) = &frame.discarded {
            warn!("Dropped the rest of a frame: {}", e);
        }
        for e in &frame.skipped {
            warn!("Skipped a frame item: {}", e);
        }

        let outcome = self.game.handle_frame(&frame);
        if let Some(reason) = outcome.denied {
            return Err(ClientError::Denied(reason));
        }
        if outcome.accepted {
            info!("Connected, joining as {}", self.config.username);
            self.accepted = true;
            self.game.input.join(&self.config.username);
            self.game.request(SERVER_INFO_ENDPOINT, "{}");
        }
        for response in &outcome.responses {
            info!("Response to request {}: {}", response.request_id, response.body);
        }
        if let Some(result) = outcome.reconciliation {
            debug!("Reconciled: {:?}", result);
        }
        if !outcome.replies.is_empty() {
            let mut reply = Frame::new();
            reply.push(Section::Engine(outcome.replies));
            self.send(write, &reply).await?;
        }
        Ok(())
    }

    async fn send(&self, write: &mut WsSink, frame: &Frame) -> Result<(), ClientError> {
        if self.config.fake_latency_ms > 0 {
            sleep(Duration::from_millis(self.config.fake_latency_ms / 2)).await;
        }
        let bytes = encode_frame(&self.registry, frame)?;
        write.send(WsMessage::Binary(bytes)).await?;
        Ok(())
    }
}
