//! Request/response endpoints
//!
//! A client sends `Request{requestId, endpoint, body}`. The handler registered
//! for `endpoint` gets the request body and a [`Reply`]; if it replies, a
//! `Response{requestId, body}` is queued for that client's next frame.
//! Bodies are JSON text on both sides.

use crate::error::ServerError;
use crate::session::ConnectionId;
use log::{error, warn};
use serde::Serialize;
use shared::{Request, Response};
use std::collections::HashMap;

pub const SERVER_INFO: u32 = 1;
pub const ECHO: u32 = 2;

/// What a handler may know about the caller and the server
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestContext {
    pub conn_id: ConnectionId,
    pub user_id: Option<u32>,
    pub tick: u32,
    pub tick_rate: u32,
    pub players: usize,
}

/// Reply callback for one request. Consumed by replying, so a handler answers
/// at most once.
pub struct Reply<'a> {
    request_id: u32,
    queue: &'a mut Vec<Response>,
}

impl Reply<'_> {
    pub fn send(self, body: impl Into<String>) {
        self.queue.push(Response {
            request_id: self.request_id,
            body: body.into(),
        });
    }

    /// Serialises `value` as the response body.
    pub fn json<T: Serialize>(self, value: &T) {
        match serde_json::to_string(value) {
            Ok(body) => self.send(body),
            Err(e) => error!("Failed to serialise response {}: {}", self.request_id, e),
        }
    }
}

pub type Handler = Box<dyn Fn(&RequestContext, &str, Reply<'_>) + Send + Sync>;

#[derive(Default)]
pub struct EndpointRegistry {
    handlers: HashMap<u32, Handler>,
}

#[derive(Debug, Serialize)]
struct ServerInfo {
    protocol_version: u32,
    tick_rate: u32,
    tick: u32,
    players: usize,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with `serverInfo` and `echo` installed.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.insert(SERVER_INFO, |ctx, _body, reply| {
            reply.json(&ServerInfo {
                protocol_version: shared::protocol::PROTOCOL_VERSION,
                tick_rate: ctx.tick_rate,
                tick: ctx.tick,
                players: ctx.players,
            })
        });
        registry.insert(ECHO, |_ctx, body, reply| reply.send(body));
        registry
    }

    pub fn register<F>(&mut self, endpoint: u32, handler: F) -> Result<(), ServerError>
    where
        F: Fn(&RequestContext, &str, Reply<'_>) + Send + Sync + 'static,
    {
        if self.handlers.contains_key(&endpoint) {
            return Err(ServerError::DuplicateEndpoint(endpoint));
        }
        self.insert(endpoint, handler);
        Ok(())
    }

    fn insert<F>(&mut self, endpoint: u32, handler: F)
    where
        F: Fn(&RequestContext, &str, Reply<'_>) + Send + Sync + 'static,
    {
        self.handlers.insert(endpoint, Box::new(handler));
    }

    /// Dispatches `request`, queueing any reply onto `queue`. Returns false
    /// for unknown endpoints, which are skipped with a warning.
    pub fn handle(&self, ctx: &RequestContext, request: &Request, queue: &mut Vec<Response>) -> bool {
        let Some(handler) = self.handlers.get(&request.endpoint) else {
            warn!(
                "Connection {} called unknown endpoint {}",
                ctx.conn_id, request.endpoint
            );
            return false;
        };
        handler(
            ctx,
            &request.body,
            Reply {
                request_id: request.request_id,
                queue,
            },
        );
        true
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
