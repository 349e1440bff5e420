//! Accept/deny decisions for connection attempts
//!
//! The hook is asynchronous and may take as long as it likes. The tick loop
//! never awaits it directly: the future runs on its own task and its verdict
//! comes back as a [`NetworkEvent::HandshakeResolved`](crate::network::NetworkEvent),
//! at which point the session's current state decides what happens.

use log::debug;
use shared::{protocol::PROTOCOL_VERSION, Handshake};
use std::future::Future;
use std::pin::Pin;

/// `Ok` admits the connection, `Err` carries the deny reason.
pub type Verdict = Result<(), String>;

pub type HandshakeFuture = Pin<Box<dyn Future<Output = Verdict> + Send>>;

pub trait HandshakeHook: Send + Sync {
    fn accept(&self, handshake: Handshake) -> HandshakeFuture;
}

pub fn parse_handshake(payload: &str) -> Result<Handshake, String> {
    serde_json::from_str(payload).map_err(|e| format!("malformed handshake: {}", e))
}

/// Admits any client speaking our protocol version, optionally requiring a
/// shared token.
#[derive(Debug, Clone, Default)]
pub struct DefaultHook {
    token: Option<String>,
}

impl DefaultHook {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    fn check(&self, handshake: &Handshake) -> Verdict {
        if handshake.protocol_version != PROTOCOL_VERSION {
            return Err(format!(
                "protocol version mismatch: server {}, client {}",
                PROTOCOL_VERSION, handshake.protocol_version
            ));
        }
        match &self.token {
            Some(expected) if *expected != handshake.token => Err("invalid token".to_string()),
            _ => Ok(()),
        }
    }
}

impl HandshakeHook for DefaultHook {
    fn accept(&self, handshake: Handshake) -> HandshakeFuture {
        let verdict = self.check(&handshake);
        debug!("Handshake {:?} -> {:?}", handshake, verdict);
        Box::pin(async move { verdict })
    }
}

/// Runs `hook` to completion on its own task.
///
/// A hook that panics counts as a deny.
pub async fn run_hook(future: HandshakeFuture) -> Verdict {
    match tokio::spawn(future).await {
        Ok(verdict) => verdict,
        Err(e) => Err(format!("handshake hook failed: {}", e)),
    }
}
