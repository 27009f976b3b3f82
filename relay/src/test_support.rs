//! Helpers for endpoint tests: a connector backed by in-memory streams and
//! a relay served on a loopback port.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use guactunnel_shared::{Result, Status};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::config::RelayConfig;
use crate::connect::{TunnelConnector, TunnelRequest};
use crate::tunnel::Tunnel;
use crate::{app, AppState};

/// Hands the guacd end of every tunnel it opens to the test, or refuses
/// every request with a fixed status.
pub struct StubConnector {
    backends: mpsc::UnboundedSender<DuplexStream>,
    refuse_with: Option<Status>,
}

impl StubConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (backends, rx) = mpsc::unbounded_channel();
        (
            Self {
                backends,
                refuse_with: None,
            },
            rx,
        )
    }

    pub fn refusing(status: Status) -> Self {
        let (backends, _) = mpsc::unbounded_channel();
        Self {
            backends,
            refuse_with: Some(status),
        }
    }
}

#[async_trait]
impl TunnelConnector for StubConnector {
    async fn connect(&self, _request: &TunnelRequest) -> Result<Tunnel> {
        if let Some(status) = self.refuse_with {
            return Err(status.to_error("Connection refused by test."));
        }
        let (relay, guacd) = tokio::io::duplex(64 * 1024);
        let _ = self.backends.send(guacd);
        Ok(Tunnel::new(relay, Some("$stub".into())))
    }
}

/// Serve the relay on an ephemeral loopback port.
pub async fn spawn_relay(connector: StubConnector) -> (SocketAddr, AppState) {
    let state = AppState::new(&RelayConfig::default(), Arc::new(connector));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, state)
}
