//! WebSocket transport
//!
//! One socket per tunnel, speaking the `guacamole` sub-protocol. The first
//! message is an internal instruction carrying the tunnel UUID; after that,
//! text frames carry whole instructions in both directions.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use guactunnel_shared::filter::{FilteredWriter, InternalInstructionFilter};
use guactunnel_shared::protocol::Instruction;
use guactunnel_shared::{Error, Result, Status};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connect::TunnelRequest;
use crate::tunnel::Tunnel;
use crate::AppState;

pub const GUACAMOLE_PROTOCOL: &str = "guacamole";

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(parameters): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Response {
    if !offers_guacamole(&headers) {
        return (
            StatusCode::BAD_REQUEST,
            "WebSocket sub-protocol \"guacamole\" is required.",
        )
            .into_response();
    }

    let request = TunnelRequest::from_pairs(parameters);
    ws.protocols([GUACAMOLE_PROTOCOL])
        .on_upgrade(move |socket| handle_socket(socket, state, request))
}

fn offers_guacamole(headers: &HeaderMap) -> bool {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim() == GUACAMOLE_PROTOCOL)
}

/// Sending half of the socket, shared by the read loop and the inbound
/// handler. Closing takes the sink so nothing is sent after the close frame.
struct Outbound {
    sink: Mutex<Option<SplitSink<WebSocket, Message>>>,
}

impl Outbound {
    fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
        }
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| Error::ConnectionClosed("WebSocket is closed.".into()))?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| Error::ConnectionClosed(format!("WebSocket send failed: {}", e)))
    }

    /// Close with the given status. Only the first call sends anything.
    async fn close(&self, status: Status) {
        let Some(mut sink) = self.sink.lock().await.take() else {
            return;
        };
        let frame = CloseFrame {
            code: status.websocket_code(),
            reason: status.guacamole_code().to_string().into(),
        };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            debug!("Unable to close WebSocket: {}", e);
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, request: TunnelRequest) {
    let (sink, mut stream) = socket.split();
    let outbound = Arc::new(Outbound::new(sink));

    let tunnel = match state.connector.connect(&request).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            if e.is_client_error() {
                info!("WebSocket tunnel refused: {}", e);
            } else {
                warn!("WebSocket tunnel could not be opened: {}", e);
            }
            outbound.close(e.status()).await;
            return;
        }
    };
    state.metrics.tunnel_opened();
    let uuid = tunnel.uuid();
    info!(
        "WebSocket tunnel {} opened ({} active)",
        uuid,
        state.metrics.active_tunnels()
    );

    let announce = Instruction::internal(vec![uuid.to_string()]).encode();
    if let Err(e) = outbound.send_text(announce).await {
        debug!("WebSocket tunnel {} lost before start: {}", uuid, e);
        tunnel.close();
        state.metrics.tunnel_closed(Status::ResourceClosed);
        return;
    }

    let mut pump = tokio::spawn(read_loop(
        state.clone(),
        tunnel.clone(),
        outbound.clone(),
        state.websocket_buffer_size,
    ));
    let mut pump_status = None;
    let mut pump_done = false;

    let inbound_status = loop {
        tokio::select! {
            result = &mut pump => {
                pump_status = result.ok().flatten();
                pump_done = true;
                break None;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = forward(&state, &tunnel, &outbound, text).await {
                        if e.is_connection_closed() {
                            debug!("WebSocket tunnel {} closed: {}", uuid, e);
                            break Some(Status::Success);
                        }
                        warn!("WebSocket tunnel {} write failed: {}", uuid, e);
                        break Some(e.status());
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!("WebSocket tunnel {} received binary data", uuid);
                    break Some(Status::Unsupported);
                }
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket tunnel {} receive failed: {}", uuid, e);
                    break None;
                }
            }
        }
    };

    if let Some(status) = inbound_status {
        outbound.close(status).await;
    }
    tunnel.close();
    if !pump_done {
        pump_status = pump.await.ok().flatten();
    }

    let status = inbound_status.or(pump_status).unwrap_or(Status::Success);
    state.metrics.tunnel_closed(status);
    info!("WebSocket tunnel {} closed", uuid);
}

/// Forward one text frame to guacd, answering any pings it contains.
async fn forward(
    state: &AppState,
    tunnel: &Tunnel,
    outbound: &Outbound,
    text: String,
) -> Result<()> {
    let mut writer = tunnel.acquire_writer().await?;
    let mut filtered = FilteredWriter::new(&mut *writer, InternalInstructionFilter::new());
    let count = filtered.write_raw(text.as_bytes()).await?;
    let mut filter = filtered.finish()?;
    drop(writer);
    state.metrics.record_to_server(count as u64, text.len() as u64);

    let replies = filter.take_replies();
    state.metrics.pings_answered(replies.len() as u64);
    for reply in replies {
        outbound.send_text(reply.encode()).await?;
    }
    Ok(())
}

/// Relay guacd data to the socket until either side ends. Returns the status
/// to close with, or `None` if the socket went away first.
async fn read_loop(
    state: AppState,
    tunnel: Tunnel,
    outbound: Arc<Outbound>,
    buffer_size: usize,
) -> Option<Status> {
    let mut reader = tunnel.acquire_reader().await;
    let mut buffer = String::with_capacity(buffer_size);
    let mut pending = 0u64;

    let status = loop {
        match reader.read_raw().await {
            Ok(Some(raw)) => {
                buffer.push_str(&raw);
                pending += 1;

                // Batch while more is immediately available
                if reader.available() && buffer.len() < buffer_size {
                    continue;
                }
                state.metrics.record_to_client(pending, buffer.len() as u64);
                pending = 0;
                if let Err(e) = outbound.send_text(std::mem::take(&mut buffer)).await {
                    debug!("WebSocket tunnel {}: {}", tunnel.uuid(), e);
                    return None;
                }
            }
            Ok(None) => break Status::Success,
            Err(e) if e.is_connection_closed() => {
                debug!("Connection to guacd closed: {}", e);
                break Status::Success;
            }
            Err(e) => {
                warn!("WebSocket tunnel {} read failed: {}", tunnel.uuid(), e);
                break e.status();
            }
        }
    };

    if !buffer.is_empty() {
        state.metrics.record_to_client(pending, buffer.len() as u64);
        if let Err(e) = outbound.send_text(buffer).await {
            debug!("WebSocket tunnel {}: {}", tunnel.uuid(), e);
        }
    }
    outbound.close(status).await;
    Some(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{spawn_relay, StubConnector};
    use guactunnel_shared::io::GuacamoleReader;
    use tokio::io::AsyncWriteExt;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

    fn request(
        addr: std::net::SocketAddr,
        protocol: Option<&'static str>,
    ) -> tokio_tungstenite::tungstenite::handshake::client::Request {
        let mut request = format!("ws://{}/websocket-tunnel?GUAC_ID=desktop&GUAC_TYPE=c", addr)
            .into_client_request()
            .unwrap();
        if let Some(protocol) = protocol {
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(protocol));
        }
        request
    }

    fn close_code(message: Option<std::result::Result<WsMessage, WsError>>) -> (u16, String) {
        match message {
            Some(Ok(WsMessage::Close(Some(frame)))) => (frame.code.into(), frame.reason.into_owned()),
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[test]
    fn test_offers_guacamole() {
        let mut headers = HeaderMap::new();
        assert!(!offers_guacamole(&headers));
        headers.insert(SEC_WEBSOCKET_PROTOCOL, "chat, guacamole".parse().unwrap());
        assert!(offers_guacamole(&headers));
    }

    #[tokio::test]
    async fn test_refused_connect_closes_with_status() {
        let (addr, state) = spawn_relay(StubConnector::refusing(Status::ClientBadRequest)).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(request(addr, Some(GUACAMOLE_PROTOCOL)))
            .await
            .unwrap();

        // No UUID is announced before the close
        let (code, reason) = close_code(ws.next().await);
        assert_eq!(code, 4768);
        assert_eq!(reason, "768");
        assert_eq!(state.metrics.active_tunnels(), 0);
    }

    #[tokio::test]
    async fn test_missing_subprotocol_rejected() {
        let (connector, _backends) = StubConnector::new();
        let (addr, _state) = spawn_relay(connector).await;

        match tokio_tungstenite::connect_async(request(addr, None)).await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), 400),
            other => panic!("expected HTTP 400, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_relays_both_directions() {
        let (connector, mut backends) = StubConnector::new();
        let (addr, state) = spawn_relay(connector).await;
        let (mut ws, response) =
            tokio_tungstenite::connect_async(request(addr, Some(GUACAMOLE_PROTOCOL)))
                .await
                .unwrap();
        assert_eq!(response.headers()["sec-websocket-protocol"], GUACAMOLE_PROTOCOL);

        let announce = match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => text,
            other => panic!("expected UUID, got {:?}", other),
        };
        assert!(announce.starts_with("0.,36."));
        assert_eq!(announce.len(), "0.,36.;".len() + 36);

        let guacd = backends.recv().await.unwrap();
        let (guacd_read, mut guacd_write) = tokio::io::split(guacd);

        guacd_write.write_all(b"4.sync,1.0;").await.unwrap();
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => assert_eq!(text, "4.sync,1.0;"),
            other => panic!("expected sync, got {:?}", other),
        }

        // Pings are answered by the relay, never forwarded
        ws.send(WsMessage::Text("0.,4.ping,3.abc;".into())).await.unwrap();
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => assert_eq!(text, "0.,4.ping,3.abc;"),
            other => panic!("expected ping reply, got {:?}", other),
        }

        ws.send(WsMessage::Text("3.key,2.65,1.1;".into())).await.unwrap();
        let mut from_browser = GuacamoleReader::new(guacd_read);
        let inst = from_browser.read().await.unwrap().unwrap();
        assert_eq!(inst.encode(), "3.key,2.65,1.1;");
        assert_eq!(state.metrics.active_tunnels(), 1);

        // guacd hangs up: normal closure
        drop(guacd_write);
        drop(from_browser);
        let (code, reason) = close_code(ws.next().await);
        assert_eq!(code, 1000);
        assert_eq!(reason, "0");
    }
}
