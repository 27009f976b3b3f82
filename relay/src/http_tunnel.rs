//! HTTP long-poll transport
//!
//! One route, `/tunnel`, dispatched on the raw query string:
//!
//! - `connect` opens a tunnel and returns its UUID, plus a session token in
//!   the `Guacamole-Tunnel-Token` header.
//! - `read:<uuid>` waits for guacd data, then streams what is immediately
//!   available, ending with `0.;`. The browser re-issues the read at once.
//! - `write:<uuid>` forwards the request body to guacd.
//!
//! Reads and writes must echo the session token back in the same header.
//! A trailing `:<sequence>` on read and write is only there to defeat
//! caches and is ignored.

use std::io::Write;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{FromRequest, RawQuery, Request, State},
    http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Form,
};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use futures_util::StreamExt;
use guactunnel_shared::filter::{FilteredWriter, InternalInstructionFilter};
use guactunnel_shared::protocol::{Instruction, END_OF_INSTRUCTIONS};
use guactunnel_shared::{Error, Result, Status};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connect::TunnelRequest;
use crate::headers::{self, ContentEncoding};
use crate::tunnel::ReaderGuard;
use crate::tunnel_map::RegisteredTunnel;
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelCommand {
    Connect,
    Read(Uuid),
    Write(Uuid),
}

impl TunnelCommand {
    fn parse(query: &str) -> Result<Self> {
        if query == "connect" {
            return Ok(TunnelCommand::Connect);
        }

        let mut parts = query.splitn(3, ':');
        let op = parts.next().unwrap_or("");
        let uuid = parts.next().map(Uuid::parse_str);
        match (op, uuid) {
            ("read", Some(Ok(uuid))) => Ok(TunnelCommand::Read(uuid)),
            ("write", Some(Ok(uuid))) => Ok(TunnelCommand::Write(uuid)),
            ("read" | "write", _) => Err(Error::NotFound("No such tunnel.".into())),
            _ => Err(Error::bad_request("Invalid tunnel operation.")),
        }
    }
}

pub async fn tunnel_handler(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    request: Request,
) -> Response {
    let query = query.unwrap_or_default();
    let token = request
        .headers()
        .get(&headers::TUNNEL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let result = match TunnelCommand::parse(&query) {
        Ok(TunnelCommand::Connect) => connect(state, request).await,
        Ok(TunnelCommand::Read(uuid)) => {
            let accept = request
                .headers()
                .get(ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok());
            let encoding = ContentEncoding::negotiate(accept);
            read(state, uuid, token.as_deref(), encoding).await
        }
        Ok(TunnelCommand::Write(uuid)) => {
            write(state, uuid, token.as_deref(), request.into_body()).await
        }
        Err(e) => Err(e),
    };

    result.unwrap_or_else(|e| error_response(&query, &e))
}

/// Message safe to show the browser. Internal details stay in the log.
fn public_message(err: &Error) -> String {
    match err {
        Error::Client { .. }
        | Error::NotFound(_)
        | Error::ConnectionClosed(_)
        | Error::Upstream { .. } => err.to_string(),
        _ => "Internal server error.".to_string(),
    }
}

/// Turn an error raised before any data was sent into an HTTP response.
fn error_response(query: &str, err: &Error) -> Response {
    match err {
        Error::Client { .. } => info!("HTTP tunnel request \"{}\" rejected: {}", query, err),
        Error::NotFound(_) | Error::ConnectionClosed(_) => {
            debug!("HTTP tunnel request \"{}\": {}", query, err)
        }
        Error::Upstream { .. } => warn!("HTTP tunnel request \"{}\" failed: {}", query, err),
        _ => error!("HTTP tunnel request \"{}\" failed: {}", query, err),
    }

    let status = err.status();
    let message = public_message(err);
    let code = StatusCode::from_u16(status.http_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (code, message.clone()).into_response();
    headers::error_headers(response.headers_mut(), status, &message);
    response
}

async fn connect(state: AppState, request: Request) -> Result<Response> {
    let Form(parameters) = Form::<Vec<(String, String)>>::from_request(request, &state)
        .await
        .map_err(|e| Error::bad_request(e.body_text()))?;

    let tunnel = state
        .connector
        .connect(&TunnelRequest::from_pairs(parameters))
        .await?;
    state.metrics.tunnel_opened();
    let registered = state.tunnels.put(tunnel);
    let uuid = registered.tunnel().uuid();
    info!(
        "HTTP tunnel {} opened ({} active)",
        uuid,
        state.metrics.active_tunnels()
    );

    let token = match HeaderValue::from_str(registered.token()) {
        Ok(token) => token,
        Err(e) => {
            state.tunnels.close(&uuid, Status::ServerError);
            return Err(Error::Server(format!("Unusable tunnel token: {}", e)));
        }
    };
    let mut response = uuid.to_string().into_response();
    response
        .headers_mut()
        .insert(headers::TUNNEL_TOKEN_HEADER.clone(), token);
    headers::no_store(response.headers_mut());
    Ok(response)
}

/// Find an open tunnel and check the session token presented for it.
fn lookup(state: &AppState, uuid: &Uuid, token: Option<&str>) -> Result<Arc<RegisteredTunnel>> {
    let registered = state
        .tunnels
        .get(uuid)
        .ok_or_else(|| Error::NotFound("No such tunnel.".into()))?;
    if !registered.tunnel().is_open() {
        return Err(Error::NotFound("Tunnel is closed.".into()));
    }
    let Some(token) = token else {
        return Err(Error::bad_request(
            "The HTTP tunnel session token is required for all requests after connecting.",
        ));
    };
    if !registered.token_matches(token) {
        return Err(Error::bad_request("Invalid HTTP tunnel session token."));
    }
    Ok(registered)
}

async fn read(
    state: AppState,
    uuid: Uuid,
    token: Option<&str>,
    encoding: ContentEncoding,
) -> Result<Response> {
    let registered = lookup(&state, &uuid, token)?;
    let mut reader = registered.tunnel().acquire_reader().await;

    // Wait for the first message before committing to a response, so that
    // failures here still get a proper HTTP status.
    let first = match next_message(&registered, &mut reader).await {
        Ok(message) => message,
        Err(e) if e.is_connection_closed() => None,
        Err(e) => {
            state.tunnels.close(&uuid, e.status());
            return Err(e);
        }
    };

    let (tx, mut rx) = mpsc::channel::<std::io::Result<Bytes>>(16);
    tokio::spawn(stream_instructions(
        state,
        uuid,
        registered,
        reader,
        first,
        ResponseEncoder::new(encoding),
        tx,
    ));

    let body = Body::from_stream(futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)));
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    if let Some(value) = encoding.header_value() {
        headers.insert(CONTENT_ENCODING, value);
    }
    headers::no_cache(headers);
    Ok(response)
}

/// The next data to send toward the browser: relay-generated instructions
/// first, then guacd data. `None` once guacd ends the stream.
async fn next_message(
    registered: &RegisteredTunnel,
    reader: &mut ReaderGuard,
) -> Result<Option<(String, u64)>> {
    loop {
        let queued = registered.take_outbound().await;
        if !queued.is_empty() {
            let count = queued.len() as u64;
            let data = queued.iter().map(Instruction::encode).collect();
            return Ok(Some((data, count)));
        }

        tokio::select! {
            biased;
            _ = registered.outbound_ready() => continue,
            raw = reader.read_raw() => return Ok(raw?.map(|raw| (raw, 1))),
        }
    }
}

/// Write messages into the response until nothing more is immediately
/// available, then end it with `0.;`.
async fn stream_instructions(
    state: AppState,
    uuid: Uuid,
    registered: Arc<RegisteredTunnel>,
    mut reader: ReaderGuard,
    first: Option<(String, u64)>,
    mut encoder: ResponseEncoder,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
) {
    let tunnel = registered.tunnel().clone();
    let mut message = first;

    let outcome: Result<()> = async {
        loop {
            let Some((data, count)) = message.take() else {
                info!("HTTP tunnel {} reached end of stream", uuid);
                state.tunnels.close(&uuid, Status::Success);
                return Ok(());
            };

            encoder.write(&data)?;
            state.metrics.record_to_client(count, data.len() as u64);

            let available = reader.available();
            if !available {
                let chunk = encoder.flush()?;
                if tx.send(Ok(chunk)).await.is_err() {
                    return Err(Error::ConnectionClosed("Browser went away during read.".into()));
                }
            }

            // Another read request is waiting to take over
            if !available || tunnel.has_queued_readers() || !tunnel.is_open() {
                return Ok(());
            }

            message = next_message(&registered, &mut reader).await?;
        }
    }
    .await;

    if let Err(e) = outcome {
        if e.is_connection_closed() {
            debug!("HTTP tunnel {} closed: {}", uuid, e);
            state.tunnels.close(&uuid, Status::ResourceClosed);
        } else {
            warn!("HTTP tunnel {} failed: {}", uuid, e);
            state.tunnels.close(&uuid, e.status());
            let error = Instruction::error(&public_message(&e), e.status());
            if let Err(e) = encoder.write(&error.encode()) {
                debug!("Unable to report error to browser: {}", e);
            }
        }
    }

    drop(reader);
    let tail = encoder
        .write(END_OF_INSTRUCTIONS)
        .and_then(|_| encoder.finish());
    match tail {
        Ok(chunk) => {
            if tx.send(Ok(chunk)).await.is_err() {
                debug!("Browser went away before end of HTTP tunnel read {}", uuid);
            }
        }
        Err(e) => debug!("Unable to finish HTTP tunnel read {}: {}", uuid, e),
    }
}

async fn write(
    state: AppState,
    uuid: Uuid,
    token: Option<&str>,
    body: Body,
) -> Result<Response> {
    let registered = lookup(&state, &uuid, token)?;
    let tunnel = registered.tunnel().clone();

    let result: Result<()> = async {
        let mut writer = tunnel.acquire_writer().await?;
        let mut filtered = FilteredWriter::new(&mut *writer, InternalInstructionFilter::new());
        let mut body = body.into_data_stream();
        let (mut instructions, mut bytes) = (0u64, 0u64);

        while let Some(chunk) = body.next().await {
            let chunk = chunk
                .map_err(|e| Error::bad_request(format!("Unable to read request body: {}", e)))?;
            if !tunnel.is_open() {
                break;
            }
            instructions += filtered.write_raw(&chunk).await? as u64;
            bytes += chunk.len() as u64;

            let replies = filtered.filter_mut().take_replies();
            if !replies.is_empty() {
                state.metrics.pings_answered(replies.len() as u64);
                registered.push_outbound(replies).await;
            }
        }

        filtered.finish()?;
        state.metrics.record_to_server(instructions, bytes);
        Ok(())
    }
    .await;

    if let Err(e) = result {
        if !e.is_client_error() {
            state.tunnels.close(&uuid, e.status());
        }
        return Err(e);
    }

    let mut response = Response::new(Body::empty());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    headers::no_cache(headers);
    Ok(response)
}

/// Optional compression of a read response, flushed chunk by chunk.
enum ResponseEncoder {
    Identity(Vec<u8>),
    Gzip(GzEncoder<Vec<u8>>),
    Deflate(ZlibEncoder<Vec<u8>>),
}

impl ResponseEncoder {
    fn new(encoding: ContentEncoding) -> Self {
        match encoding {
            ContentEncoding::Identity => ResponseEncoder::Identity(Vec::new()),
            ContentEncoding::Gzip => {
                ResponseEncoder::Gzip(GzEncoder::new(Vec::new(), Compression::fast()))
            }
            ContentEncoding::Deflate => {
                ResponseEncoder::Deflate(ZlibEncoder::new(Vec::new(), Compression::fast()))
            }
        }
    }

    fn write(&mut self, data: &str) -> Result<()> {
        let result = match self {
            ResponseEncoder::Identity(buf) => {
                buf.extend_from_slice(data.as_bytes());
                Ok(())
            }
            ResponseEncoder::Gzip(enc) => enc.write_all(data.as_bytes()),
            ResponseEncoder::Deflate(enc) => enc.write_all(data.as_bytes()),
        };
        result.map_err(Error::Io)
    }

    /// Everything written so far, in a form the browser can decode now.
    fn flush(&mut self) -> Result<Bytes> {
        let buf = match self {
            ResponseEncoder::Identity(buf) => buf,
            ResponseEncoder::Gzip(enc) => {
                enc.flush()?;
                enc.get_mut()
            }
            ResponseEncoder::Deflate(enc) => {
                enc.flush()?;
                enc.get_mut()
            }
        };
        Ok(Bytes::from(std::mem::take(buf)))
    }

    fn finish(self) -> Result<Bytes> {
        let buf = match self {
            ResponseEncoder::Identity(buf) => buf,
            ResponseEncoder::Gzip(enc) => enc.finish()?,
            ResponseEncoder::Deflate(enc) => enc.finish()?,
        };
        Ok(Bytes::from(buf))
    }
}
