//! guacd connection handshake.
//!
//! select -> args, then size/audio/video/image/timezone/connect -> ready.
//! Once `ready` arrives the stream carries ordinary protocol traffic.

use std::collections::HashMap;

use guactunnel_shared::io::{GuacamoleReader, GuacamoleWriter};
use guactunnel_shared::protocol::{Capability, Instruction, ProtocolVersion};
use guactunnel_shared::{Error, Result, Status};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// What the browser told us about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    pub audio_mimetypes: Vec<String>,
    pub video_mimetypes: Vec<String>,
    pub image_mimetypes: Vec<String>,
    pub timezone: Option<String>,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
            dpi: 96,
            audio_mimetypes: Vec::new(),
            video_mimetypes: Vec::new(),
            image_mimetypes: Vec::new(),
            timezone: None,
        }
    }
}

/// Outcome of a completed handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub connection_id: String,
    pub version: ProtocolVersion,
}

/// Perform the handshake for a new connection using `protocol`.
pub async fn handshake<R, W>(
    reader: &mut GuacamoleReader<R>,
    writer: &mut GuacamoleWriter<W>,
    protocol: &str,
    parameters: &HashMap<String, String>,
    info: &ClientInfo,
) -> Result<Handshake>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer
        .write_instruction(&Instruction::new("select", vec![protocol.to_string()]))
        .await?;

    let args = expect(reader, "args").await?;

    // guacd >= 1.1.0 leads with its protocol version
    let mut version = ProtocolVersion::V1_0_0;
    let mut values = Vec::with_capacity(args.args().len());
    for (i, name) in args.args().iter().enumerate() {
        if i == 0 {
            if let Some(offered) = ProtocolVersion::parse(name) {
                version = offered.min(ProtocolVersion::LATEST);
                values.push(version.to_string());
                continue;
            }
        }
        values.push(parameters.get(name).cloned().unwrap_or_default());
    }
    debug!("guacd wants {} arguments, protocol {}", values.len(), version);

    let mut handshake = vec![
        Instruction::new(
            "size",
            vec![info.width.to_string(), info.height.to_string(), info.dpi.to_string()],
        ),
        Instruction::new("audio", info.audio_mimetypes.clone()),
        Instruction::new("video", info.video_mimetypes.clone()),
        Instruction::new("image", info.image_mimetypes.clone()),
    ];
    if version.supports(Capability::TimezoneHandshake) {
        if let Some(timezone) = &info.timezone {
            handshake.push(Instruction::new("timezone", vec![timezone.clone()]));
        }
    }
    handshake.push(Instruction::new("connect", values));

    for instruction in &handshake {
        writer.write_instruction(instruction).await?;
    }

    let ready = expect(reader, "ready").await?;
    let connection_id = ready
        .args()
        .first()
        .cloned()
        .ok_or_else(|| Error::Server("No connection ID received".into()))?;

    Ok(Handshake {
        connection_id,
        version,
    })
}

/// Read the next instruction, which must have the given opcode.
async fn expect<R: AsyncRead + Unpin>(
    reader: &mut GuacamoleReader<R>,
    opcode: &str,
) -> Result<Instruction> {
    let instruction = reader.read().await?.ok_or_else(|| {
        Error::Server(format!("End of stream while waiting for \"{}\".", opcode))
    })?;

    match instruction.opcode() {
        op if op == opcode => Ok(instruction),
        "disconnect" => Err(Error::ConnectionClosed(format!(
            "Server disconnected while waiting for \"{}\".",
            opcode
        ))),
        "error" => Err(received_error(&instruction)),
        other => Err(Error::Server(format!(
            "Expected \"{}\" instruction but instead received \"{}\".",
            opcode, other
        ))),
    }
}

/// Translate an `error` instruction from guacd.
fn received_error(instruction: &Instruction) -> Error {
    let args = instruction.args();
    let message = args
        .first()
        .cloned()
        .unwrap_or_else(|| "Internal error within guacd / protocol handling.".into());

    let status = match args.get(1).map(|code| code.parse::<u16>()) {
        Some(Ok(code)) => Status::from_guacamole_code(code).unwrap_or_else(|| {
            debug!("Received \"error\" instruction with unknown status code {}", code);
            Status::ServerError
        }),
        Some(Err(_)) => {
            debug!("Received \"error\" instruction with non-numeric status code");
            Status::ServerError
        }
        None => Status::ServerError,
    };

    status.to_error(message)
}
