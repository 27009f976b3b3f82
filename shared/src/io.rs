//! Instruction-oriented reading and writing over async byte streams.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{Decoder, Frame};
use crate::protocol::Instruction;
use crate::{Error, Result};

const READ_CHUNK: usize = 8192;

/// Reads whole instructions from a stream.
///
/// `read` is cancel safe: all parse state lives in the reader, and the only
/// suspension point is a single buffered read from the underlying stream.
pub struct GuacamoleReader<R> {
    input: R,
    buffer: Vec<u8>,
    decoder: Decoder,
    /// Outcome of decoding the front of `buffer`, once there is one
    next: Option<Result<(Frame, usize)>>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> GuacamoleReader<R> {
    /// Reader for guacd data, without element limits.
    pub fn new(input: R) -> Self {
        Self::with_decoder(input, Decoder::unbounded())
    }

    pub fn with_decoder(input: R, decoder: Decoder) -> Self {
        Self {
            input,
            buffer: Vec::with_capacity(READ_CHUNK),
            decoder,
            next: None,
            eof: false,
        }
    }

    /// True if the next call to `read` will complete without waiting on the
    /// stream, i.e. a complete frame (or an error) is already buffered.
    pub fn available(&self) -> bool {
        self.eof || self.next.is_some()
    }

    /// Read the next instruction. `None` marks the end of the stream.
    pub async fn read(&mut self) -> Result<Option<Instruction>> {
        Ok(self.read_frame().await?.map(|frame| frame.instruction))
    }

    /// Read the next instruction in wire form, exactly as received.
    pub async fn read_raw(&mut self) -> Result<Option<String>> {
        Ok(self.read_frame().await?.map(|frame| frame.raw))
    }

    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(next) = self.next.take() {
                let (frame, len) = next?;
                self.buffer.drain(..len);
                self.scan();
                return Ok(Some(frame));
            }

            if self.eof {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Protocol(
                    "Stream ended in the middle of an instruction.".into(),
                ));
            }

            self.buffer.reserve(READ_CHUNK);
            let n = self
                .input
                .read_buf(&mut self.buffer)
                .await
                .map_err(Error::from_socket)?;
            if n == 0 {
                self.eof = true;
            } else {
                self.scan();
            }
        }
    }

    /// Continue decoding the buffered bytes, if no outcome is pending.
    fn scan(&mut self) {
        if self.next.is_none() {
            self.next = self.decoder.decode(&self.buffer).transpose();
        }
    }
}

/// Writes instructions to a stream. Not synchronized; see `Tunnel`.
pub struct GuacamoleWriter<W> {
    output: W,
}

impl<W: AsyncWrite + Unpin> GuacamoleWriter<W> {
    pub fn new(output: W) -> Self {
        Self { output }
    }

    pub async fn write_instruction(&mut self, instruction: &Instruction) -> Result<()> {
        self.write_raw(&instruction.encode()).await
    }

    /// Write already-framed data verbatim.
    pub async fn write_raw(&mut self, data: &str) -> Result<()> {
        self.output
            .write_all(data.as_bytes())
            .await
            .map_err(Error::from_socket)?;
        self.output.flush().await.map_err(Error::from_socket)
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.output.shutdown().await.map_err(Error::from_socket)
    }
}
