//! Per-instruction filtering of readers and writers.
//!
//! A filter sees every instruction passing through and either forwards it
//! (possibly rewritten) or drops it. Filters do no I/O of their own.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::codec::Decoder;
use crate::io::{GuacamoleReader, GuacamoleWriter};
use crate::protocol::{Instruction, PING_OPCODE};
use crate::{Error, Result};

pub trait InstructionFilter {
    /// Return the instruction to forward, or `None` to drop it.
    fn filter(&mut self, instruction: Instruction) -> Result<Option<Instruction>>;
}

impl<F> InstructionFilter for F
where
    F: FnMut(Instruction) -> Result<Option<Instruction>>,
{
    fn filter(&mut self, instruction: Instruction) -> Result<Option<Instruction>> {
        self(instruction)
    }
}

/// Consumes tunnel-internal instructions so they never reach guacd,
/// collecting the replies owed to `ping` requests.
#[derive(Debug, Default)]
pub struct InternalInstructionFilter {
    replies: Vec<Instruction>,
}

impl InternalInstructionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replies queued since the last call, in request order.
    pub fn take_replies(&mut self) -> Vec<Instruction> {
        std::mem::take(&mut self.replies)
    }
}

impl InstructionFilter for InternalInstructionFilter {
    fn filter(&mut self, instruction: Instruction) -> Result<Option<Instruction>> {
        if !instruction.is_internal() {
            return Ok(Some(instruction));
        }

        match instruction.args() {
            [command, nonce, ..] if command == PING_OPCODE => {
                self.replies.push(Instruction::internal(vec![
                    PING_OPCODE.to_string(),
                    nonce.clone(),
                ]));
            }
            args => debug!("Dropping internal instruction {:?}", args.first()),
        }
        Ok(None)
    }
}

/// Writer applying a filter to everything written through it.
///
/// Raw data may split instructions at arbitrary points; partial frames are
/// held until the rest arrives.
pub struct FilteredWriter<'a, W, F> {
    inner: &'a mut GuacamoleWriter<W>,
    filter: F,
    decoder: Decoder,
    pending: Vec<u8>,
}

impl<'a, W, F> FilteredWriter<'a, W, F>
where
    W: AsyncWrite + Unpin,
    F: InstructionFilter,
{
    /// Filtered writer for data received from a browser.
    pub fn new(inner: &'a mut GuacamoleWriter<W>, filter: F) -> Self {
        Self {
            inner,
            filter,
            decoder: Decoder::default(),
            pending: Vec::new(),
        }
    }

    pub async fn write_instruction(&mut self, instruction: Instruction) -> Result<()> {
        if let Some(instruction) = self.filter.filter(instruction)? {
            self.inner.write_instruction(&instruction).await?;
        }
        Ok(())
    }

    /// Write framed data, returning the number of instructions forwarded.
    /// Unchanged instructions are forwarded byte for byte.
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<usize> {
        self.pending.extend_from_slice(data);
        let frames = self.decoder.drain(&mut self.pending).map_err(|e| match e {
            Error::Protocol(message) => Error::bad_request(message),
            other => other,
        })?;

        let mut out = String::new();
        let mut forwarded = 0;
        for frame in frames {
            match self.filter.filter(frame.instruction.clone())? {
                Some(instruction) if instruction == frame.instruction => {
                    out.push_str(&frame.raw)
                }
                Some(instruction) => out.push_str(&instruction.encode()),
                None => continue,
            }
            forwarded += 1;
        }

        if !out.is_empty() {
            self.inner.write_raw(&out).await?;
        }
        Ok(forwarded)
    }

    /// Finish writing. Fails if data ended partway through an instruction.
    pub fn finish(self) -> Result<F> {
        if !self.pending.is_empty() {
            return Err(Error::bad_request("Incomplete instruction."));
        }
        Ok(self.filter)
    }

    pub fn filter_mut(&mut self) -> &mut F {
        &mut self.filter
    }
}

/// Reader applying a filter to everything read through it.
pub struct FilteredReader<R, F> {
    inner: GuacamoleReader<R>,
    filter: F,
}

impl<R, F> FilteredReader<R, F>
where
    R: AsyncRead + Unpin,
    F: InstructionFilter,
{
    pub fn new(inner: GuacamoleReader<R>, filter: F) -> Self {
        Self { inner, filter }
    }

    pub fn available(&self) -> bool {
        self.inner.available()
    }

    /// Read the next instruction the filter lets through.
    pub async fn read(&mut self) -> Result<Option<Instruction>> {
        while let Some(instruction) = self.inner.read().await? {
            if let Some(instruction) = self.filter.filter(instruction)? {
                return Ok(Some(instruction));
            }
        }
        Ok(None)
    }

    pub fn into_inner(self) -> GuacamoleReader<R> {
        self.inner
    }
}
