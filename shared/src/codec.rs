//! Incremental decoding of wire-framed instructions.
//!
//! Decoding works on a byte buffer that may hold zero, one, or several
//! frames, the last of which may be incomplete. A frame is only consumed
//! once it has been fully received and validated.

use crate::protocol::Instruction;
use crate::{Error, Result};

/// Maximum number of elements in an instruction received from a client.
pub const MAX_ELEMENTS: usize = 128;

/// Maximum length of one element, in codepoints, received from a client.
pub const MAX_ELEMENT_LENGTH: usize = 8192;

/// Lengths longer than this cannot be valid on any connection.
const MAX_LENGTH_DIGITS: usize = 10;

/// A complete frame taken off the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub instruction: Instruction,
    /// The exact bytes of the frame, as received.
    pub raw: String,
}

/// Limits applied while decoding, plus how far into the current frame
/// decoding has already got.
///
/// Between calls the buffer may only grow at the end, or lose whole frames
/// from the front as returned by `decode`. Work done on the bytes of an
/// incomplete frame is kept, so each byte is examined once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoder {
    max_elements: Option<usize>,
    max_element_length: Option<usize>,
    progress: Progress,
}

/// Position within an incomplete frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Progress {
    /// Next byte to examine, from the start of the frame
    pos: usize,
    elements: Vec<String>,
    content: Option<Content>,
}

/// Element whose length is known but whose content has not all arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Content {
    start: usize,
    /// Codepoints still to come
    remaining: usize,
}

impl Default for Decoder {
    /// The limits applied to data sent by browsers.
    fn default() -> Self {
        Self {
            max_elements: Some(MAX_ELEMENTS),
            max_element_length: Some(MAX_ELEMENT_LENGTH),
            progress: Progress::default(),
        }
    }
}

impl Decoder {
    /// No limits. Used for data received from guacd.
    pub fn unbounded() -> Self {
        Self {
            max_elements: None,
            max_element_length: None,
            progress: Progress::default(),
        }
    }

    /// Bytes of the current incomplete frame already validated.
    pub fn scanned(&self) -> usize {
        self.progress.pos
    }

    /// Forget any partially decoded frame.
    pub fn reset(&mut self) {
        self.progress = Progress::default();
    }

    /// Attempt to decode one frame from the start of `buf`.
    ///
    /// Returns the frame and the number of bytes it occupied, or `None` if
    /// `buf` does not yet hold a complete frame. After an error the decoder
    /// starts over.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Frame, usize)>> {
        if self.progress.pos > buf.len() {
            self.reset();
        }
        let result = self.resume(buf);
        if !matches!(result, Ok(None)) {
            self.reset();
        }
        result
    }

    fn resume(&mut self, buf: &[u8]) -> Result<Option<(Frame, usize)>> {
        let progress = &mut self.progress;
        loop {
            let content = match progress.content.as_mut() {
                Some(content) => content,
                None => {
                    if let Some(max) = self.max_elements {
                        if progress.elements.len() >= max {
                            return Err(Error::Protocol(
                                "Instruction contains too many elements.".into(),
                            ));
                        }
                    }
                    let Some((length, start)) = parse_length(buf, progress.pos)? else {
                        return Ok(None);
                    };
                    if let Some(max) = self.max_element_length {
                        if length > max {
                            return Err(Error::Protocol(
                                "Instruction exceeds maximum length.".into(),
                            ));
                        }
                    }
                    progress.pos = start;
                    progress.content.insert(Content {
                        start,
                        remaining: length,
                    })
                }
            };

            // Content: whole codepoints only
            while content.remaining > 0 {
                let Some(&lead) = buf.get(progress.pos) else {
                    return Ok(None);
                };
                let width = utf8_width(lead)?;
                if progress.pos + width > buf.len() {
                    return Ok(None);
                }
                progress.pos += width;
                content.remaining -= 1;
            }

            let Some(&terminator) = buf.get(progress.pos) else {
                return Ok(None);
            };
            let element = std::str::from_utf8(&buf[content.start..progress.pos])
                .map_err(|_| Error::Protocol("Element is not valid UTF-8.".into()))?;
            progress.elements.push(element.to_owned());
            progress.content = None;
            progress.pos += 1;

            match terminator {
                b',' => continue,
                b';' => break,
                _ => {
                    return Err(Error::Protocol(
                        "Element terminator of instruction was not ';' nor ','".into(),
                    ));
                }
            }
        }

        // Only ASCII framing and validated elements precede `pos`.
        let len = progress.pos;
        let raw = std::str::from_utf8(&buf[..len])
            .map_err(|_| Error::Protocol("Instruction is not valid UTF-8.".into()))?
            .to_owned();
        let instruction = Instruction::from_elements(std::mem::take(&mut progress.elements))
            .ok_or_else(|| Error::Protocol("Instruction has no elements.".into()))?;

        Ok(Some((Frame { instruction, raw }, len)))
    }

    /// Decode every complete frame in `buf`, draining them from it.
    /// An incomplete trailing frame is left in place.
    pub fn drain(&mut self, buf: &mut Vec<u8>) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        let mut consumed = 0;
        while let Some((frame, len)) = self.decode(&buf[consumed..])? {
            consumed += len;
            frames.push(frame);
        }
        buf.drain(..consumed);
        Ok(frames)
    }
}

/// Parse an element length, terminated by '.', starting at `pos`.
/// Returns the length and the offset just past the '.'.
fn parse_length(buf: &[u8], mut pos: usize) -> Result<Option<(usize, usize)>> {
    let mut length: usize = 0;
    let mut digits = 0;
    loop {
        let Some(&b) = buf.get(pos) else {
            return Ok(None);
        };
        pos += 1;
        match b {
            b'0'..=b'9' => {
                digits += 1;
                if digits > MAX_LENGTH_DIGITS {
                    return Err(Error::Protocol("Element length is too long.".into()));
                }
                length = length * 10 + (b - b'0') as usize;
            }
            b'.' if digits > 0 => return Ok(Some((length, pos))),
            b'.' => return Err(Error::Protocol("Element length is missing.".into())),
            _ => {
                return Err(Error::Protocol(
                    "Non-numeric character in element length.".into(),
                ))
            }
        }
    }
}

/// Byte width of the UTF-8 sequence introduced by `lead`.
fn utf8_width(lead: u8) -> Result<usize> {
    match lead {
        0x00..=0x7F => Ok(1),
        0xC2..=0xDF => Ok(2),
        0xE0..=0xEF => Ok(3),
        0xF0..=0xF4 => Ok(4),
        _ => Err(Error::Protocol("Element is not valid UTF-8.".into())),
    }
}
