//! Instruction framing for the guacd wire protocol.
//!
//! An instruction is a list of elements, the first of which is the opcode.
//! Every element is written as `<length>.<bytes>`, where `<length>` is the
//! element's size in bytes. Elements are joined by `,` and the instruction is
//! terminated by `;`:
//!
//! ```text
//! 6.select,3.rdp;
//! 4.size,4.1024,3.768,2.96;
//! ```
//!
//! Since every element carries its own length, payloads may contain `,`, `;`
//! or `.` without escaping, and [`InstructionCodec`] can find instruction
//! boundaries without understanding what the instruction means. Decoded
//! frames are handed out as raw [`Bytes`] so the relay can forward them
//! untouched; [`Instruction::parse`] is only used where the handshake needs
//! to look inside.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Largest single instruction accepted from either side (64 KiB).
pub const MAX_INSTRUCTION_LEN: usize = 64 * 1024;

/// Longest accepted length prefix, in digits.
const MAX_LENGTH_DIGITS: usize = 10;

/// Errors produced while framing or parsing instructions.
#[derive(Debug, Error)]
pub enum InstructionError {
    #[error("malformed instruction: {0}")]
    Malformed(&'static str),
    #[error("instruction exceeds {MAX_INSTRUCTION_LEN} bytes")]
    TooLarge,
    #[error("instruction element is not valid UTF-8")]
    InvalidUtf8,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: String,
    pub args: Vec<String>,
}

impl Instruction {
    pub fn new<I, S>(opcode: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            opcode: opcode.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Encode into wire form, e.g. `4.size,4.1024,3.768;`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    fn encoded_len(&self) -> usize {
        std::iter::once(&self.opcode)
            .chain(&self.args)
            .map(|e| e.len() + digits(e.len()) + 2)
            .sum()
    }

    fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        for (i, element) in std::iter::once(&self.opcode).chain(&self.args).enumerate() {
            if i > 0 {
                dst.put_u8(b',');
            }
            dst.put_slice(element.len().to_string().as_bytes());
            dst.put_u8(b'.');
            dst.put_slice(element.as_bytes());
        }
        dst.put_u8(b';');
    }

    /// Parse exactly one complete instruction (including the trailing `;`).
    pub fn parse(frame: &[u8]) -> Result<Self, InstructionError> {
        let mut elements = Vec::new();
        let mut pos = 0;
        loop {
            let (start, end) = element_bounds(frame, pos)?;
            let value = std::str::from_utf8(&frame[start..end])
                .map_err(|_| InstructionError::InvalidUtf8)?;
            elements.push(value.to_owned());
            match frame[end] {
                b',' => pos = end + 1,
                b';' if end + 1 == frame.len() => break,
                b';' => return Err(InstructionError::Malformed("trailing data after ';'")),
                _ => return Err(InstructionError::Malformed("expected ',' or ';'")),
            }
        }
        let mut elements = elements.into_iter();
        let opcode = elements.next().unwrap_or_default();
        Ok(Self {
            opcode,
            args: elements.collect(),
        })
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let encoded = self.encode();
        f.write_str(&String::from_utf8_lossy(&encoded))
    }
}

/// Opcode of a single raw instruction frame, without parsing the rest.
pub fn opcode(frame: &[u8]) -> Result<&str, InstructionError> {
    let (start, end) = element_bounds(frame, 0)?;
    std::str::from_utf8(&frame[start..end]).map_err(|_| InstructionError::InvalidUtf8)
}

/// Split a buffer holding zero or more complete instructions into frames.
///
/// Fails if the buffer ends in the middle of an instruction.
pub fn frames(data: &[u8]) -> Result<Vec<&[u8]>, InstructionError> {
    let mut out = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let Some(len) = frame_len(rest)? else {
            return Err(InstructionError::Malformed("incomplete instruction"));
        };
        out.push(&rest[..len]);
        rest = &rest[len..];
    }
    Ok(out)
}

/// Locate the value of the element starting at `pos`, returning the value's
/// byte range. The byte at the returned `end` is the element terminator.
fn element_bounds(frame: &[u8], pos: usize) -> Result<(usize, usize), InstructionError> {
    let digits_end = frame[pos..]
        .iter()
        .position(|b| !b.is_ascii_digit())
        .map_or(frame.len(), |i| pos + i);
    if digits_end == pos || digits_end - pos > MAX_LENGTH_DIGITS {
        return Err(InstructionError::Malformed("invalid element length"));
    }
    if frame.get(digits_end) != Some(&b'.') {
        return Err(InstructionError::Malformed("expected '.' after length"));
    }
    let len = parse_len(&frame[pos..digits_end])?;
    let start = digits_end + 1;
    let end = start
        .checked_add(len)
        .ok_or(InstructionError::Malformed("element length overflow"))?;
    if end >= frame.len() {
        return Err(InstructionError::Malformed("truncated element"));
    }
    Ok((start, end))
}

/// Length of the first complete instruction in `buf`, or `None` if more
/// bytes are needed.
fn frame_len(buf: &[u8]) -> Result<Option<usize>, InstructionError> {
    let mut pos = 0;
    loop {
        let digits_end = match buf[pos..].iter().position(|b| !b.is_ascii_digit()) {
            Some(i) => pos + i,
            None if buf.len() - pos > MAX_LENGTH_DIGITS => {
                return Err(InstructionError::Malformed("invalid element length"));
            }
            None => return Ok(None),
        };
        if digits_end == pos || digits_end - pos > MAX_LENGTH_DIGITS {
            return Err(InstructionError::Malformed("invalid element length"));
        }
        if buf[digits_end] != b'.' {
            return Err(InstructionError::Malformed("expected '.' after length"));
        }
        let len = parse_len(&buf[pos..digits_end])?;
        if len > MAX_INSTRUCTION_LEN {
            return Err(InstructionError::TooLarge);
        }
        let end = digits_end + 1 + len;
        if end > MAX_INSTRUCTION_LEN {
            return Err(InstructionError::TooLarge);
        }
        let Some(&terminator) = buf.get(end) else {
            return Ok(None);
        };
        match terminator {
            b',' => pos = end + 1,
            b';' => return Ok(Some(end + 1)),
            _ => return Err(InstructionError::Malformed("expected ',' or ';'")),
        }
        if pos >= buf.len() {
            return Ok(None);
        }
    }
}

fn parse_len(digits: &[u8]) -> Result<usize, InstructionError> {
    digits.iter().try_fold(0usize, |acc, d| {
        acc.checked_mul(10)
            .and_then(|v| v.checked_add(usize::from(d - b'0')))
            .ok_or(InstructionError::Malformed("element length overflow"))
    })
}

fn digits(mut n: usize) -> usize {
    let mut count = 1;
    while n >= 10 {
        n /= 10;
        count += 1;
    }
    count
}

/// Codec for guacd instruction streams.
///
/// Decodes into raw frames (one complete instruction each, `;` included) and
/// encodes either parsed [`Instruction`]s or raw bytes that already carry
/// their own framing.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstructionCodec;

impl Decoder for InstructionCodec {
    type Item = Bytes;
    type Error = InstructionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, InstructionError> {
        if src.is_empty() {
            return Ok(None);
        }
        match frame_len(src)? {
            Some(len) => Ok(Some(src.split_to(len).freeze())),
            None if src.len() > MAX_INSTRUCTION_LEN => Err(InstructionError::TooLarge),
            None => Ok(None),
        }
    }
}

impl Encoder<Instruction> for InstructionCodec {
    type Error = InstructionError;

    fn encode(&mut self, item: Instruction, dst: &mut BytesMut) -> Result<(), InstructionError> {
        item.encode_into(dst);
        Ok(())
    }
}

impl Encoder<Bytes> for InstructionCodec {
    type Error = InstructionError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), InstructionError> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
