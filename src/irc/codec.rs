//! IRC line codec — frames a byte stream into IRC messages.
//!
//! Splits on line terminators (`\r\n` per RFC 2812, bare `\n` tolerated),
//! parses each line into a [`Message`], and serializes outgoing messages
//! with `\r\n` termination.
//!
//! Lines longer than [`MAX_LINE_LENGTH`] are not fatal: the decoder
//! discards through the next terminator and yields [`Frame::Overlong`] so
//! the session can reply `ERROR :Line too long` and keep reading.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::Message;

/// Maximum accepted line length, excluding the terminator.
/// RFC 2812 says 512 bytes; we accept up to 4096 to tolerate extensions.
pub const MAX_LINE_LENGTH: usize = 4096;

/// Codec error. Parse failures are not errors (blank and malformed lines
/// are skipped); only I/O-level problems surface here.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid utf-8 in stream")]
    InvalidUtf8,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A well-formed message.
    Message(Message),
    /// A line that exceeded [`MAX_LINE_LENGTH`]; its content was dropped.
    Overlong,
}

/// A tokio codec that frames IRC messages on line boundaries.
#[derive(Debug, Default)]
pub struct IrcCodec {
    /// Set while skipping the remainder of an oversized line.
    discarding: bool,
}

impl Decoder for IrcCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src.iter().position(|&b| b == b'\n');

            let Some(pos) = newline else {
                if self.discarding {
                    // Still inside the oversized line; drop what we have.
                    src.clear();
                    return Ok(None);
                }
                if src.len() > MAX_LINE_LENGTH {
                    self.discarding = true;
                    src.clear();
                    return Ok(Some(Frame::Overlong));
                }
                return Ok(None);
            };

            let line_bytes = src.split_to(pos);
            src.advance(1); // skip \n

            if self.discarding {
                // End of the oversized line; resume normal framing.
                self.discarding = false;
                continue;
            }

            let mut line = &line_bytes[..];
            if line.ends_with(b"\r") {
                line = &line[..line.len() - 1];
            }

            if line.len() > MAX_LINE_LENGTH {
                return Ok(Some(Frame::Overlong));
            }

            let text = std::str::from_utf8(line).map_err(|_| CodecError::InvalidUtf8)?;

            match Message::parse(text) {
                Ok(msg) => return Ok(Some(Frame::Message(msg))),
                // Blank or degenerate lines are skipped per the protocol.
                Err(_) => continue,
            }
        }
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire();
        dst.reserve(wire.len() + 2);
        dst.put_slice(wire.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
