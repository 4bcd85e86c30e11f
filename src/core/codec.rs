//! # Command Codec
//!
//! `tokio_util` codec over the [`FramingStateMachine`], for use with
//! `Framed` streams on the client side and in tests.
//!
//! An optional [`StreamTransform`] is applied below the framing: outgoing
//! frames are transformed after encoding, incoming bytes are inverted exactly
//! once, in arrival order, before they reach the parser.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::command::Command;
use crate::core::framing::FramingStateMachine;
use crate::error::{ProtocolError, Result};
use crate::utils::rc4::StreamTransform;

#[derive(Debug, Default)]
pub struct CommandCodec {
    parser: FramingStateMachine,
    transform: Option<StreamTransform>,
    // Leading bytes of the read buffer that were already inverted
    inverted: usize,
}

impl CommandCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transform(transform: StreamTransform) -> Self {
        Self {
            transform: Some(transform),
            ..Self::default()
        }
    }

    /// Install a transform for every byte not yet decoded.
    ///
    /// Call it right after decoding the last untransformed frame: bytes
    /// already buffered behind that frame are inverted too.
    pub fn set_transform(&mut self, transform: StreamTransform) {
        self.transform = Some(transform);
        self.inverted = 0;
    }

    pub fn has_transform(&self) -> bool {
        self.transform.is_some()
    }
}

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>> {
        if let Some(transform) = self.transform.as_mut() {
            if src.len() > self.inverted {
                transform.inverse(&mut src[self.inverted..]);
            }
            self.inverted = src.len();
        }

        loop {
            let Some(shift) = self.parser.try_shift(src, 0, src.len())? else {
                return Ok(None);
            };
            src.advance(shift.position);
            self.inverted = self.inverted.saturating_sub(shift.position);
            if let Some(command) = shift.command {
                return Ok(Some(command));
            }
        }
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<()> {
        let start = dst.len();
        item.encode(dst)?;
        if let Some(transform) = self.transform.as_mut() {
            transform.transform(&mut dst[start..]);
        }
        Ok(())
    }
}
