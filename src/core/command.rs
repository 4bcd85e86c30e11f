//! # Command
//!
//! One protocol unit exchanged between client and server.
//!
//! ## Wire Format
//! All integers are little-endian.
//! ```text
//! [NameLen: i32] [Name: utf8] [Hash: u32] [ParamsLen: i32] [Params: bytes]
//! ```
//! `NameLen` must be in `0..=MAX_NAME_LEN` and `ParamsLen` in
//! `0..=MAX_PARAMS_LEN`. A frame outside those bounds is a protocol violation
//! and ends the connection without a reply.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Largest command name in bytes
pub const MAX_NAME_LEN: usize = 128;

/// Largest command payload in bytes
pub const MAX_PARAMS_LEN: usize = 8192;

/// Size of a session's fixed receive buffer
pub const RECEIVE_BUFFER_SIZE: usize = 8192;

/// Fixed part of a frame: name length, hash and params length
pub const FRAME_OVERHEAD: usize = 12;

/// Largest frame that passes the bounds checks
pub const MAX_FRAME_LEN: usize = FRAME_OVERHEAD + MAX_NAME_LEN + MAX_PARAMS_LEN;

/// Name of the server's error reply command
pub const ERROR_COMMAND_NAME: &str = "Error";

/// Hash of the server's error reply command
pub const ERROR_COMMAND_HASH: u32 = 0x1A6C_5F2E;

/// A parsed or outgoing command frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub hash: u32,
    pub payload: Bytes,
}

impl Command {
    pub fn new(name: impl Into<String>, hash: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            hash,
            payload: payload.into(),
        }
    }

    /// Build the error reply for `command_name`.
    ///
    /// Payload layout is `[len:i32][command name][len:i32][message]`. The
    /// message is cut at a character boundary so the frame always fits.
    pub fn error(command_name: &str, message: &str) -> Self {
        let name = truncate_utf8(command_name, MAX_PARAMS_LEN - 8);
        let room = MAX_PARAMS_LEN - 8 - name.len();
        let message = truncate_utf8(message, room);

        let mut payload = BytesMut::with_capacity(8 + name.len() + message.len());
        payload.put_i32_le(name.len() as i32);
        payload.put_slice(name.as_bytes());
        payload.put_i32_le(message.len() as i32);
        payload.put_slice(message.as_bytes());

        Self::new(ERROR_COMMAND_NAME, ERROR_COMMAND_HASH, payload.freeze())
    }

    /// Size of this command on the wire
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.name.len() + self.payload.len()
    }

    /// Check the frame bounds
    pub fn validate(&self) -> Result<()> {
        if self.name.len() > MAX_NAME_LEN {
            return Err(ProtocolError::OversizedFrame {
                field: "name",
                length: self.name.len() as i64,
            });
        }
        if self.payload.len() > MAX_PARAMS_LEN {
            return Err(ProtocolError::OversizedFrame {
                field: "params",
                length: self.payload.len() as i64,
            });
        }
        Ok(())
    }

    /// Append the encoded frame to `dst`
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        self.validate()?;
        dst.reserve(self.encoded_len());
        dst.put_i32_le(self.name.len() as i32);
        dst.put_slice(self.name.as_bytes());
        dst.put_u32_le(self.hash);
        dst.put_i32_le(self.payload.len() as i32);
        dst.put_slice(&self.payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Decode the payload of an error reply into `(command name, message)`
pub fn parse_error_payload(payload: &[u8]) -> Result<(String, String)> {
    let (name, rest) = read_string(payload)?;
    let (message, _) = read_string(rest)?;
    Ok((name, message))
}

fn read_string(buf: &[u8]) -> Result<(String, &[u8])> {
    let malformed = || ProtocolError::ProtocolViolation("malformed error payload".into());
    let len_bytes: [u8; 4] = buf.get(..4).ok_or_else(malformed)?.try_into().map_err(|_| malformed())?;
    let len = usize::try_from(i32::from_le_bytes(len_bytes)).map_err(|_| malformed())?;
    let text = buf.get(4..4 + len).ok_or_else(malformed)?;
    let text = String::from_utf8(text.to_vec()).map_err(|_| malformed())?;
    Ok((text, &buf[4 + len..]))
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Work item of a session's command queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// A command parsed from the client
    Read(Command),
    /// A command to send to the client
    Write(Command),
    /// Issue the next socket read
    ReadRaw,
    /// Terminal marker; nothing runs after it
    Quit,
}

impl SessionCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionCommand::Read(_) => "read",
            SessionCommand::Write(_) => "write",
            SessionCommand::ReadRaw => "read_raw",
            SessionCommand::Quit => "quit",
        }
    }
}
