//! # Framing State Machine
//!
//! Incremental, pull-style parser turning a received byte stream into
//! [`Command`]s.
//!
//! ```text
//! AwaitNameLength -> AwaitName -> AwaitHash -> AwaitParamsLength -> AwaitParams
//!        ^                                                              |
//!        +---------------------------- emit ----------------------------+
//! ```
//!
//! Every [`FramingStateMachine::try_shift`] call performs at most one
//! transition. It returns `None` when the window holds too few bytes for the
//! current state; no bytes are consumed in that case, so the caller keeps the
//! tail and retries once more data arrived. Fields are copied out of the
//! buffer only when complete, which makes the result independent of how the
//! stream was chunked.

use bytes::Bytes;

use crate::core::command::{Command, MAX_NAME_LEN, MAX_PARAMS_LEN};
use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitNameLength,
    AwaitName(usize),
    AwaitHash,
    AwaitParamsLength,
    AwaitParams(usize),
}

/// Outcome of one successful transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shift {
    /// Buffer position after the consumed field
    pub position: usize,
    /// Set only on the terminal transition
    pub command: Option<Command>,
}

/// Per-connection frame parser
#[derive(Debug, Clone)]
pub struct FramingStateMachine {
    state: State,
    name: String,
    hash: u32,
}

impl Default for FramingStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl FramingStateMachine {
    pub fn new() -> Self {
        Self {
            state: State::AwaitNameLength,
            name: String::new(),
            hash: 0,
        }
    }

    /// Whether the parser sits between frames
    pub fn is_idle(&self) -> bool {
        self.state == State::AwaitNameLength
    }

    /// Try one transition over `buffer[position..position + available]`.
    ///
    /// Returns `Ok(None)` when more data is needed and an error when a length
    /// field is out of bounds or the name is not UTF-8. After an error the
    /// parser state is unspecified and the connection must be dropped.
    pub fn try_shift(
        &mut self,
        buffer: &[u8],
        position: usize,
        available: usize,
    ) -> Result<Option<Shift>> {
        let end = position
            .checked_add(available)
            .filter(|&end| end <= buffer.len())
            .ok_or_else(|| {
                ProtocolError::Custom(format!(
                    "window {position}+{available} exceeds buffer of {}",
                    buffer.len()
                ))
            })?;
        let window = &buffer[position..end];

        match self.state {
            State::AwaitNameLength => {
                let Some(raw) = read_i32(window) else {
                    return Ok(None);
                };
                let len = check_length(raw, MAX_NAME_LEN, "name")?;
                self.state = State::AwaitName(len);
                Ok(Some(Shift {
                    position: position + 4,
                    command: None,
                }))
            }
            State::AwaitName(len) => {
                if window.len() < len {
                    return Ok(None);
                }
                self.name = std::str::from_utf8(&window[..len])
                    .map_err(|e| {
                        ProtocolError::ProtocolViolation(format!("command name is not UTF-8: {e}"))
                    })?
                    .to_owned();
                self.state = State::AwaitHash;
                Ok(Some(Shift {
                    position: position + len,
                    command: None,
                }))
            }
            State::AwaitHash => {
                let Some(hash) = read_u32(window) else {
                    return Ok(None);
                };
                self.hash = hash;
                self.state = State::AwaitParamsLength;
                Ok(Some(Shift {
                    position: position + 4,
                    command: None,
                }))
            }
            State::AwaitParamsLength => {
                let Some(raw) = read_i32(window) else {
                    return Ok(None);
                };
                let len = check_length(raw, MAX_PARAMS_LEN, "params")?;
                self.state = State::AwaitParams(len);
                Ok(Some(Shift {
                    position: position + 4,
                    command: None,
                }))
            }
            State::AwaitParams(len) => {
                if window.len() < len {
                    return Ok(None);
                }
                let command = Command {
                    name: std::mem::take(&mut self.name),
                    hash: std::mem::replace(&mut self.hash, 0),
                    payload: Bytes::copy_from_slice(&window[..len]),
                };
                self.state = State::AwaitNameLength;
                Ok(Some(Shift {
                    position: position + len,
                    command: Some(command),
                }))
            }
        }
    }

    /// Run transitions over `buffer` until more data is needed.
    ///
    /// Returns the parsed commands and the number of bytes consumed. Bytes
    /// past the consumed count must be presented again on the next call.
    pub fn parse(&mut self, buffer: &[u8]) -> Result<(Vec<Command>, usize)> {
        let mut commands = Vec::new();
        let mut position = 0;
        while let Some(shift) = self.try_shift(buffer, position, buffer.len() - position)? {
            position = shift.position;
            if let Some(command) = shift.command {
                commands.push(command);
            }
        }
        Ok((commands, position))
    }
}

#[inline]
fn read_i32(window: &[u8]) -> Option<i32> {
    window
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .map(i32::from_le_bytes)
}

#[inline]
fn read_u32(window: &[u8]) -> Option<u32> {
    window
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

fn check_length(raw: i32, max: usize, field: &'static str) -> Result<usize> {
    match usize::try_from(raw) {
        Ok(len) if len <= max => Ok(len),
        _ => Err(ProtocolError::OversizedFrame {
            field,
            length: i64::from(raw),
        }),
    }
}
