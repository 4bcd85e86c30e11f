//! Per-session context handed to business handlers.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;

use crate::core::command::{Command, SessionCommand};
use crate::transport::session::{Session, SessionId};
use crate::utils::rc4::StreamTransform;

/// Identity of a session plus a handle back into it
#[derive(Clone)]
pub struct SessionContext {
    id: SessionId,
    token: [u8; 4],
    token_hex: String,
    remote: SocketAddr,
    handle: SessionHandle,
}

impl SessionContext {
    pub(crate) fn new(
        id: SessionId,
        token: [u8; 4],
        remote: SocketAddr,
        session: Weak<Session>,
    ) -> Self {
        Self {
            id,
            token,
            token_hex: token.iter().map(|b| format!("{b:02x}")).collect(),
            remote,
            handle: SessionHandle { session },
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.id
    }

    /// Random correlation token
    pub fn token(&self) -> [u8; 4] {
        self.token
    }

    /// Lowercase hex form of [`token`](Self::token)
    pub fn token_hex(&self) -> &str {
        &self.token_hex
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.id)
            .field("token", &self.token_hex)
            .field("remote", &self.remote)
            .finish()
    }
}

/// Non-owning reference to a session.
///
/// Every operation is a no-op once the session is gone.
#[derive(Clone)]
pub struct SessionHandle {
    session: Weak<Session>,
}

impl SessionHandle {
    /// The session itself, while it exists.
    ///
    /// Never call [`Session::stop`] on it from inside a command handler: `stop`
    /// waits for the command queue to drain, and the running handler is still
    /// part of it. Use [`quit`](Self::quit) there.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    /// Queue a server-initiated command behind everything already queued.
    ///
    /// Returns `false` if the session no longer runs.
    pub fn write_command(&self, command: Command) -> bool {
        match self.session.upgrade() {
            Some(session) => session.push_command(SessionCommand::Write(command)),
            None => false,
        }
    }

    /// Send pre-encoded bytes through the session's send queue
    pub fn send(
        &self,
        bytes: Bytes,
        done: impl FnOnce(std::io::Result<()>) + Send + 'static,
    ) -> bool {
        match self.session.upgrade() {
            Some(session) => {
                session.send(bytes, done);
                true
            }
            None => false,
        }
    }

    /// Ask the session to stop; the connection closes asynchronously
    pub fn quit(&self) {
        if let Some(session) = self.session.upgrade() {
            session.stop_async();
        }
    }

    /// Install the stream transform.
    ///
    /// Takes effect after the reply to the command being executed: that reply
    /// still goes out untransformed, every later byte in either direction is
    /// transformed.
    pub fn set_transform(&self, transform: StreamTransform) -> bool {
        match self.session.upgrade() {
            Some(session) => {
                session.set_transform(transform);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.session
            .upgrade()
            .map(|session| session.is_running())
            .unwrap_or(false)
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("alive", &(self.session.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_context() {
        let remote: SocketAddr = "127.0.0.1:9".parse().expect("addr");
        let ctx = SessionContext::new(3, [0xde, 0xad, 0x00, 0x01], remote, Weak::new());
        assert_eq!(ctx.token_hex(), "dead0001");
        assert_eq!(ctx.session_id(), 3);
        assert!(!ctx.handle().is_running());
        assert!(!ctx.handle().write_command(Command::new("Push", 1, Bytes::new())));
        ctx.handle().quit();
    }
}
