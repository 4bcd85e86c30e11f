use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

use crate::core::codec::CommandCodec;
use crate::core::command::{parse_error_payload, Command, ERROR_COMMAND_HASH, ERROR_COMMAND_NAME};
use crate::error::{ProtocolError, Result};
use crate::utils::rc4::StreamTransform;
use crate::utils::timeout::{with_timeout_error, DEFAULT_TIMEOUT};

/// Client side of a session connection.
///
/// Speaks the same frames as the server and can switch to the stream
/// transform once the server acknowledged it.
pub struct SessionClient {
    framed: Framed<TcpStream, CommandCodec>,
}

impl SessionClient {
    /// Connect with the default timeout
    #[instrument]
    pub async fn connect(addr: &str) -> Result<Self> {
        Self::connect_with_timeout(addr, DEFAULT_TIMEOUT).await
    }

    #[instrument]
    pub async fn connect_with_timeout(addr: &str, timeout: Duration) -> Result<Self> {
        let connecting = async { TcpStream::connect(addr).await.map_err(ProtocolError::from) };
        let stream = with_timeout_error(connecting, timeout).await?;
        stream.set_nodelay(true)?;
        debug!(%addr, "Connected");
        Ok(Self {
            framed: Framed::new(stream, CommandCodec::new()),
        })
    }

    pub async fn send(&mut self, command: Command) -> Result<()> {
        self.framed.send(command).await
    }

    /// Next frame from the server, error frames included
    pub async fn recv(&mut self) -> Result<Command> {
        match self.framed.next().await {
            Some(result) => result,
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Command> {
        with_timeout_error(self.recv(), timeout).await
    }

    /// Send `command` and wait for the next frame.
    ///
    /// An error frame becomes [`ProtocolError::CommandFailed`] carrying the
    /// server's message.
    pub async fn call(&mut self, command: Command) -> Result<Command> {
        self.send(command).await?;
        let reply = self.recv_timeout(DEFAULT_TIMEOUT).await?;
        if is_error_frame(&reply) {
            let (_, message) = parse_error_payload(&reply.payload)?;
            return Err(ProtocolError::CommandFailed(message));
        }
        Ok(reply)
    }

    /// Transform every byte sent from now on and every byte not yet decoded.
    ///
    /// Install it right after receiving the server's acknowledgement.
    pub fn set_transform(&mut self, transform: StreamTransform) {
        self.framed.codec_mut().set_transform(transform);
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.framed.get_ref().local_addr()?)
    }

    /// Close the write side and wait for the server to hang up
    pub async fn close(mut self) -> Result<()> {
        SinkExt::<Command>::close(&mut self.framed).await?;
        while let Some(frame) = self.framed.next().await {
            frame?;
        }
        Ok(())
    }
}

/// Whether `command` is the server's error reply
pub fn is_error_frame(command: &Command) -> bool {
    command.name == ERROR_COMMAND_NAME && command.hash == ERROR_COMMAND_HASH
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("peer", &self.framed.get_ref().peer_addr().ok())
            .field("transformed", &self.framed.codec().has_transform())
            .finish()
    }
}
