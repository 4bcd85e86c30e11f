//! Session log entries.
//!
//! Sessions report notable events as [`SessionLogEntry`] values. Each kind is
//! gated by a toggle in [`SessionLogConfig`](crate::config::SessionLogConfig);
//! enabled entries go to the server's observer and to `tracing`.

use std::fmt;
use std::net::SocketAddr;
use std::time::SystemTime;

use tracing::{debug, error, info, warn};

use crate::config::SessionLogConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionLogKind {
    /// Session enter/exit
    Sys,
    /// Command received
    In,
    /// Command sent
    Out,
    /// Business handler failure
    Unk,
    /// Unexpected socket or internal failure
    Crtcl,
    /// Command execution time
    Time,
}

impl SessionLogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionLogKind::Sys => "Sys",
            SessionLogKind::In => "In",
            SessionLogKind::Out => "Out",
            SessionLogKind::Unk => "Unk",
            SessionLogKind::Crtcl => "Crtcl",
            SessionLogKind::Time => "Time",
        }
    }

    /// Whether `config` lets this kind through
    pub fn enabled(self, config: &SessionLogConfig) -> bool {
        match self {
            SessionLogKind::Sys => config.system,
            SessionLogKind::In => config.normal_in,
            SessionLogKind::Out => config.normal_out,
            SessionLogKind::Unk => config.unknown_error,
            SessionLogKind::Crtcl => config.critical_error,
            SessionLogKind::Time => config.performance,
        }
    }
}

impl fmt::Display for SessionLogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SessionLogEntry {
    /// Hex form of the session token
    pub token: String,
    pub remote: SocketAddr,
    pub time: SystemTime,
    pub kind: SessionLogKind,
    pub message: String,
}

impl SessionLogEntry {
    pub fn new(
        token: impl Into<String>,
        remote: SocketAddr,
        kind: SessionLogKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            remote,
            time: SystemTime::now(),
            kind,
            message: message.into(),
        }
    }

    /// Mirror the entry to `tracing`
    pub fn emit(&self) {
        let token = self.token.as_str();
        let peer = self.remote;
        let detail = self.message.as_str();
        match self.kind {
            SessionLogKind::Crtcl => error!(token, %peer, detail, "Session critical error"),
            SessionLogKind::Unk => warn!(token, %peer, detail, "Session command failed"),
            SessionLogKind::Sys => info!(token, %peer, detail, "Session event"),
            kind => debug!(token, %peer, kind = kind.as_str(), detail, "Session traffic"),
        }
    }
}

impl fmt::Display for SessionLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.remote, self.token, self.kind, self.message)
    }
}
