use crate::core::command::{Command, MAX_NAME_LEN};
use crate::error::{ProtocolError, Result};
use crate::protocol::context::SessionContext;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Business dispatch boundary consumed by sessions.
///
/// Sessions never interpret payloads; they only ask whether a command exists
/// and hand it over for execution. Implementations are called from the shared
/// worker pool, one command at a time per session, concurrently across
/// sessions.
pub trait CommandTable: Send + Sync + 'static {
    fn has_command(&self, name: &str, hash: u32) -> bool;

    /// Run a command and return the reply payload.
    ///
    /// An error (or a panic) becomes an error reply; the session stays open.
    fn execute_command(
        &self,
        context: &SessionContext,
        name: &str,
        hash: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>>;

    /// Per-session gate evaluated after `has_command`
    fn command_allowed(&self, _context: &SessionContext, _name: &str) -> bool {
        true
    }

    /// Encode the error reply for `command_name`
    fn error_frame(&self, command_name: &str, message: &str) -> Command {
        Command::error(command_name, message)
    }
}

type HandlerFn = dyn Fn(&SessionContext, &[u8]) -> Result<Vec<u8>> + Send + Sync + 'static;

// name -> hash -> handler; names borrow as `str` so lookups never allocate
type HandlerMap = HashMap<Cow<'static, str>, HashMap<u32, Box<HandlerFn>>>;

/// Command table backed by a map of registered handlers, keyed by name and hash.
pub struct Dispatcher {
    handlers: Arc<RwLock<HandlerMap>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn register<F>(&self, name: &str, hash: u32, handler: F) -> Result<()>
    where
        F: Fn(&SessionContext, &[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        if name.len() > MAX_NAME_LEN {
            return Err(ProtocolError::OversizedFrame {
                field: "name",
                length: name.len() as i64,
            });
        }

        let mut handlers = self.handlers.write().map_err(|_| {
            ProtocolError::Custom("Failed to acquire write lock on dispatcher".to_string())
        })?;

        handlers
            .entry(Cow::Owned(name.to_string()))
            .or_default()
            .insert(hash, Box::new(handler));
        Ok(())
    }

    /// Register under a name known at compile time
    pub fn register_static<F>(&self, name: &'static str, hash: u32, handler: F) -> Result<()>
    where
        F: Fn(&SessionContext, &[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().map_err(|_| {
            ProtocolError::Custom("Failed to acquire write lock on dispatcher".to_string())
        })?;

        handlers
            .entry(Cow::Borrowed(name))
            .or_default()
            .insert(hash, Box::new(handler));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .map(|h| h.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispatch(
        &self,
        context: &SessionContext,
        name: &str,
        hash: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let handlers = self.handlers.read().map_err(|_| {
            ProtocolError::Custom("Failed to acquire read lock on dispatcher".to_string())
        })?;

        handlers
            .get(name)
            .and_then(|by_hash| by_hash.get(&hash))
            .ok_or_else(|| ProtocolError::CommandFailed(format!("no handler for {name}")))
            .and_then(|handler| handler(context, payload))
    }
}

impl CommandTable for Dispatcher {
    fn has_command(&self, name: &str, hash: u32) -> bool {
        self.handlers
            .read()
            .map(|h| h.get(name).is_some_and(|by_hash| by_hash.contains_key(&hash)))
            .unwrap_or(false)
    }

    fn execute_command(
        &self,
        context: &SessionContext,
        name: &str,
        hash: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        self.dispatch(context, name, hash, payload)
    }
}
