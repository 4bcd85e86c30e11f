//! # Session
//!
//! Per-connection actor. A session owns its socket, a FIFO send queue, a FIFO
//! command queue and the framing parser for its receive buffer.
//!
//! ## Command loop
//! Everything a session does is a [`SessionCommand`]. `push_command` appends
//! to the queue and bumps a pending count; the push that moves the count from
//! zero to one schedules a step on the runtime. A step runs exactly one command
//! and, if more are pending, schedules the next step as a fresh task. Commands
//! of one session therefore run strictly in order and one at a time, while
//! steps of different sessions interleave freely on the shared pool.
//!
//! ## I/O
//! At most one read and one write are in flight. Reads fill a fixed buffer;
//! the parser consumes complete fields and the unconsumed tail is moved to the
//! front before the next read. Writes drain the send queue in order. When an
//! idle timeout is configured, a timer runs next to each pending operation and
//! stops the session when it fires.
//!
//! ## Shutdown
//! `stop_async` cancels the pending read, queues the terminal `Quit`, clears
//! the running flag and notifies the owner. `stop` additionally blocks until
//! the command queue has drained and in-flight writes have flushed (bounded by
//! the linger timeout), then releases the socket and the buffer. `stop` blocks
//! its thread and must never run inside the runtime that drives the session;
//! it hops to a helper thread when called from one.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::{ServerConfig, SessionLogConfig};
use crate::core::command::{Command, SessionCommand, MAX_PARAMS_LEN, RECEIVE_BUFFER_SIZE};
use crate::core::framing::FramingStateMachine;
use crate::error::{self, constants, ProtocolError, Result};
use crate::protocol::context::SessionContext;
use crate::protocol::dispatcher::CommandTable;
use crate::transport::log::{SessionLogEntry, SessionLogKind};
use crate::transport::off_runtime;
use crate::utils::guarded::GuardedCell;
use crate::utils::metrics::{Metrics, Timer};
use crate::utils::rc4::{Rc4, StreamTransform};
use crate::utils::signal::AutoResetSignal;
use crate::utils::worker_local::WorkerLocal;

pub type SessionId = u64;

/// Receiver of session lifecycle notifications
pub(crate) trait SessionOwner: Send + Sync {
    /// Called once, when the session begins stopping
    fn session_quit(&self, session: &Arc<Session>);

    fn session_log(&self, entry: SessionLogEntry);
}

/// Per-session settings derived from the server configuration
#[derive(Debug, Clone)]
pub(crate) struct SessionSettings {
    pub idle_timeout: Option<Duration>,
    pub max_bad_commands: u32,
    pub client_debug: bool,
    pub linger: Duration,
    pub log: SessionLogConfig,
}

impl From<&ServerConfig> for SessionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            idle_timeout: config.session_idle_timeout,
            max_bad_commands: config.max_bad_commands,
            client_debug: config.client_debug,
            linger: config.linger_timeout,
            log: config.session_log,
        }
    }
}

/// State shared by every session of one server
pub(crate) struct SessionEnv {
    pub runtime: Handle,
    pub table: Arc<dyn CommandTable>,
    pub settings: SessionSettings,
    pub metrics: Arc<Metrics>,
    /// Encode scratch buffer per worker thread
    pub scratch: WorkerLocal<GuardedCell<BytesMut>>,
}

impl SessionEnv {
    pub fn new(
        runtime: Handle,
        table: Arc<dyn CommandTable>,
        settings: SessionSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            runtime,
            table,
            settings,
            metrics,
            scratch: WorkerLocal::new(|| {
                GuardedCell::new(BytesMut::with_capacity(RECEIVE_BUFFER_SIZE))
            }),
        }
    }
}

#[derive(Default)]
struct CommandQueue {
    queue: VecDeque<SessionCommand>,
    // queued plus executing
    pending: usize,
}

type SendDone = Box<dyn FnOnce(io::Result<()>) + Send>;

struct SendRequest {
    bytes: Bytes,
    // outbound keystream that takes over after this frame
    activation: Option<Rc4>,
    done: Option<SendDone>,
}

#[derive(Default)]
struct SendQueue {
    queue: VecDeque<SendRequest>,
    writing: bool,
}

struct ReadState {
    half: Option<OwnedReadHalf>,
    buffer: Vec<u8>,
    fill: usize,
    parser: FramingStateMachine,
    inbound: Option<Rc4>,
}

struct WriteState {
    half: Option<OwnedWriteHalf>,
    outbound: Option<Rc4>,
}

pub struct Session {
    id: SessionId,
    token: [u8; 4],
    remote: SocketAddr,
    context: SessionContext,
    env: Arc<SessionEnv>,
    owner: Weak<dyn SessionOwner>,
    me: Weak<Session>,

    running: GuardedCell<bool>,
    started: AtomicBool,
    stopping: AtomicBool,
    torn_down: AtomicBool,

    commands: GuardedCell<CommandQueue>,
    commands_updated: AutoResetSignal,
    async_ops: AtomicUsize,
    async_ops_updated: AutoResetSignal,
    bad_commands: AtomicU32,

    reader: tokio::sync::Mutex<ReadState>,
    writer: tokio::sync::Mutex<WriteState>,
    sends: GuardedCell<SendQueue>,
    next_transform: GuardedCell<Option<StreamTransform>>,
    next_inbound: GuardedCell<Option<Rc4>>,

    read_cancel: CancellationToken,
    io_cancel: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        stream: TcpStream,
        env: Arc<SessionEnv>,
        owner: Weak<dyn SessionOwner>,
    ) -> io::Result<Arc<Self>> {
        let remote = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            trace!(error = %e, %remote, "Failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let token: [u8; 4] = rand::random();

        Ok(Arc::new_cyclic(|me: &Weak<Session>| Session {
            id,
            token,
            remote,
            context: SessionContext::new(id, token, remote, me.clone()),
            env,
            owner,
            me: me.clone(),
            running: GuardedCell::new(false),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            commands: GuardedCell::default(),
            commands_updated: AutoResetSignal::new(),
            async_ops: AtomicUsize::new(0),
            async_ops_updated: AutoResetSignal::new(),
            bad_commands: AtomicU32::new(0),
            reader: tokio::sync::Mutex::new(ReadState {
                half: Some(read_half),
                buffer: vec![0u8; RECEIVE_BUFFER_SIZE],
                fill: 0,
                parser: FramingStateMachine::new(),
                inbound: None,
            }),
            writer: tokio::sync::Mutex::new(WriteState {
                half: Some(write_half),
                outbound: None,
            }),
            sends: GuardedCell::default(),
            next_transform: GuardedCell::new(None),
            next_inbound: GuardedCell::new(None),
            read_cancel: CancellationToken::new(),
            io_cancel: CancellationToken::new(),
        }))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn token(&self) -> [u8; 4] {
        self.token
    }

    pub fn token_hex(&self) -> &str {
        self.context.token_hex()
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn is_running(&self) -> bool {
        self.running.check(|running| *running)
    }

    /// Unrecognized commands received so far
    pub fn bad_command_count(&self) -> u32 {
        self.bad_commands.load(Ordering::Acquire)
    }

    /// Commands queued or executing
    pub fn pending_commands(&self) -> usize {
        self.commands.check(|q| q.pending)
    }

    fn arc(&self) -> Option<Arc<Session>> {
        self.me.upgrade()
    }

    /// Begin serving: mark running and queue the first read.
    ///
    /// A session starts at most once.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ProtocolError::AlreadyRunning);
        }
        self.running.replace(true);
        self.log(SessionLogKind::Sys, || "SessionEnter".to_string());
        debug!(session_id = self.id, token = self.token_hex(), peer = %self.remote, "Session started");
        self.push_command(SessionCommand::ReadRaw);
        Ok(())
    }

    /// Append a command to the queue.
    ///
    /// Returns `false` if the session no longer runs and the command was
    /// dropped.
    pub fn push_command(&self, command: SessionCommand) -> bool {
        let scheduled = self.running.check(|running| {
            if !*running {
                return None;
            }
            Some(self.commands.mutate(|q| {
                q.queue.push_back(command);
                q.pending += 1;
                q.pending == 1
            }))
        });

        match scheduled {
            Some(true) => {
                self.commands_updated.set();
                self.schedule_step();
                true
            }
            Some(false) => {
                self.commands_updated.set();
                true
            }
            None => false,
        }
    }

    /// Queue a command for the client behind everything already queued
    pub fn write_command(&self, command: Command) -> bool {
        self.push_command(SessionCommand::Write(command))
    }

    fn schedule_step(&self) {
        let Some(me) = self.arc() else {
            return;
        };
        self.env.runtime.spawn(async move {
            me.run_step();
        });
    }

    fn run_step(&self) {
        let Some(command) = self.commands.mutate(|q| q.queue.pop_front()) else {
            return;
        };

        let kind = command.kind();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.execute(command))) {
            self.critical(format!("{kind} step panicked: {}", panic_message(&*panic)));
            self.stop_async();
        }

        let more = self.commands.mutate(|q| {
            q.pending -= 1;
            q.pending > 0
        });
        self.commands_updated.set();
        if more {
            self.schedule_step();
        }
    }

    fn execute(&self, command: SessionCommand) {
        // Only writes and the terminal marker run after the session stopped
        if !self.is_running()
            && !matches!(command, SessionCommand::Write(_) | SessionCommand::Quit)
        {
            return;
        }

        match command {
            SessionCommand::Read(command) => self.read_command(command),
            SessionCommand::Write(command) => self.write_frame(command, None),
            SessionCommand::ReadRaw => self.read_raw(),
            SessionCommand::Quit => {
                trace!(session_id = self.id, "Quit reached the command queue");
            }
        }
    }

    fn read_command(&self, command: Command) {
        let max_bad = self.env.settings.max_bad_commands;
        if max_bad != 0 && self.bad_commands.load(Ordering::Acquire) > max_bad {
            return;
        }

        let Command {
            name,
            hash,
            payload,
        } = command;
        let table = &self.env.table;

        if table.has_command(&name, hash) && table.command_allowed(&self.context, &name) {
            let timer = Timer::start("execute_command");
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                table.execute_command(&self.context, &name, hash, &payload)
            }));
            let elapsed_ms = timer.elapsed_ms();
            drop(timer);
            self.log(SessionLogKind::Time, || format!("{name} Time {elapsed_ms}ms"));

            let result = match outcome {
                Ok(result) => result,
                Err(panic) => Err(ProtocolError::CommandFailed(format!(
                    "handler panicked: {}",
                    panic_message(&*panic)
                ))),
            }
            .and_then(|reply| {
                if reply.len() > MAX_PARAMS_LEN {
                    Err(ProtocolError::OversizedFrame {
                        field: "params",
                        length: reply.len() as i64,
                    })
                } else {
                    Ok(reply)
                }
            });

            match result {
                Ok(reply) => {
                    let activation = self.next_transform.take().map(|transform| {
                        let (outbound, inbound) = transform.split();
                        self.next_inbound.replace(Some(inbound));
                        outbound
                    });
                    self.write_frame(Command::new(name, hash, reply), activation);
                }
                Err(e) => {
                    self.next_transform.take();
                    self.raise_unknown_error(&name, &e);
                }
            }
        } else {
            let bad = self.bad_commands.fetch_add(1, Ordering::AcqRel) + 1;
            self.env.metrics.bad_command();
            if max_bad != 0 && bad > max_bad {
                self.raise_error(&name, constants::ERR_TOO_MANY_BAD_COMMANDS);
                self.stop_async();
            } else {
                self.raise_error(&name, constants::ERR_NOT_RECOGNIZED);
            }
        }
    }

    /// Send the table's error frame for `command_name`
    pub fn raise_error(&self, command_name: &str, message: &str) {
        let frame = self.env.table.error_frame(command_name, message);
        self.write_frame(frame, None);
    }

    fn raise_unknown_error(&self, command_name: &str, err: &ProtocolError) {
        self.env.metrics.business_error();
        let detail = format!("{command_name}: {err}");
        if self.env.settings.client_debug {
            self.raise_error(command_name, &err.to_string());
        } else {
            self.raise_error(command_name, constants::ERR_INTERNAL_SERVER_ERROR);
        }
        self.log(SessionLogKind::Unk, || detail);
    }

    fn encode(&self, command: &Command) -> Result<Bytes> {
        let scratch = self.env.scratch.get();
        scratch.mutate(|buf| -> Result<Bytes> {
            buf.clear();
            command.encode(buf)?;
            Ok(buf.split().freeze())
        })
    }

    fn write_frame(&self, command: Command, activation: Option<Rc4>) {
        match self.encode(&command) {
            Ok(frame) => {
                self.log(SessionLogKind::Out, || {
                    format!("{} 0x{:08X} {} bytes", command.name, command.hash, command.payload.len())
                });
                self.env.metrics.command_sent(frame.len() as u64);
                self.enqueue_send(SendRequest {
                    bytes: frame,
                    activation,
                    done: None,
                });
            }
            Err(e) => {
                self.critical(format!("failed to encode {}: {e}", command.name));
                self.stop_async();
            }
        }
    }

    /// Queue raw bytes for writing.
    ///
    /// Requests are written one at a time in call order; `done` runs once the
    /// bytes reached the socket or the write failed. A failed write stops the
    /// session.
    pub fn send(&self, bytes: Bytes, done: impl FnOnce(io::Result<()>) + Send + 'static) {
        self.enqueue_send(SendRequest {
            bytes,
            activation: None,
            done: Some(Box::new(done)),
        });
    }

    fn enqueue_send(&self, request: SendRequest) {
        let start = self.sends.mutate(|s| {
            s.queue.push_back(request);
            !std::mem::replace(&mut s.writing, true)
        });
        if !start {
            return;
        }
        let Some(me) = self.arc() else {
            return;
        };
        self.lock_async_op();
        self.env.runtime.spawn(async move {
            me.drain_sends().await;
            me.release_async_op();
        });
    }

    async fn drain_sends(&self) {
        loop {
            let next = self.sends.mutate(|s| {
                let next = s.queue.pop_front();
                if next.is_none() {
                    s.writing = false;
                }
                next
            });
            let Some(request) = next else {
                return;
            };

            let SendRequest {
                bytes,
                activation,
                done,
            } = request;
            let result = self.write_bytes(bytes, activation).await;
            if let Err(e) = &result {
                self.socket_fault("write", e);
            }
            if let Some(done) = done {
                done(result);
            }
        }
    }

    async fn write_bytes(&self, bytes: Bytes, activation: Option<Rc4>) -> io::Result<()> {
        let mut state = self.writer.lock().await;
        let WriteState { half, outbound } = &mut *state;
        let Some(half) = half.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                constants::ERR_CONNECTION_CLOSED,
            ));
        };

        let result = match outbound.as_mut() {
            Some(keystream) => {
                let mut data = bytes.to_vec();
                keystream.apply(&mut data);
                self.guard_io(half.write_all(&data)).await
            }
            None => self.guard_io(half.write_all(&bytes)).await,
        };

        if let Some(keystream) = activation {
            *outbound = Some(keystream);
        }
        result
    }

    fn read_raw(&self) {
        if !self.try_lock_async_op() {
            return;
        }
        let Some(me) = self.arc() else {
            self.release_async_op();
            return;
        };
        self.env.runtime.spawn(async move {
            me.receive().await;
            me.release_async_op();
        });
    }

    async fn receive(&self) {
        let mut state = self.reader.lock().await;
        let ReadState {
            half,
            buffer,
            fill,
            parser,
            inbound,
        } = &mut *state;
        let Some(half) = half.as_mut() else {
            return;
        };
        if *fill >= buffer.len() {
            self.protocol_violation(&ProtocolError::ProtocolViolation(
                "receive buffer full without a complete field".into(),
            ));
            return;
        }

        let read = tokio::select! {
            biased;
            _ = self.read_cancel.cancelled() => Err(error::canceled()),
            result = self.guard_io(half.read(&mut buffer[*fill..])) => result,
        };

        let count = match read {
            Ok(0) => {
                trace!(session_id = self.id, "Peer closed the connection");
                self.stop_async();
                return;
            }
            Ok(count) => count,
            Err(e) => {
                self.socket_fault("read", &e);
                return;
            }
        };

        if let Some(next) = self.next_inbound.take() {
            *inbound = Some(next);
        }
        if let Some(keystream) = inbound.as_mut() {
            keystream.apply(&mut buffer[*fill..*fill + count]);
        }
        *fill += count;
        self.env.metrics.bytes_read(count as u64);

        let mut position = 0;
        loop {
            match parser.try_shift(&buffer[..*fill], position, *fill - position) {
                Ok(Some(shift)) => {
                    position = shift.position;
                    if let Some(command) = shift.command {
                        self.env.metrics.command_received();
                        self.log(SessionLogKind::In, || {
                            format!(
                                "{} 0x{:08X} {} bytes",
                                command.name,
                                command.hash,
                                command.payload.len()
                            )
                        });
                        self.push_command(SessionCommand::Read(command));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.protocol_violation(&e);
                    return;
                }
            }
        }

        if position > 0 {
            buffer.copy_within(position..*fill, 0);
            *fill -= position;
        }
        drop(state);

        if !self.stopping.load(Ordering::Acquire) {
            self.push_command(SessionCommand::ReadRaw);
        }
    }

    /// Race `io` against teardown cancellation and the idle timer.
    ///
    /// The idle timer only triggers a stop; the operation itself keeps running
    /// until it completes or teardown cancels it.
    async fn guard_io<T>(&self, op: impl Future<Output = io::Result<T>>) -> io::Result<T> {
        tokio::pin!(op);
        let idle = async {
            match self.env.settings.idle_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(idle);
        let mut idle_fired = false;

        loop {
            tokio::select! {
                biased;
                _ = self.io_cancel.cancelled() => return Err(error::canceled()),
                result = &mut op => return result,
                _ = &mut idle, if !idle_fired => {
                    idle_fired = true;
                    debug!(session_id = self.id, peer = %self.remote, "{}", constants::ERR_SESSION_IDLE);
                    self.stop_async();
                }
            }
        }
    }

    fn socket_fault(&self, operation: &str, err: &io::Error) {
        if !error::is_expected_fault(err) {
            self.env.metrics.critical_error();
            self.critical(format!("{operation} failed: {err}"));
        } else {
            trace!(session_id = self.id, operation, error = %err, "Socket closed");
        }
        self.stop_async();
    }

    fn protocol_violation(&self, err: &ProtocolError) {
        self.env.metrics.protocol_violation();
        warn!(session_id = self.id, peer = %self.remote, error = %err, "Dropping connection");
        self.stop_async();
    }

    /// Install the stream transform after the reply to the executing command
    pub(crate) fn set_transform(&self, transform: StreamTransform) {
        self.next_transform.replace(Some(transform));
    }

    fn lock_async_op(&self) {
        self.async_ops.fetch_add(1, Ordering::AcqRel);
        self.async_ops_updated.set();
    }

    // Reads only start while running
    fn try_lock_async_op(&self) -> bool {
        self.running.check(|running| {
            if *running {
                self.lock_async_op();
            }
            *running
        })
    }

    fn release_async_op(&self) {
        self.async_ops.fetch_sub(1, Ordering::AcqRel);
        self.async_ops_updated.set();
    }

    /// Begin stopping without blocking.
    ///
    /// Cancels the pending read, queues `Quit`, clears the running flag and
    /// notifies the owner. Only the first call has any effect.
    pub fn stop_async(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.read_cancel.cancel();
        self.log(SessionLogKind::Sys, || "SessionExit".to_string());
        self.push_command(SessionCommand::Quit);
        self.running.replace(false);

        debug!(session_id = self.id, peer = %self.remote, "Session stopping");
        if let (Some(owner), Some(me)) = (self.owner.upgrade(), self.arc()) {
            owner.session_quit(&me);
        }
    }

    /// Stop and release the connection, blocking until the teardown is done.
    ///
    /// Idempotent; later and concurrent calls return without waiting again.
    /// Waits for the command queue to drain, so a command handler must call
    /// `stop_async` (or `SessionHandle::quit`) instead.
    pub fn stop(&self) {
        self.stop_async();
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        off_runtime(|| self.teardown());
    }

    fn teardown(&self) {
        while self.commands.check(|q| q.pending) != 0 {
            self.commands_updated.wait();
        }

        let linger = self.env.settings.linger;
        if !self.wait_async_ops(linger) {
            trace!(session_id = self.id, "Linger elapsed, canceling pending I/O");
        }
        self.io_cancel.cancel();
        if !self.wait_async_ops(linger) {
            warn!(session_id = self.id, "I/O did not finish after cancellation");
        }

        let read_half = {
            let mut state = self.reader.blocking_lock();
            state.buffer = Vec::new();
            state.fill = 0;
            state.half.take()
        };
        let write_half = self.writer.blocking_lock().half.take();
        drop(read_half);
        drop(write_half);

        // Unsent requests fail
        let abandoned = self.sends.mutate(|s| std::mem::take(&mut s.queue));
        for request in abandoned {
            if let Some(done) = request.done {
                done(Err(error::canceled()));
            }
        }
        debug!(session_id = self.id, peer = %self.remote, "Session released");
    }

    fn wait_async_ops(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while self.async_ops.load(Ordering::Acquire) != 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.async_ops_updated.wait_timeout(deadline - now);
        }
        true
    }

    fn log(&self, kind: SessionLogKind, message: impl FnOnce() -> String) {
        if !kind.enabled(&self.env.settings.log) {
            return;
        }
        let entry = SessionLogEntry::new(self.token_hex(), self.remote, kind, message());
        match self.owner.upgrade() {
            Some(owner) => owner.session_log(entry),
            None => entry.emit(),
        }
    }

    fn critical(&self, message: String) {
        self.log(SessionLogKind::Crtcl, || message);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("token", &self.token_hex())
            .field("remote", &self.remote)
            .field("running", &self.is_running())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
