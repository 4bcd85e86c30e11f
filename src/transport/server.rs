//! # Session Server
//!
//! Listens on the configured bindings and turns accepted connections into
//! sessions.
//!
//! ## Admission
//! Accept loops only queue sockets. A dedicated admission thread drains that
//! queue one connection at a time and applies the limits:
//! - at the global cap one stopping session is reclaimed first, then the cap
//!   is rechecked
//! - over the global or per-address cap the connection becomes a session
//!   anyway, receives an error frame and is stopped without being registered
//! - otherwise the session is counted, registered and started
//!
//! ## Purge
//! A session that quits moves from the registry to the stopping set. The purge
//! thread drains that set: it releases the connection counts and blocks on
//! `Session::stop` so teardown never holds a runtime worker.
//!
//! ## Example
//! ```rust,no_run
//! use binary_session::config::ServerConfig;
//! use binary_session::protocol::Dispatcher;
//! use binary_session::transport::Server;
//! use std::sync::Arc;
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! let table = Dispatcher::new();
//! table.register("Echo", 0x00C0_FFEE, |_, payload| Ok(payload.to_vec())).unwrap();
//!
//! let server = Server::new(ServerConfig::default(), Arc::new(table), runtime.handle().clone()).unwrap();
//! server.start().unwrap();
//! // ...
//! server.stop();
//! ```

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle as ThreadHandle;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::CommandTable;
use crate::transport::log::SessionLogEntry;
use crate::transport::off_runtime;
use crate::transport::session::{Session, SessionEnv, SessionId, SessionOwner, SessionSettings};
use crate::utils::guarded::GuardedCell;
use crate::utils::metrics::{Metrics, MetricsSnapshot};
use crate::utils::signal::AutoResetSignal;
use crate::utils::timeout::{ACCEPT_BACKOFF, DEFAULT_TIMEOUT};

const DEFAULT_BACKLOG: u32 = 128;

/// Server notifications.
///
/// Called from the admission and purge threads and from session tasks; keep
/// implementations short and non-blocking.
pub trait ServerEvents: Send + Sync + 'static {
    /// A session stopped, including rejected ones
    fn session_quit(&self, _session: &Arc<Session>) {}

    /// A connection was rejected at the global cap
    fn max_connections_exceeded(&self, _session: &Arc<Session>) {}

    /// A connection was rejected at the per-address cap
    fn max_connections_per_ip_exceeded(&self, _session: &Arc<Session>) {}

    /// A session produced an enabled log entry
    fn session_log(&self, _entry: &SessionLogEntry) {}
}

/// Events sink that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl ServerEvents for NoopEvents {}

#[derive(Debug, Default)]
struct ConnectionCounts {
    total: usize,
    by_ip: HashMap<IpAddr, usize>,
}

impl ConnectionCounts {
    fn add(&mut self, ip: IpAddr) {
        self.total += 1;
        *self.by_ip.entry(ip).or_insert(0) += 1;
    }

    fn release(&mut self, ip: IpAddr) {
        self.total = self.total.saturating_sub(1);
        if let Some(count) = self.by_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.by_ip.remove(&ip);
            }
        }
    }

    fn from_ip(&self, ip: &IpAddr) -> usize {
        self.by_ip.get(ip).copied().unwrap_or(0)
    }
}

struct ServerShared {
    env: Arc<SessionEnv>,
    events: Arc<dyn ServerEvents>,
    max_connections: Option<usize>,
    max_connections_per_ip: Option<usize>,
    next_id: AtomicU64,

    sessions: GuardedCell<HashMap<SessionId, Arc<Session>>>,
    counts: GuardedCell<ConnectionCounts>,
    stopping: GuardedCell<HashMap<SessionId, Arc<Session>>>,

    accepted: GuardedCell<VecDeque<TcpStream>>,
    admission_signal: AutoResetSignal,
    admission_exit: AtomicBool,
    purge_signal: AutoResetSignal,
    purge_exit: AtomicBool,
}

impl ServerShared {
    fn metrics(&self) -> &Metrics {
        &self.env.metrics
    }

    fn admission_loop(self: Arc<Self>) {
        debug!("Admission worker started");
        loop {
            self.admission_signal.wait();
            if self.admission_exit.load(Ordering::Acquire) {
                break;
            }
            while let Some(stream) = self.accepted.mutate(VecDeque::pop_front) {
                self.admit(stream);
                if self.admission_exit.load(Ordering::Acquire) {
                    break;
                }
            }
        }
        debug!("Admission worker finished");
    }

    fn purge_loop(self: Arc<Self>) {
        debug!("Purge worker started");
        loop {
            self.purge_signal.wait();
            while self.purge_one() {}
            if self.purge_exit.load(Ordering::Acquire) {
                break;
            }
        }
        debug!("Purge worker finished");
    }

    fn admit(self: &Arc<Self>, stream: TcpStream) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let owner: Weak<dyn SessionOwner> = Arc::downgrade(self) as Weak<dyn SessionOwner>;
        let session = match Session::new(id, stream, self.env.clone(), owner) {
            Ok(session) => session,
            Err(e) => {
                debug!(error = %e, "Connection closed before admission");
                return;
            }
        };
        let ip = session.remote().ip();

        if let Some(limit) = self.max_connections {
            if self.connection_count() >= limit {
                self.purge_one();
            }
            if self.connection_count() >= limit {
                info!(peer = %session.remote(), limit, "Rejecting connection: server full");
                self.metrics().rejected_global();
                self.reject(&session, constants::ERR_TOO_MANY_CONNECTIONS);
                self.events.max_connections_exceeded(&session);
                session.stop();
                return;
            }
        }

        if let Some(limit) = self.max_connections_per_ip {
            if self.counts.check(|c| c.from_ip(&ip)) >= limit {
                info!(peer = %session.remote(), limit, "Rejecting connection: address limit");
                self.metrics().rejected_per_ip();
                self.reject(&session, &constants::too_many_connections_from(&ip));
                self.events.max_connections_per_ip_exceeded(&session);
                session.stop();
                return;
            }
        }

        self.counts.mutate(|c| c.add(ip));
        self.sessions.mutate(|s| s.insert(id, session.clone()));
        self.metrics().session_registered();

        if let Err(e) = session.start() {
            warn!(session_id = id, error = %e, "Failed to start session");
            session.stop_async();
        }
    }

    // Rejected sessions run just long enough to flush the error frame.
    fn reject(&self, session: &Arc<Session>, message: &str) {
        match session.start() {
            Ok(()) => session.raise_error("", message),
            Err(e) => warn!(session_id = session.id(), error = %e, "Failed to start rejected session"),
        }
    }

    /// Purge one stopping session, if any
    fn purge_one(&self) -> bool {
        let next = self.stopping.mutate(|stopping| {
            let id = *stopping.keys().next()?;
            stopping.remove(&id)
        });
        match next {
            Some(session) => {
                self.release(&session);
                session.stop();
                true
            }
            None => false,
        }
    }

    fn release(&self, session: &Session) {
        let ip = session.remote().ip();
        self.counts.mutate(|c| c.release(ip));
        self.metrics().session_removed();
    }

    fn connection_count(&self) -> usize {
        self.counts.check(|c| c.total)
    }
}

impl SessionOwner for ServerShared {
    fn session_quit(&self, session: &Arc<Session>) {
        let id = session.id();
        if let Some(registered) = self.sessions.mutate(|s| s.remove(&id)) {
            self.stopping.mutate(|s| s.insert(id, registered));
            self.purge_signal.set();
        }
        self.events.session_quit(session);
    }

    fn session_log(&self, entry: SessionLogEntry) {
        entry.emit();
        self.events.session_log(&entry);
    }
}

struct Workers {
    cancel: CancellationToken,
    accept_tasks: Vec<JoinHandle<()>>,
    // Disconnects once every accept loop has dropped its listener
    accept_exited: Receiver<()>,
    admission: ThreadHandle<()>,
    purge: ThreadHandle<()>,
}

struct ServerCore {
    config: ServerConfig,
    bindings: Vec<SocketAddr>,
    shared: Arc<ServerShared>,
    // Held for a whole start or stop; observers read the fields below instead.
    workers: Mutex<Option<Workers>>,
    running: AtomicBool,
    local_addrs: GuardedCell<Vec<SocketAddr>>,
}

impl ServerCore {
    fn workers(&self) -> MutexGuard<'_, Option<Workers>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bind(&self, address: SocketAddr) -> io::Result<TcpListener> {
        let _runtime = self.shared.env.runtime.enter();
        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        #[cfg(unix)]
        socket.set_reuseaddr(true)?;
        socket.bind(address)?;
        let backlog = self
            .config
            .max_connections
            .map_or(DEFAULT_BACKLOG, |n| u32::try_from(n.saturating_add(1)).unwrap_or(u32::MAX));
        socket.listen(backlog)
    }

    fn start(&self) -> Result<()> {
        let mut workers = self.workers();
        if workers.is_some() {
            return Err(ProtocolError::AlreadyRunning);
        }
        if self.bindings.is_empty() {
            return Err(ProtocolError::NoBindings);
        }

        let mut listeners = Vec::with_capacity(self.bindings.len());
        let mut first_error = None;
        for address in &self.bindings {
            match self.bind(*address) {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    warn!(%address, error = %e, "Failed to bind");
                    first_error.get_or_insert(ProtocolError::BindFailure {
                        address: address.to_string(),
                        source: e,
                    });
                }
            }
        }
        if listeners.is_empty() {
            return Err(first_error.unwrap_or(ProtocolError::NoBindings));
        }

        let shared = &self.shared;
        shared.admission_exit.store(false, Ordering::Release);
        shared.purge_exit.store(false, Ordering::Release);

        let admission = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("session-admission".into())
                .spawn(move || shared.admission_loop())?
        };
        let purge = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("session-purge".into())
                .spawn(move || shared.purge_loop())
        };
        let purge = match purge {
            Ok(handle) => handle,
            Err(e) => {
                shared.admission_exit.store(true, Ordering::Release);
                shared.admission_signal.set();
                if admission.join().is_err() {
                    error!("Admission worker panicked");
                }
                return Err(e.into());
            }
        };

        let cancel = CancellationToken::new();
        let (exited_tx, accept_exited) = mpsc::channel();
        let local_addrs: Vec<SocketAddr> =
            listeners.iter().filter_map(|l| l.local_addr().ok()).collect();
        let accept_tasks = listeners
            .into_iter()
            .map(|listener| {
                shared.env.runtime.spawn(accept_loop(
                    listener,
                    shared.clone(),
                    cancel.clone(),
                    exited_tx.clone(),
                ))
            })
            .collect();
        drop(exited_tx);

        info!(addresses = ?local_addrs, "Server started");
        self.local_addrs.replace(local_addrs);
        self.running.store(true, Ordering::Release);
        *workers = Some(Workers {
            cancel,
            accept_tasks,
            accept_exited,
            admission,
            purge,
        });
        Ok(())
    }

    fn stop(&self) {
        let mut workers = self.workers();
        let Some(running) = workers.take() else {
            return;
        };
        let Workers {
            cancel,
            accept_tasks,
            accept_exited,
            admission,
            purge,
        } = running;
        let shared = &self.shared;
        self.running.store(false, Ordering::Release);
        self.local_addrs.take();

        // Aborting drops each loop wherever it is parked, listener included.
        // The wait below never polls the tasks itself.
        cancel.cancel();
        for task in &accept_tasks {
            task.abort();
        }
        if let Err(RecvTimeoutError::Timeout) = accept_exited.recv_timeout(DEFAULT_TIMEOUT) {
            warn!("Accept loops still running after stop");
        }

        shared.admission_exit.store(true, Ordering::Release);
        shared.admission_signal.set();
        if admission.join().is_err() {
            error!("Admission worker panicked");
        }
        let unadmitted = shared.accepted.take();
        if !unadmitted.is_empty() {
            debug!(count = unadmitted.len(), "Dropping connections never admitted");
        }
        drop(unadmitted);

        let sessions = shared.sessions.take();
        for session in sessions.values() {
            session.stop();
        }

        shared.purge_exit.store(true, Ordering::Release);
        shared.purge_signal.set();
        if purge.join().is_err() {
            error!("Purge worker panicked");
        }

        let stopping = shared.stopping.take();
        for session in stopping.values() {
            session.stop();
        }

        let released = shared.counts.take();
        for _ in 0..released.total {
            shared.metrics().session_removed();
        }

        info!(sessions = sessions.len() + stopping.len(), "Server stopped");
        drop(workers);
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    cancel: CancellationToken,
    _exited: Sender<()>,
) {
    let local = listener.local_addr().ok();
    let mut incoming = TcpListenerStream::new(listener);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = incoming.next() => next,
        };
        match next {
            Some(Ok(stream)) => {
                shared.metrics().connection_accepted();
                shared.accepted.mutate(|queue| queue.push_back(stream));
                shared.admission_signal.set();
            }
            Some(Err(e)) => {
                warn!(address = ?local, error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
            None => break,
        }
    }
    debug!(address = ?local, "Accept loop finished");
}

/// TCP session server.
///
/// The runtime passed in drives every accept loop and session task. It must
/// be a multi-threaded runtime and outlive the server.
pub struct Server {
    core: Arc<ServerCore>,
}

impl Server {
    pub fn new(config: ServerConfig, table: Arc<dyn CommandTable>, runtime: Handle) -> Result<Self> {
        Self::with_events(config, table, runtime, Arc::new(NoopEvents))
    }

    /// Build a server reporting to `events`.
    ///
    /// Malformed bindings and out-of-range limits fail here; an empty binding
    /// list fails at [`start`](Self::start).
    pub fn with_events(
        config: ServerConfig,
        table: Arc<dyn CommandTable>,
        runtime: Handle,
        events: Arc<dyn ServerEvents>,
    ) -> Result<Self> {
        let errors = config.validate_limits();
        if !errors.is_empty() {
            return Err(ProtocolError::ConfigError(errors.join("; ")));
        }
        let bindings = config.socket_addrs()?;

        let env = Arc::new(SessionEnv::new(
            runtime,
            table,
            SessionSettings::from(&config),
            Arc::new(Metrics::new()),
        ));
        let shared = Arc::new(ServerShared {
            env,
            events,
            max_connections: config.max_connections,
            max_connections_per_ip: config.max_connections_per_ip,
            next_id: AtomicU64::new(1),
            sessions: GuardedCell::default(),
            counts: GuardedCell::default(),
            stopping: GuardedCell::default(),
            accepted: GuardedCell::default(),
            admission_signal: AutoResetSignal::new(),
            admission_exit: AtomicBool::new(false),
            purge_signal: AutoResetSignal::new(),
            purge_exit: AtomicBool::new(false),
        });

        Ok(Self {
            core: Arc::new(ServerCore {
                config,
                bindings,
                shared,
                workers: Mutex::new(None),
                running: AtomicBool::new(false),
                local_addrs: GuardedCell::default(),
            }),
        })
    }

    /// Bind every configured address and begin accepting.
    ///
    /// Fails if already running, if no binding is configured, or if every
    /// binding failed; individual failures are logged and skipped.
    #[instrument(skip(self), fields(bindings = self.core.bindings.len()))]
    pub fn start(&self) -> Result<()> {
        self.core.start()
    }

    /// Stop accepting, stop every session and join the workers.
    ///
    /// Blocks until done. Idempotent.
    pub fn stop(&self) {
        off_runtime(|| self.core.stop());
    }

    /// [`stop`](Self::stop) on the blocking pool
    pub async fn shutdown(&self) {
        let core = self.core.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || core.stop()).await {
            error!(error = %e, "Shutdown task failed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.core.config
    }

    /// Bound addresses while running
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.core.local_addrs.check(Vec::clone)
    }

    /// Sessions currently registered and running
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.core.shared.sessions.check(|s| s.values().cloned().collect())
    }

    pub fn session_count(&self) -> usize {
        self.core.shared.sessions.check(HashMap::len)
    }

    /// Connections counted against the limits, including stopping sessions
    /// not yet purged
    pub fn connection_count(&self) -> usize {
        self.core.shared.connection_count()
    }

    pub fn connections_from(&self, ip: IpAddr) -> usize {
        self.core.shared.counts.check(|c| c.from_ip(&ip))
    }

    /// Remote addresses with at least one counted connection
    pub fn tracked_addresses(&self) -> usize {
        self.core.shared.counts.check(|c| c.by_ip.len())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.shared.metrics().snapshot()
    }

    pub fn log_metrics(&self) {
        self.core.shared.metrics().log_metrics();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("bindings", &self.core.bindings)
            .field("running", &self.is_running())
            .field("sessions", &self.session_count())
            .finish()
    }
}
