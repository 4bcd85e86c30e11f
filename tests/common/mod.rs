#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]
//! Shared harness for server integration tests

use binary_session::config::ServerConfig;
use binary_session::core::command::{Command, MAX_PARAMS_LEN};
use binary_session::protocol::Dispatcher;
use binary_session::service::SessionClient;
use binary_session::transport::{Server, ServerEvents, Session, SessionLogEntry};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

pub const ECHO: u32 = 0x0000_0E01;
pub const FLOOD: u32 = 0x0000_F100;

// Far more than loopback socket buffers absorb
const FLOOD_FRAMES: usize = 3072;

// Field order matters: the server must stop while the runtime still runs.
pub struct Harness {
    pub server: Server,
    pub events: Arc<RecordingEvents>,
    pub runtime: Runtime,
}

impl Harness {
    pub fn start(config: ServerConfig, table: Dispatcher) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .expect("runtime");
        let events = Arc::new(RecordingEvents::default());
        let server = Server::with_events(
            config,
            Arc::new(table),
            runtime.handle().clone(),
            events.clone(),
        )
        .expect("server");
        server.start().expect("start");
        Self {
            server,
            events,
            runtime,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.local_addrs()[0]
    }

    pub fn connect(&self) -> SessionClient {
        let addr = self.addr().to_string();
        self.runtime
            .block_on(SessionClient::connect(&addr))
            .expect("connect")
    }

    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

pub fn local_config() -> ServerConfig {
    ServerConfig {
        bindings: vec!["127.0.0.1:0".to_string()],
        linger_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    }
}

pub fn echo_table() -> Dispatcher {
    let table = Dispatcher::new();
    table
        .register("Echo", ECHO, |_, payload| Ok(payload.to_vec()))
        .expect("register");
    table
}

/// Register `Flood`: pushes full-size frames until a peer that stops reading
/// stalls the session's writes. With `then_quit` the session quits right after.
pub fn register_flood(table: &Dispatcher, then_quit: bool) {
    table
        .register("Flood", FLOOD, move |ctx, _| {
            for _ in 0..FLOOD_FRAMES {
                ctx.handle()
                    .write_command(Command::new("Push", 0x0000_F101, vec![0u8; MAX_PARAMS_LEN]));
            }
            if then_quit {
                ctx.handle().quit();
            }
            Ok(Vec::new())
        })
        .expect("register");
}

/// Poll `condition` until it holds or five seconds pass
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[derive(Default)]
pub struct RecordingEvents {
    pub quits: AtomicUsize,
    pub global_rejections: AtomicUsize,
    pub per_ip_rejections: AtomicUsize,
    pub logs: Mutex<Vec<SessionLogEntry>>,
}

impl RecordingEvents {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn logged(&self, message: &str) -> usize {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.message.starts_with(message))
            .count()
    }
}

impl ServerEvents for RecordingEvents {
    fn session_quit(&self, _session: &Arc<Session>) {
        self.quits.fetch_add(1, Ordering::SeqCst);
    }

    fn max_connections_exceeded(&self, _session: &Arc<Session>) {
        self.global_rejections.fetch_add(1, Ordering::SeqCst);
    }

    fn max_connections_per_ip_exceeded(&self, _session: &Arc<Session>) {
        self.per_ip_rejections.fetch_add(1, Ordering::SeqCst);
    }

    fn session_log(&self, entry: &SessionLogEntry) {
        self.logs.lock().unwrap().push(entry.clone());
    }
}
