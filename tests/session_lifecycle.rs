#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end session behavior over real sockets

mod common;

use binary_session::config::ServerConfig;
use binary_session::core::command::{parse_error_payload, Command};
use binary_session::error::constants;
use binary_session::protocol::Dispatcher;
use binary_session::service::is_error_frame;
use binary_session::utils::rc4::{generate_token, StreamTransform, TOKEN_LENGTH};
use binary_session::ProtocolError;
use bytes::Bytes;
use common::{echo_table, local_config, register_flood, wait_until, Harness, ECHO, FLOOD};
use std::sync::mpsc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const FAIL: u32 = 0x0000_0F01;
const PANIC: u32 = 0x0000_0F02;
const NOTIFY: u32 = 0x0000_0A01;
const HANDSHAKE: u32 = 0x0000_0B01;
const PUSH: u32 = 0x0000_0C01;

fn error_message(frame: &Command) -> String {
    assert!(is_error_frame(frame), "expected an error frame, got {}", frame.name);
    parse_error_payload(&frame.payload).expect("error payload").1
}

#[test]
fn test_pipelined_commands_reply_in_order() {
    let harness = Harness::start(local_config(), echo_table());
    let mut client = harness.connect();

    let payloads = harness.block_on(async {
        for i in 0..64u32 {
            client
                .send(Command::new("Echo", ECHO, i.to_le_bytes().to_vec()))
                .await
                .expect("send");
        }
        let mut out = Vec::new();
        for _ in 0..64 {
            out.push(client.recv().await.expect("reply").payload);
        }
        out
    });
    for (i, payload) in payloads.iter().enumerate() {
        assert_eq!(payload.as_ref(), &(i as u32).to_le_bytes());
    }
    assert!(harness.server.metrics().commands_received >= 64);
}

#[test]
fn test_server_push_follows_reply() {
    let table = echo_table();
    table
        .register("Notify", NOTIFY, |ctx, payload| {
            let queued = ctx
                .handle()
                .write_command(Command::new("Push", PUSH, payload.to_vec()));
            assert!(queued);
            Ok(b"ack".to_vec())
        })
        .unwrap();
    let harness = Harness::start(local_config(), table);
    let mut client = harness.connect();

    let (reply, push) = harness.block_on(async {
        client
            .send(Command::new("Notify", NOTIFY, &b"news"[..]))
            .await
            .unwrap();
        (client.recv().await.unwrap(), client.recv().await.unwrap())
    });
    assert_eq!(reply.payload.as_ref(), b"ack");
    assert_eq!(push.name, "Push");
    assert_eq!(push.payload.as_ref(), b"news");
}

#[test]
fn test_raw_send_precedes_reply_and_reports_completion() {
    let (done_tx, done_rx) = mpsc::channel();
    let done_tx = std::sync::Mutex::new(done_tx);
    let table = echo_table();
    table
        .register("Notify", NOTIFY, move |ctx, _| {
            let frame = Command::new("Push", PUSH, &b"raw"[..]).to_bytes()?;
            let tx = done_tx.lock().unwrap().clone();
            ctx.handle().send(frame, move |result| {
                let _ = tx.send(result.is_ok());
            });
            Ok(Vec::new())
        })
        .unwrap();
    let harness = Harness::start(local_config(), table);
    let mut client = harness.connect();

    let (first, second) = harness.block_on(async {
        client
            .send(Command::new("Notify", NOTIFY, Bytes::new()))
            .await
            .unwrap();
        (client.recv().await.unwrap(), client.recv().await.unwrap())
    });
    assert_eq!(first.payload.as_ref(), b"raw");
    assert_eq!(second.name, "Notify");
    assert!(done_rx.recv_timeout(Duration::from_secs(5)).expect("completion"));
}

#[test]
fn test_bad_command_limit_closes_session() {
    let config = ServerConfig {
        max_bad_commands: 2,
        ..local_config()
    };
    let harness = Harness::start(config, echo_table());
    let mut client = harness.connect();

    let messages = harness.block_on(async {
        let mut out = Vec::new();
        for _ in 0..3 {
            client
                .send(Command::new("Missing", 77, Bytes::new()))
                .await
                .unwrap();
            out.push(error_message(&client.recv().await.unwrap()));
        }
        out
    });
    assert_eq!(messages[0], constants::ERR_NOT_RECOGNIZED);
    assert_eq!(messages[1], constants::ERR_NOT_RECOGNIZED);
    assert_eq!(messages[2], constants::ERR_TOO_MANY_BAD_COMMANDS);

    let closed = harness.block_on(client.recv_timeout(Duration::from_secs(5)));
    assert!(closed.is_err());
    assert_eq!(harness.server.metrics().bad_commands, 3);
}

#[test]
fn test_known_name_wrong_hash_is_not_recognized() {
    let harness = Harness::start(local_config(), echo_table());
    let mut client = harness.connect();
    let reply = harness.block_on(async {
        client
            .send(Command::new("Echo", ECHO + 1, Bytes::new()))
            .await
            .unwrap();
        client.recv().await.unwrap()
    });
    assert_eq!(error_message(&reply), constants::ERR_NOT_RECOGNIZED);
}

fn failing_table() -> Dispatcher {
    let table = echo_table();
    table
        .register("Fail", FAIL, |_, _| {
            Err(ProtocolError::CommandFailed("balance too low".into()))
        })
        .unwrap();
    table
        .register("Panic", PANIC, |_, _| panic!("handler exploded"))
        .unwrap();
    table
}

#[test]
fn test_business_error_hides_details_by_default() {
    let harness = Harness::start(local_config(), failing_table());
    let mut client = harness.connect();

    let err = harness
        .block_on(client.call(Command::new("Fail", FAIL, Bytes::new())))
        .unwrap_err();
    match err {
        ProtocolError::CommandFailed(message) => {
            assert_eq!(message, constants::ERR_INTERNAL_SERVER_ERROR)
        }
        other => panic!("unexpected error: {other}"),
    }

    // The session survives the failure
    let reply = harness
        .block_on(client.call(Command::new("Echo", ECHO, &b"ok"[..])))
        .unwrap();
    assert_eq!(reply.payload.as_ref(), b"ok");
    assert_eq!(harness.server.metrics().business_errors, 1);
    assert!(wait_until(|| harness.events.logged("Fail") == 1));
}

#[test]
fn test_client_debug_exposes_details() {
    let config = ServerConfig {
        client_debug: true,
        ..local_config()
    };
    let harness = Harness::start(config, failing_table());
    let mut client = harness.connect();

    let err = harness
        .block_on(client.call(Command::new("Fail", FAIL, Bytes::new())))
        .unwrap_err();
    assert_eq!(err.to_string(), "Command failed: Command failed: balance too low");
}

#[test]
fn test_handler_panic_is_contained() {
    let harness = Harness::start(local_config(), failing_table());
    let mut client = harness.connect();

    let err = harness
        .block_on(client.call(Command::new("Panic", PANIC, Bytes::new())))
        .unwrap_err();
    assert!(matches!(err, ProtocolError::CommandFailed(_)));

    let reply = harness
        .block_on(client.call(Command::new("Echo", ECHO, &b"alive"[..])))
        .unwrap();
    assert_eq!(reply.payload.as_ref(), b"alive");
}

#[test]
fn test_transform_after_handshake() {
    let table = echo_table();
    table
        .register("Handshake", HANDSHAKE, |ctx, client_token| {
            let server_token = generate_token()?;
            let transform = StreamTransform::server(client_token, &server_token)?;
            ctx.handle().set_transform(transform);
            Ok(server_token.to_vec())
        })
        .unwrap();
    table
        .register("Notify", NOTIFY, |ctx, payload| {
            ctx.handle()
                .write_command(Command::new("Push", PUSH, payload.to_vec()));
            Ok(Vec::new())
        })
        .unwrap();
    let harness = Harness::start(local_config(), table);
    let mut client = harness.connect();

    let client_token = generate_token().unwrap();
    let reply = harness
        .block_on(client.call(Command::new("Handshake", HANDSHAKE, client_token.to_vec())))
        .expect("plain handshake reply");
    assert_eq!(reply.payload.len(), TOKEN_LENGTH);
    client.set_transform(StreamTransform::client(&client_token, &reply.payload).unwrap());

    for round in 0..4u8 {
        let payload = vec![round; 300];
        let echoed = harness
            .block_on(client.call(Command::new("Echo", ECHO, payload.clone())))
            .expect("transformed echo");
        assert_eq!(echoed.payload.as_ref(), payload.as_slice());
    }

    let (ack, push) = harness.block_on(async {
        client
            .send(Command::new("Notify", NOTIFY, &b"secret"[..]))
            .await
            .unwrap();
        (client.recv().await.unwrap(), client.recv().await.unwrap())
    });
    assert_eq!(ack.name, "Notify");
    assert_eq!(push.payload.as_ref(), b"secret");
}

#[test]
fn test_idle_session_is_closed() {
    let config = ServerConfig {
        session_idle_timeout: Some(Duration::from_millis(100)),
        ..local_config()
    };
    let harness = Harness::start(config, echo_table());
    let mut client = harness.connect();

    let closed = harness.block_on(client.recv_timeout(Duration::from_secs(5)));
    assert!(matches!(closed, Err(ProtocolError::ConnectionClosed)));
    assert!(wait_until(|| harness.server.connection_count() == 0));
}

#[test]
fn test_stalled_write_hits_idle_timeout() {
    let config = ServerConfig {
        session_idle_timeout: Some(Duration::from_millis(400)),
        ..local_config()
    };
    let table = echo_table();
    register_flood(&table, false);
    let harness = Harness::start(config, table);
    let mut client = harness.connect();

    // Reads complete every 100ms while nothing we are sent gets read, so only
    // the timer next to the stalled write can end the session.
    let stopped = harness.block_on(async {
        client
            .send(Command::new("Flood", FLOOD, Bytes::new()))
            .await
            .unwrap();
        for _ in 0..50 {
            if harness.server.session_count() == 0 {
                return true;
            }
            if client.send(Command::new("Echo", ECHO, Bytes::new())).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        harness.server.session_count() == 0
    });
    assert!(stopped, "session outlived its stalled write");
    assert!(wait_until(|| harness.server.connection_count() == 0));
}

#[test]
fn test_protocol_violation_drops_without_reply() {
    let harness = Harness::start(local_config(), echo_table());
    let addr = harness.addr();

    let received = harness.block_on(async {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        // Name length far above the limit
        stream.write_all(&4096i32.to_le_bytes()).await.unwrap();
        let mut sink = Vec::new();
        let _ = tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut sink).await;
        sink
    });
    assert!(received.is_empty());
    assert!(wait_until(|| harness.server.metrics().protocol_violations == 1));
}

#[test]
fn test_session_log_reports_enter_and_exit() {
    let harness = Harness::start(local_config(), echo_table());
    let client = harness.connect();
    assert!(wait_until(|| harness.events.logged("SessionEnter") == 1));

    harness.block_on(client.close()).unwrap();
    assert!(wait_until(|| harness.events.logged("SessionExit") == 1));
    assert!(wait_until(|| harness.server.session_count() == 0));
}
