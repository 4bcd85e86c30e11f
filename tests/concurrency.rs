mod common;

use binary_session::core::command::Command;
use binary_session::service::SessionClient;
use common::{echo_table, local_config, wait_until, Harness, ECHO};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

const TALLY: u32 = 0x0000_7A11;

#[test]
fn concurrent_sessions_keep_their_own_order() {
    let clients = 32usize;
    let calls = 50u32;

    // Per-session counters: commands of one session never run concurrently
    let tallies: Arc<Mutex<HashMap<u64, u32>>> = Arc::default();
    let table = echo_table();
    {
        let tallies = tallies.clone();
        table
            .register("Tally", TALLY, move |ctx, payload| {
                let mut tallies = tallies.lock().unwrap();
                let seen = tallies.entry(ctx.session_id()).or_insert(0);
                let expected = u32::from_le_bytes(payload.try_into().unwrap());
                assert_eq!(*seen, expected);
                *seen += 1;
                Ok(seen.to_le_bytes().to_vec())
            })
            .unwrap();
    }
    let harness = Harness::start(local_config(), table);
    let addr = harness.addr().to_string();

    harness.block_on(async {
        let mut tasks = JoinSet::new();
        for _ in 0..clients {
            let addr = addr.clone();
            tasks.spawn(async move {
                let mut client = SessionClient::connect(&addr).await.unwrap();
                for i in 0..calls {
                    client
                        .send(Command::new("Tally", TALLY, i.to_le_bytes().to_vec()))
                        .await
                        .unwrap();
                }
                for i in 0..calls {
                    let reply = client.recv().await.unwrap();
                    assert_eq!(reply.payload.as_ref(), &(i + 1).to_le_bytes());
                }
                let echo = client
                    .call(Command::new("Echo", ECHO, &b"done"[..]))
                    .await
                    .unwrap();
                assert_eq!(echo.payload.as_ref(), b"done");
                client.close().await.unwrap();
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }
    });

    assert_eq!(tallies.lock().unwrap().len(), clients);
    assert!(wait_until(|| harness.server.connection_count() == 0));
    let metrics = harness.server.metrics();
    assert_eq!(metrics.connections_accepted, clients as u64);
    assert_eq!(metrics.sessions_active, 0);
}
