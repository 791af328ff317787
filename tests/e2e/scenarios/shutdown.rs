//! Graceful shutdown with many live sessions and in-flight telemetry.

use crate::harness::World;
use cti_core::rules::RuleType;
use serde_json::json;
use std::time::{Duration, Instant};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifty_sessions_stop_within_two_seconds() {
    let world = World::builder()
        .agent("web01", "10.0.0.5")
        .rule("procs", RuleType::Process, 30.0, true)
        .build();

    let mut clients = Vec::new();
    for i in 0..50 {
        let mut client = world.connect("10.0.0.5");
        client.expect_upd().await.unwrap();
        // One in-flight data message per session; acks are left unread.
        client
            .send_data(
                "procs",
                json!([{"pid": "9", "path": "/tmp", "cmdline": format!("job --id {i}")}]),
            )
            .await
            .unwrap();
        clients.push(client);
    }

    let start = Instant::now();
    world.cancel.cancel();
    for client in clients {
        client.close().await.unwrap();
    }
    let elapsed = start.elapsed();
    assert!(
        elapsed < Duration::from_secs(2),
        "shutdown took {elapsed:?}"
    );

    // No torn mutations: every stored process has its relationship, plus
    // the one bootstrap relationship for the agent itself.
    let processes = world.store.all_of_type("process").len();
    let relationships = world.store.all_of_type("relationship").len();
    assert_eq!(relationships, processes + 1);
}
