//! Risk decay driving rule enablement, observed from an agent session.

use crate::harness::World;
use cti_core::object::{self, Tlp};
use cti_core::rules::RuleType;

#[tokio::test]
async fn test_decay_flips_rule_and_session_sees_it() {
    let world = World::builder()
        .agent("web01", "10.0.0.5")
        .rule("procs", RuleType::Process, 30.0, false)
        .build();

    let mut client = world.connect("10.0.0.5");
    let initial = client.expect_upd().await.unwrap();
    assert!(initial.is_empty(), "rule starts disabled");

    // Ten processes at risk 50; mean stays 50 until decay bites.
    for i in 0..10 {
        world.store.create(
            object::process(1000 + i, "/usr/bin", &format!("worker --shard {i}")),
            "feed_x",
            Tlp::Amber,
            50,
        );
    }

    // First tick: decay to 49, mean 49 >= 30, rule switches on and the
    // session is pushed the new set.
    world.alerts.tick();
    let enabled = client.expect_upd().await.unwrap();
    assert!(enabled.contains_key("procs"));

    // Grind the risk down below the threshold.
    for _ in 0..24 {
        world.store.decay(1);
    }
    world.alerts.tick();
    let disabled = client.expect_upd().await.unwrap();
    assert!(!disabled.contains_key("procs"));

    client.close().await.unwrap();
}
