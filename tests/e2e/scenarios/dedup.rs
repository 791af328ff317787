//! Deduplication across reporting origins.

use crate::harness::World;
use cti_core::object::{self, Tlp};

#[test]
fn test_same_address_from_agent_and_feed_is_one_entry() {
    let world = World::builder().agent("web01", "10.0.0.5").build();
    let baseline = world.store.object_count();

    let (created, first) =
        world
            .store
            .create(object::ipv4_address("1.2.3.4"), "agent_a", Tlp::Red, 10);
    assert!(created);

    let (created, second) =
        world
            .store
            .create(object::ipv4_address("1.2.3.4"), "feed_x", Tlp::Amber, 20);
    assert!(!created);
    assert_eq!(first, second);
    assert_eq!(world.store.object_count(), baseline + 1);

    let view = world.store.read(&first).unwrap();
    // TLP stays red: the demotion attempt is a silent no-op. Risk rises.
    assert_eq!(view["tlp"], "red");
    assert_eq!(view["risk"], 20);

    let history: Vec<String> = serde_json::from_value(view["history"].clone()).unwrap();
    assert!(history[0].contains("Created by agent_a [red, 10]"));
    assert!(history
        .iter()
        .any(|line| line.contains("Risk updated by feed_x to 20")));
    // The refused TLP change left no trace.
    assert!(!history.iter().any(|line| line.contains("TLP")));
}

#[test]
fn test_fingerprint_survives_store_roundtrip() {
    let world = World::builder().build();
    let obj = object::ipv4_address("198.51.100.3");
    let fp = cti_core::fingerprint::of(&obj);

    let (_, id) = world.store.create(obj, "server", Tlp::White, 0);
    let view = world.store.read(&id).unwrap();
    let serde_json::Value::Object(map) = view else {
        panic!("merged view is an object")
    };
    let read_back = cti_core::CtiObject::from_map(map).unwrap();
    assert_eq!(cti_core::fingerprint::of(&read_back), fp);
}
