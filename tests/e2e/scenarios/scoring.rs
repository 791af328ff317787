//! Alert scoring arithmetic and path novelty.

use crate::harness::World;
use cti_core::object::{self, Tlp};

fn link(world: &World, from: &str, to: &str) -> String {
    world
        .store
        .create(object::relationship(from, to, "uses"), "server", Tlp::Red, 0)
        .1
}

#[test]
fn test_one_hop_alert_two_hop_silence() {
    let world = World::builder().agent("web01", "10.0.0.5").build();
    let agent = world.agent_id("web01");

    // risk 10 at one hop: (10 * 3 * 2) / 1 = 60, above 40.
    let (_, near) = world
        .store
        .create(object::ipv4_address("203.0.113.9"), "feed_x", Tlp::Amber, 10);
    link(&world, &agent, &near);

    world.alerts.tick();
    let active = world.alerts.active();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].risk, 60);
    assert_eq!(active[0].object, near);

    // The same risk two hops out: 60 / 2 = 30, below threshold.
    let world = World::builder().agent("web01", "10.0.0.5").build();
    let agent = world.agent_id("web01");
    let (_, mid) = world
        .store
        .create(object::software("pivot", "1.0", "v"), "server", Tlp::White, 0);
    let (_, far) = world
        .store
        .create(object::ipv4_address("203.0.113.9"), "feed_x", Tlp::Amber, 10);
    link(&world, &agent, &mid);
    link(&world, &mid, &far);

    world.alerts.tick();
    assert!(world.alerts.active().is_empty());
}

#[test]
fn test_path_novelty() {
    let world = World::builder().agent("web01", "10.0.0.5").build();
    let agent = world.agent_id("web01");

    let (_, obj) = world
        .store
        .create(object::ipv4_address("203.0.113.9"), "feed_x", Tlp::Amber, 20);
    link(&world, &agent, &obj);

    world.alerts.tick();
    assert_eq!(world.alerts.active().len(), 1);

    // Seeing the same path again raises nothing.
    world.alerts.tick();
    assert_eq!(world.alerts.active().len(), 1);

    // A disjoint second route to the same object is a new-path alert.
    let (_, mid) = world
        .store
        .create(object::software("pivot", "1.0", "v"), "server", Tlp::White, 0);
    link(&world, &agent, &mid);
    link(&world, &mid, &obj);

    world.alerts.tick();
    let active = world.alerts.active();
    assert_eq!(active.len(), 2);
    let fresh = active.iter().find(|a| a.path.len() == 5).unwrap();
    assert_eq!(fresh.object, obj);
    assert_eq!(fresh.graph.nodes.len(), 3);
}

#[test]
fn test_consecutive_ticks_are_idempotent() {
    let world = World::builder().agent("web01", "10.0.0.5").build();
    let agent = world.agent_id("web01");
    let (_, obj) = world
        .store
        .create(object::ipv4_address("203.0.113.9"), "feed_x", Tlp::Amber, 30);
    link(&world, &agent, &obj);

    world.alerts.tick();
    let after_first = world.alerts.all().len();
    world.alerts.tick();
    assert_eq!(world.alerts.all().len(), after_first);
}
