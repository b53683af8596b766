//! Integration tests for network formation on the simulated medium.
//!
//! Nodes are started on a shared `SimMedium` and driven with injected time.

use umesh_core::ip::{InterfaceEvent, RecordingListener};
use umesh_core::{DeviceState, InterfaceDownReason, MeshConfig, Mode, SimMedium, Simulator};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

const ATTACH_TIMEOUT_MS: u64 = 30_000;
const STEP_MS: u64 = 100;

/// One node already leading its network, one added but not started
fn leader_and_joiner(seed: u64) -> (Simulator, usize, usize) {
    let mut sim = Simulator::new(SimMedium::new());
    let leader = sim.add_node(MeshConfig::default().with_seed(seed));
    let joiner = sim.add_node(MeshConfig::default().with_seed(seed + 1));
    sim.start(leader).expect("leader start");
    sim.run_for(10_000);
    (sim, leader, joiner)
}

#[test]
fn test_single_node_becomes_leader() {
    init_tracing();
    let mut sim = Simulator::new(SimMedium::new());
    let a = sim.add_node(MeshConfig::default().with_seed(11));
    sim.start_all();

    // Still scanning right after start
    sim.run_for(1_000);
    assert_eq!(sim.node(a).state(), DeviceState::Detached);
    assert!(sim.node(a).is_discovering());

    sim.run_for(9_000);
    let node = sim.node(a);
    assert_eq!(node.state(), DeviceState::Leader);
    assert_eq!(node.sid(), 0);
    assert_eq!(node.channel(0), Some(1));
    assert!(node.parent().is_none());
}

#[test]
fn test_leader_mode_skips_scan() {
    init_tracing();
    let mut sim = Simulator::new(SimMedium::new());
    let a = sim.add_node(
        MeshConfig::default()
            .with_seed(12)
            .with_mode(Mode::RX_ON.with(Mode::LEADER)),
    );
    sim.start(a).expect("start");
    assert_eq!(sim.node(a).state(), DeviceState::Leader);
    assert!(!sim.node(a).is_discovering());
}

#[test]
fn test_joiner_attaches_to_leader() {
    init_tracing();
    let (mut sim, leader, joiner) = leader_and_joiner(20);
    assert_eq!(sim.node(leader).state(), DeviceState::Leader);

    sim.start(joiner).expect("joiner start");
    let attached = sim.run_until(ATTACH_TIMEOUT_MS, STEP_MS, |s| s.node(joiner).is_attached());
    assert!(attached, "joiner did not attach");

    let leader_mac = sim.mac(leader);
    let node = sim.node(joiner);
    assert_eq!(node.state(), DeviceState::Router);
    assert_eq!(node.parent(), Some(leader_mac));
    assert_eq!(node.meshnetid(), sim.node(leader).meshnetid());
    assert_ne!(node.sid(), 0);
    assert!(node.path_cost() > 0);

    // The leader sees the joiner as a child
    let neighbors = sim.node(leader).neighbors();
    assert!(neighbors.iter().any(|n| n.mac == sim.mac(joiner)));
}

#[test]
fn test_router_extends_the_tree() {
    init_tracing();
    let (mut sim, leader, router) = leader_and_joiner(30);
    let far = sim.add_node(MeshConfig::default().with_seed(32));
    sim.medium().cut_link(sim.mac(leader), sim.mac(far));

    sim.start(router).expect("router start");
    assert!(sim.run_until(ATTACH_TIMEOUT_MS, STEP_MS, |s| s.node(router).is_attached()));

    sim.start(far).expect("far start");
    assert!(sim.run_until(ATTACH_TIMEOUT_MS, STEP_MS, |s| s.node(far).is_attached()));

    let node = sim.node(far);
    assert_eq!(node.parent(), Some(sim.mac(router)));
    assert_eq!(node.meshnetid(), sim.node(leader).meshnetid());
    assert!(node.path_cost() > sim.node(router).path_cost());
}

#[test]
fn test_secure_attach() {
    init_tracing();
    let mut sim = Simulator::new(SimMedium::new());
    let leader = sim.add_node(MeshConfig::default().with_seed(40).with_sec_level(1));
    let joiner = sim.add_node(MeshConfig::default().with_seed(41).with_sec_level(1));
    sim.start(leader).expect("leader start");
    sim.run_for(10_000);
    sim.start(joiner).expect("joiner start");

    assert!(sim.run_until(ATTACH_TIMEOUT_MS, STEP_MS, |s| s.node(joiner).is_attached()));
    assert_eq!(sim.node(joiner).parent(), Some(sim.mac(leader)));

    // Traffic after the attach runs under the group key
    let dest = sim.node(leader).mesh_addr();
    sim.node_mut(joiner).send_data(dest, b"sealed").expect("send");
    sim.run_for(1_000);
    let received = sim.received(leader);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, b"sealed".to_vec());
}

#[test]
fn test_two_leaders_merge() {
    init_tracing();
    let mut sim = Simulator::new(SimMedium::new());
    let a = sim.add_node(MeshConfig::default().with_seed(50));
    let b = sim.add_node(MeshConfig::default().with_seed(51));
    sim.start_all();
    sim.run_for(10_000);
    assert_eq!(sim.node(a).state(), DeviceState::Leader);
    assert_eq!(sim.node(b).state(), DeviceState::Leader);

    let merged = sim.run_until(180_000, 1_000, |s| {
        s.node(a).meshnetid() == s.node(b).meshnetid() && s.node(a).is_attached() && s.node(b).is_attached()
    });
    assert!(merged, "networks did not merge");

    let leaders = [a, b]
        .iter()
        .filter(|&&i| sim.node(i).state() == DeviceState::Leader)
        .count();
    assert_eq!(leaders, 1);
}

#[test]
fn test_listener_sees_transitions() {
    init_tracing();
    let (mut sim, _leader, joiner) = leader_and_joiner(60);
    let listener = RecordingListener::new();
    sim.node_mut(joiner).add_listener(Box::new(listener.clone()));

    sim.start(joiner).expect("joiner start");
    assert!(sim.run_until(ATTACH_TIMEOUT_MS, STEP_MS, |s| s.node(joiner).is_attached()));
    sim.stop(joiner);

    assert_eq!(
        listener.events(),
        vec![
            InterfaceEvent::Down(InterfaceDownReason::MeshStart),
            InterfaceEvent::Up(DeviceState::Router),
            InterfaceEvent::Down(InterfaceDownReason::MeshStop),
        ]
    );
    assert_eq!(sim.node(joiner).state(), DeviceState::Disabled);
    assert!(!sim.node(joiner).is_running());
}
