//! Integration tests for sleepy (non RX_ON) devices.

use umesh_core::{MeshConfig, Mode, SimMedium, Simulator};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn test_sleepy_child_attaches_and_sleeps() {
    init_tracing();
    let mut sim = Simulator::new(SimMedium::new());
    let leader = sim.add_node(MeshConfig::default().with_seed(300));
    let sleepy = sim.add_node(MeshConfig::default().with_seed(301).with_mode(Mode::NONE));
    sim.start(leader).expect("leader start");
    sim.run_for(10_000);

    sim.start(sleepy).expect("sleepy start");
    // The radio stays up while the node looks for a parent
    sim.run_for(200);
    assert!(sim.node(sleepy).lowpower_is_radio_up());

    assert!(sim.run_until(30_000, 100, |s| s.node(sleepy).is_attached()));
    assert_eq!(sim.node(sleepy).parent(), Some(sim.mac(leader)));

    sim.run_for(20_000);
    let node = sim.node(sleepy);
    assert!(node.is_attached());
    assert!(node.lowpower_sleep_time() > 0);
    assert!(node.stats().sleep_time > 0);

    // The parent knows its child keeps the radio off
    let child = sim
        .node(leader)
        .neighbors()
        .into_iter()
        .find(|n| n.mac == sim.mac(sleepy))
        .expect("child in neighbor table");
    assert!(!child.mode.is_rx_on());
}

#[test]
fn test_always_on_node_never_sleeps() {
    init_tracing();
    let mut sim = Simulator::new(SimMedium::new());
    let a = sim.add_node(MeshConfig::default().with_seed(310));
    sim.start_all();
    sim.run_for(30_000);
    assert!(sim.node(a).lowpower_is_radio_up());
    assert_eq!(sim.node(a).lowpower_sleep_time(), 0);
}
