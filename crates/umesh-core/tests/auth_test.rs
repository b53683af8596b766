//! Integration tests for joiner authentication through the leader.

#![cfg(feature = "crypto")]

use std::sync::{Arc, Mutex};
use umesh_core::auth::id2::Id2Server;
use umesh_core::{DeviceState, Id2Credentials, MeshConfig, Mode, SimMedium, Simulator};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

const STEP_MS: u64 = 100;

fn secured_leader(sim: &mut Simulator, server: &Arc<Mutex<Id2Server>>) -> usize {
    let leader = sim.add_node(
        MeshConfig::default()
            .with_seed(200)
            .with_mode(Mode::RX_ON.with(Mode::LEADER))
            .with_auth(true),
    );
    sim.connect_auth_server(leader, Arc::clone(server));
    sim.start(leader).expect("leader start");
    leader
}

#[test]
fn test_authenticated_joiner_attaches() {
    init_tracing();
    let credentials = Id2Credentials::new("device-0001", b"device secret");
    let server = Arc::new(Mutex::new(Id2Server::new(Some(1))));
    server.lock().unwrap().register(&credentials);

    let mut sim = Simulator::new(SimMedium::new());
    let leader = secured_leader(&mut sim, &server);
    let joiner = sim.add_node(
        MeshConfig::default()
            .with_seed(201)
            .with_auth(true)
            .with_id2(credentials),
    );
    sim.start(joiner).expect("joiner start");

    let attached = sim.run_until(30_000, STEP_MS, |s| s.node(joiner).is_attached());
    assert!(attached, "authenticated joiner did not attach");
    let node = sim.node(joiner);
    assert!(node.auth_is_authenticated());
    assert_eq!(node.parent(), Some(sim.mac(leader)));
    assert_eq!(node.state(), DeviceState::Router);
}

#[test]
fn test_wrong_secret_is_rejected() {
    init_tracing();
    let server = Arc::new(Mutex::new(Id2Server::new(Some(2))));
    server
        .lock()
        .unwrap()
        .register(&Id2Credentials::new("device-0002", b"right secret"));

    let mut sim = Simulator::new(SimMedium::new());
    let leader = secured_leader(&mut sim, &server);
    let joiner = sim.add_node(
        MeshConfig::default()
            .with_seed(203)
            .with_auth(true)
            .with_id2(Id2Credentials::new("device-0002", b"wrong secret")),
    );
    sim.start(joiner).expect("joiner start");
    sim.run_for(20_000);

    let node = sim.node(joiner);
    assert!(!node.is_attached());
    assert!(!node.auth_is_authenticated());
    assert_ne!(node.parent(), Some(sim.mac(leader)));
}

#[test]
fn test_unknown_device_is_rejected() {
    init_tracing();
    let server = Arc::new(Mutex::new(Id2Server::new(Some(3))));

    let mut sim = Simulator::new(SimMedium::new());
    secured_leader(&mut sim, &server);
    let joiner = sim.add_node(
        MeshConfig::default()
            .with_seed(205)
            .with_auth(true)
            .with_id2(Id2Credentials::new("device-0003", b"secret")),
    );
    sim.start(joiner).expect("joiner start");
    sim.run_for(20_000);

    assert!(!sim.node(joiner).is_attached());
}
