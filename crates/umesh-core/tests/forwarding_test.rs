//! Integration tests for data forwarding and address resolution.
//!
//! The topology is a chain: the far node cannot hear the leader and
//! reaches it through the router in between.

use umesh_core::forwarder::{MESSAGE_RETRIES, SENDING_TIMEOUT_MS};
use umesh_core::sim::SIM_MTU;
use umesh_core::{MeshAddr, MeshConfig, MeshError, SimHal, SimMedium, Simulator, TxStatus};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

const ATTACH_TIMEOUT_MS: u64 = 30_000;
const STEP_MS: u64 = 100;

struct Chain {
    sim: Simulator,
    leader: usize,
    router: usize,
    far: usize,
}

fn build_chain(seed: u64) -> Chain {
    build_chain_with(seed, 0, SIM_MTU)
}

fn build_chain_with(seed: u64, sec_level: u8, mtu: usize) -> Chain {
    let mut sim = Simulator::new(SimMedium::new());
    let add = |sim: &mut Simulator, index: usize| {
        let hal = SimHal::new(sim.medium(), Simulator::mac_for(index)).with_mtu(mtu);
        let config = MeshConfig::default()
            .with_seed(seed + index as u64)
            .with_sec_level(sec_level);
        sim.add_node_with_hal(config, hal)
    };
    let leader = add(&mut sim, 0);
    let router = add(&mut sim, 1);
    let far = add(&mut sim, 2);
    sim.medium().cut_link(sim.mac(leader), sim.mac(far));

    sim.start(leader).expect("leader start");
    sim.run_for(10_000);
    sim.start(router).expect("router start");
    assert!(sim.run_until(ATTACH_TIMEOUT_MS, STEP_MS, |s| s.node(router).is_attached()));
    sim.start(far).expect("far start");
    assert!(sim.run_until(ATTACH_TIMEOUT_MS, STEP_MS, |s| s.node(far).is_attached()));
    // let advertisements spread the new SIDs
    sim.run_for(2_000);

    Chain {
        sim,
        leader,
        router,
        far,
    }
}

#[test]
fn test_data_to_parent() {
    init_tracing();
    let mut chain = build_chain(100);
    let sim = &mut chain.sim;
    let dest = sim.node(chain.leader).mesh_addr();
    let src = sim.node(chain.router).mesh_addr();

    sim.node_mut(chain.router).send_data(dest, b"hello leader").expect("send");
    sim.run_for(1_000);

    let received = sim.take_received(chain.leader);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, b"hello leader".to_vec());
    assert_eq!(received[0].src, src);
    assert!(sim.node(chain.router).hal_stats(0).out_data >= 1);
}

#[test]
fn test_data_to_child() {
    init_tracing();
    let mut chain = build_chain(110);
    let sim = &mut chain.sim;
    let dest = sim.node(chain.router).mesh_addr();

    sim.node_mut(chain.leader).send_data(dest, b"hello child").expect("send");
    sim.run_for(1_000);

    let received = sim.received(chain.router);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, b"hello child".to_vec());
}

#[test]
fn test_data_crosses_two_hops() {
    init_tracing();
    let mut chain = build_chain(120);
    let sim = &mut chain.sim;
    let dest = sim.node(chain.leader).mesh_addr();
    let src = sim.node(chain.far).mesh_addr();

    sim.node_mut(chain.far).send_data(dest, b"two hops").expect("send");
    sim.run_for(1_000);

    let received = sim.received(chain.leader);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].src, src);
    // The router relayed it without keeping a copy
    assert!(sim.received(chain.router).is_empty());

    // And back down the tree
    let dest = sim.node(chain.far).mesh_addr();
    sim.node_mut(chain.leader).send_data(dest, b"reply").expect("send");
    sim.run_for(1_000);
    let received = sim.received(chain.far);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, b"reply".to_vec());
}

#[test]
fn test_send_by_uuid_queries_leader() {
    init_tracing();
    let mut chain = build_chain(130);
    let sim = &mut chain.sim;
    let target = sim.node(chain.leader).uuid();

    // The leader is not a neighbor, so every send waits on one query
    let payloads: [&[u8]; 3] = [b"by uuid 1", b"by uuid 2", b"by uuid 3"];
    for payload in payloads {
        let result = sim.node_mut(chain.far).send_data_to_uuid(target, payload);
        assert_eq!(result, Err(MeshError::AddressQuery));
    }
    let stats = sim.node(chain.far).stats();
    assert_eq!(stats.address_queries, 1);
    assert_eq!(stats.pending_messages, 3);

    sim.run_for(2_000);

    let stats = sim.node(chain.far).stats();
    assert_eq!(stats.address_queries, 0);
    assert_eq!(stats.pending_messages, 0);
    assert_eq!(stats.address_cache, 1);
    let received: Vec<Vec<u8>> = sim.received(chain.leader).into_iter().map(|r| r.payload).collect();
    let expected: Vec<Vec<u8>> = payloads.iter().map(|p| p.to_vec()).collect();
    assert_eq!(received, expected);
}

#[test]
fn test_neighbor_uuid_needs_no_query() {
    init_tracing();
    let mut chain = build_chain(140);
    let sim = &mut chain.sim;
    let target = sim.node(chain.leader).uuid();

    sim.node_mut(chain.router)
        .send_data_to_uuid(target, b"direct")
        .expect("neighbor is resolved locally");
    sim.run_for(1_000);
    assert_eq!(sim.received(chain.leader).len(), 1);
}

#[test]
fn test_broadcast_floods_once() {
    init_tracing();
    let mut chain = build_chain(150);
    let sim = &mut chain.sim;
    let netid = sim.node(chain.far).meshnetid();

    sim.node_mut(chain.far)
        .send_data(MeshAddr::bcast(netid), b"to all")
        .expect("send");
    sim.run_for(2_000);

    for node in [chain.leader, chain.router] {
        let received = sim.received(node);
        assert_eq!(received.len(), 1, "node {node} got {} copies", received.len());
        assert_eq!(received[0].payload, b"to all".to_vec());
    }
    assert!(sim.received(chain.far).is_empty());
}

#[test]
fn test_detached_node_cannot_send() {
    init_tracing();
    let mut sim = Simulator::new(SimMedium::new());
    let a = sim.add_node(MeshConfig::default().with_seed(160));
    sim.start(a).expect("start");
    let result = sim.node_mut(a).send_data(MeshAddr::short(0x0100, 0), b"early");
    assert_eq!(result, Err(MeshError::Fail));
}

/// Resolve the leader from the far node, leaving it in the far node's cache
fn resolve_leader(chain: &mut Chain) {
    let sim = &mut chain.sim;
    let target = sim.node(chain.leader).uuid();
    let _ = sim.node_mut(chain.far).send_data_to_uuid(target, b"first");
    sim.run_for(2_000);
    assert_eq!(sim.take_received(chain.leader).len(), 1);
    assert_eq!(sim.node(chain.far).stats().address_cache, 1);
}

#[test]
fn test_failed_relay_reports_unreachable() {
    init_tracing();
    let mut chain = build_chain(170);
    resolve_leader(&mut chain);
    let sim = &mut chain.sim;
    let target = sim.node(chain.leader).uuid();

    // The router's driver rejects every frame for the leader
    sim.medium()
        .force_tx_status(sim.mac(chain.router), sim.mac(chain.leader), TxStatus::Failed);
    let errors = sim.node(chain.router).hal_stats(0).out_errors;
    sim.node_mut(chain.far)
        .send_data_to_uuid(target, b"second")
        .expect("leader is cached");
    sim.run_for(500);

    assert!(sim.received(chain.leader).is_empty());
    assert!(sim.node(chain.router).hal_stats(0).out_errors > errors);
    // The router told the source, which forgot the leader
    assert!(sim.node(chain.far).is_attached());
    assert_eq!(sim.node(chain.far).stats().address_cache, 0);

    // A fresh query finds the leader again once the link is back
    sim.medium()
        .clear_tx_status(sim.mac(chain.router), sim.mac(chain.leader));
    let result = sim.node_mut(chain.far).send_data_to_uuid(target, b"third");
    assert_eq!(result, Err(MeshError::AddressQuery));
    sim.run_for(2_000);
    let received = sim.received(chain.leader);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, b"third".to_vec());
}

#[test]
fn test_sending_timeout_retries_then_drops() {
    init_tracing();
    let mut chain = build_chain(180);
    resolve_leader(&mut chain);
    let sim = &mut chain.sim;
    let target = sim.node(chain.leader).uuid();

    // Frames for the leader are accepted but never completed
    sim.medium()
        .force_tx_status(sim.mac(chain.router), sim.mac(chain.leader), TxStatus::Pending);
    let before = sim.node(chain.router).hal_stats(0);
    sim.node_mut(chain.far)
        .send_data_to_uuid(target, b"stuck")
        .expect("leader is cached");

    let budget = 2 * SENDING_TIMEOUT_MS * MESSAGE_RETRIES as u64 + 1_000;
    let far = chain.far;
    assert!(sim.run_until(budget, STEP_MS, |s| s.node(far).stats().address_cache == 0));

    let after = sim.node(chain.router).hal_stats(0);
    assert!(after.sending_timeouts - before.sending_timeouts >= MESSAGE_RETRIES as u64);
    assert!(after.out_errors > before.out_errors);
    assert!(sim.received(chain.leader).is_empty());
    assert!(sim.node(chain.far).is_attached());
}

#[test]
fn test_large_payload_fragments_over_two_hops() {
    init_tracing();
    let payload: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
    for (seed, sec_level) in [(200, 0), (210, 1)] {
        let mut chain = build_chain_with(seed, sec_level, 127);
        let sim = &mut chain.sim;
        let dest = sim.node(chain.leader).mesh_addr();
        let src = sim.node(chain.far).mesh_addr();

        sim.node_mut(chain.far).send_data(dest, &payload).expect("send");
        sim.run_for(2_000);

        let received = sim.received(chain.leader);
        assert_eq!(received.len(), 1, "sec level {sec_level}");
        assert_eq!(received[0].src, src);
        assert_eq!(received[0].payload, payload, "sec level {sec_level}");
        assert!(sim.received(chain.router).is_empty());
    }
}
