//! End-to-end behavior of the bonding engine against a mock transport,
//! driven by explicit clocks. Covers failover, striping, flow hashing,
//! quality-weighted balancing, the QoS round trip, and path negotiation.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use linkbond_core::constants::{FLOW_MAX, QOS_RECORD_LEN};
use linkbond_core::{
    Bond, BondTemplate, IpvPref, Link, LinkMode, LinkRegistry, Path, PathHandle, PeerContext,
    Policy, SocketId, Transport, Verb,
};

#[derive(Clone)]
struct Sent {
    socket: SocketId,
    #[allow(dead_code)]
    remote: SocketAddr,
    verb: Verb,
    payload: Vec<u8>,
}

#[derive(Default)]
struct MockTransport {
    sent: Mutex<Vec<Sent>>,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn sent_of(&self, verb: Verb) -> Vec<Sent> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.verb == verb)
            .cloned()
            .collect()
    }
}

impl Transport for MockTransport {
    fn ifname(&self, local_socket: SocketId) -> Option<String> {
        Some(format!("eth{local_socket}"))
    }

    fn send_control(&self, socket: SocketId, remote: SocketAddr, verb: Verb, payload: &[u8]) {
        self.sent.lock().unwrap().push(Sent {
            socket,
            remote,
            verb,
            payload: payload.to_vec(),
        });
    }
}

fn peer(local: u64, remote: u64) -> PeerContext {
    PeerContext {
        local_node_id: local,
        peer_id: remote,
        remote_protocol_version: 9,
        multipath_supported: true,
    }
}

fn path_on(socket: SocketId) -> PathHandle {
    Path::new(socket, format!("192.0.2.{}:9993", socket + 1).parse().unwrap())
}

fn feed(bond: &Bond, path: &PathHandle, packet_id: u64, now: i64) {
    bond.record_incoming_packet(path, packet_id, 64, Verb::Frame, None, now);
}

fn simple_bond(policy: Policy) -> (Bond, Arc<MockTransport>) {
    let transport = MockTransport::new();
    let bond = Bond::new(
        peer(1, 2),
        &BondTemplate::new("default", policy),
        Arc::new(LinkRegistry::new()),
        transport.clone(),
    );
    (bond, transport)
}

#[test]
fn test_active_backup_failover() {
    let transport = MockTransport::new();
    let links = Arc::new(LinkRegistry::new());
    links.add_custom_link(
        "ab",
        Link::new("eth0", 0, LinkMode::Primary, IpvPref::Any, None, true),
    );
    links.add_custom_link(
        "ab",
        Link::new("eth1", 0, LinkMode::Spare, IpvPref::Any, None, true),
    );
    let bond = Bond::new(
        peer(1, 2),
        &BondTemplate::new("ab", Policy::ActiveBackup),
        links,
        transport.clone(),
    );

    let a = path_on(0);
    let b = path_on(1);
    bond.nominate_path(a.clone(), 0);
    bond.nominate_path(b.clone(), 0);
    feed(&bond, &a, 11, 100);
    feed(&bond, &b, 13, 100);

    bond.process_background_tasks(200);
    let active = bond.active_path().expect("primary link should be active");
    assert!(Arc::ptr_eq(&active, &a));
    let picked = bond.get_path(300, None).unwrap();
    assert!(Arc::ptr_eq(&picked, &a));

    // Path A goes silent past its trial period and failover interval while B
    // keeps receiving traffic.
    feed(&bond, &b, 15, 19_900);
    bond.process_background_tasks(20_000);

    let active = bond.active_path().expect("failover target expected");
    assert!(Arc::ptr_eq(&active, &b));
    assert_eq!(bond.last_active_path_change(), 20_000);
    let picked = bond.get_path(20_100, None).unwrap();
    assert!(Arc::ptr_eq(&picked, &b));

    // One alive link out of two nominated: degraded but functional.
    assert_eq!(bond.link_counts(), (1, 2));
    assert!(!bond.is_healthy());
}

#[test]
fn test_round_robin_striping() {
    let transport = MockTransport::new();
    let mut template = BondTemplate::new("rr", Policy::BalanceRr);
    template.packets_per_link = 3;
    let bond = Bond::new(peer(1, 2), &template, Arc::new(LinkRegistry::new()), transport);

    let a = path_on(0);
    let b = path_on(1);
    bond.nominate_path(a.clone(), 0);
    bond.nominate_path(b.clone(), 0);
    assert_eq!(bond.num_bonded_paths(), 2);

    let picks: Vec<PathHandle> = (0..6).map(|i| bond.get_path(100 + i, None).unwrap()).collect();
    for p in &picks[0..3] {
        assert!(Arc::ptr_eq(p, &a), "first burst should ride the first path");
    }
    for p in &picks[3..6] {
        assert!(Arc::ptr_eq(p, &b), "second burst should ride the second path");
    }
    // The cycle wraps back to the first path.
    let seventh = bond.get_path(200, None).unwrap();
    assert!(Arc::ptr_eq(&seventh, &a));
}

#[test]
fn test_xor_flow_determinism() {
    let (bond, _transport) = simple_bond(Policy::BalanceXor);
    let a = path_on(0);
    let b = path_on(1);
    bond.nominate_path(a, 0);
    bond.nominate_path(b, 0);

    let first = bond.get_path(10, Some(7)).unwrap();
    for now in 11..30 {
        let again = bond.get_path(now, Some(7)).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }
    // 7 % 2 != 8 % 2, so flow 8 lands on the other slot.
    let other = bond.get_path(40, Some(8)).unwrap();
    assert!(!Arc::ptr_eq(&first, &other));
}

#[test]
fn test_balance_aware_weighting() {
    let (bond, _transport) = simple_bond(Policy::BalanceAware);
    let a = path_on(0);
    let b = path_on(1);
    bond.nominate_path(a.clone(), 0);
    bond.nominate_path(b.clone(), 0);

    // Produce steady latency observations: ~10 ms on A, ~90 ms on B.
    let mut id = 1u64;
    for round in 0..16 {
        let sent = 1000 + round * 100;
        bond.record_outgoing_packet(&a, id, 64, Verb::Frame, None, sent);
        bond.received_qos(&a, sent + 40, &[(id, 20)]);
        id += 2;
        bond.record_outgoing_packet(&b, id, 64, Verb::Frame, None, sent);
        bond.received_qos(&b, sent + 200, &[(id, 20)]);
        id += 2;
    }

    // Quality estimation interval (2 x failover interval) elapsed.
    bond.process_background_tasks(11_000);

    let allocations = bond.allocations();
    assert_eq!(allocations.len(), 2);
    let metrics_a = bond.path_metrics(&a).unwrap();
    let metrics_b = bond.path_metrics(&b).unwrap();
    assert!((metrics_a.latency_mean - 10.0).abs() < 0.5);
    assert!((metrics_b.latency_mean - 90.0).abs() < 0.5);
    assert!(
        metrics_a.allocation > metrics_b.allocation,
        "lower latency must earn the larger allocation ({} vs {})",
        metrics_a.allocation,
        metrics_b.allocation
    );
    let total = metrics_a.allocation as f64 + metrics_b.allocation as f64;

    // Flow assignment frequency tracks the allocation vector.
    let assignments = 10_000;
    let mut on_a = 0usize;
    for flow in 0..assignments {
        let picked = bond.get_path(12_000, Some(flow)).unwrap();
        if Arc::ptr_eq(&picked, &a) {
            on_a += 1;
        }
    }
    let expected = metrics_a.allocation as f64 / total;
    let observed = on_a as f64 / assignments as f64;
    assert!(
        (observed - expected).abs() < 0.025,
        "expected share {expected:.3}, observed {observed:.3}"
    );
    assert_eq!(bond.flow_count() as u64, bond.assigned_flow_total());
}

#[test]
fn test_qos_round_trip() {
    let (sender, _sender_transport) = simple_bond(Policy::BalanceXor);
    let (receiver, receiver_transport) = simple_bond(Policy::BalanceXor);
    let out_path = path_on(0);
    let in_path = path_on(0);
    sender.nominate_path(out_path.clone(), 0);
    receiver.nominate_path(in_path.clone(), 0);

    // 50 tracked (odd-id) packets leave the sender at t=1000 and land on the
    // receiver at t=1050.
    let ids: Vec<u64> = (0..50).map(|i| i * 2 + 1).collect();
    for &id in &ids {
        sender.record_outgoing_packet(&out_path, id, 64, Verb::Frame, None, 1000);
        feed(&receiver, &in_path, id, 1050);
    }
    assert_eq!(
        receiver.path_metrics(&in_path).unwrap().pending_qos_records,
        50
    );

    // The receiver's tick emits a QoS measurement once the send interval
    // elapses; every pending record rides along.
    receiver.process_background_tasks(11_050);
    let qos = receiver_transport.sent_of(Verb::QosMeasurement);
    assert_eq!(qos.len(), 1);
    assert_eq!(qos[0].socket, 0);
    assert_eq!(qos[0].payload.len(), 50 * QOS_RECORD_LEN);
    assert_eq!(
        receiver.path_metrics(&in_path).unwrap().pending_qos_records,
        0
    );

    let records = linkbond_core::qos::decode_qos_records(&qos[0].payload);
    assert_eq!(records.len(), 50);
    // Held for 11050 - 1050 = 10000 ms before reporting.
    assert!(records.iter().all(|&(_, holding)| holding == 10_000));

    // Delivered back to the sender 100 ms later: each sample must equal
    // ((now_recv - now_send) - holding) / 2.
    sender.received_qos(&out_path, 11_100, &records);
    receiver.process_background_tasks(11_200);
    sender.process_background_tasks(11_200);
    let metrics = sender.path_metrics(&out_path).unwrap();
    let expected = ((11_100 - 1000) - 10_000) / 2;
    assert!((metrics.latency_mean - expected as f32).abs() < 0.01);
}

#[test]
fn test_path_negotiation_request_and_tie_break() {
    // Node 1 and node 2 watch the same two paths from opposite ends.
    let transport1 = MockTransport::new();
    let bond1 = Bond::new(
        peer(1, 2),
        &BondTemplate::new("ab", Policy::ActiveBackup),
        Arc::new(LinkRegistry::new()),
        transport1.clone(),
    );
    let transport2 = MockTransport::new();
    let bond2 = Bond::new(
        peer(2, 1),
        &BondTemplate::new("ab", Policy::ActiveBackup),
        Arc::new(LinkRegistry::new()),
        transport2.clone(),
    );

    let a1 = path_on(0);
    let b1 = path_on(1);
    bond1.nominate_path(a1.clone(), 0);
    bond1.nominate_path(b1.clone(), 0);
    let a2 = path_on(0);
    let b2 = path_on(1);
    bond2.nominate_path(a2.clone(), 0);
    bond2.nominate_path(b2.clone(), 0);

    bond1.process_background_tasks(100);
    bond2.process_background_tasks(100);

    // Bond 1 hears the peer mostly on A but sends mostly on B: the link
    // directions disagree, so it petitions the peer on its outbound path.
    for i in 0..10u64 {
        feed(&bond1, &a1, 21 + i * 2, 15_900);
        bond1.record_outgoing_packet(&b1, 41 + i * 2, 64, Verb::Frame, None, 15_900);
        feed(&bond1, &b1, 61 + i * 2, 15_900);
        feed(&bond2, &a2, 81 + i * 2, 15_900);
        feed(&bond2, &b2, 91 + i * 2, 15_900);
    }
    bond1.process_background_tasks(16_000);
    bond2.process_background_tasks(16_000);

    let requests = transport1.sent_of(Verb::PathNegotiationRequest);
    assert_eq!(requests.len(), 1, "bond1 should petition its peer once");
    assert_eq!(requests[0].socket, b1.local_socket());
    let utility = linkbond_core::qos::decode_utility(&requests[0].payload).unwrap();
    assert_eq!(utility, 0);

    // Equal utilities on both ends: only the node with the larger id defers
    // to the petition.
    bond1.process_incoming_path_negotiation_request(16_100, &b1, utility);
    assert!(
        bond1.negotiated_path().is_none(),
        "smaller node id must ignore the tied petition"
    );
    bond2.process_incoming_path_negotiation_request(16_100, &b2, utility);
    let negotiated = bond2
        .negotiated_path()
        .expect("larger node id must adopt the tied petition");
    assert!(Arc::ptr_eq(&negotiated, &b2));
}

#[test]
fn test_flows_reallocated_off_dead_link() {
    let (bond, _transport) = simple_bond(Policy::BalanceXor);
    let a = path_on(0);
    let b = path_on(1);
    bond.nominate_path(a.clone(), 0);
    bond.nominate_path(b.clone(), 0);

    for flow in 0..40 {
        bond.get_path(1000, Some(flow)).unwrap();
    }
    assert_eq!(bond.flow_count(), 40);
    let spread_a = bond.path_metrics(&a).unwrap().assigned_flow_count;
    let spread_b = bond.path_metrics(&b).unwrap().assigned_flow_count;
    assert_eq!(spread_a + spread_b, 40);
    assert!(spread_a > 0 && spread_b > 0);

    // A stops receiving; B stays fresh. Past the trial period A falls out of
    // the bond and its flows must migrate.
    feed(&bond, &a, 101, 1000);
    feed(&bond, &b, 103, 19_900);
    bond.process_background_tasks(20_000);

    assert_eq!(bond.path_metrics(&a).unwrap().assigned_flow_count, 0);
    assert_eq!(bond.path_metrics(&b).unwrap().assigned_flow_count, 40);
    assert_eq!(bond.flow_count() as u64, bond.assigned_flow_total());

    // New flows avoid the dead path entirely.
    for flow in 100..110 {
        let picked = bond.get_path(20_100, Some(flow)).unwrap();
        assert!(Arc::ptr_eq(&picked, &b));
    }
}

#[test]
fn test_flow_table_overflow_evicts_one() {
    let (bond, _transport) = simple_bond(Policy::BalanceXor);
    bond.nominate_path(path_on(0), 0);
    bond.nominate_path(path_on(1), 0);

    for flow in 0..(FLOW_MAX as i32 + 1) {
        bond.get_path(flow as i64, Some(flow)).unwrap();
    }
    assert_eq!(bond.flow_count(), FLOW_MAX);
    assert_eq!(bond.assigned_flow_total(), FLOW_MAX as u64);
}

#[test]
fn test_heartbeats_respect_version_gate() {
    let transport = MockTransport::new();
    let mut old_peer = peer(1, 2);
    old_peer.remote_protocol_version = 3;
    let bond = Bond::new(
        old_peer,
        &BondTemplate::new("bc", Policy::Broadcast),
        Arc::new(LinkRegistry::new()),
        transport.clone(),
    );
    bond.nominate_path(path_on(0), 0);
    bond.process_background_tasks(10_000);
    assert!(transport.sent_of(Verb::Echo).is_empty());

    let transport2 = MockTransport::new();
    let bond2 = Bond::new(
        peer(1, 2),
        &BondTemplate::new("bc", Policy::Broadcast),
        Arc::new(LinkRegistry::new()),
        transport2.clone(),
    );
    bond2.nominate_path(path_on(0), 0);
    bond2.process_background_tasks(10_000);
    assert_eq!(transport2.sent_of(Verb::Echo).len(), 1);
}

#[test]
fn test_allocation_bounds_invariant() {
    let (bond, _transport) = simple_bond(Policy::BalanceAware);
    for socket in 0..4 {
        bond.nominate_path(path_on(socket), 0);
    }
    let mut id = 1u64;
    for round in 0..8 {
        for socket in 0..4 {
            let p = bond.get_path(1000 + round * 10, None).unwrap();
            bond.record_outgoing_packet(&p, id, 64, Verb::Frame, None, 1000 + round * 10);
            bond.received_qos(&p, 1000 + round * 10 + 30 + socket * 10, &[(id, 10)]);
            id += 2;
        }
    }
    bond.process_background_tasks(11_000);
    let allocations = bond.allocations();
    assert!(!allocations.is_empty());
    let total: u32 = allocations.iter().map(|&(_, a)| a as u32).sum();
    assert!(total <= 255 * allocations.len() as u32);
}
