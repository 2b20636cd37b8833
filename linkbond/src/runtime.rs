//! Demo endpoints: two in-process overlay nodes exchanging sealed frames
//! over real UDP sockets, each driving its own bonding engine.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use linkbond_core::constants::BACKGROUND_TASK_MIN_INTERVAL;
use linkbond_core::{
    qos, Bond, BondController, Path, PathHandle, Policy, SocketId, Transport, Verb,
};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DemoConfig;
use crate::proto::{Frame, FrameCrypto, NO_FLOW};

const RECV_BUF_SIZE: usize = 2048;
const TRAFFIC_FLOWS: i32 = 4;
const TRAFFIC_PAYLOAD: &[u8] = b"linkbond demo frame";

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The engine's view of this endpoint's sockets: interface names and sealed
/// control-packet transmission.
struct UdpTransport {
    domain: u32,
    crypto: Arc<FrameCrypto>,
    counter: Arc<AtomicU64>,
    sockets: HashMap<SocketId, Arc<UdpSocket>>,
}

impl Transport for UdpTransport {
    fn ifname(&self, local_socket: SocketId) -> Option<String> {
        self.sockets
            .contains_key(&local_socket)
            .then(|| format!("udp{local_socket}"))
    }

    fn send_control(&self, local_socket: SocketId, remote: SocketAddr, verb: Verb, payload: &[u8]) {
        let Some(socket) = self.sockets.get(&local_socket) else {
            return;
        };
        let packet_id = self.counter.fetch_add(1, Ordering::Relaxed);
        match self.crypto.seal(self.domain, verb, packet_id, NO_FLOW, payload) {
            Ok(wire) => {
                let _ = socket.try_send_to(&wire, remote);
            }
            Err(err) => warn!(%err, "failed to seal control frame"),
        }
    }
}

/// One running demo endpoint.
pub struct Endpoint {
    pub name: String,
    pub bond: Arc<Bond>,
    pub controller: Arc<BondController>,
    pub paths: Vec<PathHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl Endpoint {
    /// Surrender the endpoint's task handles for joining after shutdown.
    pub fn into_tasks(self) -> Vec<JoinHandle<()>> {
        self.tasks
    }
}

/// Summary of an endpoint's bond at shutdown.
#[derive(Debug, Clone)]
pub struct EndpointReport {
    pub name: String,
    pub healthy: bool,
    pub nominated: usize,
    pub frames_in: u64,
    pub frames_out: u64,
    pub flows: usize,
}

pub async fn bind_sockets(count: usize) -> Result<(Vec<Arc<UdpSocket>>, Vec<SocketAddr>)> {
    let mut sockets = Vec::with_capacity(count);
    let mut addrs = Vec::with_capacity(count);
    for _ in 0..count {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .context("failed to bind UDP socket")?;
        addrs.push(socket.local_addr()?);
        sockets.push(Arc::new(socket));
    }
    Ok((sockets, addrs))
}

/// Start an endpoint: build its controller and bond, nominate one path per
/// socket toward the peer, and spawn receive/tick/traffic tasks.
pub fn start_endpoint(
    name: &str,
    node_id: u64,
    peer_id: u64,
    cfg: &DemoConfig,
    sockets: Vec<Arc<UdpSocket>>,
    peer_addrs: &[SocketAddr],
    stop: watch::Receiver<bool>,
) -> Result<Endpoint> {
    let crypto = Arc::new(FrameCrypto::new(&cfg.frame_key()?));
    let counter = Arc::new(AtomicU64::new(1));
    let socket_map: HashMap<SocketId, Arc<UdpSocket>> = sockets
        .iter()
        .enumerate()
        .map(|(i, s)| (i as SocketId, s.clone()))
        .collect();
    let transport = Arc::new(UdpTransport {
        domain: node_id as u32,
        crypto: crypto.clone(),
        counter: counter.clone(),
        sockets: socket_map,
    });

    let controller = Arc::new(BondController::new(transport));
    controller.add_policy_template(cfg.template.clone());
    if !controller.set_default_template(&cfg.template.alias) {
        anyhow::bail!("failed to register bond template {}", cfg.template.alias);
    }

    let peer = linkbond_core::PeerContext {
        local_node_id: node_id,
        peer_id,
        remote_protocol_version: 9,
        multipath_supported: true,
    };
    let bond = controller
        .create_transport_triggered_bond(peer)
        .context("no bonding policy configured")?;

    let now = now_ms();
    let mut paths = Vec::with_capacity(peer_addrs.len());
    for (i, addr) in peer_addrs.iter().enumerate() {
        let path = Path::new(i as SocketId, *addr);
        bond.nominate_path(path.clone(), now);
        paths.push(path);
    }
    info!(
        endpoint = name,
        policy = %bond.policy(),
        paths = paths.len(),
        "endpoint started"
    );

    let mut tasks = Vec::new();

    // One receive loop per socket; each datagram is attributed to the path
    // riding that socket.
    for (i, socket) in sockets.iter().enumerate() {
        let socket = socket.clone();
        let bond = bond.clone();
        let crypto = crypto.clone();
        let path = paths[i].clone();
        let name = name.to_string();
        let peer_domain = peer_id as u32;
        let mut stop = stop.clone();
        tasks.push(tokio::spawn(async move {
            let mut buf = [0u8; RECV_BUF_SIZE];
            loop {
                tokio::select! {
                    recv = socket.recv_from(&mut buf) => {
                        match recv {
                            Ok((n, _from)) => {
                                handle_datagram(&name, &bond, &crypto, peer_domain, &path, &buf[..n]);
                            }
                            Err(err) => {
                                warn!(endpoint = name.as_str(), %err, "UDP receive failed");
                            }
                        }
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    // Background tick driving curation, QoS, heartbeats, and failover.
    {
        let controller = controller.clone();
        let mut stop = stop.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_millis(BACKGROUND_TASK_MIN_INTERVAL as u64));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        controller.process_background_tasks(now_ms());
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    // Traffic generator: a handful of flows, each asking the bond for its
    // path on every send.
    {
        let bond = bond.clone();
        let crypto = crypto.clone();
        let counter = counter.clone();
        let sockets = sockets.clone();
        let all_paths = paths.clone();
        let name = name.to_string();
        let domain = node_id as u32;
        let broadcast = cfg.template.policy == Policy::Broadcast;
        let mut stop = stop.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(25));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        for flow in 0..TRAFFIC_FLOWS {
                            let now = now_ms();
                            let targets: Vec<PathHandle> = match bond.get_path(now, Some(flow)) {
                                Some(path) => vec![path],
                                None if broadcast => all_paths.clone(),
                                None => {
                                    debug!(endpoint = name.as_str(), flow, "no eligible path");
                                    continue;
                                }
                            };
                            for path in targets {
                                send_frame(&name, &bond, &crypto, &counter, &sockets, domain, &path, flow, now);
                            }
                        }
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    Ok(Endpoint {
        name: name.to_string(),
        bond,
        controller,
        paths,
        tasks,
    })
}

#[allow(clippy::too_many_arguments)]
fn send_frame(
    name: &str,
    bond: &Bond,
    crypto: &FrameCrypto,
    counter: &AtomicU64,
    sockets: &[Arc<UdpSocket>],
    domain: u32,
    path: &PathHandle,
    flow: i32,
    now: i64,
) {
    let packet_id = counter.fetch_add(1, Ordering::Relaxed);
    let wire = match crypto.seal(domain, Verb::Frame, packet_id, flow, TRAFFIC_PAYLOAD) {
        Ok(wire) => wire,
        Err(err) => {
            warn!(endpoint = name, %err, "failed to seal frame");
            return;
        }
    };
    let Some(socket) = sockets.get(path.local_socket() as usize) else {
        return;
    };
    let _ = socket.try_send_to(&wire, path.remote());
    bond.record_outgoing_packet(
        path,
        packet_id,
        TRAFFIC_PAYLOAD.len() as u16,
        Verb::Frame,
        Some(flow),
        now,
    );
}

fn handle_datagram(
    name: &str,
    bond: &Bond,
    crypto: &FrameCrypto,
    peer_domain: u32,
    path: &PathHandle,
    datagram: &[u8],
) {
    let now = now_ms();
    let frame = match Frame::decode(datagram) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(endpoint = name, %err, "undecodable datagram");
            bond.record_incoming_invalid_packet(path);
            return;
        }
    };
    let payload = match crypto.open(peer_domain, &frame) {
        Ok(payload) => payload,
        Err(err) => {
            debug!(endpoint = name, %err, "frame failed authentication");
            bond.record_incoming_invalid_packet(path);
            return;
        }
    };
    let header = &frame.header;
    let flow = (header.flow_id != NO_FLOW).then_some(header.flow_id);
    match header.verb {
        Verb::QosMeasurement => {
            bond.record_incoming_packet(path, header.packet_id, payload.len() as u16, header.verb, None, now);
            let records = qos::decode_qos_records(&payload);
            bond.received_qos(path, now, &records);
        }
        Verb::PathNegotiationRequest => {
            bond.record_incoming_packet(path, header.packet_id, payload.len() as u16, header.verb, None, now);
            if let Some(utility) = qos::decode_utility(&payload) {
                bond.process_incoming_path_negotiation_request(now, path, utility);
            }
        }
        _ => {
            bond.record_incoming_packet(path, header.packet_id, payload.len() as u16, header.verb, flow, now);
        }
    }
}

pub fn report(endpoint: &Endpoint) -> EndpointReport {
    let mut frames_in = 0;
    let mut frames_out = 0;
    for path in &endpoint.paths {
        if let Some(metrics) = endpoint.bond.path_metrics(path) {
            frames_in += metrics.packets_in;
            frames_out += metrics.packets_out;
            info!(
                endpoint = endpoint.name.as_str(),
                remote = %path.remote(),
                alive = metrics.alive,
                eligible = metrics.eligible,
                bonded = metrics.bonded,
                packets_in = metrics.packets_in,
                packets_out = metrics.packets_out,
                latency = metrics.latency_mean,
                allocation = metrics.allocation,
                "path summary"
            );
        }
    }
    EndpointReport {
        name: endpoint.name.clone(),
        healthy: endpoint.bond.is_healthy(),
        nominated: endpoint.bond.path_count(),
        frames_in,
        frames_out,
        flows: endpoint.bond.flow_count(),
    }
}

/// Run two endpoints against each other over loopback for the configured
/// duration (or until the external stop fires) and report both bonds.
pub async fn run_demo(
    cfg: DemoConfig,
    mut external_stop: watch::Receiver<bool>,
) -> Result<(EndpointReport, EndpointReport)> {
    let (stop_tx, stop_rx) = watch::channel(false);

    let (a_sockets, a_addrs) = bind_sockets(cfg.paths_per_node).await?;
    let (b_sockets, b_addrs) = bind_sockets(cfg.paths_per_node).await?;

    let alpha = start_endpoint(
        "alpha",
        0xA1FA,
        0xBE7A,
        &cfg,
        a_sockets,
        &b_addrs,
        stop_rx.clone(),
    )?;
    let beta = start_endpoint(
        "beta",
        0xBE7A,
        0xA1FA,
        &cfg,
        b_sockets,
        &a_addrs,
        stop_rx,
    )?;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(cfg.run_seconds)) => {
            info!(seconds = cfg.run_seconds, "demo duration elapsed");
        }
        _ = external_stop.changed() => {
            info!("stop requested");
        }
    }
    let _ = stop_tx.send(true);

    let alpha_report = report(&alpha);
    let beta_report = report(&beta);
    for endpoint in [alpha, beta] {
        for task in endpoint.into_tasks() {
            let _ = task.await;
        }
    }
    Ok((alpha_report, beta_report))
}
