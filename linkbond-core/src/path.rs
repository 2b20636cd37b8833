//! Shared path handles and per-slot runtime state.
//!
//! A `Path` is the immutable (local socket, remote address) identity shared
//! between the bond and the outer routing layer; only its receive/transmit
//! timestamps change, and those are atomics so transport threads can stamp
//! them without any bond lock. Everything else the engine tracks per path
//! lives in the bond-owned `PathSlot`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::constants::{
    DEFAULT_PATH_REFRACTORY_PERIOD, MAX_PATH_REFRACTORY_PERIOD, QOS_TABLE_SIZE, SAMPLE_WINDOW,
};
use crate::link::{IpvPref, LinkMode};
use crate::samples::SampleWindow;
use crate::transport::SocketId;

/// A concrete (local socket, remote address) pair packets can flow over.
#[derive(Debug)]
pub struct Path {
    local_socket: SocketId,
    remote: SocketAddr,
    last_in: AtomicI64,
    last_out: AtomicI64,
}

/// Shared-ownership handle; lifetime is that of the longest holder.
pub type PathHandle = Arc<Path>;

impl Path {
    pub fn new(local_socket: SocketId, remote: SocketAddr) -> PathHandle {
        Arc::new(Self {
            local_socket,
            remote,
            last_in: AtomicI64::new(0),
            last_out: AtomicI64::new(0),
        })
    }

    pub fn local_socket(&self) -> SocketId {
        self.local_socket
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_ipv4(&self) -> bool {
        self.remote.is_ipv4()
    }

    pub fn is_ipv6(&self) -> bool {
        self.remote.is_ipv6()
    }

    pub fn mark_received(&self, now: i64) {
        self.last_in.store(now, Ordering::Relaxed);
    }

    pub fn mark_sent(&self, now: i64) {
        self.last_out.store(now, Ordering::Relaxed);
    }

    pub fn last_in(&self) -> i64 {
        self.last_in.load(Ordering::Relaxed)
    }

    pub fn last_out(&self) -> i64 {
        self.last_out.load(Ordering::Relaxed)
    }

    /// Receive age: time since the last inbound packet.
    pub fn age(&self, now: i64) -> i64 {
        (now - self.last_in()).max(0)
    }
}

/// Bond-owned runtime state for one nominated path. The slot index is the
/// stable identity the flow table and failover queue refer to.
pub(crate) struct PathSlot {
    pub path: Option<PathHandle>,

    // Timestamps
    pub nominated_at: i64,
    pub last_alive_toggle: i64,
    pub last_qos_measurement: i64,

    // Link preferences copied at nomination time
    pub ipv_pref: IpvPref,
    pub mode: LinkMode,
    pub enabled: bool,

    // Eligibility state machine
    pub alive: bool,
    pub eligible: bool,
    pub bonded: bool,
    pub only_path_on_link: bool,
    pub negotiated: bool,
    pub should_reallocate_flows: bool,
    pub refractory_period: i64,

    // Counters
    pub packets_in: u64,
    pub packets_out: u64,
    pub assigned_flow_count: u32,
    pub packets_received_since_last_qos: u32,

    // QoS tables: packet id -> local timestamp. Ordered so measurement
    // payloads drain deterministically.
    pub qos_stats_out: BTreeMap<u64, i64>,
    pub qos_stats_in: BTreeMap<u64, i64>,

    // Sample streams
    pub latency_samples: SampleWindow,
    pub validity_samples: SampleWindow,
    pub qos_outcome_samples: SampleWindow,
    pub qos_record_size: SampleWindow,

    // Derived metrics
    pub latency_mean: f32,
    pub latency_variance: f32,
    pub packet_loss_ratio: f32,
    pub packet_error_ratio: f32,
    pub throughput_mean: f32,

    /// Normalized share of traffic this path deserves (0-255).
    pub allocation: u8,
    pub failover_score: i32,
}

impl Default for PathSlot {
    fn default() -> Self {
        Self {
            path: None,
            nominated_at: 0,
            last_alive_toggle: 0,
            last_qos_measurement: 0,
            ipv_pref: IpvPref::Any,
            mode: LinkMode::Spare,
            enabled: true,
            alive: false,
            eligible: false,
            bonded: false,
            only_path_on_link: true,
            negotiated: false,
            should_reallocate_flows: false,
            refractory_period: 0,
            packets_in: 0,
            packets_out: 0,
            assigned_flow_count: 0,
            packets_received_since_last_qos: 0,
            qos_stats_out: BTreeMap::new(),
            qos_stats_in: BTreeMap::new(),
            latency_samples: SampleWindow::new(SAMPLE_WINDOW),
            validity_samples: SampleWindow::new(SAMPLE_WINDOW),
            qos_outcome_samples: SampleWindow::new(SAMPLE_WINDOW),
            qos_record_size: SampleWindow::new(SAMPLE_WINDOW),
            latency_mean: 0.0,
            latency_variance: 0.0,
            packet_loss_ratio: 0.0,
            packet_error_ratio: 0.0,
            throughput_mean: 0.0,
            allocation: 0,
            failover_score: 0,
        }
    }
}

impl PathSlot {
    /// Occupy this slot with a freshly nominated path.
    pub fn set(&mut self, now: i64, path: PathHandle) {
        *self = PathSlot::default();
        self.nominated_at = now;
        self.last_alive_toggle = now;
        self.path = Some(path);
    }

    pub fn is_occupied(&self) -> bool {
        self.path.is_some()
    }

    /// Whether the engine may use this path at all: enabled and of a family
    /// the user's preference does not rule out.
    pub fn allowed(&self) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        self.enabled
            && match self.ipv_pref {
                IpvPref::V4Only => path.is_ipv4(),
                IpvPref::V6Only => path.is_ipv6(),
                _ => true,
            }
    }

    /// Whether this path matches the user's preferred address family.
    pub fn preferred(&self) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        match self.ipv_pref {
            IpvPref::Any => true,
            IpvPref::V4Only | IpvPref::V4Preferred => path.is_ipv4(),
            IpvPref::V6Only | IpvPref::V6Preferred => path.is_ipv6(),
        }
    }

    /// A QoS measurement is due once records are waiting and either the table
    /// is full or the send interval elapsed.
    pub fn needs_qos(&self, now: i64, qos_send_interval: i64) -> bool {
        self.packets_received_since_last_qos > 0
            && (self.packets_received_since_last_qos as usize >= QOS_TABLE_SIZE
                || (now - self.last_qos_measurement) >= qos_send_interval)
    }

    /// Grow the refractory period on loss of eligibility, drain it while the
    /// path stays eligible.
    pub fn adjust_refractory_period(&mut self, punish: bool) {
        if punish {
            self.refractory_period = (self.refractory_period + DEFAULT_PATH_REFRACTORY_PERIOD)
                .min(MAX_PATH_REFRACTORY_PERIOD);
        } else {
            self.refractory_period /= 2;
        }
    }

    pub fn reset_packet_counts(&mut self) {
        self.packets_in = 0;
        self.packets_out = 0;
    }
}
