//! Tunable constants for the bonding engine.
//!
//! All intervals and ages are in milliseconds. Values marked as defaults can
//! be overridden per policy template; the rest are engine-wide limits.

/// Maximum number of paths a single bond will track. Slot indices are stable
/// identities in `0..MAX_PATHS`; `MAX_PATHS` itself never names a real slot.
pub const MAX_PATHS: usize = 16;

/// Maximum number of flows tracked per bond before the oldest is evicted.
pub const FLOW_MAX: usize = 65535;

/// Default failover interval: a path that has not received anything for this
/// long is no longer considered alive.
pub const FAILOVER_DEFAULT_INTERVAL: i64 = 5000;

/// Lower bound for user-supplied failover intervals.
pub const FAILOVER_MIN_INTERVAL: i64 = 250;

/// Heartbeats sent per failover interval (monitor interval divisor).
pub const ECHOS_PER_FAILOVER_INTERVAL: i64 = 3;

/// How long a newly nominated path stays in its trial period, how often the
/// optimize re-selection and path negotiation steps may run, and the minimum
/// dwell time between optimize-mode active-link switches.
pub const OPTIMIZE_INTERVAL: i64 = 15000;

/// Minimum spacing between per-bond background ticks.
pub const BACKGROUND_TASK_MIN_INTERVAL: i64 = 100;

/// Idle age after which a flow is forgotten; also the spacing of the
/// flow-expiration sweep.
pub const PATH_EXPIRATION: i64 = 120_000;

/// Spacing of the periodic bond status report.
pub const STATUS_INTERVAL: i64 = 30_000;

/// Outgoing QoS records older than this are reclassified as lost.
pub const QOS_RECORD_TIMEOUT: i64 = 5000;

/// Packet ids are tracked for QoS when `id & (QOS_ACK_DIVISOR - 1) != 0`.
pub const QOS_ACK_DIVISOR: u64 = 0x2;

/// Upper bound on the serialized QoS-measurement payload.
pub const QOS_MAX_PACKET_SIZE: usize = 1400;

/// Wire size of one QoS record: packet id (u64) + holding time (u16).
pub const QOS_RECORD_LEN: usize = 10;

/// Maximum number of records carried by one QoS measurement.
pub const QOS_TABLE_SIZE: usize = QOS_MAX_PACKET_SIZE / QOS_RECORD_LEN;

/// Cap on outstanding (unacknowledged) outgoing QoS records per path.
pub const QOS_MAX_OUTSTANDING: usize = 1024;

/// Capacity of the per-path sample windows (latency, validity, QoS outcome,
/// QoS record size).
pub const SAMPLE_WINDOW: usize = 32;

/// Failover-score handicaps for user-designated path properties.
pub const HANDICAP_PREFERRED: i32 = 500;
pub const HANDICAP_PRIMARY: i32 = 1000;
pub const HANDICAP_NEGOTIATED: i32 = 5000;

/// Minimum score advantage, as a fraction of the active path's allocation,
/// required before optimize mode switches the active link.
pub const ACTIVE_BACKUP_OPTIMIZE_MIN_THRESHOLD: f32 = 0.1;

/// Window within which at most `PATH_NEGOTIATION_TRY_COUNT` negotiation
/// requests are sent before giving up.
pub const PATH_NEGOTIATION_CUTOFF_TIME: i64 = 60_000;
pub const PATH_NEGOTIATION_TRY_COUNT: u32 = 3;

/// Refractory period applied to a path each time it loses eligibility, and
/// the cap it saturates at.
pub const DEFAULT_PATH_REFRACTORY_PERIOD: i64 = 8000;
pub const MAX_PATH_REFRACTORY_PERIOD: i64 = 60_000;

/// Peers below this protocol version do not understand ECHO heartbeats.
pub const ECHO_MIN_PROTOCOL_VERSION: u8 = 5;

/// Acceptable upper bounds used to normalize raw quality observations.
pub const MAX_ACCEPTABLE_LATENCY: f32 = 100.0;
pub const MAX_ACCEPTABLE_PDV: f32 = 50.0;
pub const MAX_ACCEPTABLE_PLR: f32 = 0.10;
pub const MAX_ACCEPTABLE_PER: f32 = 0.10;
