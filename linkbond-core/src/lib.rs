//! Multipath link-bonding engine for peer-to-peer overlay nodes.
//!
//! For each remote peer the engine maintains a set of candidate network paths
//! (one underlying socket + remote address each) and decides, on every
//! outgoing packet, which path to transmit on. It implements five bonding
//! policies (active-backup, broadcast, round-robin, XOR-hashed, and
//! quality-aware balancing), continuously estimates per-path quality from
//! in-band QoS measurements, and transparently fails traffic over when paths
//! degrade.
//!
//! # Architecture
//!
//! - `controller`: process-wide bond registry, policy templates, defaults
//! - `bond`: the per-peer bond state machine and path selector
//! - `link` / `path` / `flow`: the data model (logical links, nominated
//!   paths, tracked flows)
//! - `qos`: wire payloads of the QoS and negotiation protocol
//! - `policy`: bonding policies and reusable templates
//! - `samples`: bounded windows backing the quality estimator
//! - `transport`: the traits the embedding node implements
//!
//! The engine is synchronous and lock-scoped: transport threads call
//! [`Bond::get_path`] and the `record_*` family concurrently, while a timer
//! thread drives [`BondController::process_background_tasks`]. All timestamps
//! are caller-supplied milliseconds.

pub mod bond;
pub mod constants;
pub mod controller;
pub mod error;
pub mod flow;
pub mod link;
pub mod path;
pub mod policy;
pub mod qos;
pub mod samples;
pub mod transport;

pub use bond::{Bond, PathMetrics};
pub use controller::BondController;
pub use error::BondError;
pub use link::{IpvPref, Link, LinkMode, LinkRegistry};
pub use path::{Path, PathHandle};
pub use policy::{BondTemplate, Policy, QualityWeights, ReselectPolicy};
pub use transport::{PeerContext, SocketId, Transport, Verb};
