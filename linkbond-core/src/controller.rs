//! Process-wide bond registry and construction.
//!
//! One `BondController` exists per node. It owns every per-peer bond, the
//! named policy templates, peer-to-template assignments, and (shared with the
//! bonds) the link registry. Registry state sits behind its own mutex, held
//! only for registration and lookup, never across I/O; link maps have their
//! own lock inside `LinkRegistry`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::bond::Bond;
use crate::constants::FAILOVER_DEFAULT_INTERVAL;
use crate::link::{Link, LinkRegistry};
use crate::policy::{BondTemplate, Policy};
use crate::transport::{PeerContext, Transport};

#[derive(Default)]
struct Registry {
    default_policy: Option<Policy>,
    default_template: Option<String>,
    templates: HashMap<String, BondTemplate>,
    assignments: HashMap<u64, String>,
    bonds: HashMap<u64, Arc<Bond>>,
    min_monitor_interval: i64,
}

/// Explicitly passed context for everything bonds share process-wide.
pub struct BondController {
    transport: Arc<dyn Transport>,
    links: Arc<LinkRegistry>,
    registry: Mutex<Registry>,
}

impl BondController {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            links: Arc::new(LinkRegistry::new()),
            registry: Mutex::new(Registry {
                min_monitor_interval: FAILOVER_DEFAULT_INTERVAL,
                ..Registry::default()
            }),
        }
    }

    pub fn links(&self) -> &Arc<LinkRegistry> {
        &self.links
    }

    /// Policy used for peers with no assignment and no default template.
    pub fn set_default_policy(&self, policy: Policy) {
        self.registry.lock().unwrap().default_policy = Some(policy);
    }

    /// Name a registered template as the default. Fails when unknown.
    pub fn set_default_template(&self, alias: &str) -> bool {
        let mut reg = self.registry.lock().unwrap();
        if !reg.templates.contains_key(alias) {
            return false;
        }
        reg.default_template = Some(alias.to_string());
        true
    }

    /// Register a policy template; the first registration of an alias wins.
    pub fn add_policy_template(&self, template: BondTemplate) -> bool {
        let mut reg = self.registry.lock().unwrap();
        if reg.templates.contains_key(&template.alias) {
            return false;
        }
        reg.templates.insert(template.alias.clone(), template);
        true
    }

    /// Pin a peer to a named template; first assignment wins.
    pub fn assign_policy_to_peer(&self, peer_id: u64, alias: &str) -> bool {
        let mut reg = self.registry.lock().unwrap();
        if reg.assignments.contains_key(&peer_id) {
            return false;
        }
        reg.assignments.insert(peer_id, alias.to_string());
        true
    }

    /// Register a user-defined link under a template.
    pub fn add_custom_link(&self, template: &str, link: Link) {
        self.links.add_custom_link(template, link);
    }

    pub fn bond_for_peer(&self, peer_id: u64) -> Option<Arc<Bond>> {
        self.registry.lock().unwrap().bonds.get(&peer_id).cloned()
    }

    /// Forget a peer entirely; its bond dies with it.
    pub fn forget_peer(&self, peer_id: u64) {
        let mut reg = self.registry.lock().unwrap();
        if reg.bonds.remove(&peer_id).is_some() {
            debug!(peer = peer_id, "forget bond");
        }
    }

    /// Create (or return) the bond for a peer the transport just learned a
    /// path to. Policy resolution: peer-specific assignment, then the default
    /// template, then the default policy code; with none of those set, no
    /// bond is created.
    pub fn create_transport_triggered_bond(&self, peer: PeerContext) -> Option<Arc<Bond>> {
        let mut reg = self.registry.lock().unwrap();
        if let Some(existing) = reg.bonds.get(&peer.peer_id) {
            return Some(existing.clone());
        }

        let template = match reg.assignments.get(&peer.peer_id) {
            Some(alias) => match reg.templates.get(alias) {
                Some(template) => {
                    info!(peer = peer.peer_id, template = alias.as_str(), "new peer-specific bond");
                    template.clone()
                }
                None => {
                    let policy = reg.default_policy?;
                    warn!(
                        peer = peer.peer_id,
                        template = alias.as_str(),
                        fallback = %policy,
                        "assigned template not found, using default policy"
                    );
                    BondTemplate::new(policy.name(), policy)
                }
            },
            None => {
                if let Some(template) = reg
                    .default_template
                    .as_ref()
                    .and_then(|alias| reg.templates.get(alias))
                {
                    info!(peer = peer.peer_id, template = template.alias.as_str(), "new default custom bond");
                    template.clone()
                } else {
                    let policy = reg.default_policy?;
                    info!(peer = peer.peer_id, policy = %policy, "new default bond");
                    BondTemplate::new(policy.name(), policy)
                }
            }
        };

        let bond = Arc::new(Bond::new(
            peer.clone(),
            &template,
            self.links.clone(),
            self.transport.clone(),
        ));
        reg.bonds.insert(peer.peer_id, bond.clone());
        Some(bond)
    }

    /// Tick every bond and refresh the minimum monitor interval the outer
    /// scheduler must honor. Returns that interval.
    pub fn process_background_tasks(&self, now: i64) -> i64 {
        let bonds: Vec<Arc<Bond>> = {
            let reg = self.registry.lock().unwrap();
            reg.bonds.values().cloned().collect()
        };
        let mut min_interval = FAILOVER_DEFAULT_INTERVAL;
        for bond in &bonds {
            min_interval = min_interval.min(bond.monitor_interval());
            bond.process_background_tasks(now);
        }
        self.registry.lock().unwrap().min_monitor_interval = min_interval;
        min_interval
    }

    /// The most recently computed minimum required monitor interval.
    pub fn min_monitor_interval(&self) -> i64 {
        self.registry.lock().unwrap().min_monitor_interval
    }
}
