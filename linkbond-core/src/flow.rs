//! Per-peer flow table.
//!
//! Flows are application streams identified by an opaque 32-bit fingerprint
//! stamped by the upper layer. The table remembers which path slot each flow
//! was pinned to so flow-hashed policies keep a stream on one path; it is
//! bounded, evicting the most idle flow on overflow.

use std::collections::HashMap;

use crate::constants::FLOW_MAX;

/// One tracked application stream.
#[derive(Debug, Clone)]
pub struct Flow {
    pub id: i32,
    pub created_at: i64,
    pub last_activity: i64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Slot index of the path this flow is pinned to.
    pub assigned_path: usize,
}

impl Flow {
    pub fn new(id: i32, now: i64) -> Self {
        Self {
            id,
            created_at: now,
            last_activity: now,
            bytes_in: 0,
            bytes_out: 0,
            assigned_path: 0,
        }
    }

    /// Idle age: time since the flow last saw traffic.
    pub fn age(&self, now: i64) -> i64 {
        (now - self.last_activity).max(0)
    }
}

/// Bounded fingerprint -> flow map.
#[derive(Debug, Default)]
pub struct FlowTable {
    flows: HashMap<i32, Flow>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.flows.len() >= FLOW_MAX
    }

    pub fn contains(&self, flow_id: i32) -> bool {
        self.flows.contains_key(&flow_id)
    }

    pub fn get(&self, flow_id: i32) -> Option<&Flow> {
        self.flows.get(&flow_id)
    }

    pub fn get_mut(&mut self, flow_id: i32) -> Option<&mut Flow> {
        self.flows.get_mut(&flow_id)
    }

    pub fn insert(&mut self, flow: Flow) {
        self.flows.insert(flow.id, flow);
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Flow> {
        self.flows.values_mut()
    }

    /// Remove and return the single most idle flow.
    pub fn evict_most_idle(&mut self, now: i64) -> Option<Flow> {
        let id = self
            .flows
            .values()
            .max_by_key(|f| f.age(now))
            .map(|f| f.id)?;
        self.flows.remove(&id)
    }

    /// Remove and return every flow idle for longer than `age`.
    pub fn expire_idle(&mut self, age: i64, now: i64) -> Vec<Flow> {
        // Collect-then-delete so expiration never iterates a map it mutates.
        let expired: Vec<i32> = self
            .flows
            .values()
            .filter(|f| f.age(now) > age)
            .map(|f| f.id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.flows.remove(&id))
            .collect()
    }
}
