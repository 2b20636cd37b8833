//! Bonding policies, re-selection modes, and policy templates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{FAILOVER_DEFAULT_INTERVAL, FAILOVER_MIN_INTERVAL};
use crate::error::BondError;

/// The five bonding policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    ActiveBackup,
    Broadcast,
    BalanceRr,
    BalanceXor,
    BalanceAware,
}

impl Policy {
    pub fn code(self) -> u8 {
        match self {
            Policy::ActiveBackup => 1,
            Policy::Broadcast => 2,
            Policy::BalanceRr => 3,
            Policy::BalanceXor => 4,
            Policy::BalanceAware => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Policy::ActiveBackup,
            2 => Policy::Broadcast,
            3 => Policy::BalanceRr,
            4 => Policy::BalanceXor,
            5 => Policy::BalanceAware,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Policy::ActiveBackup => "active-backup",
            Policy::Broadcast => "broadcast",
            Policy::BalanceRr => "balance-rr",
            Policy::BalanceXor => "balance-xor",
            Policy::BalanceAware => "balance-aware",
        }
    }

    pub fn is_balance(self) -> bool {
        matches!(
            self,
            Policy::BalanceRr | Policy::BalanceXor | Policy::BalanceAware
        )
    }

    /// Whether flows are pinned to paths by fingerprint under this policy.
    pub fn allows_flow_hashing(self) -> bool {
        matches!(self, Policy::BalanceXor | Policy::BalanceAware)
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Policy {
    type Err = BondError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "active-backup" => Policy::ActiveBackup,
            "broadcast" => Policy::Broadcast,
            "balance-rr" => Policy::BalanceRr,
            "balance-xor" => Policy::BalanceXor,
            "balance-aware" => Policy::BalanceAware,
            other => return Err(BondError::UnknownPolicy(other.to_string())),
        })
    }
}

/// When active-backup considers moving off the current active link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReselectPolicy {
    /// Only when the active link fails.
    #[default]
    Failure,
    /// Return to a primary link as soon as one is available.
    Always,
    /// Return to a primary link only when it scores higher.
    Better,
    /// Chase the best-scoring link, with negotiation and flap damping.
    Optimize,
}

impl FromStr for ReselectPolicy {
    type Err = BondError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "failure" => ReselectPolicy::Failure,
            "always" => ReselectPolicy::Always,
            "better" => ReselectPolicy::Better,
            "optimize" => ReselectPolicy::Optimize,
            other => return Err(BondError::UnknownReselectPolicy(other.to_string())),
        })
    }
}

/// Contribution weights of the six quality metrics: latency, throughput
/// mean, delay variance, loss ratio, error ratio, and capacity. Must sum to
/// 1 to be accepted as an override.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityWeights {
    pub lat: f32,
    pub ltm: f32,
    pub pdv: f32,
    pub plr: f32,
    pub per: f32,
    pub scp: f32,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            lat: 0.3,
            ltm: 0.1,
            pdv: 0.3,
            plr: 0.1,
            per: 0.1,
            scp: 0.1,
        }
    }
}

impl QualityWeights {
    pub fn sum(&self) -> f32 {
        self.lat + self.ltm + self.pdv + self.plr + self.per + self.scp
    }
}

/// A named, reusable bond configuration. Bonds instantiated from a template
/// inherit its intervals, re-selection mode, and quality weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BondTemplate {
    pub alias: String,
    pub policy: Policy,
    #[serde(default = "default_failover_interval")]
    pub failover_interval: i64,
    #[serde(default)]
    pub up_delay: i64,
    #[serde(default)]
    pub down_delay: i64,
    #[serde(default)]
    pub packets_per_link: u32,
    #[serde(default)]
    pub reselect: ReselectPolicy,
    #[serde(default)]
    pub weights: QualityWeights,
}

fn default_failover_interval() -> i64 {
    FAILOVER_DEFAULT_INTERVAL
}

impl BondTemplate {
    /// A template carrying the policy's stock defaults.
    pub fn new(alias: impl Into<String>, policy: Policy) -> Self {
        let mut template = Self {
            alias: alias.into(),
            policy,
            failover_interval: FAILOVER_DEFAULT_INTERVAL,
            up_delay: 0,
            down_delay: 0,
            packets_per_link: 0,
            reselect: ReselectPolicy::default(),
            weights: QualityWeights::default(),
        };
        match policy {
            Policy::ActiveBackup => template.reselect = ReselectPolicy::Optimize,
            Policy::Broadcast => template.down_delay = 30_000,
            Policy::BalanceRr => template.packets_per_link = 64,
            Policy::BalanceXor | Policy::BalanceAware => {}
        }
        template
    }

    /// Failover interval clamped to the supported minimum.
    pub fn effective_failover_interval(&self) -> i64 {
        self.failover_interval.max(FAILOVER_MIN_INTERVAL)
    }

    /// Override the quality weights; rejected unless they sum to 1 +- 0.01.
    pub fn set_quality_weights(&mut self, weights: QualityWeights) -> Result<(), BondError> {
        let sum = weights.sum();
        if !(0.99..=1.01).contains(&sum) {
            return Err(BondError::InvalidQualityWeights(sum));
        }
        self.weights = weights;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_codes_and_names() {
        for policy in [
            Policy::ActiveBackup,
            Policy::Broadcast,
            Policy::BalanceRr,
            Policy::BalanceXor,
            Policy::BalanceAware,
        ] {
            assert_eq!(Policy::from_code(policy.code()), Some(policy));
            assert_eq!(policy.name().parse::<Policy>().unwrap(), policy);
        }
        assert!(Policy::from_code(0).is_none());
        assert!("balance-tcp".parse::<Policy>().is_err());
    }

    #[test]
    fn test_flow_hashing_policies() {
        assert!(Policy::BalanceXor.allows_flow_hashing());
        assert!(Policy::BalanceAware.allows_flow_hashing());
        assert!(!Policy::BalanceRr.allows_flow_hashing());
        assert!(!Policy::ActiveBackup.allows_flow_hashing());
    }

    #[test]
    fn test_template_policy_defaults() {
        assert_eq!(
            BondTemplate::new("ab", Policy::ActiveBackup).reselect,
            ReselectPolicy::Optimize
        );
        assert_eq!(
            BondTemplate::new("bc", Policy::Broadcast).down_delay,
            30_000
        );
        assert_eq!(
            BondTemplate::new("rr", Policy::BalanceRr).packets_per_link,
            64
        );
    }

    #[test]
    fn test_failover_interval_clamp() {
        let mut t = BondTemplate::new("t", Policy::ActiveBackup);
        t.failover_interval = 10;
        assert_eq!(t.effective_failover_interval(), FAILOVER_MIN_INTERVAL);
        t.failover_interval = 9000;
        assert_eq!(t.effective_failover_interval(), 9000);
    }

    #[test]
    fn test_quality_weight_validation() {
        let mut t = BondTemplate::new("t", Policy::BalanceAware);
        let bad = QualityWeights {
            lat: 0.9,
            ltm: 0.9,
            pdv: 0.0,
            plr: 0.0,
            per: 0.0,
            scp: 0.0,
        };
        assert!(t.set_quality_weights(bad).is_err());
        let good = QualityWeights {
            lat: 0.5,
            ltm: 0.0,
            pdv: 0.3,
            plr: 0.1,
            per: 0.1,
            scp: 0.0,
        };
        assert!(t.set_quality_weights(good).is_ok());
        assert_eq!(t.weights.lat, 0.5);
    }
}
