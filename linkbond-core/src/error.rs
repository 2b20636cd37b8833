//! Engine error types.
//!
//! Peer-induced conditions (unknown paths, rejected nominations, full QoS
//! tables) are deliberately not errors: the engine ignores them silently per
//! its tolerance policy. These variants cover configuration mistakes a user
//! can actually act on.

#[derive(Debug, thiserror::Error)]
pub enum BondError {
    #[error("unknown bonding policy: {0}")]
    UnknownPolicy(String),

    #[error("unknown link re-selection policy: {0}")]
    UnknownReselectPolicy(String),

    #[error("invalid address-family preference code: {0}")]
    InvalidIpvPref(u8),

    #[error("quality weights must sum to 1.0, got {0}")]
    InvalidQualityWeights(f32),

    #[error("unknown policy template: {0}")]
    UnknownTemplate(String),
}
