//! Demo configuration, stored as TOML.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use linkbond_core::{BondTemplate, Policy};
use serde::{Deserialize, Serialize};

use crate::proto::FrameKey;

pub const DEFAULT_CONFIG_FILE: &str = "linkbond.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Bond template both endpoints instantiate.
    pub template: BondTemplate,
    /// Simulated links (UDP sockets) per endpoint.
    pub paths_per_node: usize,
    /// How long the demo runs.
    pub run_seconds: u64,
    /// Pre-shared frame key, hex-encoded (32 bytes). Generated by
    /// `init-config`.
    pub psk_hex: Option<String>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        let mut template = BondTemplate::new("demo", Policy::BalanceRr);
        // Snappy intervals so the demo shows failover within seconds.
        template.failover_interval = 1000;
        template.packets_per_link = 8;
        Self {
            template,
            paths_per_node: 2,
            run_seconds: 10,
            psk_hex: None,
        }
    }
}

impl DemoConfig {
    /// Decode the configured pre-shared key, or derive a fixed demo key when
    /// none is set (both endpoints run in-process anyway).
    pub fn frame_key(&self) -> Result<FrameKey> {
        match self.psk_hex.as_deref() {
            Some(hex) => decode_hex_key(hex),
            None => Ok(*b"linkbond-demo-pre-shared-key-32b"),
        }
    }
}

fn decode_hex_key(hex: &str) -> Result<FrameKey> {
    let hex = hex.trim();
    if hex.len() != 64 {
        anyhow::bail!("psk_hex must be 64 hex characters, got {}", hex.len());
    }
    let mut key = [0u8; 32];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .with_context(|| format!("psk_hex has a non-hex digit at offset {}", i * 2))?;
    }
    Ok(key)
}

pub fn encode_hex_key(key: &FrameKey) -> String {
    key.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn load(path: &Path) -> Result<DemoConfig> {
    if !path.exists() {
        return Ok(DemoConfig::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: DemoConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
    Ok(cfg)
}

pub fn save(path: &Path, cfg: &DemoConfig, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        anyhow::bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).context("failed to serialize config to TOML")?;
    fs::write(path, raw).with_context(|| format!("failed to write config: {}", path.display()))?;
    Ok(())
}
