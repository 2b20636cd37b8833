//! User-defined logical links and the process-wide link registry.
//!
//! A link is a logical network interface participating in a policy template.
//! Paths resolve to links through the local socket they are bound to; sockets
//! on interfaces the user never mentioned get a spare link auto-registered on
//! first sight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BondError;
use crate::transport::{SocketId, Transport};

/// Address-family preference of a link.
///
/// Numeric codes follow the configuration surface: 0 = any, 4/6 = only that
/// family, 46/64 = prefer the first family but settle for the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum IpvPref {
    #[default]
    Any,
    V4Only,
    V6Only,
    V4Preferred,
    V6Preferred,
}

impl IpvPref {
    pub fn code(self) -> u8 {
        match self {
            IpvPref::Any => 0,
            IpvPref::V4Only => 4,
            IpvPref::V6Only => 6,
            IpvPref::V4Preferred => 46,
            IpvPref::V6Preferred => 64,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, BondError> {
        Ok(match code {
            0 => IpvPref::Any,
            4 => IpvPref::V4Only,
            6 => IpvPref::V6Only,
            46 => IpvPref::V4Preferred,
            64 => IpvPref::V6Preferred,
            other => return Err(BondError::InvalidIpvPref(other)),
        })
    }
}

impl TryFrom<u8> for IpvPref {
    type Error = BondError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        IpvPref::from_code(code)
    }
}

impl From<IpvPref> for u8 {
    fn from(pref: IpvPref) -> u8 {
        pref.code()
    }
}

/// Role of a link within its bond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkMode {
    Primary,
    #[default]
    Spare,
}

/// A logical interface participating in a policy template.
///
/// Links are immutable once registered and shared by reference; everything
/// that varies at runtime lives on the path slots instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    ifname: String,
    /// User-stated speed in arbitrary units, 0 when unknown.
    #[serde(default)]
    speed: u32,
    #[serde(default)]
    mode: LinkMode,
    #[serde(default)]
    ipv_pref: IpvPref,
    /// Interface to fail over to, forming a directed chain.
    #[serde(default)]
    failover_to: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(skip)]
    user_specified: bool,
}

fn default_true() -> bool {
    true
}

impl Link {
    pub fn new(
        ifname: impl Into<String>,
        speed: u32,
        mode: LinkMode,
        ipv_pref: IpvPref,
        failover_to: Option<String>,
        enabled: bool,
    ) -> Self {
        Self {
            ifname: ifname.into(),
            speed,
            mode,
            ipv_pref,
            failover_to,
            enabled,
            user_specified: false,
        }
    }

    /// A spare link auto-registered for an interface the user never declared.
    pub fn spare(ifname: impl Into<String>) -> Self {
        Self::new(ifname, 0, LinkMode::Spare, IpvPref::Any, None, true)
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    pub fn speed(&self) -> u32 {
        self.speed
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    pub fn is_primary(&self) -> bool {
        self.mode == LinkMode::Primary
    }

    pub fn ipv_pref(&self) -> IpvPref {
        self.ipv_pref
    }

    pub fn failover_to(&self) -> Option<&str> {
        self.failover_to.as_deref()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_user_specified(&self) -> bool {
        self.user_specified
    }
}

/// Aggregate facts about the user-specified links of one template, scanned
/// when a bond is constructed.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserLinkFlags {
    pub has_links: bool,
    pub has_primary_link: bool,
    pub has_failover_instructions: bool,
    pub has_link_speeds: bool,
}

#[derive(Default)]
struct LinkMaps {
    /// Template -> user-declared link set (drives `link_allowed`).
    definitions: HashMap<String, Vec<Arc<Link>>>,
    /// Template -> interface name -> link (includes auto-registered spares).
    by_interface: HashMap<String, HashMap<String, Arc<Link>>>,
}

/// Process-wide catalog of links per policy template.
#[derive(Default)]
pub struct LinkRegistry {
    inner: Mutex<LinkMaps>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user-defined link under a template.
    pub fn add_custom_link(&self, template: &str, mut link: Link) {
        link.user_specified = true;
        let link = Arc::new(link);
        let mut maps = self.inner.lock().unwrap();
        maps.definitions
            .entry(template.to_string())
            .or_default()
            .push(link.clone());
        maps.by_interface
            .entry(template.to_string())
            .or_default()
            .entry(link.ifname().to_string())
            .or_insert(link);
    }

    /// A link is allowed when the template has no explicit link set at all,
    /// or its interface name is part of the set.
    pub fn link_allowed(&self, template: &str, ifname: &str) -> bool {
        let maps = self.inner.lock().unwrap();
        match maps.definitions.get(template) {
            None => true,
            Some(defs) => defs.is_empty() || defs.iter().any(|l| l.ifname() == ifname),
        }
    }

    /// Resolve the link owning a local socket, auto-registering a spare link
    /// for interfaces seen for the first time.
    pub fn link_by_socket(
        &self,
        template: &str,
        transport: &dyn Transport,
        local_socket: SocketId,
    ) -> Option<Arc<Link>> {
        let ifname = transport.ifname(local_socket)?;
        let mut maps = self.inner.lock().unwrap();
        let by_name = maps.by_interface.entry(template.to_string()).or_default();
        if let Some(link) = by_name.get(&ifname) {
            return Some(link.clone());
        }
        debug!(template, ifname, "auto-register spare link");
        let link = Arc::new(Link::spare(ifname.clone()));
        by_name.insert(ifname, link.clone());
        Some(link)
    }

    pub fn link_by_name(&self, template: &str, ifname: &str) -> Option<Arc<Link>> {
        let maps = self.inner.lock().unwrap();
        maps.by_interface.get(template)?.get(ifname).cloned()
    }

    /// Scan a template's links for user-specified preferences that change how
    /// its bonds make decisions.
    pub fn user_flags(&self, template: &str) -> UserLinkFlags {
        let maps = self.inner.lock().unwrap();
        let mut flags = UserLinkFlags::default();
        if let Some(by_name) = maps.by_interface.get(template) {
            for link in by_name.values() {
                if !link.is_user_specified() {
                    continue;
                }
                flags.has_links = true;
                if link.is_primary() {
                    flags.has_primary_link = true;
                }
                if link.failover_to().is_some() {
                    flags.has_failover_instructions = true;
                }
                if link.speed() > 0 {
                    flags.has_link_speeds = true;
                }
            }
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTransport;

    impl Transport for FakeTransport {
        fn ifname(&self, local_socket: SocketId) -> Option<String> {
            Some(format!("eth{local_socket}"))
        }

        fn send_control(
            &self,
            _local_socket: SocketId,
            _remote: std::net::SocketAddr,
            _verb: crate::transport::Verb,
            _payload: &[u8],
        ) {
        }
    }

    #[test]
    fn test_ipv_pref_codes() {
        for code in [0u8, 4, 6, 46, 64] {
            assert_eq!(IpvPref::from_code(code).unwrap().code(), code);
        }
        assert!(IpvPref::from_code(5).is_err());
    }

    #[test]
    fn test_link_allowed_without_definitions() {
        let reg = LinkRegistry::new();
        assert!(reg.link_allowed("default", "eth0"));
    }

    #[test]
    fn test_link_allowed_with_definitions() {
        let reg = LinkRegistry::new();
        reg.add_custom_link(
            "custom",
            Link::new("eth0", 0, LinkMode::Primary, IpvPref::Any, None, true),
        );
        assert!(reg.link_allowed("custom", "eth0"));
        assert!(!reg.link_allowed("custom", "wlan0"));
        // Other templates are unaffected.
        assert!(reg.link_allowed("default", "wlan0"));
    }

    #[test]
    fn test_link_by_socket_auto_registers_spare() {
        let reg = LinkRegistry::new();
        let t = FakeTransport;
        let link = reg.link_by_socket("default", &t, 3).unwrap();
        assert_eq!(link.ifname(), "eth3");
        assert_eq!(link.mode(), LinkMode::Spare);
        assert!(!link.is_user_specified());
        // Second lookup returns the same registration.
        let again = reg.link_by_socket("default", &t, 3).unwrap();
        assert!(Arc::ptr_eq(&link, &again));
    }

    #[test]
    fn test_user_flags_scan() {
        let reg = LinkRegistry::new();
        assert!(!reg.user_flags("t").has_links);
        reg.add_custom_link(
            "t",
            Link::new(
                "eth0",
                1000,
                LinkMode::Primary,
                IpvPref::V4Preferred,
                Some("wlan0".to_string()),
                true,
            ),
        );
        reg.add_custom_link(
            "t",
            Link::new("wlan0", 0, LinkMode::Spare, IpvPref::Any, None, true),
        );
        let flags = reg.user_flags("t");
        assert!(flags.has_links);
        assert!(flags.has_primary_link);
        assert!(flags.has_failover_instructions);
        assert!(flags.has_link_speeds);
    }
}
