//! YAML configuration parsing and validation.
//!
//! Defines the configuration model for dns-divert and validates it at load
//! time, before anything touches the kernel.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use dns_divert_common::{DENYLIST_CAPACITY, IPPROTO_UDP, MAX_DNS_PORTS, MAX_QUEUES};

// ---------------------------------------------------------------------------
// Top-Level Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Network interface to attach the XDP program to (e.g., "eth0").
    pub interface: String,

    /// UDP ports treated as DNS. A frame matches when its source OR
    /// destination port is in this set.
    #[serde(default = "default_dns_ports")]
    pub dns_ports: Vec<u16>,

    /// IPv4 source prefixes to drop, in CIDR notation ("203.0.113.0/24").
    /// A bare address means a /32 host entry.
    #[serde(default)]
    pub denylist: Vec<String>,

    /// Master switch for the denylist stage.
    #[serde(default = "default_true")]
    pub denylist_enabled: bool,

    /// Optional IPv4 protocol number redirected straight to the bound
    /// socket, skipping the UDP and denylist stages. Cannot be UDP itself.
    #[serde(default)]
    pub bypass_protocol: Option<u8>,

    /// XDP attach mode.
    #[serde(default)]
    pub xdp_mode: XdpMode,

    /// Receive-queue socket settings.
    #[serde(default)]
    pub queues: QueueConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Seconds between periodic stats log lines. 0 disables the ticker.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum XdpMode {
    /// Try native driver mode, fall back to generic (SKB) if the driver
    /// refuses.
    #[default]
    Auto,
    /// Require native driver mode.
    Driver,
    /// Force generic (SKB) mode.
    Skb,
}

#[derive(Debug, Deserialize)]
pub struct QueueConfig {
    /// Number of receive queues to bind AF_XDP sockets to, starting at
    /// queue 0. 0 = discover the queue count from sysfs.
    #[serde(default)]
    pub count: u32,

    /// Pin consumer threads to CPU cores.
    #[serde(default = "default_true")]
    pub pin_cpus: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            count: 0,
            pin_cpus: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_bind")]
    pub bind: SocketAddr,

    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_metrics_bind(),
            path: default_metrics_path(),
        }
    }
}

fn default_dns_ports() -> Vec<u16> {
    vec![53]
}
fn default_true() -> bool {
    true
}
fn default_stats_interval() -> u64 {
    30
}
fn default_metrics_bind() -> SocketAddr {
    "0.0.0.0:9090".parse().unwrap()
}
fn default_metrics_path() -> String {
    "/metrics".to_string()
}

// ---------------------------------------------------------------------------
// Loading & Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Load config from a YAML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&contents).context("parsing YAML config")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        if self.interface.trim().is_empty() {
            bail!("'interface' must not be empty");
        }

        if self.dns_ports.is_empty() {
            bail!("at least one DNS port is required");
        }
        if self.dns_ports.len() > MAX_DNS_PORTS as usize {
            bail!(
                "{} DNS ports exceeds the map capacity ({})",
                self.dns_ports.len(),
                MAX_DNS_PORTS
            );
        }
        if let Some(i) = self.dns_ports.iter().position(|&p| p == 0) {
            bail!("dns_ports[{}] must be 1..65535, got 0", i);
        }

        if self.denylist.len() > DENYLIST_CAPACITY as usize {
            bail!(
                "{} denylist entries exceeds the map capacity ({})",
                self.denylist.len(),
                DENYLIST_CAPACITY
            );
        }
        self.denylist_prefixes()?;

        if let Some(protocol) = self.bypass_protocol {
            if protocol == 0 {
                bail!("bypass_protocol must be nonzero");
            }
            if protocol == IPPROTO_UDP {
                bail!("bypass_protocol cannot be UDP; UDP goes through the DNS stages");
            }
        }

        if self.queues.count > MAX_QUEUES {
            bail!(
                "queues.count {} exceeds the socket map capacity ({})",
                self.queues.count,
                MAX_QUEUES
            );
        }

        Ok(())
    }

    /// The denylist as parsed (network, prefix length) pairs.
    pub fn denylist_prefixes(&self) -> Result<Vec<(Ipv4Addr, u32)>> {
        self.denylist
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                parse_cidr(entry).with_context(|| format!("denylist[{}]", i))
            })
            .collect()
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

/// Parse an IPv4 CIDR string like "203.0.113.0/24" into a (network, prefix
/// length) pair. Host bits beyond the prefix are masked off. A bare address
/// is a /32.
pub fn parse_cidr(s: &str) -> Result<(Ipv4Addr, u32)> {
    let (addr_part, prefix_len) = match s.split_once('/') {
        Some((addr, len)) => {
            let len: u32 = len
                .parse()
                .with_context(|| format!("invalid prefix length in '{}'", s))?;
            (addr, len)
        }
        None => (s, 32),
    };

    if prefix_len > 32 {
        bail!("prefix length must be 0..=32, got {} in '{}'", prefix_len, s);
    }

    let addr: Ipv4Addr = addr_part
        .parse()
        .with_context(|| format!("invalid IPv4 address in '{}'", s))?;

    let mask = match prefix_len {
        0 => 0,
        _ => u32::MAX << (32 - prefix_len),
    };
    Ok((Ipv4Addr::from(u32::from(addr) & mask), prefix_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cidr() {
        assert_eq!(
            parse_cidr("203.0.113.0/24").unwrap(),
            (Ipv4Addr::new(203, 0, 113, 0), 24)
        );
        assert_eq!(
            parse_cidr("203.0.113.7").unwrap(),
            (Ipv4Addr::new(203, 0, 113, 7), 32)
        );
    }

    #[test]
    fn test_parse_cidr_masks_host_bits() {
        assert_eq!(
            parse_cidr("10.1.2.3/8").unwrap(),
            (Ipv4Addr::new(10, 0, 0, 0), 8)
        );
        assert_eq!(parse_cidr("1.2.3.4/0").unwrap(), (Ipv4Addr::new(0, 0, 0, 0), 0));
    }

    #[test]
    fn test_parse_cidr_invalid() {
        assert!(parse_cidr("203.0.113.0/33").is_err());
        assert!(parse_cidr("not-an-address/24").is_err());
        assert!(parse_cidr("203.0.113.0/abc").is_err());
        assert!(parse_cidr("2001:db8::/32").is_err());
    }

    #[test]
    fn test_minimal_config() {
        let yaml = r#"
interface: eth0
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.dns_ports, vec![53]);
        assert!(config.denylist_enabled);
        assert!(config.bypass_protocol.is_none());
        assert_eq!(config.xdp_mode, XdpMode::Auto);
        assert_eq!(config.queues.count, 0);
        assert!(config.queues.pin_cpus);
        assert_eq!(config.stats_interval_secs, 30);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
interface: eth0
dns_ports: [53, 5353]
denylist:
  - "203.0.113.0/24"
  - "198.51.100.9"
denylist_enabled: true
bypass_protocol: 248
xdp_mode: skb
queues:
  count: 4
  pin_cpus: false
metrics:
  enabled: true
  bind: "127.0.0.1:9100"
stats_interval_secs: 10
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.dns_ports, vec![53, 5353]);
        assert_eq!(
            config.denylist_prefixes().unwrap(),
            vec![
                (Ipv4Addr::new(203, 0, 113, 0), 24),
                (Ipv4Addr::new(198, 51, 100, 9), 32),
            ]
        );
        assert_eq!(config.bypass_protocol, Some(248));
        assert_eq!(config.xdp_mode, XdpMode::Skb);
        assert_eq!(config.queues.count, 4);
        assert_eq!(config.metrics.path, "/metrics");
    }

    #[test]
    fn test_rejects_empty_interface() {
        let yaml = r#"
interface: ""
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_udp_bypass() {
        let yaml = r#"
interface: eth0
bypass_protocol: 17
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_port_zero() {
        let yaml = r#"
interface: eth0
dns_ports: [53, 0]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_denylist_entry() {
        let yaml = r#"
interface: eth0
denylist: ["203.0.113.0/40"]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_too_many_queues() {
        let yaml = r#"
interface: eth0
queues:
  count: 65
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
