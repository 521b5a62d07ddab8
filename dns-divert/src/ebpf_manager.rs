//! XDP program lifecycle manager.
//!
//! Loads the compiled XDP program, attaches it to the network interface,
//! and owns every kernel map the program reads: the DNS port set, the IPv4
//! denylist trie, the stage settings, the queue bindings and the AF_XDP
//! socket map. Handles detach on shutdown.

use std::net::Ipv4Addr;
use std::os::fd::RawFd;

use anyhow::{Context, Result};
use aya::maps::lpm_trie::{Key, LpmTrie};
use aya::maps::{Array, HashMap, PerCpuArray, XskMap};
use aya::programs::{xdp::XdpLinkId, Xdp, XdpFlags};
use aya::Ebpf;
use tracing::{debug, info, warn};

use crate::config::XdpMode;
use dns_divert_common::{
    FilterSettings, PacketMetrics, MAP_DENYLIST_V4, MAP_DNS_PORTS, MAP_METRICS, MAP_QUEUE_ACTIVE,
    MAP_SETTINGS, MAP_XSK_SOCKETS,
};

// ---------------------------------------------------------------------------
// Public Interface
// ---------------------------------------------------------------------------

/// Pipeline counters summed across all CPUs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_packets: u64,
    pub dns_packets: u64,
    pub redirected: u64,
    pub blocked: u64,
    pub passed: u64,
    pub bypassed: u64,
}

/// Manages the lifecycle of the XDP program and its maps.
pub struct EbpfManager {
    bpf: Ebpf,
    link: Option<XdpLinkId>,
    interface: Option<String>,
}

impl EbpfManager {
    /// Load the XDP program from the compiled ELF binary.
    pub fn load(ebpf_bytes: &[u8]) -> Result<Self> {
        let mut bpf = Ebpf::load(ebpf_bytes).context("loading eBPF program")?;

        // Initialize aya-log if available (for eBPF-side debug!() calls)
        if let Err(e) = aya_log::EbpfLogger::init(&mut bpf) {
            warn!("eBPF logging not available: {}", e);
        }

        Ok(Self {
            bpf,
            link: None,
            interface: None,
        })
    }

    /// Attach the program to `interface` ingress in the requested mode.
    pub fn attach(&mut self, interface: &str, mode: XdpMode) -> Result<()> {
        let program: &mut Xdp = self
            .bpf
            .program_mut("dns_divert")
            .context("eBPF program 'dns_divert' not found")?
            .try_into()
            .context("program type mismatch (expected Xdp)")?;

        program.load().context("loading XDP program")?;

        let link = match mode {
            XdpMode::Driver => {
                let link = program
                    .attach(interface, XdpFlags::DRV_MODE)
                    .context("attaching XDP program in driver mode")?;
                info!(interface, "attached XDP program in native driver mode");
                link
            }
            XdpMode::Skb => {
                let link = program
                    .attach(interface, XdpFlags::SKB_MODE)
                    .context("attaching XDP program in SKB mode")?;
                info!(interface, "attached XDP program in generic (SKB) mode");
                link
            }
            XdpMode::Auto => match program.attach(interface, XdpFlags::DRV_MODE) {
                Ok(link) => {
                    info!(interface, "attached XDP program in native driver mode");
                    link
                }
                Err(e) => {
                    warn!(
                        interface,
                        error = %e,
                        "driver mode refused, falling back to generic (SKB) mode"
                    );
                    let link = program
                        .attach(interface, XdpFlags::SKB_MODE)
                        .context("attaching XDP program in SKB mode")?;
                    info!(interface, "attached XDP program in generic (SKB) mode");
                    link
                }
            },
        };

        self.link = Some(link);
        self.interface = Some(interface.to_string());
        Ok(())
    }

    /// Detach the XDP program. Called on shutdown.
    pub fn detach(mut self) -> Result<()> {
        if let Some(link) = self.link.take() {
            let program: &mut Xdp = self
                .bpf
                .program_mut("dns_divert")
                .context("eBPF program 'dns_divert' not found")?
                .try_into()
                .context("program type mismatch (expected Xdp)")?;

            program.detach(link).context("detaching XDP program")?;
            if let Some(interface) = &self.interface {
                info!(interface = %interface, "detached XDP program");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // DNS port set
    // -----------------------------------------------------------------------

    /// Write the initial DNS port set.
    pub fn set_dns_ports(&mut self, ports: &[u16]) -> Result<()> {
        for &port in ports {
            self.add_dns_port(port)?;
        }
        info!(ports = ?ports, "registered DNS ports in eBPF map");
        Ok(())
    }

    pub fn add_dns_port(&mut self, port: u16) -> Result<()> {
        let mut map: HashMap<_, u16, u8> = self
            .bpf
            .map_mut(MAP_DNS_PORTS)
            .context("DNS_PORTS map not found")?
            .try_into()
            .context("DNS_PORTS map type mismatch")?;

        // Stored in network byte order for direct comparison in eBPF.
        map.insert(port.to_be(), 1, 0)
            .with_context(|| format!("inserting DNS port {}", port))?;
        debug!(port, "added DNS port");
        Ok(())
    }

    pub fn remove_dns_port(&mut self, port: u16) -> Result<()> {
        let mut map: HashMap<_, u16, u8> = self
            .bpf
            .map_mut(MAP_DNS_PORTS)
            .context("DNS_PORTS map not found")?
            .try_into()
            .context("DNS_PORTS map type mismatch")?;

        map.remove(&port.to_be())
            .with_context(|| format!("removing DNS port {}", port))?;
        debug!(port, "removed DNS port");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // IPv4 denylist
    // -----------------------------------------------------------------------

    /// Write the initial denylist.
    pub fn set_denylist(&mut self, prefixes: &[(Ipv4Addr, u32)]) -> Result<()> {
        for &(network, prefix_len) in prefixes {
            self.add_denylist_entry(network, prefix_len)?;
        }
        info!(entries = prefixes.len(), "registered denylist in eBPF map");
        Ok(())
    }

    pub fn add_denylist_entry(&mut self, network: Ipv4Addr, prefix_len: u32) -> Result<()> {
        let mut map: LpmTrie<_, u32, u8> = self
            .bpf
            .map_mut(MAP_DENYLIST_V4)
            .context("DENYLIST_V4 map not found")?
            .try_into()
            .context("DENYLIST_V4 map type mismatch")?;

        let key = Key::new(prefix_len, u32::from(network).to_be());
        map.insert(&key, 1, 0)
            .with_context(|| format!("inserting denylist entry {}/{}", network, prefix_len))?;
        debug!(network = %network, prefix_len, "added denylist entry");
        Ok(())
    }

    pub fn remove_denylist_entry(&mut self, network: Ipv4Addr, prefix_len: u32) -> Result<()> {
        let mut map: LpmTrie<_, u32, u8> = self
            .bpf
            .map_mut(MAP_DENYLIST_V4)
            .context("DENYLIST_V4 map not found")?
            .try_into()
            .context("DENYLIST_V4 map type mismatch")?;

        let key = Key::new(prefix_len, u32::from(network).to_be());
        map.remove(&key)
            .with_context(|| format!("removing denylist entry {}/{}", network, prefix_len))?;
        debug!(network = %network, prefix_len, "removed denylist entry");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stage settings
    // -----------------------------------------------------------------------

    /// Write the optional-stage knobs the program reads per packet.
    pub fn write_settings(
        &mut self,
        denylist_enabled: bool,
        bypass_protocol: Option<u8>,
    ) -> Result<()> {
        let mut map: Array<_, FilterSettings> = self
            .bpf
            .map_mut(MAP_SETTINGS)
            .context("SETTINGS map not found")?
            .try_into()
            .context("SETTINGS map type mismatch")?;

        let settings = FilterSettings {
            denylist_enabled: denylist_enabled as u8,
            bypass_protocol: bypass_protocol.unwrap_or(0),
            _pad: [0; 2],
        };
        map.set(0, settings, 0).context("writing settings entry")?;

        info!(
            denylist_enabled,
            bypass_protocol = bypass_protocol.unwrap_or(0),
            "wrote pipeline settings"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queue bindings
    // -----------------------------------------------------------------------

    /// Bind an AF_XDP socket fd to `queue` and mark the queue active. The
    /// active flag is flipped last so the program never redirects into a
    /// slot without a socket.
    pub fn register_queue(&mut self, queue: u32, socket_fd: RawFd) -> Result<()> {
        let mut sockets: XskMap<_> = self
            .bpf
            .map_mut(MAP_XSK_SOCKETS)
            .context("XSK_SOCKETS map not found")?
            .try_into()
            .context("XSK_SOCKETS map type mismatch")?;

        sockets
            .set(queue, socket_fd, 0)
            .with_context(|| format!("binding socket to queue {}", queue))?;

        let mut active: Array<_, u32> = self
            .bpf
            .map_mut(MAP_QUEUE_ACTIVE)
            .context("QUEUE_ACTIVE map not found")?
            .try_into()
            .context("QUEUE_ACTIVE map type mismatch")?;

        active
            .set(queue, 1, 0)
            .with_context(|| format!("activating queue {}", queue))?;

        info!(queue, "registered AF_XDP socket for queue");
        Ok(())
    }

    /// Mark a queue inactive so the program passes its traffic to the
    /// kernel stack again. The socket entry itself stays; it is never
    /// consulted once the flag is clear.
    pub fn deactivate_queue(&mut self, queue: u32) -> Result<()> {
        let mut active: Array<_, u32> = self
            .bpf
            .map_mut(MAP_QUEUE_ACTIVE)
            .context("QUEUE_ACTIVE map not found")?
            .try_into()
            .context("QUEUE_ACTIVE map type mismatch")?;

        active
            .set(queue, 0, 0)
            .with_context(|| format!("deactivating queue {}", queue))?;

        debug!(queue, "deactivated queue");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------------

    /// Read the pipeline counters, summed across all CPUs.
    pub fn read_metrics(&self) -> Result<MetricsSnapshot> {
        let map: PerCpuArray<_, PacketMetrics> = self
            .bpf
            .map(MAP_METRICS)
            .context("METRICS map not found")?
            .try_into()
            .context("METRICS map type mismatch")?;

        let per_cpu = map.get(&0, 0).context("reading METRICS entry")?;

        let mut snapshot = MetricsSnapshot::default();
        for cpu in per_cpu.iter() {
            snapshot.total_packets += cpu.total_packets;
            snapshot.dns_packets += cpu.dns_packets;
            snapshot.redirected += cpu.redirected;
            snapshot.blocked += cpu.blocked;
            snapshot.passed += cpu.passed;
            snapshot.bypassed += cpu.bypassed;
        }

        Ok(snapshot)
    }
}
