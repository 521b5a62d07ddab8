//! Shared types between the dns-divert userspace daemon and eBPF program.
//!
//! This crate is `no_std` compatible so it can be used in eBPF programs.
//! All types must be `repr(C)` for stable ABI across eBPF and userspace.

#![cfg_attr(not(test), no_std)]

/// Maximum number of RX queues (and therefore AF_XDP sockets).
/// This is a compile-time bound for eBPF map sizing.
pub const MAX_QUEUES: u32 = 64;

/// Maximum number of entries in the DNS port set.
pub const MAX_DNS_PORTS: u32 = 64;

/// Maximum number of IPv4 denylist prefixes.
pub const DENYLIST_CAPACITY: u32 = 10_000;

// ---------------------------------------------------------------------------
// eBPF Map Value Types
// ---------------------------------------------------------------------------

/// Pipeline counters. One entry in a per-CPU array map; each CPU increments
/// its own copy and userspace sums across CPUs when reading.
///
/// The first five fields partition DNS-classified traffic exactly:
/// `dns_packets == blocked + redirected + passed`. `bypassed` counts only
/// the optional protocol-bypass stage and never overlaps the DNS counters.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PacketMetrics {
    /// Every frame that entered the pipeline.
    pub total_packets: u64,
    /// Frames that passed all parse gates and matched a DNS port.
    pub dns_packets: u64,
    /// DNS frames redirected to an AF_XDP socket.
    pub redirected: u64,
    /// DNS frames dropped by the IPv4 denylist.
    pub blocked: u64,
    /// DNS frames passed to the kernel stack (no active queue binding).
    pub passed: u64,
    /// Frames redirected by the protocol-bypass stage.
    pub bypassed: u64,
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for PacketMetrics {}

/// Runtime knobs for the optional pipeline stages. One entry in an array
/// map, written by userspace at load time (and on config reload).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct FilterSettings {
    /// Nonzero: consult the IPv4 denylist for DNS traffic.
    pub denylist_enabled: u8,
    /// IPv4 protocol number that bypasses classification and redirects
    /// directly. 0 disables the stage.
    pub bypass_protocol: u8,
    pub _pad: [u8; 2],
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for FilterSettings {}

impl FilterSettings {
    /// Conservative defaults used by the eBPF program when the settings
    /// entry has not been written yet: denylist on, bypass off.
    pub const fn initial() -> Self {
        Self {
            denylist_enabled: 1,
            bypass_protocol: 0,
            _pad: [0; 2],
        }
    }
}

/// QR bit of the DNS flags word (host order, after `from_be`).
/// Set on responses, clear on queries.
pub const DNS_FLAG_QR: u16 = 0x8000;

// ---------------------------------------------------------------------------
// eBPF Map Names (must match between eBPF program and userspace loader)
// ---------------------------------------------------------------------------

/// Map name: XskMap — AF_XDP socket fds, indexed by RX queue.
pub const MAP_XSK_SOCKETS: &str = "XSK_SOCKETS";

/// Map name: Array<u32> — nonzero entry = queue has an active redirect
/// target, indexed by RX queue.
pub const MAP_QUEUE_ACTIVE: &str = "QUEUE_ACTIVE";

/// Map name: HashMap<u16, u8> — DNS port set, keyed by port in network
/// byte order. Value is unused (presence check).
pub const MAP_DNS_PORTS: &str = "DNS_PORTS";

/// Map name: PerCpuArray<PacketMetrics> — single entry, index 0.
pub const MAP_METRICS: &str = "METRICS";

/// Map name: LpmTrie<u32, u8> — IPv4 denylist, address in network byte
/// order. Value is unused (presence check).
pub const MAP_DENYLIST_V4: &str = "DENYLIST_V4";

/// Map name: Array<FilterSettings> — single entry, index 0.
pub const MAP_SETTINGS: &str = "SETTINGS";

// ---------------------------------------------------------------------------
// Protocol Constants
// ---------------------------------------------------------------------------

/// Ethernet header size.
pub const ETH_HLEN: usize = 14;

/// Minimum IPv4 header size (no options).
pub const IP_HLEN: usize = 20;

/// IPv6 header size (fixed, no extension headers).
pub const IPV6_HLEN: usize = 40;

/// UDP header size.
pub const UDP_HLEN: usize = 8;

/// Minimal DNS header size.
pub const DNS_HLEN: usize = 12;

/// Smallest frame the pipeline can classify as DNS: Eth + IPv4 + UDP + DNS.
pub const MIN_DNS_FRAME_LEN: usize = ETH_HLEN + IP_HLEN + UDP_HLEN + DNS_HLEN;

/// EtherType for IPv4.
pub const ETH_P_IP: u16 = 0x0800;

/// EtherType for IPv6.
pub const ETH_P_IPV6: u16 = 0x86DD;

/// IP protocol number for UDP.
pub const IPPROTO_UDP: u8 = 17;
