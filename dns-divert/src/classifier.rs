//! Userspace rendition of the classification pipeline.
//!
//! The XDP program makes the authoritative per-frame decision; this module
//! is the same state machine expressed over checked header views and
//! injected lookup tables. The AF_XDP consumers run it against every frame
//! the kernel hands them to account for what arrived, and the tests drive
//! it directly with hand-built frames.
//!
//! Stage order, matching the kernel program exactly:
//!   1. count the frame
//!   2. Ethernet, then IPv4 or IPv6 header gates
//!   3. optional protocol bypass (IPv4 only)
//!   4. UDP header gate, then minimal DNS header gate
//!   5. port-set match on source or destination
//!   6. optional IPv4 source denylist
//!   7. queue binding check, redirect or pass

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};

use dns_divert_common::{
    ETH_HLEN, ETH_P_IP, ETH_P_IPV6, IPPROTO_UDP, IPV6_HLEN, IP_HLEN, UDP_HLEN,
};

use crate::frame::{DnsHeaderView, EthernetView, Ipv4View, Ipv6View, UdpView};

// ---------------------------------------------------------------------------
// Verdicts and counters
// ---------------------------------------------------------------------------

/// Outcome of classifying one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Hand the frame to the regular network stack.
    Pass,
    /// Discard the frame.
    Drop,
    /// Deliver the frame to the socket bound to this queue.
    Redirect(u32),
}

/// The closed set of counters the pipeline maintains. Every counter update
/// goes through [`ClassifierMetrics::bump`] with one of these, so a counter
/// that does not exist cannot be addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    TotalPackets,
    DnsPackets,
    Redirected,
    Blocked,
    Passed,
    Bypassed,
}

/// Monotonic counter bank, one slot per [`Counter`]. Relaxed ordering is
/// fine: slots are independent and only ever summed or displayed.
#[derive(Debug, Default)]
pub struct ClassifierMetrics {
    total_packets: AtomicU64,
    dns_packets: AtomicU64,
    redirected: AtomicU64,
    blocked: AtomicU64,
    passed: AtomicU64,
    bypassed: AtomicU64,
}

impl ClassifierMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self, counter: Counter) {
        self.slot(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.slot(counter).load(Ordering::Relaxed)
    }

    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::TotalPackets => &self.total_packets,
            Counter::DnsPackets => &self.dns_packets,
            Counter::Redirected => &self.redirected,
            Counter::Blocked => &self.blocked,
            Counter::Passed => &self.passed,
            Counter::Bypassed => &self.bypassed,
        }
    }
}

// ---------------------------------------------------------------------------
// Lookup capabilities
// ---------------------------------------------------------------------------

/// Set of UDP ports treated as DNS.
pub trait PortSet {
    fn contains(&self, port: u16) -> bool;
}

/// IPv4 source-address denylist.
pub trait Denylist {
    fn is_denied(&self, addr: Ipv4Addr) -> bool;
}

/// Which receive queues currently have a socket bound and ready.
pub trait QueueBindings {
    fn is_active(&self, queue: u32) -> bool;
}

/// Port set backed by a HashSet, built once from config. Ports are kept in
/// host order; the frame views convert from wire order on read.
#[derive(Debug, Clone, Default)]
pub struct PortTable {
    ports: HashSet<u16>,
}

impl PortTable {
    pub fn new(ports: &[u16]) -> Self {
        Self {
            ports: ports.iter().copied().collect(),
        }
    }
}

impl PortSet for PortTable {
    fn contains(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }
}

/// IPv4 prefix list matched by linear scan. Lists come from config and stay
/// small; the kernel side is where the real trie lives. A denylist entry is
/// presence-only, so "longest" match degenerates to "any" match.
#[derive(Debug, Clone, Default)]
pub struct PrefixDenylist {
    prefixes: Vec<(u32, u32)>,
}

impl PrefixDenylist {
    pub fn new(prefixes: &[(Ipv4Addr, u32)]) -> Self {
        let prefixes = prefixes
            .iter()
            .map(|&(addr, len)| (u32::from(addr) & prefix_mask(len), len))
            .collect();
        Self { prefixes }
    }
}

impl Denylist for PrefixDenylist {
    fn is_denied(&self, addr: Ipv4Addr) -> bool {
        let addr = u32::from(addr);
        self.prefixes
            .iter()
            .any(|&(network, len)| addr & prefix_mask(len) == network)
    }
}

fn prefix_mask(len: u32) -> u32 {
    match len {
        0 => 0,
        1..=31 => u32::MAX << (32 - len),
        _ => u32::MAX,
    }
}

/// Queue binding flags backed by a HashSet of active queue indices.
#[derive(Debug, Clone, Default)]
pub struct QueueTable {
    active: HashSet<u32>,
}

impl QueueTable {
    pub fn new(queues: &[u32]) -> Self {
        Self {
            active: queues.iter().copied().collect(),
        }
    }
}

impl QueueBindings for QueueTable {
    fn is_active(&self, queue: u32) -> bool {
        self.active.contains(&queue)
    }
}

/// The concrete pipeline the daemon runs: tables built from config.
pub type DivertPipeline = Pipeline<PortTable, PrefixDenylist, QueueTable>;

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// The classification pipeline over injected lookup tables. Stages are
/// fixed; the denylist and the protocol bypass are optional and configured
/// at construction.
#[derive(Debug)]
pub struct Pipeline<P, D, Q> {
    ports: P,
    denylist: Option<D>,
    bindings: Q,
    bypass_protocol: Option<u8>,
}

impl<P, D, Q> Pipeline<P, D, Q>
where
    P: PortSet,
    D: Denylist,
    Q: QueueBindings,
{
    pub fn new(ports: P, denylist: Option<D>, bindings: Q) -> Self {
        Self {
            ports,
            denylist,
            bindings,
            bypass_protocol: None,
        }
    }

    /// Redirect frames of this IPv4 protocol number straight to the bound
    /// socket, skipping the UDP, port and denylist stages.
    pub fn with_bypass_protocol(mut self, protocol: u8) -> Self {
        self.bypass_protocol = Some(protocol);
        self
    }

    pub fn bypass_protocol(&self) -> Option<u8> {
        self.bypass_protocol
    }

    /// Classify one frame as received on `queue`, updating `metrics` at the
    /// same checkpoints the kernel program does.
    pub fn classify(&self, frame: &[u8], queue: u32, metrics: &ClassifierMetrics) -> Verdict {
        metrics.bump(Counter::TotalPackets);

        let eth = match EthernetView::parse(frame) {
            Some(eth) => eth,
            None => return Verdict::Pass,
        };

        let (l4_offset, v4_src) = match eth.ethertype() {
            ETH_P_IP => {
                let ip = match Ipv4View::parse(frame, ETH_HLEN) {
                    Some(ip) => ip,
                    None => return Verdict::Pass,
                };

                if let Some(bypass) = self.bypass_protocol {
                    if ip.protocol() == bypass {
                        return if self.bindings.is_active(queue) {
                            metrics.bump(Counter::Bypassed);
                            Verdict::Redirect(queue)
                        } else {
                            Verdict::Pass
                        };
                    }
                }

                if ip.protocol() != IPPROTO_UDP {
                    return Verdict::Pass;
                }
                let header_len = ip.header_len();
                if header_len < IP_HLEN {
                    return Verdict::Pass;
                }
                (ETH_HLEN + header_len, Some(ip.src_addr()))
            }
            ETH_P_IPV6 => {
                let ip = match Ipv6View::parse(frame, ETH_HLEN) {
                    Some(ip) => ip,
                    None => return Verdict::Pass,
                };
                if ip.next_header() != IPPROTO_UDP {
                    return Verdict::Pass;
                }
                (ETH_HLEN + IPV6_HLEN, None)
            }
            _ => return Verdict::Pass,
        };

        let udp = match UdpView::parse(frame, l4_offset) {
            Some(udp) => udp,
            None => return Verdict::Pass,
        };

        if DnsHeaderView::parse(frame, l4_offset + UDP_HLEN).is_none() {
            return Verdict::Pass;
        }

        if !self.ports.contains(udp.src_port()) && !self.ports.contains(udp.dst_port()) {
            return Verdict::Pass;
        }

        metrics.bump(Counter::DnsPackets);

        // IPv6 sources never reach the denylist: there is no v4 address to
        // look up.
        if let (Some(denylist), Some(src)) = (&self.denylist, v4_src) {
            if denylist.is_denied(src) {
                metrics.bump(Counter::Blocked);
                return Verdict::Drop;
            }
        }

        if self.bindings.is_active(queue) {
            metrics.bump(Counter::Redirected);
            Verdict::Redirect(queue)
        } else {
            metrics.bump(Counter::Passed);
            Verdict::Pass
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    // ---- frame builders ----

    fn udp4_frame(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, payload: usize) -> Vec<u8> {
        ip4_frame(src, dst, IPPROTO_UDP, 0, src_port, dst_port, payload)
    }

    fn ip4_frame(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        options_len: usize,
        src_port: u16,
        dst_port: u16,
        payload: usize,
    ) -> Vec<u8> {
        assert_eq!(options_len % 4, 0);
        let ip_len = IP_HLEN + options_len;
        let total = ETH_HLEN + ip_len + UDP_HLEN + payload;
        let mut frame = vec![0u8; total];

        frame[12..14].copy_from_slice(&ETH_P_IP.to_be_bytes());

        let ip = ETH_HLEN;
        frame[ip] = 0x40 | (ip_len / 4) as u8;
        frame[ip + 2..ip + 4].copy_from_slice(&((ip_len + UDP_HLEN + payload) as u16).to_be_bytes());
        frame[ip + 8] = 64;
        frame[ip + 9] = protocol;
        frame[ip + 12..ip + 16].copy_from_slice(&src.octets());
        frame[ip + 16..ip + 20].copy_from_slice(&dst.octets());

        let udp = ip + ip_len;
        frame[udp..udp + 2].copy_from_slice(&src_port.to_be_bytes());
        frame[udp + 2..udp + 4].copy_from_slice(&dst_port.to_be_bytes());
        frame[udp + 4..udp + 6].copy_from_slice(&((UDP_HLEN + payload) as u16).to_be_bytes());

        frame
    }

    fn udp6_frame(src_port: u16, dst_port: u16, payload: usize) -> Vec<u8> {
        let total = ETH_HLEN + IPV6_HLEN + UDP_HLEN + payload;
        let mut frame = vec![0u8; total];

        frame[12..14].copy_from_slice(&ETH_P_IPV6.to_be_bytes());

        let ip = ETH_HLEN;
        frame[ip] = 0x60;
        frame[ip + 4..ip + 6].copy_from_slice(&((UDP_HLEN + payload) as u16).to_be_bytes());
        frame[ip + 6] = IPPROTO_UDP;
        frame[ip + 7] = 64;

        let udp = ip + IPV6_HLEN;
        frame[udp..udp + 2].copy_from_slice(&src_port.to_be_bytes());
        frame[udp + 2..udp + 4].copy_from_slice(&dst_port.to_be_bytes());
        frame[udp + 4..udp + 6].copy_from_slice(&((UDP_HLEN + payload) as u16).to_be_bytes());

        frame
    }

    fn client() -> Ipv4Addr {
        Ipv4Addr::new(203, 0, 113, 7)
    }

    fn resolver() -> Ipv4Addr {
        Ipv4Addr::new(192, 0, 2, 53)
    }

    fn dns_pipeline(queues: &[u32]) -> Pipeline<PortTable, PrefixDenylist, QueueTable> {
        Pipeline::new(PortTable::new(&[53]), None, QueueTable::new(queues))
    }

    /// Denylist stand-in that records every lookup it receives.
    struct RecordingDenylist {
        calls: Cell<u64>,
        deny_all: bool,
    }

    impl RecordingDenylist {
        fn new(deny_all: bool) -> Self {
            Self {
                calls: Cell::new(0),
                deny_all,
            }
        }
    }

    impl Denylist for RecordingDenylist {
        fn is_denied(&self, _addr: Ipv4Addr) -> bool {
            self.calls.set(self.calls.get() + 1);
            self.deny_all
        }
    }

    fn counts(metrics: &ClassifierMetrics) -> [u64; 6] {
        [
            metrics.get(Counter::TotalPackets),
            metrics.get(Counter::DnsPackets),
            metrics.get(Counter::Redirected),
            metrics.get(Counter::Blocked),
            metrics.get(Counter::Passed),
            metrics.get(Counter::Bypassed),
        ]
    }

    // ---- happy paths ----

    #[test]
    fn redirects_dns_query_on_bound_queue() {
        let pipeline = dns_pipeline(&[2]);
        let metrics = ClassifierMetrics::new();
        let frame = udp4_frame(client(), resolver(), 40000, 53, 12);

        assert_eq!(pipeline.classify(&frame, 2, &metrics), Verdict::Redirect(2));
        assert_eq!(counts(&metrics), [1, 1, 1, 0, 0, 0]);
    }

    #[test]
    fn matches_on_source_port_for_responses() {
        let pipeline = dns_pipeline(&[0]);
        let metrics = ClassifierMetrics::new();
        let frame = udp4_frame(resolver(), client(), 53, 40000, 32);

        assert_eq!(pipeline.classify(&frame, 0, &metrics), Verdict::Redirect(0));
        assert_eq!(counts(&metrics), [1, 1, 1, 0, 0, 0]);
    }

    #[test]
    fn passes_dns_on_unbound_queue() {
        let pipeline = dns_pipeline(&[2]);
        let metrics = ClassifierMetrics::new();
        let frame = udp4_frame(client(), resolver(), 40000, 53, 12);

        assert_eq!(pipeline.classify(&frame, 5, &metrics), Verdict::Pass);
        assert_eq!(counts(&metrics), [1, 1, 0, 0, 1, 0]);
    }

    #[test]
    fn redirects_ipv6_dns_without_denylist_lookup() {
        let denylist = RecordingDenylist::new(true);
        let pipeline = Pipeline::new(PortTable::new(&[53]), Some(denylist), QueueTable::new(&[1]));
        let metrics = ClassifierMetrics::new();
        let frame = udp6_frame(40000, 53, 12);

        assert_eq!(pipeline.classify(&frame, 1, &metrics), Verdict::Redirect(1));
        assert_eq!(counts(&metrics), [1, 1, 1, 0, 0, 0]);
        assert_eq!(pipeline.denylist.as_ref().unwrap().calls.get(), 0);
    }

    // ---- denylist ----

    #[test]
    fn drops_denylisted_source() {
        let denylist = PrefixDenylist::new(&[(client(), 32)]);
        let pipeline = Pipeline::new(PortTable::new(&[53]), Some(denylist), QueueTable::new(&[2]));
        let metrics = ClassifierMetrics::new();
        let frame = udp4_frame(client(), resolver(), 40000, 53, 12);

        assert_eq!(pipeline.classify(&frame, 2, &metrics), Verdict::Drop);
        assert_eq!(counts(&metrics), [1, 1, 0, 1, 0, 0]);
    }

    #[test]
    fn drops_source_inside_wider_prefix() {
        let denylist = PrefixDenylist::new(&[(Ipv4Addr::new(203, 0, 113, 0), 24)]);
        let pipeline = Pipeline::new(PortTable::new(&[53]), Some(denylist), QueueTable::new(&[0]));
        let metrics = ClassifierMetrics::new();

        let inside = udp4_frame(client(), resolver(), 40000, 53, 12);
        assert_eq!(pipeline.classify(&inside, 0, &metrics), Verdict::Drop);

        let outside = udp4_frame(Ipv4Addr::new(203, 0, 114, 7), resolver(), 40000, 53, 12);
        assert_eq!(pipeline.classify(&outside, 0, &metrics), Verdict::Redirect(0));

        assert_eq!(counts(&metrics), [2, 2, 1, 1, 0, 0]);
    }

    #[test]
    fn denylist_applies_before_queue_binding() {
        // Denied source on an unbound queue still drops; the binding is
        // never consulted once the denylist matches.
        let denylist = PrefixDenylist::new(&[(client(), 32)]);
        let pipeline = Pipeline::new(PortTable::new(&[53]), Some(denylist), QueueTable::new(&[]));
        let metrics = ClassifierMetrics::new();
        let frame = udp4_frame(client(), resolver(), 40000, 53, 12);

        assert_eq!(pipeline.classify(&frame, 3, &metrics), Verdict::Drop);
        assert_eq!(counts(&metrics), [1, 1, 0, 1, 0, 0]);
    }

    #[test]
    fn disabled_denylist_redirects_denied_source() {
        let pipeline = dns_pipeline(&[2]);
        let metrics = ClassifierMetrics::new();
        let frame = udp4_frame(client(), resolver(), 40000, 53, 12);

        assert_eq!(pipeline.classify(&frame, 2, &metrics), Verdict::Redirect(2));
        assert_eq!(counts(&metrics), [1, 1, 1, 0, 0, 0]);
    }

    #[test]
    fn zero_length_prefix_denies_everything() {
        let denylist = PrefixDenylist::new(&[(Ipv4Addr::new(0, 0, 0, 0), 0)]);
        assert!(denylist.is_denied(Ipv4Addr::new(1, 2, 3, 4)));
        assert!(denylist.is_denied(Ipv4Addr::new(255, 255, 255, 255)));
    }

    // ---- parse gates ----

    #[test]
    fn passes_non_dns_port_with_total_count_only() {
        let pipeline = dns_pipeline(&[0, 1, 2, 3]);
        let metrics = ClassifierMetrics::new();
        let frame = udp4_frame(client(), resolver(), 40000, 8080, 12);

        assert_eq!(pipeline.classify(&frame, 0, &metrics), Verdict::Pass);
        assert_eq!(counts(&metrics), [1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn passes_runt_frame_with_total_count_only() {
        let pipeline = dns_pipeline(&[0]);
        let metrics = ClassifierMetrics::new();

        assert_eq!(pipeline.classify(&[0u8; 10], 0, &metrics), Verdict::Pass);
        assert_eq!(counts(&metrics), [1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn every_truncation_point_passes_cleanly() {
        // Slicing panics on any out-of-range read, so this sweep doubles as
        // a bounds-safety check for every prefix of a valid frame.
        let pipeline = dns_pipeline(&[0]);
        let full = udp4_frame(client(), resolver(), 40000, 53, 12);

        for len in 0..full.len() {
            let metrics = ClassifierMetrics::new();
            assert_eq!(pipeline.classify(&full[..len], 0, &metrics), Verdict::Pass);
            assert_eq!(metrics.get(Counter::TotalPackets), 1);
            assert_eq!(metrics.get(Counter::DnsPackets), 0);
        }
    }

    #[test]
    fn passes_short_dns_payload() {
        let pipeline = dns_pipeline(&[0]);
        let metrics = ClassifierMetrics::new();
        let frame = udp4_frame(client(), resolver(), 40000, 53, 11);

        assert_eq!(pipeline.classify(&frame, 0, &metrics), Verdict::Pass);
        assert_eq!(counts(&metrics), [1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn passes_oversized_ihl() {
        let pipeline = dns_pipeline(&[0]);
        let metrics = ClassifierMetrics::new();
        // IHL claims a 60-byte header; the frame ends long before the UDP
        // header that length implies.
        let mut frame = udp4_frame(client(), resolver(), 40000, 53, 12);
        frame[ETH_HLEN] = 0x4F;

        assert_eq!(pipeline.classify(&frame, 0, &metrics), Verdict::Pass);
        assert_eq!(counts(&metrics), [1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn passes_undersized_ihl() {
        let pipeline = dns_pipeline(&[0]);
        let metrics = ClassifierMetrics::new();
        let mut frame = udp4_frame(client(), resolver(), 40000, 53, 12);
        frame[ETH_HLEN] = 0x42;

        assert_eq!(pipeline.classify(&frame, 0, &metrics), Verdict::Pass);
        assert_eq!(counts(&metrics), [1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn honors_ipv4_options() {
        let pipeline = dns_pipeline(&[1]);
        let metrics = ClassifierMetrics::new();
        let frame = ip4_frame(client(), resolver(), IPPROTO_UDP, 8, 40000, 53, 12);

        assert_eq!(pipeline.classify(&frame, 1, &metrics), Verdict::Redirect(1));
        assert_eq!(counts(&metrics), [1, 1, 1, 0, 0, 0]);
    }

    #[test]
    fn passes_non_udp_protocols() {
        let pipeline = dns_pipeline(&[0]);
        let metrics = ClassifierMetrics::new();
        let tcp = ip4_frame(client(), resolver(), 6, 0, 40000, 53, 12);

        assert_eq!(pipeline.classify(&tcp, 0, &metrics), Verdict::Pass);
        assert_eq!(counts(&metrics), [1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn passes_unknown_ethertype() {
        let pipeline = dns_pipeline(&[0]);
        let metrics = ClassifierMetrics::new();
        let mut frame = udp4_frame(client(), resolver(), 40000, 53, 12);
        frame[12..14].copy_from_slice(&0x0806u16.to_be_bytes());

        assert_eq!(pipeline.classify(&frame, 0, &metrics), Verdict::Pass);
        assert_eq!(counts(&metrics), [1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn passes_ipv6_extension_headers() {
        let pipeline = dns_pipeline(&[0]);
        let metrics = ClassifierMetrics::new();
        let mut frame = udp6_frame(40000, 53, 12);
        // Hop-by-hop next header: UDP is no longer directly reachable.
        frame[ETH_HLEN + 6] = 0;

        assert_eq!(pipeline.classify(&frame, 0, &metrics), Verdict::Pass);
        assert_eq!(counts(&metrics), [1, 0, 0, 0, 0, 0]);
    }

    // ---- protocol bypass ----

    #[test]
    fn bypass_protocol_skips_udp_and_denylist_stages() {
        let denylist = RecordingDenylist::new(true);
        let pipeline = Pipeline::new(PortTable::new(&[53]), Some(denylist), QueueTable::new(&[4]))
            .with_bypass_protocol(248);
        let metrics = ClassifierMetrics::new();
        let frame = ip4_frame(client(), resolver(), 248, 0, 0, 0, 0);

        assert_eq!(pipeline.classify(&frame, 4, &metrics), Verdict::Redirect(4));
        assert_eq!(counts(&metrics), [1, 0, 0, 0, 0, 1]);
        assert_eq!(pipeline.denylist.as_ref().unwrap().calls.get(), 0);
    }

    #[test]
    fn bypass_protocol_passes_on_unbound_queue() {
        let pipeline = dns_pipeline(&[]).with_bypass_protocol(248);
        let metrics = ClassifierMetrics::new();
        let frame = ip4_frame(client(), resolver(), 248, 0, 0, 0, 0);

        assert_eq!(pipeline.classify(&frame, 0, &metrics), Verdict::Pass);
        assert_eq!(counts(&metrics), [1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn unconfigured_bypass_leaves_protocol_alone() {
        let pipeline = dns_pipeline(&[0]);
        let metrics = ClassifierMetrics::new();
        let frame = ip4_frame(client(), resolver(), 248, 0, 0, 0, 0);

        assert_eq!(pipeline.classify(&frame, 0, &metrics), Verdict::Pass);
        assert_eq!(counts(&metrics), [1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn bypass_never_applies_to_ipv6() {
        let pipeline = dns_pipeline(&[0]).with_bypass_protocol(248);
        let metrics = ClassifierMetrics::new();
        let mut frame = udp6_frame(40000, 53, 12);
        frame[ETH_HLEN + 6] = 248;

        assert_eq!(pipeline.classify(&frame, 0, &metrics), Verdict::Pass);
        assert_eq!(counts(&metrics), [1, 0, 0, 0, 0, 0]);
    }

    // ---- counter exactness ----

    #[test]
    fn dns_count_partitions_into_outcomes() {
        let denylist = PrefixDenylist::new(&[(client(), 32)]);
        let pipeline = Pipeline::new(PortTable::new(&[53]), Some(denylist), QueueTable::new(&[0]));
        let metrics = ClassifierMetrics::new();

        // 3 redirected, 2 blocked, 1 passed (unbound queue), 2 non-DNS.
        let ok = udp4_frame(resolver(), client(), 53, 40000, 20);
        for _ in 0..3 {
            pipeline.classify(&ok, 0, &metrics);
        }
        let denied = udp4_frame(client(), resolver(), 40000, 53, 12);
        for _ in 0..2 {
            pipeline.classify(&denied, 0, &metrics);
        }
        pipeline.classify(&ok, 7, &metrics);
        pipeline.classify(&udp4_frame(client(), resolver(), 40000, 8080, 12), 0, &metrics);
        pipeline.classify(&[0u8; 10], 0, &metrics);

        assert_eq!(counts(&metrics), [8, 6, 3, 2, 1, 0]);
        assert_eq!(
            metrics.get(Counter::DnsPackets),
            metrics.get(Counter::Redirected)
                + metrics.get(Counter::Blocked)
                + metrics.get(Counter::Passed)
        );
    }

    #[test]
    fn port_table_handles_multiple_ports() {
        let pipeline = Pipeline::new(
            PortTable::new(&[53, 5353]),
            None::<PrefixDenylist>,
            QueueTable::new(&[0]),
        );
        let metrics = ClassifierMetrics::new();

        let mdns = udp4_frame(client(), resolver(), 40000, 5353, 12);
        assert_eq!(pipeline.classify(&mdns, 0, &metrics), Verdict::Redirect(0));

        let plain = udp4_frame(client(), resolver(), 40000, 4000, 12);
        assert_eq!(pipeline.classify(&plain, 0, &metrics), Verdict::Pass);

        assert_eq!(counts(&metrics), [2, 1, 1, 0, 0, 0]);
    }
}
