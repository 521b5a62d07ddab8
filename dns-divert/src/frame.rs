//! Checked zero-copy header views over raw L2 frames.
//!
//! The kernel program proves its reads with explicit data_end comparisons;
//! this is the same layout logic in safe code. Every view constructor
//! bounds-checks the byte range it needs against the slice it was given and
//! returns None instead of ever reading past it, so a truncated or hostile
//! frame is a representable parse failure, not undefined behavior.

use std::net::Ipv4Addr;

use dns_divert_common::{DNS_FLAG_QR, DNS_HLEN, ETH_HLEN, IPV6_HLEN, IP_HLEN, UDP_HLEN};

// ---------------------------------------------------------------------------
// Ethernet
// ---------------------------------------------------------------------------

/// Read-only view of the 14-byte Ethernet header at the start of a frame.
#[derive(Clone, Copy)]
pub struct EthernetView<'a> {
    bytes: &'a [u8],
}

impl<'a> EthernetView<'a> {
    pub fn parse(frame: &'a [u8]) -> Option<Self> {
        let bytes = frame.get(..ETH_HLEN)?;
        Some(Self { bytes })
    }

    /// EtherType in host order.
    pub fn ethertype(&self) -> u16 {
        u16::from_be_bytes([self.bytes[12], self.bytes[13]])
    }
}

// ---------------------------------------------------------------------------
// IPv4
// ---------------------------------------------------------------------------

/// Read-only view of the fixed 20 bytes of an IPv4 header. The actual
/// header may be longer (options); `header_len` reports the IHL-derived
/// length and the caller validates that the transport header it locates
/// still fits the frame.
#[derive(Clone, Copy)]
pub struct Ipv4View<'a> {
    bytes: &'a [u8],
}

impl<'a> Ipv4View<'a> {
    pub fn parse(frame: &'a [u8], offset: usize) -> Option<Self> {
        let bytes = frame.get(offset..offset.checked_add(IP_HLEN)?)?;
        Some(Self { bytes })
    }

    /// Header length in bytes as declared by the IHL field. May be < 20
    /// (malformed) or place the transport header past the frame end; both
    /// are for the caller to reject.
    pub fn header_len(&self) -> usize {
        ((self.bytes[0] & 0x0F) as usize) * 4
    }

    pub fn protocol(&self) -> u8 {
        self.bytes[9]
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.bytes[12], self.bytes[13], self.bytes[14], self.bytes[15])
    }
}

// ---------------------------------------------------------------------------
// IPv6
// ---------------------------------------------------------------------------

/// Read-only view of the fixed 40-byte IPv6 header. No extension-header
/// walking: if `next_header` is not directly the transport protocol the
/// frame is out of scope for the pipeline.
#[derive(Clone, Copy)]
pub struct Ipv6View<'a> {
    bytes: &'a [u8],
}

impl<'a> Ipv6View<'a> {
    pub fn parse(frame: &'a [u8], offset: usize) -> Option<Self> {
        let bytes = frame.get(offset..offset.checked_add(IPV6_HLEN)?)?;
        Some(Self { bytes })
    }

    pub fn next_header(&self) -> u8 {
        self.bytes[6]
    }
}

// ---------------------------------------------------------------------------
// UDP
// ---------------------------------------------------------------------------

/// Read-only view of an 8-byte UDP header.
#[derive(Clone, Copy)]
pub struct UdpView<'a> {
    bytes: &'a [u8],
}

impl<'a> UdpView<'a> {
    pub fn parse(frame: &'a [u8], offset: usize) -> Option<Self> {
        let bytes = frame.get(offset..offset.checked_add(UDP_HLEN)?)?;
        Some(Self { bytes })
    }

    /// Source port in host order.
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.bytes[0], self.bytes[1]])
    }

    /// Destination port in host order.
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.bytes[2], self.bytes[3]])
    }
}

// ---------------------------------------------------------------------------
// Minimal DNS header
// ---------------------------------------------------------------------------

/// Read-only view of the fixed 12-byte DNS header. Constructing one is the
/// pipeline's "this is plausibly DNS" gate; nothing past these 12 bytes is
/// ever interpreted.
#[derive(Clone, Copy)]
pub struct DnsHeaderView<'a> {
    bytes: &'a [u8],
}

impl<'a> DnsHeaderView<'a> {
    pub fn parse(frame: &'a [u8], offset: usize) -> Option<Self> {
        let bytes = frame.get(offset..offset.checked_add(DNS_HLEN)?)?;
        Some(Self { bytes })
    }

    pub fn flags(&self) -> u16 {
        u16::from_be_bytes([self.bytes[2], self.bytes[3]])
    }

    /// QR bit: set on responses, clear on queries.
    pub fn is_response(&self) -> bool {
        self.flags() & DNS_FLAG_QR != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ethernet_view_requires_full_header() {
        assert!(EthernetView::parse(&[0u8; 13]).is_none());
        assert!(EthernetView::parse(&[0u8; 14]).is_some());
    }

    #[test]
    fn ethernet_view_extracts_ethertype() {
        let mut frame = [0u8; 14];
        frame[12] = 0x08;
        frame[13] = 0x00;
        let eth = EthernetView::parse(&frame).unwrap();
        assert_eq!(eth.ethertype(), 0x0800);
    }

    #[test]
    fn ipv4_view_reports_ihl_without_validating_it() {
        let mut frame = [0u8; 34];
        frame[14] = 0x4F; // IHL 15 => 60-byte header, far past this frame
        frame[23] = 17;
        let ip = Ipv4View::parse(&frame, 14).unwrap();
        assert_eq!(ip.header_len(), 60);
        assert_eq!(ip.protocol(), 17);
    }

    #[test]
    fn ipv4_view_extracts_source_address() {
        let mut frame = [0u8; 34];
        frame[14] = 0x45;
        frame[26..30].copy_from_slice(&[203, 0, 113, 7]);
        let ip = Ipv4View::parse(&frame, 14).unwrap();
        assert_eq!(ip.src_addr(), Ipv4Addr::new(203, 0, 113, 7));
    }

    #[test]
    fn udp_view_rejects_truncated_header() {
        let frame = [0u8; 40];
        assert!(UdpView::parse(&frame, 34).is_none());
        assert!(UdpView::parse(&frame, 32).is_some());
    }

    #[test]
    fn udp_view_ports_are_host_order() {
        let mut frame = [0u8; 42];
        frame[34..36].copy_from_slice(&53u16.to_be_bytes());
        frame[36..38].copy_from_slice(&4096u16.to_be_bytes());
        let udp = UdpView::parse(&frame, 34).unwrap();
        assert_eq!(udp.src_port(), 53);
        assert_eq!(udp.dst_port(), 4096);
    }

    #[test]
    fn dns_view_needs_twelve_bytes() {
        let frame = [0u8; 53];
        assert!(DnsHeaderView::parse(&frame, 42).is_none());
        let frame = [0u8; 54];
        assert!(DnsHeaderView::parse(&frame, 42).is_some());
    }

    #[test]
    fn dns_view_reads_qr_bit() {
        let mut frame = [0u8; 54];
        frame[44..46].copy_from_slice(&0x8180u16.to_be_bytes());
        let dns = DnsHeaderView::parse(&frame, 42).unwrap();
        assert!(dns.is_response());

        frame[44..46].copy_from_slice(&0x0100u16.to_be_bytes());
        let dns = DnsHeaderView::parse(&frame, 42).unwrap();
        assert!(!dns.is_response());
    }

    #[test]
    fn offset_overflow_is_a_parse_failure() {
        let frame = [0u8; 54];
        assert!(UdpView::parse(&frame, usize::MAX - 2).is_none());
    }
}
