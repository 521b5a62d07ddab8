//! XDP eBPF program for ingress DNS classification.
//!
//! Attached to the XDP hook on the configured network interface. Splits DNS
//! query/response traffic (by UDP port set) away from ordinary traffic
//! before it reaches the kernel stack: matching frames are redirected to the
//! AF_XDP socket bound to the RX queue they arrived on, denylisted IPv4
//! sources are dropped, everything else passes through untouched.
//!
//! This is the fast path — classification never leaves the kernel.

#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::{xdp_action, BPF_F_NO_PREALLOC},
    macros::{map, xdp},
    maps::{lpm_trie::LpmTrie, Array, HashMap, PerCpuArray, XskMap},
    programs::XdpContext,
};

use dns_divert_common::*;

mod divert;

// ---------------------------------------------------------------------------
// eBPF Maps
// ---------------------------------------------------------------------------

/// AF_XDP socket fds, indexed by RX queue. Userspace registers one socket
/// per queue; matching frames are redirected to the socket for the queue
/// they arrived on.
#[map]
static XSK_SOCKETS: XskMap = XskMap::with_max_entries(MAX_QUEUES, 0);

/// Queue binding flags, indexed by RX queue. Nonzero = the queue has an
/// active redirect target in XSK_SOCKETS.
#[map]
static QUEUE_ACTIVE: Array<u32> = Array::with_max_entries(MAX_QUEUES, 0);

/// DNS port set. Keys are UDP ports in network byte order; a frame whose
/// source or destination port is present is DNS traffic. Value unused.
#[map]
static DNS_PORTS: HashMap<u16, u8> = HashMap::with_max_entries(MAX_DNS_PORTS, 0);

/// Pipeline counters, one per-CPU entry. Lock-free via per-CPU.
#[map]
static METRICS: PerCpuArray<PacketMetrics> = PerCpuArray::with_max_entries(1, 0);

/// IPv4 source denylist. Longest-prefix match on the address in network
/// byte order; any hit drops the frame. Value unused.
#[map]
static DENYLIST_V4: LpmTrie<u32, u8> =
    LpmTrie::with_max_entries(DENYLIST_CAPACITY, BPF_F_NO_PREALLOC);

/// Optional-stage knobs, written by userspace before attach.
#[map]
static SETTINGS: Array<FilterSettings> = Array::with_max_entries(1, 0);

// ---------------------------------------------------------------------------
// XDP Entry Point
// ---------------------------------------------------------------------------

/// XDP hook: classify one frame and return exactly one terminal action.
///
/// Returns:
/// - `XDP_REDIRECT`: DNS frame delivered to the queue's AF_XDP socket
/// - `XDP_DROP`: DNS frame from a denylisted IPv4 source
/// - `XDP_PASS`: everything else (non-DNS, malformed, or no active socket)
#[xdp]
pub fn dns_divert(ctx: XdpContext) -> u32 {
    match divert::try_divert(&ctx) {
        Ok(action) => action,
        Err(_) => xdp_action::XDP_PASS,
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
