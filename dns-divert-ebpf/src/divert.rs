//! Core classification pipeline: bounded header parsing, DNS port match,
//! IPv4 denylist, redirect to the arrival queue's AF_XDP socket.
//!
//! Every field read is preceded by an explicit bounds check against
//! data_end; the verifier rejects the program otherwise. Any malformed or
//! out-of-scope frame resolves to XDP_PASS; only a denylist hit drops.

use aya_ebpf::{bindings::xdp_action, maps::lpm_trie::Key, programs::XdpContext};
use aya_log_ebpf::debug;

use dns_divert_common::*;

use crate::{DENYLIST_V4, DNS_PORTS, METRICS, QUEUE_ACTIVE, SETTINGS, XSK_SOCKETS};

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// The closed set of pipeline counters. `Total` counts every frame, `Dns`
/// marks the checkpoint where the full parse and the port match have both
/// succeeded, and each DNS frame then lands in exactly one of `Blocked`,
/// `Redirected`, or `Passed`.
#[derive(Clone, Copy)]
enum Counter {
    Total,
    Dns,
    Redirected,
    Blocked,
    Passed,
    Bypassed,
}

#[inline(always)]
fn bump(counter: Counter) {
    if let Some(metrics) = METRICS.get_ptr_mut(0) {
        unsafe {
            match counter {
                Counter::Total => (*metrics).total_packets += 1,
                Counter::Dns => (*metrics).dns_packets += 1,
                Counter::Redirected => (*metrics).redirected += 1,
                Counter::Blocked => (*metrics).blocked += 1,
                Counter::Passed => (*metrics).passed += 1,
                Counter::Bypassed => (*metrics).bypassed += 1,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Main Classification Logic
// ---------------------------------------------------------------------------

/// Classify one frame. Returns the XDP action; the caller maps Err to
/// XDP_PASS as well, so every path is fail-open except the denylist.
pub fn try_divert(ctx: &XdpContext) -> Result<u32, ()> {
    bump(Counter::Total);

    let data = ctx.data();
    let data_end = ctx.data_end();

    // Userspace writes the settings entry before attaching; fall back to
    // denylist-on / bypass-off if it hasn't.
    let settings = match SETTINGS.get(0) {
        Some(s) => *s,
        None => FilterSettings::initial(),
    };

    // --- Parse Ethernet header ---
    if data + ETH_HLEN > data_end {
        return Ok(xdp_action::XDP_PASS);
    }
    let ether_type =
        u16::from_be(unsafe { (data as *const u8).add(12).cast::<u16>().read_unaligned() });

    // --- Parse L3 header: locate the transport header, keep the IPv4
    //     source for the denylist (IPv6 sources are never denylisted) ---
    let (l4_off, v4_saddr) = match ether_type {
        ETH_P_IP => {
            if data + ETH_HLEN + IP_HLEN > data_end {
                return Ok(xdp_action::XDP_PASS);
            }
            let ip_start = data + ETH_HLEN;
            let ver_ihl: u8 = unsafe { *(ip_start as *const u8) };
            let protocol: u8 = unsafe { *((ip_start + 9) as *const u8) };

            // Optional carve-out stage: a configured IP protocol skips DNS
            // classification entirely and goes straight to the queue's
            // socket. Counted separately from the DNS pipeline.
            if settings.bypass_protocol != 0 && protocol == settings.bypass_protocol {
                if let Some(action) = redirect_queue(ctx) {
                    bump(Counter::Bypassed);
                    return Ok(action);
                }
                return Ok(xdp_action::XDP_PASS);
            }

            if protocol != IPPROTO_UDP {
                return Ok(xdp_action::XDP_PASS);
            }

            let ip_hdr_len = ((ver_ihl & 0x0F) as usize) * 4;
            if ip_hdr_len < IP_HLEN {
                return Ok(xdp_action::XDP_PASS);
            }

            // Network byte order, as the LPM trie stores it.
            let saddr: u32 = unsafe { ((ip_start + 12) as *const u32).read_unaligned() };

            (ETH_HLEN + ip_hdr_len, Some(saddr))
        }
        ETH_P_IPV6 => {
            if data + ETH_HLEN + IPV6_HLEN > data_end {
                return Ok(xdp_action::XDP_PASS);
            }
            // No extension-header walking: anything but immediate UDP is
            // out of scope.
            let next_header: u8 = unsafe { *((data + ETH_HLEN + 6) as *const u8) };
            if next_header != IPPROTO_UDP {
                return Ok(xdp_action::XDP_PASS);
            }
            (ETH_HLEN + IPV6_HLEN, None)
        }
        _ => return Ok(xdp_action::XDP_PASS),
    };

    // --- Parse UDP header ---
    if data + l4_off + UDP_HLEN > data_end {
        return Ok(xdp_action::XDP_PASS);
    }
    // Ports stay in network byte order for direct map lookup.
    let src_port: u16 = unsafe { ((data + l4_off) as *const u16).read_unaligned() };
    let dst_port: u16 = unsafe { ((data + l4_off + 2) as *const u16).read_unaligned() };

    // --- Require a minimal DNS header past the UDP header ---
    if data + l4_off + UDP_HLEN + DNS_HLEN > data_end {
        return Ok(xdp_action::XDP_PASS);
    }

    // --- Port set: either direction counts (queries to 53, responses
    //     from 53) ---
    if unsafe { DNS_PORTS.get(&src_port) }.is_none()
        && unsafe { DNS_PORTS.get(&dst_port) }.is_none()
    {
        return Ok(xdp_action::XDP_PASS);
    }

    bump(Counter::Dns);

    // --- IPv4 denylist (longest-prefix match on the source address) ---
    if settings.denylist_enabled != 0 {
        if let Some(saddr) = v4_saddr {
            let key = Key::new(32, saddr);
            if DENYLIST_V4.get(&key).is_some() {
                bump(Counter::Blocked);
                debug!(ctx, "denylist drop src={:i}", u32::from_be(saddr));
                return Ok(xdp_action::XDP_DROP);
            }
        }
    }

    // --- Redirect to the AF_XDP socket bound to this queue ---
    if let Some(action) = redirect_queue(ctx) {
        bump(Counter::Redirected);
        return Ok(action);
    }

    bump(Counter::Passed);
    Ok(xdp_action::XDP_PASS)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Redirect the frame to the AF_XDP socket registered for the RX queue it
/// arrived on. None if the queue has no active binding or the redirect
/// fails — the callers treat both as "no redirect target".
#[inline(always)]
fn redirect_queue(ctx: &XdpContext) -> Option<u32> {
    let queue = unsafe { (*ctx.ctx).rx_queue_index };

    match QUEUE_ACTIVE.get(queue) {
        Some(active) if *active != 0 => {}
        _ => return None,
    }

    match XSK_SOCKETS.redirect(queue, 0) {
        Ok(action) => Some(action),
        Err(_) => None,
    }
}
