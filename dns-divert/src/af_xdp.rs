//! AF_XDP receive path: one socket and one consumer thread per RX queue.
//!
//! The XDP program redirects classified DNS frames into the socket bound to
//! the queue they arrived on, so per-queue consumers never contend for
//! frames. Each consumer drains its RX ring, re-runs the userspace
//! classification pipeline over every frame to confirm the kernel's
//! decision, tallies queries against responses via the DNS QR bit, and
//! returns the frame to the fill ring.
//!
//! Architecture:
//! 1. XDP program classifies frames and redirects to the per-queue socket
//! 2. Consumer reads complete L2 frames from the RX ring (shared UMEM)
//! 3. Classifies each frame against the current table snapshot
//! 4. Consumed buffers are returned to the fill ring for reuse

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use tracing::{debug, error, info, warn};

use crate::classifier::{ClassifierMetrics, DivertPipeline, Verdict};
use crate::config::Config;
use crate::frame::{DnsHeaderView, EthernetView, Ipv4View, Ipv6View};
use dns_divert_common::{
    ETH_HLEN, ETH_P_IP, ETH_P_IPV6, IPPROTO_UDP, IPV6_HLEN, IP_HLEN, MAX_QUEUES, UDP_HLEN,
};

// ---------------------------------------------------------------------------
// AF_XDP Configuration Constants
// ---------------------------------------------------------------------------

/// Number of descriptors in each ring (must be power of 2).
const RING_SIZE: u32 = 4096;

/// UMEM frame size — each frame holds one packet.
const FRAME_SIZE: u32 = 4096;

/// Total number of UMEM frames. 2x ring size so the fill ring can always
/// be refilled while the RX ring has entries.
const NUM_FRAMES: u32 = RING_SIZE * 2;

/// Total UMEM size in bytes.
const UMEM_SIZE: usize = (NUM_FRAMES * FRAME_SIZE) as usize;

/// Frames drained from the RX ring per poll wakeup.
const RX_BATCH: u32 = 64;

// ---------------------------------------------------------------------------
// Linux AF_XDP Constants (from <linux/if_xdp.h>)
// ---------------------------------------------------------------------------

const SOL_XDP: i32 = 283;
const XDP_MMAP_OFFSETS: i32 = 1;
const XDP_RX_RING: i32 = 2;
const XDP_UMEM_REG: i32 = 4;
const XDP_UMEM_FILL_RING: i32 = 5;
const XDP_UMEM_COMPLETION_RING: i32 = 6;

// mmap page offsets
const XDP_PGOFF_RX_RING: i64 = 0;
const XDP_UMEM_PGOFF_FILL_RING: i64 = 0x100000000;

// Bind flags
const XDP_COPY: u16 = 1 << 1;

// ---------------------------------------------------------------------------
// AF_XDP Kernel Structs (repr(C) for FFI)
// ---------------------------------------------------------------------------

#[repr(C)]
struct XdpUmemReg {
    addr: u64,
    len: u64,
    chunk_size: u32,
    headroom: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct XdpRingOffset {
    producer: u64,
    consumer: u64,
    desc: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct XdpMmapOffsets {
    rx: XdpRingOffset,
    tx: XdpRingOffset,
    fr: XdpRingOffset, // fill ring
    cr: XdpRingOffset, // completion ring
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct XdpDesc {
    addr: u64,
    len: u32,
    options: u32,
}

#[repr(C)]
struct SockaddrXdp {
    sxdp_family: u16,
    sxdp_flags: u16,
    sxdp_ifindex: u32,
    sxdp_queue_id: u32,
    sxdp_shared_umem_fd: u32,
}

// ---------------------------------------------------------------------------
// Ring Buffer Abstraction
// ---------------------------------------------------------------------------

/// Manages a mmap'd ring buffer (producer/consumer pattern).
struct RingBuffer {
    /// Pointer to producer index (u32, atomic).
    producer: *mut u32,
    /// Pointer to consumer index (u32, atomic).
    consumer: *mut u32,
    /// Pointer to flags (u32).
    _flags: *mut u32,
    /// Pointer to the descriptor array.
    ring: *mut u8,
    /// Mask for wrapping indices (ring_size - 1).
    mask: u32,
    /// Cached producer value (for the fill-ring producer side).
    cached_prod: u32,
    /// mmap base pointer (for cleanup).
    mmap_ptr: *mut u8,
    /// mmap size (for cleanup).
    mmap_len: usize,
}

unsafe impl Send for RingBuffer {}

impl RingBuffer {
    fn load_producer(&self) -> u32 {
        unsafe { core::ptr::read_volatile(self.producer) }
    }

    fn load_consumer(&self) -> u32 {
        unsafe { core::ptr::read_volatile(self.consumer) }
    }

    fn store_producer(&self, val: u32) {
        unsafe {
            core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
            core::ptr::write_volatile(self.producer, val);
        }
    }

    fn store_consumer(&self, val: u32) {
        unsafe {
            core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
            core::ptr::write_volatile(self.consumer, val);
        }
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        if !self.mmap_ptr.is_null() && self.mmap_len > 0 {
            unsafe {
                libc::munmap(self.mmap_ptr as *mut libc::c_void, self.mmap_len);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// AF_XDP Socket State
// ---------------------------------------------------------------------------

/// Complete AF_XDP socket with UMEM and ring buffers, bound to one RX
/// queue.
struct XskSocket {
    fd: RawFd,
    umem_ptr: *mut u8,
    umem_len: usize,
    fill_ring: RingBuffer,
    rx_ring: RingBuffer,
    ring_size: u32,
}

unsafe impl Send for XskSocket {}

impl XskSocket {
    /// Create and configure an AF_XDP socket bound to `queue_id`.
    fn create(ifindex: u32, queue_id: u32) -> Result<Self> {
        // --- Create AF_XDP socket ---
        let fd = unsafe { libc::socket(libc::AF_XDP, libc::SOCK_RAW, 0) };
        if fd < 0 {
            bail!(
                "creating AF_XDP socket: {}",
                std::io::Error::last_os_error()
            );
        }

        // --- Allocate UMEM ---
        let umem_ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                UMEM_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if umem_ptr == libc::MAP_FAILED {
            unsafe { libc::close(fd) };
            bail!("mmap UMEM: {}", std::io::Error::last_os_error());
        }

        // --- Register UMEM ---
        let umem_reg = XdpUmemReg {
            addr: umem_ptr as u64,
            len: UMEM_SIZE as u64,
            chunk_size: FRAME_SIZE,
            headroom: 0,
            flags: 0,
        };

        let ret = unsafe {
            libc::setsockopt(
                fd,
                SOL_XDP,
                XDP_UMEM_REG,
                &umem_reg as *const _ as *const libc::c_void,
                std::mem::size_of::<XdpUmemReg>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            Self::cleanup_early(fd, umem_ptr as *mut u8);
            bail!("XDP_UMEM_REG: {}", std::io::Error::last_os_error());
        }

        // --- Set ring sizes ---
        let ring_size = RING_SIZE;
        for (opt, name) in [
            (XDP_UMEM_FILL_RING, "FILL"),
            (XDP_UMEM_COMPLETION_RING, "COMPLETION"),
            (XDP_RX_RING, "RX"),
        ] {
            let ret = unsafe {
                libc::setsockopt(
                    fd,
                    SOL_XDP,
                    opt,
                    &ring_size as *const _ as *const libc::c_void,
                    std::mem::size_of::<u32>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                Self::cleanup_early(fd, umem_ptr as *mut u8);
                bail!(
                    "setting {} ring size: {}",
                    name,
                    std::io::Error::last_os_error()
                );
            }
        }

        // --- Get mmap offsets ---
        let mut offsets = XdpMmapOffsets::default();
        let mut optlen = std::mem::size_of::<XdpMmapOffsets>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                SOL_XDP,
                XDP_MMAP_OFFSETS,
                &mut offsets as *mut _ as *mut libc::c_void,
                &mut optlen,
            )
        };
        if ret < 0 {
            Self::cleanup_early(fd, umem_ptr as *mut u8);
            bail!("XDP_MMAP_OFFSETS: {}", std::io::Error::last_os_error());
        }

        debug!(?offsets, "got XDP mmap offsets");

        // --- mmap fill ring ---
        let fill_ring_mmap_len =
            offsets.fr.desc as usize + ring_size as usize * std::mem::size_of::<u64>();
        let fill_ring_ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                fill_ring_mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                XDP_UMEM_PGOFF_FILL_RING,
            )
        };
        if fill_ring_ptr == libc::MAP_FAILED {
            Self::cleanup_early(fd, umem_ptr as *mut u8);
            bail!("mmap fill ring: {}", std::io::Error::last_os_error());
        }

        let fill_ring = RingBuffer {
            producer: unsafe { fill_ring_ptr.byte_add(offsets.fr.producer as usize) as *mut u32 },
            consumer: unsafe { fill_ring_ptr.byte_add(offsets.fr.consumer as usize) as *mut u32 },
            _flags: unsafe { fill_ring_ptr.byte_add(offsets.fr.flags as usize) as *mut u32 },
            ring: unsafe { fill_ring_ptr.byte_add(offsets.fr.desc as usize) as *mut u8 },
            mask: ring_size - 1,
            cached_prod: 0,
            mmap_ptr: fill_ring_ptr as *mut u8,
            mmap_len: fill_ring_mmap_len,
        };

        // --- mmap RX ring ---
        let rx_ring_mmap_len =
            offsets.rx.desc as usize + ring_size as usize * std::mem::size_of::<XdpDesc>();
        let rx_ring_ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                rx_ring_mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                XDP_PGOFF_RX_RING,
            )
        };
        if rx_ring_ptr == libc::MAP_FAILED {
            // fill_ring unmaps when dropped
            Self::cleanup_early(fd, umem_ptr as *mut u8);
            bail!("mmap RX ring: {}", std::io::Error::last_os_error());
        }

        let rx_ring = RingBuffer {
            producer: unsafe { rx_ring_ptr.byte_add(offsets.rx.producer as usize) as *mut u32 },
            consumer: unsafe { rx_ring_ptr.byte_add(offsets.rx.consumer as usize) as *mut u32 },
            _flags: unsafe { rx_ring_ptr.byte_add(offsets.rx.flags as usize) as *mut u32 },
            ring: unsafe { rx_ring_ptr.byte_add(offsets.rx.desc as usize) as *mut u8 },
            mask: ring_size - 1,
            cached_prod: 0,
            mmap_ptr: rx_ring_ptr as *mut u8,
            mmap_len: rx_ring_mmap_len,
        };

        // --- Bind to interface + queue ---
        let sxdp = SockaddrXdp {
            sxdp_family: libc::AF_XDP as u16,
            sxdp_flags: XDP_COPY, // copy mode for broad NIC compatibility
            sxdp_ifindex: ifindex,
            sxdp_queue_id: queue_id,
            sxdp_shared_umem_fd: 0,
        };

        let ret = unsafe {
            libc::bind(
                fd,
                &sxdp as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrXdp>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            // Retry without XDP_COPY (some older kernels)
            let sxdp_fallback = SockaddrXdp {
                sxdp_flags: 0,
                ..sxdp
            };
            let ret2 = unsafe {
                libc::bind(
                    fd,
                    &sxdp_fallback as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<SockaddrXdp>() as libc::socklen_t,
                )
            };
            if ret2 < 0 {
                let err = std::io::Error::last_os_error();
                // fill_ring and rx_ring unmap when dropped
                Self::cleanup_early(fd, umem_ptr as *mut u8);
                bail!(
                    "bind AF_XDP socket to ifindex={} queue={}: {}",
                    ifindex,
                    queue_id,
                    err
                );
            }
        }

        info!(ifindex, queue_id, ring_size, "AF_XDP socket bound");

        Ok(Self {
            fd,
            umem_ptr: umem_ptr as *mut u8,
            umem_len: UMEM_SIZE,
            fill_ring,
            rx_ring,
            ring_size,
        })
    }

    /// Pre-fill the fill ring with UMEM frame addresses so the kernel has
    /// frames to receive into.
    fn prefill(&mut self) {
        let ring_size = self.ring_size;

        for i in 0..ring_size {
            let frame_addr = (i as u64) * (FRAME_SIZE as u64);
            unsafe {
                let slot = self
                    .fill_ring
                    .ring
                    .add((i & self.fill_ring.mask) as usize * std::mem::size_of::<u64>())
                    as *mut u64;
                *slot = frame_addr;
            }
        }

        self.fill_ring.store_producer(ring_size);
        self.fill_ring.cached_prod = ring_size;

        debug!(frames = ring_size, "pre-filled fill ring");
    }

    /// Drain up to `RX_BATCH` descriptors from the RX ring into `batch`.
    ///
    /// Caller must process the frames and then `refill()` their addresses.
    fn poll_rx(&mut self, batch: &mut Vec<(u64, u32)>) -> usize {
        batch.clear();

        let prod = self.rx_ring.load_producer();
        let cons = self.rx_ring.load_consumer();
        let available = prod.wrapping_sub(cons);

        if available == 0 {
            return 0;
        }

        unsafe {
            core::sync::atomic::fence(core::sync::atomic::Ordering::Acquire);
        }

        let to_read = available.min(RX_BATCH);

        for i in 0..to_read {
            let idx = (cons.wrapping_add(i) & self.rx_ring.mask) as usize;
            let desc = unsafe {
                let ptr = self.rx_ring.ring.add(idx * std::mem::size_of::<XdpDesc>())
                    as *const XdpDesc;
                *ptr
            };
            batch.push((desc.addr, desc.len));
        }

        self.rx_ring.store_consumer(cons.wrapping_add(to_read));

        to_read as usize
    }

    /// Return consumed frame addresses to the fill ring.
    fn refill(&mut self, addrs: &[u64]) -> Result<()> {
        if addrs.is_empty() {
            return Ok(());
        }

        let prod = self.fill_ring.cached_prod;
        let cons = self.fill_ring.load_consumer();
        let free_slots = self.ring_size.wrapping_sub(prod.wrapping_sub(cons));

        if (addrs.len() as u32) > free_slots {
            bail!(
                "fill ring full: need {} slots, have {}",
                addrs.len(),
                free_slots
            );
        }

        for (i, &addr) in addrs.iter().enumerate() {
            let idx = (prod.wrapping_add(i as u32) & self.fill_ring.mask) as usize;
            unsafe {
                let slot =
                    self.fill_ring.ring.add(idx * std::mem::size_of::<u64>()) as *mut u64;
                *slot = addr;
            }
        }

        let new_prod = prod.wrapping_add(addrs.len() as u32);
        self.fill_ring.store_producer(new_prod);
        self.fill_ring.cached_prod = new_prod;

        Ok(())
    }

    /// Raw fd, for poll and XSK map registration.
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Read a frame from the UMEM (zero-copy view into the mmap).
    fn packet_data(&self, addr: u64, len: u32) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.umem_ptr.add(addr as usize), len as usize) }
    }

    fn cleanup_early(fd: RawFd, umem_ptr: *mut u8) {
        unsafe {
            libc::close(fd);
            if !umem_ptr.is_null() {
                libc::munmap(umem_ptr as *mut libc::c_void, UMEM_SIZE);
            }
        }
    }
}

impl Drop for XskSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
            if !self.umem_ptr.is_null() {
                libc::munmap(self.umem_ptr as *mut libc::c_void, self.umem_len);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Public Interface
// ---------------------------------------------------------------------------

/// Statistics for one queue consumer.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub frames: AtomicU64,
    pub bytes: AtomicU64,
    pub queries: AtomicU64,
    pub responses: AtomicU64,
    /// Frames where no DNS header could be located at all.
    pub parse_errors: AtomicU64,
    /// Frames the current tables would not have redirected here (stale
    /// entries around a config reload, mostly).
    pub unexpected: AtomicU64,
    pub rx_ring_empty: AtomicU64,
    pub fill_ring_full: AtomicU64,
}

struct QueueConsumer {
    queue: u32,
    thread: Option<thread::JoinHandle<()>>,
    stats: Arc<ConsumerStats>,
    shutdown: Arc<AtomicBool>,
}

/// All running queue consumers for one interface.
pub struct ConsumerPool {
    consumers: Vec<QueueConsumer>,
    sockets: Vec<(u32, RawFd)>,
}

impl ConsumerPool {
    /// Bind an AF_XDP socket per RX queue and start one consumer thread
    /// each. Sockets are not redirected into until the caller registers
    /// their fds in the XSK map and activates the queues.
    pub fn start(
        config: &Config,
        pipeline: Arc<ArcSwap<DivertPipeline>>,
        metrics: Arc<ClassifierMetrics>,
    ) -> Result<Self> {
        let ifindex = nix::net::if_::if_nametoindex(config.interface.as_str())
            .with_context(|| format!("interface '{}' not found", config.interface))?;

        let queue_count = if config.queues.count > 0 {
            config.queues.count
        } else {
            effective_queue_count(discover_rx_queues(&config.interface)?)
        };

        info!(
            interface = %config.interface,
            ifindex,
            queues = queue_count,
            ring_size = RING_SIZE,
            "starting AF_XDP consumers"
        );

        // Bind all sockets first so a NIC with fewer usable queues degrades
        // to the ones that bound instead of failing outright.
        let mut bound: Vec<(u32, XskSocket)> = Vec::new();
        for queue in 0..queue_count {
            match XskSocket::create(ifindex, queue) {
                Ok(mut xsk) => {
                    xsk.prefill();
                    bound.push((queue, xsk));
                }
                Err(e) if !bound.is_empty() => {
                    warn!(
                        queue,
                        error = %e,
                        bound = bound.len(),
                        "queue refused AF_XDP bind; continuing with bound queues"
                    );
                    break;
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("binding AF_XDP socket to queue {}", queue));
                }
            }
        }

        let pin_cpus = config.queues.pin_cpus;
        let mut consumers = Vec::with_capacity(bound.len());
        let mut sockets = Vec::with_capacity(bound.len());

        for (queue, xsk) in bound {
            let fd = xsk.raw_fd();
            let stats = Arc::new(ConsumerStats::default());
            // One flag per consumer so a single queue can be retired if
            // its fd never makes it into the XSK map.
            let shutdown = Arc::new(AtomicBool::new(false));

            let shutdown_flag = shutdown.clone();
            let pipeline = pipeline.clone();
            let metrics = metrics.clone();
            let stats_clone = stats.clone();

            let handle = thread::Builder::new()
                .name(format!("dns-divert-rx{}", queue))
                .spawn(move || {
                    // Pin to CPU core if requested
                    if pin_cpus {
                        let core = queue as usize % num_cpus();
                        if let Some(core_id) = (core_affinity::CoreId { id: core }).into() {
                            core_affinity::set_for_current(core_id);
                            debug!(queue, core, "pinned to CPU core");
                        }
                    }

                    if let Err(e) =
                        consumer_loop(xsk, queue, &pipeline, &metrics, &shutdown_flag, &stats_clone)
                    {
                        error!(queue, error = %e, "consumer exited with error");
                    }
                })
                .with_context(|| format!("spawning consumer for queue {}", queue))?;

            consumers.push(QueueConsumer {
                queue,
                thread: Some(handle),
                stats,
                shutdown,
            });
            sockets.push((queue, fd));
        }

        Ok(Self { consumers, sockets })
    }

    /// Socket fds per bound queue, for XSK map registration.
    pub fn sockets(&self) -> &[(u32, RawFd)] {
        &self.sockets
    }

    /// Per-queue stats handles for the metrics exporter.
    pub fn stats_handles(&self) -> Vec<(u32, Arc<ConsumerStats>)> {
        self.consumers
            .iter()
            .map(|c| (c.queue, c.stats.clone()))
            .collect()
    }

    /// Stop one queue's consumer and drop its socket.
    ///
    /// For a socket that bound but whose fd never made it into the XSK
    /// map: no frame can reach it, so its consumer has nothing to drain.
    pub fn retire_queue(&mut self, queue: u32) {
        let pos = match self.consumers.iter().position(|c| c.queue == queue) {
            Some(pos) => pos,
            None => return,
        };
        let mut consumer = self.consumers.remove(pos);
        consumer.shutdown.store(true, Ordering::Release);
        if let Some(handle) = consumer.thread.take() {
            let _ = handle.join();
        }
        self.sockets.retain(|&(q, _)| q != queue);
        info!(queue, "consumer retired");
    }

    /// Signal all consumers to stop and wait for them to finish.
    pub fn shutdown(mut self) {
        info!("shutting down AF_XDP consumers");
        for consumer in &self.consumers {
            consumer.shutdown.store(true, Ordering::Release);
        }
        for consumer in &mut self.consumers {
            if let Some(handle) = consumer.thread.take() {
                let _ = handle.join();
            }
            info!(
                queue = consumer.queue,
                frames = consumer.stats.frames.load(Ordering::Relaxed),
                queries = consumer.stats.queries.load(Ordering::Relaxed),
                responses = consumer.stats.responses.load(Ordering::Relaxed),
                unexpected = consumer.stats.unexpected.load(Ordering::Relaxed),
                "consumer stopped"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Consumer Loop
// ---------------------------------------------------------------------------

/// Drain the RX ring, account every frame, return frames to the fill ring.
fn consumer_loop(
    mut xsk: XskSocket,
    queue: u32,
    pipeline: &ArcSwap<DivertPipeline>,
    metrics: &ClassifierMetrics,
    shutdown: &AtomicBool,
    stats: &ConsumerStats,
) -> Result<()> {
    let mut pollfd = libc::pollfd {
        fd: xsk.raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };

    let mut rx_batch: Vec<(u64, u32)> = Vec::with_capacity(RX_BATCH as usize);
    let mut refill_addrs: Vec<u64> = Vec::with_capacity(RX_BATCH as usize);

    info!(queue, "entering AF_XDP receive loop");

    while !shutdown.load(Ordering::Relaxed) {
        // Poll with a 100ms timeout so the shutdown flag is honored.
        pollfd.revents = 0;
        let poll_ret = unsafe { libc::poll(&mut pollfd, 1, 100) };
        if poll_ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        if poll_ret == 0 {
            continue;
        }

        let received = xsk.poll_rx(&mut rx_batch);
        if received == 0 {
            stats.rx_ring_empty.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        refill_addrs.clear();
        let tables = pipeline.load();

        for &(addr, len) in &rx_batch {
            let frame = xsk.packet_data(addr, len);

            stats.frames.fetch_add(1, Ordering::Relaxed);
            stats.bytes.fetch_add(len as u64, Ordering::Relaxed);

            // Re-run the pipeline against the current tables; anything but
            // a redirect to this queue means the kernel and userspace
            // disagree about the frame.
            let verdict = tables.classify(frame, queue, metrics);
            if verdict != Verdict::Redirect(queue) {
                stats.unexpected.fetch_add(1, Ordering::Relaxed);
            }

            match dns_header(frame) {
                Some(dns) => {
                    if dns.is_response() {
                        stats.responses.fetch_add(1, Ordering::Relaxed);
                    } else {
                        stats.queries.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => {
                    // Bypass-protocol frames carry no DNS header.
                    if !is_bypass_frame(frame, tables.bypass_protocol()) {
                        stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            refill_addrs.push(addr);
        }

        if !refill_addrs.is_empty() {
            if let Err(e) = xsk.refill(&refill_addrs) {
                warn!(queue, error = %e, "failed to refill AF_XDP ring");
                stats.fill_ring_full.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    info!(queue, "AF_XDP receive loop exited");
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Locate the DNS header in a redirected frame, IPv4 or IPv6.
fn dns_header(frame: &[u8]) -> Option<DnsHeaderView<'_>> {
    let eth = EthernetView::parse(frame)?;

    let l4_offset = match eth.ethertype() {
        ETH_P_IP => {
            let ip = Ipv4View::parse(frame, ETH_HLEN)?;
            if ip.protocol() != IPPROTO_UDP {
                return None;
            }
            let header_len = ip.header_len();
            if header_len < IP_HLEN {
                return None;
            }
            ETH_HLEN + header_len
        }
        ETH_P_IPV6 => {
            let ip = Ipv6View::parse(frame, ETH_HLEN)?;
            if ip.next_header() != IPPROTO_UDP {
                return None;
            }
            ETH_HLEN + IPV6_HLEN
        }
        _ => return None,
    };

    DnsHeaderView::parse(frame, l4_offset + UDP_HLEN)
}

/// Whether a frame matches the configured bypass protocol.
fn is_bypass_frame(frame: &[u8], bypass: Option<u8>) -> bool {
    let bypass = match bypass {
        Some(protocol) => protocol,
        None => return false,
    };
    let eth = match EthernetView::parse(frame) {
        Some(eth) => eth,
        None => return false,
    };
    if eth.ethertype() != ETH_P_IP {
        return false;
    }
    match Ipv4View::parse(frame, ETH_HLEN) {
        Some(ip) => ip.protocol() == bypass,
        None => false,
    }
}

/// Cap a discovered queue count at the XSK map size. Queue ids past the
/// map's last slot have nowhere to redirect, so their sockets could never
/// be registered.
fn effective_queue_count(discovered: u32) -> u32 {
    if discovered > MAX_QUEUES {
        warn!(
            discovered,
            limit = MAX_QUEUES,
            "interface has more RX queues than XSK map entries; consuming the first ones"
        );
        return MAX_QUEUES;
    }
    discovered
}

/// Count RX queues from sysfs (`/sys/class/net/<if>/queues/rx-*`).
fn discover_rx_queues(interface: &str) -> Result<u32> {
    let path = format!("/sys/class/net/{}/queues", interface);
    let entries = std::fs::read_dir(&path).with_context(|| format!("reading {}", path))?;

    let mut count = 0u32;
    for entry in entries {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with("rx-") {
            count += 1;
        }
    }
    if count == 0 {
        bail!("no RX queues found under {}", path);
    }
    Ok(count)
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{PortTable, PrefixDenylist, QueueTable};
    use std::net::Ipv4Addr;

    fn dns_query_frame() -> Vec<u8> {
        let mut frame = vec![0u8; 54];
        frame[12..14].copy_from_slice(&ETH_P_IP.to_be_bytes());
        frame[14] = 0x45;
        frame[23] = IPPROTO_UDP;
        frame[26..30].copy_from_slice(&[203, 0, 113, 7]);
        frame[34..36].copy_from_slice(&40000u16.to_be_bytes());
        frame[36..38].copy_from_slice(&53u16.to_be_bytes());
        frame[38..40].copy_from_slice(&20u16.to_be_bytes());
        frame
    }

    #[test]
    fn locates_dns_header_in_udp_frame() {
        let frame = dns_query_frame();
        let dns = dns_header(&frame).unwrap();
        assert!(!dns.is_response());
    }

    #[test]
    fn locates_response_flag() {
        let mut frame = dns_query_frame();
        frame[44..46].copy_from_slice(&0x8180u16.to_be_bytes());
        let dns = dns_header(&frame).unwrap();
        assert!(dns.is_response());
    }

    #[test]
    fn no_dns_header_in_bypass_frame() {
        let mut frame = dns_query_frame();
        frame[23] = 248;
        assert!(dns_header(&frame).is_none());
        assert!(is_bypass_frame(&frame, Some(248)));
        assert!(!is_bypass_frame(&frame, Some(249)));
        assert!(!is_bypass_frame(&frame, None));
    }

    #[test]
    fn pipeline_confirms_redirected_frame() {
        let pipeline = DivertPipeline::new(
            PortTable::new(&[53]),
            None::<PrefixDenylist>,
            QueueTable::new(&[3]),
        );
        let metrics = ClassifierMetrics::new();
        let frame = dns_query_frame();
        assert_eq!(
            pipeline.classify(&frame, 3, &metrics),
            Verdict::Redirect(3)
        );
    }

    #[test]
    fn failed_socket_create_releases_the_fd() {
        let count_fds = || std::fs::read_dir("/proc/self/fd").unwrap().count();

        let before = count_fds();
        for _ in 0..4 {
            // No interface has this index, so create() fails at whichever
            // stage the environment lets it reach. Each failure must close
            // the socket fd it opened.
            assert!(XskSocket::create(u32::MAX, 0).is_err());
        }
        let after = count_fds();

        assert!(
            after < before + 4,
            "socket fds leaked across failed creates: {} -> {}",
            before,
            after
        );
    }

    #[test]
    fn discovered_queue_count_is_capped_at_xsk_map_size() {
        assert_eq!(effective_queue_count(4), 4);
        assert_eq!(effective_queue_count(MAX_QUEUES), MAX_QUEUES);
        assert_eq!(effective_queue_count(MAX_QUEUES + 8), MAX_QUEUES);
    }

    #[test]
    fn retire_queue_drops_the_consumer_and_its_socket() {
        let consumer = |queue: u32| QueueConsumer {
            queue,
            thread: None,
            stats: Arc::new(ConsumerStats::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
        };
        let mut pool = ConsumerPool {
            consumers: vec![consumer(0), consumer(1)],
            sockets: vec![(0, 10), (1, 11)],
        };

        pool.retire_queue(1);
        assert_eq!(pool.sockets(), &[(0, 10)]);
        assert_eq!(pool.stats_handles().len(), 1);

        // Unknown queues are a no-op.
        pool.retire_queue(7);
        assert_eq!(pool.sockets(), &[(0, 10)]);
    }
}
