//! dns-divert: XDP-based DNS traffic classifier and redirector.
//!
//! Attaches an XDP program to a network interface that inspects every
//! ingress frame, drops DNS traffic from denylisted IPv4 sources, and
//! redirects the remaining DNS packets into per-queue AF_XDP sockets where
//! userspace consumer threads drain and account for them. Everything else
//! passes through to the regular network stack untouched.

mod af_xdp;
mod classifier;
mod config;
mod ebpf_manager;
mod frame;
mod metrics;

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use clap::Parser;
use tokio::signal;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use af_xdp::ConsumerPool;
use classifier::{
    ClassifierMetrics, Counter, DivertPipeline, Pipeline, PortTable, PrefixDenylist, QueueTable,
};
use config::Config;
use ebpf_manager::EbpfManager;
use metrics::MetricsState;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "dns-divert",
    about = "XDP DNS classifier with per-queue AF_XDP redirect",
    version
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Path to the compiled eBPF program ELF binary.
    #[arg(long, default_value = "dns-divert-ebpf")]
    ebpf_program: PathBuf,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "starting dns-divert"
    );

    // Load and validate config
    let mut config = Config::load(&cli.config).context("loading configuration")?;
    info!(
        interface = %config.interface,
        dns_ports = ?config.dns_ports,
        denylist = config.denylist.len(),
        "configuration loaded"
    );

    // Userspace view of the kernel tables. Consumer threads classify each
    // redirected frame against the current snapshot; reloads swap in a new
    // snapshot while the counters live on.
    let classifier_metrics = Arc::new(ClassifierMetrics::new());
    let pipeline: Arc<ArcSwap<DivertPipeline>> =
        Arc::new(ArcSwap::from_pointee(build_pipeline(&config, &[])?));

    // --- Initialize eBPF manager ---
    let ebpf_bytes = std::fs::read(&cli.ebpf_program).with_context(|| {
        format!(
            "reading eBPF program from {}. Build it with: cargo xtask build-ebpf",
            cli.ebpf_program.display()
        )
    })?;

    let mut mgr = EbpfManager::load(&ebpf_bytes).context("loading eBPF program")?;

    mgr.set_dns_ports(&config.dns_ports)
        .context("populating DNS port map")?;
    mgr.set_denylist(&config.denylist_prefixes()?)
        .context("populating denylist")?;
    mgr.write_settings(config.denylist_enabled, config.bypass_protocol)
        .context("writing filter settings")?;

    mgr.attach(&config.interface, config.xdp_mode)
        .context("attaching XDP program")?;

    // --- Bind AF_XDP sockets and start consumers ---
    // The program is already attached, but every queue is still inactive, so
    // DNS frames keep passing to the stack until the fds are registered.
    let mut pool = ConsumerPool::start(&config, pipeline.clone(), classifier_metrics.clone())
        .context("starting AF_XDP consumers")?;

    let bound_sockets: Vec<(u32, RawFd)> = pool.sockets().to_vec();
    let bound_queues: Vec<u32> = bound_sockets.iter().map(|&(queue, _)| queue).collect();
    pipeline.store(Arc::new(build_pipeline(&config, &bound_queues)?));

    let registered =
        register_bound_queues(&bound_sockets, |queue, fd| mgr.register_queue(queue, fd))?;
    if registered.len() != bound_queues.len() {
        // Queues that refused registration never receive frames; retire
        // their consumers and shrink the snapshot to the queues that made
        // it in.
        for &(queue, _) in &bound_sockets {
            if !registered.contains(&queue) {
                pool.retire_queue(queue);
            }
        }
        pipeline.store(Arc::new(build_pipeline(&config, &registered)?));
    }
    let bound_queues = registered;

    info!(queues = bound_queues.len(), "redirect path active");

    let ebpf_manager: Arc<Mutex<Option<EbpfManager>>> = Arc::new(Mutex::new(Some(mgr)));

    // --- Start metrics server ---
    let metrics_handle = if config.metrics.enabled {
        let state = MetricsState {
            ebpf_manager: ebpf_manager.clone(),
            consumer_stats: Arc::new(pool.stats_handles()),
        };

        let metrics_config = config.metrics.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = metrics::serve_metrics(&metrics_config, state).await {
                error!(error = %e, "metrics server error");
            }
        }))
    } else {
        None
    };

    // --- Start periodic stats reporter ---
    let stats_handle = if config.stats_interval_secs > 0 {
        Some(spawn_stats_reporter(
            config.stats_interval(),
            ebpf_manager.clone(),
            classifier_metrics.clone(),
        ))
    } else {
        None
    };

    // --- Wait for shutdown, reloading tables on SIGHUP ---
    info!("dns-divert is running. Press Ctrl+C to stop.");

    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .context("installing SIGHUP handler")?;

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("waiting for Ctrl+C")?;
                info!("received Ctrl+C");
                break;
            }
            _ = terminate.recv() => {
                info!("received SIGTERM");
                break;
            }
            _ = hangup.recv() => {
                info!("received SIGHUP, reloading configuration");
                match reload(&cli.config, &mut config, &pipeline, &bound_queues, &ebpf_manager).await
                {
                    Ok(()) => info!("configuration reloaded"),
                    Err(e) => error!(error = %e, "reload failed, keeping previous tables"),
                }
            }
        }
    }

    info!("shutdown signal received, cleaning up...");

    // --- Graceful shutdown ---

    // Stop background tasks
    if let Some(handle) = stats_handle {
        handle.abort();
    }
    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    // Deactivate queues first so the program stops redirecting, then drain
    // and join the consumers.
    if let Some(ref mut mgr) = *ebpf_manager.lock().await {
        for &queue in &bound_queues {
            if let Err(e) = mgr.deactivate_queue(queue) {
                warn!(queue, error = %e, "error deactivating queue");
            }
        }
    }

    pool.shutdown();

    // Detach the XDP program
    if let Some(mgr) = ebpf_manager.lock().await.take() {
        match mgr.read_metrics() {
            Ok(m) => info!(
                packets = m.total_packets,
                dns = m.dns_packets,
                redirected = m.redirected,
                blocked = m.blocked,
                passed = m.passed,
                bypassed = m.bypassed,
                "final counters"
            ),
            Err(e) => warn!(error = %e, "error reading final counters"),
        }

        if let Err(e) = mgr.detach() {
            warn!(error = %e, "error detaching XDP program");
        }
    }

    info!("dns-divert stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Pipeline Construction
// ---------------------------------------------------------------------------

/// Build a userspace classifier pipeline mirroring the kernel tables.
fn build_pipeline(config: &Config, queues: &[u32]) -> Result<DivertPipeline> {
    let ports = PortTable::new(&config.dns_ports);
    let denylist = if config.denylist_enabled {
        Some(PrefixDenylist::new(&config.denylist_prefixes()?))
    } else {
        None
    };

    let mut pipeline = Pipeline::new(ports, denylist, QueueTable::new(queues));
    if let Some(protocol) = config.bypass_protocol {
        pipeline = pipeline.with_bypass_protocol(protocol);
    }

    Ok(pipeline)
}

// ---------------------------------------------------------------------------
// Queue Registration
// ---------------------------------------------------------------------------

/// Register bound socket fds in the XSK map, queue by queue.
///
/// A queue that refuses registration after the first one succeeded is
/// skipped, so the daemon runs on the queues that made it in. A refusal on
/// the first queue is fatal. Returns the queues actually registered.
fn register_bound_queues<F>(sockets: &[(u32, RawFd)], mut register: F) -> Result<Vec<u32>>
where
    F: FnMut(u32, RawFd) -> Result<()>,
{
    let mut registered = Vec::with_capacity(sockets.len());
    for &(queue, fd) in sockets {
        match register(queue, fd) {
            Ok(()) => registered.push(queue),
            Err(e) if !registered.is_empty() => {
                warn!(
                    queue,
                    error = %e,
                    registered = registered.len(),
                    "queue refused XSK map registration; continuing with registered queues"
                );
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("registering AF_XDP socket for queue {queue}"));
            }
        }
    }
    Ok(registered)
}

// ---------------------------------------------------------------------------
// Reload
// ---------------------------------------------------------------------------

/// Re-read the config file and apply table-level changes without detaching.
///
/// DNS ports and denylist entries are diffed against the running config and
/// patched in the kernel maps; the userspace pipeline snapshot is swapped
/// wholesale. Interface, XDP mode, and queue layout changes need a restart.
async fn reload(
    path: &Path,
    current: &mut Config,
    pipeline: &ArcSwap<DivertPipeline>,
    bound_queues: &[u32],
    ebpf_manager: &Mutex<Option<EbpfManager>>,
) -> Result<()> {
    let next = Config::load(path)?;

    if next.interface != current.interface {
        bail!("interface changes require a restart");
    }
    if next.xdp_mode != current.xdp_mode
        || next.queues.count != current.queues.count
        || next.queues.pin_cpus != current.queues.pin_cpus
    {
        warn!("xdp_mode and queue settings only take effect on restart");
    }

    let mut guard = ebpf_manager.lock().await;
    let mgr = guard.as_mut().context("eBPF program not loaded")?;

    let old_ports: HashSet<u16> = current.dns_ports.iter().copied().collect();
    let new_ports: HashSet<u16> = next.dns_ports.iter().copied().collect();
    for &port in new_ports.difference(&old_ports) {
        mgr.add_dns_port(port)?;
    }
    for &port in old_ports.difference(&new_ports) {
        mgr.remove_dns_port(port)?;
    }

    let old_prefixes: HashSet<(Ipv4Addr, u32)> = current.denylist_prefixes()?.into_iter().collect();
    let new_prefixes: HashSet<(Ipv4Addr, u32)> = next.denylist_prefixes()?.into_iter().collect();
    for &(network, prefix_len) in new_prefixes.difference(&old_prefixes) {
        mgr.add_denylist_entry(network, prefix_len)?;
    }
    for &(network, prefix_len) in old_prefixes.difference(&new_prefixes) {
        mgr.remove_denylist_entry(network, prefix_len)?;
    }

    mgr.write_settings(next.denylist_enabled, next.bypass_protocol)?;
    drop(guard);

    pipeline.store(Arc::new(build_pipeline(&next, bound_queues)?));

    info!(
        dns_ports = ?next.dns_ports,
        denylist = next.denylist.len(),
        denylist_enabled = next.denylist_enabled,
        "tables updated"
    );

    *current = next;
    Ok(())
}

// ---------------------------------------------------------------------------
// Stats Reporter
// ---------------------------------------------------------------------------

/// Log kernel counters (and the userspace classifier's view at debug level)
/// on a fixed interval.
fn spawn_stats_reporter(
    interval: Duration,
    ebpf_manager: Arc<Mutex<Option<EbpfManager>>>,
    classifier_metrics: Arc<ClassifierMetrics>,
) -> tokio::task::JoinHandle<()> {
    info!(interval = ?interval, "starting stats reporter");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; swallow it.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let snapshot = if let Some(ref mgr) = *ebpf_manager.lock().await {
                mgr.read_metrics()
            } else {
                continue;
            };

            match snapshot {
                Ok(m) => info!(
                    packets = m.total_packets,
                    dns = m.dns_packets,
                    redirected = m.redirected,
                    blocked = m.blocked,
                    passed = m.passed,
                    bypassed = m.bypassed,
                    "kernel counters"
                ),
                Err(e) => warn!(error = %e, "error reading kernel counters"),
            }

            debug!(
                dns = classifier_metrics.get(Counter::DnsPackets),
                redirected = classifier_metrics.get(Counter::Redirected),
                blocked = classifier_metrics.get(Counter::Blocked),
                "userspace classifier view"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_failure_after_first_queue_degrades() {
        let sockets: Vec<(u32, RawFd)> = vec![(0, 10), (1, 11), (2, 12)];
        let registered = register_bound_queues(&sockets, |queue, _| {
            if queue == 1 {
                bail!("map slot refused");
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(registered, vec![0, 2]);
    }

    #[test]
    fn register_failure_on_first_queue_is_fatal() {
        let sockets: Vec<(u32, RawFd)> = vec![(0, 10), (1, 11)];
        let result = register_bound_queues(&sockets, |_, _| bail!("no XSK map"));
        assert!(result.is_err());
    }

    #[test]
    fn register_success_keeps_every_queue() {
        let sockets: Vec<(u32, RawFd)> = vec![(0, 10), (3, 13)];
        let registered = register_bound_queues(&sockets, |_, _| Ok(())).unwrap();
        assert_eq!(registered, vec![0, 3]);
    }
}
