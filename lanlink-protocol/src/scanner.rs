//! Subnet device discovery
//!
//! Discovery is an active sweep: every host address in the configured
//! subnets is dialed on the protocol port with a short timeout, and each
//! peer that completes the `Name` handshake lands in the registry and fires
//! [`CoreEvent::DeviceFound`]. Concurrency is bounded by a semaphore sized
//! from `Config::max_connections`.
//!
//! Progress events report the fraction of addresses *dispatched*, not
//! answered; the final [`SCAN_DONE`] fires only after every probe task has
//! finished, so a sweep is observably over.

use crate::config::Config;
use crate::device::Device;
use crate::events::{CoreEvent, EventBus, SCAN_DONE};
use crate::registry::Registry;
use crate::wire::{self, ControlByte};
use crate::{ProtocolError, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::Duration;
use tracing::{debug, info, trace, warn};

/// An IPv4 subnet in `a.b.c.d/len` notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetPrefix {
    addr: Ipv4Addr,
    len: u8,
}

impl SubnetPrefix {
    pub fn new(addr: Ipv4Addr, len: u8) -> Result<Self> {
        if len > 32 {
            return Err(ProtocolError::InvalidFrame(format!(
                "prefix length out of range: /{len}"
            )));
        }
        Ok(Self { addr, len })
    }

    fn mask(&self) -> u32 {
        if self.len == 0 {
            0
        } else {
            u32::MAX << (32 - self.len)
        }
    }

    /// Every address from the network address to the broadcast address,
    /// inclusive. Hosts filter their own address themselves if they care.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let network = u32::from(self.addr) & self.mask();
        let broadcast = network | !self.mask();
        (network..=broadcast).map(Ipv4Addr::from)
    }

    /// Number of addresses the sweep will probe
    pub fn host_count(&self) -> u64 {
        1u64 << (32 - self.len)
    }
}

impl FromStr for SubnetPrefix {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| ProtocolError::InvalidFrame(format!("not a subnet: {s:?}")))?;
        let addr = addr
            .parse::<Ipv4Addr>()
            .map_err(|e| ProtocolError::InvalidFrame(format!("bad subnet address {addr:?}: {e}")))?;
        let len = len
            .parse::<u8>()
            .map_err(|e| ProtocolError::InvalidFrame(format!("bad prefix length {len:?}: {e}")))?;
        Self::new(addr, len)
    }
}

impl std::fmt::Display for SubnetPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

/// Bounded-concurrency subnet scanner.
///
/// One instance per process; [`Scanner::scan`] runs a sweep to completion
/// and overlapping sweeps are rejected.
pub struct Scanner {
    config: Arc<Config>,
    registry: Arc<Registry>,
    events: EventBus,
    running: AtomicBool,
    permits: Arc<Semaphore>,
}

impl Scanner {
    pub fn new(config: Arc<Config>, registry: Arc<Registry>, events: EventBus) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Self {
            config,
            registry,
            events,
            running: AtomicBool::new(false),
            permits,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask a running sweep to stop dispatching further probes.
    ///
    /// In-flight probes finish on their own timeout; [`SCAN_DONE`] still
    /// fires when the sweep winds down.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Sweep the subnets listed in the configuration
    pub async fn scan_configured(&self) -> Result<()> {
        let mut prefixes = Vec::with_capacity(self.config.subnets.len());
        for subnet in &self.config.subnets {
            prefixes.push(subnet.parse::<SubnetPrefix>()?);
        }
        self.scan(&prefixes).await
    }

    /// Sweep the given subnets, probing every host address.
    ///
    /// All known devices are first marked offline; each handshake response
    /// re-registers its device, so after the sweep the online view reflects
    /// reality. Returns an error if a sweep is already in progress.
    pub async fn scan(&self, prefixes: &[SubnetPrefix]) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::ScanInProgress);
        }

        let total: u64 = prefixes.iter().map(|p| p.host_count()).sum();
        info!(subnets = prefixes.len(), addresses = total, "scan started");
        self.registry.invalidate_all();
        self.events.emit(CoreEvent::ScanProgress(0.0));

        let mut probes = Vec::new();
        let mut dispatched = 0u64;
        'sweep: for prefix in prefixes {
            for host in prefix.hosts() {
                if !self.running.load(Ordering::SeqCst) {
                    debug!("scan stopped early");
                    break 'sweep;
                }
                let permit = Arc::clone(&self.permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| ProtocolError::ScanInProgress)?;
                let probe = Probe {
                    config: Arc::clone(&self.config),
                    registry: Arc::clone(&self.registry),
                    events: self.events.clone(),
                };
                probes.push(tokio::spawn(async move {
                    let _permit = permit;
                    probe.run(host).await;
                }));

                dispatched += 1;
                self.events
                    .emit(CoreEvent::ScanProgress(dispatched as f64 / total as f64));
            }
        }

        for probe in probes {
            if let Err(err) = probe.await {
                warn!(%err, "probe task panicked");
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.events.emit(CoreEvent::ScanProgress(SCAN_DONE));
        info!(dispatched, "scan finished");
        Ok(())
    }
}

/// State captured by one spawned probe task
struct Probe {
    config: Arc<Config>,
    registry: Arc<Registry>,
    events: EventBus,
}

impl Probe {
    /// Dial one address with a short deadline and run the `Name` handshake.
    /// Silence and refusals are the common case and only traced.
    async fn run(&self, host: Ipv4Addr) {
        let addr = SocketAddr::new(IpAddr::V4(host), self.config.port);
        let deadline = Duration::from_millis(self.config.timeout_ms);

        let stream = match tokio::time::timeout(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                trace!(%addr, %err, "probe refused");
                return;
            }
            Err(_) => {
                trace!(%addr, "probe timed out");
                return;
            }
        };

        match tokio::time::timeout(deadline, handshake(stream)).await {
            Ok(Ok(device)) => {
                debug!(id = %device.id, %addr, "device answered");
                self.registry.upsert_device(device.clone());
                self.events.emit(CoreEvent::DeviceFound(device));
            }
            Ok(Err(err)) => trace!(%addr, %err, "handshake failed"),
            Err(_) => trace!(%addr, "handshake timed out"),
        }
    }
}

/// `Name` request: send the version header, read id, name and OS
async fn handshake(mut stream: TcpStream) -> Result<Device> {
    let peer_ip = stream.peer_addr()?.ip();
    wire::write_header(&mut stream, ControlByte::Name).await?;
    stream.flush().await?;

    let id = wire::read_string(&mut stream).await?;
    let name = wire::read_string(&mut stream).await?;
    let os = wire::read_string(&mut stream).await?;
    Ok(Device::new(id, peer_ip, name, os))
}
