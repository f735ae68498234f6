use std::{
    collections::BTreeSet,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use futures_util::{
    FutureExt,
    future::{BoxFuture, join_all},
};

use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Ports checked concurrently per batch while scanning a range.
const SCAN_BATCH: usize = 256;

/// Resolves to true when something on the host already listens on the port.
pub type ListenerCheck = Arc<dyn Fn(u16) -> BoxFuture<'static, bool> + Send + Sync>;

/// Half-open port interval `[start, stop)` holding at least two ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    stop: u16,
}

impl PortRange {
    /// Interpret two integers as a half-open range.
    pub fn new(start: i64, stop: i64) -> Result<Self> {
        if start <= 0 {
            return Err(Error::InvalidRange(format!(
                "[{start}, {stop}): start must be > 0"
            )));
        }
        if stop <= start.saturating_add(1) {
            return Err(Error::InvalidRange(format!(
                "[{start}, {stop}): at least two ports are required"
            )));
        }
        if stop > i64::from(u16::MAX) {
            return Err(Error::InvalidRange(format!(
                "[{start}, {stop}): stop must be <= {}",
                u16::MAX
            )));
        }
        Ok(Self {
            start: start as u16,
            stop: stop as u16,
        })
    }

    /// Accepts exactly two integers, e.g. `[8080, 8090]` from a config file.
    pub fn from_slice(v: &[i64]) -> Result<Self> {
        match v {
            [start, stop] => Self::new(*start, *stop),
            _ => Err(Error::InvalidRange(format!(
                "expected two integers [start, stop), got {v:?}"
            ))),
        }
    }

    /// An explicit range must already satisfy the invariants; it is never
    /// reordered or widened.
    pub fn from_range(r: std::ops::Range<i64>) -> Result<Self> {
        Self::new(r.start, r.end)
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn stop(&self) -> u16 {
        self.stop
    }

    pub fn len(&self) -> usize {
        usize::from(self.stop - self.start)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..self.stop).contains(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..self.stop
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.stop)
    }
}

/// Connect check on localhost. A port that accepts a connection is
/// occupied, whoever owns it.
pub async fn is_port_in_use(port: u16) -> bool {
    let v4 = SocketAddr::from(([127, 0, 0, 1], port));
    let v6 = SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 1], port));
    for addr in [v4, v6] {
        if let Ok(Ok(_)) =
            tokio::time::timeout(CONNECT_TIMEOUT, tokio::net::TcpStream::connect(addr)).await
        {
            return true;
        }
    }
    false
}

pub fn localhost_listeners() -> ListenerCheck {
    Arc::new(|port: u16| is_port_in_use(port).boxed())
}

/// Ports in `range` that currently have a listener. Checks run in batches
/// and the task yields between batches.
pub async fn scan_listeners(range: PortRange, check: &ListenerCheck) -> BTreeSet<u16> {
    let ports: Vec<u16> = range.iter().collect();
    let mut occupied = BTreeSet::new();
    for batch in ports.chunks(SCAN_BATCH) {
        let hits = join_all(batch.iter().map(|&p| {
            let fut = check(p);
            async move { (p, fut.await) }
        }))
        .await;
        occupied.extend(hits.into_iter().filter_map(|(p, busy)| busy.then_some(p)));
        tokio::task::yield_now().await;
    }
    occupied
}

/// Pool of worker ports.
///
/// NOTE: Not synchronized on its own. The registry owns it behind its lock
/// and runs [`scan_listeners`] outside that lock, handing the result to
/// [`PortManager::set_occupied`].
pub struct PortManager {
    range: PortRange,
    occupied: BTreeSet<u16>,
    available: BTreeSet<u16>,
    listeners: ListenerCheck,
}

impl std::fmt::Debug for PortManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortManager")
            .field("range", &self.range)
            .field("occupied", &self.occupied)
            .field("available", &self.available)
            .finish()
    }
}

impl PortManager {
    pub fn new(range: PortRange) -> Self {
        Self::with_listener_check(range, localhost_listeners())
    }

    /// No scan happens here; call [`PortManager::refresh`] (or let the
    /// registry do it) before allocating.
    pub fn with_listener_check(range: PortRange, listeners: ListenerCheck) -> Self {
        Self {
            range,
            occupied: BTreeSet::new(),
            available: range.iter().collect(),
            listeners,
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    pub fn listener_check(&self) -> ListenerCheck {
        self.listeners.clone()
    }

    pub fn available(&self) -> &BTreeSet<u16> {
        &self.available
    }

    pub async fn is_in_use(&self, port: u16) -> bool {
        (self.listeners)(port).await
    }

    /// Record the result of the latest [`scan_listeners`] pass.
    pub fn set_occupied(&mut self, occupied: BTreeSet<u16>) {
        self.occupied = occupied;
    }

    /// Recompute availability: the range minus the last scanned listeners
    /// minus `claimed`.
    pub fn refresh_available(&mut self, claimed: &BTreeSet<u16>) -> &BTreeSet<u16> {
        self.available = self
            .range
            .iter()
            .filter(|p| !claimed.contains(p) && !self.occupied.contains(p))
            .collect();
        &self.available
    }

    /// Scan the range, then recompute availability.
    pub async fn refresh(&mut self, claimed: &BTreeSet<u16>) -> &BTreeSet<u16> {
        let occupied = scan_listeners(self.range, &self.listeners).await;
        self.set_occupied(occupied);
        self.refresh_available(claimed)
    }

    /// Hand out the lowest free port.
    ///
    /// Only as fresh as the last scan: a listener that appears afterwards
    /// surfaces as a worker that fails to start.
    pub fn allocate(&mut self) -> Result<u16> {
        match self.available.pop_first() {
            Some(port) => Ok(port),
            None => {
                tracing::error!(range = %self.range, "no ports available");
                Err(Error::NoPortsAvailable {
                    start: self.range.start,
                    stop: self.range.stop,
                })
            }
        }
    }

    /// Return a provisionally allocated port to the pool.
    pub fn release(&mut self, port: u16) {
        if self.range.contains(port) {
            self.available.insert(port);
        }
    }
}
