//! Transport driver contract and path selection
//!
//! A [`Transport`] moves frames (a [`Header`] plus payload bytes) to other processes. The
//! engine picks one driver per (context, destination) pair the first time it talks to that
//! destination and keeps using it: the built-in loopback path for the process itself,
//! otherwise the first registered driver that can reach the destination.
//!
//! Drivers shipped with the crate:
//!
//! - [`SharedMemoryTransport`]: co-resident processes, reliable
//! - [`UdpTransport`]: datagrams, unreliable
//! - [`TcpTransport`]: streams, reliable
//! - [`FaultyTransport`]: wraps another driver and injects loss, duplication, reordering and
//!   corruption
//!
//! Hardware fabrics plug in by implementing the same trait; memory registration is requested
//! through [`Transport::register_memory`] before a payload is handed to a driver that says it
//! [requires registration](Transport::requires_registration).

use std::collections::HashMap;
use std::io;

use thiserror::Error;
use tracing::debug;

use crate::wire::{Header, WireError};
use crate::{ContextId, ProcessId};

mod fault;
mod loopback;
mod shmem;
mod tcp;
mod udp;

pub use self::fault::FaultyTransport;
pub(crate) use self::loopback::Loopback;
pub use self::shmem::{SharedMemoryFabric, SharedMemoryTransport};
pub use self::tcp::TcpTransport;
pub use self::udp::UdpTransport;

/// Driver-chosen identifier of an open path to one destination
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PathHandle(pub u32);

/// A frame that arrived at this process.
#[derive(Clone, Debug)]
pub struct Arrival {
    /// Decoded header
    pub header: Header,
    /// Payload bytes, empty for acknowledgements
    pub payload: Vec<u8>,
}

/// Failures reported by transport drivers.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The driver cannot take the frame right now. The engine keeps it queued.
    #[error("transport is busy")]
    Busy,
    /// The driver has no route to the process.
    #[error("process {0} is not reachable")]
    Unreachable(ProcessId),
    /// The driver cannot register more memory.
    #[error("memory registration limit reached")]
    RegistrationLimit,
    /// The connection to the process is gone.
    #[error("connection to process {0} closed")]
    Closed(ProcessId),
    /// An operating system error
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A frame could not be decoded.
    #[error("malformed frame: {0}")]
    Frame(#[from] WireError),
}

/// A driver that carries frames between processes.
///
/// Drivers are polled, never called back: all progress happens inside
/// [`poll_for_arrivals`](Transport::poll_for_arrivals) and
/// [`send_fragment`](Transport::send_fragment). They must not block.
pub trait Transport: Send {
    /// Short name used in logs and errors
    fn name(&self) -> &'static str;

    /// Whether frames handed to the driver always arrive exactly once and intact.
    fn is_reliable(&self) -> bool;

    /// Largest payload a single frame may carry
    fn max_payload(&self) -> usize;

    /// Whether the driver has a route to `dest`.
    fn can_reach(&self, dest: ProcessId) -> bool;

    /// Set up whatever per-destination state the driver needs.
    fn open(&mut self, dest: ProcessId) -> Result<PathHandle, TransportError>;

    /// Hand one frame to the driver. `TransportError::Busy` means try again later.
    fn send_fragment(
        &mut self,
        path: PathHandle,
        header: &Header,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Append every frame that has arrived since the last call.
    fn poll_for_arrivals(&mut self, arrivals: &mut Vec<Arrival>) -> Result<(), TransportError>;

    /// Tear down a path returned by [`open`](Transport::open).
    fn close(&mut self, path: PathHandle);

    /// Whether payload memory has to be registered before it is handed over.
    fn requires_registration(&self) -> bool {
        false
    }

    /// Register a payload region with the driver.
    fn register_memory(&mut self, _region: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    /// Release a region registered with [`register_memory`](Transport::register_memory).
    fn deregister_memory(&mut self, _region: &[u8]) {}
}

/// A selected route to one destination
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Path {
    pub driver: usize,
    pub dest: ProcessId,
    pub handle: PathHandle,
    pub reliable: bool,
    pub max_payload: usize,
}

/// Registered drivers in priority order plus the per (context, destination) path cache.
pub(crate) struct PathTable {
    drivers: Vec<Box<dyn Transport>>,
    cache: HashMap<(ContextId, ProcessId), Path>,
    open: HashMap<(usize, ProcessId), PathHandle>,
    payload_cap: Option<usize>,
}

impl PathTable {
    pub fn new(
        me: ProcessId,
        drivers: Vec<Box<dyn Transport>>,
        payload_cap: Option<usize>,
    ) -> Self {
        let mut all: Vec<Box<dyn Transport>> = Vec::with_capacity(drivers.len() + 1);
        all.push(Box::new(Loopback::new(me)));
        all.extend(drivers);
        PathTable {
            drivers: all,
            cache: HashMap::new(),
            open: HashMap::new(),
            payload_cap,
        }
    }

    pub fn select(&mut self, context: ContextId, dest: ProcessId) -> Result<Path, TransportError> {
        if let Some(path) = self.cache.get(&(context, dest)) {
            return Ok(*path);
        }
        let driver = self
            .drivers
            .iter()
            .position(|d| d.can_reach(dest))
            .ok_or(TransportError::Unreachable(dest))?;
        let handle = match self.open.get(&(driver, dest)) {
            Some(handle) => *handle,
            None => {
                let handle = self.drivers[driver].open(dest)?;
                self.open.insert((driver, dest), handle);
                handle
            }
        };
        let d = &self.drivers[driver];
        let max_payload = match self.payload_cap {
            Some(cap) => cap.min(d.max_payload()),
            None => d.max_payload(),
        }
        .max(1);
        let path = Path {
            driver,
            dest,
            handle,
            reliable: d.is_reliable(),
            max_payload,
        };
        debug!(context, dest, transport = d.name(), "selected path");
        self.cache.insert((context, dest), path);
        Ok(path)
    }

    /// Change the payload cap. Paths are selected again on next use.
    pub fn set_payload_cap(&mut self, payload_cap: Option<usize>) {
        self.payload_cap = payload_cap;
        self.cache.clear();
    }

    pub fn name(&self, driver: usize) -> &'static str {
        self.drivers[driver].name()
    }

    pub fn is_reliable(&self, driver: usize) -> bool {
        self.drivers[driver].is_reliable()
    }

    pub fn send(&mut self, path: &Path, header: &Header, payload: &[u8]) -> Result<(), TransportError> {
        self.drivers[path.driver].send_fragment(path.handle, header, payload)
    }

    pub fn register(&mut self, path: &Path, region: &[u8]) -> Result<bool, TransportError> {
        let driver = &mut self.drivers[path.driver];
        if !driver.requires_registration() {
            return Ok(false);
        }
        driver.register_memory(region)?;
        Ok(true)
    }

    pub fn deregister(&mut self, path: &Path, region: &[u8]) {
        self.drivers[path.driver].deregister_memory(region);
    }

    /// Poll every driver, tagging arrivals with the index of the driver they came through.
    pub fn poll(
        &mut self,
        arrivals: &mut Vec<(usize, Arrival)>,
        failures: &mut Vec<(usize, TransportError)>,
    ) {
        let mut batch = Vec::new();
        for (index, driver) in self.drivers.iter_mut().enumerate() {
            if let Err(err) = driver.poll_for_arrivals(&mut batch) {
                failures.push((index, err));
            }
            arrivals.extend(batch.drain(..).map(|arrival| (index, arrival)));
        }
    }
}

impl Drop for PathTable {
    fn drop(&mut self) {
        for ((driver, _), handle) in self.open.drain() {
            self.drivers[driver].close(handle);
        }
    }
}
