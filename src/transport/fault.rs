use std::collections::{BTreeSet, HashSet};

use tracing::trace;

use super::{Arrival, PathHandle, Transport, TransportError};
use crate::wire::{FrameKind, Header};
use crate::ProcessId;

/// A driver wrapper that misbehaves on purpose.
///
/// Frames are counted from 1 as they are handed to the wrapper; only data fragments are
/// counted unless [`faults_on_acks`](FaultyTransport::faults_on_acks) is set, in which case
/// acknowledgements are counted and disturbed too. The wrapper always reports itself as
/// unreliable so the engine runs its acknowledgement protocol over it.
///
/// ```
/// use mpi_ptp::transport::{FaultyTransport, SharedMemoryFabric};
///
/// let fabric = SharedMemoryFabric::new(2);
/// let lossy = FaultyTransport::new(fabric.endpoint(0).unwrap())
///     .drop_every(3)
///     .duplicate_every(5);
/// # drop(lossy);
/// ```
pub struct FaultyTransport<T> {
    inner: T,
    counted: u64,
    drop_every: Option<u64>,
    drop_once: BTreeSet<u64>,
    duplicate_every: Option<u64>,
    reorder_every: Option<u64>,
    corrupt_every: Option<u64>,
    on_acks: bool,
    registration_limit: Option<usize>,
    registered: HashSet<(usize, usize)>,
    held: Option<(PathHandle, Header, Vec<u8>)>,
}

fn hits(every: Option<u64>, n: u64) -> bool {
    matches!(every, Some(k) if k > 0 && n % k == 0)
}

impl<T: Transport> FaultyTransport<T> {
    /// Wrap `inner` without any faults yet.
    pub fn new(inner: T) -> Self {
        FaultyTransport {
            inner,
            counted: 0,
            drop_every: None,
            drop_once: BTreeSet::new(),
            duplicate_every: None,
            reorder_every: None,
            corrupt_every: None,
            on_acks: false,
            registration_limit: None,
            registered: HashSet::new(),
            held: None,
        }
    }

    /// Silently discard every `n`th frame.
    pub fn drop_every(mut self, n: u64) -> Self {
        self.drop_every = Some(n);
        self
    }

    /// Discard the frames with these ordinals, once each.
    pub fn drop_once<I: IntoIterator<Item = u64>>(mut self, ordinals: I) -> Self {
        self.drop_once.extend(ordinals);
        self
    }

    /// Deliver every `n`th frame twice.
    pub fn duplicate_every(mut self, n: u64) -> Self {
        self.duplicate_every = Some(n);
        self
    }

    /// Hold every `n`th frame back until after the next one.
    pub fn reorder_every(mut self, n: u64) -> Self {
        self.reorder_every = Some(n);
        self
    }

    /// Flip a bit in every `n`th frame.
    pub fn corrupt_every(mut self, n: u64) -> Self {
        self.corrupt_every = Some(n);
        self
    }

    /// Count and disturb acknowledgements as well as data fragments.
    pub fn faults_on_acks(mut self) -> Self {
        self.on_acks = true;
        self
    }

    /// Require memory registration and refuse more than `limit` registered regions.
    pub fn registration_limit(mut self, limit: usize) -> Self {
        self.registration_limit = Some(limit);
        self
    }

    /// Number of frames counted so far
    pub fn counted(&self) -> u64 {
        self.counted
    }

    /// The wrapped driver
    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn release_held(&mut self) -> Result<(), TransportError> {
        if let Some((path, header, payload)) = self.held.take() {
            self.inner.send_fragment(path, &header, &payload)?;
        }
        Ok(())
    }
}

impl<T: Transport> Transport for FaultyTransport<T> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn is_reliable(&self) -> bool {
        false
    }

    fn max_payload(&self) -> usize {
        self.inner.max_payload()
    }

    fn can_reach(&self, dest: ProcessId) -> bool {
        self.inner.can_reach(dest)
    }

    fn open(&mut self, dest: ProcessId) -> Result<PathHandle, TransportError> {
        self.inner.open(dest)
    }

    fn send_fragment(
        &mut self,
        path: PathHandle,
        header: &Header,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if header.kind() == FrameKind::Ack && !self.on_acks {
            return self.inner.send_fragment(path, header, payload);
        }
        let n = self.counted + 1;
        if self.drop_once.remove(&n) || hits(self.drop_every, n) {
            self.counted = n;
            trace!(n, "fault: drop");
            return Ok(());
        }

        let mut header = *header;
        let mut payload = payload.to_vec();
        if hits(self.corrupt_every, n) {
            trace!(n, "fault: corrupt");
            match (&mut header, payload.first_mut()) {
                (Header::Data(_), Some(byte)) => *byte ^= 0x01,
                (Header::Data(data), None) => data.checksum ^= 0x01,
                (Header::Ack(ack), _) => ack.checksum ^= 0x01,
            }
        }

        if hits(self.reorder_every, n) && self.held.is_none() {
            trace!(n, "fault: hold back");
            self.counted = n;
            self.held = Some((path, header, payload));
            return Ok(());
        }

        self.inner.send_fragment(path, &header, &payload)?;
        self.counted = n;
        if hits(self.duplicate_every, n) {
            trace!(n, "fault: duplicate");
            self.inner.send_fragment(path, &header, &payload)?;
        }
        self.release_held()
    }

    fn poll_for_arrivals(&mut self, arrivals: &mut Vec<Arrival>) -> Result<(), TransportError> {
        self.release_held()?;
        self.inner.poll_for_arrivals(arrivals)
    }

    fn close(&mut self, path: PathHandle) {
        self.inner.close(path)
    }

    fn requires_registration(&self) -> bool {
        self.registration_limit.is_some() || self.inner.requires_registration()
    }

    fn register_memory(&mut self, region: &[u8]) -> Result<(), TransportError> {
        if let Some(limit) = self.registration_limit {
            if self.registered.len() >= limit {
                return Err(TransportError::RegistrationLimit);
            }
            self.registered
                .insert((region.as_ptr() as usize, region.len()));
        }
        self.inner.register_memory(region)
    }

    fn deregister_memory(&mut self, region: &[u8]) {
        self.registered
            .remove(&(region.as_ptr() as usize, region.len()));
        self.inner.deregister_memory(region)
    }
}
