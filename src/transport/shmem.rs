use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};

use super::{Arrival, PathHandle, Transport, TransportError};
use crate::wire::Header;
use crate::ProcessId;

/// Frames each inbox holds before senders see back-pressure
pub const DEFAULT_SLOTS: usize = 4096;

/// Payload limit of a shared-memory frame
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024;

/// A set of inboxes shared by co-resident processes.
///
/// Every process of the fabric takes its [`endpoint`](SharedMemoryFabric::endpoint) and
/// registers it with its universe. Frames move as decoded headers, without byte-order
/// conversion.
///
/// ```
/// use mpi_ptp::transport::SharedMemoryFabric;
///
/// let fabric = SharedMemoryFabric::new(2);
/// let zero = fabric.endpoint(0).unwrap();
/// let one = fabric.endpoint(1).unwrap();
/// # drop((zero, one));
/// ```
pub struct SharedMemoryFabric {
    inboxes: Vec<(Sender<Arrival>, Receiver<Arrival>)>,
    max_payload: usize,
}

impl SharedMemoryFabric {
    /// A fabric for processes `0..size`.
    pub fn new(size: u32) -> Self {
        Self::with_slots(size, DEFAULT_SLOTS)
    }

    /// A fabric whose inboxes hold at most `slots` frames.
    pub fn with_slots(size: u32, slots: usize) -> Self {
        SharedMemoryFabric {
            inboxes: (0..size)
                .map(|_| crossbeam_channel::bounded(slots.max(1)))
                .collect(),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Change the payload limit of endpoints taken afterwards.
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload.max(1);
        self
    }

    /// The driver for `process`, or `None` if the process is not part of the fabric.
    pub fn endpoint(&self, process: ProcessId) -> Option<SharedMemoryTransport> {
        let (_, inbox) = self.inboxes.get(process as usize)?;
        Some(SharedMemoryTransport {
            peers: self.inboxes.iter().map(|(tx, _)| tx.clone()).collect(),
            inbox: inbox.clone(),
            max_payload: self.max_payload,
        })
    }
}

/// Driver for processes that share an address space.
pub struct SharedMemoryTransport {
    peers: Vec<Sender<Arrival>>,
    inbox: Receiver<Arrival>,
    max_payload: usize,
}

impl Transport for SharedMemoryTransport {
    fn name(&self) -> &'static str {
        "shmem"
    }

    fn is_reliable(&self) -> bool {
        true
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn can_reach(&self, dest: ProcessId) -> bool {
        (dest as usize) < self.peers.len()
    }

    fn open(&mut self, dest: ProcessId) -> Result<PathHandle, TransportError> {
        if !self.can_reach(dest) {
            return Err(TransportError::Unreachable(dest));
        }
        Ok(PathHandle(dest))
    }

    fn send_fragment(
        &mut self,
        path: PathHandle,
        header: &Header,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let peer = self
            .peers
            .get(path.0 as usize)
            .ok_or(TransportError::Unreachable(path.0))?;
        let arrival = Arrival {
            header: *header,
            payload: payload.to_vec(),
        };
        match peer.try_send(arrival) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::Busy),
            Err(TrySendError::Disconnected(_)) => Err(TransportError::Closed(path.0)),
        }
    }

    fn poll_for_arrivals(&mut self, arrivals: &mut Vec<Arrival>) -> Result<(), TransportError> {
        loop {
            match self.inbox.try_recv() {
                Ok(arrival) => arrivals.push(arrival),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    fn close(&mut self, _path: PathHandle) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{AckHeader, AckStatus};

    fn ack(src: ProcessId, dst: ProcessId) -> Header {
        let mut ack = AckHeader {
            status: AckStatus::Accept,
            flags: 0,
            context: 0,
            src,
            dst,
            acked_frag_seq: 1,
            acked_msg_seq: 1,
            received_seq: 1,
            delivered_seq: 1,
            checksum: 0,
        };
        ack.seal();
        Header::Ack(ack)
    }

    #[test]
    fn frames_reach_the_right_inbox() {
        let fabric = SharedMemoryFabric::new(3);
        let mut zero = fabric.endpoint(0).unwrap();
        let mut two = fabric.endpoint(2).unwrap();
        assert!(fabric.endpoint(3).is_none());

        let path = zero.open(2).unwrap();
        zero.send_fragment(path, &ack(0, 2), &[]).unwrap();

        let mut arrivals = Vec::new();
        zero.poll_for_arrivals(&mut arrivals).unwrap();
        assert!(arrivals.is_empty());
        two.poll_for_arrivals(&mut arrivals).unwrap();
        assert_eq!(arrivals.len(), 1);
        assert_eq!(arrivals[0].header.src(), 0);
    }

    #[test]
    fn full_inbox_is_busy() {
        let fabric = SharedMemoryFabric::with_slots(2, 1);
        let mut zero = fabric.endpoint(0).unwrap();
        let path = zero.open(1).unwrap();
        zero.send_fragment(path, &ack(0, 1), &[]).unwrap();
        assert!(matches!(
            zero.send_fragment(path, &ack(0, 1), &[]),
            Err(TransportError::Busy)
        ));
    }
}
