use std::collections::VecDeque;

use super::{Arrival, PathHandle, Transport, TransportError};
use crate::wire::Header;
use crate::ProcessId;

const MAX_PAYLOAD: usize = 64 * 1024;

/// Path from a process to itself.
pub(crate) struct Loopback {
    me: ProcessId,
    queue: VecDeque<Arrival>,
}

impl Loopback {
    pub fn new(me: ProcessId) -> Self {
        Loopback {
            me,
            queue: VecDeque::new(),
        }
    }
}

impl Transport for Loopback {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn is_reliable(&self) -> bool {
        true
    }

    fn max_payload(&self) -> usize {
        MAX_PAYLOAD
    }

    fn can_reach(&self, dest: ProcessId) -> bool {
        dest == self.me
    }

    fn open(&mut self, dest: ProcessId) -> Result<PathHandle, TransportError> {
        if dest != self.me {
            return Err(TransportError::Unreachable(dest));
        }
        Ok(PathHandle(dest))
    }

    fn send_fragment(
        &mut self,
        _path: PathHandle,
        header: &Header,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.queue.push_back(Arrival {
            header: *header,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn poll_for_arrivals(&mut self, arrivals: &mut Vec<Arrival>) -> Result<(), TransportError> {
        arrivals.extend(self.queue.drain(..));
        Ok(())
    }

    fn close(&mut self, _path: PathHandle) {}
}
