//! Fragmentation and reassembly
//!
//! A message leaves as frames no larger than its path's payload limit. Each frame carries
//! its byte offset, so the receiver can write it into place whatever order frames arrive
//! in.

use std::collections::BTreeSet;
use std::mem;
use std::ops::Range;
use std::sync::Arc;

use super::store::Handle;
use crate::datatype::Layout;
use crate::transport::Path;
use crate::wire::DataHeader;
use crate::ProcessId;

/// One frame of an outgoing message, ready for (re)transmission.
#[derive(Clone)]
pub(crate) struct OutgoingFrag {
    pub request: Handle,
    pub path: Path,
    pub header: DataHeader,
    payload: Arc<[u8]>,
    range: Range<usize>,
}

impl OutgoingFrag {
    pub fn payload(&self) -> &[u8] {
        &self.payload[self.range.clone()]
    }

    pub fn dest(&self) -> ProcessId {
        self.path.dest
    }

    pub fn seq(&self) -> u64 {
        self.header.frag_seq
    }
}

/// Split `payload` into frames for `path`.
///
/// `template` supplies every header field that is the same for all frames of the message;
/// `next_seq` hands out fragment sequence numbers.
pub(crate) fn fragment(
    request: Handle,
    path: Path,
    template: DataHeader,
    payload: &Arc<[u8]>,
    mut next_seq: impl FnMut() -> u64,
) -> Vec<OutgoingFrag> {
    let max = path.max_payload.max(1);
    let len = payload.len();
    let count = if len == 0 { 1 } else { (len + max - 1) / max };
    (0..count)
        .map(|i| {
            let start = i * max;
            let end = (start + max).min(len);
            let mut header = template;
            header.frag_len = (end - start) as u32;
            header.offset = start as u64;
            header.frag_seq = next_seq();
            header.seal(&payload[start..end]);
            OutgoingFrag {
                request,
                path,
                header,
                payload: Arc::clone(payload),
                range: start..end,
            }
        })
        .collect()
}

/// Receive-side state of one message being written into a posted buffer.
pub(crate) struct Reassembly {
    staging: Vec<u8>,
    layout: Layout,
    capacity: usize,
    msg_len: Option<u64>,
    received: u64,
    seen: BTreeSet<u64>,
}

impl Reassembly {
    /// `staging` is an image of the destination buffer; `layout` picks the bytes to write.
    pub fn new(staging: Vec<u8>, layout: Layout) -> Self {
        Reassembly {
            capacity: layout.size(),
            staging,
            layout,
            msg_len: None,
            received: 0,
            seen: BTreeSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Start on a message of `msg_len` bytes.
    pub fn begin(&mut self, msg_len: u64) {
        self.msg_len = Some(msg_len);
        self.received = 0;
        self.seen.clear();
    }

    /// Write one frame. Returns false if a frame with this offset was already written.
    pub fn write(&mut self, offset: u64, payload: &[u8]) -> bool {
        if !self.seen.insert(offset) {
            return false;
        }
        self.received += payload.len() as u64;
        if offset < self.capacity as u64 {
            self.layout
                .scatter(offset as usize, payload, &mut self.staging);
        }
        true
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.msg_len, Some(len) if self.received >= len)
    }

    /// Bytes of the message that landed in the buffer
    pub fn delivered(&self) -> usize {
        match self.msg_len {
            Some(len) => len.min(self.capacity as u64) as usize,
            None => 0,
        }
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self.msg_len, Some(len) if len > self.capacity as u64)
    }

    /// Start over on a fresh image of the destination buffer.
    pub fn reset(&mut self, staging: Vec<u8>) {
        self.staging = staging;
        self.msg_len = None;
        self.received = 0;
        self.seen.clear();
    }

    pub fn take_staging(&mut self) -> Vec<u8> {
        mem::take(&mut self.staging)
    }

    pub fn staging(&self) -> &[u8] {
        &self.staging
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PathHandle;

    fn path(max_payload: usize) -> Path {
        Path {
            driver: 1,
            dest: 1,
            handle: PathHandle(1),
            reliable: false,
            max_payload,
        }
    }

    fn template(msg_len: u32) -> DataHeader {
        DataHeader {
            flags: 0,
            context: 0,
            tag: 5,
            src: 0,
            dst: 1,
            frag_len: 0,
            msg_len,
            frag_seq: 0,
            msg_seq: 1,
            offset: 0,
            checksum: 0,
        }
    }

    fn handle() -> Handle {
        use crate::datatype::Layout;
        use crate::engine::{store::DescriptorStore, Operation, ReceiveOp};
        let mut store = DescriptorStore::new(1, 1, 1);
        store
            .allocate(
                Operation::Receive(ReceiveOp::new(None, None, 0, Vec::new(), Layout::contiguous(0))),
                false,
            )
            .unwrap()
    }

    #[test]
    fn splits_at_the_payload_limit_with_increasing_sequence_numbers() {
        let payload: Arc<[u8]> = (0..250u8).collect::<Vec<_>>().into();
        let mut seq = 10;
        let frags = fragment(handle(), path(100), template(250), &payload, || {
            seq += 1;
            seq
        });
        let shape: Vec<_> = frags
            .iter()
            .map(|f| (f.header.frag_seq, f.header.offset, f.header.frag_len))
            .collect();
        assert_eq!(shape, vec![(11, 0, 100), (12, 100, 100), (13, 200, 50)]);
        assert!(frags.iter().all(|f| f.header.verify(f.payload())));
        assert_eq!(frags[2].payload()[0], 200);
    }

    #[test]
    fn empty_message_is_one_empty_frame() {
        let payload: Arc<[u8]> = Vec::new().into();
        let frags = fragment(handle(), path(100), template(0), &payload, || 1);
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].header.frag_len, 0);
    }

    #[test]
    fn reassembles_out_of_order_and_truncates() {
        let mut r = Reassembly::new(vec![0; 100], Layout::contiguous(100));
        r.begin(250);
        assert!(r.write(200, &[3; 50]));
        assert!(r.write(0, &[1; 100]));
        assert!(!r.is_complete());
        assert!(!r.write(0, &[9; 100]));
        assert!(r.write(100, &[2; 100]));
        assert!(r.is_complete());
        assert!(r.is_truncated());
        assert_eq!(r.delivered(), 100);
        assert_eq!(r.staging(), &[1; 100][..]);
    }

    #[test]
    fn short_message_is_not_truncated() {
        let mut r = Reassembly::new(vec![7; 8], Layout::contiguous(8));
        r.begin(3);
        r.write(0, &[1, 2, 3]);
        assert!(r.is_complete());
        assert!(!r.is_truncated());
        assert_eq!(r.delivered(), 3);
        assert_eq!(r.take_staging(), vec![1, 2, 3, 7, 7, 7, 7, 7]);
    }
}
