//! Sequence tracking, acknowledgements and retransmission
//!
//! Frames sent over an unreliable path stay here until the peer reports them delivered.
//! Each one moves through
//!
//! ```text
//! Sent --ack--> Acked --delivered--> (reclaimed)
//!  |  \
//!  |   timeout or reject --> Queued --resent--> Sent
//!  +-- timeout after the last allowed transmission --> failed
//! ```
//!
//! Transmission `k` (counting from 0) times out after `base * 2^min(k, max_power)`.
//!
//! The first fragment of a synchronous message is held: it counts as acknowledged once the
//! peer has it, but its timer keeps running until the peer reports the message matched. A
//! lost "matched" notification is thereby recovered by a retransmission, which the peer
//! answers with the current match state.
//!
//! On the receiving side the same per-peer record tracks which fragment sequence numbers
//! were received and which were delivered into a posted buffer, which is what goes back in
//! the cumulative fields of every acknowledgement.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, trace};

use super::fragment::OutgoingFrag;
use super::store::Handle;
use crate::wire::{AckHeader, AckStatus, DATA_SYNCHRONOUS};
use crate::ProcessId;

/// Set of sequence numbers, kept as disjoint inclusive ranges.
#[derive(Clone, Debug, Default)]
pub(crate) struct SeqTracker {
    ranges: BTreeMap<u64, u64>,
}

impl SeqTracker {
    /// Add `seq`. Returns false if it was already present.
    pub fn record(&mut self, seq: u64) -> bool {
        if self.contains(seq) {
            return false;
        }
        let mut start = seq;
        let mut end = seq;
        if let Some((&s, &e)) = self.ranges.range(..seq).next_back() {
            if e.checked_add(1) == Some(seq) {
                start = s;
                self.ranges.remove(&s);
            }
        }
        if let Some(next) = seq.checked_add(1) {
            if let Some(e) = self.ranges.remove(&next) {
                end = e;
            }
        }
        self.ranges.insert(start, end);
        true
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.ranges
            .range(..=seq)
            .next_back()
            .map_or(false, |(_, &end)| seq <= end)
    }

    /// Highest `n` such that every number in `1..=n` is present
    pub fn largest_in_order(&self) -> u64 {
        match self.ranges.first_key_value() {
            Some((&1, &end)) => end,
            _ => 0,
        }
    }
}

/// Exponential backoff for retransmission timers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct RetransmitPolicy {
    pub base: Duration,
    pub max_power: u32,
}

impl RetransmitPolicy {
    /// Timeout of transmission number `k`, counting from 0.
    pub fn interval(&self, k: u32) -> Duration {
        let power = k.min(self.max_power).min(31);
        self.base.saturating_mul(1u32 << power)
    }

    /// Most transmissions of one fragment before it is given up
    pub fn max_transmissions(&self) -> u32 {
        self.max_power.saturating_add(1)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FragState {
    Sent,
    Acked,
    Queued,
}

struct Outstanding {
    frag: OutgoingFrag,
    state: FragState,
    transmissions: u32,
    deadline: Duration,
    /// Counted towards its request's acknowledged fragments
    counted: bool,
    /// Waiting for the peer to report the message matched
    hold: bool,
}

impl Outstanding {
    fn acknowledge(&mut self, acked: &mut Vec<Handle>) {
        if !self.counted {
            self.counted = true;
            acked.push(self.frag.request);
        }
        if !self.hold {
            self.state = FragState::Acked;
        }
    }
}

#[derive(Default)]
struct Peer {
    last_frag_seq: u64,
    outstanding: BTreeMap<u64, Outstanding>,
    received: SeqTracker,
    delivered: SeqTracker,
    peer_received: u64,
    peer_delivered: u64,
}

/// A send that ran out of transmissions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Failure {
    pub request: Handle,
    pub dest: ProcessId,
    pub attempts: u32,
}

/// What the timers decided on one pass.
#[derive(Default)]
pub(crate) struct Expiry {
    pub retransmit: Vec<OutgoingFrag>,
    pub failed: Vec<Failure>,
}

/// What one acknowledgement changed.
#[derive(Default)]
pub(crate) struct AckEffects {
    /// One entry per fragment that became acknowledged
    pub acked: Vec<Handle>,
    pub retransmit: Option<OutgoingFrag>,
    pub failed: Option<Failure>,
    /// Requests whose held fragment was reclaimed, which implies a match
    pub matched: Vec<Handle>,
    pub reclaimed: usize,
}

pub(crate) struct Reliability {
    policy: RetransmitPolicy,
    peers: BTreeMap<ProcessId, Peer>,
}

impl Reliability {
    pub fn new(policy: RetransmitPolicy) -> Self {
        Reliability {
            policy,
            peers: BTreeMap::new(),
        }
    }

    pub fn set_policy(&mut self, policy: RetransmitPolicy) {
        self.policy = policy;
    }

    pub fn policy(&self) -> RetransmitPolicy {
        self.policy
    }

    fn peer(&mut self, process: ProcessId) -> &mut Peer {
        self.peers.entry(process).or_default()
    }

    /// Next fragment sequence number towards `dest`, starting at 1.
    pub fn next_frag_seq(&mut self, dest: ProcessId) -> u64 {
        let peer = self.peer(dest);
        peer.last_frag_seq += 1;
        peer.last_frag_seq
    }

    /// Start or restart the timer of a fragment handed to an unreliable path.
    pub fn on_transmit(&mut self, frag: &OutgoingFrag, now: Duration) {
        let policy = self.policy;
        let entry = self
            .peer(frag.dest())
            .outstanding
            .entry(frag.seq())
            .or_insert_with(|| Outstanding {
                frag: frag.clone(),
                state: FragState::Sent,
                transmissions: 0,
                deadline: now,
                counted: false,
                hold: frag.header.flags & DATA_SYNCHRONOUS != 0 && frag.header.offset == 0,
            });
        entry.deadline = now + policy.interval(entry.transmissions);
        entry.transmissions += 1;
        entry.state = FragState::Sent;
    }

    /// Whether a queued retransmission is still wanted.
    pub fn awaiting_retransmit(&self, frag: &OutgoingFrag) -> bool {
        self.peers
            .get(&frag.dest())
            .and_then(|peer| peer.outstanding.get(&frag.seq()))
            .map_or(false, |o| o.state == FragState::Queued)
    }

    /// Fragments towards `dest` that have been sent and not acknowledged
    pub fn unacked_count(&self, dest: ProcessId) -> usize {
        self.peers.get(&dest).map_or(0, |peer| {
            peer.outstanding
                .values()
                .filter(|o| o.state != FragState::Acked && !o.counted)
                .count()
        })
    }

    /// The peer matched `request`'s message; stop probing with its held fragment.
    pub fn release_hold(&mut self, request: Handle) {
        for peer in self.peers.values_mut() {
            for o in peer.outstanding.values_mut() {
                if o.hold && o.frag.request == request {
                    o.hold = false;
                    if o.counted {
                        o.state = FragState::Acked;
                    }
                }
            }
        }
    }

    /// Fragments held for possible retransmission
    pub fn retained(&self) -> usize {
        self.peers.values().map(|peer| peer.outstanding.len()).sum()
    }

    /// Timers that ran out at `now`.
    pub fn expired(&mut self, now: Duration) -> Expiry {
        let max = self.policy.max_transmissions();
        let mut expiry = Expiry::default();
        for (&dest, peer) in &mut self.peers {
            for (&seq, o) in &mut peer.outstanding {
                if o.state != FragState::Sent || o.deadline > now {
                    continue;
                }
                if o.transmissions >= max {
                    debug!(dest, seq, attempts = o.transmissions, "retransmissions exhausted");
                    expiry.failed.push(Failure {
                        request: o.frag.request,
                        dest,
                        attempts: o.transmissions,
                    });
                } else {
                    trace!(dest, seq, attempt = o.transmissions, "timed out");
                    o.state = FragState::Queued;
                    expiry.retransmit.push(o.frag.clone());
                }
            }
        }
        expiry
    }

    /// Apply an acknowledgement received from `ack.src`.
    pub fn on_ack(&mut self, ack: &AckHeader) -> AckEffects {
        let max = self.policy.max_transmissions();
        let mut effects = AckEffects::default();
        let Some(peer) = self.peers.get_mut(&ack.src) else {
            return effects;
        };

        if ack.status == AckStatus::Reject {
            if let Some(o) = peer.outstanding.get_mut(&ack.acked_frag_seq) {
                if o.state == FragState::Sent {
                    if o.transmissions >= max {
                        effects.failed = Some(Failure {
                            request: o.frag.request,
                            dest: ack.src,
                            attempts: o.transmissions,
                        });
                    } else {
                        o.state = FragState::Queued;
                        effects.retransmit = Some(o.frag.clone());
                    }
                }
            }
        } else if let Some(o) = peer.outstanding.get_mut(&ack.acked_frag_seq) {
            if o.state != FragState::Acked {
                o.acknowledge(&mut effects.acked);
            }
        }

        peer.peer_received = peer.peer_received.max(ack.received_seq);
        peer.peer_delivered = peer.peer_delivered.max(ack.delivered_seq.min(ack.received_seq));
        for (_, o) in peer.outstanding.range_mut(..=peer.peer_received) {
            if o.state != FragState::Acked {
                o.acknowledge(&mut effects.acked);
            }
        }
        let keep = peer.outstanding.split_off(&(peer.peer_delivered + 1));
        let reclaimed = std::mem::replace(&mut peer.outstanding, keep);
        effects.reclaimed = reclaimed.len();
        effects.matched = reclaimed
            .into_values()
            .filter(|o| o.hold)
            .map(|o| o.frag.request)
            .collect();
        effects
    }

    /// Drop every retained fragment of `request`.
    pub fn forget(&mut self, request: Handle) {
        for peer in self.peers.values_mut() {
            peer.outstanding.retain(|_, o| o.frag.request != request);
        }
    }

    /// Stop tracking everything sent to `dest`. Returns the number of fragments dropped.
    pub fn abandon(&mut self, dest: ProcessId) -> usize {
        self.peers
            .get_mut(&dest)
            .map_or(0, |peer| std::mem::take(&mut peer.outstanding).len())
    }

    /// Record a data fragment from `src`. Returns false for a duplicate.
    pub fn on_data(&mut self, src: ProcessId, frag_seq: u64) -> bool {
        self.peer(src).received.record(frag_seq)
    }

    /// Record that a fragment from `src` was written into a posted buffer.
    pub fn record_delivered(&mut self, src: ProcessId, frag_seq: u64) {
        self.peer(src).delivered.record(frag_seq);
    }

    /// Cumulative (received, delivered) sequence numbers to report to `src`.
    pub fn ack_numbers(&self, src: ProcessId) -> (u64, u64) {
        self.peers.get(&src).map_or((0, 0), |peer| {
            (
                peer.received.largest_in_order(),
                peer.delivered.largest_in_order(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::datatype::Layout;
    use crate::engine::fragment::fragment;
    use crate::engine::store::DescriptorStore;
    use crate::engine::{Operation, ReceiveOp};
    use crate::transport::{Path, PathHandle};
    use crate::wire::DataHeader;

    const SECOND: Duration = Duration::from_secs(1);

    fn policy() -> RetransmitPolicy {
        RetransmitPolicy {
            base: SECOND,
            max_power: 2,
        }
    }

    fn frags(rel: &mut Reliability, count: usize) -> (Handle, Vec<OutgoingFrag>) {
        frags_with_flags(rel, count, 0)
    }

    fn frags_with_flags(
        rel: &mut Reliability,
        count: usize,
        flags: u32,
    ) -> (Handle, Vec<OutgoingFrag>) {
        let mut store = DescriptorStore::new(1, 1, 1);
        let request = store
            .allocate(
                Operation::Receive(ReceiveOp::new(None, None, 0, Vec::new(), Layout::contiguous(0))),
                false,
            )
            .unwrap();
        let path = Path {
            driver: 1,
            dest: 1,
            handle: PathHandle(0),
            reliable: false,
            max_payload: 1,
        };
        let template = DataHeader {
            flags,
            context: 0,
            tag: 0,
            src: 0,
            dst: 1,
            frag_len: 0,
            msg_len: count as u32,
            frag_seq: 0,
            msg_seq: 1,
            offset: 0,
            checksum: 0,
        };
        let payload: Arc<[u8]> = vec![0u8; count].into();
        let out = fragment(request, path, template, &payload, || rel.next_frag_seq(1));
        (request, out)
    }

    fn ack(status: AckStatus, acked: u64, received: u64, delivered: u64) -> AckHeader {
        let mut ack = AckHeader {
            status,
            flags: 0,
            context: 0,
            src: 1,
            dst: 0,
            acked_frag_seq: acked,
            acked_msg_seq: 1,
            received_seq: received,
            delivered_seq: delivered,
            checksum: 0,
        };
        ack.seal();
        ack
    }

    #[test]
    fn tracker_merges_ranges() {
        let mut t = SeqTracker::default();
        assert!(t.record(3));
        assert!(t.record(1));
        assert_eq!(t.largest_in_order(), 1);
        assert!(t.record(2));
        assert_eq!(t.largest_in_order(), 3);
        assert!(!t.record(2));
        assert!(t.record(5));
        assert!(t.contains(5));
        assert!(!t.contains(4));
        assert_eq!(t.ranges.len(), 2);
    }

    #[test]
    fn intervals_double_up_to_the_cap() {
        let p = RetransmitPolicy {
            base: Duration::from_secs(5),
            max_power: 15,
        };
        assert_eq!(p.interval(0), Duration::from_secs(5));
        assert_eq!(p.interval(3), Duration::from_secs(40));
        assert_eq!(p.interval(15), Duration::from_secs(5 << 15));
        assert_eq!(p.interval(40), p.interval(15));
        assert_eq!(p.max_transmissions(), 16);
    }

    #[test]
    fn timeouts_back_off_then_fail() {
        let mut rel = Reliability::new(policy());
        let (request, out) = frags(&mut rel, 1);
        let frag = &out[0];
        let mut now = Duration::ZERO;
        rel.on_transmit(frag, now);

        // Deadlines at 1s, then 2s, then 4s after each transmission.
        for wait in [1, 2, 4] {
            now += SECOND * (wait - 1);
            assert!(rel.expired(now).retransmit.is_empty());
            now += SECOND;
            let expiry = rel.expired(now);
            if wait < 4 {
                assert_eq!(expiry.retransmit.len(), 1);
                assert!(rel.awaiting_retransmit(frag));
                rel.on_transmit(&expiry.retransmit[0], now);
            } else {
                assert!(expiry.retransmit.is_empty());
                assert_eq!(
                    expiry.failed,
                    vec![Failure {
                        request,
                        dest: 1,
                        attempts: 3
                    }]
                );
            }
        }
    }

    #[test]
    fn replayed_ack_has_no_further_effect() {
        let mut rel = Reliability::new(policy());
        let (request, out) = frags(&mut rel, 3);
        for frag in &out {
            rel.on_transmit(frag, Duration::ZERO);
        }
        let a = ack(AckStatus::Accept, 2, 0, 0);
        assert_eq!(rel.on_ack(&a).acked, vec![request]);
        assert!(rel.on_ack(&a).acked.is_empty());
        assert_eq!(rel.unacked_count(1), 2);

        let cumulative = ack(AckStatus::Accept, 3, 3, 1);
        let effects = rel.on_ack(&cumulative);
        assert_eq!(effects.acked.len(), 2);
        assert_eq!(effects.reclaimed, 1);
        assert_eq!(rel.retained(), 2);
        assert_eq!(rel.on_ack(&cumulative).acked.len(), 0);
        assert_eq!(rel.retained(), 2);
        assert_eq!(rel.unacked_count(1), 0);
    }

    #[test]
    fn acked_fragments_do_not_time_out() {
        let mut rel = Reliability::new(policy());
        let (_, out) = frags(&mut rel, 1);
        rel.on_transmit(&out[0], Duration::ZERO);
        rel.on_ack(&ack(AckStatus::Accept, 1, 1, 0));
        assert!(rel.expired(SECOND * 100).retransmit.is_empty());
        assert_eq!(rel.retained(), 1);
    }

    #[test]
    fn reject_requeues_like_a_timeout() {
        let mut rel = Reliability::new(policy());
        let (_, out) = frags(&mut rel, 1);
        rel.on_transmit(&out[0], Duration::ZERO);
        let effects = rel.on_ack(&ack(AckStatus::Reject, 1, 0, 0));
        assert_eq!(effects.retransmit.map(|f| f.seq()), Some(1));
        assert!(rel.on_ack(&ack(AckStatus::Reject, 1, 0, 0)).retransmit.is_none());
    }

    #[test]
    fn synchronous_first_fragment_probes_until_matched() {
        let mut rel = Reliability::new(policy());
        let (request, out) = frags_with_flags(&mut rel, 2, DATA_SYNCHRONOUS);
        for frag in &out {
            rel.on_transmit(frag, Duration::ZERO);
        }
        let effects = rel.on_ack(&ack(AckStatus::Accept, 2, 2, 0));
        assert_eq!(effects.acked, vec![request, request]);
        assert_eq!(rel.unacked_count(1), 0);

        // The held fragment keeps its timer; the other one does not.
        let expiry = rel.expired(SECOND);
        assert_eq!(expiry.retransmit.iter().map(|f| f.seq()).collect::<Vec<_>>(), vec![1]);
        rel.on_transmit(&expiry.retransmit[0], SECOND);
        assert!(rel.on_ack(&ack(AckStatus::Accept, 1, 2, 0)).acked.is_empty());

        rel.release_hold(request);
        assert!(rel.expired(SECOND * 100).retransmit.is_empty());
    }

    #[test]
    fn reclaiming_a_held_fragment_reports_the_match() {
        let mut rel = Reliability::new(policy());
        let (request, out) = frags_with_flags(&mut rel, 1, DATA_SYNCHRONOUS);
        rel.on_transmit(&out[0], Duration::ZERO);
        let effects = rel.on_ack(&ack(AckStatus::Accept, 1, 1, 1));
        assert_eq!(effects.acked, vec![request]);
        assert_eq!(effects.matched, vec![request]);
        assert_eq!(rel.retained(), 0);
    }

    #[test]
    fn receive_side_reports_cumulative_numbers() {
        let mut rel = Reliability::new(policy());
        assert!(rel.on_data(4, 1));
        assert!(rel.on_data(4, 3));
        assert!(!rel.on_data(4, 3));
        rel.record_delivered(4, 1);
        assert_eq!(rel.ack_numbers(4), (1, 1));
        assert!(rel.on_data(4, 2));
        assert_eq!(rel.ack_numbers(4), (3, 1));
        assert_eq!(rel.ack_numbers(9), (0, 0));
    }
}
