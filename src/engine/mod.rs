//! The point-to-point engine
//!
//! One [`Engine`] per process owns every request descriptor, the matching queues, the
//! reliability state and the transport drivers. Nothing happens in the background: all work
//! is done by [`Engine::progress`], which the public operations call as they wait.
//!
//! A send moves through the engine as
//!
//! ```text
//! pending send --fragment--> frames to send --transmit--> awaiting acknowledgement --> done
//! ```
//!
//! and a receive as posted --match--> matched --reassembled--> done. Message and fragment
//! sequence numbers are assigned when a send leaves the pending queue, so a send cancelled
//! while still pending leaves no gap in either sequence.

use std::collections::{HashMap, HashSet, VecDeque};
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::clock::Clock;
use crate::datatype::Layout;
use crate::environment::Config;
use crate::error::{Error, Result};
use crate::point_to_point::Status;
use crate::transport::{Arrival, Path, PathTable, Transport, TransportError};
use crate::wire::{
    AckHeader, AckStatus, DataHeader, Header, ACK_MATCHED, DATA_PAYLOAD_CHECKSUM, DATA_READY,
    DATA_SYNCHRONOUS,
};
use crate::{ContextId, ProcessId, Rank, Tag};

use self::fragment::{fragment, OutgoingFrag, Reassembly};
use self::matching::{Envelope, IncomingFrag, MatchingEngine, Routed};
use self::reliability::{Failure, Reliability, RetransmitPolicy};
use self::store::{Completion, DescriptorStore, Handle, QueueRole, RequestState};

pub(crate) mod fragment;
pub mod lock;
pub(crate) mod matching;
pub(crate) mod reliability;
pub(crate) mod store;

/// Counters kept by the engine since the universe was built.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Data fragments handed to a driver, retransmissions included
    pub frames_sent: u64,
    /// Frames of either kind received from drivers
    pub frames_received: u64,
    /// Data fragments sent again after a timeout or a rejection
    pub retransmissions: u64,
    /// Retransmission timers that ran out
    pub timeouts: u64,
    /// Accepting acknowledgements sent
    pub acks_sent: u64,
    /// Accepting acknowledgements received
    pub acks_received: u64,
    /// Rejecting acknowledgements sent
    pub nacks_sent: u64,
    /// Rejecting acknowledgements received
    pub nacks_received: u64,
    /// Data fragments received more than once
    pub duplicates: u64,
    /// Frames that failed their checksum
    pub checksum_failures: u64,
    /// Messages that arrived before a matching receive was posted
    pub unexpected_messages: u64,
    /// Operations that ended with an error
    pub failed_operations: u64,
    /// Sent fragments held for possible retransmission right now
    pub retained_fragments: u64,
    /// Request descriptors in use right now
    pub live_requests: u64,
}

/// The four send modes
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SendMode {
    Standard,
    Buffered,
    Synchronous,
    Ready,
}

pub(crate) struct SendOp {
    pub dest: ProcessId,
    pub tag: Tag,
    pub context: ContextId,
    pub mode: SendMode,
    pub payload: Arc<[u8]>,
    path: Option<Path>,
    msg_seq: u64,
    frags_total: usize,
    frags_sent: usize,
    frags_acked: usize,
    matched: bool,
    registered: bool,
    /// Bytes reserved from the attached buffer
    claimed: usize,
}

impl SendOp {
    pub fn new(
        dest: ProcessId,
        tag: Tag,
        context: ContextId,
        mode: SendMode,
        payload: Arc<[u8]>,
    ) -> Self {
        SendOp {
            dest,
            tag,
            context,
            mode,
            payload,
            path: None,
            msg_seq: 0,
            frags_total: 0,
            frags_sent: 0,
            frags_acked: 0,
            matched: false,
            registered: false,
            claimed: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.frags_total > 0
            && self.frags_acked >= self.frags_total
            && (self.mode != SendMode::Synchronous || self.matched)
    }
}

pub(crate) struct ReceiveOp {
    source: Option<ProcessId>,
    tag: Option<Tag>,
    context: ContextId,
    reassembly: Reassembly,
    envelope: Option<Envelope>,
}

impl ReceiveOp {
    /// `staging` holds the current contents of the destination buffer.
    pub fn new(
        source: Option<ProcessId>,
        tag: Option<Tag>,
        context: ContextId,
        staging: Vec<u8>,
        layout: Layout,
    ) -> Self {
        ReceiveOp {
            source,
            tag,
            context,
            reassembly: Reassembly::new(staging, layout),
            envelope: None,
        }
    }
}

pub(crate) enum Operation {
    Send(SendOp),
    Receive(ReceiveOp),
}

struct Queued {
    frag: OutgoingFrag,
    retry: bool,
}

fn rank_of(process: ProcessId) -> Rank {
    process as Rank
}

/// Translate a driver failure for the caller.
fn path_error(op: &'static str, transport: &'static str, dest: ProcessId, err: TransportError) -> Error {
    match err {
        TransportError::Unreachable(_) => Error::NoPath {
            op,
            rank: rank_of(dest),
        },
        TransportError::RegistrationLimit => Error::RegistrationLimit { op, transport },
        TransportError::Busy => Error::Busy {
            op,
            rank: rank_of(dest),
        },
        other => Error::Transport {
            op,
            transport,
            source: Arc::new(other),
        },
    }
}

/// The point-to-point engine of one process.
///
/// Only reachable through a [`Universe`](crate::environment::Universe) and the
/// communicators derived from it.
pub struct Engine {
    me: ProcessId,
    size: u32,
    config: Config,
    clock: Arc<dyn Clock>,
    store: DescriptorStore,
    matching: MatchingEngine,
    reliability: Reliability,
    paths: PathTable,
    pending_sends: VecDeque<Handle>,
    to_send: VecDeque<Queued>,
    next_msg_seq: HashMap<(ContextId, ProcessId), u64>,
    /// Synchronous sends waiting to hear that they matched
    awaiting_match: HashMap<(ContextId, ProcessId, u64), Handle>,
    pending_acks: VecDeque<AckHeader>,
    /// Peers a fragment could not reach, with the transmissions it took
    failed_peers: HashMap<ProcessId, u32>,
    buffer_capacity: usize,
    buffer_used: usize,
    next_context: ContextId,
    stats: Statistics,
    arrivals: Vec<(usize, Arrival)>,
    routed: Vec<Routed>,
}

fn policy_of(config: &Config) -> RetransmitPolicy {
    RetransmitPolicy {
        base: config.retransmit_base,
        max_power: config.max_retransmit_power,
    }
}

impl Engine {
    pub(crate) fn new(
        me: ProcessId,
        size: u32,
        config: Config,
        drivers: Vec<Box<dyn Transport>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        debug!(me, size, drivers = drivers.len(), "starting engine");
        Engine {
            me,
            size,
            store: DescriptorStore::new(
                config.request_pool_initial,
                config.request_pool_grow_by,
                config.max_requests,
            ),
            matching: MatchingEngine::new(),
            reliability: Reliability::new(policy_of(&config)),
            paths: PathTable::new(me, drivers, config.max_frame_payload),
            pending_sends: VecDeque::new(),
            to_send: VecDeque::new(),
            next_msg_seq: HashMap::new(),
            awaiting_match: HashMap::new(),
            pending_acks: VecDeque::new(),
            failed_peers: HashMap::new(),
            buffer_capacity: config.buffer_size,
            buffer_used: 0,
            next_context: 1,
            stats: Statistics::default(),
            arrivals: Vec::new(),
            routed: Vec::new(),
            clock,
            config,
        }
    }

    pub(crate) fn me(&self) -> ProcessId {
        self.me
    }

    pub(crate) fn size(&self) -> u32 {
        self.size
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Apply a named tunable to the running engine.
    pub(crate) fn set_tunable(&mut self, name: &str, value: &str) -> Result<()> {
        if name == "buffer_size" {
            return Err(Error::InvalidArgument {
                op: "set_tunable",
                reason: "the attached buffer of a running universe is resized with set_buffer_size".into(),
            });
        }
        self.config.set_tunable(name, value)?;
        self.reliability.set_policy(policy_of(&self.config));
        self.store
            .set_limits(self.config.request_pool_grow_by, self.config.max_requests);
        self.paths.set_payload_cap(self.config.max_frame_payload);
        Ok(())
    }

    /// Apply the configured error handler to an error on its way out.
    fn check<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|err| self.raise(err))
    }

    pub(crate) fn raise(&self, err: Error) -> Error {
        self.config.error_handler.handle(err)
    }

    pub(crate) fn statistics(&self) -> Statistics {
        Statistics {
            retained_fragments: self.reliability.retained() as u64,
            live_requests: self.store.live() as u64,
            ..self.stats
        }
    }

    pub(crate) fn allocate_context(&mut self) -> Result<ContextId> {
        let id = self.next_context;
        let next = id
            .checked_add(1)
            .ok_or(Error::ContextExhausted { op: "duplicate" });
        self.next_context = self.check(next)?;
        Ok(id)
    }

    pub(crate) fn buffer_size(&self) -> usize {
        self.buffer_capacity
    }

    pub(crate) fn buffer_in_use(&self) -> usize {
        self.buffer_used
    }

    /// Resize the attached buffer. The caller drains outstanding buffered sends first.
    pub(crate) fn set_buffer_size(&mut self, size: usize) {
        debug!(size, "attached buffer resized");
        self.buffer_capacity = size;
        self.config.buffer_size = size;
    }

    // ---------------------------------------------------------------------------------
    // Requests

    /// Create a descriptor for `op` without starting it.
    pub(crate) fn create(&mut self, op: Operation, persistent: bool, name: &'static str) -> Result<Handle> {
        let handle = self
            .store
            .allocate(op, persistent)
            .map_err(|_| Error::ResourceExhausted { op: name });
        self.check(handle)
    }

    /// Create and start an operation.
    pub(crate) fn post(&mut self, op: Operation, name: &'static str) -> Result<Handle> {
        let handle = self.create(op, false, name)?;
        if let Err(err) = self.start_inner(handle, None, name) {
            self.store.release(handle);
            return self.check(Err(err));
        }
        Ok(handle)
    }

    /// Start an inactive persistent request. Receives get a fresh image of their buffer.
    pub(crate) fn start(&mut self, handle: Handle, staging: Option<Vec<u8>>) -> Result<()> {
        let result = self.start_inner(handle, staging, "start");
        self.check(result)
    }

    fn start_inner(&mut self, handle: Handle, staging: Option<Vec<u8>>, name: &'static str) -> Result<()> {
        let descriptor = self
            .store
            .get_mut(handle)
            .ok_or(Error::InvalidRequest { op: name })?;
        if descriptor.state == RequestState::Incomplete {
            return Err(Error::InvalidArgument {
                op: name,
                reason: "request is already active".into(),
            });
        }
        match &mut descriptor.op {
            Operation::Send(send) => {
                if !descriptor.engine_done {
                    return Err(Error::Busy {
                        op: name,
                        rank: rank_of(send.dest),
                    });
                }
                self.start_send(handle, name)
            }
            Operation::Receive(receive) => {
                if let Some(staging) = staging {
                    receive.reassembly.reset(staging);
                }
                self.start_receive(handle);
                Ok(())
            }
        }
    }

    fn start_send(&mut self, handle: Handle, name: &'static str) -> Result<()> {
        let Some(Operation::Send(send)) = self.store.get(handle).map(|d| &d.op) else {
            return Err(Error::InvalidRequest { op: name });
        };
        let (dest, context, mode, payload) = (send.dest, send.context, send.mode, send.payload.clone());
        if let Some(&attempts) = self.failed_peers.get(&dest) {
            return Err(Error::RetransmitExhausted {
                op: name,
                rank: rank_of(dest),
                attempts,
            });
        }
        if self.pending_sends.len() >= self.config.send_queue_limit {
            return Err(Error::Busy {
                op: name,
                rank: rank_of(dest),
            });
        }
        let path = self
            .paths
            .select(context, dest)
            .map_err(|err| path_error(name, "path selection", dest, err))?;
        let claimed = if mode == SendMode::Buffered {
            let available = self.buffer_capacity.saturating_sub(self.buffer_used);
            if payload.len() > available {
                return Err(Error::BufferTooSmall {
                    op: name,
                    needed: payload.len(),
                    available,
                });
            }
            payload.len()
        } else {
            0
        };
        let registered = self
            .paths
            .register(&path, &payload)
            .map_err(|err| path_error(name, self.paths.name(path.driver), dest, err))?;
        self.buffer_used += claimed;

        self.store.mark_started(handle);
        let Some(descriptor) = self.store.get_mut(handle) else {
            return Err(Error::InvalidRequest { op: name });
        };
        descriptor.move_to(QueueRole::PendingSend);
        if let Operation::Send(send) = &mut descriptor.op {
            send.path = Some(path);
            send.msg_seq = 0;
            send.frags_total = 0;
            send.frags_sent = 0;
            send.frags_acked = 0;
            send.matched = false;
            send.registered = registered;
            send.claimed = claimed;
            debug!(
                dest,
                tag = send.tag,
                context,
                bytes = payload.len(),
                mode = ?mode,
                transport = self.paths.name(path.driver),
                "send posted"
            );
        }
        self.pending_sends.push_back(handle);

        if mode == SendMode::Buffered {
            // Buffered sends complete as soon as the data is in the attached buffer.
            let status = self.send_status(handle);
            self.store
                .mark_complete(handle, Ok(Completion { status, data: None }));
        }
        Ok(())
    }

    fn start_receive(&mut self, handle: Handle) {
        self.store.mark_started(handle);
        let Some(Operation::Receive(receive)) = self.store.get_mut(handle).map(|d| &mut d.op) else {
            return;
        };
        receive.envelope = None;
        let (source, tag, context) = (receive.source, receive.tag, receive.context);
        debug!(?source, ?tag, context, "receive posted");

        match self.matching.post(handle, source, tag, context) {
            Some(message) => {
                trace!(
                    source = message.envelope.source,
                    msg_seq = message.envelope.msg_seq,
                    "matched unexpected message"
                );
                if let Some(descriptor) = self.store.get_mut(handle) {
                    descriptor.move_to(QueueRole::MatchedReceive);
                }
                let envelope = message.envelope;
                let reliable = message.frags.iter().all(|f| f.reliable);
                self.begin_message(handle, envelope);
                for frag in message.frags {
                    self.deliver(handle, frag);
                }
                if !reliable || envelope.flags & DATA_SYNCHRONOUS != 0 {
                    self.queue_ack(
                        AckStatus::Accept,
                        ACK_MATCHED,
                        envelope.context,
                        envelope.source,
                        0,
                        envelope.msg_seq,
                    );
                }
            }
            None => {
                if let Some(descriptor) = self.store.get_mut(handle) {
                    descriptor.move_to(QueueRole::PostedReceive);
                }
            }
        }
    }

    fn send_status(&self, handle: Handle) -> Status {
        match self.store.get(handle).map(|d| &d.op) {
            Some(Operation::Send(send)) => {
                Status::new(rank_of(send.dest), send.tag, send.payload.len())
            }
            _ => Status::new(0, 0, 0),
        }
    }

    /// Take the outcome of a request if it is finished, without making progress.
    pub(crate) fn try_take(&mut self, handle: Handle, name: &'static str) -> Result<Option<Completion>> {
        if self.store.get(handle).is_none() {
            return self.check(Err(Error::InvalidRequest { op: name }));
        }
        match self.store.take_outcome(handle) {
            Some(Ok(completion)) => Ok(Some(completion)),
            Some(Err(err)) => self.check(Err(err)),
            None => Ok(None),
        }
    }

    /// Whether a request has an outcome waiting. Unknown handles count as finished so that
    /// taking the outcome reports them.
    pub(crate) fn is_finished(&self, handle: Handle) -> bool {
        self.store.get(handle).map_or(true, |d| d.has_outcome())
    }

    /// Make progress unless the request is already finished, then take its outcome.
    pub(crate) fn test(&mut self, handle: Handle, name: &'static str) -> Result<Option<Completion>> {
        if !self.is_finished(handle) {
            self.progress();
        }
        self.try_take(handle, name)
    }

    /// Cancel a request. Only pending sends and unmatched receives can be cancelled; for
    /// anything else this does nothing and the operation completes normally.
    pub(crate) fn cancel(&mut self, handle: Handle) -> Result<()> {
        let Some(descriptor) = self.store.get(handle) else {
            return self.check(Err(Error::InvalidRequest { op: "cancel" }));
        };
        let (role, buffered) = match &descriptor.op {
            Operation::Send(send) => (descriptor.role, send.mode == SendMode::Buffered),
            Operation::Receive(_) => (descriptor.role, false),
        };
        let cancellable = match role {
            QueueRole::PostedReceive => self.matching.cancel(handle),
            QueueRole::PendingSend if !buffered => {
                self.pending_sends.retain(|&h| h != handle);
                self.release_send(handle);
                true
            }
            _ => false,
        };
        if cancellable {
            debug!("request cancelled");
            self.store.mark_complete(
                handle,
                Ok(Completion {
                    status: Status::cancelled(),
                    data: None,
                }),
            );
            self.store.finish(handle);
        }
        Ok(())
    }

    /// Release a persistent request.
    pub(crate) fn free(&mut self, handle: Handle) -> Result<()> {
        let result = match self.store.get(handle) {
            None => Err(Error::InvalidRequest { op: "free" }),
            Some(d) if d.state == RequestState::Incomplete || !d.engine_done => {
                Err(Error::InvalidArgument {
                    op: "free",
                    reason: "request is still active".into(),
                })
            }
            Some(_) => {
                self.store.release(handle);
                Ok(())
            }
        };
        self.check(result)
    }

    /// Make progress, then report the first unexpected message a receive with these
    /// arguments would match.
    pub(crate) fn probe(
        &mut self,
        source: Option<ProcessId>,
        tag: Option<Tag>,
        context: ContextId,
    ) -> Option<Status> {
        self.progress();
        self.matching
            .probe(source, tag, context)
            .map(|env| Status::new(rank_of(env.source), env.tag, env.msg_len as usize))
    }

    // ---------------------------------------------------------------------------------
    // Progress

    /// Poll every driver, handle what arrived, run the timers, push queued frames and send
    /// pending acknowledgements.
    pub fn progress(&mut self) {
        self.poll();
        self.fire_timers();
        self.push_sends();
        self.flush_acks();
    }

    fn poll(&mut self) {
        let mut arrivals = mem::take(&mut self.arrivals);
        let mut failures = Vec::new();
        self.paths.poll(&mut arrivals, &mut failures);
        for (driver, err) in failures {
            match err {
                TransportError::Busy => {}
                err => self.fail_path(driver, err),
            }
        }
        for (driver, arrival) in arrivals.drain(..) {
            self.dispatch(driver, arrival);
        }
        self.arrivals = arrivals;
    }

    fn dispatch(&mut self, driver: usize, arrival: Arrival) {
        self.stats.frames_received += 1;
        if arrival.header.dst() != self.me || arrival.header.src() >= self.size {
            warn!(
                src = arrival.header.src(),
                dst = arrival.header.dst(),
                "dropping frame not addressed to this process"
            );
            return;
        }
        match arrival.header {
            Header::Data(header) => self.handle_data(driver, header, arrival.payload),
            Header::Ack(ack) => self.handle_ack(ack),
        }
    }

    fn handle_data(&mut self, driver: usize, header: DataHeader, payload: Vec<u8>) {
        let reliable = self.paths.is_reliable(driver);
        if !header.verify(&payload) {
            self.stats.checksum_failures += 1;
            warn!(
                src = header.src,
                frag_seq = header.frag_seq,
                "data fragment failed its checksum"
            );
            if !reliable {
                self.queue_ack(
                    AckStatus::Reject,
                    0,
                    header.context,
                    header.src,
                    header.frag_seq,
                    header.msg_seq,
                );
            }
            return;
        }

        if !self.reliability.on_data(header.src, header.frag_seq) {
            self.stats.duplicates += 1;
            trace!(src = header.src, frag_seq = header.frag_seq, "duplicate fragment");
            if !reliable {
                self.ack_fragment(&header);
            }
            return;
        }

        let mut routed = mem::take(&mut self.routed);
        self.matching
            .arrive(IncomingFrag::new(&header, payload, reliable), &mut routed);
        for route in routed.drain(..) {
            match route {
                Routed::Deliver {
                    request,
                    frag,
                    newly_matched,
                } => {
                    if newly_matched {
                        let envelope = frag.envelope;
                        if let Some(descriptor) = self.store.get_mut(request) {
                            descriptor.move_to(QueueRole::MatchedReceive);
                        }
                        self.begin_message(request, envelope);
                        if envelope.flags & DATA_SYNCHRONOUS != 0 {
                            self.queue_ack(
                                AckStatus::Accept,
                                ACK_MATCHED,
                                envelope.context,
                                envelope.source,
                                0,
                                envelope.msg_seq,
                            );
                        }
                    }
                    self.deliver(request, frag);
                }
                Routed::Unexpected(envelope) => {
                    self.stats.unexpected_messages += 1;
                    if envelope.flags & DATA_READY != 0 {
                        warn!(
                            source = envelope.source,
                            tag = envelope.tag,
                            "ready-mode message arrived before a matching receive was posted"
                        );
                    }
                }
                Routed::Stray(envelope) => {
                    warn!(
                        source = envelope.source,
                        msg_seq = envelope.msg_seq,
                        "fragment of a completed message"
                    );
                }
            }
        }
        self.routed = routed;

        if !reliable {
            self.ack_fragment(&header);
        }
    }

    /// Acknowledge a data fragment received over an unreliable path.
    fn ack_fragment(&mut self, header: &DataHeader) {
        let flags = if self
            .matching
            .is_matched(header.context, header.src, header.msg_seq)
        {
            ACK_MATCHED
        } else {
            0
        };
        self.queue_ack(
            AckStatus::Accept,
            flags,
            header.context,
            header.src,
            header.frag_seq,
            header.msg_seq,
        );
    }

    fn queue_ack(
        &mut self,
        status: AckStatus,
        flags: u32,
        context: ContextId,
        to: ProcessId,
        frag_seq: u64,
        msg_seq: u64,
    ) {
        let (received_seq, delivered_seq) = self.reliability.ack_numbers(to);
        let mut ack = AckHeader {
            status,
            flags,
            context,
            src: self.me,
            dst: to,
            acked_frag_seq: frag_seq,
            acked_msg_seq: msg_seq,
            received_seq,
            delivered_seq,
            checksum: 0,
        };
        ack.seal();
        self.pending_acks.push_back(ack);
    }

    fn handle_ack(&mut self, ack: AckHeader) {
        if !ack.verify() {
            self.stats.checksum_failures += 1;
            warn!(src = ack.src, "acknowledgement failed its checksum");
            return;
        }
        match ack.status {
            AckStatus::Accept => self.stats.acks_received += 1,
            AckStatus::Reject => {
                self.stats.nacks_received += 1;
                debug!(src = ack.src, frag_seq = ack.acked_frag_seq, "fragment rejected");
            }
        }
        let effects = self.reliability.on_ack(&ack);
        for request in effects.acked {
            self.frag_acked(request);
        }
        if let Some(frag) = effects.retransmit {
            self.to_send.push_front(Queued { frag, retry: true });
        }
        if let Some(failure) = effects.failed {
            self.fail_exhausted(failure);
        }
        if ack.flags & ACK_MATCHED != 0 {
            let key = (ack.context, ack.src, ack.acked_msg_seq);
            if let Some(&request) = self.awaiting_match.get(&key) {
                self.matched(request);
            }
        }
        for request in effects.matched {
            self.matched(request);
        }
    }

    fn fire_timers(&mut self) {
        let expiry = self.reliability.expired(self.clock.now());
        self.stats.timeouts += expiry.retransmit.len() as u64;
        for frag in expiry.retransmit.into_iter().rev() {
            debug!(dest = frag.dest(), frag_seq = frag.seq(), "retransmitting");
            self.to_send.push_front(Queued { frag, retry: true });
        }
        for failure in expiry.failed {
            self.fail_exhausted(failure);
        }
    }

    fn push_sends(&mut self) {
        loop {
            // One message per destination per round, and only once earlier frames to that
            // destination are gone, so messages leave in the order they were posted.
            let mut busy: HashSet<ProcessId> = self.to_send.iter().map(|q| q.frag.dest()).collect();
            let mut waiting = VecDeque::new();
            let mut admitted = false;
            while let Some(handle) = self.pending_sends.pop_front() {
                let dest = match self.store.get(handle).map(|d| &d.op) {
                    Some(Operation::Send(send)) => send.dest,
                    _ => continue,
                };
                if busy.insert(dest) {
                    self.fragment_send(handle);
                    admitted = true;
                } else {
                    waiting.push_back(handle);
                }
            }
            self.pending_sends = waiting;
            self.transmit();
            if !admitted || self.pending_sends.is_empty() {
                break;
            }
        }
    }

    fn fragment_send(&mut self, handle: Handle) {
        let me = self.me;
        let checksum = self.config.checksum_payload;
        let Some(descriptor) = self.store.get_mut(handle) else {
            return;
        };
        let Operation::Send(send) = &mut descriptor.op else {
            return;
        };
        let Some(path) = send.path else {
            return;
        };
        let dest = send.dest;
        let next = self.next_msg_seq.entry((send.context, dest)).or_insert(1);
        send.msg_seq = *next;
        *next += 1;

        let mut flags = match send.mode {
            SendMode::Synchronous => DATA_SYNCHRONOUS,
            SendMode::Ready => DATA_READY,
            SendMode::Standard | SendMode::Buffered => 0,
        };
        if checksum {
            flags |= DATA_PAYLOAD_CHECKSUM;
        }
        let template = DataHeader {
            flags,
            context: send.context,
            tag: send.tag,
            src: me,
            dst: dest,
            frag_len: 0,
            msg_len: send.payload.len() as u32,
            frag_seq: 0,
            msg_seq: send.msg_seq,
            offset: 0,
            checksum: 0,
        };
        let reliability = &mut self.reliability;
        let frags = fragment(handle, path, template, &send.payload, || {
            reliability.next_frag_seq(dest)
        });
        send.frags_total = frags.len();
        trace!(
            dest,
            msg_seq = send.msg_seq,
            frags = frags.len(),
            "message fragmented"
        );
        if send.mode == SendMode::Synchronous {
            self.awaiting_match
                .insert((send.context, dest, send.msg_seq), handle);
        }
        descriptor.move_to(QueueRole::FragsToSend);
        self.to_send
            .extend(frags.into_iter().map(|frag| Queued { frag, retry: false }));
    }

    fn transmit(&mut self) {
        let now = self.clock.now();
        let max_outstanding = self.config.max_outstanding_frags;
        let mut blocked = HashSet::new();
        let mut failed: HashMap<Handle, Error> = HashMap::new();
        let mut keep = VecDeque::with_capacity(self.to_send.len());

        while let Some(queued) = self.to_send.pop_front() {
            let frag = &queued.frag;
            let dest = frag.dest();
            if failed.contains_key(&frag.request) {
                continue;
            }
            if blocked.contains(&dest) {
                keep.push_back(queued);
                continue;
            }
            if queued.retry && !self.reliability.awaiting_retransmit(frag) {
                continue;
            }
            if !queued.retry
                && !frag.path.reliable
                && self.reliability.unacked_count(dest) >= max_outstanding
            {
                blocked.insert(dest);
                keep.push_back(queued);
                continue;
            }
            match self
                .paths
                .send(&frag.path, &Header::Data(frag.header), frag.payload())
            {
                Ok(()) => {
                    self.stats.frames_sent += 1;
                    if queued.retry {
                        self.stats.retransmissions += 1;
                    }
                    if frag.path.reliable {
                        self.frag_sent(frag.request);
                        self.frag_acked(frag.request);
                    } else {
                        self.reliability.on_transmit(frag, now);
                        if !queued.retry {
                            self.frag_sent(frag.request);
                        }
                    }
                }
                Err(TransportError::Busy) => {
                    blocked.insert(dest);
                    keep.push_back(queued);
                }
                Err(err) => {
                    let transport = self.paths.name(frag.path.driver);
                    failed.insert(frag.request, path_error("send", transport, dest, err));
                }
            }
        }
        self.to_send = keep;
        for (request, err) in failed {
            self.fail(request, err);
        }
    }

    fn flush_acks(&mut self) {
        while let Some(ack) = self.pending_acks.pop_front() {
            let path = match self.paths.select(ack.context, ack.dst) {
                Ok(path) => path,
                Err(err) => {
                    warn!(dst = ack.dst, error = %err, "no path for acknowledgement");
                    continue;
                }
            };
            match self.paths.send(&path, &Header::Ack(ack), &[]) {
                Ok(()) => match ack.status {
                    AckStatus::Accept => self.stats.acks_sent += 1,
                    AckStatus::Reject => self.stats.nacks_sent += 1,
                },
                Err(TransportError::Busy) => {
                    self.pending_acks.push_front(ack);
                    break;
                }
                Err(err) => warn!(dst = ack.dst, error = %err, "dropping acknowledgement"),
            }
        }
    }

    // ---------------------------------------------------------------------------------
    // Send bookkeeping

    fn frag_sent(&mut self, handle: Handle) {
        if let Some(descriptor) = self.store.get_mut(handle) {
            if let Operation::Send(send) = &mut descriptor.op {
                send.frags_sent += 1;
                if send.frags_sent == send.frags_total {
                    descriptor.move_to(QueueRole::FragsToAck);
                }
            }
        }
    }

    fn frag_acked(&mut self, handle: Handle) {
        let complete = match self.store.get_mut(handle).map(|d| &mut d.op) {
            Some(Operation::Send(send)) => {
                send.frags_acked += 1;
                send.is_complete()
            }
            _ => false,
        };
        if complete {
            self.complete_send(handle);
        }
    }

    fn matched(&mut self, handle: Handle) {
        self.reliability.release_hold(handle);
        let complete = match self.store.get_mut(handle).map(|d| &mut d.op) {
            Some(Operation::Send(send)) if !send.matched => {
                send.matched = true;
                send.is_complete()
            }
            _ => false,
        };
        if complete {
            self.complete_send(handle);
        }
    }

    fn complete_send(&mut self, handle: Handle) {
        let status = self.send_status(handle);
        trace!(dest = status.source_rank(), tag = status.tag(), "send complete");
        self.release_send(handle);
        self.store
            .mark_complete(handle, Ok(Completion { status, data: None }));
        self.store.finish(handle);
    }

    /// Return everything a send holds outside its descriptor.
    fn release_send(&mut self, handle: Handle) {
        let Some(Operation::Send(send)) = self.store.get_mut(handle).map(|d| &mut d.op) else {
            return;
        };
        if send.registered {
            if let Some(path) = send.path {
                self.paths.deregister(&path, &send.payload);
            }
            send.registered = false;
        }
        self.awaiting_match
            .remove(&(send.context, send.dest, send.msg_seq));
        self.buffer_used = self.buffer_used.saturating_sub(send.claimed);
        send.claimed = 0;
    }

    /// A fragment ran out of transmissions. The message sequence towards its destination now
    /// has a hole the peer can never fill, so the connection is dead: every live send to the
    /// peer fails with the same error and later sends are refused.
    fn fail_exhausted(&mut self, failure: Failure) {
        let dest = failure.dest;
        let attempts = *self.failed_peers.entry(dest).or_insert(failure.attempts);
        let err = Error::RetransmitExhausted {
            op: "send",
            rank: rank_of(dest),
            attempts,
        };
        self.fail(failure.request, err.clone());

        let victims: Vec<Handle> = self
            .store
            .handles()
            .into_iter()
            .filter(|&h| match self.store.get(h) {
                Some(d) if !d.engine_done => {
                    matches!(&d.op, Operation::Send(send) if send.dest == dest && send.path.is_some())
                }
                _ => false,
            })
            .collect();
        if !victims.is_empty() {
            warn!(dest, sends = victims.len(), "failing sends to an unreachable peer");
        }
        for handle in victims {
            self.fail(handle, err.clone());
        }
        let dropped = self.reliability.abandon(dest);
        self.to_send.retain(|q| q.frag.dest() != dest);
        trace!(dest, dropped, "retained fragments dropped");
    }

    fn fail(&mut self, handle: Handle, err: Error) {
        if self.store.get(handle).map_or(true, |d| d.engine_done) {
            return;
        }
        error!(op = err.operation(), "operation failed: {}", err);
        self.stats.failed_operations += 1;
        self.reliability.forget(handle);
        self.to_send.retain(|q| q.frag.request != handle);
        self.pending_sends.retain(|&h| h != handle);
        self.release_send(handle);
        self.store.mark_complete(handle, Err(err));
        self.store.finish(handle);
    }

    /// A driver failed outside of any single send.
    fn fail_path(&mut self, driver: usize, err: TransportError) {
        let transport = self.paths.name(driver);
        warn!(transport, error = %err, "transport failed");
        let peer = match err {
            TransportError::Closed(p) | TransportError::Unreachable(p) => Some(p),
            _ => None,
        };
        let source = Arc::new(err);
        let victims: Vec<Handle> = self
            .store
            .handles()
            .into_iter()
            .filter(|&h| match self.store.get(h) {
                Some(d) if !d.engine_done => match &d.op {
                    Operation::Send(send) => send.path.map_or(false, |p| {
                        p.driver == driver && peer.map_or(true, |peer| peer == p.dest)
                    }),
                    Operation::Receive(_) => false,
                },
                _ => false,
            })
            .collect();
        for handle in victims {
            self.fail(
                handle,
                Error::Transport {
                    op: "send",
                    transport,
                    source: source.clone(),
                },
            );
        }
    }

    // ---------------------------------------------------------------------------------
    // Receive bookkeeping

    fn begin_message(&mut self, handle: Handle, envelope: Envelope) {
        if let Some(Operation::Receive(receive)) = self.store.get_mut(handle).map(|d| &mut d.op) {
            receive.envelope = Some(envelope);
            receive.reassembly.begin(envelope.msg_len);
        }
    }

    fn deliver(&mut self, handle: Handle, frag: IncomingFrag) {
        let complete = match self.store.get_mut(handle).map(|d| &mut d.op) {
            Some(Operation::Receive(receive)) => {
                if receive.reassembly.write(frag.offset, &frag.payload) {
                    self.reliability
                        .record_delivered(frag.envelope.source, frag.frag_seq);
                }
                receive.reassembly.is_complete()
            }
            _ => false,
        };
        if complete {
            self.complete_receive(handle);
        }
    }

    fn complete_receive(&mut self, handle: Handle) {
        let Some(Operation::Receive(receive)) = self.store.get_mut(handle).map(|d| &mut d.op) else {
            return;
        };
        let Some(envelope) = receive.envelope else {
            return;
        };
        let status = Status::new(
            rank_of(envelope.source),
            envelope.tag,
            receive.reassembly.delivered(),
        )
        .with_truncated(receive.reassembly.is_truncated());
        if status.is_truncated() {
            debug!(
                source = envelope.source,
                msg_len = envelope.msg_len,
                capacity = receive.reassembly.capacity(),
                "message truncated"
            );
        }
        let data = receive.reassembly.take_staging();
        self.matching.finish(&envelope);
        trace!(source = envelope.source, tag = envelope.tag, "receive complete");
        self.store.mark_complete(
            handle,
            Ok(Completion {
                status,
                data: Some(data),
            }),
        );
        self.store.finish(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::{FaultyTransport, SharedMemoryFabric};

    fn engines(config: Config, faulty: bool, clock: &ManualClock) -> (Engine, Engine) {
        let fabric = SharedMemoryFabric::new(2);
        let build = |me: ProcessId| {
            let endpoint = fabric.endpoint(me).unwrap();
            let driver: Box<dyn Transport> = if faulty {
                Box::new(FaultyTransport::new(endpoint))
            } else {
                Box::new(endpoint)
            };
            Engine::new(me, 2, config.clone(), vec![driver], Arc::new(clock.clone()))
        };
        (build(0), build(1))
    }

    fn send(engine: &mut Engine, dest: ProcessId, tag: Tag, mode: SendMode, bytes: &[u8]) -> Handle {
        engine
            .post(
                Operation::Send(SendOp::new(dest, tag, 0, mode, bytes.to_vec().into())),
                "send",
            )
            .unwrap()
    }

    fn receive(engine: &mut Engine, source: Option<ProcessId>, len: usize) -> Handle {
        engine
            .post(
                Operation::Receive(ReceiveOp::new(
                    source,
                    None,
                    0,
                    vec![0; len],
                    Layout::contiguous(len),
                )),
                "receive",
            )
            .unwrap()
    }

    fn pump(a: &mut Engine, b: &mut Engine, rounds: usize) {
        for _ in 0..rounds {
            a.progress();
            b.progress();
        }
    }

    #[test]
    fn self_send_over_loopback() {
        let clock = ManualClock::new();
        let (mut a, _) = engines(Config::default(), false, &clock);
        let s = send(&mut a, 0, 3, SendMode::Standard, b"hello");
        let r = receive(&mut a, Some(0), 8);
        a.progress();
        a.progress();
        let done = a.test(r, "test").unwrap().unwrap();
        assert_eq!(done.status.byte_count(), 5);
        assert_eq!(&done.data.unwrap()[..5], b"hello");
        assert!(a.test(s, "test").unwrap().is_some());
        assert_eq!(a.store.live(), 0);
    }

    #[test]
    fn synchronous_send_waits_for_the_match() {
        let clock = ManualClock::new();
        let (mut a, mut b) = engines(Config::default(), true, &clock);
        let s = send(&mut a, 1, 0, SendMode::Synchronous, &[1, 2, 3]);
        pump(&mut a, &mut b, 4);
        assert!(a.test(s, "test").unwrap().is_none());
        assert_eq!(b.statistics().unexpected_messages, 1);

        let r = receive(&mut b, Some(0), 3);
        pump(&mut a, &mut b, 4);
        assert!(b.test(r, "test").unwrap().is_some());
        assert!(a.test(s, "test").unwrap().is_some());
    }

    #[test]
    fn cancel_pending_send_leaves_no_sequence_gap() {
        let clock = ManualClock::new();
        let (mut a, mut b) = engines(Config::default(), false, &clock);
        let cancelled = send(&mut a, 1, 0, SendMode::Standard, &[9]);
        a.cancel(cancelled).unwrap();
        let status = a.test(cancelled, "test").unwrap().unwrap().status;
        assert!(status.is_cancelled());

        let s = send(&mut a, 1, 0, SendMode::Standard, &[7]);
        let r = receive(&mut b, Some(0), 1);
        pump(&mut a, &mut b, 3);
        assert_eq!(b.test(r, "test").unwrap().unwrap().data, Some(vec![7]));
        assert!(a.test(s, "test").unwrap().is_some());
    }

    #[test]
    fn unanswered_fragments_exhaust_retransmissions() {
        let clock = ManualClock::new();
        let config = Config::builder()
            .retransmit_base(Duration::from_millis(10))
            .max_retransmit_power(2)
            .build();
        let (mut a, _silent) = engines(config, true, &clock);
        let s = send(&mut a, 1, 0, SendMode::Standard, &[1]);
        a.progress();
        for _ in 0..3 {
            clock.advance(Duration::from_secs(1));
            a.progress();
        }
        let err = a.test(s, "test").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::RetransmitExhausted);
        let stats = a.statistics();
        assert_eq!(stats.frames_sent, 3);
        assert_eq!(stats.retransmissions, 2);
        assert_eq!(stats.failed_operations, 1);
        assert_eq!(stats.retained_fragments, 0);
    }

    #[test]
    fn buffered_send_completes_locally_and_returns_its_space() {
        let clock = ManualClock::new();
        let config = Config::builder().buffer_size(4).build();
        let (mut a, mut b) = engines(config, true, &clock);
        let s = send(&mut a, 1, 0, SendMode::Buffered, &[1, 2, 3]);
        assert!(a.try_take(s, "test").unwrap().is_some());
        assert_eq!(a.buffer_in_use(), 3);

        let err = a
            .post(
                Operation::Send(SendOp::new(1, 0, 0, SendMode::Buffered, vec![0; 2].into())),
                "send",
            )
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Buffer);

        pump(&mut a, &mut b, 3);
        assert_eq!(a.buffer_in_use(), 0);
    }

    #[test]
    fn descriptor_pool_exhaustion_is_retryable() {
        let clock = ManualClock::new();
        let config = Config::builder()
            .request_pool_initial(1)
            .request_pool_grow_by(1)
            .max_requests(2)
            .build();
        let (mut a, _) = engines(config, false, &clock);
        receive(&mut a, None, 1);
        receive(&mut a, None, 1);
        let err = a
            .post(
                Operation::Receive(ReceiveOp::new(None, None, 0, vec![0], Layout::contiguous(1))),
                "receive",
            )
            .map(|_| ())
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn unknown_destination_has_no_path() {
        let clock = ManualClock::new();
        let (mut a, _) = engines(Config::default(), false, &clock);
        let err = a
            .post(
                Operation::Send(SendOp::new(5, 0, 0, SendMode::Standard, vec![0].into())),
                "send",
            )
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NoPath);
        assert_eq!(a.store.live(), 0);
    }
}
