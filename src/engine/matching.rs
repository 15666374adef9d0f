//! Matching engine
//!
//! Incoming messages are put in sequence per (context, source) before they may match, so
//! two messages from one sender on one communicator are always matched in the order they
//! were sent. A fragment of a message whose predecessor has not been seen yet waits in the
//! ahead-of-sequence queue.
//!
//! A sequenced message either finds a posted receive (the earliest posted compatible one,
//! specific or wildcard) or joins the unexpected queue, where a later receive will find it.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::trace;

use super::store::Handle;
use crate::wire::DataHeader;
use crate::{ContextId, ProcessId, Tag};

/// What identifies a message for matching
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Envelope {
    pub context: ContextId,
    pub source: ProcessId,
    pub tag: Tag,
    pub msg_seq: u64,
    pub msg_len: u64,
    pub flags: u32,
}

/// A verified data fragment on its way to a receive
#[derive(Clone, Debug)]
pub(crate) struct IncomingFrag {
    pub envelope: Envelope,
    pub frag_seq: u64,
    pub offset: u64,
    pub payload: Vec<u8>,
    /// Arrived over a path that needs no acknowledgements
    pub reliable: bool,
}

impl IncomingFrag {
    pub fn new(header: &DataHeader, payload: Vec<u8>, reliable: bool) -> Self {
        IncomingFrag {
            envelope: Envelope {
                context: header.context,
                source: header.src,
                tag: header.tag,
                msg_seq: header.msg_seq,
                msg_len: u64::from(header.msg_len),
                flags: header.flags,
            },
            frag_seq: header.frag_seq,
            offset: header.offset,
            payload,
            reliable,
        }
    }
}

/// A sequenced message no receive has claimed yet.
#[derive(Debug)]
pub(crate) struct UnexpectedMessage {
    pub envelope: Envelope,
    pub frags: Vec<IncomingFrag>,
    arrival: u64,
}

/// Where a fragment went.
#[derive(Debug)]
pub(crate) enum Routed {
    /// Write the fragment into this receive.
    Deliver {
        request: Handle,
        frag: IncomingFrag,
        /// The fragment's message matched a posted receive just now.
        newly_matched: bool,
    },
    /// A new message joined the unexpected queue.
    Unexpected(Envelope),
    /// The fragment's message was already completed.
    Stray(Envelope),
}

type Key = (ContextId, ProcessId);

#[derive(Debug)]
struct Posted {
    request: Handle,
    tag: Option<Tag>,
    post_seq: u64,
}

fn tag_matches(wanted: Option<Tag>, tag: Tag) -> bool {
    wanted.map_or(true, |t| t == tag)
}

#[derive(Default)]
pub(crate) struct MatchingEngine {
    posted_specific: HashMap<Key, VecDeque<Posted>>,
    posted_wildcard: HashMap<ContextId, VecDeque<Posted>>,
    unexpected: HashMap<Key, VecDeque<UnexpectedMessage>>,
    ahead_of_sequence: HashMap<Key, BTreeMap<u64, Vec<IncomingFrag>>>,
    in_progress: HashMap<(ContextId, ProcessId, u64), Handle>,
    next_expected: HashMap<Key, u64>,
    next_post: u64,
    next_arrival: u64,
}

impl MatchingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route an arriving fragment, appending the outcome for it and for any held fragments
    /// it releases to `out`.
    pub fn arrive(&mut self, frag: IncomingFrag, out: &mut Vec<Routed>) {
        let key = (frag.envelope.context, frag.envelope.source);
        let next = *self.next_expected.entry(key).or_insert(1);
        let msg_seq = frag.envelope.msg_seq;
        if msg_seq < next {
            self.route_sequenced(frag, out);
        } else if msg_seq > next {
            trace!(context = key.0, source = key.1, msg_seq, next, "ahead of sequence");
            self.ahead_of_sequence
                .entry(key)
                .or_default()
                .entry(msg_seq)
                .or_default()
                .push(frag);
        } else {
            self.sequence(key, vec![frag], out);
            loop {
                let next = self.next_expected.get(&key).copied().unwrap_or(1);
                let held = self
                    .ahead_of_sequence
                    .get_mut(&key)
                    .and_then(|held| held.remove(&next));
                match held {
                    Some(frags) => self.sequence(key, frags, out),
                    None => break,
                }
            }
            if self
                .ahead_of_sequence
                .get(&key)
                .map_or(false, BTreeMap::is_empty)
            {
                self.ahead_of_sequence.remove(&key);
            }
        }
    }

    /// Admit the next message of `key`, made of `frags` (all of one message, at least one).
    fn sequence(&mut self, key: Key, frags: Vec<IncomingFrag>, out: &mut Vec<Routed>) {
        let Some(envelope) = frags.first().map(|f| f.envelope) else {
            return;
        };
        *self.next_expected.entry(key).or_insert(1) += 1;
        match self.take_posted(&envelope) {
            Some(request) => {
                trace!(
                    context = envelope.context,
                    source = envelope.source,
                    tag = envelope.tag,
                    msg_seq = envelope.msg_seq,
                    "matched posted receive"
                );
                self.in_progress.insert(
                    (envelope.context, envelope.source, envelope.msg_seq),
                    request,
                );
                for (i, frag) in frags.into_iter().enumerate() {
                    out.push(Routed::Deliver {
                        request,
                        frag,
                        newly_matched: i == 0,
                    });
                }
            }
            None => {
                trace!(
                    context = envelope.context,
                    source = envelope.source,
                    tag = envelope.tag,
                    msg_seq = envelope.msg_seq,
                    "unexpected message"
                );
                let arrival = self.next_arrival;
                self.next_arrival += 1;
                self.unexpected
                    .entry(key)
                    .or_default()
                    .push_back(UnexpectedMessage {
                        envelope,
                        frags,
                        arrival,
                    });
                out.push(Routed::Unexpected(envelope));
            }
        }
    }

    /// A fragment of a message that has already been sequenced.
    fn route_sequenced(&mut self, frag: IncomingFrag, out: &mut Vec<Routed>) {
        let env = frag.envelope;
        if let Some(&request) = self.in_progress.get(&(env.context, env.source, env.msg_seq)) {
            out.push(Routed::Deliver {
                request,
                frag,
                newly_matched: false,
            });
            return;
        }
        let message = self
            .unexpected
            .get_mut(&(env.context, env.source))
            .and_then(|queue| queue.iter_mut().find(|m| m.envelope.msg_seq == env.msg_seq));
        match message {
            Some(message) => message.frags.push(frag),
            None => out.push(Routed::Stray(env)),
        }
    }

    /// Remove and return the earliest posted receive compatible with `envelope`.
    fn take_posted(&mut self, envelope: &Envelope) -> Option<Handle> {
        let key = (envelope.context, envelope.source);
        let find = |queue: &VecDeque<Posted>| {
            queue
                .iter()
                .position(|p| tag_matches(p.tag, envelope.tag))
                .map(|i| (i, queue[i].post_seq))
        };
        let specific = self.posted_specific.get(&key).and_then(find);
        let wildcard = self.posted_wildcard.get(&envelope.context).and_then(find);
        let use_specific = match (specific, wildcard) {
            (Some((_, s)), Some((_, w))) => s <= w,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return None,
        };
        if use_specific {
            let (i, _) = specific?;
            let queue = self.posted_specific.get_mut(&key)?;
            let posted = queue.remove(i);
            if queue.is_empty() {
                self.posted_specific.remove(&key);
            }
            posted.map(|p| p.request)
        } else {
            let (i, _) = wildcard?;
            let queue = self.posted_wildcard.get_mut(&envelope.context)?;
            let posted = queue.remove(i);
            if queue.is_empty() {
                self.posted_wildcard.remove(&envelope.context);
            }
            posted.map(|p| p.request)
        }
    }

    fn find_unexpected(
        &self,
        source: Option<ProcessId>,
        tag: Option<Tag>,
        context: ContextId,
    ) -> Option<(Key, usize)> {
        match source {
            Some(source) => {
                let key = (context, source);
                self.unexpected
                    .get(&key)?
                    .iter()
                    .position(|m| tag_matches(tag, m.envelope.tag))
                    .map(|i| (key, i))
            }
            None => self
                .unexpected
                .iter()
                .filter(|(key, _)| key.0 == context)
                .filter_map(|(key, queue)| {
                    queue
                        .iter()
                        .position(|m| tag_matches(tag, m.envelope.tag))
                        .map(|i| (queue[i].arrival, *key, i))
                })
                .min_by_key(|(arrival, _, _)| *arrival)
                .map(|(_, key, i)| (key, i)),
        }
    }

    /// Post a receive. If an unexpected message matches it is handed back and the receive
    /// is not queued.
    pub fn post(
        &mut self,
        request: Handle,
        source: Option<ProcessId>,
        tag: Option<Tag>,
        context: ContextId,
    ) -> Option<UnexpectedMessage> {
        if let Some((key, i)) = self.find_unexpected(source, tag, context) {
            let queue = self.unexpected.get_mut(&key)?;
            let message = queue.remove(i);
            if queue.is_empty() {
                self.unexpected.remove(&key);
            }
            if let Some(message) = &message {
                let env = message.envelope;
                self.in_progress
                    .insert((env.context, env.source, env.msg_seq), request);
            }
            return message;
        }
        let posted = Posted {
            request,
            tag,
            post_seq: self.next_post,
        };
        self.next_post += 1;
        match source {
            Some(source) => self
                .posted_specific
                .entry((context, source))
                .or_default()
                .push_back(posted),
            None => self
                .posted_wildcard
                .entry(context)
                .or_default()
                .push_back(posted),
        }
        None
    }

    /// Envelope of the message a receive with these arguments would match right now.
    pub fn probe(
        &self,
        source: Option<ProcessId>,
        tag: Option<Tag>,
        context: ContextId,
    ) -> Option<Envelope> {
        let (key, i) = self.find_unexpected(source, tag, context)?;
        self.unexpected.get(&key)?.get(i).map(|m| m.envelope)
    }

    /// Withdraw a posted receive. Returns false if it has already matched.
    pub fn cancel(&mut self, request: Handle) -> bool {
        for queue in self
            .posted_specific
            .values_mut()
            .chain(self.posted_wildcard.values_mut())
        {
            if let Some(i) = queue.iter().position(|p| p.request == request) {
                queue.remove(i);
                return true;
            }
        }
        false
    }

    /// Whether a message has been sequenced and claimed by a receive.
    pub fn is_matched(&self, context: ContextId, source: ProcessId, msg_seq: u64) -> bool {
        let key = (context, source);
        msg_seq < self.next_expected.get(&key).copied().unwrap_or(1)
            && !self
                .unexpected
                .get(&key)
                .map_or(false, |queue| queue.iter().any(|m| m.envelope.msg_seq == msg_seq))
    }

    /// The receive of `envelope`'s message is complete.
    pub fn finish(&mut self, envelope: &Envelope) {
        self.in_progress
            .remove(&(envelope.context, envelope.source, envelope.msg_seq));
    }

    /// Receives posted and not yet matched
    pub fn posted(&self) -> usize {
        self.posted_specific
            .values()
            .chain(self.posted_wildcard.values())
            .map(VecDeque::len)
            .sum()
    }

    /// Messages waiting for a receive
    pub fn unexpected(&self) -> usize {
        self.unexpected.values().map(VecDeque::len).sum()
    }
}
