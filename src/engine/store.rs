//! Request descriptor store
//!
//! Descriptors live in a slab of slots addressed by [`Handle`]s. A handle carries the
//! generation of its slot; releasing a descriptor bumps the generation so a handle kept
//! past release no longer resolves. Free slots are recycled first. The slab grows in steps
//! up to a configured limit, after which allocation fails instead of blocking.

use tracing::trace;

use super::Operation;
use crate::error::Error;
use crate::point_to_point::Status;

/// Generation-checked reference to a request descriptor
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

/// Lifecycle state of a descriptor
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum RequestState {
    /// Allocated, never started
    Inited,
    /// Started and not finished
    Incomplete,
    /// Finished, outcome waiting to be consumed
    Complete,
    /// A persistent request between uses
    Inactive,
}

/// The single queue a descriptor is visible in
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum QueueRole {
    Unqueued,
    PendingSend,
    FragsToSend,
    FragsToAck,
    PostedReceive,
    MatchedReceive,
    Done,
}

/// What a finished operation hands back to its owner
#[derive(Clone, Debug)]
pub(crate) struct Completion {
    pub status: Status,
    /// Receive staging image, to be copied into the user's buffer
    pub data: Option<Vec<u8>>,
}

pub(crate) struct Descriptor {
    pub op: Operation,
    pub state: RequestState,
    pub role: QueueRole,
    pub persistent: bool,
    /// The engine no longer needs the descriptor.
    pub engine_done: bool,
    /// The owner has consumed the outcome.
    pub user_done: bool,
    outcome: Option<Result<Completion, Error>>,
}

impl Descriptor {
    pub fn has_outcome(&self) -> bool {
        self.outcome.is_some()
    }

    /// Transition into `role`, checking the transition is one the engine makes.
    pub fn move_to(&mut self, role: QueueRole) {
        use QueueRole::*;
        debug_assert!(
            matches!(
                (self.role, role),
                (Unqueued, PendingSend)
                    | (Unqueued, PostedReceive)
                    | (Unqueued, MatchedReceive)
                    | (PendingSend, FragsToSend)
                    | (FragsToSend, FragsToAck)
                    | (PostedReceive, MatchedReceive)
                    | (_, Done)
                    | (Done, PendingSend)
                    | (Done, PostedReceive)
                    | (Done, MatchedReceive)
            ),
            "illegal queue transition {:?} -> {:?}",
            self.role,
            role
        );
        self.role = role;
    }
}

struct Slot {
    generation: u32,
    descriptor: Option<Descriptor>,
}

/// The pool cannot hand out more descriptors.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Exhausted;

pub(crate) struct DescriptorStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    grow_by: usize,
    limit: usize,
    live: usize,
}

impl DescriptorStore {
    pub fn new(initial: usize, grow_by: usize, limit: usize) -> Self {
        let mut store = DescriptorStore {
            slots: Vec::new(),
            free: Vec::new(),
            grow_by: grow_by.max(1),
            limit,
            live: 0,
        };
        store.add_slots(initial.min(limit));
        store
    }

    pub fn set_limits(&mut self, grow_by: usize, limit: usize) {
        self.grow_by = grow_by.max(1);
        self.limit = limit;
    }

    fn add_slots(&mut self, n: usize) {
        let start = self.slots.len();
        self.slots.extend((0..n).map(|_| Slot {
            generation: 0,
            descriptor: None,
        }));
        // Lowest index on top so slots are reused in order.
        self.free.extend((start..start + n).rev().map(|i| i as u32));
    }

    pub fn allocate(&mut self, op: Operation, persistent: bool) -> Result<Handle, Exhausted> {
        if self.live >= self.limit {
            return Err(Exhausted);
        }
        if self.free.is_empty() {
            let room = self.limit.saturating_sub(self.slots.len());
            if room == 0 {
                return Err(Exhausted);
            }
            trace!(by = self.grow_by.min(room), "growing descriptor pool");
            self.add_slots(self.grow_by.min(room));
        }
        let index = self.free.pop().ok_or(Exhausted)?;
        let slot = &mut self.slots[index as usize];
        slot.descriptor = Some(Descriptor {
            op,
            state: if persistent {
                RequestState::Inactive
            } else {
                RequestState::Inited
            },
            role: QueueRole::Unqueued,
            persistent,
            engine_done: true,
            user_done: true,
            outcome: None,
        });
        self.live += 1;
        Ok(Handle {
            index,
            generation: slot.generation,
        })
    }

    pub fn get(&self, handle: Handle) -> Option<&Descriptor> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.descriptor.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Descriptor> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.descriptor.as_mut()
    }

    /// Return the descriptor's slot to the free list.
    pub fn release(&mut self, handle: Handle) -> Option<Descriptor> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let descriptor = slot.descriptor.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Some(descriptor)
    }

    /// Move a descriptor into the started state, clearing any previous outcome.
    pub fn mark_started(&mut self, handle: Handle) -> bool {
        match self.get_mut(handle) {
            Some(d) => {
                d.state = RequestState::Incomplete;
                d.engine_done = false;
                d.user_done = false;
                d.outcome = None;
                true
            }
            None => false,
        }
    }

    /// Record the outcome of an operation. Persistent requests become inactive.
    pub fn mark_complete(&mut self, handle: Handle, outcome: Result<Completion, Error>) -> bool {
        match self.get_mut(handle) {
            Some(d) if d.outcome.is_none() && !d.user_done => {
                d.state = if d.persistent {
                    RequestState::Inactive
                } else {
                    RequestState::Complete
                };
                d.outcome = Some(outcome);
                true
            }
            _ => false,
        }
    }

    /// Hand the outcome to the owner, releasing the descriptor if the engine is done with it.
    pub fn take_outcome(&mut self, handle: Handle) -> Option<Result<Completion, Error>> {
        let d = self.get_mut(handle)?;
        let outcome = d.outcome.take()?;
        d.user_done = true;
        self.release_if_finished(handle);
        Some(outcome)
    }

    /// The engine is finished with the descriptor.
    pub fn finish(&mut self, handle: Handle) {
        if let Some(d) = self.get_mut(handle) {
            d.engine_done = true;
            d.move_to(QueueRole::Done);
        }
        self.release_if_finished(handle);
    }

    fn release_if_finished(&mut self, handle: Handle) {
        if let Some(d) = self.get(handle) {
            if !d.persistent && d.engine_done && d.user_done {
                self.release(handle);
            }
        }
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.descriptor.is_some())
            .map(|(index, slot)| Handle {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    pub fn live(&self) -> usize {
        self.live
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
