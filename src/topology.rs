//! Organizing processes as communicators
//!
//! All processes initially partaking in the computation are organized in a context called the
//! 'world communicator' which is available as a property of the
//! [`Universe`](crate::environment::Universe). Duplicating a communicator gives the same
//! processes a fresh context: messages sent on one communicator never match receives posted
//! on another. Processes are addressed via their `Rank` within a communicator. This
//! information is encapsulated in a [`Process`].
//!
//! # Standard section(s)
//!
//! 6.4
//!
//! # Unfinished features
//!
//! - **6.3**: Group management
//! - **6.4.2**: Constructors other than `MPI_Comm_dup()`
//! - **6.6**: Inter-communication
//! - **7**: Process topologies

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::engine::lock::{ProgressLock, Unlocked};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::{ContextId, ProcessId, Rank, Tag};

/// Topology traits
pub mod traits {
    pub use super::AsCommunicator;
}

/// Something that has a communicator associated with it
pub trait AsCommunicator {
    /// How the communicator's engine is guarded
    type Lock: ProgressLock;
    /// Returns the associated communicator.
    fn as_communicator(&self) -> &Communicator<Self::Lock>;
}

/// A group of processes together with a private matching context
///
/// # Standard section(s)
///
/// 6.4
pub struct Communicator<L: ProgressLock = Unlocked> {
    lock: Arc<L>,
    context: ContextId,
    rank: Rank,
    size: Rank,
}

impl<L: ProgressLock> Clone for Communicator<L> {
    fn clone(&self) -> Self {
        Communicator {
            lock: Arc::clone(&self.lock),
            context: self.context,
            rank: self.rank,
            size: self.size,
        }
    }
}

impl<L: ProgressLock> fmt::Debug for Communicator<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("context", &self.context)
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl<L: ProgressLock> Communicator<L> {
    pub(crate) fn world(lock: Arc<L>, rank: Rank, size: Rank) -> Self {
        Communicator {
            lock,
            context: 0,
            rank,
            size,
        }
    }

    /// Number of processes in this communicator
    ///
    /// # Standard section(s)
    ///
    /// 6.4.1
    pub fn size(&self) -> Rank {
        self.size
    }

    /// The `Rank` that identifies the calling process within this communicator
    ///
    /// # Standard section(s)
    ///
    /// 6.4.1
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// The context messages on this communicator are matched in
    pub fn context_id(&self) -> ContextId {
        self.context
    }

    /// Duplicate a communicator.
    ///
    /// The duplicate contains the same processes in a new context. Context ids are handed
    /// out in order, so every process must duplicate its communicators in the same order.
    ///
    /// # Standard section(s)
    ///
    /// 6.4.2
    pub fn duplicate(&self) -> Result<Communicator<L>> {
        let context = self.lock.with(Engine::allocate_context)?;
        debug!(from = self.context, context, "communicator duplicated");
        Ok(Communicator {
            lock: Arc::clone(&self.lock),
            context,
            rank: self.rank,
            size: self.size,
        })
    }

    /// A `Process` for the calling process
    pub fn this_process(&self) -> Process<'_, L> {
        self.process_at_rank(self.rank)
    }

    /// A `Process` for the process with rank `r` in this communicator.
    ///
    /// The rank is checked when the process is used in an operation.
    pub fn process_at_rank(&self, r: Rank) -> Process<'_, L> {
        Process { comm: self, rank: r }
    }

    /// An `AnyProcess` for this communicator
    pub fn any_process(&self) -> AnyProcess<'_, L> {
        AnyProcess { comm: self }
    }

    pub(crate) fn lock(&self) -> &L {
        &self.lock
    }

    pub(crate) fn shared_lock(&self) -> Arc<L> {
        Arc::clone(&self.lock)
    }

    /// Pass `err` through the error handler.
    pub(crate) fn raise(&self, err: Error) -> Error {
        self.lock.with(|engine| engine.raise(err))
    }

    /// The process behind rank `rank`, if the rank is part of the communicator.
    pub(crate) fn process_id(&self, op: &'static str, rank: Rank) -> Result<ProcessId> {
        if rank < 0 || rank >= self.size {
            return Err(self.raise(Error::InvalidRank { op, rank }));
        }
        Ok(rank as ProcessId)
    }

    pub(crate) fn check_tag(&self, op: &'static str, tag: Tag) -> Result<Tag> {
        if tag < 0 {
            return Err(self.raise(Error::InvalidTag { op, tag }));
        }
        Ok(tag)
    }
}

impl<L: ProgressLock> AsCommunicator for Communicator<L> {
    type Lock = L;
    fn as_communicator(&self) -> &Communicator<L> {
        self
    }
}

/// Identifies a process by its `Rank` within a certain communicator.
pub struct Process<'a, L: ProgressLock = Unlocked> {
    comm: &'a Communicator<L>,
    rank: Rank,
}

impl<'a, L: ProgressLock> Process<'a, L> {
    /// The process rank
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Whether this is the calling process
    pub fn is_self(&self) -> bool {
        self.rank == self.comm.rank
    }
}

impl<'a, L: ProgressLock> AsCommunicator for Process<'a, L> {
    type Lock = L;
    fn as_communicator(&self) -> &Communicator<L> {
        self.comm
    }
}

/// Identifies an arbitrary process that is a member of a certain communicator, e.g. for use
/// as a `Source` in point to point communication.
pub struct AnyProcess<'a, L: ProgressLock = Unlocked> {
    comm: &'a Communicator<L>,
}

impl<'a, L: ProgressLock> AsCommunicator for AnyProcess<'a, L> {
    type Lock = L;
    fn as_communicator(&self) -> &Communicator<L> {
        self.comm
    }
}

#[cfg(test)]
mod tests {
    use crate::environment::Universe;
    use crate::error::ErrorKind;

    #[test]
    fn duplicates_get_fresh_contexts() {
        let universe = Universe::builder(1, 3).build().unwrap();
        let world = universe.world();
        assert_eq!((world.rank(), world.size(), world.context_id()), (1, 3, 0));
        let a = world.duplicate().unwrap();
        let b = a.duplicate().unwrap();
        assert_eq!(a.context_id(), 1);
        assert_eq!(b.context_id(), 2);
        assert_eq!(b.rank(), 1);
    }

    #[test]
    fn ranks_outside_the_communicator_are_rejected() {
        let universe = Universe::builder(0, 2).build().unwrap();
        let world = universe.world();
        assert_eq!(world.process_id("send", 1).unwrap(), 1);
        let err = world.process_id("send", 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rank);
        let err = world.check_tag("send", -1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Tag);
        assert!(world.this_process().is_self());
    }
}
