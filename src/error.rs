//! Error handling and error classes
//!
//! Every fallible operation reports an [`Error`] that names the operation that failed. The
//! error class is available through [`Error::kind`], and [`Error::is_retryable`] tells apart
//! transient conditions (a full descriptor pool, a busy path) from failures that end the
//! operation for good.
//!
//! Internal conditions such as checksum mismatches, negative acknowledgements and duplicate
//! fragments never surface here; they are handled by retransmission. Truncation is not an
//! error either, it is reported through [`Status::is_truncated`](crate::point_to_point::Status::is_truncated).
//!
//! # Standard section(s)
//!
//! 8.3, 8.4

use std::sync::Arc;

use thiserror::Error;
use tracing::error;

use crate::transport::TransportError;
use crate::{Rank, Tag};

/// Shorthand for results with the crate's [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Set of error classes that the point-to-point engine reports.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A descriptor pool or registration limit is exhausted. Retry after making progress.
    ResourceExhausted,
    /// The path to a destination is momentarily saturated. Retry after making progress.
    Busy,
    /// A fragment was not acknowledged after the maximum number of transmissions
    RetransmitExhausted,
    /// A transport driver failed
    Transport,
    /// No transport can reach the destination
    NoPath,
    /// Invalid rank
    Rank,
    /// Invalid tag argument
    Tag,
    /// Invalid buffer argument, or the attached buffer is too small
    Buffer,
    /// Invalid count argument
    Count,
    /// Invalid communicator argument
    Comm,
    /// Invalid request handle
    Request,
    /// Invalid argument of some other kind
    Arg,
}

/// An error raised by a point-to-point operation.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The request descriptor pool has reached its configured limit.
    #[error("{op}: request descriptor pool exhausted")]
    ResourceExhausted {
        /// Failing operation
        op: &'static str,
    },
    /// A transport refused to register more memory.
    #[error("{op}: memory registration limit reached on transport `{transport}`")]
    RegistrationLimit {
        /// Failing operation
        op: &'static str,
        /// Name of the refusing driver
        transport: &'static str,
    },
    /// Too many messages are queued for a destination.
    #[error("{op}: send queue to rank {rank} is full")]
    Busy {
        /// Failing operation
        op: &'static str,
        /// Destination rank
        rank: Rank,
    },
    /// A fragment went unacknowledged through every allowed transmission.
    #[error("{op}: no acknowledgement from rank {rank} after {attempts} transmissions")]
    RetransmitExhausted {
        /// Failing operation
        op: &'static str,
        /// Peer rank
        rank: Rank,
        /// Number of transmissions attempted
        attempts: u32,
    },
    /// A transport driver reported a failure that is not back-pressure.
    #[error("{op}: transport `{transport}` failed")]
    Transport {
        /// Failing operation
        op: &'static str,
        /// Name of the failing driver
        transport: &'static str,
        /// Driver error
        #[source]
        source: Arc<TransportError>,
    },
    /// No registered transport can reach the destination.
    #[error("{op}: no transport can reach rank {rank}")]
    NoPath {
        /// Failing operation
        op: &'static str,
        /// Destination rank
        rank: Rank,
    },
    /// The rank is outside the communicator.
    #[error("{op}: invalid rank {rank}")]
    InvalidRank {
        /// Failing operation
        op: &'static str,
        /// Offending rank
        rank: Rank,
    },
    /// The tag is negative or beyond the tag upper bound.
    #[error("{op}: invalid tag {tag}")]
    InvalidTag {
        /// Failing operation
        op: &'static str,
        /// Offending tag
        tag: Tag,
    },
    /// The attached buffer cannot hold a buffered send.
    #[error("{op}: attached buffer has {available} bytes free, {needed} needed")]
    BufferTooSmall {
        /// Failing operation
        op: &'static str,
        /// Bytes the send needs
        needed: usize,
        /// Bytes currently free
        available: usize,
    },
    /// A buffer does not cover the extent of its datatype.
    #[error("{op}: buffer of {len} bytes does not cover a datatype extent of {extent} bytes")]
    InvalidBuffer {
        /// Failing operation
        op: &'static str,
        /// Buffer length in bytes
        len: usize,
        /// Required extent in bytes
        extent: usize,
    },
    /// A count does not fit the wire format or is negative.
    #[error("{op}: invalid count {count}")]
    InvalidCount {
        /// Failing operation
        op: &'static str,
        /// Offending count
        count: i64,
    },
    /// No more context ids can be allocated.
    #[error("{op}: communicator context ids exhausted")]
    ContextExhausted {
        /// Failing operation
        op: &'static str,
    },
    /// The request handle does not refer to a live descriptor.
    #[error("{op}: stale or unknown request handle")]
    InvalidRequest {
        /// Failing operation
        op: &'static str,
    },
    /// Some other argument is invalid.
    #[error("{op}: {reason}")]
    InvalidArgument {
        /// Failing operation
        op: &'static str,
        /// What is wrong
        reason: String,
    },
}

impl Error {
    /// The error class
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ResourceExhausted { .. } | Error::RegistrationLimit { .. } => {
                ErrorKind::ResourceExhausted
            }
            Error::Busy { .. } => ErrorKind::Busy,
            Error::RetransmitExhausted { .. } => ErrorKind::RetransmitExhausted,
            Error::Transport { .. } => ErrorKind::Transport,
            Error::NoPath { .. } => ErrorKind::NoPath,
            Error::InvalidRank { .. } => ErrorKind::Rank,
            Error::InvalidTag { .. } => ErrorKind::Tag,
            Error::BufferTooSmall { .. } | Error::InvalidBuffer { .. } => ErrorKind::Buffer,
            Error::InvalidCount { .. } => ErrorKind::Count,
            Error::ContextExhausted { .. } => ErrorKind::Comm,
            Error::InvalidRequest { .. } => ErrorKind::Request,
            Error::InvalidArgument { .. } => ErrorKind::Arg,
        }
    }

    /// Whether the same call may succeed once the engine has made progress.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::ResourceExhausted | ErrorKind::Busy)
    }

    /// The operation that failed
    pub fn operation(&self) -> &'static str {
        match *self {
            Error::ResourceExhausted { op }
            | Error::RegistrationLimit { op, .. }
            | Error::Busy { op, .. }
            | Error::RetransmitExhausted { op, .. }
            | Error::Transport { op, .. }
            | Error::NoPath { op, .. }
            | Error::InvalidRank { op, .. }
            | Error::InvalidTag { op, .. }
            | Error::BufferTooSmall { op, .. }
            | Error::InvalidBuffer { op, .. }
            | Error::InvalidCount { op, .. }
            | Error::ContextExhausted { op }
            | Error::InvalidRequest { op }
            | Error::InvalidArgument { op, .. } => op,
        }
    }
}

/// What happens when an operation fails with a non-retryable error.
///
/// # Standard section(s)
///
/// 8.3
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ErrorHandler {
    /// Return the error to the caller.
    #[default]
    Return,
    /// Log the error and abort the process.
    Abort,
}

impl ErrorHandler {
    /// Apply the handler to an error that is about to reach the caller.
    pub(crate) fn handle(self, err: Error) -> Error {
        if self == ErrorHandler::Abort && !err.is_retryable() {
            error!(op = err.operation(), "fatal error, aborting: {}", err);
            std::process::abort();
        }
        err
    }
}
