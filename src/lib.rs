//! Point-to-point message passing engine
//!
//! This crate implements the point-to-point layer of an [MPI][MPI]-style runtime: it turns
//! "send these bytes from rank A to rank B with tag T on communicator C" into data that is
//! delivered exactly once, in order and correctly reassembled, over transports that may lose,
//! duplicate, reorder or corrupt frames.
//!
//! [MPI]: http://www.mpi-forum.org
//!
//! # Usage
//!
//! Every process builds a [`Universe`](environment::Universe) with the transports that reach
//! its peers and talks to them through the world communicator:
//!
//! ```
//! use mpi_ptp::environment::Universe;
//! use mpi_ptp::traits::*;
//! use mpi_ptp::transport::SharedMemoryFabric;
//!
//! let fabric = SharedMemoryFabric::new(2);
//! let a = Universe::builder(0, 2)
//!     .transport(fabric.endpoint(0).unwrap())
//!     .build()
//!     .unwrap();
//! let b = Universe::builder(1, 2)
//!     .transport(fabric.endpoint(1).unwrap())
//!     .build()
//!     .unwrap();
//!
//! let msg = vec![4.0f64, 8.0, 15.0];
//! let a_world = a.world();
//! let sent = a_world.process_at_rank(1).immediate_send(&msg[..]).unwrap();
//!
//! let b_world = b.world();
//! let (received, status) = b_world.any_process().receive_vec::<f64>().unwrap();
//! sent.wait().unwrap();
//! assert_eq!(received, msg);
//! assert_eq!(status.source_rank(), 0);
//! ```
//!
//! Nothing runs in the background. Blocking calls make progress until they finish; with
//! several universes in one thread, as above, each one only moves when it is called.
//!
//! # Features
//!
//! - **Point to point communication**:
//!   - standard, buffered, synchronous and ready mode send in blocking, non-blocking and
//!     persistent variants
//!   - receive in blocking, non-blocking and persistent variants
//!   - send-receive
//!   - probe
//!   - cancellation
//! - **Communicators**: the world communicator and duplicates of it
//! - **Datatypes**: plain-old-data Rust types, contiguous, vector and indexed layouts
//! - **Transports**: shared memory, UDP, TCP, a fault injector, and a trait for more
//!
//! Not supported: collective operations, process management, one-sided communication and
//! parallel I/O.
//!
//! The sub-modules contain a more detailed description of which features are and are not
//! supported.
//!
//! # Logging
//!
//! The engine logs through [`tracing`](https://docs.rs/tracing). Install a subscriber to see
//! lifecycle events at `debug` and `trace` level and anomalies at `warn`.

#![warn(missing_docs)]

pub mod clock;
pub mod datatype;
pub mod engine;
pub mod environment;
pub mod error;
pub mod point_to_point;
pub mod request;
pub mod topology;
pub mod transport;
pub mod wire;

/// Re-exports all traits.
pub mod traits {
    pub use crate::datatype::traits::*;
    pub use crate::engine::lock::ProgressLock;
    pub use crate::point_to_point::traits::*;
    pub use crate::topology::traits::*;
}

pub use crate::engine::lock::{Locked, Unlocked};
pub use crate::engine::Statistics;
pub use crate::environment::{Threading, Universe};
pub use crate::error::{Error, ErrorKind};

/// Identifies a certain process within a communicator.
pub type Rank = i32;
/// Can be used to tag messages on the sender side and match on the receiver side.
pub type Tag = i32;
/// Encodes number of values in multi-value messages.
pub type Count = i32;
/// Separates the messages of one communicator from those of every other.
pub type ContextId = u32;
/// Identifies a process on the wire.
pub type ProcessId = u32;
