//! Point to point communication
//!
//! Endpoints of communication are described by types that implement the `Source` and
//! `Destination` trait. Communication operations are implemented as default methods on those
//! traits.
//!
//! Blocking operations make progress until they finish and retry transient conditions (a full
//! descriptor pool, a saturated path) on their own. Immediate operations make progress once
//! and hand back a [`Request`]; they report transient conditions as retryable errors.
//!
//! Operations without a tag send with tag `0` and receive with any tag.
//!
//! # Standard section(s)
//!
//! 3.2, 3.4, 3.7, 3.8, 3.9, 3.10
//!
//! # Unfinished features
//!
//! - **3.8.2**: Matched probe, `MPI_Mprobe()`, `MPI_Mrecv()`

use std::mem;
use std::sync::Arc;
use std::thread;

use conv::ConvUtil;
use tracing::trace;

use crate::datatype::traits::*;
use crate::engine::lock::ProgressLock;
use crate::engine::store::Handle;
use crate::engine::{Engine, Operation, ReceiveOp, SendMode, SendOp};
use crate::error::{Error, Result};
use crate::request::{PersistentRequest, Request};
use crate::topology::{AnyProcess, AsCommunicator, Communicator, Process};
use crate::{Count, Rank, Tag};

/// Point to point communication traits
pub mod traits {
    pub use super::{Destination, Source};
}

/// Run `attempt` until it succeeds or fails for good, making progress between attempts.
pub(crate) fn retrying<L, T, F>(lock: &L, mut attempt: F) -> Result<T>
where
    L: ProgressLock,
    F: FnMut(&mut Engine) -> Result<T>,
{
    loop {
        match lock.with(&mut attempt) {
            Err(err) if err.is_retryable() => {
                trace!(op = err.operation(), "retrying after progress: {}", err);
                lock.with(Engine::progress);
                thread::yield_now();
            }
            outcome => return outcome,
        }
    }
}

/// Whether an operation retries transient failures or hands them to the caller.
#[derive(Copy, Clone)]
enum Blocking {
    Yes,
    No,
}

/// Post `op`, retrying if blocking, and make progress once.
fn post<L: ProgressLock>(
    lock: &L,
    blocking: Blocking,
    name: &'static str,
    mut op: impl FnMut() -> Operation,
) -> Result<Handle> {
    let handle = match blocking {
        Blocking::Yes => retrying(lock, |engine| engine.post(op(), name))?,
        Blocking::No => lock.with(|engine| engine.post(op(), name))?,
    };
    lock.with(Engine::progress);
    Ok(handle)
}

/// The bytes a send carries, packed out of `buf`.
fn pack<L: ProgressLock, B: Buffer + ?Sized>(
    comm: &Communicator<L>,
    name: &'static str,
    buf: &B,
) -> Result<Arc<[u8]>> {
    let layout = buf.layout();
    let bytes = buf.as_bytes();
    if layout.extent() > bytes.len() {
        return Err(comm.raise(Error::InvalidBuffer {
            op: name,
            len: bytes.len(),
            extent: layout.extent(),
        }));
    }
    if layout.size().value_as::<u32>().is_err() {
        return Err(comm.raise(Error::InvalidCount {
            op: name,
            count: layout.size().value_as::<i64>().unwrap_or(i64::MAX),
        }));
    }
    Ok(layout.pack(bytes).into())
}

fn send_op<D, B>(
    destination: &D,
    buf: &B,
    tag: Tag,
    mode: SendMode,
    name: &'static str,
) -> Result<impl FnMut() -> Operation>
where
    D: Destination + ?Sized,
    B: Buffer + ?Sized,
{
    let comm = destination.as_communicator();
    let dest = comm.process_id(name, destination.destination_rank())?;
    let tag = comm.check_tag(name, tag)?;
    let payload = pack(comm, name, buf)?;
    let context = comm.context_id();
    Ok(move || Operation::Send(SendOp::new(dest, tag, context, mode, Arc::clone(&payload))))
}

fn send<'b, D, B>(
    destination: &D,
    buf: &'b B,
    tag: Tag,
    mode: SendMode,
    blocking: Blocking,
    name: &'static str,
) -> Result<Request<'b, D::Lock>>
where
    D: Destination + ?Sized,
    B: Buffer + ?Sized,
{
    let op = send_op(destination, buf, tag, mode, name)?;
    let comm = destination.as_communicator();
    let handle = post(comm.lock(), blocking, name, op)?;
    Ok(Request::new(comm.shared_lock(), handle, None))
}

fn send_init<'b, D, B>(
    destination: &D,
    buf: &'b B,
    tag: Tag,
    mode: SendMode,
    name: &'static str,
) -> Result<PersistentRequest<'b, D::Lock>>
where
    D: Destination + ?Sized,
    B: Buffer + ?Sized,
{
    let mut op = send_op(destination, buf, tag, mode, name)?;
    let comm = destination.as_communicator();
    let handle = comm.lock().with(|engine| engine.create(op(), true, name))?;
    Ok(PersistentRequest::new(comm.shared_lock(), handle, None))
}

/// Validate the arguments of a receive and describe the operation.
///
/// Returns the operation factory and the bytes of `buf` the received data ends up in.
fn receive_op<'b, S, B>(
    source: &S,
    buf: &'b mut B,
    tag: Option<Tag>,
    name: &'static str,
) -> Result<(impl FnMut() -> Operation, &'b mut [u8])>
where
    S: Source + ?Sized,
    B: BufferMut + ?Sized,
{
    let comm = source.as_communicator();
    let from = source
        .source_rank()
        .map(|rank| comm.process_id(name, rank))
        .transpose()?;
    let tag = tag.map(|tag| comm.check_tag(name, tag)).transpose()?;
    let layout = buf.layout();
    let bytes = buf.as_bytes_mut();
    if layout.extent() > bytes.len() {
        return Err(comm.raise(Error::InvalidBuffer {
            op: name,
            len: bytes.len(),
            extent: layout.extent(),
        }));
    }
    let staging = bytes.to_vec();
    let context = comm.context_id();
    let op = move || {
        Operation::Receive(ReceiveOp::new(
            from,
            tag,
            context,
            staging.clone(),
            layout.clone(),
        ))
    };
    Ok((op, bytes))
}

fn receive<'b, S, B>(
    source: &S,
    buf: &'b mut B,
    tag: Option<Tag>,
    blocking: Blocking,
    name: &'static str,
) -> Result<Request<'b, S::Lock>>
where
    S: Source + ?Sized,
    B: BufferMut + ?Sized,
{
    let (op, bytes) = receive_op(source, buf, tag, name)?;
    let comm = source.as_communicator();
    let handle = post(comm.lock(), blocking, name, op)?;
    Ok(Request::new(comm.shared_lock(), handle, Some(bytes)))
}

fn receive_value<S, Msg>(source: &S, tag: Option<Tag>) -> Result<(Msg, Status)>
where
    S: Source + ?Sized,
    Msg: Equivalence,
{
    // SAFETY: `Equivalence` types accept every bit pattern, zero included.
    let mut msg: Msg = unsafe { mem::zeroed() };
    let status = receive(source, &mut msg, tag, Blocking::Yes, "receive")?.wait()?;
    Ok((msg, status))
}

fn receive_vec<S, Msg>(source: &S, tag: Option<Tag>) -> Result<(Vec<Msg>, Status)>
where
    S: Source + ?Sized,
    Msg: Equivalence,
{
    let probed = probe_blocking(source, tag, "receive_vec")?;
    let size = mem::size_of::<Msg>();
    let count = if size == 0 {
        0
    } else {
        (probed.byte_count() + size - 1) / size
    };
    // SAFETY: `Equivalence` types accept every bit pattern, zero included.
    let zero: Msg = unsafe { mem::zeroed() };
    let mut msgs = vec![zero; count];
    let exact = source.as_communicator().process_at_rank(probed.source_rank());
    let status = receive(
        &exact,
        &mut msgs[..],
        Some(probed.tag()),
        Blocking::Yes,
        "receive_vec",
    )?
    .wait()?;
    Ok((msgs, status))
}

/// Make progress once and look for an unexpected message `source` would receive.
fn probe<S: Source + ?Sized>(source: &S, tag: Option<Tag>, name: &'static str) -> Result<Option<Status>> {
    let comm = source.as_communicator();
    let from = source
        .source_rank()
        .map(|rank| comm.process_id(name, rank))
        .transpose()?;
    let tag = tag.map(|tag| comm.check_tag(name, tag)).transpose()?;
    let context = comm.context_id();
    Ok(comm.lock().with(|engine| engine.probe(from, tag, context)))
}

fn probe_blocking<S: Source + ?Sized>(source: &S, tag: Option<Tag>, name: &'static str) -> Result<Status> {
    loop {
        if let Some(status) = probe(source, tag, name)? {
            return Ok(status);
        }
        thread::yield_now();
    }
}

/// Something that can be used as the source in a point to point receive operation
///
/// # Examples
///
/// - A `Process` used as a source for a receive operation will receive data only from the
/// identified process.
/// - A communicator can also be used as a source via the `AnyProcess` identifier.
///
/// # Standard section(s)
///
/// 3.2.3
pub trait Source: AsCommunicator {
    /// `Rank` that identifies the source, `None` for any process
    fn source_rank(&self) -> Option<Rank>;

    /// Probe a source for incoming messages.
    ///
    /// Makes progress until a message with tag `tag` from `&self` has arrived and returns its
    /// `Status` without receiving it. A subsequent `receive()` is not guaranteed to get this
    /// message if another thread receives first.
    ///
    /// # Standard section(s)
    ///
    /// 3.8.1
    fn probe_with_tag(&self, tag: Tag) -> Result<Status> {
        probe_blocking(self, Some(tag), "probe")
    }

    /// Probe a source for incoming messages with any tag.
    ///
    /// # Standard section(s)
    ///
    /// 3.8.1
    fn probe(&self) -> Result<Status> {
        probe_blocking(self, None, "probe")
    }

    /// Make progress once and report a message with tag `tag` that has arrived, if any.
    ///
    /// # Standard section(s)
    ///
    /// 3.8.1
    fn immediate_probe_with_tag(&self, tag: Tag) -> Result<Option<Status>> {
        probe(self, Some(tag), "immediate_probe")
    }

    /// Make progress once and report a message with any tag that has arrived, if any.
    ///
    /// # Standard section(s)
    ///
    /// 3.8.1
    fn immediate_probe(&self) -> Result<Option<Status>> {
        probe(self, None, "immediate_probe")
    }

    /// Receive a message containing a single instance of type `Msg`.
    ///
    /// # Standard section(s)
    ///
    /// 3.2.4
    fn receive_with_tag<Msg: Equivalence>(&self, tag: Tag) -> Result<(Msg, Status)> {
        receive_value(self, Some(tag))
    }

    /// Receive a message with any tag containing a single instance of type `Msg`.
    ///
    /// # Examples
    ///
    /// ```
    /// use mpi_ptp::environment::Universe;
    /// use mpi_ptp::traits::*;
    ///
    /// let universe = Universe::builder(0, 1).build().unwrap();
    /// let world = universe.world();
    /// world.this_process().immediate_send(&0.5f64).unwrap().wait().unwrap();
    /// let (x, _) = world.any_process().receive::<f64>().unwrap();
    /// assert_eq!(x, 0.5);
    /// ```
    ///
    /// # Standard section(s)
    ///
    /// 3.2.4
    fn receive<Msg: Equivalence>(&self) -> Result<(Msg, Status)> {
        receive_value(self, None)
    }

    /// Receive a message tagged `tag` into a `Buffer`.
    ///
    /// A message longer than the buffer fills it and reports
    /// [`is_truncated`](Status::is_truncated).
    ///
    /// # Standard section(s)
    ///
    /// 3.2.4
    fn receive_into_with_tag<Buf: BufferMut + ?Sized>(&self, buf: &mut Buf, tag: Tag) -> Result<Status> {
        receive(self, buf, Some(tag), Blocking::Yes, "receive")?.wait()
    }

    /// Receive a message with any tag into a `Buffer`.
    ///
    /// # Standard section(s)
    ///
    /// 3.2.4
    fn receive_into<Buf: BufferMut + ?Sized>(&self, buf: &mut Buf) -> Result<Status> {
        receive(self, buf, None, Blocking::Yes, "receive")?.wait()
    }

    /// Receive a message tagged `tag` containing multiple instances of type `Msg` into a `Vec`.
    ///
    /// # Standard section(s)
    ///
    /// 3.2.4
    fn receive_vec_with_tag<Msg: Equivalence>(&self, tag: Tag) -> Result<(Vec<Msg>, Status)> {
        receive_vec(self, Some(tag))
    }

    /// Receive a message with any tag containing multiple instances of type `Msg` into a `Vec`.
    ///
    /// # Standard section(s)
    ///
    /// 3.2.4
    fn receive_vec<Msg: Equivalence>(&self) -> Result<(Vec<Msg>, Status)> {
        receive_vec(self, None)
    }

    /// Initiate receiving a message tagged `tag` into `buf`.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_receive_into_with_tag<'b, Buf: BufferMut + ?Sized>(
        &self,
        buf: &'b mut Buf,
        tag: Tag,
    ) -> Result<Request<'b, Self::Lock>> {
        receive(self, buf, Some(tag), Blocking::No, "immediate_receive")
    }

    /// Initiate receiving a message with any tag into `buf`.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_receive_into<'b, Buf: BufferMut + ?Sized>(
        &self,
        buf: &'b mut Buf,
    ) -> Result<Request<'b, Self::Lock>> {
        receive(self, buf, None, Blocking::No, "immediate_receive")
    }

    /// A persistent receive of messages tagged `tag` into `buf`
    ///
    /// # Standard section(s)
    ///
    /// 3.9
    fn receive_init_with_tag<'b, Buf: BufferMut + ?Sized>(
        &self,
        buf: &'b mut Buf,
        tag: Tag,
    ) -> Result<PersistentRequest<'b, Self::Lock>> {
        receive_init(self, buf, Some(tag))
    }

    /// A persistent receive of messages with any tag into `buf`
    ///
    /// # Standard section(s)
    ///
    /// 3.9
    fn receive_init<'b, Buf: BufferMut + ?Sized>(
        &self,
        buf: &'b mut Buf,
    ) -> Result<PersistentRequest<'b, Self::Lock>> {
        receive_init(self, buf, None)
    }
}

fn receive_init<'b, S, B>(
    source: &S,
    buf: &'b mut B,
    tag: Option<Tag>,
) -> Result<PersistentRequest<'b, S::Lock>>
where
    S: Source + ?Sized,
    B: BufferMut + ?Sized,
{
    let (mut op, bytes) = receive_op(source, buf, tag, "receive_init")?;
    let comm = source.as_communicator();
    let handle = comm
        .lock()
        .with(|engine| engine.create(op(), true, "receive_init"))?;
    Ok(PersistentRequest::new(comm.shared_lock(), handle, Some(bytes)))
}

impl<'a, L: ProgressLock> Source for AnyProcess<'a, L> {
    fn source_rank(&self) -> Option<Rank> {
        None
    }
}

impl<'a, L: ProgressLock> Source for Process<'a, L> {
    fn source_rank(&self) -> Option<Rank> {
        Some(self.rank())
    }
}

/// Something that can be used as the destination in a point to point send operation
///
/// # Examples
/// - Using a `Process` as the destination will send data to that specific process.
///
/// # Standard section(s)
///
/// 3.2.3
pub trait Destination: AsCommunicator {
    /// `Rank` that identifies the destination
    fn destination_rank(&self) -> Rank;

    /// Blocking standard mode send operation
    ///
    /// Send the contents of a `Buffer` to the `Destination` `&self` and tag it. Returns once
    /// the data has been delivered to the destination process.
    ///
    /// # Standard section(s)
    ///
    /// 3.2.1
    fn send_with_tag<Buf: Buffer + ?Sized>(&self, buf: &Buf, tag: Tag) -> Result<()> {
        send(self, buf, tag, SendMode::Standard, Blocking::Yes, "send")?
            .wait()
            .map(|_| ())
    }

    /// Blocking standard mode send operation with tag `0`
    ///
    /// # Standard section(s)
    ///
    /// 3.2.1
    fn send<Buf: Buffer + ?Sized>(&self, buf: &Buf) -> Result<()> {
        self.send_with_tag(buf, Tag::default())
    }

    /// Blocking buffered mode send operation
    ///
    /// The data is copied into the attached buffer (see
    /// [`Universe::set_buffer_size`](crate::environment::Universe::set_buffer_size)) and the
    /// call returns at once. Fails if the attached buffer cannot hold the message.
    ///
    /// # Standard section(s)
    ///
    /// 3.4
    fn buffered_send_with_tag<Buf: Buffer + ?Sized>(&self, buf: &Buf, tag: Tag) -> Result<()> {
        send(self, buf, tag, SendMode::Buffered, Blocking::Yes, "buffered_send")?
            .wait()
            .map(|_| ())
    }

    /// Blocking buffered mode send operation with tag `0`
    ///
    /// # Standard section(s)
    ///
    /// 3.4
    fn buffered_send<Buf: Buffer + ?Sized>(&self, buf: &Buf) -> Result<()> {
        self.buffered_send_with_tag(buf, Tag::default())
    }

    /// Blocking synchronous mode send operation
    ///
    /// Returns once the destination has matched the message with a receive.
    ///
    /// # Standard section(s)
    ///
    /// 3.4
    fn synchronous_send_with_tag<Buf: Buffer + ?Sized>(&self, buf: &Buf, tag: Tag) -> Result<()> {
        send(self, buf, tag, SendMode::Synchronous, Blocking::Yes, "synchronous_send")?
            .wait()
            .map(|_| ())
    }

    /// Blocking synchronous mode send operation with tag `0`
    ///
    /// # Standard section(s)
    ///
    /// 3.4
    fn synchronous_send<Buf: Buffer + ?Sized>(&self, buf: &Buf) -> Result<()> {
        self.synchronous_send_with_tag(buf, Tag::default())
    }

    /// Blocking ready mode send operation
    ///
    /// The matching receive must already be posted at the destination.
    ///
    /// # Standard section(s)
    ///
    /// 3.4
    fn ready_send_with_tag<Buf: Buffer + ?Sized>(&self, buf: &Buf, tag: Tag) -> Result<()> {
        send(self, buf, tag, SendMode::Ready, Blocking::Yes, "ready_send")?
            .wait()
            .map(|_| ())
    }

    /// Blocking ready mode send operation with tag `0`
    ///
    /// # Standard section(s)
    ///
    /// 3.4
    fn ready_send<Buf: Buffer + ?Sized>(&self, buf: &Buf) -> Result<()> {
        self.ready_send_with_tag(buf, Tag::default())
    }

    /// Initiate an immediate (non-blocking) standard mode send operation.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_send_with_tag<'b, Buf: Buffer + ?Sized>(
        &self,
        buf: &'b Buf,
        tag: Tag,
    ) -> Result<Request<'b, Self::Lock>> {
        send(self, buf, tag, SendMode::Standard, Blocking::No, "immediate_send")
    }

    /// Initiate an immediate (non-blocking) standard mode send operation with tag `0`.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_send<'b, Buf: Buffer + ?Sized>(&self, buf: &'b Buf) -> Result<Request<'b, Self::Lock>> {
        self.immediate_send_with_tag(buf, Tag::default())
    }

    /// Initiate an immediate (non-blocking) buffered mode send operation.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_buffered_send_with_tag<'b, Buf: Buffer + ?Sized>(
        &self,
        buf: &'b Buf,
        tag: Tag,
    ) -> Result<Request<'b, Self::Lock>> {
        send(self, buf, tag, SendMode::Buffered, Blocking::No, "immediate_buffered_send")
    }

    /// Initiate an immediate (non-blocking) buffered mode send operation with tag `0`.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_buffered_send<'b, Buf: Buffer + ?Sized>(
        &self,
        buf: &'b Buf,
    ) -> Result<Request<'b, Self::Lock>> {
        self.immediate_buffered_send_with_tag(buf, Tag::default())
    }

    /// Initiate an immediate (non-blocking) synchronous mode send operation.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_synchronous_send_with_tag<'b, Buf: Buffer + ?Sized>(
        &self,
        buf: &'b Buf,
        tag: Tag,
    ) -> Result<Request<'b, Self::Lock>> {
        send(
            self,
            buf,
            tag,
            SendMode::Synchronous,
            Blocking::No,
            "immediate_synchronous_send",
        )
    }

    /// Initiate an immediate (non-blocking) synchronous mode send operation with tag `0`.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_synchronous_send<'b, Buf: Buffer + ?Sized>(
        &self,
        buf: &'b Buf,
    ) -> Result<Request<'b, Self::Lock>> {
        self.immediate_synchronous_send_with_tag(buf, Tag::default())
    }

    /// Initiate an immediate (non-blocking) ready mode send operation.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_ready_send_with_tag<'b, Buf: Buffer + ?Sized>(
        &self,
        buf: &'b Buf,
        tag: Tag,
    ) -> Result<Request<'b, Self::Lock>> {
        send(self, buf, tag, SendMode::Ready, Blocking::No, "immediate_ready_send")
    }

    /// Initiate an immediate (non-blocking) ready mode send operation with tag `0`.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_ready_send<'b, Buf: Buffer + ?Sized>(
        &self,
        buf: &'b Buf,
    ) -> Result<Request<'b, Self::Lock>> {
        self.immediate_ready_send_with_tag(buf, Tag::default())
    }

    /// A persistent standard mode send of `buf` tagged `tag`
    ///
    /// The contents of `buf` are captured here; every start sends the same data.
    ///
    /// # Standard section(s)
    ///
    /// 3.9
    fn send_init_with_tag<'b, Buf: Buffer + ?Sized>(
        &self,
        buf: &'b Buf,
        tag: Tag,
    ) -> Result<PersistentRequest<'b, Self::Lock>> {
        send_init(self, buf, tag, SendMode::Standard, "send_init")
    }

    /// A persistent standard mode send of `buf` with tag `0`
    ///
    /// # Standard section(s)
    ///
    /// 3.9
    fn send_init<'b, Buf: Buffer + ?Sized>(
        &self,
        buf: &'b Buf,
    ) -> Result<PersistentRequest<'b, Self::Lock>> {
        self.send_init_with_tag(buf, Tag::default())
    }

    /// A persistent buffered mode send of `buf` tagged `tag`
    ///
    /// # Standard section(s)
    ///
    /// 3.9
    fn buffered_send_init_with_tag<'b, Buf: Buffer + ?Sized>(
        &self,
        buf: &'b Buf,
        tag: Tag,
    ) -> Result<PersistentRequest<'b, Self::Lock>> {
        send_init(self, buf, tag, SendMode::Buffered, "buffered_send_init")
    }

    /// A persistent synchronous mode send of `buf` tagged `tag`
    ///
    /// # Standard section(s)
    ///
    /// 3.9
    fn synchronous_send_init_with_tag<'b, Buf: Buffer + ?Sized>(
        &self,
        buf: &'b Buf,
        tag: Tag,
    ) -> Result<PersistentRequest<'b, Self::Lock>> {
        send_init(self, buf, tag, SendMode::Synchronous, "synchronous_send_init")
    }

    /// A persistent ready mode send of `buf` tagged `tag`
    ///
    /// # Standard section(s)
    ///
    /// 3.9
    fn ready_send_init_with_tag<'b, Buf: Buffer + ?Sized>(
        &self,
        buf: &'b Buf,
        tag: Tag,
    ) -> Result<PersistentRequest<'b, Self::Lock>> {
        send_init(self, buf, tag, SendMode::Ready, "ready_send_init")
    }
}

impl<'a, L: ProgressLock> Destination for Process<'a, L> {
    fn destination_rank(&self) -> Rank {
        self.rank()
    }
}

/// Describes the result of a point to point receive operation.
///
/// For a completed send it describes the message sent. For a cancelled operation only
/// [`is_cancelled`](Status::is_cancelled) is meaningful.
///
/// # Standard section(s)
///
/// 3.2.5
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Status {
    source: Rank,
    tag: Tag,
    bytes: usize,
    truncated: bool,
    cancelled: bool,
}

impl Status {
    pub(crate) fn new(source: Rank, tag: Tag, bytes: usize) -> Status {
        Status {
            source,
            tag,
            bytes,
            truncated: false,
            cancelled: false,
        }
    }

    pub(crate) fn cancelled() -> Status {
        Status {
            source: -1,
            tag: -1,
            bytes: 0,
            truncated: false,
            cancelled: true,
        }
    }

    pub(crate) fn with_truncated(mut self, truncated: bool) -> Status {
        self.truncated = truncated;
        self
    }

    /// The rank of the message source
    pub fn source_rank(&self) -> Rank {
        self.source
    }

    /// The message tag
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Number of bytes written into the receive buffer
    pub fn byte_count(&self) -> usize {
        self.bytes
    }

    /// Number of instances of the type `datatype` received
    pub fn count<D: Datatype + ?Sized>(&self, datatype: &D) -> Count {
        match datatype.size() {
            0 => 0,
            size => (self.bytes / size).value_as::<Count>().unwrap_or(Count::MAX),
        }
    }

    /// Whether the message was longer than the receive buffer
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Whether the operation was cancelled
    ///
    /// # Standard section(s)
    ///
    /// 3.8.4
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

fn send_receive_into_inner<M, D, B, S>(
    msg: &M,
    destination: &D,
    sendtag: Tag,
    buf: &mut B,
    source: &S,
    receivetag: Option<Tag>,
) -> Result<Status>
where
    M: Buffer + ?Sized,
    D: Destination,
    B: BufferMut + ?Sized,
    S: Source,
{
    let sent = send(
        destination,
        msg,
        sendtag,
        SendMode::Standard,
        Blocking::Yes,
        "send_receive",
    )?;
    let received = receive(source, buf, receivetag, Blocking::Yes, "send_receive")
        .and_then(Request::wait);
    sent.wait()?;
    received
}

/// Sends `msg` to `destination` tagging it `sendtag` and simultaneously receives an
/// instance of `R` tagged `receivetag` from `source`.
///
/// # Standard section(s)
///
/// 3.10
pub fn send_receive_with_tags<M, D, R, S>(
    msg: &M,
    destination: &D,
    sendtag: Tag,
    source: &S,
    receivetag: Tag,
) -> Result<(R, Status)>
where
    M: Buffer + ?Sized,
    D: Destination,
    R: Equivalence,
    S: Source,
{
    // SAFETY: `Equivalence` types accept every bit pattern, zero included.
    let mut r: R = unsafe { mem::zeroed() };
    let status = send_receive_into_inner(msg, destination, sendtag, &mut r, source, Some(receivetag))?;
    Ok((r, status))
}

/// Sends `msg` to `destination` and simultaneously receives an instance of `R` from
/// `source`.
///
/// # Examples
///
/// ```
/// use mpi_ptp::environment::Universe;
/// use mpi_ptp::point_to_point::send_receive;
///
/// let universe = Universe::builder(0, 1).build().unwrap();
/// let world = universe.world();
/// let me = world.this_process();
/// let (x, status) = send_receive::<_, _, i32, _>(&-3i32, &me, &me).unwrap();
/// assert_eq!((x, status.byte_count()), (-3, 4));
/// ```
///
/// # Standard section(s)
///
/// 3.10
pub fn send_receive<M, D, R, S>(msg: &M, destination: &D, source: &S) -> Result<(R, Status)>
where
    M: Buffer + ?Sized,
    D: Destination,
    R: Equivalence,
    S: Source,
{
    // SAFETY: `Equivalence` types accept every bit pattern, zero included.
    let mut r: R = unsafe { mem::zeroed() };
    let status = send_receive_into_inner(msg, destination, Tag::default(), &mut r, source, None)?;
    Ok((r, status))
}

/// Sends the contents of `msg` to `destination` tagging it `sendtag` and simultaneously
/// receives a message tagged `receivetag` from `source` into `buf`.
///
/// # Standard section(s)
///
/// 3.10
pub fn send_receive_into_with_tags<M, D, B, S>(
    msg: &M,
    destination: &D,
    sendtag: Tag,
    buf: &mut B,
    source: &S,
    receivetag: Tag,
) -> Result<Status>
where
    M: Buffer + ?Sized,
    D: Destination,
    B: BufferMut + ?Sized,
    S: Source,
{
    send_receive_into_inner(msg, destination, sendtag, buf, source, Some(receivetag))
}

/// Sends the contents of `msg` to `destination` and simultaneously receives a message from
/// `source` into `buf`.
///
/// # Standard section(s)
///
/// 3.10
pub fn send_receive_into<M, D, B, S>(
    msg: &M,
    destination: &D,
    buf: &mut B,
    source: &S,
) -> Result<Status>
where
    M: Buffer + ?Sized,
    D: Destination,
    B: BufferMut + ?Sized,
    S: Source,
{
    send_receive_into_inner(msg, destination, Tag::default(), buf, source, None)
}

fn send_receive_replace_inner<B, D, S>(
    buf: &mut B,
    destination: &D,
    sendtag: Tag,
    source: &S,
    receivetag: Option<Tag>,
) -> Result<Status>
where
    B: BufferMut + ?Sized,
    D: Destination,
    S: Source,
{
    let name = "send_receive_replace";
    // The outgoing bytes are packed before the receive is posted, so `buf` is free to take
    // the incoming message.
    let op = send_op(destination, &*buf, sendtag, SendMode::Standard, name)?;
    let comm = destination.as_communicator();
    let handle = post(comm.lock(), Blocking::Yes, name, op)?;
    let sent: Request<'_, D::Lock> = Request::new(comm.shared_lock(), handle, None);
    let received = receive(source, buf, receivetag, Blocking::Yes, name).and_then(Request::wait);
    sent.wait()?;
    received
}

/// Sends the contents of `buf` to `destination` tagging it `sendtag` and simultaneously
/// receives a message tagged `receivetag` from `source`, replacing the contents of `buf`
/// with it.
///
/// # Standard section(s)
///
/// 3.10
pub fn send_receive_replace_into_with_tags<B, D, S>(
    buf: &mut B,
    destination: &D,
    sendtag: Tag,
    source: &S,
    receivetag: Tag,
) -> Result<Status>
where
    B: BufferMut + ?Sized,
    D: Destination,
    S: Source,
{
    send_receive_replace_inner(buf, destination, sendtag, source, Some(receivetag))
}

/// Sends the contents of `buf` to `destination` and simultaneously receives a message from
/// `source`, replacing the contents of `buf` with it.
///
/// # Examples
///
/// ```
/// use mpi_ptp::environment::Universe;
/// use mpi_ptp::point_to_point::send_receive_replace_into;
///
/// let universe = Universe::builder(0, 1).build().unwrap();
/// let world = universe.world();
/// let me = world.this_process();
/// let mut x = [1u8, 2, 3];
/// let status = send_receive_replace_into(&mut x[..], &me, &me).unwrap();
/// assert_eq!((x, status.byte_count()), ([1, 2, 3], 3));
/// ```
///
/// # Standard section(s)
///
/// 3.10
pub fn send_receive_replace_into<B, D, S>(buf: &mut B, destination: &D, source: &S) -> Result<Status>
where
    B: BufferMut + ?Sized,
    D: Destination,
    S: Source,
{
    send_receive_replace_inner(buf, destination, Tag::default(), source, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::{MutView, UserDatatype, View};
    use crate::environment::Universe;
    use crate::error::ErrorKind;

    #[test]
    fn status_counts_instances() {
        let status = Status::new(1, 4, 12);
        assert_eq!(status.count(&u32::equivalent_datatype()), 3);
        assert_eq!(status.count(&u64::equivalent_datatype()), 1);
        assert!(!status.is_truncated());
        assert!(Status::cancelled().is_cancelled());
    }

    #[test]
    fn self_send_of_a_strided_view() {
        let universe = Universe::builder(0, 1).build().unwrap();
        let world = universe.world();
        let me = world.this_process();

        let every_other = UserDatatype::vector(3, 1, 2, &u16::equivalent_datatype()).unwrap();
        let data = [1u16, 0, 2, 0, 3, 0];
        let view = View::with_count_and_datatype(&data[..], 1, &every_other).unwrap();
        let sent = me.immediate_send_with_tag(&view, 2).unwrap();

        let mut out = [9u16; 6];
        let mut target = MutView::with_count_and_datatype(&mut out[..], 1, &every_other).unwrap();
        let status = me.receive_into_with_tag(&mut target, 2).unwrap();
        sent.wait().unwrap();
        assert_eq!(status.byte_count(), 6);
        assert_eq!(out, [1, 9, 2, 9, 3, 9]);
    }

    #[test]
    fn receive_vec_sizes_the_vec_from_the_message() {
        let universe = Universe::builder(0, 1).build().unwrap();
        let world = universe.world();
        let data = [5u32, 6, 7];
        world.this_process().immediate_send_with_tag(&data[..], 11).unwrap().wait().unwrap();
        let (v, status) = world.any_process().receive_vec::<u32>().unwrap();
        assert_eq!(v, vec![5, 6, 7]);
        assert_eq!(status.tag(), 11);
    }

    #[test]
    fn argument_errors_are_reported_at_entry() {
        let universe = Universe::builder(0, 2).build().unwrap();
        let world = universe.world();
        let err = world.process_at_rank(5).send(&1u8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rank);
        let err = world.process_at_rank(1).send_with_tag(&1u8, -2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Tag);
        let mut x = 0u8;
        let err = world
            .process_at_rank(-1)
            .immediate_receive_into(&mut x)
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rank);
    }

    #[test]
    fn immediate_probe_sees_unexpected_messages() {
        let universe = Universe::builder(0, 1).build().unwrap();
        let world = universe.world();
        let me = world.this_process();
        assert_eq!(me.immediate_probe().unwrap(), None);
        me.immediate_send_with_tag(&[1u8, 2, 3][..], 8).unwrap().wait().unwrap();
        let status = me.immediate_probe_with_tag(8).unwrap().unwrap();
        assert_eq!((status.source_rank(), status.tag(), status.byte_count()), (0, 8, 3));
        assert_eq!(me.immediate_probe_with_tag(9).unwrap(), None);
        let (v, _) = me.receive_vec_with_tag::<u8>(8).unwrap();
        assert_eq!(v, vec![1, 2, 3]);
    }
}
