//! Request objects for non-blocking operations
//!
//! Non-blocking operations such as `immediate_send()` return request objects that borrow any
//! buffers involved in the operation so as to ensure proper access restrictions. In order to
//! release the borrowed buffers from the request objects, a completion operation such as
//! [`wait()`](Request::wait) or [`test()`](Request::test) must be used on the request object.
//!
//! **Note:** If the `Request` is dropped (as opposed to calling `wait` or `test` explicitly), the
//! program will panic.
//!
//! Persistent requests are set up once with `send_init()` or `receive_init()` and then started
//! any number of times. They are released with [`PersistentRequest::free`] or when dropped
//! while inactive.
//!
//! # Standard section(s)
//!
//! 3.7, 3.8.4, 3.9
//!
//! # Unfinished features
//!
//! - **3.9**: `MPI_Startall()`

use std::sync::Arc;
use std::thread;

use crate::engine::lock::{ProgressLock, Unlocked};
use crate::engine::store::{Completion, Handle};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::point_to_point::{retrying, Status};

/// Copy a finished receive's staging image into the user's buffer.
fn deliver(target: &mut Option<&mut [u8]>, completion: Completion) -> Status {
    if let (Some(dst), Some(data)) = (target.as_deref_mut(), completion.data) {
        let n = dst.len().min(data.len());
        dst[..n].copy_from_slice(&data[..n]);
    }
    completion.status
}

/// A request object for a non-blocking operation
///
/// # Panics
///
/// Panics if the request object is dropped before the operation finished. To prevent this,
/// call `wait` or `test` until it reports completion.
///
/// # Standard section(s)
///
/// 3.7.1
#[must_use]
pub struct Request<'b, L: ProgressLock = Unlocked> {
    lock: Arc<L>,
    handle: Handle,
    target: Option<&'b mut [u8]>,
    done: bool,
}

impl<'b, L: ProgressLock> Request<'b, L> {
    pub(crate) fn new(lock: Arc<L>, handle: Handle, target: Option<&'b mut [u8]>) -> Self {
        Request {
            lock,
            handle,
            target,
            done: false,
        }
    }

    fn poll(&mut self, pump: bool, name: &'static str) -> Option<Result<Status>> {
        let handle = self.handle;
        let outcome = self.lock.with(|engine| {
            if pump {
                engine.test(handle, name)
            } else {
                engine.try_take(handle, name)
            }
        });
        let outcome = match outcome {
            Ok(None) => return None,
            Ok(Some(completion)) => Ok(deliver(&mut self.target, completion)),
            Err(err) => Err(err),
        };
        self.done = true;
        Some(outcome)
    }

    /// Wait for an operation to finish.
    ///
    /// Makes progress until the associated operation has finished. An operation that failed
    /// reports its error here.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    pub fn wait(mut self) -> Result<Status> {
        loop {
            if let Some(outcome) = self.poll(true, "wait") {
                return outcome;
            }
            thread::yield_now();
        }
    }

    /// Test whether an operation has finished.
    ///
    /// Makes progress once. If the operation has finished, its outcome is returned. Otherwise
    /// returns the unfinished `Request`.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    pub fn test(mut self) -> std::result::Result<Result<Status>, Self> {
        match self.poll(true, "test") {
            Some(outcome) => Ok(outcome),
            None => Err(self),
        }
    }

    /// Initiate cancellation of the request.
    ///
    /// Only a receive that has not been matched and a send whose data has not started to
    /// leave can be cancelled. Otherwise this does nothing and the operation completes
    /// normally. Either way the request still has to be completed; a cancelled one reports
    /// [`Status::is_cancelled`].
    ///
    /// # Standard section(s)
    ///
    /// 3.8.4
    pub fn cancel(&self) -> Result<()> {
        self.lock.with(|engine| engine.cancel(self.handle))
    }
}

impl<'b, L: ProgressLock> Drop for Request<'b, L> {
    fn drop(&mut self) {
        if !self.done && !thread::panicking() {
            panic!("request was dropped without being completed");
        }
    }
}

/// Wait for every request to finish.
///
/// The outcomes are in the order of `requests`.
///
/// # Standard section(s)
///
/// 3.7.5
pub fn wait_all<'b, L: ProgressLock>(requests: Vec<Request<'b, L>>) -> Vec<Result<Status>> {
    requests.into_iter().map(Request::wait).collect()
}

/// Make progress once on every engine behind `requests`.
fn progress_all<L: ProgressLock>(requests: &[Request<'_, L>]) {
    let mut pumped: Vec<&Arc<L>> = Vec::new();
    for request in requests {
        if !pumped.iter().any(|lock| Arc::ptr_eq(lock, &request.lock)) {
            request.lock.with(Engine::progress);
            pumped.push(&request.lock);
        }
    }
}

/// Test whether every request has finished.
///
/// Makes progress once. If all of `requests` have finished, their outcomes are returned in
/// order. Otherwise none of them is completed and they are handed back unchanged.
///
/// # Standard section(s)
///
/// 3.7.5
pub fn test_all<'b, L: ProgressLock>(
    requests: Vec<Request<'b, L>>,
) -> std::result::Result<Vec<Result<Status>>, Vec<Request<'b, L>>> {
    progress_all(&requests);
    let finished = requests
        .iter()
        .all(|request| request.lock.with(|engine| engine.is_finished(request.handle)));
    if !finished {
        return Err(requests);
    }
    Ok(requests
        .into_iter()
        .map(|mut request| {
            let outcome = request.poll(false, "test_all");
            request.done = true;
            outcome.unwrap_or(Err(Error::InvalidRequest { op: "test_all" }))
        })
        .collect())
}

/// Make progress once and take the first finished request out of `requests`.
///
/// Returns its index in `requests` before removal and its outcome, or `None` if nothing has
/// finished.
///
/// # Standard section(s)
///
/// 3.7.5
pub fn test_any<'b, L: ProgressLock>(
    requests: &mut Vec<Request<'b, L>>,
) -> Option<(usize, Result<Status>)> {
    progress_all(requests);
    for index in 0..requests.len() {
        if let Some(outcome) = requests[index].poll(false, "test_any") {
            requests.remove(index);
            return Some((index, outcome));
        }
    }
    None
}

/// Wait until one of `requests` has finished and take it out.
///
/// Returns `None` if `requests` is empty.
///
/// # Standard section(s)
///
/// 3.7.5
pub fn wait_any<'b, L: ProgressLock>(
    requests: &mut Vec<Request<'b, L>>,
) -> Option<(usize, Result<Status>)> {
    if requests.is_empty() {
        return None;
    }
    loop {
        if let Some(found) = test_any(requests) {
            return Some(found);
        }
        thread::yield_now();
    }
}

/// Make progress once and take every finished request out of `requests`.
///
/// Each outcome comes with the index its request had in `requests` before any removal. The
/// unfinished requests stay behind in their original order.
///
/// # Standard section(s)
///
/// 3.7.5
pub fn test_some<'b, L: ProgressLock>(
    requests: &mut Vec<Request<'b, L>>,
) -> Vec<(usize, Result<Status>)> {
    progress_all(requests);
    let mut finished = Vec::new();
    let mut pending = Vec::with_capacity(requests.len());
    for (index, mut request) in requests.drain(..).enumerate() {
        match request.poll(false, "test_some") {
            Some(outcome) => finished.push((index, outcome)),
            None => pending.push(request),
        }
    }
    *requests = pending;
    finished
}

/// Wait until at least one of `requests` has finished, then take out every finished one.
///
/// Returns an empty list if `requests` is empty.
///
/// # Standard section(s)
///
/// 3.7.5
pub fn wait_some<'b, L: ProgressLock>(
    requests: &mut Vec<Request<'b, L>>,
) -> Vec<(usize, Result<Status>)> {
    if requests.is_empty() {
        return Vec::new();
    }
    loop {
        let finished = test_some(requests);
        if !finished.is_empty() {
            return finished;
        }
        thread::yield_now();
    }
}

/// A request that can be started any number of times
///
/// # Panics
///
/// Panics if dropped while an operation it started is still running.
///
/// # Standard section(s)
///
/// 3.9
pub struct PersistentRequest<'b, L: ProgressLock = Unlocked> {
    lock: Arc<L>,
    handle: Handle,
    target: Option<&'b mut [u8]>,
    active: bool,
    freed: bool,
}

impl<'b, L: ProgressLock> PersistentRequest<'b, L> {
    pub(crate) fn new(lock: Arc<L>, handle: Handle, target: Option<&'b mut [u8]>) -> Self {
        PersistentRequest {
            lock,
            handle,
            target,
            active: false,
            freed: false,
        }
    }

    /// Whether an operation has been started and not yet completed by `wait` or `test`.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Start the operation.
    ///
    /// A receive picks up the current contents of its buffer. If the previous send of this
    /// request still has data in flight, progress is made until it is gone.
    ///
    /// # Standard section(s)
    ///
    /// 3.9
    pub fn start(&mut self) -> Result<()> {
        let handle = self.handle;
        let staging = self.target.as_deref().map(<[u8]>::to_vec);
        retrying(&*self.lock, |engine| engine.start(handle, staging.clone()))?;
        self.active = true;
        self.lock.with(Engine::progress);
        Ok(())
    }

    fn poll(&mut self, pump: bool, name: &'static str) -> Result<Option<Status>> {
        if !self.active {
            let err = Error::InvalidArgument {
                op: name,
                reason: "persistent request is not active".into(),
            };
            return Err(self.lock.with(|engine| engine.raise(err)));
        }
        let handle = self.handle;
        let outcome = self.lock.with(|engine| {
            if pump {
                engine.test(handle, name)
            } else {
                engine.try_take(handle, name)
            }
        });
        match outcome {
            Ok(None) => Ok(None),
            Ok(Some(completion)) => {
                self.active = false;
                Ok(Some(deliver(&mut self.target, completion)))
            }
            Err(err) => {
                self.active = false;
                Err(err)
            }
        }
    }

    /// Wait for the started operation to finish. The request becomes inactive.
    pub fn wait(&mut self) -> Result<Status> {
        loop {
            if let Some(status) = self.poll(true, "wait")? {
                return Ok(status);
            }
            thread::yield_now();
        }
    }

    /// Make progress once and report the outcome if the started operation has finished.
    pub fn test(&mut self) -> Result<Option<Status>> {
        self.poll(true, "test")
    }

    /// Initiate cancellation of the started operation. See [`Request::cancel`].
    pub fn cancel(&self) -> Result<()> {
        self.lock.with(|engine| engine.cancel(self.handle))
    }

    /// Release the request, first waiting for an operation that is still active.
    pub fn free(mut self) -> Result<()> {
        let waited = if self.active {
            self.wait().map(|_| ())
        } else {
            Ok(())
        };
        self.freed = true;
        let handle = self.handle;
        self.lock.with(|engine| engine.free(handle))?;
        waited
    }
}

impl<'b, L: ProgressLock> Drop for PersistentRequest<'b, L> {
    fn drop(&mut self) {
        if self.freed {
            return;
        }
        if self.active && !thread::panicking() {
            panic!("persistent request was dropped while active");
        }
        let handle = self.handle;
        let _ = self.lock.with(|engine| engine.free(handle));
    }
}
