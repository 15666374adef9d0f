//! How a universe guards its engine
//!
//! The thread-safety level is a type parameter of [`Universe`](crate::environment::Universe)
//! and everything derived from it. [`Unlocked`] keeps the engine in a `RefCell`, so a
//! universe built with it cannot leave its thread. [`Locked`] puts the engine behind a
//! mutex; every progress pump takes and releases the lock, and no operation holds it across
//! a blocking wait.

use std::cell::RefCell;
use std::sync::Mutex;

use super::Engine;
use crate::environment::Threading;

mod sealed {
    pub trait Sealed {}
}

/// Guards exclusive access to an [`Engine`].
///
/// This trait is sealed. It is implemented by [`Unlocked`] and [`Locked`].
pub trait ProgressLock: sealed::Sealed + Sized {
    /// The thread-safety level the lock provides
    const THREADING: Threading;

    #[doc(hidden)]
    fn new(engine: Engine) -> Self;

    #[doc(hidden)]
    fn with<R, F: FnOnce(&mut Engine) -> R>(&self, f: F) -> R;
}

/// No locking; the universe stays on the thread that built it.
pub struct Unlocked(RefCell<Engine>);

impl sealed::Sealed for Unlocked {}

impl ProgressLock for Unlocked {
    const THREADING: Threading = Threading::Single;

    fn new(engine: Engine) -> Self {
        Unlocked(RefCell::new(engine))
    }

    fn with<R, F: FnOnce(&mut Engine) -> R>(&self, f: F) -> R {
        f(&mut self.0.borrow_mut())
    }
}

/// Every engine access happens under a mutex.
pub struct Locked(Mutex<Engine>);

impl sealed::Sealed for Locked {}

impl ProgressLock for Locked {
    const THREADING: Threading = Threading::Multiple;

    fn new(engine: Engine) -> Self {
        Locked(Mutex::new(engine))
    }

    fn with<R, F: FnOnce(&mut Engine) -> R>(&self, f: F) -> R {
        // The engine never panics half-way through a state change it cannot survive.
        let mut engine = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut engine)
    }
}
