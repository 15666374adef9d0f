//! Environmental management
//!
//! A [`Universe`] is one process's view of the computation: its engine, its transport drivers
//! and its configuration. It is built with a [`UniverseBuilder`] and hands out the world
//! communicator from which everything else is derived.
//!
//! [`Config`] holds the engine's tunables. Each of them can also be set by name, either from
//! the environment ([`Config::from_env`]) or at run time ([`Universe::set_tunable`]).
//!
//! # Standard section(s)
//!
//! 3.6, 8.3, 8.7, 12.4.3
//!
//! # Unfinished features
//!
//! - **8.1.2**: `MPI_TAG_UB` and the other environmental inquiries
//! - **8.2**: Memory allocation

use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use conv::ConvUtil;
use once_cell::sync::Lazy;
use tracing::{debug, info};
use typed_builder::TypedBuilder;

use crate::clock::{Clock, SystemClock};
use crate::engine::lock::{Locked, ProgressLock, Unlocked};
use crate::engine::{Engine, Statistics};
use crate::error::{Error, ErrorHandler, Result};
use crate::topology::Communicator;
use crate::transport::Transport;
use crate::Rank;

/// Engine configuration
///
/// Every field has a default, so a builder only names what it changes:
///
/// ```
/// use std::time::Duration;
/// use mpi_ptp::environment::Config;
///
/// let config = Config::builder()
///     .retransmit_base(Duration::from_millis(200))
///     .max_frame_payload(1024)
///     .build();
/// assert_eq!(config.max_retransmit_power, 15);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, TypedBuilder)]
pub struct Config {
    /// Timeout of the first transmission of a fragment. Each retransmission doubles it.
    #[builder(default = Duration::from_secs(5))]
    pub retransmit_base: Duration,
    /// Largest power of two the retransmission timeout is multiplied by. A fragment is sent
    /// at most `max_retransmit_power + 1` times.
    #[builder(default = 15)]
    pub max_retransmit_power: u32,
    /// Request descriptors allocated up front
    #[builder(default = 64)]
    pub request_pool_initial: usize,
    /// Request descriptors added each time the pool runs dry
    #[builder(default = 64)]
    pub request_pool_grow_by: usize,
    /// Upper bound on live request descriptors
    #[builder(default = 4096)]
    pub max_requests: usize,
    /// Unacknowledged fragments allowed in flight to one destination on an unreliable path
    #[builder(default = 256)]
    pub max_outstanding_frags: usize,
    /// Messages allowed to wait in the pending send queue
    #[builder(default = 1024)]
    pub send_queue_limit: usize,
    /// Caps the payload of a single frame below what the drivers advertise.
    #[builder(default, setter(strip_option))]
    pub max_frame_payload: Option<usize>,
    /// Cover payload bytes, not only headers, with the frame checksum.
    #[builder(default = true)]
    pub checksum_payload: bool,
    /// What happens to non-retryable errors
    #[builder(default)]
    pub error_handler: ErrorHandler,
    /// Size in bytes of the buffer attached for buffered sends
    #[builder(default)]
    pub buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config::builder().build()
    }
}

type Setter = fn(&mut Config, &str) -> std::result::Result<(), String>;

fn parse<T>(value: &str) -> std::result::Result<T, String>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|err| format!("cannot parse `{}`: {}", value, err))
}

fn parse_flag(value: &str) -> std::result::Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(format!("`{}` is not a boolean", value)),
    }
}

static TUNABLES: Lazy<HashMap<&'static str, Setter>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, Setter> = HashMap::new();
    table.insert("retransmit_base_ms", |config, value| {
        config.retransmit_base = Duration::from_millis(parse(value)?);
        Ok(())
    });
    table.insert("max_retransmit_power", |config, value| {
        config.max_retransmit_power = parse(value)?;
        Ok(())
    });
    table.insert("request_pool_initial", |config, value| {
        config.request_pool_initial = parse(value)?;
        Ok(())
    });
    table.insert("request_pool_grow_by", |config, value| {
        config.request_pool_grow_by = parse(value)?;
        Ok(())
    });
    table.insert("max_requests", |config, value| {
        config.max_requests = parse(value)?;
        Ok(())
    });
    table.insert("max_outstanding_frags", |config, value| {
        config.max_outstanding_frags = parse(value)?;
        Ok(())
    });
    table.insert("send_queue_limit", |config, value| {
        config.send_queue_limit = parse(value)?;
        Ok(())
    });
    table.insert("max_frame_payload", |config, value| {
        config.max_frame_payload = match value.trim() {
            "" | "none" => None,
            value => match parse(value)? {
                0 => None,
                n => Some(n),
            },
        };
        Ok(())
    });
    table.insert("checksum_payload", |config, value| {
        config.checksum_payload = parse_flag(value)?;
        Ok(())
    });
    table.insert("error_handler", |config, value| {
        config.error_handler = match value.trim().to_ascii_lowercase().as_str() {
            "return" => ErrorHandler::Return,
            "abort" => ErrorHandler::Abort,
            _ => return Err(format!("unknown error handler `{}`", value)),
        };
        Ok(())
    });
    table.insert("buffer_size", |config, value| {
        config.buffer_size = parse(value)?;
        Ok(())
    });
    table
});

impl Config {
    /// Names accepted by [`set_tunable`](Config::set_tunable), sorted.
    pub fn tunable_names() -> Vec<&'static str> {
        let mut names: Vec<_> = TUNABLES.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Set a tunable by name from its textual value.
    ///
    /// Durations are given in milliseconds, `max_frame_payload` accepts `none`, and
    /// `error_handler` is `return` or `abort`.
    pub fn set_tunable(&mut self, name: &str, value: &str) -> Result<()> {
        let setter = TUNABLES.get(name).ok_or_else(|| Error::InvalidArgument {
            op: "set_tunable",
            reason: format!("unknown tunable `{}`", name),
        })?;
        setter(self, value).map_err(|reason| Error::InvalidArgument {
            op: "set_tunable",
            reason: format!("{}: {}", name, reason),
        })
    }

    /// The default configuration with every `MPI_PTP_<NAME>` environment variable applied,
    /// e.g. `MPI_PTP_RETRANSMIT_BASE_MS=250`.
    pub fn from_env() -> Result<Config> {
        let mut config = Config::default();
        for name in Config::tunable_names() {
            let var = format!("MPI_PTP_{}", name.to_ascii_uppercase());
            if let Ok(value) = env::var(&var) {
                debug!(tunable = name, value = %value, "tunable from environment");
                config.set_tunable(name, &value)?;
            }
        }
        Ok(config)
    }
}

/// Describes the various levels of multithreading that can be supported by an MPI library.
///
/// The level of a universe follows from its [`ProgressLock`]: [`Unlocked`] provides
/// `Single`, [`Locked`] provides `Multiple`.
///
/// # Standard section(s)
///
/// 12.4.3
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Threading {
    /// All processes partaking in the computation are single-threaded.
    Single,
    /// Processes may be multi-threaded, but MPI functions will only ever be called from the main
    /// thread.
    Funneled,
    /// Processes may be multi-threaded, but calls to MPI functions will not be made concurrently.
    /// The user is responsible for serializing the calls.
    Serialized,
    /// Processes may be multi-threaded with no restrictions on the use of MPI functions from the
    /// threads.
    Multiple,
}

/// Global context
///
/// Dropping a universe does not wait for outstanding operations; complete them first.
///
/// # Examples
///
/// ```
/// use mpi_ptp::environment::Universe;
/// use mpi_ptp::traits::*;
///
/// let universe = Universe::builder(0, 1).build().unwrap();
/// let world = universe.world();
/// world.this_process().immediate_send(&17u32).unwrap().wait().unwrap();
/// let (x, status) = world.this_process().receive::<u32>().unwrap();
/// assert_eq!((x, status.source_rank()), (17, 0));
/// ```
pub struct Universe<L: ProgressLock = Unlocked> {
    lock: Arc<L>,
}

impl Universe {
    /// Start building the universe of process `process` out of `size`.
    pub fn builder(process: Rank, size: Rank) -> UniverseBuilder {
        UniverseBuilder {
            process,
            size,
            config: Config::default(),
            drivers: Vec::new(),
            clock: Arc::new(SystemClock::new()),
        }
    }
}

impl<L: ProgressLock> Universe<L> {
    /// The 'world communicator'
    ///
    /// Contains all processes initially partaking in the computation.
    pub fn world(&self) -> Communicator<L> {
        let (rank, size) = self.lock.with(|engine| (engine.me(), engine.size()));
        Communicator::world(Arc::clone(&self.lock), rank as Rank, size as Rank)
    }

    /// Rank of this process in the world communicator
    pub fn rank(&self) -> Rank {
        self.lock.with(|engine| engine.me()) as Rank
    }

    /// Number of processes in the world communicator
    pub fn size(&self) -> Rank {
        self.lock.with(|engine| engine.size()) as Rank
    }

    /// Level of multithreading supported by this universe
    pub fn threading(&self) -> Threading {
        L::THREADING
    }

    /// Poll the transports once and advance every outstanding operation as far as it goes.
    pub fn progress(&self) {
        self.lock.with(Engine::progress);
    }

    /// Counters kept since the universe was built
    pub fn statistics(&self) -> Statistics {
        self.lock.with(|engine| engine.statistics())
    }

    /// A copy of the current configuration
    pub fn config(&self) -> Config {
        self.lock.with(|engine| engine.config().clone())
    }

    /// Change a tunable of the running engine. See [`Config::set_tunable`].
    ///
    /// `buffer_size` is refused here since buffered sends may hold space in the attached
    /// buffer; use [`set_buffer_size`](Universe::set_buffer_size) instead.
    pub fn set_tunable(&self, name: &str, value: &str) -> Result<()> {
        self.lock.with(|engine| engine.set_tunable(name, value))?;
        info!(tunable = name, value = %value, "tunable changed");
        Ok(())
    }

    /// Time in seconds since the universe was built, from its clock.
    pub fn time(&self) -> f64 {
        self.lock.with(|engine| engine.now()).as_secs_f64()
    }

    /// The size in bytes of the buffer used for buffered communication.
    pub fn buffer_size(&self) -> usize {
        self.lock.with(|engine| engine.buffer_size())
    }

    /// Set the size in bytes of the buffer used for buffered communication.
    ///
    /// Detaches the current buffer first, which waits for every buffered send using it.
    ///
    /// # Standard section(s)
    ///
    /// 3.6
    pub fn set_buffer_size(&mut self, size: usize) {
        self.detach_buffer();
        self.lock.with(|engine| engine.set_buffer_size(size));
    }

    /// Detach the buffer used for buffered communication.
    ///
    /// Makes progress until no buffered send holds space in the buffer.
    ///
    /// # Standard section(s)
    ///
    /// 3.6
    pub fn detach_buffer(&mut self) {
        loop {
            let in_use = self.lock.with(|engine| {
                engine.progress();
                engine.buffer_in_use()
            });
            if in_use == 0 {
                break;
            }
            thread::yield_now();
        }
        self.lock.with(|engine| engine.set_buffer_size(0));
    }
}

/// Assembles a [`Universe`].
///
/// The loopback path to the process itself is always present; drivers added with
/// [`transport`](UniverseBuilder::transport) are tried in the order they were added.
pub struct UniverseBuilder {
    process: Rank,
    size: Rank,
    config: Config,
    drivers: Vec<Box<dyn Transport>>,
    clock: Arc<dyn Clock>,
}

impl UniverseBuilder {
    /// Use `config` instead of the defaults.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Register a transport driver.
    pub fn transport<T: Transport + 'static>(mut self, driver: T) -> Self {
        self.drivers.push(Box::new(driver));
        self
    }

    /// Drive retransmission timers from `clock` instead of the system clock.
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// A universe for single-threaded use.
    pub fn build(self) -> Result<Universe<Unlocked>> {
        self.build_with()
    }

    /// A universe whose communicators can be shared between threads.
    pub fn build_threaded(self) -> Result<Universe<Locked>> {
        self.build_with()
    }

    /// A universe guarded by the lock `L`.
    pub fn build_with<L: ProgressLock>(self) -> Result<Universe<L>> {
        let size = self
            .size
            .value_as::<u32>()
            .ok()
            .filter(|&size| size > 0)
            .ok_or_else(|| Error::InvalidArgument {
                op: "build",
                reason: format!("universe size {} is not positive", self.size),
            })?;
        let process = self
            .process
            .value_as::<u32>()
            .ok()
            .filter(|&process| process < size)
            .ok_or(Error::InvalidRank {
                op: "build",
                rank: self.process,
            })?;
        info!(
            process,
            size,
            threading = ?L::THREADING,
            "universe built"
        );
        let engine = Engine::new(process, size, self.config, self.drivers, self.clock);
        Ok(Universe {
            lock: Arc::new(L::new(engine)),
        })
    }
}
