#![allow(dead_code)]

use std::time::Duration;

use mpi_ptp::clock::ManualClock;
use mpi_ptp::environment::{Config, Universe};
use mpi_ptp::error::Result;
use mpi_ptp::point_to_point::Status;
use mpi_ptp::request::Request;
use mpi_ptp::transport::{FaultyTransport, SharedMemoryFabric, SharedMemoryTransport};

pub type Faulty = FaultyTransport<SharedMemoryTransport>;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// `size` universes sharing one fabric.
pub fn shmem_universes(size: u32, config: Config) -> Vec<Universe> {
    let fabric = SharedMemoryFabric::new(size);
    (0..size)
        .map(|p| {
            Universe::builder(p as i32, size as i32)
                .config(config.clone())
                .transport(fabric.endpoint(p).unwrap())
                .build()
                .unwrap()
        })
        .collect()
}

/// Two universes over fault injectors on a manual clock. `faults` shapes the injector of
/// each process.
pub fn faulty_pair<F>(config: Config, clock: &ManualClock, faults: F) -> (Universe, Universe)
where
    F: Fn(u32, Faulty) -> Faulty,
{
    let fabric = SharedMemoryFabric::new(2);
    let build = |p: u32| {
        Universe::builder(p as i32, 2)
            .config(config.clone())
            .transport(faults(p, FaultyTransport::new(fabric.endpoint(p).unwrap())))
            .clock(clock.clone())
            .build()
            .unwrap()
    };
    (build(0), build(1))
}

pub fn pump(universes: &[&Universe], rounds: usize) {
    for _ in 0..rounds {
        for u in universes {
            u.progress();
        }
    }
}

/// Test `request` until it finishes, moving every universe and the clock in between.
pub fn finish<'b>(
    request: Request<'b>,
    universes: &[&Universe],
    clock: Option<(&ManualClock, Duration)>,
) -> Result<Status> {
    let mut request = request;
    for _ in 0..100_000 {
        match request.test() {
            Ok(outcome) => return outcome,
            Err(pending) => request = pending,
        }
        for u in universes {
            u.progress();
        }
        if let Some((clock, step)) = clock {
            clock.advance(step);
        }
    }
    panic!("request did not finish");
}
