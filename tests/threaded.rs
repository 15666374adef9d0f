mod common;

use std::thread;

use mpi_ptp::environment::{Config, Universe};
use mpi_ptp::point_to_point::{send_receive, send_receive_replace_into_with_tags};
use mpi_ptp::traits::*;
use mpi_ptp::transport::SharedMemoryFabric;
use mpi_ptp::Threading;

use common::init_logging;

const THREADS: i32 = 4;
const MESSAGES: u32 = 25;

#[test]
fn threads_share_a_locked_universe() {
    init_logging();
    let fabric = SharedMemoryFabric::new(2);
    let a = Universe::builder(0, 2)
        .transport(fabric.endpoint(0).unwrap())
        .build_threaded()
        .unwrap();
    let b = Universe::builder(1, 2)
        .transport(fabric.endpoint(1).unwrap())
        .build_threaded()
        .unwrap();
    assert_eq!(a.threading(), Threading::Multiple);
    let (a_world, b_world) = (a.world(), b.world());

    thread::scope(|s| {
        for tag in 0..THREADS {
            let a_world = &a_world;
            let b_world = &b_world;
            s.spawn(move || {
                let to_b = a_world.process_at_rank(1);
                for i in 0..MESSAGES {
                    to_b.send_with_tag(&(tag as u32 * 1000 + i), tag).unwrap();
                }
            });
            s.spawn(move || {
                let from_a = b_world.process_at_rank(0);
                for i in 0..MESSAGES {
                    let (value, status) = from_a.receive_with_tag::<u32>(tag).unwrap();
                    assert_eq!(status.tag(), tag);
                    assert_eq!(value, tag as u32 * 1000 + i);
                }
            });
        }
    });

    assert_eq!(b.statistics().live_requests, 0);
    assert!(b_world.any_process().immediate_probe().unwrap().is_none());
}

#[test]
fn ring_of_send_receive() {
    init_logging();
    const SIZE: u32 = 3;
    let fabric = SharedMemoryFabric::new(SIZE);
    let endpoints: Vec<_> = (0..SIZE).map(|p| fabric.endpoint(p).unwrap()).collect();

    let handles: Vec<_> = endpoints
        .into_iter()
        .enumerate()
        .map(|(rank, endpoint)| {
            thread::spawn(move || {
                let universe = Universe::builder(rank as i32, SIZE as i32)
                    .config(Config::default())
                    .transport(endpoint)
                    .build()
                    .unwrap();
                let world = universe.world();
                let size = world.size();
                let me = world.rank();
                let next = world.process_at_rank((me + 1) % size);
                let previous = world.process_at_rank((me + size - 1) % size);
                let (got, status) = send_receive::<_, _, i32, _>(&me, &next, &previous).unwrap();
                assert_eq!(status.source_rank(), previous.rank());
                got
            })
        })
        .collect();

    let received: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(received, vec![2, 0, 1]);
}

#[test]
fn pair_swaps_buffers_in_place() {
    init_logging();
    let fabric = SharedMemoryFabric::new(2);
    let endpoints: Vec<_> = (0..2).map(|p| fabric.endpoint(p).unwrap()).collect();

    let handles: Vec<_> = endpoints
        .into_iter()
        .enumerate()
        .map(|(rank, endpoint)| {
            thread::spawn(move || {
                let universe = Universe::builder(rank as i32, 2)
                    .transport(endpoint)
                    .build()
                    .unwrap();
                let world = universe.world();
                let other = world.process_at_rank(1 - world.rank());
                let mut buf = [rank as u8; 5];
                let status = send_receive_replace_into_with_tags(
                    &mut buf[..],
                    &other,
                    7,
                    &other,
                    7,
                )
                .unwrap();
                assert_eq!(status.source_rank(), other.rank());
                assert_eq!(status.byte_count(), 5);
                buf
            })
        })
        .collect();

    let swapped: Vec<[u8; 5]> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(swapped, vec![[1; 5], [0; 5]]);
}
