mod common;

use std::thread;
use std::time::Duration;

use mpi_ptp::environment::{Config, Universe};
use mpi_ptp::traits::*;
use mpi_ptp::transport::{TcpTransport, Transport, UdpTransport};

use common::init_logging;

/// Rank 0 sends `len` bytes to rank 1, which answers with their sum.
fn exchange<T: Transport + 'static>(drivers: [T; 2], len: usize) {
    let config = Config::builder()
        .retransmit_base(Duration::from_millis(50))
        .build();
    let [zero, one] = drivers;

    let receiver = {
        let config = config.clone();
        thread::spawn(move || {
            let universe = Universe::builder(1, 2)
                .config(config)
                .transport(one)
                .build()
                .unwrap();
            let world = universe.world();
            let (data, status) = world.process_at_rank(0).receive_vec::<u8>().unwrap();
            assert_eq!(status.byte_count(), len);
            assert!(!status.is_truncated());
            let sum: u64 = data.iter().map(|&b| u64::from(b)).sum();
            world.process_at_rank(0).send_with_tag(&sum, 1).unwrap();
            data
        })
    };

    let universe = Universe::builder(0, 2)
        .config(config)
        .transport(zero)
        .build()
        .unwrap();
    let world = universe.world();
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    world.process_at_rank(1).send(&data[..]).unwrap();
    let (sum, status) = world.process_at_rank(1).receive_with_tag::<u64>(1).unwrap();
    assert_eq!(status.source_rank(), 1);
    assert_eq!(sum, data.iter().map(|&b| u64::from(b)).sum::<u64>());
    assert_eq!(receiver.join().unwrap(), data);
}

#[test]
fn udp_on_localhost() {
    init_logging();
    let mut zero = UdpTransport::bind("127.0.0.1:0").unwrap().with_max_payload(1024);
    let mut one = UdpTransport::bind("127.0.0.1:0").unwrap().with_max_payload(1024);
    zero.add_peer(1, one.local_addr().unwrap());
    one.add_peer(0, zero.local_addr().unwrap());
    exchange([zero, one], 20_000);
}

#[test]
fn tcp_on_localhost() {
    init_logging();
    let mut zero = TcpTransport::bind(0, "127.0.0.1:0").unwrap();
    let mut one = TcpTransport::bind(1, "127.0.0.1:0").unwrap();
    zero.add_peer(1, one.local_addr().unwrap());
    one.add_peer(0, zero.local_addr().unwrap());
    exchange([zero, one], 100_000);
}
