mod common;

use std::time::Duration;

use mpi_ptp::clock::{Clock, ManualClock};
use mpi_ptp::environment::Config;
use mpi_ptp::error::ErrorKind;
use mpi_ptp::traits::*;

use common::{faulty_pair, finish, init_logging, pump};

#[test]
fn lost_fragment_is_retransmitted_into_a_truncating_receive() {
    init_logging();
    let clock = ManualClock::new();
    let config = Config::builder()
        .max_frame_payload(100)
        .retransmit_base(Duration::from_millis(10))
        .build();
    let (a, b) = faulty_pair(config, &clock, |p, faults| {
        if p == 0 {
            faults.drop_once([2])
        } else {
            faults
        }
    });
    let (a_world, b_world) = (a.world(), b.world());
    let data: Vec<u8> = (0..250).map(|i| i as u8).collect();

    let send = a_world
        .process_at_rank(1)
        .immediate_send_with_tag(&data[..], 5)
        .unwrap();
    let mut buf = [0u8; 100];
    let receive = b_world
        .any_process()
        .immediate_receive_into_with_tag(&mut buf[..], 5)
        .unwrap();

    let step = Some((&clock, Duration::from_millis(5)));
    let status = finish(receive, &[&a, &b], step).unwrap();
    assert_eq!(status.source_rank(), 0);
    assert_eq!(status.tag(), 5);
    assert!(status.is_truncated());
    assert_eq!(status.byte_count(), 100);
    assert_eq!(&buf[..], &data[..100]);

    finish(send, &[&a, &b], step).unwrap();
    let stats = a.statistics();
    assert!(stats.retransmissions >= 1);
    assert_eq!(stats.failed_operations, 0);
    assert_eq!(stats.retained_fragments, 0);
    assert_eq!(b.statistics().duplicates, 0);
}

#[test]
fn retransmission_intervals_double_until_the_fragment_is_given_up() {
    init_logging();
    let clock = ManualClock::new();
    let config = Config::builder()
        .retransmit_base(Duration::from_millis(100))
        .max_retransmit_power(3)
        .build();
    let (a, _silent) = faulty_pair(config, &clock, |_, faults| faults);
    let world = a.world();

    let mut send = Some(world.process_at_rank(1).immediate_send(&1u8).unwrap());
    assert_eq!(a.statistics().frames_sent, 1);

    let mut sent_at = Vec::new();
    let mut outcome = None;
    while outcome.is_none() && clock.now() < Duration::from_secs(3) {
        clock.advance(Duration::from_millis(50));
        let before = a.statistics().frames_sent;
        match send.take().unwrap().test() {
            Ok(result) => outcome = Some(result),
            Err(pending) => send = Some(pending),
        }
        if a.statistics().frames_sent > before {
            sent_at.push(clock.now().as_millis());
        }
    }

    assert_eq!(sent_at, vec![100, 300, 700]);
    let err = outcome.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RetransmitExhausted);
    assert_eq!(clock.now(), Duration::from_millis(1500));
    let stats = a.statistics();
    assert_eq!(stats.timeouts, 3);
    assert_eq!(stats.failed_operations, 1);
    assert_eq!(stats.live_requests, 0);
}

#[test]
fn duplicated_frames_are_delivered_once() {
    init_logging();
    let clock = ManualClock::new();
    let (a, b) = faulty_pair(Config::default(), &clock, |_, faults| {
        faults.duplicate_every(2)
    });
    let (a_world, b_world) = (a.world(), b.world());

    let values: Vec<u32> = (0..5).collect();
    let sends: Vec<_> = values
        .iter()
        .map(|v| a_world.process_at_rank(1).immediate_send(v).unwrap())
        .collect();
    for i in 0..5u32 {
        let mut value = u32::MAX;
        let receive = b_world
            .process_at_rank(0)
            .immediate_receive_into(&mut value)
            .unwrap();
        finish(receive, &[&a, &b], None).unwrap();
        assert_eq!(value, i);
    }
    for send in sends {
        finish(send, &[&a, &b], None).unwrap();
    }
    pump(&[&a, &b], 3);

    assert!(b_world.any_process().immediate_probe().unwrap().is_none());
    assert!(b.statistics().duplicates >= 2);
    assert_eq!(a.statistics().retransmissions, 0);
}

#[test]
fn corrupted_fragments_are_rejected_and_sent_again() {
    init_logging();
    let clock = ManualClock::new();
    let (a, b) = faulty_pair(Config::default(), &clock, |p, faults| {
        if p == 0 {
            faults.corrupt_every(3)
        } else {
            faults
        }
    });
    let (a_world, b_world) = (a.world(), b.world());
    let msg: Vec<u16> = (0..64).collect();

    let mut requests = Vec::new();
    for tag in 0..4 {
        requests.push(
            a_world
                .process_at_rank(1)
                .immediate_send_with_tag(&msg[..], tag)
                .unwrap(),
        );
    }
    for tag in 0..4 {
        let mut buf = [0u16; 64];
        let receive = b_world
            .process_at_rank(0)
            .immediate_receive_into_with_tag(&mut buf[..], tag)
            .unwrap();
        finish(receive, &[&a, &b], None).unwrap();
        assert_eq!(&buf[..], &msg[..]);
    }
    for send in requests {
        finish(send, &[&a, &b], None).unwrap();
    }

    assert!(b.statistics().checksum_failures >= 1);
    assert!(b.statistics().nacks_sent >= 1);
    assert!(a.statistics().nacks_received >= 1);
    assert!(a.statistics().retransmissions >= 1);
}

#[test]
fn lost_acknowledgements_do_not_duplicate_delivery() {
    init_logging();
    let clock = ManualClock::new();
    let config = Config::builder()
        .retransmit_base(Duration::from_millis(10))
        .build();
    let (a, b) = faulty_pair(config, &clock, |p, faults| {
        if p == 1 {
            faults.faults_on_acks().drop_once([1, 2])
        } else {
            faults
        }
    });
    let (a_world, b_world) = (a.world(), b.world());

    let msg = [7u8, 8, 9];
    let send = a_world.process_at_rank(1).immediate_send(&msg[..]).unwrap();
    let (received, _) = b_world.any_process().receive_vec::<u8>().unwrap();
    assert_eq!(received, vec![7, 8, 9]);

    let step = Some((&clock, Duration::from_millis(10)));
    finish(send, &[&a, &b], step).unwrap();
    pump(&[&a, &b], 3);

    assert!(a.statistics().retransmissions >= 1);
    assert!(b.statistics().duplicates >= 1);
    assert!(b_world.any_process().immediate_probe().unwrap().is_none());
}

#[test]
fn synchronous_send_finishes_only_after_the_match() {
    init_logging();
    let clock = ManualClock::new();
    let (a, b) = faulty_pair(Config::default(), &clock, |_, faults| faults);
    let (a_world, b_world) = (a.world(), b.world());

    let mut send = Some(
        a_world
            .process_at_rank(1)
            .immediate_synchronous_send(&3u64)
            .unwrap(),
    );
    for _ in 0..5 {
        b.progress();
        send = match send.take().unwrap().test() {
            Ok(outcome) => panic!("synchronous send finished before the match: {:?}", outcome),
            Err(pending) => Some(pending),
        };
    }
    assert_eq!(b.statistics().unexpected_messages, 1);

    let (value, _) = b_world.process_at_rank(0).receive::<u64>().unwrap();
    assert_eq!(value, 3);
    finish(send.take().unwrap(), &[&a, &b], None).unwrap();
}

#[test]
fn exhausted_send_fails_the_peer_for_later_sends() {
    init_logging();
    let clock = ManualClock::new();
    let config = Config::builder()
        .retransmit_base(Duration::from_millis(10))
        .max_retransmit_power(0)
        .build();
    let (a, b) = faulty_pair(config, &clock, |p, faults| {
        if p == 0 {
            faults.drop_once([1])
        } else {
            faults
        }
    });
    let (a_world, b_world) = (a.world(), b.world());
    let to_b = a_world.process_at_rank(1);

    let lost = to_b.immediate_send_with_tag(&1u8, 1).unwrap();
    let stuck = to_b.immediate_synchronous_send_with_tag(&2u8, 2).unwrap();
    let step = Some((&clock, Duration::from_millis(5)));
    let err = finish(lost, &[&a, &b], step).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RetransmitExhausted);
    let err = finish(stuck, &[&a, &b], step).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RetransmitExhausted);

    let err = to_b.immediate_send_with_tag(&3u8, 3).map(|_| ()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RetransmitExhausted);
    assert!(!err.is_retryable());
    let err = to_b.send_with_tag(&4u8, 4).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RetransmitExhausted);

    pump(&[&a, &b], 5);
    let stats = a.statistics();
    assert_eq!(stats.failed_operations, 2);
    assert_eq!(stats.retained_fragments, 0);
    assert_eq!(stats.live_requests, 0);
    assert!(b_world.process_at_rank(0).immediate_probe_with_tag(3).unwrap().is_none());

    // The other direction is unaffected.
    let back = b_world.process_at_rank(0).immediate_send(&5u8).unwrap();
    let mut value = 0u8;
    let receive = a_world
        .process_at_rank(1)
        .immediate_receive_into(&mut value)
        .unwrap();
    finish(receive, &[&a, &b], step).unwrap();
    finish(back, &[&a, &b], step).unwrap();
    assert_eq!(value, 5);
}

#[test]
fn every_nth_frame_lost_in_both_directions() {
    init_logging();
    let data: Vec<u8> = (0..1000).map(|i| (i * 7 % 256) as u8).collect();
    for n in [2, 3, 5] {
        let clock = ManualClock::new();
        let config = Config::builder()
            .max_frame_payload(64)
            .retransmit_base(Duration::from_millis(10))
            .build();
        let (a, b) = faulty_pair(config, &clock, |_, faults| {
            faults.drop_every(n).faults_on_acks()
        });
        let (a_world, b_world) = (a.world(), b.world());

        let send = a_world.process_at_rank(1).immediate_send(&data[..]).unwrap();
        let mut buf = vec![0u8; 1000];
        let receive = b_world
            .process_at_rank(0)
            .immediate_receive_into(&mut buf[..])
            .unwrap();
        let step = Some((&clock, Duration::from_millis(5)));
        let status = finish(receive, &[&a, &b], step).unwrap();
        finish(send, &[&a, &b], step).unwrap();

        assert_eq!(status.byte_count(), 1000, "dropping every {}th frame", n);
        assert_eq!(buf, data, "dropping every {}th frame", n);
        let stats = a.statistics();
        assert!(stats.retransmissions >= 1);
        assert_eq!(stats.failed_operations, 0);
    }
}

#[test]
fn registration_limit_is_a_retryable_shortage() {
    init_logging();
    let clock = ManualClock::new();
    let (a, b) = faulty_pair(Config::default(), &clock, |p, faults| {
        if p == 0 {
            faults.registration_limit(1)
        } else {
            faults
        }
    });
    let (a_world, b_world) = (a.world(), b.world());
    let to_b = a_world.process_at_rank(1);

    let (first, second) = ([1u8; 4], [2u8; 4]);
    let held = to_b.immediate_send(&first[..]).unwrap();
    let err = to_b.immediate_send(&second[..]).map(|_| ()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert!(err.is_retryable());
    assert_eq!(a.statistics().live_requests, 1);

    finish(held, &[&a, &b], None).unwrap();
    let retried = to_b.immediate_send(&second[..]).unwrap();
    finish(retried, &[&a, &b], None).unwrap();

    for expected in [first, second] {
        let mut buf = [0u8; 4];
        let receive = b_world
            .process_at_rank(0)
            .immediate_receive_into(&mut buf[..])
            .unwrap();
        finish(receive, &[&a, &b], None).unwrap();
        assert_eq!(buf, expected);
    }
    assert_eq!(a.statistics().failed_operations, 0);
}
