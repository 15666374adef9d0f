mod common;

use std::time::Duration;

use proptest::collection::{btree_set, vec};
use proptest::prelude::*;

use mpi_ptp::clock::ManualClock;
use mpi_ptp::environment::Config;
use mpi_ptp::traits::*;

use common::{faulty_pair, finish, pump};

fn messages() -> impl Strategy<Value = Vec<Vec<u8>>> {
    vec(vec(any::<u8>(), 0..300), 1..8)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_message_arrives_once_and_in_order(
        msgs in messages(),
        lost in btree_set(1u64..40, 0..6),
        duplicate in 0u64..5,
        reorder in 0u64..5,
    ) {
        let clock = ManualClock::new();
        let config = Config::builder()
            .max_frame_payload(64)
            .retransmit_base(Duration::from_millis(2))
            .build();
        let (a, b) = faulty_pair(config, &clock, |p, faults| {
            if p == 0 {
                faults
                    .drop_once(lost.iter().copied())
                    .duplicate_every(duplicate)
                    .reorder_every(reorder)
            } else {
                faults
            }
        });
        let (a_world, b_world) = (a.world(), b.world());
        let step = Some((&clock, Duration::from_millis(1)));

        let sends: Vec<_> = msgs
            .iter()
            .map(|m| a_world.process_at_rank(1).immediate_send(&m[..]).unwrap())
            .collect();
        for msg in &msgs {
            let mut buf = vec![0u8; 300];
            let receive = b_world
                .process_at_rank(0)
                .immediate_receive_into(&mut buf[..])
                .unwrap();
            let status = finish(receive, &[&a, &b], step).unwrap();
            prop_assert_eq!(status.byte_count(), msg.len());
            prop_assert_eq!(&buf[..msg.len()], &msg[..]);
        }
        for send in sends {
            prop_assert!(finish(send, &[&a, &b], step).is_ok());
        }
        pump(&[&a, &b], 3);
        prop_assert!(b_world.any_process().immediate_probe().unwrap().is_none());
        prop_assert_eq!(a.statistics().failed_operations, 0);
    }
}
