mod common;

use mpi_ptp::environment::Config;
use mpi_ptp::traits::*;

use common::{finish, init_logging, shmem_universes};

#[test]
fn wildcard_receive_takes_the_earliest_arrival() {
    init_logging();
    let universes = shmem_universes(3, Config::default());
    let worlds: Vec<_> = universes.iter().map(|u| u.world()).collect();

    worlds[2].process_at_rank(0).send(&2u8).unwrap();
    worlds[1].process_at_rank(0).send(&1u8).unwrap();

    let (first, status) = worlds[0].any_process().receive::<u8>().unwrap();
    assert_eq!((first, status.source_rank()), (2, 2));
    let (second, status) = worlds[0].any_process().receive::<u8>().unwrap();
    assert_eq!((second, status.source_rank()), (1, 1));
}

#[test]
fn unexpected_message_completes_the_receive_at_once() {
    init_logging();
    let universes = shmem_universes(2, Config::default());
    let (a, b) = (universes[0].world(), universes[1].world());

    a.process_at_rank(1)
        .send_with_tag(&[1u32, 2, 3][..], 4)
        .unwrap();
    universes[1].progress();
    assert_eq!(universes[1].statistics().unexpected_messages, 1);

    let mut buf = [0u32; 3];
    let request = b
        .any_process()
        .immediate_receive_into_with_tag(&mut buf[..], 4)
        .unwrap();
    let status = request.test().ok().unwrap().unwrap();
    assert_eq!(status.source_rank(), 0);
    assert_eq!(status.tag(), 4);
    assert_eq!(status.byte_count(), 12);
    assert_eq!(buf, [1, 2, 3]);
}

#[test]
fn earliest_posted_receive_wins() {
    init_logging();
    let universes = shmem_universes(2, Config::default());
    let (a, b) = (universes[0].world(), universes[1].world());
    let both = [&universes[0], &universes[1]];

    let mut wild = 0u8;
    let mut specific = 0u8;
    let first = b.any_process().immediate_receive_into(&mut wild).unwrap();
    let second = b
        .process_at_rank(0)
        .immediate_receive_into(&mut specific)
        .unwrap();
    a.process_at_rank(1).send(&10u8).unwrap();
    a.process_at_rank(1).send(&20u8).unwrap();
    finish(first, &both, None).unwrap();
    finish(second, &both, None).unwrap();
    assert_eq!((wild, specific), (10, 20));

    let first = b
        .process_at_rank(0)
        .immediate_receive_into(&mut specific)
        .unwrap();
    let second = b.any_process().immediate_receive_into(&mut wild).unwrap();
    a.process_at_rank(1).send(&30u8).unwrap();
    a.process_at_rank(1).send(&40u8).unwrap();
    finish(first, &both, None).unwrap();
    finish(second, &both, None).unwrap();
    assert_eq!((specific, wild), (30, 40));
}

#[test]
fn tags_select_but_never_reorder_matching_messages() {
    init_logging();
    let universes = shmem_universes(2, Config::default());
    let (a, b) = (universes[0].world(), universes[1].world());
    let to_b = a.process_at_rank(1);
    to_b.send_with_tag(&1u8, 7).unwrap();
    to_b.send_with_tag(&2u8, 3).unwrap();
    to_b.send_with_tag(&3u8, 7).unwrap();

    let from_a = b.process_at_rank(0);
    assert_eq!(from_a.receive_with_tag::<u8>(3).unwrap().0, 2);
    assert_eq!(from_a.receive_with_tag::<u8>(7).unwrap().0, 1);
    let (last, status) = from_a.receive::<u8>().unwrap();
    assert_eq!((last, status.tag()), (3, 7));
}

#[test]
fn communicators_do_not_see_each_others_messages() {
    init_logging();
    let universes = shmem_universes(2, Config::default());
    let (a, b) = (universes[0].world(), universes[1].world());
    let (a_dup, b_dup) = (a.duplicate().unwrap(), b.duplicate().unwrap());
    assert_eq!(a_dup.context_id(), b_dup.context_id());

    a_dup.process_at_rank(1).send(&5u8).unwrap();
    assert!(b.any_process().immediate_probe().unwrap().is_none());
    let status = b_dup.any_process().immediate_probe().unwrap().unwrap();
    assert_eq!(status.byte_count(), 1);
    assert_eq!(b_dup.any_process().receive::<u8>().unwrap().0, 5);
}

#[test]
fn probe_leaves_the_message_in_place() {
    init_logging();
    let universes = shmem_universes(2, Config::default());
    let (a, b) = (universes[0].world(), universes[1].world());
    let msg: Vec<f64> = (0..10).map(f64::from).collect();
    a.process_at_rank(1).send_with_tag(&msg[..], 9).unwrap();

    let status = b.any_process().probe_with_tag(9).unwrap();
    assert_eq!(status.byte_count(), 80);
    assert_eq!(status.count(&f64::equivalent_datatype()), 10);
    let again = b.process_at_rank(0).probe().unwrap();
    assert_eq!(again, status);

    let (received, _) = b.any_process().receive_vec_with_tag::<f64>(9).unwrap();
    assert_eq!(received, msg);
    assert!(b.any_process().immediate_probe().unwrap().is_none());
}
