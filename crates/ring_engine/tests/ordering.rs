// ring_engine/tests/ordering.rs
//! Dependency chains, drain ordering and completion overflow

mod common;

use common::{Behavior, Fixture, MockFile, position_of, result_of};
use ring_engine::ResourceCaps;
use ring_engine::ring_abi::{RingError, SetupFlags, SqeFlags, SubmissionEntry};

const ECANCELED: i32 = RingError::Cancelled.as_result();

/// A file every read of which goes to a worker and waits for the gate
fn gated_file() -> std::sync::Arc<MockFile> {
    MockFile::new(
        ResourceCaps::READ | ResourceCaps::WRITE | ResourceCaps::REGULAR,
        Behavior::Gated,
    )
}

fn linked(sqe: SubmissionEntry) -> SubmissionEntry {
    sqe.with_flags(SqeFlags::IO_LINK)
}

fn drained(sqe: SubmissionEntry) -> SubmissionEntry {
    sqe.with_flags(SqeFlags::IO_DRAIN)
}

fn tags(fx: &Fixture, n: usize) -> Vec<u64> {
    fx.reap(n).iter().map(|c| c.user_data).collect()
}

#[test]
fn test_chain_runs_in_order() {
    let fx = Fixture::new(8, SetupFlags::empty());
    fx.submit(&[
        linked(SubmissionEntry::nop(1)),
        linked(SubmissionEntry::nop(2)),
        SubmissionEntry::nop(3),
    ])
    .unwrap();
    assert_eq!(tags(&fx, 3), [1, 2, 3]);
}

#[test]
fn test_chain_member_waits_for_slow_head() {
    let fx = Fixture::new(8, SetupFlags::empty());
    let file = MockFile::regular(Behavior::Queue);
    fx.install(3, &file);

    fx.submit(&[
        linked(SubmissionEntry::readv(3, 0x1000, 1, 0, 1)),
        SubmissionEntry::nop(2),
    ])
    .unwrap();
    assert!(fx.ready().is_empty());

    file.complete_queued(512);
    let cqes = fx.reap(2);
    assert_eq!(position_of(&cqes, 1), 0);
    assert_eq!(result_of(&cqes, 1), 512);
    assert_eq!(result_of(&cqes, 2), 0);
}

#[test]
fn test_failed_head_cancels_chain() {
    let fx = Fixture::new(8, SetupFlags::empty());
    let file = MockFile::regular(Behavior::Fail(RingError::IoError));
    fx.install(3, &file);

    fx.submit(&[
        linked(SubmissionEntry::readv(3, 0x1000, 1, 0, 1)),
        linked(SubmissionEntry::nop(2)),
        SubmissionEntry::nop(3),
        SubmissionEntry::nop(4),
    ])
    .unwrap();
    let cqes = fx.reap(4);
    assert_eq!(result_of(&cqes, 1), -5);
    assert_eq!(result_of(&cqes, 2), ECANCELED);
    assert_eq!(result_of(&cqes, 3), ECANCELED);
    // Outside the chain.
    assert_eq!(result_of(&cqes, 4), 0);
    assert_eq!(fx.ring.stats().links_failed, 2);
}

#[test]
fn test_rejected_member_fails_chain() {
    let fx = Fixture::new(8, SetupFlags::empty());
    fx.submit(&[
        linked(SubmissionEntry::nop(1)),
        linked(SubmissionEntry::readv(99, 0x1000, 1, 0, 2)),
        SubmissionEntry::nop(3),
    ])
    .unwrap();
    let cqes = fx.reap(3);
    assert_eq!(result_of(&cqes, 2), RingError::BadDescriptor.as_result());
    assert_eq!(result_of(&cqes, 1), 0);
    assert_eq!(result_of(&cqes, 3), ECANCELED);
    assert!(position_of(&cqes, 2) < position_of(&cqes, 1));
}

#[test]
fn test_drain_waits_for_earlier_work() {
    let fx = Fixture::new(8, SetupFlags::empty());
    let file = gated_file();
    fx.install(3, &file);

    fx.submit(&[
        SubmissionEntry::readv(3, 0x1000, 1, 0, 1),
        drained(SubmissionEntry::nop(2)),
        drained(SubmissionEntry::nop(3)),
    ])
    .unwrap();
    file.wait_calls(1);
    assert!(fx.ready().is_empty());
    assert_eq!(fx.ring.stats().deferred, 2);

    file.open_gate();
    assert_eq!(tags(&fx, 3), [1, 2, 3]);
}

#[test]
fn test_drain_waits_regardless_of_finish_order() {
    let fx = Fixture::new(8, SetupFlags::empty());
    let first = MockFile::regular(Behavior::Queue);
    let second = MockFile::regular(Behavior::Queue);
    fx.install(3, &first);
    fx.install(4, &second);

    fx.submit(&[
        SubmissionEntry::readv(3, 0x1000, 1, 0, 1),
        SubmissionEntry::readv(4, 0x2000, 1, 0, 2),
        drained(SubmissionEntry::nop(3)),
        SubmissionEntry::nop(4),
    ])
    .unwrap();

    // The later read finishes first; the drain keeps waiting.
    assert_eq!(second.complete_queued(512), 1);
    assert_eq!(tags(&fx, 1), [2]);
    assert!(fx.ready().is_empty());

    assert_eq!(first.complete_queued(512), 1);
    let cqes = fx.reap(3);
    assert_eq!(position_of(&cqes, 1), 0);
    assert_eq!(result_of(&cqes, 3), 0);
    assert_eq!(result_of(&cqes, 4), 0);
}

#[test]
fn test_undrained_entries_queue_behind_drain() {
    let fx = Fixture::new(8, SetupFlags::empty());
    let file = gated_file();
    fx.install(3, &file);

    fx.submit(&[
        SubmissionEntry::readv(3, 0x1000, 1, 0, 1),
        drained(SubmissionEntry::nop(2)),
        SubmissionEntry::nop(3),
    ])
    .unwrap();
    file.wait_calls(1);
    // The plain nop may not overtake the drain.
    assert!(fx.ready().is_empty());

    file.open_gate();
    let cqes = fx.reap(3);
    assert_eq!(position_of(&cqes, 1), 0);
    assert_eq!(result_of(&cqes, 2), 0);
    assert_eq!(result_of(&cqes, 3), 0);
}

#[test]
fn test_drain_inside_chain() {
    let fx = Fixture::new(8, SetupFlags::empty());
    let file = gated_file();
    fx.install(3, &file);

    fx.submit(&[
        SubmissionEntry::readv(3, 0x1000, 1, 0, 1),
        linked(SubmissionEntry::nop(2)),
        drained(SubmissionEntry::nop(3)),
        SubmissionEntry::nop(4),
    ])
    .unwrap();
    file.wait_calls(1);
    assert!(fx.ready().is_empty());

    file.open_gate();
    let cqes = fx.reap(4);
    assert_eq!(position_of(&cqes, 1), 0);
    assert_eq!(position_of(&cqes, 2), 1);
    assert_eq!(result_of(&cqes, 3), 0);
    assert_eq!(result_of(&cqes, 4), 0);
}

#[test]
fn test_overflow_is_counted() {
    let fx = Fixture::new(1, SetupFlags::empty());
    for tag in 0..4 {
        fx.submit(&[SubmissionEntry::nop(tag)]).unwrap();
    }
    let cq = fx.ring.completion();
    assert_eq!(cq.len(), 2);
    assert_eq!(cq.overflow(), 2);
    drop(cq);

    let tags: Vec<u64> = fx.ready().iter().map(|c| c.user_data).collect();
    assert_eq!(tags, [0, 1]);
    assert_eq!(fx.ring.stats().overflowed, 2);
}

#[test]
fn test_drain_after_overflow_proceeds() {
    let fx = Fixture::new(1, SetupFlags::empty());
    for tag in 0..4 {
        fx.submit(&[SubmissionEntry::nop(tag)]).unwrap();
    }
    assert_eq!(fx.ready().len(), 2);

    // Lost completions still count as done for ordering.
    fx.submit(&[drained(SubmissionEntry::nop(9))]).unwrap();
    let cqes = fx.reap(1);
    assert_eq!(result_of(&cqes, 9), 0);
    assert_eq!(fx.ring.stats().deferred, 0);
}
