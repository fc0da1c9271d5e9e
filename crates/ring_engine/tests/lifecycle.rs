// ring_engine/tests/lifecycle.rs
//! Teardown, cancellation, signals and the borrowed environment

mod common;

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use common::{Behavior, Fixture, MockFile, result_of};
use ring_engine::ring_abi::{
    EnterFlags, Params, PollEvents, RingError, SetupFlags, SqeFlags, SubmissionEntry,
};
use ring_engine::{Credentials, EngineConfig, FsContext, OwnerId, ResourceCaps, SigMask};

const SIGUSR1: u32 = 10;

fn gated_file() -> std::sync::Arc<MockFile> {
    MockFile::new(ResourceCaps::READ | ResourceCaps::REGULAR, Behavior::Gated)
}

#[test]
fn test_close_cancels_running_work() {
    let fx = Fixture::new(4, SetupFlags::empty());
    let file = gated_file();
    fx.install(3, &file);

    fx.submit(&[SubmissionEntry::readv(3, 0x1000, 1, 0, 1)])
        .unwrap();
    file.wait_calls(1);

    let Fixture { ring, env, .. } = fx;
    ring.close();
    assert_eq!(file.cancelled(), 1);
    assert_eq!(env.address_space().attached(), 0);
}

#[test]
fn test_close_cancels_work_released_by_drain() {
    let fx = Fixture::new(4, SetupFlags::empty());
    let file = gated_file();
    fx.install(3, &file);

    fx.submit(&[
        SubmissionEntry::readv(3, 0x1000, 1, 0, 1),
        SubmissionEntry::readv(3, 0x2000, 1, 4096, 2).with_flags(SqeFlags::IO_DRAIN),
    ])
    .unwrap();
    file.wait_calls(1);

    let Fixture { ring, .. } = fx;
    let (tx, rx) = mpsc::channel();
    let closer = thread::spawn(move || {
        ring.close();
        let _ = tx.send(());
    });
    // The drained read is released only after the sweep; it must not block.
    assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok(), "close hung");
    closer.join().unwrap();
    assert_eq!(file.cancelled(), 1);
    assert_eq!(file.calls().len(), 1);
}

#[test]
fn test_close_with_pending_timeout_and_poll() {
    let fx = Fixture::new(4, SetupFlags::empty());
    let file = MockFile::new(ResourceCaps::READ | ResourceCaps::POLL, Behavior::Inline);
    fx.install(3, &file);

    fx.submit(&[
        SubmissionEntry::timeout(60_000_000_000, 0, 1),
        SubmissionEntry::poll_add(3, PollEvents::IN, 2),
    ])
    .unwrap();
    assert_eq!(file.waiters(), 1);

    let start = Instant::now();
    let Fixture { ring, .. } = fx;
    ring.close();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(file.waiters(), 0);
}

#[test]
fn test_cancel_owner_targets_one_owner() {
    let fx = Fixture::new(4, SetupFlags::empty());
    let file = gated_file();
    fx.install(3, &file);

    fx.submit(&[SubmissionEntry::readv(3, 0x1000, 1, 0, 1)])
        .unwrap();
    file.wait_calls(1);

    fx.ring.cancel_owner(OwnerId::next());
    thread::sleep(Duration::from_millis(20));
    assert_eq!(file.cancelled(), 0);
    assert!(fx.ready().is_empty());

    fx.ring.cancel_owner(fx.env.owner());
    assert_eq!(
        result_of(&fx.reap(1), 1),
        RingError::Cancelled.as_result()
    );
    assert_eq!(file.cancelled(), 1);
}

#[test]
fn test_signal_interrupts_wait() {
    let fx = Fixture::new(4, SetupFlags::empty());
    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(10));
            fx.env.raise(SIGUSR1);
        });
        assert_eq!(
            fx.ring.enter(0, 1, EnterFlags::GETEVENTS.bits()),
            Err(RingError::Interrupted)
        );
    });
}

#[test]
fn test_masked_signal_does_not_interrupt() {
    let fx = Fixture::new(4, SetupFlags::empty());
    let mask = SigMask::empty().with(SIGUSR1);
    thread::scope(|s| {
        s.spawn(|| {
            fx.env.raise(SIGUSR1);
            thread::sleep(Duration::from_millis(20));
            fx.submit(&[SubmissionEntry::nop(1)]).unwrap();
        });
        assert_eq!(
            fx.ring
                .enter_with_sigmask(0, 1, EnterFlags::GETEVENTS.bits(), mask),
            Ok(0)
        );
    });
    assert_eq!(result_of(&fx.ready(), 1), 0);

    // Still pending once unmasked.
    assert_eq!(
        fx.ring.enter(0, 1, EnterFlags::GETEVENTS.bits()),
        Err(RingError::Interrupted)
    );
}

#[test]
fn test_gone_address_space_faults_offloaded_read() {
    let fx = Fixture::new(4, SetupFlags::empty());
    let file = MockFile::new(ResourceCaps::READ | ResourceCaps::REGULAR, Behavior::Inline);
    fx.install(3, &file);

    fx.env.address_space().exit();
    fx.submit(&[SubmissionEntry::readv(3, 0x1000, 1, 0, 1)])
        .unwrap();
    assert_eq!(
        result_of(&fx.reap(1), 1),
        RingError::BadAddress.as_result()
    );
    assert!(file.calls().is_empty());
}

#[test]
fn test_worker_borrows_owner_environment() {
    let creds = Credentials { uid: 7, gid: 8 };
    let fx = Fixture::build(
        Params::new(SetupFlags::empty()).with_sq_entries(4),
        EngineConfig::default(),
        |env| env.with_credentials(creds).with_fs(FsContext::new("/srv/data")),
    );
    let file = MockFile::new(ResourceCaps::READ | ResourceCaps::REGULAR, Behavior::Inline);
    fx.install(3, &file);

    fx.submit(&[SubmissionEntry::readv(3, 0x1000, 1, 0, 1)])
        .unwrap();
    assert_eq!(result_of(&fx.reap(1), 1), 512);

    let calls = file.calls();
    let call = &calls[0];
    let env = call.env.as_ref().unwrap();
    assert_eq!(env.owner, fx.env.owner());
    assert_eq!(env.creds, creds);
    assert_eq!(env.fs.cwd(), std::path::Path::new("/srv/data"));
    assert!(env.has_mm);
}
