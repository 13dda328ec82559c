use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::bounded;
use tidepool::{ConfigError, ThreadPool, MAX_POOL_SIZE};

fn single_worker(queue_capacity: usize) -> ThreadPool {
    tidepool::builder()
        .size(1)
        .queue_capacity(queue_capacity)
        .build()
        .unwrap()
}

/// Poll until `condition` holds, panicking if it takes longer than a few
/// seconds.
fn wait_until(message: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);

    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", message);
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn create_spawns_minimum_workers() {
    let pool = tidepool::builder().size(2..=4).build().unwrap();

    assert_eq!(pool.threads(), 2);
    pool.join();
}

#[test]
fn zero_minimum_size_is_rejected() {
    let result = tidepool::builder().size(0..=4).build();

    assert_eq!(result.err(), Some(ConfigError::MinSizeZero));
}

#[test]
fn inverted_size_is_rejected() {
    let result = tidepool::builder().size(4..2).build();

    assert_eq!(result.err(), Some(ConfigError::MinExceedsMax));
}

#[test]
fn oversized_maximum_is_rejected() {
    let result = tidepool::builder().size(1..=MAX_POOL_SIZE + 1).build();

    assert_eq!(result.err(), Some(ConfigError::MaxExceedsCeiling));
}

#[test]
#[should_panic(expected = "thread pool name must not contain null bytes")]
fn name_with_null_bytes_panics() {
    tidepool::builder().name("uh\0oh");
}

#[test]
fn workers_use_the_configured_name() {
    let pool = tidepool::builder()
        .size(1)
        .name("pool-worker")
        .build()
        .unwrap();

    let (name_tx, name_rx) = bounded(1);
    pool.dispatch(move || {
        name_tx
            .send(thread::current().name().map(str::to_owned))
            .unwrap();
    })
    .unwrap();

    assert_eq!(name_rx.recv().unwrap().as_deref(), Some("pool-worker"));
    pool.join();
}

#[test]
fn tasks_run_in_submission_order() {
    let pool = single_worker(16);
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..10 {
        let order = order.clone();
        pool.dispatch(move || order.lock().unwrap().push(i)).unwrap();
    }

    pool.join();

    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn ranks_follow_queue_depth() {
    let pool = single_worker(3);

    let (started_tx, started_rx) = bounded(0);
    let (release_tx, release_rx) = bounded::<()>(0);

    // Occupy the only worker until released, leaving the queue untouched.
    pool.dispatch(move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
    })
    .unwrap();
    started_rx.recv().unwrap();

    assert_eq!(pool.dispatch(|| {}).unwrap(), 1);
    assert_eq!(pool.dispatch(|| {}).unwrap(), 2);
    assert_eq!(pool.dispatch(|| {}).unwrap(), 3);

    release_tx.send(()).unwrap();
    pool.join();
}

#[test]
fn full_queue_applies_backpressure() {
    let pool = single_worker(1);

    let (started_tx, started_rx) = bounded(0);
    let (release_tx, release_rx) = bounded::<()>(0);

    pool.dispatch(move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
    })
    .unwrap();
    started_rx.recv().unwrap();

    // Fill the queue's only slot.
    pool.dispatch(|| {}).unwrap();

    // A further dispatch has nowhere to go and must block until the worker
    // pulls the queued task.
    let (submitted_tx, submitted_rx) = bounded(1);

    thread::scope(|s| {
        s.spawn(|| {
            let rank = pool.dispatch(|| {}).unwrap();
            submitted_tx.send(rank).unwrap();
        });

        assert!(
            submitted_rx
                .recv_timeout(Duration::from_millis(100))
                .is_err(),
            "dispatch should block while the queue is full"
        );

        release_tx.send(()).unwrap();

        assert_eq!(
            submitted_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            1
        );
    });

    pool.join();
}

#[test]
fn full_queue_rejects_try_dispatch() {
    let pool = single_worker(1);

    let (started_tx, started_rx) = bounded(0);
    let (release_tx, release_rx) = bounded::<()>(0);

    pool.dispatch(move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
    })
    .unwrap();
    started_rx.recv().unwrap();

    pool.dispatch(|| {}).unwrap();
    assert_eq!(pool.queued_tasks(), 1);

    let error = pool.try_dispatch(|| {}).unwrap_err();
    assert!(error.is_full());
    assert_eq!(pool.queued_tasks(), 1, "rejected task must not be enqueued");

    // The rejected closure comes back and can be run inline.
    let ran = Arc::new(AtomicUsize::new(0));
    let inline = ran.clone();
    let error = pool
        .try_dispatch(move || {
            inline.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap_err();
    error.into_inner()();
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    release_tx.send(()).unwrap();
    pool.join();
}

#[test]
fn queue_capacity_defaults_to_maximum_size() {
    // No explicit capacity: a one-thread pool gets a one-slot queue.
    let pool = tidepool::builder().size(1).build().unwrap();

    let (started_tx, started_rx) = bounded(0);
    let (release_tx, release_rx) = bounded::<()>(0);

    pool.dispatch(move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
    })
    .unwrap();
    started_rx.recv().unwrap();

    pool.dispatch(|| {}).unwrap();
    assert!(pool.try_dispatch(|| {}).unwrap_err().is_full());

    release_tx.send(()).unwrap();
    pool.join();
}

#[test]
fn backlog_grows_the_pool() {
    let pool = tidepool::builder()
        .size(2..=4)
        .queue_capacity(2)
        .build()
        .unwrap();

    let completed = Arc::new(AtomicUsize::new(0));
    let mut peak = pool.threads();

    for _ in 0..5 {
        let completed = completed.clone();
        pool.dispatch(move || {
            thread::sleep(Duration::from_millis(50));
            completed.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        peak = peak.max(pool.threads());
    }

    wait_until("all tasks to complete", || {
        completed.load(Ordering::SeqCst) == 5
    });

    assert!(peak > 2, "queue backlog should spawn extra workers");
    assert!(peak <= 4, "the pool must never exceed its maximum size");

    pool.join();
    assert_eq!(pool.completed_tasks(), 5);
}

#[test]
fn idle_workers_shed_to_minimum() {
    let pool = tidepool::builder()
        .size(2..=4)
        .queue_capacity(8)
        .build()
        .unwrap();

    for _ in 0..6 {
        pool.dispatch(|| thread::sleep(Duration::from_millis(50)))
            .unwrap();
    }

    wait_until("the pool to grow past its minimum", || pool.threads() > 2);
    wait_until("idle workers to shed", || pool.threads() == 2);

    // The floor holds once the surplus is gone.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(pool.threads(), 2);

    pool.join();
}

#[test]
fn forced_shutdown_runs_cleanup_for_inflight_task() {
    let pool = tidepool::builder()
        .size(1)
        .queue_capacity(1)
        .shutdown_grace(Duration::from_secs(5))
        .build()
        .unwrap();

    let cleanups = Arc::new(AtomicUsize::new(0));
    let (started_tx, started_rx) = bounded(0);

    let counter = cleanups.clone();
    pool.dispatch_with_cleanup(
        move || {
            started_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(100));
        },
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    )
    .unwrap();
    started_rx.recv().unwrap();

    assert!(pool.shutdown_now());
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(pool.threads(), 0);
}

#[test]
fn panicking_task_still_runs_cleanup() {
    let pool = single_worker(4);

    let cleanups = Arc::new(AtomicUsize::new(0));
    let counter = cleanups.clone();

    pool.dispatch_with_cleanup(
        || panic!("oh no!"),
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    )
    .unwrap();

    wait_until("the panicked task to be counted", || {
        pool.panicked_tasks() == 1
    });
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);

    // The worker survives the panic.
    assert_eq!(pool.threads(), 1);
    pool.join();
}

#[test]
fn forced_shutdown_wakes_blocked_dispatch() {
    let pool = tidepool::builder()
        .size(1)
        .queue_capacity(1)
        .shutdown_grace(Duration::from_secs(5))
        .build()
        .unwrap();

    let (started_tx, started_rx) = bounded(0);

    // A task long enough to outlive the whole shutdown sequence.
    pool.dispatch(move || {
        started_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(500));
    })
    .unwrap();
    started_rx.recv().unwrap();

    // Fill the queue so the next dispatch blocks.
    pool.dispatch(|| {}).unwrap();

    thread::scope(|s| {
        let blocked = s.spawn(|| pool.dispatch(|| {}));

        // Give the dispatcher time to block on the full queue.
        thread::sleep(Duration::from_millis(50));

        assert!(pool.shutdown_now());

        let error = blocked.join().unwrap().unwrap_err();
        assert!(error.is_terminated());
    });

    assert_eq!(pool.threads(), 0);
}

#[test]
fn draining_pool_rejects_new_tasks() {
    let pool = single_worker(4);

    let (started_tx, started_rx) = bounded(0);
    pool.dispatch(move || {
        started_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(100));
    })
    .unwrap();
    started_rx.recv().unwrap();

    thread::scope(|s| {
        s.spawn(|| pool.join());

        wait_until("the drain to reject submissions", || {
            match pool.try_dispatch(|| {}) {
                Err(error) => error.is_terminated(),
                Ok(_) => false,
            }
        });
    });

    assert_eq!(pool.threads(), 0);

    let error = pool.dispatch(|| {}).unwrap_err();
    assert!(error.is_terminated());
}

#[test]
fn pools_are_independent() {
    let a = single_worker(4);
    let b = single_worker(4);

    let count = Arc::new(AtomicUsize::new(0));

    let counter = count.clone();
    a.dispatch(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    let counter = count.clone();
    b.dispatch(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    a.join();

    // Shutting one pool down leaves the other fully operational.
    assert_eq!(b.threads(), 1);
    b.dispatch(|| {}).unwrap();
    b.join();

    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn completed_tasks_are_counted() {
    let pool = single_worker(4);
    assert_eq!(pool.completed_tasks(), 0);

    pool.dispatch(|| {}).unwrap();
    pool.dispatch(|| {}).unwrap();
    pool.join();

    assert_eq!(pool.completed_tasks(), 2);
}

#[test]
fn join_is_idempotent() {
    let pool = ThreadPool::new();

    pool.join();
    pool.join();

    assert_eq!(pool.threads(), 0);
}

#[test]
fn join_timeout_expires_with_slow_task() {
    let pool = single_worker(1);

    let (started_tx, started_rx) = bounded(0);
    pool.dispatch(move || {
        started_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(200));
    })
    .unwrap();
    started_rx.recv().unwrap();

    assert!(!pool.join_timeout(Duration::from_millis(10)));

    // A later join still completes once the task ends.
    pool.join();
    assert_eq!(pool.threads(), 0);
}
