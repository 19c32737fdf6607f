use super::pool::{PoolError, TaskState, WorkerPool};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};

#[test]
pub fn submitted_tasks_run() {
    let pool = WorkerPool::new("test", 2, false).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let handles = (0..8)
        .map(|_| {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        })
        .collect::<Vec<_>>();

    for handle in handles {
        assert_eq!(handle.wait(), TaskState::Finished);
    }
    assert_eq!(counter.load(Ordering::SeqCst), 8);
}

#[test]
pub fn queued_tasks_can_be_cancelled() {
    let pool = WorkerPool::new("single", 1, false).unwrap();
    let (release, blocked) = mpsc::channel::<()>();
    let (started, is_started) = mpsc::channel::<()>();

    let first = pool
        .submit(move || {
            started.send(()).unwrap();
            blocked.recv().unwrap();
        })
        .unwrap();
    is_started.recv().unwrap();

    let second = pool.submit(|| panic!("cancelled task ran")).unwrap();
    assert_eq!(second.state(), TaskState::Queued);
    assert!(second.cancel());
    assert!(!first.cancel());

    release.send(()).unwrap();
    assert_eq!(first.wait(), TaskState::Finished);
    assert_eq!(second.wait(), TaskState::Cancelled);
}

#[test]
pub fn panics_are_contained() {
    let pool = WorkerPool::new("panic", 1, false).unwrap();

    let handle = pool.submit(|| panic!("task failed")).unwrap();

    assert_eq!(handle.wait(), TaskState::Panicked);
    assert_eq!(pool.submit(|| {}).unwrap().wait(), TaskState::Finished);
}

#[test]
pub fn shutdown_cancels_and_refuses_work() {
    let pool = WorkerPool::new("shutdown", 1, false).unwrap();
    let (release, blocked) = mpsc::channel::<()>();
    let (started, is_started) = mpsc::channel::<()>();

    let running = pool
        .submit(move || {
            started.send(()).unwrap();
            blocked.recv().unwrap();
        })
        .unwrap();
    is_started.recv().unwrap();
    let queued = pool.submit(|| {}).unwrap();

    assert_eq!(pool.shutdown_now(), 1);
    assert_eq!(queued.wait(), TaskState::Cancelled);
    assert!(matches!(pool.submit(|| {}), Err(PoolError::ShutDown(_))));

    release.send(()).unwrap();
    assert_eq!(running.wait(), TaskState::Finished);
}

#[test]
pub fn resize_keeps_accepting_work() {
    let pool = WorkerPool::new("resize", 1, false).unwrap();

    pool.resize(3).unwrap();

    assert_eq!(pool.size(), 3);
    assert_eq!(pool.submit(|| {}).unwrap().wait(), TaskState::Finished);
    assert!(matches!(pool.resize(0), Err(PoolError::Empty(_))));
    assert_eq!(pool.size(), 3);
}

#[test]
pub fn shrinking_bounds_queued_tasks() {
    let pool = WorkerPool::new("shrink", 2, false).unwrap();
    let (release, blocked) = mpsc::channel::<()>();
    let blocked = Arc::new(parking_lot::Mutex::new(blocked));
    let (started, is_started) = mpsc::channel::<()>();

    let blockers = (0..2)
        .map(|_| {
            let blocked = blocked.clone();
            let started = started.clone();
            pool.submit(move || {
                started.send(()).unwrap();
                blocked.lock().recv().unwrap();
            })
            .unwrap()
        })
        .collect::<Vec<_>>();
    is_started.recv().unwrap();
    is_started.recv().unwrap();

    let active = Arc::new(AtomicUsize::new(0));
    let most = Arc::new(AtomicUsize::new(0));
    let sleeper = || {
        let active = active.clone();
        let most = most.clone();
        move || {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            most.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            active.fetch_sub(1, Ordering::SeqCst);
        }
    };

    let mut sleepers = (0..6).map(|_| pool.submit(sleeper()).unwrap()).collect::<Vec<_>>();
    pool.resize(1).unwrap();
    sleepers.extend((0..3).map(|_| pool.submit(sleeper()).unwrap()));

    release.send(()).unwrap();
    release.send(()).unwrap();
    for handle in blockers.iter().chain(sleepers.iter()) {
        assert_eq!(handle.wait(), TaskState::Finished);
    }

    assert_eq!(pool.size(), 1);
    assert_eq!(most.load(Ordering::SeqCst), 1);
}
