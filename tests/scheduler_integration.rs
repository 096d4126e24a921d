//! Integration tests for the scheduler's public API.
//!
//! Timer-driven behavior runs on tokio's paused clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use patchfetch_core::operation::{Operation, OperationError};
use patchfetch_core::scheduler::{Scheduler, SchedulerOptions};
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
#[error("job failed")]
struct JobFailed;

type Job = Operation<usize, JobFailed>;

/// Records start times and the peak number of jobs in flight.
#[derive(Default)]
struct Tracker {
    running: AtomicUsize,
    peak: AtomicUsize,
    starts: Mutex<Vec<Instant>>,
}

impl Tracker {
    fn job(self: &Arc<Self>, value: usize, work: Duration) -> impl FnOnce() -> Job + Send + 'static {
        let tracker = Arc::clone(self);
        move || {
            Operation::new(move |_ctx| async move {
                tracker.starts.lock().expect("tracker poisoned").push(Instant::now());
                let now = tracker.running.fetch_add(1, Ordering::SeqCst) + 1;
                tracker.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(work).await;
                tracker.running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, OperationError<JobFailed>>(value)
            })
        }
    }
}

#[tokio::test]
async fn test_scheduler_respects_concurrency_and_interval_caps_together() {
    tokio::time::pause();
    let window = Duration::from_secs(1);
    let scheduler = Scheduler::new(
        SchedulerOptions::default()
            .with_concurrency(3)
            .with_interval_cap(5, window),
    )
    .expect("options are valid");
    let tracker = Arc::new(Tracker::default());
    let origin = Instant::now();

    let jobs: Vec<Job> = (0..20)
        .map(|i| scheduler.add(tracker.job(i, Duration::from_millis(300)), 0))
        .collect();
    scheduler.on_idle().await;

    for (i, job) in jobs.into_iter().enumerate() {
        assert_eq!(job.await.expect("job should succeed"), i);
    }
    assert!(tracker.peak.load(Ordering::SeqCst) <= 3);

    let starts = tracker.starts.lock().expect("tracker poisoned").clone();
    assert_eq!(starts.len(), 20);
    let mut per_window = std::collections::BTreeMap::<u128, usize>::new();
    for start in starts {
        let index = (start - origin).as_millis() / window.as_millis();
        *per_window.entry(index).or_default() += 1;
    }
    assert!(
        per_window.values().all(|&count| count <= 5),
        "starts per window: {per_window:?}"
    );
}

#[tokio::test]
async fn test_scheduler_priorities_dequeue_highest_first() {
    let scheduler = Scheduler::new(SchedulerOptions::default().with_concurrency(1).with_auto_start(false))
        .expect("options are valid");
    let order = Arc::new(Mutex::new(Vec::new()));

    for (label, priority) in [("a", 3), ("b", 1), ("c", 3), ("d", 2)] {
        let order = Arc::clone(&order);
        let _job: Operation<(), JobFailed> = scheduler.add(
            move || {
                Operation::new(move |_ctx| async move {
                    order.lock().expect("order poisoned").push((label, priority));
                    Ok(())
                })
            },
            priority,
        );
    }
    scheduler.start();
    scheduler.on_idle().await;

    let priorities: Vec<i32> = order
        .lock()
        .expect("order poisoned")
        .iter()
        .map(|(_, priority)| *priority)
        .collect();
    assert_eq!(priorities, vec![3, 3, 2, 1]);
}

#[tokio::test]
async fn test_scheduler_empty_resolves_before_idle() {
    tokio::time::pause();
    let scheduler = Scheduler::new(SchedulerOptions::default().with_concurrency(2))
        .expect("options are valid");
    let tracker = Arc::new(Tracker::default());

    for i in 0..4 {
        let _job = scheduler.add(tracker.job(i, Duration::from_millis(500)), 0);
    }

    scheduler.on_empty().await;
    assert_eq!(scheduler.size(), 0);
    assert_eq!(scheduler.pending(), 2);

    scheduler.on_idle().await;
    assert_eq!(scheduler.pending(), 0);
}
