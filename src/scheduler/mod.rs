//! Priority scheduler for controllable operations.
//!
//! The [`Scheduler`] holds operation factories in priority order and starts
//! them under a concurrency cap and an optional interval (rate) cap.
//!
//! # Overview
//!
//! - [`Scheduler::add`] returns an [`Operation`] right away. Once the factory
//!   runs, that operation forwards `pause()`, `resume()`, `cancel()` and
//!   progress to the operation the factory produced. Canceling it before it
//!   starts withdraws the entry.
//! - Entries start in descending priority order, FIFO among equal priorities.
//! - With an interval cap, at most `interval_cap` operations start per
//!   `interval`. The window timer only runs while there is queued work.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use patchfetch_core::operation::{Operation, OperationError};
//! use patchfetch_core::scheduler::{Scheduler, SchedulerOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = Scheduler::new(
//!     SchedulerOptions::default()
//!         .with_concurrency(4)
//!         .with_interval_cap(10, Duration::from_secs(1)),
//! )?;
//!
//! let op: Operation<u64, std::io::Error> = scheduler.add(
//!     || Operation::new(|_ctx| async { Ok::<_, OperationError<std::io::Error>>(1) }),
//!     0,
//! );
//! scheduler.on_idle().await;
//! assert_eq!(op.await.ok(), Some(1));
//! # Ok(())
//! # }
//! ```

mod options;
mod priority_queue;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::operation::{
    Capability, ControlHandler, ControlKind, Operation, OperationBuilder, OperationContext,
    OperationError,
};
use priority_queue::PriorityQueue;

pub use options::{SchedulerError, SchedulerOptions};

type Launch = Box<dyn FnOnce(Scheduler) + Send>;

struct Entry {
    id: u64,
    launch: Launch,
}

struct SchedulerState {
    queue: PriorityQueue<Entry>,
    pending: usize,
    paused: bool,
    interval_count: usize,
    interval_end: Option<Instant>,
    interval_timer: Option<JoinHandle<()>>,
    resume_timer: Option<JoinHandle<()>>,
    empty_waiters: Vec<oneshot::Sender<()>>,
    idle_waiters: Vec<oneshot::Sender<()>>,
    next_id: u64,
}

impl SchedulerState {
    fn resolve_waiters(&mut self) {
        for waiter in self.empty_waiters.drain(..) {
            let _ = waiter.send(());
        }
        if self.pending == 0 {
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }
}

impl Drop for SchedulerState {
    fn drop(&mut self) {
        for timer in [self.interval_timer.take(), self.resume_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
    }
}

struct Shared {
    options: SchedulerOptions,
    state: Mutex<SchedulerState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn window_reset(&self, state: &SchedulerState) -> usize {
        if self.options.carryover_concurrency_count {
            state.pending
        } else {
            0
        }
    }

    fn concurrency_allows(&self, state: &SchedulerState) -> bool {
        self.options
            .concurrency
            .is_none_or(|limit| state.pending < limit)
    }

    fn interval_allows(&self, state: &SchedulerState) -> bool {
        match self.options.interval_cap {
            Some(cap) if !self.options.is_interval_ignored() => state.interval_count < cap,
            _ => true,
        }
    }

    /// Returns true while the current window has not elapsed and no periodic
    /// timer is running; arms a one-shot timer for the window boundary.
    fn interval_paused(self: &Arc<Self>, state: &mut SchedulerState) -> bool {
        if self.options.is_interval_ignored() || state.interval_timer.is_some() {
            return false;
        }
        let now = Instant::now();
        match state.interval_end {
            Some(end) if window_open(end, now) => {
                if state.resume_timer.is_none() {
                    self.arm_resume_timer(state, end - now);
                }
                true
            }
            _ => {
                state.interval_count = self.window_reset(state);
                false
            }
        }
    }

    fn try_start_another(self: &Arc<Self>, state: &mut SchedulerState) -> Option<Entry> {
        if state.queue.is_empty() {
            if let Some(timer) = state.interval_timer.take() {
                trace!("queue empty, interval timer torn down");
                timer.abort();
            }
            state.resolve_waiters();
            return None;
        }
        if state.paused {
            return None;
        }

        let can_arm_interval = !self.interval_paused(state);
        if !(self.interval_allows(state) && self.concurrency_allows(state)) {
            return None;
        }

        let entry = state.queue.dequeue()?;
        state.pending += 1;
        state.interval_count += 1;
        if can_arm_interval {
            self.arm_interval(state);
        }
        debug!(
            id = entry.id,
            pending = state.pending,
            queued = state.queue.len(),
            "operation admitted"
        );
        Some(entry)
    }

    fn drain_startable(self: &Arc<Self>, state: &mut SchedulerState) -> Vec<Entry> {
        std::iter::from_fn(|| self.try_start_another(state)).collect()
    }

    fn arm_interval(self: &Arc<Self>, state: &mut SchedulerState) {
        if self.options.is_interval_ignored() || state.interval_timer.is_some() {
            return;
        }
        let period = self.options.interval;
        let first_tick = Instant::now() + period;
        let shared = Arc::downgrade(self);

        state.interval_end = Some(first_tick);
        state.interval_timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first_tick, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.on_interval();
            }
        }));
        trace!(period_ms = period.as_millis(), "interval timer armed");
    }

    fn arm_resume_timer(self: &Arc<Self>, state: &mut SchedulerState, delay: Duration) {
        let shared = Arc::downgrade(self);
        state.resume_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                shared.on_resume_timer();
            }
        }));
        trace!(delay_ms = delay.as_millis(), "window resume timer armed");
    }

    fn roll_window(self: &Arc<Self>, state: &mut SchedulerState) -> Vec<Entry> {
        if state.interval_count == 0 && state.pending == 0 {
            if let Some(timer) = state.interval_timer.take() {
                timer.abort();
            }
        }
        state.interval_count = self.window_reset(state);
        self.drain_startable(state)
    }

    fn on_interval(self: &Arc<Self>) {
        let launches = self.roll_window(&mut self.lock());
        self.launch(launches);
    }

    fn on_resume_timer(self: &Arc<Self>) {
        let launches = {
            let mut state = self.lock();
            state.resume_timer = None;
            let launches = self.roll_window(&mut state);
            self.arm_interval(&mut state);
            launches
        };
        self.launch(launches);
    }

    fn withdraw(self: &Arc<Self>, id: u64) -> bool {
        let (removed, launches) = {
            let mut state = self.lock();
            let removed = state.queue.remove_first(|entry| entry.id == id);
            let launches = if removed.is_some() {
                self.drain_startable(&mut state)
            } else {
                Vec::new()
            };
            (removed, launches)
        };
        self.launch(launches);
        if removed.is_some() {
            debug!(id, "queued operation withdrawn");
        }
        removed.is_some()
    }

    fn finish_one(self: &Arc<Self>) {
        let launches = {
            let mut state = self.lock();
            state.pending = state.pending.saturating_sub(1);
            self.try_start_another(&mut state)
                .into_iter()
                .collect::<Vec<_>>()
        };
        self.launch(launches);
    }

    /// Runs factories outside the lock so they may call back into the scheduler.
    fn launch(self: &Arc<Self>, entries: Vec<Entry>) {
        for entry in entries {
            (entry.launch)(Scheduler {
                shared: Arc::clone(self),
            });
        }
    }
}

/// Runs controllable operations under concurrency and interval caps.
///
/// Cloning yields another handle to the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Creates a scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] when the options are out of range.
    pub fn new(options: SchedulerOptions) -> Result<Self, SchedulerError> {
        options.validate()?;
        let state = SchedulerState {
            queue: PriorityQueue::default(),
            pending: 0,
            paused: !options.auto_start,
            interval_count: 0,
            interval_end: None,
            interval_timer: None,
            resume_timer: None,
            empty_waiters: Vec::new(),
            idle_waiters: Vec::new(),
            next_id: 0,
        };
        Ok(Self {
            shared: Arc::new(Shared {
                options,
                state: Mutex::new(state),
            }),
        })
    }

    /// Queues `factory` at `priority` (higher starts first).
    ///
    /// The returned operation settles with the factory's operation. Must be
    /// called from within a tokio runtime.
    pub fn add<T, E, P, F>(&self, factory: F, priority: i32) -> Operation<T, E, P>
    where
        T: Clone + Send + Sync + 'static,
        E: Send + Sync + 'static,
        P: 'static,
        F: FnOnce() -> Operation<T, E, P> + Send + 'static,
    {
        let (slot_tx, slot_rx) = watch::channel::<Option<Operation<T, E, P>>>(None);
        let id = {
            let mut state = self.shared.lock();
            state.next_id += 1;
            state.next_id
        };

        let builder = OperationBuilder::new().on_cancel(withdraw_handler(
            Arc::downgrade(&self.shared),
            id,
            slot_rx.clone(),
        ));
        let context = builder.context();
        let outer = builder.spawn(move |_ctx| await_started(slot_rx));

        let launch: Launch = Box::new(move |scheduler: Scheduler| {
            let inner = factory();
            delegate(&context, &inner);
            let _ = slot_tx.send(Some(inner.clone()));
            tokio::spawn(async move {
                inner.settled().await;
                for kind in [ControlKind::Pause, ControlKind::Resume, ControlKind::Cancel] {
                    context.install(kind, Capability::Deferred);
                }
                scheduler.shared.finish_one();
            });
        });

        let launches = {
            let mut state = self.shared.lock();
            state.queue.enqueue(Entry { id, launch }, priority);
            debug!(id, priority, queued = state.queue.len(), "operation queued");
            self.shared
                .try_start_another(&mut state)
                .into_iter()
                .collect::<Vec<_>>()
        };
        self.shared.launch(launches);
        outer
    }

    /// Queues every factory at the same priority.
    pub fn add_all<T, E, P, F>(
        &self,
        factories: impl IntoIterator<Item = F>,
        priority: i32,
    ) -> Vec<Operation<T, E, P>>
    where
        T: Clone + Send + Sync + 'static,
        E: Send + Sync + 'static,
        P: 'static,
        F: FnOnce() -> Operation<T, E, P> + Send + 'static,
    {
        factories
            .into_iter()
            .map(|factory| self.add(factory, priority))
            .collect()
    }

    /// Resumes admission of queued operations.
    pub fn start(&self) {
        let launches = {
            let mut state = self.shared.lock();
            if !state.paused {
                return;
            }
            state.paused = false;
            self.shared.drain_startable(&mut state)
        };
        debug!(started = launches.len(), "scheduler started");
        self.shared.launch(launches);
    }

    /// Stops admitting queued operations. Running operations are unaffected.
    pub fn pause(&self) {
        self.shared.lock().paused = true;
        debug!("scheduler paused");
    }

    /// Discards every queued operation; each fails with a cancellation error.
    pub fn clear(&self) {
        let discarded = {
            let mut state = self.shared.lock();
            let discarded = state.queue.clear();
            state.resolve_waiters();
            discarded
        };
        debug!(discarded = discarded.len(), "queue cleared");
    }

    /// Resolves once the queue is empty.
    pub async fn on_empty(&self) {
        let waiter = {
            let mut state = self.shared.lock();
            if state.queue.is_empty() {
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.empty_waiters.push(tx);
            rx
        };
        let _ = waiter.await;
    }

    /// Resolves once the queue is empty and nothing is running.
    pub async fn on_idle(&self) {
        let waiter = {
            let mut state = self.shared.lock();
            if state.queue.is_empty() && state.pending == 0 {
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.idle_waiters.push(tx);
            rx
        };
        let _ = waiter.await;
    }

    /// Number of queued operations.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Number of running operations.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.lock().pending
    }

    /// Returns true while admission is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }
}

async fn await_started<T, E, P>(
    mut slot: watch::Receiver<Option<Operation<T, E, P>>>,
) -> Result<T, OperationError<E>>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
    P: 'static,
{
    let started = slot
        .wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|current| (*current).clone());
    // The entry was cleared or withdrawn.
    let Some(inner) = started else {
        return Err(OperationError::Canceled);
    };
    inner.wait().await
}

fn withdraw_handler<T, E, P>(
    shared: Weak<Shared>,
    id: u64,
    slot: watch::Receiver<Option<Operation<T, E, P>>>,
) -> impl ControlHandler<E> + 'static
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
    P: 'static,
{
    move || {
        let shared = shared.clone();
        let mut slot = slot.clone();
        async move {
            if shared.upgrade().is_some_and(|shared| shared.withdraw(id)) {
                return Ok(());
            }
            // Dequeued already: cancel whatever the factory produced.
            let started = slot
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|current| (*current).clone());
            match started {
                Some(inner) => inner.cancel().await,
                None => Ok(()),
            }
        }
    }
}

fn delegate<T, E, P>(context: &OperationContext<E, P>, inner: &Operation<T, E, P>)
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
    P: 'static,
{
    for kind in [ControlKind::Pause, ControlKind::Resume, ControlKind::Cancel] {
        let target = inner.clone();
        let handler = move || {
            let target = target.clone();
            async move {
                match kind {
                    ControlKind::Pause => target.pause().await,
                    ControlKind::Resume => target.resume().await,
                    ControlKind::Cancel => target.cancel().await,
                }
            }
        };
        context.install(kind, Capability::Handler(Arc::new(handler)));
    }

    let context = context.clone();
    inner.on_progress(move |stats| context.progress(stats));
}

/// A window is over at its end instant; that instant belongs to the next one.
fn window_open(end: Instant, now: Instant) -> bool {
    now < end
}
