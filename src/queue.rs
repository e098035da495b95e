//! Bounded-concurrency background task queue.
//!
//! The queue stores argument tuples, never handles to in-flight work, so
//! memory scales with the waiting set rather than the running set. Tasks are
//! started while `running < hard_concurrency` and, when a soft limit is
//! configured, `active < soft_concurrency`; a task that runs longer than the
//! soft timeout is demoted out of `active` so faster work can drain past it.
//!
//! Tasks that fail with a cancellation-style error (timeout/abort) are
//! re-appended to the tail with the same arguments; all other errors are
//! reported to the observer and dropped.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::Result;

pub const DEFAULT_SOFT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Strict cap on concurrently running tasks.
    pub hard_concurrency: usize,
    /// Admission-control cap; long-running tasks stop counting against it
    /// after `soft_timeout`.
    pub soft_concurrency: Option<usize>,
    /// Producers suspend in `add`/`prepend` while the waiting set is at this
    /// size.
    pub max_queue_size: Option<usize>,
    pub soft_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            hard_concurrency: 1,
            soft_concurrency: None,
            max_queue_size: None,
            soft_timeout: DEFAULT_SOFT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    Queued,
    Completed,
    Errored,
    Drained,
}

type Worker<T> = dyn Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync;
type Observer = dyn Fn(QueueEvent) + Send + Sync;

struct State<T> {
    waiting: VecDeque<T>,
    running: usize,
    active: usize,
}

struct Inner<T> {
    name: &'static str,
    config: QueueConfig,
    worker: Box<Worker<T>>,
    observer: Mutex<Option<Arc<Observer>>>,
    state: Mutex<State<T>>,
    /// Signalled when waiting-set space frees up.
    space: Notify,
    /// Signalled when a task settles (for `process_all`).
    settled: Notify,
}

pub struct TaskQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> TaskQueue<T> {
    pub fn new<F, Fut>(name: &'static str, config: QueueConfig, worker: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                name,
                config,
                worker: Box::new(move |args| {
                    Box::pin(worker(args)) as BoxFuture<'static, Result<()>>
                }),
                observer: Mutex::new(None),
                state: Mutex::new(State {
                    waiting: VecDeque::new(),
                    running: 0,
                    active: 0,
                }),
                space: Notify::new(),
                settled: Notify::new(),
            }),
        }
    }

    pub fn set_observer<F>(&self, observer: F)
    where
        F: Fn(QueueEvent) + Send + Sync + 'static,
    {
        *self.inner.observer.lock().unwrap() = Some(Arc::new(observer));
    }

    /// Append to the tail. Suspends while the waiting set is full.
    pub async fn add(&self, args: T) {
        self.push(args, false).await;
    }

    /// Insert at the head, breaking FIFO for priority. Same backpressure as
    /// `add`. Used for work that already carries a decoded record, so the
    /// record is consumed before newer additions evict it.
    pub async fn prepend(&self, args: T) {
        self.push(args, true).await;
    }

    async fn push(&self, args: T, front: bool) {
        let mut slot = Some(args);
        loop {
            let mut notified = pin!(self.inner.space.notified());
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock().unwrap();
                let has_space = self
                    .inner
                    .config
                    .max_queue_size
                    .is_none_or(|cap| state.waiting.len() < cap);
                if has_space {
                    let args = slot.take().expect("push slot consumed twice");
                    if front {
                        state.waiting.push_front(args);
                    } else {
                        state.waiting.push_back(args);
                    }
                    drop(state);
                    self.emit(QueueEvent::Queued);
                    self.pump();
                    return;
                }
            }
            notified.await;
        }
    }

    /// Completes when both the waiting set and the running set are empty.
    /// Safe to call concurrently with producers.
    pub async fn process_all(&self) {
        loop {
            let mut notified = pin!(self.inner.settled.notified());
            notified.as_mut().enable();
            {
                let state = self.inner.state.lock().unwrap();
                if state.waiting.is_empty() && state.running == 0 {
                    drop(state);
                    self.emit(QueueEvent::Drained);
                    return;
                }
            }
            notified.await;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().waiting.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn running(&self) -> usize {
        self.inner.state.lock().unwrap().running
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.inner.state.lock().unwrap().active
    }

    /// Waiting set empty and nothing running.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.waiting.is_empty() && state.running == 0
    }

    fn emit(&self, event: QueueEvent) {
        let observer = self.inner.observer.lock().unwrap().clone();
        if let Some(observer) = observer {
            observer(event);
        }
    }

    /// Start as many waiting tasks as the limits allow.
    fn pump(&self) {
        let mut started = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            while !state.waiting.is_empty()
                && state.running < self.inner.config.hard_concurrency
                && self
                    .inner
                    .config
                    .soft_concurrency
                    .is_none_or(|soft| state.active < soft)
            {
                let args = state.waiting.pop_front().expect("non-empty waiting set");
                state.running += 1;
                state.active += 1;
                started.push(args);
            }
        }
        if started.is_empty() {
            return;
        }
        for args in started {
            self.spawn_task(args);
        }
        self.inner.space.notify_waiters();
    }

    fn spawn_task(&self, args: T) {
        let queue = self.clone();
        tokio::spawn(async move {
            let retry_args = args.clone();
            let soft_enabled = queue.inner.config.soft_concurrency.is_some();
            let mut demoted = false;

            let worker_fut = (queue.inner.worker)(args);
            let mut worker_fut = pin!(worker_fut);
            let result = loop {
                tokio::select! {
                    res = &mut worker_fut => break res,
                    () = tokio::time::sleep(queue.inner.config.soft_timeout),
                        if soft_enabled && !demoted =>
                    {
                        demoted = true;
                        queue.inner.state.lock().unwrap().active -= 1;
                        queue.pump();
                    }
                }
            };

            let requeue = matches!(&result, Err(e) if e.is_cancellation());
            {
                let mut state = queue.inner.state.lock().unwrap();
                state.running -= 1;
                if !demoted {
                    state.active -= 1;
                }
                if requeue {
                    state.waiting.push_back(retry_args);
                }
            }
            match &result {
                Ok(()) => queue.emit(QueueEvent::Completed),
                Err(e) if e.is_cancellation() => {
                    tracing::debug!("{}: task interrupted ({e}), requeued", queue.inner.name);
                    queue.emit(QueueEvent::Queued);
                }
                Err(e) => {
                    tracing::warn!("{}: task failed: {e}", queue.inner.name);
                    queue.emit(QueueEvent::Errored);
                }
            }
            queue.inner.space.notify_waiters();
            queue.inner.settled.notify_waiters();
            queue.pump();
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::PinakesError;

    #[tokio::test]
    async fn processes_in_fifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let queue = TaskQueue::new(
            "test",
            QueueConfig {
                hard_concurrency: 1,
                ..QueueConfig::default()
            },
            move |n: u32| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(n);
                    Ok(())
                }
            },
        );
        for n in 0..5 {
            queue.add(n).await;
        }
        queue.process_all().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn prepend_jumps_the_line() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let gate = Arc::new(Notify::new());
        let gate_task = Arc::clone(&gate);
        let queue = TaskQueue::new(
            "test",
            QueueConfig {
                hard_concurrency: 1,
                ..QueueConfig::default()
            },
            move |n: u32| {
                let seen = Arc::clone(&seen);
                let gate = Arc::clone(&gate_task);
                async move {
                    if n == 0 {
                        // Hold the lane so later pushes land in the waiting set.
                        gate.notified().await;
                    }
                    seen.lock().unwrap().push(n);
                    Ok(())
                }
            },
        );
        queue.add(0).await;
        tokio::task::yield_now().await;
        queue.add(1).await;
        queue.add(2).await;
        queue.prepend(9).await;
        gate.notify_waiters();
        queue.process_all().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 9, 1, 2]);
    }

    #[tokio::test]
    async fn hard_concurrency_is_strict() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current_task, peak_task) = (Arc::clone(&current), Arc::clone(&peak));
        let queue = TaskQueue::new(
            "test",
            QueueConfig {
                hard_concurrency: 3,
                ..QueueConfig::default()
            },
            move |_: ()| {
                let current = Arc::clone(&current_task);
                let peak = Arc::clone(&peak_task);
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );
        for _ in 0..20 {
            queue.add(()).await;
        }
        queue.process_all().await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn add_suspends_at_max_queue_size() {
        let gate = Arc::new(Notify::new());
        let gate_task = Arc::clone(&gate);
        let queue = TaskQueue::new(
            "test",
            QueueConfig {
                hard_concurrency: 1,
                max_queue_size: Some(1),
                ..QueueConfig::default()
            },
            move |_: u32| {
                let gate = Arc::clone(&gate_task);
                async move {
                    gate.notified().await;
                    Ok(())
                }
            },
        );
        queue.add(0).await;
        tokio::task::yield_now().await;
        queue.add(1).await; // fills the waiting set
        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.add(2)).await;
        assert!(blocked.is_err(), "third add should suspend");

        let notifier = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move {
                loop {
                    gate.notify_waiters();
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        });
        queue.add(2).await;
        queue.process_all().await;
        notifier.abort();
    }

    #[tokio::test]
    async fn cancellation_errors_requeue() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_task = Arc::clone(&attempts);
        let queue = TaskQueue::new(
            "test",
            QueueConfig::default(),
            move |_: ()| {
                let attempts = Arc::clone(&attempts_task);
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(PinakesError::Timeout("flaky fetch".into()))
                    } else {
                        Ok(())
                    }
                }
            },
        );
        queue.add(()).await;
        queue.process_all().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn other_errors_drop_the_task() {
        let errors = Arc::new(AtomicUsize::new(0));
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_task = Arc::clone(&attempts);
        let queue = TaskQueue::new(
            "test",
            QueueConfig::default(),
            move |_: ()| {
                let attempts = Arc::clone(&attempts_task);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(PinakesError::Custom("boom".into()))
                }
            },
        );
        let errors_obs = Arc::clone(&errors);
        queue.set_observer(move |event| {
            if event == QueueEvent::Errored {
                errors_obs.fetch_add(1, Ordering::SeqCst);
            }
        });
        queue.add(()).await;
        queue.process_all().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn soft_demotion_lets_fast_tasks_drain() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let queue = TaskQueue::new(
            "test",
            QueueConfig {
                hard_concurrency: 2,
                soft_concurrency: Some(1),
                soft_timeout: Duration::from_millis(20),
                ..QueueConfig::default()
            },
            move |n: u32| {
                let seen = Arc::clone(&seen);
                async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    seen.lock().unwrap().push(n);
                    Ok(())
                }
            },
        );
        queue.add(0).await;
        queue.add(1).await;
        queue.process_all().await;
        // The slow task was demoted after 20ms, letting task 1 run and
        // finish first despite the soft limit of 1.
        assert_eq!(*order.lock().unwrap(), vec![1, 0]);
    }
}
