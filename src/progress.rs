//! Live progress display: named counters with rolling-window throughput.
//!
//! The tracker owns the terminal while it is alive. On start it installs
//! itself into the [`LogRouter`](crate::logging::LogRouter) so tracing
//! output is printed above the bars; on drop it restores plain stderr.
//! Release is idempotent.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use indicatif::MultiProgress;
use indicatif::ProgressBar;
use indicatif::ProgressStyle;

use crate::logging::LogRouter;

const RATE_WINDOW: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    multi: MultiProgress,
    router: LogRouter,
    counters: Mutex<HashMap<&'static str, Counter>>,
    released: AtomicBool,
    started: Instant,
}

impl ProgressTracker {
    /// Create the tracker and route console logs through it.
    #[must_use]
    pub fn start(router: LogRouter) -> Self {
        let multi = MultiProgress::new();
        router.install(multi.clone());
        Self {
            inner: Arc::new(TrackerInner {
                multi,
                router,
                counters: Mutex::new(HashMap::new()),
                released: AtomicBool::new(false),
                started: Instant::now(),
            }),
        }
    }

    /// Get or create the named counter.
    pub fn counter(&self, name: &'static str) -> Counter {
        let mut counters = self.inner.counters.lock().unwrap();
        counters
            .entry(name)
            .or_insert_with(|| {
                let bar = self.inner.multi.add(ProgressBar::new_spinner());
                bar.set_style(
                    ProgressStyle::with_template("{spinner:.green} {prefix:>10} {pos:>7} {msg}")
                        .expect("static progress template"),
                );
                bar.set_prefix(name);
                bar.enable_steady_tick(Duration::from_millis(120));
                Counter {
                    bar,
                    window: Arc::new(Mutex::new(VecDeque::new())),
                }
            })
            .clone()
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Tear down the display and restore plain logging. Safe to call twice;
    /// also runs on drop.
    pub fn finish(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let counters = self.inner.counters.lock().unwrap();
        for counter in counters.values() {
            counter.bar.finish_and_clear();
        }
        let _ = self.inner.multi.clear();
        self.inner.router.restore();
    }
}

impl Drop for TrackerInner {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            let _ = self.multi.clear();
            self.router.restore();
        }
    }
}

/// A named counter. Cloning shares the underlying bar.
#[derive(Clone)]
pub struct Counter {
    bar: ProgressBar,
    window: Arc<Mutex<VecDeque<(Instant, u64)>>>,
}

impl Counter {
    pub fn inc(&self, n: u64) {
        let rate = {
            let mut window = self.window.lock().unwrap();
            let now = Instant::now();
            window.push_back((now, n));
            while window
                .front()
                .is_some_and(|(t, _)| now.duration_since(*t) > RATE_WINDOW)
            {
                window.pop_front();
            }
            let total: u64 = window.iter().map(|(_, c)| c).sum();
            let span = window
                .front()
                .map_or(RATE_WINDOW, |(t, _)| now.duration_since(*t).max(Duration::from_millis(100)));
            total as f64 / span.as_secs_f64()
        };
        self.bar.inc(n);
        self.bar.set_message(format!("{rate:.1}/s"));
    }

    #[must_use]
    pub fn value(&self) -> u64 {
        self.bar.position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_release_twice() {
        let router = LogRouter::new();
        let tracker = ProgressTracker::start(router);
        let posts = tracker.counter("posts");
        posts.inc(3);
        posts.inc(2);
        assert_eq!(posts.value(), 5);
        // Same name returns the same counter.
        assert_eq!(tracker.counter("posts").value(), 5);
        tracker.finish();
        tracker.finish();
    }
}
