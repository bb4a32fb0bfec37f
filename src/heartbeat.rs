use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

/// The heartbeat timer pair of a transport.
///
/// One cycle is a single task: after `interval` the tick callback fires and
/// a heartbeat is expected; after a further `timeout` the timeout callback
/// fires. A cycle is single-shot, a new one only starts through
/// [`Heart::reset`].
pub(crate) struct Heart {
    interval: Duration,
    timeout: Duration,
    expecting: Arc<AtomicBool>,
    on_tick: Arc<dyn Fn() + Send + Sync>,
    on_timeout: Arc<dyn Fn() + Send + Sync>,
    cycle: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl Heart {
    pub(crate) fn new(
        interval: Duration,
        timeout: Duration,
        on_tick: impl Fn() + Send + Sync + 'static,
        on_timeout: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Heart {
            interval,
            timeout,
            expecting: Arc::new(AtomicBool::new(false)),
            on_tick: Arc::new(on_tick),
            on_timeout: Arc::new(on_timeout),
            cycle: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Whether a tick has fired without a reset since; a pong is only valid
    /// while this is true.
    pub(crate) fn is_expecting(&self) -> bool {
        self.expecting.load(Ordering::SeqCst)
    }

    /// Starts a fresh cycle, cancelling the previous one if any.
    pub(crate) fn start(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let expecting = self.expecting.clone();
        let on_tick = self.on_tick.clone();
        let on_timeout = self.on_timeout.clone();
        let (interval, timeout) = (self.interval, self.timeout);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            expecting.store(true, Ordering::SeqCst);
            on_tick();
            tokio::time::sleep(timeout).await;
            on_timeout();
        });
        let previous = self.cycle.lock().unwrap().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Acknowledges a heartbeat: clears the expecting flag and restarts the
    /// timer pair with the same durations.
    pub(crate) fn reset(&self) {
        self.expecting.store(false, Ordering::SeqCst);
        self.start();
    }

    /// Cancels the current cycle. No callback fires afterward.
    pub(crate) fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.cycle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for Heart {
    fn drop(&mut self) {
        if let Some(handle) = self.cycle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    const INTERVAL: Duration = Duration::from_millis(100);
    const TIMEOUT: Duration = Duration::from_millis(50);

    struct Counters {
        ticks: AtomicUsize,
        timeouts: AtomicUsize,
    }

    fn heart() -> (Heart, Arc<Counters>) {
        let counters = Arc::new(Counters {
            ticks: AtomicUsize::new(0),
            timeouts: AtomicUsize::new(0),
        });
        let (c1, c2) = (counters.clone(), counters.clone());
        let heart = Heart::new(
            INTERVAL,
            TIMEOUT,
            move || {
                c1.ticks.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                c2.timeouts.fetch_add(1, Ordering::SeqCst);
            },
        );
        (heart, counters)
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_once_after_interval() {
        let (heart, counters) = heart();
        heart.start();

        tokio::time::sleep(INTERVAL - Duration::from_millis(1)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 0);
        assert!(!heart.is_expecting());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 1);
        assert!(heart.is_expecting());
        assert_eq!(counters.timeouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_interval_plus_timeout() {
        let (heart, counters) = heart();
        heart.start();

        tokio::time::sleep(INTERVAL + TIMEOUT + Duration::from_millis(1)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 1);
        assert_eq!(counters.timeouts.load(Ordering::SeqCst), 1);

        // the cycle is single-shot
        tokio::time::sleep(INTERVAL + TIMEOUT).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 1);
        assert_eq!(counters.timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_expecting_and_restarts() {
        let (heart, counters) = heart();
        heart.start();

        tokio::time::sleep(INTERVAL + Duration::from_millis(1)).await;
        assert!(heart.is_expecting());

        heart.reset();
        assert!(!heart.is_expecting());

        // the old timeout must not fire
        tokio::time::sleep(TIMEOUT).await;
        assert_eq!(counters.timeouts.load(Ordering::SeqCst), 0);

        // a full new cycle runs
        tokio::time::sleep(INTERVAL).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 2);
        tokio::time::sleep(TIMEOUT + Duration::from_millis(1)).await;
        assert_eq!(counters.timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_resets_keep_the_session_alive() {
        let (heart, counters) = heart();
        heart.start();
        for _ in 0..3 {
            tokio::time::sleep(INTERVAL + Duration::from_millis(1)).await;
            heart.reset();
        }
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 3);
        assert_eq!(counters.timeouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_cancels_all_callbacks() {
        let (heart, counters) = heart();
        heart.start();
        heart.dispose();

        tokio::time::sleep(INTERVAL + TIMEOUT + Duration::from_millis(1)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 0);
        assert_eq!(counters.timeouts.load(Ordering::SeqCst), 0);

        // starting after disposal is a no-op
        heart.start();
        tokio::time::sleep(INTERVAL + TIMEOUT).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 0);
    }
}
