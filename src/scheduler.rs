// Fixed-period timers
//
// Every timer is a single task that awaits its handler before waiting for
// the next tick, so a handler never runs concurrently with itself. Ticks
// that pass while a handler is still busy are skipped and counted.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    skipped: Arc<AtomicU64>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_skip_counter(Arc::new(AtomicU64::new(0)))
    }

    /// Scheduler that adds skipped ticks to a counter owned by the caller
    pub fn with_skip_counter(skipped: Arc<AtomicU64>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: Vec::new(),
            skipped,
        }
    }

    /// Run `handler` every `period`, first after one full period
    pub fn every<F, Fut>(&mut self, name: &'static str, period: Duration, mut handler: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let skipped = Arc::clone(&self.skipped);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut previous: Option<Instant> = None;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    tick = ticker.tick() => {
                        if let Some(previous) = previous {
                            let periods = (tick - previous).as_nanos() / period.as_nanos().max(1);
                            if periods > 1 {
                                let missed = (periods - 1) as u64;
                                skipped.fetch_add(missed, Ordering::Relaxed);
                                log::debug!(
                                    "Timer '{}' skipped {} tick(s), handler overran",
                                    name,
                                    missed
                                );
                            }
                        }
                        previous = Some(tick);
                        handler().await;
                    }
                }
            }

            log::debug!("Timer '{}' stopped", name);
        });

        log::debug!("Timer '{}' scheduled every {:?}", name, period);
        self.tasks.push((name, task));
    }

    pub fn timer_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn skipped_ticks(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Cancel every timer. A handler that is mid-run finishes first.
    pub async fn stop(mut self) {
        // Receivers see the change even if nobody is waiting right now
        let _ = self.shutdown.send(true);

        for (name, task) in self.tasks.drain(..) {
            if let Err(e) = task.await {
                log::warn!("Timer '{}' ended abnormally: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[tokio::test]
    async fn test_slow_handler_never_overlaps_itself() {
        let runs = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));

        let mut scheduler = Scheduler::new();
        {
            let (runs, in_flight, overlapped) =
                (Arc::clone(&runs), Arc::clone(&in_flight), Arc::clone(&overlapped));
            scheduler.every("slow", Duration::from_millis(10), move || {
                let (runs, in_flight, overlapped) =
                    (Arc::clone(&runs), Arc::clone(&in_flight), Arc::clone(&overlapped));
                async move {
                    if in_flight.swap(true, Ordering::SeqCst) {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(35)).await;
                    runs.fetch_add(1, Ordering::SeqCst);
                    in_flight.store(false, Ordering::SeqCst);
                }
            });
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
        let skipped = scheduler.skipped_ticks();
        scheduler.stop().await;

        assert!(!overlapped.load(Ordering::SeqCst));
        assert!(runs.load(Ordering::SeqCst) >= 2);
        assert!(skipped >= 1, "skipped = {}", skipped);
    }

    #[tokio::test]
    async fn test_stop_cancels_timers() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        {
            let runs = Arc::clone(&runs);
            scheduler.every("fast", Duration::from_millis(5), move || {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        assert_eq!(scheduler.timer_count(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        scheduler.stop().await;
        let after_stop = runs.load(Ordering::SeqCst);
        assert!(after_stop >= 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_first_run_waits_one_period() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        {
            let runs = Arc::clone(&runs);
            scheduler.every("hourly", Duration::from_secs(3600), move || {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.stop().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
