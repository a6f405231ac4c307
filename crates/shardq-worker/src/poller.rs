use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Run `job` every `period` until `shutdown` flips to `true`.
///
/// The timer loop only dispatches: each tick spawns one cycle if fewer than
/// `max_in_flight` cycles are running, and is skipped otherwise. On shutdown
/// the loop stops ticking and waits for the in-flight cycles, so a persist
/// transaction that already started is allowed to finish.
pub fn spawn_poller<F, Fut>(
    name: &'static str,
    period: Duration,
    max_in_flight: usize,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let permits = Arc::new(Semaphore::new(max_in_flight.max(1)));
        let mut in_flight = JoinSet::new();
        // `interval` panics on a zero period.
        let period = period.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(poller = name, period_ms = period.as_millis() as u64, "poller started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    while let Some(done) = in_flight.try_join_next() {
                        if let Err(e) = done {
                            error!(poller = name, "cycle task failed: {e}");
                        }
                    }
                    match Arc::clone(&permits).try_acquire_owned() {
                        Ok(permit) => {
                            let cycle = job();
                            in_flight.spawn(async move {
                                cycle.await;
                                drop(permit);
                            });
                        }
                        Err(_) => debug!(poller = name, "cycle still running; tick skipped"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(poller = name, in_flight = in_flight.len(), "poller draining");
        while let Some(done) = in_flight.join_next().await {
            if let Err(e) = done {
                error!(poller = name, "cycle task failed: {e}");
            }
        }
        info!(poller = name, "poller stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn skips_ticks_while_cycle_runs_and_drains_on_shutdown() {
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);

        let (s, f, r, p) = (started.clone(), finished.clone(), running.clone(), peak.clone());
        let handle = spawn_poller("test", Duration::from_millis(5), 1, rx, move || {
            let (s, f, r, p) = (s.clone(), f.clone(), r.clone(), p.clone());
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(40)).await;
                r.fetch_sub(1, Ordering::SeqCst);
                f.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(started.load(Ordering::SeqCst) >= 1);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(started.load(Ordering::SeqCst), finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn zero_period_still_runs() {
        let ran = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);
        let r = ran.clone();
        let handle = spawn_poller("zero", Duration::ZERO, 1, rx, move || {
            let r = r.clone();
            async move {
                r.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(ran.load(Ordering::SeqCst) >= 1);
    }
}
