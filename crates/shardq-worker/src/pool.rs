use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use shardq_core::Event;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::task::{TaskHandler, TaskOutcome};

/// Bounded executor shared by every partition drain of a node.
///
/// At most `max_concurrent` handler invocations run at once. Each invocation
/// runs on its own task, so a panicking handler is contained and reported as
/// a failed outcome.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    handler: Arc<dyn TaskHandler>,
    timeout: Option<Duration>,
}

impl WorkerPool {
    pub fn new(
        handler: Arc<dyn TaskHandler>,
        max_concurrent: usize,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            handler,
            timeout,
        }
    }

    /// Run the handler for one event, waiting for a free slot first.
    pub async fn execute(&self, event: Event) -> (Event, TaskOutcome) {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return (event, TaskOutcome::failed("worker pool closed")),
        };

        let handler = Arc::clone(&self.handler);
        let timeout = self.timeout;
        let task_event = event.clone();
        let task = tokio::spawn(async move {
            let _permit = permit;
            let run = handler.execute(&task_event);
            match timeout {
                Some(limit) => tokio::time::timeout(limit, run).await.unwrap_or_else(|_| {
                    TaskOutcome::failed(format!(
                        "execution timed out after {}ms",
                        limit.as_millis()
                    ))
                }),
                None => run.await,
            }
        });

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                warn!(event_id = %event.id, "task handler panicked: {message}");
                TaskOutcome::failed(format!("handler panicked: {message}"))
            }
            Err(e) => TaskOutcome::failed(format!("handler task cancelled: {e}")),
        };
        (event, outcome)
    }

    /// Run every event concurrently; outcomes come back in input order.
    pub async fn execute_all(&self, events: Vec<Event>) -> Vec<(Event, TaskOutcome)> {
        join_all(events.into_iter().map(|event| self.execute(event))).await
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::FnHandler;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(id: &str) -> Event {
        Event::pending(id, "test", 0, Utc::now(), "{}")
    }

    #[tokio::test]
    async fn panics_and_timeouts_become_failures() {
        let handler = FnHandler::new(|event: Event| async move {
            match event.id.as_str() {
                "panic" => panic!("boom"),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    TaskOutcome::Completed
                }
                _ => TaskOutcome::Completed,
            }
        });
        let pool = WorkerPool::new(Arc::new(handler), 4, Some(Duration::from_millis(50)));

        let results = pool
            .execute_all(vec![event("ok"), event("panic"), event("slow")])
            .await;
        assert_eq!(results[0].1, TaskOutcome::Completed);
        assert!(matches!(&results[1].1, TaskOutcome::Failed { reason } if reason.contains("boom")));
        assert!(matches!(&results[2].1, TaskOutcome::Failed { reason } if reason.contains("timed out")));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        let handler = FnHandler::new(move |_event: Event| {
            let (r, p) = (r.clone(), p.clone());
            async move {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                r.fetch_sub(1, Ordering::SeqCst);
                TaskOutcome::Completed
            }
        });
        let pool = WorkerPool::new(Arc::new(handler), 3, None);
        let events = (0..20).map(|i| event(&format!("e{i}"))).collect();
        pool.execute_all(events).await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
