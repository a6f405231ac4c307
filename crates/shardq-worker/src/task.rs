use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use shardq_core::Event;

/// Result of executing one event. Failures are values, not errors: a failed
/// event never affects its siblings in the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed { reason: String },
}

impl TaskOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// Business logic run for each claimed event.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, event: &Event) -> TaskOutcome;
}

/// Completes every event without doing anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcknowledgeHandler;

#[async_trait]
impl TaskHandler for AcknowledgeHandler {
    async fn execute(&self, _event: &Event) -> TaskOutcome {
        TaskOutcome::Completed
    }
}

type BoxFuture = Pin<Box<dyn Future<Output = TaskOutcome> + Send>>;

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler {
    f: Arc<dyn Fn(Event) -> BoxFuture + Send + Sync>,
}

impl FnHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        Self {
            f: Arc::new(move |event| Box::pin(f(event))),
        }
    }
}

#[async_trait]
impl TaskHandler for FnHandler {
    async fn execute(&self, event: &Event) -> TaskOutcome {
        (self.f)(event.clone()).await
    }
}
