use std::sync::Arc;

use shardq_core::{partition_for, Event, NewEvent};
use shardq_store::{EventStore, StoreError};
use tracing::info;
use uuid::Uuid;

use crate::error::Result;

/// Create / look up / remove events. The partition is computed here, once,
/// from the event id and is never recomputed.
#[derive(Clone)]
pub struct EventSubmitter {
    store: Arc<dyn EventStore>,
    num_partitions: u32,
}

impl EventSubmitter {
    pub fn new(store: Arc<dyn EventStore>, num_partitions: u32) -> Self {
        Self {
            store,
            num_partitions,
        }
    }

    pub async fn create_event(&self, new: NewEvent) -> Result<Event> {
        let id = new
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let partition = partition_for(&id, self.num_partitions)?;

        let event = Event::pending(id, new.name, partition, new.scheduled_time, new.payload)
            .with_namespace(new.namespace);
        self.store.insert_event(&event).await?;

        info!(event_id = %event.id, partition, scheduled_time = %event.scheduled_time, "event created");
        Ok(event)
    }

    pub async fn get_event(&self, id: &str) -> Result<Event> {
        self.store
            .get_event(id)
            .await?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() }.into())
    }

    pub async fn remove_event(&self, id: &str) -> Result<()> {
        self.store.delete_event(id).await?;
        info!(event_id = %id, "event removed");
        Ok(())
    }
}
