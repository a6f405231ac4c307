use std::sync::Arc;
use std::time::Duration;

use shardq_core::ShardqConfig;
use shardq_store::EventStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    bus::MessageBus,
    pipeline::ClaimAndProcessPipeline,
    poller::spawn_poller,
    publisher::OutboxPublisher,
    reaper::StuckClaimReaper,
    state_machine::PartitionOwnershipStateMachine,
    task::TaskHandler,
    tracker::PartitionOwnershipTracker,
};

/// One worker process: ownership model plus the three periodic components.
pub struct WorkerNode {
    instance_name: String,
    tracker: Arc<PartitionOwnershipTracker>,
    state_machine: Arc<PartitionOwnershipStateMachine>,
    pipeline: ClaimAndProcessPipeline,
    publisher: OutboxPublisher,
    reaper: StuckClaimReaper,
    config: ShardqConfig,
}

/// Running pollers of a started [`WorkerNode`].
pub struct NodeHandle {
    pollers: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    /// Wait until every poller has stopped and drained its in-flight cycles.
    pub async fn join(self) {
        for poller in self.pollers {
            if let Err(e) = poller.await {
                error!("poller task failed: {e}");
            }
        }
    }
}

impl WorkerNode {
    pub fn new(
        config: &ShardqConfig,
        store: Arc<dyn EventStore>,
        bus: Arc<dyn MessageBus>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        let instance_name = if config.node.instance_name.is_empty() {
            format!("worker-{}", Uuid::new_v4())
        } else {
            config.node.instance_name.clone()
        };
        let tracker = PartitionOwnershipTracker::new();
        let state_machine =
            PartitionOwnershipStateMachine::new(Arc::clone(&tracker), config.cluster.num_partitions);
        let pipeline = ClaimAndProcessPipeline::new(
            Arc::clone(&store),
            Arc::clone(&tracker),
            handler,
            &config.pipeline,
        );
        let publisher =
            OutboxPublisher::new(Arc::clone(&store), Arc::clone(&tracker), bus, &config.outbox);
        let reaper = StuckClaimReaper::new(
            store,
            Arc::clone(&tracker),
            Duration::from_secs(config.reaper.stale_timeout_secs),
        );

        Self {
            instance_name,
            tracker,
            state_machine,
            pipeline,
            publisher,
            reaper,
            config: config.clone(),
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn tracker(&self) -> &Arc<PartitionOwnershipTracker> {
        &self.tracker
    }

    /// Listener to register with the coordinator.
    pub fn state_machine(&self) -> &Arc<PartitionOwnershipStateMachine> {
        &self.state_machine
    }

    pub fn pipeline(&self) -> &ClaimAndProcessPipeline {
        &self.pipeline
    }

    pub fn publisher(&self) -> &OutboxPublisher {
        &self.publisher
    }

    pub fn reaper(&self) -> &StuckClaimReaper {
        &self.reaper
    }

    /// Spawn the pipeline, publisher and reaper pollers. They stop when
    /// `shutdown` flips to `true`.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> NodeHandle {
        let pipeline = self.pipeline.clone();
        let pipeline_poller = spawn_poller(
            "pipeline",
            Duration::from_millis(self.config.pipeline.poll_interval_ms),
            self.config.pipeline.max_in_flight_cycles,
            shutdown.clone(),
            move || {
                let pipeline = pipeline.clone();
                async move {
                    pipeline.run_cycle().await;
                }
            },
        );

        let publisher = self.publisher.clone();
        let publisher_poller = spawn_poller(
            "publisher",
            Duration::from_millis(self.config.outbox.poll_interval_ms),
            self.config.outbox.max_in_flight_cycles,
            shutdown.clone(),
            move || {
                let publisher = publisher.clone();
                async move {
                    publisher.run_cycle().await;
                }
            },
        );

        let reaper = self.reaper.clone();
        let reaper_poller = spawn_poller(
            "reaper",
            Duration::from_secs(self.config.reaper.interval_secs),
            1,
            shutdown,
            move || {
                let reaper = reaper.clone();
                async move {
                    reaper.reap().await;
                }
            },
        );

        info!(instance = %self.instance_name, "worker node started");
        NodeHandle {
            pollers: vec![pipeline_poller, publisher_poller, reaper_poller],
        }
    }
}
