//! Periodic cache refresh.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::NodeCache;

/// A background task that refreshes a [`NodeCache`] on a fixed interval.
pub struct RefreshTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RefreshTask {
    /// Start refreshing `cache` every `every`, first after one interval.
    #[must_use]
    pub fn spawn(cache: Arc<NodeCache>, every: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?every, "Started node cache refresh loop");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match cache.refresh().await {
                            Ok(snapshot) => debug!(generation = snapshot.generation(), "Periodic refresh done"),
                            Err(e) => warn!(error = %e, "Periodic node cache refresh failed"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Stopped node cache refresh loop");
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Refresh loop ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use metal_agent_client::{FakeControlClient, Op, RemoteControlClient};
    use metal_agent_core::{HostName, Node, NodeId};

    use super::*;
    use crate::config::AgentConfig;
    use crate::hash_ring::HashPartitioner;
    use crate::registry::{InMemoryServiceRegistry, InMemoryWorkloadRegistry};

    #[tokio::test(start_paused = true)]
    async fn refreshes_until_shut_down() {
        let host = HostName::localhost();
        let config = Arc::new(AgentConfig::for_host(host.clone()));
        let client = Arc::new(FakeControlClient::new());
        client.insert_node(Node::new(NodeId::new("n1").unwrap()));
        let client: Arc<dyn RemoteControlClient> = client.clone();
        let services = Arc::new(InMemoryServiceRegistry::with_hosts(
            &config.hypervisor_type,
            [&host],
        ));
        let partitioner = Arc::new(HashPartitioner::new(
            Arc::clone(&config),
            Arc::clone(&client),
            services,
        ));
        let cache = Arc::new(NodeCache::new(
            Arc::clone(&config),
            client,
            Arc::new(InMemoryWorkloadRegistry::new()),
            partitioner,
        ));

        let task = RefreshTask::spawn(Arc::clone(&cache), Duration::from_secs(60));
        assert!(!cache.is_ready());

        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(cache.snapshot().generation(), 2);
        assert!(cache.snapshot().contains(&NodeId::new("n1").unwrap()));

        task.shutdown().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(cache.snapshot().generation(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_running() {
        let host = HostName::localhost();
        let config = Arc::new(AgentConfig::for_host(host.clone()));
        let fake = Arc::new(FakeControlClient::new());
        fake.fail_next(
            Op::ListNodes,
            metal_agent_client::ClientError::Unavailable("down".into()),
        );
        let client: Arc<dyn RemoteControlClient> = fake.clone();
        let services = Arc::new(InMemoryServiceRegistry::with_hosts(
            &config.hypervisor_type,
            [&host],
        ));
        let partitioner = Arc::new(HashPartitioner::new(
            Arc::clone(&config),
            Arc::clone(&client),
            services,
        ));
        let cache = Arc::new(NodeCache::new(
            Arc::clone(&config),
            client,
            Arc::new(InMemoryWorkloadRegistry::new()),
            partitioner,
        ));

        let task = RefreshTask::spawn(Arc::clone(&cache), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!cache.is_ready());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(cache.is_ready());
        assert_eq!(fake.count(Op::ListNodes), 2);
        task.shutdown().await;
    }
}
