//! Validator state and worker pool.

use std::sync::Arc;
use std::time::Duration;

use controller_util::{NamespacedName, Store, WorkQueue};
use crds::Subnet;
use kube::Client;
use tracing::{debug, info, warn};

use crate::conflicts::{ConflictsTracker, StaleRvs};
use crate::error::ControllerError;

pub struct Validator {
    pub(crate) client: Client,
    pub(crate) subnets: Store<Subnet>,
    pub(crate) queue: Arc<WorkQueue<NamespacedName>>,
    workers: usize,
    pub(crate) conflicts: ConflictsTracker,
    pub(crate) stale_rvs: StaleRvs,
}

impl Validator {
    pub fn new(client: Client, workers: usize) -> Self {
        Self {
            client,
            subnets: Store::new(),
            queue: WorkQueue::new(),
            workers,
            conflicts: ConflictsTracker::new(),
            stale_rvs: StaleRvs::new(),
        }
    }

    /// Runs the validator until the watcher dies or a shutdown signal
    /// arrives.
    pub async fn run(self: Arc<Self>) -> Result<(), ControllerError> {
        let mut subnet_watcher = tokio::spawn(Arc::clone(&self).watch_subnets());

        while !self.subnets.has_synced() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("Informer cache synced");

        for _ in 0..self.workers {
            let validator = Arc::clone(&self);
            tokio::spawn(async move { validator.process_queue().await });
        }
        debug!("Launched {} workers", self.workers);

        let result = tokio::select! {
            res = &mut subnet_watcher => match res {
                Ok(Ok(())) => Err(ControllerError::Watch(
                    "Subnet watcher stopped unexpectedly".to_string(),
                )),
                Ok(Err(e)) => Err(ControllerError::Watch(format!("Subnet watcher error: {e}"))),
                Err(e) => Err(ControllerError::Watch(format!("Subnet watcher panicked: {e}"))),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                Ok(())
            }
        };
        info!("Shutting down subnet validation controller");
        self.queue.shut_down();
        result
    }

    async fn process_queue(self: Arc<Self>) {
        while let Some(nsn) = self.queue.get().await {
            self.process_queue_item(nsn).await;
        }
    }

    async fn process_queue_item(&self, nsn: NamespacedName) {
        let result = self.process_subnet(&nsn).await;
        let requeues = self.queue.num_requeues(&nsn);
        match result {
            Ok(()) => {
                debug!("Finished {} with {} requeues", nsn, requeues);
                self.queue.forget(&nsn);
            }
            Err(e) => {
                warn!(
                    "Failed processing {}, requeuing ({} earlier requeues): {}",
                    nsn, requeues, e
                );
                self.queue.add_rate_limited(nsn.clone());
            }
        }
        self.queue.done(&nsn);
    }
}
