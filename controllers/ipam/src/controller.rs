//! IPAM controller state and worker pool.
//!
//! Holds the informer stores, the work queue keyed by attachment
//! namespaced-name, the per-VNI address cache, and the per-attachment
//! anticipation records. Event handlers translate object notifications into
//! queued keys; a fixed pool of workers drains the queue one attachment at
//! a time.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use controller_util::{NamespacedName, Store, WorkQueue};
use crds::{IPLock, NetworkAttachment, Subnet};
use kube::{Api, Client};
use tracing::{debug, error, info, warn};
use uint32set::UInt32Set;

use crate::error::ControllerError;
use crate::lock;
use crate::metrics::IpamMetrics;

pub(crate) const ATTACHMENT_SUBNET_INDEX: &str = "subnet";
pub(crate) const OWNING_ATTACHMENT_INDEX: &str = "owningAttachment";

/// Runtime configuration, read from the environment in `main`.
pub struct Config {
    pub workers: usize,
    pub metrics_addr: SocketAddr,
    pub metrics_path: String,
}

/// Local state for one NetworkAttachment, used to remember a status update
/// while it is in flight. When the attachment's resourceVersion is either
/// `anticipating_resource_version` or `anticipated_resource_version`, the
/// subnet's resourceVersion equals `anticipation_subnet_rv`, and
/// `anticipated_ipv4` is set, then that address has been written into the
/// attachment's status and an IPLock supporting it exists, even if this
/// controller has not yet been notified about either write. Any other
/// observed resourceVersion zeroes all four fields.
///
/// The queue's de-duplication guarantees at most one worker touches the
/// entry for a given attachment at a time.
#[derive(Debug, Clone, Default)]
pub struct NetworkAttachmentData {
    pub anticipated_ipv4: Option<Ipv4Addr>,
    pub anticipating_resource_version: String,
    pub anticipated_resource_version: String,
    pub anticipation_subnet_rv: String,
}

impl NetworkAttachmentData {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

pub struct IpamController {
    pub(crate) client: Client,
    pub(crate) subnets: Store<Subnet>,
    pub(crate) attachments: Store<NetworkAttachment>,
    pub(crate) locks: Store<IPLock>,
    pub(crate) queue: Arc<WorkQueue<NamespacedName>>,
    pub(crate) metrics: Arc<IpamMetrics>,
    config: Config,

    atts: Mutex<HashMap<NamespacedName, Arc<Mutex<NetworkAttachmentData>>>>,
    addr_cache: Mutex<HashMap<u32, UInt32Set>>,
}

impl IpamController {
    pub fn new(client: Client, config: Config) -> Result<Self, ControllerError> {
        let metrics = Arc::new(IpamMetrics::new()?);
        let attachments = Store::new().with_indexer(ATTACHMENT_SUBNET_INDEX, |att: &NetworkAttachment| {
            vec![att.spec.subnet.clone()]
        });
        let locks = Store::new().with_indexer(OWNING_ATTACHMENT_INDEX, |ipl: &IPLock| {
            lock::owning_attachments(&ipl.metadata)
        });
        Ok(Self {
            client,
            subnets: Store::new(),
            attachments,
            locks,
            queue: WorkQueue::new(),
            metrics,
            config,
            atts: Mutex::new(HashMap::new()),
            addr_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Runs the controller until a watcher dies or a shutdown signal
    /// arrives.
    pub async fn run(self: Arc<Self>) -> Result<(), ControllerError> {
        {
            let metrics = Arc::clone(&self.metrics);
            let addr = self.config.metrics_addr;
            let path = self.config.metrics_path.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::metrics::serve(metrics, addr, path).await {
                    error!("Metrics endpoint crashed: {}", e);
                }
            });
        }

        let mut subnet_watcher = tokio::spawn(Arc::clone(&self).watch_subnets());
        let mut attachment_watcher = tokio::spawn(Arc::clone(&self).watch_attachments());
        let mut lock_watcher = tokio::spawn(Arc::clone(&self).watch_locks());
        debug!("Watchers forked");

        self.wait_for_cache_sync().await;
        info!("Caches synced");

        for _ in 0..self.config.workers {
            let ctlr = Arc::clone(&self);
            tokio::spawn(async move { ctlr.process_queue().await });
        }
        debug!("Launched {} workers", self.config.workers);

        let result = tokio::select! {
            res = &mut subnet_watcher => watcher_exit("Subnet", res),
            res = &mut attachment_watcher => watcher_exit("NetworkAttachment", res),
            res = &mut lock_watcher => watcher_exit("IPLock", res),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                Ok(())
            }
        };
        self.queue.shut_down();
        result
    }

    async fn wait_for_cache_sync(&self) {
        while !(self.subnets.has_synced()
            && self.attachments.has_synced()
            && self.locks.has_synced())
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn process_queue(self: Arc<Self>) {
        while let Some(nsn) = self.queue.get().await {
            self.process_queue_item(nsn).await;
        }
    }

    async fn process_queue_item(&self, nsn: NamespacedName) {
        let result = self.process_network_attachment(&nsn).await;
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

    /// A subnet changed; every attachment referencing it needs another look.
    pub(crate) fn on_subnet_notify(&self, subnet: &Subnet, op: &str) {
        let nsn = NamespacedName::from_meta(&subnet.metadata);
        let subnet_attachments = self.attachments.by_index(ATTACHMENT_SUBNET_INDEX, &nsn.name);
        debug!(
            "Notified of {} of Subnet {}, queuing {} attachments",
            op,
            nsn,
            subnet_attachments.len()
        );
        for att in subnet_attachments {
            self.queue.add(NamespacedName::from_meta(&att.metadata));
        }
    }

    /// A lock changed; fold it into the address cache and reconsider its
    /// owners. Lock notifications are the only external source feeding the
    /// cache; reconciler-initiated picks insert at selection time, so the
    /// cache stays consistent before the notification arrives.
    pub(crate) fn on_lock_notify(&self, ipl: &IPLock, op: &str, exists: bool) {
        let namespace = ipl.metadata.namespace.as_deref().unwrap_or_default();
        let name = ipl.metadata.name.as_deref().unwrap_or_default();
        let (vni, addr_u) = match lock::parse_lock_name(name) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("Error parsing IPLock name {:?}: {}", name, e);
                return;
            }
        };
        let (addr_op, changed) = if exists {
            ("ensured", self.take_address(vni, addr_u))
        } else {
            ("released", self.release_address(vni, addr_u))
        };
        let owner_names = lock::owning_attachments(&ipl.metadata);
        debug!(
            "At notify of {} of IPLock {}/{}, {} {}, changed={}, owners={}",
            op,
            namespace,
            name,
            addr_op,
            Ipv4Addr::from(addr_u),
            changed,
            owner_names.len()
        );
        for owner_name in owner_names {
            self.queue.add(NamespacedName::new(namespace, owner_name));
        }
    }

    pub(crate) fn take_address(&self, vni: u32, addr_u: u32) -> bool {
        let mut cache = lock_guard(&self.addr_cache);
        cache.entry(vni).or_default().add(addr_u)
    }

    /// Selects and inserts a free address in `[min, max]` in one step.
    pub(crate) fn pick_address(&self, vni: u32, min: u32, max: u32) -> Option<u32> {
        let mut cache = lock_guard(&self.addr_cache);
        cache.entry(vni).or_default().add_one_in_range(min, max)
    }

    pub(crate) fn release_address(&self, vni: u32, addr_u: u32) -> bool {
        let mut cache = lock_guard(&self.addr_cache);
        let Some(addrs) = cache.get_mut(&vni) else {
            return false;
        };
        let changed = addrs.remove(addr_u);
        if addrs.is_empty() {
            cache.remove(&vni);
        }
        changed
    }

    pub(crate) fn get_attachment_data(
        &self,
        nsn: &NamespacedName,
        add_if_missing: bool,
    ) -> Option<Arc<Mutex<NetworkAttachmentData>>> {
        let mut atts = lock_guard(&self.atts);
        if let Some(data) = atts.get(nsn) {
            return Some(Arc::clone(data));
        }
        if !add_if_missing {
            return None;
        }
        let data = Arc::new(Mutex::new(NetworkAttachmentData::default()));
        atts.insert(nsn.clone(), Arc::clone(&data));
        debug!("Created attachment data for {}", nsn);
        Some(data)
    }

    pub(crate) fn clear_attachment_data(&self, nsn: &NamespacedName) {
        if lock_guard(&self.atts).remove(nsn).is_some() {
            debug!("Deleted attachment data for {}", nsn);
        }
    }

    pub(crate) fn lock_api(&self, namespace: &str) -> Api<IPLock> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub(crate) fn attachment_api(&self, namespace: &str) -> Api<NetworkAttachment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

pub(crate) fn lock_guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn watcher_exit(
    resource: &str,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    match result {
        Ok(Ok(())) => Err(ControllerError::Watch(format!(
            "{resource} watcher stopped unexpectedly"
        ))),
        Ok(Err(e)) => Err(ControllerError::Watch(format!(
            "{resource} watcher error: {e}"
        ))),
        Err(e) => Err(ControllerError::Watch(format!(
            "{resource} watcher panicked: {e}"
        ))),
    }
}
