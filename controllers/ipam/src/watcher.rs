//! Watch loops feeding the informer stores.
//!
//! Each loop applies observed objects to its store and hands the event to
//! the controller's notify hooks, which do nothing beyond enqueueing keys
//! and updating the address cache.

use std::sync::Arc;

use controller_util::NamespacedName;
use crds::{IPLock, NetworkAttachment, Subnet};
use futures::TryStreamExt;
use kube::Api;
use kube_runtime::watcher;
use tracing::{debug, info};

use crate::controller::IpamController;
use crate::error::ControllerError;

impl IpamController {
    pub(crate) async fn watch_subnets(self: Arc<Self>) -> Result<(), ControllerError> {
        info!("Starting Subnet watcher");
        let api: Api<Subnet> = Api::all(self.client.clone());
        let mut stream = Box::pin(watcher(api, watcher::Config::default()));
        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| ControllerError::Watch(format!("Subnet watcher stream error: {e}")))?
        {
            match event {
                watcher::Event::Apply(subnet) => {
                    let subnet = Arc::new(subnet);
                    self.subnets
                        .apply(NamespacedName::from_meta(&subnet.metadata), Arc::clone(&subnet));
                    self.on_subnet_notify(&subnet, "update");
                }
                watcher::Event::InitApply(subnet) => {
                    let subnet = Arc::new(subnet);
                    self.subnets
                        .apply(NamespacedName::from_meta(&subnet.metadata), Arc::clone(&subnet));
                    self.on_subnet_notify(&subnet, "creation");
                }
                watcher::Event::Delete(subnet) => {
                    self.subnets.delete(&NamespacedName::from_meta(&subnet.metadata));
                    self.on_subnet_notify(&subnet, "deletion");
                }
                watcher::Event::Init => {
                    debug!("Subnet watcher restarting its listing");
                }
                watcher::Event::InitDone => {
                    self.subnets.mark_synced();
                    info!("Subnet cache synced");
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn watch_attachments(self: Arc<Self>) -> Result<(), ControllerError> {
        info!("Starting NetworkAttachment watcher");
        let api: Api<NetworkAttachment> = Api::all(self.client.clone());
        let mut stream = Box::pin(watcher(api, watcher::Config::default()));
        while let Some(event) = stream.try_next().await.map_err(|e| {
            ControllerError::Watch(format!("NetworkAttachment watcher stream error: {e}"))
        })? {
            match event {
                watcher::Event::Apply(att) | watcher::Event::InitApply(att) => {
                    let att = Arc::new(att);
                    let nsn = NamespacedName::from_meta(&att.metadata);
                    debug!("Notified of existence of NetworkAttachment {}", nsn);
                    self.attachments.apply(nsn.clone(), att);
                    self.queue.add(nsn);
                }
                watcher::Event::Delete(att) => {
                    let nsn = NamespacedName::from_meta(&att.metadata);
                    debug!("Notified of deletion of NetworkAttachment {}", nsn);
                    self.attachments.delete(&nsn);
                    self.queue.add(nsn);
                }
                watcher::Event::Init => {
                    debug!("NetworkAttachment watcher restarting its listing");
                }
                watcher::Event::InitDone => {
                    self.attachments.mark_synced();
                    info!("NetworkAttachment cache synced");
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn watch_locks(self: Arc<Self>) -> Result<(), ControllerError> {
        info!("Starting IPLock watcher");
        let api: Api<IPLock> = Api::all(self.client.clone());
        let mut stream = Box::pin(watcher(api, watcher::Config::default()));
        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| ControllerError::Watch(format!("IPLock watcher stream error: {e}")))?
        {
            match event {
                watcher::Event::Apply(ipl) => {
                    let ipl = Arc::new(ipl);
                    self.locks
                        .apply(NamespacedName::from_meta(&ipl.metadata), Arc::clone(&ipl));
                    self.on_lock_notify(&ipl, "update", true);
                }
                watcher::Event::InitApply(ipl) => {
                    let ipl = Arc::new(ipl);
                    self.locks
                        .apply(NamespacedName::from_meta(&ipl.metadata), Arc::clone(&ipl));
                    self.on_lock_notify(&ipl, "create", true);
                }
                watcher::Event::Delete(ipl) => {
                    self.locks.delete(&NamespacedName::from_meta(&ipl.metadata));
                    self.on_lock_notify(&ipl, "delete", false);
                }
                watcher::Event::Init => {
                    debug!("IPLock watcher restarting its listing");
                }
                watcher::Event::InitDone => {
                    self.locks.mark_synced();
                    info!("IPLock cache synced");
                }
            }
        }
        Ok(())
    }
}
