//! Subnet watch loop.
//!
//! Enqueues on creation and deletion; on update only when the fields that
//! affect validation changed.

use std::sync::Arc;

use controller_util::NamespacedName;
use crds::Subnet;
use futures::TryStreamExt;
use kube::Api;
use kube_runtime::watcher;
use tracing::{debug, info};

use crate::controller::Validator;
use crate::error::ControllerError;

impl Validator {
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
                    let nsn = NamespacedName::from_meta(&subnet.metadata);
                    let old = self.subnets.get(&nsn);
                    self.subnets.apply(nsn.clone(), Arc::clone(&subnet));
                    match old {
                        // Process an update only if the fields that affect
                        // validation have changed.
                        Some(old)
                            if old.spec.ipv4 == subnet.spec.ipv4
                                && old.spec.vni == subnet.spec.vni =>
                        {
                            debug!("Ignoring update of Subnet {} without spec change", nsn);
                        }
                        _ => self.queue.add(nsn),
                    }
                }
                watcher::Event::InitApply(subnet) => {
                    let subnet = Arc::new(subnet);
                    let nsn = NamespacedName::from_meta(&subnet.metadata);
                    self.subnets.apply(nsn.clone(), subnet);
                    self.queue.add(nsn);
                }
                watcher::Event::Delete(subnet) => {
                    let nsn = NamespacedName::from_meta(&subnet.metadata);
                    debug!("Notified of deletion of Subnet {}", nsn);
                    self.subnets.delete(&nsn);
                    self.queue.add(nsn);
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
}
