use crate::backend::Backend;
use crate::config::{DiskConfig, DriverConfig};
use crate::disk::{DeviceId, DeviceInfo};
use crate::dispatch::RequestDispatcher;
use crate::host::BlockHost;
use crate::registry::DeviceRegistry;
use crate::request::{Completion, Request};
use crate::BlkResult;
use std::sync::Arc;
use tracing::{info, warn};

/// Registry plus dispatcher behind one handle.
#[derive(Clone, Debug)]
pub struct BlockDriver {
    registry: Arc<DeviceRegistry>,
    dispatcher: RequestDispatcher,
}

impl BlockDriver {
    pub fn new(host: Arc<dyn BlockHost>, config: DriverConfig) -> Self {
        let registry = Arc::new(DeviceRegistry::new(host, config));
        let dispatcher = RequestDispatcher::new(registry.clone());
        Self {
            registry,
            dispatcher,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    /// Register `name` and bring its disk up. A failed bring-up leaves
    /// nothing registered.
    pub fn create_disk(
        &self,
        name: &str,
        config: &DiskConfig,
        backend: Arc<dyn Backend>,
    ) -> BlkResult<DeviceId> {
        let id = self.registry.register(name)?;
        if let Err(err) = self.registry.create_disk(id, config, backend) {
            if let Err(cleanup) = self.registry.unregister(id) {
                warn!(dev_id = id.raw(), error = %cleanup, "unregister after failed create");
            }
            return Err(err);
        }
        Ok(id)
    }

    pub fn submit(&self, id: DeviceId, request: Request) -> BlkResult<Completion> {
        self.dispatcher.submit(id, request)
    }

    pub fn device(&self, id: DeviceId) -> BlkResult<DeviceInfo> {
        self.registry.device(id)
    }

    pub fn delete_disk(&self, id: DeviceId) -> BlkResult<()> {
        self.registry.delete_disk(id)
    }

    /// Delete the disk and drop the registration.
    pub fn remove(&self, id: DeviceId) -> BlkResult<()> {
        self.registry.delete_disk(id)?;
        self.registry.unregister(id)
    }

    /// Remove every device, logging failures instead of stopping on them.
    pub fn shutdown(&self) {
        let devices = self.registry.devices();
        info!(count = devices.len(), "shutting down block driver");
        for device in devices {
            if let Err(err) = self.remove(device.id) {
                warn!(dev_id = device.id.raw(), name = %device.name, error = %err, "device removal failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RamBackend;
    use crate::config::QueueConfig;
    use crate::host::MemoryHost;
    use crate::{BlkErrorKind, DeviceState};

    #[test]
    fn failed_create_leaves_nothing_registered() {
        let host = Arc::new(MemoryHost::new());
        let driver = BlockDriver::new(host.clone(), DriverConfig::default());
        let bad = DiskConfig::new(16, 500, QueueConfig::new(1, 4));
        let err = driver
            .create_disk("bad", &bad, Arc::new(RamBackend::new(16).unwrap()))
            .unwrap_err();
        assert_eq!(err.kind(), BlkErrorKind::InvalidConfig);
        assert!(driver.registry().is_empty());
        assert!(host.registered_majors().is_empty());
    }

    #[test]
    fn shutdown_removes_all_devices() {
        let host = Arc::new(MemoryHost::new());
        let driver = BlockDriver::new(host.clone(), DriverConfig::default());
        let cfg = DiskConfig::new(16, 512, QueueConfig::new(1, 4));
        let a = driver
            .create_disk("a", &cfg, Arc::new(RamBackend::new(16).unwrap()))
            .unwrap();
        driver
            .create_disk("b", &cfg, Arc::new(RamBackend::new(16).unwrap()))
            .unwrap();
        assert_eq!(driver.device(a).unwrap().state, DeviceState::Active);
        assert_eq!(host.published().len(), 2);

        driver.shutdown();
        assert!(driver.registry().is_empty());
        assert!(host.published().is_empty());
        assert_eq!(driver.registry().allocator().tags_in_use(), 0);
        assert_eq!(
            driver.submit(a, Request::flush()).unwrap_err().kind(),
            BlkErrorKind::NotFound
        );
    }
}
