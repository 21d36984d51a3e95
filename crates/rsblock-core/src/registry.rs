use crate::backend::Backend;
use crate::config::{DiskConfig, DriverConfig};
use crate::disk::{DeviceId, DeviceInfo, DiskLifecycleManager};
use crate::host::{BlockHost, HostErrorKind};
use crate::tags::TagSetAllocator;
use crate::{BlkError, BlkErrorKind, BlkResult};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info};

#[derive(Default)]
struct RegistryInner {
    devices: BTreeMap<DeviceId, Arc<DiskLifecycleManager>>,
    names: BTreeMap<String, DeviceId>,
}

/// Table of registered devices, keyed by [`DeviceId`].
///
/// Every mutation goes through one mutex so identifiers and names cannot be
/// handed out twice.
pub struct DeviceRegistry {
    host: Arc<dyn BlockHost>,
    allocator: TagSetAllocator,
    max_devices: usize,
    inner: Mutex<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new(host: Arc<dyn BlockHost>, config: DriverConfig) -> Self {
        Self {
            host,
            allocator: TagSetAllocator::new(config.tag_budget),
            max_devices: config.max_devices,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub fn allocator(&self) -> &TagSetAllocator {
        &self.allocator
    }

    pub fn host(&self) -> &Arc<dyn BlockHost> {
        &self.host
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve an identifier for `name` and create an empty device slot.
    pub fn register(&self, name: &str) -> BlkResult<DeviceId> {
        let mut inner = self.lock();
        if inner.names.contains_key(name) {
            return Err(BlkError::with_message(
                BlkErrorKind::AlreadyRegistered,
                format!("{name} is already registered"),
            ));
        }
        if inner.devices.len() >= self.max_devices {
            return Err(BlkError::with_message(
                BlkErrorKind::ResourceExhausted,
                format!("device limit {} reached", self.max_devices),
            ));
        }
        let major = self.host.register(name).map_err(|err| match err.kind() {
            HostErrorKind::Busy => {
                BlkError::with_message(BlkErrorKind::ResourceExhausted, err.to_string())
            }
            _ => BlkError::from(err),
        })?;
        let id = DeviceId::new(major);
        if inner.devices.contains_key(&id) {
            // The host handed out a major we already track; leave its
            // bookkeeping for the live entry alone.
            error!(major, name, "host returned a major that is still registered");
            return Err(BlkError::with_message(
                BlkErrorKind::ResourceExhausted,
                format!("host reused live major {major}"),
            ));
        }
        let disk = DiskLifecycleManager::new(id, name, self.host.clone(), self.allocator.clone());
        inner.devices.insert(id, Arc::new(disk));
        inner.names.insert(name.to_owned(), id);
        info!(dev_id = major, name, "device registered");
        Ok(id)
    }

    /// Drop the registry entry for `id`.
    ///
    /// The disk must have been deleted first (or never created).
    pub fn unregister(&self, id: DeviceId) -> BlkResult<()> {
        let disk = self.disk(id)?;
        // Retired outside the table lock: the lifecycle lock may be held by a
        // drain for a long time.
        disk.retire()?;
        let mut inner = self.lock();
        match inner.devices.get(&id) {
            Some(entry) if Arc::ptr_eq(entry, &disk) => {}
            _ => return Err(not_found(id)),
        }
        let name = disk.name().to_owned();
        inner.devices.remove(&id);
        inner.names.remove(&name);
        drop(inner);
        self.host.unregister(id.raw());
        info!(dev_id = id.raw(), name = %name, "device unregistered");
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> BlkResult<DeviceId> {
        self.lock().names.get(name).copied().ok_or_else(|| {
            BlkError::with_message(BlkErrorKind::NotFound, format!("no device named {name}"))
        })
    }

    pub fn disk(&self, id: DeviceId) -> BlkResult<Arc<DiskLifecycleManager>> {
        self.lock()
            .devices
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    pub fn device(&self, id: DeviceId) -> BlkResult<DeviceInfo> {
        Ok(self.disk(id)?.info())
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        let disks: Vec<_> = self.lock().devices.values().cloned().collect();
        disks.iter().map(|disk| disk.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn create_disk(
        &self,
        id: DeviceId,
        config: &DiskConfig,
        backend: Arc<dyn Backend>,
    ) -> BlkResult<()> {
        self.disk(id)?.create_disk(config, backend)
    }

    pub fn delete_disk(&self, id: DeviceId) -> BlkResult<()> {
        self.disk(id)?.delete_disk()
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.len())
            .field("max_devices", &self.max_devices)
            .finish()
    }
}

fn not_found(id: DeviceId) -> BlkError {
    BlkError::with_message(BlkErrorKind::NotFound, format!("device {id} not registered"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RamBackend;
    use crate::config::QueueConfig;
    use crate::disk::DeviceState;
    use crate::host::MemoryHost;

    fn registry(config: DriverConfig) -> (Arc<MemoryHost>, DeviceRegistry) {
        let host = Arc::new(MemoryHost::new());
        let registry = DeviceRegistry::new(host.clone(), config);
        (host, registry)
    }

    #[test]
    fn duplicate_name_rejected() {
        let (_host, reg) = registry(DriverConfig::default());
        let id = reg.register("x").unwrap();
        let err = reg.register("x").unwrap_err();
        assert_eq!(err.kind(), BlkErrorKind::AlreadyRegistered);
        assert_eq!(reg.lookup("x").unwrap(), id);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn identifiers_are_unique() {
        let (host, reg) = registry(DriverConfig::default());
        let a = reg.register("a").unwrap();
        let b = reg.register("b").unwrap();
        assert_ne!(a, b);
        assert_eq!(host.registered_majors().len(), 2);
    }

    #[test]
    fn exhaustion_from_limit_and_host() {
        let (_host, reg) = registry(DriverConfig {
            max_devices: 1,
            ..DriverConfig::default()
        });
        reg.register("a").unwrap();
        let err = reg.register("b").unwrap_err();
        assert_eq!(err.kind(), BlkErrorKind::ResourceExhausted);

        let host = Arc::new(MemoryHost::with_max_majors(0));
        let reg = DeviceRegistry::new(host, DriverConfig::default());
        let err = reg.register("a").unwrap_err();
        assert_eq!(err.kind(), BlkErrorKind::ResourceExhausted);
        assert!(reg.is_empty());
    }

    #[test]
    fn unregister_requires_removed() {
        let (host, reg) = registry(DriverConfig::default());
        let id = reg.register("x").unwrap();
        reg.create_disk(
            id,
            &DiskConfig::new(8, 512, QueueConfig::new(1, 4)),
            Arc::new(RamBackend::new(8).unwrap()),
        )
        .unwrap();
        let err = reg.unregister(id).unwrap_err();
        assert_eq!(err.kind(), BlkErrorKind::DeviceBusy);

        reg.delete_disk(id).unwrap();
        reg.unregister(id).unwrap();
        assert!(host.registered_majors().is_empty());
        assert_eq!(reg.unregister(id).unwrap_err().kind(), BlkErrorKind::NotFound);
        assert_eq!(reg.lookup("x").unwrap_err().kind(), BlkErrorKind::NotFound);
        // The name is free again.
        reg.register("x").unwrap();
    }

    #[test]
    fn unregister_slot_without_disk() {
        let (_host, reg) = registry(DriverConfig::default());
        let id = reg.register("empty").unwrap();
        assert_eq!(reg.device(id).unwrap().state, DeviceState::Unregistered);
        reg.unregister(id).unwrap();
    }

    #[test]
    fn handle_held_across_unregister_is_retired() {
        let (host, reg) = registry(DriverConfig::default());
        let id = reg.register("a").unwrap();
        let stale = reg.disk(id).unwrap();
        reg.unregister(id).unwrap();
        assert_eq!(stale.state(), DeviceState::Removed);

        // The host hands the major out again.
        let reused = reg.register("b").unwrap();
        assert_eq!(reused, id);

        let cfg = DiskConfig::new(8, 512, QueueConfig::new(1, 8));
        let err = stale
            .create_disk(&cfg, Arc::new(RamBackend::new(8).unwrap()))
            .unwrap_err();
        assert_eq!(err.kind(), BlkErrorKind::DeviceBusy);
        assert_eq!(reg.allocator().tags_in_use(), 0);
        assert!(host.published().is_empty());

        reg.create_disk(reused, &cfg, Arc::new(RamBackend::new(8).unwrap()))
            .unwrap();
        assert_eq!(host.published().len(), 1);
        assert_eq!(reg.allocator().tags_in_use(), 8);
        assert_eq!(stale.state(), DeviceState::Removed);
        assert_eq!(
            reg.unregister(reused).unwrap_err().kind(),
            BlkErrorKind::DeviceBusy
        );
    }

    #[test]
    fn devices_lists_snapshots() {
        let (_host, reg) = registry(DriverConfig::default());
        let id = reg.register("x").unwrap();
        reg.register("y").unwrap();
        reg.create_disk(
            id,
            &DiskConfig::new(16, 512, QueueConfig::new(2, 4)),
            Arc::new(RamBackend::new(16).unwrap()),
        )
        .unwrap();
        let devices = reg.devices();
        assert_eq!(devices.len(), 2);
        let x = devices.iter().find(|d| d.id == id).unwrap();
        assert_eq!(x.state, DeviceState::Active);
        assert_eq!(x.hw_queue_count, Some(2));
    }
}
