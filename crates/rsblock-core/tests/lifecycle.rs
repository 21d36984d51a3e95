use rsblock_core::{
    BlkErrorKind, BlockDriver, DeviceState, DiskConfig, DriverConfig, FileBackend, MemoryHost,
    Outcome, QueueConfig, RamBackend, Request, TagSetFlags,
};
use std::sync::Arc;

fn driver() -> (Arc<MemoryHost>, BlockDriver) {
    let host = Arc::new(MemoryHost::new());
    let driver = BlockDriver::new(host.clone(), DriverConfig::default());
    (host, driver)
}

fn ram(sectors: u64) -> Arc<RamBackend> {
    Arc::new(RamBackend::new(sectors).unwrap())
}

#[test]
fn create_submit_delete_twice() {
    let (host, driver) = driver();
    let cfg = DiskConfig::new(1024, 512, QueueConfig::new(1, 128));
    let id = driver.create_disk("disk0", &cfg, ram(1024)).unwrap();

    let done = driver.submit(id, Request::read(0, 8)).unwrap();
    assert_eq!(done.outcome(), Outcome::Ok);
    let done = driver
        .submit(id, Request::passthrough(0x12, Vec::new()))
        .unwrap();
    assert_eq!(done.outcome(), Outcome::IoError);

    let allocator = driver.registry().allocator().clone();
    driver.delete_disk(id).unwrap();
    assert_eq!(driver.device(id).unwrap().state, DeviceState::Removed);
    driver.delete_disk(id).unwrap();
    assert_eq!(driver.device(id).unwrap().state, DeviceState::Removed);
    assert_eq!(allocator.allocate_count(), 1);
    assert_eq!(allocator.release_count(), 1);
    assert_eq!(host.unpublish_calls(), 1);
}

#[test]
fn geometry_reported_as_configured_until_delete() {
    let (_host, driver) = driver();
    let cfg = DiskConfig::new(2048, 4096, QueueConfig::new(2, 16));
    let id = driver.create_disk("geo", &cfg, ram(2048)).unwrap();
    for _ in 0..4 {
        driver
            .submit(id, Request::write(8, vec![7; 4096]))
            .unwrap();
        let info = driver.device(id).unwrap();
        let geometry = info.geometry.unwrap();
        assert_eq!(geometry.capacity_sectors, 2048);
        assert_eq!(geometry.logical_block_size, 4096);
    }
    driver.delete_disk(id).unwrap();
}

#[test]
fn zero_capacity_accepted_zero_queues_rejected() {
    let (_host, driver) = driver();
    let empty = DiskConfig::new(0, 512, QueueConfig::new(1, 128));
    let id = driver.create_disk("empty", &empty, ram(0)).unwrap();
    assert_eq!(driver.device(id).unwrap().state, DeviceState::Active);

    let no_queues = DiskConfig::new(1024, 512, QueueConfig::new(0, 128));
    let err = driver
        .create_disk("no-queues", &no_queues, ram(1024))
        .unwrap_err();
    assert_eq!(err.kind(), BlkErrorKind::InvalidConfig);
    assert!(driver.registry().lookup("no-queues").is_err());
}

#[test]
fn duplicate_register_and_busy_unregister() {
    let (_host, driver) = driver();
    let registry = driver.registry();
    let id = registry.register("x").unwrap();
    assert_eq!(
        registry.register("x").unwrap_err().kind(),
        BlkErrorKind::AlreadyRegistered
    );
    registry
        .create_disk(id, &DiskConfig::new(64, 512, QueueConfig::default()), ram(64))
        .unwrap();
    assert_eq!(
        registry.unregister(id).unwrap_err().kind(),
        BlkErrorKind::DeviceBusy
    );
    driver.remove(id).unwrap();
    assert!(registry.is_empty());
}

#[test]
fn failed_allocation_retains_nothing() {
    let host = Arc::new(MemoryHost::new());
    let driver = BlockDriver::new(
        host.clone(),
        DriverConfig {
            tag_budget: 100,
            ..DriverConfig::default()
        },
    );
    let allocator = driver.registry().allocator().clone();
    // Two queues of 64: the second reservation exceeds the budget.
    let cfg = DiskConfig::new(64, 512, QueueConfig::new(2, 64));
    let err = driver.create_disk("big", &cfg, ram(64)).unwrap_err();
    assert_eq!(err.kind(), BlkErrorKind::AllocationFailed);
    assert_eq!(allocator.allocate_count(), allocator.release_count());
    assert_eq!(allocator.tags_in_use(), 0);
    assert!(host.published().is_empty());
    assert!(host.registered_majors().is_empty());

    let fits = DiskConfig::new(64, 512, QueueConfig::new(1, 64));
    driver.create_disk("big", &fits, ram(64)).unwrap();
}

#[test]
fn passthrough_is_io_error_in_every_active_configuration() {
    let (_host, driver) = driver();
    let configs = [
        QueueConfig::new(1, 1),
        QueueConfig::new(4, 32).with_flags(TagSetFlags::SHOULD_MERGE),
        QueueConfig::new(8, 4).with_flags(TagSetFlags::BLOCKING | TagSetFlags::NO_SCHED),
    ];
    for (i, queue) in configs.into_iter().enumerate() {
        let id = driver
            .create_disk(&format!("pt{i}"), &DiskConfig::new(64, 512, queue), ram(64))
            .unwrap();
        for hint in 0..queue.hw_queue_count {
            let done = driver
                .submit(id, Request::passthrough(hint as u32, vec![0; 16]).with_queue_hint(hint))
                .unwrap();
            assert_eq!(done.outcome(), Outcome::IoError);
        }
    }
}

#[test]
fn submit_outside_active_fails() {
    let (_host, driver) = driver();
    let registry = driver.registry();
    let id = registry.register("lifecycle").unwrap();
    let disk = registry.disk(id).unwrap();
    let check = || {
        for request in [Request::read(0, 1), Request::passthrough(1, Vec::new())] {
            assert_eq!(
                driver.submit(id, request).unwrap_err().kind(),
                BlkErrorKind::DeviceNotActive
            );
        }
    };

    disk.prepare_disk(&DiskConfig::new(64, 512, QueueConfig::default()), ram(64))
        .unwrap();
    assert_eq!(disk.state(), DeviceState::Created);
    check();
    disk.activate().unwrap();
    disk.begin_drain().unwrap();
    assert_eq!(disk.state(), DeviceState::Draining);
    check();
    disk.delete_disk().unwrap();
    assert_eq!(disk.state(), DeviceState::Removed);
    check();
}

#[test]
fn unknown_device_not_found() {
    let (_host, driver) = driver();
    let id = rsblock_core::DeviceId::new(7);
    assert_eq!(
        driver.submit(id, Request::flush()).unwrap_err().kind(),
        BlkErrorKind::NotFound
    );
    assert_eq!(
        driver.delete_disk(id).unwrap_err().kind(),
        BlkErrorKind::NotFound
    );
}

#[test]
fn file_backed_disk_persists_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    let (_host, driver) = driver();
    let cfg = DiskConfig::new(128, 512, QueueConfig::new(2, 8));
    let backend = Arc::new(FileBackend::open(&path, 128).unwrap());
    let id = driver.create_disk("file", &cfg, backend).unwrap();
    let done = driver
        .submit(id, Request::write(3, vec![0xab; 1024]))
        .unwrap();
    assert!(done.is_ok());
    assert!(driver.submit(id, Request::flush()).unwrap().is_ok());
    driver.remove(id).unwrap();

    let reopened = FileBackend::open(&path, 128).unwrap();
    let cfg = DiskConfig::new(128, 512, QueueConfig::new(1, 8));
    let id = driver.create_disk("file", &cfg, Arc::new(reopened)).unwrap();
    let done = driver.submit(id, Request::read(4, 1)).unwrap();
    assert!(done.payload().iter().all(|b| *b == 0xab));
}

#[test]
fn stale_handle_cannot_outlive_registration() {
    let (host, driver) = driver();
    let registry = driver.registry();
    let id = registry.register("a").unwrap();
    let stale = registry.disk(id).unwrap();
    registry.unregister(id).unwrap();

    let cfg = DiskConfig::new(16, 512, QueueConfig::new(1, 8));
    let reused = driver.create_disk("b", &cfg, ram(16)).unwrap();
    assert_eq!(reused, id);
    assert_eq!(
        stale.create_disk(&cfg, ram(16)).unwrap_err().kind(),
        BlkErrorKind::DeviceBusy
    );
    assert_eq!(host.published().len(), 1);

    driver.shutdown();
    assert!(host.published().is_empty());
    assert_eq!(registry.allocator().tags_in_use(), 0);
    assert_eq!(stale.state(), DeviceState::Removed);
}
