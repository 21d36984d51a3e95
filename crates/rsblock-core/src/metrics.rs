use core::time::Duration;
use metrics::{counter, gauge, histogram};

pub fn observe_request(dev_id: u32, queue_id: u16, bytes: usize, ok: bool, dur: Duration) {
    let ns = dur.as_nanos().min(u64::MAX as u128) as u64;
    let dev = dev_id.to_string();
    let queue = queue_id.to_string();
    counter!("rsblock_requests_total", "dev" => dev.clone(), "queue" => queue).increment(1);
    counter!("rsblock_request_bytes", "dev" => dev.clone()).increment(bytes as u64);
    histogram!("rsblock_request_latency_ns", "dev" => dev.clone()).record(ns as f64);
    if !ok {
        counter!("rsblock_request_errors_total", "dev" => dev).increment(1);
    }
}

pub fn record_passthrough_rejected(dev_id: u32) {
    counter!("rsblock_request_errors_total", "dev" => dev_id.to_string(), "kind" => "passthrough")
        .increment(1);
}

pub fn record_inflight(dev_id: u32, count: usize) {
    gauge!("rsblock_inflight_requests", "dev" => dev_id.to_string()).set(count as f64);
}

pub fn record_disk_created() {
    counter!("rsblock_disks_created_total").increment(1);
}

pub fn record_disk_removed() {
    counter!("rsblock_disks_removed_total").increment(1);
}
