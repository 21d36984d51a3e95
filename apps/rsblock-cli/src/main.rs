use anyhow::{Context, Result, anyhow, ensure};
use byteorder::{ByteOrder, LittleEndian};
use clap::Parser;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request as HttpRequest, Response as HttpResponse, Server, StatusCode};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use rsblock_core::{
    Backend, BlockDriver, DiskConfig, DriverConfig, FileBackend, MemoryHost, Outcome,
    QueueConfig, QueueWorkers, RamBackend, Request, SECTOR_SIZE, TagSetFlags,
};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "rsblock", version)]
#[command(about = "Bring up a multi-queue block device and drive a workload through it", long_about = None)]
struct Args {
    /// Device name to register.
    #[arg(long, default_value = "rsblock0")]
    name: String,
    /// Disk capacity in 512-byte sectors.
    #[arg(long, default_value_t = 1024)]
    capacity_sectors: u64,
    /// Logical block size in bytes.
    #[arg(long, default_value_t = 512)]
    logical_block_size: u32,
    /// Number of hardware queues.
    #[arg(long, default_value_t = 1)]
    queue_count: u16,
    /// Tags per hardware queue.
    #[arg(long, default_value_t = 128)]
    queue_depth: u16,
    /// Ask the host to merge adjacent requests.
    #[arg(long)]
    merge: bool,
    /// Back the disk with this file instead of memory.
    #[arg(long, value_name = "PATH")]
    backing_file: Option<PathBuf>,
    /// JSON file with `driver` and `disk` sections; overrides the geometry flags.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Logical blocks to write and verify.
    #[arg(long, default_value_t = 64)]
    workload_blocks: u64,
    /// Keep the device up until Ctrl-C.
    #[arg(long)]
    hold: bool,
    /// Expose Prometheus metrics on this TCP port (0 disables).
    #[arg(long, default_value_t = 0)]
    metrics_port: u16,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    driver: DriverConfig,
    disk: Option<DiskConfig>,
}

impl ConfigFile {
    fn load(path: &Path) -> Result<Self> {
        let data =
            std::fs::read(path).with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_slice(&data).with_context(|| format!("parse config {}", path.display()))
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let metrics_shutdown = CancellationToken::new();
    let metrics_task = spawn_metrics_listener(args.metrics_port, metrics_shutdown.clone())?;
    let file = match args.config.as_deref() {
        Some(path) => {
            info!(path = ?path, "loading config file");
            ConfigFile::load(path)?
        }
        None => ConfigFile::default(),
    };
    let disk_config = file.disk.unwrap_or_else(|| disk_config_from_args(&args));

    let backend: Arc<dyn Backend> = match args.backing_file.as_ref() {
        Some(path) => Arc::new(
            FileBackend::open(path, disk_config.capacity_sectors)
                .with_context(|| format!("open backing file {}", path.display()))?,
        ),
        None => Arc::new(RamBackend::new(disk_config.capacity_sectors)?),
    };

    let host = Arc::new(MemoryHost::new());
    let driver = BlockDriver::new(host.clone(), file.driver);
    let id = driver
        .create_disk(&args.name, &disk_config, backend)
        .context("create disk")?;
    let info = driver.device(id)?;
    info!(
        dev_id = id.raw(),
        name = %info.name,
        state = %info.state,
        capacity_sectors = disk_config.capacity_sectors,
        logical_block_size = disk_config.logical_block_size,
        queues = disk_config.queue.hw_queue_count,
        depth = disk_config.queue.queue_depth,
        "block device ready"
    );

    let mut workers = QueueWorkers::spawn(driver.registry().disk(id)?).context("spawn workers")?;
    let result = run_workload(&driver, id, &workers, &disk_config, args.workload_blocks).await;
    if let Err(err) = &result {
        warn!(error = ?err, "workload failed");
    }

    if result.is_ok() && args.hold {
        info!("holding device; press Ctrl-C to tear down");
        signal::ctrl_c().await.context("wait for ctrl-c")?;
    }

    workers.shutdown();
    driver.shutdown();
    info!(
        published = host.published().len(),
        majors = host.registered_majors().len(),
        "teardown complete"
    );
    metrics_shutdown.cancel();
    if let Some(task) = metrics_task {
        if let Err(err) = task.await {
            warn!(error = %err, "metrics listener task failed");
        }
    }
    result
}

fn spawn_metrics_listener(
    port: u16,
    shutdown: CancellationToken,
) -> Result<Option<JoinHandle<()>>> {
    if port == 0 {
        return Ok(None);
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install Prometheus metrics recorder")?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let task = tokio::spawn(async move {
        let make_svc = make_service_fn(move |_conn| {
            let handle = handle.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: HttpRequest<Body>| {
                    let response = metrics_response(&handle, req.uri().path());
                    async move { Ok::<_, Infallible>(response) }
                }))
            }
        });

        let server = Server::bind(&addr).serve(make_svc);
        let graceful = server.with_graceful_shutdown(async {
            shutdown.cancelled().await;
        });

        if let Err(err) = graceful.await {
            warn!(error = %err, %addr, "metrics server error");
        }
    });

    info!(%addr, "metrics listener started");
    Ok(Some(task))
}

fn metrics_response(handle: &PrometheusHandle, path: &str) -> HttpResponse<Body> {
    if path != "/metrics" {
        let mut response = HttpResponse::new(Body::from("not found"));
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    }
    let mut response = HttpResponse::new(Body::from(handle.render()));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

fn disk_config_from_args(args: &Args) -> DiskConfig {
    let mut queue = QueueConfig::new(args.queue_count, args.queue_depth);
    if args.merge {
        queue = queue.with_flags(TagSetFlags::SHOULD_MERGE);
    }
    DiskConfig::new(args.capacity_sectors, args.logical_block_size, queue)
}

/// Write one stamped block per logical block across all queues, read them
/// back and check the stamps, then show that passthrough is refused.
async fn run_workload(
    driver: &BlockDriver,
    id: rsblock_core::DeviceId,
    workers: &QueueWorkers,
    config: &DiskConfig,
    blocks: u64,
) -> Result<()> {
    let block_bytes = config.logical_block_size as usize;
    let sectors_per_block = (config.logical_block_size / SECTOR_SIZE) as u64;
    let blocks = blocks.min(config.capacity_sectors / sectors_per_block);
    let queues = workers.queue_count();
    info!(blocks, queues, "starting workload");

    let mut pending = Vec::with_capacity(blocks as usize);
    for block in 0..blocks {
        let sector = block * sectors_per_block;
        let mut data = vec![0u8; block_bytes];
        stamp(&mut data, sector);
        let queue_id = (block % queues as u64) as u16;
        pending.push(workers.submit(queue_id, Request::write(sector, data))?);
    }
    for (block, pending) in pending.into_iter().enumerate() {
        let done = pending.recv().await?;
        ensure!(done.is_ok(), "write of block {block} failed");
    }
    debug!(blocks, "writes complete");

    let flush = driver.submit(id, Request::flush())?;
    ensure!(flush.is_ok(), "flush failed");

    for block in 0..blocks {
        let sector = block * sectors_per_block;
        let queue_id = (block % queues as u64) as u16;
        let done = workers
            .submit(queue_id, Request::read(sector, sectors_per_block as u32))?
            .recv()
            .await?;
        ensure!(done.is_ok(), "read of block {block} failed");
        verify(done.payload(), sector)?;
    }
    info!(blocks, "workload verified");

    let done = driver.submit(id, Request::passthrough(0x85, Vec::new()))?;
    if done.outcome() != Outcome::IoError {
        return Err(anyhow!("passthrough unexpectedly completed {:?}", done.outcome()));
    }
    info!("passthrough request rejected with I/O error");
    Ok(())
}

/// Put each sector's own number at the start of that sector.
fn stamp(buf: &mut [u8], first_sector: u64) {
    for (i, chunk) in buf.chunks_mut(SECTOR_SIZE as usize).enumerate() {
        LittleEndian::write_u64(&mut chunk[..8], first_sector + i as u64);
    }
}

fn verify(buf: &[u8], first_sector: u64) -> Result<()> {
    for (i, chunk) in buf.chunks(SECTOR_SIZE as usize).enumerate() {
        let expected = first_sector + i as u64;
        let found = LittleEndian::read_u64(&chunk[..8]);
        ensure!(
            found == expected,
            "sector {expected} holds stamp {found}"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_round_trip_per_sector() {
        let mut buf = vec![0u8; 4096];
        stamp(&mut buf, 40);
        verify(&buf, 40).unwrap();
        assert!(verify(&buf, 41).is_err());
        assert_eq!(LittleEndian::read_u64(&buf[512..520]), 41);
    }

    #[test]
    fn config_file_sections_are_optional() {
        let file: ConfigFile = serde_json::from_str("{}").unwrap();
        assert!(file.disk.is_none());
        assert_eq!(file.driver, DriverConfig::default());

        let file: ConfigFile = serde_json::from_str(
            r#"{"disk": {"capacity_sectors": 2048, "logical_block_size": 4096}}"#,
        )
        .unwrap();
        let disk = file.disk.unwrap();
        assert_eq!(disk.capacity_sectors, 2048);
        assert_eq!(disk.queue, QueueConfig::default());
    }

    #[test]
    fn metrics_served_only_on_metrics_path() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let response = metrics_response(&handle, "/");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = metrics_response(&handle, "/metrics");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
    }

    #[test]
    fn args_build_disk_config() {
        let args = Args::parse_from(["rsblock", "--queue-count", "4", "--merge"]);
        let cfg = disk_config_from_args(&args);
        assert_eq!(cfg.queue.hw_queue_count, 4);
        assert!(cfg.queue.flags.contains(TagSetFlags::SHOULD_MERGE));
        assert_eq!(cfg.capacity_sectors, 1024);
        assert_eq!(args.metrics_port, 0);
    }
}
