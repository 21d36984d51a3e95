use crate::BlkResult;
use crate::disk::DiskLifecycleManager;
use crate::request::{Completion, Request};
use anyhow::{Context, anyhow};
use async_channel::{Receiver, Sender};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, trace};

struct Job {
    request: Request,
    reply: Sender<BlkResult<Completion>>,
}

struct QueueWorkerHandle {
    jobs: Sender<Job>,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// One dispatch thread per hardware queue of an active disk.
///
/// Requests handed to [`QueueWorkers::submit`] run on the thread that owns
/// their queue, so queues make progress independently.
pub struct QueueWorkers {
    dev_id: u32,
    workers: Vec<QueueWorkerHandle>,
    shutdown: bool,
}

impl QueueWorkers {
    pub fn spawn(disk: Arc<DiskLifecycleManager>) -> anyhow::Result<Self> {
        let dev_id = disk.id().raw();
        let queue_count = disk
            .info()
            .hw_queue_count
            .ok_or_else(|| anyhow!("device {dev_id} has no queues ({})", disk.state()))?;
        let mut workers = Vec::with_capacity(queue_count as usize);
        for queue_id in 0..queue_count {
            let (jobs_tx, jobs_rx) = async_channel::unbounded::<Job>();
            let stop = Arc::new(AtomicBool::new(false));
            debug!(dev_id, queue_id, "spawning queue worker");
            let thread = spawn_queue_worker(disk.clone(), queue_id, jobs_rx, stop.clone())?;
            workers.push(QueueWorkerHandle {
                jobs: jobs_tx,
                stop,
                thread,
            });
        }
        Ok(Self {
            dev_id,
            workers,
            shutdown: false,
        })
    }

    pub fn queue_count(&self) -> u16 {
        self.workers.len() as u16
    }

    /// Queue `request` on `queue_id`'s worker.
    pub fn submit(&self, queue_id: u16, request: Request) -> anyhow::Result<PendingCompletion> {
        let worker = self
            .workers
            .get(queue_id as usize)
            .ok_or_else(|| anyhow!("queue {queue_id} out of range"))?;
        let (reply_tx, reply_rx) = async_channel::bounded(1);
        worker
            .jobs
            .try_send(Job {
                request: request.with_queue_hint(queue_id),
                reply: reply_tx,
            })
            .map_err(|_| anyhow!("queue {queue_id} worker stopped"))?;
        Ok(PendingCompletion { reply: reply_rx })
    }

    /// Stop every worker and wait for them to exit. Queued requests that
    /// have not started are dropped and their waiters see an error.
    pub fn shutdown(&mut self) {
        if self.shutdown {
            return;
        }
        self.shutdown = true;
        for worker in &self.workers {
            worker.stop.store(true, Ordering::SeqCst);
            worker.jobs.close();
        }
        for worker in self.workers.drain(..) {
            if let Err(err) = worker.thread.join() {
                error!(dev_id = self.dev_id, "queue worker join failed: {:?}", err);
            }
        }
        debug!(dev_id = self.dev_id, "queue workers stopped");
    }
}

impl Drop for QueueWorkers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Receiving end of a request handed to a queue worker.
pub struct PendingCompletion {
    reply: Receiver<BlkResult<Completion>>,
}

impl PendingCompletion {
    /// Block until the worker answers.
    pub fn wait(self) -> anyhow::Result<Completion> {
        let result = self
            .reply
            .recv_blocking()
            .context("queue worker dropped request")?;
        Ok(result?)
    }

    pub async fn recv(self) -> anyhow::Result<Completion> {
        let result = self
            .reply
            .recv()
            .await
            .context("queue worker dropped request")?;
        Ok(result?)
    }
}

fn spawn_queue_worker(
    disk: Arc<DiskLifecycleManager>,
    queue_id: u16,
    jobs: Receiver<Job>,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<JoinHandle<()>> {
    let name = format!("rsblock-q{queue_id}");
    let thread = std::thread::Builder::new()
        .name(name)
        .spawn(move || queue_worker_main(disk, queue_id, jobs, stop))
        .context("spawn queue worker")?;
    Ok(thread)
}

fn queue_worker_main(
    disk: Arc<DiskLifecycleManager>,
    queue_id: u16,
    jobs: Receiver<Job>,
    stop: Arc<AtomicBool>,
) {
    let dev_id = disk.id().raw();
    debug!(dev_id, queue_id, "queue worker starting");
    while !stop.load(Ordering::SeqCst) {
        let Ok(job) = jobs.recv_blocking() else {
            break;
        };
        let result = disk.submit(job.request);
        trace!(dev_id, queue_id, ok = result.is_ok(), "queue worker finished request");
        if job.reply.send_blocking(result).is_err() {
            trace!(dev_id, queue_id, "completion dropped; waiter has gone");
        }
    }
    debug!(dev_id, queue_id, "queue worker exiting");
}
