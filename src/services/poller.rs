//! Fixed-interval poller
//!
//! Sleeps, runs one tick, repeats. Ticks never overlap. A failing or panicking
//! tick is logged and the loop carries on. `stop` wakes the sleeper and waits
//! for an in-flight tick to finish; it never cancels one.

use async_trait::async_trait;
use flume::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::services::ingest::{IngestPipeline, TickReport};
use crate::types::Result;

/// One unit of periodic work.
#[async_trait]
pub trait PollTask: Send + Sync + 'static {
    async fn run_tick(&self) -> Result<TickReport>;
}

#[async_trait]
impl PollTask for IngestPipeline {
    async fn run_tick(&self) -> Result<TickReport> {
        IngestPipeline::run_tick(self).await
    }
}

pub struct Poller {
    task: Arc<dyn PollTask>,
    interval: Duration,
    running: Arc<AtomicBool>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    pub fn new(task: Arc<dyn PollTask>, interval: Duration) -> Self {
        let (wake_tx, wake_rx) = flume::unbounded();
        Self {
            task,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            wake_tx,
            wake_rx,
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the poll loop. No-op when already running.
    pub async fn start(&self) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() || self.running.swap(true, Ordering::SeqCst) {
            debug!("Poller already running");
            return;
        }

        // drop wakeups left over from a previous stop
        while self.wake_rx.try_recv().is_ok() {}

        info!("Starting poller (interval: {:?})", self.interval);
        *handle = Some(tokio::spawn(poll_loop(
            self.task.clone(),
            self.interval,
            self.running.clone(),
            self.wake_rx.clone(),
        )));
    }

    /// Signal the loop to exit and wait for it. No-op when not running.
    pub async fn stop(&self) {
        let mut handle = self.handle.lock().await;
        let Some(task) = handle.take() else {
            debug!("Poller not running");
            return;
        };

        info!("Stopping poller");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.wake_tx.send(());

        if let Err(e) = task.await {
            error!("Poll loop ended abnormally: {}", e);
        }
        info!("Poller stopped");
    }
}

async fn poll_loop(
    task: Arc<dyn PollTask>,
    interval: Duration,
    running: Arc<AtomicBool>,
    wake_rx: Receiver<()>,
) {
    let mut tick_count = 0u64;

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wake_rx.recv_async() => {}
        }

        if !running.load(Ordering::SeqCst) {
            break;
        }

        tick_count += 1;
        debug!("Poll tick #{}", tick_count);

        // a panic inside the tick surfaces as a JoinError instead of killing the loop
        let tick_task = task.clone();
        match tokio::spawn(async move { tick_task.run_tick().await }).await {
            Ok(Ok(report)) => debug!("Tick #{} finished: {:?}", tick_count, report),
            Ok(Err(e)) => error!("Tick #{} failed: {}", tick_count, e),
            Err(e) => error!("Tick #{} panicked: {}", tick_count, e),
        }
    }

    info!("Poll loop exited after {} ticks", tick_count);
}
