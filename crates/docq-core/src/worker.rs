//! Worker group: N tasks that claim messages, run a handler and ack or requeue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::domain::{Message, Payload};
use crate::queue::{GetOptions, Queue};

/// Processes one claimed message.
///
/// `Ok` acks the message. `Err` puts it back after the retry delay with its
/// priority unchanged; the handler decides what counts as permanent failure
/// (ack it and return `Ok`).
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), String>;
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Payload filter every worker claims with.
    pub filter: Payload,
    pub get: GetOptions,
    /// Delay before a message whose handler failed is claimable again.
    pub retry_delay: Duration,
}

impl WorkerOptions {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            filter: Payload::new(),
            get: config.get_options(),
            retry_delay: config.retry_delay(),
        }
    }

    pub fn with_filter(mut self, filter: Payload) -> Self {
        self.filter = filter;
        self
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// Worker group handle.
/// - dropping `shutdown_tx` or calling `request_shutdown` stops all workers
/// - `shutdown_and_join` waits for every worker to exit
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers.
    pub fn spawn(
        n: usize,
        queue: Arc<Queue>,
        handler: Arc<dyn MessageHandler>,
        options: WorkerOptions,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let options = Arc::new(options);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let q = Arc::clone(&queue);
            let h = Arc::clone(&handler);
            let opts = Arc::clone(&options);
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                worker_loop(worker_id, q, h, &opts, &mut rx).await;
            });
            joins.push(join);
        }

        info!(workers = n, "worker group started");
        Self { shutdown_tx, joins }
    }

    /// Stop claiming new messages. A claim already sent to the store completes
    /// and its batch is handled before the worker exits.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            if let Err(e) = j.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker group stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<Queue>,
    handler: Arc<dyn MessageHandler>,
    options: &WorkerOptions,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let batch = match queue
            .get_until_shutdown(&options.filter, options.get, shutdown_rx)
            .await
        {
            Ok(batch) => batch,
            Err(e) if e.is_validation() => {
                warn!(worker_id, error = %e, "worker options rejected, stopping");
                break;
            }
            Err(e) => {
                warn!(worker_id, error = %e, "claim failed");
                tokio::time::sleep(options.get.poll).await;
                continue;
            }
        };

        for message in &batch {
            match handler.handle(message).await {
                Ok(()) => {
                    if let Err(e) = queue.ack(message).await {
                        warn!(worker_id, id = %message.id(), error = %e, "ack failed");
                    }
                }
                Err(reason) => {
                    debug!(worker_id, id = %message.id(), reason = %reason, "handler failed, requeueing");
                    if let Err(e) = queue.requeue_after(message, options.retry_delay).await {
                        warn!(worker_id, id = %message.id(), error = %e, "requeue failed");
                    }
                }
            }
        }
    }
    debug!(worker_id, "worker stopped");
}
