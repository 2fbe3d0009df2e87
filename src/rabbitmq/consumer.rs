// src/rabbitmq/consumer.rs

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::connection::ConnectionSupervisor;
use super::errors::{BrokerError, Result};
use super::gate::Shutdown;
use super::message::Delivery;
use super::transport::DeliveryStream;

/// Processes one delivery. `Ok` acknowledges it; an error or a panic
/// rejects it without requeue.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()>;
}

/// Fixed-size pool of workers consuming one queue over a shared channel.
pub struct ConsumerPool {
    supervisor: Arc<ConnectionSupervisor>,
    prefetch_count: u16,
    workers: usize,
}

impl ConsumerPool {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        let prefetch_count = supervisor.config().prefetch_count;
        let workers = supervisor.config().worker_count();
        Self {
            supervisor,
            prefetch_count,
            workers,
        }
    }

    /// Run exactly `workers` workers, overriding the CPU-capped count from
    /// the config.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Consume `queue` until `shutdown` fires or the supervisor is
    /// disconnected (both return `Ok`), or until the delivery streams end
    /// underneath the pool, which returns [`BrokerError::Disconnected`] so
    /// the caller can consume again once reconnected.
    ///
    /// Handlers that are running when shutdown fires finish before the
    /// call returns.
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
        shutdown: Shutdown,
    ) -> Result<()> {
        let closing = self.supervisor.shutdown_signal().clone();

        let connected = tokio::select! {
            waited = self.supervisor.gate().wait(true, shutdown.triggered()) => waited,
            _ = closing.triggered() => Err(BrokerError::Cancelled),
        };
        if connected.is_err() {
            debug!(queue, "Consume cancelled before connecting");
            return Ok(());
        }

        let channel = self.supervisor.channel().await?;
        if let Err(err) = channel.qos(self.prefetch_count).await {
            let _ = channel.close().await;
            return Err(err);
        }

        let stop = Shutdown::new();
        let dropped = Arc::new(AtomicBool::new(false));
        let mut workers = JoinSet::new();

        for index in 0..self.workers {
            let consumer_tag = format!("consumer{}", index);
            let deliveries = match channel.consume(queue, &consumer_tag).await {
                Ok(deliveries) => deliveries,
                Err(err) => {
                    stop.trigger();
                    while workers.join_next().await.is_some() {}
                    let _ = channel.close().await;
                    return Err(err);
                }
            };

            workers.spawn(work(
                Worker {
                    consumer_tag,
                    handler: handler.clone(),
                    shutdown: shutdown.clone(),
                    closing: closing.clone(),
                    stop: stop.clone(),
                    dropped: dropped.clone(),
                },
                deliveries,
            ));
        }

        info!(
            queue,
            workers = self.workers,
            prefetch = self.prefetch_count,
            "Consuming from queue"
        );

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(queue, error = %err, "Consumer worker failed");
            }
        }

        if let Err(err) = channel.close().await {
            debug!(queue, error = %err, "Error closing consumer channel");
        }

        if dropped.load(Ordering::Acquire) {
            warn!(queue, "Delivery stream closed unexpectedly");
            return Err(BrokerError::Disconnected);
        }

        info!(queue, "Stopped consuming");
        Ok(())
    }
}

struct Worker {
    consumer_tag: String,
    handler: Arc<dyn DeliveryHandler>,
    shutdown: Shutdown,
    closing: Shutdown,
    stop: Shutdown,
    dropped: Arc<AtomicBool>,
}

impl Worker {
    fn cancelled(&self) -> bool {
        self.shutdown.is_triggered() || self.closing.is_triggered()
    }

    /// Tell the rest of the pool the subscription is gone.
    fn drop_pool(&self) {
        if !self.cancelled() {
            self.dropped.store(true, Ordering::Release);
        }
        self.stop.trigger();
    }

    async fn process(&self, delivery: Delivery) {
        let outcome = AssertUnwindSafe(self.handler.handle(&delivery))
            .catch_unwind()
            .await;

        let settled = match outcome {
            Ok(Ok(())) => delivery.ack().await,
            Ok(Err(err)) => {
                error!(
                    consumer = %self.consumer_tag,
                    message_id = %delivery.message_id,
                    delivery_tag = delivery.delivery_tag(),
                    error = %err,
                    "Handler failed, rejecting delivery"
                );
                delivery.reject(false).await
            }
            Err(_) => {
                error!(
                    consumer = %self.consumer_tag,
                    message_id = %delivery.message_id,
                    delivery_tag = delivery.delivery_tag(),
                    "Handler panicked, rejecting delivery"
                );
                delivery.reject(false).await
            }
        };

        if let Err(err) = settled {
            warn!(
                consumer = %self.consumer_tag,
                delivery_tag = delivery.delivery_tag(),
                error = %err,
                "Failed to settle delivery"
            );
        }
    }
}

async fn work(worker: Worker, mut deliveries: DeliveryStream) {
    loop {
        let next = tokio::select! {
            biased;
            _ = worker.shutdown.triggered() => break,
            _ = worker.closing.triggered() => break,
            _ = worker.stop.triggered() => break,
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => worker.process(delivery).await,
            Some(Err(err)) => {
                warn!(consumer = %worker.consumer_tag, error = %err, "Delivery stream failed");
                worker.drop_pool();
                break;
            }
            None => {
                worker.drop_pool();
                break;
            }
        }
    }
    debug!(consumer = %worker.consumer_tag, "Consumer worker stopped");
}
