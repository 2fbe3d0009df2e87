// src/rabbitmq/channel.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as stream_channel;
use futures::StreamExt;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::errors::{BrokerError, Result};
use super::gate::Shutdown;
use super::message::Publishing;
use super::transport::{BrokerChannel, CloseNotifier, DeliveryStream, PendingConfirm};

const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_millis(500);

/// Something that can open a fresh channel on the current connection.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;
}

/// Settings re-applied to a replacement channel after recovery.
#[derive(Debug, Clone, Copy, Default)]
struct ChannelSettings {
    confirm: bool,
    prefetch: Option<u16>,
}

struct WrapperInner {
    closed: AtomicBool,
    channel: RwLock<Arc<dyn BrokerChannel>>,
    settings: Mutex<ChannelSettings>,
    recovery_interval: Duration,
    closing: Shutdown,
}

impl Drop for WrapperInner {
    fn drop(&mut self) {
        // Stop the recovery watcher if the wrapper is dropped without close().
        self.closing.trigger();
    }
}

/// One logical broker channel.
///
/// Cloning shares the same channel. A wrapper built with
/// [`ChannelWrapper::with_recovery`] replaces its underlying handle when the
/// broker closes the channel unexpectedly, so holders keep using the same
/// wrapper across channel failures.
#[derive(Clone)]
pub struct ChannelWrapper {
    inner: Arc<WrapperInner>,
}

impl ChannelWrapper {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self::build(channel, DEFAULT_RECOVERY_INTERVAL)
    }

    /// Wrap `channel` and watch it: after an unexpected close a fresh
    /// channel is requested from `source` every `interval` until one opens,
    /// the wrapper is closed, or `shutdown` fires.
    pub fn with_recovery(
        channel: Arc<dyn BrokerChannel>,
        source: Arc<dyn ChannelSource>,
        interval: Duration,
        shutdown: Shutdown,
    ) -> Self {
        let notifier = channel.notify_close();
        let wrapper = Self::build(channel, interval);

        tokio::spawn(supervise(
            Arc::downgrade(&wrapper.inner),
            source,
            interval,
            wrapper.inner.closing.clone(),
            shutdown,
            notifier,
        ));

        wrapper
    }

    fn build(channel: Arc<dyn BrokerChannel>, recovery_interval: Duration) -> Self {
        Self {
            inner: Arc::new(WrapperInner {
                closed: AtomicBool::new(false),
                channel: RwLock::new(channel),
                settings: Mutex::new(ChannelSettings::default()),
                recovery_interval,
                closing: Shutdown::new(),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Channel number of the current underlying handle.
    pub fn id(&self) -> u16 {
        self.inner.current().id()
    }

    pub fn ptr_eq(&self, other: &ChannelWrapper) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn current(&self) -> Result<Arc<dyn BrokerChannel>> {
        if self.is_closed() {
            return Err(BrokerError::ChannelClosed);
        }
        Ok(self.inner.current())
    }

    /// Close once. Fails with [`BrokerError::AlreadyClosed`] on every
    /// later call.
    pub(crate) async fn try_close(&self) -> Result<()> {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BrokerError::AlreadyClosed);
        }

        self.inner.closing.trigger();
        let channel = self.inner.current();
        if channel.is_open() {
            channel.close().await?;
        }
        Ok(())
    }

    /// Idempotent close: a second call succeeds without doing anything.
    pub async fn close(&self) -> Result<()> {
        match self.try_close().await {
            Err(BrokerError::AlreadyClosed) => {
                debug!("Channel already closed");
                Ok(())
            }
            other => other,
        }
    }

    pub async fn confirm_select(&self) -> Result<()> {
        self.current()?.confirm_select().await?;
        self.inner.update_settings(|s| s.confirm = true);
        Ok(())
    }

    pub async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.current()?.basic_qos(prefetch_count).await?;
        self.inner.update_settings(|s| s.prefetch = Some(prefetch_count));
        Ok(())
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: &Publishing,
    ) -> Result<PendingConfirm> {
        self.current()?
            .basic_publish(exchange, routing_key, publishing)
            .await
    }

    /// Subscribe on the current underlying handle. The stream ends when
    /// that handle dies.
    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.current()?.basic_consume(queue, consumer_tag).await
    }

    /// Subscribe and keep re-subscribing on whatever handle the wrapper
    /// holds, pausing the recovery interval between attempts. The stream
    /// ends only once the wrapper is closed.
    pub fn consume_recovering(&self, queue: &str, consumer_tag: &str) -> DeliveryStream {
        let (tx, rx) = stream_channel::unbounded();
        let weak = Arc::downgrade(&self.inner);
        let closing = self.inner.closing.clone();
        let interval = self.inner.recovery_interval;
        let queue = queue.to_string();
        let tag = consumer_tag.to_string();

        tokio::spawn(async move {
            loop {
                let channel = match weak.upgrade() {
                    Some(inner) if !inner.closed.load(Ordering::Acquire) => inner.current(),
                    _ => break,
                };

                match channel.basic_consume(&queue, &tag).await {
                    Ok(mut deliveries) => loop {
                        let next = tokio::select! {
                            _ = closing.triggered() => return,
                            next = deliveries.next() => next,
                        };
                        match next {
                            Some(Ok(delivery)) => {
                                if tx.unbounded_send(Ok(delivery)).is_err() {
                                    return;
                                }
                            }
                            Some(Err(err)) => {
                                debug!(queue = %queue, consumer = %tag, error = %err, "Delivery stream failed");
                                break;
                            }
                            None => break,
                        }
                    },
                    Err(err) => {
                        debug!(queue = %queue, consumer = %tag, error = %err, "Consume failed");
                    }
                }

                tokio::select! {
                    _ = closing.triggered() => break,
                    _ = sleep(interval) => {}
                }
            }
        });

        rx.boxed()
    }
}

impl WrapperInner {
    fn current(&self) -> Arc<dyn BrokerChannel> {
        self.channel
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn swap(&self, channel: Arc<dyn BrokerChannel>) {
        *self
            .channel
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = channel;
    }

    fn settings(&self) -> ChannelSettings {
        *self
            .settings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update_settings<F: FnOnce(&mut ChannelSettings)>(&self, update: F) {
        update(
            &mut self
                .settings
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
    }
}

/// Reapply confirm mode and QoS to a replacement channel.
async fn restore(channel: &dyn BrokerChannel, settings: ChannelSettings) -> Result<()> {
    if settings.confirm {
        channel.confirm_select().await?;
    }
    if let Some(prefetch) = settings.prefetch {
        channel.basic_qos(prefetch).await?;
    }
    Ok(())
}

/// Recovery watcher. Drains close notifications of the current handle and
/// swaps in a fresh channel after each unexpected close. A notification
/// stream that ends without an error means the channel was closed on
/// purpose, which ends the watcher.
async fn supervise(
    inner: Weak<WrapperInner>,
    source: Arc<dyn ChannelSource>,
    interval: Duration,
    closing: Shutdown,
    shutdown: Shutdown,
    mut notifier: CloseNotifier,
) {
    loop {
        let reason = tokio::select! {
            _ = closing.triggered() => return,
            _ = shutdown.triggered() => return,
            reason = notifier.recv() => reason,
        };

        let Some(reason) = reason else {
            debug!("Channel closed without error, stopping recovery");
            return;
        };
        if closing.is_triggered() {
            return;
        }
        debug!(error = %reason, "Channel closed unexpectedly");

        loop {
            tokio::select! {
                _ = closing.triggered() => return,
                _ = shutdown.triggered() => return,
                _ = sleep(interval) => {}
            }

            let fresh = match source.open_channel().await {
                Ok(channel) => channel,
                Err(err) => {
                    debug!(error = %err, "Channel reopen failed");
                    continue;
                }
            };
            let fresh_notifier = fresh.notify_close();

            let Some(wrapper) = inner.upgrade() else {
                let _ = fresh.close().await;
                return;
            };

            if let Err(err) = restore(fresh.as_ref(), wrapper.settings()).await {
                warn!(error = %err, "Failed to restore channel settings");
                let _ = fresh.close().await;
                continue;
            }

            wrapper.swap(fresh.clone());
            if wrapper.closed.load(Ordering::Acquire) {
                // close() raced with the swap and closed the old handle.
                let _ = fresh.close().await;
                return;
            }

            info!(channel_id = fresh.id(), "Channel reconnected");
            notifier = fresh_notifier;
            break;
        }
    }
}
