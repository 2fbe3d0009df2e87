// src/rabbitmq/connection.rs

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::channel::{ChannelSource, ChannelWrapper};
use super::errors::{BrokerError, Result};
use super::gate::{Gate, Shutdown};
use super::topology;
use super::transport::{BrokerChannel, BrokerConnection, CloseNotifier, Connector};
use crate::config::BrokerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The loop has exited, either on `disconnect` or after running out
    /// of attempts.
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

struct Link {
    connection: Option<Arc<dyn BrokerConnection>>,
    state: ConnectionState,
}

struct SupervisorShared {
    config: Arc<BrokerConfig>,
    connector: Arc<dyn Connector>,
    link: RwLock<Link>,
    queues: RwLock<Vec<String>>,
    gate: Gate,
    shutdown: Shutdown,
}

/// Owns the physical connection and keeps it alive.
///
/// [`connect`](Self::connect) starts a background reconnect loop. Every
/// successful dial re-declares the configured topology before the gate
/// opens; a lost connection closes the gate and the loop dials again at
/// the configured interval.
pub struct ConnectionSupervisor {
    shared: Arc<SupervisorShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub fn new(config: Arc<BrokerConfig>, connector: Arc<dyn Connector>) -> Self {
        Self {
            shared: Arc::new(SupervisorShared {
                config,
                connector,
                link: RwLock::new(Link {
                    connection: None,
                    state: ConnectionState::Disconnected,
                }),
                queues: RwLock::new(Vec::new()),
                gate: Gate::new(false),
                shutdown: Shutdown::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Start the reconnect loop in the background and return immediately.
    ///
    /// Calling this while the loop runs does nothing. After the loop gave
    /// up it starts a fresh cycle. After [`disconnect`](Self::disconnect)
    /// it fails with [`BrokerError::Cancelled`].
    pub fn connect(&self) -> Result<()> {
        if self.shared.shutdown.is_triggered() {
            return Err(BrokerError::Cancelled);
        }

        let mut task = self.lock_task();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Connection supervisor already running");
            return Ok(());
        }

        info!(
            uri = %self.shared.config.uri,
            connection_name = %self.shared.config.connection_name,
            "Starting RabbitMQ connection supervisor"
        );
        *task = Some(tokio::spawn(run(self.shared.clone())));
        Ok(())
    }

    /// Stop the reconnect loop, close the connection and wait for the loop
    /// to exit.
    pub async fn disconnect(&self) -> Result<()> {
        self.shared.shutdown.trigger();

        let handle = self.lock_task().take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| BrokerError::Transport(format!("Supervisor task failed: {}", e)))?,
            None => self.shared.stop(None).await,
        }
        Ok(())
    }

    /// Open a channel on the current connection.
    pub async fn channel(&self) -> Result<ChannelWrapper> {
        let channel = self.shared.open_channel().await?;
        Ok(ChannelWrapper::new(channel))
    }

    /// Open a channel that replaces itself after an unexpected close, on
    /// whatever connection is current at that point.
    pub async fn recovering_channel(&self) -> Result<ChannelWrapper> {
        let channel = self.shared.open_channel().await?;
        Ok(ChannelWrapper::with_recovery(
            channel,
            self.shared.clone(),
            self.shared.config.reconnect_interval(),
            self.shared.shutdown.clone(),
        ))
    }

    pub fn gate(&self) -> &Gate {
        &self.shared.gate
    }

    /// Fires once `disconnect` has been called.
    pub fn shutdown_signal(&self) -> &Shutdown {
        &self.shared.shutdown
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.read_link().state
    }

    /// Queue names declared on the last successful connect.
    pub fn queues(&self) -> Vec<String> {
        self.shared
            .queues
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.shared.shutdown.trigger();
    }
}

impl SupervisorShared {
    fn read_link(&self) -> std::sync::RwLockReadGuard<'_, Link> {
        self.link.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_link(&self) -> std::sync::RwLockWriteGuard<'_, Link> {
        self.link.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        self.write_link().state = state;
    }

    fn current(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.read_link().connection.clone()
    }

    /// Dial and declare topology. A connection whose topology fails, or
    /// that is still declaring when `shutdown` fires, is closed again and
    /// the attempt counts as failed.
    async fn establish(
        &self,
        shutdown: &Shutdown,
    ) -> Result<(Arc<dyn BrokerConnection>, CloseNotifier)> {
        let connection = tokio::select! {
            biased;
            _ = shutdown.triggered() => return Err(BrokerError::Cancelled),
            dialed = self
                .connector
                .connect(&self.config.uri, &self.config.connection_name) => dialed?,
        };
        let notifier = connection.notify_close();

        let declared = tokio::select! {
            biased;
            _ = shutdown.triggered() => Err(BrokerError::Cancelled),
            declared = self.declare_topology(connection.as_ref()) => declared,
        };
        if let Err(err) = declared {
            if let Err(close_err) = connection.close().await {
                debug!(error = %close_err, "Error closing half-established connection");
            }
            return Err(err);
        }
        Ok((connection, notifier))
    }

    async fn declare_topology(&self, connection: &dyn BrokerConnection) -> Result<()> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::TopologyDeclarationFailed(e.to_string()))?;

        let declared = topology::declare(channel.as_ref(), &self.config.topology).await;
        let _ = channel.close().await;

        *self
            .queues
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = declared?;
        Ok(())
    }

    fn install(&self, connection: Arc<dyn BrokerConnection>) {
        {
            let mut link = self.write_link();
            link.connection = Some(connection);
            link.state = ConnectionState::Connected;
        }
        self.gate.notify(true);
    }

    fn clear(&self) {
        {
            let mut link = self.write_link();
            link.connection = None;
            link.state = ConnectionState::Disconnected;
        }
        self.gate.notify(false);
    }

    async fn stop(&self, connection: Option<Arc<dyn BrokerConnection>>) {
        self.gate.notify(false);
        let connection = {
            let mut link = self.write_link();
            link.state = ConnectionState::Stopped;
            link.connection.take().or(connection)
        };

        if let Some(connection) = connection {
            if let Err(err) = connection.close().await {
                debug!(error = %err, "Error while closing RabbitMQ connection");
            }
            info!("Disconnected from RabbitMQ");
        }
    }
}

#[async_trait]
impl ChannelSource for SupervisorShared {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let connection = self.current().ok_or(BrokerError::NotConnected)?;
        connection.create_channel().await
    }
}

/// The reconnect loop. Exits on shutdown or once a cycle runs out of
/// attempts.
async fn run(shared: Arc<SupervisorShared>) {
    let interval = shared.config.reconnect_interval();
    let max_attempts = shared.config.reconnect.max_attempts;
    let shutdown = shared.shutdown.clone();

    loop {
        shared.gate.notify(false);
        shared.set_state(ConnectionState::Connecting);

        let mut retry: u32 = 0;
        let (connection, mut notifier) = loop {
            info!(uri = %shared.config.uri, "Attempting to connect to RabbitMQ");
            let attempt = shared.establish(&shutdown).await;
            if shutdown.is_triggered() {
                shared.stop(attempt.ok().map(|(connection, _)| connection)).await;
                return;
            }

            match attempt {
                Ok(established) => break established,
                Err(err) => {
                    retry += 1;
                    info!(
                        uri = %shared.config.uri,
                        retry,
                        error = %err,
                        "Failed to connect to RabbitMQ"
                    );
                    if max_attempts != 0 && retry >= max_attempts {
                        error!(retry, "Max reconnection attempts reached. Giving up.");
                        shared.stop(None).await;
                        return;
                    }
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.triggered() => {
                    shared.stop(None).await;
                    return;
                }
                _ = sleep(interval) => {}
            }
        };

        shared.install(connection.clone());
        info!(uri = %shared.config.uri, "Connected to RabbitMQ");

        let reason = tokio::select! {
            biased;
            _ = shutdown.triggered() => {
                shared.stop(Some(connection)).await;
                return;
            }
            reason = notifier.recv() => reason,
        };

        shared.clear();
        match reason {
            Some(err) => warn!(error = %err, "Connection to RabbitMQ lost, reconnecting"),
            None => warn!("Connection to RabbitMQ closed, reconnecting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use crate::rabbitmq::memory::MemoryBroker;
    use std::time::Duration;

    fn supervisor(broker: &MemoryBroker) -> ConnectionSupervisor {
        let config = default_config().with_reconnect_policy(100, 3);
        ConnectionSupervisor::new(Arc::new(config), Arc::new(broker.connector()))
    }

    #[tokio::test]
    async fn channel_before_connect_is_not_connected() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker);

        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert!(matches!(supervisor.channel().await, Err(BrokerError::NotConnected)));
        assert!(!supervisor.gate().get());
    }

    #[tokio::test(start_paused = true)]
    async fn connects_declares_and_disconnects() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker);

        supervisor.connect().unwrap();
        supervisor
            .gate()
            .wait(true, sleep(Duration::from_secs(1)))
            .await
            .unwrap();

        assert_eq!(supervisor.state(), ConnectionState::Connected);
        assert_eq!(supervisor.queues(), vec!["image.upload".to_string()]);
        assert!(broker.has_exchange("images"));
        let channel = supervisor.channel().await.unwrap();
        assert!(!channel.is_closed());

        supervisor.disconnect().await.unwrap();
        assert_eq!(supervisor.state(), ConnectionState::Stopped);
        assert!(!supervisor.gate().get());
        assert_eq!(broker.open_connections(), 0);
        assert!(matches!(supervisor.connect(), Err(BrokerError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let supervisor = supervisor(&broker);

        supervisor.connect().unwrap();
        sleep(Duration::from_secs(5)).await;

        assert_eq!(supervisor.state(), ConnectionState::Stopped);
        assert_eq!(broker.dial_attempts(), 3);

        // A later connect starts a fresh cycle.
        broker.set_available(true);
        supervisor.connect().unwrap();
        supervisor
            .gate()
            .wait(true, sleep(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(supervisor.state(), ConnectionState::Connected);
        supervisor.disconnect().await.unwrap();
    }
}
