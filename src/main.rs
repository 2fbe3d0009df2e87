// src/main.rs
// Worker binary: consumes every configured queue and logs what arrives.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use resilient_rmq::config::{create_default_config_file, load_config};
use resilient_rmq::rabbitmq::{BrokerClient, BrokerError, Delivery, DeliveryHandler};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

struct LoggingHandler;

#[async_trait]
impl DeliveryHandler for LoggingHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        if delivery.is_json() {
            let payload: serde_json::Value = serde_json::from_slice(&delivery.body)
                .context("Message body is not valid JSON")?;
            info!(
                message_id = %delivery.message_id,
                consumer = %delivery.consumer_tag,
                "Received {}",
                payload
            );
            return Ok(());
        }

        let text = std::str::from_utf8(&delivery.body)
            .map_err(|e| anyhow!("Unsupported message body: {}", e))?;
        info!(
            message_id = %delivery.message_id,
            consumer = %delivery.consumer_tag,
            content_type = %delivery.content_type,
            "Received '{}'",
            text
        );
        Ok(())
    }
}

/// Consume `queue` for the life of the client, subscribing again after
/// every connection loss.
async fn consume_forever(client: Arc<BrokerClient>, queue: String) {
    let handler: Arc<dyn DeliveryHandler> = Arc::new(LoggingHandler);
    let retry_interval = client.supervisor().config().reconnect_interval();

    loop {
        match client.consume(&queue, handler.clone()).await {
            Ok(()) => break,
            Err(BrokerError::Disconnected) => {
                warn!(queue = %queue, "Consumer lost its connection, consuming again once reconnected");
            }
            Err(err) => {
                error!(queue = %queue, error = %err, "Consumer failed");
                sleep(retry_interval).await;
            }
        }
        if client.supervisor().shutdown_signal().is_triggered() {
            break;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    dotenv::dotenv().ok();

    let mut args = std::env::args().skip(1);
    if let Some(command) = args.next() {
        if command == "init" {
            let path = args
                .next()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("resilient-rmq.json"));
            create_default_config_file(&path)?;
            return Ok(());
        }
        return Err(anyhow!("Unknown command '{}'. Usage: resilient-rmq-worker [init [path]]", command));
    }

    let config = load_config()?;
    let queues: Vec<String> = config.topology.queues.keys().cloned().collect();
    if queues.is_empty() {
        warn!("No queues configured, nothing to consume");
    }

    let client = Arc::new(BrokerClient::with_lapin(config));
    client.connect()?;

    let mut consumers = JoinSet::new();
    for queue in queues {
        consumers.spawn(consume_forever(client.clone(), queue));
    }

    info!("Service running. Press Ctrl+C to exit.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Shutting down");
    client.disconnect().await?;
    while consumers.join_next().await.is_some() {}

    Ok(())
}
