// src/rabbitmq/topology.rs
// Declares exchanges, queues and bindings. Run on every (re)connect.

use tracing::debug;

use super::errors::{BrokerError, Result};
use super::transport::BrokerChannel;
use crate::config::TopologyConfig;

/// Declare exchanges, then queues, then bindings on `channel`.
///
/// Every declaration is idempotent on the broker side, so running this
/// after each reconnect is safe. Returns the declared queue names.
pub async fn declare(channel: &dyn BrokerChannel, topology: &TopologyConfig) -> Result<Vec<String>> {
    for (name, exchange) in &topology.exchanges {
        channel
            .exchange_declare(name, exchange.kind)
            .await
            .map_err(|e| failed("exchange", name, e))?;
        debug!("Declared exchange '{}' ({:?})", name, exchange.kind);
    }

    let mut queues = Vec::with_capacity(topology.queues.len());
    for (name, options) in &topology.queues {
        channel
            .queue_declare(name, options)
            .await
            .map_err(|e| failed("queue", name, e))?;
        debug!("Declared queue '{}' (durable: {}, lazy: {})", name, options.durable, options.lazy);
        queues.push(name.clone());
    }

    for binding in &topology.bindings {
        channel
            .queue_bind(&binding.queue, &binding.exchange, &binding.routing_key)
            .await
            .map_err(|e| failed("binding for queue", &binding.queue, e))?;
        debug!(
            "Bound queue '{}' to exchange '{}' with routing key '{}'",
            binding.queue, binding.exchange, binding.routing_key
        );
    }

    Ok(queues)
}

fn failed(what: &str, name: &str, error: BrokerError) -> BrokerError {
    BrokerError::TopologyDeclarationFailed(format!("{} '{}': {}", what, name, error))
}
