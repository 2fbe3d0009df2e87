// Shared helpers for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use resilient_rmq::config::{default_config, BrokerConfig};
use resilient_rmq::rabbitmq::memory::MemoryBroker;
use resilient_rmq::rabbitmq::ConnectionSupervisor;
use tokio::time::sleep;

pub const EXCHANGE: &str = "images";
pub const QUEUE: &str = "image.upload";
pub const ROUTING_KEY: &str = "upload";

/// Default topology with a 500ms reconnect interval.
pub fn config() -> BrokerConfig {
    default_config()
        .with_reconnect_policy(500, 7200)
        .with_confirm_timeout(100)
        .with_publish_timeout(5000)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn supervisor(broker: &MemoryBroker, config: BrokerConfig) -> Arc<ConnectionSupervisor> {
    init_tracing();
    Arc::new(ConnectionSupervisor::new(
        Arc::new(config),
        Arc::new(broker.connector()),
    ))
}

/// Connect and wait for the gate to open.
pub async fn connected(broker: &MemoryBroker, config: BrokerConfig) -> Arc<ConnectionSupervisor> {
    let supervisor = supervisor(broker, config);
    supervisor.connect().unwrap();
    supervisor
        .gate()
        .wait(true, sleep(Duration::from_secs(10)))
        .await
        .expect("supervisor did not connect");
    supervisor
}

/// Poll `condition` every 10ms until it holds or `within` elapses.
pub async fn eventually<F: Fn() -> bool>(condition: F, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}
