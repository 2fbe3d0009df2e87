//! Level-triggered boolean condition that tasks can await.
//!
//! The connection supervisor flips a [`Gate`] between connected and
//! disconnected; publishers and consumers wait on it before touching the
//! broker. [`Shutdown`] is the same primitive used as a one-way
//! cancellation signal.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

use super::errors::{BrokerError, Result};

#[derive(Debug, Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub fn new(value: bool) -> Self {
        let (tx, _rx) = watch::channel(value);
        Self { tx: Arc::new(tx) }
    }

    /// Current value, without blocking.
    pub fn get(&self) -> bool {
        *self.tx.borrow()
    }

    /// Set the value and wake every waiter whose desired value now matches.
    pub fn notify(&self, value: bool) {
        self.tx.send_replace(value);
    }

    /// Suspend until the gate equals `desired`, or fail with
    /// [`BrokerError::Cancelled`] if `cancel` resolves first.
    ///
    /// The subscription is taken before the value is inspected, so a
    /// `notify` racing with this call is never missed. Wakeups for values
    /// other than `desired` are absorbed by re-checking.
    pub async fn wait<C>(&self, desired: bool, cancel: C) -> Result<()>
    where
        C: Future<Output = ()>,
    {
        let mut rx = self.tx.subscribe();
        let satisfied = *rx.borrow_and_update() == desired;
        if satisfied {
            return Ok(());
        }

        tokio::select! {
            biased;
            changed = async { rx.wait_for(|value| *value == desired).await.is_ok() } => {
                // The sender lives as long as `self`, so this only fails if
                // the gate is torn down mid-wait.
                if changed { Ok(()) } else { Err(BrokerError::Cancelled) }
            }
            _ = cancel => Err(BrokerError::Cancelled),
        }
    }
}

/// Cloneable cancellation signal. Once triggered it stays triggered.
#[derive(Debug, Clone)]
pub struct Shutdown {
    gate: Gate,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            gate: Gate::new(false),
        }
    }

    pub fn trigger(&self) {
        self.gate.notify(true);
    }

    pub fn is_triggered(&self) -> bool {
        self.gate.get()
    }

    /// Resolves once [`Shutdown::trigger`] has been called on any clone.
    pub async fn triggered(&self) {
        // Never cancelled, so the only outcome is the gate opening.
        let _ = self.gate.wait(true, std::future::pending()).await;
    }
}
