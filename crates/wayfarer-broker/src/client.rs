//! Reconnecting broker client
//!
//! Wraps a dialer with reconnect-on-failure and exponential backoff. A
//! request in flight when the connection drops fails with `Transport`;
//! the next operation redials.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::connection::{BrokerConnection, Subscription};
use crate::error::{BrokerError, BrokerResult};

/// Broker client configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Default request/reply timeout
    pub request_timeout: Duration,
    /// First reconnect delay
    pub reconnect_initial_backoff: Duration,
    /// Backoff ceiling
    pub reconnect_max_backoff: Duration,
    /// Dial attempts before an operation gives up
    pub max_reconnect_attempts: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            request_timeout: crate::DEFAULT_REQUEST_TIMEOUT,
            reconnect_initial_backoff: Duration::from_millis(100),
            reconnect_max_backoff: Duration::from_secs(10),
            max_reconnect_attempts: 10,
        }
    }
}

/// Opens broker connections; the concrete transport is injected
#[async_trait]
pub trait BrokerDialer: Send + Sync {
    async fn dial(&self, addresses: &[String]) -> BrokerResult<Arc<dyn BrokerConnection>>;
}

/// Reconnecting wrapper over a `BrokerDialer`
pub struct BrokerClient {
    dialer: Arc<dyn BrokerDialer>,
    addresses: Vec<String>,
    config: BrokerConfig,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
}

impl BrokerClient {
    pub fn new(dialer: Arc<dyn BrokerDialer>, addresses: Vec<String>, config: BrokerConfig) -> Self {
        Self {
            dialer,
            addresses,
            config,
            connection: Mutex::new(None),
        }
    }

    /// Current connection, dialing with backoff when there is none
    async fn connection(&self) -> BrokerResult<Arc<dyn BrokerConnection>> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref() {
            return Ok(connection.clone());
        }

        let mut backoff = self.config.reconnect_initial_backoff;
        let mut last_error = None;
        for attempt in 1..=self.config.max_reconnect_attempts {
            match self.dialer.dial(&self.addresses).await {
                Ok(connection) => {
                    debug!(attempt, "broker connection established");
                    *guard = Some(connection.clone());
                    return Ok(connection);
                }
                Err(err) => {
                    warn!(attempt, %err, "broker dial failed, backing off");
                    last_error = Some(err);
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.reconnect_max_backoff);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| BrokerError::Transport("broker dial failed".to_string())))
    }

    /// Drops the cached connection so the next operation redials
    async fn invalidate(&self) {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.take() {
            connection.close().await;
        }
    }

    pub async fn publish(&self, subject: &str, data: Bytes) -> BrokerResult<()> {
        let connection = self.connection().await?;
        match connection.publish(subject, data).await {
            Err(err @ (BrokerError::Transport(_) | BrokerError::Closed)) => {
                self.invalidate().await;
                Err(err)
            }
            other => other,
        }
    }

    pub async fn subscribe(&self, subject: &str) -> BrokerResult<Subscription> {
        let connection = self.connection().await?;
        connection.subscribe(subject).await
    }

    /// Request with the configured default timeout
    pub async fn request(&self, subject: &str, data: Bytes) -> BrokerResult<Bytes> {
        self.request_with_timeout(subject, data, self.config.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        subject: &str,
        data: Bytes,
        timeout: Duration,
    ) -> BrokerResult<Bytes> {
        let connection = self.connection().await?;
        match connection.request(subject, data, timeout).await {
            Err(err @ (BrokerError::Transport(_) | BrokerError::Closed)) => {
                self.invalidate().await;
                Err(err)
            }
            other => other,
        }
    }

    pub async fn close(&self) {
        self.invalidate().await;
    }
}
