//! Session statistics publishing

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, trace};
use wayfarer_payment::TrafficObserver;
use wayfarer_session::{DoneSignal, SessionId};

use crate::bus::{AppEvent, EventBus};
use crate::capabilities::Tunnel;

/// Last observed transfer total, shared with the payment engine so invoice
/// validation sees what the tunnel actually moved.
#[derive(Default)]
pub struct SharedTraffic {
    bytes: AtomicU64,
}

impl SharedTraffic {
    pub fn record(&self, total: u64) {
        self.bytes.store(total, Ordering::Relaxed);
    }
}

impl TrafficObserver for SharedTraffic {
    fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Periodically reads tunnel stats onto the bus until `done` closes
pub fn spawn_stats_publisher(
    bus: EventBus,
    tunnel: Arc<dyn Tunnel>,
    session_id: SessionId,
    report_interval: Duration,
    traffic: Arc<SharedTraffic>,
    done: DoneSignal,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(report_interval);
        loop {
            tokio::select! {
                _ = done.wait() => {
                    debug!(%session_id, "stats publisher stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match tunnel.stats().await {
                Ok(stats) => {
                    traffic.record(stats.bytes_sent + stats.bytes_received);
                    bus.publish(AppEvent::Statistics {
                        session_id: session_id.clone(),
                        stats,
                    });
                }
                Err(err) => trace!(%err, "could not read tunnel stats"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::FakeTunnel;

    #[tokio::test]
    async fn test_stats_flow_to_bus_and_observer() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let tunnel = FakeTunnel::new();
        tunnel.set_stats(1000, 2345);

        let traffic = Arc::new(SharedTraffic::default());
        let done = DoneSignal::new();
        spawn_stats_publisher(
            bus,
            tunnel.clone(),
            SessionId::generate(),
            Duration::from_millis(20),
            traffic.clone(),
            done.clone(),
        );

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("statistics event expected")
            .unwrap();
        match event {
            AppEvent::Statistics { stats, .. } => {
                assert_eq!(stats.bytes_sent, 1000);
                assert_eq!(stats.bytes_received, 2345);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(traffic.bytes_transferred(), 3345);

        done.close();
    }
}
