//! Consumer session history
//!
//! Bus-driven record of past and current sessions: created on the session
//! event, byte counters updated from statistics, closed on the ended event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use wayfarer_session::SessionId;

use crate::bus::{AppEvent, ConsumerSessionStatus, EventBus};

/// One remembered session
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// In-memory session history fed from the event bus
pub struct SessionHistory {
    records: Mutex<HashMap<SessionId, HistoryRecord>>,
}

impl SessionHistory {
    /// Create the history and start consuming bus events
    pub fn attach(bus: &EventBus) -> Arc<Self> {
        let history = Arc::new(Self {
            records: Mutex::new(HashMap::new()),
        });

        let mut events = bus.subscribe();
        let listener = history.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                listener.consume(event);
            }
        });
        history
    }

    fn consume(&self, event: AppEvent) {
        let mut records = self.records.lock().expect("history lock poisoned");
        match event {
            AppEvent::ConsumerSession {
                status: ConsumerSessionStatus::Created,
                session_id,
            } => {
                records.insert(
                    session_id.clone(),
                    HistoryRecord {
                        session_id,
                        started_at: Utc::now(),
                        ended_at: None,
                        bytes_sent: 0,
                        bytes_received: 0,
                    },
                );
            }
            AppEvent::ConsumerSession {
                status: ConsumerSessionStatus::Ended,
                session_id,
            } => {
                if let Some(record) = records.get_mut(&session_id) {
                    record.ended_at = Some(Utc::now());
                }
            }
            AppEvent::Statistics { session_id, stats } => {
                if let Some(record) = records.get_mut(&session_id) {
                    record.bytes_sent = stats.bytes_sent;
                    record.bytes_received = stats.bytes_received;
                }
            }
            _ => {}
        }
    }

    pub fn get(&self, session_id: &SessionId) -> Option<HistoryRecord> {
        self.records
            .lock()
            .expect("history lock poisoned")
            .get(session_id)
            .cloned()
    }

    pub fn list(&self) -> Vec<HistoryRecord> {
        self.records
            .lock()
            .expect("history lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::TunnelStats;
    use std::time::Duration;

    #[tokio::test]
    async fn test_history_tracks_lifecycle() {
        let bus = EventBus::new();
        let history = SessionHistory::attach(&bus);
        let session_id = SessionId::generate();

        bus.publish(AppEvent::ConsumerSession {
            status: ConsumerSessionStatus::Created,
            session_id: session_id.clone(),
        });
        bus.publish(AppEvent::Statistics {
            session_id: session_id.clone(),
            stats: TunnelStats {
                bytes_sent: 11,
                bytes_received: 22,
                at: Utc::now(),
            },
        });
        bus.publish(AppEvent::ConsumerSession {
            status: ConsumerSessionStatus::Ended,
            session_id: session_id.clone(),
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        let record = history.get(&session_id).expect("record expected");
        assert_eq!(record.bytes_sent, 11);
        assert_eq!(record.bytes_received, 22);
        assert!(record.ended_at.is_some());
        assert_eq!(history.list().len(), 1);
    }

    #[tokio::test]
    async fn test_statistics_for_unknown_session_ignored() {
        let bus = EventBus::new();
        let history = SessionHistory::attach(&bus);

        bus.publish(AppEvent::Statistics {
            session_id: SessionId::generate(),
            stats: TunnelStats::default(),
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(history.list().is_empty());
    }
}
