use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default capacity of the broadcast channel. Slow subscribers that fall
/// further behind than this see a `Lagged` error instead of blocking emitters.
pub const DEFAULT_CAPACITY: usize = 256;

/// Category of a progress event, serialized lowercase for the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Info,
    Crawl,
    Save,
    Error,
    Ai,
    AiSuccess,
    Success,
}

/// A single progress event as delivered to stream subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Fan-out bus for crawl progress events.
///
/// Emitting never blocks and never fails: events sent while no subscriber
/// is connected are simply dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CrawlEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CrawlEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, kind: EventKind, message: impl Into<String>) {
        let event = CrawlEvent {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        };
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(EventKind::Crawl, "[Depth 0] Fetching: https://www.coburg.de");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Crawl);
        assert!(event.message.contains("coburg.de"));
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.emit(EventKind::Info, "nobody listening");
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn event_kinds_serialize_lowercase() {
        let event = CrawlEvent {
            kind: EventKind::AiSuccess,
            message: "done".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"ai_success""#));

        let info = serde_json::to_string(&EventKind::Info).unwrap();
        assert_eq!(info, r#""info""#);
    }
}
