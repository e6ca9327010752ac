//! SSE event stream endpoint.
//!
//! GET /api/stream
//!
//! Subscribes to the event bus and forwards every crawl progress event to
//! the client as a JSON-encoded SSE message.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Extension;
use futures::stream::{self, Stream, StreamExt};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::AppState;

/// SSE handler. Opens with a `connected` event, then forwards broadcast
/// events; a subscriber that lags behind the channel capacity receives a
/// `lagged` event with the number of missed messages instead of silently
/// losing them.
pub async fn stream_handler(
    Extension(state): Extension<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();

    let connected =
        stream::once(async { Ok::<_, Infallible>(Event::default().event("connected").data("ok")) });

    let events = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(event) => Event::default().json_data(&event).ok().map(Ok),
            Err(BroadcastStreamRecvError::Lagged(missed)) => Event::default()
                .event("lagged")
                .json_data(&serde_json::json!({ "missed": missed }))
                .ok()
                .map(Ok),
        }
    });

    Sse::new(connected.chain(events)).keep_alive(KeepAlive::default())
}
