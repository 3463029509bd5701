//! Live event stream: `GET /events/sessions/{id}`.
//!
//! Replays journalled events past `since_seq`, then follows the live
//! subscriber queue. The registration is cleaned up by the store once the
//! client disconnects and the queue closes.

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;

use super::error::ApiError;
use super::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventStreamQuery {
    #[serde(default)]
    pub since_seq: u64,
    /// Heartbeats are filtered from live delivery unless requested.
    #[serde(default)]
    pub heartbeats: bool,
}

/// GET /events/sessions/{session_id}
pub async fn session_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<EventStreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    if state.store.get_session(&session_id).is_none() {
        return Err(ApiError::not_found("Session not found"));
    }

    // Subscribe before reading the journal so no event falls in the gap;
    // anything delivered on both sides is dropped by the seq filter below.
    let subscriber = state.store.subscribe(&session_id, query.heartbeats);
    let replay = state
        .store
        .read_event_log(&session_id, query.since_seq, None);
    let replayed_up_to = replay
        .last()
        .map(|event| event.seq)
        .unwrap_or(query.since_seq);

    let live = ReceiverStream::new(subscriber.rx)
        .filter(move |event| futures::future::ready(event.seq > replayed_up_to));
    let stream = futures::stream::iter(replay)
        .chain(live)
        .map(|event| {
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Ok(SseEvent::default().data(data))
        });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
