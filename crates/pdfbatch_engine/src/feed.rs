use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use pdfbatch_core::ProgressRecord;

use crate::progress_store::ProgressStore;

/// A full snapshot is re-sent after this many unchanged ticks.
const HEARTBEAT_RESEND: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Snapshot(ProgressRecord),
    /// Nothing changed since the last snapshot.
    Heartbeat,
    /// The progress id is unknown; the feed ends.
    NotFound,
}

struct FeedState {
    store: Arc<ProgressStore>,
    id: String,
    interval: Duration,
    last_sent: Option<ProgressRecord>,
    unchanged_ticks: u32,
    first: bool,
    done: bool,
}

/// Polls the store every `interval` until the record reaches a terminal status
/// or disappears. The terminal snapshot is always delivered before the end.
pub fn progress_feed(
    store: Arc<ProgressStore>,
    id: impl Into<String>,
    interval: Duration,
) -> impl Stream<Item = FeedEvent> + Send {
    let state = FeedState {
        store,
        id: id.into(),
        interval,
        last_sent: None,
        unchanged_ticks: 0,
        first: true,
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        if !state.first {
            tokio::time::sleep(state.interval).await;
        }
        state.first = false;

        let Some(record) = state.store.get(&state.id) else {
            state.done = true;
            return Some((FeedEvent::NotFound, state));
        };

        let terminal = record.is_terminal();
        let changed = state.last_sent.as_ref() != Some(&record);
        let event = if changed || terminal || state.unchanged_ticks >= HEARTBEAT_RESEND {
            state.unchanged_ticks = 0;
            state.last_sent = Some(record.clone());
            FeedEvent::Snapshot(record)
        } else {
            state.unchanged_ticks += 1;
            FeedEvent::Heartbeat
        };
        state.done = terminal;
        Some((event, state))
    })
}
