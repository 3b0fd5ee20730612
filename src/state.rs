use tokio::sync::{broadcast, watch};

use crate::broadcast::protocol::ServerMessage;
use crate::broadcast::registry::SessionRegistry;
use crate::models::matching::CandidateSummary;
use crate::observability::metrics::Metrics;

pub struct AppState {
    pub sessions: SessionRegistry,
    pub latest_summary: watch::Sender<CandidateSummary>,
    pub events_tx: broadcast::Sender<ServerMessage>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(event_buffer_size: usize, session_queue_size: usize) -> Self {
        let (events_tx, _unused_rx) = broadcast::channel(event_buffer_size.max(1));
        let (latest_summary, _unused_watch) = watch::channel(CandidateSummary::default());

        Self {
            sessions: SessionRegistry::new(session_queue_size),
            latest_summary,
            events_tx,
            metrics: Metrics::new(),
        }
    }

    /// Summary computed by the most recent successful cycle; sent to clients
    /// as their initial snapshot.
    pub fn current_summary(&self) -> CandidateSummary {
        self.latest_summary.borrow().clone()
    }

    pub fn publish_summary(&self, summary: CandidateSummary) {
        self.latest_summary.send_replace(summary);
    }

    /// Fans a frame out to every connected session. Returns how many
    /// connection tasks were subscribed.
    pub fn broadcast(&self, message: ServerMessage) -> usize {
        self.events_tx.send(message).unwrap_or(0)
    }
}
