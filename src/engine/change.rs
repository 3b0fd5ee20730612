use crate::models::matching::CandidateSummary;

/// Remembers the last summary pushed to clients.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    last_broadcast: Option<CandidateSummary>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the summary when it differs from the last one broadcast, and
    /// records it as broadcast.
    pub fn observe(&mut self, summary: CandidateSummary) -> Option<CandidateSummary> {
        if self.last_broadcast.as_ref() == Some(&summary) {
            return None;
        }

        self.last_broadcast = Some(summary.clone());
        Some(summary)
    }

    pub fn last_broadcast(&self) -> Option<&CandidateSummary> {
        self.last_broadcast.as_ref()
    }
}
