use std::time::Duration;

use tokio::time::Instant;

use crate::index::{Segment, SegmentKey};

/// Progress of an in-flight request.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressInfo {
    /// Bytes received so far.
    pub size: u64,
    pub total_size: Option<u64>,
    /// Time since the request was sent.
    pub duration: Duration,
    pub timestamp: Instant,
}

/// What an in-flight request is loading.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContent {
    pub segment: Segment,
    pub bitrate: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub id: u64,
    pub request_timestamp: Instant,
    pub progress: Vec<ProgressInfo>,
    pub content: RequestContent,
}

impl PendingRequest {
    pub fn loaded_bytes(&self) -> u64 {
        self.progress.last().map_or(0, |p| p.size)
    }

    /// Throughput observed so far, in bits per second.
    pub fn observed_bandwidth(&self, now: Instant) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.request_timestamp);
        if elapsed.is_zero() {
            return None;
        }
        Some(self.loaded_bytes() as f64 * 8. / elapsed.as_secs_f64())
    }
}

/// In-flight segment requests of one media type.
#[derive(Debug, Default)]
pub struct PendingRequestsStore {
    requests: Vec<PendingRequest>,
}

impl PendingRequestsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new request. Refused if the id or the segment is already tracked.
    pub fn add(&mut self, id: u64, request_timestamp: Instant, content: RequestContent) -> bool {
        let key = content.segment.key();
        if self
            .requests
            .iter()
            .any(|r| r.id == id || r.content.segment.key() == key)
        {
            tracing::warn!(id, time = key.time, representation_id = %key.representation_id, "Request already pending");
            return false;
        }

        let position = self
            .requests
            .partition_point(|r| r.request_timestamp <= request_timestamp);
        self.requests.insert(
            position,
            PendingRequest {
                id,
                request_timestamp,
                progress: Vec::new(),
                content,
            },
        );
        true
    }

    pub fn add_progress(&mut self, id: u64, progress: ProgressInfo) {
        match self.requests.iter_mut().find(|r| r.id == id) {
            Some(request) => request.progress.push(progress),
            None => tracing::debug!(id, "Progress for unknown request"),
        }
    }

    pub fn remove(&mut self, id: u64) -> Option<PendingRequest> {
        let position = self.requests.iter().position(|r| r.id == id)?;
        Some(self.requests.remove(position))
    }

    pub fn contains(&self, key: &SegmentKey) -> bool {
        self.requests.iter().any(|r| &r.content.segment.key() == key)
    }

    /// Requests ordered by the time they were sent.
    pub fn requests(&self) -> &[PendingRequest] {
        &self.requests
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}
