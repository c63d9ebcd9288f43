use std::{future::Future, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::RANGE;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{IndexError, NetworkError, SazanamiError, SazanamiResult},
    index::Segment,
    util::http::HttpClient,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Init,
    Media,
}

/// Segment data, as handed to the buffer sink.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedChunk {
    pub chunk_type: ChunkType,
    pub data: Bytes,
    /// Offset of `data` in the loaded resource.
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchProgress {
    pub size: u64,
    pub total_size: Option<u64>,
    pub duration: Duration,
}

pub type ProgressReporter = dyn Fn(FetchProgress) + Send + Sync;

/// Loads the data of one segment.
///
/// Data of a request which did not complete, because of an error or of
/// `cancel`, is never returned.
pub trait SegmentFetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        segment: &Segment,
        on_progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> impl Future<Output = SazanamiResult<Vec<ParsedChunk>>> + Send;
}

impl<F> SegmentFetcher for Arc<F>
where
    F: SegmentFetcher,
{
    fn fetch(
        &self,
        segment: &Segment,
        on_progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> impl Future<Output = SazanamiResult<Vec<ParsedChunk>>> + Send {
        self.as_ref().fetch(segment, on_progress, cancel)
    }
}

/// Fetcher loading segments over HTTP.
#[derive(Clone, Default)]
pub struct HttpSegmentFetcher {
    client: HttpClient,
    timeout: Option<Duration>,
}

impl HttpSegmentFetcher {
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            timeout: None,
        }
    }

    /// Abort requests taking longer than `timeout` with [NetworkError::Timeout].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl SegmentFetcher for HttpSegmentFetcher {
    async fn fetch(
        &self,
        segment: &Segment,
        on_progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> SazanamiResult<Vec<ParsedChunk>> {
        let url = segment.url.clone().ok_or_else(|| IndexError::SegmentNotFound {
            representation_id: segment.representation_id.clone(),
            time: segment.start(),
        })?;

        let started = Instant::now();
        let mut request = self.client.get(url.clone());
        if let Some(byte_range) = segment.byte_range {
            request = request.header(RANGE, byte_range.to_http_range());
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SazanamiError::Cancelled),
            response = request.send() => response?,
        };
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%url, %status, "Segment request failed");
            return Err(NetworkError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }
            .into());
        }

        let total_size = response.content_length();
        let mut stream = response.bytes_stream();
        let mut data = BytesMut::with_capacity(total_size.unwrap_or_default() as usize);
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SazanamiError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            data.extend_from_slice(&chunk?);
            on_progress(FetchProgress {
                size: data.len() as u64,
                total_size,
                duration: started.elapsed(),
            });
        }

        tracing::debug!(
            file = %segment.file_name(),
            size = data.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Segment loaded"
        );
        Ok(vec![ParsedChunk {
            chunk_type: if segment.is_init {
                ChunkType::Init
            } else {
                ChunkType::Media
            },
            data: data.freeze(),
            offset: segment.byte_range.map_or(0, |range| range.offset),
        }])
    }
}
