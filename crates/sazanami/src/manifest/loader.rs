use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{dash, Clock, Manifest, ManifestUpdater};
use crate::{
    config::RetryConfig,
    error::{NetworkError, SazanamiError, SazanamiResult},
    retry::{RetryExecutor, RetryOptions},
    util::http::HttpClient,
};

/// Fetches MPD documents and converts them, retrying failed requests.
///
/// The clock is synchronised on the first dynamic manifest and reused afterwards.
pub struct ManifestLoader {
    client: HttpClient,
    retry: RetryExecutor,
    options: RetryOptions,
    clock: Mutex<Option<Clock>>,
}

impl ManifestLoader {
    pub fn new(client: HttpClient, retry: &RetryConfig) -> Self {
        Self {
            client,
            retry: RetryExecutor::new(),
            options: retry.to_options(),
            clock: Mutex::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    pub async fn load(&self, url: &Url, cancel: &CancellationToken) -> SazanamiResult<Manifest> {
        let text = self
            .retry
            .run(
                |_| self.fetch_text(url),
                &self.options,
                SazanamiError::is_retryable,
                |error, attempt, delay| {
                    tracing::warn!(%url, %error, attempt, ?delay, "Manifest request failed, retrying");
                },
                cancel,
            )
            .await?;

        let mpd = dash_mpd::parse(&text)?;
        let mut clock = self.clock.lock().await;
        if mpd.mpdtype.as_deref() == Some("dynamic") && clock.is_none() {
            let mut synced = Clock::new();
            if let Err(error) = synced.sync(&mpd.UTCTiming, &self.client).await {
                tracing::warn!(%error, "Failed to sync clock, using local time");
            }
            *clock = Some(synced);
        }
        let clock = (*clock).unwrap_or_default();
        dash::from_mpd(&mpd, Some(url), &clock)
    }

    async fn fetch_text(&self, url: &Url) -> SazanamiResult<String> {
        tracing::debug!(%url, "Fetching manifest");
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }
            .into());
        }
        Ok(response.text().await?)
    }
}

impl ManifestUpdater {
    /// Load the manifest at `url` and merge it into the current one.
    pub async fn refresh_from(
        &self,
        loader: &ManifestLoader,
        url: &Url,
        cancel: &CancellationToken,
    ) -> SazanamiResult<()> {
        let manifest = loader.load(url, cancel).await?;
        self.update(manifest);
        Ok(())
    }

    /// Refresh from the location the current manifest was loaded from.
    pub async fn refresh(
        &self,
        loader: &ManifestLoader,
        cancel: &CancellationToken,
    ) -> SazanamiResult<()> {
        let url = self
            .current()
            .url
            .clone()
            .ok_or_else(|| SazanamiError::Manifest("Manifest has no location".to_string()))?;
        self.refresh_from(loader, &url, cancel).await
    }
}
