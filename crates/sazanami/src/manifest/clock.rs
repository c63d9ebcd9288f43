use chrono::{DateTime, TimeDelta, Utc};
use dash_mpd::UTCTiming;

use crate::{
    error::{NetworkError, SazanamiError, SazanamiResult},
    util::http::HttpClient,
};

const SCHEME_HTTP_XSDATE: &str = "urn:mpeg:dash:utc:http-xsdate:2014";
const SCHEME_HTTP_ISO: &str = "urn:mpeg:dash:utc:http-iso:2014";
const SCHEME_HTTP_HEAD: &str = "urn:mpeg:dash:utc:http-head:2014";
const SCHEME_DIRECT: &str = "urn:mpeg:dash:utc:direct:2014";

/// Wall clock corrected with the server time announced by `UTCTiming`.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    /// How much time the local clock is behind the remote clock
    offset: TimeDelta,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            offset: TimeDelta::zero(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.offset
    }

    /// Server time as seconds since the UNIX epoch.
    pub fn unix_now(&self) -> f64 {
        self.now().timestamp_micros() as f64 / 1_000_000.
    }

    pub fn offset_secs(&self) -> f64 {
        self.offset.num_milliseconds() as f64 / 1000.
    }

    fn set_time(
        &mut self,
        remote_now: DateTime<Utc>,
        before_request: DateTime<Utc>,
        after_request: DateTime<Utc>,
    ) {
        // the server answered somewhere between both instants, assume the middle
        let half_rtt = (after_request - before_request) / 2;
        self.offset = remote_now + half_rtt - after_request;
        tracing::info!(
            offset_milliseconds = self.offset.num_milliseconds(),
            "Clock time set to {remote_now}, offset calculated"
        );
    }

    /// Try every timing source in order, keeping the first one that answers.
    ///
    /// Without any source the local clock is trusted. NTP schemes are not supported.
    pub async fn sync(&mut self, timings: &[UTCTiming], client: &HttpClient) -> SazanamiResult<()> {
        if timings.is_empty() {
            tracing::warn!("No UTCTiming elements found in MPD, using local time.");
            self.offset = TimeDelta::zero();
            return Ok(());
        }

        let mut last_error = None;
        for timing in timings {
            let scheme = timing.schemeIdUri.as_str();
            tracing::debug!(
                scheme,
                value = timing.value.as_deref().unwrap_or(""),
                "Attempting to sync time with scheme"
            );
            match self.sync_with(scheme, timing.value.as_deref(), client).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    tracing::warn!(scheme, %error, "Time sync failed");
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SazanamiError::InvalidTimingSchema(
                "All supported time sync methods failed".to_string(),
            )
        }))
    }

    async fn sync_with(
        &mut self,
        scheme: &str,
        value: Option<&str>,
        client: &HttpClient,
    ) -> SazanamiResult<()> {
        let value = value.ok_or_else(|| {
            SazanamiError::InvalidTimingSchema(format!("Missing value for {scheme}"))
        })?;

        match scheme {
            SCHEME_HTTP_XSDATE | SCHEME_HTTP_ISO => {
                let before_request = Utc::now();
                let response = client.get(value).send().await?;
                let after_request = Utc::now();
                check_status(&response, value)?;
                let text = response.text().await?;
                let remote_now = parse_iso8601(text.trim())?;
                self.set_time(remote_now, before_request, after_request);
            }
            SCHEME_HTTP_HEAD => {
                let before_request = Utc::now();
                let response = client.head(value).send().await?;
                let after_request = Utc::now();
                check_status(&response, value)?;
                let date = response
                    .headers()
                    .get(reqwest::header::DATE)
                    .ok_or_else(|| SazanamiError::DateTimeParsing("Missing Date header".into()))?
                    .to_str()
                    .map_err(|_| SazanamiError::DateTimeParsing("Invalid Date header".into()))?;
                let remote_now = DateTime::parse_from_rfc2822(date)?.with_timezone(&Utc);
                self.set_time(remote_now, before_request, after_request);
            }
            SCHEME_DIRECT => {
                let remote_now = parse_iso8601(value)?;
                let now = Utc::now();
                self.set_time(remote_now, now, now);
            }
            others => {
                return Err(SazanamiError::InvalidTimingSchema(format!(
                    "Unsupported scheme: {others}"
                )))
            }
        }
        Ok(())
    }
}

fn check_status(response: &reqwest::Response, url: &str) -> SazanamiResult<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    Err(NetworkError::HttpStatus {
        status: status.as_u16(),
        url: url.to_string(),
    }
    .into())
}

fn parse_iso8601(text: &str) -> SazanamiResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // xs:dateTime allows a bare Z suffix without fractional seconds
            DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%SZ").map(|dt| dt.with_timezone(&Utc))
        })?)
}
