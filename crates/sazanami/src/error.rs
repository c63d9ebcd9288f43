use thiserror::Error;

/// Coarse classification of a [SazanamiError], used by callers that only
/// need to branch on the family of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Buffer,
    Index,
    Manifest,
    Cancelled,
    Io,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("request timed out: {url}")]
    Timeout { url: String },

    #[error("HTTP error {status}: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl NetworkError {
    /// Timeouts, transport failures, 408, 429 and 5xx are worth another attempt.
    /// Other 4xx statuses will not change by retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport(_) => true,
            Self::HttpStatus { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// The sink has no room left. Recoverable once playback consumes some media.
    #[error("buffer is full")]
    Full,

    #[error("corrupted segment: {0}")]
    Corrupt(String),

    #[error("codec mismatch: {0}")]
    CodecMismatch(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("segment not found at {time}s in representation {representation_id}")]
    SegmentNotFound {
        representation_id: String,
        time: f64,
    },

    #[error("inconsistent timing: {0}")]
    InconsistentTiming(String),

    #[error("no period found at {0}s")]
    NoPeriod(f64),

    #[error("no adaptation available for {0}")]
    NoAdaptation(String),

    #[error("no representation left to play in adaptation {0}")]
    NoRepresentation(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SazanamiError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("Invalid manifest: {0}")]
    Manifest(String),

    #[error("Invalid timing schema: {0:?}")]
    InvalidTimingSchema(String),

    #[error("Invalid datetime: {0}")]
    DateTimeParsing(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(String),
}

impl SazanamiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::Buffer(_) => ErrorKind::Buffer,
            Self::Index(_) => ErrorKind::Index,
            Self::Manifest(_) | Self::InvalidTimingSchema(_) | Self::DateTimeParsing(_) => {
                ErrorKind::Manifest
            }
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Default retry predicate for network operations.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SazanamiError {
    fn from(e: reqwest::Error) -> Self {
        let url = e.url().map(|u| u.to_string()).unwrap_or_default();
        if e.is_timeout() {
            NetworkError::Timeout { url }.into()
        } else if let Some(status) = e.status() {
            NetworkError::HttpStatus {
                status: status.as_u16(),
                url,
            }
            .into()
        } else {
            NetworkError::Transport(e.to_string()).into()
        }
    }
}

impl From<url::ParseError> for SazanamiError {
    fn from(e: url::ParseError) -> Self {
        Self::Manifest(format!("invalid url: {e}"))
    }
}

impl From<dash_mpd::DashMpdError> for SazanamiError {
    fn from(e: dash_mpd::DashMpdError) -> Self {
        Self::Manifest(e.to_string())
    }
}

impl From<chrono::ParseError> for SazanamiError {
    fn from(e: chrono::ParseError) -> Self {
        Self::DateTimeParsing(e.to_string())
    }
}

impl From<chrono::OutOfRangeError> for SazanamiError {
    fn from(e: chrono::OutOfRangeError) -> Self {
        Self::DateTimeParsing(e.to_string())
    }
}

impl From<std::io::Error> for SazanamiError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type SazanamiResult<T> = Result<T, SazanamiError>;
