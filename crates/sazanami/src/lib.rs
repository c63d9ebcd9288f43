//! Adaptive bitrate streaming engine.
//!
//! ```text
//! ┌──────────────┐  observations  ┌──────────────────────────────────────────────┐
//! │              ├────────────────►                 Orchestrator                 │
//! │    Player    │                │                                              │
//! │              ◄────────────────┤  AdaptationStream ─► RepresentationStream ─┐ │
//! └──────────────┘     events     │        ▲                  │ buffer status  │ │
//!                                 │        │ estimate         ▼                │ │
//! ┌──────────────┐    updates     │  RepresentationEstimator  SegmentIndex     │ │
//! │ManifestLoader├────────────────►        ▲                                   │ │
//! └──────────────┘                │        │ metrics     SegmentFetcher ◄──────┤ │
//!                                 │        └──────────────────┘                │ │
//!                                 │                              SegmentSink ◄─┘ │
//!                                 └──────────────────────────────────────────────┘
//! ```
pub mod abr;
pub mod buffer;
pub mod config;
pub mod error;
pub mod fetch;
pub mod index;
pub mod manifest;
pub mod observer;
pub mod retry;
pub mod stream;
pub mod util;

#[cfg(test)]
mod test_util;

pub use config::StreamingConfig;
pub use error::{ErrorKind, SazanamiError, SazanamiResult};
pub use fetch::{HttpSegmentFetcher, SegmentFetcher};
pub use manifest::{Manifest, ManifestHandle, ManifestLoader, ManifestUpdater, MediaType};
pub use observer::{ObservationHandle, PlaybackObservation, PlaybackObserver};
pub use stream::{Orchestrator, OrchestratorCommand, OrchestratorEvent};
pub use util::http::HttpClient;
