//! Adaptive bitrate: bandwidth estimation and representation choice.
pub mod bandwidth;
pub mod estimator;
pub mod ewma;
pub mod pending;

pub use bandwidth::BandwidthEstimator;
pub use estimator::{
    ChoiceReason, Constraints, EstimatorInput, RepresentationChoice, RepresentationEstimator,
};
pub use pending::{PendingRequest, PendingRequestsStore, ProgressInfo, RequestContent};
