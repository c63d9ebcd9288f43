//! What is buffered, and what has to be loaded next.
pub mod inventory;
pub mod ranges;
pub mod sink;
pub mod status;

pub use inventory::{BufferedChunk, ChunkQuality, SegmentInventory};
pub use ranges::{BufferedRanges, TimeRange};
pub use sink::{MemorySink, PushedChunk, SegmentSink};
pub use status::{get_buffer_status, BufferStatus, BufferStatusInput, Discontinuity};
