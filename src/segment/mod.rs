//! Segment container and the capture-side writer.

pub mod format;
mod writer;

pub use format::{FrameCodec, SegmentFile};
pub use writer::{SegmentWriter, SegmentWriterConfig, WrittenSegment};

use crate::error::StageError;
use crate::storage::ObjectStore;
use crate::WorkUnit;

/// Fetch and decode the captured segment of `unit`.
///
/// Storage errors are `StorageUnavailable`; bytes that do not decode are
/// `CorruptSegment`.
pub fn load_segment(store: &dyn ObjectStore, unit: &WorkUnit) -> Result<SegmentFile, StageError> {
    let location = unit
        .location
        .as_deref()
        .ok_or_else(|| StageError::CorruptSegment {
            location: unit.id.clone(),
            reason: "unit has no captured segment".to_string(),
        })?;
    let bytes = store.get(location).map_err(StageError::storage)?;
    SegmentFile::decode(&bytes).map_err(|e| StageError::CorruptSegment {
        location: location.to_string(),
        reason: format!("{e:#}"),
    })
}
