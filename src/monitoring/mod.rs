//! Run Monitoring
//!
//! - [`ExecutionTimeline`]: task start/end timing for Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
