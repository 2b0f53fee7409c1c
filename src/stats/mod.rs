//! Session statistics.

pub mod delay;
pub mod registry;

pub use registry::{Info, SessionInfo, StatisticsRegistry};
