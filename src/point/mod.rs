//! Points: descriptors, their event bus, scheduling and lookup
//!
//! A point is identified by `source.primaryName` and may answer to aliases.
//! Each point owns an ordered stage chain and a listener list; listeners of
//! one point are often the input stages of another, which makes the set of
//! points a dependency graph. [`graph`] checks that graph for cycles when
//! definitions are loaded.

pub mod descriptor;
pub mod graph;
pub mod listener;
pub mod registry;
pub mod schedule;

pub use descriptor::{Chain, PointDescriptor, PointInfo};
pub use graph::DependencyGraph;
pub use listener::{ListenerList, PointListener};
pub use registry::PointRegistry;
pub use schedule::{FireOutcome, ScheduleState};
