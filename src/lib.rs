//! # telemon: Telemetry Monitoring Engine
//!
//! A monitoring engine for distributed physical systems. Named points are
//! fed raw samples by data sources, run them through a configurable chain
//! of transformation stages, and hand the result to a recent-sample buffer,
//! an archive, alarm tracking and whoever listens to the point, including
//! other points' stages.
//!
//! ## Architecture
//!
//! - **Engine**: one explicit context owning the registries, buffer, timers and sources
//! - **Points**: descriptors with a stage chain, an event bus and collection scheduling
//! - **Stages**: the transformation catalog, created by class name from definitions
//! - **Collection**: data sources deliver raw samples through a crossbeam channel
//! - **Scripting**: Rhai expressions for `EQ` and `Calculation` stages
//!
//! ## Configuration
//!
//! Engine settings are read from a TOML (or JSON) file; point definitions
//! come from a whitespace-separated record file, see [`config::points`].
//! The default configuration lives in the platform data directory under
//! `io.telemon.engine`.
//!
//! ## Example
//!
//! ```ignore
//! use telemon::{config::EngineConfig, types::Sample, Engine};
//!
//! let engine = Engine::new(EngineConfig::default());
//! let report = engine.load_definitions(
//!     r#"temp "Air temperature" "Temp" C site T - - {EQ-"x / 10.0"} - - 0 -"#,
//! );
//! engine.mark_points_created();
//!
//! engine.fire("site.temp", Sample::new("site.temp", chrono::Utc::now(), 215.0))?;
//! assert_eq!(engine.latest("site.temp").and_then(|s| s.as_f64()), Some(21.5));
//! ```

pub mod alarm;
pub mod archive;
pub mod buffer;
pub mod collector;
pub mod config;
pub mod engine;
pub mod error;
pub mod point;
pub mod scripting;
pub mod stage;
pub mod timer;
pub mod types;

// Re-export commonly used types
pub use collector::{DataSource, SampleSink, TimerDriver};
pub use config::EngineConfig;
pub use engine::{Engine, LoadReport, WeakEngine};
pub use error::{EngineError, Result};
pub use point::{PointDescriptor, PointListener};
pub use stage::{Stage, StageRegistry};
pub use types::{Sample, Timestamp, Value};
