//! Error handling for the telemon engine
//!
//! This module defines the engine error type and a Result alias used
//! throughout the crate. Configuration problems, stage faults, archive
//! failures and dependency cycles all surface as [`EngineError`] variants.
//!
//! Note that a stage returning "no data" is *not* an error: that is the
//! normal skip-this-cycle signal and is modelled as `Ok(None)`.

use thiserror::Error;

/// Main error type for telemon operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// A malformed point-definition record
    #[error("Parse error on line {line}: {message}")]
    Parse { line: usize, message: String },

    /// A stage spec named a class that has no registered constructor
    #[error("Unknown stage class: {0}")]
    UnknownStage(String),

    /// Stage constructor rejected its arguments
    #[error("Invalid arguments for stage {stage}: {message}")]
    StageArgs { stage: String, message: String },

    /// Fault raised while a stage was translating a sample
    #[error("({point}) stage {stage} failed: {message}")]
    Stage {
        point: String,
        stage: String,
        message: String,
    },

    /// Errors related to Rhai expression evaluation
    #[error("Script error: {0}")]
    Script(String),

    /// Errors reported by the archive collaborator
    #[error("Archive error: {0}")]
    Archive(String),

    /// Errors reported by a data source collaborator
    #[error("Data source error: {0}")]
    Source(String),

    /// Lookup of a point name that is not registered
    #[error("Point not found: {0}")]
    PointNotFound(String),

    /// The listener graph between points contains a cycle
    #[error("Dependency cycle between points: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    /// A point was fired while its own chain was already running on this thread
    #[error("Re-entrant fire of point {0}")]
    ReentrantFire(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        EngineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for argument validation failures inside stage constructors
    pub fn stage_args(stage: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::StageArgs {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for telemon operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, Box<rhai::EvalAltResult>> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| EngineError::Script(e.to_string()).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| EngineError::Script(e.to_string()).with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::PointNotFound("site.power.current".to_string());
        assert_eq!(err.to_string(), "Point not found: site.power.current");
    }

    #[test]
    fn test_error_with_context() {
        let err = EngineError::UnknownStage("Frobnicate".to_string());
        let with_ctx = err.with_context("site.temp");
        assert!(with_ctx.to_string().contains("site.temp"));
        assert!(with_ctx.to_string().contains("Frobnicate"));
    }

    #[test]
    fn test_cycle_display_lists_path() {
        let err = EngineError::CycleDetected(vec!["a.x".into(), "a.y".into(), "a.x".into()]);
        assert_eq!(
            err.to_string(),
            "Dependency cycle between points: a.x -> a.y -> a.x"
        );
    }

    #[test]
    fn test_stage_fault_names_point_and_stage() {
        let err = EngineError::Stage {
            point: "ant.wind.speed".to_string(),
            stage: "Mean".to_string(),
            message: "boom".to_string(),
        };
        let text = err.to_string();
        assert!(text.starts_with("(ant.wind.speed)"));
        assert!(text.contains("Mean"));
    }

    #[test]
    fn test_result_context_wraps_source() {
        let res: Result<()> = Err(EngineError::stage_args("Mean", "window must be positive"));
        let err = res.context("site.temp").unwrap_err();
        assert!(err.to_string().starts_with("site.temp:"));
        assert!(matches!(err, EngineError::WithContext { .. }));
    }

    #[test]
    fn test_rhai_result_context() {
        let engine = rhai::Engine::new();
        let res = engine.eval::<f64>("1.0 + undefined_var");
        let err = res.context("site.calc").unwrap_err();
        assert!(err.to_string().starts_with("site.calc:"));
    }
}
