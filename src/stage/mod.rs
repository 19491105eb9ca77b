//! Transformation stages
//!
//! Every point runs incoming samples through an ordered chain of stages.
//! A stage maps one sample to another, or to `None` to end the chain for
//! this cycle (which is not an error).
//!
//! # Catalog
//!
//! - [`mappers`]: stateless functions of one input
//! - [`stateful`]: stages that remember earlier input (deltas, timers, pulses)
//! - [`windowed`]: trailing time-window aggregates
//! - [`accumulators`]: running sums and peaks with an external reset
//! - [`calendar`]: wall-clock pulses driven by the shared timer
//! - [`listeners`]: stages fed by other points through [`slots::InputSlots`]
//!
//! Stages are created by name through a [`StageRegistry`], which maps the
//! class name used in point definitions to a constructor function.

pub mod accumulators;
pub mod calendar;
pub mod listeners;
pub mod mappers;
pub mod slots;
pub mod stateful;
pub mod windowed;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::point::{PointDescriptor, PointInfo};
use crate::scripting::ScriptEngine;
use crate::types::{period_from_secs_f64, Period, Sample, Timestamp};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

/// Namespace prefix that may precede a class name in definitions
pub const DEFAULT_NAMESPACE: &str = "Translation";

/// What a stage sees while translating
pub struct StageContext<'a> {
    /// The point running the chain
    pub point: &'a PointDescriptor,
    pub engine: &'a Engine,
    /// Engine clock at the start of this fire
    pub now: Timestamp,
}

/// Passed to [`Stage::activate`] once the owning point is registered
pub struct Activation<'a> {
    pub engine: &'a Engine,
    pub point: &'a Arc<PointDescriptor>,
    /// Last stored sample of the point, looked up only when some stage
    /// asks for it through [`Stage::needs_preceding`]
    pub preceding: Option<Sample>,
}

/// Constructor input
pub struct StageInit<'a> {
    /// Class name as written in the definition
    pub class: &'a str,
    pub args: &'a [String],
    pub point: &'a PointInfo,
    pub scripts: &'a ScriptEngine,
}

/// One link of a point's chain
pub trait Stage: Send {
    /// Class name used in log messages
    fn name(&self) -> &str;

    /// Map one sample. `Ok(None)` ends the chain for this cycle.
    fn translate(&mut self, input: Sample, ctx: &StageContext<'_>) -> Result<Option<Sample>>;

    /// Register deferred work (subscriptions, timers). Called once after
    /// the owning point is registered.
    fn activate(&mut self, _act: &Activation<'_>) -> Result<()> {
        Ok(())
    }

    /// Activation should carry the point's last stored sample
    fn needs_preceding(&self) -> bool {
        false
    }

    /// Full names of the points this stage listens to
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Stage constructor
pub type StageCtor = fn(&StageInit<'_>) -> Result<Box<dyn Stage>>;

/// Class name to constructor table
#[derive(Clone, Default)]
pub struct StageRegistry {
    ctors: HashMap<String, StageCtor>,
}

impl StageRegistry {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with every built-in stage
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        mappers::register(&mut registry);
        stateful::register(&mut registry);
        windowed::register(&mut registry);
        accumulators::register(&mut registry);
        calendar::register(&mut registry);
        listeners::register(&mut registry);
        registry
    }

    /// Add or replace a constructor
    pub fn register(&mut self, name: impl Into<String>, ctor: StageCtor) {
        self.ctors.insert(name.into(), ctor);
    }

    pub fn contains(&self, class: &str) -> bool {
        self.resolve(class).is_some()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ctors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.ctors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ctors.is_empty()
    }

    /// Look a class up as given, then without a package path, then
    /// without the default namespace prefix
    fn resolve(&self, class: &str) -> Option<StageCtor> {
        if let Some(ctor) = self.ctors.get(class) {
            return Some(*ctor);
        }
        let short = class.rsplit('.').next().unwrap_or(class);
        if let Some(ctor) = self.ctors.get(short) {
            return Some(*ctor);
        }
        short
            .strip_prefix(DEFAULT_NAMESPACE)
            .filter(|rest| !rest.is_empty())
            .and_then(|rest| self.ctors.get(rest).copied())
    }

    /// Build a stage from its class name and arguments
    pub fn create(&self, init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        let ctor = self
            .resolve(init.class)
            .ok_or_else(|| EngineError::UnknownStage(init.class.to_string()))?;
        ctor(init)
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.ctors.len())
            .finish()
    }
}

// ==================== Argument helpers ====================

/// Fail unless at least `n` arguments are present
pub(crate) fn require_args(class: &str, args: &[String], n: usize, usage: &str) -> Result<()> {
    if args.len() < n {
        return Err(EngineError::stage_args(
            class,
            format!("expected {}, got {} argument(s)", usage, args.len()),
        ));
    }
    Ok(())
}

/// Parse a required argument
pub(crate) fn parse_arg<T: FromStr>(class: &str, args: &[String], i: usize, what: &str) -> Result<T> {
    let text = args
        .get(i)
        .ok_or_else(|| EngineError::stage_args(class, format!("missing {}", what)))?;
    text.trim()
        .parse()
        .map_err(|_| EngineError::stage_args(class, format!("bad {} \"{}\"", what, text)))
}

/// Parse an optional argument
pub(crate) fn parse_opt<T: FromStr>(
    class: &str,
    args: &[String],
    i: usize,
    what: &str,
) -> Result<Option<T>> {
    match args.get(i) {
        None => Ok(None),
        Some(_) => parse_arg(class, args, i, what).map(Some),
    }
}

/// A duration given in (possibly fractional) seconds
pub(crate) fn parse_secs(class: &str, args: &[String], i: usize, what: &str) -> Result<Period> {
    let secs: f64 = parse_arg(class, args, i, what)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(EngineError::stage_args(class, format!("bad {} \"{}\"", what, secs)));
    }
    Ok(period_from_secs_f64(secs))
}

/// Error for input of the wrong kind
pub(crate) fn unexpected_input(class: &str, sample: &Sample, expected: &str) -> EngineError {
    EngineError::Stage {
        point: sample.name().to_string(),
        stage: class.to_string(),
        message: format!(
            "expected {} input, got {}",
            expected,
            sample.value().map_or("null", |v| v.kind())
        ),
    }
}

/// Case-insensitive "true"
pub(crate) fn parse_flag(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("true")
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Helpers for exercising a single stage outside a full point

    use super::*;
    use crate::config::EngineConfig;
    use crate::timer::ManualClock;
    use crate::types::{timestamp_from_secs, Value};

    /// An engine on a manual clock plus a bare point to give stages context
    pub struct Harness {
        pub engine: Engine,
        pub clock: Arc<ManualClock>,
        pub point: Arc<PointDescriptor>,
        pub scripts: ScriptEngine,
    }

    impl Harness {
        pub fn new() -> Self {
            let clock = Arc::new(ManualClock::new(timestamp_from_secs(0)));
            let engine = Engine::with_clock(EngineConfig::default(), clock.clone());
            let point = Arc::new(PointDescriptor::new(PointInfo::new("site", "test"), Vec::new()));
            Self {
                engine,
                clock,
                point,
                scripts: ScriptEngine::new(),
            }
        }

        pub fn info(&self) -> &PointInfo {
            self.point.info()
        }

        /// Construct through the built-in registry
        pub fn build(&self, class: &str, args: &[&str]) -> Result<Box<dyn Stage>> {
            let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
            let init = StageInit {
                class,
                args: &args,
                point: self.info(),
                scripts: &self.scripts,
            };
            StageRegistry::with_builtins().create(&init)
        }

        /// Run one sample through a stage at data time `t` (seconds)
        pub fn run(&self, stage: &mut dyn Stage, t: i64, value: Option<Value>) -> Option<Sample> {
            let ts = timestamp_from_secs(t);
            self.clock.set(ts);
            let ctx = StageContext {
                point: &self.point,
                engine: &self.engine,
                now: ts,
            };
            stage
                .translate(Sample::from_option("site.test", ts, value), &ctx)
                .unwrap()
        }

        /// Numeric output of [`Harness::run`]
        pub fn run_f64(&self, stage: &mut dyn Stage, t: i64, value: impl Into<Value>) -> Option<f64> {
            self.run(stage, t, Some(value.into())).and_then(|s| s.as_f64())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::Harness;
    use super::*;

    #[test]
    fn test_builtins_cover_catalog() {
        let registry = StageRegistry::with_builtins();
        for name in [
            "None", "EQ", "Polynomial", "BitShift", "Squelch", "StringMap", "EnumMap",
            "NumberToBool", "AngleToNumber", "NumberToAngle", "FormatString", "StringToNumber",
            "NV", "BytesToString", "DewPoint", "RoundToInt", "NumDecimals", "StringCase",
            "StringTrim", "StringReplace", "Substring", "StopIfNull", "CopyTimestamp", "Delta",
            "StopIfNoChange", "StuckValue", "HighTimer", "LowTimer", "Pulse",
            "RetriggerablePulse", "Mean", "Minimum", "Maximum", "PeakDetect", "Variance",
            "ResettableIntegrator", "ResettablePeakDetect", "ResettablePulse", "DailyIntegrator",
            "DailyIntegratorPosOnly", "DailyPulse", "MonthlyPulse", "CronPulse", "DailyWindow",
            "Listener", "Calculation", "CalculationTimed", "XY2Mag", "XY2Angle", "Ratio",
            "LinearCombo", "AvailabilityMask", "DualListen", "Synch", "Difference", "Preceding",
            "Failover", "SourceSelector", "TimedSubstitution", "SinceHighTimer", "DetectChange",
        ] {
            assert!(registry.contains(name), "missing stage {}", name);
        }
    }

    #[test]
    fn test_name_resolution() {
        let registry = StageRegistry::with_builtins();
        assert!(registry.contains("TranslationMean"));
        assert!(registry.contains("atnf.atoms.mon.translation.TranslationMean"));
        assert!(!registry.contains("mean"));
        assert!(!registry.contains("Translation"));
    }

    #[test]
    fn test_unknown_class() {
        let h = Harness::new();
        match h.build("Frobnicate", &[]) {
            Err(EngineError::UnknownStage(name)) => assert_eq!(name, "Frobnicate"),
            other => panic!("unexpected {:?}", other.map(|s| s.name().to_string())),
        }
    }

    #[test]
    fn test_custom_registration() {
        fn ctor(_init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
            Ok(Box::new(mappers::Identity))
        }
        let mut registry = StageRegistry::new();
        assert!(registry.is_empty());
        registry.register("Custom", ctor);
        assert_eq!(registry.names(), vec!["Custom"]);
        assert!(registry.contains("TranslationCustom"));
    }

    #[test]
    fn test_arg_helpers() {
        let args: Vec<String> = vec!["1.5".into(), "x".into()];
        assert_eq!(parse_arg::<f64>("T", &args, 0, "value").unwrap(), 1.5);
        assert!(parse_arg::<f64>("T", &args, 1, "value").is_err());
        assert_eq!(parse_opt::<i64>("T", &args, 5, "count").unwrap(), None);
        assert_eq!(parse_secs("T", &args, 0, "period").unwrap(), Period::milliseconds(1500));
        assert!(require_args("T", &args, 3, "three").is_err());
    }
}
