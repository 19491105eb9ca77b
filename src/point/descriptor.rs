//! Point descriptor: identity, stage chain and the fire path
//!
//! [`PointDescriptor::fire`] is the single entry for new data. It runs the
//! chain under the point's chain lock, then (for valid results) applies
//! alarm checks, updates the buffer, queues archiving, writes output
//! transactions, updates the alarm registry, reschedules and finally fans
//! the sample out to listeners. The chain lock is held for the whole fire
//! so samples of one point are processed in arrival order.

use crate::alarm::check::apply_checks;
use crate::alarm::{AlarmCheck, AlarmSubject};
use crate::archive::policy::{should_archive, ArchivePolicy};
use crate::config::points::{parse_stage_spec, PointDefinition};
use crate::engine::Engine;
use crate::error::{EngineError, Result, ResultExt};
use crate::point::listener::{ListenerList, PointListener};
use crate::point::schedule::{FireOutcome, ScheduleState};
use crate::scripting::ScriptEngine;
use crate::stage::{Activation, Stage, StageContext, StageInit, StageRegistry};
use crate::types::{Period, Sample, Timestamp};
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

/// Identity facts stages may need at construction
#[derive(Debug, Clone, PartialEq)]
pub struct PointInfo {
    /// `source.primaryName`
    pub full_name: String,
    pub source: String,
    /// Primary name first, then aliases, without the source
    pub names: Vec<String>,
    pub units: String,
    pub period: Period,
}

impl PointInfo {
    pub fn new(source: impl Into<String>, name: impl Into<String>) -> Self {
        let source = source.into();
        let name = name.into();
        Self {
            full_name: format!("{}.{}", source, name),
            source,
            names: vec![name],
            units: String::new(),
            period: Period::zero(),
        }
    }

    pub fn with_period(mut self, period: Period) -> Self {
        self.period = period;
        self
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    /// `source.alias` for every alias
    pub fn alias_names(&self) -> Vec<String> {
        self.names
            .iter()
            .skip(1)
            .map(|n| format!("{}.{}", self.source, n))
            .collect()
    }
}

/// The mutable per-fire state guarded by one lock
pub struct Chain {
    pub stages: Vec<Box<dyn Stage>>,
    pub checks: Vec<AlarmCheck>,
    pub policies: Vec<ArchivePolicy>,
}

thread_local! {
    static FIRE_STACK: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Marks a point as firing on this thread for the guard's lifetime
pub(crate) struct FireGuard;

impl FireGuard {
    /// Refuse to fire a point already firing further up this thread's
    /// stack, or past the depth limit
    pub(crate) fn enter(point: &str, max_depth: usize) -> Result<Self> {
        FIRE_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.iter().any(|p| p == point) {
                tracing::warn!(
                    "({}) Re-entrant fire via {}, dropped",
                    point,
                    stack.join(" -> ")
                );
                return Err(EngineError::ReentrantFire(point.to_string()));
            }
            if stack.len() >= max_depth {
                tracing::warn!("({}) Fan-out depth {} exceeded, dropped", point, max_depth);
                return Err(EngineError::ReentrantFire(point.to_string()));
            }
            stack.push(point.to_string());
            Ok(FireGuard)
        })
    }

    /// Current fire depth on this thread
    pub(crate) fn depth() -> usize {
        FIRE_STACK.with(|stack| stack.borrow().len())
    }
}

impl Drop for FireGuard {
    fn drop(&mut self) {
        FIRE_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// A monitored point
pub struct PointDescriptor {
    info: PointInfo,
    long_desc: String,
    short_desc: String,
    enabled: bool,
    /// Days to keep archived data, -1 for forever
    longevity: i32,
    /// -1 disables alarm tracking
    priority: i32,
    guidance: String,
    notifications: Vec<String>,
    /// Data source whose collector polls this point
    input_source: Option<String>,
    /// Data sources that receive every valid result
    output_targets: Vec<String>,
    dependencies: Vec<String>,
    chain: Mutex<Chain>,
    schedule: Mutex<ScheduleState>,
    listeners: ListenerList,
}

impl PointDescriptor {
    /// A bare point around a ready-made chain; the `with_*` methods fill
    /// in the rest
    pub fn new(info: PointInfo, stages: Vec<Box<dyn Stage>>) -> Self {
        let dependencies = stages.iter().flat_map(|s| s.dependencies()).collect();
        Self {
            info,
            long_desc: String::new(),
            short_desc: String::new(),
            enabled: true,
            longevity: -1,
            priority: -1,
            guidance: String::new(),
            notifications: Vec::new(),
            input_source: None,
            output_targets: Vec::new(),
            dependencies,
            chain: Mutex::new(Chain {
                stages,
                checks: Vec::new(),
                policies: Vec::new(),
            }),
            schedule: Mutex::new(ScheduleState::default()),
            listeners: ListenerList::new(),
        }
    }

    /// Build a point from a parsed definition, constructing its stages,
    /// alarm checks and archive policies
    pub fn from_definition(
        def: &PointDefinition,
        registry: &StageRegistry,
        scripts: &ScriptEngine,
    ) -> Result<Self> {
        let full_name = def.full_name();
        let info = PointInfo {
            full_name: full_name.clone(),
            source: def.source.clone(),
            names: def.names.clone(),
            units: def.units.clone(),
            period: def.period,
        };

        let mut stages = Vec::new();
        for spec in &def.translations {
            let Some(parsed) = parse_stage_spec(spec) else {
                continue;
            };
            let init = StageInit {
                class: &parsed.class,
                args: &parsed.args,
                point: &info,
                scripts,
            };
            let stage = registry
                .create(&init)
                .with_context(|| format!("({}) line {}", full_name, def.line))?;
            stages.push(stage);
        }

        let checks = AlarmCheck::parse_all(&def.limits)
            .with_context(|| format!("({}) limits on line {}", full_name, def.line))?;
        let policies = ArchivePolicy::parse_all(&def.archive)
            .with_context(|| format!("({}) archive policy on line {}", full_name, def.line))?;

        let mut point = Self::new(info, stages)
            .with_enabled(def.enabled)
            .with_checks(checks)
            .with_policies(policies)
            .with_priority(def.priority)
            .with_guidance(def.guidance.clone())
            .with_longevity(def.archive_longevity_days)
            .with_outputs(def.output_targets());
        point.long_desc = def.long_desc.clone();
        point.short_desc = def.short_desc.clone();
        point.notifications = def.notifications.clone();
        point.input_source = def.input_source();
        Ok(point)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_checks(self, checks: Vec<AlarmCheck>) -> Self {
        self.lock_chain().checks = checks;
        self
    }

    pub fn with_policies(self, policies: Vec<ArchivePolicy>) -> Self {
        self.lock_chain().policies = policies;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_guidance(mut self, guidance: impl Into<String>) -> Self {
        self.guidance = guidance.into();
        self
    }

    pub fn with_longevity(mut self, days: i32) -> Self {
        self.longevity = days;
        self
    }

    pub fn with_outputs(mut self, targets: Vec<String>) -> Self {
        self.output_targets = targets;
        self
    }

    // ---- accessors ----

    pub fn info(&self) -> &PointInfo {
        &self.info
    }

    pub fn full_name(&self) -> &str {
        &self.info.full_name
    }

    pub fn source(&self) -> &str {
        &self.info.source
    }

    pub fn long_desc(&self) -> &str {
        &self.long_desc
    }

    pub fn short_desc(&self) -> &str {
        &self.short_desc
    }

    pub fn units(&self) -> &str {
        &self.info.units
    }

    pub fn period(&self) -> Period {
        self.info.period
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn longevity(&self) -> i32 {
        self.longevity
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn notifications(&self) -> &[String] {
        &self.notifications
    }

    pub fn input_source(&self) -> Option<&str> {
        self.input_source.as_deref()
    }

    pub fn output_targets(&self) -> &[String] {
        &self.output_targets
    }

    /// Names of the points this point's stages listen to
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn listeners(&self) -> &ListenerList {
        &self.listeners
    }

    pub fn add_listener(&self, listener: Arc<dyn PointListener>) {
        self.listeners.add(listener);
    }

    /// The facts the alarm registry keeps about this point
    pub fn alarm_subject(&self) -> AlarmSubject {
        AlarmSubject {
            point: self.info.full_name.clone(),
            priority: self.priority,
            guidance: self.guidance.clone(),
            units: self.info.units.clone(),
            notifications: self.notifications.clone(),
        }
    }

    pub fn stage_count(&self) -> usize {
        self.lock_chain().stages.len()
    }

    // ---- scheduling ----

    pub fn schedule(&self) -> ScheduleState {
        self.lock_schedule().clone()
    }

    pub fn next_epoch(&self) -> Option<Timestamp> {
        self.lock_schedule().next_epoch
    }

    /// Mark as collecting if due at `now`; returns whether it was
    pub fn try_begin_collect(&self, now: Timestamp, timeout: Period) -> bool {
        let mut schedule = self.lock_schedule();
        if schedule.expire_collect(now, timeout) {
            tracing::warn!("({}) Collection timed out, retrying", self.full_name());
        }
        if !self.enabled || self.info.period <= Period::zero() || !schedule.is_due(now) {
            return false;
        }
        schedule.begin_collect(now);
        true
    }

    fn reschedule(&self, outcome: FireOutcome, now: Timestamp, retry: Period) {
        let next = self.lock_schedule().reschedule(
            self.full_name(),
            self.info.period,
            outcome,
            now,
            retry,
        );
        tracing::trace!("({}) Next collection at {:?}", self.full_name(), next);
    }

    // ---- lifecycle ----

    /// Give every stage the chance to register deferred work
    pub fn activate(self: &Arc<Self>, engine: &Engine) {
        let wants_preceding = self.lock_chain().stages.iter().any(|s| s.needs_preceding());
        // Buffer and archive reads happen before the chain is locked
        let preceding = if wants_preceding {
            engine.preceding(self.full_name(), engine.now())
        } else {
            None
        };
        let act = Activation {
            engine,
            point: self,
            preceding,
        };
        let mut chain = self.lock_chain();
        for stage in chain.stages.iter_mut() {
            if let Err(e) = stage.activate(&act) {
                tracing::error!(
                    "({}) Failed to activate stage {}: {}",
                    self.full_name(),
                    stage.name(),
                    e
                );
            }
        }
    }

    /// Process one sample.
    ///
    /// With `is_raw` the sample runs through the stage chain first. Returns
    /// the published sample, or `None` when the chain produced nothing.
    pub fn fire(self: &Arc<Self>, engine: &Engine, raw: Sample, is_raw: bool) -> Result<Option<Sample>> {
        let _guard = FireGuard::enter(self.full_name(), engine.config().scheduler.max_fire_depth)?;
        let mut chain = self.lock_chain();
        let now = engine.now();
        let retry = engine.config().scheduler.retry_interval();

        tracing::trace!("({}) Fire {} raw={}", self.full_name(), raw, is_raw);
        let result = if is_raw {
            self.run_chain(&mut chain, engine, raw, now)
        } else {
            Some(raw)
        };

        let Some(mut result) = result else {
            self.reschedule(FireOutcome::NoData, now, retry);
            return Ok(None);
        };
        if result.name() != self.full_name() {
            result = result.renamed(self.full_name());
        }

        if !result.is_valid() {
            self.reschedule(FireOutcome::NoData, now, retry);
            self.listeners.distribute(self, &result);
            return Ok(Some(result));
        }

        let result = apply_checks(&mut chain.checks, result);
        let archive_now = self.enabled && should_archive(&mut chain.policies, &result);

        engine.buffer().append(self.full_name(), result.clone());
        if archive_now {
            engine.queue_archive(self.full_name(), &result);
        }
        if self.enabled {
            self.write_outputs(engine, &result);
        }
        if self.priority > -1 {
            engine.alarms().set_alarm(&self.alarm_subject(), &result);
        }
        self.reschedule(FireOutcome::Valid(result.timestamp()), now, retry);

        self.listeners.distribute(self, &result);
        Ok(Some(result))
    }

    fn run_chain(&self, chain: &mut Chain, engine: &Engine, input: Sample, now: Timestamp) -> Option<Sample> {
        let ctx = StageContext {
            point: self,
            engine,
            now,
        };
        let total = chain.stages.len();
        let mut current = input;

        for (i, stage) in chain.stages.iter_mut().enumerate() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| stage.translate(current, &ctx)));
            let fault = match outcome {
                Ok(Ok(Some(next))) => {
                    current = next;
                    continue;
                }
                Ok(Ok(None)) => return None,
                Ok(Err(e)) => e.to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            };
            tracing::error!(
                "({}) Error on stage {}/{} ({}): {}",
                self.full_name(),
                i + 1,
                total,
                stage.name(),
                fault
            );
            return None;
        }

        Some(current)
    }

    fn write_outputs(&self, engine: &Engine, sample: &Sample) {
        for target in &self.output_targets {
            match engine.source(target) {
                None => tracing::warn!(
                    "({}) Output transaction to unknown data source {}",
                    self.full_name(),
                    target
                ),
                Some(source) if !source.is_connected() => tracing::warn!(
                    "({}) Output transaction skipped, {} is not connected",
                    self.full_name(),
                    target
                ),
                Some(source) => {
                    if let Err(e) = source.put_data(self.full_name(), sample) {
                        tracing::warn!(
                            "({}) Output transaction to {} failed: {}",
                            self.full_name(),
                            target,
                            e
                        );
                    }
                }
            }
        }
    }

    fn lock_chain(&self) -> MutexGuard<'_, Chain> {
        self.chain.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_schedule(&self) -> MutexGuard<'_, ScheduleState> {
        self.schedule.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

impl std::fmt::Debug for PointDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointDescriptor")
            .field("name", &self.info.full_name)
            .field("period", &self.info.period)
            .field("enabled", &self.enabled)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
