//! The engine context
//!
//! [`Engine`] owns everything a running monitor shares: the point registry,
//! the stage table, the point buffer, the alarm registry, the timer facility,
//! the archive and the data sources. It is a cheap clone around one
//! `Arc`; deferred work holds a [`WeakEngine`] so that dropping the last
//! engine handle tears everything down.
//!
//! # Loading
//!
//! [`Engine::load_definitions`] turns definition text into live points:
//!
//! 1. parse the records (bad lines are reported and skipped)
//! 2. build each point's stages, alarm checks and archive policies
//! 3. check the listener graph for cycles and drop the points on them
//! 4. register the survivors under their names and aliases
//! 5. activate their stages (subscriptions, calendar timers)

use crate::alarm::{AlarmEventListener, AlarmRegistry};
use crate::archive::{ArchiveQueue, SharedArchive};
use crate::buffer::{BufferLimits, PointBuffer};
use crate::collector::{CollectionScheduler, DataSource, SampleSink};
use crate::config::points::parse_definitions;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::point::{DependencyGraph, PointDescriptor, PointRegistry};
use crate::scripting::ScriptEngine;
use crate::stage::{StageCtor, StageRegistry};
use crate::timer::{SharedClock, SystemClock, TaskControl, TaskId, TimerService};
use crate::types::{Period, Sample, Timestamp};
use crossbeam_channel::{unbounded, Receiver};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, Weak};
use std::thread::JoinHandle;

/// Outcome of loading a batch of point definitions
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Full names of the points that were registered
    pub loaded: Vec<String>,
    /// Every record or point that was rejected
    pub errors: Vec<EngineError>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    clock: SharedClock,
    registry: PointRegistry,
    stages: RwLock<StageRegistry>,
    scripts: ScriptEngine,
    buffer: PointBuffer,
    alarms: AlarmRegistry,
    timers: TimerService,
    archive: RwLock<Option<SharedArchive>>,
    archive_queue: ArchiveQueue,
    sources: RwLock<HashMap<String, Arc<dyn DataSource>>>,
    sink: SampleSink,
    ingest: Receiver<Sample>,
    points_created: AtomicBool,
}

/// Shared handle to a monitoring engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Non-owning handle held by timer tasks and listeners
#[derive(Clone)]
pub struct WeakEngine {
    inner: Weak<EngineInner>,
}

impl WeakEngine {
    pub fn upgrade(&self) -> Option<Engine> {
        self.inner.upgrade().map(|inner| Engine { inner })
    }
}

impl Engine {
    /// An engine on the system clock
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// An engine on a caller-supplied clock
    pub fn with_clock(config: EngineConfig, clock: SharedClock) -> Self {
        let (tx, rx) = unbounded();
        let buffer = PointBuffer::new(BufferLimits::from(&config.buffer));
        Self {
            inner: Arc::new(EngineInner {
                config,
                clock,
                registry: PointRegistry::new(),
                stages: RwLock::new(StageRegistry::with_builtins()),
                scripts: ScriptEngine::new(),
                buffer,
                alarms: AlarmRegistry::new(),
                timers: TimerService::new(),
                archive: RwLock::new(None),
                archive_queue: ArchiveQueue::new(),
                sources: RwLock::new(HashMap::new()),
                sink: SampleSink::new(tx),
                ingest: rx,
                points_created: AtomicBool::new(false),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    // ==================== Subsystems ====================

    pub fn registry(&self) -> &PointRegistry {
        &self.inner.registry
    }

    pub fn buffer(&self) -> &PointBuffer {
        &self.inner.buffer
    }

    pub fn alarms(&self) -> &AlarmRegistry {
        &self.inner.alarms
    }

    pub fn timers(&self) -> &TimerService {
        &self.inner.timers
    }

    pub fn scripts(&self) -> &ScriptEngine {
        &self.inner.scripts
    }

    /// Collection scheduler over this engine's points and sources
    pub fn scheduler(&self) -> CollectionScheduler<'_> {
        CollectionScheduler::new(self)
    }

    /// Where data sources deliver raw samples
    pub fn sink(&self) -> SampleSink {
        self.inner.sink.clone()
    }

    pub(crate) fn ingest_receiver(&self) -> &Receiver<Sample> {
        &self.inner.ingest
    }

    // ==================== Registration ====================

    /// Add or replace a stage constructor
    pub fn register_stage(&self, name: impl Into<String>, ctor: StageCtor) {
        self.inner
            .stages
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register(name, ctor);
    }

    fn stages(&self) -> RwLockReadGuard<'_, StageRegistry> {
        self.inner.stages.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a data source under its name. The first source of a name wins.
    pub fn register_source(&self, source: Arc<dyn DataSource>) {
        let name = source.name();
        let mut sources = self.inner.sources.write().unwrap_or_else(|e| e.into_inner());
        if sources.contains_key(&name) {
            tracing::warn!("Data source {} already registered, ignored", name);
            return;
        }
        tracing::info!("Registered data source {}", name);
        sources.insert(name, source);
    }

    pub fn source(&self, name: &str) -> Option<Arc<dyn DataSource>> {
        self.inner
            .sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn set_archive(&self, archive: SharedArchive) {
        *self.inner.archive.write().unwrap_or_else(|e| e.into_inner()) = Some(archive);
    }

    pub fn archive(&self) -> Option<SharedArchive> {
        self.inner
            .archive
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn add_alarm_listener(&self, listener: Arc<dyn AlarmEventListener>) {
        self.inner.alarms.add_listener(listener);
    }

    // ==================== Loading ====================

    /// Load definitions from text. Rejected records and points are logged
    /// and listed in the report; everything else goes live.
    pub fn load_definitions(&self, text: &str) -> LoadReport {
        let (definitions, mut errors) = parse_definitions(text);

        let mut built = Vec::with_capacity(definitions.len());
        {
            let stages = self.stages();
            for def in &definitions {
                match PointDescriptor::from_definition(def, &stages, self.scripts()) {
                    Ok(point) => built.push(Arc::new(point)),
                    Err(e) => {
                        tracing::error!("Error creating point {}: {}", def.full_name(), e);
                        errors.push(e);
                    }
                }
            }
        }

        let excluded = self.check_cycles(&built, &mut errors);

        let mut registered = Vec::with_capacity(built.len());
        for point in built {
            if excluded.contains(point.full_name()) {
                continue;
            }
            match self.registry().register(point.clone()) {
                Ok(()) => registered.push(point),
                Err(e) => {
                    tracing::warn!("{}", e);
                    errors.push(e);
                }
            }
        }

        for point in &registered {
            point.activate(self);
        }

        let loaded: Vec<String> = registered.iter().map(|p| p.full_name().to_string()).collect();
        tracing::info!(
            "Loaded {} point(s), {} rejected record(s)",
            loaded.len(),
            errors.len()
        );
        LoadReport { loaded, errors }
    }

    /// Cycle check over the already registered points plus `new`; returns
    /// the names of the new points that must not be registered
    fn check_cycles(&self, new: &[Arc<PointDescriptor>], errors: &mut Vec<EngineError>) -> HashSet<String> {
        let mut graph = DependencyGraph::new();
        for point in self.points().iter().chain(new) {
            graph.add_point(
                point.full_name(),
                &point.info().alias_names(),
                point.dependencies().to_vec(),
            );
        }

        for cycle in graph.cycles() {
            let e = EngineError::CycleDetected(cycle);
            tracing::error!("{}, points excluded", e);
            errors.push(e);
        }
        graph.cyclic_points().into_iter().collect()
    }

    /// Load a definitions file
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<LoadReport> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read point definitions {:?}: {}", path, e))
        })?;
        tracing::info!("Loading point definitions from {:?}", path);
        Ok(self.load_definitions(&text))
    }

    // ==================== Points ====================

    /// Look up by full name or alias
    pub fn point(&self, name: &str) -> Option<Arc<PointDescriptor>> {
        self.inner.registry.get(name)
    }

    pub fn points(&self) -> Vec<Arc<PointDescriptor>> {
        self.inner.registry.points()
    }

    /// Push a raw sample through a named point's chain
    pub fn fire(&self, name: &str, raw: Sample) -> Result<Option<Sample>> {
        self.fire_point(name, raw, true)
    }

    /// Fire a named point, optionally bypassing its chain
    pub fn fire_point(&self, name: &str, sample: Sample, is_raw: bool) -> Result<Option<Sample>> {
        let point = self
            .point(name)
            .ok_or_else(|| EngineError::PointNotFound(name.to_string()))?;
        point.fire(self, sample, is_raw)
    }

    /// Every point from the initial load now exists. Listeners still
    /// waiting for a target after this give up with a warning.
    pub fn mark_points_created(&self) {
        if !self.inner.points_created.swap(true, Ordering::SeqCst) {
            tracing::info!("All {} point(s) created", self.inner.registry.len());
        }
    }

    pub fn points_created(&self) -> bool {
        self.inner.points_created.load(Ordering::SeqCst)
    }

    /// Canonical name for a full name or alias
    fn resolve_name(&self, name: &str) -> String {
        self.point(name)
            .map(|p| p.full_name().to_string())
            .unwrap_or_else(|| name.to_string())
    }

    // ==================== Queries ====================

    /// Samples in `[start, end]` from the buffer, reaching into the
    /// archive when needed, thinned to at most `max_samples`
    pub fn query(
        &self,
        name: &str,
        start: Timestamp,
        end: Timestamp,
        max_samples: Option<usize>,
    ) -> Option<Vec<Sample>> {
        let archive = self.archive();
        self.inner
            .buffer
            .query(&self.resolve_name(name), start, end, max_samples, archive.as_deref())
    }

    pub fn latest(&self, name: &str) -> Option<Sample> {
        self.inner.buffer.latest(&self.resolve_name(name))
    }

    pub fn preceding(&self, name: &str, t: Timestamp) -> Option<Sample> {
        let archive = self.archive();
        self.inner
            .buffer
            .preceding(&self.resolve_name(name), t, archive.as_deref())
    }

    pub fn following(&self, name: &str, t: Timestamp) -> Option<Sample> {
        let archive = self.archive();
        self.inner
            .buffer
            .following(&self.resolve_name(name), t, archive.as_deref())
    }

    // ==================== Archive ====================

    pub(crate) fn queue_archive(&self, point: &str, sample: &Sample) {
        self.inner.archive_queue.push(point, sample);
    }

    /// Write all queued samples on the calling thread
    pub fn flush_archive(&self) -> usize {
        let archive = self.archive();
        self.inner.archive_queue.drain(archive.as_deref())
    }

    /// Start the background archive writer, if an archive is set
    pub fn spawn_archive_writer(&self, running: Arc<AtomicBool>) -> Result<Option<JoinHandle<()>>> {
        let Some(archive) = self.archive() else {
            return Ok(None);
        };
        let handle = self.inner.archive_queue.spawn_writer(archive, running)?;
        Ok(Some(handle))
    }

    // ==================== Alarms ====================

    /// Acknowledge or un-acknowledge a point's alarm
    pub fn acknowledge(&self, name: &str, acknowledged: bool, by: &str) -> Result<()> {
        let point = self
            .point(name)
            .ok_or_else(|| EngineError::PointNotFound(name.to_string()))?;
        self.inner
            .alarms
            .set_acknowledged(&point.alarm_subject(), acknowledged, by, self.now());
        Ok(())
    }

    /// Shelve or un-shelve a point's alarm
    pub fn shelve(&self, name: &str, shelved: bool, by: &str) -> Result<()> {
        let point = self
            .point(name)
            .ok_or_else(|| EngineError::PointNotFound(name.to_string()))?;
        self.inner
            .alarms
            .set_shelved(&point.alarm_subject(), shelved, by, self.now());
        Ok(())
    }

    // ==================== Timers ====================

    /// Register a repeating task on the shared timer
    pub fn schedule_task<F>(
        &self,
        name: impl Into<String>,
        first_due: Timestamp,
        period: Period,
        action: F,
    ) -> TaskId
    where
        F: FnMut(Timestamp) -> TaskControl + Send + 'static,
    {
        self.inner.timers.schedule(name, first_due, period, action)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("points", &self.inner.registry.len())
            .field("timers", &self.inner.timers.len())
            .field("points_created", &self.points_created())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{AlarmEvent, AlarmStatus};
    use crate::archive::{Archive, MemoryArchive};
    use crate::stage::{Stage, StageContext};
    use crate::timer::ManualClock;
    use crate::types::{timestamp_from_secs, Value};
    use std::sync::Mutex;

    fn engine() -> (Engine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(timestamp_from_secs(1_000)));
        (Engine::with_clock(EngineConfig::default(), clock.clone()), clock)
    }

    const DEFS: &str = r#"
# names  long desc   short  units source enabled in out translations  limits archive period   longevity
{temp,t} "Air temp"  "Temp" C     site   T       -  -   {EQ-"x * 2"}   -      -       10000000 -
bad record
scaled   "Scaled"    "Sc"   C     site   T       -  -   {Bogus-"1"}    -      -       10000000 -
"#;

    #[test]
    fn test_load_reports_and_registers() {
        let (engine, _) = engine();
        let report = engine.load_definitions(DEFS);
        assert_eq!(report.loaded, vec!["site.temp"]);
        assert_eq!(report.errors.len(), 2);
        assert!(!report.is_clean());
        assert!(engine.point("site.t").is_some());
        assert!(engine.point("site.scaled").is_none());
    }

    #[test]
    fn test_fire_and_query_by_alias() {
        let (engine, _) = engine();
        engine.load_definitions(DEFS);
        let out = engine
            .fire("site.t", Sample::new("site.temp", timestamp_from_secs(1_000), 21.0))
            .unwrap()
            .unwrap();
        assert_eq!(out.as_f64(), Some(42.0));
        assert_eq!(engine.latest("site.t").and_then(|s| s.as_f64()), Some(42.0));
        let range = engine
            .query("site.temp", timestamp_from_secs(900), timestamp_from_secs(1_100), None)
            .unwrap();
        assert_eq!(range.len(), 1);
        assert!(matches!(
            engine.fire("site.nothing", Sample::null("site.nothing", timestamp_from_secs(0))),
            Err(EngineError::PointNotFound(_))
        ));
    }

    #[test]
    fn test_cycle_is_excluded() {
        let (engine, _) = engine();
        let text = r#"
a "A" "A" - site T - - {Listener-"1""site.b"} - - 0 -
b "B" "B" - site T - - {Listener-"1""site.a"} - - 0 -
c "C" "C" - site T - - {Listener-"1""site.a"} - - 0 -
"#;
        let report = engine.load_definitions(text);
        assert_eq!(report.loaded, vec!["site.c"]);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, EngineError::CycleDetected(_))));
    }

    #[test]
    fn test_duplicate_point_keeps_first() {
        let (engine, _) = engine();
        let text = r#"
x "First" "X" - site T - - - - - 0 -
x "Second" "X" - site T - - - - - 0 -
"#;
        let report = engine.load_definitions(text);
        assert_eq!(report.loaded.len(), 1);
        assert_eq!(engine.point("site.x").unwrap().long_desc(), "First");
    }

    #[test]
    fn test_preceding_reaches_archive() {
        let (engine, _) = engine();
        let archive = Arc::new(MemoryArchive::new(100));
        engine.set_archive(archive.clone());
        archive
            .archive_data("site.x", &Sample::new("site.x", timestamp_from_secs(10), 1.0))
            .unwrap();
        let found = engine.preceding("site.x", timestamp_from_secs(50)).unwrap();
        assert_eq!(found.timestamp(), timestamp_from_secs(10));
        assert!(engine.following("site.x", timestamp_from_secs(50)).is_none());
    }

    struct Recorder(Mutex<Vec<AlarmEvent>>);

    impl AlarmEventListener for Recorder {
        fn on_alarm_event(&self, event: &AlarmEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_acknowledge_and_shelve() {
        let (engine, _) = engine();
        engine.load_definitions(r#"hot "Hot" "Hot" C site T - - - {Range-"0""50"} - 0 - - 2 "Open the door""#);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        engine.add_alarm_listener(recorder.clone());

        engine
            .fire("site.hot", Sample::new("site.hot", timestamp_from_secs(1_000), 80.0))
            .unwrap();
        assert_eq!(engine.alarms().get("site.hot").unwrap().status(), AlarmStatus::Alarming);

        engine.acknowledge("site.hot", true, "operator").unwrap();
        assert_eq!(
            engine.alarms().get("site.hot").unwrap().status(),
            AlarmStatus::Acknowledged
        );
        engine.shelve("site.hot", true, "operator").unwrap();
        assert!(engine.alarms().get("site.hot").unwrap().shelved);
        assert_eq!(recorder.0.lock().unwrap().len(), 3);
        assert!(engine.acknowledge("site.cold", true, "operator").is_err());
    }

    #[test]
    fn test_points_created_milestone() {
        let (engine, _) = engine();
        assert!(!engine.points_created());
        engine.mark_points_created();
        engine.mark_points_created();
        assert!(engine.points_created());
    }

    struct Negate;

    impl Stage for Negate {
        fn name(&self) -> &str {
            "Negate"
        }

        fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
            Ok(input.as_f64().map(|v| input.with_value(Some(Value::Float(-v)))))
        }
    }

    #[test]
    fn test_custom_stage_registration() {
        let (engine, _) = engine();
        engine.register_stage("Negate", |_| Ok(Box::new(Negate)));
        let report = engine.load_definitions(
            r#"neg "Negated" "Neg" - site T - - {Negate} - - 10000000 -"#,
        );
        assert!(report.is_clean(), "{:?}", report.errors);

        let out = engine
            .fire("site.neg", Sample::new("site.neg", timestamp_from_secs(1_000), 3.0))
            .unwrap()
            .unwrap();
        assert_eq!(out.as_f64(), Some(-3.0));
    }

    #[test]
    fn test_weak_engine_expires() {
        let (engine, _) = engine();
        let weak = engine.downgrade();
        assert!(weak.upgrade().is_some());
        drop(engine);
        assert!(weak.upgrade().is_none());
    }
}
