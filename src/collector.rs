//! Data collection
//!
//! Data sources deliver raw samples for the points they serve; the engine
//! pushes each one through its point's chain. Collection runs on three
//! cooperating pieces:
//!
//! - [`CollectionScheduler`] finds points whose next epoch is due and asks
//!   their input data source to collect them
//! - the source answers (now or later) by sending samples into a
//!   [`SampleSink`], a crossbeam channel owned by the engine
//! - the ingest loop ([`process_ingest`] or the thread from
//!   [`spawn_ingest`]) drains the channel and fires each sample
//!
//! [`TimerDriver`] ticks the shared timer facility and the scheduler on a
//! tokio interval in the daemon.

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::types::{Sample, Timestamp};
use crossbeam_channel::{RecvTimeoutError, Sender};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// How long the ingest thread waits before re-checking its running flag
const INGEST_POLL: Duration = Duration::from_millis(100);

/// A system that produces point data and may accept written values
#[cfg_attr(test, mockall::automock)]
pub trait DataSource: Send + Sync {
    /// Name used in point input and output transactions
    fn name(&self) -> String;

    fn is_connected(&self) -> bool;

    /// Request fresh data for the named points. Results go into `sink`,
    /// either before returning or later from another thread.
    fn collect(&self, points: &[String], sink: &SampleSink) -> Result<()>;

    /// Write a point's new value out to this system
    fn put_data(&self, point: &str, sample: &Sample) -> Result<()>;
}

/// Sending end of the engine's ingest channel
#[derive(Debug, Clone)]
pub struct SampleSink {
    tx: Sender<Sample>,
}

impl SampleSink {
    pub(crate) fn new(tx: Sender<Sample>) -> Self {
        Self { tx }
    }

    /// Hand a raw sample to the engine. The sample's name picks the point.
    pub fn send(&self, sample: Sample) -> Result<()> {
        self.tx
            .send(sample)
            .map_err(|e| EngineError::Source(format!("Ingest channel closed, dropped {}", e.0.name())))
    }
}

/// Picks due points and asks their sources for data
pub struct CollectionScheduler<'a> {
    engine: &'a Engine,
}

impl<'a> CollectionScheduler<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Start collection of every due point. Returns how many were requested.
    ///
    /// Points whose source is missing or disconnected get a null sample
    /// instead, so their last value is not mistaken for a current one.
    pub fn poll_due(&self, now: Timestamp) -> usize {
        let timeout = self.engine.config().scheduler.collect_timeout();
        let mut by_source: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for point in self.engine.points() {
            let Some(source) = point.input_source() else {
                continue;
            };
            if point.try_begin_collect(now, timeout) {
                by_source
                    .entry(source.to_string())
                    .or_default()
                    .push(point.full_name().to_string());
            }
        }

        let mut requested = 0;
        for (source_name, points) in by_source {
            match self.engine.source(&source_name) {
                Some(source) if source.is_connected() => {
                    tracing::trace!("Collecting {} point(s) from {}", points.len(), source_name);
                    match source.collect(&points, &self.engine.sink()) {
                        Ok(()) => requested += points.len(),
                        Err(e) => {
                            tracing::warn!("Collection from {} failed: {}", source_name, e);
                            self.fire_missing(&points, now);
                        }
                    }
                }
                Some(_) => {
                    tracing::debug!("Data source {} is not connected", source_name);
                    self.fire_missing(&points, now);
                }
                None => {
                    tracing::warn!("No data source named {}", source_name);
                    self.fire_missing(&points, now);
                }
            }
        }
        requested
    }

    fn fire_missing(&self, points: &[String], now: Timestamp) {
        for name in points {
            if let Err(e) = self.engine.fire_point(name, Sample::null(name.as_str(), now), false) {
                tracing::debug!("({}) Null update not published: {}", name, e);
            }
        }
    }
}

/// Fire one ingested sample into its point
fn ingest(engine: &Engine, sample: Sample) {
    let name = sample.name().to_string();
    if let Err(e) = engine.fire(&name, sample) {
        tracing::warn!("({}) Dropped collected data: {}", name, e);
    }
}

/// Fire everything waiting in the ingest channel on the calling thread
pub fn process_ingest(engine: &Engine) -> usize {
    let mut fired = 0;
    while let Ok(sample) = engine.ingest_receiver().try_recv() {
        ingest(engine, sample);
        fired += 1;
    }
    fired
}

/// Start a thread that fires ingested samples until `running` clears
pub fn spawn_ingest(engine: Engine, running: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("telemon-ingest".to_string())
        .spawn(move || {
            tracing::info!("Ingest worker started");
            let rx = engine.ingest_receiver().clone();
            while running.load(Ordering::SeqCst) {
                match rx.recv_timeout(INGEST_POLL) {
                    Ok(sample) => ingest(&engine, sample),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            tracing::info!("Ingest worker stopped");
        })
}

/// Drives timers and collection from an async runtime
pub struct TimerDriver {
    engine: Engine,
    running: Arc<AtomicBool>,
}

impl TimerDriver {
    pub fn new(engine: Engine, running: Arc<AtomicBool>) -> Self {
        Self { engine, running }
    }

    /// One pass: run due timer tasks, then start due collections
    pub fn tick(&self) -> (usize, usize) {
        let now = self.engine.now();
        let timers = self.engine.timers().run_due(now);
        let collected = self.engine.scheduler().poll_due(now);
        (timers, collected)
    }

    /// Tick at the configured resolution until the running flag clears
    pub async fn run_async(self) {
        let mut interval = tokio::time::interval(self.engine.config().scheduler.timer_resolution());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!("Timer driver started");
        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            self.tick();
        }
        tracing::info!("Timer driver stopped");
    }
}
