//! Trailing time-window aggregates
//!
//! Every aggregate keeps `(timestamp, value)` pairs for the last `W`
//! seconds of data time. Non-numeric input is logged and only expires
//! old entries; an empty window ends the chain.

use crate::error::{EngineError, Result};
use crate::stage::{parse_opt, parse_secs, Stage, StageContext, StageInit, StageRegistry};
use crate::types::{Period, Sample, Timestamp, Value};
use std::collections::VecDeque;

/// Default window when none is given
const DEFAULT_WINDOW_SECS: i64 = 60;

pub(crate) fn register(registry: &mut StageRegistry) {
    registry.register("Mean", |init| WindowStage::create(init, Aggregate::Mean));
    registry.register("Minimum", |init| WindowStage::create(init, Aggregate::Minimum));
    registry.register("Maximum", |init| WindowStage::create(init, Aggregate::Maximum));
    registry.register("PeakDetect", |init| WindowStage::create(init, Aggregate::Maximum));
    registry.register("Variance", |init| WindowStage::create(init, Aggregate::StdDev));
}

/// What to compute over the window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Mean,
    Minimum,
    Maximum,
    /// Population standard deviation; needs two samples
    StdDev,
}

/// Trailing window of numeric samples
#[derive(Debug, Clone)]
pub struct TimeWindow {
    span: Period,
    entries: VecDeque<(Timestamp, f64)>,
}

impl TimeWindow {
    pub fn new(span: Period) -> Self {
        Self {
            span,
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, ts: Timestamp, value: f64) {
        self.entries.push_back((ts, value));
    }

    /// Drop entries older than `latest - span`
    pub fn expire(&mut self, latest: Timestamp) {
        let cutoff = latest - self.span;
        while self.entries.front().is_some_and(|(t, _)| *t < cutoff) {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.entries.iter().map(|(_, v)| *v)
    }

    /// `None` for an empty window (or fewer than two samples for `StdDev`)
    pub fn compute(&self, aggregate: Aggregate) -> Option<f64> {
        if self.entries.is_empty() {
            return None;
        }
        let n = self.entries.len() as f64;
        match aggregate {
            Aggregate::Mean => Some(self.values().sum::<f64>() / n),
            Aggregate::Minimum => self.values().reduce(f64::min),
            Aggregate::Maximum => self.values().reduce(f64::max),
            Aggregate::StdDev => {
                if self.entries.len() < 2 {
                    return None;
                }
                let mean = self.values().sum::<f64>() / n;
                let var = self.values().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                Some(var.sqrt())
            }
        }
    }
}

/// A stage wrapping one [`TimeWindow`] and aggregate
#[derive(Debug)]
pub struct WindowStage {
    aggregate: Aggregate,
    window: TimeWindow,
    min_samples: usize,
}

impl WindowStage {
    pub fn new(aggregate: Aggregate, span: Period, min_samples: usize) -> Self {
        Self {
            aggregate,
            window: TimeWindow::new(span),
            min_samples,
        }
    }

    fn create(init: &StageInit<'_>, aggregate: Aggregate) -> Result<Box<dyn Stage>> {
        let span = if init.args.is_empty() {
            Period::seconds(DEFAULT_WINDOW_SECS)
        } else {
            parse_secs(init.class, init.args, 0, "window length")?
        };
        if span <= Period::zero() {
            return Err(EngineError::stage_args(init.class, "window length must be positive"));
        }
        let min_samples = parse_opt(init.class, init.args, 1, "minimum samples")?.unwrap_or(1);
        Ok(Box::new(Self::new(aggregate, span, min_samples)))
    }
}

impl Stage for WindowStage {
    fn name(&self) -> &str {
        match self.aggregate {
            Aggregate::Mean => "Mean",
            Aggregate::Minimum => "Minimum",
            Aggregate::Maximum => "Maximum",
            Aggregate::StdDev => "Variance",
        }
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let ts = input.timestamp();
        match input.value() {
            Some(v @ (Value::Int(_) | Value::Float(_) | Value::Angle(_))) => {
                if let Some(x) = v.as_f64() {
                    self.window.push(ts, x);
                }
            }
            Some(other) => tracing::warn!(
                "({}) {}: cannot use {} data",
                input.name(),
                self.name(),
                other.kind()
            ),
            None => {}
        }
        self.window.expire(ts);

        if self.window.is_empty() || self.window.len() < self.min_samples {
            return Ok(None);
        }
        let out = self.window.compute(self.aggregate).map(Value::Float);
        Ok(Some(input.with_value(out)))
    }
}
