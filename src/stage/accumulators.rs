//! Running sums and peaks with an external or daily reset
//!
//! The resettable stages listen to a second point. A true value there
//! latches a reset which the next sample through the chain consumes, so a
//! reset between two samples is never lost.

use crate::config::points::replace_tok;
use crate::error::Result;
use crate::point::{PointDescriptor, PointListener};
use crate::stage::calendar::{parse_hhmm, parse_zone, ZoneSpec};
use crate::stage::slots::subscribe_deferred;
use crate::stage::{
    parse_flag, parse_secs, require_args, unexpected_input, Activation, Stage, StageContext,
    StageInit, StageRegistry,
};
use crate::types::{parse_as_bool, Period, Sample, Timestamp, Value};
use chrono::{NaiveDate, NaiveTime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) fn register(registry: &mut StageRegistry) {
    registry.register("ResettableIntegrator", |init| Resettable::create(init, ResetMode::Integrate));
    registry.register("ResettablePeakDetect", |init| Resettable::create(init, ResetMode::Peak));
    registry.register("ResettablePulse", ResettablePulse::create);
    registry.register("DailyIntegrator", |init| DailyIntegrator::create(init, false));
    registry.register("DailyIntegratorPosOnly", |init| DailyIntegrator::create(init, true));
}

/// Latched by a true value on the reset point
#[derive(Debug, Clone, Default)]
pub struct ResetFlag(Arc<AtomicBool>);

impl ResetFlag {
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Read and clear
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Subscribe to `point`, latching on every true value it publishes
    fn listen(&self, act: &Activation<'_>, point: &str) {
        let flag = self.clone();
        let owner = act.point.full_name().to_string();
        subscribe_deferred(act, vec![point.to_string()], move |_| {
            let flag = flag.clone();
            let owner = owner.clone();
            let listener: Arc<dyn PointListener> = Arc::new(move |p: &PointDescriptor, s: &Sample| -> Result<()> {
                match s.value().map(parse_as_bool) {
                    Some(Some(true)) => flag.set(),
                    Some(None) => tracing::warn!(
                        "({}) Reset point {} must publish boolean or numeric values",
                        owner,
                        p.full_name()
                    ),
                    _ => {}
                }
                Ok(())
            });
            listener
        });
    }
}

// ==================== ResettableIntegrator / PeakDetect ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetMode {
    Integrate,
    Peak,
}

/// Sum (or peak) of numeric input since the last reset. The sample that
/// consumes a reset starts the new run.
#[derive(Debug)]
pub struct Resettable {
    mode: ResetMode,
    reset_point: String,
    reset: ResetFlag,
    value: Option<f64>,
}

impl Resettable {
    fn create(init: &StageInit<'_>, mode: ResetMode) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 1, "a reset point")?;
        Ok(Box::new(Self {
            mode,
            reset_point: replace_tok(&init.args[0], &init.point.source),
            reset: ResetFlag::default(),
            value: None,
        }))
    }
}

impl Stage for Resettable {
    fn name(&self) -> &str {
        match self.mode {
            ResetMode::Integrate => "ResettableIntegrator",
            ResetMode::Peak => "ResettablePeakDetect",
        }
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        if self.reset.take() {
            self.value = None;
        }
        match input.value() {
            None => {}
            Some(v) if v.is_number() => {
                let x = v.as_f64().unwrap_or_default();
                self.value = Some(match (self.mode, self.value) {
                    (_, None) => x,
                    (ResetMode::Integrate, Some(sum)) => sum + x,
                    (ResetMode::Peak, Some(peak)) => peak.max(x),
                });
            }
            Some(_) => return Err(unexpected_input(self.name(), &input, "numeric")),
        }
        let out = match self.mode {
            ResetMode::Integrate => Some(self.value.unwrap_or(0.0)),
            ResetMode::Peak => self.value,
        };
        Ok(Some(input.with_value(out.map(Value::Float))))
    }

    fn activate(&mut self, act: &Activation<'_>) -> Result<()> {
        self.reset.listen(act, &self.reset_point);
        Ok(())
    }

    fn dependencies(&self) -> Vec<String> {
        vec![self.reset_point.clone()]
    }
}

// ==================== ResettablePulse ====================

/// True for `period` seconds after a high input, unless the reset point
/// cancels the pulse. The cancel holds until the pulse has ended.
#[derive(Debug)]
pub struct ResettablePulse {
    period: Period,
    reset_point: String,
    cancelled: ResetFlag,
    last_trigger: Option<Timestamp>,
}

impl ResettablePulse {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 2, "a pulse period and a reset point")?;
        Ok(Box::new(Self {
            period: parse_secs(init.class, init.args, 0, "pulse period")?,
            reset_point: replace_tok(&init.args[1], &init.point.source),
            cancelled: ResetFlag::default(),
            last_trigger: None,
        }))
    }
}

impl Stage for ResettablePulse {
    fn name(&self) -> &str {
        "ResettablePulse"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let Some(value) = input.value() else {
            return Ok(None);
        };
        let Some(high) = parse_as_bool(value) else {
            return Err(unexpected_input("ResettablePulse", &input, "boolean or numeric"));
        };
        let now = input.timestamp();
        if high {
            self.last_trigger = Some(now);
        }
        let active = self.last_trigger.is_some_and(|t| t + self.period >= now);

        let out = if active {
            !self.cancelled.is_set()
        } else {
            self.cancelled.clear();
            false
        };
        Ok(Some(input.with_value(Some(Value::Bool(out)))))
    }

    fn activate(&mut self, act: &Activation<'_>) -> Result<()> {
        self.cancelled.listen(act, &self.reset_point);
        Ok(())
    }

    fn dependencies(&self) -> Vec<String> {
        vec![self.reset_point.clone()]
    }
}

// ==================== DailyIntegrator ====================

/// Sum of numeric input that restarts at a time of day.
///
/// Args: `HH:MM`, time zone, and optionally `true` to resume the day's
/// running sum from the buffer or archive at start-up.
#[derive(Debug)]
pub struct DailyIntegrator {
    positive_only: bool,
    at: NaiveTime,
    zone: ZoneSpec,
    reload: bool,
    last_reset: Option<NaiveDate>,
    sum: f64,
}

impl DailyIntegrator {
    fn create(init: &StageInit<'_>, positive_only: bool) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 2, "HH:MM and a time zone")?;
        Ok(Box::new(Self {
            positive_only,
            at: parse_hhmm(init.class, &init.args[0])?,
            zone: parse_zone(init.class, &init.args[1])?,
            reload: init.args.get(2).is_some_and(|a| parse_flag(a)),
            last_reset: None,
            sum: 0.0,
        }))
    }

    /// Most recent reset instant at or before `now`, with its wall date
    fn last_reset_before(&self, now: Timestamp) -> Option<(Timestamp, NaiveDate)> {
        let wall = self.zone.wall(now);
        let mut date = wall.date();
        if wall.time() < self.at {
            date = date.checked_sub_signed(Period::days(1))?;
        }
        let instant = self.zone.instant(date.and_time(self.at))?;
        Some((instant, date))
    }

    fn add(&mut self, now: Timestamp, x: f64) {
        let x = if self.positive_only && !(x > 0.0) { 0.0 } else { x };
        let wall = self.zone.wall(now);
        if self.last_reset != Some(wall.date()) && wall.time() >= self.at {
            self.last_reset = Some(wall.date());
            self.sum = x;
        } else {
            self.sum += x;
        }
    }
}

impl Stage for DailyIntegrator {
    fn name(&self) -> &str {
        if self.positive_only {
            "DailyIntegratorPosOnly"
        } else {
            "DailyIntegrator"
        }
    }

    fn translate(&mut self, input: Sample, ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let x = match input.value() {
            None => 0.0,
            Some(v) if v.is_number() => v.as_f64().unwrap_or_default(),
            Some(other) => {
                tracing::warn!("({}) {}: requires numeric input, got {}", input.name(), self.name(), other.kind());
                0.0
            }
        };
        self.add(ctx.now, x);
        Ok(Some(input.with_value(Some(Value::Float(self.sum)))))
    }

    fn activate(&mut self, act: &Activation<'_>) -> Result<()> {
        if !self.reload {
            return Ok(());
        }
        let now = act.engine.now();
        let Some(previous) = act.preceding.as_ref() else {
            return Ok(());
        };
        let Some(value) = previous.value().filter(|v| v.is_number()).and_then(Value::as_f64) else {
            return Ok(());
        };
        if let Some((reset_at, date)) = self.last_reset_before(now) {
            if reset_at <= previous.timestamp() {
                tracing::info!("({}) Resuming daily sum at {}", act.point.full_name(), value);
                self.sum = value;
                self.last_reset = Some(date);
            }
        }
        Ok(())
    }

    fn needs_preceding(&self) -> bool {
        self.reload
    }
}
