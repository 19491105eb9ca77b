//! Stages that remember earlier input

use crate::error::{EngineError, Result};
use crate::stage::{parse_arg, parse_secs, unexpected_input, Stage, StageContext, StageInit, StageRegistry};
use crate::types::{parse_as_bool, period_as_secs_f64, Period, Sample, Timestamp, Value};
use std::collections::VecDeque;
use std::f64::consts::PI;

pub(crate) fn register(registry: &mut StageRegistry) {
    registry.register("Delta", |_| Ok(Box::new(Delta::default())));
    registry.register("StopIfNoChange", |_| Ok(Box::new(StopIfNoChange::default())));
    registry.register("StuckValue", StuckValue::create);
    registry.register("HighTimer", |_| Ok(Box::new(StateTimer::new(true))));
    registry.register("LowTimer", |_| Ok(Box::new(StateTimer::new(false))));
    registry.register("SinceHighTimer", |_| Ok(Box::new(SinceHighTimer::default())));
    registry.register("DetectChange", |_| Ok(Box::new(DetectChange::default())));
    registry.register("Pulse", Pulse::create);
    registry.register("RetriggerablePulse", RetriggerablePulse::create);
}

/// Bool or number as a level; strings and other kinds are rejected
fn level(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Int(_) | Value::Float(_) => value.as_f64().map(|v| v as i64 != 0),
        _ => None,
    }
}

// ==================== Delta ====================

/// Previous value minus the current one; angles wrap into (-pi, pi].
///
/// The first sample after a start or a null has nothing to compare with
/// and produces a null.
#[derive(Debug, Default)]
pub struct Delta {
    previous: Option<f64>,
}

impl Stage for Delta {
    fn name(&self) -> &str {
        "Delta"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let (current, angle) = match input.value() {
            None => {
                self.previous = None;
                return Ok(Some(input));
            }
            Some(Value::Angle(a)) => (*a, true),
            Some(v) if v.is_number() => (v.as_f64().unwrap_or_default(), false),
            Some(_) => {
                self.previous = None;
                return Err(unexpected_input("Delta", &input, "numeric"));
            }
        };

        let out = self.previous.map(|prev| {
            let delta = prev - current;
            if angle {
                let mut wrapped = delta % (2.0 * PI);
                if wrapped > PI {
                    wrapped -= 2.0 * PI;
                } else if wrapped <= -PI {
                    wrapped += 2.0 * PI;
                }
                Value::Angle(wrapped)
            } else {
                Value::Float(delta)
            }
        });
        self.previous = Some(current);
        Ok(Some(input.with_value(out)))
    }
}

// ==================== StopIfNoChange ====================

/// Ends the chain while the value repeats; numbers compare by value
/// regardless of integer or float type
#[derive(Debug, Default)]
pub struct StopIfNoChange {
    last: Option<Value>,
}

fn same_value(a: &Value, b: &Value) -> bool {
    if a.is_number() && b.is_number() {
        a.as_f64() == b.as_f64()
    } else {
        a == b
    }
}

impl Stage for StopIfNoChange {
    fn name(&self) -> &str {
        "StopIfNoChange"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let changed = match (input.value(), self.last.as_ref()) {
            (None, None) => false,
            (Some(new), Some(old)) => !same_value(new, old),
            _ => true,
        };
        self.last = input.value().cloned();
        Ok(changed.then_some(input))
    }
}

/// True when the value differs from the previous one. A null on either
/// side counts as no change.
#[derive(Debug, Default)]
pub struct DetectChange {
    last: Option<Value>,
}

impl Stage for DetectChange {
    fn name(&self) -> &str {
        "DetectChange"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let changed = match (input.value(), self.last.as_ref()) {
            (Some(new), Some(old)) => !same_value(new, old),
            _ => false,
        };
        self.last = input.value().cloned();
        Ok(Some(input.with_value(Some(Value::Bool(changed)))))
    }
}

// ==================== StuckValue ====================

/// Flags a point whose last `n` updates were all null, or all the same
/// kind and value, by publishing an alarming null
#[derive(Debug)]
pub struct StuckValue {
    history: VecDeque<Option<Value>>,
}

impl StuckValue {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        let n: usize = parse_arg(init.class, init.args, 0, "update count")?;
        if n == 0 {
            return Err(EngineError::stage_args(init.class, "update count must be positive"));
        }
        Ok(Box::new(Self {
            history: std::iter::repeat(None).take(n).collect(),
        }))
    }

    fn is_stuck(&self) -> bool {
        let mut values = self.history.iter();
        let Some(first) = values.next() else {
            return false;
        };
        match first {
            None => values.all(Option::is_none),
            Some(first) if first.is_number() || matches!(first, Value::Str(_)) => values.all(|v| {
                v.as_ref()
                    .is_some_and(|v| v.same_kind(first) && same_value(v, first))
            }),
            Some(first) => {
                tracing::debug!("StuckValue: unsupported value kind {}", first.kind());
                false
            }
        }
    }
}

impl Stage for StuckValue {
    fn name(&self) -> &str {
        "StuckValue"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        self.history.pop_front();
        self.history.push_back(input.value().cloned());
        if self.is_stuck() {
            Ok(Some(input.with_value(None).with_alarm(true)))
        } else {
            Ok(Some(input))
        }
    }
}

// ==================== HighTimer / LowTimer ====================

/// Seconds the input has continuously been high (or low)
#[derive(Debug)]
pub struct StateTimer {
    high: bool,
    since: Option<Timestamp>,
}

impl StateTimer {
    pub fn new(high: bool) -> Self {
        Self { high, since: None }
    }
}

impl Stage for StateTimer {
    fn name(&self) -> &str {
        if self.high {
            "HighTimer"
        } else {
            "LowTimer"
        }
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let Some(state) = input.value().and_then(level) else {
            return Err(unexpected_input(self.name(), &input, "boolean or numeric"));
        };
        let now = input.timestamp();
        let elapsed = if state != self.high {
            self.since = None;
            0.0
        } else {
            let since = *self.since.get_or_insert(now);
            period_as_secs_f64(now - since)
        };
        Ok(Some(input.with_value(Some(Value::Float(elapsed)))))
    }
}

/// Seconds since the input was last high; nothing until the first high
#[derive(Debug, Default)]
pub struct SinceHighTimer {
    last_high: Option<Timestamp>,
}

impl Stage for SinceHighTimer {
    fn name(&self) -> &str {
        "SinceHighTimer"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let Some(high) = input.value().and_then(parse_as_bool) else {
            return Err(unexpected_input("SinceHighTimer", &input, "boolean or numeric"));
        };
        let now = input.timestamp();
        if high {
            self.last_high = Some(now);
        }
        Ok(self
            .last_high
            .map(|since| input.with_value(Some(Value::Float(period_as_secs_f64(now - since))))))
    }
}

// ==================== Pulses ====================

/// On a high input, output true for `mark` seconds then false for `space`
/// seconds, ignoring input until the cycle completes
#[derive(Debug)]
pub struct Pulse {
    mark: Period,
    space: Period,
    last_pulse: Option<Timestamp>,
}

impl Pulse {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        Ok(Box::new(Self {
            mark: parse_secs(init.class, init.args, 0, "mark period")?,
            space: parse_secs(init.class, init.args, 1, "space period")?,
            last_pulse: None,
        }))
    }
}

impl Stage for Pulse {
    fn name(&self) -> &str {
        "Pulse"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let now = input.timestamp();
        if let Some(last) = self.last_pulse.filter(|l| *l + self.mark + self.space > now) {
            let high = last + self.mark > now;
            return Ok(Some(input.with_value(Some(Value::Bool(high)))));
        }

        let Some(value) = input.value() else {
            return Ok(Some(input));
        };
        let Some(high) = level(value) else {
            return Err(unexpected_input("Pulse", &input, "boolean or numeric"));
        };
        if high {
            self.last_pulse = Some(now);
        }
        Ok(Some(input.with_value(Some(Value::Bool(high)))))
    }
}

/// True for `period` seconds after the most recent high input
#[derive(Debug)]
pub struct RetriggerablePulse {
    period: Period,
    last_trigger: Option<Timestamp>,
}

impl RetriggerablePulse {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        Ok(Box::new(Self {
            period: parse_secs(init.class, init.args, 0, "pulse period")?,
            last_trigger: None,
        }))
    }
}

impl Stage for RetriggerablePulse {
    fn name(&self) -> &str {
        "RetriggerablePulse"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let now = input.timestamp();
        if input.value().and_then(parse_as_bool) == Some(true) {
            self.last_trigger = Some(now);
        }
        let active = self.last_trigger.is_some_and(|t| t + self.period > now);
        Ok(Some(input.with_value(Some(Value::Bool(active)))))
    }
}

#[cfg(test)]
mod tests {
    use crate::stage::test_support::Harness;
    use crate::types::Value;

    #[test]
    fn test_delta() {
        let h = Harness::new();
        let mut stage = h.build("Delta", &[]).unwrap();
        let first = h.run(stage.as_mut(), 0, Some(Value::Float(10.0))).unwrap();
        assert!(!first.is_valid());
        assert_eq!(h.run_f64(stage.as_mut(), 1, 7.0), Some(3.0));
        assert_eq!(h.run_f64(stage.as_mut(), 2, Value::Int(9)), Some(-2.0));

        // Null resets
        h.run(stage.as_mut(), 3, None);
        assert!(!h.run(stage.as_mut(), 4, Some(Value::Float(1.0))).unwrap().is_valid());
    }

    #[test]
    fn test_delta_wraps_angles() {
        let h = Harness::new();
        let mut stage = h.build("Delta", &[]).unwrap();
        h.run(stage.as_mut(), 0, Some(Value::Angle(0.1)));
        let out = h.run(stage.as_mut(), 1, Some(Value::Angle(6.2))).unwrap();
        match out.value() {
            Some(Value::Angle(a)) => assert!((a - (0.1 - 6.2 + 2.0 * std::f64::consts::PI)).abs() < 1e-9),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stop_if_no_change() {
        let h = Harness::new();
        let mut stage = h.build("StopIfNoChange", &[]).unwrap();
        assert!(h.run(stage.as_mut(), 0, None).is_none());
        assert!(h.run(stage.as_mut(), 1, Some(Value::Int(1))).is_some());
        assert!(h.run(stage.as_mut(), 2, Some(Value::Float(1.0))).is_none());
        assert!(h.run(stage.as_mut(), 3, Some(Value::Int(2))).is_some());
        assert!(h.run(stage.as_mut(), 4, None).is_some());
    }

    #[test]
    fn test_stuck_value() {
        let h = Harness::new();
        let mut stage = h.build("StuckValue", &["3"]).unwrap();
        for t in 0..2 {
            let out = h.run(stage.as_mut(), t, Some(Value::Float(5.0))).unwrap();
            assert!(out.is_valid() && !out.alarm());
        }
        let stuck = h.run(stage.as_mut(), 2, Some(Value::Float(5.0))).unwrap();
        assert!(!stuck.is_valid());
        assert!(stuck.alarm());

        let moving = h.run(stage.as_mut(), 3, Some(Value::Float(6.0))).unwrap();
        assert!(moving.is_valid() && !moving.alarm());
        assert!(h.build("StuckValue", &["0"]).is_err());
    }

    #[test]
    fn test_high_and_low_timers() {
        let h = Harness::new();
        let mut high = h.build("HighTimer", &[]).unwrap();
        assert_eq!(h.run_f64(high.as_mut(), 10, true), Some(0.0));
        assert_eq!(h.run_f64(high.as_mut(), 15, Value::Int(1)), Some(5.0));
        assert_eq!(h.run_f64(high.as_mut(), 16, false), Some(0.0));
        assert_eq!(h.run_f64(high.as_mut(), 20, true), Some(0.0));

        let mut low = h.build("LowTimer", &[]).unwrap();
        assert_eq!(h.run_f64(low.as_mut(), 10, false), Some(0.0));
        assert_eq!(h.run_f64(low.as_mut(), 13, false), Some(3.0));
    }

    #[test]
    fn test_since_high_timer() {
        let h = Harness::new();
        let mut stage = h.build("SinceHighTimer", &[]).unwrap();
        assert!(h.run(stage.as_mut(), 0, Some(Value::Bool(false))).is_none());
        assert_eq!(h.run_f64(stage.as_mut(), 5, true), Some(0.0));
        assert_eq!(h.run_f64(stage.as_mut(), 8, false), Some(3.0));
        assert_eq!(h.run_f64(stage.as_mut(), 12, Value::Int(0)), Some(7.0));
        // A new high restarts the count
        assert_eq!(h.run_f64(stage.as_mut(), 13, Value::Int(1)), Some(0.0));
        assert_eq!(h.run_f64(stage.as_mut(), 14, false), Some(1.0));
    }

    #[test]
    fn test_detect_change() {
        let h = Harness::new();
        let mut stage = h.build("DetectChange", &[]).unwrap();
        let changed = |stage: &mut Box<dyn crate::stage::Stage>, t: i64, v: Option<Value>| {
            h.run(stage.as_mut(), t, v).and_then(|s| s.into_value())
        };
        assert_eq!(changed(&mut stage, 0, Some(Value::Int(1))), Some(Value::Bool(false)));
        assert_eq!(changed(&mut stage, 1, Some(Value::Float(1.0))), Some(Value::Bool(false)));
        assert_eq!(changed(&mut stage, 2, Some(Value::Int(2))), Some(Value::Bool(true)));
        assert_eq!(changed(&mut stage, 3, None), Some(Value::Bool(false)));
        assert_eq!(changed(&mut stage, 4, Some(Value::Int(5))), Some(Value::Bool(false)));
        assert_eq!(changed(&mut stage, 5, Some(Value::from("on"))), Some(Value::Bool(true)));
    }

    #[test]
    fn test_pulse_mark_space() {
        let h = Harness::new();
        let mut stage = h.build("Pulse", &["2", "3"]).unwrap();
        let bool_at = |stage: &mut Box<dyn crate::stage::Stage>, t: i64, v: bool| {
            h.run(stage.as_mut(), t, Some(Value::Bool(v)))
                .and_then(|s| s.into_value())
        };
        assert_eq!(bool_at(&mut stage, 0, true), Some(Value::Bool(true)));
        assert_eq!(bool_at(&mut stage, 1, false), Some(Value::Bool(true)));
        // Space: input ignored
        assert_eq!(bool_at(&mut stage, 3, true), Some(Value::Bool(false)));
        // Cycle over, a new trigger starts another mark
        assert_eq!(bool_at(&mut stage, 5, true), Some(Value::Bool(true)));
    }

    #[test]
    fn test_retriggerable_pulse() {
        let h = Harness::new();
        let mut stage = h.build("RetriggerablePulse", &["10"]).unwrap();
        let active = |stage: &mut Box<dyn crate::stage::Stage>, t: i64, v: bool| {
            h.run(stage.as_mut(), t, Some(Value::Bool(v)))
                .and_then(|s| s.into_value())
                == Some(Value::Bool(true))
        };
        assert!(!active(&mut stage, 0, false));
        assert!(active(&mut stage, 1, true));
        assert!(active(&mut stage, 10, false));
        assert!(!active(&mut stage, 11, false));
        // Retrigger extends
        assert!(active(&mut stage, 12, true));
        assert!(active(&mut stage, 21, false));
    }
}
