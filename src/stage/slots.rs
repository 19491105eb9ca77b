//! Named input slots for stages fed by other points
//!
//! A stage that combines several points keeps one slot per target name.
//! Target points are often defined later than the stage that listens to
//! them, so subscription is deferred: a timer task retries the lookup
//! every resolution interval and attaches a [`SlotListener`] to each
//! target once it exists. When an update makes the slots ready, the
//! stage's [`SlotReaction`] computes a value which is pushed into the
//! owning point's own chain as a raw sample.

use crate::config::points::replace_tok;
use crate::engine::{Engine, WeakEngine};
use crate::error::Result;
use crate::point::{PointDescriptor, PointListener};
use crate::stage::Activation;
use crate::timer::TaskControl;
use crate::types::{Sample, Timestamp, Value};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Latest sample per named input
#[derive(Debug, Clone, Default)]
pub struct InputSlots {
    names: Vec<String>,
    values: Vec<Option<Sample>>,
}

impl InputSlots {
    pub fn new(names: Vec<String>) -> Self {
        let values = vec![None; names.len()];
        Self { names, values }
    }

    /// Slots named by stage arguments, with `$1` standing for the owning
    /// point's source
    pub fn from_args(args: &[String], source: &str) -> Self {
        Self::new(args.iter().map(|a| replace_tok(a, source)).collect())
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn set(&mut self, index: usize, sample: Sample) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = Some(sample);
        }
    }

    pub fn get(&self, index: usize) -> Option<&Sample> {
        self.values.get(index).and_then(Option::as_ref)
    }

    /// Every slot holds a sample with a value
    pub fn all_valid(&self) -> bool {
        self.values.iter().all(|v| v.as_ref().is_some_and(Sample::is_valid))
    }

    /// Numeric view of every slot, booleans as 1 or 0. `None` unless all
    /// slots are numeric.
    pub fn numbers(&self) -> Option<Vec<f64>> {
        self.values
            .iter()
            .map(|v| match v.as_ref()?.value()? {
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                other => other.as_f64(),
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.values.iter_mut().for_each(|v| *v = None);
    }

    /// Some slot is empty, null or alarming
    pub fn any_unavailable(&self) -> bool {
        self.values
            .iter()
            .any(|v| v.as_ref().map_or(true, |s| !s.is_valid() || s.alarm()))
    }
}

/// Slots shared between a stage and the listeners that fill them
pub type SharedSlots = Arc<Mutex<InputSlots>>;

pub fn shared(slots: InputSlots) -> SharedSlots {
    Arc::new(Mutex::new(slots))
}

pub(crate) fn lock_slots(slots: &SharedSlots) -> MutexGuard<'_, InputSlots> {
    slots.lock().unwrap_or_else(|e| e.into_inner())
}

/// Result of reacting to a slot update
#[derive(Debug, Clone, PartialEq)]
pub enum SlotOutcome {
    /// Not ready yet
    Wait,
    /// Push this value (or a null) into the owning point
    Publish(Option<Value>),
    /// As `Publish`, stamped with the inputs' own instant
    PublishAt(Timestamp, Option<Value>),
}

/// Computes a stage's output from its slots after an update
pub trait SlotReaction: Send + Sync {
    fn react(&self, engine: &Engine, slots: &mut InputSlots) -> SlotOutcome;
}

impl<F> SlotReaction for F
where
    F: Fn(&Engine, &mut InputSlots) -> SlotOutcome + Send + Sync,
{
    fn react(&self, engine: &Engine, slots: &mut InputSlots) -> SlotOutcome {
        self(engine, slots)
    }
}

/// Push a computed value into a point as a raw sample stamped `now`
pub(crate) fn publish(engine: &Engine, parent: &Arc<PointDescriptor>, value: Option<Value>) {
    publish_at(engine, parent, engine.now(), value);
}

pub(crate) fn publish_at(
    engine: &Engine,
    parent: &Arc<PointDescriptor>,
    timestamp: Timestamp,
    value: Option<Value>,
) {
    let sample = Sample::from_option(parent.full_name(), timestamp, value);
    if let Err(e) = parent.fire(engine, sample, true) {
        tracing::debug!("({}) Recomputed value not published: {}", parent.full_name(), e);
    }
}

/// Fills one slot from a target point's bus
pub struct SlotListener {
    index: usize,
    slots: SharedSlots,
    /// Passive bindings only record the update
    reaction: Option<Arc<dyn SlotReaction>>,
    parent: Weak<PointDescriptor>,
    engine: WeakEngine,
}

impl SlotListener {
    pub fn new(
        index: usize,
        slots: SharedSlots,
        reaction: Option<Arc<dyn SlotReaction>>,
        parent: Weak<PointDescriptor>,
        engine: WeakEngine,
    ) -> Self {
        Self {
            index,
            slots,
            reaction,
            parent,
            engine,
        }
    }
}

impl PointListener for SlotListener {
    fn on_sample(&self, _point: &PointDescriptor, sample: &Sample) -> Result<()> {
        let (Some(engine), Some(parent)) = (self.engine.upgrade(), self.parent.upgrade()) else {
            return Ok(());
        };

        let outcome = {
            let mut slots = lock_slots(&self.slots);
            slots.set(self.index, sample.clone());
            match &self.reaction {
                Some(reaction) if sample.is_valid() => reaction.react(&engine, &mut slots),
                _ => SlotOutcome::Wait,
            }
        };

        match outcome {
            SlotOutcome::Wait => {}
            SlotOutcome::Publish(value) => publish(&engine, &parent, value),
            SlotOutcome::PublishAt(t, value) => publish_at(&engine, &parent, t, value),
        }
        Ok(())
    }
}

/// Subscribe to `targets` as they come into existence.
///
/// `make` builds the listener for the target at a given index. The retry
/// task stops once every target is subscribed, or with one warning once
/// all points have been created and some target is still missing.
pub fn subscribe_deferred<F>(act: &Activation<'_>, targets: Vec<String>, make: F)
where
    F: Fn(usize) -> Arc<dyn PointListener> + Send + 'static,
{
    if targets.is_empty() {
        return;
    }
    let owner = act.point.full_name().to_string();
    let weak = act.engine.downgrade();
    let mut pending: Vec<(usize, String)> = targets.into_iter().enumerate().collect();

    act.engine.schedule_task(
        format!("{} subscribe", owner),
        act.engine.now(),
        act.engine.config().scheduler.resolution_interval(),
        move |_now| {
            let Some(engine) = weak.upgrade() else {
                return TaskControl::Stop;
            };
            pending.retain(|(index, name)| match engine.point(name) {
                Some(target) => {
                    target.add_listener(make(*index));
                    tracing::debug!("({}) Subscribed to {}", owner, name);
                    false
                }
                None => true,
            });

            if pending.is_empty() {
                return TaskControl::Stop;
            }
            if engine.points_created() {
                let missing: Vec<&str> = pending.iter().map(|(_, n)| n.as_str()).collect();
                tracing::warn!("({}) Listened-to point(s) do not exist: {}", owner, missing.join(", "));
                return TaskControl::Stop;
            }
            TaskControl::Continue
        },
    );
}

/// Subscribe a slot listener per slot name
pub fn bind_slots(act: &Activation<'_>, slots: &SharedSlots, reaction: Option<Arc<dyn SlotReaction>>) {
    let names = lock_slots(slots).names().to_vec();
    let slots = slots.clone();
    let parent = Arc::downgrade(act.point);
    let engine = act.engine.downgrade();
    subscribe_deferred(act, names, move |index| {
        Arc::new(SlotListener::new(
            index,
            slots.clone(),
            reaction.clone(),
            parent.clone(),
            engine.clone(),
        ))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::point::PointInfo;
    use crate::timer::{Clock, ManualClock};
    use crate::types::{timestamp_from_secs, Period};

    fn sample(v: impl Into<Value>) -> Sample {
        Sample::new("x.y", timestamp_from_secs(1), v)
    }

    #[test]
    fn test_slots_readiness() {
        let mut slots = InputSlots::from_args(&["$1.a".to_string(), "other.b".to_string()], "site");
        assert_eq!(slots.names(), &["site.a", "other.b"]);
        assert!(!slots.all_valid());
        assert!(slots.any_unavailable());

        slots.set(0, sample(1.5));
        slots.set(1, sample(true));
        assert!(slots.all_valid());
        assert_eq!(slots.numbers(), Some(vec![1.5, 1.0]));
        assert!(!slots.any_unavailable());

        slots.set(1, sample(2.0).with_alarm(true));
        assert!(slots.any_unavailable());

        slots.set(1, sample("text"));
        assert_eq!(slots.numbers(), None);

        slots.clear();
        assert!(slots.get(0).is_none());
        // Out of range is ignored
        slots.set(9, sample(1.0));
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn test_deferred_subscription_waits_for_target() {
        let clock = Arc::new(ManualClock::new(timestamp_from_secs(100)));
        let engine = Engine::with_clock(EngineConfig::default(), clock.clone());
        let owner = Arc::new(PointDescriptor::new(PointInfo::new("site", "sum"), Vec::new()));
        engine.registry().register(owner.clone()).unwrap();

        let slots = shared(InputSlots::new(vec!["site.a".to_string()]));
        let act = Activation {
            engine: &engine,
            point: &owner,
            preceding: None,
        };
        bind_slots(&act, &slots, None);
        assert_eq!(engine.timers().len(), 1);

        engine.timers().run_due(clock.now());
        assert_eq!(engine.timers().len(), 1);

        let target = Arc::new(PointDescriptor::new(PointInfo::new("site", "a"), Vec::new()));
        engine.registry().register(target.clone()).unwrap();
        clock.advance(Period::milliseconds(500));
        engine.timers().run_due(clock.now());
        assert!(engine.timers().is_empty());
        assert_eq!(target.listeners().len(), 1);

        target
            .fire(&engine, Sample::new("site.a", timestamp_from_secs(100), 4.0), true)
            .unwrap();
        assert_eq!(lock_slots(&slots).get(0).and_then(Sample::as_f64), Some(4.0));
    }

    #[test]
    fn test_missing_target_gives_up_after_milestone() {
        let clock = Arc::new(ManualClock::new(timestamp_from_secs(0)));
        let engine = Engine::with_clock(EngineConfig::default(), clock.clone());
        let owner = Arc::new(PointDescriptor::new(PointInfo::new("site", "sum"), Vec::new()));
        let act = Activation {
            engine: &engine,
            point: &owner,
            preceding: None,
        };
        bind_slots(&act, &shared(InputSlots::new(vec!["site.nowhere".to_string()])), None);

        engine.mark_points_created();
        engine.timers().run_due(timestamp_from_secs(0));
        assert!(engine.timers().is_empty());
    }

    #[test]
    fn test_reaction_publishes_into_owner() {
        let clock = Arc::new(ManualClock::new(timestamp_from_secs(50)));
        let engine = Engine::with_clock(EngineConfig::default(), clock.clone());
        let owner = Arc::new(PointDescriptor::new(PointInfo::new("site", "double"), Vec::new()));
        let target = Arc::new(PointDescriptor::new(PointInfo::new("site", "a"), Vec::new()));
        engine.registry().register(owner.clone()).unwrap();
        engine.registry().register(target.clone()).unwrap();

        let slots = shared(InputSlots::new(vec!["site.a".to_string()]));
        let reaction: Arc<dyn SlotReaction> = Arc::new(|_: &Engine, slots: &mut InputSlots| {
            match slots.numbers() {
                Some(n) => SlotOutcome::Publish(Some(Value::Float(n[0] * 2.0))),
                None => SlotOutcome::Wait,
            }
        });
        let act = Activation {
            engine: &engine,
            point: &owner,
            preceding: None,
        };
        bind_slots(&act, &slots, Some(reaction));
        engine.timers().run_due(timestamp_from_secs(50));

        target
            .fire(&engine, Sample::new("site.a", timestamp_from_secs(50), 21.0), true)
            .unwrap();
        let latest = engine.latest("site.double").unwrap();
        assert_eq!(latest.as_f64(), Some(42.0));
        assert_eq!(latest.timestamp(), timestamp_from_secs(50));

        // Null updates are recorded without reacting
        target
            .fire(&engine, Sample::null("site.a", timestamp_from_secs(51)), false)
            .unwrap();
        assert_eq!(engine.buffer().len("site.double"), 1);
        assert!(!lock_slots(&slots).all_valid());
    }
}
