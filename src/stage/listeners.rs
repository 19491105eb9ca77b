//! Stages fed by other points
//!
//! Each stage here owns a set of [`InputSlots`] that are filled by
//! listeners on the target points. The stage's own `translate` normally
//! passes its input through unchanged: the interesting output is the
//! recomputed value that the slot reaction publishes into the owning
//! point.

use crate::config::points::replace_tok;
use crate::engine::{Engine, WeakEngine};
use crate::error::{EngineError, Result};
use crate::point::{PointDescriptor, PointListener};
use crate::scripting::CompiledExpression;
use crate::stage::slots::{
    bind_slots, lock_slots, publish, publish_at, shared, subscribe_deferred, InputSlots, SharedSlots,
    SlotOutcome, SlotReaction,
};
use crate::stage::{parse_arg, require_args, Activation, Stage, StageContext, StageInit, StageRegistry};
use crate::timer::TaskControl;
use crate::types::{Period, Sample, Value};
use std::sync::{Arc, Mutex, Weak};

pub(crate) fn register(registry: &mut StageRegistry) {
    registry.register("Listener", ListenerStage::create_listener);
    registry.register("Calculation", ListenerStage::create_calculation);
    registry.register("CalculationTimed", CalculationTimed::create);
    registry.register("XY2Mag", ListenerStage::create_xy2mag);
    registry.register("XY2Angle", ListenerStage::create_xy2angle);
    registry.register("Ratio", ListenerStage::create_ratio);
    registry.register("LinearCombo", ListenerStage::create_linear_combo);
    registry.register("AvailabilityMask", ListenerStage::create_mask);
    registry.register("DualListen", ListenerStage::create_dual_listen);
    registry.register("Synch", ListenerStage::create_synch);
    registry.register("Difference", ListenerStage::create_difference);
    registry.register("Preceding", Preceding::create);
    registry.register("Failover", Failover::create);
    registry.register("SourceSelector", SourceSelector::create);
    registry.register("TimedSubstitution", TimedSubstitution::create);
}

/// Read a leading point count followed by that many point names
fn counted_names(init: &StageInit<'_>) -> Result<(usize, InputSlots)> {
    require_args(init.class, init.args, 1, "a point count")?;
    let n: usize = parse_arg(init.class, init.args, 0, "point count")?;
    if n == 0 {
        return Err(EngineError::stage_args(init.class, "point count must be positive"));
    }
    require_args(init.class, init.args, n + 1, &format!("{} point name(s)", n))?;
    Ok((n, InputSlots::from_args(&init.args[1..=n], &init.point.source)))
}

/// Exactly two named points
fn pair(init: &StageInit<'_>) -> Result<InputSlots> {
    require_args(init.class, init.args, 2, "two point names")?;
    Ok(InputSlots::from_args(&init.args[..2], &init.point.source))
}

/// Evaluate an expression with slot values bound to `a`, `b`, `c`...
fn evaluate(engine: &Engine, expr: &CompiledExpression, slots: &InputSlots) -> Option<Value> {
    let Some(numbers) = slots.numbers() else {
        tracing::warn!("({}) Calculation inputs must be numeric", expr.name());
        return None;
    };
    let names: Vec<String> = (0..numbers.len()).map(var_name).collect();
    let vars: Vec<(&str, f64)> = names.iter().map(String::as_str).zip(numbers).collect();
    match engine.scripts().evaluate(expr, &vars) {
        Ok(v) => Some(Value::Float(v)),
        Err(e) => {
            tracing::warn!("({}) {}", expr.name(), e);
            None
        }
    }
}

fn var_name(index: usize) -> String {
    let mut name = String::new();
    let mut i = index;
    loop {
        name.insert(0, (b'a' + (i % 26) as u8) as char);
        if i < 26 {
            break;
        }
        i = i / 26 - 1;
    }
    name
}

/// `a - b`, kept integral when both are integers
fn difference(a: &Value, b: &Value) -> Option<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(Value::Int(x.wrapping_sub(*y))),
        _ if a.is_number() && b.is_number() => Some(Value::Float(a.as_f64()? - b.as_f64()?)),
        _ => None,
    }
}

/// A stage whose slots drive an optional recompute
pub struct ListenerStage {
    class: &'static str,
    slots: SharedSlots,
    reaction: Option<Arc<dyn SlotReaction>>,
    /// Drop the input while any slot is unavailable
    mask: bool,
}

impl ListenerStage {
    fn new(
        class: &'static str,
        slots: InputSlots,
        reaction: Option<Arc<dyn SlotReaction>>,
    ) -> Box<dyn Stage> {
        Box::new(Self {
            class,
            slots: shared(slots),
            reaction,
            mask: false,
        })
    }

    fn create_listener(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        let (_, slots) = counted_names(init)?;
        Ok(Self::new("Listener", slots, None))
    }

    fn create_mask(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        let (_, slots) = counted_names(init)?;
        Ok(Box::new(Self {
            class: "AvailabilityMask",
            slots: shared(slots),
            reaction: None,
            mask: true,
        }))
    }

    fn create_calculation(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        let (n, slots) = counted_names(init)?;
        require_args(init.class, init.args, n + 2, "point names and an expression")?;
        let expr = init
            .scripts
            .compile(&format!("{} Calculation", init.point.full_name), &init.args[n + 1])?;

        let reaction = move |engine: &Engine, slots: &mut InputSlots| {
            if !slots.all_valid() {
                return SlotOutcome::Wait;
            }
            let out = evaluate(engine, &expr, slots);
            slots.clear();
            SlotOutcome::Publish(out)
        };
        Ok(Self::new("Calculation", slots, Some(Arc::new(reaction))))
    }

    fn create_xy2mag(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        let name = init.point.full_name.clone();
        let reaction = move |_: &Engine, slots: &mut InputSlots| {
            if !slots.all_valid() {
                return SlotOutcome::Wait;
            }
            match slots.numbers() {
                Some(v) => SlotOutcome::Publish(Some(Value::Float(v[0].hypot(v[1])))),
                None => {
                    tracing::warn!("({}) XY2Mag: got non-numeric data", name);
                    SlotOutcome::Publish(None)
                }
            }
        };
        Ok(Self::new("XY2Mag", pair(init)?, Some(Arc::new(reaction))))
    }

    fn create_xy2angle(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        let degrees = init
            .args
            .get(2)
            .is_some_and(|flag| flag.trim().to_ascii_lowercase().starts_with('d'));
        let name = init.point.full_name.clone();
        let reaction = move |_: &Engine, slots: &mut InputSlots| {
            if !slots.all_valid() {
                return SlotOutcome::Wait;
            }
            match slots.numbers() {
                Some(v) => {
                    let angle = v[0].atan2(v[1]);
                    let out = if degrees { angle.to_degrees() } else { angle };
                    SlotOutcome::Publish(Some(Value::Float(out)))
                }
                None => {
                    tracing::warn!("({}) XY2Angle: got non-numeric data", name);
                    SlotOutcome::Publish(None)
                }
            }
        };
        Ok(Self::new("XY2Angle", pair(init)?, Some(Arc::new(reaction))))
    }

    fn create_ratio(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        let name = init.point.full_name.clone();
        let reaction = move |_: &Engine, slots: &mut InputSlots| {
            let (Some(num), Some(den)) = (slots.get(0), slots.get(1)) else {
                return SlotOutcome::Wait;
            };
            // Only combine readings taken at the same instant
            if num.timestamp() != den.timestamp() || !slots.all_valid() {
                return SlotOutcome::Wait;
            }
            match slots.numbers() {
                Some(v) => SlotOutcome::Publish(Some(Value::Float(v[0] / v[1]))),
                None => {
                    tracing::warn!("({}) Ratio: got non-numeric data", name);
                    SlotOutcome::Publish(None)
                }
            }
        };
        Ok(Self::new("Ratio", pair(init)?, Some(Arc::new(reaction))))
    }

    /// Two points and an expression over `a` and `b`; needs a fresh value
    /// from both between computations
    fn create_dual_listen(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 3, "two point names and an expression")?;
        let expr = init
            .scripts
            .compile(&format!("{} DualListen", init.point.full_name), &init.args[2])?;

        let reaction = move |engine: &Engine, slots: &mut InputSlots| {
            if !slots.all_valid() {
                return SlotOutcome::Wait;
            }
            let out = evaluate(engine, &expr, slots);
            slots.clear();
            SlotOutcome::Publish(out)
        };
        Ok(Self::new("DualListen", pair(init)?, Some(Arc::new(reaction))))
    }

    /// As DualListen, but only for readings taken at the same instant. The
    /// result carries that instant.
    fn create_synch(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 3, "two point names and an expression")?;
        let expr = init
            .scripts
            .compile(&format!("{} Synch", init.point.full_name), &init.args[2])?;

        let reaction = move |engine: &Engine, slots: &mut InputSlots| {
            let (Some(a), Some(b)) = (slots.get(0), slots.get(1)) else {
                return SlotOutcome::Wait;
            };
            let epoch = a.timestamp();
            if b.timestamp() != epoch || !slots.all_valid() {
                return SlotOutcome::Wait;
            }
            let out = evaluate(engine, &expr, slots);
            slots.clear();
            SlotOutcome::PublishAt(epoch, out)
        };
        Ok(Self::new("Synch", pair(init)?, Some(Arc::new(reaction))))
    }

    fn create_difference(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        let name = init.point.full_name.clone();
        let reaction = move |_: &Engine, slots: &mut InputSlots| {
            let a = slots.get(0).and_then(Sample::value);
            let b = slots.get(1).and_then(Sample::value);
            let out = match (a, b) {
                (Some(a), Some(b)) => difference(a, b),
                _ => return SlotOutcome::Wait,
            };
            slots.clear();
            match out {
                Some(v) => SlotOutcome::Publish(Some(v)),
                None => {
                    tracing::warn!("({}) Difference: unsupported types", name);
                    SlotOutcome::Wait
                }
            }
        };
        Ok(Self::new("Difference", pair(init)?, Some(Arc::new(reaction))))
    }

    fn create_linear_combo(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        if init.args.is_empty() || init.args.len() % 2 != 0 {
            return Err(EngineError::stage_args(
                init.class,
                "expected coefficient and point name pairs",
            ));
        }
        let mut coefficients = Vec::with_capacity(init.args.len() / 2);
        let mut names = Vec::with_capacity(init.args.len() / 2);
        for i in (0..init.args.len()).step_by(2) {
            coefficients.push(parse_arg::<f64>(init.class, init.args, i, "coefficient")?);
            names.push(init.args[i + 1].clone());
        }
        let slots = InputSlots::from_args(&names, &init.point.source);

        let reaction = move |_: &Engine, slots: &mut InputSlots| {
            if !slots.all_valid() {
                return SlotOutcome::Wait;
            }
            let out = slots.numbers().map(|v| {
                Value::Float(v.iter().zip(&coefficients).map(|(x, c)| x * c).sum())
            });
            SlotOutcome::Publish(out)
        };
        Ok(Self::new("LinearCombo", slots, Some(Arc::new(reaction))))
    }
}

impl Stage for ListenerStage {
    fn name(&self) -> &str {
        self.class
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        if self.mask && lock_slots(&self.slots).any_unavailable() {
            return Ok(None);
        }
        Ok(Some(input))
    }

    fn activate(&mut self, act: &Activation<'_>) -> Result<()> {
        bind_slots(act, &self.slots, self.reaction.clone());
        Ok(())
    }

    fn dependencies(&self) -> Vec<String> {
        lock_slots(&self.slots).names().to_vec()
    }
}

/// An expression over other points evaluated on the owning point's period
/// rather than on every update
pub struct CalculationTimed {
    slots: SharedSlots,
    expr: CompiledExpression,
    period: Period,
}

impl CalculationTimed {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        let (n, slots) = counted_names(init)?;
        require_args(init.class, init.args, n + 2, "point names and an expression")?;
        if init.point.period <= Period::zero() {
            return Err(EngineError::stage_args(init.class, "point needs a nonzero period"));
        }
        let expr = init
            .scripts
            .compile(&format!("{} CalculationTimed", init.point.full_name), &init.args[n + 1])?;
        Ok(Box::new(Self {
            slots: shared(slots),
            expr,
            period: init.point.period,
        }))
    }
}

impl Stage for CalculationTimed {
    fn name(&self) -> &str {
        "CalculationTimed"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        Ok(Some(input))
    }

    fn activate(&mut self, act: &Activation<'_>) -> Result<()> {
        bind_slots(act, &self.slots, None);

        let slots = self.slots.clone();
        let expr = self.expr.clone();
        let point = Arc::downgrade(act.point);
        let engine = act.engine.downgrade();
        act.engine.schedule_task(
            format!("{} CalculationTimed", act.point.full_name()),
            act.engine.now() + self.period,
            self.period,
            move |_now| {
                let (Some(engine), Some(point)) = (engine.upgrade(), point.upgrade()) else {
                    return TaskControl::Stop;
                };
                let out = {
                    let slots = lock_slots(&slots);
                    if slots.all_valid() {
                        evaluate(&engine, &expr, &slots)
                    } else {
                        None
                    }
                };
                publish(&engine, &point, out);
                TaskControl::Continue
            },
        );
        Ok(())
    }

    fn dependencies(&self) -> Vec<String> {
        lock_slots(&self.slots).names().to_vec()
    }
}

/// Replaces each input with the other point's sample at or before the
/// input's timestamp. Ends the chain when there is none.
pub struct Preceding {
    target: String,
}

impl Preceding {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 1, "a point name")?;
        Ok(Box::new(Self {
            target: replace_tok(&init.args[0], &init.point.source),
        }))
    }
}

impl Stage for Preceding {
    fn name(&self) -> &str {
        "Preceding"
    }

    fn translate(&mut self, input: Sample, ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        Ok(ctx
            .engine
            .preceding(&self.target, input.timestamp())
            .map(|found| found.renamed(ctx.point.full_name())))
    }
}

/// Publishes the first of a list of points, in order of preference, that
/// currently holds a valid value
pub struct Failover {
    slots: SharedSlots,
}

impl Failover {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 1, "at least one point name")?;
        Ok(Box::new(Self {
            slots: shared(InputSlots::from_args(init.args, &init.point.source)),
        }))
    }
}

/// What to publish after slot `updated` changed
fn failover_outcome(slots: &InputSlots, updated: usize, was_valid: bool) -> SlotOutcome {
    let valid = |i: &usize| slots.get(*i).is_some_and(Sample::is_valid);
    let Some(first) = (0..slots.len()).find(valid) else {
        let t = slots.get(updated).map(Sample::timestamp);
        return t.map_or(SlotOutcome::Wait, |t| SlotOutcome::PublishAt(t, None));
    };
    // A preferred point recovering, or the active one failing over
    if first == updated || (first > updated && was_valid) {
        let (Some(update), Some(chosen)) = (slots.get(updated), slots.get(first)) else {
            return SlotOutcome::Wait;
        };
        return SlotOutcome::PublishAt(update.timestamp(), chosen.value().cloned());
    }
    SlotOutcome::Wait
}

struct FailoverListener {
    index: usize,
    slots: SharedSlots,
    parent: Weak<PointDescriptor>,
    engine: WeakEngine,
}

impl PointListener for FailoverListener {
    fn on_sample(&self, _point: &PointDescriptor, sample: &Sample) -> Result<()> {
        let (Some(engine), Some(parent)) = (self.engine.upgrade(), self.parent.upgrade()) else {
            return Ok(());
        };
        let outcome = {
            let mut slots = lock_slots(&self.slots);
            let was_valid = slots.get(self.index).is_some_and(Sample::is_valid);
            slots.set(self.index, sample.clone());
            failover_outcome(&slots, self.index, was_valid)
        };
        if let SlotOutcome::PublishAt(t, value) = outcome {
            publish_at(&engine, &parent, t, value);
        }
        Ok(())
    }
}

impl Stage for Failover {
    fn name(&self) -> &str {
        "Failover"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        Ok(Some(input))
    }

    fn activate(&mut self, act: &Activation<'_>) -> Result<()> {
        let names = lock_slots(&self.slots).names().to_vec();
        let slots = self.slots.clone();
        let parent = Arc::downgrade(act.point);
        let engine = act.engine.downgrade();
        subscribe_deferred(act, names, move |index| {
            Arc::new(FailoverListener {
                index,
                slots: slots.clone(),
                parent: parent.clone(),
                engine: engine.clone(),
            })
        });
        Ok(())
    }

    fn dependencies(&self) -> Vec<String> {
        lock_slots(&self.slots).names().to_vec()
    }
}

/// Follows `<source>.<name>` where the source is the latest string value
/// of a discriminator point
pub struct SourceSelector {
    discriminator: String,
    point_name: String,
    selection: Arc<Mutex<Option<Selection>>>,
}

/// The point currently forwarded
struct Selection {
    source: String,
    target: Weak<PointDescriptor>,
    forwarder: Arc<dyn PointListener>,
}

impl SourceSelector {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 2, "a discriminator and a point name")?;
        Ok(Box::new(Self {
            discriminator: replace_tok(&init.args[0], &init.point.source),
            point_name: init.args[1].clone(),
            selection: Arc::new(Mutex::new(None)),
        }))
    }
}

struct SourceSwitch {
    point_name: String,
    selection: Arc<Mutex<Option<Selection>>>,
    parent: Weak<PointDescriptor>,
    engine: WeakEngine,
}

impl PointListener for SourceSwitch {
    fn on_sample(&self, _point: &PointDescriptor, sample: &Sample) -> Result<()> {
        let Some(source) = sample.value().and_then(Value::as_str) else {
            return Ok(());
        };
        let (Some(engine), Some(parent)) = (self.engine.upgrade(), self.parent.upgrade()) else {
            return Ok(());
        };

        let mut selection = self.selection.lock().unwrap_or_else(|e| e.into_inner());
        if selection.as_ref().is_some_and(|s| s.source == source) {
            return Ok(());
        }
        if let Some(old) = selection.take() {
            if let Some(target) = old.target.upgrade() {
                target.listeners().remove(&old.forwarder);
            }
        }

        let wanted = format!("{}.{}", source, self.point_name);
        let Some(target) = engine.point(&wanted) else {
            tracing::warn!("({}) Required point {} doesn't exist", parent.full_name(), wanted);
            return Ok(());
        };
        let (to, via) = (self.parent.clone(), self.engine.clone());
        let forwarder: Arc<dyn PointListener> =
            Arc::new(move |_: &PointDescriptor, update: &Sample| -> Result<()> {
                if let (Some(engine), Some(parent)) = (via.upgrade(), to.upgrade()) {
                    publish_at(&engine, &parent, update.timestamp(), update.value().cloned());
                }
                Ok(())
            });
        target.add_listener(forwarder.clone());
        tracing::debug!("({}) Following {}", parent.full_name(), wanted);
        *selection = Some(Selection {
            source: source.to_string(),
            target: Arc::downgrade(&target),
            forwarder,
        });
        Ok(())
    }
}

impl Stage for SourceSelector {
    fn name(&self) -> &str {
        "SourceSelector"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        Ok(Some(input))
    }

    fn activate(&mut self, act: &Activation<'_>) -> Result<()> {
        let point_name = self.point_name.clone();
        let selection = self.selection.clone();
        let parent = Arc::downgrade(act.point);
        let engine = act.engine.downgrade();
        subscribe_deferred(act, vec![self.discriminator.clone()], move |_| {
            Arc::new(SourceSwitch {
                point_name: point_name.clone(),
                selection: selection.clone(),
                parent: parent.clone(),
                engine: engine.clone(),
            })
        });
        Ok(())
    }

    fn dependencies(&self) -> Vec<String> {
        vec![self.discriminator.clone()]
    }
}

/// Fill a text template.
///
/// `$V[name]` becomes the latest value of another point. With a previous
/// sample, `$V` `$T` `$A` and `$a` give its value, UTC time, alarm flag and
/// alarm word. `$U` `$N` `$S` and `$D` describe `point`.
pub fn substitute(template: &str, last: Option<&Sample>, point: &PointDescriptor, engine: &Engine) -> String {
    let mut text = template.to_string();
    let mut from = 0;
    while let Some(offset) = text[from..].find("$V[") {
        let start = from + offset;
        let Some(len) = text[start..].find(']') else {
            break;
        };
        let end = start + len;
        let replacement = match engine.point(&text[start + 3..end]) {
            None => "[point not found]".to_string(),
            Some(other) => engine
                .latest(other.full_name())
                .and_then(Sample::into_value)
                .map_or_else(|| "null".to_string(), |v| v.to_string()),
        };
        text.replace_range(start..=end, &replacement);
        from = start + replacement.len();
    }

    if let Some(sample) = last {
        let value = sample.value().map_or_else(|| "null".to_string(), |v| v.to_string());
        text = text
            .replace("$V", &value)
            .replace("$T", &sample.timestamp().format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            .replace("$A", &sample.alarm().to_string())
            .replace("$a", if sample.alarm() { "ALARMING" } else { "OK" });
    }

    text.replace("$U", point.units())
        .replace("$N", point.full_name())
        .replace("$S", point.source())
        .replace("$D", point.long_desc())
}

/// Publishes a filled-in template on the owning point's period
pub struct TimedSubstitution {
    template: String,
    period: Period,
}

impl TimedSubstitution {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 1, "a template")?;
        if init.point.period <= Period::zero() {
            return Err(EngineError::stage_args(init.class, "point needs a nonzero period"));
        }
        Ok(Box::new(Self {
            template: replace_tok(&init.args[0], &init.point.source),
            period: init.point.period,
        }))
    }
}

impl Stage for TimedSubstitution {
    fn name(&self) -> &str {
        "TimedSubstitution"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        Ok(Some(input))
    }

    fn activate(&mut self, act: &Activation<'_>) -> Result<()> {
        let template = self.template.clone();
        let point = Arc::downgrade(act.point);
        let engine = act.engine.downgrade();
        let mut last: Option<Sample> = None;
        act.engine.schedule_task(
            format!("{} TimedSubstitution", act.point.full_name()),
            act.engine.now() + self.period,
            self.period,
            move |now| {
                let (Some(engine), Some(point)) = (engine.upgrade(), point.upgrade()) else {
                    return TaskControl::Stop;
                };
                let text = substitute(&template, last.as_ref(), &point, &engine);
                let sample = Sample::new(point.full_name(), now, text);
                last = Some(sample.clone());
                if let Err(e) = point.fire(&engine, sample, true) {
                    tracing::debug!("({}) Substituted text not published: {}", point.full_name(), e);
                }
                TaskControl::Continue
            },
        );
        Ok(())
    }
}
