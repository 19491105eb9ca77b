//! Points computed from other points

mod common;

use common::builders::{definitions, RecordBuilder};
use common::mock_helpers::SampleRecorder;
use common::{assert_float_eq, at, TestEngine};
use telemon::types::{Period, Sample};

fn fire(t: &TestEngine, name: &str, secs: i64, value: f64) {
    t.engine.fire(name, Sample::new(name, at(secs), value)).unwrap();
}

#[test]
fn test_calculation_waits_for_targets_defined_later() {
    let t = TestEngine::new();
    let report = t.engine.load_definitions(&definitions([RecordBuilder::new("total")
        .stage(r#"Calculation-"2""$1.a""$1.b""a + b""#)
        .build()]));
    assert!(report.is_clean(), "{:?}", report.errors);

    // Nothing to bind to yet
    t.advance(Period::milliseconds(500));

    t.engine.load_definitions(&definitions([
        RecordBuilder::new("a").build(),
        RecordBuilder::new("b").build(),
    ]));
    t.engine.mark_points_created();
    let recorder = SampleRecorder::attach(&t.engine.point("site.total").unwrap());

    // Samples before the next retry are not seen
    fire(&t, "site.a", 0, 100.0);
    t.advance(Period::milliseconds(500));
    assert_eq!(recorder.len(), 0);

    fire(&t, "site.a", 1, 1.5);
    fire(&t, "site.b", 1, 2.0);
    assert_eq!(recorder.values(), vec![Some(3.5)]);
    assert_float_eq(t.latest_f64("site.total").unwrap(), 3.5, 1e-9);

    // Slots are consumed by each computation
    fire(&t, "site.a", 2, 4.0);
    assert_eq!(recorder.len(), 1);
}

#[test]
fn test_timed_calculation_publishes_on_period() {
    let t = TestEngine::new();
    t.engine.load_definitions(&definitions([
        RecordBuilder::new("x").build(),
        RecordBuilder::new("y").build(),
        RecordBuilder::new("product")
            .stage(r#"CalculationTimed-"2""site.x""site.y""a * b""#)
            .period_secs(10.0)
            .build(),
    ]));
    t.engine.mark_points_created();
    t.advance(Period::milliseconds(0));

    fire(&t, "site.x", 0, 2.0);
    fire(&t, "site.y", 0, 3.0);
    assert!(t.engine.latest("site.product").is_none());

    t.advance(Period::seconds(10));
    assert_float_eq(t.latest_f64("site.product").unwrap(), 6.0, 1e-9);

    // Inputs are kept between ticks
    fire(&t, "site.x", 12, 5.0);
    t.advance(Period::seconds(10));
    assert_float_eq(t.latest_f64("site.product").unwrap(), 15.0, 1e-9);
}

#[test]
fn test_combined_value_feeds_following_stages() {
    let t = TestEngine::new();
    t.engine.load_definitions(&definitions([
        RecordBuilder::new("in1").build(),
        RecordBuilder::new("in2").build(),
        RecordBuilder::new("scaled")
            .stage(r#"LinearCombo-"0.5""$1.in1""2""$1.in2""#)
            .stage(r#"Polynomial-"2""1""10""#)
            .build(),
    ]));
    t.advance(Period::milliseconds(0));

    fire(&t, "site.in1", 0, 4.0);
    assert!(t.engine.latest("site.scaled").is_none());
    fire(&t, "site.in2", 0, 1.0);
    assert_float_eq(t.latest_f64("site.scaled").unwrap(), 41.0, 1e-9);

    // Every later update recomputes from the latest of each input
    fire(&t, "site.in1", 1, 0.0);
    assert_float_eq(t.latest_f64("site.scaled").unwrap(), 21.0, 1e-9);
}
