//! End-to-end behaviour of points loaded from definition text

mod common;

use common::builders::{definitions, RecordBuilder};
use common::mock_helpers::{create_test_source, AlarmRecorder, SampleRecorder};
use common::{assert_float_eq, at, TestEngine};
use std::sync::Arc;
use telemon::alarm::AlarmStatus;
use telemon::archive::MemoryArchive;
use telemon::collector::process_ingest;
use telemon::config::EngineConfig;
use telemon::types::{Period, Sample};
use telemon::EngineError;

#[test]
fn test_mean_point_end_to_end() {
    let t = TestEngine::new();
    let text = definitions([RecordBuilder::new("power")
        .units("kW")
        .stage(r#"Mean-"30""#)
        .period_secs(10.0)
        .build()]);
    let report = t.engine.load_definitions(&text);
    assert!(report.is_clean(), "{:?}", report.errors);

    for (secs, value, mean) in [(0, 10.0, 10.0), (10, 20.0, 15.0), (20, 30.0, 20.0), (45, 60.0, 45.0)] {
        t.engine
            .fire("site.power", Sample::new("site.power", at(secs), value))
            .unwrap();
        assert_float_eq(t.latest_f64("site.power").unwrap(), mean, 1e-9);
    }

    let history = t.engine.query("site.power", at(0), at(60), None).unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(
        t.engine.point("site.power").unwrap().next_epoch(),
        Some(at(55))
    );
}

#[test]
fn test_sixty_second_mean_of_power_current() {
    let t = TestEngine::new();
    let report = t.engine.load_definitions(&definitions([RecordBuilder::new("power.current")
        .units("A")
        .stage(r#"Mean-"60""#)
        .build()]));
    assert!(report.is_clean(), "{:?}", report.errors);

    for (secs, value) in [(0, 10.0), (20, 20.0), (40, 30.0)] {
        t.engine
            .fire("site.power.current", Sample::new("site.power.current", at(secs), value))
            .unwrap();
    }
    assert_float_eq(t.latest_f64("site.power.current").unwrap(), 20.0, 1e-9);
}

#[test]
fn test_null_result_skips_buffer_but_reaches_listeners() {
    let t = TestEngine::new();
    let text = definitions([
        RecordBuilder::new("flag").stage("NumberToBool").archive("ALL").priority(1).build(),
    ]);
    t.engine.load_definitions(&text);
    let archive = Arc::new(MemoryArchive::new(100));
    t.engine.set_archive(archive.clone());

    let point = t.engine.point("site.flag").unwrap();
    let recorder = SampleRecorder::attach(&point);

    t.engine.fire("site.flag", Sample::null("site.flag", at(0))).unwrap();
    t.engine.flush_archive();

    assert_eq!(t.engine.buffer().len("site.flag"), 0);
    assert_eq!(archive.len("site.flag"), 0);
    assert!(t.engine.alarms().get("site.flag").is_none());
    assert_eq!(recorder.values(), vec![None]);
}

#[test]
fn test_query_merges_archive_and_buffer() {
    let mut config = EngineConfig::default();
    config.buffer.max_count = 3;
    let t = TestEngine::with_config(config);
    t.engine
        .load_definitions(&definitions([RecordBuilder::new("level").archive("ALL").build()]));
    let archive = Arc::new(MemoryArchive::new(100));
    t.engine.set_archive(archive.clone());

    for i in 0..6 {
        t.engine
            .fire("site.level", Sample::new("site.level", at(i * 10), i as f64))
            .unwrap();
    }
    t.engine.flush_archive();
    assert_eq!(t.engine.buffer().len("site.level"), 3);
    assert_eq!(archive.len("site.level"), 6);

    let merged = t.engine.query("site.level", at(0), at(50), None).unwrap();
    let values: Vec<f64> = merged.iter().filter_map(Sample::as_f64).collect();
    assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);

    // Thinned to at most three samples
    let thinned = t.engine.query("site.level", at(0), at(50), Some(3)).unwrap();
    assert!(thinned.len() <= 3);
    assert_eq!(thinned[0].timestamp(), at(0));
}

#[test]
fn test_clipped_archive_is_not_spliced() {
    let mut config = EngineConfig::default();
    config.buffer.max_count = 2;
    let t = TestEngine::with_config(config);
    t.engine
        .load_definitions(&definitions([RecordBuilder::new("level").archive("ALL").build()]));
    t.engine.set_archive(Arc::new(MemoryArchive::new(2)));

    for i in 0..5 {
        t.engine
            .fire("site.level", Sample::new("site.level", at(i), i as f64))
            .unwrap();
    }
    t.engine.flush_archive();

    let result = t.engine.query("site.level", at(0), at(4), None).unwrap();
    let values: Vec<f64> = result.iter().filter_map(Sample::as_f64).collect();
    assert_eq!(values, vec![0.0, 1.0]);
}

#[test]
fn test_alarm_lifecycle() {
    let t = TestEngine::new();
    t.engine.load_definitions(&definitions([RecordBuilder::new("temp")
        .units("C")
        .limit(r#"Range-"0""40""#)
        .notify("ops")
        .notify("oncall")
        .priority(2)
        .build()]));
    let recorder = Arc::new(AlarmRecorder::default());
    t.engine.add_alarm_listener(recorder.clone());

    t.engine.fire("site.temp", Sample::new("site.temp", at(0), 55.0)).unwrap();
    let record = t.engine.alarms().get("site.temp").unwrap();
    assert_eq!(record.status(), AlarmStatus::Alarming);
    assert_eq!(record.notifications, vec!["ops", "oncall"]);
    assert_eq!(t.engine.alarms().get_alarms().len(), 1);

    t.engine.acknowledge("site.temp", true, "ops").unwrap();
    assert_eq!(
        t.engine.alarms().get("site.temp").unwrap().status(),
        AlarmStatus::Acknowledged
    );

    // Back to normal clears the acknowledgement
    t.engine.fire("site.temp", Sample::new("site.temp", at(10), 20.0)).unwrap();
    let record = t.engine.alarms().get("site.temp").unwrap();
    assert_eq!(record.status(), AlarmStatus::NotAlarmed);
    assert!(!record.acknowledged);
    assert!(t.engine.alarms().get_alarms().is_empty());
    assert_eq!(recorder.events.lock().unwrap().len(), 3);
}

#[test]
fn test_cyclic_points_are_excluded() {
    let t = TestEngine::new();
    let text = definitions([
        RecordBuilder::new("a").stage(r#"Listener-"1""site.b""#).build(),
        RecordBuilder::new("b").stage(r#"Listener-"1""$1.a""#).build(),
        RecordBuilder::new("c").stage(r#"Listener-"1""site.b""#).build(),
        RecordBuilder::new("d").build(),
    ]);
    let report = t.engine.load_definitions(&text);

    assert_eq!(report.loaded, vec!["site.c", "site.d"]);
    let cycle = report
        .errors
        .iter()
        .find_map(|e| match e {
            EngineError::CycleDetected(path) => Some(path.clone()),
            _ => None,
        })
        .expect("cycle reported");
    assert!(cycle.contains(&"site.a".to_string()));
    assert!(cycle.contains(&"site.b".to_string()));
}

#[test]
fn test_collection_round_trip() {
    let t = TestEngine::new();
    t.engine.load_definitions(&definitions([RecordBuilder::new("volts")
        .input(r#"In-"plc""#)
        .stage(r#"Polynomial-"2""0""0.1""#)
        .period_secs(5.0)
        .build()]));

    let mut source = create_test_source("plc");
    source.expect_collect().times(2).returning(|points, sink| {
        for p in points {
            sink.send(Sample::new(p.as_str(), at(0), 2300.0))?;
        }
        Ok(())
    });
    t.engine.register_source(Arc::new(source));

    assert_eq!(t.engine.scheduler().poll_due(t.now()), 1);
    assert_eq!(process_ingest(&t.engine), 1);
    assert_float_eq(t.latest_f64("site.volts").unwrap(), 230.0, 1e-9);

    // Due again one period after the data timestamp
    let epoch = t.engine.point("site.volts").unwrap().next_epoch().unwrap();
    assert_eq!(epoch, at(5));
    t.advance(Period::seconds(4));
    assert_eq!(t.engine.scheduler().poll_due(t.now()), 0);
    t.advance(Period::seconds(1));
    assert_eq!(t.engine.scheduler().poll_due(t.now()), 1);
}
