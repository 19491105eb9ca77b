//! Mock data sources and listeners

use mockall::mock;
use std::sync::{Arc, Mutex};
use telemon::alarm::{AlarmEvent, AlarmEventListener};
use telemon::collector::{DataSource, SampleSink};
use telemon::point::{PointDescriptor, PointListener};
use telemon::types::Sample;
use telemon::Result;

mock! {
    pub Source {}

    impl DataSource for Source {
        fn name(&self) -> String;
        fn is_connected(&self) -> bool;
        fn collect(&self, points: &[String], sink: &SampleSink) -> Result<()>;
        fn put_data(&self, point: &str, sample: &Sample) -> Result<()>;
    }
}

/// A connected source named `name` that accepts every collection and write
pub fn create_test_source(name: &str) -> MockSource {
    let mut source = MockSource::new();
    source.expect_name().return_const(name.to_string());
    source.expect_is_connected().return_const(true);
    source
}

/// Records every sample a point publishes
#[derive(Default)]
pub struct SampleRecorder {
    pub samples: Mutex<Vec<Sample>>,
}

impl SampleRecorder {
    pub fn attach(point: &PointDescriptor) -> Arc<Self> {
        let recorder = Arc::new(Self::default());
        point.add_listener(recorder.clone());
        recorder
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap().len()
    }

    pub fn values(&self) -> Vec<Option<f64>> {
        self.samples.lock().unwrap().iter().map(Sample::as_f64).collect()
    }
}

impl PointListener for SampleRecorder {
    fn on_sample(&self, _point: &PointDescriptor, sample: &Sample) -> Result<()> {
        self.samples.lock().unwrap().push(sample.clone());
        Ok(())
    }
}

/// Records alarm events
#[derive(Default)]
pub struct AlarmRecorder {
    pub events: Mutex<Vec<AlarmEvent>>,
}

impl AlarmEventListener for AlarmRecorder {
    fn on_alarm_event(&self, event: &AlarmEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
