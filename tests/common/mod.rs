//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use std::sync::Arc;
use telemon::config::EngineConfig;
use telemon::timer::{Clock, ManualClock};
use telemon::types::{timestamp_from_secs, Period, Timestamp};
use telemon::Engine;

/// Start of every test clock
pub const T0: i64 = 1_700_000_000;

/// Seconds after [`T0`]
pub fn at(secs: i64) -> Timestamp {
    timestamp_from_secs(T0 + secs)
}

/// An engine on a hand-driven clock
pub struct TestEngine {
    pub engine: Engine,
    pub clock: Arc<ManualClock>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let clock = Arc::new(ManualClock::new(at(0)));
        let engine = Engine::with_clock(config, clock.clone());
        Self { engine, clock }
    }

    /// Move the clock forward and run whatever timer work fell due
    pub fn advance(&self, by: Period) -> usize {
        self.clock.advance(by);
        self.engine.timers().run_due(self.now())
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Latest buffered value of a point as a float
    pub fn latest_f64(&self, point: &str) -> Option<f64> {
        self.engine.latest(point).and_then(|s| s.as_f64())
    }
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}
