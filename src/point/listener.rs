//! Per-point event bus
//!
//! Listeners are invoked synchronously on the firing thread, in
//! registration order. A failing listener is logged and does not stop
//! delivery to the others.

use crate::error::Result;
use crate::point::PointDescriptor;
use crate::types::Sample;
use std::sync::{Arc, RwLock};

/// Receives every sample a point publishes
pub trait PointListener: Send + Sync {
    fn on_sample(&self, point: &PointDescriptor, sample: &Sample) -> Result<()>;
}

impl<F> PointListener for F
where
    F: Fn(&PointDescriptor, &Sample) -> Result<()> + Send + Sync,
{
    fn on_sample(&self, point: &PointDescriptor, sample: &Sample) -> Result<()> {
        self(point, sample)
    }
}

/// Ordered listener list
#[derive(Default)]
pub struct ListenerList {
    listeners: RwLock<Vec<Arc<dyn PointListener>>>,
}

impl ListenerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn PointListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Remove a listener by identity; returns whether it was present
    pub fn remove(&self, listener: &Arc<dyn PointListener>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a sample to every listener.
    ///
    /// Works on a snapshot so a listener may subscribe further listeners
    /// while being called.
    pub fn distribute(&self, point: &PointDescriptor, sample: &Sample) {
        let snapshot = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for listener in snapshot {
            if let Err(e) = listener.on_sample(point, sample) {
                tracing::warn!(
                    "{}: Error distributing data to listener: {}",
                    point.full_name(),
                    e
                );
            }
        }
    }
}

impl std::fmt::Debug for ListenerList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerList")
            .field("listeners", &self.len())
            .finish()
    }
}
