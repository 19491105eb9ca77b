//! Recent-sample cache per point
//!
//! Every valid sample a point produces is appended here. Each point owns a
//! time-ordered deque behind its own mutex; the map of points is only
//! write-locked when a point appends for the first time.
//!
//! # Eviction
//!
//! After each append the front of the deque is dropped while the deque is
//! longer than `max_count`, or while its oldest entry is older than
//! `max_age` relative to the newest.
//!
//! # Range Queries
//!
//! [`PointBuffer::query`] serves straight from memory when the buffer
//! reaches back to the requested start. Otherwise it reads the archive and
//! splices the buffer onto the end, unless the archive clipped its answer.
//! Buffer locks are released before the archive is touched.

use crate::archive::Archive;
use crate::config::BufferConfig;
use crate::types::{Period, Sample, Timestamp};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

type Entry = Arc<Mutex<VecDeque<Sample>>>;

/// Bounds applied on append
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferLimits {
    pub max_count: usize,
    pub max_age: Period,
}

impl From<&BufferConfig> for BufferLimits {
    fn from(config: &BufferConfig) -> Self {
        Self {
            max_count: config.max_count.max(1),
            max_age: config.max_age(),
        }
    }
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self::from(&BufferConfig::default())
    }
}

/// Buffered samples for every point
pub struct PointBuffer {
    limits: BufferLimits,
    entries: RwLock<HashMap<String, Entry>>,
}

impl PointBuffer {
    pub fn new(limits: BufferLimits) -> Self {
        Self {
            limits,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> BufferLimits {
        self.limits
    }

    fn entry(&self, point: &str) -> Option<Entry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(point)
            .cloned()
    }

    fn entry_or_create(&self, point: &str) -> Entry {
        if let Some(entry) = self.entry(point) {
            return entry;
        }
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(point.to_string())
            .or_default()
            .clone()
    }

    /// Append a sample and apply the count and age bounds
    pub fn append(&self, point: &str, sample: Sample) {
        let entry = self.entry_or_create(point);
        let mut samples = entry.lock().unwrap_or_else(|e| e.into_inner());

        samples.push_back(sample);
        let newest = samples.back().map(Sample::timestamp);
        while samples.len() > self.limits.max_count {
            samples.pop_front();
        }
        if let Some(newest) = newest {
            let cutoff = newest - self.limits.max_age;
            while samples.front().is_some_and(|s| s.timestamp() < cutoff) {
                samples.pop_front();
            }
        }
    }

    /// Number of buffered samples for a point
    pub fn len(&self, point: &str) -> usize {
        self.entry(point)
            .map(|e| e.lock().unwrap_or_else(|e| e.into_inner()).len())
            .unwrap_or(0)
    }

    /// Copy of everything buffered for a point, oldest first
    pub fn snapshot(&self, point: &str) -> Vec<Sample> {
        self.entry(point)
            .map(|e| {
                e.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .iter()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Most recent sample
    pub fn latest(&self, point: &str) -> Option<Sample> {
        self.entry(point)
            .and_then(|e| e.lock().unwrap_or_else(|e| e.into_inner()).back().cloned())
    }

    /// Samples in `[start, end]`, merged with the archive when the buffer
    /// does not reach back far enough, then down-sampled to `max_samples`.
    ///
    /// Returns `None` when nothing matched.
    pub fn query(
        &self,
        point: &str,
        start: Timestamp,
        end: Timestamp,
        max_samples: Option<usize>,
        archive: Option<&dyn Archive>,
    ) -> Option<Vec<Sample>> {
        let buffered = self.snapshot(point);
        let in_range = |s: &&Sample| s.timestamp() >= start && s.timestamp() <= end;

        let buffer_head = buffered.first().map(Sample::timestamp);
        let mut result: Vec<Sample> = match (buffer_head, archive) {
            (Some(head), _) if head <= start => buffered.iter().filter(in_range).cloned().collect(),
            (_, Some(archive)) => {
                let extract = match archive.extract(point, start, end) {
                    Ok(extract) => extract,
                    Err(e) => {
                        tracing::warn!("({}) Archive read failed, using buffer only: {}", point, e);
                        Default::default()
                    }
                };
                if extract.clipped {
                    extract.samples
                } else {
                    let mut merged = extract.samples;
                    if let Some(head) = buffer_head {
                        merged.retain(|s| s.timestamp() < head);
                    }
                    merged.extend(buffered.iter().filter(in_range).cloned());
                    merged
                }
            }
            (_, None) => buffered.iter().filter(in_range).cloned().collect(),
        };

        if let Some(max) = max_samples {
            if max > 0 && result.len() > max {
                result = downsample(result, start, end, max);
            }
        }

        if result.is_empty() {
            None
        } else {
            Some(result)
        }
    }

    /// Last sample at or before `t`, from the buffer if it covers `t`,
    /// otherwise from the archive
    pub fn preceding(
        &self,
        point: &str,
        t: Timestamp,
        archive: Option<&dyn Archive>,
    ) -> Option<Sample> {
        let buffered = self.snapshot(point);
        if buffered.first().is_some_and(|s| s.timestamp() <= t) {
            return buffered.iter().rev().find(|s| s.timestamp() <= t).cloned();
        }
        archive.and_then(|a| match a.preceding(point, t) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("({}) Archive read failed: {}", point, e);
                None
            }
        })
    }

    /// First sample at or after `t`
    pub fn following(
        &self,
        point: &str,
        t: Timestamp,
        archive: Option<&dyn Archive>,
    ) -> Option<Sample> {
        let buffered = self.snapshot(point);
        if buffered.first().is_some_and(|s| s.timestamp() <= t) {
            return buffered.iter().find(|s| s.timestamp() >= t).cloned();
        }
        let archived = archive.and_then(|a| match a.following(point, t) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("({}) Archive read failed: {}", point, e);
                None
            }
        });
        archived.or_else(|| buffered.first().cloned())
    }
}

/// Keep at most `max` samples, at least `(end - start) / max` apart.
///
/// Walks forward keeping the first sample at or after each boundary, and
/// moves the boundary to the kept sample's time plus the increment.
pub fn downsample(samples: Vec<Sample>, start: Timestamp, end: Timestamp, max: usize) -> Vec<Sample> {
    if max == 0 {
        return Vec::new();
    }
    let span = (end - start).num_microseconds().unwrap_or(i64::MAX).max(0);
    let increment = Period::microseconds(span / max as i64);

    let mut kept = Vec::with_capacity(max);
    let mut boundary = start;
    for sample in samples {
        if kept.len() >= max {
            break;
        }
        if sample.timestamp() >= boundary {
            boundary = sample.timestamp() + increment;
            kept.push(sample);
        }
    }
    kept
}

impl std::fmt::Debug for PointBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointBuffer")
            .field("limits", &self.limits)
            .field(
                "points",
                &self.entries.read().map(|e| e.len()).unwrap_or(0),
            )
            .finish()
    }
}
