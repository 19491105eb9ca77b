//! Archive interface and in-process archive
//!
//! The engine hands qualifying samples to an [`Archive`] and reads it back
//! when a range query reaches further into the past than the point buffer.
//!
//! # Architecture
//!
//! - [`Archive`] is the storage collaborator. Its methods may block on I/O.
//! - [`ArchiveQueue`] decouples writes from the firing thread: the point
//!   chain enqueues, and a writer thread (or [`ArchiveQueue::drain`] in
//!   tests) performs the actual write with no point lock held.
//! - [`MemoryArchive`] keeps everything in process with a per-extract
//!   record clip, which is enough for the daemon and for tests.

pub mod policy;

use crate::error::{EngineError, Result};
use crate::types::{Sample, Timestamp};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

pub use policy::ArchivePolicy;

/// Result of an archive range read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveExtract {
    /// Samples in ascending time order
    pub samples: Vec<Sample>,
    /// True when the archive stopped at its max-records limit
    pub clipped: bool,
}

/// Storage for historical samples
#[cfg_attr(test, mockall::automock)]
pub trait Archive: Send + Sync {
    /// Samples with `start <= t <= end`, oldest first
    fn extract(&self, point: &str, start: Timestamp, end: Timestamp) -> Result<ArchiveExtract>;

    /// Last sample at or before `t`
    fn preceding(&self, point: &str, t: Timestamp) -> Result<Option<Sample>>;

    /// First sample at or after `t`
    fn following(&self, point: &str, t: Timestamp) -> Result<Option<Sample>>;

    /// Store one sample
    fn archive_data(&self, point: &str, sample: &Sample) -> Result<()>;
}

/// Shared handle to an archive
pub type SharedArchive = Arc<dyn Archive>;

// ==================== Memory Archive ====================

/// In-process archive, bounded per extract by `max_records`
pub struct MemoryArchive {
    data: RwLock<HashMap<String, Vec<Sample>>>,
    max_records: usize,
}

impl MemoryArchive {
    pub fn new(max_records: usize) -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            max_records: max_records.max(1),
        }
    }

    pub fn max_records(&self) -> usize {
        self.max_records
    }

    /// Number of stored samples for a point
    pub fn len(&self, point: &str) -> usize {
        self.data
            .read()
            .map(|d| d.get(point).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Drop samples older than `cutoff` for one point; returns how many were removed
    pub fn purge_older_than(&self, point: &str, cutoff: Timestamp) -> usize {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let Some(samples) = data.get_mut(point) else {
            return 0;
        };
        let keep_from = samples.partition_point(|s| s.timestamp() < cutoff);
        samples.drain(..keep_from);
        keep_from
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Vec<Sample>>>> {
        self.data
            .read()
            .map_err(|e| EngineError::Archive(format!("Failed to acquire archive lock: {}", e)))
    }
}

impl Archive for MemoryArchive {
    fn extract(&self, point: &str, start: Timestamp, end: Timestamp) -> Result<ArchiveExtract> {
        let data = self.read()?;
        let Some(samples) = data.get(point) else {
            return Ok(ArchiveExtract::default());
        };

        let from = samples.partition_point(|s| s.timestamp() < start);
        let to = samples.partition_point(|s| s.timestamp() <= end);
        let available = to.saturating_sub(from);
        let take = available.min(self.max_records);

        Ok(ArchiveExtract {
            samples: samples[from..from + take].to_vec(),
            clipped: available > self.max_records,
        })
    }

    fn preceding(&self, point: &str, t: Timestamp) -> Result<Option<Sample>> {
        let data = self.read()?;
        Ok(data.get(point).and_then(|samples| {
            let idx = samples.partition_point(|s| s.timestamp() <= t);
            idx.checked_sub(1).map(|i| samples[i].clone())
        }))
    }

    fn following(&self, point: &str, t: Timestamp) -> Result<Option<Sample>> {
        let data = self.read()?;
        Ok(data.get(point).and_then(|samples| {
            let idx = samples.partition_point(|s| s.timestamp() < t);
            samples.get(idx).cloned()
        }))
    }

    fn archive_data(&self, point: &str, sample: &Sample) -> Result<()> {
        let mut data = self
            .data
            .write()
            .map_err(|e| EngineError::Archive(format!("Failed to acquire archive lock: {}", e)))?;
        let samples = data.entry(point.to_string()).or_default();
        // Usually appended in order; keep sorted if not
        let idx = samples.partition_point(|s| s.timestamp() <= sample.timestamp());
        samples.insert(idx, sample.clone());
        Ok(())
    }
}

impl std::fmt::Debug for MemoryArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryArchive")
            .field("points", &self.data.read().map(|d| d.len()).ok())
            .field("max_records", &self.max_records)
            .finish()
    }
}

// ==================== Write Queue ====================

/// A pending archive write
#[derive(Debug, Clone)]
pub struct ArchiveWrite {
    pub point: String,
    pub sample: Sample,
}

/// Channel of pending writes between the firing threads and the archive
pub struct ArchiveQueue {
    tx: Sender<ArchiveWrite>,
    rx: Receiver<ArchiveWrite>,
}

impl ArchiveQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Enqueue a write. Never blocks.
    pub fn push(&self, point: &str, sample: &Sample) {
        let write = ArchiveWrite {
            point: point.to_string(),
            sample: sample.clone(),
        };
        if self.tx.send(write).is_err() {
            tracing::warn!("({}) Archive queue closed, sample dropped", point);
        }
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Write everything queued so far on the calling thread
    pub fn drain(&self, archive: Option<&dyn Archive>) -> usize {
        let mut written = 0;
        while let Ok(write) = self.rx.try_recv() {
            if let Some(archive) = archive {
                store(archive, &write);
            }
            written += 1;
        }
        written
    }

    /// Start a thread that writes queued samples until `running` clears
    pub fn spawn_writer(
        &self,
        archive: SharedArchive,
        running: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        let rx = self.rx.clone();
        std::thread::Builder::new()
            .name("telemon-archive".to_string())
            .spawn(move || {
                tracing::info!("Archive writer started");
                while running.load(Ordering::SeqCst) {
                    match rx.recv_timeout(Duration::from_millis(100)) {
                        Ok(write) => store(archive.as_ref(), &write),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                // Flush what is left
                while let Ok(write) = rx.try_recv() {
                    store(archive.as_ref(), &write);
                }
                tracing::info!("Archive writer stopped");
            })
    }
}

fn store(archive: &dyn Archive, write: &ArchiveWrite) {
    if let Err(e) = archive.archive_data(&write.point, &write.sample) {
        tracing::warn!("({}) Archive write failed: {}", write.point, e);
    }
}

impl Default for ArchiveQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ArchiveQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveQueue")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::timestamp_from_secs;

    fn fill(archive: &MemoryArchive, point: &str, secs: &[i64]) {
        for t in secs {
            archive
                .archive_data(point, &Sample::new(point, timestamp_from_secs(*t), *t as f64))
                .unwrap();
        }
    }

    #[test]
    fn test_extract_range_inclusive() {
        let archive = MemoryArchive::new(100);
        fill(&archive, "a.b", &[0, 10, 20, 30]);

        let ex = archive
            .extract("a.b", timestamp_from_secs(10), timestamp_from_secs(20))
            .unwrap();
        assert_eq!(ex.samples.len(), 2);
        assert!(!ex.clipped);
    }

    #[test]
    fn test_extract_clips() {
        let archive = MemoryArchive::new(2);
        fill(&archive, "a.b", &[0, 1, 2, 3]);

        let ex = archive
            .extract("a.b", timestamp_from_secs(0), timestamp_from_secs(3))
            .unwrap();
        assert_eq!(ex.samples.len(), 2);
        assert!(ex.clipped);
        assert_eq!(ex.samples[0].timestamp(), timestamp_from_secs(0));
    }

    #[test]
    fn test_out_of_order_insert_stays_sorted() {
        let archive = MemoryArchive::new(100);
        fill(&archive, "a.b", &[10, 0, 5]);
        let ex = archive
            .extract("a.b", timestamp_from_secs(0), timestamp_from_secs(10))
            .unwrap();
        let ts: Vec<_> = ex.samples.iter().map(|s| s.timestamp()).collect();
        let mut sorted = ts.clone();
        sorted.sort();
        assert_eq!(ts, sorted);
    }

    #[test]
    fn test_preceding_and_following() {
        let archive = MemoryArchive::new(100);
        fill(&archive, "a.b", &[0, 10, 20]);

        let p = archive.preceding("a.b", timestamp_from_secs(15)).unwrap().unwrap();
        assert_eq!(p.timestamp(), timestamp_from_secs(10));
        let f = archive.following("a.b", timestamp_from_secs(15)).unwrap().unwrap();
        assert_eq!(f.timestamp(), timestamp_from_secs(20));
        assert!(archive.following("a.b", timestamp_from_secs(21)).unwrap().is_none());
        assert!(archive.preceding("x.y", timestamp_from_secs(21)).unwrap().is_none());
    }

    #[test]
    fn test_purge_older_than() {
        let archive = MemoryArchive::new(100);
        fill(&archive, "a.b", &[0, 10, 20]);
        assert_eq!(archive.purge_older_than("a.b", timestamp_from_secs(10)), 1);
        assert_eq!(archive.len("a.b"), 2);
    }

    #[test]
    fn test_queue_drain_writes() {
        let archive = MemoryArchive::new(100);
        let queue = ArchiveQueue::new();
        queue.push("a.b", &Sample::new("a.b", timestamp_from_secs(1), 1.0));
        queue.push("a.b", &Sample::new("a.b", timestamp_from_secs(2), 2.0));
        assert_eq!(queue.pending(), 2);

        assert_eq!(queue.drain(Some(&archive)), 2);
        assert_eq!(archive.len("a.b"), 2);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_queue_write_failure_is_logged_not_fatal() {
        let mut mock = MockArchive::new();
        mock.expect_archive_data()
            .times(1)
            .returning(|_, _| Err(EngineError::Archive("disk full".into())));

        let queue = ArchiveQueue::new();
        queue.push("a.b", &Sample::new("a.b", timestamp_from_secs(1), 1.0));
        assert_eq!(queue.drain(Some(&mock)), 1);
    }
}
