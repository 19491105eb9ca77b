//! Alarm registry
//!
//! One [`AlarmRecord`] per point, created lazily the first time the point
//! reports, is acknowledged or is shelved, and never removed. `alarming`
//! always mirrors the alarm flag of the latest sample; acknowledgement is
//! cleared automatically when the alarm goes away.
//!
//! All mutation happens under a single registry-wide lock. Listeners are
//! notified after the lock is released, so a listener may query the
//! registry again.
//!
//! # Status
//!
//! The status is derived with precedence
//! acknowledged > shelved > alarming > not alarmed, see [`AlarmStatus`].

pub mod check;

use crate::types::{Sample, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

pub use check::AlarmCheck;

/// Derived alarm state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmStatus {
    NotAlarmed = 0,
    Acknowledged = 1,
    Shelved = 2,
    Alarming = 3,
}

impl AlarmStatus {
    /// Integer code used on the wire by alarm clients
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl std::fmt::Display for AlarmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlarmStatus::NotAlarmed => "NOT_ALARMED",
            AlarmStatus::Acknowledged => "ACKNOWLEDGED",
            AlarmStatus::Shelved => "SHELVED",
            AlarmStatus::Alarming => "ALARMING",
        };
        write!(f, "{}", s)
    }
}

/// The point-side facts an alarm record needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmSubject {
    /// Full point name
    pub point: String,
    pub priority: i32,
    /// Guidance template, `$V` and `$U` are substituted
    pub guidance: String,
    pub units: String,
    /// Notification groups told about changes
    pub notifications: Vec<String>,
}

impl AlarmSubject {
    pub fn new(point: impl Into<String>) -> Self {
        Self {
            point: point.into(),
            priority: 0,
            guidance: String::new(),
            units: String::new(),
            notifications: Vec::new(),
        }
    }
}

/// Alarm state of one point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRecord {
    pub point: String,
    pub last_sample: Option<Sample>,
    pub alarming: bool,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<Timestamp>,
    pub shelved: bool,
    pub shelved_by: Option<String>,
    pub shelved_at: Option<Timestamp>,
    pub priority: i32,
    /// Guidance with substitutions applied for the latest sample
    pub guidance: String,
    /// Notification groups of the point, for listeners that deliver messages
    pub notifications: Vec<String>,
}

impl AlarmRecord {
    fn new(subject: &AlarmSubject) -> Self {
        Self {
            point: subject.point.clone(),
            last_sample: None,
            alarming: false,
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            shelved: false,
            shelved_by: None,
            shelved_at: None,
            priority: subject.priority,
            guidance: subject.guidance.clone(),
            notifications: subject.notifications.clone(),
        }
    }

    pub fn status(&self) -> AlarmStatus {
        if self.acknowledged {
            AlarmStatus::Acknowledged
        } else if self.shelved {
            AlarmStatus::Shelved
        } else if self.alarming {
            AlarmStatus::Alarming
        } else {
            AlarmStatus::NotAlarmed
        }
    }

    fn update(&mut self, subject: &AlarmSubject, sample: &Sample) {
        self.priority = subject.priority;
        self.notifications.clone_from(&subject.notifications);
        self.alarming = sample.alarm();
        self.guidance = guidance_text(subject, sample);
        self.last_sample = Some(sample.clone());
        if !self.alarming && self.acknowledged {
            self.acknowledged = false;
            self.acknowledged_by = None;
            self.acknowledged_at = None;
        }
    }
}

/// Expand `$V` (current value) and `$U` (units) in guidance text
pub fn guidance_text(subject: &AlarmSubject, sample: &Sample) -> String {
    if subject.guidance.is_empty() {
        return String::new();
    }
    let value = sample
        .value()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "null".to_string());
    subject
        .guidance
        .replace("$V", &value)
        .replace("$U", &subject.units)
}

/// A change to one alarm record
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmEvent {
    /// Snapshot of the record after the change
    pub alarm: AlarmRecord,
}

impl AlarmEvent {
    pub fn point(&self) -> &str {
        &self.alarm.point
    }

    pub fn status(&self) -> AlarmStatus {
        self.alarm.status()
    }
}

/// Receives alarm changes
pub trait AlarmEventListener: Send + Sync {
    fn on_alarm_event(&self, event: &AlarmEvent);

    /// Several changes made together. Defaults to one call per event.
    fn on_alarm_events(&self, events: &[AlarmEvent]) {
        for event in events {
            self.on_alarm_event(event);
        }
    }
}

/// Registry of alarm records for every tracked point
#[derive(Default)]
pub struct AlarmRegistry {
    records: Mutex<HashMap<String, AlarmRecord>>,
    listeners: RwLock<Vec<Arc<dyn AlarmEventListener>>>,
}

impl AlarmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn AlarmEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Record a new sample for a point
    pub fn set_alarm(&self, subject: &AlarmSubject, sample: &Sample) {
        if let Some(event) = self.apply(subject, sample) {
            for listener in self.listener_snapshot() {
                listener.on_alarm_event(&event);
            }
        }
    }

    /// Record samples for several points and notify once with the batch
    pub fn set_alarms_batch(&self, updates: &[(AlarmSubject, Sample)]) {
        let events: Vec<AlarmEvent> = updates
            .iter()
            .filter_map(|(subject, sample)| self.apply(subject, sample))
            .collect();
        if events.is_empty() {
            return;
        }
        for listener in self.listener_snapshot() {
            listener.on_alarm_events(&events);
        }
    }

    /// Acknowledge (or un-acknowledge) a point's alarm
    pub fn set_acknowledged(
        &self,
        subject: &AlarmSubject,
        acknowledged: bool,
        by: &str,
        at: Timestamp,
    ) {
        let event = self.modify(subject, |record| {
            record.acknowledged = acknowledged;
            record.acknowledged_by = Some(by.to_string());
            record.acknowledged_at = Some(at);
        });
        tracing::info!(
            "({}) Alarm acknowledged={} by {}",
            subject.point,
            acknowledged,
            by
        );
        for listener in self.listener_snapshot() {
            listener.on_alarm_event(&event);
        }
    }

    /// Shelve (or un-shelve) a point's alarm
    pub fn set_shelved(&self, subject: &AlarmSubject, shelved: bool, by: &str, at: Timestamp) {
        let event = self.modify(subject, |record| {
            record.shelved = shelved;
            record.shelved_by = Some(by.to_string());
            record.shelved_at = Some(at);
        });
        tracing::info!("({}) Alarm shelved={} by {}", subject.point, shelved, by);
        for listener in self.listener_snapshot() {
            listener.on_alarm_event(&event);
        }
    }

    /// Records that are alarming or shelved
    pub fn get_alarms(&self) -> Vec<AlarmRecord> {
        let records = self.lock();
        let mut out: Vec<AlarmRecord> = records
            .values()
            .filter(|r| r.alarming || r.shelved)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.point.cmp(&b.point));
        out
    }

    /// Every record
    pub fn get_all_alarms(&self) -> Vec<AlarmRecord> {
        let records = self.lock();
        let mut out: Vec<AlarmRecord> = records.values().cloned().collect();
        out.sort_by(|a, b| a.point.cmp(&b.point));
        out
    }

    pub fn get(&self, point: &str) -> Option<AlarmRecord> {
        self.lock().get(point).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Update under the lock; returns an event when the status or flag changed
    fn apply(&self, subject: &AlarmSubject, sample: &Sample) -> Option<AlarmEvent> {
        let mut records = self.lock();
        let existed = records.contains_key(&subject.point);
        let record = records
            .entry(subject.point.clone())
            .or_insert_with(|| AlarmRecord::new(subject));
        let before = existed.then(|| (record.status(), record.alarming));
        record.update(subject, sample);

        let after = (record.status(), record.alarming);
        let changed = match before {
            Some(before) => before != after,
            None => record.alarming,
        };
        if changed {
            tracing::debug!("({}) Alarm status now {}", record.point, record.status());
            Some(AlarmEvent {
                alarm: record.clone(),
            })
        } else {
            None
        }
    }

    fn modify<F>(&self, subject: &AlarmSubject, f: F) -> AlarmEvent
    where
        F: FnOnce(&mut AlarmRecord),
    {
        let mut records = self.lock();
        let record = records
            .entry(subject.point.clone())
            .or_insert_with(|| AlarmRecord::new(subject));
        f(record);
        AlarmEvent {
            alarm: record.clone(),
        }
    }

    fn listener_snapshot(&self) -> Vec<Arc<dyn AlarmEventListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AlarmRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for AlarmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmRegistry")
            .field("records", &self.len())
            .finish()
    }
}
