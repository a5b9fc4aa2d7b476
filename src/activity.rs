//! The activity tracker (C3): per-app last-touched timestamps and the
//! network-I/O baseline used to tell genuine inactivity from a quiet-looking
//! dev server that is still serving a long-lived websocket.

use crate::engine::NetIo;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct Baseline {
    net_io: NetIo,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    last_activity_at: DateTime<Utc>,
    baseline: Option<Baseline>,
}

pub struct ActivityTracker {
    threshold_bytes: u64,
    records: Mutex<HashMap<String, Record>>,
    /// Test-only override for the "first sample after bootstrap" rule: when
    /// set, `record_sample` always treats the first sample for an app as
    /// activity regardless of delta, matching a freshly (re)discovered
    /// container whose baseline we have not established yet.
    force_first_sample_active: bool,
}

impl ActivityTracker {
    pub fn new(threshold_bytes: u64) -> Self {
        Self {
            threshold_bytes,
            records: Mutex::new(HashMap::new()),
            force_first_sample_active: true,
        }
    }

    #[cfg(test)]
    pub fn with_first_sample_override(threshold_bytes: u64, force_first_sample_active: bool) -> Self {
        Self {
            threshold_bytes,
            records: Mutex::new(HashMap::new()),
            force_first_sample_active,
        }
    }

    /// Record an explicit caller touch (getOrStart, status, logs, exec):
    /// always counts as activity, independent of any net-I/O sample.
    pub fn touch(&self, app_id: &str) {
        let mut records = self.records.lock();
        let now = Utc::now();
        let record = records.entry(app_id.to_string()).or_insert(Record { last_activity_at: now, baseline: None });
        record.last_activity_at = now;
    }

    /// Seed or overwrite an app's last-activity timestamp directly, used by
    /// the reconciler's bootstrap walk.
    pub fn set_last_activity(&self, app_id: &str, at: DateTime<Utc>) {
        let mut records = self.records.lock();
        let record = records.entry(app_id.to_string()).or_insert(Record { last_activity_at: at, baseline: None });
        record.last_activity_at = at;
    }

    /// Drop all tracked state for an app, called on `remove`.
    pub fn clear(&self, app_id: &str) {
        self.records.lock().remove(app_id);
    }

    pub fn last_activity_at(&self, app_id: &str) -> Option<DateTime<Utc>> {
        self.records.lock().get(app_id).map(|r| r.last_activity_at)
    }

    /// Feed a fresh `stats()` sample. If the net-I/O delta versus the stored
    /// baseline exceeds the configured threshold in either direction, this
    /// counts as activity and `last_activity_at` is refreshed. Returns
    /// whether the sample counted as activity.
    ///
    /// The very first sample for an app has no baseline to diff against; per
    /// the pessimistic bootstrap rule it counts as activity rather than risk
    /// reaping a container we have not observed long enough to judge.
    pub fn record_sample(&self, app_id: &str, net_io: NetIo) -> bool {
        let now = Utc::now();
        let mut records = self.records.lock();
        let record = records.entry(app_id.to_string()).or_insert(Record { last_activity_at: now, baseline: None });

        let Some(baseline) = record.baseline else {
            record.baseline = Some(Baseline { net_io });
            if self.force_first_sample_active {
                record.last_activity_at = now;
            }
            return self.force_first_sample_active;
        };

        let rx_delta = net_io.rx_bytes.saturating_sub(baseline.net_io.rx_bytes);
        let tx_delta = net_io.tx_bytes.saturating_sub(baseline.net_io.tx_bytes);
        let active = rx_delta >= self.threshold_bytes || tx_delta >= self.threshold_bytes;

        record.baseline = Some(Baseline { net_io });
        if active {
            record.last_activity_at = now;
        }
        active
    }

    /// Whether `app_id` has been idle for at least `idle_timeout`. Unknown
    /// apps are never idle (nothing to reap).
    pub fn is_idle(&self, app_id: &str, idle_timeout: Duration) -> bool {
        let Ok(idle_timeout) = chrono::Duration::from_std(idle_timeout) else {
            return false;
        };
        match self.records.lock().get(app_id) {
            Some(record) => Utc::now().signed_duration_since(record.last_activity_at) >= idle_timeout,
            None => false,
        }
    }
}
