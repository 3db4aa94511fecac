//! Наблюдение за пользователем после предупреждения.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_MONITORING_SECS: i64 = 240;
pub const DEFAULT_CONSISTENT_ACTIVITY_SECS: i64 = 240;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpSnapshot {
    pub timestamp: i64,
    pub ip_count: usize,
    pub ips: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringWarning {
    pub username: String,
    pub created_at: i64,
    /// Секунды, после которых наблюдение считается завершённым.
    pub monitoring_duration: i64,
    pub ip_count: usize,
    #[serde(default)]
    pub snapshots: Vec<IpSnapshot>,
}

impl MonitoringWarning {
    pub fn new(
        username: impl Into<String>,
        ip_count: usize,
        monitoring_duration: i64,
        now: i64,
    ) -> Self {
        Self {
            username: username.into(),
            created_at: now,
            monitoring_duration,
            ip_count,
            snapshots: Vec::new(),
        }
    }

    /// Истечение вычисляется, а не хранится.
    pub fn is_monitoring_active_at(&self, now: i64) -> bool {
        now - self.created_at < self.monitoring_duration
    }

    pub fn time_remaining_at(&self, now: i64) -> i64 {
        (self.created_at + self.monitoring_duration - now).max(0)
    }

    pub fn record_snapshot(&mut self, ips: &BTreeSet<String>, now: i64) {
        self.ip_count = ips.len();
        self.snapshots.push(IpSnapshot {
            timestamp: now,
            ip_count: ips.len(),
            ips: ips.clone(),
        });
    }

    pub fn analyze(&self, consistent_activity_secs: i64) -> ActivityAnalysis {
        ActivityAnalysis::from_snapshots(&self.snapshots, consistent_activity_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActivityAnalysis {
    pub total_snapshots: usize,
    pub peak_ip_count: usize,
    pub average_ip_count: f64,
    /// Доля соседних снимков, у которых набор IP различается.
    pub ip_change_frequency: f64,
    pub consistently_active_ips: BTreeSet<String>,
}

impl ActivityAnalysis {
    pub fn from_snapshots(snapshots: &[IpSnapshot], consistent_activity_secs: i64) -> Self {
        if snapshots.is_empty() {
            return Self::default();
        }

        let total_snapshots = snapshots.len();
        let peak_ip_count = snapshots.iter().map(|s| s.ip_count).max().unwrap_or(0);
        let sum: usize = snapshots.iter().map(|s| s.ip_count).sum();
        let average_ip_count = sum as f64 / total_snapshots as f64;

        let transitions = total_snapshots - 1;
        let ip_change_frequency = if transitions == 0 {
            0.0
        } else {
            let changes = snapshots
                .windows(2)
                .filter(|pair| pair[0].ips != pair[1].ips)
                .count();
            changes as f64 / transitions as f64
        };

        // ip -> (первое появление, последнее появление)
        let mut seen: BTreeMap<&str, (i64, i64)> = BTreeMap::new();
        for snapshot in snapshots {
            for ip in &snapshot.ips {
                seen.entry(ip.as_str())
                    .and_modify(|(first, last)| {
                        *first = (*first).min(snapshot.timestamp);
                        *last = (*last).max(snapshot.timestamp);
                    })
                    .or_insert((snapshot.timestamp, snapshot.timestamp));
            }
        }
        let consistently_active_ips = seen
            .into_iter()
            .filter(|(_, (first, last))| last - first >= consistent_activity_secs)
            .map(|(ip, _)| ip.to_string())
            .collect();

        Self {
            total_snapshots,
            peak_ip_count,
            average_ip_count,
            ip_change_frequency,
            consistently_active_ips,
        }
    }
}
