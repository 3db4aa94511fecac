//! Наблюдение за пользователями после предупреждения и анализ активности IP.

mod system;
mod warning;

pub use system::{
    ActiveMonitoring, MonitoringSettings, MonitoringStatus, WarningStore, WarningSystem,
};
pub use warning::{
    ActivityAnalysis, DEFAULT_CONSISTENT_ACTIVITY_SECS, DEFAULT_MONITORING_SECS, MonitoringWarning,
};
