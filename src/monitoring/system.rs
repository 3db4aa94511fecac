//! Реестр активных наблюдений с сохранением после каждого изменения.

use super::warning::{ActivityAnalysis, MonitoringWarning};
use crate::db::current_unix_timestamp;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Порт долговременного хранения реестра.
#[async_trait]
pub trait WarningStore: Send + Sync {
    async fn load_warnings(&self) -> Result<Vec<MonitoringWarning>, anyhow::Error>;

    /// Полностью заменяет сохранённое состояние переданным.
    async fn save_warnings(&self, warnings: &[MonitoringWarning]) -> Result<(), anyhow::Error>;
}

#[derive(Debug, Clone, Copy)]
pub struct MonitoringSettings {
    pub monitoring_duration_secs: i64,
    pub consistent_activity_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMonitoring {
    pub username: String,
    pub ip_count: usize,
    pub remaining_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MonitoringStatus {
    pub active: Vec<ActiveMonitoring>,
    pub expired: Vec<String>,
}

pub struct WarningSystem {
    store: Arc<dyn WarningStore>,
    settings: MonitoringSettings,
    warnings: RwLock<HashMap<String, MonitoringWarning>>,
}

impl WarningSystem {
    pub fn new(store: Arc<dyn WarningStore>, settings: MonitoringSettings) -> Self {
        Self {
            store,
            settings,
            warnings: RwLock::new(HashMap::new()),
        }
    }

    pub async fn load_warnings(&self) -> Result<usize, anyhow::Error> {
        let now = current_unix_timestamp()?;
        self.load_warnings_at(now).await
    }

    /// Загружает сохранённый реестр, отбрасывая уже истёкшие наблюдения.
    pub async fn load_warnings_at(&self, now: i64) -> Result<usize, anyhow::Error> {
        let stored = self.store.load_warnings().await?;
        let total = stored.len();
        let mut warnings = self.warnings.write().await;
        warnings.clear();
        for warning in stored {
            if warning.is_monitoring_active_at(now) {
                warnings.insert(warning.username.clone(), warning);
            }
        }
        let loaded = warnings.len();
        if loaded != total {
            Self::persist(&*self.store, &warnings).await?;
        }
        tracing::info!(
            loaded = loaded,
            discarded = total - loaded,
            "Monitoring warnings loaded"
        );
        Ok(loaded)
    }

    pub async fn save_warnings(&self) -> Result<(), anyhow::Error> {
        let warnings = self.warnings.read().await;
        Self::persist(&*self.store, &warnings).await
    }

    async fn persist(
        store: &dyn WarningStore,
        warnings: &HashMap<String, MonitoringWarning>,
    ) -> Result<(), anyhow::Error> {
        let mut list: Vec<MonitoringWarning> = warnings.values().cloned().collect();
        list.sort_by(|a, b| a.username.cmp(&b.username));
        store.save_warnings(&list).await
    }

    /// Повторное предупреждение сбрасывает таймер и снимки.
    pub async fn add_user_at(
        &self,
        username: &str,
        ip_count: usize,
        now: i64,
    ) -> Result<(), anyhow::Error> {
        let mut warnings = self.warnings.write().await;
        let warning = MonitoringWarning::new(
            username,
            ip_count,
            self.settings.monitoring_duration_secs,
            now,
        );
        let replaced = warnings.insert(username.to_string(), warning).is_some();
        Self::persist(&*self.store, &warnings).await?;
        tracing::info!(
            username = %username,
            ip_count = ip_count,
            replaced = replaced,
            duration_secs = self.settings.monitoring_duration_secs,
            "Monitoring started"
        );
        Ok(())
    }

    /// Возвращает false, если пользователь не под активным наблюдением.
    pub async fn record_snapshot_at(
        &self,
        username: &str,
        ips: &BTreeSet<String>,
        now: i64,
    ) -> Result<bool, anyhow::Error> {
        let mut warnings = self.warnings.write().await;
        let Some(warning) = warnings.get_mut(username) else {
            return Ok(false);
        };
        if !warning.is_monitoring_active_at(now) {
            return Ok(false);
        }
        warning.record_snapshot(ips, now);
        Self::persist(&*self.store, &warnings).await?;
        tracing::debug!(username = %username, ip_count = ips.len(), "Monitoring snapshot recorded");
        Ok(true)
    }

    /// Все наблюдения, включая ожидающие разбора, по имени.
    pub async fn warnings(&self) -> Vec<MonitoringWarning> {
        let mut list: Vec<MonitoringWarning> = self.warnings.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.username.cmp(&b.username));
        list
    }

    pub async fn get(&self, username: &str) -> Option<MonitoringWarning> {
        self.warnings.read().await.get(username).cloned()
    }

    pub async fn is_monitoring_at(&self, username: &str, now: i64) -> bool {
        self.warnings
            .read()
            .await
            .get(username)
            .is_some_and(|w| w.is_monitoring_active_at(now))
    }

    pub async fn active_usernames_at(&self, now: i64) -> Vec<String> {
        let mut names: Vec<String> = self
            .warnings
            .read()
            .await
            .values()
            .filter(|w| w.is_monitoring_active_at(now))
            .map(|w| w.username.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn expired_warnings_at(&self, now: i64) -> Vec<MonitoringWarning> {
        let mut expired: Vec<MonitoringWarning> = self
            .warnings
            .read()
            .await
            .values()
            .filter(|w| !w.is_monitoring_active_at(now))
            .cloned()
            .collect();
        expired.sort_by(|a, b| a.username.cmp(&b.username));
        expired
    }

    /// Дописывает финальный снимок, разбирает и снимает наблюдение.
    /// None, если наблюдения уже нет.
    pub async fn finish_at(
        &self,
        username: &str,
        ips: &BTreeSet<String>,
        now: i64,
    ) -> Result<Option<(MonitoringWarning, ActivityAnalysis)>, anyhow::Error> {
        let mut warnings = self.warnings.write().await;
        let Some(mut warning) = warnings.remove(username) else {
            return Ok(None);
        };
        warning.record_snapshot(ips, now);
        let analysis = self.analyze(&warning);
        Self::persist(&*self.store, &warnings).await?;
        tracing::info!(
            username = %username,
            consistent_ips = analysis.consistently_active_ips.len(),
            snapshots = warning.snapshots.len(),
            "Monitoring finished"
        );
        Ok(Some((warning, analysis)))
    }

    pub async fn remove(&self, username: &str) -> Result<bool, anyhow::Error> {
        let mut warnings = self.warnings.write().await;
        let removed = warnings.remove(username).is_some();
        if removed {
            Self::persist(&*self.store, &warnings).await?;
            tracing::info!(username = %username, "Monitoring warning removed");
        }
        Ok(removed)
    }

    pub async fn clear_all(&self) -> Result<usize, anyhow::Error> {
        let mut warnings = self.warnings.write().await;
        let count = warnings.len();
        warnings.clear();
        Self::persist(&*self.store, &warnings).await?;
        tracing::info!(cleared = count, "All monitoring warnings cleared");
        Ok(count)
    }

    /// Неизвестный пользователь даёт пустой анализ.
    pub async fn analyze_user_activity_patterns(&self, username: &str) -> ActivityAnalysis {
        self.warnings
            .read()
            .await
            .get(username)
            .map(|w| self.analyze(w))
            .unwrap_or_default()
    }

    fn analyze(&self, warning: &MonitoringWarning) -> ActivityAnalysis {
        warning.analyze(self.settings.consistent_activity_secs)
    }

    pub async fn monitoring_status(&self) -> Result<MonitoringStatus, anyhow::Error> {
        Ok(self.monitoring_status_at(current_unix_timestamp()?).await)
    }

    pub async fn monitoring_status_at(&self, now: i64) -> MonitoringStatus {
        let warnings = self.warnings.read().await;
        let mut status = MonitoringStatus::default();
        for warning in warnings.values() {
            if warning.is_monitoring_active_at(now) {
                status.active.push(ActiveMonitoring {
                    username: warning.username.clone(),
                    ip_count: warning.ip_count,
                    remaining_secs: warning.time_remaining_at(now),
                });
            } else {
                status.expired.push(warning.username.clone());
            }
        }
        status.active.sort_by(|a, b| a.username.cmp(&b.username));
        status.expired.sort();
        status
    }

    pub async fn len(&self) -> usize {
        self.warnings.read().await.len()
    }
}
