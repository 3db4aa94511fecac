//! Движок эскалации: учёт нарушения и выбор следующего шага наказания.

use super::policy::{PolicyError, PunishmentPolicy, PunishmentStep, parse_steps_json};
use super::store::{NewViolation, ViolationStore};
use crate::db::current_unix_timestamp;
use crate::locks::KeyedLocks;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Намерение, которое исполняет вызывающая сторона. Движок панель не трогает.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunishmentAction {
    Warn,
    /// `minutes == 0` означает бессрочное отключение.
    Disable { minutes: u32 },
    /// Система наказаний выключена: шаги не применялись, нарушение не записано.
    Bypass,
}

impl From<PunishmentStep> for PunishmentAction {
    fn from(step: PunishmentStep) -> Self {
        match step {
            PunishmentStep::Warning => Self::Warn,
            PunishmentStep::Disable { minutes } => Self::Disable { minutes },
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Ошибка хранилища нарушений: {0}")]
    Persistence(#[source] anyhow::Error),
    /// Шаг вычислен, но запись не сохранена: действие применять нельзя.
    #[error("Нарушение {username} не сохранено, действие {action:?} отменено: {source}")]
    ViolationNotRecorded {
        username: String,
        action: PunishmentAction,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentViolation {
    pub timestamp: i64,
    pub step: i64,
    pub duration: i64,
    pub time_ago: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStatus {
    pub username: String,
    pub enabled: bool,
    pub violation_count: i64,
    pub window_hours: u32,
    pub recent_violations: Vec<RecentViolation>,
    pub next_punishment: String,
}

pub fn format_time_ago(elapsed_secs: i64) -> String {
    let elapsed = elapsed_secs.max(0);
    if elapsed < 60 {
        format!("{} сек назад", elapsed)
    } else if elapsed < 3600 {
        format!("{} мин назад", elapsed / 60)
    } else if elapsed < 86_400 {
        format!("{} ч назад", elapsed / 3600)
    } else {
        format!("{} д назад", elapsed / 86_400)
    }
}

pub struct PunishmentEngine {
    store: Arc<dyn ViolationStore>,
    policy: RwLock<PunishmentPolicy>,
    locks: KeyedLocks,
}

impl PunishmentEngine {
    pub fn new(store: Arc<dyn ViolationStore>, policy: PunishmentPolicy) -> Self {
        Self {
            store,
            policy: RwLock::new(policy),
            locks: KeyedLocks::default(),
        }
    }

    pub async fn policy(&self) -> PunishmentPolicy {
        self.policy.read().await.clone()
    }

    /// Применяет изменение целиком или не применяет вовсе.
    pub async fn update_policy<F>(&self, change: F) -> Result<PunishmentPolicy, PolicyError>
    where
        F: FnOnce(PunishmentPolicy) -> Result<PunishmentPolicy, PolicyError>,
    {
        let mut guard = self.policy.write().await;
        let updated = change(guard.clone())?;
        *guard = updated.clone();
        tracing::info!(
            enabled = updated.enabled(),
            window_hours = updated.window_hours(),
            steps = updated.steps().len(),
            "Punishment policy updated"
        );
        Ok(updated)
    }

    pub async fn set_enabled(&self, enabled: bool) -> PunishmentPolicy {
        let mut guard = self.policy.write().await;
        *guard = guard.clone().with_enabled(enabled);
        tracing::info!(enabled = enabled, "Punishment system toggled");
        guard.clone()
    }

    /// Инверсия под одной блокировкой записи.
    pub async fn toggle(&self) -> PunishmentPolicy {
        let mut guard = self.policy.write().await;
        let enabled = !guard.enabled();
        *guard = guard.clone().with_enabled(enabled);
        tracing::info!(enabled = enabled, "Punishment system toggled");
        guard.clone()
    }

    pub async fn set_window_hours(&self, hours: i64) -> Result<PunishmentPolicy, PolicyError> {
        self.update_policy(|policy| policy.with_window_hours(hours))
            .await
    }

    pub async fn set_steps_json(&self, json: &str) -> Result<PunishmentPolicy, PolicyError> {
        let steps = parse_steps_json(json)?;
        self.update_policy(|policy| policy.with_steps(steps)).await
    }

    /// Подсчёт, выбор шага и запись выполняются под блокировкой username,
    /// поэтому два параллельных нарушения не видят одинаковый счётчик.
    pub async fn record_violation_at(
        &self,
        username: &str,
        ips: &BTreeSet<String>,
        now: i64,
    ) -> Result<PunishmentAction, EngineError> {
        let _guard = self.locks.lock(username).await;
        let policy = self.policy().await;
        if !policy.enabled() {
            tracing::debug!(username = %username, "Punishment system disabled, bypassing steps");
            return Ok(PunishmentAction::Bypass);
        }

        let since = now - policy.window_secs();
        let count = self
            .store
            .violation_count(username, since)
            .await
            .map_err(EngineError::Persistence)?;
        let step_index = policy.step_index_for_count(count);
        let step = policy.step_for_count(count);
        let action = PunishmentAction::from(step);

        let violation = NewViolation {
            username: username.to_string(),
            step_applied: step_index as i64,
            disable_duration: i64::from(step.duration_minutes()),
            ip_count: Some(ips.len() as i64),
            ips: Some(ips.iter().cloned().collect()),
        };
        if let Err(source) = self.store.add(&violation, now).await {
            tracing::error!(
                username = %username,
                step = step_index,
                error = %source,
                "Failed to persist violation, action withheld"
            );
            return Err(EngineError::ViolationNotRecorded {
                username: username.to_string(),
                action,
                source,
            });
        }

        tracing::info!(
            username = %username,
            previous_violations = count,
            step = step_index,
            action = ?action,
            ip_count = ips.len(),
            "Violation recorded"
        );
        Ok(action)
    }

    pub async fn user_status(&self, username: &str) -> Result<UserStatus, EngineError> {
        let now = current_unix_timestamp().map_err(EngineError::Persistence)?;
        self.user_status_at(username, now).await
    }

    pub async fn user_status_at(&self, username: &str, now: i64) -> Result<UserStatus, EngineError> {
        let policy = self.policy().await;
        let since = now - policy.window_secs();
        let violations = self
            .store
            .user_violations(username, since)
            .await
            .map_err(EngineError::Persistence)?;
        let violation_count = violations.len() as i64;
        let recent_violations = violations
            .iter()
            .map(|v| RecentViolation {
                timestamp: v.timestamp,
                step: v.step_applied,
                duration: v.disable_duration,
                time_ago: format_time_ago(now - v.timestamp),
            })
            .collect();

        Ok(UserStatus {
            username: username.to_string(),
            enabled: policy.enabled(),
            violation_count,
            window_hours: policy.window_hours(),
            recent_violations,
            next_punishment: policy.display_text_for(&policy.step_for_count(violation_count)),
        })
    }

    pub async fn violation_count_at(&self, username: &str, now: i64) -> Result<i64, EngineError> {
        let since = now - self.policy().await.window_secs();
        self.store
            .violation_count(username, since)
            .await
            .map_err(EngineError::Persistence)
    }

    pub async fn clear_user_history(&self, username: &str) -> Result<u64, EngineError> {
        let _guard = self.locks.lock(username).await;
        let removed = self
            .store
            .clear_user(username)
            .await
            .map_err(EngineError::Persistence)?;
        tracing::info!(username = %username, removed = removed, "Violation history cleared");
        Ok(removed)
    }

    pub async fn clear_all_history(&self) -> Result<u64, EngineError> {
        let removed = self
            .store
            .clear_all()
            .await
            .map_err(EngineError::Persistence)?;
        tracing::info!(removed = removed, "All violation history cleared");
        Ok(removed)
    }

    pub async fn cleanup_old_at(&self, days: u32, now: i64) -> Result<u64, EngineError> {
        let cutoff = now - i64::from(days) * 86_400;
        let removed = self
            .store
            .cleanup_older_than(cutoff)
            .await
            .map_err(EngineError::Persistence)?;
        if removed > 0 {
            tracing::info!(removed = removed, days = days, "Old violations cleaned up");
        }
        Ok(removed)
    }
}
