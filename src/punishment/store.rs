//! Порт хранилища истории нарушений.

use async_trait::async_trait;
use sqlx::FromRow;

/// Запись журнала нарушений. Создаётся один раз и больше не меняется.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationRecord {
    pub id: i64,
    pub username: String,
    pub timestamp: i64,
    pub step_applied: i64,
    /// Минуты; 0 означает бессрочно (или предупреждение).
    pub disable_duration: i64,
    pub ip_count: Option<i64>,
    pub ips: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct NewViolation {
    pub username: String,
    pub step_applied: i64,
    pub disable_duration: i64,
    pub ip_count: Option<i64>,
    pub ips: Option<Vec<String>>,
}

/// Строка `violation_history`; `ips` хранится как JSON-текст.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct ViolationRow {
    pub id: i64,
    pub username: String,
    pub timestamp: i64,
    pub step_applied: i64,
    pub disable_duration: i64,
    pub ip_count: Option<i64>,
    pub ips: Option<String>,
}

impl From<ViolationRow> for ViolationRecord {
    fn from(row: ViolationRow) -> Self {
        let ips = row.ips.as_deref().and_then(|raw| {
            serde_json::from_str::<Vec<String>>(raw)
                .map_err(|error| {
                    tracing::warn!(
                        violation_id = row.id,
                        error = %error,
                        "Stored violation has malformed ips column"
                    );
                })
                .ok()
        });
        Self {
            id: row.id,
            username: row.username,
            timestamp: row.timestamp,
            step_applied: row.step_applied,
            disable_duration: row.disable_duration,
            ip_count: row.ip_count,
            ips,
        }
    }
}

/// Все окна задаются границей `since`: учитываются записи с `timestamp >= since`.
#[async_trait]
pub trait ViolationStore: Send + Sync {
    async fn add(&self, violation: &NewViolation, now: i64)
    -> Result<ViolationRecord, anyhow::Error>;

    /// Нарушения пользователя начиная с `since`, новые первыми.
    async fn user_violations(
        &self,
        username: &str,
        since: i64,
    ) -> Result<Vec<ViolationRecord>, anyhow::Error>;

    async fn violation_count(&self, username: &str, since: i64) -> Result<i64, anyhow::Error>;

    async fn clear_user(&self, username: &str) -> Result<u64, anyhow::Error>;

    async fn clear_all(&self) -> Result<u64, anyhow::Error>;

    /// Удаляет записи старше `cutoff`.
    async fn cleanup_older_than(&self, cutoff: i64) -> Result<u64, anyhow::Error>;
}
