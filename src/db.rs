//! SQLite-слой: история нарушений, реестр наблюдений и отключённые пользователи.

use crate::monitoring::{MonitoringWarning, WarningStore};
use crate::punishment::{NewViolation, ViolationRecord, ViolationRow, ViolationStore};
use async_trait::async_trait;
use sqlx::FromRow;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct DisabledUser {
    pub username: String,
    pub disabled_at: i64,
    /// `None` означает бессрочное отключение.
    pub enable_at: Option<i64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
struct WarningRow {
    username: String,
    created_at: i64,
    monitoring_duration: i64,
    ip_count: i64,
    snapshots: String,
}

pub struct Db {
    pool: SqlitePool,
}

pub fn current_unix_timestamp() -> Result<i64, anyhow::Error> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .map_err(|err| anyhow::anyhow!("Системное время меньше UNIX_EPOCH: {}", err))
}

impl Db {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("Не удалось создать директорию для БД: {}", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(opts)
            .await
            .map_err(|e| anyhow::anyhow!("Не удалось подключиться к SQLite: {}", e))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// База в памяти живёт, пока жив единственный коннект пула.
    pub async fn open_in_memory() -> Result<Self, anyhow::Error> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS violation_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                step_applied INTEGER NOT NULL,
                disable_duration INTEGER NOT NULL,
                ip_count INTEGER,
                ips TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_violations_user_ts ON violation_history(username, timestamp);
            CREATE INDEX IF NOT EXISTS idx_violations_ts ON violation_history(timestamp);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Миграция violation_history: {}", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS monitoring_warnings (
                username TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                monitoring_duration INTEGER NOT NULL,
                ip_count INTEGER NOT NULL,
                snapshots TEXT NOT NULL DEFAULT '[]'
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Миграция monitoring_warnings: {}", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS disabled_users (
                username TEXT PRIMARY KEY,
                disabled_at INTEGER NOT NULL,
                enable_at INTEGER,
                reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_disabled_enable_at ON disabled_users(enable_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Миграция disabled_users: {}", e))?;

        Ok(())
    }

    /// Создаёт или обновляет запись об отключении.
    pub async fn add_disabled_user(
        &self,
        username: &str,
        disabled_at: i64,
        enable_at: Option<i64>,
        reason: Option<&str>,
    ) -> Result<(), anyhow::Error> {
        sqlx::query(
            "INSERT INTO disabled_users (username, disabled_at, enable_at, reason)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(username) DO UPDATE SET
                 disabled_at = excluded.disabled_at,
                 enable_at = excluded.enable_at,
                 reason = excluded.reason",
        )
        .bind(username)
        .bind(disabled_at)
        .bind(enable_at)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        tracing::info!(
            username = %username,
            enable_at = ?enable_at,
            "User added to disabled list"
        );
        Ok(())
    }

    pub async fn remove_disabled_user(&self, username: &str) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM disabled_users WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_disabled_user(
        &self,
        username: &str,
    ) -> Result<Option<DisabledUser>, anyhow::Error> {
        let row = sqlx::query_as::<_, DisabledUser>(
            "SELECT username, disabled_at, enable_at, reason FROM disabled_users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_disabled_users(&self) -> Result<Vec<DisabledUser>, anyhow::Error> {
        let rows = sqlx::query_as::<_, DisabledUser>(
            "SELECT username, disabled_at, enable_at, reason
             FROM disabled_users
             ORDER BY disabled_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Пользователи с истёкшим временным отключением.
    pub async fn users_to_enable(&self, now: i64) -> Result<Vec<String>, anyhow::Error> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT username FROM disabled_users
             WHERE enable_at IS NOT NULL AND enable_at <= ?
             ORDER BY enable_at ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl ViolationStore for Db {
    async fn add(
        &self,
        violation: &NewViolation,
        now: i64,
    ) -> Result<ViolationRecord, anyhow::Error> {
        let ips_json = violation
            .ips
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = sqlx::query(
            "INSERT INTO violation_history (username, timestamp, step_applied, disable_duration, ip_count, ips)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&violation.username)
        .bind(now)
        .bind(violation.step_applied)
        .bind(violation.disable_duration)
        .bind(violation.ip_count)
        .bind(ips_json)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Не удалось записать нарушение: {}", e))?;

        Ok(ViolationRecord {
            id: result.last_insert_rowid(),
            username: violation.username.clone(),
            timestamp: now,
            step_applied: violation.step_applied,
            disable_duration: violation.disable_duration,
            ip_count: violation.ip_count,
            ips: violation.ips.clone(),
        })
    }

    async fn user_violations(
        &self,
        username: &str,
        since: i64,
    ) -> Result<Vec<ViolationRecord>, anyhow::Error> {
        let rows = sqlx::query_as::<_, ViolationRow>(
            "SELECT id, username, timestamp, step_applied, disable_duration, ip_count, ips
             FROM violation_history
             WHERE username = ? AND timestamp >= ?
             ORDER BY timestamp DESC, id DESC",
        )
        .bind(username)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ViolationRecord::from).collect())
    }

    async fn violation_count(&self, username: &str, since: i64) -> Result<i64, anyhow::Error> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM violation_history WHERE username = ? AND timestamp >= ?",
        )
        .bind(username)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn clear_user(&self, username: &str) -> Result<u64, anyhow::Error> {
        let result = sqlx::query("DELETE FROM violation_history WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn clear_all(&self) -> Result<u64, anyhow::Error> {
        let result = sqlx::query("DELETE FROM violation_history")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn cleanup_older_than(&self, cutoff: i64) -> Result<u64, anyhow::Error> {
        let result = sqlx::query("DELETE FROM violation_history WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl WarningStore for Db {
    async fn load_warnings(&self) -> Result<Vec<MonitoringWarning>, anyhow::Error> {
        let rows = sqlx::query_as::<_, WarningRow>(
            "SELECT username, created_at, monitoring_duration, ip_count, snapshots FROM monitoring_warnings",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut warnings = Vec::with_capacity(rows.len());
        for row in rows {
            let snapshots = match serde_json::from_str(&row.snapshots) {
                Ok(snapshots) => snapshots,
                Err(error) => {
                    tracing::warn!(
                        username = %row.username,
                        error = %error,
                        "Stored monitoring snapshots are malformed, starting empty"
                    );
                    Vec::new()
                }
            };
            warnings.push(MonitoringWarning {
                username: row.username,
                created_at: row.created_at,
                monitoring_duration: row.monitoring_duration,
                ip_count: usize::try_from(row.ip_count).unwrap_or(0),
                snapshots,
            });
        }
        Ok(warnings)
    }

    async fn save_warnings(&self, warnings: &[MonitoringWarning]) -> Result<(), anyhow::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM monitoring_warnings")
            .execute(&mut *tx)
            .await?;
        for warning in warnings {
            let snapshots = serde_json::to_string(&warning.snapshots)?;
            sqlx::query(
                "INSERT INTO monitoring_warnings (username, created_at, monitoring_duration, ip_count, snapshots)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&warning.username)
            .bind(warning.created_at)
            .bind(warning.monitoring_duration)
            .bind(warning.ip_count as i64)
            .bind(snapshots)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit()
            .await
            .map_err(|e| anyhow::anyhow!("Не удалось сохранить наблюдения: {}", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    const T0: i64 = 1_700_000_000;

    fn violation(username: &str, step: i64) -> NewViolation {
        NewViolation {
            username: username.to_string(),
            step_applied: step,
            disable_duration: 15,
            ip_count: Some(2),
            ips: Some(vec!["1.1.1.1".to_string(), "2.2.2.2".to_string()]),
        }
    }

    #[tokio::test]
    async fn violations_are_windowed_and_newest_first() {
        let db = Db::open_in_memory().await.unwrap();
        db.add(&violation("alice", 0), T0).await.unwrap();
        db.add(&violation("alice", 1), T0 + 100).await.unwrap();
        db.add(&violation("bob", 0), T0 + 100).await.unwrap();

        let all = db.user_violations("alice", T0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].step_applied, 1);
        assert_eq!(all[0].ips.as_ref().map(Vec::len), Some(2));

        assert_eq!(db.violation_count("alice", T0).await.unwrap(), 2);
        assert_eq!(db.violation_count("alice", T0 + 1).await.unwrap(), 1);
        assert_eq!(db.violation_count("nobody", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clear_and_cleanup() {
        let db = Db::open_in_memory().await.unwrap();
        db.add(&violation("alice", 0), T0).await.unwrap();
        db.add(&violation("alice", 1), T0 + 10).await.unwrap();
        db.add(&violation("bob", 0), T0 + 10).await.unwrap();

        assert_eq!(db.cleanup_older_than(T0 + 5).await.unwrap(), 1);
        assert_eq!(db.clear_user("alice").await.unwrap(), 1);
        assert_eq!(db.violation_count("alice", 0).await.unwrap(), 0);
        assert_eq!(db.clear_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn violation_without_ips_round_trips_as_none() {
        let db = Db::open_in_memory().await.unwrap();
        let mut record = violation("carol", 0);
        record.ips = None;
        record.ip_count = None;
        db.add(&record, T0).await.unwrap();
        let stored = db.user_violations("carol", 0).await.unwrap();
        assert_eq!(stored[0].ips, None);
        assert_eq!(stored[0].ip_count, None);
    }

    #[tokio::test]
    async fn warnings_are_replaced_on_save() {
        let db = Db::open_in_memory().await.unwrap();
        let mut warning = MonitoringWarning::new("alice", 3, 240, T0);
        let ips: BTreeSet<String> = ["1.1.1.1".to_string()].into_iter().collect();
        warning.record_snapshot(&ips, T0 + 60);

        db.save_warnings(&[warning.clone(), MonitoringWarning::new("bob", 2, 240, T0)])
            .await
            .unwrap();
        db.save_warnings(std::slice::from_ref(&warning)).await.unwrap();

        let loaded = db.load_warnings().await.unwrap();
        assert_eq!(loaded, vec![warning]);
    }

    #[tokio::test]
    async fn disabled_users_due_for_enable() {
        let db = Db::open_in_memory().await.unwrap();
        db.add_disabled_user("temp", T0, Some(T0 + 900), Some("limit"))
            .await
            .unwrap();
        db.add_disabled_user("perm", T0, None, None)
            .await
            .unwrap();

        assert!(db.users_to_enable(T0 + 899).await.unwrap().is_empty());
        assert_eq!(db.users_to_enable(T0 + 900).await.unwrap(), vec!["temp".to_string()]);
        assert_eq!(db.list_disabled_users().await.unwrap().len(), 2);

        db.add_disabled_user("temp", T0 + 10, Some(T0 + 3600), Some("repeat"))
            .await
            .unwrap();
        let updated = db.get_disabled_user("temp").await.unwrap().unwrap();
        assert_eq!(updated.enable_at, Some(T0 + 3600));
        assert_eq!(updated.reason.as_deref(), Some("repeat"));

        assert!(db.remove_disabled_user("temp").await.unwrap());
        assert!(!db.remove_disabled_user("temp").await.unwrap());
    }
}
