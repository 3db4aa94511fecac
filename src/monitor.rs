//! Фоновый цикл: снимки наблюдений, эскалация нарушителей и снятие временных отключений.

use crate::config::LimitsConfig;
use crate::connections::{ConnectionSource, Observations};
use crate::db::{Db, current_unix_timestamp};
use crate::enforcement::Enforcer;
use crate::monitoring::WarningSystem;
use crate::punishment::{PunishmentAction, PunishmentEngine, PunishmentStep};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    WarningIssued {
        username: String,
        ip_count: usize,
        limit: usize,
    },
    UserDisabled {
        username: String,
        /// 0 означает бессрочно.
        minutes: u32,
        /// Отключение по умолчанию при выключенной системе наказаний.
        bypass: bool,
    },
    UserReleased {
        username: String,
        consistent_ips: usize,
    },
    UserEnabled {
        username: String,
    },
    Failure {
        username: String,
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub limits: LimitsConfig,
    pub retention_days: u32,
    pub fallback_disable_minutes: u32,
}

pub struct Monitor {
    engine: Arc<PunishmentEngine>,
    warnings: Arc<WarningSystem>,
    db: Arc<Db>,
    enforcer: Arc<dyn Enforcer>,
    source: Arc<dyn ConnectionSource>,
    settings: MonitorSettings,
}

impl Monitor {
    pub fn new(
        engine: Arc<PunishmentEngine>,
        warnings: Arc<WarningSystem>,
        db: Arc<Db>,
        enforcer: Arc<dyn Enforcer>,
        source: Arc<dyn ConnectionSource>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            engine,
            warnings,
            db,
            enforcer,
            source,
            settings,
        }
    }

    /// Один цикл опроса за раз; пропущенные тики сдвигаются, а не копятся.
    pub async fn run(self: Arc<Self>, period: Duration, events: UnboundedSender<MonitorEvent>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(period_secs = period.as_secs(), "Monitoring loop started");

        loop {
            ticker.tick().await;
            let now = match current_unix_timestamp() {
                Ok(now) => now,
                Err(error) => {
                    tracing::error!(error = %error, "Cannot read system clock, skipping tick");
                    continue;
                }
            };

            let produced = match self.source.observe().await {
                Ok(observations) => self.run_cycle(&observations, now).await,
                Err(error) => {
                    tracing::warn!(error = %error, "Connection snapshot unavailable, only re-enabling");
                    self.enable_due_users(now).await
                }
            };

            for event in produced {
                if events.send(event).is_err() {
                    tracing::warn!("Monitor event receiver dropped, stopping loop");
                    return;
                }
            }
        }
    }

    pub async fn run_cycle(&self, observations: &Observations, now: i64) -> Vec<MonitorEvent> {
        let mut events = self.enable_due_users(now).await;
        events.extend(self.snapshot_monitored(observations, now).await);
        let (finished, resolved) = self.finish_expired(observations, now).await;
        events.extend(finished);
        events.extend(self.detect_violators(observations, &resolved, now).await);

        if let Err(error) = self
            .engine
            .cleanup_old_at(self.settings.retention_days, now)
            .await
        {
            tracing::warn!(error = %error, "Violation retention cleanup failed");
        }
        events
    }

    pub async fn enable_due_users(&self, now: i64) -> Vec<MonitorEvent> {
        let due = match self.db.users_to_enable(now).await {
            Ok(due) => due,
            Err(error) => {
                tracing::error!(error = %error, "Failed to read disabled users");
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        for username in due {
            let result = async {
                self.enforcer.enable(&username).await?;
                self.db.remove_disabled_user(&username).await?;
                Ok::<(), anyhow::Error>(())
            }
            .await;
            match result {
                Ok(()) => {
                    tracing::info!(username = %username, "Temporary disable expired, user enabled");
                    events.push(MonitorEvent::UserEnabled { username });
                }
                Err(error) => events.push(self.failure(username, error)),
            }
        }
        events
    }

    async fn snapshot_monitored(&self, observations: &Observations, now: i64) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        for username in self.warnings.active_usernames_at(now).await {
            let ips = observations.get(&username).cloned().unwrap_or_default();
            if let Err(error) = self.warnings.record_snapshot_at(&username, &ips, now).await {
                events.push(self.failure(username, error));
            }
        }
        events
    }

    /// Итог наблюдения: устойчиво активных IP больше лимита → следующий шаг,
    /// иначе пользователь считается легитимно сменившим сеть.
    /// Разобранные в этом цикле пользователи возвращаются во втором значении.
    async fn finish_expired(
        &self,
        observations: &Observations,
        now: i64,
    ) -> (Vec<MonitorEvent>, HashSet<String>) {
        let mut events = Vec::new();
        let mut resolved = HashSet::new();
        for warning in self.warnings.expired_warnings_at(now).await {
            let username = warning.username;
            match self.finish_one(&username, observations, now).await {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(error) => events.push(self.failure(username.clone(), error)),
            }
            resolved.insert(username);
        }
        (events, resolved)
    }

    async fn finish_one(
        &self,
        username: &str,
        observations: &Observations,
        now: i64,
    ) -> Result<Option<MonitorEvent>, anyhow::Error> {
        let current = observations.get(username).cloned().unwrap_or_default();
        let Some((warning, analysis)) = self.warnings.finish_at(username, &current, now).await?
        else {
            return Ok(None);
        };
        let limit = self.settings.limits.limit_for(username);

        let consistent = analysis.consistently_active_ips.len();
        tracing::info!(
            username = %username,
            snapshots = analysis.total_snapshots,
            peak_ip_count = analysis.peak_ip_count,
            average_ip_count = analysis.average_ip_count,
            ip_change_frequency = analysis.ip_change_frequency,
            consistent_ips = consistent,
            limit = limit,
            warned_ip_count = warning.ip_count,
            "Monitoring window finished"
        );

        if consistent > limit {
            self.punish(username, &analysis.consistently_active_ips, now)
                .await
                .map(Some)
        } else {
            Ok(Some(MonitorEvent::UserReleased {
                username: username.to_string(),
                consistent_ips: consistent,
            }))
        }
    }

    /// `resolved` не проверяются повторно в том же цикле: их итог уже подведён.
    async fn detect_violators(
        &self,
        observations: &Observations,
        resolved: &HashSet<String>,
        now: i64,
    ) -> Vec<MonitorEvent> {
        let mut usernames: Vec<&String> = observations.keys().collect();
        usernames.sort();

        let mut events = Vec::new();
        for username in usernames {
            let ips = &observations[username];
            let limit = self.settings.limits.limit_for(username);
            if ips.len() <= limit
                || self.settings.limits.is_excepted(username)
                || resolved.contains(username)
            {
                continue;
            }
            if self.warnings.is_monitoring_at(username, now).await {
                continue;
            }
            match self.db.get_disabled_user(username).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(error) => {
                    events.push(self.failure(username.clone(), error));
                    continue;
                }
            }

            tracing::info!(
                username = %username,
                ip_count = ips.len(),
                limit = limit,
                "Device limit exceeded"
            );
            match self.punish(username, ips, now).await {
                Ok(event) => events.push(event),
                Err(error) => events.push(self.failure(username.clone(), error)),
            }
        }
        events
    }

    async fn punish(
        &self,
        username: &str,
        ips: &BTreeSet<String>,
        now: i64,
    ) -> Result<MonitorEvent, anyhow::Error> {
        let action = self.engine.record_violation_at(username, ips, now).await?;
        match action {
            PunishmentAction::Warn => {
                self.warnings.add_user_at(username, ips.len(), now).await?;
                self.warnings.record_snapshot_at(username, ips, now).await?;
                Ok(MonitorEvent::WarningIssued {
                    username: username.to_string(),
                    ip_count: ips.len(),
                    limit: self.settings.limits.limit_for(username),
                })
            }
            PunishmentAction::Disable { minutes } => {
                self.disable(username, minutes, false, now).await
            }
            PunishmentAction::Bypass => {
                self.disable(username, self.settings.fallback_disable_minutes, true, now)
                    .await
            }
        }
    }

    async fn disable(
        &self,
        username: &str,
        minutes: u32,
        bypass: bool,
        now: i64,
    ) -> Result<MonitorEvent, anyhow::Error> {
        self.enforcer.disable(username, minutes).await?;
        let step = PunishmentStep::Disable { minutes };
        let enable_at = (!step.is_permanent()).then(|| now + i64::from(minutes) * 60);
        let reason = step.display_text();
        self.db
            .add_disabled_user(username, now, enable_at, Some(&reason))
            .await?;
        Ok(MonitorEvent::UserDisabled {
            username: username.to_string(),
            minutes,
            bypass,
        })
    }

    fn failure(&self, username: String, error: anyhow::Error) -> MonitorEvent {
        tracing::error!(username = %username, error = %error, "Monitoring step failed, continuing");
        MonitorEvent::Failure {
            username,
            error: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::MonitoringSettings;
    use crate::punishment::{PunishmentPolicy, ViolationStore};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeEnforcer {
        calls: Mutex<Vec<String>>,
        failing: HashSet<String>,
    }

    #[async_trait]
    impl Enforcer for FakeEnforcer {
        async fn disable(&self, username: &str, minutes: u32) -> Result<(), anyhow::Error> {
            if self.failing.contains(username) {
                anyhow::bail!("panel unavailable");
            }
            self.calls
                .lock()
                .await
                .push(format!("disable {} {}", username, minutes));
            Ok(())
        }

        async fn enable(&self, username: &str) -> Result<(), anyhow::Error> {
            self.calls.lock().await.push(format!("enable {}", username));
            Ok(())
        }
    }

    struct NoSource;

    #[async_trait]
    impl ConnectionSource for NoSource {
        async fn observe(&self) -> Result<Observations, anyhow::Error> {
            Ok(Observations::new())
        }
    }

    const T0: i64 = 1_700_000_000;

    struct Harness {
        monitor: Monitor,
        db: Arc<Db>,
        engine: Arc<PunishmentEngine>,
        warnings: Arc<WarningSystem>,
        enforcer: Arc<FakeEnforcer>,
    }

    async fn harness(enforcer: FakeEnforcer) -> Harness {
        let db = Arc::new(Db::open_in_memory().await.unwrap());
        let engine = Arc::new(PunishmentEngine::new(
            Arc::clone(&db) as Arc<dyn ViolationStore>,
            PunishmentPolicy::default(),
        ));
        let warnings = Arc::new(WarningSystem::new(
            Arc::clone(&db) as Arc<dyn crate::monitoring::WarningStore>,
            MonitoringSettings {
                monitoring_duration_secs: 240,
                consistent_activity_secs: 240,
            },
        ));
        let enforcer = Arc::new(enforcer);
        let limits = LimitsConfig {
            default: 2,
            users: HashMap::new(),
            except_users: vec!["vip".to_string()],
        };
        let monitor = Monitor::new(
            Arc::clone(&engine),
            Arc::clone(&warnings),
            Arc::clone(&db),
            Arc::clone(&enforcer) as Arc<dyn Enforcer>,
            Arc::new(NoSource),
            MonitorSettings {
                limits,
                retention_days: 30,
                fallback_disable_minutes: 30,
            },
        );
        Harness {
            monitor,
            db,
            engine,
            warnings,
            enforcer,
        }
    }

    fn observe(entries: &[(&str, &[&str])]) -> Observations {
        entries
            .iter()
            .map(|(user, ips)| {
                (
                    user.to_string(),
                    ips.iter().map(|ip| ip.to_string()).collect(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn over_limit_user_is_warned_and_monitored() {
        let h = harness(FakeEnforcer::default()).await;
        let obs = observe(&[
            ("alice", &["1.1.1.1", "2.2.2.2", "3.3.3.3"]),
            ("bob", &["1.1.1.1", "2.2.2.2"]),
            ("vip", &["1.1.1.1", "2.2.2.2", "3.3.3.3", "4.4.4.4"]),
        ]);

        let events = h.monitor.run_cycle(&obs, T0).await;
        assert_eq!(
            events,
            vec![MonitorEvent::WarningIssued {
                username: "alice".to_string(),
                ip_count: 3,
                limit: 2,
            }]
        );
        let warning = h.warnings.get("alice").await.unwrap();
        assert_eq!(warning.snapshots.len(), 1);
        assert!(h.enforcer.calls.lock().await.is_empty());

        // под наблюдением повторно не наказывается
        let events = h.monitor.run_cycle(&obs, T0 + 60).await;
        assert!(events.is_empty());
        assert_eq!(h.engine.violation_count_at("alice", T0 + 60).await.unwrap(), 1);
        assert_eq!(h.warnings.get("alice").await.unwrap().snapshots.len(), 2);
    }

    #[tokio::test]
    async fn persistent_devices_escalate_after_monitoring() {
        let h = harness(FakeEnforcer::default()).await;
        let obs = observe(&[("alice", &["1.1.1.1", "2.2.2.2", "3.3.3.3"])]);

        for offset in [0, 60, 120, 180] {
            h.monitor.run_cycle(&obs, T0 + offset).await;
        }
        let events = h.monitor.run_cycle(&obs, T0 + 240).await;

        assert_eq!(
            events,
            vec![MonitorEvent::UserDisabled {
                username: "alice".to_string(),
                minutes: 15,
                bypass: false,
            }]
        );
        assert!(h.warnings.get("alice").await.is_none());
        assert_eq!(*h.enforcer.calls.lock().await, vec!["disable alice 15"]);
        let disabled = h.db.get_disabled_user("alice").await.unwrap().unwrap();
        assert_eq!(disabled.enable_at, Some(T0 + 240 + 15 * 60));

        // отключённый пользователь не наказывается повторно
        let events = h.monitor.run_cycle(&obs, T0 + 300).await;
        assert!(events.is_empty());
        assert_eq!(h.engine.violation_count_at("alice", T0 + 300).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn roaming_user_is_released() {
        let h = harness(FakeEnforcer::default()).await;
        h.monitor
            .run_cycle(&observe(&[("alice", &["1.1.1.1", "2.2.2.2", "3.3.3.3"])]), T0)
            .await;
        h.monitor
            .run_cycle(&observe(&[("alice", &["1.1.1.1", "4.4.4.4"])]), T0 + 60)
            .await;
        h.monitor
            .run_cycle(&observe(&[("alice", &["1.1.1.1", "5.5.5.5"])]), T0 + 120)
            .await;
        let events = h
            .monitor
            .run_cycle(&observe(&[("alice", &["1.1.1.1"])]), T0 + 240)
            .await;

        assert_eq!(
            events,
            vec![MonitorEvent::UserReleased {
                username: "alice".to_string(),
                consistent_ips: 1,
            }]
        );
        assert!(h.enforcer.calls.lock().await.is_empty());
        assert!(h.warnings.get("alice").await.is_none());
    }

    #[tokio::test]
    async fn released_user_is_not_rewarned_in_same_cycle() {
        let h = harness(FakeEnforcer::default()).await;
        let ticks: [(i64, &[&str]); 4] = [
            (0, &["1.1.1.1", "2.2.2.2", "3.3.3.3"]),
            (60, &["1.1.1.1", "4.4.4.4", "5.5.5.5"]),
            (120, &["1.1.1.1", "6.6.6.6", "7.7.7.7"]),
            (180, &["1.1.1.1", "8.8.8.8", "9.9.9.9"]),
        ];
        for (offset, ips) in ticks {
            h.monitor.run_cycle(&observe(&[("alice", ips)]), T0 + offset).await;
        }

        let events = h
            .monitor
            .run_cycle(
                &observe(&[("alice", &["1.1.1.1", "10.10.10.10", "11.11.11.11"])]),
                T0 + 240,
            )
            .await;

        assert_eq!(
            events,
            vec![MonitorEvent::UserReleased {
                username: "alice".to_string(),
                consistent_ips: 1,
            }]
        );
        assert!(h.enforcer.calls.lock().await.is_empty());
        assert!(h.warnings.get("alice").await.is_none());
        assert_eq!(h.engine.violation_count_at("alice", T0 + 240).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn due_users_are_enabled() {
        let h = harness(FakeEnforcer::default()).await;
        h.db.add_disabled_user("bob", T0 - 1000, Some(T0 - 1), None)
            .await
            .unwrap();
        h.db.add_disabled_user("carol", T0 - 1000, None, None)
            .await
            .unwrap();

        let events = h.monitor.run_cycle(&Observations::new(), T0).await;
        assert_eq!(
            events,
            vec![MonitorEvent::UserEnabled {
                username: "bob".to_string()
            }]
        );
        assert!(h.db.get_disabled_user("bob").await.unwrap().is_none());
        assert!(h.db.get_disabled_user("carol").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn disabled_policy_uses_fallback_duration() {
        let h = harness(FakeEnforcer::default()).await;
        h.engine.set_enabled(false).await;

        let events = h
            .monitor
            .run_cycle(&observe(&[("dave", &["1.1.1.1", "2.2.2.2", "3.3.3.3"])]), T0)
            .await;
        assert_eq!(
            events,
            vec![MonitorEvent::UserDisabled {
                username: "dave".to_string(),
                minutes: 30,
                bypass: true,
            }]
        );
        assert_eq!(h.engine.violation_count_at("dave", T0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn enforcement_failure_does_not_abort_cycle() {
        let mut enforcer = FakeEnforcer::default();
        enforcer.failing.insert("alice".to_string());
        let h = harness(enforcer).await;
        h.engine
            .set_steps_json(r#"[{"type":"disable","duration":15}]"#)
            .await
            .unwrap();

        let events = h
            .monitor
            .run_cycle(
                &observe(&[
                    ("alice", &["1.1.1.1", "2.2.2.2", "3.3.3.3"]),
                    ("bob", &["1.1.1.1", "2.2.2.2", "3.3.3.3"]),
                ]),
                T0,
            )
            .await;

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], MonitorEvent::Failure { username, .. } if username == "alice"));
        assert_eq!(
            events[1],
            MonitorEvent::UserDisabled {
                username: "bob".to_string(),
                minutes: 15,
                bypass: false,
            }
        );
        assert!(h.db.get_disabled_user("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn permanent_disable_has_no_enable_time() {
        let h = harness(FakeEnforcer::default()).await;
        h.engine
            .set_steps_json(r#"[{"type":"disable","duration":0}]"#)
            .await
            .unwrap();

        h.monitor
            .run_cycle(&observe(&[("erin", &["1.1.1.1", "2.2.2.2", "3.3.3.3"])]), T0)
            .await;
        let disabled = h.db.get_disabled_user("erin").await.unwrap().unwrap();
        assert_eq!(disabled.enable_at, None);
        assert!(h.db.users_to_enable(T0 + 1_000_000).await.unwrap().is_empty());
    }
}
