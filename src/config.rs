//! Конфигурация бота из TOML-файла и запись изменений политики обратно.

use crate::monitoring::{
    DEFAULT_CONSISTENT_ACTIVITY_SECS, DEFAULT_MONITORING_SECS, MonitoringSettings,
};
use crate::punishment::{DEFAULT_WINDOW_HOURS, PunishmentEngine, StepConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use toml_edit::{ArrayOfTables, DocumentMut, Item, Table, value};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Имя переменной окружения с токеном, если он не задан в файле.
    #[serde(default)]
    pub bot_token_env: Option<String>,
    #[serde(default)]
    pub admin_ids: Vec<i64>,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default)]
    pub punishment: PunishmentConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub enforcement: EnforcementConfig,
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunishmentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_window_hours")]
    pub window_hours: i64,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

impl Default for PunishmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_hours: default_window_hours(),
            steps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_monitoring_secs")]
    pub duration_secs: i64,
    #[serde(default = "default_consistent_secs")]
    pub consistent_activity_secs: i64,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_connections_path")]
    pub connections_path: PathBuf,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Длительность отключения, когда система наказаний выключена.
    #[serde(default = "default_fallback_minutes")]
    pub fallback_disable_minutes: u32,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_monitoring_secs(),
            consistent_activity_secs: default_consistent_secs(),
            tick_interval_secs: default_tick_interval(),
            connections_path: default_connections_path(),
            retention_days: default_retention_days(),
            fallback_disable_minutes: default_fallback_minutes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_limit")]
    pub default: usize,
    #[serde(default)]
    pub users: HashMap<String, usize>,
    #[serde(default)]
    pub except_users: Vec<String>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default: default_limit(),
            users: HashMap::new(),
            except_users: Vec::new(),
        }
    }
}

impl LimitsConfig {
    pub fn limit_for(&self, username: &str) -> usize {
        self.users.get(username).copied().unwrap_or(self.default)
    }

    pub fn is_excepted(&self, username: &str) -> bool {
        self.except_users.iter().any(|u| u == username)
    }
}

/// Команды панели. В аргументах подставляются `{username}` и `{minutes}`.
#[derive(Debug, Clone, Deserialize)]
pub struct EnforcementConfig {
    #[serde(default)]
    pub disable_command: Vec<String>,
    #[serde(default)]
    pub enable_command: Vec<String>,
    #[serde(default = "default_enforcement_timeout")]
    pub timeout_secs: u64,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            disable_command: Vec::new(),
            enable_command: Vec::new(),
            timeout_secs: default_enforcement_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_window_hours() -> i64 {
    i64::from(DEFAULT_WINDOW_HOURS)
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/limiter-admin/limiter.db")
}

fn default_monitoring_secs() -> i64 {
    DEFAULT_MONITORING_SECS
}

fn default_consistent_secs() -> i64 {
    DEFAULT_CONSISTENT_ACTIVITY_SECS
}

fn default_tick_interval() -> u64 {
    60
}

fn default_connections_path() -> PathBuf {
    PathBuf::from("/var/lib/limiter-admin/connections.json")
}

fn default_retention_days() -> u32 {
    30
}

fn default_fallback_minutes() -> u32 {
    30
}

fn default_limit() -> usize {
    2
}

fn default_enforcement_timeout() -> u64 {
    15
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Не удалось прочитать конфиг {}: {}", path.display(), e)
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.path = path.to_path_buf();
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, anyhow::Error> {
        let config: Self =
            toml::from_str(raw).map_err(|e| anyhow::anyhow!("Некорректный конфиг: {}", e))?;
        if config.monitoring.duration_secs <= 0 {
            anyhow::bail!("monitoring.duration_secs должен быть больше 0");
        }
        if config.monitoring.tick_interval_secs == 0 {
            anyhow::bail!("monitoring.tick_interval_secs должен быть больше 0");
        }
        Ok(config)
    }

    pub fn bot_token(&self) -> Result<String, anyhow::Error> {
        if let Some(token) = self.bot_token.as_deref().map(str::trim)
            && !token.is_empty()
        {
            return Ok(token.to_string());
        }
        let env_name = self
            .bot_token_env
            .as_deref()
            .unwrap_or("LIMITER_BOT_TOKEN");
        std::env::var(env_name)
            .map(|token| token.trim().to_string())
            .ok()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Токен бота не задан (bot_token или ${})", env_name))
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }

    pub fn monitoring_settings(&self) -> MonitoringSettings {
        MonitoringSettings {
            monitoring_duration_secs: self.monitoring.duration_secs,
            consistent_activity_secs: self.monitoring.consistent_activity_secs,
        }
    }
}

/// Переписывает таблицу `[punishment]`, сохраняя остальной документ и комментарии.
pub fn apply_punishment_section(
    source: &str,
    punishment: &PunishmentConfig,
) -> Result<String, anyhow::Error> {
    let mut doc: DocumentMut = source
        .parse()
        .map_err(|e| anyhow::anyhow!("Не удалось разобрать конфиг: {}", e))?;

    if !doc.get("punishment").is_some_and(Item::is_table_like) {
        doc["punishment"] = Item::Table(Table::new());
    }
    doc["punishment"]["enabled"] = value(punishment.enabled);
    doc["punishment"]["window_hours"] = value(punishment.window_hours);

    let mut steps = ArrayOfTables::new();
    for step in &punishment.steps {
        let mut table = Table::new();
        table["type"] = value(step.kind.as_str());
        table["duration"] = value(step.duration);
        steps.push(table);
    }
    doc["punishment"]["steps"] = Item::ArrayOfTables(steps);

    Ok(doc.to_string())
}

pub fn save_punishment(path: &Path, punishment: &PunishmentConfig) -> Result<(), anyhow::Error> {
    let source = std::fs::read_to_string(path).map_err(|e| {
        anyhow::anyhow!("Не удалось прочитать конфиг {}: {}", path.display(), e)
    })?;
    let updated = apply_punishment_section(&source, punishment)?;

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, updated)
        .map_err(|e| anyhow::anyhow!("Не удалось записать {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| anyhow::anyhow!("Не удалось заменить {}: {}", path.display(), e))?;
    tracing::info!(
        path = %path.display(),
        enabled = punishment.enabled,
        window_hours = punishment.window_hours,
        steps = punishment.steps.len(),
        "Punishment section written to config"
    );
    Ok(())
}

/// Запись `[punishment]` обратно в файл конфигурации.
/// Записи идут по одной; политика читается уже под блокировкой записи,
/// поэтому в файле всегда оказывается последнее состояние движка.
pub struct PolicyFile {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl PolicyFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn save(&self, engine: &PunishmentEngine) -> Result<PunishmentConfig, anyhow::Error> {
        let _guard = self.write_lock.lock().await;
        let punishment = engine.policy().await.to_config();
        let path = self.path.clone();
        let written = punishment.clone();
        tokio::task::spawn_blocking(move || save_punishment(&path, &written))
            .await
            .map_err(|e| anyhow::anyhow!("Запись конфига прервана: {}", e))??;
        Ok(punishment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# админы бота
admin_ids = [100, 200]
db_path = "/tmp/limiter.db"

[punishment]
enabled = true
window_hours = 48

[[punishment.steps]]
type = "warning"
duration = 0

[[punishment.steps]]
type = "disable"
duration = 15

[limits]
default = 3
except_users = ["vip"]

[limits.users]
family = 6
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert!(config.is_admin(100));
        assert!(!config.is_admin(300));
        assert_eq!(config.punishment.window_hours, 48);
        assert_eq!(config.punishment.steps.len(), 2);
        assert_eq!(config.punishment.steps[1].kind, "disable");
        assert_eq!(config.monitoring.duration_secs, 240);
        assert_eq!(config.monitoring.tick_interval_secs, 60);
        assert_eq!(config.limits.limit_for("family"), 6);
        assert_eq!(config.limits.limit_for("someone"), 3);
        assert!(config.limits.is_excepted("vip"));
        assert_eq!(config.enforcement.timeout_secs, 15);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert!(config.punishment.enabled);
        assert_eq!(config.punishment.window_hours, 72);
        assert!(config.punishment.steps.is_empty());
        assert_eq!(config.limits.default, 2);
        assert_eq!(config.enforcement.timeout_secs, 15);
    }

    #[test]
    fn enforcement_table_without_timeout_keeps_default() {
        let config =
            Config::from_toml_str("[enforcement]\ndisable_command = [\"panel\", \"off\"]\n").unwrap();
        assert_eq!(config.enforcement.timeout_secs, 15);
        assert_eq!(EnforcementConfig::default().timeout_secs, 15);
    }

    #[test]
    fn rejects_zero_monitoring_duration() {
        assert!(Config::from_toml_str("[monitoring]\nduration_secs = 0\n").is_err());
    }

    #[test]
    fn token_from_file_wins() {
        let config = Config::from_toml_str("bot_token = \" 123:abc \"\n").unwrap();
        assert_eq!(config.bot_token().unwrap(), "123:abc");
    }

    #[test]
    fn punishment_section_rewrite_keeps_other_keys() {
        let punishment = PunishmentConfig {
            enabled: false,
            window_hours: 24,
            steps: vec![StepConfig {
                kind: "disable".to_string(),
                duration: 0,
            }],
        };
        let updated = apply_punishment_section(SAMPLE, &punishment).unwrap();
        assert!(updated.contains("# админы бота"));

        let reparsed = Config::from_toml_str(&updated).unwrap();
        assert_eq!(reparsed.punishment, punishment);
        assert_eq!(reparsed.admin_ids, vec![100, 200]);
        assert_eq!(reparsed.limits.limit_for("family"), 6);
    }

    #[test]
    fn punishment_section_created_when_missing() {
        let punishment = PunishmentConfig::default();
        let updated = apply_punishment_section("admin_ids = [1]\n", &punishment).unwrap();
        let reparsed = Config::from_toml_str(&updated).unwrap();
        assert_eq!(reparsed.punishment, punishment);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_saves_leave_latest_policy_on_disk() {
        let path = std::env::temp_dir().join(format!(
            "limiter-admin-policy-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, SAMPLE).unwrap();

        let db = std::sync::Arc::new(crate::db::Db::open_in_memory().await.unwrap());
        let engine = std::sync::Arc::new(PunishmentEngine::new(
            db as std::sync::Arc<dyn crate::punishment::ViolationStore>,
            crate::punishment::PunishmentPolicy::default(),
        ));
        let file = std::sync::Arc::new(PolicyFile::new(path.clone()));

        let mut handles = Vec::new();
        for hours in 1..=16 {
            let engine = std::sync::Arc::clone(&engine);
            let file = std::sync::Arc::clone(&file);
            handles.push(tokio::spawn(async move {
                engine.set_window_hours(hours).await.unwrap();
                file.save(&engine).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let on_disk = Config::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(on_disk.punishment, engine.policy().await.to_config());
        assert_eq!(on_disk.admin_ids, vec![100, 200]);
    }
}
