//! Политика эскалации: упорядоченные шаги наказаний и окно учёта нарушений.

use crate::config::PunishmentConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_WINDOW_HOURS: u32 = 72;
pub const MAX_WINDOW_HOURS: u32 = 720;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Список шагов не может быть пустым")]
    EmptySteps,
    #[error("Неизвестный тип шага: {0} (допустимо: warning, disable)")]
    InvalidStepType(String),
    #[error("Некорректная длительность шага: {0}")]
    InvalidDuration(i64),
    #[error("Окно должно быть от 1 до 720 часов, получено {0}")]
    InvalidWindow(i64),
    #[error("Некорректный формат шагов: {0}")]
    Malformed(String),
}

/// Шаг в формате конфигурации: `{"type": "warning"|"disable", "duration": минуты}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub duration: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunishmentStep {
    /// Только предупреждение, пользователь не отключается.
    Warning,
    /// Отключение; `minutes == 0` означает бессрочно.
    Disable { minutes: u32 },
}

impl PunishmentStep {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Disable { minutes: 0 })
    }

    /// Длительность для записи в историю; у предупреждения всегда 0.
    pub fn duration_minutes(&self) -> u32 {
        match self {
            Self::Warning => 0,
            Self::Disable { minutes } => *minutes,
        }
    }

    /// Условная тяжесть шага: предупреждение < временное отключение < бессрочное.
    pub fn severity(&self) -> u64 {
        match self {
            Self::Warning => 0,
            Self::Disable { minutes: 0 } => u64::MAX,
            Self::Disable { minutes } => u64::from(*minutes),
        }
    }

    pub fn display_text(&self) -> String {
        match self {
            Self::Warning => "⚠️ Предупреждение".to_string(),
            Self::Disable { minutes: 0 } => "🚫 Отключение навсегда".to_string(),
            Self::Disable { minutes } => format!("🔒 Отключение на {} мин", minutes),
        }
    }

    pub fn to_config(&self) -> StepConfig {
        match self {
            Self::Warning => StepConfig {
                kind: "warning".to_string(),
                duration: 0,
            },
            Self::Disable { minutes } => StepConfig {
                kind: "disable".to_string(),
                duration: i64::from(*minutes),
            },
        }
    }
}

impl TryFrom<&StepConfig> for PunishmentStep {
    type Error = PolicyError;

    fn try_from(raw: &StepConfig) -> Result<Self, Self::Error> {
        if raw.duration < 0 {
            return Err(PolicyError::InvalidDuration(raw.duration));
        }
        match raw.kind.as_str() {
            "warning" => Ok(Self::Warning),
            "disable" => {
                let minutes = u32::try_from(raw.duration)
                    .map_err(|_| PolicyError::InvalidDuration(raw.duration))?;
                Ok(Self::Disable { minutes })
            }
            other => Err(PolicyError::InvalidStepType(other.to_string())),
        }
    }
}

/// Встроенная последовательность: предупреждение → 15 мин → 60 мин → навсегда.
pub fn default_steps() -> Vec<PunishmentStep> {
    vec![
        PunishmentStep::Warning,
        PunishmentStep::Disable { minutes: 15 },
        PunishmentStep::Disable { minutes: 60 },
        PunishmentStep::Disable { minutes: 0 },
    ]
}

pub fn validate_steps(raw: &[StepConfig]) -> Result<Vec<PunishmentStep>, PolicyError> {
    if raw.is_empty() {
        return Err(PolicyError::EmptySteps);
    }
    raw.iter().map(PunishmentStep::try_from).collect()
}

/// Разбирает JSON-массив шагов из команды администратора.
pub fn parse_steps_json(json: &str) -> Result<Vec<PunishmentStep>, PolicyError> {
    let raw: Vec<StepConfig> =
        serde_json::from_str(json.trim()).map_err(|e| PolicyError::Malformed(e.to_string()))?;
    validate_steps(&raw)
}

pub fn validate_window(hours: i64) -> Result<u32, PolicyError> {
    if !(1..=i64::from(MAX_WINDOW_HOURS)).contains(&hours) {
        return Err(PolicyError::InvalidWindow(hours));
    }
    u32::try_from(hours).map_err(|_| PolicyError::InvalidWindow(hours))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunishmentPolicy {
    enabled: bool,
    window_hours: u32,
    steps: Vec<PunishmentStep>,
}

impl Default for PunishmentPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            window_hours: DEFAULT_WINDOW_HOURS,
            steps: default_steps(),
        }
    }
}

impl PunishmentPolicy {
    /// Пустой или отсутствующий список шагов заменяется встроенным.
    pub fn from_config(config: &PunishmentConfig) -> Result<Self, PolicyError> {
        let window_hours = validate_window(config.window_hours)?;
        let steps = if config.steps.is_empty() {
            default_steps()
        } else {
            validate_steps(&config.steps)?
        };
        Ok(Self {
            enabled: config.enabled,
            window_hours,
            steps,
        })
    }

    pub fn to_config(&self) -> PunishmentConfig {
        PunishmentConfig {
            enabled: self.enabled,
            window_hours: i64::from(self.window_hours),
            steps: self.steps.iter().map(PunishmentStep::to_config).collect(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn window_hours(&self) -> u32 {
        self.window_hours
    }

    pub fn window_secs(&self) -> i64 {
        i64::from(self.window_hours) * 3600
    }

    pub fn steps(&self) -> &[PunishmentStep] {
        &self.steps
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_window_hours(mut self, hours: i64) -> Result<Self, PolicyError> {
        self.window_hours = validate_window(hours)?;
        Ok(self)
    }

    pub fn with_steps(mut self, steps: Vec<PunishmentStep>) -> Result<Self, PolicyError> {
        if steps.is_empty() {
            return Err(PolicyError::EmptySteps);
        }
        self.steps = steps;
        Ok(self)
    }

    /// Индекс шага для пользователя с `count` нарушениями в окне.
    /// Эскалация насыщается на последнем шаге.
    pub fn step_index_for_count(&self, count: i64) -> usize {
        let last = self.steps.len().saturating_sub(1);
        usize::try_from(count.max(0)).map_or(last, |n| n.min(last))
    }

    pub fn step_for_count(&self, count: i64) -> PunishmentStep {
        self.steps
            .get(self.step_index_for_count(count))
            .copied()
            .unwrap_or(PunishmentStep::Warning)
    }

    pub fn display_text_for(&self, step: &PunishmentStep) -> String {
        step.display_text()
    }

    pub fn steps_display(&self) -> Vec<String> {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, step)| format!("  {}. {}", i + 1, step.display_text()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enabled: bool, window_hours: i64, steps: Vec<StepConfig>) -> PunishmentConfig {
        PunishmentConfig {
            enabled,
            window_hours,
            steps,
        }
    }

    fn raw(kind: &str, duration: i64) -> StepConfig {
        StepConfig {
            kind: kind.to_string(),
            duration,
        }
    }

    #[test]
    fn first_violation_maps_to_first_step() {
        let policy = PunishmentPolicy::default();
        assert_eq!(policy.step_for_count(0), PunishmentStep::Warning);
        assert_eq!(policy.step_index_for_count(0), 0);
    }

    #[test]
    fn escalation_saturates_at_last_step() {
        let policy = PunishmentPolicy::default();
        for n in 3..50 {
            assert_eq!(
                policy.step_for_count(n),
                PunishmentStep::Disable { minutes: 0 }
            );
        }
        assert_eq!(policy.step_index_for_count(i64::MAX), 3);
        assert_eq!(policy.step_index_for_count(-5), 0);
    }

    #[test]
    fn default_policy_severity_never_decreases() {
        let policy = PunishmentPolicy::default();
        let mut previous = 0;
        for n in 0..10 {
            let severity = policy.step_for_count(n).severity();
            assert!(severity >= previous, "severity dropped at n={}", n);
            previous = severity;
        }
    }

    #[test]
    fn display_texts() {
        assert!(PunishmentStep::Warning.display_text().contains("Предупреждение"));
        assert!(PunishmentStep::Disable { minutes: 15 }
            .display_text()
            .contains("15 мин"));
        assert!(PunishmentStep::Disable { minutes: 0 }
            .display_text()
            .contains("навсегда"));
    }

    #[test]
    fn parse_steps_accepts_wire_format() {
        let steps = parse_steps_json(
            r#"[{"type":"warning","duration":0},{"type":"disable","duration":15},{"type":"disable","duration":0}]"#,
        )
        .unwrap();
        assert_eq!(
            steps,
            vec![
                PunishmentStep::Warning,
                PunishmentStep::Disable { minutes: 15 },
                PunishmentStep::Disable { minutes: 0 },
            ]
        );
    }

    #[test]
    fn parse_steps_rejects_bad_input() {
        assert_eq!(parse_steps_json("[]"), Err(PolicyError::EmptySteps));
        assert_eq!(
            parse_steps_json(r#"[{"type":"ban","duration":5}]"#),
            Err(PolicyError::InvalidStepType("ban".to_string()))
        );
        assert_eq!(
            parse_steps_json(r#"[{"type":"disable","duration":-1}]"#),
            Err(PolicyError::InvalidDuration(-1))
        );
        assert!(matches!(
            parse_steps_json(r#"[{"type":"disable","duration":1.5}]"#),
            Err(PolicyError::Malformed(_))
        ));
        assert!(matches!(
            parse_steps_json(r#"{"type":"disable"}"#),
            Err(PolicyError::Malformed(_))
        ));
    }

    #[test]
    fn from_config_falls_back_to_default_steps() {
        let policy = PunishmentPolicy::from_config(&config(true, 24, Vec::new())).unwrap();
        assert_eq!(policy.steps(), default_steps().as_slice());
        assert_eq!(policy.window_hours(), 24);
    }

    #[test]
    fn from_config_rejects_invalid_step() {
        let result = PunishmentPolicy::from_config(&config(true, 72, vec![raw("kick", 0)]));
        assert!(matches!(result, Err(PolicyError::InvalidStepType(_))));
    }

    #[test]
    fn window_bounds() {
        assert!(validate_window(0).is_err());
        assert!(validate_window(721).is_err());
        assert_eq!(validate_window(1), Ok(1));
        assert_eq!(validate_window(720), Ok(720));
    }

    #[test]
    fn rejected_update_keeps_prior_policy() {
        let policy = PunishmentPolicy::default();
        let before = policy.clone();
        assert!(policy.clone().with_steps(Vec::new()).is_err());
        assert!(policy.clone().with_window_hours(0).is_err());
        assert_eq!(policy, before);
    }

    #[test]
    fn config_round_trip_preserves_steps() {
        let policy = PunishmentPolicy::default()
            .with_window_hours(48)
            .unwrap()
            .with_enabled(false);
        let restored = PunishmentPolicy::from_config(&policy.to_config()).unwrap();
        assert_eq!(restored, policy);
    }
}
