use crate::db::DisabledUser;
use crate::monitor::MonitorEvent;
use crate::monitoring::{ActivityAnalysis, MonitoringStatus, MonitoringWarning};
use crate::punishment::{PunishmentPolicy, PunishmentStep, UserStatus};
use chrono::{DateTime, Local, Utc};

pub fn format_timestamp(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| {
            dt.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S %:z")
                .to_string()
        })
        .unwrap_or_else(|| format!("Некорректный timestamp: {}", ts))
}

pub fn render_punishment_status(policy: &PunishmentPolicy) -> String {
    let state = if policy.enabled() {
        "✅ Включена"
    } else {
        "⏸ Выключена"
    };
    format!(
        "⚖️ Система наказаний\n\n\
         Статус: {}\n\
         Окно подсчёта: {} ч\n\n\
         Шаги:\n{}",
        state,
        policy.window_hours(),
        policy.steps_display().join("\n")
    )
}

pub fn render_user_violations(status: &UserStatus) -> String {
    let mut text = format!(
        "👤 {}\n\
         Нарушений за {} ч: {}\n\
         Следующее наказание: {}",
        status.username, status.window_hours, status.violation_count, status.next_punishment
    );
    if !status.enabled {
        text.push_str("\n⏸ Система наказаний выключена");
    }
    if status.recent_violations.is_empty() {
        text.push_str("\n\nНарушений в окне нет.");
        return text;
    }

    text.push_str("\n\nПоследние нарушения:");
    for violation in &status.recent_violations {
        let step = if violation.duration > 0 {
            format!("шаг {} ({} мин)", violation.step + 1, violation.duration)
        } else {
            format!("шаг {}", violation.step + 1)
        };
        text.push_str(&format!(
            "\n• {} | {} | {}",
            format_timestamp(violation.timestamp),
            step,
            violation.time_ago
        ));
    }
    text
}

pub fn render_monitoring_status(status: &MonitoringStatus) -> String {
    if status.active.is_empty() && status.expired.is_empty() {
        return "👁 Активных наблюдений нет.".to_string();
    }
    let mut text = format!("👁 Под наблюдением: {}", status.active.len());
    for entry in &status.active {
        text.push_str(&format!(
            "\n• {} | {} IP | осталось {} сек",
            entry.username, entry.ip_count, entry.remaining_secs
        ));
    }
    if !status.expired.is_empty() {
        text.push_str(&format!(
            "\n\n⌛ Ожидают разбора: {}",
            status.expired.join(", ")
        ));
    }
    text
}

/// Подробный отчёт по каждому наблюдению с анализом снимков.
pub fn render_monitoring_details(
    entries: &[(MonitoringWarning, ActivityAnalysis)],
    now: i64,
) -> String {
    if entries.is_empty() {
        return "👁 Активных наблюдений нет.".to_string();
    }
    let mut text = String::from("🔍 Детали наблюдений");
    for (warning, analysis) in entries {
        let consistent = if analysis.consistently_active_ips.is_empty() {
            "—".to_string()
        } else {
            analysis
                .consistently_active_ips
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        };
        text.push_str(&format!(
            "\n\n👤 {}\n\
             Начато: {}\n\
             Осталось: {} сек\n\
             Снимков: {}\n\
             Пик IP: {}\n\
             Среднее IP: {:.1}\n\
             Частота смены IP: {:.0}%\n\
             Устойчивые IP: {}",
            warning.username,
            format_timestamp(warning.created_at),
            warning.time_remaining_at(now),
            analysis.total_snapshots,
            analysis.peak_ip_count,
            analysis.average_ip_count,
            analysis.ip_change_frequency * 100.0,
            consistent
        ));
    }
    text
}

pub fn render_disabled_user_line(user: &DisabledUser) -> String {
    let until = user
        .enable_at
        .map(format_timestamp)
        .unwrap_or_else(|| "навсегда".to_string());
    format!(
        "• {} | с {} | до {} | {}",
        user.username,
        format_timestamp(user.disabled_at),
        until,
        user.reason.as_deref().unwrap_or("—")
    )
}

pub fn render_monitor_event(event: &MonitorEvent) -> String {
    match event {
        MonitorEvent::WarningIssued {
            username,
            ip_count,
            limit,
        } => format!(
            "{}: {}\nIP: {} при лимите {}. Начато наблюдение.",
            PunishmentStep::Warning.display_text(),
            username,
            ip_count,
            limit
        ),
        MonitorEvent::UserDisabled {
            username,
            minutes,
            bypass,
        } => {
            let mut text = format!(
                "{}: {}",
                PunishmentStep::Disable { minutes: *minutes }.display_text(),
                username
            );
            if *bypass {
                text.push_str("\nСистема наказаний выключена, применено отключение по умолчанию.");
            }
            text
        }
        MonitorEvent::UserReleased {
            username,
            consistent_ips,
        } => format!(
            "✅ {}: наблюдение завершено, устойчивых IP {}. Похоже на смену сети.",
            username, consistent_ips
        ),
        MonitorEvent::UserEnabled { username } => {
            format!("🔓 {}: срок отключения истёк, доступ восстановлен.", username)
        }
        MonitorEvent::Failure { username, error } => {
            format!("❌ {}: {}", username, error)
        }
    }
}

pub fn help_text() -> &'static str {
    r#"Команды администратора:
/punishment_status — состояние системы наказаний
/punishment_toggle — включить или выключить систему
/punishment_set_window <часы> — окно подсчёта нарушений (1-720)
/punishment_set_steps <json> — шаги, например [{"type":"warning","duration":0},{"type":"disable","duration":15}]
/user_violations <username> — нарушения пользователя
/clear_user_violations <username|all> — очистить историю
/monitoring_status — активные наблюдения
/monitoring_details — анализ снимков IP
/clear_monitoring — снять все наблюдения
/disabled_users — отключённые пользователи
/enable_user <username> — включить пользователя вручную"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::ActiveMonitoring;
    use crate::punishment::RecentViolation;
    use std::collections::BTreeSet;

    #[test]
    fn status_lists_steps() {
        let text = render_punishment_status(&PunishmentPolicy::default());
        assert!(text.contains("Окно подсчёта: 72 ч"));
        assert!(text.contains("1. ⚠️ Предупреждение"));
        assert!(text.contains("4. 🚫 Отключение навсегда"));
    }

    #[test]
    fn violations_render_steps_one_based() {
        let status = UserStatus {
            username: "alice".to_string(),
            enabled: true,
            violation_count: 1,
            window_hours: 72,
            recent_violations: vec![RecentViolation {
                timestamp: 1_700_000_000,
                step: 1,
                duration: 15,
                time_ago: "8 мин назад".to_string(),
            }],
            next_punishment: "🔒 Отключение на 60 мин".to_string(),
        };
        let text = render_user_violations(&status);
        assert!(text.contains("шаг 2 (15 мин)"));
        assert!(text.contains("8 мин назад"));
    }

    #[test]
    fn empty_monitoring_status() {
        assert_eq!(
            render_monitoring_status(&MonitoringStatus::default()),
            "👁 Активных наблюдений нет."
        );
        let status = MonitoringStatus {
            active: vec![ActiveMonitoring {
                username: "bob".to_string(),
                ip_count: 3,
                remaining_secs: 120,
            }],
            expired: vec!["carol".to_string()],
        };
        let text = render_monitoring_status(&status);
        assert!(text.contains("bob | 3 IP | осталось 120 сек"));
        assert!(text.contains("carol"));
    }

    #[test]
    fn details_include_consistent_ips() {
        let mut warning = MonitoringWarning::new("dave", 3, 240, 1000);
        let ips: BTreeSet<String> = ["1.1.1.1".to_string()].into_iter().collect();
        warning.record_snapshot(&ips, 1000);
        warning.record_snapshot(&ips, 1240);
        let analysis = warning.analyze(240);
        let text = render_monitoring_details(&[(warning, analysis)], 1100);
        assert!(text.contains("Устойчивые IP: 1.1.1.1"));
        assert!(text.contains("Осталось: 140 сек"));
    }

    #[test]
    fn bypass_event_mentions_fallback() {
        let text = render_monitor_event(&MonitorEvent::UserDisabled {
            username: "erin".to_string(),
            minutes: 30,
            bypass: true,
        });
        assert!(text.starts_with("🔒 Отключение на 30 мин: erin"));
        assert!(text.contains("по умолчанию"));
    }
}
