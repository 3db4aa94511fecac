use super::format::{
    help_text, render_disabled_user_line, render_monitoring_details, render_monitoring_status,
    render_punishment_status, render_user_violations,
};
use super::shared::{HandlerResult, persist_policy, send_long_message};
use super::state::{BotState, command_argument, is_admin_message, sender_user_id};
use crate::db::current_unix_timestamp;
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "snake_case")]
pub enum BotCommand {
    #[command(description = "Открыть меню администратора")]
    Start,
    #[command(description = "Справка")]
    Help,
    #[command(description = "Состояние системы наказаний")]
    PunishmentStatus,
    #[command(description = "Включить/выключить систему наказаний")]
    PunishmentToggle,
    #[command(description = "Окно подсчёта нарушений в часах")]
    PunishmentSetWindow,
    #[command(description = "Шаги наказаний в JSON")]
    PunishmentSetSteps,
    #[command(description = "Нарушения пользователя")]
    UserViolations,
    #[command(description = "Очистить историю нарушений")]
    ClearUserViolations,
    #[command(description = "Активные наблюдения")]
    MonitoringStatus,
    #[command(description = "Анализ наблюдений")]
    MonitoringDetails,
    #[command(description = "Снять все наблюдения")]
    ClearMonitoring,
    #[command(description = "Отключённые пользователи")]
    DisabledUsers,
    #[command(description = "Включить пользователя")]
    EnableUser,
}

pub fn handler() -> teloxide::dispatching::UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>> {
    teloxide::filter_command::<BotCommand, _>()
        .filter(|msg: Message, state: BotState| is_admin_message(&msg, &state))
        .branch(dptree::case![BotCommand::Start].endpoint(cmd_start))
        .branch(dptree::case![BotCommand::Help].endpoint(cmd_help))
        .branch(dptree::case![BotCommand::PunishmentStatus].endpoint(cmd_punishment_status))
        .branch(dptree::case![BotCommand::PunishmentToggle].endpoint(cmd_punishment_toggle))
        .branch(dptree::case![BotCommand::PunishmentSetWindow].endpoint(cmd_punishment_set_window))
        .branch(dptree::case![BotCommand::PunishmentSetSteps].endpoint(cmd_punishment_set_steps))
        .branch(dptree::case![BotCommand::UserViolations].endpoint(cmd_user_violations))
        .branch(dptree::case![BotCommand::ClearUserViolations].endpoint(cmd_clear_user_violations))
        .branch(dptree::case![BotCommand::MonitoringStatus].endpoint(cmd_monitoring_status))
        .branch(dptree::case![BotCommand::MonitoringDetails].endpoint(cmd_monitoring_details))
        .branch(dptree::case![BotCommand::ClearMonitoring].endpoint(cmd_clear_monitoring))
        .branch(dptree::case![BotCommand::DisabledUsers].endpoint(cmd_disabled_users))
        .branch(dptree::case![BotCommand::EnableUser].endpoint(cmd_enable_user))
}

async fn cmd_start(bot: Bot, msg: Message) -> HandlerResult {
    tracing::info!(user_id = ?sender_user_id(&msg), "Received /start command");
    bot.send_message(
        msg.chat.id,
        "Панель контроля лимитов устройств. Используйте кнопки ниже.",
    )
    .reply_markup(crate::bot::keyboards::admin_menu())
    .await?;
    Ok(())
}

pub async fn cmd_help(bot: Bot, msg: Message) -> HandlerResult {
    bot.send_message(msg.chat.id, help_text())
        .reply_markup(crate::bot::keyboards::admin_menu())
        .await?;
    Ok(())
}

pub async fn show_punishment_panel(bot: &Bot, chat_id: ChatId, state: &BotState) -> HandlerResult {
    let policy = state.engine.policy().await;
    bot.send_message(chat_id, render_punishment_status(&policy))
        .reply_markup(crate::bot::keyboards::punishment_menu(policy.enabled()))
        .await?;
    Ok(())
}

async fn cmd_punishment_status(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    show_punishment_panel(&bot, msg.chat.id, &state).await
}

async fn reply_policy_change(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    headline: String,
) -> HandlerResult {
    let mut text = headline;
    if let Some(note) = persist_policy(state).await {
        text.push_str("\n\n");
        text.push_str(&note);
    }
    bot.send_message(chat_id, text).await?;
    Ok(())
}

async fn cmd_punishment_toggle(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let policy = state.engine.toggle().await;
    tracing::info!(
        admin_id = ?sender_user_id(&msg),
        enabled = policy.enabled(),
        "Admin command /punishment_toggle"
    );
    let headline = if policy.enabled() {
        "✅ Система наказаний включена".to_string()
    } else {
        "⏸ Система наказаний выключена".to_string()
    };
    reply_policy_change(&bot, msg.chat.id, &state, headline).await
}

async fn cmd_punishment_set_window(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let hours = match command_argument(&msg).parse::<i64>() {
        Ok(hours) => hours,
        Err(_) => {
            bot.send_message(msg.chat.id, "Использование: /punishment_set_window <часы>")
                .await?;
            return Ok(());
        }
    };

    match state.engine.set_window_hours(hours).await {
        Ok(policy) => {
            tracing::info!(window_hours = hours, "Admin command /punishment_set_window");
            let headline = format!("✅ Окно подсчёта: {} ч", policy.window_hours());
            reply_policy_change(&bot, msg.chat.id, &state, headline).await
        }
        Err(error) => {
            bot.send_message(msg.chat.id, format!("❌ Ошибка: {}", error))
                .await?;
            Ok(())
        }
    }
}

async fn cmd_punishment_set_steps(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let json = command_argument(&msg);
    if json.is_empty() {
        bot.send_message(
            msg.chat.id,
            "Использование: /punishment_set_steps [{\"type\":\"warning\",\"duration\":0},{\"type\":\"disable\",\"duration\":15}]",
        )
        .await?;
        return Ok(());
    }

    match state.engine.set_steps_json(json).await {
        Ok(policy) => {
            tracing::info!(steps = policy.steps().len(), "Admin command /punishment_set_steps");
            let headline = format!(
                "✅ Шаги обновлены:\n{}",
                policy.steps_display().join("\n")
            );
            reply_policy_change(&bot, msg.chat.id, &state, headline).await
        }
        Err(error) => {
            bot.send_message(msg.chat.id, format!("❌ Ошибка: {}", error))
                .await?;
            Ok(())
        }
    }
}

async fn cmd_user_violations(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let username = command_argument(&msg);
    if username.is_empty() {
        bot.send_message(msg.chat.id, "Использование: /user_violations <username>")
            .await?;
        return Ok(());
    }

    let text = match state.engine.user_status(username).await {
        Ok(status) => render_user_violations(&status),
        Err(error) => format!("❌ Ошибка: {}", error),
    };
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

async fn cmd_clear_user_violations(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let target = command_argument(&msg);
    if target.is_empty() {
        bot.send_message(
            msg.chat.id,
            "Использование: /clear_user_violations <username|all>",
        )
        .await?;
        return Ok(());
    }
    tracing::info!(
        admin_id = ?sender_user_id(&msg),
        target = %target,
        "Admin command /clear_user_violations"
    );

    let text = match clear_target(target) {
        ClearTarget::All => match state.engine.clear_all_history().await {
            Ok(removed) => format!("🧹 История нарушений очищена, удалено записей: {}", removed),
            Err(error) => format!("❌ Ошибка: {}", error),
        },
        ClearTarget::User(username) => match state.engine.clear_user_history(username).await {
            Ok(removed) => format!("🧹 История {} очищена, удалено записей: {}", username, removed),
            Err(error) => format!("❌ Ошибка: {}", error),
        },
    };
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum ClearTarget<'a> {
    All,
    User(&'a str),
}

/// `ALL` в любом регистре очищает всю историю.
fn clear_target(argument: &str) -> ClearTarget<'_> {
    if argument.eq_ignore_ascii_case("all") {
        ClearTarget::All
    } else {
        ClearTarget::User(argument)
    }
}

pub async fn show_monitoring_status(bot: &Bot, chat_id: ChatId, state: &BotState) -> HandlerResult {
    let text = match state.warnings.monitoring_status().await {
        Ok(status) => render_monitoring_status(&status),
        Err(error) => format!("❌ Ошибка: {}", error),
    };
    bot.send_message(chat_id, text)
        .reply_markup(crate::bot::keyboards::monitoring_menu())
        .await?;
    Ok(())
}

async fn cmd_monitoring_status(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    show_monitoring_status(&bot, msg.chat.id, &state).await
}

pub async fn show_monitoring_details(bot: &Bot, chat_id: ChatId, state: &BotState) -> HandlerResult {
    let now = current_unix_timestamp()?;
    let mut entries = Vec::new();
    for warning in state.warnings.warnings().await {
        let analysis = state
            .warnings
            .analyze_user_activity_patterns(&warning.username)
            .await;
        entries.push((warning, analysis));
    }
    let text = render_monitoring_details(&entries, now);
    send_long_message(bot, chat_id, &text).await
}

async fn cmd_monitoring_details(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    show_monitoring_details(&bot, msg.chat.id, &state).await
}

pub async fn clear_monitoring(state: &BotState) -> String {
    match state.warnings.clear_all().await {
        Ok(count) => format!("🧹 Снято наблюдений: {}", count),
        Err(error) => format!("❌ Ошибка: {}", error),
    }
}

async fn cmd_clear_monitoring(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    tracing::info!(admin_id = ?sender_user_id(&msg), "Admin command /clear_monitoring");
    let text = clear_monitoring(&state).await;
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

pub async fn show_disabled_users(bot: &Bot, chat_id: ChatId, state: &BotState) -> HandlerResult {
    let users = state.db.list_disabled_users().await?;
    if users.is_empty() {
        bot.send_message(chat_id, "Отключённых пользователей нет.")
            .reply_markup(crate::bot::keyboards::admin_menu())
            .await?;
        return Ok(());
    }

    let lines: Vec<String> = users.iter().map(render_disabled_user_line).collect();
    let text = format!(
        "🚫 Отключённые пользователи: {}\n\n{}",
        users.len(),
        lines.join("\n")
    );
    send_long_message(bot, chat_id, &text).await
}

async fn cmd_disabled_users(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    show_disabled_users(&bot, msg.chat.id, &state).await
}

async fn cmd_enable_user(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let username = command_argument(&msg);
    if username.is_empty() {
        bot.send_message(msg.chat.id, "Использование: /enable_user <username>")
            .await?;
        return Ok(());
    }
    tracing::info!(
        admin_id = ?sender_user_id(&msg),
        username = %username,
        "Admin command /enable_user"
    );

    let text = match state.enforcer.enable(username).await {
        Ok(()) => match state.db.remove_disabled_user(username).await {
            Ok(true) => format!("🔓 Пользователь {} включён", username),
            Ok(false) => format!(
                "🔓 Пользователь {} включён (в списке отключённых не было)",
                username
            ),
            Err(error) => format!("❌ Ошибка: {}", error),
        },
        Err(error) => format!("❌ Ошибка: {}", error),
    };
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_keyword_ignores_case() {
        assert_eq!(clear_target("ALL"), ClearTarget::All);
        assert_eq!(clear_target("all"), ClearTarget::All);
        assert_eq!(clear_target("All"), ClearTarget::All);
        assert_eq!(clear_target("alice"), ClearTarget::User("alice"));
        assert_eq!(clear_target("allen"), ClearTarget::User("allen"));
    }
}
