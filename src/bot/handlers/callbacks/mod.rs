use super::commands::{clear_monitoring, show_monitoring_details, show_monitoring_status};
use super::format::{render_monitoring_status, render_punishment_status};
use super::shared::{
    HandlerResult, callback_message_target, callback_prefix_filter, edit_callback_text,
    persist_policy, require_admin_callback,
};
use super::state::BotState;
use teloxide::dptree;
use teloxide::prelude::*;

pub fn handler() -> teloxide::dispatching::UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>> {
    Update::filter_callback_query()
        .branch(
            dptree::filter_map(callback_prefix_filter("monitoring:")).endpoint(callback_monitoring),
        )
        .branch(
            dptree::filter_map(callback_prefix_filter("punishment:")).endpoint(callback_punishment),
        )
}

async fn callback_monitoring(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let Some(admin_id) = require_admin_callback(&bot, &q, &state).await? else {
        return Ok(());
    };

    let data = q.data.as_deref().unwrap_or("");
    let action = data.strip_prefix("monitoring:").unwrap_or("status");
    tracing::info!(admin_id = admin_id, action = %action, "Monitoring callback received");
    let target = callback_message_target(&q);

    match action {
        "details" => {
            bot.answer_callback_query(q.id.clone()).await?;
            if let Some((chat_id, _)) = target {
                show_monitoring_details(&bot, chat_id, &state).await?;
            }
        }
        "clear" => {
            let text = clear_monitoring(&state).await;
            bot.answer_callback_query(q.id.clone()).text(text.clone()).await?;
            if let Some((chat_id, message_id)) = target {
                edit_callback_text(
                    &bot,
                    chat_id,
                    message_id,
                    text,
                    crate::bot::keyboards::monitoring_menu(),
                )
                .await?;
            }
        }
        _ => {
            bot.answer_callback_query(q.id.clone()).text("Обновлено").await?;
            match target {
                Some((chat_id, message_id)) => {
                    let text = match state.warnings.monitoring_status().await {
                        Ok(status) => render_monitoring_status(&status),
                        Err(error) => format!("❌ Ошибка: {}", error),
                    };
                    edit_callback_text(
                        &bot,
                        chat_id,
                        message_id,
                        text,
                        crate::bot::keyboards::monitoring_menu(),
                    )
                    .await?;
                }
                None => {
                    show_monitoring_status(&bot, ChatId(admin_id), &state).await?;
                }
            }
        }
    }
    Ok(())
}

async fn callback_punishment(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let Some(admin_id) = require_admin_callback(&bot, &q, &state).await? else {
        return Ok(());
    };

    let data = q.data.as_deref().unwrap_or("");
    let action = data.strip_prefix("punishment:").unwrap_or("steps");
    tracing::info!(admin_id = admin_id, action = %action, "Punishment callback received");

    let (answer, note) = if action == "toggle" {
        let policy = state.engine.toggle().await;
        let answer = if policy.enabled() {
            "Система включена"
        } else {
            "Система выключена"
        };
        (answer.to_string(), persist_policy(&state).await)
    } else if let Some(raw_hours) = action.strip_prefix("window:") {
        let hours = raw_hours.parse::<i64>().unwrap_or(0);
        match state.engine.set_window_hours(hours).await {
            Ok(policy) => (
                format!("Окно: {} ч", policy.window_hours()),
                persist_policy(&state).await,
            ),
            Err(error) => (format!("Ошибка: {}", error), None),
        }
    } else {
        ("Текущие шаги".to_string(), None)
    };

    bot.answer_callback_query(q.id.clone()).text(answer).await?;

    let policy = state.engine.policy().await;
    let mut text = render_punishment_status(&policy);
    if let Some(note) = note {
        text.push_str("\n\n");
        text.push_str(&note);
    }
    if let Some((chat_id, message_id)) = callback_message_target(&q) {
        edit_callback_text(
            &bot,
            chat_id,
            message_id,
            text,
            crate::bot::keyboards::punishment_menu(policy.enabled()),
        )
        .await?;
    }
    Ok(())
}
