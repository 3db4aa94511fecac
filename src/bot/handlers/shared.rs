use super::format::render_monitor_event;
use super::state::BotState;
use crate::monitor::MonitorEvent;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardMarkup, MessageId};
use teloxide::{ApiError, RequestError};
use tokio::sync::mpsc::UnboundedReceiver;

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Лимит Telegram 4096 символов, оставляем запас.
pub const MESSAGE_CHUNK_CHARS: usize = 4000;

pub fn callback_message_target(q: &CallbackQuery) -> Option<(ChatId, MessageId)> {
    q.message.as_ref().map(|msg| (msg.chat().id, msg.id()))
}

pub async fn require_admin_callback(
    bot: &Bot,
    q: &CallbackQuery,
    state: &BotState,
) -> Result<Option<i64>, anyhow::Error> {
    let admin_id = q.from.id.0 as i64;
    if !state.config.is_admin(admin_id) {
        bot.answer_callback_query(q.id.clone())
            .text("Недостаточно прав")
            .show_alert(true)
            .await?;
        return Ok(None);
    }
    Ok(Some(admin_id))
}

pub fn callback_prefix_filter(prefix: &'static str) -> impl Fn(CallbackQuery) -> Option<CallbackQuery> {
    move |q: CallbackQuery| {
        if q.data.as_deref().is_some_and(|payload| payload.starts_with(prefix)) {
            Some(q)
        } else {
            None
        }
    }
}

/// Режет текст по строкам на части не длиннее `limit` символов.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split('\n') {
        let line_len = line.chars().count();
        if current_len > 0 && current_len + 1 + line_len > limit {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > limit {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(limit) {
                if current_len > 0 {
                    chunks.push(std::mem::take(&mut current));
                }
                current = piece.iter().collect();
                current_len = piece.len();
            }
            continue;
        }
        if current_len > 0 {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

pub async fn send_long_message(bot: &Bot, chat_id: ChatId, text: &str) -> HandlerResult {
    for chunk in split_message(text, MESSAGE_CHUNK_CHARS) {
        bot.send_message(chat_id, chunk).await?;
    }
    Ok(())
}

pub async fn notify_admins(bot: &Bot, admin_ids: &[i64], text: &str) {
    for admin_id in admin_ids {
        if let Err(error) = bot.send_message(ChatId(*admin_id), text.to_string()).await {
            tracing::warn!(
                admin_id = *admin_id,
                error = %error,
                "Не удалось отправить уведомление админу"
            );
        }
    }
}

/// Записывает текущую политику в конфиг. Ошибка записи не откатывает изменение в памяти.
pub async fn persist_policy(state: &BotState) -> Option<String> {
    match state.policy_file.save(&state.engine).await {
        Ok(_) => None,
        Err(error) => {
            tracing::error!(error = %error, "Failed to write punishment policy to config");
            Some(format!(
                "⚠️ Изменение действует до перезапуска, конфиг не обновлён: {}",
                error
            ))
        }
    }
}

pub fn is_not_modified(error: &RequestError) -> bool {
    matches!(error, RequestError::Api(ApiError::MessageNotModified))
}

/// Повторное нажатие кнопки с тем же текстом не считается ошибкой.
pub async fn edit_callback_text(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    text: String,
    markup: InlineKeyboardMarkup,
) -> HandlerResult {
    match bot
        .edit_message_text(chat_id, message_id, text)
        .reply_markup(markup)
        .await
    {
        Ok(_) => Ok(()),
        Err(error) if is_not_modified(&error) => {
            tracing::debug!(chat_id = chat_id.0, "Callback message already up to date");
            Ok(())
        }
        Err(error) => Err(error.into()),
    }
}

/// Пересылает события мониторинга админам, пока цикл не остановится.
pub async fn forward_monitor_events(
    bot: Bot,
    admin_ids: Vec<i64>,
    mut events: UnboundedReceiver<MonitorEvent>,
) {
    while let Some(event) = events.recv().await {
        notify_admins(&bot, &admin_ids, &render_monitor_event(&event)).await;
    }
    tracing::info!("Monitor event channel closed");
}
