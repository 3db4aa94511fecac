use super::commands::{cmd_help, show_disabled_users, show_monitoring_status, show_punishment_panel};
use super::shared::HandlerResult;
use super::state::{BotState, is_admin_message};
use teloxide::prelude::*;

pub async fn handle_menu_buttons(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    if !is_admin_message(&msg, &state) {
        tracing::debug!(chat_id = msg.chat.id.0, "Ignoring message from non-admin");
        return Ok(());
    }

    match text {
        crate::bot::keyboards::BTN_ADMIN_MONITORING => {
            show_monitoring_status(&bot, msg.chat.id, &state).await?;
        }
        crate::bot::keyboards::BTN_ADMIN_PUNISHMENT => {
            show_punishment_panel(&bot, msg.chat.id, &state).await?;
        }
        crate::bot::keyboards::BTN_ADMIN_DISABLED => {
            show_disabled_users(&bot, msg.chat.id, &state).await?;
        }
        crate::bot::keyboards::BTN_ADMIN_HELP => {
            cmd_help(bot, msg).await?;
        }
        _ => {
            bot.send_message(
                msg.chat.id,
                "Не понял команду. Используйте кнопки админ-меню ниже.",
            )
            .reply_markup(crate::bot::keyboards::admin_menu())
            .await?;
        }
    }
    Ok(())
}
