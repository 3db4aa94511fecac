//! Клавиатуры бота: inline и постоянные reply-кнопки.

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, KeyboardButton, KeyboardMarkup};

pub const BTN_ADMIN_MONITORING: &str = "👁 Мониторинг";
pub const BTN_ADMIN_PUNISHMENT: &str = "⚖️ Наказания";
pub const BTN_ADMIN_DISABLED: &str = "🚫 Отключённые";
pub const BTN_ADMIN_HELP: &str = "❓ Помощь";

pub fn admin_menu() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![
        vec![
            KeyboardButton::new(BTN_ADMIN_MONITORING),
            KeyboardButton::new(BTN_ADMIN_PUNISHMENT),
        ],
        vec![
            KeyboardButton::new(BTN_ADMIN_DISABLED),
            KeyboardButton::new(BTN_ADMIN_HELP),
        ],
    ])
    .resize_keyboard()
    .persistent()
}

pub fn monitoring_menu() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::default()
        .append_row(vec![
            InlineKeyboardButton::callback("📊 Статус", "monitoring:status"),
            InlineKeyboardButton::callback("🔍 Подробно", "monitoring:details"),
        ])
        .append_row(vec![InlineKeyboardButton::callback(
            "🧹 Очистить наблюдения",
            "monitoring:clear",
        )])
}

pub fn punishment_menu(enabled: bool) -> InlineKeyboardMarkup {
    let toggle_label = if enabled {
        "⏸ Выключить систему"
    } else {
        "▶️ Включить систему"
    };
    InlineKeyboardMarkup::default()
        .append_row(vec![InlineKeyboardButton::callback(
            toggle_label,
            "punishment:toggle",
        )])
        .append_row(vec![
            InlineKeyboardButton::callback("24 ч", "punishment:window:24"),
            InlineKeyboardButton::callback("48 ч", "punishment:window:48"),
            InlineKeyboardButton::callback("72 ч", "punishment:window:72"),
        ])
        .append_row(vec![InlineKeyboardButton::callback(
            "📋 Шаги наказаний",
            "punishment:steps",
        )])
}
