//! Telegram-интерфейс администратора.

pub mod handlers;
pub mod keyboards;
