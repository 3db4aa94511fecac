use crate::config::{Config, PolicyFile};
use crate::db::Db;
use crate::enforcement::Enforcer;
use crate::monitoring::WarningSystem;
use crate::punishment::PunishmentEngine;
use std::sync::Arc;
use teloxide::types::Message;

#[derive(Clone)]
pub struct BotState {
    pub config: Arc<Config>,
    pub db: Arc<Db>,
    pub engine: Arc<PunishmentEngine>,
    pub warnings: Arc<WarningSystem>,
    pub enforcer: Arc<dyn Enforcer>,
    pub policy_file: Arc<PolicyFile>,
}

pub fn sender_user_id(msg: &Message) -> Option<i64> {
    msg.from.as_ref().map(|user| user.id.0 as i64)
}

pub fn is_admin_message(msg: &Message, state: &BotState) -> bool {
    sender_user_id(msg).is_some_and(|user_id| state.config.is_admin(user_id))
}

/// Аргументы команды после её имени: `/cmd a b` → `"a b"`.
pub fn command_argument(msg: &Message) -> &str {
    msg.text()
        .and_then(|text| text.split_once(char::is_whitespace))
        .map(|(_, rest)| rest.trim())
        .unwrap_or("")
}
