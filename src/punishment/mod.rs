//! Система наказаний: политика шагов, движок эскалации и порт истории нарушений.

mod engine;
mod policy;
mod store;

pub use engine::{PunishmentAction, PunishmentEngine, RecentViolation, UserStatus};
pub use policy::{DEFAULT_WINDOW_HOURS, PunishmentPolicy, PunishmentStep, StepConfig};
pub use store::{NewViolation, ViolationRecord, ViolationStore};
pub(crate) use store::ViolationRow;
