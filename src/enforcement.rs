//! Исполнение наказаний на панели через настроенные внешние команды.

use crate::config::EnforcementConfig;
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

/// Отключение и включение пользователя на панели.
#[async_trait]
pub trait Enforcer: Send + Sync {
    /// `minutes == 0` означает бессрочно.
    async fn disable(&self, username: &str, minutes: u32) -> Result<(), anyhow::Error>;

    async fn enable(&self, username: &str) -> Result<(), anyhow::Error>;
}

#[derive(Debug)]
pub struct CommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct CommandEnforcer {
    disable_command: Vec<String>,
    enable_command: Vec<String>,
    timeout: Duration,
}

pub fn render_args(template: &[String], username: &str, minutes: u32) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{username}", username)
                .replace("{minutes}", &minutes.to_string())
        })
        .collect()
}

impl CommandEnforcer {
    pub fn new(config: &EnforcementConfig) -> Self {
        Self {
            disable_command: config.disable_command.clone(),
            enable_command: config.enable_command.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    async fn run_command(&self, action: &str, argv: Vec<String>) -> CommandResult {
        let Some((program, args)) = argv.split_first() else {
            tracing::error!(action = action, "Enforcement command is not configured");
            return CommandResult {
                success: false,
                stdout: String::new(),
                stderr: format!("Команда {} не настроена", action),
            };
        };
        tracing::info!(action = action, program = %program, "Running enforcement command");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(program).args(args).kill_on_drop(true).output(),
        )
        .await;

        match output {
            Ok(Ok(o)) => {
                let result = CommandResult {
                    success: o.status.success(),
                    stdout: String::from_utf8_lossy(&o.stdout).trim().to_string(),
                    stderr: String::from_utf8_lossy(&o.stderr).trim().to_string(),
                };
                if !result.success {
                    tracing::warn!(
                        action = action,
                        stderr = %result.stderr,
                        "Enforcement command returned non-zero status"
                    );
                }
                result
            }
            Ok(Err(e)) => {
                tracing::error!(action = action, error = %e, "Failed to execute enforcement command");
                CommandResult {
                    success: false,
                    stdout: String::new(),
                    stderr: format!("Ошибка запуска {}: {}", program, e),
                }
            }
            Err(_) => {
                tracing::error!(
                    action = action,
                    timeout_secs = self.timeout.as_secs(),
                    "Enforcement command timed out"
                );
                CommandResult {
                    success: false,
                    stdout: String::new(),
                    stderr: format!("Команда {} не завершилась за {:?}", action, self.timeout),
                }
            }
        }
    }

    /// Без stderr в ошибку попадает stdout команды.
    fn into_result(action: &str, username: &str, result: CommandResult) -> Result<(), anyhow::Error> {
        if result.success {
            tracing::debug!(
                action = action,
                username = %username,
                stdout = %result.stdout,
                "Enforcement command succeeded"
            );
            return Ok(());
        }
        let details = if result.stderr.is_empty() {
            result.stdout
        } else {
            result.stderr
        };
        Err(anyhow::anyhow!(
            "{} {} не выполнено: {}",
            action,
            username,
            details
        ))
    }
}

#[async_trait]
impl Enforcer for CommandEnforcer {
    async fn disable(&self, username: &str, minutes: u32) -> Result<(), anyhow::Error> {
        let argv = render_args(&self.disable_command, username, minutes);
        let result = self.run_command("disable", argv).await;
        Self::into_result("disable", username, result)
    }

    async fn enable(&self, username: &str) -> Result<(), anyhow::Error> {
        let argv = render_args(&self.enable_command, username, 0);
        let result = self.run_command("enable", argv).await;
        Self::into_result("enable", username, result)
    }
}
