use crate::launcher::LauncherConfig;
use crate::terminal::TerminalConfig;
use crate::usage::UsageConfig;

/// Everything the service needs to start, resolved from flags and environment.
#[derive(Debug, Clone, Default)]
pub struct CompanionConfig {
    pub launcher: LauncherConfig,
    pub terminal: TerminalConfig,
    pub usage: UsageConfig,
}
