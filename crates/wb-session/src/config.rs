use serde::{Deserialize, Serialize};
use wb_core::RunOptions;

pub const DEFAULT_CONSOLE_MAX_LINES: usize = 2000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound of the console buffer; older lines are dropped first.
    pub console_max_lines: usize,
    pub persist_tabs: bool,
    /// File opened when hydration restores no tabs.
    pub default_file: Option<String>,
    pub run_options: RunOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            console_max_lines: DEFAULT_CONSOLE_MAX_LINES,
            persist_tabs: true,
            default_file: None,
            run_options: RunOptions::default(),
        }
    }
}

impl SessionConfig {
    pub fn console_capacity(&self) -> usize {
        self.console_max_lines.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wb_core::RunMode;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: SessionConfig = serde_json::from_str(
            r#"{"console_max_lines":50,"run_options":{"mode":"extraction"}}"#,
        )
        .expect("parse config");
        assert_eq!(config.console_max_lines, 50);
        assert!(config.persist_tabs);
        assert_eq!(config.run_options.mode, RunMode::Extraction);
        assert!(config.default_file.is_none());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let config = SessionConfig {
            console_max_lines: 0,
            ..SessionConfig::default()
        };
        assert_eq!(config.console_capacity(), 1);
    }
}
