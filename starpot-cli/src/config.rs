use anyhow::Context;
use serde::{Deserialize, Serialize};
use starpot_core::Amount;
use starpot_lottery::{LotteryConfig, DEFAULT_APP_ID, DEFAULT_ENTRY_FEE, DEFAULT_ROUND_KEY};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.json";
pub const DATABASE_FILE: &str = "starpot.db";

/// Optional `config.json` in the data directory. Missing keys fall back to
/// the library defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub app_id: String,
    pub round_key: String,
    pub entry_fee: Amount,
    pub op_timeout_secs: u64,
    pub retry_attempts: u32,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            round_key: DEFAULT_ROUND_KEY.to_string(),
            entry_fee: DEFAULT_ENTRY_FEE,
            op_timeout_secs: 10,
            retry_attempts: 3,
        }
    }
}

impl CliConfig {
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn lottery(&self) -> LotteryConfig {
        let mut config = LotteryConfig::new(&self.app_id, &self.round_key)
            .with_entry_fee(self.entry_fee)
            .with_op_timeout(Duration::from_secs(self.op_timeout_secs));
        config.retry.max_attempts = self.retry_attempts;
        config
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("starpot")
}
