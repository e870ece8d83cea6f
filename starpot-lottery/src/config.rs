use crate::{LotteryError, Result};
use serde::{Deserialize, Serialize};
use starpot_core::{Amount, DocPath};
use std::time::Duration;

pub const DEFAULT_APP_ID: &str = "default-crypto-lottery";
pub const DEFAULT_ROUND_KEY: &str = "current";
/// 0.005 coin
pub const DEFAULT_ENTRY_FEE: Amount = Amount::from_units(5_000_000);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotteryConfig {
    /// Application namespace the round document lives under.
    pub app_id: String,
    pub round_key: String,
    /// Fee written into a round when it is lazily created.
    pub default_entry_fee: Amount,
    /// Upper bound on a single store round trip.
    pub op_timeout: Duration,
    pub retry: RetryPolicy,
    /// Re-read/re-commit attempts when a draw or reset loses a race with a join.
    pub contention_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), doubling each time.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for LotteryConfig {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            round_key: DEFAULT_ROUND_KEY.to_string(),
            default_entry_fee: DEFAULT_ENTRY_FEE,
            op_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            contention_attempts: 5,
        }
    }
}

impl LotteryConfig {
    pub fn new(app_id: &str, round_key: &str) -> Self {
        let mut config = Self::default();
        config.app_id = app_id.to_string();
        config.round_key = round_key.to_string();
        config
    }

    pub fn with_entry_fee(mut self, fee: Amount) -> Self {
        self.default_entry_fee = fee;
        self
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn round_path(&self) -> Result<DocPath> {
        Ok(DocPath::parse(&format!(
            "artifacts/{}/public/data/lottery/{}",
            self.app_id, self.round_key
        ))?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_id.is_empty() || self.app_id.contains('/') {
            return Err(LotteryError::config("App id must be a single non-empty segment"));
        }

        if self.round_key.is_empty() || self.round_key.contains('/') {
            return Err(LotteryError::config("Round key must be a single non-empty segment"));
        }

        if self.default_entry_fee.is_zero() {
            return Err(LotteryError::config("Entry fee must be greater than 0"));
        }

        if self.default_entry_fee.as_delta().is_none() {
            return Err(LotteryError::config("Entry fee is too large"));
        }

        if self.op_timeout.is_zero() {
            return Err(LotteryError::config("Operation timeout must be greater than 0"));
        }

        if self.retry.max_attempts == 0 || self.contention_attempts == 0 {
            return Err(LotteryError::config("Attempt counts must be at least 1"));
        }

        Ok(())
    }
}
