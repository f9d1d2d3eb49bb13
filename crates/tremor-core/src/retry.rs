//! Bounded exponential backoff shared by the acquirer and the dispatcher.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    8_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// A policy that retries `max_attempts - 1` times without sleeping.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
        }
    }

    /// Delay to wait before attempt number `attempt` (1-based). The first
    /// attempt never waits.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(attempt as i32 - 2);
        let ms = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms.max(0.0) as u64)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt cap is reached. `op` receives the 1-based attempt number.
    pub fn run<T, E, F, P>(&self, label: &str, mut op: F, is_transient: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let delay = self.delay_before(attempt);
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            match op(attempt) {
                Ok(v) => return Ok(v),
                Err(e) if attempt < max && is_transient(&e) => {
                    warn!(label, attempt, max, error = %e, "transient failure, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
