use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connections::RetryPolicy;
use crate::error::CrownError;

/// Protocol timers and retry tuning.
///
/// The defaults form a consistent ladder: census cadence below the
/// crowning preparation window, which in turn sits below the
/// king-without-peasants window, so a device never gives up a role
/// faster than its peers can notice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrownConfig {
    /// Census broadcast cadence, also the idle keep-alive period on
    /// every connection.
    pub keep_alive_interval: Duration,
    /// How long a Prince (or an heir-following Peasant) waits after
    /// losing its King before acting. Must exceed `keep_alive_interval`.
    pub crowning_preparation_timeout: Duration,
    /// How long a King waits for `AckPronouncePrince` before picking a
    /// different candidate.
    pub prince_ack_timeout: Duration,
    /// How long a King tolerates an empty kingdom before stepping back
    /// down to Free. Must exceed `crowning_preparation_timeout`.
    pub king_without_peasants_timeout: Duration,
    /// How long a losing King waits for its subjects to migrate before
    /// disconnecting them and joining the winner itself.
    pub merge_bow_down_timeout: Duration,
    /// First-retry delay of the outbound connect backoff.
    pub connector_retry_timeout: Duration,
    pub exponential_backoff_factor: f64,
    pub max_connection_retries: u32,
    /// Granularity of the state machine's timer sweep.
    pub tick_interval: Duration,
}

impl Default for CrownConfig {
    fn default() -> Self {
        CrownConfig {
            keep_alive_interval: Duration::from_millis(500),
            crowning_preparation_timeout: Duration::from_millis(1200),
            prince_ack_timeout: Duration::from_millis(1000),
            king_without_peasants_timeout: Duration::from_millis(5000),
            merge_bow_down_timeout: Duration::from_millis(2000),
            connector_retry_timeout: Duration::from_millis(200),
            exponential_backoff_factor: 2.0,
            max_connection_retries: 3,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl CrownConfig {
    pub fn validate(&self) -> Result<(), CrownError> {
        if self.crowning_preparation_timeout <= self.keep_alive_interval {
            return Err(CrownError::InvalidConfig {
                reason: "crowning_preparation_timeout must exceed keep_alive_interval".into(),
            });
        }
        if self.king_without_peasants_timeout <= self.crowning_preparation_timeout {
            return Err(CrownError::InvalidConfig {
                reason: "king_without_peasants_timeout must exceed crowning_preparation_timeout"
                    .into(),
            });
        }
        if self.exponential_backoff_factor < 1.0 {
            return Err(CrownError::InvalidConfig {
                reason: "exponential_backoff_factor must be at least 1.0".into(),
            });
        }
        if self.tick_interval.is_zero() {
            return Err(CrownError::InvalidConfig {
                reason: "tick_interval must be non-zero".into(),
            });
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.connector_retry_timeout,
            backoff_factor: self.exponential_backoff_factor,
            max_retries: self.max_connection_retries,
        }
    }
}
