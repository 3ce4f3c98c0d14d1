//! Structural checks applied to headers and bodies before they enter a queue.
//!
//! These checks need no chain state and no signature verification; full block
//! validation happens in the importer.

use std::time::{SystemTime, UNIX_EPOCH};

use rusty_sync_types::{BlockBody, BlockHeader, U256};

use crate::config::ValidationConfig;
use crate::error::ValidationError;

/// Context-free header validation
pub trait HeaderValidator: Send + Sync {
    fn validate(&self, header: &BlockHeader) -> Result<(), ValidationError>;

    /// Checks that need the parent header
    fn validate_with_parent(&self, header: &BlockHeader, parent: &BlockHeader) -> Result<(), ValidationError> {
        if header.timestamp <= parent.timestamp {
            return Err(ValidationError::TimestampNotIncreasing {
                number: header.number,
                timestamp: header.timestamp,
                parent: parent.timestamp,
            });
        }
        Ok(())
    }
}

/// Timestamp, difficulty, extra data and gas checks
#[derive(Debug, Clone)]
pub struct BasicHeaderValidator {
    config: ValidationConfig,
}

impl BasicHeaderValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    fn now_secs() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
    }

    /// Validate against an explicit clock reading.
    pub fn validate_at(&self, header: &BlockHeader, now_secs: u64) -> Result<(), ValidationError> {
        let number = header.number;

        let limit = now_secs.saturating_add(self.config.max_future_secs);
        if header.timestamp > limit {
            return Err(ValidationError::TimestampInFuture { number, timestamp: header.timestamp, limit });
        }

        if header.difficulty < U256::from(self.config.min_difficulty) {
            return Err(ValidationError::DifficultyOutOfBounds { number });
        }

        if header.extra_data.len() > self.config.max_extra_data {
            return Err(ValidationError::ExtraDataTooLong {
                number,
                len: header.extra_data.len(),
                max: self.config.max_extra_data,
            });
        }

        if header.gas_used > header.gas_limit {
            return Err(ValidationError::GasUsedExceedsLimit { number, used: header.gas_used, limit: header.gas_limit });
        }

        Ok(())
    }
}

impl Default for BasicHeaderValidator {
    fn default() -> Self {
        Self::new(ValidationConfig::default())
    }
}

impl HeaderValidator for BasicHeaderValidator {
    fn validate(&self, header: &BlockHeader) -> Result<(), ValidationError> {
        self.validate_at(header, Self::now_secs())
    }
}

/// Check that `body` is the one `header` commits to.
pub fn validate_body(header: &BlockHeader, body: &BlockBody) -> Result<(), ValidationError> {
    if body.matches(header) {
        Ok(())
    } else {
        Err(ValidationError::BodyMismatch { number: header.number })
    }
}
