// Copyright 2026 larder Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

use larder_common::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};

/// Config of an evictor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictorConfig {
    /// Target number of idle servants kept in memory.
    pub evictor_size: usize,
    /// Number of pending modified objects that wakes the saving thread. Zero disables the size trigger.
    pub save_size_trigger: usize,
    /// Interval between two background saves. Zero disables the timer.
    pub save_period: Duration,
    /// Maximum number of objects written in one save transaction. `None` is ten times the size trigger.
    pub max_tx_size: Option<usize>,
    /// Maximum time to wait for a servant lock before streaming it. Expiry is fatal. `None` waits forever.
    pub stream_timeout: Option<Duration>,
    /// Rebuild empty secondary indices from the existing objects on open.
    pub populate_empty_indices: bool,
    /// Roll back an evictor-owned transaction when the servant returns an application error.
    pub rollback_on_user_exception: bool,
    /// Persist per-object statistics along with the servant state.
    pub keep_stats: bool,
    /// Create missing tables.
    pub create_db: bool,
}

impl Default for EvictorConfig {
    fn default() -> Self {
        Self {
            evictor_size: 10,
            save_size_trigger: 10,
            save_period: Duration::from_secs(60),
            max_tx_size: None,
            stream_timeout: None,
            populate_empty_indices: false,
            rollback_on_user_exception: false,
            keep_stats: true,
            create_db: true,
        }
    }
}

impl EvictorConfig {
    /// Effective maximum number of objects written in one save transaction.
    pub fn max_tx_size(&self) -> usize {
        match self.max_tx_size {
            Some(size) => size,
            None if self.save_size_trigger > 0 => self.save_size_trigger * 10,
            None => 100,
        }
    }

    /// Check the config.
    pub fn validate(&self) -> Result<()> {
        if self.max_tx_size == Some(0) {
            return Err(Error::new(ErrorKind::Config, "max transaction size must be positive"));
        }
        if self.stream_timeout == Some(Duration::ZERO) {
            return Err(Error::new(ErrorKind::Config, "stream timeout must be positive")
                .with_context("hint", "use None to disable the timeout"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EvictorConfig::default();
        assert_eq!(config.evictor_size, 10);
        assert_eq!(config.max_tx_size(), 100);
        assert!(config.validate().is_ok());

        let config = EvictorConfig {
            save_size_trigger: 0,
            ..Default::default()
        };
        assert_eq!(config.max_tx_size(), 100);

        let config = EvictorConfig {
            save_size_trigger: 3,
            ..Default::default()
        };
        assert_eq!(config.max_tx_size(), 30);

        let config = EvictorConfig {
            max_tx_size: Some(0),
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Config);
    }
}
