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

use serde::{Deserialize, Serialize};

/// Per-object persistence statistics, in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    /// When the object was first added.
    pub creation_time: i64,
    /// When the object was last streamed for saving, `0` if never saved.
    pub last_save_time: i64,
    /// Moving average of the interval between two saves.
    pub avg_save_time: i64,
}

impl Statistics {
    /// Statistics of an object created at `now`.
    pub fn created(now: i64) -> Self {
        Self {
            creation_time: now,
            last_save_time: 0,
            avg_save_time: 0,
        }
    }

    /// Record a save started at `now`.
    ///
    /// The first save seeds the average with the age of the object. Later saves fold the interval since the
    /// previous save into the average with a 0.05 weight.
    pub fn record_save(&mut self, now: i64) {
        if self.last_save_time == 0 {
            self.avg_save_time = now - self.creation_time;
        } else {
            let diff = now - self.last_save_time;
            self.avg_save_time = (self.avg_save_time as f64 * 0.95 + diff as f64 * 0.05) as i64;
        }
        self.last_save_time = now;
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
