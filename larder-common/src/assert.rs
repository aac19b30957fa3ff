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

//! Invariant checks of the element lifecycle and the eviction queue.
//!
//! A check runs in debug builds, and also in release builds of a crate that enables its `strict_assertions`
//! feature. Every larder crate forwards the feature to its dependencies.

/// Check an invariant of the evictor state, panicking with the usual `assert!` message if it does not hold.
#[macro_export]
macro_rules! strict_assert {
    ($($arg:tt)*) => {
        if cfg!(any(debug_assertions, feature = "strict_assertions")) {
            assert!($($arg)*);
        }
    };
}

/// Check that two values of the evictor state are equal, in the builds where [`strict_assert!`] runs.
#[macro_export]
macro_rules! strict_assert_eq {
    ($($arg:tt)*) => {
        if cfg!(any(debug_assertions, feature = "strict_assertions")) {
            assert_eq!($($arg)*);
        }
    };
}
