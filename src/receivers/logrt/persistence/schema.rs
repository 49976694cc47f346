// SPDX-License-Identifier: Apache-2.0

//! Persistence schema for watch state.
//!
//! Each watch is stored as a versioned envelope so that future layout changes can be
//! migrated on load.

use serde::{Deserialize, Serialize};

use crate::receivers::logrt::state::WatchState;

/// Current schema version for persisted state
pub const PERSISTED_STATE_VERSION: u8 = 1;

/// Persisted state of one watch (v1)
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedWatchStateV1 {
    /// Schema version (always 1 for this format)
    pub version: u8,
    pub state: WatchState,
}

impl PersistedWatchStateV1 {
    pub fn new(state: WatchState) -> Self {
        Self {
            version: PERSISTED_STATE_VERSION,
            state,
        }
    }
}

/// Serde adapter storing byte strings as standard base64 text.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: TryFrom<Vec<u8>>,
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(encoded).map_err(D::Error::custom)?;
        let len = bytes.len();
        T::try_from(bytes).map_err(|_| D::Error::custom(format!("unexpected length {}", len)))
    }
}
