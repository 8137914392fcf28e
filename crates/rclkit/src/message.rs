// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message traits, timestamps and the payload codec.
//!
//! User messages are plain Rust types. The runtime turns them into opaque
//! payload bytes with a single serde-based codec before handing them to the
//! transport; the transport never looks inside a payload.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A type that can travel over a topic or a service channel.
pub trait Message: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{}

/// A request/response service definition.
pub trait ServiceType: Send + Sync + 'static {
    type Request: Message;
    type Response: Message;

    /// Type name checked by the transport when endpoints are matched.
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Wall-clock timestamp with the layout of `builtin_interfaces/Time`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Time {
    pub sec: i32,
    pub nanosec: u32,
}

impl Time {
    /// The zero timestamp, used as "unset".
    pub const ZERO: Time = Time { sec: 0, nanosec: 0 };

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Time elapsed since the Unix epoch.
    pub fn as_duration(&self) -> Duration {
        Duration::new(self.sec.max(0) as u64, self.nanosec)
    }
}

impl From<SystemTime> for Time {
    fn from(t: SystemTime) -> Self {
        let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            sec: since.as_secs().min(i32::MAX as u64) as i32,
            nanosec: since.subsec_nanos(),
        }
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nanosec)
    }
}

pub(crate) fn encode<M: Serialize>(msg: &M) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

pub(crate) fn decode<M: DeserializeOwned>(payload: &[u8]) -> Result<M> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_ordering_and_zero() {
        assert!(Time::ZERO.is_zero());
        let a = Time { sec: 1, nanosec: 500 };
        let b = Time { sec: 1, nanosec: 600 };
        let c = Time { sec: 2, nanosec: 0 };
        assert!(a < b && b < c);
        assert_eq!(a.to_string(), "1.000000500");
    }

    #[test]
    fn test_time_now_is_after_epoch() {
        let now = Time::now();
        assert!(!now.is_zero());
        assert!(now.as_duration() > Duration::from_secs(1_600_000_000));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode::<Vec<i32>>(b"not json").unwrap_err();
        assert!(matches!(err, crate::Error::Codec(_)));
    }
}
