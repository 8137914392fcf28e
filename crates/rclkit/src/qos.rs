// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Quality-of-service profiles.
//!
//! Profiles are flat records handed to the transport unchanged. The runtime
//! itself never interprets them; the loopback transport only honors the
//! keep-last depth of subscription queues.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Duration meaning "use the middleware default".
pub const DURATION_UNSPECIFIED: Duration = Duration::ZERO;

/// Duration meaning "never expires".
pub const DURATION_INFINITE: Duration = Duration::new(9_223_372_036, 854_775_807);

/// History policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum History {
    #[default]
    SystemDefault,
    KeepLast,
    KeepAll,
    Unknown,
}

/// Reliability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    #[default]
    SystemDefault,
    Reliable,
    BestEffort,
    Unknown,
}

/// Durability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    #[default]
    SystemDefault,
    TransientLocal,
    Volatile,
    Unknown,
}

/// Liveliness policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveliness {
    #[default]
    SystemDefault,
    Automatic,
    ManualByTopic,
    Unknown,
}

/// A complete QoS profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QosProfile {
    pub history: History,
    pub depth: usize,
    pub reliability: Reliability,
    pub durability: Durability,
    pub deadline: Duration,
    pub lifespan: Duration,
    pub liveliness: Liveliness,
    pub liveliness_lease_duration: Duration,
    pub avoid_ros_namespace_conventions: bool,
}

impl Default for QosProfile {
    /// Keep-last 10, reliable, volatile.
    fn default() -> Self {
        Self {
            history: History::KeepLast,
            depth: 10,
            reliability: Reliability::Reliable,
            durability: Durability::Volatile,
            deadline: DURATION_UNSPECIFIED,
            lifespan: DURATION_UNSPECIFIED,
            liveliness: Liveliness::SystemDefault,
            liveliness_lease_duration: DURATION_UNSPECIFIED,
            avoid_ros_namespace_conventions: false,
        }
    }
}

impl QosProfile {
    /// Profile used for service request/response channels.
    pub fn services_default() -> Self {
        Self::default()
    }

    /// Profile used for the action status channel: keep-last 1, reliable,
    /// transient-local so late joiners see the current status array.
    pub fn status_default() -> Self {
        Self {
            depth: 1,
            durability: Durability::TransientLocal,
            ..Self::default()
        }
    }

    /// Best-effort keep-last 5, for high-rate sensor streams.
    pub fn sensor_data() -> Self {
        Self {
            depth: 5,
            reliability: Reliability::BestEffort,
            ..Self::default()
        }
    }

    /// Builder-style depth override.
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Builder-style history override.
    pub fn with_history(mut self, history: History) -> Self {
        self.history = history;
        self
    }

    /// Queue bound implied by the history policy, if any.
    pub(crate) fn queue_bound(&self) -> Option<usize> {
        match self.history {
            History::KeepLast | History::SystemDefault => Some(self.depth.max(1)),
            History::KeepAll | History::Unknown => None,
        }
    }
}

/// The five per-channel profiles of an action endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionQos {
    pub goal_service: QosProfile,
    pub cancel_service: QosProfile,
    pub result_service: QosProfile,
    pub feedback_topic: QosProfile,
    pub status_topic: QosProfile,
}

impl Default for ActionQos {
    fn default() -> Self {
        Self {
            goal_service: QosProfile::services_default(),
            cancel_service: QosProfile::services_default(),
            result_service: QosProfile::services_default(),
            feedback_topic: QosProfile::default(),
            status_topic: QosProfile::status_default(),
        }
    }
}

impl ActionQos {
    /// Applies `history` to the three request/response channels.
    pub fn with_service_history(mut self, history: History) -> Self {
        self.goal_service.history = history;
        self.cancel_service.history = history;
        self.result_service.history = history;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let default = QosProfile::default();
        assert_eq!(default.history, History::KeepLast);
        assert_eq!(default.depth, 10);
        assert_eq!(default.reliability, Reliability::Reliable);
        assert_eq!(default.durability, Durability::Volatile);
        assert_eq!(QosProfile::services_default(), default);

        let status = QosProfile::status_default();
        assert_eq!(status.depth, 1);
        assert_eq!(status.durability, Durability::TransientLocal);

        let sensor = QosProfile::sensor_data();
        assert_eq!(sensor.reliability, Reliability::BestEffort);
        assert_eq!(sensor.depth, 5);
    }

    #[test]
    fn test_queue_bound() {
        assert_eq!(QosProfile::default().queue_bound(), Some(10));
        assert_eq!(QosProfile::default().with_depth(0).queue_bound(), Some(1));
        assert_eq!(
            QosProfile::default()
                .with_history(History::KeepAll)
                .queue_bound(),
            None
        );
    }

    #[test]
    fn test_action_qos_service_history() {
        let qos = ActionQos::default().with_service_history(History::KeepAll);
        assert_eq!(qos.goal_service.history, History::KeepAll);
        assert_eq!(qos.cancel_service.history, History::KeepAll);
        assert_eq!(qos.result_service.history, History::KeepAll);
        assert_eq!(qos.status_topic, QosProfile::status_default());
    }

    #[test]
    fn test_partial_toml() {
        let qos: QosProfile = toml::from_str("depth = 3\nreliability = \"best_effort\"").unwrap();
        assert_eq!(qos.depth, 3);
        assert_eq!(qos.reliability, Reliability::BestEffort);
        assert_eq!(qos.history, History::KeepLast);
    }
}
