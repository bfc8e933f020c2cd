use std::time::Duration;

use callcore::UserId;
use serde::{Deserialize, Serialize};

/// When a teardown notifies the peer with `call/reject`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum RejectPolicy {
    /// Reject only when we ended the call ourselves and the peer has not
    /// already signaled a terminal event.
    #[default]
    OnLocalTeardown,
    /// Reject on every teardown the peer can still hear about.
    Always,
}

/// Controller settings. Missing fields in a JSON config take the defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CallControllerConfig {
    /// Identity attached to every outbound envelope.
    pub local_id: UserId,
    pub reject_policy: RejectPolicy,
    /// How long a session may stay short of `Active` before it is torn down.
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// How long an incoming offer may wait for a decision before it is declined.
    #[serde(rename = "ring_timeout_ms", with = "millis")]
    pub ring_timeout: Duration,
    pub mailbox_capacity: usize,
}

impl CallControllerConfig {
    pub fn new(local_id: impl Into<UserId>) -> Self {
        Self {
            local_id: local_id.into(),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl Default for CallControllerConfig {
    fn default() -> Self {
        Self {
            local_id: UserId::random(),
            reject_policy: RejectPolicy::default(),
            connect_timeout: Duration::from_secs(30),
            ring_timeout: Duration::from_secs(45),
            mailbox_capacity: 64,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
