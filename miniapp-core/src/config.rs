//! Timing and limit constants shared by every core state machine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::SendCode;

/// Core configuration. Every field has a default; a host may override any of them from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    /// Value sent as `sdkVersion` on every bootstrap request.
    #[serde(default = "default_sdk_version")]
    pub sdk_version: String,
    /// Delay before a bootstrap request is resubmitted after a transient send failure (default 100 ms).
    #[serde(default = "default_send_retry_delay_ms")]
    pub send_retry_delay_ms: u64,
    /// Consecutive transient failures after which a bootstrap request is dropped (default 3).
    #[serde(default = "default_max_send_retries")]
    pub max_send_retries: u32,
    /// Send-result codes treated as transient (default busy = 2, buffer full = 3).
    #[serde(default = "default_transient_send_codes")]
    pub transient_send_codes: Vec<SendCode>,
    /// Call-state refresh period while the bootstrap channel is open (default 300 ms).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Creation queue poll period (default 1 s).
    #[serde(default = "default_creation_poll_interval_ms")]
    pub creation_poll_interval_ms: u64,
    /// Forced wait before the creation gate reopens without a provider ack (default 3 s).
    #[serde(default = "default_creation_gate_timeout_ms")]
    pub creation_gate_timeout_ms: u64,
    /// Delay before a creation attempt blocked by a closing channel is retried (default 1 s).
    #[serde(default = "default_closing_retry_delay_ms")]
    pub closing_retry_delay_ms: u64,
    /// Bounded creation queue capacity (default 100).
    #[serde(default = "default_creation_queue_capacity")]
    pub creation_queue_capacity: usize,
    /// Bounded own-channel send queue capacity (default 10 000).
    #[serde(default = "default_own_queue_capacity")]
    pub own_queue_capacity: usize,
    /// Pause after a failed own-channel send (default 200 ms).
    #[serde(default = "default_own_send_pause_ms")]
    pub own_send_pause_ms: u64,
    /// Delay of the one-shot remote start request after a control channel opens (default 1 s).
    #[serde(default = "default_negotiation_request_delay_ms")]
    pub negotiation_request_delay_ms: u64,
    /// User rejections after which peer start requests for an app are ignored (default 3).
    #[serde(default = "default_max_passive_rejects")]
    pub max_passive_rejects: u32,
    /// Presentation slots available to the process launcher (default 10).
    #[serde(default = "default_presentation_slots")]
    pub presentation_slots: usize,
    /// `app-num` of each catalog page request (default 20).
    #[serde(default = "default_catalog_page_size")]
    pub catalog_page_size: usize,
}

fn default_sdk_version() -> String {
    "1.0".to_string()
}
fn default_send_retry_delay_ms() -> u64 {
    100
}
fn default_max_send_retries() -> u32 {
    3
}
fn default_transient_send_codes() -> Vec<SendCode> {
    vec![2, 3]
}
fn default_heartbeat_interval_ms() -> u64 {
    300
}
fn default_creation_poll_interval_ms() -> u64 {
    1_000
}
fn default_creation_gate_timeout_ms() -> u64 {
    3_000
}
fn default_closing_retry_delay_ms() -> u64 {
    1_000
}
fn default_creation_queue_capacity() -> usize {
    100
}
fn default_own_queue_capacity() -> usize {
    10_000
}
fn default_own_send_pause_ms() -> u64 {
    200
}
fn default_negotiation_request_delay_ms() -> u64 {
    1_000
}
fn default_max_passive_rejects() -> u32 {
    3
}
fn default_presentation_slots() -> usize {
    10
}
fn default_catalog_page_size() -> usize {
    20
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            sdk_version: default_sdk_version(),
            send_retry_delay_ms: default_send_retry_delay_ms(),
            max_send_retries: default_max_send_retries(),
            transient_send_codes: default_transient_send_codes(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            creation_poll_interval_ms: default_creation_poll_interval_ms(),
            creation_gate_timeout_ms: default_creation_gate_timeout_ms(),
            closing_retry_delay_ms: default_closing_retry_delay_ms(),
            creation_queue_capacity: default_creation_queue_capacity(),
            own_queue_capacity: default_own_queue_capacity(),
            own_send_pause_ms: default_own_send_pause_ms(),
            negotiation_request_delay_ms: default_negotiation_request_delay_ms(),
            max_passive_rejects: default_max_passive_rejects(),
            presentation_slots: default_presentation_slots(),
            catalog_page_size: default_catalog_page_size(),
        }
    }
}

impl CoreConfig {
    pub fn send_retry_delay(&self) -> Duration {
        Duration::from_millis(self.send_retry_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn creation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.creation_poll_interval_ms)
    }

    pub fn creation_gate_timeout(&self) -> Duration {
        Duration::from_millis(self.creation_gate_timeout_ms)
    }

    pub fn closing_retry_delay(&self) -> Duration {
        Duration::from_millis(self.closing_retry_delay_ms)
    }

    pub fn own_send_pause(&self) -> Duration {
        Duration::from_millis(self.own_send_pause_ms)
    }

    pub fn negotiation_request_delay(&self) -> Duration {
        Duration::from_millis(self.negotiation_request_delay_ms)
    }

    /// True when `code` is one of the configured transient send failures.
    pub fn is_transient(&self, code: SendCode) -> bool {
        self.transient_send_codes.contains(&code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let c = CoreConfig::default();
        assert_eq!(c.send_retry_delay(), Duration::from_millis(100));
        assert_eq!(c.heartbeat_interval(), Duration::from_millis(300));
        assert_eq!(c.creation_gate_timeout(), Duration::from_secs(3));
        assert_eq!(c.max_send_retries, 3);
        assert_eq!(c.creation_queue_capacity, 100);
        assert_eq!(c.own_queue_capacity, 10_000);
        assert_eq!(c.presentation_slots, 10);
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let c: CoreConfig = serde_json::from_str(r#"{"heartbeat_interval_ms": 50}"#).unwrap();
        assert_eq!(c.heartbeat_interval_ms, 50);
        assert_eq!(c.send_retry_delay_ms, 100);
        assert!(c.is_transient(2));
        assert!(!c.is_transient(0));
    }

    #[test]
    fn unknown_fields_rejected() {
        let r: Result<CoreConfig, _> = serde_json::from_str(r#"{"bogus": 1}"#);
        assert!(r.is_err());
    }
}
