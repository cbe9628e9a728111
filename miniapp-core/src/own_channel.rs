//! Own channel: one internal channel per call tunnelling `{model, dataBase64}` envelopes for
//! SDK features, independent of any mini app.
//!
//! The send queue is bounded and drained by a single consumer: the channel must be open and the
//! previous send must have succeeded before the next envelope goes out.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::call::CallId;
use crate::channel::{ChannelHandle, ChannelState, Outbound, SendCode, SEND_OK};
use crate::config::CoreConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnEnvelope {
    pub model: String,
    pub data_base64: String,
}

impl OwnEnvelope {
    pub fn new(model: &str, data: &[u8]) -> Self {
        Self {
            model: model.to_string(),
            data_base64: STANDARD.encode(data),
        }
    }

    pub fn data(&self) -> Result<Vec<u8>, OwnChannelError> {
        Ok(STANDARD.decode(&self.data_base64)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnAction {
    Send(Outbound),
    /// Payload for the listener registered under `model`.
    Deliver { model: String, data: Vec<u8> },
}

#[derive(Debug, thiserror::Error)]
pub enum OwnChannelError {
    #[error("own channel send queue full ({0})")]
    QueueFull(usize),
    #[error("envelope json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

pub struct OwnChannelTransport {
    call_id: CallId,
    capacity: usize,
    pause: Duration,
    handle: Option<ChannelHandle>,
    state: ChannelState,
    queue: VecDeque<Vec<u8>>,
    in_flight: Option<Vec<u8>>,
    paused_until: Option<Instant>,
    models: HashSet<String>,
}

impl OwnChannelTransport {
    pub fn new(call_id: &CallId, config: &CoreConfig) -> Self {
        Self {
            call_id: call_id.clone(),
            capacity: config.own_queue_capacity,
            pause: config.own_send_pause(),
            handle: None,
            state: ChannelState::Closed,
            queue: VecDeque::new(),
            in_flight: None,
            paused_until: None,
            models: HashSet::new(),
        }
    }

    pub fn handle(&self) -> Option<ChannelHandle> {
        self.handle
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn attach(&mut self, handle: ChannelHandle) {
        debug!(call_id = %self.call_id, %handle, "own channel attached");
        self.handle = Some(handle);
        self.state = ChannelState::Connecting;
    }

    pub fn on_state(&mut self, state: ChannelState, now: Instant) -> Vec<OwnAction> {
        self.state = state;
        match state {
            ChannelState::Open => self.drain(now),
            ChannelState::Closing | ChannelState::Closed => {
                let dropped = self.queue.len() + usize::from(self.in_flight.is_some());
                if dropped > 0 {
                    debug!(call_id = %self.call_id, dropped, "own channel closing; send queue cleared");
                }
                self.queue.clear();
                self.in_flight = None;
                self.paused_until = None;
                if state == ChannelState::Closed {
                    self.handle = None;
                }
                Vec::new()
            }
            ChannelState::Connecting => Vec::new(),
        }
    }

    pub fn register_model(&mut self, model: &str) -> bool {
        self.models.insert(model.to_string())
    }

    pub fn unregister_model(&mut self, model: &str) -> bool {
        self.models.remove(model)
    }

    /// Queue a payload for `model`.
    pub fn send(
        &mut self,
        model: &str,
        data: &[u8],
        now: Instant,
    ) -> Result<Vec<OwnAction>, OwnChannelError> {
        if self.queue.len() >= self.capacity {
            return Err(OwnChannelError::QueueFull(self.capacity));
        }
        let bytes = serde_json::to_vec(&OwnEnvelope::new(model, data))?;
        self.queue.push_back(bytes);
        Ok(self.drain(now))
    }

    /// Result of the in-flight send. A failure puts the envelope back at the head and pauses.
    pub fn on_send_result(&mut self, code: SendCode, now: Instant) -> Vec<OwnAction> {
        let Some(bytes) = self.in_flight.take() else {
            debug!(call_id = %self.call_id, code, "own channel send result with nothing in flight");
            return Vec::new();
        };
        if code != SEND_OK {
            warn!(call_id = %self.call_id, code, "own channel send failed; pausing");
            self.queue.push_front(bytes);
            self.paused_until = Some(now + self.pause);
            return Vec::new();
        }
        self.drain(now)
    }

    pub fn tick(&mut self, now: Instant) -> Vec<OwnAction> {
        self.drain(now)
    }

    pub fn on_data(&self, bytes: &[u8]) -> Vec<OwnAction> {
        let envelope: OwnEnvelope = match serde_json::from_slice(bytes) {
            Ok(e) => e,
            Err(e) => {
                warn!(call_id = %self.call_id, error = %e, "malformed own-channel envelope");
                return Vec::new();
            }
        };
        if !self.models.contains(&envelope.model) {
            debug!(call_id = %self.call_id, model = %envelope.model, "no listener for model; dropped");
            return Vec::new();
        }
        match envelope.data() {
            Ok(data) => vec![OwnAction::Deliver {
                model: envelope.model,
                data,
            }],
            Err(e) => {
                warn!(call_id = %self.call_id, model = %envelope.model, error = %e, "bad own-channel payload");
                Vec::new()
            }
        }
    }

    fn drain(&mut self, now: Instant) -> Vec<OwnAction> {
        if self.state != ChannelState::Open || self.in_flight.is_some() {
            return Vec::new();
        }
        let Some(handle) = self.handle else {
            return Vec::new();
        };
        if let Some(until) = self.paused_until {
            if now < until {
                return Vec::new();
            }
            self.paused_until = None;
        }
        let Some(bytes) = self.queue.pop_front() else {
            return Vec::new();
        };
        self.in_flight = Some(bytes.clone());
        vec![OwnAction::Send(Outbound { handle, bytes })]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(now: Instant) -> OwnChannelTransport {
        let mut t = OwnChannelTransport::new(&"c1".into(), &CoreConfig::default());
        t.attach(ChannelHandle(8));
        t.on_state(ChannelState::Open, now);
        t
    }

    fn sent_model(actions: &[OwnAction]) -> Option<String> {
        actions.iter().find_map(|a| match a {
            OwnAction::Send(out) => serde_json::from_slice::<OwnEnvelope>(&out.bytes)
                .ok()
                .map(|e| e.model),
            OwnAction::Deliver { .. } => None,
        })
    }

    #[test]
    fn envelope_wire_shape() {
        let v = serde_json::to_value(OwnEnvelope::new("beauty", b"hi")).unwrap();
        assert_eq!(v, serde_json::json!({"model": "beauty", "dataBase64": "aGk="}));
    }

    #[test]
    fn one_send_in_flight() {
        let t0 = Instant::now();
        let mut t = open(t0);
        assert_eq!(sent_model(&t.send("a", b"1", t0).unwrap()).as_deref(), Some("a"));
        assert!(t.send("b", b"2", t0).unwrap().is_empty());
        assert_eq!(t.queue_len(), 1);
        assert_eq!(sent_model(&t.on_send_result(SEND_OK, t0)).as_deref(), Some("b"));
    }

    #[test]
    fn failure_pauses_then_resends_same_envelope() {
        let t0 = Instant::now();
        let mut t = open(t0);
        t.send("a", b"1", t0).unwrap();
        t.send("b", b"2", t0).unwrap();
        assert!(t.on_send_result(2, t0).is_empty());
        assert!(t.tick(t0 + Duration::from_millis(150)).is_empty());
        assert_eq!(
            sent_model(&t.tick(t0 + Duration::from_millis(200))).as_deref(),
            Some("a")
        );
    }

    #[test]
    fn nothing_sent_until_open() {
        let t0 = Instant::now();
        let mut t = OwnChannelTransport::new(&"c1".into(), &CoreConfig::default());
        t.attach(ChannelHandle(8));
        assert!(t.send("a", b"1", t0).unwrap().is_empty());
        assert_eq!(sent_model(&t.on_state(ChannelState::Open, t0)).as_deref(), Some("a"));
    }

    #[test]
    fn queue_is_bounded() {
        let config = CoreConfig {
            own_queue_capacity: 2,
            ..CoreConfig::default()
        };
        let t0 = Instant::now();
        let mut t = OwnChannelTransport::new(&"c1".into(), &config);
        t.send("a", b"1", t0).unwrap();
        t.send("a", b"2", t0).unwrap();
        assert!(matches!(
            t.send("a", b"3", t0),
            Err(OwnChannelError::QueueFull(2))
        ));
    }

    #[test]
    fn close_clears_queue() {
        let t0 = Instant::now();
        let mut t = open(t0);
        t.send("a", b"1", t0).unwrap();
        t.send("a", b"2", t0).unwrap();
        t.on_state(ChannelState::Closed, t0);
        assert_eq!(t.queue_len(), 0);
        assert!(t.on_send_result(SEND_OK, t0).is_empty());
        assert!(t.tick(t0 + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn inbound_routed_by_model() {
        let mut t = open(Instant::now());
        t.register_model("beauty");
        let bytes = serde_json::to_vec(&OwnEnvelope::new("beauty", b"frame")).unwrap();
        assert_eq!(
            t.on_data(&bytes),
            vec![OwnAction::Deliver {
                model: "beauty".into(),
                data: b"frame".to_vec()
            }]
        );
        let other = serde_json::to_vec(&OwnEnvelope::new("unknown", b"x")).unwrap();
        assert!(t.on_data(&other).is_empty());
        assert!(t.on_data(b"garbage").is_empty());
        assert!(t.unregister_model("beauty"));
        assert!(!t.unregister_model("beauty"));
    }
}
