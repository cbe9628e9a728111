//! Cross-peer start negotiation over one app's control channel.
//!
//! Wire format is JSON `{"cmd": ..., "params": ...}` with two commands, `requestStartApp` and
//! `responseStartApp`. Sends are fire-and-forget: the send result is logged, never retried.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::MiniAppDescriptor;
use crate::channel::{ChannelHandle, ChannelState, Outbound, SendCode, SEND_OK};
use crate::config::CoreConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StartOption {
    Agree,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "params")]
pub enum NegotiationMessage {
    #[serde(rename = "requestStartApp")]
    RequestStartApp {
        #[serde(rename = "appInfo")]
        app_info: MiniAppDescriptor,
    },
    #[serde(rename = "responseStartApp")]
    ResponseStartApp { option: StartOption },
}

impl NegotiationMessage {
    pub fn encode(&self) -> Result<Vec<u8>, NegotiationError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NegotiationError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("negotiation json: {0}")]
    Json(#[from] serde_json::Error),
}

/// One negotiating app's control channel.
pub struct PeerNegotiationChannel {
    app: MiniAppDescriptor,
    handle: Option<ChannelHandle>,
    state: ChannelState,
    request_delay: Duration,
    request_at: Option<Instant>,
    requested: bool,
}

impl PeerNegotiationChannel {
    /// `app` is what gets announced to the peer in `requestStartApp`.
    pub fn new(app: MiniAppDescriptor, config: &CoreConfig) -> Self {
        Self {
            app,
            handle: None,
            state: ChannelState::Connecting,
            request_delay: config.negotiation_request_delay(),
            request_at: None,
            requested: false,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app.app_id
    }

    pub fn handle(&self) -> Option<ChannelHandle> {
        self.handle
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open && self.handle.is_some()
    }

    pub fn attach(&mut self, handle: ChannelHandle) {
        debug!(app_id = %self.app.app_id, %handle, "control channel attached");
        self.handle = Some(handle);
        self.state = ChannelState::Connecting;
    }

    /// On open, arm the one-shot start request if the app asks for it.
    pub fn on_state(&mut self, state: ChannelState, now: Instant) {
        self.state = state;
        match state {
            ChannelState::Open if self.app.auto_request_remote && !self.requested => {
                self.request_at = Some(now + self.request_delay);
            }
            ChannelState::Closing | ChannelState::Closed => {
                self.request_at = None;
                if state == ChannelState::Closed {
                    self.handle = None;
                }
            }
            _ => {}
        }
    }

    /// Fire the delayed start request once it is due.
    pub fn tick(&mut self, now: Instant) -> Option<Outbound> {
        let due = self.request_at.is_some_and(|t| now >= t);
        if !due {
            return None;
        }
        self.request_at = None;
        self.requested = true;
        info!(app_id = %self.app.app_id, "asking peer to start app");
        self.outbound(&NegotiationMessage::RequestStartApp {
            app_info: self.app.clone(),
        })
    }

    /// Answer a peer start request.
    pub fn respond(&mut self, agreed: bool) -> Option<Outbound> {
        let option = if agreed {
            StartOption::Agree
        } else {
            StartOption::Reject
        };
        self.outbound(&NegotiationMessage::ResponseStartApp { option })
    }

    /// Decode inbound bytes. Malformed payloads are logged and dropped.
    pub fn on_data(&self, bytes: &[u8]) -> Option<NegotiationMessage> {
        match NegotiationMessage::decode(bytes) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!(app_id = %self.app.app_id, error = %e, "malformed negotiation payload");
                None
            }
        }
    }

    pub fn on_send_result(&self, code: SendCode) {
        if code == SEND_OK {
            debug!(app_id = %self.app.app_id, "negotiation message sent");
        } else {
            warn!(app_id = %self.app.app_id, code, "negotiation send failed");
        }
    }

    fn outbound(&self, msg: &NegotiationMessage) -> Option<Outbound> {
        let Some(handle) = self.handle.filter(|_| self.state == ChannelState::Open) else {
            warn!(app_id = %self.app.app_id, "control channel not open; message dropped");
            return None;
        };
        match msg.encode() {
            Ok(bytes) => Some(Outbound { handle, bytes }),
            Err(e) => {
                warn!(app_id = %self.app.app_id, error = %e, "cannot encode negotiation message");
                None
            }
        }
    }
}
