//! Data channel handles, states and the channel-lifecycle event stream.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::call::CallId;
use crate::label::{ChannelFunction, ChannelLabel};

/// Provider-assigned channel handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelHandle(pub u64);

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dc#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Status code of a low-level send, reported asynchronously by the provider.
pub type SendCode = i32;

/// Send accepted by the provider.
pub const SEND_OK: SendCode = 0;

/// Bytes to hand to the provider's send primitive for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub handle: ChannelHandle,
    pub bytes: Vec<u8>,
}

/// A labelled channel. Its owning call never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannel {
    pub handle: ChannelHandle,
    pub call_id: CallId,
    pub label: ChannelLabel,
    pub state: ChannelState,
}

/// Where a channel event is routed.
///
/// `Control` and `Own` with `app_id: None` are per-call wildcard listeners: they receive
/// control/own channels for any app that has no exact listener of its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ListenerKey {
    Bootstrap(CallId),
    App { call_id: CallId, app_id: String },
    Control { call_id: CallId, app_id: Option<String> },
    Own { call_id: CallId, app_id: Option<String> },
}

impl ListenerKey {
    pub fn call_id(&self) -> &CallId {
        match self {
            ListenerKey::Bootstrap(call_id)
            | ListenerKey::App { call_id, .. }
            | ListenerKey::Control { call_id, .. }
            | ListenerKey::Own { call_id, .. } => call_id,
        }
    }

    /// Exact listener key for a labelled channel, chosen by the label's function.
    pub fn for_channel(channel: &DataChannel) -> Self {
        let call_id = channel.call_id.clone();
        let app_id = channel.label.app_id().to_string();
        match channel.label.function() {
            ChannelFunction::Control => ListenerKey::Control {
                call_id,
                app_id: Some(app_id),
            },
            ChannelFunction::Own => ListenerKey::Own {
                call_id,
                app_id: Some(app_id),
            },
            ChannelFunction::App(_) => ListenerKey::App { call_id, app_id },
        }
    }

    /// Per-call wildcard for control/own keys; app keys have none.
    pub fn wildcard(&self) -> Option<Self> {
        match self {
            ListenerKey::Control {
                call_id,
                app_id: Some(_),
            } => Some(ListenerKey::Control {
                call_id: call_id.clone(),
                app_id: None,
            }),
            ListenerKey::Own {
                call_id,
                app_id: Some(_),
            } => Some(ListenerKey::Own {
                call_id: call_id.clone(),
                app_id: None,
            }),
            _ => None,
        }
    }
}

/// Channel-lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The call's bootstrap channel was created.
    BootstrapCreated {
        call_id: CallId,
        handle: ChannelHandle,
    },
    /// A labelled channel was created, or replayed from the cache.
    Created(DataChannel),
    StateChanged {
        call_id: CallId,
        handle: ChannelHandle,
        state: ChannelState,
    },
    /// Inbound payload on an application channel.
    Data {
        call_id: CallId,
        handle: ChannelHandle,
        bytes: Vec<u8>,
    },
}
