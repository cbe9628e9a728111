//! Channel provider RPC contract.
//!
//! Requests are non-blocking: each method hands the request to the provider and returns. Outcomes
//! (created channels, state changes, inbound data, send results) come back as [`ProviderEvent`]s
//! through [`crate::SessionContext::provider_event`], from whatever thread the provider uses.

use miniapp_core::{CallId, ChannelHandle, ChannelState, SendCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// Provider bound.
    Connected,
    /// Provider unbound or died.
    Disconnected,
    BootstrapCreated {
        call_id: CallId,
        handle: ChannelHandle,
    },
    /// A labelled channel was created by either end of the call.
    ChannelCreated {
        call_id: CallId,
        label: String,
        handle: ChannelHandle,
    },
    /// Acknowledgement of one `create_channels` call.
    CreateResult { call_id: CallId, ok: bool },
    StateChanged {
        handle: ChannelHandle,
        state: ChannelState,
    },
    Data {
        handle: ChannelHandle,
        bytes: Vec<u8>,
    },
    SendResult {
        handle: ChannelHandle,
        code: SendCode,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("channel provider not bound")]
    NotBound,
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelHandle),
    #[error("provider call failed: {0}")]
    Rpc(String),
}

pub trait ChannelProvider: Send + Sync + 'static {
    fn open_bootstrap(&self, call_id: &CallId, slot: u32) -> Result<(), ProviderError>;

    fn create_channels(
        &self,
        call_id: &CallId,
        slot: u32,
        labels: &[String],
        description_xml: &str,
    ) -> Result<(), ProviderError>;

    fn send(&self, handle: ChannelHandle, bytes: &[u8]) -> Result<(), ProviderError>;

    fn buffered_amount(&self, handle: ChannelHandle) -> Result<u64, ProviderError>;
}
