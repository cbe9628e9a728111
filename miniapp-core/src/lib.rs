//! In-call mini app runtime core.
//! Host-driven: no I/O; the host passes telephony and channel events in and executes the actions
//! that come back. Timers are driven through `tick(now)`.

pub mod call;
pub mod channel;
pub mod config;
pub mod label;

pub mod bootstrap;
pub mod catalog;
pub mod http;
pub mod integrity;
pub mod launcher;
pub mod lifecycle;
pub mod negotiation;
pub mod own_channel;
pub mod registry;

pub use bootstrap::{BootstrapAction, BootstrapChannelProtocol, DownloadFailure};
pub use call::{CallId, CallInfo, CallPhase, CallState, MediaType};
pub use catalog::{MiniAppCatalog, MiniAppDescriptor, MiniAppStatus};
pub use channel::{ChannelEvent, ChannelHandle, ChannelState, DataChannel, ListenerKey, Outbound, SendCode, SEND_OK};
pub use config::CoreConfig;
pub use label::{ChannelFunction, ChannelLabel, LabelError, ROLE_LOCAL, ROLE_REMOTE};
pub use launcher::MiniAppProcessLauncher;
pub use lifecycle::{
    LaunchFailure, LifecycleAction, MiniAppLifecycleManager, StartError, StartOutcome, StartType,
};
pub use negotiation::{NegotiationMessage, PeerNegotiationChannel, StartOption};
pub use own_channel::{OwnAction, OwnChannelTransport};
pub use registry::{CreateOutcome, DataChannelRegistry, DataRoute, RegistryAction};
