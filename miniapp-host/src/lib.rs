//! Tokio host for the in-call mini app runtime.
//! Binds `miniapp-core` to a channel provider, an app-process launcher, a confirmation prompt and
//! an on-disk app store. One registry actor per session, one worker task per call.

pub mod app_store;
pub mod collaborators;
pub mod config;
pub mod logging;
pub mod provider;
pub mod session;

mod registry_actor;
mod worker;

pub use app_store::{FsAppStore, InstallError, InstalledVersion};
pub use collaborators::{AppLauncher, ConfirmationPrompt};
pub use config::{ConfigError, HostConfig};
pub use provider::{ChannelProvider, ProviderError, ProviderEvent};
pub use session::{SessionContext, SessionError, SessionEvent};
pub use worker::OWN_CHANNEL_APP_ID;

/// Clock for the core state machines; follows tokio's clock so paused-time tests work.
pub(crate) fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}
