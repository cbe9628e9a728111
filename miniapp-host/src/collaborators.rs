//! Outward collaborators: the app-process launcher and the user confirmation prompt.

use miniapp_core::lifecycle::{LaunchFailure, StartType};
use miniapp_core::{CallId, MiniAppDescriptor};
use tokio::sync::oneshot;

pub trait AppLauncher: Send + Sync + 'static {
    /// Launch `app` (already installed at `app.install_path`) into presentation `slot`.
    fn launch(
        &self,
        call_id: &CallId,
        app: &MiniAppDescriptor,
        start_type: StartType,
        slot: usize,
    ) -> Result<(), LaunchFailure>;

    fn bring_to_front(&self, call_id: &CallId, app_id: &str);

    fn stop(&self, call_id: &CallId, app_id: &str);

    /// Call went on hold: pause background and native work, keep apps alive.
    fn suspend_background(&self, call_id: &CallId);
}

pub trait ConfirmationPrompt: Send + Sync + 'static {
    /// Ask the user whether to start `app` on the peer's request. Dropping `reply` counts as a
    /// rejection.
    fn confirm(&self, call_id: &CallId, app: &MiniAppDescriptor, reply: oneshot::Sender<bool>);
}
