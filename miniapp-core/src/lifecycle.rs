//! Per-call mini app lifecycle: discovery, download, install, start/stop, autoload, passive starts
//! and the per-app negotiation channels.
//!
//! Every start request ends in exactly one [`LifecycleAction::StartResult`], either immediately
//! (failures, bring-to-front, already in progress) or once download, install and launch resolve.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::bootstrap::DownloadFailure;
use crate::call::{CallId, CallInfo, CallPhase, CallState, MediaType};
use crate::catalog::{MiniAppCatalog, MiniAppDescriptor, MiniAppStatus, PhaseRequirement};
use crate::channel::{ChannelHandle, ChannelState, DataChannel, Outbound, SendCode};
use crate::config::CoreConfig;
use crate::label::{ChannelLabel, ROLE_LOCAL, ROLE_REMOTE};
use crate::launcher::{MiniAppProcessLauncher, SlotAssignment};
use crate::negotiation::{NegotiationMessage, PeerNegotiationChannel, StartOption};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartType {
    User,
    AutoLoad,
    /// Started on the peer's request after local confirmation.
    Passive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    BroughtToFront,
    InProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UnsupportedReason {
    #[error("call media does not match the app scene")]
    Scene,
    #[error("call phase does not match the app phase")]
    Phase,
    #[error("peer has no data channel support")]
    DataChannel,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("mini app not found")]
    AppNotFound,
    #[error("unsupported: {0}")]
    Unsupported(UnsupportedReason),
    #[error("mini app has no version tag")]
    MissingVersion,
    #[error("download failed: {0}")]
    DownloadFailed(DownloadFailure),
    #[error("install failed: {0}")]
    InstallFailed(String),
    #[error("launch failed: {0}")]
    LaunchFailed(String),
    #[error("permission denied")]
    PermissionDenied,
    #[error("call ended")]
    CallEnded,
}

/// Why the app-launch collaborator could not launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchFailure {
    PermissionDenied,
    Failed(String),
}

impl From<LaunchFailure> for StartError {
    fn from(f: LaunchFailure) -> Self {
        match f {
            LaunchFailure::PermissionDenied => StartError::PermissionDenied,
            LaunchFailure::Failed(msg) => StartError::LaunchFailed(msg),
        }
    }
}

/// An extracted archive on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledApp {
    pub etag: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleAction {
    FetchBinary {
        app_id: String,
        if_none_match: Option<String>,
    },
    Install {
        app_id: String,
        etag: String,
        archive: Vec<u8>,
        sha256: Option<String>,
    },
    Launch {
        app: MiniAppDescriptor,
        start_type: StartType,
        slot: usize,
    },
    BringToFront {
        app_id: String,
    },
    Stop {
        app_id: String,
    },
    /// Active to holding: pause background work, keep apps running.
    SuspendBackground,
    StartResult {
        app_id: String,
        result: Result<StartOutcome, StartError>,
    },
    StatusChanged {
        app_id: String,
        status: MiniAppStatus,
    },
    DownloadProgress {
        app_id: String,
        percent: u8,
    },
    CatalogUpdated {
        apps: Vec<MiniAppDescriptor>,
    },
    /// Ask the user whether to start an app the peer requested.
    ConfirmPassiveStart {
        app: MiniAppDescriptor,
    },
    CreateControlChannel {
        app_id: String,
        label: String,
    },
    CloseNegotiation {
        app_id: String,
    },
    Send(Outbound),
    PeerResponded {
        app_id: String,
        agreed: bool,
    },
}

#[derive(Debug, Default)]
struct Autoload {
    captured: bool,
    pre_call: Option<String>,
    in_call: Option<String>,
    pre_call_fired: bool,
    in_call_fired: bool,
}

impl Autoload {
    /// Exact-phase candidates first; apps allowed in both phases fill what is left.
    fn capture(&mut self, apps: &[MiniAppDescriptor]) {
        let flagged: Vec<&MiniAppDescriptor> = apps.iter().filter(|a| a.auto_load).collect();
        for app in &flagged {
            match app.phase {
                PhaseRequirement::PreCall if self.pre_call.is_none() => {
                    self.pre_call = Some(app.app_id.clone());
                }
                PhaseRequirement::InCall if self.in_call.is_none() => {
                    self.in_call = Some(app.app_id.clone());
                }
                _ => {}
            }
        }
        for app in flagged
            .iter()
            .filter(|a| a.phase == PhaseRequirement::Both)
        {
            if self.pre_call.is_none() {
                self.pre_call = Some(app.app_id.clone());
            } else if self.in_call.is_none() {
                self.in_call = Some(app.app_id.clone());
            }
        }
        self.captured = true;
    }
}

pub struct MiniAppLifecycleManager {
    call_id: CallId,
    call_state: CallState,
    media: MediaType,
    config: CoreConfig,
    apps: HashMap<String, MiniAppDescriptor>,
    /// Catalog order, for snapshots.
    order: Vec<String>,
    installed: HashMap<String, InstalledApp>,
    peer_dc_supported: bool,
    /// Starts still owed a `StartResult`.
    pending_starts: HashMap<String, StartType>,
    passive: HashSet<String>,
    awaiting_confirmation: HashSet<String>,
    reject_counts: HashMap<String, u32>,
    autoload: Autoload,
    negotiations: HashMap<String, PeerNegotiationChannel>,
    launcher: MiniAppProcessLauncher,
    torn_down: bool,
}

impl MiniAppLifecycleManager {
    pub fn new(call: &CallInfo, config: &CoreConfig) -> Self {
        Self {
            call_id: call.id.clone(),
            call_state: call.state,
            media: call.media,
            config: config.clone(),
            apps: HashMap::new(),
            order: Vec::new(),
            installed: HashMap::new(),
            peer_dc_supported: false,
            pending_starts: HashMap::new(),
            passive: HashSet::new(),
            awaiting_confirmation: HashSet::new(),
            reject_counts: HashMap::new(),
            autoload: Autoload::default(),
            negotiations: HashMap::new(),
            launcher: MiniAppProcessLauncher::new(config),
            torn_down: false,
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn descriptor(&self, app_id: &str) -> Option<&MiniAppDescriptor> {
        self.apps.get(app_id)
    }

    pub fn has_negotiation(&self, app_id: &str) -> bool {
        self.negotiations.contains_key(app_id)
    }

    pub fn query_status(&self, app_id: &str) -> Result<MiniAppStatus, StartError> {
        self.apps
            .get(app_id)
            .map(|a| a.status)
            .ok_or(StartError::AppNotFound)
    }

    /// Record an archive already on disk, typically from an app store scan.
    pub fn seed_installed(&mut self, app_id: &str, etag: &str, path: PathBuf) {
        self.installed.insert(
            app_id.to_string(),
            InstalledApp {
                etag: etag.to_string(),
                path: path.clone(),
            },
        );
        if let Some(app) = self.apps.get_mut(app_id) {
            if app.version_tag() == Some(etag) && app.status == MiniAppStatus::Uninstalled {
                app.install_path = Some(path);
                app.status = MiniAppStatus::Installed;
            }
        }
    }

    pub fn on_catalog_loaded(
        &mut self,
        catalog: &MiniAppCatalog,
        first_page: bool,
    ) -> Vec<LifecycleAction> {
        if self.torn_down {
            return Vec::new();
        }
        self.peer_dc_supported = catalog.peer_dc_supported;
        for incoming in &catalog.apps {
            let mut app = incoming.clone();
            match self.apps.get(&app.app_id) {
                Some(existing) => {
                    app.status = existing.status;
                    app.install_path = existing.install_path.clone();
                }
                None => {
                    self.order.push(app.app_id.clone());
                    let on_disk = self.installed.get(&app.app_id).filter(|i| {
                        app.version_tag() == Some(i.etag.as_str())
                    });
                    if let Some(inst) = on_disk {
                        app.install_path = Some(inst.path.clone());
                        app.status = MiniAppStatus::Installed;
                    }
                }
            }
            self.apps.insert(app.app_id.clone(), app);
        }
        if first_page && !self.autoload.captured {
            self.autoload.capture(&catalog.apps);
            debug!(
                call_id = %self.call_id,
                pre_call = ?self.autoload.pre_call,
                in_call = ?self.autoload.in_call,
                "autoload candidates captured"
            );
        }
        let mut actions = vec![LifecycleAction::CatalogUpdated {
            apps: self.snapshot(),
        }];
        actions.extend(self.try_autoload());
        actions
    }

    pub fn start_mini_app(&mut self, app_id: &str, start_type: StartType) -> Vec<LifecycleAction> {
        if self.torn_down {
            return vec![start_result(app_id, Err(StartError::CallEnded))];
        }
        let Some(app) = self.apps.get(app_id) else {
            return vec![start_result(app_id, Err(StartError::AppNotFound))];
        };
        match app.status {
            MiniAppStatus::Downloading | MiniAppStatus::Starting => {
                debug!(call_id = %self.call_id, %app_id, "start already in progress");
                return vec![start_result(app_id, Ok(StartOutcome::InProgress))];
            }
            MiniAppStatus::Started => {
                return vec![
                    LifecycleAction::BringToFront {
                        app_id: app_id.to_string(),
                    },
                    start_result(app_id, Ok(StartOutcome::BroughtToFront)),
                ];
            }
            _ => {}
        }
        if let Err(reason) = self.check_predicates(app) {
            info!(call_id = %self.call_id, %app_id, %reason, "start refused");
            return vec![start_result(app_id, Err(StartError::Unsupported(reason)))];
        }
        let Some(tag) = app.version_tag().map(str::to_string) else {
            return vec![start_result(app_id, Err(StartError::MissingVersion))];
        };

        info!(call_id = %self.call_id, %app_id, ?start_type, "starting mini app");
        self.pending_starts.insert(app_id.to_string(), start_type);
        if self.installed.get(app_id).is_some_and(|i| i.etag == tag) {
            self.begin_launch(app_id, start_type)
        } else {
            self.begin_download(app_id)
        }
    }

    /// Download and install without starting.
    pub fn preload(&mut self, app_id: &str) -> Vec<LifecycleAction> {
        if self.torn_down {
            return Vec::new();
        }
        let Some(app) = self.apps.get(app_id) else {
            warn!(call_id = %self.call_id, %app_id, "preload of unknown app");
            return Vec::new();
        };
        if !matches!(
            app.status,
            MiniAppStatus::Uninstalled | MiniAppStatus::Stopped
        ) {
            return Vec::new();
        }
        let Some(tag) = app.version_tag() else {
            return Vec::new();
        };
        if self.installed.get(app_id).is_some_and(|i| i.etag == tag) {
            return Vec::new();
        }
        self.begin_download(app_id)
    }

    pub fn stop_mini_app(&mut self, app_id: &str) -> Vec<LifecycleAction> {
        if self.torn_down {
            return Vec::new();
        }
        let status = self.apps.get(app_id).map(|a| a.status);
        let mut actions = Vec::new();
        match status {
            Some(MiniAppStatus::Started | MiniAppStatus::Starting) => {
                actions.push(LifecycleAction::Stop {
                    app_id: app_id.to_string(),
                });
                self.launcher.release(app_id);
            }
            Some(MiniAppStatus::Downloading) => {}
            Some(other) => {
                debug!(call_id = %self.call_id, %app_id, status = ?other, "stop of app that is not running");
                return actions;
            }
            None => {
                debug!(call_id = %self.call_id, %app_id, "stop of unknown app");
                return actions;
            }
        }
        self.set_status(app_id, MiniAppStatus::Stopped, &mut actions);
        if self.pending_starts.remove(app_id).is_some() {
            actions.push(start_result(
                app_id,
                Err(StartError::LaunchFailed("stopped before start completed".into())),
            ));
        }
        actions
    }

    pub fn on_download_progress(&self, app_id: &str, percent: u8) -> Vec<LifecycleAction> {
        if self.status_is(app_id, MiniAppStatus::Downloading) {
            vec![LifecycleAction::DownloadProgress {
                app_id: app_id.to_string(),
                percent,
            }]
        } else {
            Vec::new()
        }
    }

    pub fn on_binary_downloaded(
        &mut self,
        app_id: &str,
        etag: &str,
        archive: Vec<u8>,
    ) -> Vec<LifecycleAction> {
        if !self.status_is(app_id, MiniAppStatus::Downloading) {
            debug!(call_id = %self.call_id, %app_id, "binary for app no longer downloading");
            return Vec::new();
        }
        let sha256 = self.apps.get(app_id).and_then(|a| a.sha256.clone());
        vec![
            LifecycleAction::DownloadProgress {
                app_id: app_id.to_string(),
                percent: 100,
            },
            LifecycleAction::Install {
                app_id: app_id.to_string(),
                etag: etag.to_string(),
                archive,
                sha256,
            },
        ]
    }

    /// 304 from the server: the installed version is current.
    pub fn on_binary_not_modified(&mut self, app_id: &str, etag: &str) -> Vec<LifecycleAction> {
        if !self.status_is(app_id, MiniAppStatus::Downloading) {
            return Vec::new();
        }
        match self.installed.get(app_id).cloned() {
            Some(inst) => {
                debug!(call_id = %self.call_id, %app_id, %etag, "installed version still current");
                self.finish_install(app_id, inst.etag, inst.path)
            }
            None => self.on_download_failed(app_id, DownloadFailure::Status(304)),
        }
    }

    pub fn on_download_failed(
        &mut self,
        app_id: &str,
        reason: DownloadFailure,
    ) -> Vec<LifecycleAction> {
        if !self.status_is(app_id, MiniAppStatus::Downloading) {
            return Vec::new();
        }
        warn!(call_id = %self.call_id, %app_id, %reason, "download failed");
        let mut actions = Vec::new();
        self.set_status(app_id, MiniAppStatus::Stopped, &mut actions);
        if self.pending_starts.remove(app_id).is_some() {
            actions.push(start_result(app_id, Err(StartError::DownloadFailed(reason))));
        }
        actions
    }

    pub fn on_install_result(
        &mut self,
        app_id: &str,
        etag: &str,
        result: Result<PathBuf, String>,
    ) -> Vec<LifecycleAction> {
        if !self.status_is(app_id, MiniAppStatus::Downloading) {
            debug!(call_id = %self.call_id, %app_id, "install result for app no longer downloading");
            return Vec::new();
        }
        match result {
            Ok(path) => self.finish_install(app_id, etag.to_string(), path),
            Err(msg) => {
                warn!(call_id = %self.call_id, %app_id, error = %msg, "install failed");
                let mut actions = Vec::new();
                self.set_status(app_id, MiniAppStatus::Stopped, &mut actions);
                if self.pending_starts.remove(app_id).is_some() {
                    actions.push(start_result(app_id, Err(StartError::InstallFailed(msg))));
                }
                actions
            }
        }
    }

    pub fn on_launch_result(
        &mut self,
        app_id: &str,
        result: Result<(), LaunchFailure>,
    ) -> Vec<LifecycleAction> {
        if !self.status_is(app_id, MiniAppStatus::Starting) {
            debug!(call_id = %self.call_id, %app_id, "stale launch result");
            return Vec::new();
        }
        let mut actions = Vec::new();
        self.pending_starts.remove(app_id);
        match result {
            Ok(()) => {
                info!(call_id = %self.call_id, %app_id, "mini app started");
                self.set_status(app_id, MiniAppStatus::Started, &mut actions);
                actions.push(start_result(app_id, Ok(StartOutcome::Started)));
                actions.extend(self.maybe_open_negotiation(app_id));
            }
            Err(failure) => {
                warn!(call_id = %self.call_id, %app_id, ?failure, "launch failed");
                self.launcher.release(app_id);
                self.set_status(app_id, MiniAppStatus::Stopped, &mut actions);
                actions.push(start_result(app_id, Err(failure.into())));
            }
        }
        actions
    }

    pub fn on_call_state_changed(&mut self, call: &CallInfo) -> Vec<LifecycleAction> {
        if self.torn_down {
            return Vec::new();
        }
        let previous = self.call_state;
        self.call_state = call.state;
        self.media = call.media;
        if call.state == CallState::Disconnected {
            return self.teardown();
        }
        let mut actions = Vec::new();
        if previous == CallState::Active && call.state == CallState::Holding {
            debug!(call_id = %self.call_id, "call on hold; suspending background work");
            actions.push(LifecycleAction::SuspendBackground);
        }
        actions.extend(self.try_autoload());
        actions
    }

    /// Stop every running app and drop all per-call state. Further events are ignored.
    pub fn teardown(&mut self) -> Vec<LifecycleAction> {
        if self.torn_down {
            return Vec::new();
        }
        info!(call_id = %self.call_id, "tearing down mini app lifecycle");
        let mut actions = Vec::new();
        let order = std::mem::take(&mut self.order);
        for app_id in &order {
            if matches!(
                self.apps.get(app_id).map(|a| a.status),
                Some(MiniAppStatus::Started | MiniAppStatus::Starting)
            ) {
                actions.push(LifecycleAction::Stop {
                    app_id: app_id.clone(),
                });
                self.set_status(app_id, MiniAppStatus::Stopped, &mut actions);
            }
        }
        let mut pending: Vec<String> = self.pending_starts.drain().map(|(id, _)| id).collect();
        pending.sort();
        for app_id in pending {
            actions.push(start_result(&app_id, Err(StartError::CallEnded)));
        }
        let mut negotiations: Vec<String> = self.negotiations.drain().map(|(id, _)| id).collect();
        negotiations.sort();
        for app_id in negotiations {
            actions.push(LifecycleAction::CloseNegotiation { app_id });
        }
        self.apps.clear();
        self.passive.clear();
        self.awaiting_confirmation.clear();
        self.reject_counts.clear();
        self.autoload = Autoload::default();
        self.launcher = MiniAppProcessLauncher::new(&self.config);
        self.torn_down = true;
        actions
    }

    /// A control channel reached this call, opened by either end.
    pub fn on_control_channel_created(&mut self, channel: &DataChannel) {
        if self.torn_down {
            return;
        }
        let app_id = channel.label.app_id().to_string();
        if let Some(neg) = self.negotiations.get_mut(&app_id) {
            neg.attach(channel.handle);
            return;
        }
        let mut app = self
            .apps
            .get(&app_id)
            .cloned()
            .unwrap_or_else(|| MiniAppDescriptor::new(app_id.clone()));
        if channel.label.role() == ROLE_REMOTE {
            // The peer opened it; only the opener asks for a start.
            app.auto_request_remote = false;
        }
        let mut neg = PeerNegotiationChannel::new(app, &self.config);
        neg.attach(channel.handle);
        self.negotiations.insert(app_id, neg);
    }

    pub fn on_control_channel_state(&mut self, handle: ChannelHandle, state: ChannelState, now: Instant) {
        if let Some(neg) = self.negotiation_by_handle(handle) {
            neg.on_state(state, now);
        }
    }

    pub fn on_control_send_result(&mut self, handle: ChannelHandle, code: SendCode) {
        if let Some(neg) = self.negotiation_by_handle(handle) {
            neg.on_send_result(code);
        }
    }

    pub fn on_control_data(&mut self, handle: ChannelHandle, bytes: &[u8]) -> Vec<LifecycleAction> {
        if self.torn_down {
            return Vec::new();
        }
        let Some(channel_app) = self
            .negotiations
            .iter()
            .find(|(_, n)| n.handle() == Some(handle))
            .map(|(id, _)| id.clone())
        else {
            warn!(call_id = %self.call_id, %handle, "control data on unknown channel");
            return Vec::new();
        };
        let Some(msg) = self
            .negotiations
            .get(&channel_app)
            .and_then(|n| n.on_data(bytes))
        else {
            return Vec::new();
        };
        match msg {
            NegotiationMessage::RequestStartApp { app_info } => {
                self.on_peer_start_request(&channel_app, app_info)
            }
            NegotiationMessage::ResponseStartApp { option } => {
                info!(call_id = %self.call_id, app_id = %channel_app, ?option, "peer answered start request");
                vec![LifecycleAction::PeerResponded {
                    app_id: channel_app,
                    agreed: option == StartOption::Agree,
                }]
            }
        }
    }

    /// User's answer to a `ConfirmPassiveStart`.
    pub fn on_passive_decision(&mut self, app_id: &str, accepted: bool) -> Vec<LifecycleAction> {
        if self.torn_down || !self.awaiting_confirmation.remove(app_id) {
            debug!(call_id = %self.call_id, %app_id, "no confirmation pending");
            return Vec::new();
        }
        let mut actions = Vec::new();
        match self
            .negotiations
            .get_mut(app_id)
            .and_then(|n| n.respond(accepted))
        {
            Some(out) => actions.push(LifecycleAction::Send(out)),
            None => warn!(call_id = %self.call_id, %app_id, "no open control channel for reply"),
        }
        if accepted {
            actions.extend(self.start_mini_app(app_id, StartType::Passive));
        } else {
            let count = self.reject_counts.entry(app_id.to_string()).or_insert(0);
            *count += 1;
            info!(call_id = %self.call_id, %app_id, rejects = *count, "passive start rejected");
        }
        actions
    }

    /// The app's application channel listener went away; release its negotiation channel.
    pub fn on_app_channel_unregistered(&mut self, app_id: &str) -> Vec<LifecycleAction> {
        match self.negotiations.remove(app_id) {
            Some(_) => vec![LifecycleAction::CloseNegotiation {
                app_id: app_id.to_string(),
            }],
            None => Vec::new(),
        }
    }

    /// Fire due delayed negotiation requests.
    pub fn tick(&mut self, now: Instant) -> Vec<LifecycleAction> {
        let mut sends: Vec<Outbound> = self
            .negotiations
            .values_mut()
            .filter_map(|n| n.tick(now))
            .collect();
        sends.sort_by_key(|o| o.handle);
        sends.into_iter().map(LifecycleAction::Send).collect()
    }

    fn on_peer_start_request(
        &mut self,
        channel_app: &str,
        app_info: MiniAppDescriptor,
    ) -> Vec<LifecycleAction> {
        let app_id = if app_info.app_id.is_empty() {
            channel_app.to_string()
        } else {
            app_info.app_id.clone()
        };
        let rejects = self.reject_counts.get(&app_id).copied().unwrap_or(0);
        if rejects >= self.config.max_passive_rejects {
            info!(call_id = %self.call_id, %app_id, rejects, "ignoring peer start request");
            return Vec::new();
        }
        if self.awaiting_confirmation.contains(&app_id) {
            debug!(call_id = %self.call_id, %app_id, "confirmation already pending");
            return Vec::new();
        }
        // A request over a data channel proves the peer supports them.
        self.peer_dc_supported = true;
        if !self.apps.contains_key(&app_id) {
            let mut app = app_info;
            app.app_id = app_id.clone();
            app.status = MiniAppStatus::Uninstalled;
            app.install_path = None;
            let on_disk = self
                .installed
                .get(&app_id)
                .filter(|i| app.version_tag() == Some(i.etag.as_str()))
                .cloned();
            if let Some(inst) = on_disk {
                app.install_path = Some(inst.path);
                app.status = MiniAppStatus::Installed;
            }
            debug!(call_id = %self.call_id, %app_id, "synthesized descriptor for peer app");
            self.order.push(app_id.clone());
            self.apps.insert(app_id.clone(), app);
        }
        self.passive.insert(app_id.clone());
        self.awaiting_confirmation.insert(app_id.clone());
        match self.apps.get(&app_id) {
            Some(app) => vec![LifecycleAction::ConfirmPassiveStart { app: app.clone() }],
            None => Vec::new(),
        }
    }

    fn begin_download(&mut self, app_id: &str) -> Vec<LifecycleAction> {
        let mut actions = Vec::new();
        self.set_status(app_id, MiniAppStatus::Downloading, &mut actions);
        actions.push(LifecycleAction::DownloadProgress {
            app_id: app_id.to_string(),
            percent: 0,
        });
        actions.push(LifecycleAction::FetchBinary {
            app_id: app_id.to_string(),
            if_none_match: self.installed.get(app_id).map(|i| i.etag.clone()),
        });
        actions
    }

    fn finish_install(&mut self, app_id: &str, etag: String, path: PathBuf) -> Vec<LifecycleAction> {
        info!(call_id = %self.call_id, %app_id, %etag, path = %path.display(), "mini app installed");
        self.installed.insert(
            app_id.to_string(),
            InstalledApp {
                etag,
                path: path.clone(),
            },
        );
        if let Some(app) = self.apps.get_mut(app_id) {
            app.install_path = Some(path);
        }
        let mut actions = Vec::new();
        self.set_status(app_id, MiniAppStatus::Installed, &mut actions);
        if let Some(&start_type) = self.pending_starts.get(app_id) {
            actions.extend(self.begin_launch(app_id, start_type));
        }
        actions
    }

    fn begin_launch(&mut self, app_id: &str, start_type: StartType) -> Vec<LifecycleAction> {
        let mut actions = Vec::new();
        if let (Some(app), Some(inst)) = (self.apps.get_mut(app_id), self.installed.get(app_id)) {
            app.install_path = Some(inst.path.clone());
        }
        if self.status_is(app_id, MiniAppStatus::Uninstalled) {
            self.set_status(app_id, MiniAppStatus::Installed, &mut actions);
        }
        self.set_status(app_id, MiniAppStatus::Starting, &mut actions);
        let Some(app) = self.apps.get(app_id).cloned() else {
            return actions;
        };
        let assignment = self.launcher.select_slot(&app);
        if let SlotAssignment::Evicted { evicted, .. } = &assignment {
            actions.push(LifecycleAction::Stop {
                app_id: evicted.clone(),
            });
            self.set_status(evicted, MiniAppStatus::Stopped, &mut actions);
            if self.pending_starts.remove(evicted.as_str()).is_some() {
                actions.push(start_result(
                    evicted,
                    Err(StartError::LaunchFailed("evicted".into())),
                ));
            }
            if self.negotiations.remove(evicted.as_str()).is_some() {
                actions.push(LifecycleAction::CloseNegotiation {
                    app_id: evicted.clone(),
                });
            }
        }
        actions.push(LifecycleAction::Launch {
            app,
            start_type,
            slot: assignment.slot(),
        });
        actions
    }

    fn maybe_open_negotiation(&mut self, app_id: &str) -> Vec<LifecycleAction> {
        let Some(app) = self.apps.get(app_id) else {
            return Vec::new();
        };
        if !app.should_create_control_adc
            || self.passive.contains(app_id)
            || !self.peer_dc_supported
            || self.negotiations.contains_key(app_id)
        {
            return Vec::new();
        }
        let label = match ChannelLabel::control(ROLE_LOCAL, app_id) {
            Ok(l) => l,
            Err(e) => {
                warn!(call_id = %self.call_id, %app_id, error = %e, "cannot build control label");
                return Vec::new();
            }
        };
        self.negotiations.insert(
            app_id.to_string(),
            PeerNegotiationChannel::new(app.clone(), &self.config),
        );
        vec![LifecycleAction::CreateControlChannel {
            app_id: app_id.to_string(),
            label: label.to_string(),
        }]
    }

    fn try_autoload(&mut self) -> Vec<LifecycleAction> {
        let (candidate, fired) = match self.call_state.phase() {
            Some(CallPhase::PreCall) => (self.autoload.pre_call.clone(), self.autoload.pre_call_fired),
            Some(CallPhase::InCall) => (self.autoload.in_call.clone(), self.autoload.in_call_fired),
            None => return Vec::new(),
        };
        if fired {
            return Vec::new();
        }
        let Some(app_id) = candidate else {
            return Vec::new();
        };
        let Some(app) = self.apps.get(&app_id) else {
            return Vec::new();
        };
        if let Err(reason) = self.check_predicates(app) {
            debug!(call_id = %self.call_id, %app_id, %reason, "autoload candidate not eligible yet");
            return Vec::new();
        }
        match self.call_state.phase() {
            Some(CallPhase::PreCall) => self.autoload.pre_call_fired = true,
            Some(CallPhase::InCall) => self.autoload.in_call_fired = true,
            None => {}
        }
        info!(call_id = %self.call_id, %app_id, "autoloading mini app");
        self.start_mini_app(&app_id, StartType::AutoLoad)
    }

    fn check_predicates(&self, app: &MiniAppDescriptor) -> Result<(), UnsupportedReason> {
        if !app.scene.matches(self.media) {
            return Err(UnsupportedReason::Scene);
        }
        if !app.phase.matches(self.call_state) {
            return Err(UnsupportedReason::Phase);
        }
        if !(app.works_without_peer_dc || self.peer_dc_supported) {
            return Err(UnsupportedReason::DataChannel);
        }
        Ok(())
    }

    fn negotiation_by_handle(&mut self, handle: ChannelHandle) -> Option<&mut PeerNegotiationChannel> {
        self.negotiations
            .values_mut()
            .find(|n| n.handle() == Some(handle))
    }

    fn status_is(&self, app_id: &str, status: MiniAppStatus) -> bool {
        self.apps.get(app_id).is_some_and(|a| a.status == status)
    }

    fn set_status(&mut self, app_id: &str, status: MiniAppStatus, actions: &mut Vec<LifecycleAction>) -> bool {
        let Some(app) = self.apps.get_mut(app_id) else {
            return false;
        };
        if app.status == status {
            return true;
        }
        if !app.transition(status) {
            return false;
        }
        actions.push(LifecycleAction::StatusChanged {
            app_id: app_id.to_string(),
            status,
        });
        true
    }

    fn snapshot(&self) -> Vec<MiniAppDescriptor> {
        self.order
            .iter()
            .filter_map(|id| self.apps.get(id))
            .cloned()
            .collect()
    }
}

fn start_result(app_id: &str, result: Result<StartOutcome, StartError>) -> LifecycleAction {
    LifecycleAction::StartResult {
        app_id: app_id.to_string(),
        result,
    }
}
