//! Per-call worker: one task that owns the call's bootstrap protocol, lifecycle manager and own
//! channel. Every event for the call is marshalled onto this task's queue, so the state it owns
//! is never locked.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use miniapp_core::bootstrap::BootstrapAction;
use miniapp_core::lifecycle::{LifecycleAction, StartError, StartOutcome, StartType};
use miniapp_core::own_channel::OwnChannelError;
use miniapp_core::{
    BootstrapChannelProtocol, CallInfo, ChannelEvent, ChannelFunction, ChannelHandle, ChannelLabel,
    ChannelState, MiniAppLifecycleManager, MiniAppStatus, OwnAction, OwnChannelTransport, Outbound,
    SendCode, ROLE_LOCAL,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::app_store::FsAppStore;
use crate::collaborators::{AppLauncher, ConfirmationPrompt};
use crate::config::HostConfig;
use crate::provider::ChannelProvider;
use crate::registry_actor::{ChannelSink, RegistryMsg};
use crate::session::SessionEvent;

/// App id segment of the per-call own channel label.
pub const OWN_CHANNEL_APP_ID: &str = "sdk";

/// Send code reported to the state machines when the provider call itself failed.
const PROVIDER_ERROR_CODE: SendCode = -1;

pub(crate) enum WorkerMsg {
    CallStateChanged(CallInfo),
    Data {
        handle: ChannelHandle,
        bytes: Vec<u8>,
    },
    SendResult {
        handle: ChannelHandle,
        code: SendCode,
    },
    ProviderLost,
    Start {
        app_id: String,
        start_type: StartType,
        reply: oneshot::Sender<Result<StartOutcome, StartError>>,
    },
    Stop {
        app_id: String,
    },
    QueryStatus {
        app_id: String,
        reply: oneshot::Sender<Result<MiniAppStatus, StartError>>,
    },
    RefreshCatalog,
    LoadMore,
    PassiveDecision {
        app_id: String,
        accepted: bool,
    },
    Installed {
        app_id: String,
        etag: String,
        result: Result<PathBuf, String>,
    },
    AppChannelUnregistered {
        app_id: String,
    },
    OwnRegister {
        model: String,
        sink: mpsc::UnboundedSender<Vec<u8>>,
    },
    OwnUnregister {
        model: String,
        reply: oneshot::Sender<bool>,
    },
    OwnSend {
        model: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), OwnChannelError>>,
    },
    Shutdown,
}

/// Everything a worker borrows from its session.
#[derive(Clone)]
pub(crate) struct WorkerDeps {
    pub config: Arc<HostConfig>,
    pub provider: Arc<dyn ChannelProvider>,
    pub launcher: Arc<dyn AppLauncher>,
    pub prompt: Arc<dyn ConfirmationPrompt>,
    pub store: Arc<FsAppStore>,
    pub registry: mpsc::UnboundedSender<RegistryMsg>,
    pub events: broadcast::Sender<SessionEvent>,
}

pub(crate) struct WorkerHandle {
    pub tx: mpsc::UnboundedSender<WorkerMsg>,
    pub join: JoinHandle<()>,
}

/// Spawn the worker for `call`. Returns its handle and the sink the registry delivers
/// bootstrap, control and own channel events to.
pub(crate) fn spawn(call: CallInfo, deps: WorkerDeps) -> (WorkerHandle, ChannelSink) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (sink, channel_rx) = mpsc::unbounded_channel();
    let worker = CallWorker::new(call, deps, tx.clone());
    let join = tokio::spawn(worker.run(rx, channel_rx));
    (WorkerHandle { tx, join }, sink)
}

struct CallWorker {
    call: CallInfo,
    deps: WorkerDeps,
    self_tx: mpsc::UnboundedSender<WorkerMsg>,
    bootstrap: BootstrapChannelProtocol,
    lifecycle: MiniAppLifecycleManager,
    own: OwnChannelTransport,
    own_requested: bool,
    own_listeners: HashMap<String, mpsc::UnboundedSender<Vec<u8>>>,
    start_waiters: HashMap<String, Vec<oneshot::Sender<Result<StartOutcome, StartError>>>>,
}

impl CallWorker {
    fn new(call: CallInfo, deps: WorkerDeps, self_tx: mpsc::UnboundedSender<WorkerMsg>) -> Self {
        let core = &deps.config.core;
        let mut bootstrap = BootstrapChannelProtocol::new(&call, core);
        let mut lifecycle = MiniAppLifecycleManager::new(&call, core);
        match deps.store.installed() {
            Ok(installed) => {
                for v in installed {
                    lifecycle.seed_installed(&v.app_id, &v.etag, v.path);
                }
            }
            Err(e) => warn!(call_id = %call.id, error = %e, "cannot scan app store"),
        }
        // Queued until the bootstrap channel opens.
        bootstrap.request_catalog();
        Self {
            own: OwnChannelTransport::new(&call.id, core),
            call,
            self_tx,
            bootstrap,
            lifecycle,
            own_requested: false,
            own_listeners: HashMap::new(),
            start_waiters: HashMap::new(),
            deps,
        }
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<WorkerMsg>,
        mut channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        info!(call_id = %self.call.id, "call worker started");
        let mut ticker = tokio::time::interval(self.deps.config.worker_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(WorkerMsg::Shutdown) | None => break,
                    Some(msg) => self.handle(msg),
                },
                Some(event) = channel_rx.recv() => self.on_channel_event(event),
                _ = ticker.tick() => self.on_tick(),
            }
        }
        self.teardown();
    }

    fn handle(&mut self, msg: WorkerMsg) {
        let now = crate::now();
        match msg {
            WorkerMsg::CallStateChanged(call) => {
                debug!(call_id = %call.id, state = ?call.state, "call state changed");
                self.call = call.clone();
                self.bootstrap.on_call_state(call.state, now);
                let actions = self.lifecycle.on_call_state_changed(&call);
                self.apply(actions);
            }
            WorkerMsg::Data { handle, bytes } => self.on_data(handle, &bytes),
            WorkerMsg::SendResult { handle, code } => self.on_send_result(handle, code),
            WorkerMsg::ProviderLost => {
                warn!(call_id = %self.call.id, "provider lost; channels reset");
                let actions = self.bootstrap.on_channel_state(ChannelState::Closed, now);
                let follow = self.on_bootstrap(actions);
                self.apply(follow);
                let own = self.own.on_state(ChannelState::Closed, now);
                self.on_own(own);
                self.own_requested = false;
            }
            WorkerMsg::Start {
                app_id,
                start_type,
                reply,
            } => {
                let mut actions = self.lifecycle.start_mini_app(&app_id, start_type);
                let immediate = actions.iter().position(|a| {
                    matches!(a, LifecycleAction::StartResult { app_id: id, .. } if *id == app_id)
                });
                match immediate {
                    Some(pos) => {
                        if let LifecycleAction::StartResult { result, .. } = actions.remove(pos) {
                            let _ = reply.send(result);
                        }
                    }
                    None => self.start_waiters.entry(app_id).or_default().push(reply),
                }
                self.apply(actions);
            }
            WorkerMsg::Stop { app_id } => {
                let actions = self.lifecycle.stop_mini_app(&app_id);
                self.apply(actions);
            }
            WorkerMsg::QueryStatus { app_id, reply } => {
                let _ = reply.send(self.lifecycle.query_status(&app_id));
            }
            WorkerMsg::RefreshCatalog => {
                let actions = self.bootstrap.request_catalog();
                let follow = self.on_bootstrap(actions);
                self.apply(follow);
            }
            WorkerMsg::LoadMore => {
                let actions = self.bootstrap.load_more();
                let follow = self.on_bootstrap(actions);
                self.apply(follow);
            }
            WorkerMsg::PassiveDecision { app_id, accepted } => {
                let actions = self.lifecycle.on_passive_decision(&app_id, accepted);
                self.apply(actions);
            }
            WorkerMsg::Installed {
                app_id,
                etag,
                result,
            } => {
                let actions = self.lifecycle.on_install_result(&app_id, &etag, result);
                self.apply(actions);
            }
            WorkerMsg::AppChannelUnregistered { app_id } => {
                let actions = self.lifecycle.on_app_channel_unregistered(&app_id);
                self.apply(actions);
            }
            WorkerMsg::OwnRegister { model, sink } => {
                self.own.register_model(&model);
                self.own_listeners.insert(model, sink);
            }
            WorkerMsg::OwnUnregister { model, reply } => {
                self.own_listeners.remove(&model);
                let _ = reply.send(self.own.unregister_model(&model));
            }
            WorkerMsg::OwnSend { model, data, reply } => match self.own.send(&model, &data, now) {
                Ok(actions) => {
                    let _ = reply.send(Ok(()));
                    self.on_own(actions);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            WorkerMsg::Shutdown => {}
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        let now = crate::now();
        match event {
            ChannelEvent::BootstrapCreated { handle, .. } => self.bootstrap.on_channel_created(handle),
            ChannelEvent::Created(channel) => match channel.label.function() {
                ChannelFunction::Control => {
                    self.lifecycle.on_control_channel_created(&channel);
                    if channel.state == ChannelState::Open {
                        self.lifecycle
                            .on_control_channel_state(channel.handle, ChannelState::Open, now);
                    }
                }
                ChannelFunction::Own => {
                    self.own.attach(channel.handle);
                    if channel.state == ChannelState::Open {
                        let actions = self.own.on_state(ChannelState::Open, now);
                        self.on_own(actions);
                    }
                }
                ChannelFunction::App(_) => {
                    debug!(call_id = %self.call.id, label = %channel.label, "app channel reached call worker");
                }
            },
            ChannelEvent::StateChanged { handle, state, .. } => {
                if self.bootstrap.handle() == Some(handle) {
                    let actions = self.bootstrap.on_channel_state(state, now);
                    let follow = self.on_bootstrap(actions);
                    self.apply(follow);
                    if state == ChannelState::Open {
                        self.ensure_own_channel();
                    }
                } else if self.own.handle() == Some(handle) {
                    let actions = self.own.on_state(state, now);
                    self.on_own(actions);
                } else {
                    self.lifecycle.on_control_channel_state(handle, state, now);
                }
            }
            ChannelEvent::Data { handle, .. } => {
                debug!(call_id = %self.call.id, %handle, "app channel data reached call worker");
            }
        }
    }

    fn on_data(&mut self, handle: ChannelHandle, bytes: &[u8]) {
        if self.bootstrap.handle() == Some(handle) {
            let actions = self.bootstrap.on_data(bytes);
            let follow = self.on_bootstrap(actions);
            self.apply(follow);
        } else if self.own.handle() == Some(handle) {
            let actions = self.own.on_data(bytes);
            self.on_own(actions);
        } else {
            let actions = self.lifecycle.on_control_data(handle, bytes);
            self.apply(actions);
        }
    }

    fn on_send_result(&mut self, handle: ChannelHandle, code: SendCode) {
        let now = crate::now();
        if self.bootstrap.handle() == Some(handle) {
            let actions = self.bootstrap.on_send_result(code, now);
            let follow = self.on_bootstrap(actions);
            self.apply(follow);
        } else if self.own.handle() == Some(handle) {
            let actions = self.own.on_send_result(code, now);
            self.on_own(actions);
        } else {
            self.lifecycle.on_control_send_result(handle, code);
        }
    }

    fn on_tick(&mut self) {
        let now = crate::now();
        let actions = self.bootstrap.tick(now);
        let follow = self.on_bootstrap(actions);
        self.apply(follow);
        let own = self.own.tick(now);
        self.on_own(own);
        let actions = self.lifecycle.tick(now);
        self.apply(actions);
    }

    fn ensure_own_channel(&mut self) {
        if self.own_requested {
            return;
        }
        let label = match ChannelLabel::own(ROLE_LOCAL, OWN_CHANNEL_APP_ID) {
            Ok(l) => l.to_string(),
            Err(e) => {
                warn!(call_id = %self.call.id, error = %e, "cannot build own channel label");
                return;
            }
        };
        self.own_requested = true;
        self.request_channel(label);
    }

    fn request_channel(&self, label: String) {
        let msg = RegistryMsg::Create {
            slot: self.call.slot,
            call_id: self.call.id.clone(),
            labels: vec![label],
            description_xml: String::new(),
            reply: None,
        };
        if self.deps.registry.send(msg).is_err() {
            warn!(call_id = %self.call.id, "registry gone; channel not requested");
        }
    }

    /// Perform bootstrap actions; returns what the lifecycle manager made of them.
    fn on_bootstrap(&mut self, actions: Vec<BootstrapAction>) -> Vec<LifecycleAction> {
        let mut out = Vec::new();
        for action in actions {
            match action {
                BootstrapAction::Send { handle, bytes } => {
                    if let Err(e) = self.deps.provider.send(handle, &bytes) {
                        warn!(call_id = %self.call.id, %handle, error = %e, "bootstrap send failed");
                        let code = self
                            .deps
                            .config
                            .core
                            .transient_send_codes
                            .first()
                            .copied()
                            .unwrap_or(PROVIDER_ERROR_CODE);
                        let retry = self.bootstrap.on_send_result(code, crate::now());
                        out.extend(self.on_bootstrap(retry));
                    }
                }
                BootstrapAction::CatalogLoaded {
                    catalog,
                    first_page,
                } => out.extend(self.lifecycle.on_catalog_loaded(&catalog, first_page)),
                BootstrapAction::CatalogFailed => {
                    warn!(call_id = %self.call.id, "catalog request failed");
                }
                BootstrapAction::DownloadProgress { app_id, percent } => {
                    out.extend(self.lifecycle.on_download_progress(&app_id, percent));
                }
                BootstrapAction::BinaryDownloaded {
                    app_id,
                    etag,
                    archive,
                } => out.extend(self.lifecycle.on_binary_downloaded(&app_id, &etag, archive)),
                BootstrapAction::BinaryNotModified { app_id, etag } => {
                    out.extend(self.lifecycle.on_binary_not_modified(&app_id, &etag));
                }
                BootstrapAction::DownloadFailed { app_id, reason } => {
                    out.extend(self.lifecycle.on_download_failed(&app_id, reason));
                }
                BootstrapAction::CallStateRefresh { call_id } => {
                    self.emit(SessionEvent::CallStateRefresh { call_id });
                }
            }
        }
        out
    }

    fn apply(&mut self, actions: Vec<LifecycleAction>) {
        let mut queue: VecDeque<LifecycleAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                LifecycleAction::FetchBinary {
                    app_id,
                    if_none_match,
                } => {
                    let actions = self
                        .bootstrap
                        .request_binary(&app_id, if_none_match.as_deref());
                    queue.extend(self.on_bootstrap(actions));
                }
                LifecycleAction::Install {
                    app_id,
                    etag,
                    archive,
                    sha256,
                } => self.install(app_id, etag, archive, sha256),
                LifecycleAction::Launch {
                    app,
                    start_type,
                    slot,
                } => {
                    let result = self
                        .deps
                        .launcher
                        .launch(&self.call.id, &app, start_type, slot);
                    queue.extend(self.lifecycle.on_launch_result(&app.app_id, result));
                }
                LifecycleAction::BringToFront { app_id } => {
                    self.deps.launcher.bring_to_front(&self.call.id, &app_id);
                }
                LifecycleAction::Stop { app_id } => self.deps.launcher.stop(&self.call.id, &app_id),
                LifecycleAction::SuspendBackground => {
                    self.deps.launcher.suspend_background(&self.call.id);
                }
                LifecycleAction::StartResult { app_id, result } => {
                    for reply in self.start_waiters.remove(&app_id).unwrap_or_default() {
                        let _ = reply.send(result.clone());
                    }
                }
                LifecycleAction::StatusChanged { app_id, status } => {
                    self.emit(SessionEvent::StatusChanged {
                        call_id: self.call.id.clone(),
                        app_id,
                        status,
                    });
                }
                LifecycleAction::DownloadProgress { app_id, percent } => {
                    self.emit(SessionEvent::DownloadProgress {
                        call_id: self.call.id.clone(),
                        app_id,
                        percent,
                    });
                }
                LifecycleAction::CatalogUpdated { apps } => {
                    self.emit(SessionEvent::CatalogUpdated {
                        call_id: self.call.id.clone(),
                        apps,
                    });
                }
                LifecycleAction::ConfirmPassiveStart { app } => self.confirm_passive(app),
                LifecycleAction::CreateControlChannel { app_id, label } => {
                    debug!(call_id = %self.call.id, %app_id, %label, "requesting control channel");
                    self.request_channel(label);
                }
                LifecycleAction::CloseNegotiation { app_id } => {
                    debug!(call_id = %self.call.id, %app_id, "negotiation channel released");
                }
                LifecycleAction::Send(out) => self.send(out),
                LifecycleAction::PeerResponded { app_id, agreed } => {
                    self.emit(SessionEvent::PeerResponse {
                        call_id: self.call.id.clone(),
                        app_id,
                        agreed,
                    });
                }
            }
        }
    }

    fn on_own(&mut self, actions: Vec<OwnAction>) {
        for action in actions {
            match action {
                OwnAction::Send(out) => {
                    if let Err(e) = self.deps.provider.send(out.handle, &out.bytes) {
                        warn!(call_id = %self.call.id, error = %e, "own channel send failed");
                        let follow = self.own.on_send_result(PROVIDER_ERROR_CODE, crate::now());
                        self.on_own(follow);
                    }
                }
                OwnAction::Deliver { model, data } => {
                    let gone = self
                        .own_listeners
                        .get(&model)
                        .is_some_and(|sink| sink.send(data.clone()).is_err());
                    if gone {
                        debug!(call_id = %self.call.id, %model, "own listener gone");
                        self.own_listeners.remove(&model);
                        self.own.unregister_model(&model);
                    }
                    self.emit(SessionEvent::OwnChannelData {
                        call_id: self.call.id.clone(),
                        model,
                        data,
                    });
                }
            }
        }
    }

    fn send(&self, out: Outbound) {
        if let Err(e) = self.deps.provider.send(out.handle, &out.bytes) {
            warn!(call_id = %self.call.id, handle = %out.handle, error = %e, "control send failed");
        }
    }

    fn install(&self, app_id: String, etag: String, archive: Vec<u8>, sha256: Option<String>) {
        let store = self.deps.store.clone();
        let tx = self.self_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = store
                .install(&app_id, &etag, &archive, sha256.as_deref())
                .map_err(|e| e.to_string());
            let _ = tx.send(WorkerMsg::Installed {
                app_id,
                etag,
                result,
            });
        });
    }

    fn confirm_passive(&self, app: miniapp_core::MiniAppDescriptor) {
        info!(call_id = %self.call.id, app_id = %app.app_id, "asking user to confirm peer start");
        self.emit(SessionEvent::PassiveStartRequested {
            call_id: self.call.id.clone(),
            app: app.clone(),
        });
        let (reply, answer) = oneshot::channel();
        self.deps.prompt.confirm(&self.call.id, &app, reply);
        let tx = self.self_tx.clone();
        let app_id = app.app_id;
        tokio::spawn(async move {
            let accepted = answer.await.unwrap_or(false);
            let _ = tx.send(WorkerMsg::PassiveDecision { app_id, accepted });
        });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.deps.events.send(event);
    }

    fn teardown(&mut self) {
        let dropped = self.bootstrap.clear();
        let own = self.own.on_state(ChannelState::Closed, crate::now());
        self.on_own(own);
        let actions = self.lifecycle.teardown();
        self.apply(actions);
        for (_, replies) in self.start_waiters.drain() {
            for reply in replies {
                let _ = reply.send(Err(StartError::CallEnded));
            }
        }
        self.own_listeners.clear();
        info!(call_id = %self.call.id, dropped, "call worker stopped");
    }
}
