//! Session context: the lifetime-scoped owner of the registry actor and the call-id → worker map.
//!
//! The worker map is shared by every caller of the session and is guarded by a tokio mutex; all
//! per-call state lives inside the workers and is never shared.

use std::collections::HashMap;
use std::sync::Arc;

use miniapp_core::lifecycle::{StartError, StartOutcome, StartType};
use miniapp_core::own_channel::OwnChannelError;
use miniapp_core::{
    CallId, CallInfo, ChannelEvent, CreateOutcome, ListenerKey, MiniAppDescriptor, MiniAppStatus,
};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app_store::FsAppStore;
use crate::collaborators::{AppLauncher, ConfirmationPrompt};
use crate::config::HostConfig;
use crate::provider::{ChannelProvider, ProviderEvent};
use crate::registry_actor::{RegistryActor, RegistryMsg};
use crate::worker::{self, WorkerDeps, WorkerHandle, WorkerMsg};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    CatalogUpdated {
        call_id: CallId,
        apps: Vec<MiniAppDescriptor>,
    },
    DownloadProgress {
        call_id: CallId,
        app_id: String,
        percent: u8,
    },
    StatusChanged {
        call_id: CallId,
        app_id: String,
        status: MiniAppStatus,
    },
    /// The peer answered one of our start requests.
    PeerResponse {
        call_id: CallId,
        app_id: String,
        agreed: bool,
    },
    /// Periodic while the bootstrap channel is open.
    CallStateRefresh { call_id: CallId },
    PassiveStartRequested {
        call_id: CallId,
        app: MiniAppDescriptor,
    },
    OwnChannelData {
        call_id: CallId,
        model: String,
        data: Vec<u8>,
    },
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("unknown call {0}")]
    UnknownCall(CallId),
    #[error("call {0} already added")]
    DuplicateCall(CallId),
    #[error("session is shut down")]
    Closed,
    #[error(transparent)]
    Start(#[from] StartError),
    #[error("own channel: {0}")]
    OwnChannel(String),
}

impl From<OwnChannelError> for SessionError {
    fn from(e: OwnChannelError) -> Self {
        SessionError::OwnChannel(e.to_string())
    }
}

pub struct SessionContext {
    deps: WorkerDeps,
    workers: Mutex<HashMap<CallId, WorkerHandle>>,
    registry_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionContext {
    /// Spawns the registry actor; must be called inside a tokio runtime.
    pub fn new(
        config: HostConfig,
        provider: Arc<dyn ChannelProvider>,
        launcher: Arc<dyn AppLauncher>,
        prompt: Arc<dyn ConfirmationPrompt>,
    ) -> Self {
        let (registry_tx, registry_rx) = mpsc::unbounded_channel();
        let actor = RegistryActor::new(&config.core, provider.clone());
        let registry_task = tokio::spawn(actor.run(registry_rx));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        info!(app_root = %config.app_root.display(), "mini app session started");
        Self {
            deps: WorkerDeps {
                store: Arc::new(FsAppStore::new(config.app_root.clone())),
                config: Arc::new(config),
                provider,
                launcher,
                prompt,
                registry: registry_tx,
                events,
            },
            workers: Mutex::new(HashMap::new()),
            registry_task: Mutex::new(Some(registry_task)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.deps.events.subscribe()
    }

    pub fn app_store(&self) -> &FsAppStore {
        &self.deps.store
    }

    /// Marshal a provider callback onto the registry actor. Callable from any thread.
    pub fn provider_event(&self, event: ProviderEvent) {
        if self.deps.registry.send(RegistryMsg::Provider(event)).is_err() {
            debug!("provider event after session shutdown");
        }
    }

    pub async fn call_added(&self, call: CallInfo) -> Result<(), SessionError> {
        let mut workers = self.workers.lock().await;
        if workers.contains_key(&call.id) {
            return Err(SessionError::DuplicateCall(call.id));
        }
        let (handle, sink) = worker::spawn(call.clone(), self.deps.clone());
        let msg = RegistryMsg::CallAdded {
            call: call.clone(),
            worker: handle.tx.clone(),
            sink,
        };
        workers.insert(call.id.clone(), handle);
        self.registry(msg)?;
        info!(call_id = %call.id, slot = call.slot, "call added");
        Ok(())
    }

    pub async fn call_state_changed(&self, call: CallInfo) -> Result<(), SessionError> {
        let call_id = call.id.clone();
        self.to_worker(&call_id, WorkerMsg::CallStateChanged(call))
            .await
    }

    /// Tear the call down. Returns once its worker has stopped; nothing for the call fires after.
    pub async fn call_removed(&self, call_id: &CallId) -> Result<(), SessionError> {
        let handle = self
            .workers
            .lock()
            .await
            .remove(call_id)
            .ok_or_else(|| SessionError::UnknownCall(call_id.clone()))?;
        let (done, dropped) = oneshot::channel();
        self.registry(RegistryMsg::CallRemoved {
            call_id: call_id.clone(),
            done,
        })?;
        let dropped = dropped.await.unwrap_or(0);
        let _ = handle.tx.send(WorkerMsg::Shutdown);
        if let Err(e) = handle.join.await {
            warn!(%call_id, error = %e, "call worker panicked");
        }
        info!(%call_id, dropped_creations = dropped, "call removed");
        Ok(())
    }

    pub async fn start_mini_app(
        &self,
        call_id: &CallId,
        app_id: &str,
        start_type: StartType,
    ) -> Result<StartOutcome, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.to_worker(
            call_id,
            WorkerMsg::Start {
                app_id: app_id.to_string(),
                start_type,
                reply,
            },
        )
        .await?;
        match rx.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StartError::CallEnded.into()),
        }
    }

    pub async fn stop_mini_app(&self, call_id: &CallId, app_id: &str) -> Result<(), SessionError> {
        self.to_worker(
            call_id,
            WorkerMsg::Stop {
                app_id: app_id.to_string(),
            },
        )
        .await
    }

    pub async fn query_mini_app_status(
        &self,
        call_id: &CallId,
        app_id: &str,
    ) -> Result<MiniAppStatus, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.to_worker(
            call_id,
            WorkerMsg::QueryStatus {
                app_id: app_id.to_string(),
                reply,
            },
        )
        .await?;
        match rx.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SessionError::UnknownCall(call_id.clone())),
        }
    }

    pub async fn refresh_catalog(&self, call_id: &CallId) -> Result<(), SessionError> {
        self.to_worker(call_id, WorkerMsg::RefreshCatalog).await
    }

    pub async fn load_more(&self, call_id: &CallId) -> Result<(), SessionError> {
        self.to_worker(call_id, WorkerMsg::LoadMore).await
    }

    /// Answer a `PassiveStartRequested` outside the confirmation prompt.
    pub async fn answer_passive_start(
        &self,
        call_id: &CallId,
        app_id: &str,
        accepted: bool,
    ) -> Result<(), SessionError> {
        self.to_worker(
            call_id,
            WorkerMsg::PassiveDecision {
                app_id: app_id.to_string(),
                accepted,
            },
        )
        .await
    }

    pub async fn create_application_channels(
        &self,
        slot: u32,
        call_id: &CallId,
        labels: Vec<String>,
        description_xml: String,
    ) -> Result<CreateOutcome, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.registry(RegistryMsg::Create {
            slot,
            call_id: call_id.clone(),
            labels,
            description_xml,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Channel events for one app's application channels. Open channels already cached for the
    /// app are replayed first.
    pub fn register_app_channel_listener(
        &self,
        call_id: &CallId,
        app_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChannelEvent>, SessionError> {
        let (sink, rx) = mpsc::unbounded_channel();
        self.registry(RegistryMsg::Register {
            key: ListenerKey::App {
                call_id: call_id.clone(),
                app_id: app_id.to_string(),
            },
            sink,
        })?;
        Ok(rx)
    }

    /// Idempotent; returns whether a listener was removed.
    pub async fn unregister_app_channel_listener(
        &self,
        call_id: &CallId,
        app_id: &str,
    ) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.registry(RegistryMsg::Unregister {
            key: ListenerKey::App {
                call_id: call_id.clone(),
                app_id: app_id.to_string(),
            },
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn register_own_listener(
        &self,
        call_id: &CallId,
        model: &str,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, SessionError> {
        let (sink, rx) = mpsc::unbounded_channel();
        self.to_worker(
            call_id,
            WorkerMsg::OwnRegister {
                model: model.to_string(),
                sink,
            },
        )
        .await?;
        Ok(rx)
    }

    pub async fn unregister_own_listener(
        &self,
        call_id: &CallId,
        model: &str,
    ) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.to_worker(
            call_id,
            WorkerMsg::OwnUnregister {
                model: model.to_string(),
                reply,
            },
        )
        .await?;
        Ok(rx.await.unwrap_or(false))
    }

    pub async fn send_own(
        &self,
        call_id: &CallId,
        model: &str,
        data: Vec<u8>,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.to_worker(
            call_id,
            WorkerMsg::OwnSend {
                model: model.to_string(),
                data,
                reply,
            },
        )
        .await?;
        match rx.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SessionError::UnknownCall(call_id.clone())),
        }
    }

    /// Tear down every call, then stop the registry actor.
    pub async fn shutdown(&self) {
        let calls: Vec<CallId> = self.workers.lock().await.keys().cloned().collect();
        for call_id in calls {
            let _ = self.call_removed(&call_id).await;
        }
        let _ = self.deps.registry.send(RegistryMsg::Shutdown);
        if let Some(task) = self.registry_task.lock().await.take() {
            let _ = task.await;
        }
        info!("mini app session stopped");
    }

    async fn to_worker(&self, call_id: &CallId, msg: WorkerMsg) -> Result<(), SessionError> {
        let workers = self.workers.lock().await;
        let handle = workers
            .get(call_id)
            .ok_or_else(|| SessionError::UnknownCall(call_id.clone()))?;
        handle
            .tx
            .send(msg)
            .map_err(|_| SessionError::UnknownCall(call_id.clone()))
    }

    fn registry(&self, msg: RegistryMsg) -> Result<(), SessionError> {
        self.deps
            .registry
            .send(msg)
            .map_err(|_| SessionError::Closed)
    }
}
