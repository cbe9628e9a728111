//! Task that owns the [`DataChannelRegistry`]: the single consumer of the creation queue and
//! the router of provider events to listeners and call workers.
//!
//! Every map here is owned by the actor task; nothing is shared or locked.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use miniapp_core::{
    CallId, CallInfo, ChannelEvent, CoreConfig, CreateOutcome, DataChannelRegistry, DataRoute,
    ListenerKey, RegistryAction,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::provider::{ChannelProvider, ProviderEvent};
use crate::worker::WorkerMsg;

pub(crate) type ChannelSink = mpsc::UnboundedSender<ChannelEvent>;

pub(crate) enum RegistryMsg {
    Provider(ProviderEvent),
    CallAdded {
        call: CallInfo,
        worker: mpsc::UnboundedSender<WorkerMsg>,
        sink: ChannelSink,
    },
    CallRemoved {
        call_id: CallId,
        done: oneshot::Sender<usize>,
    },
    Create {
        slot: u32,
        call_id: CallId,
        labels: Vec<String>,
        description_xml: String,
        reply: Option<oneshot::Sender<CreateOutcome>>,
    },
    Register {
        key: ListenerKey,
        sink: ChannelSink,
    },
    Unregister {
        key: ListenerKey,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

pub(crate) struct RegistryActor {
    registry: DataChannelRegistry,
    provider: Arc<dyn ChannelProvider>,
    sinks: HashMap<ListenerKey, ChannelSink>,
    workers: HashMap<CallId, mpsc::UnboundedSender<WorkerMsg>>,
    poll_interval: Duration,
}

impl RegistryActor {
    pub(crate) fn new(config: &CoreConfig, provider: Arc<dyn ChannelProvider>) -> Self {
        Self {
            registry: DataChannelRegistry::new(config),
            provider,
            sinks: HashMap::new(),
            workers: HashMap::new(),
            poll_interval: config.creation_poll_interval(),
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RegistryMsg>) {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(RegistryMsg::Shutdown) | None => break,
                    Some(msg) => self.handle(msg),
                },
                _ = poll.tick() => {
                    let actions = self.registry.tick(crate::now());
                    self.execute(actions);
                }
            }
        }
        debug!("registry actor stopped");
    }

    fn handle(&mut self, msg: RegistryMsg) {
        match msg {
            RegistryMsg::Provider(event) => self.on_provider_event(event),
            RegistryMsg::CallAdded { call, worker, sink } => {
                self.workers.insert(call.id.clone(), worker);
                for key in [
                    ListenerKey::Bootstrap(call.id.clone()),
                    ListenerKey::Control {
                        call_id: call.id.clone(),
                        app_id: None,
                    },
                    ListenerKey::Own {
                        call_id: call.id.clone(),
                        app_id: None,
                    },
                ] {
                    self.sinks.insert(key.clone(), sink.clone());
                    let replay = self.registry.register_listener(key);
                    self.execute(replay);
                }
                let actions = self.registry.on_call_added(&call);
                self.execute(actions);
            }
            RegistryMsg::CallRemoved { call_id, done } => {
                let dropped = self.registry.on_call_removed(&call_id);
                self.sinks.retain(|k, _| k.call_id() != &call_id);
                self.workers.remove(&call_id);
                let _ = done.send(dropped);
            }
            RegistryMsg::Create {
                slot,
                call_id,
                labels,
                description_xml,
                reply,
            } => {
                let outcome =
                    self.registry
                        .create_application_channels(slot, &call_id, labels, description_xml);
                debug!(%call_id, ?outcome, "channel creation requested");
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            RegistryMsg::Register { key, sink } => {
                self.sinks.insert(key.clone(), sink);
                let replay = self.registry.register_listener(key);
                self.execute(replay);
            }
            RegistryMsg::Unregister { key, reply } => {
                let removed = self.remove_listener(&key);
                let _ = reply.send(removed);
            }
            RegistryMsg::Shutdown => {}
        }
    }

    fn on_provider_event(&mut self, event: ProviderEvent) {
        let actions = match event {
            ProviderEvent::Connected => self.registry.on_provider_connected(),
            ProviderEvent::Disconnected => {
                for call_id in self.registry.on_provider_disconnected() {
                    self.to_worker(&call_id, WorkerMsg::ProviderLost);
                }
                Vec::new()
            }
            ProviderEvent::BootstrapCreated { call_id, handle } => {
                self.registry.on_bootstrap_created(&call_id, handle)
            }
            ProviderEvent::ChannelCreated {
                call_id,
                label,
                handle,
            } => self.registry.on_channel_created(&call_id, &label, handle),
            ProviderEvent::CreateResult { call_id, ok } => {
                self.registry.on_create_result(&call_id, ok);
                Vec::new()
            }
            ProviderEvent::StateChanged { handle, state } => {
                self.registry.on_channel_state_changed(handle, state)
            }
            ProviderEvent::Data { handle, bytes } => {
                match self.registry.on_channel_data(handle, bytes) {
                    DataRoute::Call { call_id, bytes } => {
                        self.to_worker(&call_id, WorkerMsg::Data { handle, bytes });
                        Vec::new()
                    }
                    DataRoute::Listener(actions) => actions,
                    DataRoute::Unknown => {
                        debug!(%handle, "data on unknown channel");
                        Vec::new()
                    }
                }
            }
            ProviderEvent::SendResult { handle, code } => {
                match self.registry.call_of(handle).cloned() {
                    Some(call_id) => {
                        self.to_worker(&call_id, WorkerMsg::SendResult { handle, code })
                    }
                    None => debug!(%handle, code, "send result on unknown channel"),
                }
                Vec::new()
            }
        };
        self.execute(actions);
    }

    fn execute(&mut self, actions: Vec<RegistryAction>) {
        for action in actions {
            match action {
                RegistryAction::OpenBootstrap { call_id, slot } => {
                    if let Err(e) = self.provider.open_bootstrap(&call_id, slot) {
                        warn!(%call_id, error = %e, "open bootstrap channel failed");
                    }
                }
                RegistryAction::CreateChannels {
                    call_id,
                    slot,
                    labels,
                    description_xml,
                } => {
                    if let Err(e) =
                        self.provider
                            .create_channels(&call_id, slot, &labels, &description_xml)
                    {
                        warn!(%call_id, error = %e, "create channels failed");
                        self.registry.on_create_result(&call_id, false);
                    }
                }
                RegistryAction::Deliver { to, event } => {
                    let delivered = self
                        .sinks
                        .get(&to)
                        .is_some_and(|sink| sink.send(event).is_ok());
                    if !delivered {
                        debug!(?to, "listener gone; unregistering");
                        self.remove_listener(&to);
                    }
                }
            }
        }
    }

    fn remove_listener(&mut self, key: &ListenerKey) -> bool {
        self.sinks.remove(key);
        let removed = self.registry.unregister_listener(key);
        if let (true, ListenerKey::App { call_id, app_id }) = (removed, key) {
            self.to_worker(
                call_id,
                WorkerMsg::AppChannelUnregistered {
                    app_id: app_id.clone(),
                },
            );
        }
        removed
    }

    fn to_worker(&mut self, call_id: &CallId, msg: WorkerMsg) {
        let gone = match self.workers.get(call_id) {
            Some(tx) => tx.send(msg).is_err(),
            None => {
                debug!(%call_id, "no worker for call");
                false
            }
        };
        if gone {
            self.workers.remove(call_id);
        }
    }
}
