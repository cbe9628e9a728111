//! Data-channel registry: creation queue, one-at-a-time creation gate, dedup cache, callback routing.
//!
//! Host-driven: the host calls `tick` at the creation poll interval and performs the returned
//! actions. The registry is owned by a single task, so none of its maps need locking.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::call::{CallId, CallInfo};
use crate::channel::{ChannelEvent, ChannelHandle, ChannelState, DataChannel, ListenerKey};
use crate::config::CoreConfig;
use crate::label::{ChannelLabel, DedupKey};

/// Queued request to create application channels for one call.
#[derive(Debug, Clone)]
struct CreateRequest {
    slot: u32,
    call_id: CallId,
    labels: Vec<String>,
    description_xml: String,
    /// Set when a closing channel blocked the attempt; the request waits at the head until then.
    not_before: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Accepted,
    RejectedNotConnected,
    RejectedQueueFull,
}

/// Where inbound channel data goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataRoute {
    /// Bootstrap, control or own channel: the owning call's worker consumes it.
    Call { call_id: CallId, bytes: Vec<u8> },
    /// Application channel: delivered to (or buffered for) the app's listener.
    Listener(Vec<RegistryAction>),
    Unknown,
}

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryAction {
    OpenBootstrap {
        call_id: CallId,
        slot: u32,
    },
    CreateChannels {
        call_id: CallId,
        slot: u32,
        labels: Vec<String>,
        description_xml: String,
    },
    Deliver {
        to: ListenerKey,
        event: ChannelEvent,
    },
}

#[derive(Debug, Clone)]
enum Owner {
    Bootstrap,
    Labelled(DedupKey),
}

struct CallChannels {
    slot: u32,
    bootstrap: Option<(ChannelHandle, ChannelState)>,
    cache: HashMap<DedupKey, DataChannel>,
}

pub struct DataChannelRegistry {
    queue_capacity: usize,
    gate_timeout: Duration,
    closing_retry_delay: Duration,
    connected: bool,
    can_create: bool,
    gate_closed_at: Option<Instant>,
    in_flight: Option<CallId>,
    queue: VecDeque<CreateRequest>,
    calls: HashMap<CallId, CallChannels>,
    handles: HashMap<ChannelHandle, (CallId, Owner)>,
    listeners: HashSet<ListenerKey>,
    /// Events for keys nobody listens to yet, replayed in order on registration.
    pending: HashMap<ListenerKey, Vec<ChannelEvent>>,
}

impl DataChannelRegistry {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            queue_capacity: config.creation_queue_capacity,
            gate_timeout: config.creation_gate_timeout(),
            closing_retry_delay: config.closing_retry_delay(),
            connected: false,
            can_create: true,
            gate_closed_at: None,
            in_flight: None,
            queue: VecDeque::new(),
            calls: HashMap::new(),
            handles: HashMap::new(),
            listeners: HashSet::new(),
            pending: HashMap::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// False while a provider-level create call is outstanding.
    pub fn can_create(&self) -> bool {
        self.can_create
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Call owning a handle, for routing raw data and send results.
    pub fn call_of(&self, handle: ChannelHandle) -> Option<&CallId> {
        self.handles.get(&handle).map(|(call_id, _)| call_id)
    }

    pub fn cached_channel(&self, call_id: &CallId, label: &ChannelLabel) -> Option<&DataChannel> {
        self.calls
            .get(call_id)
            .and_then(|c| c.cache.get(&label.dedup_key()))
    }

    /// Provider bound. Reopens bootstrap channels for calls that are still alive.
    pub fn on_provider_connected(&mut self) -> Vec<RegistryAction> {
        info!("channel provider bound");
        self.connected = true;
        let mut reopen: Vec<(&CallId, u32)> = self
            .calls
            .iter()
            .filter(|(_, c)| c.bootstrap.is_none())
            .map(|(call_id, c)| (call_id, c.slot))
            .collect();
        reopen.sort();
        reopen
            .into_iter()
            .map(|(call_id, slot)| RegistryAction::OpenBootstrap {
                call_id: call_id.clone(),
                slot,
            })
            .collect()
    }

    /// Provider gone: full local reset. Returns the calls whose channels were dropped.
    pub fn on_provider_disconnected(&mut self) -> Vec<CallId> {
        warn!(
            queued = self.queue.len(),
            "channel provider disconnected; resetting registry"
        );
        self.connected = false;
        self.release_gate();
        self.queue.clear();
        self.handles.clear();
        self.pending.clear();
        let mut affected = Vec::new();
        for (call_id, c) in self.calls.iter_mut() {
            if c.bootstrap.is_some() || !c.cache.is_empty() {
                affected.push(call_id.clone());
            }
            c.bootstrap = None;
            c.cache.clear();
        }
        affected.sort();
        affected
    }

    pub fn on_call_added(&mut self, call: &CallInfo) -> Vec<RegistryAction> {
        let entry = self
            .calls
            .entry(call.id.clone())
            .or_insert_with(|| CallChannels {
                slot: call.slot,
                bootstrap: None,
                cache: HashMap::new(),
            });
        if entry.bootstrap.is_some() {
            return Vec::new();
        }
        if !self.connected {
            debug!(call_id = %call.id, "provider not bound; bootstrap channel deferred");
            return Vec::new();
        }
        vec![RegistryAction::OpenBootstrap {
            call_id: call.id.clone(),
            slot: call.slot,
        }]
    }

    /// Forget everything about a call. Returns the number of queued creation requests dropped.
    pub fn on_call_removed(&mut self, call_id: &CallId) -> usize {
        let before = self.queue.len();
        self.queue.retain(|r| &r.call_id != call_id);
        let dropped = before - self.queue.len();
        if let Some(c) = self.calls.remove(call_id) {
            if let Some((handle, _)) = c.bootstrap {
                self.handles.remove(&handle);
            }
            for ch in c.cache.values() {
                self.handles.remove(&ch.handle);
            }
        }
        self.listeners.retain(|k| k.call_id() != call_id);
        self.pending.retain(|k, _| k.call_id() != call_id);
        if self.in_flight.as_ref() == Some(call_id) {
            self.release_gate();
        }
        debug!(%call_id, dropped, "call removed from channel registry");
        dropped
    }

    /// Enqueue a creation request. Returns immediately; the labels go out on a later `tick`.
    pub fn create_application_channels(
        &mut self,
        slot: u32,
        call_id: &CallId,
        labels: Vec<String>,
        description_xml: String,
    ) -> CreateOutcome {
        if !self.connected {
            return CreateOutcome::RejectedNotConnected;
        }
        if self.queue.len() >= self.queue_capacity {
            warn!(%call_id, capacity = self.queue_capacity, "creation queue full");
            return CreateOutcome::RejectedQueueFull;
        }
        self.queue.push_back(CreateRequest {
            slot,
            call_id: call_id.clone(),
            labels,
            description_xml,
            not_before: None,
        });
        CreateOutcome::Accepted
    }

    /// Poll the creation queue. Issues at most one provider create call.
    pub fn tick(&mut self, now: Instant) -> Vec<RegistryAction> {
        if !self.can_create {
            match self.gate_closed_at {
                Some(at) if now.saturating_duration_since(at) >= self.gate_timeout => {
                    warn!(call_id = ?self.in_flight, "no creation ack before timeout; reopening gate");
                    self.release_gate();
                }
                _ => return Vec::new(),
            }
        }
        let due = match self.queue.front() {
            Some(r) => r.not_before.map_or(true, |t| now >= t),
            None => false,
        };
        if !due {
            return Vec::new();
        }
        let Some(mut request) = self.queue.pop_front() else {
            return Vec::new();
        };

        let mut parsed = Vec::with_capacity(request.labels.len());
        for raw in &request.labels {
            match raw.parse::<ChannelLabel>() {
                Ok(label) => parsed.push((raw.clone(), label)),
                Err(e) => warn!(label = %raw, error = %e, "dropping unparseable label"),
            }
        }

        let closing = parsed.iter().any(|(_, label)| {
            self.cached_channel(&request.call_id, label)
                .is_some_and(|ch| ch.state == ChannelState::Closing)
        });
        if closing {
            debug!(call_id = %request.call_id, "cached channel closing; creation retried later");
            request.not_before = Some(now + self.closing_retry_delay);
            self.queue.push_front(request);
            return Vec::new();
        }

        let mut actions = Vec::new();
        let mut forward = Vec::new();
        for (raw, label) in parsed {
            let cached = self.cached_channel(&request.call_id, &label).cloned();
            match cached {
                Some(ch) if matches!(ch.state, ChannelState::Open | ChannelState::Connecting) => {
                    debug!(label = %raw, handle = %ch.handle, "replaying cached channel");
                    let to = ListenerKey::for_channel(&ch);
                    actions.extend(self.route(ChannelEvent::Created(ch), to));
                }
                _ => forward.push(raw),
            }
        }
        if forward.is_empty() {
            return actions;
        }

        self.can_create = false;
        self.gate_closed_at = Some(now);
        self.in_flight = Some(request.call_id.clone());
        actions.push(RegistryAction::CreateChannels {
            call_id: request.call_id,
            slot: request.slot,
            labels: forward,
            description_xml: request.description_xml,
        });
        actions
    }

    /// Provider acknowledged the outstanding create call (success or failure). Acks for a call
    /// other than the one in flight are stale and leave the gate as it is.
    pub fn on_create_result(&mut self, call_id: &CallId, ok: bool) {
        if self.in_flight.as_ref() != Some(call_id) {
            debug!(%call_id, in_flight = ?self.in_flight, ok, "stale creation ack ignored");
            return;
        }
        if ok {
            debug!(%call_id, "channel creation acknowledged");
        } else {
            warn!(%call_id, "channel creation failed");
        }
        self.release_gate();
    }

    pub fn on_bootstrap_created(
        &mut self,
        call_id: &CallId,
        handle: ChannelHandle,
    ) -> Vec<RegistryAction> {
        let Some(c) = self.calls.get_mut(call_id) else {
            warn!(%call_id, %handle, "bootstrap channel for unknown call");
            return Vec::new();
        };
        c.bootstrap = Some((handle, ChannelState::Connecting));
        self.handles
            .insert(handle, (call_id.clone(), Owner::Bootstrap));
        self.route(
            ChannelEvent::BootstrapCreated {
                call_id: call_id.clone(),
                handle,
            },
            ListenerKey::Bootstrap(call_id.clone()),
        )
    }

    /// Raw channel-created callback: only a label and a handle.
    pub fn on_channel_created(
        &mut self,
        call_id: &CallId,
        label: &str,
        handle: ChannelHandle,
    ) -> Vec<RegistryAction> {
        let label = match label.parse::<ChannelLabel>() {
            Ok(l) => l,
            Err(e) => {
                warn!(%call_id, %label, error = %e, "ignoring channel with malformed label");
                return Vec::new();
            }
        };
        let Some(c) = self.calls.get_mut(call_id) else {
            warn!(%call_id, %handle, "channel created for unknown call");
            return Vec::new();
        };
        let key = label.dedup_key();
        let channel = DataChannel {
            handle,
            call_id: call_id.clone(),
            label,
            state: ChannelState::Connecting,
        };
        if let Some(old) = c.cache.insert(key.clone(), channel.clone()) {
            if old.handle != handle {
                self.handles.remove(&old.handle);
            }
        }
        self.handles
            .insert(handle, (call_id.clone(), Owner::Labelled(key)));
        let to = ListenerKey::for_channel(&channel);
        self.route(ChannelEvent::Created(channel), to)
    }

    pub fn on_channel_state_changed(
        &mut self,
        handle: ChannelHandle,
        state: ChannelState,
    ) -> Vec<RegistryAction> {
        let Some((call_id, owner)) = self.handles.get(&handle).cloned() else {
            debug!(%handle, ?state, "state change for unknown channel");
            return Vec::new();
        };
        let Some(c) = self.calls.get_mut(&call_id) else {
            return Vec::new();
        };
        let to = match owner {
            Owner::Bootstrap => {
                if let Some(b) = c.bootstrap.as_mut() {
                    b.1 = state;
                }
                ListenerKey::Bootstrap(call_id.clone())
            }
            Owner::Labelled(key) => {
                let Some(ch) = c.cache.get_mut(&key) else {
                    return Vec::new();
                };
                ch.state = state;
                ListenerKey::for_channel(ch)
            }
        };
        self.route(
            ChannelEvent::StateChanged {
                call_id,
                handle,
                state,
            },
            to,
        )
    }

    /// Raw inbound data on a channel.
    pub fn on_channel_data(&mut self, handle: ChannelHandle, bytes: Vec<u8>) -> DataRoute {
        let Some((call_id, owner)) = self.handles.get(&handle).cloned() else {
            return DataRoute::Unknown;
        };
        let to = match owner {
            Owner::Bootstrap => None,
            Owner::Labelled(key) => self
                .calls
                .get(&call_id)
                .and_then(|c| c.cache.get(&key))
                .map(ListenerKey::for_channel)
                .filter(|k| matches!(k, ListenerKey::App { .. })),
        };
        match to {
            Some(to) => DataRoute::Listener(self.route(
                ChannelEvent::Data {
                    call_id,
                    handle,
                    bytes,
                },
                to,
            )),
            None => DataRoute::Call { call_id, bytes },
        }
    }

    /// Register a listener and replay what it missed: buffered events first, then any open
    /// cached channel under the key that was not part of the buffer.
    pub fn register_listener(&mut self, key: ListenerKey) -> Vec<RegistryAction> {
        self.listeners.insert(key.clone());

        let mut drained: Vec<ListenerKey> = self
            .pending
            .keys()
            .filter(|k| **k == key || k.wildcard().as_ref() == Some(&key))
            .cloned()
            .collect();
        drained.sort();
        let mut replay = Vec::new();
        for k in drained {
            if let Some(events) = self.pending.remove(&k) {
                replay.extend(events);
            }
        }

        let seen: HashSet<ChannelHandle> = replay
            .iter()
            .filter_map(|e| match e {
                ChannelEvent::Created(ch) => Some(ch.handle),
                ChannelEvent::BootstrapCreated { handle, .. } => Some(*handle),
                ChannelEvent::StateChanged { .. } | ChannelEvent::Data { .. } => None,
            })
            .collect();

        if let Some(c) = self.calls.get(key.call_id()) {
            if let ListenerKey::Bootstrap(call_id) = &key {
                if let Some((handle, state)) = c.bootstrap {
                    if !seen.contains(&handle) {
                        replay.push(ChannelEvent::BootstrapCreated {
                            call_id: call_id.clone(),
                            handle,
                        });
                        if state != ChannelState::Connecting {
                            replay.push(ChannelEvent::StateChanged {
                                call_id: call_id.clone(),
                                handle,
                                state,
                            });
                        }
                    }
                }
            }
            let mut open: Vec<&DataChannel> = c
                .cache
                .values()
                .filter(|ch| ch.state == ChannelState::Open && !seen.contains(&ch.handle))
                .filter(|ch| {
                    let exact = ListenerKey::for_channel(ch);
                    exact == key
                        || (exact.wildcard().as_ref() == Some(&key)
                            && !self.listeners.contains(&exact))
                })
                .collect();
            open.sort_by_key(|ch| ch.handle);
            replay.extend(open.into_iter().cloned().map(ChannelEvent::Created));
        }

        replay
            .into_iter()
            .map(|event| RegistryAction::Deliver {
                to: key.clone(),
                event,
            })
            .collect()
    }

    /// Idempotent. Returns false when the key was not registered.
    pub fn unregister_listener(&mut self, key: &ListenerKey) -> bool {
        let removed = self.listeners.remove(key);
        if !removed {
            debug!(?key, "listener already unregistered");
        }
        removed
    }

    fn route(&mut self, event: ChannelEvent, to: ListenerKey) -> Vec<RegistryAction> {
        if self.listeners.contains(&to) {
            return vec![RegistryAction::Deliver { to, event }];
        }
        if let Some(wildcard) = to.wildcard() {
            if self.listeners.contains(&wildcard) {
                return vec![RegistryAction::Deliver {
                    to: wildcard,
                    event,
                }];
            }
        }
        debug!(?to, "no listener yet; buffering channel event");
        self.pending.entry(to).or_default().push(event);
        Vec::new()
    }

    fn release_gate(&mut self) {
        self.can_create = true;
        self.gate_closed_at = None;
        self.in_flight = None;
    }
}
