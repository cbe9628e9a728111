//! Bootstrap channel protocol: FIFO request queue, chunked response reassembly, bounded send retry
//! and the call-state heartbeat, for one call's bootstrap channel.
//!
//! Only the head of the queue is ever in flight. Inbound bytes always belong to the head.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::call::{CallId, CallInfo, CallState};
use crate::catalog::MiniAppCatalog;
use crate::channel::{ChannelHandle, ChannelState, SendCode, SEND_OK};
use crate::config::CoreConfig;
use crate::http::{
    Completeness, ContentLengthFraming, HttpRequest, HttpResponse, ResponseFraming,
    STATUS_NOT_MODIFIED,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Catalog {
        begin_index: usize,
        app_num: usize,
    },
    Binary {
        app_id: String,
        if_none_match: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Idle,
    Sending,
    Retry,
}

/// One queued request and its accumulating response.
#[derive(Debug)]
pub struct RequestMessage {
    pub id: Uuid,
    pub kind: RequestKind,
    bytes: Vec<u8>,
    buffer: Vec<u8>,
    retries: u32,
    status: RequestStatus,
    retry_at: Option<Instant>,
}

impl RequestMessage {
    fn new(kind: RequestKind, sdk_version: &str) -> Self {
        let request = match &kind {
            RequestKind::Catalog {
                begin_index,
                app_num,
            } => HttpRequest::catalog(*begin_index, *app_num, sdk_version),
            RequestKind::Binary {
                app_id,
                if_none_match,
            } => HttpRequest::binary(app_id, sdk_version, if_none_match.as_deref()),
        };
        Self {
            id: Uuid::new_v4(),
            kind,
            bytes: request.to_bytes(),
            buffer: Vec::new(),
            retries: 0,
            status: RequestStatus::Idle,
            retry_at: None,
        }
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}

/// Why a binary fetch failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownloadFailure {
    #[error("send retries exhausted")]
    SendExhausted,
    #[error("undecodable response")]
    Decode,
    #[error("server answered {0}")]
    Status(u16),
    #[error("response has no ETag")]
    MissingEtag,
    #[error("response has no body")]
    EmptyBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapAction {
    Send {
        handle: ChannelHandle,
        bytes: Vec<u8>,
    },
    /// Merged catalog after a page arrived.
    CatalogLoaded {
        catalog: MiniAppCatalog,
        first_page: bool,
    },
    /// A catalog request exhausted its send retries.
    CatalogFailed,
    DownloadProgress {
        app_id: String,
        percent: u8,
    },
    BinaryDownloaded {
        app_id: String,
        etag: String,
        archive: Vec<u8>,
    },
    /// 304: the installed version is current.
    BinaryNotModified {
        app_id: String,
        etag: String,
    },
    DownloadFailed {
        app_id: String,
        reason: DownloadFailure,
    },
    CallStateRefresh {
        call_id: CallId,
    },
}

pub struct BootstrapChannelProtocol {
    call_id: CallId,
    call_state: CallState,
    config: CoreConfig,
    framing: Box<dyn ResponseFraming>,
    handle: Option<ChannelHandle>,
    channel_state: ChannelState,
    queue: VecDeque<RequestMessage>,
    catalog: Option<MiniAppCatalog>,
    next_heartbeat: Option<Instant>,
}

impl BootstrapChannelProtocol {
    pub fn new(call: &CallInfo, config: &CoreConfig) -> Self {
        Self::with_framing(call, config, Box::new(ContentLengthFraming))
    }

    pub fn with_framing(
        call: &CallInfo,
        config: &CoreConfig,
        framing: Box<dyn ResponseFraming>,
    ) -> Self {
        Self {
            call_id: call.id.clone(),
            call_state: call.state,
            config: config.clone(),
            framing,
            handle: None,
            channel_state: ChannelState::Closed,
            queue: VecDeque::new(),
            catalog: None,
            next_heartbeat: None,
        }
    }

    pub fn handle(&self) -> Option<ChannelHandle> {
        self.handle
    }

    pub fn catalog(&self) -> Option<&MiniAppCatalog> {
        self.catalog.as_ref()
    }

    pub fn pending_requests(&self) -> usize {
        self.queue.len()
    }

    pub fn head(&self) -> Option<&RequestMessage> {
        self.queue.front()
    }

    pub fn is_heartbeat_running(&self) -> bool {
        self.next_heartbeat.is_some()
    }

    pub fn on_channel_created(&mut self, handle: ChannelHandle) {
        debug!(call_id = %self.call_id, %handle, "bootstrap channel created");
        self.handle = Some(handle);
        self.channel_state = ChannelState::Connecting;
    }

    pub fn on_channel_state(&mut self, state: ChannelState, now: Instant) -> Vec<BootstrapAction> {
        self.channel_state = state;
        match state {
            ChannelState::Open => {
                info!(call_id = %self.call_id, "bootstrap channel open");
                let mut actions = Vec::new();
                if self.call_state != CallState::Disconnected {
                    actions.push(BootstrapAction::CallStateRefresh {
                        call_id: self.call_id.clone(),
                    });
                    self.next_heartbeat = Some(now + self.config.heartbeat_interval());
                }
                actions.extend(self.pump());
                actions
            }
            ChannelState::Closing | ChannelState::Closed => {
                debug!(call_id = %self.call_id, ?state, "bootstrap channel going away");
                self.next_heartbeat = None;
                // Whatever was in flight is resent from scratch on the next open channel.
                if let Some(head) = self.queue.front_mut() {
                    head.status = RequestStatus::Idle;
                    head.buffer.clear();
                    head.retry_at = None;
                }
                if state == ChannelState::Closed {
                    self.handle = None;
                }
                Vec::new()
            }
            ChannelState::Connecting => Vec::new(),
        }
    }

    pub fn on_call_state(&mut self, state: CallState, now: Instant) {
        self.call_state = state;
        if state == CallState::Disconnected {
            self.next_heartbeat = None;
        } else if self.channel_state == ChannelState::Open && self.next_heartbeat.is_none() {
            self.next_heartbeat = Some(now + self.config.heartbeat_interval());
        }
    }

    /// Fetch catalog page 0.
    pub fn request_catalog(&mut self) -> Vec<BootstrapAction> {
        self.enqueue(RequestKind::Catalog {
            begin_index: 0,
            app_num: self.config.catalog_page_size,
        })
    }

    /// Fetch the next page, if the server has more.
    pub fn load_more(&mut self) -> Vec<BootstrapAction> {
        let begin_index = match &self.catalog {
            Some(c) if c.has_more() => c.len(),
            _ => {
                debug!(call_id = %self.call_id, "catalog complete; nothing more to load");
                return Vec::new();
            }
        };
        self.enqueue(RequestKind::Catalog {
            begin_index,
            app_num: self.config.catalog_page_size,
        })
    }

    pub fn request_binary(
        &mut self,
        app_id: &str,
        if_none_match: Option<&str>,
    ) -> Vec<BootstrapAction> {
        self.enqueue(RequestKind::Binary {
            app_id: app_id.to_string(),
            if_none_match: if_none_match.map(str::to_string),
        })
    }

    /// Low-level send result for the head request.
    pub fn on_send_result(&mut self, code: SendCode, now: Instant) -> Vec<BootstrapAction> {
        let Some(head) = self.queue.front_mut() else {
            debug!(call_id = %self.call_id, code, "send result with empty queue");
            return Vec::new();
        };
        if head.status != RequestStatus::Sending {
            debug!(call_id = %self.call_id, code, status = ?head.status, "stale send result");
            return Vec::new();
        }
        if code == SEND_OK {
            return Vec::new();
        }
        if !self.config.is_transient(code) {
            debug!(call_id = %self.call_id, code, "non-transient send code treated as ack");
            return Vec::new();
        }
        head.retries += 1;
        if head.retries >= self.config.max_send_retries {
            warn!(
                call_id = %self.call_id,
                request = %head.id,
                retries = head.retries,
                "bootstrap request dropped after transient send failures"
            );
            let mut actions = Vec::new();
            if let Some(dropped) = self.queue.pop_front() {
                actions.push(failure_for(&dropped.kind, DownloadFailure::SendExhausted));
            }
            actions.extend(self.pump());
            return actions;
        }
        debug!(call_id = %self.call_id, code, retries = head.retries, "transient send failure; retrying");
        head.status = RequestStatus::Retry;
        head.retry_at = Some(now + self.config.send_retry_delay());
        Vec::new()
    }

    /// Resubmit a due retry and emit the heartbeat.
    pub fn tick(&mut self, now: Instant) -> Vec<BootstrapAction> {
        let mut actions = Vec::new();
        if let Some(next) = self.next_heartbeat {
            if now >= next {
                actions.push(BootstrapAction::CallStateRefresh {
                    call_id: self.call_id.clone(),
                });
                self.next_heartbeat = Some(now + self.config.heartbeat_interval());
            }
        }
        let due = self.queue.front().is_some_and(|h| {
            h.status == RequestStatus::Retry && h.retry_at.is_some_and(|t| now >= t)
        });
        if due {
            if let Some(head) = self.queue.front_mut() {
                head.status = RequestStatus::Idle;
                head.retry_at = None;
            }
            actions.extend(self.pump());
        }
        actions
    }

    /// Inbound bytes from the bootstrap channel.
    pub fn on_data(&mut self, bytes: &[u8]) -> Vec<BootstrapAction> {
        let Some(head) = self.queue.front_mut() else {
            warn!(call_id = %self.call_id, len = bytes.len(), "bootstrap data with no request outstanding");
            return Vec::new();
        };
        head.buffer.extend_from_slice(bytes);
        match self.framing.check(&head.buffer) {
            Completeness::Incomplete { percent } => match &head.kind {
                RequestKind::Binary { app_id, .. } => vec![BootstrapAction::DownloadProgress {
                    app_id: app_id.clone(),
                    percent,
                }],
                RequestKind::Catalog { .. } => Vec::new(),
            },
            Completeness::Complete => {
                let mut actions = Vec::new();
                if let Some(done) = self.queue.pop_front() {
                    actions.extend(self.dispatch(done));
                }
                actions.extend(self.pump());
                actions
            }
        }
    }

    /// Call teardown: discard every queued request. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        self.next_heartbeat = None;
        self.catalog = None;
        self.handle = None;
        self.channel_state = ChannelState::Closed;
        if dropped > 0 {
            debug!(call_id = %self.call_id, dropped, "bootstrap queue cleared");
        }
        dropped
    }

    fn enqueue(&mut self, kind: RequestKind) -> Vec<BootstrapAction> {
        if self.queue.iter().any(|r| r.kind == kind) {
            debug!(call_id = %self.call_id, ?kind, "identical request already queued");
            return Vec::new();
        }
        self.queue
            .push_back(RequestMessage::new(kind, &self.config.sdk_version));
        self.pump()
    }

    fn pump(&mut self) -> Vec<BootstrapAction> {
        if self.channel_state != ChannelState::Open {
            return Vec::new();
        }
        let Some(handle) = self.handle else {
            return Vec::new();
        };
        match self.queue.front_mut() {
            Some(head) if head.status == RequestStatus::Idle => {
                head.status = RequestStatus::Sending;
                debug!(call_id = %self.call_id, request = %head.id, kind = ?head.kind, "sending bootstrap request");
                vec![BootstrapAction::Send {
                    handle,
                    bytes: head.bytes.clone(),
                }]
            }
            _ => Vec::new(),
        }
    }

    fn dispatch(&mut self, done: RequestMessage) -> Vec<BootstrapAction> {
        let response = HttpResponse::decode(self.framing.strip(&done.buffer));
        match done.kind {
            RequestKind::Catalog { begin_index, .. } => {
                let response = match response {
                    Ok(r) if r.is_success() => r,
                    Ok(r) => {
                        warn!(call_id = %self.call_id, status = r.status, "catalog request refused");
                        return Vec::new();
                    }
                    Err(e) => {
                        warn!(call_id = %self.call_id, error = %e, "undecodable catalog response");
                        return Vec::new();
                    }
                };
                let page = match MiniAppCatalog::parse(&response.body, &self.call_id) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(call_id = %self.call_id, error = %e, "malformed catalog");
                        return Vec::new();
                    }
                };
                let first_page = begin_index == 0;
                let merged = match self.catalog.take() {
                    Some(mut existing) if !first_page => {
                        existing.merge(page);
                        existing
                    }
                    _ => page,
                };
                info!(call_id = %self.call_id, apps = merged.len(), total = merged.total_num, "catalog loaded");
                self.catalog = Some(merged.clone());
                vec![BootstrapAction::CatalogLoaded {
                    catalog: merged,
                    first_page,
                }]
            }
            RequestKind::Binary {
                app_id,
                if_none_match,
            } => {
                let failed = |reason| {
                    vec![BootstrapAction::DownloadFailed {
                        app_id: app_id.clone(),
                        reason,
                    }]
                };
                let response = match response {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(call_id = %self.call_id, %app_id, error = %e, "undecodable binary response");
                        return failed(DownloadFailure::Decode);
                    }
                };
                if response.status == STATUS_NOT_MODIFIED {
                    if let Some(etag) = response.etag().map(str::to_string).or(if_none_match) {
                        return vec![BootstrapAction::BinaryNotModified { app_id, etag }];
                    }
                    return failed(DownloadFailure::MissingEtag);
                }
                if !response.is_success() {
                    return failed(DownloadFailure::Status(response.status));
                }
                let Some(etag) = response.etag().map(str::to_string) else {
                    return failed(DownloadFailure::MissingEtag);
                };
                if response.body.is_empty() {
                    return failed(DownloadFailure::EmptyBody);
                }
                info!(call_id = %self.call_id, %app_id, %etag, bytes = response.body.len(), "binary downloaded");
                vec![BootstrapAction::BinaryDownloaded {
                    app_id,
                    etag,
                    archive: response.body,
                }]
            }
        }
    }
}

fn failure_for(kind: &RequestKind, reason: DownloadFailure) -> BootstrapAction {
    match kind {
        RequestKind::Catalog { .. } => BootstrapAction::CatalogFailed,
        RequestKind::Binary { app_id, .. } => BootstrapAction::DownloadFailed {
            app_id: app_id.clone(),
            reason,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::call::MediaType;
    use crate::http::HttpRequest;

    const BUSY: SendCode = 2;

    fn open(now: Instant) -> BootstrapChannelProtocol {
        let call = CallInfo::new("c1", 0, MediaType::Audio, CallState::Active);
        let mut p = BootstrapChannelProtocol::new(&call, &CoreConfig::default());
        p.on_channel_created(ChannelHandle(1));
        p.on_channel_state(ChannelState::Open, now);
        p
    }

    fn sent(actions: &[BootstrapAction]) -> Vec<HttpRequest> {
        actions
            .iter()
            .filter_map(|a| match a {
                BootstrapAction::Send { bytes, .. } => HttpRequest::decode(bytes).ok(),
                _ => None,
            })
            .collect()
    }

    fn binary_response(etag: &str, body: &[u8]) -> Vec<u8> {
        HttpResponse::new(200)
            .with_header("ETag", etag)
            .with_body(body.to_vec())
            .to_bytes()
    }

    fn catalog_response(json: &str) -> Vec<u8> {
        HttpResponse::new(200).with_body(json).to_bytes()
    }

    #[test]
    fn response_complete_on_third_chunk_dispatches_once() {
        let t0 = Instant::now();
        let mut p = open(t0);
        let actions = p.request_binary("weather", None);
        assert_eq!(sent(&actions)[0].query("appid"), Some("weather"));

        let raw = binary_response("e1", &[9u8; 90]);
        let header_len = raw.len() - 90;
        let (a, rest) = raw.split_at(10);
        let (b, c) = rest.split_at(header_len + 30 - 10);

        let first = p.on_data(a);
        assert!(matches!(&first[..], [BootstrapAction::DownloadProgress { percent: 0, .. }]));
        let second = p.on_data(b);
        assert!(matches!(&second[..], [BootstrapAction::DownloadProgress { percent: 33, .. }]));
        let third = p.on_data(c);
        let done: Vec<_> = third
            .iter()
            .filter(|a| matches!(a, BootstrapAction::BinaryDownloaded { .. }))
            .collect();
        assert_eq!(done.len(), 1);
        assert!(matches!(
            done[0],
            BootstrapAction::BinaryDownloaded { etag, archive, .. } if etag == "e1" && archive.len() == 90
        ));
        assert_eq!(p.pending_requests(), 0);
    }

    #[test]
    fn requests_go_out_one_at_a_time_in_order() {
        let t0 = Instant::now();
        let mut p = open(t0);
        let first = p.request_binary("a", None);
        assert_eq!(sent(&first).len(), 1);
        assert!(sent(&p.request_binary("b", None)).is_empty());
        assert!(sent(&p.request_binary("c", None)).is_empty());

        let mut order = Vec::new();
        for (app, etag) in [("a", "ea"), ("b", "eb"), ("c", "ec")] {
            let actions = p.on_data(&binary_response(etag, b"zip"));
            for a in &actions {
                if let BootstrapAction::BinaryDownloaded { app_id, .. } = a {
                    order.push(app_id.clone());
                }
            }
            let next = sent(&actions);
            if app != "c" {
                assert_eq!(next.len(), 1);
            }
        }
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn three_transient_failures_drop_request_once() {
        let t0 = Instant::now();
        let mut p = open(t0);
        p.request_binary("a", None);
        p.request_binary("b", None);

        assert!(p.on_send_result(BUSY, t0).is_empty());
        let resend = p.tick(t0 + Duration::from_millis(100));
        assert_eq!(sent(&resend).len(), 1);
        assert!(p.on_send_result(3, t0 + Duration::from_millis(110)).is_empty());
        p.tick(t0 + Duration::from_millis(210));
        let actions = p.on_send_result(BUSY, t0 + Duration::from_millis(220));

        let failures: Vec<_> = actions
            .iter()
            .filter(|a| matches!(a, BootstrapAction::DownloadFailed { .. }))
            .collect();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0],
            BootstrapAction::DownloadFailed { app_id, reason: DownloadFailure::SendExhausted } if app_id == "a"
        ));
        assert_eq!(sent(&actions)[0].query("appid"), Some("b"));
        assert_eq!(p.pending_requests(), 1);
    }

    #[test]
    fn retry_waits_for_delay() {
        let t0 = Instant::now();
        let mut p = open(t0);
        p.request_binary("a", None);
        p.on_send_result(BUSY, t0);
        assert_eq!(p.head().map(|h| h.status()), Some(RequestStatus::Retry));
        assert!(sent(&p.tick(t0 + Duration::from_millis(99))).is_empty());
        assert_eq!(sent(&p.tick(t0 + Duration::from_millis(100))).len(), 1);
        assert_eq!(p.head().map(|h| h.retries()), Some(1));
    }

    #[test]
    fn other_send_codes_are_acks() {
        let t0 = Instant::now();
        let mut p = open(t0);
        p.request_binary("a", None);
        assert!(p.on_send_result(7, t0).is_empty());
        assert_eq!(p.head().map(|h| h.status()), Some(RequestStatus::Sending));
        let actions = p.on_data(&binary_response("e", b"zip"));
        assert!(actions
            .iter()
            .any(|a| matches!(a, BootstrapAction::BinaryDownloaded { .. })));
    }

    #[test]
    fn not_modified_reuses_installed_etag() {
        let t0 = Instant::now();
        let mut p = open(t0);
        let actions = p.request_binary("a", Some("v1"));
        assert_eq!(sent(&actions)[0].header("If-None-Match"), Some("v1"));
        let raw = HttpResponse::new(304).to_bytes();
        assert_eq!(
            p.on_data(&raw),
            vec![BootstrapAction::BinaryNotModified {
                app_id: "a".into(),
                etag: "v1".into()
            }]
        );
    }

    #[test]
    fn missing_etag_or_body_fails() {
        let t0 = Instant::now();
        let mut p = open(t0);
        p.request_binary("a", None);
        let raw = HttpResponse::new(200).with_body("zip").to_bytes();
        assert!(matches!(
            &p.on_data(&raw)[..],
            [BootstrapAction::DownloadFailed { reason: DownloadFailure::MissingEtag, .. }]
        ));
        p.request_binary("b", None);
        assert!(matches!(
            &p.on_data(&binary_response("e", b""))[..],
            [BootstrapAction::DownloadFailed { reason: DownloadFailure::EmptyBody, .. }]
        ));
    }

    #[test]
    fn catalog_pages_merge() {
        let t0 = Instant::now();
        let mut p = open(t0);
        let req = sent(&p.request_catalog());
        assert_eq!(req[0].query("begin-index"), Some("0"));
        assert_eq!(req[0].query("app-num"), Some("20"));

        let page0 = catalog_response(
            r#"{"totalNum": 2, "peerDcSupported": true, "applications": [{"appId": "a", "eTag": "1"}]}"#,
        );
        let actions = p.on_data(&page0);
        assert!(matches!(
            &actions[..],
            [BootstrapAction::CatalogLoaded { first_page: true, catalog }] if catalog.len() == 1
        ));

        let more = sent(&p.load_more());
        assert_eq!(more[0].query("begin-index"), Some("1"));
        let page1 = catalog_response(
            r#"{"totalNum": 2, "beginIndex": 1, "peerDcSupported": true, "applications": [{"appId": "b", "eTag": "1"}]}"#,
        );
        let actions = p.on_data(&page1);
        assert!(matches!(
            &actions[..],
            [BootstrapAction::CatalogLoaded { first_page: false, catalog }]
                if catalog.len() == 2 && catalog.call_id == Some(CallId::new("c1"))
        ));
        assert!(p.load_more().is_empty());
    }

    #[test]
    fn undecodable_catalog_is_dropped_silently() {
        let t0 = Instant::now();
        let mut p = open(t0);
        p.request_catalog();
        assert!(p.on_data(&catalog_response("not json")).is_empty());
        assert_eq!(p.pending_requests(), 0);
    }

    #[test]
    fn heartbeat_runs_while_open_and_connected() {
        let t0 = Instant::now();
        let mut p = open(t0);
        assert!(p.is_heartbeat_running());
        assert!(p.tick(t0 + Duration::from_millis(299)).is_empty());
        assert_eq!(
            p.tick(t0 + Duration::from_millis(300)),
            vec![BootstrapAction::CallStateRefresh {
                call_id: "c1".into()
            }]
        );
        p.on_call_state(CallState::Disconnected, t0 + Duration::from_millis(400));
        assert!(p.tick(t0 + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn heartbeat_stops_on_close() {
        let t0 = Instant::now();
        let mut p = open(t0);
        p.on_channel_state(ChannelState::Closed, t0);
        assert!(!p.is_heartbeat_running());
        assert!(p.tick(t0 + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn nothing_sent_before_channel_opens() {
        let call = CallInfo::new("c1", 0, MediaType::Audio, CallState::Ringing);
        let mut p = BootstrapChannelProtocol::new(&call, &CoreConfig::default());
        assert!(p.request_catalog().is_empty());
        p.on_channel_created(ChannelHandle(1));
        let actions = p.on_channel_state(ChannelState::Open, Instant::now());
        assert_eq!(sent(&actions).len(), 1);
    }

    #[test]
    fn teardown_discards_queue_and_silences_callbacks() {
        let t0 = Instant::now();
        let mut p = open(t0);
        for app in ["a", "b", "c", "d", "e"] {
            p.request_binary(app, None);
        }
        assert_eq!(p.clear(), 5);
        assert!(p.on_data(&binary_response("e", b"zip")).is_empty());
        assert!(p.on_send_result(BUSY, t0).is_empty());
        assert!(p.tick(t0 + Duration::from_secs(1)).is_empty());
    }
}
