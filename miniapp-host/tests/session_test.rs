//! End-to-end session tests against a recording fake channel provider.

use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use miniapp_core::http::{HttpRequest, HttpResponse};
use miniapp_core::integrity;
use miniapp_core::lifecycle::{LaunchFailure, StartError, StartOutcome, StartType};
use miniapp_core::own_channel::OwnEnvelope;
use miniapp_core::{
    CallId, CallInfo, CallState, ChannelEvent, ChannelHandle, ChannelState, CoreConfig,
    MediaType, MiniAppDescriptor, MiniAppStatus, NegotiationMessage, StartOption,
};
use miniapp_host::{
    AppLauncher, ChannelProvider, ConfirmationPrompt, HostConfig,
    ProviderError, ProviderEvent, SessionContext, SessionError, SessionEvent,
};
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;

const BOOTSTRAP: ChannelHandle = ChannelHandle(1);

#[derive(Debug, Clone, PartialEq)]
enum ProviderCall {
    OpenBootstrap { call_id: CallId, slot: u32 },
    Create { call_id: CallId, labels: Vec<String> },
    Send { handle: ChannelHandle, bytes: Vec<u8> },
}

struct FakeProvider {
    calls: mpsc::UnboundedSender<ProviderCall>,
}

impl ChannelProvider for FakeProvider {
    fn open_bootstrap(&self, call_id: &CallId, slot: u32) -> Result<(), ProviderError> {
        let _ = self.calls.send(ProviderCall::OpenBootstrap {
            call_id: call_id.clone(),
            slot,
        });
        Ok(())
    }

    fn create_channels(
        &self,
        call_id: &CallId,
        _slot: u32,
        labels: &[String],
        _description_xml: &str,
    ) -> Result<(), ProviderError> {
        let _ = self.calls.send(ProviderCall::Create {
            call_id: call_id.clone(),
            labels: labels.to_vec(),
        });
        Ok(())
    }

    fn send(&self, handle: ChannelHandle, bytes: &[u8]) -> Result<(), ProviderError> {
        let _ = self.calls.send(ProviderCall::Send {
            handle,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn buffered_amount(&self, _handle: ChannelHandle) -> Result<u64, ProviderError> {
        Ok(0)
    }
}

#[derive(Default)]
struct FakeLauncher {
    launched: Mutex<Vec<(String, Option<PathBuf>, usize)>>,
    stopped: Mutex<Vec<String>>,
}

impl AppLauncher for FakeLauncher {
    fn launch(
        &self,
        _call_id: &CallId,
        app: &MiniAppDescriptor,
        _start_type: StartType,
        slot: usize,
    ) -> Result<(), LaunchFailure> {
        self.launched
            .lock()
            .unwrap()
            .push((app.app_id.clone(), app.install_path.clone(), slot));
        Ok(())
    }

    fn bring_to_front(&self, _call_id: &CallId, _app_id: &str) {}

    fn stop(&self, _call_id: &CallId, app_id: &str) {
        self.stopped.lock().unwrap().push(app_id.to_string());
    }

    fn suspend_background(&self, _call_id: &CallId) {}
}

struct FixedPrompt(bool);

impl ConfirmationPrompt for FixedPrompt {
    fn confirm(&self, _call_id: &CallId, _app: &MiniAppDescriptor, reply: oneshot::Sender<bool>) {
        let _ = reply.send(self.0);
    }
}

struct Harness {
    session: Arc<SessionContext>,
    provider: mpsc::UnboundedReceiver<ProviderCall>,
    events: broadcast::Receiver<SessionEvent>,
    launcher: Arc<FakeLauncher>,
    call_id: CallId,
    dir: TempDir,
}

impl Harness {
    async fn new(accept_passive: bool) -> Self {
        miniapp_host::logging::init();
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig {
            core: CoreConfig {
                creation_poll_interval_ms: 10,
                ..CoreConfig::default()
            },
            app_root: dir.path().to_path_buf(),
            worker_tick_ms: 5,
        };
        let (tx, provider) = mpsc::unbounded_channel();
        let launcher = Arc::new(FakeLauncher::default());
        let session = Arc::new(SessionContext::new(
            config,
            Arc::new(FakeProvider { calls: tx }),
            launcher.clone(),
            Arc::new(FixedPrompt(accept_passive)),
        ));
        let events = session.subscribe();
        Self {
            session,
            provider,
            events,
            launcher,
            call_id: CallId::new("c1"),
            dir,
        }
    }

    /// Bind the provider, add an active call and open its bootstrap channel. Returns the
    /// catalog request the worker sent.
    async fn open_call(&mut self) -> HttpRequest {
        self.session.provider_event(ProviderEvent::Connected);
        self.session
            .call_added(CallInfo::new("c1", 0, MediaType::Audio, CallState::Active))
            .await
            .unwrap();
        assert_eq!(
            self.next_call().await,
            ProviderCall::OpenBootstrap {
                call_id: self.call_id.clone(),
                slot: 0
            }
        );
        self.session.provider_event(ProviderEvent::BootstrapCreated {
            call_id: self.call_id.clone(),
            handle: BOOTSTRAP,
        });
        self.session.provider_event(ProviderEvent::StateChanged {
            handle: BOOTSTRAP,
            state: ChannelState::Open,
        });
        self.next_request().await
    }

    async fn load_catalog(&mut self, json: &str) -> Vec<MiniAppDescriptor> {
        let request = self.open_call().await;
        assert_eq!(request.path().split('?').next(), Some("/applicationlist"));
        self.reply(HttpResponse::new(200).with_body(json.as_bytes().to_vec()));
        match self
            .wait_event(|e| matches!(e, SessionEvent::CatalogUpdated { .. }))
            .await
        {
            SessionEvent::CatalogUpdated { apps, .. } => apps,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn reply(&self, response: HttpResponse) {
        self.session.provider_event(ProviderEvent::Data {
            handle: BOOTSTRAP,
            bytes: response.to_bytes(),
        });
    }

    async fn next_call(&mut self) -> ProviderCall {
        timeout(Duration::from_secs(5), self.provider.recv())
            .await
            .expect("provider call")
            .expect("provider channel open")
    }

    /// Next bootstrap request, skipping unrelated provider calls.
    async fn next_request(&mut self) -> HttpRequest {
        loop {
            if let ProviderCall::Send { handle, bytes } = self.next_call().await {
                if handle == BOOTSTRAP {
                    return HttpRequest::decode(&bytes).unwrap();
                }
            }
        }
    }

    async fn next_send_on(&mut self, target: ChannelHandle) -> Vec<u8> {
        loop {
            if let ProviderCall::Send { handle, bytes } = self.next_call().await {
                if handle == target {
                    return bytes;
                }
            }
        }
    }

    async fn next_create(&mut self) -> Vec<String> {
        loop {
            if let ProviderCall::Create { labels, .. } = self.next_call().await {
                return labels;
            }
        }
    }

    async fn wait_event(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        loop {
            match timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("session event")
            {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    }

    fn drain_provider(&mut self) -> Vec<ProviderCall> {
        let mut out = Vec::new();
        while let Ok(call) = self.provider.try_recv() {
            out.push(call);
        }
        out
    }
}

fn zip_with(files: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut w = zip::ZipWriter::new(&mut buf);
        for (name, body) in files {
            w.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            w.write_all(body.as_bytes()).unwrap();
        }
        w.finish().unwrap();
    }
    buf.into_inner()
}

fn binary_response(etag: &str, archive: Vec<u8>) -> HttpResponse {
    HttpResponse::new(200)
        .with_header("ETag", &format!("\"{etag}\""))
        .with_body(archive)
}

#[tokio::test]
async fn start_downloads_installs_and_launches() {
    let mut h = Harness::new(false).await;
    let archive = zip_with(&[("index.html", "<h1>weather</h1>")]);
    let digest = hex::encode(integrity::hash_archive(&archive));
    let apps = h
        .load_catalog(&format!(
            r#"{{"totalNum": 1, "peerDcSupported": true, "applications": [
                {{"appId": "weather", "eTag": "w1", "sha256": "{digest}"}}
            ]}}"#
        ))
        .await;
    assert_eq!(apps.len(), 1);

    let session = h.session.clone();
    let call_id = h.call_id.clone();
    let start = tokio::spawn(async move {
        session
            .start_mini_app(&call_id, "weather", StartType::User)
            .await
    });

    let request = h.next_request().await;
    assert_eq!(request.query("appid"), Some("weather"));
    h.reply(binary_response("w1", archive));

    assert_eq!(start.await.unwrap(), Ok(StartOutcome::Started));
    let installed = h.dir.path().join("weather").join("w1");
    assert_eq!(
        std::fs::read_to_string(installed.join("index.html")).unwrap(),
        "<h1>weather</h1>"
    );
    assert_eq!(
        h.launcher.launched.lock().unwrap().clone(),
        vec![("weather".to_string(), Some(installed), 0)]
    );
    assert_eq!(
        h.session
            .query_mini_app_status(&h.call_id, "weather")
            .await
            .unwrap(),
        MiniAppStatus::Started
    );

    // A second start only brings it to front.
    assert_eq!(
        h.session
            .start_mini_app(&h.call_id, "weather", StartType::User)
            .await,
        Ok(StartOutcome::BroughtToFront)
    );
    h.session.shutdown().await;
}

#[tokio::test]
async fn status_events_follow_install_order() {
    let mut h = Harness::new(false).await;
    h.load_catalog(
        r#"{"peerDcSupported": true, "applications": [{"appId": "notes", "eTag": "n1"}]}"#,
    )
    .await;
    let session = h.session.clone();
    let call_id = h.call_id.clone();
    let start =
        tokio::spawn(async move { session.start_mini_app(&call_id, "notes", StartType::User).await });
    h.next_request().await;
    h.reply(binary_response("n1", zip_with(&[("index.html", "n")])));
    assert_eq!(start.await.unwrap(), Ok(StartOutcome::Started));

    let mut seen = Vec::new();
    while let Ok(event) = h.events.try_recv() {
        if let SessionEvent::StatusChanged { app_id, status, .. } = event {
            assert_eq!(app_id, "notes");
            seen.push(status);
        }
    }
    assert_eq!(
        seen,
        vec![
            MiniAppStatus::Downloading,
            MiniAppStatus::Installed,
            MiniAppStatus::Starting,
            MiniAppStatus::Started
        ]
    );
    h.session.shutdown().await;
}

#[tokio::test]
async fn bad_digest_fails_install() {
    let mut h = Harness::new(false).await;
    h.load_catalog(&format!(
        r#"{{"peerDcSupported": true, "applications": [
            {{"appId": "notes", "eTag": "n1", "sha256": "{}"}}
        ]}}"#,
        "0".repeat(64)
    ))
    .await;
    let session = h.session.clone();
    let call_id = h.call_id.clone();
    let start =
        tokio::spawn(async move { session.start_mini_app(&call_id, "notes", StartType::User).await });
    h.next_request().await;
    h.reply(binary_response("n1", zip_with(&[("index.html", "n")])));
    assert!(matches!(
        start.await.unwrap(),
        Err(SessionError::Start(StartError::InstallFailed(_)))
    ));
    assert!(h.launcher.launched.lock().unwrap().is_empty());
    h.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn call_removal_discards_queued_requests() {
    let mut h = Harness::new(false).await;
    let ids = ["a1", "a2", "a3", "a4", "a5"];
    let apps: Vec<String> = ids
        .iter()
        .map(|id| format!(r#"{{"appId": "{id}", "eTag": "1"}}"#))
        .collect();
    h.load_catalog(&format!(
        r#"{{"peerDcSupported": true, "applications": [{}]}}"#,
        apps.join(",")
    ))
    .await;

    let mut starts = Vec::new();
    for id in ids {
        let session = h.session.clone();
        let call_id = h.call_id.clone();
        starts.push(tokio::spawn(async move {
            session.start_mini_app(&call_id, id, StartType::User).await
        }));
    }
    for id in ids {
        while h.session.query_mini_app_status(&h.call_id, id).await
            != Ok(MiniAppStatus::Downloading)
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    // Only the head request is on the wire.
    assert_eq!(h.next_request().await.query("appid"), Some("a1"));

    h.session.call_removed(&h.call_id).await.unwrap();
    for start in starts {
        assert_eq!(
            start.await.unwrap(),
            Err(SessionError::Start(StartError::CallEnded))
        );
    }

    while h.events.try_recv().is_ok() {}
    h.drain_provider();
    h.reply(binary_response("1", zip_with(&[("index.html", "x")])));
    h.session.provider_event(ProviderEvent::SendResult {
        handle: BOOTSTRAP,
        code: 0,
    });
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(matches!(
        h.events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert!(h.drain_provider().is_empty());
    assert!(h.launcher.launched.lock().unwrap().is_empty());
    assert_eq!(
        h.session.query_mini_app_status(&h.call_id, "a1").await,
        Err(SessionError::UnknownCall(h.call_id.clone()))
    );
    h.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn peer_requests_ignored_after_three_rejections() {
    let mut h = Harness::new(false).await;
    h.load_catalog(r#"{"peerDcSupported": true, "applications": []}"#)
        .await;
    let control = ChannelHandle(7);
    h.session.provider_event(ProviderEvent::ChannelCreated {
        call_id: h.call_id.clone(),
        label: "remote_chess_sys_control".into(),
        handle: control,
    });
    h.session.provider_event(ProviderEvent::StateChanged {
        handle: control,
        state: ChannelState::Open,
    });

    let mut info = MiniAppDescriptor::new("chess");
    info.etag = Some("c1".into());
    let request = NegotiationMessage::RequestStartApp { app_info: info }
        .encode()
        .unwrap();

    for _ in 0..3 {
        h.session.provider_event(ProviderEvent::Data {
            handle: control,
            bytes: request.clone(),
        });
        let reply = h.next_send_on(control).await;
        assert_eq!(
            NegotiationMessage::decode(&reply).unwrap(),
            NegotiationMessage::ResponseStartApp {
                option: StartOption::Reject
            }
        );
    }

    while h.events.try_recv().is_ok() {}
    h.session.provider_event(ProviderEvent::Data {
        handle: control,
        bytes: request,
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!h
        .drain_provider()
        .iter()
        .any(|c| matches!(c, ProviderCall::Send { handle, .. } if *handle == control)));
    loop {
        match h.events.try_recv() {
            Ok(SessionEvent::PassiveStartRequested { .. }) => panic!("prompted a fourth time"),
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    h.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn own_channel_tunnels_by_model() {
    let mut h = Harness::new(false).await;
    h.open_call().await;
    assert_eq!(h.next_create().await, vec![format!(
        "local_{}_sys_own",
        miniapp_host::OWN_CHANNEL_APP_ID
    )]);
    let own = ChannelHandle(3);
    h.session.provider_event(ProviderEvent::CreateResult {
        call_id: h.call_id.clone(),
        ok: true,
    });
    h.session.provider_event(ProviderEvent::ChannelCreated {
        call_id: h.call_id.clone(),
        label: "local_sdk_sys_own".into(),
        handle: own,
    });
    h.session.provider_event(ProviderEvent::StateChanged {
        handle: own,
        state: ChannelState::Open,
    });

    let mut frames = h
        .session
        .register_own_listener(&h.call_id, "beauty")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.session
        .send_own(&h.call_id, "beauty", b"hello".to_vec())
        .await
        .unwrap();
    let sent: OwnEnvelope = serde_json::from_slice(&h.next_send_on(own).await).unwrap();
    assert_eq!(sent.model, "beauty");
    assert_eq!(sent.data().unwrap(), b"hello");

    h.session.provider_event(ProviderEvent::Data {
        handle: own,
        bytes: serde_json::to_vec(&OwnEnvelope::new("beauty", b"frame")).unwrap(),
    });
    let frame = timeout(Duration::from_secs(5), frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame, b"frame");
    h.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn app_channel_listener_gets_buffered_channels() {
    let mut h = Harness::new(false).await;
    assert_eq!(
        h.session
            .create_application_channels(
                0,
                &h.call_id,
                vec!["local_weather_game_chat".into()],
                String::new()
            )
            .await,
        Ok(miniapp_core::CreateOutcome::RejectedNotConnected)
    );

    h.open_call().await;
    assert_eq!(
        h.session
            .create_application_channels(
                0,
                &h.call_id,
                vec!["local_weather_game_chat".into()],
                String::new()
            )
            .await,
        Ok(miniapp_core::CreateOutcome::Accepted)
    );
    loop {
        let labels = h.next_create().await;
        if labels == vec!["local_weather_game_chat".to_string()] {
            break;
        }
        // The own channel request may go first; acknowledge it so the gate reopens.
        h.session.provider_event(ProviderEvent::CreateResult {
            call_id: h.call_id.clone(),
            ok: true,
        });
    }
    let chat = ChannelHandle(11);
    h.session.provider_event(ProviderEvent::ChannelCreated {
        call_id: h.call_id.clone(),
        label: "local_weather_game_chat".into(),
        handle: chat,
    });
    h.session.provider_event(ProviderEvent::StateChanged {
        handle: chat,
        state: ChannelState::Open,
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut rx = h
        .session
        .register_app_channel_listener(&h.call_id, "weather")
        .unwrap();
    match timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
        Some(ChannelEvent::Created(ch)) => {
            assert_eq!(ch.handle, chat);
            assert_eq!(ch.label.to_string(), "local_weather_game_chat");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap(),
        Some(ChannelEvent::StateChanged {
            state: ChannelState::Open,
            ..
        })
    ));

    // The app's own traffic reaches its listener, not the call worker.
    h.session.provider_event(ProviderEvent::Data {
        handle: chat,
        bytes: b"move e4".to_vec(),
    });
    assert_eq!(
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap(),
        Some(ChannelEvent::Data {
            call_id: h.call_id.clone(),
            handle: chat,
            bytes: b"move e4".to_vec(),
        })
    );

    assert_eq!(
        h.session
            .unregister_app_channel_listener(&h.call_id, "weather")
            .await,
        Ok(true)
    );
    assert_eq!(
        h.session
            .unregister_app_channel_listener(&h.call_id, "weather")
            .await,
        Ok(false)
    );
    h.session.shutdown().await;
}
