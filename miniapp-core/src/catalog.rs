//! Mini app catalog: descriptors, status state machine, paged JSON catalog.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::call::{CallId, CallPhase, CallState, MediaType};

/// Media an app needs from the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SceneRequirement {
    Audio,
    Video,
    #[default]
    Any,
}

impl SceneRequirement {
    pub fn matches(self, media: MediaType) -> bool {
        match self {
            SceneRequirement::Any => true,
            SceneRequirement::Audio => media == MediaType::Audio,
            SceneRequirement::Video => media == MediaType::Video,
        }
    }
}

/// Call phase an app may run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseRequirement {
    PreCall,
    InCall,
    #[default]
    Both,
}

impl PhaseRequirement {
    pub fn matches(self, state: CallState) -> bool {
        match (self, state.phase()) {
            (_, None) => false,
            (PhaseRequirement::Both, Some(_)) => true,
            (PhaseRequirement::PreCall, Some(phase)) => phase == CallPhase::PreCall,
            (PhaseRequirement::InCall, Some(phase)) => phase == CallPhase::InCall,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MiniAppStatus {
    #[default]
    Uninstalled,
    Downloading,
    Installed,
    Starting,
    Started,
    Stopped,
}

impl MiniAppStatus {
    /// Allowed edges. `Stopped` is reachable from anywhere; nothing reaches `Started` except
    /// through `Starting`, and `Starting` needs an installed binary.
    pub fn can_transition_to(self, next: MiniAppStatus) -> bool {
        use MiniAppStatus::*;
        matches!(
            (self, next),
            (_, Stopped)
                | (Uninstalled, Downloading)
                | (Uninstalled, Installed)
                | (Downloading, Installed)
                | (Installed, Downloading)
                | (Installed, Starting)
                | (Starting, Started)
                | (Stopped, Downloading)
                | (Stopped, Installed)
                | (Stopped, Starting)
        )
    }
}

/// One catalog entry. Also the `appInfo` a peer announces in a start request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiniAppDescriptor {
    pub app_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "eTag")]
    pub etag: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub scene: SceneRequirement,
    #[serde(default)]
    pub phase: PhaseRequirement,
    #[serde(default, rename = "worksWithoutPeerDc")]
    pub works_without_peer_dc: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub auto_load: bool,
    #[serde(default, rename = "shouldCreateControlADC")]
    pub should_create_control_adc: bool,
    #[serde(default)]
    pub auto_request_remote: bool,
    /// Hex SHA-256 of the archive, when the catalog advertises one.
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(skip)]
    pub install_path: Option<PathBuf>,
    #[serde(skip)]
    pub status: MiniAppStatus,
}

impl MiniAppDescriptor {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            name: String::new(),
            etag: None,
            version: None,
            scene: SceneRequirement::Any,
            phase: PhaseRequirement::Both,
            works_without_peer_dc: false,
            priority: 0,
            auto_load: false,
            should_create_control_adc: false,
            auto_request_remote: false,
            sha256: None,
            install_path: None,
            status: MiniAppStatus::Uninstalled,
        }
    }

    /// Tag the binary is keyed by: the etag, else the version.
    pub fn version_tag(&self) -> Option<&str> {
        self.etag
            .as_deref()
            .or(self.version.as_deref())
            .filter(|v| !v.is_empty())
    }

    /// Move to `next` if the edge is allowed. Returns false (and logs) otherwise.
    pub fn transition(&mut self, next: MiniAppStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(next) {
            warn!(app_id = %self.app_id, from = ?self.status, to = ?next, "refusing status transition");
            return false;
        }
        self.status = next;
        true
    }
}

/// Paged catalog, merged page by page for one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiniAppCatalog {
    #[serde(default)]
    pub total_num: usize,
    #[serde(default)]
    pub begin_index: usize,
    #[serde(default, rename = "applications")]
    pub apps: Vec<MiniAppDescriptor>,
    #[serde(default, rename = "peerDcSupported")]
    pub peer_dc_supported: bool,
    #[serde(skip)]
    pub call_id: Option<CallId>,
}

impl MiniAppCatalog {
    /// Parse one page and tag it with the call it was fetched on. Entries without an app id are dropped.
    pub fn parse(bytes: &[u8], call_id: &CallId) -> Result<Self, CatalogError> {
        let mut page: MiniAppCatalog = serde_json::from_slice(bytes)?;
        let before = page.apps.len();
        page.apps.retain(|a| !a.app_id.is_empty());
        if page.apps.len() != before {
            warn!(%call_id, dropped = before - page.apps.len(), "catalog entries without app id");
        }
        page.call_id = Some(call_id.clone());
        Ok(page)
    }

    /// Fold a later page in. Entries already present are replaced in place.
    pub fn merge(&mut self, page: MiniAppCatalog) {
        self.total_num = page.total_num;
        self.peer_dc_supported = page.peer_dc_supported;
        for app in page.apps {
            match self.apps.iter_mut().find(|a| a.app_id == app.app_id) {
                Some(existing) => *existing = app,
                None => self.apps.push(app),
            }
        }
    }

    pub fn get(&self, app_id: &str) -> Option<&MiniAppDescriptor> {
        self.apps.iter().find(|a| a.app_id == app_id)
    }

    /// More pages remain on the server.
    pub fn has_more(&self) -> bool {
        self.apps.len() < self.total_num
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog json: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE0: &str = r#"{
        "totalNum": 3,
        "beginIndex": 0,
        "peerDcSupported": true,
        "applications": [
            {"appId": "weather", "eTag": "w1", "phase": "pre-call", "autoLoad": true},
            {"appId": "game", "eTag": "g1", "scene": "video", "priority": 5}
        ]
    }"#;

    #[test]
    fn parse_page_with_defaults() {
        let c = MiniAppCatalog::parse(PAGE0.as_bytes(), &"c1".into()).unwrap();
        assert_eq!(c.len(), 2);
        assert!(c.peer_dc_supported);
        assert!(c.has_more());
        let w = c.get("weather").unwrap();
        assert_eq!(w.phase, PhaseRequirement::PreCall);
        assert_eq!(w.scene, SceneRequirement::Any);
        assert!(w.auto_load);
        assert_eq!(w.status, MiniAppStatus::Uninstalled);
        assert_eq!(c.get("game").unwrap().scene, SceneRequirement::Video);
    }

    #[test]
    fn merge_appends_and_replaces() {
        let mut c = MiniAppCatalog::parse(PAGE0.as_bytes(), &"c1".into()).unwrap();
        let page1 = MiniAppCatalog::parse(
            br#"{"totalNum": 3, "beginIndex": 2, "applications": [
                {"appId": "notes", "eTag": "n1"},
                {"appId": "game", "eTag": "g2"}
            ]}"#,
            &"c1".into(),
        )
        .unwrap();
        c.merge(page1);
        assert_eq!(c.len(), 3);
        assert!(!c.has_more());
        assert_eq!(c.get("game").unwrap().etag.as_deref(), Some("g2"));
    }

    #[test]
    fn malformed_catalog_is_an_error() {
        assert!(MiniAppCatalog::parse(b"not json", &"c1".into()).is_err());
    }

    #[test]
    fn entries_without_id_dropped() {
        let c = MiniAppCatalog::parse(br#"{"applications": [{"appId": ""}]}"#, &"c1".into())
            .unwrap();
        assert!(c.is_empty());
    }

    #[test]
    fn no_skipping_to_started() {
        let mut d = MiniAppDescriptor::new("a");
        assert!(!d.transition(MiniAppStatus::Started));
        assert!(!d.transition(MiniAppStatus::Starting));
        assert!(d.transition(MiniAppStatus::Downloading));
        assert!(!d.transition(MiniAppStatus::Started));
        assert!(d.transition(MiniAppStatus::Installed));
        assert!(d.transition(MiniAppStatus::Starting));
        assert!(d.transition(MiniAppStatus::Started));
        assert!(d.transition(MiniAppStatus::Stopped));
    }

    #[test]
    fn predicates() {
        assert!(SceneRequirement::Video.matches(MediaType::Video));
        assert!(!SceneRequirement::Video.matches(MediaType::Audio));
        assert!(PhaseRequirement::PreCall.matches(CallState::Ringing));
        assert!(!PhaseRequirement::PreCall.matches(CallState::Active));
        assert!(PhaseRequirement::InCall.matches(CallState::Holding));
        assert!(!PhaseRequirement::Both.matches(CallState::Disconnected));
    }

    #[test]
    fn version_tag_prefers_etag() {
        let mut d = MiniAppDescriptor::new("a");
        assert_eq!(d.version_tag(), None);
        d.version = Some("1.2".into());
        assert_eq!(d.version_tag(), Some("1.2"));
        d.etag = Some("e9".into());
        assert_eq!(d.version_tag(), Some("e9"));
    }
}
