//! Call identity and state as delivered by the telephony collaborator. Referenced, never mutated, by the core.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque call identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        CallId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        CallId(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Ringing,
    Active,
    Holding,
    Disconnected,
}

/// Phase of a live call, as seen by mini app phase requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPhase {
    PreCall,
    InCall,
}

impl CallState {
    /// Ringing maps to pre-call, active/holding to in-call; a disconnected call has no phase.
    pub fn phase(self) -> Option<CallPhase> {
        match self {
            CallState::Ringing => Some(CallPhase::PreCall),
            CallState::Active | CallState::Holding => Some(CallPhase::InCall),
            CallState::Disconnected => None,
        }
    }
}

/// Snapshot of a call leg: id, SIM slot, media type, lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInfo {
    pub id: CallId,
    pub slot: u32,
    pub media: MediaType,
    pub state: CallState,
}

impl CallInfo {
    pub fn new(id: impl Into<String>, slot: u32, media: MediaType, state: CallState) -> Self {
        Self {
            id: CallId::new(id),
            slot,
            media,
            state,
        }
    }
}
