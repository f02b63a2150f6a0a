use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use teleconsult_rtc::types::{MediaConstraints, PeerConfiguration};

use crate::record::CandidateDirection;

/// Deadline applied to unary requests against a remote store
pub const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_secs(10);

/// Environment variable overriding the native store server address
pub const STORE_ADDR_ENV: &str = "TELECONSULT_STORE_ADDR";
/// Environment variable overriding the web store server address
pub const STORE_WEB_ADDR_ENV: &str = "TELECONSULT_STORE_WEB_ADDR";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Settings shared by every call of a [`CallManager`](crate::CallManager).
///
/// Every field has a default, so partial JSON documents are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Peer connection settings, STUN servers included
    pub peer: PeerConfiguration,
    /// Local media requested for every call
    pub media: MediaConstraints,
    pub calls_collection: String,
    /// Sub-collection for caller-to-callee candidates
    pub caller_candidates: String,
    /// Sub-collection for callee-to-caller candidates
    pub callee_candidates: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            peer: PeerConfiguration::default(),
            media: MediaConstraints::default(),
            calls_collection: "calls".to_string(),
            caller_candidates: "callerCandidates".to_string(),
            callee_candidates: "calleeCandidates".to_string(),
        }
    }
}

impl CallConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Sub-collection name for candidates travelling in `direction`
    pub fn candidates_collection(&self, direction: CandidateDirection) -> &str {
        match direction {
            CandidateDirection::CallerToCallee => &self.caller_candidates,
            CandidateDirection::CalleeToCaller => &self.callee_candidates,
        }
    }
}
