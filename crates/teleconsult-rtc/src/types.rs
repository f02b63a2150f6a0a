use serde::{Deserialize, Serialize};

/// ICECandidate is the serializable form of a discovered network path
///
/// Field names follow the browser `RTCIceCandidateInit` dictionary, so records
/// written by web clients deserialize unchanged.
#[derive(Default, Debug, Clone, Serialize, Deserialize, Hash, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ICECandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    pub username_fragment: Option<String>,
}

/// A single STUN or TURN server used to gather candidates.
#[derive(Default, Debug, Clone, Serialize, Deserialize, Hash, PartialEq, Eq)]
#[serde(default)]
pub struct ICEServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Which candidates may be used for connectivity checks.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize, Hash)]
pub enum ICETransportPolicy {
    #[default]
    #[serde(rename = "all")]
    All,
    /// Only relay (TURN) candidates. Hides both endpoints' addresses from each other.
    #[serde(rename = "relay")]
    Relay,
}

/// Media bundling policy used while gathering candidates.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize, Hash)]
pub enum BundlePolicy {
    #[default]
    #[serde(rename = "balanced")]
    Balanced,
    #[serde(rename = "max-compat")]
    MaxCompat,
    #[serde(rename = "max-bundle")]
    MaxBundle,
}

/// Configuration of one peer connection.
///
/// A call opens exactly one connection per side, so the configuration is
/// cloned into every [`CallPeer`](crate::CallPeer) rather than shared.
#[derive(Debug, Clone, Serialize, Deserialize, Hash, PartialEq, Eq)]
#[serde(default)]
pub struct PeerConfiguration {
    /// STUN and TURN servers available to ICE.
    pub ice_servers: Vec<ICEServer>,
    pub ice_transport_policy: ICETransportPolicy,
    pub bundle_policy: BundlePolicy,
    /// Size of the prefetched ICE pool.
    pub ice_candidate_pool_size: u8,
}

impl Default for PeerConfiguration {
    fn default() -> Self {
        Self {
            ice_servers: vec![ICEServer {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
                ..Default::default()
            }],
            ice_transport_policy: ICETransportPolicy::default(),
            bundle_policy: BundlePolicy::default(),
            ice_candidate_pool_size: 0,
        }
    }
}

/// SDPType describes the type of a SessionDescription.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize, Hash)]
pub enum SDPType {
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "pranswer")]
    Pranswer,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "rollback")]
    Rollback,
}

/// An offer or answer: a type tag plus the opaque SDP payload.
#[derive(Debug, Clone, Serialize, Deserialize, Hash, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SDPType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SDPType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SDPType::Answer, sdp: sdp.into() }
    }
}

/// PeerConnectionState indicates the state of the underlying connection.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    #[default]
    New,
    /// ICE connectivity checks are running.
    Checking,
    Connected,
    /// Connectivity was lost. May recover without renegotiation.
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PeerConnectionState::New => "new",
            PeerConnectionState::Checking => "checking",
            PeerConnectionState::Connected => "connected",
            PeerConnectionState::Disconnected => "disconnected",
            PeerConnectionState::Failed => "failed",
            PeerConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Mirrors `MediaStreamTrack.readyState`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackReadyState {
    Live,
    Ended,
}

/// Which local devices to request for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self { audio: true, video: true }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self { audio: true, video: false }
    }

    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }
}

/// Snapshot of a local track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: String,
    pub kind: TrackKind,
    pub ready_state: TrackReadyState,
}

/// A track announced by the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Local view of one side of a call: its media and its transport state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallParticipant {
    pub local_tracks: Vec<TrackInfo>,
    pub remote_tracks: Vec<RemoteTrack>,
    pub connection_state: PeerConnectionState,
}
