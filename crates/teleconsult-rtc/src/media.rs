//! Local media tracks

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::types::{TrackInfo, TrackKind, TrackReadyState};

/// Where a local track's media comes from
#[derive(Clone)]
pub enum TrackSource {
    /// No media payload, used by the loopback runtime
    Synthetic,
    /// webrtc-rs sample track, fed by the application
    #[cfg(not(target_arch = "wasm32"))]
    Sample(Arc<webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample>),
}

impl std::fmt::Debug for TrackSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackSource::Synthetic => f.write_str("Synthetic"),
            #[cfg(not(target_arch = "wasm32"))]
            TrackSource::Sample(_) => f.write_str("Sample"),
        }
    }
}

/// A local camera or microphone track.
///
/// Clones share the same ready state, so stopping any clone stops them all.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    live: Arc<AtomicBool>,
    source: TrackSource,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, source: TrackSource) -> Self {
        Self {
            id: id.into(),
            kind,
            live: Arc::new(AtomicBool::new(true)),
            source,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> &TrackSource {
        &self.source
    }

    pub fn ready_state(&self) -> TrackReadyState {
        if self.live.load(Ordering::Acquire) {
            TrackReadyState::Live
        } else {
            TrackReadyState::Ended
        }
    }

    /// Stop the track. Idempotent.
    pub fn stop(&self) {
        self.live.store(false, Ordering::Release);
    }

    pub fn info(&self) -> TrackInfo {
        TrackInfo {
            id: self.id.clone(),
            kind: self.kind,
            ready_state: self.ready_state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopping_a_clone_ends_the_track() {
        let track = LocalTrack::new("mic", TrackKind::Audio, TrackSource::Synthetic);
        let clone = track.clone();
        assert_eq!(track.ready_state(), TrackReadyState::Live);
        clone.stop();
        clone.stop();
        assert_eq!(track.ready_state(), TrackReadyState::Ended);
        assert_eq!(track.info().ready_state, TrackReadyState::Ended);
    }
}
