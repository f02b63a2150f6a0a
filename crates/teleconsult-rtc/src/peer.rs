//! The peer connection wrapper

use std::{collections::HashSet, sync::Arc};

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::{
    types::{
        CallParticipant, ICECandidate, MediaConstraints, PeerConfiguration, PeerConnectionState,
        RemoteTrack, SDPType, SessionDescription,
    },
    ConnectionEvent, Error, LocalTrack, RtcConnection, RtcRuntime,
};

/// Offer/answer progress of a [`CallPeer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    /// Local offer created, waiting for the answer
    Offering,
    /// Remote offer applied, local answer not created yet
    HaveRemoteOffer,
    Stable,
    Closed,
}

/// Events surfaced by [`CallPeer::next_event`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    IceCandidate(ICECandidate),
    IceGatheringComplete,
    RemoteTrack(RemoteTrack),
    ConnectionStateChange(PeerConnectionState),
}

#[derive(Debug)]
struct PeerInner {
    negotiation: NegotiationState,
    local_tracks: Option<Vec<LocalTrack>>,
    remote_description: Option<SessionDescription>,
    applying_remote: bool,
    // remote candidates received before the remote description was set
    pending_candidates: Vec<ICECandidate>,
    seen_candidates: HashSet<ICECandidate>,
    applied_candidates: usize,
    remote_tracks: Vec<RemoteTrack>,
    connection_state: PeerConnectionState,
}

/// Builds a [`CallPeer`] from a runtime
#[derive(Debug, Clone, Default)]
pub struct PeerConnectionBuilder {
    config: PeerConfiguration,
}

impl PeerConnectionBuilder {
    /// Create new PeerConnectionBuilder (equivalent to PeerConnectionBuilder::default())
    pub fn new() -> Self {
        Self::default()
    }

    /// Specify internal WebRTC peer configuration settings
    pub fn set_config(mut self, set: PeerConfiguration) -> Self {
        self.config = set;
        self
    }

    /// Open the underlying connection
    pub async fn build<R: RtcRuntime>(&self, runtime: Arc<R>) -> Result<CallPeer<R>, Error> {
        let (events_tx, events_rx) = flume::unbounded();
        let connection = runtime.open_connection(&self.config, events_tx).await?;
        debug!("opened peer connection");
        Ok(CallPeer {
            runtime,
            connection,
            events_rx,
            inner: Mutex::new(PeerInner {
                negotiation: NegotiationState::Idle,
                local_tracks: None,
                remote_description: None,
                applying_remote: false,
                pending_candidates: vec![],
                seen_candidates: HashSet::new(),
                applied_candidates: 0,
                remote_tracks: vec![],
                connection_state: PeerConnectionState::New,
            }),
        })
    }
}

/// One side of a call: exactly one underlying connection plus its local media.
///
/// Remote candidates are deduplicated by content and queued until the remote
/// description is in place, so early or repeated deliveries are harmless.
pub struct CallPeer<R: RtcRuntime> {
    runtime: Arc<R>,
    connection: R::Connection,
    events_rx: flume::Receiver<ConnectionEvent>,
    inner: Mutex<PeerInner>,
}

impl<R: RtcRuntime> CallPeer<R> {
    /// Request local media and attach it to the connection.
    ///
    /// Calling again before [`close`](Self::close) returns the same tracks.
    pub async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<LocalTrack>, Error> {
        {
            let inner = self.inner.lock();
            if inner.negotiation == NegotiationState::Closed {
                return Err(Error::Closed);
            }
            if let Some(tracks) = &inner.local_tracks {
                return Ok(tracks.clone());
            }
        }
        let tracks = self
            .runtime
            .get_user_media(constraints)
            .await
            .map_err(|e| match e {
                Error::MediaAccess(reason) => Error::MediaAccess(reason),
                other => Error::MediaAccess(other.to_string()),
            })?;
        for track in &tracks {
            if let Err(e) = self.connection.add_track(track).await {
                tracks.iter().for_each(LocalTrack::stop);
                return Err(e);
            }
        }
        let mut inner = self.inner.lock();
        if inner.negotiation == NegotiationState::Closed {
            tracks.iter().for_each(LocalTrack::stop);
            return Err(Error::Closed);
        }
        debug!("acquired {} local track(s)", tracks.len());
        Ok(inner.local_tracks.get_or_insert(tracks).clone())
    }

    /// Create the local offer. Only valid on a fresh connection.
    pub async fn create_offer(&self) -> Result<SessionDescription, Error> {
        self.advance(NegotiationState::Idle, NegotiationState::Offering)?;
        match self.connection.create_offer().await {
            Ok(offer) => Ok(offer),
            Err(e) => {
                self.rewind(NegotiationState::Offering, NegotiationState::Idle);
                Err(e)
            }
        }
    }

    /// Create the local answer. Only valid after the remote offer was applied.
    pub async fn create_answer(&self) -> Result<SessionDescription, Error> {
        self.advance(NegotiationState::HaveRemoteOffer, NegotiationState::Stable)?;
        match self.connection.create_answer().await {
            Ok(answer) => Ok(answer),
            Err(e) => {
                self.rewind(NegotiationState::Stable, NegotiationState::HaveRemoteOffer);
                Err(e)
            }
        }
    }

    /// Apply the remote offer (callee) or answer (caller), then flush queued candidates.
    ///
    /// Re-applying the same description is a no-op. A different one is rejected.
    pub async fn apply_remote_description(&self, desc: SessionDescription) -> Result<(), Error> {
        {
            let mut inner = self.inner.lock();
            if let Some(applied) = &inner.remote_description {
                if applied == &desc {
                    return Ok(());
                }
                return Err(Error::InvalidState("a different remote description is already applied".to_string()));
            }
            if inner.applying_remote {
                return Err(Error::InvalidState("remote description is being applied".to_string()));
            }
            match (inner.negotiation, desc.sdp_type) {
                (NegotiationState::Closed, _) => return Err(Error::Closed),
                (NegotiationState::Idle, SDPType::Offer) => {}
                (NegotiationState::Offering, SDPType::Answer | SDPType::Pranswer) => {}
                (state, sdp_type) => {
                    return Err(Error::InvalidState(format!(
                        "cannot apply remote {sdp_type:?} while {state:?}"
                    )))
                }
            }
            inner.applying_remote = true;
        }
        if let Err(e) = self.connection.set_remote_description(desc.clone()).await {
            self.inner.lock().applying_remote = false;
            return Err(e);
        }
        let pending = {
            let mut inner = self.inner.lock();
            inner.applying_remote = false;
            if inner.negotiation == NegotiationState::Closed {
                return Err(Error::Closed);
            }
            inner.negotiation = match inner.negotiation {
                NegotiationState::Offering => NegotiationState::Stable,
                _ => NegotiationState::HaveRemoteOffer,
            };
            inner.remote_description = Some(desc);
            std::mem::take(&mut inner.pending_candidates)
        };
        if !pending.is_empty() {
            debug!("flushing {} queued remote candidate(s)", pending.len());
        }
        for candidate in pending {
            if let Err(e) = self.apply_candidate(candidate).await {
                warn!("skipping queued remote candidate ({e})");
            }
        }
        Ok(())
    }

    /// Add a remote candidate.
    ///
    /// Duplicates are ignored. Candidates that arrive before the remote
    /// description are queued and applied once it is set.
    pub async fn add_ice_candidate(&self, candidate: ICECandidate) -> Result<(), Error> {
        {
            let mut inner = self.inner.lock();
            if inner.negotiation == NegotiationState::Closed {
                trace!("ignoring remote candidate on closed connection");
                return Ok(());
            }
            if !inner.seen_candidates.insert(candidate.clone()) {
                trace!("ignoring duplicate remote candidate");
                return Ok(());
            }
            if inner.remote_description.is_none() {
                inner.pending_candidates.push(candidate);
                return Ok(());
            }
        }
        self.apply_candidate(candidate).await
    }

    async fn apply_candidate(&self, candidate: ICECandidate) -> Result<(), Error> {
        match self.connection.add_ice_candidate(candidate).await {
            Ok(()) => {
                self.inner.lock().applied_candidates += 1;
                Ok(())
            }
            Err(Error::IceCandidate(reason)) => Err(Error::IceCandidate(reason)),
            Err(e) => Err(Error::IceCandidate(e.to_string())),
        }
    }

    /// Wait for the next event from the underlying connection.
    ///
    /// Remote tracks and state changes are recorded before they are returned.
    /// A state change that does not change the state is swallowed.
    pub async fn next_event(&self) -> Option<PeerEvent> {
        loop {
            let event = self.events_rx.recv_async().await.ok()?;
            let mut inner = self.inner.lock();
            match event {
                ConnectionEvent::IceCandidate(Some(candidate)) => {
                    return Some(PeerEvent::IceCandidate(candidate))
                }
                ConnectionEvent::IceCandidate(None) => return Some(PeerEvent::IceGatheringComplete),
                ConnectionEvent::RemoteTrack(track) => {
                    if inner.remote_tracks.contains(&track) {
                        continue;
                    }
                    inner.remote_tracks.push(track.clone());
                    return Some(PeerEvent::RemoteTrack(track));
                }
                ConnectionEvent::StateChange(state) => {
                    if inner.connection_state == state {
                        continue;
                    }
                    inner.connection_state = state;
                    return Some(PeerEvent::ConnectionStateChange(state));
                }
            }
        }
    }

    /// Stop local media and close the connection. Idempotent.
    pub async fn close(&self) -> Result<(), Error> {
        {
            let mut inner = self.inner.lock();
            if inner.negotiation == NegotiationState::Closed {
                return Ok(());
            }
            inner.negotiation = NegotiationState::Closed;
            inner.connection_state = PeerConnectionState::Closed;
            inner.pending_candidates.clear();
            if let Some(tracks) = &inner.local_tracks {
                tracks.iter().for_each(LocalTrack::stop);
            }
        }
        debug!("closing peer connection");
        self.connection.close().await
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.inner.lock().negotiation
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.inner.lock().connection_state
    }

    pub fn is_closed(&self) -> bool {
        self.negotiation_state() == NegotiationState::Closed
    }

    pub fn local_tracks(&self) -> Vec<LocalTrack> {
        self.inner.lock().local_tracks.clone().unwrap_or_default()
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.inner.lock().remote_tracks.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.inner.lock().remote_description.clone()
    }

    /// Number of distinct remote candidates applied to the connection
    pub fn applied_candidates(&self) -> usize {
        self.inner.lock().applied_candidates
    }

    /// Number of remote candidates waiting for the remote description
    pub fn pending_candidates(&self) -> usize {
        self.inner.lock().pending_candidates.len()
    }

    pub fn participant(&self) -> CallParticipant {
        let inner = self.inner.lock();
        CallParticipant {
            local_tracks: inner
                .local_tracks
                .iter()
                .flatten()
                .map(LocalTrack::info)
                .collect(),
            remote_tracks: inner.remote_tracks.clone(),
            connection_state: inner.connection_state,
        }
    }

    fn advance(&self, from: NegotiationState, to: NegotiationState) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        match inner.negotiation {
            NegotiationState::Closed => Err(Error::Closed),
            state if state == from => {
                inner.negotiation = to;
                Ok(())
            }
            state => Err(Error::InvalidState(format!("expected {from:?}, connection is {state:?}"))),
        }
    }

    fn rewind(&self, from: NegotiationState, to: NegotiationState) {
        let mut inner = self.inner.lock();
        if inner.negotiation == from {
            inner.negotiation = to;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{platform::LoopbackRuntime, types::TrackReadyState};

    async fn offerer_and_answerer(
        runtime: &Arc<LoopbackRuntime>,
    ) -> Result<(CallPeer<LoopbackRuntime>, CallPeer<LoopbackRuntime>), Error> {
        let offerer = PeerConnectionBuilder::new().build(runtime.clone()).await?;
        let answerer = PeerConnectionBuilder::new().build(runtime.clone()).await?;
        Ok((offerer, answerer))
    }

    fn host_candidate(port: u16) -> ICECandidate {
        ICECandidate {
            candidate: format!("candidate:{port} 1 udp 2130706431 127.0.0.1 {port} typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn early_candidates_are_applied_after_remote_description() -> anyhow::Result<()> {
        let runtime = Arc::new(LoopbackRuntime::new());
        let (offerer, answerer) = offerer_and_answerer(&runtime).await?;
        let offer = offerer.create_offer().await?;

        for port in [50000, 50001, 50002] {
            answerer.add_ice_candidate(host_candidate(port)).await?;
        }
        assert_eq!(answerer.applied_candidates(), 0);
        assert_eq!(answerer.pending_candidates(), 3);

        answerer.apply_remote_description(offer).await?;
        assert_eq!(answerer.applied_candidates(), 3);
        assert_eq!(answerer.pending_candidates(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_candidates_are_applied_once() -> anyhow::Result<()> {
        let runtime = Arc::new(LoopbackRuntime::new());
        let (offerer, answerer) = offerer_and_answerer(&runtime).await?;
        answerer.apply_remote_description(offerer.create_offer().await?).await?;

        answerer.add_ice_candidate(host_candidate(50000)).await?;
        answerer.add_ice_candidate(host_candidate(50000)).await?;
        assert_eq!(answerer.applied_candidates(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn bad_candidate_is_reported_and_others_still_apply() -> anyhow::Result<()> {
        let runtime = Arc::new(LoopbackRuntime::new());
        let (offerer, answerer) = offerer_and_answerer(&runtime).await?;
        answerer.apply_remote_description(offerer.create_offer().await?).await?;

        let bad = ICECandidate { candidate: "garbage".to_string(), ..Default::default() };
        assert!(matches!(answerer.add_ice_candidate(bad).await, Err(Error::IceCandidate(_))));
        answerer.add_ice_candidate(host_candidate(50001)).await?;
        assert_eq!(answerer.applied_candidates(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn offer_only_from_idle() -> anyhow::Result<()> {
        let runtime = Arc::new(LoopbackRuntime::new());
        let (offerer, _answerer) = offerer_and_answerer(&runtime).await?;
        offerer.create_offer().await?;
        assert_eq!(offerer.negotiation_state(), NegotiationState::Offering);
        assert!(matches!(offerer.create_offer().await, Err(Error::InvalidState(_))));
        assert!(matches!(offerer.create_answer().await, Err(Error::InvalidState(_))));
        Ok(())
    }

    #[tokio::test]
    async fn remote_description_is_applied_once() -> anyhow::Result<()> {
        let runtime = Arc::new(LoopbackRuntime::new());
        let (offerer, answerer) = offerer_and_answerer(&runtime).await?;
        let offer = offerer.create_offer().await?;
        answerer.apply_remote_description(offer.clone()).await?;
        // same description again is fine
        answerer.apply_remote_description(offer).await?;

        let other = SessionDescription::offer("v=0\r\na=ice-ufrag:other\r\n");
        assert!(matches!(
            answerer.apply_remote_description(other).await,
            Err(Error::InvalidState(_))
        ));

        let answer = answerer.create_answer().await?;
        assert_eq!(answerer.negotiation_state(), NegotiationState::Stable);
        offerer.apply_remote_description(answer).await?;
        assert_eq!(offerer.negotiation_state(), NegotiationState::Stable);
        Ok(())
    }

    #[tokio::test]
    async fn local_media_is_idempotent_and_stopped_on_close() -> anyhow::Result<()> {
        let runtime = Arc::new(LoopbackRuntime::new());
        let peer = PeerConnectionBuilder::new().build(runtime.clone()).await?;
        let first = peer.acquire_local_media(&MediaConstraints::default()).await?;
        let second = peer.acquire_local_media(&MediaConstraints::default()).await?;
        assert_eq!(first.len(), 2);
        assert_eq!(
            first.iter().map(|t| t.id().to_string()).collect::<Vec<_>>(),
            second.iter().map(|t| t.id().to_string()).collect::<Vec<_>>()
        );
        assert_eq!(runtime.media_requests(), 1);

        peer.close().await?;
        peer.close().await?;
        assert!(first.iter().all(|t| t.ready_state() == TrackReadyState::Ended));
        assert_eq!(peer.connection_state(), PeerConnectionState::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn denied_media_is_a_media_access_error() -> anyhow::Result<()> {
        let runtime = Arc::new(LoopbackRuntime::new());
        runtime.deny_media(true);
        let peer = PeerConnectionBuilder::new().build(runtime.clone()).await?;
        let result = peer.acquire_local_media(&MediaConstraints::default()).await;
        assert!(matches!(result, Err(Error::MediaAccess(_))));
        assert!(peer.local_tracks().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn peers_connect_and_report_remote_tracks() -> anyhow::Result<()> {
        let runtime = Arc::new(LoopbackRuntime::new());
        let (offerer, answerer) = offerer_and_answerer(&runtime).await?;
        offerer.acquire_local_media(&MediaConstraints::default()).await?;
        answerer.acquire_local_media(&MediaConstraints::audio_only()).await?;

        answerer.apply_remote_description(offerer.create_offer().await?).await?;
        offerer.apply_remote_description(answerer.create_answer().await?).await?;

        // hand gathered candidates across until both sides report connected
        let mut offerer_events = vec![];
        while let Some(event) = offerer.next_event().await {
            if event == PeerEvent::IceGatheringComplete {
                break;
            }
            offerer_events.push(event);
        }
        for event in &offerer_events {
            if let PeerEvent::IceCandidate(candidate) = event {
                answerer.add_ice_candidate(candidate.clone()).await?;
            }
        }
        let mut answerer_connected = false;
        while let Some(event) = answerer.next_event().await {
            match event {
                PeerEvent::IceCandidate(candidate) => offerer.add_ice_candidate(candidate).await?,
                PeerEvent::ConnectionStateChange(PeerConnectionState::Connected) => {
                    answerer_connected = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(answerer_connected);
        assert_eq!(answerer.remote_tracks().len(), 2);
        let participant = answerer.participant();
        assert_eq!(participant.local_tracks.len(), 1);
        assert_eq!(participant.connection_state, PeerConnectionState::Connected);
        Ok(())
    }
}
