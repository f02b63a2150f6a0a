//! Native runtime on webrtc-rs
//!
//! Local media is synthetic: each track is a `TrackLocalStaticSample` that the
//! application feeds with encoded samples through [`LocalTrack::write_sample`].

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use log::{debug, error, info, trace, warn};

use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8},
        APIBuilder, API,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    media::Sample,
    peer_connection::{
        configuration::RTCConfiguration,
        peer_connection_state::RTCPeerConnectionState,
        policy::{bundle_policy::RTCBundlePolicy, ice_transport_policy::RTCIceTransportPolicy},
        sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
        RTCPeerConnection,
    },
    rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType},
    track::{
        track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
        track_remote::TrackRemote,
    },
};

use crate::{
    types::{
        BundlePolicy, ICECandidate, ICETransportPolicy, MediaConstraints, PeerConfiguration,
        PeerConnectionState, RemoteTrack, SDPType, SessionDescription, TrackKind, TrackReadyState,
    },
    ConnectionEvent, Error, LocalTrack, RtcConnection, RtcRuntime, TrackSource,
};

fn runtime_error(error: webrtc::Error) -> Error {
    Error::Runtime(error.to_string())
}

/// webrtc-rs backed runtime
pub struct NativeRuntime {
    api: API,
    next_stream: AtomicU64,
}

impl NativeRuntime {
    /// Build a runtime with the default codecs and interceptors
    pub fn new() -> Result<Self, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(runtime_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(runtime_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, next_stream: AtomicU64::new(0) })
    }
}

fn sample_track(mime_type: &str, id: String, stream_id: String) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            ..Default::default()
        },
        id,
        stream_id,
    ))
}

impl RtcRuntime for NativeRuntime {
    type Connection = NativeConnection;

    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<Vec<LocalTrack>, Error> {
        if constraints.is_empty() {
            return Err(Error::MediaAccess("no audio or video requested".to_string()));
        }
        let n = self.next_stream.fetch_add(1, Ordering::Relaxed);
        let stream_id = format!("teleconsult-{n}");
        let mut tracks = vec![];
        if constraints.audio {
            let id = format!("audio-{n}");
            let inner = sample_track(MIME_TYPE_OPUS, id.clone(), stream_id.clone());
            tracks.push(LocalTrack::new(id, TrackKind::Audio, TrackSource::Sample(inner)));
        }
        if constraints.video {
            let id = format!("video-{n}");
            let inner = sample_track(MIME_TYPE_VP8, id.clone(), stream_id);
            tracks.push(LocalTrack::new(id, TrackKind::Video, TrackSource::Sample(inner)));
        }
        Ok(tracks)
    }

    async fn open_connection(
        &self,
        config: &PeerConfiguration,
        events: flume::Sender<ConnectionEvent>,
    ) -> Result<NativeConnection, Error> {
        let connection = Arc::new(
            self.api
                .new_peer_connection(rtc_configuration(config))
                .await
                .map_err(runtime_error)?,
        );
        // register handlers, each forwarding into the event channel
        let state_tx = events.clone();
        connection.on_peer_connection_state_change(Box::new(move |state| {
            handle_peer_connection_state_change(state, &state_tx)
        }));
        let candidate_tx = events.clone();
        connection.on_ice_candidate(Box::new(move |candidate| {
            handle_ice_candidate(candidate, &candidate_tx)
        }));
        connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            handle_track(track, &events)
        }));
        Ok(NativeConnection { inner: connection })
    }
}

fn handle_peer_connection_state_change(
    state: RTCPeerConnectionState,
    events: &flume::Sender<ConnectionEvent>,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
    let state = match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Checking,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    };
    if state == PeerConnectionState::Failed {
        warn!("Peer connection failed");
    } else {
        info!("Peer connection state has changed: {state}");
    }
    if let Err(e) = events.send(ConnectionEvent::StateChange(state)) {
        error!("state change channel error ({e})");
    }
    Box::pin(async {})
}

fn handle_ice_candidate(
    candidate: Option<RTCIceCandidate>,
    events: &flume::Sender<ConnectionEvent>,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
    let event = match candidate.map(|c| c.to_json()).transpose() {
        Ok(Some(init)) => ConnectionEvent::IceCandidate(Some(ICECandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        })),
        Ok(None) => {
            debug!("ICE gathering finished.");
            ConnectionEvent::IceCandidate(None)
        }
        Err(e) => {
            error!("failed to serialise ice candidate ({e})");
            return Box::pin(async {});
        }
    };
    if let Err(e) = events.send(event) {
        error!("candidate channel error ({e})");
    }
    Box::pin(async {})
}

fn handle_track(
    track: Arc<TrackRemote>,
    events: &flume::Sender<ConnectionEvent>,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
    let kind = match track.kind() {
        RTPCodecType::Audio => TrackKind::Audio,
        RTPCodecType::Video => TrackKind::Video,
        RTPCodecType::Unspecified => {
            warn!("ignoring remote track of unspecified kind");
            return Box::pin(async {});
        }
    };
    let remote = RemoteTrack { id: track.id(), stream_id: track.stream_id(), kind };
    trace!("remote track {remote:?}");
    if let Err(e) = events.send(ConnectionEvent::RemoteTrack(remote)) {
        error!("remote track channel error ({e})");
    }
    Box::pin(async {})
}

fn rtc_configuration(config: &PeerConfiguration) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect(),
        ice_transport_policy: match config.ice_transport_policy {
            ICETransportPolicy::All => RTCIceTransportPolicy::All,
            ICETransportPolicy::Relay => RTCIceTransportPolicy::Relay,
        },
        bundle_policy: match config.bundle_policy {
            BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
            BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
            BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
        },
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        ..Default::default()
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, Error> {
    match desc.sdp_type {
        SDPType::Offer => RTCSessionDescription::offer(desc.sdp),
        SDPType::Answer => RTCSessionDescription::answer(desc.sdp),
        SDPType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SDPType::Rollback => {
            return Err(Error::InvalidState("rollback descriptions are not supported".to_string()))
        }
    }
    .map_err(runtime_error)
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, Error> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SDPType::Offer,
        RTCSdpType::Answer => SDPType::Answer,
        RTCSdpType::Pranswer => SDPType::Pranswer,
        RTCSdpType::Rollback => SDPType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(Error::Runtime("unspecified session description type".to_string()))
        }
    };
    Ok(SessionDescription { sdp_type, sdp: desc.sdp })
}

/// webrtc-rs peer connection
pub struct NativeConnection {
    inner: Arc<RTCPeerConnection>,
}

impl RtcConnection for NativeConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), Error> {
        match track.source() {
            TrackSource::Sample(sample) => {
                let local: Arc<dyn TrackLocal + Send + Sync> = sample.clone();
                self.inner.add_track(local).await.map_err(runtime_error)?;
                Ok(())
            }
            TrackSource::Synthetic => Err(Error::MediaAccess(format!(
                "track {} has no media source",
                track.id()
            ))),
        }
    }

    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        let offer = self.inner.create_offer(None).await.map_err(runtime_error)?;
        // sets the local description and starts gathering
        self.inner.set_local_description(offer.clone()).await.map_err(runtime_error)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        let answer = self.inner.create_answer(None).await.map_err(runtime_error)?;
        self.inner.set_local_description(answer.clone()).await.map_err(runtime_error)?;
        from_rtc_description(answer)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), Error> {
        let desc = to_rtc_description(desc)?;
        self.inner.set_remote_description(desc).await.map_err(runtime_error)
    }

    async fn add_ice_candidate(&self, candidate: ICECandidate) -> Result<(), Error> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.inner
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner.close().await.map_err(runtime_error)
    }
}

impl LocalTrack {
    /// Push one encoded sample (Opus or VP8) into a native track.
    ///
    /// Synthetic tracks accept and drop samples.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), Error> {
        if self.ready_state() == TrackReadyState::Ended {
            return Err(Error::Closed);
        }
        match self.source() {
            TrackSource::Sample(track) => track
                .write_sample(&Sample { data, duration, ..Default::default() })
                .await
                .map_err(runtime_error),
            TrackSource::Synthetic => Ok(()),
        }
    }
}
