//! In-process loopback runtime
//!
//! Connections opened from the same [`LoopbackRuntime`] share a virtual
//! network. A connection reports `checking` then `connected` once it holds a
//! local description, the remote description and at least one remote
//! candidate. No media flows. Remote tracks are announced from the `m=` lines
//! of the remote description.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use log::{debug, error, trace};
use parking_lot::Mutex;

use crate::{
    types::{
        ICECandidate, MediaConstraints, PeerConfiguration, PeerConnectionState, RemoteTrack,
        SDPType, SessionDescription, TrackKind,
    },
    ConnectionEvent, Error, LocalTrack, RtcConnection, RtcRuntime, TrackSource,
};

const HOST_PRIORITY: u32 = 2130706431;
const BASE_PORT: u64 = 40000;

/// Endpoints reachable on the virtual network, keyed by ICE username fragment
type Network = Arc<Mutex<HashMap<String, flume::Sender<ConnectionEvent>>>>;

/// Simulated runtime for tests and demos
#[derive(Debug, Default)]
pub struct LoopbackRuntime {
    network: Network,
    next_id: AtomicU64,
    deny_media: AtomicBool,
    media_requests: AtomicUsize,
}

impl LoopbackRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent media requests fail as if permission was denied
    pub fn deny_media(&self, deny: bool) {
        self.deny_media.store(deny, Ordering::Relaxed);
    }

    /// Number of media requests made so far, granted or not
    pub fn media_requests(&self) -> usize {
        self.media_requests.load(Ordering::Relaxed)
    }

    /// Number of connections currently open
    pub fn open_connections(&self) -> usize {
        self.network.lock().len()
    }

    /// Report every open connection as `failed`, as ICE does when all
    /// candidate pairs die
    pub fn fail_connections(&self) {
        let network = self.network.lock();
        for (ufrag, events) in network.iter() {
            debug!("loopback connection {ufrag} failed");
            let _ = events.send(ConnectionEvent::StateChange(PeerConnectionState::Failed));
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl RtcRuntime for LoopbackRuntime {
    type Connection = LoopbackConnection;

    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<Vec<LocalTrack>, Error> {
        self.media_requests.fetch_add(1, Ordering::Relaxed);
        if self.deny_media.load(Ordering::Relaxed) {
            return Err(Error::MediaAccess("permission denied".to_string()));
        }
        if constraints.is_empty() {
            return Err(Error::MediaAccess("no audio or video requested".to_string()));
        }
        let id = self.next_id();
        let mut tracks = vec![];
        if constraints.audio {
            tracks.push(LocalTrack::new(format!("audio-{id}"), TrackKind::Audio, TrackSource::Synthetic));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(format!("video-{id}"), TrackKind::Video, TrackSource::Synthetic));
        }
        Ok(tracks)
    }

    async fn open_connection(
        &self,
        _config: &PeerConfiguration,
        events: flume::Sender<ConnectionEvent>,
    ) -> Result<LoopbackConnection, Error> {
        let id = self.next_id();
        let ufrag = format!("lb{id:04x}");
        self.network.lock().insert(ufrag.clone(), events.clone());
        debug!("loopback connection {ufrag} opened");
        Ok(LoopbackConnection {
            id,
            ufrag,
            network: self.network.clone(),
            events,
            link: Mutex::new(Link::default()),
        })
    }
}

#[derive(Debug, Default)]
struct Link {
    tracks: Vec<(String, TrackKind)>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_ufrag: Option<String>,
    remote_candidates: HashSet<String>,
    state: PeerConnectionState,
    closed: bool,
}

/// A connection on the loopback network
#[derive(Debug)]
pub struct LoopbackConnection {
    id: u64,
    ufrag: String,
    network: Network,
    events: flume::Sender<ConnectionEvent>,
    link: Mutex<Link>,
}

impl LoopbackConnection {
    fn emit(&self, event: ConnectionEvent) {
        if let Err(e) = self.events.send(event) {
            error!("loopback event channel error ({e})");
        }
    }

    fn describe(&self, link: &Link) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=ice-ufrag:{}\r\n",
            self.id, self.ufrag
        );
        for (track_id, kind) in &link.tracks {
            let media = match kind {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };
            sdp.push_str(&format!("m={media} 9 UDP/TLS/RTP/SAVPF 96\r\na=msid:{} {track_id}\r\n", self.ufrag));
        }
        sdp
    }

    /// Announce the single host candidate, then the end of gathering
    fn gather(&self) {
        let port = BASE_PORT + self.id;
        let candidate = ICECandidate {
            candidate: format!("candidate:{} 1 udp {HOST_PRIORITY} 127.0.0.1 {port} typ host", self.id),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: Some(self.ufrag.clone()),
        };
        self.emit(ConnectionEvent::IceCandidate(Some(candidate)));
        self.emit(ConnectionEvent::IceCandidate(None));
    }

    fn check_connected(&self, link: &mut Link) {
        let ready = link.local.is_some() && link.remote.is_some() && !link.remote_candidates.is_empty();
        if ready && link.state == PeerConnectionState::New {
            link.state = PeerConnectionState::Connected;
            self.emit(ConnectionEvent::StateChange(PeerConnectionState::Checking));
            self.emit(ConnectionEvent::StateChange(PeerConnectionState::Connected));
        }
    }
}

fn parse_remote_tracks(sdp: &str) -> Vec<RemoteTrack> {
    let mut tracks = vec![];
    let mut kind = None;
    for line in sdp.lines() {
        if let Some(media) = line.strip_prefix("m=") {
            kind = match media.split(' ').next() {
                Some("audio") => Some(TrackKind::Audio),
                Some("video") => Some(TrackKind::Video),
                _ => None,
            };
        } else if let (Some(msid), Some(kind)) = (line.strip_prefix("a=msid:"), kind) {
            if let Some((stream_id, id)) = msid.split_once(' ') {
                tracks.push(RemoteTrack { id: id.to_string(), stream_id: stream_id.to_string(), kind });
            }
        }
    }
    tracks
}

impl RtcConnection for LoopbackConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), Error> {
        let mut link = self.link.lock();
        if link.closed {
            return Err(Error::Closed);
        }
        link.tracks.push((track.id().to_string(), track.kind()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        let mut link = self.link.lock();
        if link.closed {
            return Err(Error::Closed);
        }
        let offer = SessionDescription::offer(self.describe(&link));
        link.local = Some(offer.clone());
        self.gather();
        self.check_connected(&mut link);
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        let mut link = self.link.lock();
        if link.closed {
            return Err(Error::Closed);
        }
        match &link.remote {
            Some(remote) if remote.sdp_type == SDPType::Offer => {}
            _ => return Err(Error::InvalidState("no remote offer to answer".to_string())),
        }
        let answer = SessionDescription::answer(self.describe(&link));
        link.local = Some(answer.clone());
        self.gather();
        self.check_connected(&mut link);
        Ok(answer)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), Error> {
        let mut link = self.link.lock();
        if link.closed {
            return Err(Error::Closed);
        }
        let remote_ufrag = desc
            .sdp
            .lines()
            .find_map(|line| line.strip_prefix("a=ice-ufrag:"))
            .ok_or_else(|| Error::Runtime("remote description has no ice-ufrag".to_string()))?
            .to_string();
        for track in parse_remote_tracks(&desc.sdp) {
            self.emit(ConnectionEvent::RemoteTrack(track));
        }
        link.remote_ufrag = Some(remote_ufrag);
        link.remote = Some(desc);
        self.check_connected(&mut link);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: ICECandidate) -> Result<(), Error> {
        let mut link = self.link.lock();
        if link.closed {
            return Err(Error::Closed);
        }
        if link.remote.is_none() {
            return Err(Error::InvalidState("remote description not set".to_string()));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(Error::IceCandidate(format!("malformed candidate {:?}", candidate.candidate)));
        }
        if let (Some(ufrag), Some(remote)) = (&candidate.username_fragment, &link.remote_ufrag) {
            if ufrag != remote {
                return Err(Error::IceCandidate(format!("candidate belongs to session {ufrag}")));
            }
        }
        trace!("loopback {} applied {}", self.ufrag, candidate.candidate);
        link.remote_candidates.insert(candidate.candidate);
        self.check_connected(&mut link);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        let remote_ufrag = {
            let mut link = self.link.lock();
            if link.closed {
                return Ok(());
            }
            link.closed = true;
            link.state = PeerConnectionState::Closed;
            link.remote_ufrag.clone()
        };
        self.emit(ConnectionEvent::StateChange(PeerConnectionState::Closed));
        let mut network = self.network.lock();
        network.remove(&self.ufrag);
        if let Some(remote) = remote_ufrag.and_then(|ufrag| network.get(&ufrag)) {
            // the far end notices the loss of connectivity
            let _ = remote.send(ConnectionEvent::StateChange(PeerConnectionState::Disconnected));
        }
        debug!("loopback connection {} closed", self.ufrag);
        Ok(())
    }
}
