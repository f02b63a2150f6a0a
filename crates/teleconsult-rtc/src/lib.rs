//! Peer connection wrapper for teleconsult video calls
//!
//! [`CallPeer`] owns one underlying real-time connection for one call attempt,
//! together with the local media tracks it sends. The connection itself comes
//! from an [`RtcRuntime`]: [`platform::NativeRuntime`] on top of webrtc-rs, or
//! the in-process [`platform::LoopbackRuntime`] (feature `loopback`).

use std::future::Future;

pub mod media;
pub mod peer;
pub mod platform;
pub mod types;

pub use media::{LocalTrack, TrackSource};
pub use peer::{CallPeer, NegotiationState, PeerConnectionBuilder, PeerEvent};

use types::{ICECandidate, MediaConstraints, PeerConfiguration, PeerConnectionState, RemoteTrack, SessionDescription};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Teleconsult RTC error type
pub enum Error {
    /// Camera or microphone unavailable, or permission denied
    #[error("media access error: {0}")]
    MediaAccess(String),
    /// Operation not valid in the current negotiation state
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// A remote candidate could not be applied
    #[error("ice candidate error: {0}")]
    IceCandidate(String),
    /// Error originating from the underlying runtime
    #[error("webrtc error: {0}")]
    Runtime(String),
    /// The connection has been closed
    #[error("peer connection closed!")]
    Closed,
}

/// Raw events emitted by an underlying connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A local candidate was gathered. `None` marks the end of gathering.
    IceCandidate(Option<ICECandidate>),
    RemoteTrack(RemoteTrack),
    StateChange(PeerConnectionState),
}

/// One underlying real-time peer connection.
///
/// Implementations report events through the sender handed to
/// [`RtcRuntime::open_connection`].
#[trait_variant::make(RtcConnection: Send)]
pub trait LocalRtcConnection: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), Error>;

    /// Create an offer and install it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, Error>;

    /// Create an answer and install it as the local description
    async fn create_answer(&self) -> Result<SessionDescription, Error>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), Error>;

    /// Fails when the remote description has not been set yet
    async fn add_ice_candidate(&self, candidate: ICECandidate) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error>;
}

/// The real-time transport runtime: media devices plus the connection factory.
pub trait RtcRuntime: Send + Sync + 'static {
    type Connection: RtcConnection + 'static;

    /// Request local media matching `constraints`
    fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> impl Future<Output = Result<Vec<LocalTrack>, Error>> + Send;

    /// Open a new connection, reporting its events on `events`
    fn open_connection(
        &self,
        config: &PeerConfiguration,
        events: flume::Sender<ConnectionEvent>,
    ) -> impl Future<Output = Result<Self::Connection, Error>> + Send;
}
