//! Application hooks invoked on call events

use std::{fmt, sync::Arc};

use teleconsult_rtc::types::{PeerConnectionState, RemoteTrack};

type CallHook = Arc<dyn Fn(&str) + Send + Sync>;
type TrackHook = Arc<dyn Fn(&str, &RemoteTrack) + Send + Sync>;
type StateHook = Arc<dyn Fn(&str, PeerConnectionState) + Send + Sync>;

/// Hooks receive the call id first. Unset hooks do nothing.
///
/// Hooks run on the task that observed the event and must not block.
#[derive(Clone)]
pub struct CallCallbacks {
    call_answered: CallHook,
    call_rejected: CallHook,
    call_ended: CallHook,
    remote_track: TrackHook,
    connected: CallHook,
    disconnected: StateHook,
}

impl Default for CallCallbacks {
    fn default() -> Self {
        Self {
            call_answered: Arc::new(|_: &str| {}),
            call_rejected: Arc::new(|_: &str| {}),
            call_ended: Arc::new(|_: &str| {}),
            remote_track: Arc::new(|_: &str, _: &RemoteTrack| {}),
            connected: Arc::new(|_: &str| {}),
            disconnected: Arc::new(|_: &str, _: PeerConnectionState| {}),
        }
    }
}

impl fmt::Debug for CallCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallCallbacks").finish_non_exhaustive()
    }
}

impl CallCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The callee accepted: fired once the answer is in place on this side
    pub fn on_call_answered(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.call_answered = Arc::new(f);
        self
    }

    pub fn on_call_rejected(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.call_rejected = Arc::new(f);
        self
    }

    /// The other side ended the call
    pub fn on_call_ended(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.call_ended = Arc::new(f);
        self
    }

    pub fn on_remote_track(mut self, f: impl Fn(&str, &RemoteTrack) + Send + Sync + 'static) -> Self {
        self.remote_track = Arc::new(f);
        self
    }

    /// Media transport is up
    pub fn on_connected(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.connected = Arc::new(f);
        self
    }

    /// Media transport was lost (`disconnected`) or gave up (`failed`)
    pub fn on_disconnected(
        mut self,
        f: impl Fn(&str, PeerConnectionState) + Send + Sync + 'static,
    ) -> Self {
        self.disconnected = Arc::new(f);
        self
    }

    pub(crate) fn call_answered(&self, call_id: &str) {
        (self.call_answered)(call_id)
    }

    pub(crate) fn call_rejected(&self, call_id: &str) {
        (self.call_rejected)(call_id)
    }

    pub(crate) fn call_ended(&self, call_id: &str) {
        (self.call_ended)(call_id)
    }

    pub(crate) fn remote_track(&self, call_id: &str, track: &RemoteTrack) {
        (self.remote_track)(call_id, track)
    }

    pub(crate) fn connected(&self, call_id: &str) {
        (self.connected)(call_id)
    }

    pub(crate) fn disconnected(&self, call_id: &str, state: PeerConnectionState) {
        (self.disconnected)(call_id, state)
    }
}
