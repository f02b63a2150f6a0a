//! One side of one call attempt
//!
//! A [`Call`] owns the peer connection, the local media and every store
//! subscription of the attempt. Session snapshots are reduced idempotently:
//! replays and out-of-order deliveries change nothing once a state has been
//! reached, and every callback fires at most once.
//!
//! Background work runs on tokio tasks holding weak references, so dropping
//! the last [`Call`] handle tears the attempt down.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use teleconsult_rtc::{
    types::{CallParticipant, ICECandidate, PeerConnectionState, SessionDescription},
    CallPeer, PeerConnectionBuilder, PeerEvent, RtcRuntime,
};
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    callbacks::CallCallbacks,
    config::CallConfig,
    record::{CallRole, CallSession, CallStatus, SessionPatch},
    store::{SignallingStore, WatchCancel},
    transport::{CandidateFeed, SessionFeed, SignallingTransport, TransportError},
};

/// Local state of a call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Offer published, waiting for the callee
    Initiating,
    /// Answer being produced and published
    Answering,
    Connected,
    Ended,
    Rejected,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended | CallState::Rejected | CallState::Failed)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("media access error: {0}")]
    MediaAccess(String),
    #[error("signalling error: {0}")]
    Transport(TransportError),
    #[error("call {0} not found")]
    NotFound(String),
    #[error("call {call_id} is already {status}")]
    AlreadyTerminal { call_id: String, status: CallStatus },
    #[error("invalid call state: {0}")]
    InvalidState(String),
    #[error("ice candidate error: {0}")]
    IceCandidate(String),
    #[error("no signed-in user")]
    NotAuthenticated,
    #[error(transparent)]
    Peer(teleconsult_rtc::Error),
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotFound(call_id) => CallError::NotFound(call_id),
            TransportError::TerminalState { call_id, status } => CallError::AlreadyTerminal { call_id, status },
            TransportError::InvalidTransition { call_id, from, to } => {
                CallError::InvalidState(format!("call {call_id} cannot move from {from} to {to}"))
            }
            other => CallError::Transport(other),
        }
    }
}

impl From<teleconsult_rtc::Error> for CallError {
    fn from(e: teleconsult_rtc::Error) -> Self {
        match e {
            teleconsult_rtc::Error::MediaAccess(reason) => CallError::MediaAccess(reason),
            teleconsult_rtc::Error::InvalidState(reason) => CallError::InvalidState(reason),
            teleconsult_rtc::Error::IceCandidate(reason) => CallError::IceCandidate(reason),
            other => CallError::Peer(other),
        }
    }
}

pub type CallResult<T> = Result<T, CallError>;

fn hung_up_during_setup() -> CallError {
    CallError::InvalidState("call was hung up during setup".to_string())
}

struct Subscription {
    name: &'static str,
    cancel: WatchCancel,
}

struct CallInner<R: RtcRuntime> {
    state: CallState,
    role: Option<CallRole>,
    call_id: Option<String>,
    /// The session record exists, so teardown must mark it ended
    session_exists: bool,
    peer: Option<Arc<CallPeer<R>>>,
    subscriptions: Vec<Subscription>,
    /// Bumped on every setup, so listeners of an aborted attempt stay quiet
    attempt: u64,
}

struct Shared<S, R: RtcRuntime> {
    transport: SignallingTransport<S>,
    runtime: Arc<R>,
    config: CallConfig,
    callbacks: RwLock<CallCallbacks>,
    inner: Mutex<CallInner<R>>,
    shutdown: watch::Sender<bool>,
}

/// Drives one side of one call attempt.
///
/// Calls are single use: once a call reaches a terminal state, start another
/// one. A call left in [`CallState::Idle`] after a failed setup may be retried.
pub struct Call<S: SignallingStore + 'static, R: RtcRuntime> {
    shared: Arc<Shared<S, R>>,
}

impl<S: SignallingStore + 'static, R: RtcRuntime> Call<S, R> {
    pub fn new(
        transport: SignallingTransport<S>,
        runtime: Arc<R>,
        config: CallConfig,
        callbacks: CallCallbacks,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                transport,
                runtime,
                config,
                callbacks: RwLock::new(callbacks),
                inner: Mutex::new(CallInner {
                    state: CallState::Idle,
                    role: None,
                    call_id: None,
                    session_exists: false,
                    peer: None,
                    subscriptions: vec![],
                    attempt: 0,
                }),
                shutdown,
            }),
        }
    }

    pub fn state(&self) -> CallState {
        self.shared.state()
    }

    pub fn call_id(&self) -> Option<String> {
        self.shared.inner.lock().call_id.clone()
    }

    pub fn role(&self) -> Option<CallRole> {
        self.shared.inner.lock().role
    }

    /// Media and transport snapshot of the local side, once a peer exists
    pub fn participant(&self) -> Option<CallParticipant> {
        self.shared.peer().map(|peer| peer.participant())
    }

    pub fn peer(&self) -> Option<Arc<CallPeer<R>>> {
        self.shared.peer()
    }

    /// Number of live store subscriptions held by this call
    pub fn active_subscriptions(&self) -> usize {
        self.shared.inner.lock().subscriptions.len()
    }

    /// Replace the hooks, including for events still to come on this call
    pub fn set_callbacks(&self, callbacks: CallCallbacks) {
        *self.shared.callbacks.write() = callbacks;
    }

    /// Start an outgoing call from `caller_id` to `recipient_id`.
    ///
    /// Acquires media, publishes the offer in a new session record and starts
    /// listening for the answer and the callee's candidates. Returns the new
    /// call id.
    pub async fn create_call(&self, caller_id: &str, recipient_id: &str) -> CallResult<String> {
        let shared = &self.shared;
        shared.begin(CallState::Initiating, CallRole::Caller)?;
        let call_id = Uuid::new_v4().to_string();
        shared.inner.lock().call_id = Some(call_id.clone());
        info!("starting call {call_id} to {recipient_id}");

        let peer = match shared.open_peer().await {
            Ok(peer) => peer,
            Err(e) => {
                warn!("call {call_id} setup failed ({e})");
                shared.abort_setup(CallState::Idle).await;
                return Err(e);
            }
        };
        let offer = match peer.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                error!("failed to create offer for call {call_id} ({e})");
                shared.abort_setup(CallState::Failed).await;
                return Err(e.into());
            }
        };
        shared.ensure_state(CallState::Initiating)?;

        if let Err(e) = shared.transport.create_session(&call_id, caller_id, recipient_id, offer).await {
            error!("failed to publish call {call_id} ({e})");
            shared.abort_setup(CallState::Failed).await;
            return Err(CallError::Transport(e));
        }
        let hung_up = {
            let mut inner = shared.inner.lock();
            inner.session_exists = true;
            inner.state != CallState::Initiating
        };
        if hung_up {
            shared.end_session(&call_id).await;
            return Err(hung_up_during_setup());
        }

        if let Err(e) = Shared::subscribe(shared, &call_id, CallRole::Caller).await {
            warn!("failed to subscribe to call {call_id} ({e})");
            shared.fail().await;
            return Err(e);
        }
        Shared::start_event_pump(shared, peer, call_id.clone(), CallRole::Caller);
        debug!("call {call_id} is ringing");
        Ok(call_id)
    }

    /// Answer the incoming call `call_id` as `callee_id`.
    ///
    /// Applies the caller's offer, publishes the answer and moves the session
    /// to `connected`. Candidates published by the caller before the offer is
    /// applied are held back until it is.
    pub async fn answer_call(&self, call_id: &str, callee_id: &str) -> CallResult<()> {
        let shared = &self.shared;
        shared.begin(CallState::Answering, CallRole::Callee)?;
        let session = match shared.transport.get_session(call_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                shared.reset();
                return Err(CallError::NotFound(call_id.to_string()));
            }
            Err(e) => {
                shared.reset();
                return Err(e.into());
            }
        };
        if let Err(e) = check_answerable(&session, callee_id) {
            shared.reset();
            return Err(e);
        }
        {
            let mut inner = shared.inner.lock();
            inner.call_id = Some(call_id.to_string());
            inner.session_exists = true;
        }
        info!("answering call {call_id} from {}", session.caller_id);

        let peer = match shared.open_peer().await {
            Ok(peer) => peer,
            Err(e) => {
                warn!("call {call_id} setup failed ({e})");
                shared.abort_setup(CallState::Idle).await;
                return Err(e);
            }
        };
        // caller candidates queue inside the peer until the offer is applied
        if let Err(e) = Shared::subscribe_candidates(shared, call_id, CallRole::Callee).await {
            shared.abort_setup(CallState::Failed).await;
            return Err(e);
        }
        let answer = match answer_offer(&peer, session.offer).await {
            Ok(answer) => answer,
            Err(e) => {
                error!("failed to answer call {call_id} ({e})");
                shared.abort_setup(CallState::Failed).await;
                return Err(e.into());
            }
        };
        shared.ensure_state(CallState::Answering)?;

        if let Err(e) = shared.transport.update_session(call_id, SessionPatch::answered(answer)).await {
            warn!("failed to publish answer for call {call_id} ({e})");
            shared.abort_setup(CallState::Failed).await;
            return Err(e.into());
        }
        if let Err(e) = Shared::subscribe_session(shared, call_id).await {
            warn!("failed to subscribe to call {call_id} ({e})");
            shared.fail().await;
            return Err(e);
        }
        Shared::start_event_pump(shared, peer, call_id.to_string(), CallRole::Callee);

        let answered = {
            let mut inner = shared.inner.lock();
            let answered = inner.state == CallState::Answering;
            if answered {
                inner.state = CallState::Connected;
            }
            answered
        };
        if answered {
            info!("call {call_id} answered");
            shared.callbacks().call_answered(call_id);
        }
        Ok(())
    }

    /// Decline `call_id`.
    ///
    /// On a call that was never set up locally this only writes the record:
    /// no media is requested and no peer is created.
    pub async fn reject_call(&self, call_id: &str) -> CallResult<()> {
        let shared = &self.shared;
        let (state, own_call) = {
            let inner = shared.inner.lock();
            (inner.state, inner.call_id.as_deref() == Some(call_id))
        };
        match state {
            CallState::Idle => {}
            CallState::Initiating | CallState::Answering if own_call => {}
            CallState::Connected => {
                return Err(CallError::InvalidState("cannot reject a connected call, hang up instead".to_string()))
            }
            state => return Err(CallError::InvalidState(format!("cannot reject {call_id} while {state:?}"))),
        }
        shared.transport.update_session(call_id, SessionPatch::rejected()).await?;
        info!("rejected call {call_id}");
        if state != CallState::Idle {
            let rejected = {
                let mut inner = shared.inner.lock();
                let rejected = !inner.state.is_terminal();
                if rejected {
                    inner.state = CallState::Rejected;
                }
                rejected
            };
            if rejected {
                shared.release().await;
            }
        }
        Ok(())
    }

    /// End the call from this side. Idempotent.
    ///
    /// Marks the session ended, cancels every subscription, closes the peer
    /// and stops local media. Store failures are logged, local teardown always
    /// completes.
    pub async fn hang_up(&self) {
        let shared = &self.shared;
        let (call_id, session_exists) = {
            let mut inner = shared.inner.lock();
            if inner.state == CallState::Idle {
                debug!("hang up ignored, no call in progress");
                return;
            }
            if inner.state.is_terminal() {
                return;
            }
            inner.state = CallState::Ended;
            (inner.call_id.clone(), inner.session_exists)
        };
        info!("hanging up call {}", call_id.as_deref().unwrap_or("(unpublished)"));
        if let (Some(call_id), true) = (&call_id, session_exists) {
            shared.end_session(call_id).await;
        }
        shared.release().await;
    }
}

impl<S: SignallingStore + 'static, R: RtcRuntime> fmt::Debug for Call<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Call")
            .field("state", &inner.state)
            .field("role", &inner.role)
            .field("call_id", &inner.call_id)
            .field("subscriptions", &inner.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl<S: SignallingStore + 'static, R: RtcRuntime> Drop for Call<S, R> {
    fn drop(&mut self) {
        let (call_id, session_exists, subscriptions, peer) = {
            let mut inner = self.shared.inner.lock();
            if inner.state == CallState::Idle || inner.state.is_terminal() {
                return;
            }
            inner.state = CallState::Ended;
            (
                inner.call_id.clone(),
                inner.session_exists,
                std::mem::take(&mut inner.subscriptions),
                inner.peer.clone(),
            )
        };
        warn!("call dropped while active, tearing down");
        for subscription in subscriptions {
            subscription.cancel.cancel();
        }
        self.shared.shutdown.send_replace(true);
        if let Some(peer) = &peer {
            peer.local_tracks().iter().for_each(|track| track.stop());
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = self.shared.clone();
                handle.spawn(async move {
                    if let (Some(call_id), true) = (&call_id, session_exists) {
                        shared.end_session(call_id).await;
                    }
                    if let Some(peer) = peer {
                        if let Err(e) = peer.close().await {
                            warn!("error closing peer connection ({e})");
                        }
                    }
                });
            }
            Err(_) => warn!("no runtime available, peer connection left to the runtime"),
        }
    }
}

fn check_answerable(session: &CallSession, callee_id: &str) -> CallResult<()> {
    if session.status.is_terminal() {
        return Err(CallError::AlreadyTerminal { call_id: session.call_id.clone(), status: session.status });
    }
    if session.recipient_id != callee_id {
        return Err(CallError::InvalidState(format!("call {} is addressed to another user", session.call_id)));
    }
    if session.status != CallStatus::Calling || session.answer.is_some() {
        return Err(CallError::InvalidState(format!("call {} was already answered", session.call_id)));
    }
    Ok(())
}

async fn answer_offer<R: RtcRuntime>(
    peer: &CallPeer<R>,
    offer: SessionDescription,
) -> Result<SessionDescription, teleconsult_rtc::Error> {
    peer.apply_remote_description(offer).await?;
    peer.create_answer().await
}

/// The stop flag is read through a helper so no watch guard is held in an
/// async context
fn is_stopped(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

impl<S: SignallingStore + 'static, R: RtcRuntime> Shared<S, R> {
    fn state(&self) -> CallState {
        self.inner.lock().state
    }

    fn peer(&self) -> Option<Arc<CallPeer<R>>> {
        self.inner.lock().peer.clone()
    }

    fn callbacks(&self) -> CallCallbacks {
        self.callbacks.read().clone()
    }

    fn begin(&self, state: CallState, role: CallRole) -> CallResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != CallState::Idle {
            return Err(CallError::InvalidState(format!("call is already {:?}", inner.state)));
        }
        inner.state = state;
        inner.role = Some(role);
        inner.attempt += 1;
        self.shutdown.send_replace(false);
        Ok(())
    }

    fn attempt(&self) -> u64 {
        self.inner.lock().attempt
    }

    /// Back to idle after a setup that never touched the store
    fn reset(&self) {
        let mut inner = self.inner.lock();
        if !inner.state.is_terminal() {
            inner.state = CallState::Idle;
            inner.role = None;
            inner.call_id = None;
            inner.session_exists = false;
        }
    }

    fn ensure_state(&self, expected: CallState) -> CallResult<()> {
        if self.state() == expected {
            Ok(())
        } else {
            Err(hung_up_during_setup())
        }
    }

    async fn open_peer(&self) -> CallResult<Arc<CallPeer<R>>> {
        let peer = PeerConnectionBuilder::new()
            .set_config(self.config.peer.clone())
            .build(self.runtime.clone())
            .await?;
        let peer = Arc::new(peer);
        let hung_up = {
            let mut inner = self.inner.lock();
            let hung_up = inner.state.is_terminal();
            if !hung_up {
                inner.peer = Some(peer.clone());
            }
            hung_up
        };
        if hung_up {
            let _ = peer.close().await;
            return Err(hung_up_during_setup());
        }
        peer.acquire_local_media(&self.config.media).await?;
        Ok(peer)
    }

    /// Roll back a setup that failed before the call was live
    async fn abort_setup(&self, next: CallState) {
        {
            let mut inner = self.inner.lock();
            if !inner.state.is_terminal() {
                inner.state = next;
                if next == CallState::Idle {
                    inner.role = None;
                    inner.call_id = None;
                    inner.session_exists = false;
                }
            }
        }
        self.release().await;
        if next == CallState::Idle {
            let mut inner = self.inner.lock();
            if inner.state == CallState::Idle {
                inner.peer = None;
            }
        }
    }

    /// Unrecoverable error on a published call: end the session, then tear down
    async fn fail(&self) {
        let (call_id, session_exists) = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = CallState::Failed;
            (inner.call_id.clone(), inner.session_exists)
        };
        if let (Some(call_id), true) = (&call_id, session_exists) {
            self.end_session(call_id).await;
        }
        self.release().await;
    }

    /// A terminal status observed on the session record
    async fn finish(&self, terminal: CallState) {
        let call_id = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = terminal;
            inner.call_id.clone().unwrap_or_default()
        };
        let callbacks = self.callbacks();
        match terminal {
            CallState::Rejected => {
                info!("call {call_id} was rejected");
                callbacks.call_rejected(&call_id);
            }
            _ => {
                info!("call {call_id} was ended by the other side");
                callbacks.call_ended(&call_id);
            }
        }
        self.release().await;
    }

    async fn end_session(&self, call_id: &str) {
        if let Err(e) = self.transport.update_session(call_id, SessionPatch::ended()).await {
            warn!("failed to mark call {call_id} ended ({e})");
        }
    }

    /// Cancel subscriptions, stop the event pump, close the peer
    async fn release(&self) {
        let (subscriptions, peer) = {
            let mut inner = self.inner.lock();
            (std::mem::take(&mut inner.subscriptions), inner.peer.clone())
        };
        for subscription in subscriptions {
            trace!("cancelling {} subscription", subscription.name);
            subscription.cancel.cancel();
        }
        self.shutdown.send_replace(true);
        if let Some(peer) = peer {
            if let Err(e) = peer.close().await {
                warn!("error closing peer connection ({e})");
            }
        }
    }

    /// Keep a subscription alive for the life of the call. A call that was
    /// torn down meanwhile cancels it straight away.
    fn register(&self, name: &'static str, cancel: WatchCancel) -> CallResult<()> {
        let torn_down = {
            let mut inner = self.inner.lock();
            let torn_down = inner.state.is_terminal() || inner.state == CallState::Idle;
            if !torn_down {
                inner.subscriptions.push(Subscription { name, cancel });
                return Ok(());
            }
            cancel
        };
        torn_down.cancel();
        Err(hung_up_during_setup())
    }

    async fn subscribe(this: &Arc<Self>, call_id: &str, role: CallRole) -> CallResult<()> {
        Self::subscribe_candidates(this, call_id, role).await?;
        Self::subscribe_session(this, call_id).await
    }

    async fn subscribe_candidates(this: &Arc<Self>, call_id: &str, role: CallRole) -> CallResult<()> {
        let mut feed = this.transport.subscribe_candidates(call_id, role.incoming()).await?;
        this.register("remote candidates", feed.take_cancel())?;
        Self::spawn_candidate_listener(this, feed);
        Ok(())
    }

    async fn subscribe_session(this: &Arc<Self>, call_id: &str) -> CallResult<()> {
        let mut feed = this.transport.subscribe_session(call_id).await?;
        this.register("session", feed.take_cancel())?;
        Self::spawn_session_listener(this, feed);
        Ok(())
    }

    fn spawn_candidate_listener(this: &Arc<Self>, feed: CandidateFeed) {
        let weak = Arc::downgrade(this);
        let attempt = this.attempt();
        tokio::spawn(async move {
            while let Some(item) = feed.next().await {
                let Some(shared) = weak.upgrade() else { return };
                shared.on_remote_candidate(item).await;
            }
            if let Some(shared) = weak.upgrade() {
                shared.on_feed_closed("remote candidates", attempt).await;
            }
        });
    }

    fn spawn_session_listener(this: &Arc<Self>, feed: SessionFeed) {
        let weak = Arc::downgrade(this);
        let attempt = this.attempt();
        tokio::spawn(async move {
            while let Some(item) = feed.next().await {
                let Some(shared) = weak.upgrade() else { return };
                shared.on_session_snapshot(item).await;
            }
            if let Some(shared) = weak.upgrade() {
                shared.on_feed_closed("session", attempt).await;
            }
        });
    }

    /// A feed ended. Teardown closes feeds after leaving the live states, so
    /// a live call whose feed ends has lost its signalling and fails.
    async fn on_feed_closed(&self, name: &str, attempt: u64) {
        let lost = {
            let inner = self.inner.lock();
            inner.attempt == attempt && inner.state != CallState::Idle && !inner.state.is_terminal()
        };
        if !lost {
            trace!("{name} listener finished");
            return;
        }
        error!("{name} subscription closed by the store, failing the call");
        self.fail().await;
    }

    /// Forward local peer events: candidates to the store, state changes and
    /// remote tracks to the hooks
    fn start_event_pump(this: &Arc<Self>, peer: Arc<CallPeer<R>>, call_id: String, role: CallRole) {
        let weak: Weak<Self> = Arc::downgrade(this);
        let mut shutdown = this.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                if is_stopped(&shutdown) {
                    break;
                }
                let event = tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    event = peer.next_event() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(shared) = weak.upgrade() else { break };
                shared.on_peer_event(&call_id, role, event).await;
            }
            debug!("event pump for call {call_id} stopped");
        });
    }

    async fn on_remote_candidate(&self, item: Result<ICECandidate, TransportError>) {
        if self.state().is_terminal() {
            return;
        }
        let candidate = match item {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("skipping malformed remote candidate ({e})");
                return;
            }
        };
        let Some(peer) = self.peer() else { return };
        if let Err(e) = peer.add_ice_candidate(candidate).await {
            warn!("skipping remote candidate ({e})");
        }
    }

    async fn on_session_snapshot(&self, item: Result<Option<CallSession>, TransportError>) {
        let session = match item {
            Ok(Some(session)) => session,
            Ok(None) => {
                warn!("call session record disappeared");
                self.finish(CallState::Ended).await;
                return;
            }
            Err(e) => {
                warn!("ignoring malformed session snapshot ({e})");
                return;
            }
        };
        let (state, role) = {
            let inner = self.inner.lock();
            (inner.state, inner.role)
        };
        if state.is_terminal() {
            return;
        }
        trace!("call {} snapshot: {}", session.call_id, session.status);
        match session.status {
            CallStatus::Calling => {}
            CallStatus::Connected => {
                if let (Some(CallRole::Caller), Some(answer)) = (role, session.answer) {
                    self.accept_answer(&session.call_id, answer).await;
                }
            }
            CallStatus::Rejected => self.finish(CallState::Rejected).await,
            CallStatus::Ended => self.finish(CallState::Ended).await,
        }
    }

    /// Apply the callee's answer on the caller side, once
    async fn accept_answer(&self, call_id: &str, answer: SessionDescription) {
        let Some(peer) = self.peer() else { return };
        if peer.remote_description().is_some() {
            return;
        }
        if let Err(e) = peer.apply_remote_description(answer).await {
            error!("failed to apply answer for call {call_id} ({e})");
            self.fail().await;
            return;
        }
        let answered = {
            let mut inner = self.inner.lock();
            let answered = inner.state == CallState::Initiating;
            if answered {
                inner.state = CallState::Connected;
            }
            answered
        };
        if answered {
            info!("call {call_id} answered");
            self.callbacks().call_answered(call_id);
        }
    }

    async fn on_peer_event(&self, call_id: &str, role: CallRole, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                if self.state().is_terminal() {
                    return;
                }
                if let Err(e) = self.transport.append_candidate(call_id, role.outgoing(), &candidate).await {
                    warn!("failed to publish local candidate for call {call_id} ({e})");
                }
            }
            PeerEvent::IceGatheringComplete => debug!("call {call_id} finished gathering candidates"),
            PeerEvent::RemoteTrack(track) => {
                debug!("call {call_id} received remote {:?} track {}", track.kind, track.id);
                self.callbacks().remote_track(call_id, &track);
            }
            PeerEvent::ConnectionStateChange(state) => {
                debug!("call {call_id} connection {state}");
                match state {
                    PeerConnectionState::Connected => self.callbacks().connected(call_id),
                    PeerConnectionState::Disconnected => self.callbacks().disconnected(call_id, state),
                    PeerConnectionState::Failed => {
                        warn!("call {call_id} connection failed");
                        self.callbacks().disconnected(call_id, state);
                        self.fail().await;
                    }
                    _ => {}
                }
            }
        }
    }
}
