//! Call orchestration for the signed-in user
//!
//! A [`CallManager`] holds at most one active [`Call`]. Starting or accepting
//! a second call while one is in progress fails with
//! [`CallError::InvalidState`]. Every operation needs a signed-in user.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use teleconsult_rtc::{
    types::{MediaConstraints, PeerConfiguration},
    RtcRuntime,
};

use crate::{
    call::{Call, CallError, CallResult},
    callbacks::CallCallbacks,
    config::CallConfig,
    identity::IdentityProvider,
    record::SessionPatch,
    store::{SignallingStore, WatchCancel},
    transport::{IncomingFeed, SignallingTransport},
};

type ActiveSlot<S, R> = Arc<Mutex<Option<Arc<Call<S, R>>>>>;
type WeakSlot<S, R> = Weak<Mutex<Option<Arc<Call<S, R>>>>>;

/// Builds a [`CallManager`]
#[derive(Debug, Clone, Default)]
pub struct CallManagerBuilder {
    config: CallConfig,
    callbacks: CallCallbacks,
}

impl CallManagerBuilder {
    /// Create new CallManagerBuilder (equivalent to CallManagerBuilder::default())
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_config(mut self, set: CallConfig) -> Self {
        self.config = set;
        self
    }

    /// Specify peer connection settings (STUN/TURN servers)
    pub fn set_peer_config(mut self, set: PeerConfiguration) -> Self {
        self.config.peer = set;
        self
    }

    pub fn set_media_constraints(mut self, set: MediaConstraints) -> Self {
        self.config.media = set;
        self
    }

    pub fn set_callbacks(mut self, set: CallCallbacks) -> Self {
        self.callbacks = set;
        self
    }

    pub fn build<S, R, I>(self, store: Arc<S>, runtime: Arc<R>, identity: Arc<I>) -> CallManager<S, R, I>
    where
        S: SignallingStore + 'static,
        R: RtcRuntime,
        I: IdentityProvider,
    {
        CallManager {
            transport: SignallingTransport::new(store, &self.config),
            runtime,
            identity,
            config: self.config,
            callbacks: Mutex::new(self.callbacks),
            active: Arc::new(Mutex::new(None)),
        }
    }
}

/// A call addressed to the signed-in user that is still ringing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub call_id: String,
    pub caller_id: String,
    pub started_at: DateTime<Utc>,
}

/// Ring signals for the signed-in user.
///
/// Yields `Some` while a call is ringing and `None` once it stops ringing.
/// The call the user is already in never rings.
pub struct IncomingCalls<S: SignallingStore + 'static, R: RtcRuntime> {
    feed: IncomingFeed,
    cancel: WatchCancel,
    /// Does not keep the manager's call alive
    active: WeakSlot<S, R>,
}

impl<S: SignallingStore + 'static, R: RtcRuntime> IncomingCalls<S, R> {
    /// Next ring signal. `None` once the feed is closed.
    pub async fn next(&self) -> Option<Option<IncomingCall>> {
        loop {
            let session = match self.feed.next().await? {
                Ok(session) => session,
                Err(e) => {
                    warn!("ignoring malformed incoming call ({e})");
                    continue;
                }
            };
            let own_call = self
                .active
                .upgrade()
                .and_then(|slot| slot.lock().as_ref().and_then(|call| call.call_id()));
            return Some(
                session
                    .filter(|session| own_call.as_deref() != Some(session.call_id.as_str()))
                    .map(|session| IncomingCall {
                        call_id: session.call_id,
                        caller_id: session.caller_id,
                        started_at: session.started_at,
                    }),
            );
        }
    }

    pub fn cancel(self) {
        self.cancel.cancel()
    }
}

/// One user's calls: at most one at a time.
pub struct CallManager<S: SignallingStore + 'static, R: RtcRuntime, I: IdentityProvider> {
    transport: SignallingTransport<S>,
    runtime: Arc<R>,
    identity: Arc<I>,
    config: CallConfig,
    callbacks: Mutex<CallCallbacks>,
    active: ActiveSlot<S, R>,
}

impl<S, R, I> CallManager<S, R, I>
where
    S: SignallingStore + 'static,
    R: RtcRuntime,
    I: IdentityProvider,
{
    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn transport(&self) -> &SignallingTransport<S> {
        &self.transport
    }

    /// The call in progress, if any
    pub fn active_call(&self) -> Option<Arc<Call<S, R>>> {
        self.active
            .lock()
            .as_ref()
            .filter(|call| !call.state().is_terminal())
            .cloned()
    }

    /// Replace the hooks for the active call and every later one
    pub fn set_callbacks(&self, callbacks: CallCallbacks) {
        if let Some(call) = self.active_call() {
            call.set_callbacks(callbacks.clone());
        }
        *self.callbacks.lock() = callbacks;
    }

    fn uid(&self) -> CallResult<String> {
        self.identity.current_uid().ok_or(CallError::NotAuthenticated)
    }

    /// Reserve the active slot for a fresh call
    fn claim(&self) -> CallResult<Arc<Call<S, R>>> {
        let mut active = self.active.lock();
        if let Some(call) = active.as_ref() {
            if !call.state().is_terminal() {
                return Err(CallError::InvalidState(format!(
                    "a call is already in progress ({:?})",
                    call.state()
                )));
            }
        }
        let call = Arc::new(Call::new(
            self.transport.clone(),
            self.runtime.clone(),
            self.config.clone(),
            self.callbacks.lock().clone(),
        ));
        *active = Some(call.clone());
        Ok(call)
    }

    /// Free the slot if it still holds `call`
    fn release(&self, call: &Arc<Call<S, R>>) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|held| Arc::ptr_eq(held, call)) {
            *active = None;
        }
    }

    /// Call `recipient_id`
    pub async fn start_call(&self, recipient_id: &str) -> CallResult<Arc<Call<S, R>>> {
        let uid = self.uid()?;
        let call = self.claim()?;
        match call.create_call(&uid, recipient_id).await {
            Ok(call_id) => {
                debug!("call {call_id} is active");
                Ok(call)
            }
            Err(e) => {
                self.release(&call);
                Err(e)
            }
        }
    }

    /// Answer the ringing call `call_id`
    pub async fn accept(&self, call_id: &str) -> CallResult<Arc<Call<S, R>>> {
        let uid = self.uid()?;
        let call = self.claim()?;
        match call.answer_call(call_id, &uid).await {
            Ok(()) => Ok(call),
            Err(e) => {
                self.release(&call);
                Err(e)
            }
        }
    }

    /// Decline `call_id` without acquiring media
    pub async fn reject(&self, call_id: &str) -> CallResult<()> {
        self.uid()?;
        if let Some(call) = self.active_call() {
            if call.call_id().as_deref() == Some(call_id) {
                return call.reject_call(call_id).await;
            }
        }
        self.transport.update_session(call_id, SessionPatch::rejected()).await?;
        info!("rejected call {call_id}");
        Ok(())
    }

    /// Hang up the active call, if any
    pub async fn hang_up(&self) {
        let call = self.active.lock().take();
        match call {
            Some(call) => call.hang_up().await,
            None => debug!("hang up ignored, no active call"),
        }
    }

    /// Ring signals for the signed-in user
    pub async fn watch_incoming(&self) -> CallResult<IncomingCalls<S, R>> {
        let uid = self.uid()?;
        let mut feed = self.transport.subscribe_incoming(&uid).await?;
        let cancel = feed.take_cancel();
        Ok(IncomingCalls { feed, cancel, active: Arc::downgrade(&self.active) })
    }
}
