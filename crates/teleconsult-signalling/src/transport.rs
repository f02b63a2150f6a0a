//! Typed signalling operations over a [`SignallingStore`]

use std::sync::Arc;

use chrono::Utc;
use log::{debug, warn};
use teleconsult_rtc::types::{ICECandidate, SessionDescription};

use crate::{
    config::CallConfig,
    record::{CallSession, CallStatus, CandidateDirection, SessionPatch},
    store::{Document, LatestQuery, SignallingStore, StoreError, WatchCancel},
};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("call session {0} already exists")]
    AlreadyExists(String),
    #[error("call session {0} not found")]
    NotFound(String),
    /// The session is already `rejected` or `ended`
    #[error("call session {call_id} is already {status}")]
    TerminalState { call_id: String, status: CallStatus },
    #[error("call session {call_id} cannot move from {from} to {to}")]
    InvalidTransition { call_id: String, from: CallStatus, to: CallStatus },
    #[error("call session {0} already has an answer")]
    AlreadyAnswered(String),
    #[error("malformed signalling record ({0})")]
    Decode(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Decode(e.to_string())
    }
}

/// A typed view over a store watch.
///
/// Items that fail to decode are reported, not skipped, so the consumer
/// decides whether to log or stop.
pub struct Feed<R, T> {
    rx: flume::Receiver<R>,
    decode: fn(R) -> Result<T, TransportError>,
    cancel: Option<WatchCancel>,
}

impl<R, T> Feed<R, T> {
    fn new(watch: crate::store::Watch<R>, decode: fn(R) -> Result<T, TransportError>) -> Self {
        let (rx, cancel) = watch.into_parts();
        Self { rx, decode, cancel: Some(cancel) }
    }

    /// Next item. `None` once the feed is cancelled or the store closes it.
    pub async fn next(&self) -> Option<Result<T, TransportError>> {
        let raw = self.rx.recv_async().await.ok()?;
        Some((self.decode)(raw))
    }

    /// Detach the cancel handle, so the feed can be consumed by a task while
    /// its owner keeps control over its lifetime
    pub fn take_cancel(&mut self) -> WatchCancel {
        self.cancel.take().unwrap_or_else(WatchCancel::noop)
    }
}

/// Snapshots of one call session. `None` while the record does not exist.
pub type SessionFeed = Feed<Option<Document>, Option<CallSession>>;
/// Candidates of one direction, oldest first
pub type CandidateFeed = Feed<Document, ICECandidate>;
/// The newest ringing call addressed to a user, if any
pub type IncomingFeed = Feed<Option<(String, Document)>, Option<CallSession>>;

fn decode_session(document: Option<Document>) -> Result<Option<CallSession>, TransportError> {
    document.map(CallSession::from_document).transpose().map_err(Into::into)
}

fn decode_candidate(document: Document) -> Result<ICECandidate, TransportError> {
    Ok(serde_json::from_value(serde_json::Value::Object(document))?)
}

fn decode_latest(latest: Option<(String, Document)>) -> Result<Option<CallSession>, TransportError> {
    decode_session(latest.map(|(_, document)| document))
}

/// Call session and candidate exchange for one store.
///
/// Stateless apart from the store handle. Clones share the store.
pub struct SignallingTransport<S> {
    store: Arc<S>,
    calls: String,
    caller_candidates: String,
    callee_candidates: String,
}

impl<S> Clone for SignallingTransport<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            calls: self.calls.clone(),
            caller_candidates: self.caller_candidates.clone(),
            callee_candidates: self.callee_candidates.clone(),
        }
    }
}

impl<S: SignallingStore> SignallingTransport<S> {
    pub fn new(store: Arc<S>, config: &CallConfig) -> Self {
        Self {
            store,
            calls: config.calls_collection.clone(),
            caller_candidates: config.candidates_collection(CandidateDirection::CallerToCallee).to_string(),
            callee_candidates: config.candidates_collection(CandidateDirection::CalleeToCaller).to_string(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn candidates(&self, direction: CandidateDirection) -> &str {
        match direction {
            CandidateDirection::CallerToCallee => &self.caller_candidates,
            CandidateDirection::CalleeToCaller => &self.callee_candidates,
        }
    }

    /// Write a new session record in status `calling`
    pub async fn create_session(
        &self,
        call_id: &str,
        caller_id: &str,
        recipient_id: &str,
        offer: SessionDescription,
    ) -> Result<CallSession, TransportError> {
        let session = CallSession::new(call_id, caller_id, recipient_id, offer);
        match self.store.create(&self.calls, call_id, session.to_document()?).await {
            Ok(()) => {
                debug!("created call session {call_id}");
                Ok(session)
            }
            Err(StoreError::AlreadyExists { .. }) => Err(TransportError::AlreadyExists(call_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_session(&self, call_id: &str) -> Result<Option<CallSession>, TransportError> {
        decode_session(self.store.get(&self.calls, call_id).await?)
    }

    /// Merge a patch into a session, returning the updated record.
    ///
    /// Status writes only move forward. Repeating the terminal status a
    /// session already holds succeeds without touching the record.
    pub async fn update_session(&self, call_id: &str, patch: SessionPatch) -> Result<CallSession, TransportError> {
        let fields = patch.to_fields(Utc::now())?;
        let current = match self.store.merge(&self.calls, call_id, fields, patch.preconditions()).await {
            Ok(merged) => return Ok(CallSession::from_document(merged)?),
            Err(StoreError::NotFound { .. }) => return Err(TransportError::NotFound(call_id.to_string())),
            Err(StoreError::PreconditionFailed { current }) => CallSession::from_document(current)?,
            Err(e) => return Err(e.into()),
        };
        let call_id = call_id.to_string();
        match patch.status {
            Some(target) if target == current.status && target.is_terminal() => {
                debug!("call session {call_id} is already {target}");
                Ok(current)
            }
            _ if current.status.is_terminal() => {
                Err(TransportError::TerminalState { call_id, status: current.status })
            }
            _ if patch.answer.is_some() && current.answer.is_some() => {
                Err(TransportError::AlreadyAnswered(call_id))
            }
            Some(target) => {
                Err(TransportError::InvalidTransition { call_id, from: current.status, to: target })
            }
            None => {
                warn!("write to call session {call_id} refused for an unknown reason");
                Err(TransportError::InvalidTransition { call_id, from: current.status, to: current.status })
            }
        }
    }

    pub async fn subscribe_session(&self, call_id: &str) -> Result<SessionFeed, TransportError> {
        let watch = self.store.watch(&self.calls, call_id).await?;
        Ok(Feed::new(watch, decode_session))
    }

    pub async fn append_candidate(
        &self,
        call_id: &str,
        direction: CandidateDirection,
        candidate: &ICECandidate,
    ) -> Result<(), TransportError> {
        let item = match serde_json::to_value(candidate)? {
            serde_json::Value::Object(item) => item,
            _ => return Err(TransportError::Decode("candidate is not an object".to_string())),
        };
        self.store.append(&self.calls, call_id, self.candidates(direction), item).await?;
        Ok(())
    }

    pub async fn subscribe_candidates(
        &self,
        call_id: &str,
        direction: CandidateDirection,
    ) -> Result<CandidateFeed, TransportError> {
        let watch = self.store.watch_appended(&self.calls, call_id, self.candidates(direction)).await?;
        Ok(Feed::new(watch, decode_candidate))
    }

    /// Watch the newest `calling` session addressed to `recipient_id`
    pub async fn subscribe_incoming(&self, recipient_id: &str) -> Result<IncomingFeed, TransportError> {
        let query = LatestQuery::new(&self.calls, "startedAt")
            .filter("recipientId", recipient_id)
            .filter("status", CallStatus::Calling.as_str());
        let watch = self.store.watch_latest(query).await?;
        Ok(Feed::new(watch, decode_latest))
    }
}
