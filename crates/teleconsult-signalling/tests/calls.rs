use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Result};
use log::debug;
use parking_lot::Mutex;
use teleconsult_rtc::{
    platform::LoopbackRuntime,
    types::{PeerConnectionState, SessionDescription, TrackReadyState},
};
use teleconsult_signalling::{
    CallCallbacks, CallConfig, CallError, CallManager, CallManagerBuilder, CallState, CallStatus,
    CandidateDirection, MemoryStore, SessionPatch, SignallingStore, SignallingTransport,
    StaticIdentity, TransportError,
};

const WAIT: Duration = Duration::from_secs(5);

type Manager = CallManager<MemoryStore, LoopbackRuntime, StaticIdentity>;

/// Callback invocations, by name
#[derive(Clone, Default)]
struct Events(Arc<Mutex<Vec<&'static str>>>);

impl Events {
    fn callbacks(&self) -> CallCallbacks {
        let (answered, rejected, ended) = (self.clone(), self.clone(), self.clone());
        let (track, connected, disconnected) = (self.clone(), self.clone(), self.clone());
        CallCallbacks::new()
            .on_call_answered(move |_| answered.push("answered"))
            .on_call_rejected(move |_| rejected.push("rejected"))
            .on_call_ended(move |_| ended.push("ended"))
            .on_remote_track(move |_, _| track.push("track"))
            .on_connected(move |_| connected.push("connected"))
            .on_disconnected(move |_, state| {
                disconnected.push(match state {
                    PeerConnectionState::Failed => "failed",
                    _ => "disconnected",
                })
            })
    }

    fn push(&self, event: &'static str) {
        self.0.lock().push(event)
    }

    fn count(&self, event: &str) -> usize {
        self.0.lock().iter().filter(|e| **e == event).count()
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    runtime: Arc<LoopbackRuntime>,
    transport: SignallingTransport<MemoryStore>,
}

impl Fixture {
    fn new() -> Self {
        let _ = pretty_env_logger::try_init();
        let store = Arc::new(MemoryStore::new());
        let transport = SignallingTransport::new(store.clone(), &CallConfig::default());
        Self { store, runtime: Arc::new(LoopbackRuntime::new()), transport }
    }

    fn manager(&self, uid: &str, events: &Events) -> Manager {
        CallManagerBuilder::new()
            .set_callbacks(events.callbacks())
            .build(self.store.clone(), self.runtime.clone(), Arc::new(StaticIdentity::signed_in(uid)))
    }

    async fn status(&self, call_id: &str) -> Result<CallStatus> {
        let session = self.transport.get_session(call_id).await?;
        Ok(session.ok_or_else(|| anyhow!("call {call_id} has no record"))?.status)
    }
}

/// Poll `check` until it holds
async fn eventually<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let poll = async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(WAIT, poll)
        .await
        .map_err(|_| anyhow!("timed out waiting for {what}"))
}

/// Alice calls Bob and Bob answers
async fn connect(fx: &Fixture, alice: &Manager, bob: &Manager) -> Result<String> {
    let call = alice.start_call("bob").await?;
    let call_id = call.call_id().ok_or_else(|| anyhow!("call has no id"))?;
    let answered = bob.accept(&call_id).await?;
    eventually("caller to be connected", || async { call.state() == CallState::Connected }).await?;
    eventually("both transports to be connected", || async {
        [&call, &answered].iter().all(|c| {
            c.participant().map(|p| p.connection_state) == Some(PeerConnectionState::Connected)
        })
    })
    .await?;
    assert_eq!(fx.status(&call_id).await?, CallStatus::Connected);
    Ok(call_id)
}

#[tokio::test]
async fn answered_call_connects_both_sides() -> Result<()> {
    let fx = Fixture::new();
    let (alice_events, bob_events) = (Events::default(), Events::default());
    let alice = fx.manager("alice", &alice_events);
    let bob = fx.manager("bob", &bob_events);

    let incoming = bob.watch_incoming().await?;
    assert_eq!(incoming.next().await, Some(None));

    let call = alice.start_call("bob").await?;
    assert_eq!(call.state(), CallState::Initiating);
    let call_id = call.call_id().ok_or_else(|| anyhow!("call has no id"))?;
    debug!("alice is calling bob ({call_id})");

    let ring = incoming.next().await.flatten().ok_or_else(|| anyhow!("bob's phone did not ring"))?;
    assert_eq!(ring.call_id, call_id);
    assert_eq!(ring.caller_id, "alice");

    let answered = bob.accept(&call_id).await?;
    assert_eq!(answered.state(), CallState::Connected);
    // the call being answered stops ringing
    assert_eq!(incoming.next().await, Some(None));

    eventually("alice to see the answer", || async { call.state() == CallState::Connected }).await?;
    eventually("both transports to connect", || async {
        alice_events.count("connected") == 1 && bob_events.count("connected") == 1
    })
    .await?;
    eventually("remote tracks", || async {
        alice_events.count("track") == 2 && bob_events.count("track") == 2
    })
    .await?;
    eventually("the answer to be reported", || async { alice_events.count("answered") == 1 }).await?;
    assert_eq!(bob_events.count("answered"), 1);

    let session = fx.transport.get_session(&call_id).await?.ok_or_else(|| anyhow!("no record"))?;
    assert_eq!(session.status, CallStatus::Connected);
    assert!(session.answer.is_some());
    assert_eq!(call.participant().map(|p| p.remote_tracks.len()), Some(2));

    incoming.cancel();
    alice.hang_up().await;
    bob.hang_up().await;
    Ok(())
}

#[tokio::test]
async fn rejected_call_notifies_caller() -> Result<()> {
    let fx = Fixture::new();
    let (alice_events, bob_events) = (Events::default(), Events::default());
    let alice = fx.manager("alice", &alice_events);
    let bob = fx.manager("bob", &bob_events);

    let call = alice.start_call("bob").await?;
    let call_id = call.call_id().ok_or_else(|| anyhow!("call has no id"))?;
    bob.reject(&call_id).await?;

    eventually("alice to see the rejection and tear down", || async {
        alice_events.count("rejected") == 1 && fx.store.live_watches() == 0
    })
    .await?;
    assert_eq!(call.state(), CallState::Rejected);
    assert_eq!(fx.status(&call_id).await?, CallStatus::Rejected);
    let session = fx.transport.get_session(&call_id).await?.ok_or_else(|| anyhow!("no record"))?;
    assert_eq!(session.answer, None);
    let ended_at = session.ended_at.ok_or_else(|| anyhow!("rejection did not stamp endedAt"))?;
    assert!(ended_at >= session.started_at);

    // only alice ever asked for media
    assert_eq!(fx.runtime.media_requests(), 1);
    assert_eq!(call.active_subscriptions(), 0);
    assert_eq!(fx.store.live_watches(), 0);
    assert!(alice.active_call().is_none());

    // rejecting again is harmless
    let again = bob.reject(&call_id).await;
    assert!(again.is_ok(), "repeating the same terminal status is idempotent: {again:?}");
    let unchanged = fx.transport.get_session(&call_id).await?.and_then(|s| s.ended_at);
    assert_eq!(unchanged, Some(ended_at));
    Ok(())
}

#[tokio::test]
async fn hang_up_ends_call_for_the_other_side() -> Result<()> {
    let fx = Fixture::new();
    let (alice_events, bob_events) = (Events::default(), Events::default());
    let alice = fx.manager("alice", &alice_events);
    let bob = fx.manager("bob", &bob_events);
    let call_id = connect(&fx, &alice, &bob).await?;
    let bob_call = bob.active_call().ok_or_else(|| anyhow!("bob has no active call"))?;

    alice.hang_up().await;
    assert_eq!(fx.status(&call_id).await?, CallStatus::Ended);
    eventually("bob to see the call end", || async { bob_events.count("ended") == 1 }).await?;
    assert_eq!(bob_call.state(), CallState::Ended);
    // hanging up locally is not reported back to the one hanging up
    assert_eq!(alice_events.count("ended"), 0);
    let session = fx.transport.get_session(&call_id).await?.ok_or_else(|| anyhow!("no record"))?;
    assert!(session.ended_at.is_some());

    // hanging up twice changes nothing
    bob.hang_up().await;
    bob_call.hang_up().await;
    assert_eq!(bob_events.count("ended"), 1);
    Ok(())
}

#[tokio::test]
async fn hang_up_releases_every_resource() -> Result<()> {
    let fx = Fixture::new();
    let (alice_events, bob_events) = (Events::default(), Events::default());
    let alice = fx.manager("alice", &alice_events);
    let bob = fx.manager("bob", &bob_events);
    connect(&fx, &alice, &bob).await?;

    let alice_call = alice.active_call().ok_or_else(|| anyhow!("alice has no active call"))?;
    let bob_call = bob.active_call().ok_or_else(|| anyhow!("bob has no active call"))?;
    let tracks: Vec<_> = [&alice_call, &bob_call]
        .iter()
        .flat_map(|call| call.peer().map(|peer| peer.local_tracks()).unwrap_or_default())
        .collect();
    assert_eq!(tracks.len(), 4);
    assert!(tracks.iter().all(|t| t.ready_state() == TrackReadyState::Live));
    assert_eq!(alice_call.active_subscriptions(), 2);
    assert_eq!(fx.store.live_watches(), 4);

    alice.hang_up().await;
    assert_eq!(alice_call.active_subscriptions(), 0);
    eventually("bob to tear down", || async {
        bob_call.state() == CallState::Ended && fx.store.live_watches() == 0
    })
    .await?;
    assert_eq!(bob_call.active_subscriptions(), 0);
    eventually("local media to stop", || async {
        tracks.iter().all(|t| t.ready_state() == TrackReadyState::Ended)
    })
    .await?;
    eventually("peer connections to close", || async { fx.runtime.open_connections() == 0 }).await?;
    Ok(())
}

#[tokio::test]
async fn answering_unknown_call_acquires_no_media() -> Result<()> {
    let fx = Fixture::new();
    let bob = fx.manager("bob", &Events::default());
    let result = bob.accept("does-not-exist").await;
    assert!(matches!(result, Err(CallError::NotFound(id)) if id == "does-not-exist"));
    assert_eq!(fx.runtime.media_requests(), 0);
    assert!(bob.active_call().is_none());
    Ok(())
}

#[tokio::test]
async fn second_call_is_refused_and_first_untouched() -> Result<()> {
    let fx = Fixture::new();
    let alice = fx.manager("alice", &Events::default());
    let bob = fx.manager("bob", &Events::default());

    let first = alice.start_call("bob").await?;
    let call_id = first.call_id().ok_or_else(|| anyhow!("call has no id"))?;
    let before = fx.transport.get_session(&call_id).await?;

    let second = alice.start_call("carol").await;
    assert!(matches!(second, Err(CallError::InvalidState(_))));
    assert_eq!(fx.transport.get_session(&call_id).await?, before);
    assert_eq!(first.state(), CallState::Initiating);
    assert_eq!(fx.runtime.media_requests(), 1);

    // still refused once connected, on either side
    bob.accept(&call_id).await?;
    eventually("caller to be connected", || async { first.state() == CallState::Connected }).await?;
    assert!(matches!(alice.start_call("carol").await, Err(CallError::InvalidState(_))));
    assert!(matches!(bob.start_call("carol").await, Err(CallError::InvalidState(_))));
    assert_eq!(fx.status(&call_id).await?, CallStatus::Connected);

    alice.hang_up().await;
    // the slot is free again
    let next = alice.start_call("carol").await?;
    assert_ne!(next.call_id(), Some(call_id));
    alice.hang_up().await;
    Ok(())
}

#[tokio::test]
async fn answer_is_written_once_across_devices() -> Result<()> {
    let fx = Fixture::new();
    let alice = fx.manager("alice", &Events::default());
    let bob_phone = fx.manager("bob", &Events::default());
    let bob_laptop = fx.manager("bob", &Events::default());

    let call = alice.start_call("bob").await?;
    let call_id = call.call_id().ok_or_else(|| anyhow!("call has no id"))?;
    bob_phone.accept(&call_id).await?;
    let answer = fx.transport.get_session(&call_id).await?.and_then(|s| s.answer);

    let second = bob_laptop.accept(&call_id).await;
    assert!(matches!(second, Err(CallError::InvalidState(_))), "{second:?}");
    assert!(bob_laptop.active_call().is_none());
    assert_eq!(fx.transport.get_session(&call_id).await?.and_then(|s| s.answer), answer);

    // nobody can answer on the caller's behalf either
    let forged = fx
        .transport
        .update_session(&call_id, SessionPatch::answered(SessionDescription::answer("v=0")))
        .await;
    assert_eq!(forged.unwrap_err(), TransportError::AlreadyAnswered(call_id.clone()));
    alice.hang_up().await;
    bob_phone.hang_up().await;
    Ok(())
}

#[tokio::test]
async fn observed_statuses_never_go_backwards() -> Result<()> {
    let fx = Fixture::new();
    let alice = fx.manager("alice", &Events::default());
    let bob = fx.manager("bob", &Events::default());

    let call = alice.start_call("bob").await?;
    let call_id = call.call_id().ok_or_else(|| anyhow!("call has no id"))?;
    let feed = fx.transport.subscribe_session(&call_id).await?;

    // racing writers: bob answers while a stale client tries to reject and end
    let transport = fx.transport.clone();
    let racing_id = call_id.clone();
    let racer = tokio::spawn(async move {
        let rejected = transport.update_session(&racing_id, SessionPatch::rejected()).await;
        let ended = transport.update_session(&racing_id, SessionPatch::ended()).await;
        (rejected, ended)
    });
    let accepted = bob.accept(&call_id).await;
    let (rejected, ended) = racer.await?;
    debug!("accept: {accepted:?}, reject: {rejected:?}, end: {ended:?}");
    // exactly one of answer and rejection won
    assert!(accepted.is_ok() != rejected.is_ok());
    // a rejected call cannot be ended afterwards
    assert_eq!(ended.is_ok(), accepted.is_ok());
    bob.hang_up().await;
    alice.hang_up().await;

    let mut statuses = vec![];
    while let Ok(Some(Ok(Some(session)))) =
        tokio::time::timeout(Duration::from_millis(100), feed.next()).await
    {
        statuses.push(session.status);
    }
    debug!("observed {statuses:?}");
    let final_session = fx.transport.get_session(&call_id).await?.ok_or_else(|| anyhow!("no record"))?;
    let expected_end = if accepted.is_ok() { CallStatus::Ended } else { CallStatus::Rejected };
    assert_eq!(final_session.status, expected_end);
    assert_eq!(final_session.answer.is_some(), accepted.is_ok());
    assert_eq!(statuses.first(), Some(&CallStatus::Calling));
    assert_eq!(statuses.last(), Some(&expected_end));
    for pair in statuses.windows(2) {
        if pair[1] < pair[0] || (pair[0].is_terminal() && pair[1] != pair[0]) {
            bail!("status went from {} to {}", pair[0], pair[1]);
        }
    }
    Ok(())
}

#[tokio::test]
async fn redelivered_candidates_are_applied_once() -> Result<()> {
    let fx = Fixture::new();
    let alice = fx.manager("alice", &Events::default());
    let bob = fx.manager("bob", &Events::default());
    let call_id = connect(&fx, &alice, &bob).await?;
    let bob_peer = bob
        .active_call()
        .and_then(|call| call.peer())
        .ok_or_else(|| anyhow!("bob has no peer"))?;
    let applied = bob_peer.applied_candidates();
    assert!(applied >= 1);

    // replay every caller candidate into the store
    let feed = fx.transport.subscribe_candidates(&call_id, CandidateDirection::CallerToCallee).await?;
    let candidate = feed.next().await.ok_or_else(|| anyhow!("no caller candidate"))??;
    for _ in 0..3 {
        fx.transport
            .append_candidate(&call_id, CandidateDirection::CallerToCallee, &candidate)
            .await?;
    }
    // and one that cannot be decoded
    let mut garbage = serde_json::Map::new();
    garbage.insert("candidate".to_string(), 42.into());
    fx.store.append("calls", &call_id, "callerCandidates", garbage).await?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bob_peer.applied_candidates(), applied);
    assert_eq!(bob.active_call().map(|c| c.state()), Some(CallState::Connected));
    alice.hang_up().await;
    Ok(())
}

#[tokio::test]
async fn denied_media_publishes_nothing_and_can_be_retried() -> Result<()> {
    let fx = Fixture::new();
    let alice = fx.manager("alice", &Events::default());
    let bob = fx.manager("bob", &Events::default());
    let incoming = bob.watch_incoming().await?;
    assert_eq!(incoming.next().await, Some(None));

    fx.runtime.deny_media(true);
    let result = alice.start_call("bob").await;
    assert!(matches!(result, Err(CallError::MediaAccess(_))));
    assert!(alice.active_call().is_none());
    assert_eq!(fx.runtime.open_connections(), 0);

    fx.runtime.deny_media(false);
    let call = alice.start_call("bob").await?;
    let ring = incoming.next().await.flatten().ok_or_else(|| anyhow!("no ring"))?;
    assert_eq!(Some(ring.call_id), call.call_id());
    alice.hang_up().await;
    Ok(())
}

#[tokio::test]
async fn signed_out_user_cannot_call() -> Result<()> {
    let fx = Fixture::new();
    let identity = Arc::new(StaticIdentity::signed_out());
    let manager = CallManagerBuilder::new().build(fx.store.clone(), fx.runtime.clone(), identity.clone());
    assert!(matches!(manager.start_call("bob").await, Err(CallError::NotAuthenticated)));
    assert!(matches!(manager.watch_incoming().await, Err(CallError::NotAuthenticated)));
    assert_eq!(fx.runtime.media_requests(), 0);

    identity.sign_in("alice");
    let call = manager.start_call("bob").await?;
    let call_id = call.call_id().ok_or_else(|| anyhow!("call has no id"))?;
    let session = fx.transport.get_session(&call_id).await?;
    assert_eq!(session.map(|s| s.caller_id).as_deref(), Some("alice"));
    manager.hang_up().await;
    Ok(())
}

#[tokio::test]
async fn incoming_feed_does_not_keep_a_dropped_managers_call_alive() -> Result<()> {
    let fx = Fixture::new();
    let alice = fx.manager("alice", &Events::default());
    let incoming = alice.watch_incoming().await?;
    assert_eq!(incoming.next().await, Some(None));

    let call = alice.start_call("bob").await?;
    let call_id = call.call_id().ok_or_else(|| anyhow!("call has no id"))?;
    assert_eq!(fx.store.live_watches(), 3);
    drop(call);
    drop(alice);

    eventually("the abandoned call to end", || async {
        fx.status(&call_id).await.ok() == Some(CallStatus::Ended)
    })
    .await?;
    eventually("the peer connection to close", || async { fx.runtime.open_connections() == 0 }).await?;
    // only the ring feed is left
    assert_eq!(fx.store.live_watches(), 1);
    incoming.cancel();
    assert_eq!(fx.store.live_watches(), 0);
    Ok(())
}
