//! Two users on one machine call each other.
//!
//! Signalling goes through an in-process store, or through a running
//! `teleconsult-signalling` server when `TELECONSULT_STORE_ADDR` is set.
//! Media runs over the simulated loopback network unless `DEMO_RUNTIME` is
//! `native`, which connects real webrtc-rs peers over host candidates.

use std::{env, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use log::info;
use teleconsult_rtc::{
    platform::{LoopbackRuntime, NativeRuntime},
    types::PeerConfiguration,
    RtcRuntime,
};
use teleconsult_signalling::{
    client::RemoteStore, config::STORE_ADDR_ENV, CallCallbacks, CallManagerBuilder, CallState,
    MemoryStore, SignallingStore, StaticIdentity,
};

const CALL_LENGTH: Duration = Duration::from_secs(2);
const RUNTIME_ENV: &str = "DEMO_RUNTIME";

fn log_callbacks(user: &'static str) -> CallCallbacks {
    CallCallbacks::new()
        .on_call_answered(move |id| info!("[{user}] call {id} answered"))
        .on_call_rejected(move |id| info!("[{user}] call {id} rejected"))
        .on_call_ended(move |id| info!("[{user}] call {id} ended by the other side"))
        .on_remote_track(move |id, track| info!("[{user}] call {id}: remote {:?} track {}", track.kind, track.id))
        .on_connected(move |id| info!("[{user}] call {id} connected"))
        .on_disconnected(move |id, state| info!("[{user}] call {id} transport {state}"))
}

async fn run_call<S, R>(caller_store: Arc<S>, callee_store: Arc<S>, runtime: Arc<R>) -> Result<()>
where
    S: SignallingStore + 'static,
    R: RtcRuntime,
{
    // both users sit on this machine, host candidates are enough
    let peer_config = PeerConfiguration { ice_servers: vec![], ..Default::default() };
    let doctor = CallManagerBuilder::new()
        .set_peer_config(peer_config.clone())
        .set_callbacks(log_callbacks("doctor"))
        .build(caller_store, runtime.clone(), Arc::new(StaticIdentity::signed_in("doctor")));
    let patient = CallManagerBuilder::new()
        .set_peer_config(peer_config)
        .set_callbacks(log_callbacks("patient"))
        .build(callee_store, runtime, Arc::new(StaticIdentity::signed_in("patient")));

    let incoming = patient.watch_incoming().await?;
    let call = doctor.start_call("patient").await?;
    let ring = loop {
        match incoming.next().await {
            Some(Some(ring)) => break ring,
            Some(None) => continue,
            None => return Err(anyhow!("incoming call feed closed")),
        }
    };
    info!("[patient] incoming call {} from {}", ring.call_id, ring.caller_id);
    patient.accept(&ring.call_id).await?;

    while call.state() != CallState::Connected {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(CALL_LENGTH).await;
    doctor.hang_up().await;
    while patient.active_call().is_some() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    incoming.cancel();
    info!("call finished");
    Ok(())
}

async fn with_runtime<S: SignallingStore + 'static>(caller_store: Arc<S>, callee_store: Arc<S>) -> Result<()> {
    match env::var(RUNTIME_ENV).as_deref() {
        Ok("native") => {
            info!("media over webrtc-rs");
            run_call(caller_store, callee_store, Arc::new(NativeRuntime::new()?)).await
        }
        _ => {
            info!("media over the loopback network");
            run_call(caller_store, callee_store, Arc::new(LoopbackRuntime::new())).await
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::try_init()?;
    match env::var(STORE_ADDR_ENV) {
        Ok(addr) => {
            info!("signalling through store server at {addr}");
            let caller_store = RemoteStore::connect(addr.clone(), None, None, None).await?;
            let callee_store = RemoteStore::connect(addr, None, None, None).await?;
            with_runtime(Arc::new(caller_store), Arc::new(callee_store)).await
        }
        Err(_) => {
            info!("signalling through an in-process store");
            let store = Arc::new(MemoryStore::new());
            with_runtime(store.clone(), store).await
        }
    }
}
