//! Call signalling for teleconsult video calls
//!
//! Two parties coordinate one call through a shared document store: the
//! caller writes a call session record holding its offer, the callee writes
//! its answer into the same record, and both stream ICE candidates into
//! per-direction sub-collections. [`call::Call`] drives one side of one call
//! attempt, [`manager::CallManager`] enforces the one-active-call rule for a
//! signed-in user.
//!
//! The store is pluggable through [`store::SignallingStore`].
//! [`store::MemoryStore`] is the in-process implementation, the gRPC
//! [`server`] shares one across processes and [`client::RemoteStore`] talks
//! to it.

#[cfg(all(target_arch = "wasm32", feature = "server"))]
compile_error!("feature \"server\" is not compatible with target \"wasm32\"");

#[cfg(any(feature = "server", feature = "client"))]
pub(crate) mod pb {
    tonic::include_proto!("store_pb");
}

pub mod call;
pub mod callbacks;
pub mod config;
pub mod identity;
pub mod manager;
pub mod record;
pub mod store;
pub mod transport;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "server")]
pub mod server;

pub use call::{Call, CallError, CallResult, CallState};
pub use callbacks::CallCallbacks;
pub use config::CallConfig;
pub use identity::{IdentityProvider, StaticIdentity};
pub use manager::{CallManager, CallManagerBuilder, IncomingCall, IncomingCalls};
pub use record::{CallRole, CallSession, CallStatus, CandidateDirection, SessionPatch};
pub use store::{MemoryStore, SignallingStore, StoreError};
pub use transport::{SignallingTransport, TransportError};

pub const DEFAULT_NATIVE_SERVER_ADDR: &str = "[::1]:10000";
pub const DEFAULT_WEB_SERVER_ADDR: &str = "[::1]:10001";
