//! Runtime implementations

#[cfg(not(target_arch = "wasm32"))]
mod native;
#[cfg(not(target_arch = "wasm32"))]
pub use native::{NativeConnection, NativeRuntime};

#[cfg(any(test, feature = "loopback"))]
mod loopback;
#[cfg(any(test, feature = "loopback"))]
pub use loopback::{LoopbackConnection, LoopbackRuntime};
