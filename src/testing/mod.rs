//! In-process stand-ins for the server, the SDK and the proxy
//!
//! Used by the test suites and by the `loopback` server target of the CLI,
//! so every feature can be exercised without a running cluster.

mod loopback;
mod proxy;

pub use loopback::{LoopbackSdk, LoopbackServer, LoopbackWorker, RecordedCall, UpdateSupport};
pub use proxy::{LoopbackProxy, ReceivedCommand};
