//! Feature runner
//!
//! Drives one feature at a time against a server: connect, start a worker,
//! execute, check the result, replay the live history and every recorded
//! fixture, then release everything that was opened.

pub mod capability;
pub mod feature;
pub mod history;
pub mod proxy;
pub mod runner;
pub mod summary;
pub mod version;
pub mod worker;

pub use capability::{check_optional_rpc, Capability, OptionalRpc};
pub use feature::{Feature, FeatureConstructor, Latch, Outcome, PreparedFeature, Run};
pub use history::{FixtureFile, FixtureStore, HistoryVerifier, PastHistories};
pub use proxy::{ProxyCommand, ProxyController};
pub use runner::{run_feature, Runner, DEFAULT_EXECUTION_TIMEOUT};
pub use summary::{OutcomeKind, SummaryEntry, SummarySink, SummaryTarget};
pub use version::Version;
pub use worker::WorkerManager;
