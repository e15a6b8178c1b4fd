//! SDK features - a conformance harness for workflow SDKs
//!
//! This library runs features (scripted workflow scenarios) through an SDK
//! against a server, checks their results and replays their histories,
//! including histories recorded by earlier SDK releases.

pub mod cli;
pub mod commands;
pub mod common;
pub mod features;
pub mod harness;
pub mod sdk;
pub mod testing;

// Re-export commonly used types for tests
pub use common::{Config, Error, Result};
pub use harness::{Feature, Outcome, PreparedFeature, Run, Runner};
