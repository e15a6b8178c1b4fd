//! Feature registry
//!
//! Every feature is registered here under its directory key. The key also
//! locates the feature's history fixtures under the fixtures root.

pub mod activity_basic_no_workflow_timeout;
pub mod activity_worker_restart;
pub mod grpc_retry_server_unavailable_for_initiator;
pub mod update_non_durable_reject;

use std::sync::OnceLock;

use crate::harness::{FeatureConstructor, PreparedFeature};

/// All registered features, by directory key
static FEATURES: &[(&str, FeatureConstructor)] = &[
    (
        activity_basic_no_workflow_timeout::DIR,
        activity_basic_no_workflow_timeout::new,
    ),
    (activity_worker_restart::DIR, activity_worker_restart::new),
    (
        grpc_retry_server_unavailable_for_initiator::DIR,
        grpc_retry_server_unavailable_for_initiator::new,
    ),
    (update_non_durable_reject::DIR, update_non_durable_reject::new),
];

/// Get all registered features, prepared once per process
pub fn all() -> &'static [PreparedFeature] {
    static PREPARED: OnceLock<Vec<PreparedFeature>> = OnceLock::new();
    PREPARED.get_or_init(|| {
        FEATURES
            .iter()
            .map(|&(dir, constructor)| PreparedFeature::new(dir, constructor))
            .collect()
    })
}

/// Get a feature by directory key
pub fn find(dir: &str) -> Option<&'static PreparedFeature> {
    all().iter().find(|f| f.dir == dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_keys_are_unique() {
        let keys: HashSet<&str> = all().iter().map(|f| f.dir).collect();
        assert_eq!(keys.len(), all().len());
    }

    #[test]
    fn test_every_feature_has_one_workflow() {
        for feature in all() {
            assert_eq!(
                feature.workflow_methods.len(),
                1,
                "{} should declare one workflow",
                feature.dir
            );
        }
    }

    #[test]
    fn test_find() {
        assert!(find("activity/worker_restart").is_some());
        assert!(find("activity/missing").is_none());
        // Keys are whole directories, not prefixes
        assert!(find("activity").is_none());
    }
}
