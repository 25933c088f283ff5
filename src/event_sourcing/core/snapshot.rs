use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::{StoreError, StoreResult};
use super::aggregate::AggregateIdentifier;
use super::event::to_payload;

// ============================================================================
// Snapshots
// ============================================================================
//
// A snapshot caches aggregate state as of a revision. Several may exist per
// aggregate; reads only care about the highest one. Replay never depends on
// a snapshot being present.
//
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub aggregate_identifier: AggregateIdentifier,
    pub revision: i64,
    pub state: Value,
}

impl Snapshot {
    pub fn new<S: Serialize>(
        aggregate_identifier: AggregateIdentifier,
        revision: i64,
        state: &S,
    ) -> StoreResult<Self> {
        if revision < 1 {
            return Err(StoreError::parameter(format!(
                "snapshot revision must be at least 1, got {revision}"
            )));
        }

        Ok(Self {
            aggregate_identifier,
            revision,
            state: to_payload(state)?,
        })
    }
}

/// Decides whether a replay was expensive enough to be worth a snapshot.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum SnapshotStrategy {
    /// Snapshot as soon as either limit is reached
    Lowest {
        #[serde(deserialize_with = "crate::utils::lenient::number")]
        revision_limit: i64,
        #[serde(with = "crate::utils::retry::duration_ms")]
        duration_limit: Duration,
    },
    Revision {
        #[serde(deserialize_with = "crate::utils::lenient::number")]
        revision_limit: i64,
    },
    Duration {
        #[serde(with = "crate::utils::retry::duration_ms")]
        duration_limit: Duration,
    },
    Always,
    Never,
}

impl Default for SnapshotStrategy {
    fn default() -> Self {
        SnapshotStrategy::Lowest {
            revision_limit: 100,
            duration_limit: Duration::from_millis(500),
        }
    }
}

impl SnapshotStrategy {
    /// `replayed_events` is the number of events applied on top of the last
    /// snapshot (or from scratch), `replay_duration` the time that took.
    pub fn should_snapshot(&self, replayed_events: i64, replay_duration: Duration) -> bool {
        match self {
            SnapshotStrategy::Lowest {
                revision_limit,
                duration_limit,
            } => replayed_events >= *revision_limit || replay_duration >= *duration_limit,
            SnapshotStrategy::Revision { revision_limit } => replayed_events >= *revision_limit,
            SnapshotStrategy::Duration { duration_limit } => replay_duration >= *duration_limit,
            SnapshotStrategy::Always => true,
            SnapshotStrategy::Never => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_lowest_triggers_on_either_limit() {
        let strategy = SnapshotStrategy::Lowest {
            revision_limit: 10,
            duration_limit: Duration::from_millis(100),
        };

        assert!(strategy.should_snapshot(10, Duration::from_millis(1)));
        assert!(strategy.should_snapshot(1, Duration::from_millis(100)));
        assert!(!strategy.should_snapshot(9, Duration::from_millis(99)));
    }

    #[test]
    fn test_fixed_strategies() {
        assert!(SnapshotStrategy::Always.should_snapshot(0, Duration::ZERO));
        assert!(!SnapshotStrategy::Never.should_snapshot(1_000, Duration::from_secs(60)));
        assert!(SnapshotStrategy::Revision { revision_limit: 5 }.should_snapshot(5, Duration::ZERO));
    }

    #[test]
    fn test_strategy_from_config_shape() {
        let strategy: SnapshotStrategy = serde_json::from_value(serde_json::json!({
            "name": "duration",
            "duration_limit": 250
        }))
        .unwrap();

        assert_eq!(
            strategy,
            SnapshotStrategy::Duration {
                duration_limit: Duration::from_millis(250)
            }
        );
    }

    #[test]
    fn test_snapshot_creation() {
        let identifier = AggregateIdentifier::new("sales", "order", Uuid::new_v4());
        let snapshot = Snapshot::new(identifier, 7, &serde_json::json!({ "total": 3 })).unwrap();

        assert_eq!(snapshot.revision, 7);
        assert_eq!(snapshot.state["total"], 3);
    }

    #[test]
    fn test_snapshot_rejects_revision_below_one() {
        let identifier = AggregateIdentifier::new("sales", "order", Uuid::new_v4());

        for revision in [0, -3] {
            let result = Snapshot::new(identifier.clone(), revision, &serde_json::json!({}));
            assert!(matches!(result, Err(StoreError::ParameterInvalid(_))));
        }
    }
}
