//! Hypothesis queue types
//!
//! Queue items are produced by queue replenishment and consumed exactly once
//! when promoted to an experiment. The `HypothesisCandidate` boundary type
//! holds the unvalidated output of the hypothesis source; fields are clamped
//! and validated when converting to a queue item.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::{OptimizerError, Result};
use crate::experiments::ChangeType;

/// Lowest accepted candidate priority
pub const MIN_PRIORITY: i32 = 1;

/// Highest accepted candidate priority
pub const MAX_PRIORITY: i32 = 10;

/// Where a queue item came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueSource {
    Ai,
    Manual,
}

/// Unvalidated candidate returned by the hypothesis source
///
/// The change type and priority are free-form at this boundary; a language
/// model produced them, so nothing about their shape is trusted until
/// `ExperimentQueueItem::from_candidate` has validated them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypothesisCandidate {
    pub hypothesis: String,
    pub change_type: String,
    pub variant_prompt: String,
    pub variant_description: String,
    pub priority: i32,
}

/// A queued experiment hypothesis awaiting promotion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentQueueItem {
    pub id: Uuid,
    pub restaurant_id: String,
    pub hypothesis: String,
    pub change_type: ChangeType,
    pub variant_prompt: String,
    pub variant_description: String,
    /// Higher priority is dequeued sooner
    pub priority: i32,
    pub source: QueueSource,
    pub created_at: DateTime<Utc>,
}

impl ExperimentQueueItem {
    /// Validate a candidate and convert it into a queue item
    ///
    /// Rejects empty hypotheses and unknown change types; clamps priority
    /// into the accepted range rather than rejecting it.
    pub fn from_candidate(
        restaurant_id: impl Into<String>,
        candidate: HypothesisCandidate,
        source: QueueSource,
    ) -> Result<Self> {
        let hypothesis = candidate.hypothesis.trim().to_string();
        if hypothesis.is_empty() {
            return Err(OptimizerError::Validation(
                "candidate hypothesis is empty".to_string(),
            ));
        }

        let change_type = ChangeType::from_str(&candidate.change_type)?;

        Ok(Self {
            id: Uuid::new_v4(),
            restaurant_id: restaurant_id.into(),
            hypothesis,
            change_type,
            variant_prompt: candidate.variant_prompt,
            variant_description: candidate.variant_description,
            priority: candidate.priority.clamp(MIN_PRIORITY, MAX_PRIORITY),
            source,
            created_at: Utc::now(),
        })
    }

    /// Queue ordering: priority descending, then created_at ascending
    pub fn queue_ordering(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.created_at.cmp(&other.created_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(hypothesis: &str, change_type: &str, priority: i32) -> HypothesisCandidate {
        HypothesisCandidate {
            hypothesis: hypothesis.to_string(),
            change_type: change_type.to_string(),
            variant_prompt: "make the button red".to_string(),
            variant_description: "red button".to_string(),
            priority,
        }
    }

    #[test]
    fn test_from_candidate_valid() {
        let item = ExperimentQueueItem::from_candidate(
            "r1",
            candidate("bigger CTA converts better", "cta", 7),
            QueueSource::Ai,
        )
        .unwrap();

        assert_eq!(item.change_type, ChangeType::Cta);
        assert_eq!(item.priority, 7);
        assert_eq!(item.source, QueueSource::Ai);
    }

    #[test]
    fn test_from_candidate_clamps_priority() {
        let item = ExperimentQueueItem::from_candidate(
            "r1",
            candidate("h", "hero", 99),
            QueueSource::Ai,
        )
        .unwrap();
        assert_eq!(item.priority, MAX_PRIORITY);

        let item = ExperimentQueueItem::from_candidate(
            "r1",
            candidate("h", "hero", -4),
            QueueSource::Ai,
        )
        .unwrap();
        assert_eq!(item.priority, MIN_PRIORITY);
    }

    #[test]
    fn test_from_candidate_rejects_garbage() {
        assert!(ExperimentQueueItem::from_candidate(
            "r1",
            candidate("  ", "cta", 5),
            QueueSource::Ai
        )
        .is_err());

        assert!(ExperimentQueueItem::from_candidate(
            "r1",
            candidate("h", "popup", 5),
            QueueSource::Ai
        )
        .is_err());
    }

    #[test]
    fn test_queue_ordering() {
        let mut low = ExperimentQueueItem::from_candidate(
            "r1",
            candidate("low", "cta", 2),
            QueueSource::Ai,
        )
        .unwrap();
        let mut high = ExperimentQueueItem::from_candidate(
            "r1",
            candidate("high", "cta", 9),
            QueueSource::Ai,
        )
        .unwrap();

        assert_eq!(high.queue_ordering(&low), Ordering::Less);

        // Equal priority: earlier creation wins
        high.priority = 5;
        low.priority = 5;
        low.created_at = high.created_at + chrono::Duration::seconds(10);
        assert_eq!(high.queue_ordering(&low), Ordering::Less);
    }
}
