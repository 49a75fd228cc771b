//! A/B experiment and variant types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::OptimizerError;

/// Category of change a variant applies to the site
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Cta,
    Hero,
    Layout,
    Copy,
    Color,
    Menu,
}

impl FromStr for ChangeType {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cta" => Ok(Self::Cta),
            "hero" => Ok(Self::Hero),
            "layout" => Ok(Self::Layout),
            "copy" => Ok(Self::Copy),
            "color" => Ok(Self::Color),
            "menu" => Ok(Self::Menu),
            other => Err(OptimizerError::Validation(format!(
                "unknown change type: {other}"
            ))),
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cta => "cta",
            Self::Hero => "hero",
            Self::Layout => "layout",
            Self::Copy => "copy",
            Self::Color => "color",
            Self::Menu => "menu",
        };
        f.write_str(s)
    }
}

/// Status of an experiment
///
/// `Paused` is terminal: a paused experiment is reverted, never resumed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Pending,
    Running,
    Paused,
    Concluded,
    Applied,
}

/// A single variant (arm) of an experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    /// Unique variant identifier
    pub id: Uuid,
    /// Parent experiment
    pub experiment_id: Uuid,
    /// Variant name (e.g., "control", "treatment")
    pub name: String,
    /// Whether this is the control arm
    pub is_control: bool,
    /// Human-readable description of the change
    pub change_description: String,
    /// Generation prompt for the published artifact (treatment arms only)
    pub change_prompt: Option<String>,
    /// Unique visitors observed
    pub visitors: u64,
    /// Conversions observed (never exceeds visitors)
    pub conversions: u64,
    /// Revenue attributed to this variant
    pub revenue: f64,
    /// Traffic allocation (0.0-1.0)
    pub traffic_allocation: f64,
}

impl Variant {
    /// Create a new variant with zeroed counters
    pub fn new(
        experiment_id: Uuid,
        name: impl Into<String>,
        is_control: bool,
        change_description: impl Into<String>,
        change_prompt: Option<String>,
        traffic_allocation: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            experiment_id,
            name: name.into(),
            is_control,
            change_description: change_description.into(),
            change_prompt,
            visitors: 0,
            conversions: 0,
            revenue: 0.0,
            traffic_allocation: traffic_allocation.clamp(0.0, 1.0),
        }
    }

    /// Observed conversion rate, 0.0 when no traffic yet
    pub fn conversion_rate(&self) -> f64 {
        if self.visitors > 0 {
            self.conversions as f64 / self.visitors as f64
        } else {
            0.0
        }
    }

    /// Revenue per visitor, 0.0 when no traffic yet
    pub fn revenue_per_visitor(&self) -> f64 {
        if self.visitors > 0 {
            self.revenue / self.visitors as f64
        } else {
            0.0
        }
    }
}

/// A/B experiment against one restaurant's site
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    /// Unique experiment identifier
    pub id: Uuid,
    /// Restaurant this experiment belongs to
    pub restaurant_id: String,
    /// Hypothesis being tested
    pub hypothesis: String,
    /// Category of change
    pub change_type: ChangeType,
    /// Current status
    pub status: ExperimentStatus,
    /// Winning variant, set on conclusion
    pub winning_variant_id: Option<Uuid>,
    /// Why the experiment was paused, if it was
    pub pause_reason: Option<String>,
    /// Historical conversion rate snapshotted at creation
    pub baseline_conversion_rate: f64,
    /// When traffic started flowing
    pub started_at: DateTime<Utc>,
    /// When the experiment ended (concluded, applied, or paused)
    pub ended_at: Option<DateTime<Utc>>,
}

impl Experiment {
    /// Create a new experiment in `Pending` status
    pub fn new(
        restaurant_id: impl Into<String>,
        hypothesis: impl Into<String>,
        change_type: ChangeType,
        baseline_conversion_rate: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            restaurant_id: restaurant_id.into(),
            hypothesis: hypothesis.into(),
            change_type,
            status: ExperimentStatus::Pending,
            winning_variant_id: None,
            pause_reason: None,
            baseline_conversion_rate,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Whether the experiment is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ExperimentStatus::Paused | ExperimentStatus::Concluded | ExperimentStatus::Applied
        )
    }
}
