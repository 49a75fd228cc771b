//! Per-arm observation counts fed into the statistical engine

use serde::{Deserialize, Serialize};

/// Aggregated observations for one arm of an experiment
///
/// Invariant: `conversions <= visitors`. The engine validates this at entry
/// points that sample posteriors; rate helpers simply return 0.0 for empty
/// arms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArmObservations {
    /// Unique visitors observed
    pub visitors: u64,
    /// Conversions observed
    pub conversions: u64,
    /// Revenue attributed to this arm
    pub revenue: f64,
}

impl ArmObservations {
    pub fn new(visitors: u64, conversions: u64, revenue: f64) -> Self {
        Self {
            visitors,
            conversions,
            revenue,
        }
    }

    /// Observed conversion rate, 0.0 when the arm has no traffic
    pub fn conversion_rate(&self) -> f64 {
        if self.visitors > 0 {
            self.conversions as f64 / self.visitors as f64
        } else {
            0.0
        }
    }

    /// Revenue per visitor, 0.0 when the arm has no traffic
    pub fn revenue_per_visitor(&self) -> f64 {
        if self.visitors > 0 {
            self.revenue / self.visitors as f64
        } else {
            0.0
        }
    }

    /// Average order value, 0.0 when the arm has no conversions
    pub fn average_order_value(&self) -> f64 {
        if self.conversions > 0 {
            self.revenue / self.conversions as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates() {
        let arm = ArmObservations::new(200, 50, 1000.0);
        assert_eq!(arm.conversion_rate(), 0.25);
        assert_eq!(arm.revenue_per_visitor(), 5.0);
        assert_eq!(arm.average_order_value(), 20.0);
    }

    #[test]
    fn test_empty_arm() {
        let arm = ArmObservations::new(0, 0, 0.0);
        assert_eq!(arm.conversion_rate(), 0.0);
        assert_eq!(arm.revenue_per_visitor(), 0.0);
        assert_eq!(arm.average_order_value(), 0.0);
    }
}
