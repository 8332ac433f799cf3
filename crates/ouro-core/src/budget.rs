use crate::store::{StateStore, StoreError};
use crate::types::UsageReport;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdmissionError {
    #[error("budget exhausted: spent ${spent:.2} of ${ceiling:.2}")]
    BudgetExhausted { spent: f64, ceiling: f64 },
}

/// Cumulative spend against a ceiling fixed at construction. Spend lives in
/// the state document, so it survives restarts.
#[derive(Debug, Clone)]
pub struct BudgetLedger {
    ceiling: f64,
    store: StateStore,
}

impl BudgetLedger {
    pub fn new(ceiling: f64, store: StateStore) -> Self {
        Self { ceiling, store }
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }

    pub fn spent(&self) -> f64 {
        self.store.load().spent_usd
    }

    pub fn remaining(&self) -> f64 {
        self.ceiling - self.spent()
    }

    /// Adds the report's cost to total spend. Negative or non-finite costs
    /// are dropped so spend never decreases. Returns the new total.
    pub fn update_from_usage(&self, report: &UsageReport) -> Result<f64, StoreError> {
        let cost = report.cost_usd;
        if !cost.is_finite() || cost < 0.0 {
            tracing::warn!(cost, "ignoring invalid usage cost");
            return Ok(self.spent());
        }
        let doc = self.store.update(|doc| {
            doc.spent_usd += cost;
            doc.spent_calls += 1;
        })?;
        tracing::debug!(cost, spent = doc.spent_usd, "usage recorded");
        Ok(doc.spent_usd)
    }

    pub fn check_admission(&self) -> Result<(), AdmissionError> {
        let spent = self.spent();
        if self.ceiling - spent <= 0.0 {
            return Err(AdmissionError::BudgetExhausted {
                spent,
                ceiling: self.ceiling,
            });
        }
        Ok(())
    }

    /// One-line summary used in status output and message footers.
    pub fn summary(&self) -> String {
        let spent = self.spent();
        format!(
            "budget: ${spent:.2} spent / ${:.2} total, ${:.2} left",
            self.ceiling,
            (self.ceiling - spent).max(0.0)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriveLayout;

    fn ledger(ceiling: f64) -> (tempfile::TempDir, BudgetLedger) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(DriveLayout::new(dir.path()));
        (dir, BudgetLedger::new(ceiling, store))
    }

    fn usage(cost: f64) -> UsageReport {
        UsageReport {
            cost_usd: cost,
            ..UsageReport::default()
        }
    }

    #[test]
    fn remaining_is_ceiling_minus_reported_costs() {
        let (_dir, ledger) = ledger(10.0);
        for cost in [1.5, 2.0, 0.5] {
            ledger.update_from_usage(&usage(cost)).expect("update");
        }
        assert!((ledger.remaining() - 6.0).abs() < 1e-9);
        assert!(ledger.check_admission().is_ok());
    }

    #[test]
    fn admission_refused_once_remaining_hits_zero() {
        let (_dir, ledger) = ledger(2.0);
        ledger.update_from_usage(&usage(2.0)).expect("update");
        let err = ledger.check_admission().expect_err("exhausted");
        assert!(matches!(err, AdmissionError::BudgetExhausted { .. }));
        assert!(err.to_string().contains("budget exhausted"));
    }

    #[test]
    fn invalid_costs_never_decrease_spend() {
        let (_dir, ledger) = ledger(5.0);
        ledger.update_from_usage(&usage(1.0)).expect("update");
        ledger.update_from_usage(&usage(-3.0)).expect("negative");
        ledger.update_from_usage(&usage(f64::NAN)).expect("nan");
        ledger
            .update_from_usage(&usage(f64::INFINITY))
            .expect("infinite");
        assert_eq!(ledger.spent(), 1.0);
        assert_eq!(ledger.store.load().spent_calls, 1);
    }

    #[test]
    fn zero_ceiling_admits_nothing() {
        let (_dir, ledger) = ledger(0.0);
        assert!(ledger.check_admission().is_err());
        assert!(ledger.summary().contains("$0.00 left"));
    }
}
