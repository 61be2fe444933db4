// ✅ Confirmation Coordinator - staged items → ledger, all or nothing
//
// One atomic unit per bill: status guard, ledger insert, bill update, audit
// event. The guard only admits a Processed bill, so of two concurrent
// confirmations the second sees Confirmed and fails with a conflict.

use std::sync::Arc;
use tracing::{info, warn};

use crate::cancel::Cancellation;
use crate::error::{Error, Result};
use crate::models::{BillStatus, Event, Expense};
use crate::store::{AtomicOutcome, BillFields, DocumentStore, StoreOp};

pub struct ConfirmationCoordinator {
    store: Arc<dyn DocumentStore>,
}

impl ConfirmationCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        ConfirmationCoordinator { store }
    }

    /// Commit `expenses` to the ledger and close the bill
    pub fn confirm(&self, bill_id: &str, mut expenses: Vec<Expense>, cancel: &Cancellation) -> Result<AtomicOutcome> {
        validate_categories(&expenses)?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        for expense in expenses.iter_mut() {
            expense.ensure_id();
        }

        let event = Event::new(
            "bill_confirmed",
            bill_id,
            serde_json::json!({
                "items": expenses.len(),
                "amount": expenses.iter().map(|e| e.amount).sum::<f64>(),
            }),
        );

        let ops = [
            StoreOp::ExpectStatus {
                bill_id: bill_id.to_string(),
                allowed: vec![BillStatus::Processed],
            },
            StoreOp::InsertExpenses {
                bill_id: Some(bill_id.to_string()),
                expenses: expenses.clone(),
            },
            StoreOp::UpdateBill {
                bill_id: bill_id.to_string(),
                fields: BillFields::status(BillStatus::Confirmed).with_expenses(expenses),
            },
            StoreOp::AppendEvent(event),
        ];

        match self.store.run_atomic(&ops, cancel) {
            Ok(outcome) => {
                info!(bill_id, items = outcome.expenses_inserted, "Expenses confirmed");
                Ok(outcome)
            }
            Err(err) => {
                warn!(bill_id, error = %err, "Confirmation rolled back");
                Err(err.into())
            }
        }
    }
}

/// Every item needs a category; the first one missing aborts
fn validate_categories(expenses: &[Expense]) -> Result<()> {
    match expenses.iter().position(|e| !e.has_category()) {
        Some(index) => Err(Error::Validation(format!(
            "expense {} is missing a category",
            index + 1
        ))),
        None => Ok(()),
    }
}
