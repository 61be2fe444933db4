// 🧩 Bill Service - the operations the outer layers (CLI, HTTP) call
//
// Wires one store and one recognizer into the lifecycle and the
// confirmation coordinator. Takes plain ids and data, returns models or
// `Error`; nothing here knows about transport.

use std::sync::Arc;
use tracing::info;

use crate::cancel::Cancellation;
use crate::confirmation::ConfirmationCoordinator;
use crate::error::{Error, Result};
use crate::lifecycle::BillLifecycle;
use crate::models::{Bill, Event, Expense};
use crate::recognition::Recognizer;
use crate::store::{AtomicOutcome, DocumentStore};

/// Largest receipt image accepted by `upload_bill`
pub const MAX_UPLOAD_BYTES: usize = 10 << 20;

pub struct BillService {
    store: Arc<dyn DocumentStore>,
    lifecycle: BillLifecycle,
    coordinator: ConfirmationCoordinator,
}

impl BillService {
    pub fn new(store: Arc<dyn DocumentStore>, recognizer: Arc<dyn Recognizer>) -> Self {
        BillService {
            lifecycle: BillLifecycle::new(store.clone(), recognizer),
            coordinator: ConfirmationCoordinator::new(store.clone()),
            store,
        }
    }

    pub fn create_bill(&self, file_name: &str, file_type: &str) -> Result<Bill> {
        self.lifecycle.create(file_name, file_type)
    }

    pub fn process_bill(&self, bill_id: &str, image: &[u8], cancel: &Cancellation) -> Result<Bill> {
        self.lifecycle.process(bill_id, image, cancel)
    }

    /// Create + process in one call. Rejects empty uploads before any write.
    pub fn upload_bill(
        &self,
        file_name: &str,
        file_type: &str,
        image: &[u8],
        cancel: &Cancellation,
    ) -> Result<Bill> {
        if file_name.trim().is_empty() {
            return Err(Error::Input("missing file name".to_string()));
        }
        if image.is_empty() {
            return Err(Error::Input(format!("file {} is empty", file_name)));
        }
        if image.len() > MAX_UPLOAD_BYTES {
            return Err(Error::Input(format!(
                "file {} is {} bytes, the limit is {}",
                file_name,
                image.len(),
                MAX_UPLOAD_BYTES
            )));
        }

        let bill = self.lifecycle.create(file_name, file_type)?;
        let processed = self.lifecycle.process(&bill.id, image, cancel)?;

        info!(
            bill_id = %processed.id,
            items = processed.generated_expenses.len(),
            "Bill ready for review"
        );
        Ok(processed)
    }

    pub fn get_bill(&self, bill_id: &str) -> Result<Bill> {
        self.lifecycle.get(bill_id)
    }

    pub fn update_staged_item(
        &self,
        bill_id: &str,
        expense_id: &str,
        updated: Expense,
        cancel: &Cancellation,
    ) -> Result<Bill> {
        self.lifecycle.update_staged_item(bill_id, expense_id, updated, cancel)
    }

    pub fn confirm_expenses(
        &self,
        bill_id: &str,
        expenses: Vec<Expense>,
        cancel: &Cancellation,
    ) -> Result<AtomicOutcome> {
        self.coordinator.confirm(bill_id, expenses, cancel)
    }

    /// Ledger entries committed from this bill, NotFound for unknown bills
    pub fn ledger_for_bill(&self, bill_id: &str) -> Result<Vec<Expense>> {
        self.store.find_bill(bill_id)?;
        Ok(self.store.expenses_for_bill(bill_id)?)
    }

    /// Audit trail of a bill, oldest first
    pub fn bill_history(&self, bill_id: &str) -> Result<Vec<Event>> {
        self.store.find_bill(bill_id)?;
        Ok(self.store.events_for_bill(bill_id)?)
    }
}
