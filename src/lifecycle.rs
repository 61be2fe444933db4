// 🔄 Bill Lifecycle - staging record state machine
//
//   Uploaded ──recognize+classify──▶ Processed ──confirm──▶ Confirmed
//      │                                 ▲
//      └──recognition failure──▶ Error ──┘ (re-process overwrites)
//
// Confirmed is terminal: nothing here moves a bill out of it.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cancel::Cancellation;
use crate::classifier::{classify, Classification};
use crate::error::{Error, Result};
use crate::models::{AnalysisResult, Bill, BillStatus, Event, Expense};
use crate::recognition::{RecognitionError, Recognizer};
use crate::store::{BillFields, DocumentStore, StoreOp};

/// Statuses a bill may be (re-)processed from
const PROCESSABLE: [BillStatus; 3] = [BillStatus::Uploaded, BillStatus::Processed, BillStatus::Error];

pub struct BillLifecycle {
    store: Arc<dyn DocumentStore>,
    recognizer: Arc<dyn Recognizer>,
}

impl BillLifecycle {
    pub fn new(store: Arc<dyn DocumentStore>, recognizer: Arc<dyn Recognizer>) -> Self {
        BillLifecycle { store, recognizer }
    }

    /// Create a staging record in the Uploaded state
    pub fn create(&self, file_name: &str, file_type: &str) -> Result<Bill> {
        let bill = Bill::new(file_name, file_type);
        self.store.create_bill(&bill)?;

        info!(bill_id = %bill.id, file_name, "Bill uploaded");
        Ok(bill)
    }

    /// Recognize, classify and stage the items of a bill
    ///
    /// Recognition failures mark the bill Error before they are returned.
    /// Cancellation leaves the bill untouched.
    pub fn process(&self, bill_id: &str, image: &[u8], cancel: &Cancellation) -> Result<Bill> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let bill = self.store.find_bill(bill_id)?;
        if bill.status.is_terminal() {
            return Err(Error::Validation(format!(
                "bill {} is {} and cannot be processed again",
                bill_id, bill.status
            )));
        }

        info!(bill_id, recognizer = self.recognizer.name(), "Processing bill");

        let text = match self.recognizer.recognize(image, cancel) {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => return Err(self.record_failure(&bill, RecognitionError::NoTextDetected)),
            Err(_) if cancel.is_cancelled() => return Err(Error::Cancelled),
            Err(RecognitionError::Cancelled) => return Err(Error::Cancelled),
            Err(err) => return Err(self.record_failure(&bill, err)),
        };
        debug!(bill_id, text = %text, "Recognized text");

        let classification = classify(&text);
        info!(
            bill_id,
            items = classification.items.len(),
            total = classification.declared_total,
            "Classified receipt"
        );

        let fields = processed_fields(&bill, text, &classification);
        let event = Event::new(
            "bill_processed",
            bill_id,
            serde_json::json!({
                "items": classification.items.len(),
                "total": classification.declared_total,
            }),
        );

        self.store.run_atomic(
            &[
                StoreOp::ExpectStatus {
                    bill_id: bill_id.to_string(),
                    allowed: PROCESSABLE.to_vec(),
                },
                StoreOp::UpdateBill {
                    bill_id: bill_id.to_string(),
                    fields,
                },
                StoreOp::AppendEvent(event),
            ],
            cancel,
        )?;

        Ok(self.store.find_bill(bill_id)?)
    }

    pub fn get(&self, bill_id: &str) -> Result<Bill> {
        Ok(self.store.find_bill(bill_id)?)
    }

    /// Replace one staged item in place; its identity is kept
    pub fn update_staged_item(
        &self,
        bill_id: &str,
        expense_id: &str,
        updated: Expense,
        cancel: &Cancellation,
    ) -> Result<Bill> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let bill = self.store.find_bill(bill_id)?;
        if bill.status != BillStatus::Processed {
            return Err(Error::Validation(format!(
                "bill {} is {}, staged items can only change while processed",
                bill_id, bill.status
            )));
        }

        if bill.staged_item(expense_id).is_none() {
            return Err(Error::NotFound(format!("expense {} in bill {}", expense_id, bill_id)));
        }

        let event = Event::new(
            "bill_item_updated",
            bill_id,
            serde_json::json!({ "expense_id": expense_id }),
        );

        // located by id again inside the unit
        self.store.run_atomic(
            &[
                StoreOp::ExpectStatus {
                    bill_id: bill_id.to_string(),
                    allowed: vec![BillStatus::Processed],
                },
                StoreOp::ReplaceStagedItem {
                    bill_id: bill_id.to_string(),
                    expense_id: expense_id.to_string(),
                    expense: updated,
                },
                StoreOp::AppendEvent(event),
            ],
            cancel,
        )?;

        debug!(bill_id, expense_id, "Staged item updated");
        Ok(self.store.find_bill(bill_id)?)
    }

    /// Record a recognition failure and hand back the error
    ///
    /// A Processed bill keeps its status and staged items and only gains the
    /// message; anything earlier moves to Error. A failed write is logged,
    /// the caller still sees the recognition error.
    fn record_failure(&self, bill: &Bill, err: RecognitionError) -> Error {
        warn!(bill_id = %bill.id, error = %err, "Recognition failed");

        let (allowed, fields) = if bill.status == BillStatus::Processed {
            (
                vec![BillStatus::Processed],
                BillFields {
                    error_message: Some(Some(err.to_string())),
                    ..Default::default()
                },
            )
        } else {
            (
                vec![BillStatus::Uploaded, BillStatus::Error],
                BillFields {
                    status: Some(BillStatus::Error),
                    error_message: Some(Some(err.to_string())),
                    ..Default::default()
                },
            )
        };
        let event = Event::new(
            "bill_failed",
            &bill.id,
            serde_json::json!({ "reason": err.to_string(), "status": bill.status }),
        );

        let written = self.store.run_atomic(
            &[
                StoreOp::ExpectStatus {
                    bill_id: bill.id.clone(),
                    allowed,
                },
                StoreOp::UpdateBill {
                    bill_id: bill.id.clone(),
                    fields,
                },
                StoreOp::AppendEvent(event),
            ],
            &Cancellation::new(),
        );
        if let Err(store_err) = written {
            warn!(bill_id = %bill.id, error = %store_err, "Could not record recognition failure");
        }

        err.into()
    }
}

/// Field set for a successful processing attempt
fn processed_fields(bill: &Bill, text: String, classification: &Classification) -> BillFields {
    // never earlier than the upload
    let now = Utc::now().max(bill.upload_date);

    let expenses = classification
        .items
        .iter()
        .map(|item| Expense::new(item.name.clone(), item.price, now))
        .collect();

    BillFields {
        status: Some(BillStatus::Processed),
        processed_date: Some(now),
        analysis_results: Some(AnalysisResult {
            extracted_text: text,
            total: classification.declared_total,
        }),
        generated_expenses: Some(expenses),
        error_message: Some(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::recognition::FixedTextRecognizer;

    struct FailingRecognizer;

    impl Recognizer for FailingRecognizer {
        fn recognize(&self, _image: &[u8], _cancel: &Cancellation) -> std::result::Result<String, RecognitionError> {
            Err(RecognitionError::ServiceUnavailable("quota exceeded".to_string()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    /// Cancels the caller mid-call, then fails like a dropped connection
    struct AbandonedRecognizer;

    impl Recognizer for AbandonedRecognizer {
        fn recognize(&self, _image: &[u8], cancel: &Cancellation) -> std::result::Result<String, RecognitionError> {
            cancel.cancel();
            Err(RecognitionError::ServiceUnavailable("connection reset".to_string()))
        }

        fn name(&self) -> &str {
            "abandoned"
        }
    }

    /// Commits a competing unit right before the next unit it is given
    struct RacingStore {
        inner: Arc<SqliteStore>,
        competing: std::sync::Mutex<Option<Vec<StoreOp>>>,
    }

    impl DocumentStore for RacingStore {
        fn create_bill(&self, bill: &Bill) -> std::result::Result<(), crate::store::StoreError> {
            self.inner.create_bill(bill)
        }

        fn find_bill(&self, bill_id: &str) -> std::result::Result<Bill, crate::store::StoreError> {
            self.inner.find_bill(bill_id)
        }

        fn update_bill(&self, bill_id: &str, fields: &BillFields) -> std::result::Result<(), crate::store::StoreError> {
            self.inner.update_bill(bill_id, fields)
        }

        fn insert_expenses(
            &self,
            bill_id: Option<&str>,
            expenses: &[Expense],
        ) -> std::result::Result<usize, crate::store::StoreError> {
            self.inner.insert_expenses(bill_id, expenses)
        }

        fn run_atomic(
            &self,
            ops: &[StoreOp],
            cancel: &Cancellation,
        ) -> std::result::Result<crate::store::AtomicOutcome, crate::store::StoreError> {
            if let Some(competing) = self.competing.lock().unwrap().take() {
                self.inner.run_atomic(&competing, cancel)?;
            }
            self.inner.run_atomic(ops, cancel)
        }

        fn expenses_for_bill(&self, bill_id: &str) -> std::result::Result<Vec<Expense>, crate::store::StoreError> {
            self.inner.expenses_for_bill(bill_id)
        }

        fn count_expenses(&self) -> std::result::Result<i64, crate::store::StoreError> {
            self.inner.count_expenses()
        }

        fn events_for_bill(&self, bill_id: &str) -> std::result::Result<Vec<Event>, crate::store::StoreError> {
            self.inner.events_for_bill(bill_id)
        }
    }

    fn lifecycle_with(recognizer: Arc<dyn Recognizer>) -> BillLifecycle {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        BillLifecycle::new(store, recognizer)
    }

    fn receipt_lifecycle() -> BillLifecycle {
        lifecycle_with(Arc::new(FixedTextRecognizer::new("Milk\n2.50\nBread\n3.20\n5.70")))
    }

    #[test]
    fn test_create_starts_uploaded() {
        let lifecycle = receipt_lifecycle();
        let bill = lifecycle.create("receipt.jpg", "image/jpeg").unwrap();

        let stored = lifecycle.get(&bill.id).unwrap();
        assert_eq!(stored.status, BillStatus::Uploaded);
        assert!(stored.generated_expenses.is_empty());
        assert!(stored.processed_date.is_none());
    }

    #[test]
    fn test_process_stages_items() {
        let lifecycle = receipt_lifecycle();
        let bill = lifecycle.create("receipt.jpg", "image/jpeg").unwrap();

        let processed = lifecycle.process(&bill.id, b"image", &Cancellation::new()).unwrap();

        assert_eq!(processed.status, BillStatus::Processed);
        assert!(processed.processed_date.unwrap() >= processed.upload_date);
        assert_eq!(processed.analysis_results.as_ref().unwrap().total, 5.70);

        let staged: Vec<(&str, f64)> = processed
            .generated_expenses
            .iter()
            .map(|e| (e.name.as_str(), e.amount))
            .collect();
        assert_eq!(staged, vec![("Milk", 2.50), ("Bread", 3.20)]);
        assert!(processed.generated_expenses.iter().all(|e| e.id.is_some()));
        assert!(processed.generated_expenses.iter().all(|e| !e.has_category()));
    }

    #[test]
    fn test_recognition_failure_marks_error() {
        let lifecycle = lifecycle_with(Arc::new(FailingRecognizer));
        let bill = lifecycle.create("receipt.jpg", "image/jpeg").unwrap();

        let result = lifecycle.process(&bill.id, b"image", &Cancellation::new());

        assert!(matches!(result, Err(Error::ServiceUnavailable(_))));
        let stored = lifecycle.get(&bill.id).unwrap();
        assert_eq!(stored.status, BillStatus::Error);
        assert!(stored.generated_expenses.is_empty());
        assert!(stored.error_message.unwrap().contains("quota"));
    }

    #[test]
    fn test_no_text_marks_error() {
        let lifecycle = lifecycle_with(Arc::new(FixedTextRecognizer::new("   ")));
        let bill = lifecycle.create("blank.jpg", "image/jpeg").unwrap();

        let result = lifecycle.process(&bill.id, b"image", &Cancellation::new());

        assert!(matches!(result, Err(Error::NoTextDetected)));
        assert_eq!(lifecycle.get(&bill.id).unwrap().status, BillStatus::Error);
    }

    #[test]
    fn test_cancelled_process_leaves_bill_untouched() {
        let lifecycle = receipt_lifecycle();
        let bill = lifecycle.create("receipt.jpg", "image/jpeg").unwrap();
        let cancel = Cancellation::new();
        cancel.cancel();

        let result = lifecycle.process(&bill.id, b"image", &cancel);

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(lifecycle.get(&bill.id).unwrap().status, BillStatus::Uploaded);
    }

    #[test]
    fn test_get_unknown_bill_is_not_found() {
        let lifecycle = receipt_lifecycle();
        assert!(matches!(lifecycle.get("missing"), Err(Error::NotFound(_))));
        assert!(matches!(
            lifecycle.process("missing", b"image", &Cancellation::new()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_update_staged_item() {
        let lifecycle = receipt_lifecycle();
        let bill = lifecycle.create("receipt.jpg", "image/jpeg").unwrap();
        let processed = lifecycle.process(&bill.id, b"image", &Cancellation::new()).unwrap();
        let target = processed.generated_expenses[1].clone();
        let target_id = target.id.clone().unwrap();

        let mut edited = target.clone().with_category("bakery");
        edited.name = "Sourdough".to_string();
        edited.id = None;

        let updated = lifecycle
            .update_staged_item(&bill.id, &target_id, edited, &Cancellation::new())
            .unwrap();

        assert_eq!(updated.status, BillStatus::Processed);
        let item = updated.staged_item(&target_id).unwrap();
        assert_eq!(item.name, "Sourdough");
        assert_eq!(item.category_id.as_deref(), Some("bakery"));
        assert_eq!(updated.generated_expenses[0], processed.generated_expenses[0]);
    }

    #[test]
    fn test_update_unknown_staged_item_is_not_found() {
        let lifecycle = receipt_lifecycle();
        let bill = lifecycle.create("receipt.jpg", "image/jpeg").unwrap();
        lifecycle.process(&bill.id, b"image", &Cancellation::new()).unwrap();

        let item = Expense::new("Milk", 1.0, Utc::now());
        let result = lifecycle.update_staged_item(&bill.id, "no-such-item", item.clone(), &Cancellation::new());
        assert!(matches!(result, Err(Error::NotFound(_))));

        let result = lifecycle.update_staged_item("no-such-bill", "x", item, &Cancellation::new());
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_reprocess_overwrites_analysis() {
        let lifecycle = receipt_lifecycle();
        let bill = lifecycle.create("receipt.jpg", "image/jpeg").unwrap();
        let first = lifecycle.process(&bill.id, b"image", &Cancellation::new()).unwrap();
        let second = lifecycle.process(&bill.id, b"image", &Cancellation::new()).unwrap();

        assert_eq!(second.generated_expenses.len(), 2);
        assert_ne!(first.generated_expenses[0].id, second.generated_expenses[0].id);
    }

    #[test]
    fn test_edits_to_different_items_both_survive() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let recognizer = Arc::new(FixedTextRecognizer::new("Milk\n2.50\nBread\n3.20\n5.70"));
        let lifecycle = BillLifecycle::new(store.clone(), recognizer.clone());
        let bill = lifecycle.create("receipt.jpg", "image/jpeg").unwrap();
        let processed = lifecycle.process(&bill.id, b"image", &Cancellation::new()).unwrap();
        let milk = processed.generated_expenses[0].clone();
        let bread = processed.generated_expenses[1].clone();

        // another client categorizes Milk after this one has read the bill
        let racing = Arc::new(RacingStore {
            inner: store.clone(),
            competing: std::sync::Mutex::new(Some(vec![StoreOp::ReplaceStagedItem {
                bill_id: bill.id.clone(),
                expense_id: milk.id.clone().unwrap(),
                expense: milk.clone().with_category("dairy"),
            }])),
        });
        let racing_lifecycle = BillLifecycle::new(racing, recognizer);

        let bread_id = bread.id.clone().unwrap();
        racing_lifecycle
            .update_staged_item(&bill.id, &bread_id, bread.with_category("bakery"), &Cancellation::new())
            .unwrap();

        let stored = store.find_bill(&bill.id).unwrap();
        assert_eq!(stored.generated_expenses[0].category_id.as_deref(), Some("dairy"));
        assert_eq!(stored.generated_expenses[1].category_id.as_deref(), Some("bakery"));
    }

    #[test]
    fn test_failed_reprocess_keeps_processed_bill() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let working = BillLifecycle::new(
            store.clone(),
            Arc::new(FixedTextRecognizer::new("Milk\n2.50\nBread\n3.20\n5.70")),
        );
        let failing = BillLifecycle::new(store.clone(), Arc::new(FailingRecognizer));

        let bill = working.create("receipt.jpg", "image/jpeg").unwrap();
        let processed = working.process(&bill.id, b"image", &Cancellation::new()).unwrap();

        let result = failing.process(&bill.id, b"image", &Cancellation::new());
        assert!(matches!(result, Err(Error::ServiceUnavailable(_))));

        let stored = store.find_bill(&bill.id).unwrap();
        assert_eq!(stored.status, BillStatus::Processed);
        assert_eq!(stored.generated_expenses, processed.generated_expenses);
        assert_eq!(stored.analysis_results, processed.analysis_results);
        assert!(stored.error_message.unwrap().contains("quota"));

        let history: Vec<String> = store
            .events_for_bill(&bill.id)
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(history, vec!["bill_processed", "bill_failed"]);

        // a later successful run clears the message
        let again = working.process(&bill.id, b"image", &Cancellation::new()).unwrap();
        assert_eq!(again.error_message, None);
    }

    #[test]
    fn test_failure_after_cancel_reports_cancelled() {
        let lifecycle = lifecycle_with(Arc::new(AbandonedRecognizer));
        let bill = lifecycle.create("receipt.jpg", "image/jpeg").unwrap();

        let result = lifecycle.process(&bill.id, b"image", &Cancellation::new());

        assert!(matches!(result, Err(Error::Cancelled)));
        let stored = lifecycle.get(&bill.id).unwrap();
        assert_eq!(stored.status, BillStatus::Uploaded);
        assert_eq!(stored.error_message, None);
    }
}
