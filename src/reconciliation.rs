// 🧾 Invoice Reconciler - Backfill missing invoices
//
// Scans for completed appointments that never got an invoice and creates
// one pending invoice per gap. The central contract is PARTIAL FAILURE
// ISOLATION: one appointment failing to invoice must never abort or roll
// back the rest of the batch. Only the candidate fetch itself is fatal.

use crate::db::{Appointment, Invoice};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// STORAGE SEAM
// ============================================================================

/// Storage interface the reconciler runs against.
///
/// The reconciler never touches a connection directly; it receives a store
/// as a parameter so tests can substitute an in-memory double and the CLI
/// can hand it a `SqliteStore`.
pub trait BillingStore {
    /// All appointments that have no invoice yet. Must be a single atomic
    /// read relative to the reconciler's own writes.
    fn appointments_missing_invoice(&self) -> Result<Vec<Appointment>>;

    /// Create one pending invoice for the given appointment.
    fn create_invoice(&self, appointment: &Appointment) -> Result<Invoice>;
}

// ============================================================================
// BACKFILL REPORT
// ============================================================================

/// One appointment that could not be invoiced during a pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillFailure {
    pub appointment_id: String,
    /// Service name, carried for the follow-up report only
    pub service_name: String,
    pub cause: String,
}

/// Outcome of one reconciliation pass.
///
/// Invariant: `succeeded + failed == found`, and `failed == failures.len()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillReport {
    /// Appointments found without an invoice at the start of the pass
    pub found: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<BackfillFailure>,
    pub reconciled_at: DateTime<Utc>,
}

impl BackfillReport {
    /// True when every candidate got its invoice (including the empty pass).
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "Backfill pass: {} appointments missing an invoice, {} invoiced, {} failed",
            self.found, self.succeeded, self.failed
        )
    }
}

// ============================================================================
// RECONCILER
// ============================================================================

pub struct InvoiceReconciler;

impl InvoiceReconciler {
    pub fn new() -> Self {
        InvoiceReconciler
    }

    /// Run one reconciliation pass.
    ///
    /// Fetches every appointment lacking an invoice, then creates a pending
    /// invoice for each, one at a time, in the order the store returned
    /// them. Per-item failures are captured in the report as data; they are
    /// never propagated and never undo earlier creations. A failed fetch is
    /// the only fatal outcome: it returns `Err` and no report is produced.
    ///
    /// Re-running is idempotent at the appointment level: items invoiced by
    /// an earlier pass no longer show up as missing.
    pub fn reconcile(&self, store: &dyn BillingStore) -> Result<BackfillReport> {
        let candidates = store
            .appointments_missing_invoice()
            .context("failed to fetch appointments missing an invoice")?;

        let mut succeeded = 0;
        let mut failures = Vec::new();

        for appointment in &candidates {
            match store.create_invoice(appointment) {
                Ok(_) => succeeded += 1,
                Err(e) => failures.push(BackfillFailure {
                    appointment_id: appointment.id.clone(),
                    service_name: appointment.service_name.clone(),
                    cause: format!("{:#}", e),
                }),
            }
        }

        Ok(BackfillReport {
            found: candidates.len(),
            succeeded,
            failed: failures.len(),
            failures,
            reconciled_at: Utc::now(),
        })
    }
}

impl Default for InvoiceReconciler {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use chrono::NaiveDate;
    use std::cell::RefCell;
    use std::collections::HashSet;

    /// In-memory store double: appointments minus invoiced ids are the
    /// missing set, and creations for ids in `fail_ids` are rejected.
    struct MemoryStore {
        appointments: Vec<Appointment>,
        invoices: RefCell<Vec<Invoice>>,
        fail_ids: HashSet<String>,
        fail_fetch: bool,
    }

    impl MemoryStore {
        fn new(appointments: Vec<Appointment>) -> Self {
            MemoryStore {
                appointments,
                invoices: RefCell::new(Vec::new()),
                fail_ids: HashSet::new(),
                fail_fetch: false,
            }
        }

        fn failing_on(mut self, appointment_id: &str) -> Self {
            self.fail_ids.insert(appointment_id.to_string());
            self
        }

        fn with_broken_fetch(mut self) -> Self {
            self.fail_fetch = true;
            self
        }
    }

    impl BillingStore for MemoryStore {
        fn appointments_missing_invoice(&self) -> Result<Vec<Appointment>> {
            if self.fail_fetch {
                return Err(anyhow!("database connection lost"));
            }
            let invoiced: HashSet<String> = self
                .invoices
                .borrow()
                .iter()
                .map(|inv| inv.appointment_id.clone())
                .collect();
            Ok(self
                .appointments
                .iter()
                .filter(|a| !invoiced.contains(&a.id))
                .cloned()
                .collect())
        }

        fn create_invoice(&self, appointment: &Appointment) -> Result<Invoice> {
            if self.fail_ids.contains(&appointment.id) {
                return Err(anyhow!("UNIQUE constraint violation"));
            }
            let invoice = Invoice::pending_for(appointment);
            self.invoices.borrow_mut().push(invoice.clone());
            Ok(invoice)
        }
    }

    fn create_test_appointment(id: &str, service: &str, amount: f64) -> Appointment {
        Appointment {
            id: id.to_string(),
            service_id: format!("svc-{}", service),
            service_name: service.to_string(),
            amount,
            scheduled_for: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
        }
    }

    #[test]
    fn test_empty_candidate_set() {
        let store = MemoryStore::new(vec![]);
        let report = InvoiceReconciler::new().reconcile(&store).unwrap();

        assert_eq!(report.found, 0);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed, 0);
        assert!(report.failures.is_empty());
        assert!(report.is_clean());

        println!("✅ Empty pass test passed: {}", report.summary());
    }

    #[test]
    fn test_backfill_creates_pending_invoices() {
        let store = MemoryStore::new(vec![
            create_test_appointment("apt-1", "Dental Cleaning", 150.00),
            create_test_appointment("apt-2", "X-Ray", 85.50),
        ]);

        let report = InvoiceReconciler::new().reconcile(&store).unwrap();

        assert_eq!(report.found, 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 0);

        let invoices = store.invoices.borrow();
        assert_eq!(invoices.len(), 2);

        let inv = invoices.iter().find(|i| i.appointment_id == "apt-1").unwrap();
        assert_eq!(inv.amount, 150.00);
        assert_eq!(inv.status, crate::db::InvoiceStatus::Pending);
        assert_eq!(inv.due_date, None);
        assert_eq!(inv.service_id, "svc-Dental Cleaning");

        println!("✅ Backfill test passed: {}", report.summary());
    }

    #[test]
    fn test_partial_failure_isolation() {
        let store = MemoryStore::new(vec![
            create_test_appointment("apt-1", "Consultation", 60.00),
            create_test_appointment("apt-2", "Vaccination", 40.00),
            create_test_appointment("apt-3", "Blood Panel", 120.00),
        ])
        .failing_on("apt-3");

        let report = InvoiceReconciler::new().reconcile(&store).unwrap();

        // One failure must not stop or roll back the other two
        assert_eq!(report.found, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded + report.failed, report.found);
        assert_eq!(store.invoices.borrow().len(), 2);

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].appointment_id, "apt-3");
        assert_eq!(report.failures[0].service_name, "Blood Panel");
        assert!(report.failures[0].cause.contains("constraint violation"));
        assert!(!report.is_clean());

        println!("✅ Partial failure test passed: {}", report.summary());
    }

    #[test]
    fn test_fetch_failure_is_fatal() {
        let store = MemoryStore::new(vec![create_test_appointment(
            "apt-1",
            "Consultation",
            60.00,
        )])
        .with_broken_fetch();

        let result = InvoiceReconciler::new().reconcile(&store);

        assert!(result.is_err());
        let msg = format!("{:#}", result.unwrap_err());
        assert!(msg.contains("failed to fetch appointments missing an invoice"));
        assert!(msg.contains("database connection lost"));

        // Nothing was created
        assert!(store.invoices.borrow().is_empty());

        println!("✅ Fatal fetch test passed");
    }

    #[test]
    fn test_second_pass_is_idempotent() {
        let store = MemoryStore::new(vec![
            create_test_appointment("apt-1", "Consultation", 60.00),
            create_test_appointment("apt-2", "X-Ray", 85.50),
        ]);
        let reconciler = InvoiceReconciler::new();

        let first = reconciler.reconcile(&store).unwrap();
        assert_eq!(first.found, 2);
        assert_eq!(first.succeeded, 2);

        let second = reconciler.reconcile(&store).unwrap();
        assert_eq!(second.found, 0);
        assert_eq!(second.succeeded, 0);
        assert_eq!(second.failed, 0);
        assert_eq!(store.invoices.borrow().len(), 2);

        println!("✅ Idempotence test passed: {}", second.summary());
    }

    #[test]
    fn test_failed_item_retried_on_next_pass() {
        let store = MemoryStore::new(vec![
            create_test_appointment("apt-1", "Consultation", 60.00),
            create_test_appointment("apt-2", "X-Ray", 85.50),
        ])
        .failing_on("apt-2");
        let reconciler = InvoiceReconciler::new();

        let first = reconciler.reconcile(&store).unwrap();
        assert_eq!(first.succeeded, 1);
        assert_eq!(first.failed, 1);

        // The failed item still shows up as missing next time around
        let second = reconciler.reconcile(&store).unwrap();
        assert_eq!(second.found, 1);
        assert_eq!(second.failures[0].appointment_id, "apt-2");

        println!("✅ Retry-on-next-pass test passed");
    }

    #[test]
    fn test_report_summary() {
        let report = BackfillReport {
            found: 3,
            succeeded: 2,
            failed: 1,
            failures: vec![BackfillFailure {
                appointment_id: "apt-3".to_string(),
                service_name: "Blood Panel".to_string(),
                cause: "constraint violation".to_string(),
            }],
            reconciled_at: Utc::now(),
        };

        assert_eq!(
            report.summary(),
            "Backfill pass: 3 appointments missing an invoice, 2 invoiced, 1 failed"
        );
        assert!(!report.is_clean());

        println!("✅ Summary test passed");
    }
}
