// Clinic Billing - Core Library
// Exposes storage and reconciliation modules for the CLI and tests

pub mod db;
pub mod reconciliation;

// Re-export commonly used types
pub use db::{
    Appointment, ImportSummary, Invoice, InvoiceStatus, Service, SqliteStore,
    count_appointments, count_invoices, find_appointments_missing_invoice, get_all_invoices,
    get_all_services, insert_appointments, load_appointments_csv, setup_database,
};
pub use reconciliation::{BackfillFailure, BackfillReport, BillingStore, InvoiceReconciler};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
