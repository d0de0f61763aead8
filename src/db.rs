use crate::reconciliation::BillingStore;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ============================================================================
// ENTITIES
// ============================================================================

/// A billable service offered by the clinic (e.g., "Dental Cleaning").
/// Referenced by appointments; its name is used only for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
}

/// A completed appointment that should be billed.
///
/// Pre-existing data, read-only to the reconciler. The serde renames match
/// the column headers of the practice-management CSV export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    /// Stable identity (UUID); assigned on import when the export has none
    #[serde(rename = "Appointment_ID", default = "default_uuid")]
    pub id: String,

    #[serde(rename = "Service_ID")]
    pub service_id: String,

    #[serde(rename = "Service_Name")]
    pub service_name: String,

    /// Fee charged for the appointment
    #[serde(rename = "Amount")]
    pub amount: f64,

    #[serde(rename = "Scheduled_For")]
    pub scheduled_for: NaiveDate,
}

fn default_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Invoice lifecycle. The reconciler only ever creates `Pending`; the other
/// states belong to the payment flow outside this tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Void => "void",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(InvoiceStatus::Pending),
            "paid" => Some(InvoiceStatus::Paid),
            "void" => Some(InvoiceStatus::Void),
            _ => None,
        }
    }
}

/// An invoice, 1:1 with its appointment once reconciled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub appointment_id: String,
    /// Copied from the appointment so the invoice stands alone
    pub service_id: String,
    pub amount: f64,
    pub status: InvoiceStatus,
    pub due_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl Invoice {
    /// The one invoice shape the backfill ever creates: pending, amount
    /// copied from the appointment, no due date.
    pub fn pending_for(appointment: &Appointment) -> Self {
        Invoice {
            id: uuid::Uuid::new_v4().to_string(),
            appointment_id: appointment.id.clone(),
            service_id: appointment.service_id.clone(),
            amount: appointment.amount,
            status: InvoiceStatus::Pending,
            due_date: None,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS services (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS appointments (
            id TEXT PRIMARY KEY,
            service_id TEXT NOT NULL REFERENCES services(id),
            amount REAL NOT NULL,
            scheduled_for TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // appointment_id is UNIQUE: storage enforces the 1:1 invariant even if
    // two backfill passes ever race
    conn.execute(
        "CREATE TABLE IF NOT EXISTS invoices (
            id TEXT PRIMARY KEY,
            appointment_id TEXT UNIQUE NOT NULL REFERENCES appointments(id),
            service_id TEXT NOT NULL,
            amount REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            due_date TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_appointments_scheduled_for
         ON appointments(scheduled_for)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_invoices_status ON invoices(status)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// IMPORT (CSV seeding)
// ============================================================================

/// Load appointments from a practice-management CSV export.
pub fn load_appointments_csv(csv_path: &Path) -> Result<Vec<Appointment>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open CSV file")?;

    let mut appointments = Vec::new();

    for result in rdr.deserialize() {
        let appointment: Appointment = result.context("Failed to deserialize appointment")?;
        appointments.push(appointment);
    }

    Ok(appointments)
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Insert appointments (and the services they reference). Re-importing the
/// same export is safe: rows that already exist are counted as duplicates
/// and skipped.
pub fn insert_appointments(
    conn: &Connection,
    appointments: &[Appointment],
) -> Result<ImportSummary> {
    let mut inserted = 0;
    let mut duplicates = 0;

    for apt in appointments {
        conn.execute(
            "INSERT OR IGNORE INTO services (id, name) VALUES (?1, ?2)",
            params![apt.service_id, apt.service_name],
        )?;

        let result = conn.execute(
            "INSERT INTO appointments (id, service_id, amount, scheduled_for)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                apt.id,
                apt.service_id,
                apt.amount,
                apt.scheduled_for.to_string(),
            ],
        );

        match result {
            Ok(_) => inserted += 1,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(ImportSummary {
        inserted,
        duplicates,
    })
}

// ============================================================================
// QUERIES
// ============================================================================

/// Appointments that have no invoice yet, oldest first.
pub fn find_appointments_missing_invoice(conn: &Connection) -> Result<Vec<Appointment>> {
    let mut stmt = conn.prepare(
        "SELECT a.id, a.service_id, s.name, a.amount, a.scheduled_for
         FROM appointments a
         JOIN services s ON s.id = a.service_id
         WHERE NOT EXISTS (
             SELECT 1 FROM invoices i WHERE i.appointment_id = a.id
         )
         ORDER BY a.scheduled_for, a.id",
    )?;

    let appointments = stmt
        .query_map([], |row| {
            let scheduled_str: String = row.get(4)?;

            Ok(Appointment {
                id: row.get(0)?,
                service_id: row.get(1)?,
                service_name: row.get(2)?,
                amount: row.get(3)?,
                scheduled_for: NaiveDate::parse_from_str(&scheduled_str, "%Y-%m-%d")
                    .map_err(|_| rusqlite::Error::InvalidQuery)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(appointments)
}

pub fn get_all_invoices(conn: &Connection) -> Result<Vec<Invoice>> {
    let mut stmt = conn.prepare(
        "SELECT id, appointment_id, service_id, amount, status, due_date, created_at
         FROM invoices
         ORDER BY created_at",
    )?;

    let invoices = stmt
        .query_map([], |row| {
            let status_str: String = row.get(4)?;
            let due_date_str: Option<String> = row.get(5)?;
            let created_str: String = row.get(6)?;

            Ok(Invoice {
                id: row.get(0)?,
                appointment_id: row.get(1)?,
                service_id: row.get(2)?,
                amount: row.get(3)?,
                status: InvoiceStatus::parse(&status_str).ok_or(rusqlite::Error::InvalidQuery)?,
                due_date: due_date_str
                    .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
                created_at: DateTime::parse_from_rfc3339(&created_str)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?
                    .with_timezone(&Utc),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(invoices)
}

pub fn get_all_services(conn: &Connection) -> Result<Vec<Service>> {
    let mut stmt = conn.prepare("SELECT id, name FROM services ORDER BY name")?;

    let services = stmt
        .query_map([], |row| {
            Ok(Service {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(services)
}

pub fn count_appointments(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM appointments", [], |row| row.get(0))?;
    Ok(count)
}

pub fn count_invoices(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM invoices", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// SQLITE STORE
// ============================================================================

/// `BillingStore` over a rusqlite connection. Owns the connection, so it is
/// released on every exit path when the store is dropped.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        SqliteStore { conn }
    }

    /// Open the database file and make sure the schema exists.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
        setup_database(&conn)?;
        Ok(SqliteStore { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl BillingStore for SqliteStore {
    fn appointments_missing_invoice(&self) -> Result<Vec<Appointment>> {
        find_appointments_missing_invoice(&self.conn)
    }

    fn create_invoice(&self, appointment: &Appointment) -> Result<Invoice> {
        let invoice = Invoice::pending_for(appointment);

        self.conn
            .execute(
                "INSERT INTO invoices (
                    id, appointment_id, service_id, amount, status, due_date, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    invoice.id,
                    invoice.appointment_id,
                    invoice.service_id,
                    invoice.amount,
                    invoice.status.as_str(),
                    invoice.due_date.map(|d| d.to_string()),
                    invoice.created_at.to_rfc3339(),
                ],
            )
            .with_context(|| {
                format!(
                    "failed to create invoice for appointment {}",
                    appointment.id
                )
            })?;

        Ok(invoice)
    }
}

// ============================================================================
// TESTS
// ============================================================================
