// Clinic Billing CLI - import appointments, backfill missing invoices
//
// The binary is a thin collaborator: it opens the database, runs one
// operation, prints a human-readable summary, and exits non-zero only on
// fatal errors. Per-appointment backfill failures are report data, not a
// process failure.

use anyhow::Result;
use clinic_billing::{
    InvoiceReconciler, SqliteStore, count_appointments, count_invoices,
    find_appointments_missing_invoice, get_all_services, insert_appointments,
    load_appointments_csv,
};
use std::env;
use std::path::{Path, PathBuf};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("backfill") => run_backfill(args.iter().any(|a| a == "--json")),
        Some("import") => match args.get(2) {
            Some(csv_path) => run_import(Path::new(csv_path)),
            None => {
                eprintln!("❌ Missing CSV path");
                eprintln!("   Usage: clinic-billing import <appointments.csv>");
                std::process::exit(2);
            }
        },
        Some("status") => run_status(),
        _ => {
            print_usage();
            std::process::exit(2);
        }
    }
}

fn print_usage() {
    eprintln!("clinic-billing {}", clinic_billing::VERSION);
    eprintln!();
    eprintln!("Usage: clinic-billing <COMMAND>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  backfill [--json]   Create pending invoices for uninvoiced appointments");
    eprintln!("  import <CSV>        Seed appointments from a CSV export");
    eprintln!("  status              Show appointment and invoice counts");
    eprintln!();
    eprintln!("Database path defaults to ./clinic.db (override with CLINIC_BILLING_DB)");
}

fn db_path() -> PathBuf {
    env::var("CLINIC_BILLING_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("clinic.db"))
}

fn run_backfill(json: bool) -> Result<()> {
    let store = SqliteStore::open(&db_path())?;
    let report = InvoiceReconciler::new().reconcile(&store)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("🧾 Invoice Backfill - appointments → pending invoices");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ {}", report.summary());

    for failure in &report.failures {
        println!(
            "❌ appointment {} ({}): {}",
            failure.appointment_id, failure.service_name, failure.cause
        );
    }

    if report.is_clean() {
        println!("✅ Backfill complete: every appointment has an invoice");
    } else {
        println!(
            "⚠️  {} appointment(s) need manual follow-up",
            report.failed
        );
    }

    Ok(())
}

fn run_import(csv_path: &Path) -> Result<()> {
    println!("🗄️  Appointment Import - CSV → SQLite");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    println!("\n📂 Loading CSV...");
    let appointments = load_appointments_csv(csv_path)?;
    println!("✓ Loaded {} appointments from CSV", appointments.len());

    println!("\n💾 Inserting appointments...");
    let store = SqliteStore::open(&db_path())?;
    let summary = insert_appointments(store.connection(), &appointments)?;
    println!("✓ Inserted: {} appointments", summary.inserted);
    println!("✓ Skipped duplicates: {}", summary.duplicates);

    let total = count_appointments(store.connection())?;
    println!("✓ Database contains {} appointments", total);

    Ok(())
}

fn run_status() -> Result<()> {
    let store = SqliteStore::open(&db_path())?;
    let conn = store.connection();

    let appointments = count_appointments(conn)?;
    let invoices = count_invoices(conn)?;
    let missing = find_appointments_missing_invoice(conn)?;
    let services = get_all_services(conn)?;

    println!("📊 Clinic Billing Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ Appointments: {}", appointments);
    println!("✓ Invoices:     {}", invoices);
    println!("✓ Missing:      {}", missing.len());

    if !services.is_empty() {
        println!("\nServices:");
        for service in &services {
            println!("  • {} ({})", service.name, service.id);
        }
    }

    if !missing.is_empty() {
        println!("\nAppointments awaiting an invoice:");
        for apt in &missing {
            println!(
                "  • {} {} - {} (${:.2})",
                apt.scheduled_for, apt.id, apt.service_name, apt.amount
            );
        }
        println!("\nRun: clinic-billing backfill");
    }

    Ok(())
}
