use std::path::Path;

use colored::Colorize;
use comfy_table::{Cell, Table};

use crate::cli::{open_db, or_dash};
use crate::error::{BursarError, Result};
use crate::fmt::money;
use crate::models::UploadStatus;
use crate::reconcile::{list_uploads, process_statement, RowOutcome, StatementUpload};
use crate::settings::load_settings;

pub fn run(file: &str, pattern_id: i64, verbose: bool) -> Result<()> {
    let settings = load_settings();
    let mut conn = open_db(&settings)?;
    let path = Path::new(file);
    let bytes = std::fs::read(path)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file.to_string());

    let report = process_statement(
        &mut conn,
        &StatementUpload {
            school_id: settings.school_id,
            pattern_id,
            file_name: &file_name,
            bytes: &bytes,
            operator: settings.operator(),
            strict_duplicates: settings.strict_duplicates,
        },
    )?;
    let job = &report.job;

    if job.status == UploadStatus::Failed {
        return Err(BursarError::Other(format!(
            "Upload {} failed: {}",
            job.id,
            job.error_message.as_deref().unwrap_or("unknown error")
        )));
    }

    if verbose {
        let mut table = Table::new();
        table.set_header(vec!["Line", "Date", "Amount", "Student", "Outcome", "Detail"]);
        for row in &report.rows {
            let detail = match &row.outcome {
                RowOutcome::Matched { payment_id, credited } if credited.is_zero() => format!("payment {payment_id}"),
                RowOutcome::Matched { payment_id, credited } => {
                    format!("payment {payment_id}, credit {}", money(*credited))
                }
                RowOutcome::Duplicate(kind) => format!("by {}", kind.name()),
                RowOutcome::Unresolved { id, reason } => format!("#{id} {}", reason.key()),
            };
            table.add_row(vec![
                Cell::new(row.line),
                Cell::new(row.date),
                Cell::new(money(row.amount)),
                Cell::new(or_dash(row.student_no.as_deref())),
                Cell::new(row.outcome.label()),
                Cell::new(detail),
            ]);
        }
        println!("{table}");
    }

    println!("Upload {}: {} rows processed", job.id, job.total);
    println!("  {}", format!("{} matched", job.matched).green());
    println!("  {}", format!("{} unmatched", job.unmatched).yellow());
    println!("  {} duplicate", job.duplicate);
    if job.unmatched > 0 {
        println!("Review with `bursar unresolved list`.");
    }
    Ok(())
}

pub fn list(limit: usize) -> Result<()> {
    let settings = load_settings();
    let conn = open_db(&settings)?;
    let uploads = list_uploads(&conn, settings.school_id, limit)?;

    let mut table = Table::new();
    table.set_header(vec![
        "ID", "File", "Pattern", "Status", "Total", "Matched", "Unmatched", "Duplicate", "Uploaded",
    ]);
    for u in uploads {
        let pattern = u.pattern_id.map(|p| p.to_string());
        table.add_row(vec![
            Cell::new(u.id),
            Cell::new(&u.file_name),
            Cell::new(or_dash(pattern.as_deref())),
            Cell::new(u.status.key()),
            Cell::new(u.total),
            Cell::new(u.matched),
            Cell::new(u.unmatched),
            Cell::new(u.duplicate),
            Cell::new(&u.uploaded_at),
        ]);
    }
    println!("Uploads\n{table}");
    Ok(())
}
