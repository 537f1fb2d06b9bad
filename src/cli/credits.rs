use colored::Colorize;
use comfy_table::{Cell, Table};
use rust_decimal::Decimal;

use crate::cli::{open_db, or_dash, require_student};
use crate::credits::{self, CreditFilter, CreditScope};
use crate::error::{BursarError, Result};
use crate::fmt::money;
use crate::models::CreditSource;
use crate::settings::load_settings;
use crate::store::get_student;

pub fn list(student_no: Option<&str>, all: bool) -> Result<()> {
    let settings = load_settings();
    let conn = open_db(&settings)?;
    let student_id = match student_no {
        Some(no) => Some(require_student(&conn, &settings, no)?.id),
        None => None,
    };
    let rows = credits::list(
        &conn,
        settings.school_id,
        &CreditFilter {
            student_id,
            include_applied: all,
        },
    )?;

    let mut table = Table::new();
    table.set_header(vec!["ID", "Student", "Amount", "Source", "Payment", "Applied To", "Description"]);
    let mut total = Decimal::ZERO;
    for c in &rows {
        let student = get_student(&conn, c.student_id)?;
        let payment = c.payment_id.map(|p| p.to_string());
        let applied = c.applied_to_fee_id.map(|f| f.to_string());
        if !c.is_applied {
            total += c.amount;
        }
        table.add_row(vec![
            Cell::new(c.id),
            Cell::new(&student.student_no),
            Cell::new(money(c.amount)),
            Cell::new(c.source.key()),
            Cell::new(or_dash(payment.as_deref())),
            Cell::new(or_dash(applied.as_deref())),
            Cell::new(&c.description),
        ]);
    }
    println!("Credits\n{table}");
    println!("Unapplied total: {}", money(total));
    Ok(())
}

pub fn add(student_no: &str, amount: Decimal, source: &str, description: &str) -> Result<()> {
    let settings = load_settings();
    let conn = open_db(&settings)?;
    let student = require_student(&conn, &settings, student_no)?;
    let source = CreditSource::from_key(source).ok_or_else(|| {
        BursarError::Other(format!(
            "Unknown credit source '{source}' (overpayment, refund, adjustment, reassignment, manual)"
        ))
    })?;
    let credit = credits::create(&conn, &student, amount, source, description, None, settings.operator())?;
    println!("Added credit {}: {} for {}", credit.id, money(credit.amount), student.student_no);
    Ok(())
}

pub fn apply(id: i64, fee: Option<i64>) -> Result<()> {
    let settings = load_settings();
    let mut conn = open_db(&settings)?;
    let result = credits::apply(&mut conn, settings.school_id, id, fee, settings.operator())?;
    println!(
        "{}",
        format!("\u{2192} Applied {} from credit {id}", money(result.applied_amount)).green()
    );
    for a in &result.allocations {
        println!("  obligation {}: {}", a.fee_id, money(a.amount));
    }
    if let Some(rest) = result.remainder_credit_id {
        println!("  remainder {} kept as credit {rest}", money(result.remainder));
    }
    Ok(())
}

pub fn apply_all(student_no: Option<&str>) -> Result<()> {
    let settings = load_settings();
    let mut conn = open_db(&settings)?;
    let scope = match student_no {
        Some(no) => CreditScope::Student(require_student(&conn, &settings, no)?.id),
        None => CreditScope::School,
    };
    let summary = credits::apply_all(&mut conn, settings.school_id, scope, settings.operator())?;
    println!(
        "{} credits applied ({}), {} skipped (nothing outstanding)",
        summary.applied,
        money(summary.total_applied),
        summary.skipped
    );
    Ok(())
}

pub fn delete(id: i64) -> Result<()> {
    let settings = load_settings();
    let conn = open_db(&settings)?;
    credits::delete(&conn, settings.school_id, id)?;
    println!("Deleted credit {id}");
    Ok(())
}
