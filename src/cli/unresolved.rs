use chrono::NaiveDate;
use colored::Colorize;
use comfy_table::{Cell, Table};
use dialoguer::Confirm;

use crate::cli::{open_db, or_dash};
use crate::error::{BursarError, Result};
use crate::fmt::money;
use crate::models::UnresolvedStatus;
use crate::settings::load_settings;
use crate::unresolved::{self, UnresolvedFilter};

fn parse_status(status: Option<&str>) -> Result<Option<UnresolvedStatus>> {
    match status {
        None => Ok(Some(UnresolvedStatus::Unmatched)),
        Some("all") => Ok(None),
        Some(key) => UnresolvedStatus::from_key(key)
            .map(Some)
            .ok_or_else(|| BursarError::Other(format!("Unknown status '{key}' (unmatched, matched, ignored, all)"))),
    }
}

pub fn list(status: Option<&str>, from: Option<NaiveDate>, to: Option<NaiveDate>, search: Option<&str>) -> Result<()> {
    let settings = load_settings();
    let conn = open_db(&settings)?;
    let filter = UnresolvedFilter {
        status: parse_status(status)?,
        from,
        to,
        search: search.map(str::to_string),
    };
    let rows = unresolved::list(&conn, settings.school_id, &filter)?;

    let mut table = Table::new();
    table.set_header(vec!["ID", "Date", "Amount", "Student", "Reference", "Reason", "Status", "Narrative"]);
    for u in &rows {
        let narrative: String = u.narrative.chars().take(48).collect();
        table.add_row(vec![
            Cell::new(u.id),
            Cell::new(u.transaction_date),
            Cell::new(money(u.amount)),
            Cell::new(or_dash(u.extracted_student_no.as_deref())),
            Cell::new(or_dash(u.provider_reference.as_deref().or(u.bank_reference.as_deref()))),
            Cell::new(u.reason.key()),
            Cell::new(u.status.key()),
            Cell::new(narrative),
        ]);
    }
    println!("Unresolved transactions ({})\n{table}", rows.len());
    Ok(())
}

pub fn show(id: i64) -> Result<()> {
    let settings = load_settings();
    let conn = open_db(&settings)?;
    let u = unresolved::get(&conn, settings.school_id, id)?;

    println!("ID:          {}", u.id);
    println!("Date:        {}", u.transaction_date);
    println!("Amount:      {}", money(u.amount));
    println!("Narrative:   {}", u.narrative);
    println!("Student:     {}", or_dash(u.extracted_student_no.as_deref()));
    println!("Provider:    {}", or_dash(u.provider_reference.as_deref()));
    println!("Bank ref:    {}", or_dash(u.bank_reference.as_deref()));
    println!("Mobile:      {}", or_dash(u.mobile_number.as_deref()));
    println!("Payer:       {}", or_dash(u.payer_name.as_deref()));
    println!("Reason:      {}", u.reason.key());
    println!("Status:      {}", u.status.key());
    if !u.notes.is_empty() {
        println!("Notes:       {}", u.notes);
    }
    if let Some(by) = u.matched_by.as_deref() {
        println!("Resolved by: {by} at {}", or_dash(u.matched_at.as_deref()));
    }

    if u.status != UnresolvedStatus::Unmatched {
        return Ok(());
    }
    let suggestions = unresolved::suggest_payments(&conn, settings.school_id, id)?;
    if suggestions.is_empty() {
        return Ok(());
    }
    let mut table = Table::new();
    table.set_header(vec!["Payment", "Date", "Amount", "Transaction", "Score"]);
    for s in suggestions {
        table.add_row(vec![
            Cell::new(s.payment.id),
            Cell::new(s.payment.payment_date),
            Cell::new(money(s.payment.amount)),
            Cell::new(or_dash(Some(s.payment.transaction_id.as_str()))),
            Cell::new(s.score),
        ]);
    }
    println!("\nCandidate payments\n{table}");
    Ok(())
}

pub fn match_payment(id: i64, payment_id: i64, notes: Option<&str>) -> Result<()> {
    let settings = load_settings();
    let mut conn = open_db(&settings)?;
    unresolved::match_to_payment(&mut conn, settings.school_id, id, payment_id, settings.operator(), notes)?;
    println!("{}", format!("\u{2192} Linked transaction {id} to payment {payment_id}").green());
    Ok(())
}

pub fn match_student(id: i64, student_no: &str, fee: Option<i64>, notes: Option<&str>) -> Result<()> {
    let settings = load_settings();
    let mut conn = open_db(&settings)?;
    let matched = unresolved::match_to_student(
        &mut conn,
        settings.school_id,
        id,
        student_no,
        fee,
        settings.operator(),
        notes,
    )?;
    let posted = &matched.posted;
    println!(
        "{}",
        format!("\u{2192} Posted payment {} for {}", posted.payment_id, student_no.trim()).green()
    );
    for a in &posted.allocations {
        println!("  obligation {}: {}", a.fee_id, money(a.amount));
    }
    if let Some(credit_id) = posted.credit_id {
        println!("  credit {credit_id}: {}", money(posted.credited));
    }
    println!("Transaction {id} is now {}", matched.record.status.key());
    Ok(())
}

pub fn ignore(id: i64, notes: Option<&str>) -> Result<()> {
    let settings = load_settings();
    let mut conn = open_db(&settings)?;
    unresolved::ignore(&mut conn, settings.school_id, id, settings.operator(), notes)?;
    println!("Ignored transaction {id}");
    Ok(())
}

pub fn delete(id: i64, yes: bool) -> Result<()> {
    let settings = load_settings();
    let mut conn = open_db(&settings)?;
    let u = unresolved::get(&conn, settings.school_id, id)?;

    if !yes {
        let prompt = format!("Delete transaction {id} ({} on {})?", money(u.amount), u.transaction_date);
        let confirmed = Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .map_err(|e| BursarError::Other(e.to_string()))?;
        if !confirmed {
            println!("{}", "Cancelled.".yellow());
            return Ok(());
        }
    }
    unresolved::delete(&mut conn, settings.school_id, id)?;
    println!("Deleted transaction {id}");
    Ok(())
}
