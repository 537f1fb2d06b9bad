use rusqlite::Connection;

use crate::db::{date_sql, money_sql};
use crate::error::Result;
use crate::models::ParsedTransaction;

const NARRATIVE_PREFIX: usize = 50;

/// Which identifier space recognised the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKind {
    ProviderReference,
    BankReference,
    Composite,
}

impl DuplicateKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProviderReference => "provider reference",
            Self::BankReference => "bank reference",
            Self::Composite => "amount/date/narrative",
        }
    }
}

fn exists(conn: &Connection, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<bool> {
    let mut stmt = conn.prepare_cached(sql)?;
    Ok(stmt.exists(params)?)
}

fn provider_reference_seen(conn: &Connection, school_id: i64, reference: &str) -> Result<bool> {
    if exists(
        conn,
        "SELECT 1 FROM unmatched_transactions WHERE school_id = ?1 AND provider_reference = ?2",
        &[&school_id, &reference],
    )? {
        return Ok(true);
    }
    exists(
        conn,
        "SELECT 1 FROM payments WHERE school_id = ?1 \
         AND (transaction_id = ?2 OR instr(lower(reference_number), lower(?2)) > 0)",
        &[&school_id, &reference],
    )
}

fn bank_reference_seen(conn: &Connection, school_id: i64, reference: &str) -> Result<bool> {
    if exists(
        conn,
        "SELECT 1 FROM unmatched_transactions WHERE school_id = ?1 AND bank_reference = ?2",
        &[&school_id, &reference],
    )? {
        return Ok(true);
    }
    exists(
        conn,
        "SELECT 1 FROM payments WHERE school_id = ?1 \
         AND (transaction_id = ?2 OR bank_reference = ?2 OR instr(lower(reference_number), lower(?2)) > 0)",
        &[&school_id, &reference],
    )
}

fn composite_seen(conn: &Connection, school_id: i64, tx: &ParsedTransaction, student_id: Option<i64>) -> Result<bool> {
    let amount = money_sql(tx.amount);
    let date = date_sql(tx.date);
    if let Some(student_id) = student_id {
        let prefix: String = tx.narrative.chars().take(NARRATIVE_PREFIX).collect();
        if exists(
            conn,
            "SELECT 1 FROM payments WHERE school_id = ?1 AND student_id = ?2 AND amount = ?3 \
             AND payment_date = ?4 AND instr(lower(reference_number), lower(?5)) > 0",
            &[&school_id, &student_id, &amount, &date, &prefix],
        )? {
            return Ok(true);
        }
    }
    exists(
        conn,
        "SELECT 1 FROM unmatched_transactions WHERE school_id = ?1 AND amount = ?2 \
         AND transaction_date = ?3 AND narrative = ?4",
        &[&school_id, &amount, &date, &tx.narrative],
    )
}

/// Check a candidate row against recorded payments and parked rows, in order:
/// provider reference, bank reference, then (unless `strict`) the
/// amount + date + narrative composite. `student_id` is the resolved student,
/// if any; the payment side of the composite check needs one.
pub fn find_duplicate(
    conn: &Connection,
    school_id: i64,
    tx: &ParsedTransaction,
    student_id: Option<i64>,
    strict: bool,
) -> Result<Option<DuplicateKind>> {
    if let Some(reference) = tx.provider_reference.as_deref() {
        if provider_reference_seen(conn, school_id, reference)? {
            return Ok(Some(DuplicateKind::ProviderReference));
        }
    }
    if let Some(reference) = tx.bank_reference.as_deref() {
        if bank_reference_seen(conn, school_id, reference)? {
            return Ok(Some(DuplicateKind::BankReference));
        }
    }
    if !strict && composite_seen(conn, school_id, tx, student_id)? {
        return Ok(Some(DuplicateKind::Composite));
    }
    Ok(None)
}
