use rusqlite::{Connection, OptionalExtension, Row};
use rust_decimal::Decimal;

use crate::db::{date_sql, get_date, get_decimal, money_sql};
use crate::error::Result;
use crate::models::{Receivable, Student};
use crate::store::{get_obligation, student_obligations};

fn receivable_from_row(row: &Row) -> rusqlite::Result<Receivable> {
    Ok(Receivable {
        id: row.get(0)?,
        student_id: row.get(1)?,
        fee_id: row.get(2)?,
        amount_due: get_decimal(row, 3)?,
        amount_paid: get_decimal(row, 4)?,
        due_date: get_date(row, 5)?,
        is_cleared: row.get(6)?,
        cleared_at: row.get(7)?,
    })
}

/// Re-derive the receivable line for one obligation. Running it twice in a
/// row leaves the same state.
pub fn sync_receivable(conn: &Connection, fee_id: i64) -> Result<()> {
    let Some(fee) = get_obligation(conn, fee_id)? else {
        return Ok(());
    };
    let existing: Option<i64> = conn
        .query_row("SELECT id FROM receivables WHERE fee_id = ?1", [fee_id], |r| r.get(0))
        .optional()?;

    match existing {
        Some(id) => {
            conn.execute(
                "UPDATE receivables SET amount_due = ?1, amount_paid = ?2, due_date = ?3, is_cleared = ?4, \
                 cleared_at = CASE WHEN ?4 = 1 THEN COALESCE(cleared_at, datetime('now')) ELSE cleared_at END, \
                 updated_at = datetime('now') WHERE id = ?5",
                rusqlite::params![
                    money_sql(fee.amount_charged),
                    money_sql(fee.amount_paid),
                    date_sql(fee.due_date),
                    fee.is_paid,
                    id,
                ],
            )?;
        }
        None if fee.outstanding() > Decimal::ZERO => {
            conn.execute(
                "INSERT INTO receivables (school_id, student_id, fee_id, amount_due, amount_paid, due_date, is_cleared) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    fee.school_id,
                    fee.student_id,
                    fee.id,
                    money_sql(fee.amount_charged),
                    money_sql(fee.amount_paid),
                    date_sql(fee.due_date),
                    fee.is_paid,
                ],
            )?;
        }
        None => {}
    }
    Ok(())
}

pub fn get_receivable(conn: &Connection, fee_id: i64) -> Result<Option<Receivable>> {
    Ok(conn
        .query_row(
            "SELECT id, student_id, fee_id, amount_due, amount_paid, due_date, is_cleared, cleared_at \
             FROM receivables WHERE fee_id = ?1",
            [fee_id],
            receivable_from_row,
        )
        .optional()?)
}

pub fn list_receivables(conn: &Connection, student: &Student) -> Result<Vec<Receivable>> {
    let mut stmt = conn.prepare(
        "SELECT id, student_id, fee_id, amount_due, amount_paid, due_date, is_cleared, cleared_at \
         FROM receivables WHERE school_id = ?1 AND student_id = ?2 ORDER BY due_date, id",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![student.school_id, student.id], receivable_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Aggregate position of one student across every obligation. A computed
/// value, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceSummary {
    pub obligations: usize,
    pub total_charged: Decimal,
    pub total_paid: Decimal,
    pub outstanding: Decimal,
    pub unapplied_credit: Decimal,
}

impl BalanceSummary {
    /// Outstanding balance after every unapplied credit is netted off.
    pub fn net_due(&self) -> Decimal {
        self.outstanding - self.unapplied_credit
    }
}

pub fn student_balance(conn: &Connection, student: &Student) -> Result<BalanceSummary> {
    let fees = student_obligations(conn, student)?;
    let total_charged: Decimal = fees.iter().map(|f| f.amount_charged).sum();
    let total_paid: Decimal = fees.iter().map(|f| f.amount_paid).sum();

    let mut stmt = conn.prepare(
        "SELECT amount FROM credits WHERE school_id = ?1 AND student_id = ?2 AND is_applied = 0",
    )?;
    let credits = stmt
        .query_map(rusqlite::params![student.school_id, student.id], |row| get_decimal(row, 0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(BalanceSummary {
        obligations: fees.len(),
        total_charged,
        total_paid,
        outstanding: total_charged - total_paid,
        unapplied_credit: credits.into_iter().sum(),
    })
}
