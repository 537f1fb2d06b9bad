//! Student and fee-obligation store.
//!
//! Students and their fees are owned by the wider school system; the engine
//! only looks them up and moves `amount_paid`. The seeding helpers exist so an
//! installation (and the tests) can stand up a store to reconcile against.

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row};
use rust_decimal::Decimal;

use crate::db::{date_sql, get_date, get_decimal, money_sql};
use crate::error::{BursarError, Result};
use crate::models::{Obligation, Student};
use crate::receivables::sync_receivable;

const FEE_COLUMNS: &str =
    "id, school_id, student_id, category, term, amount_charged, amount_paid, is_paid, due_date";

fn obligation_from_row(row: &Row) -> rusqlite::Result<Obligation> {
    Ok(Obligation {
        id: row.get(0)?,
        school_id: row.get(1)?,
        student_id: row.get(2)?,
        category: row.get(3)?,
        term: row.get(4)?,
        amount_charged: get_decimal(row, 5)?,
        amount_paid: get_decimal(row, 6)?,
        is_paid: row.get(7)?,
        due_date: get_date(row, 8)?,
    })
}

fn student_from_row(row: &Row) -> rusqlite::Result<Student> {
    Ok(Student {
        id: row.get(0)?,
        school_id: row.get(1)?,
        student_no: row.get(2)?,
        full_name: row.get(3)?,
    })
}

// ---------------------------------------------------------------------------
// Seeding
// ---------------------------------------------------------------------------

pub fn add_school(conn: &Connection, name: &str) -> Result<i64> {
    conn.execute("INSERT INTO schools (name) VALUES (?1)", [name])?;
    Ok(conn.last_insert_rowid())
}

pub fn school_exists(conn: &Connection, school_id: i64) -> Result<bool> {
    let mut stmt = conn.prepare("SELECT 1 FROM schools WHERE id = ?1")?;
    Ok(stmt.exists([school_id])?)
}

pub fn add_student(conn: &Connection, school_id: i64, student_no: &str, full_name: &str) -> Result<i64> {
    if !school_exists(conn, school_id)? {
        return Err(BursarError::UnknownSchool(school_id));
    }
    conn.execute(
        "INSERT INTO students (school_id, student_no, full_name) VALUES (?1, ?2, ?3)",
        rusqlite::params![school_id, student_no.trim(), full_name],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn add_fee(
    conn: &Connection,
    student: &Student,
    category: &str,
    term: &str,
    amount_charged: Decimal,
    due_date: NaiveDate,
) -> Result<i64> {
    if amount_charged <= Decimal::ZERO {
        return Err(BursarError::InvalidAmount(amount_charged.to_string()));
    }
    conn.execute(
        "INSERT INTO student_fees (school_id, student_id, category, term, amount_charged, amount_paid, is_paid, due_date) \
         VALUES (?1, ?2, ?3, ?4, ?5, '0.00', 0, ?6)",
        rusqlite::params![
            student.school_id,
            student.id,
            category,
            term,
            money_sql(amount_charged),
            date_sql(due_date),
        ],
    )?;
    let fee_id = conn.last_insert_rowid();
    sync_receivable(conn, fee_id)?;
    Ok(fee_id)
}

// ---------------------------------------------------------------------------
// Lookups consumed by the engine
// ---------------------------------------------------------------------------

/// Exact student-number lookup scoped to one school.
pub fn find_student(conn: &Connection, school_id: i64, student_no: &str) -> Result<Option<Student>> {
    let student = conn
        .query_row(
            "SELECT id, school_id, student_no, full_name FROM students \
             WHERE school_id = ?1 AND student_no = ?2",
            rusqlite::params![school_id, student_no.trim()],
            student_from_row,
        )
        .optional()?;
    Ok(student)
}

pub fn get_student(conn: &Connection, student_id: i64) -> Result<Student> {
    conn.query_row(
        "SELECT id, school_id, student_no, full_name FROM students WHERE id = ?1",
        [student_id],
        student_from_row,
    )
    .optional()?
    .ok_or_else(|| BursarError::UnknownStudent(student_id.to_string()))
}

pub fn get_obligation(conn: &Connection, fee_id: i64) -> Result<Option<Obligation>> {
    let sql = format!("SELECT {FEE_COLUMNS} FROM student_fees WHERE id = ?1");
    Ok(conn.query_row(&sql, [fee_id], obligation_from_row).optional()?)
}

pub fn student_obligations(conn: &Connection, student: &Student) -> Result<Vec<Obligation>> {
    let sql = format!(
        "SELECT {FEE_COLUMNS} FROM student_fees WHERE school_id = ?1 AND student_id = ?2 ORDER BY due_date, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params![student.school_id, student.id], obligation_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Obligations with a positive outstanding balance, in no guaranteed order.
pub fn outstanding_obligations(conn: &Connection, student: &Student) -> Result<Vec<Obligation>> {
    Ok(student_obligations(conn, student)?
        .into_iter()
        .filter(|o| o.outstanding() > Decimal::ZERO)
        .collect())
}

/// Most recently created obligation, settled or not.
pub fn latest_obligation(conn: &Connection, student: &Student) -> Result<Option<Obligation>> {
    let sql = format!(
        "SELECT {FEE_COLUMNS} FROM student_fees WHERE school_id = ?1 AND student_id = ?2 \
         ORDER BY created_at DESC, id DESC LIMIT 1"
    );
    Ok(conn
        .query_row(&sql, rusqlite::params![student.school_id, student.id], obligation_from_row)
        .optional()?)
}

/// Writes a new paid amount, refusing anything outside `0..=amount_charged`.
pub fn mutate_obligation(
    conn: &Connection,
    fee_id: i64,
    new_amount_paid: Decimal,
    new_is_paid: bool,
) -> Result<()> {
    let fee = get_obligation(conn, fee_id)?.ok_or(BursarError::ObligationNotFound(fee_id))?;
    if new_amount_paid < Decimal::ZERO || new_amount_paid > fee.amount_charged {
        return Err(BursarError::BalanceOverflow {
            fee_id,
            amount_paid: new_amount_paid.to_string(),
            amount_charged: fee.amount_charged.to_string(),
        });
    }
    conn.execute(
        "UPDATE student_fees SET amount_paid = ?1, is_paid = ?2 WHERE id = ?3",
        rusqlite::params![money_sql(new_amount_paid), new_is_paid, fee_id],
    )?;
    sync_receivable(conn, fee_id)?;
    Ok(())
}
