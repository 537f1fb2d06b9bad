//! The one path that moves obligation balances.
//!
//! Every function here runs on the caller's connection or transaction and
//! never commits; the caller owns the atomic unit.

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use tracing::debug;

use crate::allocation::{allocate, AllocationOrder, AllocationPlan, OutstandingBalance, PlannedAllocation};
use crate::db::{date_sql, get_date, get_decimal, money_sql};
use crate::error::{BursarError, Result};
use crate::models::{bad_key, Allocation, CreditSource, Payment, PaymentMethod, PaymentStatus, Student};
use crate::store::{get_obligation, latest_obligation, mutate_obligation, outstanding_obligations};

const REFERENCE_WIDTH: usize = 100;

/// A matched transaction about to become a Payment.
#[derive(Debug, Clone)]
pub struct PaymentDraft<'a> {
    pub student: &'a Student,
    pub amount: Decimal,
    pub payment_date: NaiveDate,
    pub narrative: &'a str,
    pub provider_reference: Option<&'a str>,
    pub bank_reference: Option<&'a str>,
    pub processed_by: Option<&'a str>,
    pub notes: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct Posted {
    pub payment_id: i64,
    /// Obligation the payment row points at: the first allocated, or the
    /// latest one when nothing was outstanding.
    pub anchor_fee_id: i64,
    pub allocations: Vec<PlannedAllocation>,
    pub credit_id: Option<i64>,
    pub credited: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationSource {
    Payment(i64),
    Credit(i64),
}

#[derive(Debug, Clone)]
pub struct NewCredit<'a> {
    pub student: &'a Student,
    pub amount: Decimal,
    pub source: CreditSource,
    pub description: &'a str,
    pub payment_id: Option<i64>,
    pub parent_credit_id: Option<i64>,
    pub created_by: Option<&'a str>,
}

pub fn reference_number(provider_reference: Option<&str>, narrative: &str) -> String {
    let text = match provider_reference {
        Some(r) => format!("M-Pesa: {r} - {narrative}"),
        None => narrative.to_string(),
    };
    text.chars().take(REFERENCE_WIDTH).collect()
}

/// Current outstanding balances for a student, read on `conn`.
pub fn balances(conn: &Connection, student: &Student) -> Result<Vec<OutstandingBalance>> {
    Ok(outstanding_obligations(conn, student)?
        .iter()
        .map(OutstandingBalance::from)
        .collect())
}

/// Apply a plan: raise each obligation's paid amount and record the
/// allocation rows against `source`.
pub fn apply_plan(
    conn: &Connection,
    school_id: i64,
    plan: &AllocationPlan,
    source: AllocationSource,
    created_by: Option<&str>,
) -> Result<()> {
    let (payment_id, credit_id) = match source {
        AllocationSource::Payment(id) => (Some(id), None),
        AllocationSource::Credit(id) => (None, Some(id)),
    };
    for a in &plan.allocations {
        let fee = get_obligation(conn, a.fee_id)?.ok_or(BursarError::ObligationNotFound(a.fee_id))?;
        let new_paid = fee.amount_paid + a.amount;
        mutate_obligation(conn, fee.id, new_paid, new_paid >= fee.amount_charged)?;
        conn.execute(
            "INSERT INTO payment_allocations (school_id, payment_id, credit_id, fee_id, amount, created_by) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![school_id, payment_id, credit_id, fee.id, money_sql(a.amount), created_by],
        )?;
        debug!(fee_id = fee.id, amount = %a.amount, ?source, "allocated");
    }
    Ok(())
}

pub fn insert_credit(conn: &Connection, credit: &NewCredit) -> Result<i64> {
    conn.execute(
        "INSERT INTO credits (school_id, student_id, amount, source, description, payment_id, parent_credit_id, created_by) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            credit.student.school_id,
            credit.student.id,
            money_sql(credit.amount),
            credit.source.key(),
            credit.description,
            credit.payment_id,
            credit.parent_credit_id,
            credit.created_by,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Turn a matched transaction into a Payment, its Allocations and, for any
/// remainder, an overpayment Credit.
///
/// With nothing outstanding the payment is anchored to the student's latest
/// obligation and the whole amount is credited. A student with no obligation
/// history at all is `NoObligationHistory`; a `target` that is not one of
/// the student's outstanding obligations is `ObligationNotFound`.
pub fn post_payment(
    conn: &Connection,
    draft: &PaymentDraft,
    target: Option<i64>,
    order: AllocationOrder,
) -> Result<Posted> {
    let student = draft.student;
    let balances = balances(conn, student)?;
    if let Some(t) = target {
        if !balances.iter().any(|b| b.fee_id == t) {
            return Err(BursarError::ObligationNotFound(t));
        }
    }
    let plan = allocate(draft.amount, &balances, target, order);

    let anchor_fee_id = match plan.primary_fee() {
        Some(fee_id) => fee_id,
        None => latest_obligation(conn, student)?
            .map(|o| o.id)
            .ok_or_else(|| BursarError::NoObligationHistory(student.student_no.clone()))?,
    };

    let transaction_id = draft
        .provider_reference
        .or(draft.bank_reference)
        .unwrap_or_default();
    conn.execute(
        "INSERT INTO payments (school_id, student_id, fee_id, amount, method, status, reference_number, \
         transaction_id, bank_reference, payment_date, processed_by, notes) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        rusqlite::params![
            student.school_id,
            student.id,
            anchor_fee_id,
            money_sql(draft.amount),
            PaymentMethod::BankTransfer.key(),
            PaymentStatus::Completed.key(),
            reference_number(draft.provider_reference, draft.narrative),
            transaction_id,
            draft.bank_reference,
            date_sql(draft.payment_date),
            draft.processed_by,
            draft.notes,
        ],
    )?;
    let payment_id = conn.last_insert_rowid();

    apply_plan(conn, student.school_id, &plan, AllocationSource::Payment(payment_id), draft.processed_by)?;

    let (credit_id, credited) = if plan.has_remainder() {
        let description = format!("Overpayment from payment {payment_id}");
        let id = insert_credit(
            conn,
            &NewCredit {
                student,
                amount: plan.remainder,
                source: CreditSource::Overpayment,
                description: &description,
                payment_id: Some(payment_id),
                parent_credit_id: None,
                created_by: draft.processed_by,
            },
        )?;
        (Some(id), plan.remainder)
    } else {
        (None, Decimal::ZERO)
    };

    Ok(Posted {
        payment_id,
        anchor_fee_id,
        allocations: plan.allocations,
        credit_id,
        credited,
    })
}

// ---------------------------------------------------------------------------
// Payment lookups
// ---------------------------------------------------------------------------

const PAYMENT_COLUMNS: &str = "id, school_id, student_id, fee_id, amount, method, status, reference_number, \
     transaction_id, bank_reference, payment_date, processed_by, notes";

pub(crate) fn payment_from_row(row: &Row) -> rusqlite::Result<Payment> {
    let method: String = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(Payment {
        id: row.get(0)?,
        school_id: row.get(1)?,
        student_id: row.get(2)?,
        fee_id: row.get(3)?,
        amount: get_decimal(row, 4)?,
        method: PaymentMethod::from_key(&method).ok_or_else(|| bad_key(5, &method))?,
        status: PaymentStatus::from_key(&status).ok_or_else(|| bad_key(6, &status))?,
        reference_number: row.get(7)?,
        transaction_id: row.get(8)?,
        bank_reference: row.get(9)?,
        payment_date: get_date(row, 10)?,
        processed_by: row.get(11)?,
        notes: row.get(12)?,
    })
}

pub fn find_payment(conn: &Connection, school_id: i64, payment_id: i64) -> Result<Option<Payment>> {
    let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?1 AND school_id = ?2");
    Ok(conn
        .query_row(&sql, rusqlite::params![payment_id, school_id], payment_from_row)
        .optional()?)
}

/// Completed payments for a student on a date with exactly this amount.
pub fn payments_like(
    conn: &Connection,
    student: &Student,
    amount: Decimal,
    date: NaiveDate,
) -> Result<Vec<Payment>> {
    let sql = format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments \
         WHERE school_id = ?1 AND student_id = ?2 AND amount = ?3 AND payment_date = ?4 AND status = ?5 \
         ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            rusqlite::params![
                student.school_id,
                student.id,
                money_sql(amount),
                date_sql(date),
                PaymentStatus::Completed.key(),
            ],
            payment_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn allocation_from_row(row: &Row) -> rusqlite::Result<Allocation> {
    Ok(Allocation {
        id: row.get(0)?,
        payment_id: row.get(1)?,
        credit_id: row.get(2)?,
        fee_id: row.get(3)?,
        amount: get_decimal(row, 4)?,
    })
}

pub fn allocations_for(conn: &Connection, source: AllocationSource) -> Result<Vec<Allocation>> {
    let (column, id) = match source {
        AllocationSource::Payment(id) => ("payment_id", id),
        AllocationSource::Credit(id) => ("credit_id", id),
    };
    let sql = format!(
        "SELECT id, payment_id, credit_id, fee_id, amount FROM payment_allocations WHERE {column} = ?1 ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([id], allocation_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
