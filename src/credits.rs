use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use tracing::info;

use crate::allocation::{allocate, AllocationOrder, PlannedAllocation};
use crate::db::get_decimal;
use crate::error::{BursarError, Result};
use crate::models::{bad_key, Credit, CreditSource, Student};
use crate::posting::{apply_plan, balances, insert_credit, AllocationSource, NewCredit};
use crate::store::get_student;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditScope {
    Student(i64),
    School,
}

#[derive(Debug, Clone, Default)]
pub struct CreditFilter {
    pub student_id: Option<i64>,
    pub include_applied: bool,
}

#[derive(Debug, Clone)]
pub struct AppliedResult {
    pub credit_id: i64,
    pub student_id: i64,
    pub applied_to: i64,
    pub allocations: Vec<PlannedAllocation>,
    pub applied_amount: Decimal,
    pub remainder_credit_id: Option<i64>,
    pub remainder: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyAllSummary {
    pub results: Vec<AppliedResult>,
    pub applied: usize,
    pub skipped: usize,
    pub total_applied: Decimal,
}

const CREDIT_COLUMNS: &str = "id, school_id, student_id, amount, source, description, payment_id, \
     parent_credit_id, is_applied, applied_to_fee_id, applied_at, created_at";

fn credit_from_row(row: &Row) -> rusqlite::Result<Credit> {
    let source: String = row.get(4)?;
    Ok(Credit {
        id: row.get(0)?,
        school_id: row.get(1)?,
        student_id: row.get(2)?,
        amount: get_decimal(row, 3)?,
        source: CreditSource::from_key(&source).ok_or_else(|| bad_key(4, &source))?,
        description: row.get(5)?,
        payment_id: row.get(6)?,
        parent_credit_id: row.get(7)?,
        is_applied: row.get(8)?,
        applied_to_fee_id: row.get(9)?,
        applied_at: row.get(10)?,
        created_at: row.get(11)?,
    })
}

// ---------------------------------------------------------------------------
// Ledger records
// ---------------------------------------------------------------------------

pub fn create(
    conn: &Connection,
    student: &Student,
    amount: Decimal,
    source: CreditSource,
    description: &str,
    payment_id: Option<i64>,
    created_by: Option<&str>,
) -> Result<Credit> {
    let amount = amount.round_dp(2);
    if amount <= Decimal::ZERO {
        return Err(BursarError::InvalidAmount(amount.to_string()));
    }
    let id = insert_credit(
        conn,
        &NewCredit {
            student,
            amount,
            source,
            description,
            payment_id,
            parent_credit_id: None,
            created_by,
        },
    )?;
    info!(credit_id = id, student = %student.student_no, %amount, source = source.key(), "credit created");
    get(conn, student.school_id, id)
}

pub fn get(conn: &Connection, school_id: i64, credit_id: i64) -> Result<Credit> {
    let sql = format!("SELECT {CREDIT_COLUMNS} FROM credits WHERE id = ?1 AND school_id = ?2");
    conn.query_row(&sql, rusqlite::params![credit_id, school_id], credit_from_row)
        .optional()?
        .ok_or(BursarError::UnknownCredit(credit_id))
}

pub fn list(conn: &Connection, school_id: i64, filter: &CreditFilter) -> Result<Vec<Credit>> {
    let sql = format!(
        "SELECT {CREDIT_COLUMNS} FROM credits WHERE school_id = ?1 \
         AND (?2 IS NULL OR student_id = ?2) AND (?3 = 1 OR is_applied = 0) \
         ORDER BY created_at, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            rusqlite::params![school_id, filter.student_id, filter.include_applied],
            credit_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Remove an unapplied credit. Applied credits are permanent.
pub fn delete(conn: &Connection, school_id: i64, credit_id: i64) -> Result<()> {
    let credit = get(conn, school_id, credit_id)?;
    if credit.is_applied {
        return Err(BursarError::AlreadyApplied(credit_id));
    }
    conn.execute("DELETE FROM credits WHERE id = ?1 AND is_applied = 0", [credit_id])?;
    info!(credit_id, "credit deleted");
    Ok(())
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

fn apply_in(
    conn: &Connection,
    school_id: i64,
    credit_id: i64,
    target: Option<i64>,
    operator: Option<&str>,
) -> Result<AppliedResult> {
    let credit = get(conn, school_id, credit_id)?;
    if credit.is_applied {
        return Err(BursarError::AlreadyApplied(credit_id));
    }
    let student = get_student(conn, credit.student_id)?;
    let outstanding = balances(conn, &student)?;
    match target {
        Some(t) if !outstanding.iter().any(|b| b.fee_id == t) => {
            return Err(BursarError::ObligationNotFound(t));
        }
        None if outstanding.is_empty() => {
            return Err(BursarError::NoOutstandingObligation(student.student_no.clone()));
        }
        _ => {}
    }

    let plan = allocate(credit.amount, &outstanding, target, AllocationOrder::OldestFirst);
    let Some(applied_to) = plan.primary_fee() else {
        return Err(BursarError::NoOutstandingObligation(student.student_no.clone()));
    };
    apply_plan(conn, school_id, &plan, AllocationSource::Credit(credit_id), operator)?;

    let n = conn.execute(
        "UPDATE credits SET is_applied = 1, applied_to_fee_id = ?1, applied_at = datetime('now') \
         WHERE id = ?2 AND is_applied = 0",
        rusqlite::params![applied_to, credit_id],
    )?;
    if n == 0 {
        return Err(BursarError::AlreadyApplied(credit_id));
    }

    let remainder_credit_id = if plan.has_remainder() {
        let description = format!("Remainder of credit {credit_id}");
        Some(insert_credit(
            conn,
            &NewCredit {
                student: &student,
                amount: plan.remainder,
                source: credit.source,
                description: &description,
                payment_id: credit.payment_id,
                parent_credit_id: Some(credit_id),
                created_by: operator,
            },
        )?)
    } else {
        None
    };

    Ok(AppliedResult {
        credit_id,
        student_id: student.id,
        applied_to,
        applied_amount: plan.allocated(),
        allocations: plan.allocations,
        remainder_credit_id,
        remainder: if remainder_credit_id.is_some() { plan.remainder } else { Decimal::ZERO },
    })
}

/// Apply one unapplied credit to the student's outstanding obligations, or
/// to `target` only. Runs as one immediate transaction.
pub fn apply(
    conn: &mut Connection,
    school_id: i64,
    credit_id: i64,
    target: Option<i64>,
    operator: Option<&str>,
) -> Result<AppliedResult> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let result = apply_in(&tx, school_id, credit_id, target, operator)?;
    tx.commit()?;
    info!(
        credit_id,
        applied_to = result.applied_to,
        amount = %result.applied_amount,
        remainder = %result.remainder,
        "credit applied"
    );
    Ok(result)
}

/// Apply every unapplied credit in scope, each in its own transaction.
/// Credits whose student has nothing outstanding are skipped.
pub fn apply_all(
    conn: &mut Connection,
    school_id: i64,
    scope: CreditScope,
    operator: Option<&str>,
) -> Result<ApplyAllSummary> {
    let filter = CreditFilter {
        student_id: match scope {
            CreditScope::Student(id) => Some(id),
            CreditScope::School => None,
        },
        include_applied: false,
    };
    let pending: Vec<i64> = list(conn, school_id, &filter)?.into_iter().map(|c| c.id).collect();

    let mut summary = ApplyAllSummary::default();
    for credit_id in pending {
        match apply(conn, school_id, credit_id, None, operator) {
            Ok(result) => {
                summary.applied += 1;
                summary.total_applied += result.applied_amount;
                summary.results.push(result);
            }
            Err(BursarError::NoOutstandingObligation(_)) => summary.skipped += 1,
            Err(e) => return Err(e),
        }
    }
    info!(applied = summary.applied, skipped = summary.skipped, total = %summary.total_applied, "apply-all finished");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{get_connection, init_db};
    use crate::posting::allocations_for;
    use crate::store::{add_fee, add_school, add_student, find_student, get_obligation, mutate_obligation};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn test_db() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = get_connection(&dir.path().join("test.db")).unwrap();
        init_db(&conn).unwrap();
        (dir, conn)
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn seed_student(conn: &Connection, school: i64, no: &str) -> Student {
        add_student(conn, school, no, "Student").unwrap();
        find_student(conn, school, no).unwrap().unwrap()
    }

    #[test]
    fn test_create_rejects_non_positive() {
        let (_dir, conn) = test_db();
        let school = add_school(&conn, "Hillcrest").unwrap();
        let s = seed_student(&conn, school, "00001");
        assert!(create(&conn, &s, dec!(0), CreditSource::Manual, "", None, None).is_err());
        assert!(create(&conn, &s, dec!(-5), CreditSource::Manual, "", None, None).is_err());
        let c = create(&conn, &s, dec!(25), CreditSource::Refund, "refund", None, Some("ops")).unwrap();
        assert!(!c.is_applied);
        assert_eq!(c.source, CreditSource::Refund);
    }

    #[test]
    fn test_apply_partial_creates_remainder_credit() {
        let (_dir, mut conn) = test_db();
        let school = add_school(&conn, "Hillcrest").unwrap();
        let s = seed_student(&conn, school, "00001");
        let fee = add_fee(&conn, &s, "Tuition", "T1", dec!(30), date("2024-01-01")).unwrap();
        let credit = create(&conn, &s, dec!(50), CreditSource::Overpayment, "", None, None).unwrap();

        let result = apply(&mut conn, school, credit.id, None, Some("ops")).unwrap();
        assert_eq!(result.applied_to, fee);
        assert_eq!(result.applied_amount, dec!(30));
        assert_eq!(result.remainder, dec!(20));

        let original = get(&conn, school, credit.id).unwrap();
        assert!(original.is_applied);
        assert_eq!(original.amount, dec!(50));
        assert_eq!(original.applied_to_fee_id, Some(fee));

        let rest = get(&conn, school, result.remainder_credit_id.unwrap()).unwrap();
        assert_eq!(rest.amount, dec!(20));
        assert_eq!(rest.parent_credit_id, Some(credit.id));
        assert_eq!(rest.source, CreditSource::Overpayment);
        assert!(!rest.is_applied);

        let allocs = allocations_for(&conn, AllocationSource::Credit(credit.id)).unwrap();
        assert_eq!(allocs.len(), 1);
        assert!(allocs[0].payment_id.is_none());
        assert!(get_obligation(&conn, fee).unwrap().unwrap().is_paid);
    }

    #[test]
    fn test_reapply_fails_and_mutates_nothing() {
        let (_dir, mut conn) = test_db();
        let school = add_school(&conn, "Hillcrest").unwrap();
        let s = seed_student(&conn, school, "00001");
        let fee = add_fee(&conn, &s, "Tuition", "T1", dec!(100), date("2024-01-01")).unwrap();
        let credit = create(&conn, &s, dec!(40), CreditSource::Manual, "", None, None).unwrap();
        apply(&mut conn, school, credit.id, None, None).unwrap();
        let before = get(&conn, school, credit.id).unwrap();

        let err = apply(&mut conn, school, credit.id, None, None).unwrap_err();
        assert!(matches!(err, BursarError::AlreadyApplied(_)));
        let after = get(&conn, school, credit.id).unwrap();
        assert_eq!(after.applied_at, before.applied_at);
        assert_eq!(get_obligation(&conn, fee).unwrap().unwrap().amount_paid, dec!(40));
        assert!(matches!(delete(&conn, school, credit.id), Err(BursarError::AlreadyApplied(_))));
    }

    #[test]
    fn test_apply_without_outstanding_is_rejected() {
        let (_dir, mut conn) = test_db();
        let school = add_school(&conn, "Hillcrest").unwrap();
        let s = seed_student(&conn, school, "00001");
        let fee = add_fee(&conn, &s, "Tuition", "T1", dec!(10), date("2024-01-01")).unwrap();
        mutate_obligation(&conn, fee, dec!(10), true).unwrap();
        let credit = create(&conn, &s, dec!(40), CreditSource::Manual, "", None, None).unwrap();

        assert!(matches!(
            apply(&mut conn, school, credit.id, None, None),
            Err(BursarError::NoOutstandingObligation(_))
        ));
        assert!(matches!(
            apply(&mut conn, school, credit.id, Some(fee), None),
            Err(BursarError::ObligationNotFound(_))
        ));
        assert!(!get(&conn, school, credit.id).unwrap().is_applied);
    }

    #[test]
    fn test_apply_to_target_only() {
        let (_dir, mut conn) = test_db();
        let school = add_school(&conn, "Hillcrest").unwrap();
        let s = seed_student(&conn, school, "00001");
        let old = add_fee(&conn, &s, "Tuition", "T1", dec!(100), date("2024-01-01")).unwrap();
        let newer = add_fee(&conn, &s, "Transport", "T1", dec!(100), date("2024-02-01")).unwrap();
        let credit = create(&conn, &s, dec!(60), CreditSource::Adjustment, "", None, None).unwrap();
        let result = apply(&mut conn, school, credit.id, Some(newer), None).unwrap();
        assert_eq!(result.applied_to, newer);
        assert_eq!(get_obligation(&conn, old).unwrap().unwrap().amount_paid, dec!(0));
        assert_eq!(get_obligation(&conn, newer).unwrap().unwrap().amount_paid, dec!(60));
    }

    #[test]
    fn test_apply_all_skips_students_with_nothing_due() {
        let (_dir, mut conn) = test_db();
        let school = add_school(&conn, "Hillcrest").unwrap();
        let a = seed_student(&conn, school, "00001");
        let b = seed_student(&conn, school, "00002");
        add_fee(&conn, &a, "Tuition", "T1", dec!(100), date("2024-01-01")).unwrap();
        create(&conn, &a, dec!(30), CreditSource::Overpayment, "", None, None).unwrap();
        create(&conn, &b, dec!(30), CreditSource::Overpayment, "", None, None).unwrap();

        let summary = apply_all(&mut conn, school, CreditScope::School, None).unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.total_applied, dec!(30));

        let open = list(&conn, school, &CreditFilter::default()).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].student_id, b.id);
        let everything = list(&conn, school, &CreditFilter { student_id: None, include_applied: true }).unwrap();
        assert_eq!(everything.len(), 2);
    }

    #[test]
    fn test_delete_unapplied() {
        let (_dir, conn) = test_db();
        let school = add_school(&conn, "Hillcrest").unwrap();
        let s = seed_student(&conn, school, "00001");
        let credit = create(&conn, &s, dec!(5), CreditSource::Manual, "", None, None).unwrap();
        delete(&conn, school, credit.id).unwrap();
        assert!(matches!(get(&conn, school, credit.id), Err(BursarError::UnknownCredit(_))));
    }
}
