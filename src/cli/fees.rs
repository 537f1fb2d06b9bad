use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::cli::{open_db, require_student};
use crate::error::Result;
use crate::fmt::money;
use crate::settings::load_settings;
use crate::store::add_fee;

pub fn add(student_no: &str, category: &str, term: &str, amount: Decimal, due: NaiveDate) -> Result<()> {
    let settings = load_settings();
    let conn = open_db(&settings)?;
    let student = require_student(&conn, &settings, student_no)?;
    let id = add_fee(&conn, &student, category.trim(), term.trim(), amount, due)?;
    println!(
        "Added obligation {id}: {} {category} {term}, {} due {due}",
        student.student_no,
        money(amount)
    );
    Ok(())
}
