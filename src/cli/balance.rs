use std::collections::HashMap;

use colored::Colorize;
use comfy_table::{Cell, Table};
use rust_decimal::Decimal;

use crate::cli::{open_db, require_student};
use crate::error::Result;
use crate::fmt::money;
use crate::receivables::{list_receivables, student_balance};
use crate::settings::load_settings;
use crate::store::student_obligations;

pub fn run(student_no: &str) -> Result<()> {
    let settings = load_settings();
    let conn = open_db(&settings)?;
    let student = require_student(&conn, &settings, student_no)?;

    let ledger: HashMap<i64, bool> = list_receivables(&conn, &student)?
        .into_iter()
        .map(|r| (r.fee_id, r.is_cleared))
        .collect();

    let mut table = Table::new();
    table.set_header(vec!["ID", "Category", "Term", "Due", "Charged", "Paid", "Outstanding", "Receivable"]);
    for fee in student_obligations(&conn, &student)? {
        let receivable = match ledger.get(&fee.id) {
            Some(true) => "cleared",
            Some(false) => "open",
            None => "-",
        };
        table.add_row(vec![
            Cell::new(fee.id),
            Cell::new(&fee.category),
            Cell::new(&fee.term),
            Cell::new(fee.due_date),
            Cell::new(money(fee.amount_charged)),
            Cell::new(money(fee.amount_paid)),
            Cell::new(money(fee.outstanding())),
            Cell::new(receivable),
        ]);
    }
    println!("{} {}\n{table}", student.student_no, student.full_name);

    let summary = student_balance(&conn, &student)?;
    println!("Charged:          {}", money(summary.total_charged));
    println!("Paid:             {}", money(summary.total_paid));
    println!("Outstanding:      {}", money(summary.outstanding));
    println!("Unapplied credit: {}", money(summary.unapplied_credit));
    let net = summary.net_due();
    let line = format!("Net due:          {}", money(net));
    if net > Decimal::ZERO {
        println!("{}", line.red());
    } else {
        println!("{}", line.green());
    }
    Ok(())
}
