pub mod balance;
pub mod credits;
pub mod fees;
pub mod init;
pub mod patterns;
pub mod school;
pub mod status;
pub mod students;
pub mod unresolved;
pub mod upload;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use rust_decimal::Decimal;

use crate::db::get_connection;
use crate::error::{BursarError, Result};
use crate::models::Student;
use crate::settings::Settings;
use crate::store::find_student;

/// Open the configured database; a missing file means `init` never ran.
pub(crate) fn open_db(settings: &Settings) -> Result<Connection> {
    let db_path = settings.db_path();
    if !db_path.exists() {
        return Err(BursarError::Settings(format!(
            "No database found at {}\nRun `bursar init` to set up.",
            db_path.display()
        )));
    }
    get_connection(&db_path)
}

pub(crate) fn require_student(conn: &Connection, settings: &Settings, student_no: &str) -> Result<Student> {
    find_student(conn, settings.school_id, student_no)?
        .ok_or_else(|| BursarError::UnknownStudent(student_no.to_string()))
}

pub(crate) fn or_dash(value: Option<&str>) -> &str {
    value.filter(|v| !v.is_empty()).unwrap_or("-")
}

#[derive(Parser)]
#[command(
    name = "bursar",
    version,
    about = "Reconcile bank statements against student fee obligations."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Set up bursar: choose a data directory and initialize the database.
    Init {
        /// Path for bursar data (default: ~/Documents/bursar)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Show current database and queue statistics.
    Status,
    /// Manage schools.
    School {
        #[command(subcommand)]
        command: SchoolCommands,
    },
    /// Manage students.
    Students {
        #[command(subcommand)]
        command: StudentsCommands,
    },
    /// Manage fee obligations.
    Fees {
        #[command(subcommand)]
        command: FeesCommands,
    },
    /// Show a student's obligations and running balance.
    Balance {
        /// Student number, e.g. 00001
        student: String,
    },
    /// Manage statement patterns.
    Patterns {
        #[command(subcommand)]
        command: PatternsCommands,
    },
    /// Process a bank statement file against a pattern.
    Upload {
        /// Path to the statement file
        file: String,
        /// Pattern ID (shown in `bursar patterns list`)
        #[arg(long)]
        pattern: i64,
        /// Print every processed row
        #[arg(long)]
        verbose: bool,
    },
    /// Inspect past uploads.
    Uploads {
        #[command(subcommand)]
        command: UploadsCommands,
    },
    /// Review transactions the automatic pass could not match.
    Unresolved {
        #[command(subcommand)]
        command: UnresolvedCommands,
    },
    /// Manage student credits.
    Credits {
        #[command(subcommand)]
        command: CreditsCommands,
    },
}

#[derive(Subcommand)]
pub enum SchoolCommands {
    /// Add a school. The first school becomes the active one.
    Add {
        /// School name
        name: String,
    },
    /// List schools.
    List,
    /// Switch the active school.
    Use {
        /// School ID
        id: i64,
    },
}

#[derive(Subcommand)]
pub enum StudentsCommands {
    /// Add a student to the active school.
    Add {
        /// Student number as it appears in statement narratives
        student: String,
        /// Full name
        #[arg(long)]
        name: String,
    },
    /// List students of the active school.
    List,
}

#[derive(Subcommand)]
pub enum FeesCommands {
    /// Charge a student for one fee category and term.
    Add {
        /// Student number
        student: String,
        /// Fee category, e.g. Tuition
        #[arg(long)]
        category: String,
        /// Term label, e.g. 2024-T1
        #[arg(long)]
        term: String,
        /// Amount charged
        #[arg(long)]
        amount: Decimal,
        /// Due date: YYYY-MM-DD
        #[arg(long)]
        due: NaiveDate,
    },
}

#[derive(Subcommand)]
pub enum PatternsCommands {
    /// Register a statement pattern.
    Add {
        /// Bank name
        #[arg(long)]
        bank: String,
        /// Pattern name
        #[arg(long)]
        name: String,
        /// Provider: mpesa_paybill, bank_transfer
        #[arg(long, default_value = "bank_transfer")]
        provider: String,
        /// Date column: header name or 0-based index
        #[arg(long = "date-column")]
        date_column: String,
        /// Amount column: header name or 0-based index
        #[arg(long = "amount-column")]
        amount_column: String,
        /// Narrative column: header name or 0-based index
        #[arg(long = "narrative-column")]
        narrative_column: String,
        /// Bank reference column: header name or 0-based index
        #[arg(long = "reference-column")]
        reference_column: Option<String>,
        /// Regex whose first group is the student number
        #[arg(long = "student-regex")]
        student_regex: Option<String>,
        /// Regex whose first group is the provider reference
        #[arg(long = "provider-ref-regex")]
        provider_ref_regex: Option<String>,
        /// Regex whose first group is the payer's mobile number
        #[arg(long = "mobile-regex")]
        mobile_regex: Option<String>,
        /// chrono date format
        #[arg(long = "date-format", default_value = "%Y-%m-%d")]
        date_format: String,
        /// The file has no header row
        #[arg(long = "no-header")]
        no_header: bool,
        /// Delimiter: comma, semicolon, tab, pipe
        #[arg(long, default_value = "comma")]
        delimiter: String,
        /// Text encoding label
        #[arg(long, default_value = "utf-8")]
        encoding: String,
    },
    /// List patterns of the active school.
    List,
    /// Deactivate a pattern by ID.
    Deactivate {
        /// Pattern ID (shown in `bursar patterns list`)
        id: i64,
    },
}

#[derive(Subcommand)]
pub enum UploadsCommands {
    /// List recent uploads.
    List {
        /// Number of uploads to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
pub enum UnresolvedCommands {
    /// List unresolved transactions.
    List {
        /// Status: unmatched, matched, ignored (default: unmatched)
        #[arg(long)]
        status: Option<String>,
        /// Start date: YYYY-MM-DD
        #[arg(long = "from")]
        from_date: Option<NaiveDate>,
        /// End date: YYYY-MM-DD
        #[arg(long = "to")]
        to_date: Option<NaiveDate>,
        /// Text to search in narratives, student numbers and names
        #[arg(long)]
        search: Option<String>,
    },
    /// Show one record with candidate payments.
    Show {
        id: i64,
    },
    /// Resolve a record against a payment or a student.
    Match {
        id: i64,
        /// Link to an existing payment
        #[arg(long, conflicts_with = "student", required_unless_present = "student")]
        payment: Option<i64>,
        /// Post a new payment for this student
        #[arg(long)]
        student: Option<String>,
        /// Apply the whole amount to this obligation first
        #[arg(long, requires = "student")]
        fee: Option<i64>,
        /// Operator notes
        #[arg(long)]
        notes: Option<String>,
    },
    /// Mark a record as ignored.
    Ignore {
        id: i64,
        /// Operator notes
        #[arg(long)]
        notes: Option<String>,
    },
    /// Delete an unmatched record.
    Delete {
        id: i64,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub enum CreditsCommands {
    /// List credits.
    List {
        /// Only this student's credits
        #[arg(long)]
        student: Option<String>,
        /// Include applied credits
        #[arg(long)]
        all: bool,
    },
    /// Record a credit for a student.
    Add {
        /// Student number
        student: String,
        #[arg(long)]
        amount: Decimal,
        /// Source: overpayment, refund, adjustment, reassignment, manual
        #[arg(long, default_value = "manual")]
        source: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Apply one credit to outstanding obligations.
    Apply {
        id: i64,
        /// Apply to this obligation only
        #[arg(long)]
        fee: Option<i64>,
    },
    /// Apply every unapplied credit.
    ApplyAll {
        /// Only this student's credits
        #[arg(long)]
        student: Option<String>,
    },
    /// Delete an unapplied credit.
    Delete {
        id: i64,
    },
}
