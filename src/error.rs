use thiserror::Error;

#[derive(Error, Debug)]
pub enum BursarError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("Unknown pattern: {0}")]
    UnknownPattern(i64),

    #[error("Pattern {0} is inactive")]
    InactivePattern(i64),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Unknown school: {0}")]
    UnknownSchool(i64),

    #[error("Unknown student: {0}")]
    UnknownStudent(String),

    #[error("Unknown payment: {0}")]
    UnknownPayment(i64),

    #[error("Unknown credit: {0}")]
    UnknownCredit(i64),

    #[error("Unknown unresolved transaction: {0}")]
    UnknownUnresolved(i64),

    #[error("Obligation {0} not found or already settled for this student")]
    ObligationNotFound(i64),

    #[error("No outstanding obligations for student {0}")]
    NoOutstandingObligation(String),

    #[error("Student {0} has no fee history")]
    NoObligationHistory(String),

    #[error("Credit {0} has already been applied")]
    AlreadyApplied(i64),

    #[error("Unresolved transaction {id} is {status}, expected unmatched")]
    InvalidTransition { id: i64, status: String },

    #[error("Obligation {fee_id}: amount paid {amount_paid} outside 0..={amount_charged}")]
    BalanceOverflow {
        fee_id: i64,
        amount_paid: String,
        amount_charged: String,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Undecodable statement: {0}")]
    UndecodableStatement(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, BursarError>;
