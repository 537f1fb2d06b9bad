use chrono::NaiveDate;
use rust_decimal::Decimal;

// ---------------------------------------------------------------------------
// Stored enums: each maps to a TEXT key column
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Processing,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMethod {
    Mpesa,
    Cash,
    BankTransfer,
    Cheque,
}

impl PaymentMethod {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Mpesa => "mpesa",
            Self::Cash => "cash",
            Self::BankTransfer => "bank_transfer",
            Self::Cheque => "cheque",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "mpesa" => Some(Self::Mpesa),
            "cash" => Some(Self::Cash),
            "bank_transfer" => Some(Self::BankTransfer),
            "cheque" => Some(Self::Cheque),
            _ => None,
        }
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditSource {
    Overpayment,
    Refund,
    Adjustment,
    Reassignment,
    Manual,
}

impl CreditSource {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Overpayment => "overpayment",
            Self::Refund => "refund",
            Self::Adjustment => "adjustment",
            Self::Reassignment => "reassignment",
            Self::Manual => "manual",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "overpayment" => Some(Self::Overpayment),
            "refund" => Some(Self::Refund),
            "adjustment" => Some(Self::Adjustment),
            "reassignment" => Some(Self::Reassignment),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedStatus {
    Unmatched,
    Matched,
    Ignored,
}

impl UnresolvedStatus {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Unmatched => "unmatched",
            Self::Matched => "matched",
            Self::Ignored => "ignored",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "unmatched" => Some(Self::Unmatched),
            "matched" => Some(Self::Matched),
            "ignored" => Some(Self::Ignored),
            _ => None,
        }
    }
}

/// Why the automatic pass parked a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedReason {
    NoStudentId,
    StudentNotFound,
    NoOutstandingObligation,
    NoObligationHistory,
    PersistenceFailure,
}

impl UnresolvedReason {
    pub fn key(&self) -> &'static str {
        match self {
            Self::NoStudentId => "no_student_id",
            Self::StudentNotFound => "student_not_found",
            Self::NoOutstandingObligation => "no_outstanding_obligation",
            Self::NoObligationHistory => "no_obligation_history",
            Self::PersistenceFailure => "persistence_failure",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "no_student_id" => Some(Self::NoStudentId),
            "student_not_found" => Some(Self::StudentNotFound),
            "no_outstanding_obligation" => Some(Self::NoOutstandingObligation),
            "no_obligation_history" => Some(Self::NoObligationHistory),
            "persistence_failure" => Some(Self::PersistenceFailure),
            _ => None,
        }
    }
}

/// Maps an unknown stored key to a rusqlite conversion error.
pub fn bad_key(idx: usize, key: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unknown key: {key}").into(),
    )
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct Student {
    pub id: i64,
    pub school_id: i64,
    pub student_no: String,
    pub full_name: String,
}

/// A student's charge for one fee category and term ("StudentFee").
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct Obligation {
    pub id: i64,
    pub school_id: i64,
    pub student_id: i64,
    pub category: String,
    pub term: String,
    pub amount_charged: Decimal,
    pub amount_paid: Decimal,
    pub is_paid: bool,
    pub due_date: NaiveDate,
}

impl Obligation {
    pub fn outstanding(&self) -> Decimal {
        self.amount_charged - self.amount_paid
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct Receivable {
    pub id: i64,
    pub student_id: i64,
    pub fee_id: i64,
    pub amount_due: Decimal,
    pub amount_paid: Decimal,
    pub due_date: NaiveDate,
    pub is_cleared: bool,
    pub cleared_at: Option<String>,
}

impl Receivable {
    pub fn balance(&self) -> Decimal {
        self.amount_due - self.amount_paid
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct Payment {
    pub id: i64,
    pub school_id: i64,
    pub student_id: i64,
    pub fee_id: i64,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub reference_number: String,
    pub transaction_id: String,
    pub bank_reference: Option<String>,
    pub payment_date: NaiveDate,
    pub processed_by: Option<String>,
    pub notes: Option<String>,
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct Allocation {
    pub id: i64,
    pub payment_id: Option<i64>,
    pub credit_id: Option<i64>,
    pub fee_id: i64,
    pub amount: Decimal,
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct Credit {
    pub id: i64,
    pub school_id: i64,
    pub student_id: i64,
    pub amount: Decimal,
    pub source: CreditSource,
    pub description: String,
    pub payment_id: Option<i64>,
    pub parent_credit_id: Option<i64>,
    pub is_applied: bool,
    pub applied_to_fee_id: Option<i64>,
    pub applied_at: Option<String>,
    pub created_at: String,
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct UnresolvedTransaction {
    pub id: i64,
    pub school_id: i64,
    pub upload_id: Option<i64>,
    pub transaction_date: NaiveDate,
    pub amount: Decimal,
    pub narrative: String,
    pub bank_reference: Option<String>,
    pub provider_reference: Option<String>,
    pub mobile_number: Option<String>,
    pub payer_name: Option<String>,
    pub extracted_student_no: Option<String>,
    pub status: UnresolvedStatus,
    pub reason: UnresolvedReason,
    pub matched_payment_id: Option<i64>,
    pub matched_student_id: Option<i64>,
    pub notes: String,
    pub matched_by: Option<String>,
    pub matched_at: Option<String>,
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub id: i64,
    pub school_id: i64,
    pub pattern_id: Option<i64>,
    pub file_name: String,
    pub checksum: String,
    pub status: UploadStatus,
    pub total: i64,
    pub matched: i64,
    pub unmatched: i64,
    pub duplicate: i64,
    pub error_message: Option<String>,
    pub uploaded_at: String,
    pub processed_at: Option<String>,
}

/// One typed statement line, after date/amount conversion and narrative
/// extraction, before any matching.
#[derive(Debug, Clone)]
pub struct ParsedTransaction {
    pub line: usize,
    pub date: NaiveDate,
    pub amount: Decimal,
    pub narrative: String,
    pub provider_reference: Option<String>,
    pub mobile_number: Option<String>,
    pub payer_name: Option<String>,
    pub student_no: Option<String>,
    pub bank_reference: Option<String>,
}
