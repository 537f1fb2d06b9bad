//! Narrative extraction.
//!
//! M-Pesa paybill narratives look like
//! `MPS 254721266013 TK18K8USG7 064010#00001 SAMUEL KAGIRI`:
//! mobile, provider reference, `<business>#<student>`, payer name.

use regex::{Captures, Regex};

use crate::error::Result;
use crate::patterns::ExtractionRules;

const PROVIDER_REF_WIDTH: usize = 50;
const MOBILE_WIDTH: usize = 15;
const BANK_REF_WIDTH: usize = 100;
const PAYER_NAME_WIDTH: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NarrativeDetails {
    pub provider_reference: Option<String>,
    pub mobile_number: Option<String>,
    pub student_no: Option<String>,
    pub payer_name: Option<String>,
}

pub struct Extractor {
    rules: ExtractionRules,
    mobile: Regex,
    account_payer: Regex,
    student_hash: Regex,
    fallback_ref: Regex,
}

fn truncate(value: &str, width: usize) -> String {
    value.chars().take(width).collect()
}

/// Group 1 when the pattern has one and it participated, else the whole match.
fn first_group(caps: &Captures) -> Option<String> {
    caps.get(1)
        .or_else(|| caps.get(0))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// 8-12 upper-case alphanumerics, at least two leading letters, at least one digit.
fn looks_like_provider_ref(token: &str) -> bool {
    let len = token.len();
    if !(8..=12).contains(&len) {
        return false;
    }
    if !token.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
        return false;
    }
    let mut chars = token.chars();
    let leading = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    leading && token.chars().any(|c| c.is_ascii_digit())
}

impl Extractor {
    pub fn new(rules: ExtractionRules) -> Result<Self> {
        Ok(Self {
            rules,
            mobile: Regex::new(r"\b(254\d{9})\b")?,
            account_payer: Regex::new(r"\d+#\d+\s+(.+)")?,
            student_hash: Regex::new(r"#(\d+)")?,
            fallback_ref: Regex::new(r"\b([A-Z0-9]{8,15})\b")?,
        })
    }

    pub fn extract(&self, narrative: &str) -> NarrativeDetails {
        let narrative = narrative.trim();
        if narrative.is_empty() {
            return NarrativeDetails::default();
        }
        let mut details = NarrativeDetails {
            provider_reference: self.provider_reference(narrative),
            mobile_number: self.mobile_number(narrative),
            ..Default::default()
        };

        details.payer_name = self
            .account_payer
            .captures(narrative)
            .and_then(|c| first_group(&c))
            .map(|n| truncate(&n, PAYER_NAME_WIDTH));
        details.student_no = self.student_no(narrative);
        details
    }

    fn provider_reference(&self, narrative: &str) -> Option<String> {
        let found = match &self.rules.provider_ref {
            Some(custom) => custom.captures(narrative).and_then(|c| first_group(&c)),
            None if self.rules.provider.uses_mpesa_heuristics() => narrative
                .split(|c: char| !c.is_ascii_alphanumeric())
                .find(|t| looks_like_provider_ref(t))
                .map(str::to_string),
            None => None,
        };
        found.map(|r| truncate(&r, PROVIDER_REF_WIDTH))
    }

    fn mobile_number(&self, narrative: &str) -> Option<String> {
        let found = match &self.rules.mobile {
            Some(custom) => custom.captures(narrative).and_then(|c| first_group(&c)),
            None if self.rules.provider.uses_mpesa_heuristics() => self
                .mobile
                .captures(narrative)
                .and_then(|c| first_group(&c)),
            None => None,
        };
        found.map(|m| truncate(&m, MOBILE_WIDTH))
    }

    fn student_no(&self, narrative: &str) -> Option<String> {
        if let Some(custom) = &self.rules.student_id {
            if let Some(id) = custom.captures(narrative).and_then(|c| first_group(&c)) {
                return Some(id);
            }
        }
        self.student_hash
            .captures(narrative)
            .and_then(|c| first_group(&c))
    }

    /// Identity reference for a row: the explicit reference column, then the
    /// provider reference, then any 8-15 character alphanumeric token.
    pub fn choose_bank_reference(
        &self,
        explicit: Option<&str>,
        details: &NarrativeDetails,
        narrative: &str,
    ) -> Option<String> {
        let chosen = explicit
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| details.provider_reference.clone())
            .or_else(|| {
                self.fallback_ref
                    .captures(narrative)
                    .and_then(|c| first_group(&c))
            });
        chosen.map(|r| truncate(&r, BANK_REF_WIDTH))
    }
}
