//! Pure allocation of an amount across outstanding obligations.
//!
//! Nothing here touches the database: callers pass balances read inside their
//! own transaction and persist the resulting plan through `posting`.

use std::cmp::Ordering;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::models::Obligation;

/// Amounts at or below this are treated as fully placed.
pub fn epsilon() -> Decimal {
    Decimal::new(1, 4)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationOrder {
    /// Due date ascending, then smallest outstanding first. Automatic matching.
    OldestFirst,
    /// Largest outstanding first, then due date. Operator matching.
    LargestFirst,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutstandingBalance {
    pub fee_id: i64,
    pub due_date: NaiveDate,
    pub outstanding: Decimal,
}

impl From<&Obligation> for OutstandingBalance {
    fn from(o: &Obligation) -> Self {
        Self {
            fee_id: o.id,
            due_date: o.due_date,
            outstanding: o.outstanding(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedAllocation {
    pub fee_id: i64,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPlan {
    pub allocations: Vec<PlannedAllocation>,
    pub remainder: Decimal,
}

impl AllocationPlan {
    pub fn allocated(&self) -> Decimal {
        self.allocations.iter().map(|a| a.amount).sum()
    }

    /// First obligation that received money.
    pub fn primary_fee(&self) -> Option<i64> {
        self.allocations.first().map(|a| a.fee_id)
    }

    pub fn has_remainder(&self) -> bool {
        self.remainder > epsilon()
    }
}

fn compare(order: AllocationOrder, a: &OutstandingBalance, b: &OutstandingBalance) -> Ordering {
    match order {
        AllocationOrder::OldestFirst => a
            .due_date
            .cmp(&b.due_date)
            .then(a.outstanding.cmp(&b.outstanding))
            .then(a.fee_id.cmp(&b.fee_id)),
        AllocationOrder::LargestFirst => b
            .outstanding
            .cmp(&a.outstanding)
            .then(a.due_date.cmp(&b.due_date))
            .then(a.fee_id.cmp(&b.fee_id)),
    }
}

/// Distribute `amount` over `balances`. With a `target`, only that obligation
/// is considered. Each allocation is capped at the obligation's outstanding
/// balance and the total never exceeds `amount`.
pub fn allocate(
    amount: Decimal,
    balances: &[OutstandingBalance],
    target: Option<i64>,
    order: AllocationOrder,
) -> AllocationPlan {
    let mut candidates: Vec<&OutstandingBalance> = balances
        .iter()
        .filter(|b| b.outstanding > Decimal::ZERO)
        .filter(|b| target.map_or(true, |t| b.fee_id == t))
        .collect();
    candidates.sort_by(|a, b| compare(order, a, b));

    let mut remaining = amount.max(Decimal::ZERO);
    let mut allocations = Vec::new();
    for balance in candidates {
        if remaining <= epsilon() {
            break;
        }
        let placed = remaining.min(balance.outstanding);
        allocations.push(PlannedAllocation {
            fee_id: balance.fee_id,
            amount: placed,
        });
        remaining -= placed;
    }

    AllocationPlan {
        allocations,
        remainder: remaining,
    }
}
