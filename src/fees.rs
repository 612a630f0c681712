use chrono::{DateTime, Utc};

const MS_PER_DAY: i64 = 86_400_000;

#[derive(Debug, Clone)]
pub struct DueDate {
    pub date: DateTime<Utc>,
    pub amount: f64,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct LateFeePolicy {
    pub rate_per_day: f64,
    pub maximum: f64,
}

/// The computed inputs of a fee plan. total_amount is taken as given and is
/// deliberately not reconciled against the sum of the due-date amounts; the
/// school uses the mismatch as a manual override.
#[derive(Debug, Clone)]
pub struct PlanTerms {
    pub total_amount: f64,
    pub due_dates: Vec<DueDate>,
    pub late_fee: Option<LateFeePolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeStatus {
    Paid,
    Overdue,
    PartiallyPaid,
    Pending,
}

impl FeeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::Overdue => "overdue",
            Self::PartiallyPaid => "partially_paid",
            Self::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeeSummary {
    pub total_amount: f64,
    pub amount_paid: f64,
    pub remaining_amount: f64,
    pub next_due_date: Option<DateTime<Utc>>,
    pub next_due_amount: Option<f64>,
    pub late_fee: f64,
    pub days_overdue: i64,
    pub status: FeeStatus,
}

/// Floor division of the millisecond difference by a day; a due date less
/// than 24h in the past counts as 0 days overdue.
fn days_past(now: DateTime<Utc>, due: DateTime<Utc>) -> i64 {
    (now - due).num_milliseconds().div_euclid(MS_PER_DAY)
}

/// Reduces a plan's due-date schedule and payment history into a summary.
///
/// Payments are consumed in aggregate against the schedule's running total,
/// not matched to individual due dates. A due date is unsatisfied while the
/// total paid is below the cumulative amount due through it; its unpaid
/// share is that shortfall. The late fee is the single worst capped fee
/// across past-due unsatisfied dates, never a sum.
pub fn payment_summary(plan: &PlanTerms, payment_amounts: &[f64], now: DateTime<Utc>) -> FeeSummary {
    let amount_paid: f64 = payment_amounts.iter().sum();
    let remaining_amount = plan.total_amount - amount_paid;

    let mut schedule = plan.due_dates.clone();
    schedule.sort_by(|a, b| a.date.cmp(&b.date));

    let mut running_total = 0.0_f64;
    let mut next_due: Option<(DateTime<Utc>, f64)> = None;
    let mut late_fee = 0.0_f64;
    let mut days_overdue = 0_i64;

    for due in &schedule {
        running_total += due.amount;
        if amount_paid >= running_total {
            continue;
        }
        let unpaid = running_total - amount_paid;

        // Earliest unsatisfied date wins, by explicit date comparison.
        match next_due {
            Some((current, _)) if due.date >= current => {}
            _ => next_due = Some((due.date, unpaid)),
        }

        let overdue_days = days_past(now, due.date);
        if overdue_days > 0 {
            match plan.late_fee {
                Some(policy) => {
                    let candidate =
                        (overdue_days as f64 * policy.rate_per_day * unpaid).min(policy.maximum);
                    if candidate > late_fee {
                        late_fee = candidate;
                        days_overdue = overdue_days;
                    }
                }
                None => {
                    if overdue_days > days_overdue {
                        days_overdue = overdue_days;
                    }
                }
            }
        }
    }

    let status = if remaining_amount <= 0.0 {
        FeeStatus::Paid
    } else if next_due.map(|(date, _)| date < now).unwrap_or(false) {
        FeeStatus::Overdue
    } else if amount_paid > 0.0 {
        FeeStatus::PartiallyPaid
    } else {
        FeeStatus::Pending
    };

    FeeSummary {
        total_amount: plan.total_amount,
        amount_paid,
        remaining_amount,
        next_due_date: next_due.map(|(date, _)| date),
        next_due_amount: next_due.map(|(_, amount)| amount),
        late_fee,
        days_overdue,
        status,
    }
}
