//! Fleet-wide analytics over one normalized batch.
//!
//! Every metric is an independent pure reduction; empty input yields zeros
//! and a percentage with a zero denominator is 0.
//!
//! Modules:
//! - products: churn by product, contract duration, trial funnel
//! - attendance: dormancy, visit density, check-in distribution

pub mod attendance;
pub mod products;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::normalize::NormalizedBatch;
use crate::types::{Config, Member};

pub use attendance::{DayAverage, DensityBucket, HourAverage, VisitDensity};
pub use products::{ProductChurnRate, ProductDuration, TrialFunnel};

/// A count with its integer percentage of the population.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub count: usize,
    pub pct: u32,
}

impl Share {
    pub fn of(count: usize, total: usize) -> Self {
        Self {
            count,
            pct: pct(count, total),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LtvSummary {
    #[serde(rename = "totalLTV")]
    pub total_ltv: i64,
    #[serde(rename = "avgLTV")]
    pub avg_ltv: i64,
    pub members_with_payments: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
    pub generated_at: NaiveDateTime,
    pub total_active_members: usize,
    pub churn_by_product: Vec<ProductChurnRate>,
    pub contract_duration_by_product: Vec<ProductDuration>,
    pub dormant: Share,
    pub visit_density: VisitDensity,
    pub checkins_by_hour: Vec<HourAverage>,
    pub checkins_by_day: Vec<DayAverage>,
    pub trial_funnel: TrialFunnel,
    pub ltv: LtvSummary,
}

#[derive(Debug, Clone)]
pub struct AnalyticsOptions {
    pub trial_keywords: Vec<String>,
    pub visit_lookback_days: i64,
}

impl AnalyticsOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            trial_keywords: config.trial_keywords.clone(),
            visit_lookback_days: config.visit_lookback_days,
        }
    }
}

/// Build the full snapshot as of `now`.
pub fn compute_snapshot(
    batch: &NormalizedBatch,
    opts: &AnalyticsOptions,
    now: NaiveDateTime,
) -> AggregateSnapshot {
    let keywords = &opts.trial_keywords;
    let (checkins_by_hour, checkins_by_day) =
        attendance::checkin_distribution(&batch.bookings, opts.visit_lookback_days, now);

    AggregateSnapshot {
        generated_at: now,
        total_active_members: batch.members.len(),
        churn_by_product: products::churn_by_product(&batch.subscriptions, keywords),
        contract_duration_by_product: products::contract_duration_by_product(
            &batch.subscriptions,
            keywords,
        ),
        dormant: attendance::dormant_share(&batch.members, now),
        visit_density: attendance::visit_density(&batch.members, &batch.visits, now),
        checkins_by_hour,
        checkins_by_day,
        trial_funnel: products::trial_funnel(&batch.subscriptions, &batch.bookings, keywords),
        ltv: ltv_summary(&batch.members),
    }
}

/// Sum and mean of member LTV. The mean is over all members, not payers.
pub fn ltv_summary(members: &[Member]) -> LtvSummary {
    let total: f64 = members.iter().map(|m| m.ltv).sum();
    let avg = if members.is_empty() {
        0.0
    } else {
        total / members.len() as f64
    };
    LtvSummary {
        total_ltv: total.round() as i64,
        avg_ltv: avg.round() as i64,
        members_with_payments: members.iter().filter(|m| m.ltv > 0.0).count(),
    }
}

/// Integer percentage, 0 when `whole` is 0.
pub fn pct(part: usize, whole: usize) -> u32 {
    if whole == 0 {
        return 0;
    }
    (part as f64 / whole as f64 * 100.0).round() as u32
}

/// Round to one decimal.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
