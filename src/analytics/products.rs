//! Per-product metrics: churn rate, contract duration, trial funnel.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::{pct, round1};
use crate::types::{Booking, ProductSubscription, SubscriptionStatus};

/// Products with fewer instances are left out of the churn table.
pub const CHURN_MIN_SAMPLES: usize = 5;
/// Products with fewer qualifying durations are left out of the duration table.
pub const DURATION_MIN_SAMPLES: usize = 3;
/// Durations at or above this many days are treated as data errors.
pub const DURATION_MAX_DAYS: i64 = 3650;
const DAYS_PER_MONTH: f64 = 30.44;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductChurnRate {
    pub product: String,
    pub active_count: usize,
    pub ended_count: usize,
    pub total_count: usize,
    pub churn_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductDuration {
    pub product: String,
    pub avg_days: i64,
    pub avg_months: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialFunnel {
    pub show_up_rate: u32,
    pub total_bookings: usize,
    pub conversion_rate: u32,
    pub total_clients: usize,
}

/// Substring match against the configured trial keywords (lowercase).
pub fn is_trial_product(name: &str, keywords: &[String]) -> bool {
    let name = name.to_lowercase();
    keywords
        .iter()
        .any(|k| !k.is_empty() && name.contains(&k.to_lowercase()))
}

/// Churn rate per non-trial product, largest products first.
pub fn churn_by_product(subscriptions: &[ProductSubscription], keywords: &[String]) -> Vec<ProductChurnRate> {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for sub in subscriptions
        .iter()
        .filter(|s| !is_trial_product(&s.product_name, keywords))
    {
        let entry = counts.entry(sub.product_name.as_str()).or_default();
        match sub.status {
            SubscriptionStatus::Active => entry.0 += 1,
            SubscriptionStatus::Ended => entry.1 += 1,
        }
    }

    let mut rates: Vec<ProductChurnRate> = counts
        .into_iter()
        .filter(|(_, (active, ended))| active + ended >= CHURN_MIN_SAMPLES)
        .map(|(product, (active, ended))| ProductChurnRate {
            product: product.to_string(),
            active_count: active,
            ended_count: ended,
            total_count: active + ended,
            churn_rate: pct(ended, active + ended),
        })
        .collect();

    rates.sort_by(|a, b| {
        b.total_count
            .cmp(&a.total_count)
            .then_with(|| a.product.cmp(&b.product))
    });
    rates
}

/// Average contract length per non-trial product, most samples first.
pub fn contract_duration_by_product(
    subscriptions: &[ProductSubscription],
    keywords: &[String],
) -> Vec<ProductDuration> {
    let mut samples: HashMap<&str, Vec<i64>> = HashMap::new();
    for sub in subscriptions
        .iter()
        .filter(|s| !is_trial_product(&s.product_name, keywords))
    {
        let (Some(from), Some(until)) = (sub.valid_from, sub.valid_until) else {
            continue;
        };
        let days = (until - from).num_days();
        if days > 0 && days < DURATION_MAX_DAYS {
            samples.entry(sub.product_name.as_str()).or_default().push(days);
        }
    }

    let mut durations: Vec<ProductDuration> = samples
        .into_iter()
        .filter(|(_, days)| days.len() >= DURATION_MIN_SAMPLES)
        .map(|(product, days)| {
            let avg_days = (days.iter().sum::<i64>() as f64 / days.len() as f64).round() as i64;
            ProductDuration {
                product: product.to_string(),
                avg_days,
                avg_months: round1(avg_days as f64 / DAYS_PER_MONTH),
                count: days.len(),
            }
        })
        .collect();

    durations.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.product.cmp(&b.product)));
    durations
}

/// Show-up and conversion for customers who hold (or held) a trial product.
pub fn trial_funnel(
    subscriptions: &[ProductSubscription],
    bookings: &[Booking],
    keywords: &[String],
) -> TrialFunnel {
    let mut trial_clients: HashSet<&str> = HashSet::new();
    let mut regular_clients: HashSet<&str> = HashSet::new();
    for sub in subscriptions {
        if is_trial_product(&sub.product_name, keywords) {
            trial_clients.insert(sub.member_ref.as_str());
        } else {
            regular_clients.insert(sub.member_ref.as_str());
        }
    }

    let converted = trial_clients.intersection(&regular_clients).count();

    let trial_bookings: Vec<&Booking> = bookings
        .iter()
        .filter(|b| b.member_refs.iter().any(|r| trial_clients.contains(r.as_str())))
        .collect();
    let present = trial_bookings.iter().filter(|b| b.present).count();

    TrialFunnel {
        show_up_rate: pct(present, trial_bookings.len()),
        total_bookings: trial_bookings.len(),
        conversion_rate: pct(converted, trial_clients.len()),
        total_clients: trial_clients.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn keywords() -> Vec<String> {
        vec!["kennismaking".to_string(), "proef".to_string(), "trial".to_string()]
    }

    fn sub(member: &str, product: &str, status: SubscriptionStatus) -> ProductSubscription {
        ProductSubscription {
            member_ref: member.to_string(),
            product_name: product.to_string(),
            status,
            valid_from: None,
            valid_until: None,
            price: 0.0,
        }
    }

    fn many(product: &str, active: usize, ended: usize) -> Vec<ProductSubscription> {
        let mut subs = Vec::new();
        for i in 0..active {
            subs.push(sub(&format!("A{}", i), product, SubscriptionStatus::Active));
        }
        for i in 0..ended {
            subs.push(sub(&format!("E{}", i), product, SubscriptionStatus::Ended));
        }
        subs
    }

    fn dated(product: &str, from: (i32, u32, u32), until: (i32, u32, u32)) -> ProductSubscription {
        ProductSubscription {
            valid_from: NaiveDate::from_ymd_opt(from.0, from.1, from.2),
            valid_until: NaiveDate::from_ymd_opt(until.0, until.1, until.2),
            ..sub("K1", product, SubscriptionStatus::Ended)
        }
    }

    #[test]
    fn test_trial_product_matching() {
        assert!(is_trial_product("Kennismakingsles", &keywords()));
        assert!(is_trial_product("Proefmaand", &keywords()));
        assert!(is_trial_product("Free TRIAL week", &keywords()));
        assert!(!is_trial_product("Onbeperkt", &keywords()));
        assert!(!is_trial_product("Onbeperkt", &[String::new()]));
    }

    #[test]
    fn test_churn_rate_and_sample_guard() {
        let mut subs = many("Onbeperkt", 3, 2);
        subs.extend(many("Sauna", 3, 1));
        subs.extend(many("Kennismaking", 10, 10));
        let rates = churn_by_product(&subs, &keywords());
        assert_eq!(rates.len(), 1);
        assert_eq!(rates[0].product, "Onbeperkt");
        assert_eq!(rates[0].churn_rate, 40);
        assert_eq!(rates[0].total_count, 5);
        assert_eq!(rates[0].ended_count, 2);
    }

    #[test]
    fn test_churn_sorted_by_size_then_name() {
        let mut subs = many("Yoga", 5, 0);
        subs.extend(many("Boksen", 5, 5));
        subs.extend(many("Crossfit", 3, 2));
        let rates = churn_by_product(&subs, &keywords());
        let names: Vec<&str> = rates.iter().map(|r| r.product.as_str()).collect();
        assert_eq!(names, vec!["Boksen", "Crossfit", "Yoga"]);
        assert_eq!(rates[0].churn_rate, 50);
        assert_eq!(rates[2].churn_rate, 0);
    }

    #[test]
    fn test_contract_duration() {
        let subs = vec![
            dated("Onbeperkt", (2024, 1, 1), (2024, 7, 1)),   // 182
            dated("Onbeperkt", (2024, 1, 1), (2024, 4, 1)),   // 91
            dated("Onbeperkt", (2024, 1, 1), (2025, 1, 1)),   // 366
            dated("Onbeperkt", (2024, 1, 1), (2024, 1, 1)),   // 0, rejected
            dated("Onbeperkt", (2000, 1, 1), (2024, 1, 1)),   // too long, rejected
            dated("Sauna", (2024, 1, 1), (2024, 2, 1)),
            dated("Sauna", (2024, 1, 1), (2024, 3, 1)),
            dated("Proefles", (2024, 1, 1), (2024, 1, 8)),
            dated("Proefles", (2024, 1, 1), (2024, 1, 8)),
            dated("Proefles", (2024, 1, 1), (2024, 1, 8)),
        ];
        let durations = contract_duration_by_product(&subs, &keywords());
        assert_eq!(durations.len(), 1);
        let d = &durations[0];
        assert_eq!(d.product, "Onbeperkt");
        assert_eq!(d.count, 3);
        assert_eq!(d.avg_days, 213);
        assert_eq!(d.avg_months, 7.0);
    }

    #[test]
    fn test_trial_funnel() {
        let subs = vec![
            sub("T1", "Kennismaking", SubscriptionStatus::Ended),
            sub("T1", "Onbeperkt", SubscriptionStatus::Active),
            sub("T2", "Proefles", SubscriptionStatus::Ended),
            sub("T3", "Proefles", SubscriptionStatus::Active),
            sub("M1", "Onbeperkt", SubscriptionStatus::Active),
        ];
        let at = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap().and_hms_opt(18, 0, 0).unwrap();
        let booking = |r: Option<&str>, present| Booking {
            member_refs: r.map(str::to_string).into_iter().collect(),
            session_key: "S1".to_string(),
            occurred_at: at,
            present,
        };
        let bookings = vec![
            booking(Some("T1"), true),
            booking(Some("T2"), false),
            booking(Some("T3"), true),
            booking(Some("T3"), true),
            booking(Some("M1"), false),
            booking(None, false),
        ];
        let funnel = trial_funnel(&subs, &bookings, &keywords());
        assert_eq!(funnel.total_clients, 3);
        assert_eq!(funnel.conversion_rate, 33);
        assert_eq!(funnel.total_bookings, 4);
        assert_eq!(funnel.show_up_rate, 75);
    }

    #[test]
    fn test_shared_booking_counts_once_in_funnel() {
        let subs = vec![
            sub("T1", "Proefles", SubscriptionStatus::Active),
            sub("M1", "Onbeperkt", SubscriptionStatus::Active),
        ];
        let at = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap().and_hms_opt(18, 0, 0).unwrap();
        let bookings = vec![Booking {
            member_refs: vec!["M1".to_string(), "T1".to_string()],
            session_key: "S1".to_string(),
            occurred_at: at,
            present: true,
        }];
        let funnel = trial_funnel(&subs, &bookings, &keywords());
        assert_eq!(funnel.total_bookings, 1);
        assert_eq!(funnel.show_up_rate, 100);
    }

    #[test]
    fn test_empty_inputs_are_zero() {
        assert!(churn_by_product(&[], &keywords()).is_empty());
        assert!(contract_duration_by_product(&[], &keywords()).is_empty());
        assert_eq!(trial_funnel(&[], &[], &keywords()), TrialFunnel::default());
    }
}
