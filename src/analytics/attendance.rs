//! Attendance metrics: dormancy, visit density and check-in distribution.

use std::collections::HashMap;

use chrono::{Datelike, Duration, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use super::{round1, Share};
use crate::normalize::days_between;
use crate::types::{Booking, Member, VisitEvent};

/// A member is dormant after this many days without a visit.
pub const DORMANT_AFTER_DAYS: i64 = 28;
pub const DENSITY_WINDOW_WEEKS: i64 = 12;

const SUPER_ACTIVE_PER_WEEK: f64 = 3.0;
const ACTIVE_PER_WEEK: f64 = 1.0;
const AT_RISK_PER_WEEK: f64 = 0.5;

/// Display range for the hourly histogram.
pub const FIRST_HOUR: u32 = 6;
pub const LAST_HOUR: u32 = 22;
const WEEKDAY_LABELS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DensityBucket {
    SuperActive,
    Active,
    AtRisk,
    Dormant,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitDensity {
    pub super_active: Share,
    pub active: Share,
    pub at_risk: Share,
    pub dormant: Share,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourAverage {
    pub hour: u32,
    pub avg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayAverage {
    pub day: String,
    pub avg: f64,
}

pub fn is_dormant(member: &Member, now: NaiveDateTime) -> bool {
    match member.last_visit {
        None => true,
        Some(last) => days_between(last, now) >= DORMANT_AFTER_DAYS,
    }
}

pub fn dormant_share(members: &[Member], now: NaiveDateTime) -> Share {
    let count = members.iter().filter(|m| is_dormant(m, now)).count();
    Share::of(count, members.len())
}

/// Bucket one member. Dormancy is checked before the weekly average.
pub fn density_bucket(member: &Member, visits_in_window: usize, now: NaiveDateTime) -> DensityBucket {
    if is_dormant(member, now) {
        return DensityBucket::Dormant;
    }
    let per_week = visits_in_window as f64 / DENSITY_WINDOW_WEEKS as f64;
    if per_week >= SUPER_ACTIVE_PER_WEEK {
        DensityBucket::SuperActive
    } else if per_week >= ACTIVE_PER_WEEK {
        DensityBucket::Active
    } else if per_week >= AT_RISK_PER_WEEK {
        DensityBucket::AtRisk
    } else {
        DensityBucket::Dormant
    }
}

/// Segment members by average weekly visits over the trailing 12 weeks.
pub fn visit_density(members: &[Member], visits: &[VisitEvent], now: NaiveDateTime) -> VisitDensity {
    let since = now - Duration::weeks(DENSITY_WINDOW_WEEKS);
    let mut per_member: HashMap<&str, usize> = HashMap::new();
    for visit in visits
        .iter()
        .filter(|v| v.occurred_at >= since && v.occurred_at <= now)
    {
        *per_member.entry(visit.member_ref.as_str()).or_default() += 1;
    }

    let mut counts: HashMap<DensityBucket, usize> = HashMap::new();
    for member in members {
        let visits = per_member
            .get(member.member_ref.as_str())
            .copied()
            .unwrap_or(0);
        *counts.entry(density_bucket(member, visits, now)).or_default() += 1;
    }

    let total = members.len();
    let share = |bucket: DensityBucket| Share::of(counts.get(&bucket).copied().unwrap_or(0), total);
    VisitDensity {
        super_active: share(DensityBucket::SuperActive),
        active: share(DensityBucket::Active),
        at_risk: share(DensityBucket::AtRisk),
        dormant: share(DensityBucket::Dormant),
    }
}

/// Average attendance per session, by hour of day and by weekday.
///
/// Attended bookings inside `[now - lookback_days, now]` are grouped into
/// sessions; each session contributes its attendance count once to its
/// hour and weekday.
pub fn checkin_distribution(
    bookings: &[Booking],
    lookback_days: i64,
    now: NaiveDateTime,
) -> (Vec<HourAverage>, Vec<DayAverage>) {
    let since = now - Duration::days(lookback_days);
    let mut sessions: HashMap<&str, (NaiveDateTime, u32)> = HashMap::new();
    for booking in bookings
        .iter()
        .filter(|b| b.present && b.occurred_at >= since && b.occurred_at <= now)
    {
        sessions
            .entry(booking.session_key.as_str())
            .or_insert((booking.occurred_at, 0))
            .1 += 1;
    }

    let mut by_hour: HashMap<u32, Vec<u32>> = HashMap::new();
    let mut by_day: HashMap<u32, Vec<u32>> = HashMap::new();
    for (start, attended) in sessions.values() {
        by_hour.entry(start.hour()).or_default().push(*attended);
        by_day
            .entry(start.weekday().num_days_from_monday())
            .or_default()
            .push(*attended);
    }

    let hours = (FIRST_HOUR..=LAST_HOUR)
        .map(|hour| HourAverage {
            hour,
            avg: mean(by_hour.get(&hour)),
        })
        .collect();
    let days = WEEKDAY_LABELS
        .iter()
        .enumerate()
        .map(|(idx, label)| DayAverage {
            day: label.to_string(),
            avg: mean(by_day.get(&(idx as u32))),
        })
        .collect();
    (hours, days)
}

fn mean(counts: Option<&Vec<u32>>) -> f64 {
    match counts {
        Some(c) if !c.is_empty() => round1(c.iter().sum::<u32>() as f64 / c.len() as f64),
        _ => 0.0,
    }
}

impl VisitDensity {
    pub fn total(&self) -> usize {
        self.super_active.count + self.active.count + self.at_risk.count + self.dormant.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RiskAssessment;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        // A Monday.
        NaiveDate::from_ymd_opt(2025, 3, 10)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn member(r: &str, last_visit_days: Option<i64>) -> Member {
        Member {
            member_ref: r.to_string(),
            first_name: r.to_string(),
            last_name: String::new(),
            email: String::new(),
            phone: String::new(),
            active_products: Vec::new(),
            nominal_fee_total: 0.0,
            status: "Actief".to_string(),
            member_since: None,
            last_visit: last_visit_days.map(|d| now() - Duration::days(d)),
            visits_30d: 0,
            visits_90d: 0,
            risk_assessment: RiskAssessment::default(),
            ltv: 0.0,
            payment_count: 0,
            last_payment_date: None,
        }
    }

    fn visits(r: &str, n: usize) -> Vec<VisitEvent> {
        (0..n)
            .map(|i| VisitEvent {
                member_ref: r.to_string(),
                occurred_at: now() - Duration::hours(12 * (i as i64 + 1)),
            })
            .collect()
    }

    #[test]
    fn test_dormancy_threshold() {
        let members = vec![
            member("A", None),
            member("B", Some(27)),
            member("C", Some(28)),
            member("D", Some(2)),
        ];
        let share = dormant_share(&members, now());
        assert_eq!(share.count, 2);
        assert_eq!(share.pct, 50);
        assert_eq!(dormant_share(&[], now()), Share::default());
    }

    #[test]
    fn test_density_buckets_partition_members() {
        let members = vec![
            member("SUPER", Some(1)),
            member("ACTIVE", Some(1)),
            member("RISK", Some(1)),
            member("LOW", Some(1)),
            member("NEVER", None),
            // Bursty: 40 visits but the last one is 30 days ago.
            member("BURST", Some(30)),
        ];
        let mut events = visits("SUPER", 36);
        events.extend(visits("ACTIVE", 12));
        events.extend(visits("RISK", 6));
        events.extend(visits("LOW", 5));
        events.extend((0..40).map(|i| VisitEvent {
            member_ref: "BURST".to_string(),
            occurred_at: now() - Duration::days(30) - Duration::hours(i),
        }));

        let density = visit_density(&members, &events, now());
        assert_eq!(density.super_active.count, 1);
        assert_eq!(density.active.count, 1);
        assert_eq!(density.at_risk.count, 1);
        assert_eq!(density.dormant.count, 3);
        assert_eq!(density.total(), members.len());
        assert_eq!(density.dormant.pct, 50);
    }

    #[test]
    fn test_density_ignores_visits_outside_window() {
        let members = vec![member("A", Some(1))];
        let mut events = visits("A", 6);
        events.extend((0..30).map(|i| VisitEvent {
            member_ref: "A".to_string(),
            occurred_at: now() - Duration::weeks(13) - Duration::days(i),
        }));
        let density = visit_density(&members, &events, now());
        assert_eq!(density.at_risk.count, 1);
    }

    #[test]
    fn test_checkin_distribution_groups_sessions() {
        let at = |d: u32, h: u32| NaiveDate::from_ymd_opt(2025, 3, d).unwrap().and_hms_opt(h, 0, 0).unwrap();
        let booking = |key: &str, when: NaiveDateTime, present: bool| Booking {
            member_refs: Vec::new(),
            session_key: key.to_string(),
            occurred_at: when,
            present,
        };
        let bookings = vec![
            // Monday 3 March 18:00, 3 attendees (one no-show)
            booking("S1", at(3, 18), true),
            booking("S1", at(3, 18), true),
            booking("S1", at(3, 18), true),
            booking("S1", at(3, 18), false),
            // Tuesday 4 March 18:00, 2 attendees
            booking("S2", at(4, 18), true),
            booking("S2", at(4, 18), true),
            // Tuesday 4 March 07:00, 1 attendee
            booking("S3", at(4, 7), true),
            // Too early for the display range
            booking("S4", at(5, 5), true),
            // Outside the lookback window
            booking("S5", at(1, 18) - Duration::days(120), true),
            // Future session
            booking("S6", at(12, 18), true),
        ];

        let (hours, days) = checkin_distribution(&bookings, 90, now());
        assert_eq!(hours.len(), 17);
        assert_eq!(hours.first().map(|h| h.hour), Some(6));
        assert_eq!(hours.last().map(|h| h.hour), Some(22));
        let at_hour = |h: u32| hours.iter().find(|x| x.hour == h).map(|x| x.avg);
        assert_eq!(at_hour(18), Some(2.5));
        assert_eq!(at_hour(7), Some(1.0));
        assert_eq!(at_hour(12), Some(0.0));

        let labels: Vec<&str> = days.iter().map(|d| d.day.as_str()).collect();
        assert_eq!(labels, vec!["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"]);
        assert_eq!(days[0].avg, 3.0);
        assert_eq!(days[1].avg, 1.5);
        assert_eq!(days[2].avg, 1.0);
        assert_eq!(days[6].avg, 0.0);
    }

    #[test]
    fn test_distribution_of_nothing_is_zero() {
        let (hours, days) = checkin_distribution(&[], 90, now());
        assert!(hours.iter().all(|h| h.avg == 0.0));
        assert!(days.iter().all(|d| d.avg == 0.0));
    }
}
