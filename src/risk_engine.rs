//! Rule-based churn-risk scorer.
//!
//! Three additive factor groups, evaluated in fixed order. Within a group the
//! first matching threshold wins:
//! - Recency (0-55): days since last visit, or never visited
//! - 30-day frequency (0-20): check-ins in the trailing 30 days
//! - Onboarding (0-15): joined < 90 days ago with < 3 check-ins in 30 days
//!
//! The score is clamped to 0-100 and banded: >= 55 critical, >= 40 high,
//! >= 20 medium, otherwise low. Factor order is part of the output.

use chrono::NaiveDateTime;

use crate::normalize::days_between;
use crate::types::{Member, RiskAssessment, RiskFactor, RiskLevel};

/// Recency thresholds: (strictly more than N days, points).
const RECENCY_STEPS: &[(i64, u8)] = &[(180, 50), (90, 40), (60, 35), (30, 25), (14, 15), (7, 8)];
const NEVER_VISITED_POINTS: u8 = 55;

const ZERO_CHECKINS_POINTS: u8 = 20;
const LOW_CHECKINS_POINTS: u8 = 12;
const MEDIUM_CHECKINS_POINTS: u8 = 5;

const NEW_MEMBER_DAYS: i64 = 90;
const NEW_MEMBER_MIN_CHECKINS: u32 = 3;
const NEW_MEMBER_POINTS: u8 = 15;

/// The member fields the score depends on, already reduced to day counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreInputs {
    pub days_since_last_visit: Option<i64>,
    pub visits_30d: u32,
    pub days_since_join: Option<i64>,
}

impl ScoreInputs {
    pub fn from_member(member: &Member, now: NaiveDateTime) -> Self {
        Self {
            days_since_last_visit: member.last_visit.map(|v| days_between(v, now)),
            visits_30d: member.visits_30d,
            days_since_join: member.member_since.map(|s| days_between(s, now)),
        }
    }
}

/// Score a member as of `now`.
pub fn score(member: &Member, now: NaiveDateTime) -> RiskAssessment {
    score_inputs(ScoreInputs::from_member(member, now))
}

pub fn score_inputs(inputs: ScoreInputs) -> RiskAssessment {
    let mut factors = Vec::with_capacity(3);

    // 1. Recency
    match inputs.days_since_last_visit {
        None => factors.push(factor("never_visited", "Never visited".to_string(), NEVER_VISITED_POINTS)),
        Some(days) => {
            if let Some((threshold, points)) = RECENCY_STEPS.iter().find(|(t, _)| days > *t) {
                factors.push(factor(
                    &format!("no_checkin_{}", threshold),
                    format!("{} days since last visit", days),
                    *points,
                ));
            }
        }
    }

    // 2. 30-day frequency
    match inputs.visits_30d {
        0 => factors.push(factor(
            "zero_checkins_30d",
            "0 check-ins in the last 30 days".to_string(),
            ZERO_CHECKINS_POINTS,
        )),
        n @ 1 => factors.push(factor(
            "low_checkins_30d",
            format!("Only {} check-in in the last 30 days", n),
            LOW_CHECKINS_POINTS,
        )),
        n @ 2..=3 => factors.push(factor(
            "medium_checkins_30d",
            format!("{} check-ins in the last 30 days", n),
            MEDIUM_CHECKINS_POINTS,
        )),
        _ => {}
    }

    // 3. Onboarding
    if let Some(days) = inputs.days_since_join {
        if days < NEW_MEMBER_DAYS && inputs.visits_30d < NEW_MEMBER_MIN_CHECKINS {
            factors.push(factor(
                "new_member_low_activity",
                format!("New member ({} days) with low activity", days),
                NEW_MEMBER_POINTS,
            ));
        }
    }

    let raw: u32 = factors.iter().map(|f| f.points as u32).sum();
    let score = raw.min(100) as u8;

    RiskAssessment {
        score,
        level: band(score),
        factors,
    }
}

/// Map a clamped score to its band.
pub fn band(score: u8) -> RiskLevel {
    match score {
        55..=u8::MAX => RiskLevel::Critical,
        40..=54 => RiskLevel::High,
        20..=39 => RiskLevel::Medium,
        _ => RiskLevel::Low,
    }
}

fn factor(code: &str, label: String, points: u8) -> RiskFactor {
    RiskFactor {
        code: code.to_string(),
        label,
        points,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 10)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn member(last_visit_days: Option<i64>, visits_30d: u32, joined_days: Option<i64>) -> Member {
        Member {
            member_ref: "K1".to_string(),
            first_name: "Anna".to_string(),
            last_name: "Jansen".to_string(),
            email: String::new(),
            phone: String::new(),
            active_products: vec!["Onbeperkt".to_string()],
            nominal_fee_total: 50.0,
            status: "Actief".to_string(),
            member_since: joined_days.map(|d| now() - Duration::days(d)),
            last_visit: last_visit_days.map(|d| now() - Duration::days(d)),
            visits_30d,
            visits_90d: visits_30d,
            risk_assessment: RiskAssessment::default(),
            ltv: 0.0,
            payment_count: 0,
            last_payment_date: None,
        }
    }

    fn codes(assessment: &RiskAssessment) -> Vec<(&str, u8)> {
        assessment
            .factors
            .iter()
            .map(|f| (f.code.as_str(), f.points))
            .collect()
    }

    #[test]
    fn test_new_member_never_visited_is_critical() {
        let a = score(&member(None, 0, Some(10)), now());
        assert_eq!(
            codes(&a),
            vec![
                ("never_visited", 55),
                ("zero_checkins_30d", 20),
                ("new_member_low_activity", 15)
            ]
        );
        assert_eq!(a.score, 90);
        assert_eq!(a.level, RiskLevel::Critical);
        assert_eq!(a.factors[2].label, "New member (10 days) with low activity");
    }

    #[test]
    fn test_regular_visitor_is_low() {
        let a = score(&member(Some(5), 6, Some(730)), now());
        assert!(a.factors.is_empty());
        assert_eq!(a.score, 0);
        assert_eq!(a.level, RiskLevel::Low);
    }

    #[test]
    fn test_lapsing_member_is_medium() {
        let a = score(&member(Some(45), 1, Some(730)), now());
        assert_eq!(codes(&a), vec![("no_checkin_30", 25), ("low_checkins_30d", 12)]);
        assert_eq!(a.score, 37);
        assert_eq!(a.level, RiskLevel::Medium);
        assert_eq!(a.factors[0].label, "45 days since last visit");
        assert_eq!(a.factors[1].label, "Only 1 check-in in the last 30 days");
    }

    #[test]
    fn test_recency_thresholds_are_strict() {
        let points = |days| score_inputs(ScoreInputs {
            days_since_last_visit: Some(days),
            visits_30d: 10,
            days_since_join: None,
        })
        .score;
        assert_eq!(points(7), 0);
        assert_eq!(points(8), 8);
        assert_eq!(points(14), 8);
        assert_eq!(points(15), 15);
        assert_eq!(points(30), 15);
        assert_eq!(points(31), 25);
        assert_eq!(points(61), 35);
        assert_eq!(points(91), 40);
        assert_eq!(points(180), 40);
        assert_eq!(points(181), 50);
    }

    #[test]
    fn test_medium_frequency_factor() {
        let a = score_inputs(ScoreInputs {
            days_since_last_visit: Some(2),
            visits_30d: 3,
            days_since_join: Some(30),
        });
        assert_eq!(codes(&a), vec![("medium_checkins_30d", 5)]);
        assert_eq!(a.factors[0].label, "3 check-ins in the last 30 days");
    }

    #[test]
    fn test_score_is_clamped_and_banded() {
        // 55 + 20 + 15 is the maximum raw sum.
        for last in [None, Some(0), Some(8), Some(20), Some(45), Some(75), Some(120), Some(400)] {
            for visits in 0..6 {
                for joined in [None, Some(5), Some(89), Some(90), Some(1000)] {
                    let a = score_inputs(ScoreInputs {
                        days_since_last_visit: last,
                        visits_30d: visits,
                        days_since_join: joined,
                    });
                    assert!(a.score <= 100);
                    assert_eq!(a.level, band(a.score));
                    let sum: u32 = a.factors.iter().map(|f| f.points as u32).sum();
                    assert_eq!(a.score as u32, sum.min(100));
                }
            }
        }
    }

    #[test]
    fn test_band_cut_points() {
        assert_eq!(band(0), RiskLevel::Low);
        assert_eq!(band(19), RiskLevel::Low);
        assert_eq!(band(20), RiskLevel::Medium);
        assert_eq!(band(39), RiskLevel::Medium);
        assert_eq!(band(40), RiskLevel::High);
        assert_eq!(band(54), RiskLevel::High);
        assert_eq!(band(55), RiskLevel::Critical);
        assert_eq!(band(100), RiskLevel::Critical);
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let m = member(Some(65), 2, Some(40));
        let first = score(&m, now());
        let second = score(&m, now());
        assert_eq!(first, second);
        assert_eq!(
            codes(&first),
            vec![
                ("no_checkin_60", 35),
                ("medium_checkins_30d", 5),
                ("new_member_low_activity", 15)
            ]
        );
        assert_eq!(first.level, RiskLevel::Critical);
    }

    #[test]
    fn test_future_last_visit_counts_as_today() {
        let a = score_inputs(ScoreInputs {
            days_since_last_visit: Some(0),
            visits_30d: 4,
            days_since_join: None,
        });
        let mut m = member(None, 4, None);
        m.last_visit = Some(now() + Duration::days(3));
        assert_eq!(score(&m, now()), a);
    }
}
