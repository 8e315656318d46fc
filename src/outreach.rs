//! Daily outreach list: which at-risk members to contact and with what.
//!
//! Delivery is someone else's job; this only selects candidates and renders
//! the message body.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::normalize::days_between;
use crate::types::{Member, RiskLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutreachTemplate {
    Welcome,
    #[serde(rename = "churn_prevention_14_days")]
    ChurnPrevention14Days,
    #[serde(rename = "churn_prevention_30_days")]
    ChurnPrevention30Days,
    #[serde(rename = "churn_prevention_90_days")]
    ChurnPrevention90Days,
}

impl OutreachTemplate {
    pub fn id(&self) -> &'static str {
        match self {
            OutreachTemplate::Welcome => "welcome",
            OutreachTemplate::ChurnPrevention14Days => "churn_prevention_14_days",
            OutreachTemplate::ChurnPrevention30Days => "churn_prevention_30_days",
            OutreachTemplate::ChurnPrevention90Days => "churn_prevention_90_days",
        }
    }

    pub fn body(&self) -> &'static str {
        match self {
            OutreachTemplate::Welcome => {
                "Hi {name}! Welcome to the club. Any questions about your training plan, or shall we schedule an intake? Happy to help!"
            }
            OutreachTemplate::ChurnPrevention14Days => {
                "Hey {name}! We miss you. Your last session was {days} days ago. Shall I reserve a spot for you this week?"
            }
            OutreachTemplate::ChurnPrevention30Days => {
                "Hi {name}, it has been a month since we last saw you! Is there anything we can help with, like a different schedule or training plan?"
            }
            OutreachTemplate::ChurnPrevention90Days => {
                "Hey {name}, we really miss you! It has been a while. Would you like to pause your membership, or can we help you get started again?"
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutreachMessage {
    pub member_ref: String,
    pub name: String,
    pub phone: String,
    pub score: u8,
    pub level: RiskLevel,
    pub template: OutreachTemplate,
    /// `None` when the member never visited.
    pub days_since_last_visit: Option<i64>,
    pub message: String,
}

/// Pick the template for one member.
pub fn choose_template(member: &Member, now: NaiveDateTime) -> OutreachTemplate {
    let is_new = member
        .risk_assessment
        .factors
        .iter()
        .any(|f| f.code == "new_member_low_activity");
    if is_new {
        return OutreachTemplate::Welcome;
    }
    match member.last_visit.map(|v| days_between(v, now)) {
        None => OutreachTemplate::ChurnPrevention90Days,
        Some(days) if days >= 90 => OutreachTemplate::ChurnPrevention90Days,
        Some(days) if days >= 30 => OutreachTemplate::ChurnPrevention30Days,
        Some(_) => OutreachTemplate::ChurnPrevention14Days,
    }
}

/// Substitute `{key}` placeholders. Unknown placeholders are left as-is.
pub fn fill_template(template: &str, variables: &[(&str, String)]) -> String {
    variables
        .iter()
        .fold(template.to_string(), |body, (key, value)| {
            body.replace(&format!("{{{}}}", key), value)
        })
}

/// High and critical members with a phone number, highest score first.
pub fn select_candidates(members: &[Member], limit: usize, now: NaiveDateTime) -> Vec<OutreachMessage> {
    let mut candidates: Vec<&Member> = members
        .iter()
        .filter(|m| m.risk_assessment.level.is_at_risk() && !m.phone.is_empty())
        .collect();
    candidates.sort_by(|a, b| {
        b.risk_assessment
            .score
            .cmp(&a.risk_assessment.score)
            .then_with(|| a.member_ref.cmp(&b.member_ref))
    });

    candidates
        .into_iter()
        .take(limit)
        .map(|member| {
            let template = choose_template(member, now);
            let days = member.last_visit.map(|v| days_between(v, now));
            let first_name = if member.first_name.is_empty() {
                member.full_name()
            } else {
                member.first_name.clone()
            };
            let message = fill_template(
                template.body(),
                &[
                    ("name", first_name),
                    ("days", days.map(|d| d.to_string()).unwrap_or_default()),
                ],
            );
            OutreachMessage {
                member_ref: member.member_ref.clone(),
                name: member.full_name(),
                phone: member.phone.clone(),
                score: member.risk_assessment.score,
                level: member.risk_assessment.level,
                template,
                days_since_last_visit: days,
                message,
            }
        })
        .collect()
}
